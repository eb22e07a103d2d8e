use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use reflecta::audio::pcm::{self, FrameChunker, PcmFrame};
use std::hint::black_box;

/// One second of a 440Hz tone at `rate`.
fn tone(rate: u32) -> Vec<i16> {
    (0..rate)
        .map(|i| {
            let t = i as f32 / rate as f32;
            pcm::f32_to_i16((t * 440.0 * std::f32::consts::TAU).sin() * 0.5)
        })
        .collect()
}

fn bench_resample(c: &mut Criterion) {
    let mut group = c.benchmark_group("resample");
    for &(from, to) in &[(48000u32, 16000u32), (44100, 16000), (24000, 48000)] {
        let samples = tone(from);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}->{}", from, to)),
            &samples,
            |b, samples| b.iter(|| pcm::resample(black_box(samples), from, to)),
        );
    }
    group.finish();
}

fn bench_capture_path(c: &mut Criterion) {
    // Stereo 48kHz device input down to 16kHz mono frames
    let stereo: Vec<i16> = tone(48000).iter().flat_map(|&s| [s, s]).collect();
    c.bench_function("capture_path_stereo_48k", |b| {
        b.iter(|| {
            let mono = pcm::mix_to_mono(black_box(&stereo), 2);
            let resampled = pcm::resample(&mono, 48000, 16000);
            let mut chunker = FrameChunker::new(1600, 16000);
            chunker.push(&resampled).len()
        })
    });
}

fn bench_wire_encoding(c: &mut Criterion) {
    let frame = PcmFrame::new(tone(24000), 24000);
    let bytes = frame.to_le_bytes();
    c.bench_function("pcm_to_le_bytes_1s", |b| {
        b.iter(|| black_box(&frame).to_le_bytes())
    });
    c.bench_function("pcm_from_le_bytes_1s", |b| {
        b.iter(|| PcmFrame::from_le_bytes(black_box(&bytes), 24000))
    });
}

criterion_group!(
    benches,
    bench_resample,
    bench_capture_path,
    bench_wire_encoding
);
criterion_main!(benches);

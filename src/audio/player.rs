use crate::audio::pcm::PcmFrame;
use crate::error::{ReflectaError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Trait for speaker playback pipelines.
///
/// Pairs with `CaptureSource` for input - this handles remote audio output.
pub trait AudioSink: Send {
    /// Convert and enqueue a frame. Frames play back-to-back in call order.
    ///
    /// # Errors
    /// Surfaces failures to open or start the output device.
    fn play(&mut self, frame: PcmFrame) -> Result<()>;

    /// Cancel the playing frame and clear the queue. No-op when idle.
    fn stop(&mut self) -> Result<()>;

    /// Whether an output stream is open.
    fn is_active(&self) -> bool;
}

/// FIFO of converted frames consumed sample by sample by the output callback.
///
/// Only the front frame is ever read, and the next one starts on the very
/// next sample, so frames neither overlap nor leave gaps.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    frames: VecDeque<Vec<f32>>,
    cursor: usize,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, samples: Vec<f32>) {
        if !samples.is_empty() {
            self.frames.push_back(samples);
        }
    }

    /// Next mono sample, or None when the queue has drained.
    pub fn next_sample(&mut self) -> Option<f32> {
        loop {
            let front = self.frames.front()?;
            if let Some(&sample) = front.get(self.cursor) {
                self.cursor += 1;
                return Some(sample);
            }
            self.frames.pop_front();
            self.cursor = 0;
        }
    }

    /// Fill an interleaved output buffer, duplicating mono samples across
    /// `channels` and padding with silence once drained.
    ///
    /// Returns the number of queued samples consumed.
    pub fn fill(&mut self, out: &mut [f32], channels: usize) -> usize {
        let channels = channels.max(1);
        let mut consumed = 0;
        for frame in out.chunks_mut(channels) {
            let sample = match self.next_sample() {
                Some(sample) => {
                    consumed += 1;
                    sample
                }
                None => 0.0,
            };
            frame.fill(sample);
        }
        consumed
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.cursor = 0;
    }
}

#[derive(Default)]
struct MockSinkState {
    played: Vec<PcmFrame>,
    attempts: usize,
    active: bool,
    stops: usize,
}

/// Mock playback sink for testing.
///
/// Clones share state so a test can inspect what the engine played.
#[derive(Clone)]
pub struct MockAudioSink {
    state: Arc<Mutex<MockSinkState>>,
    should_fail_play: bool,
    error_message: String,
}

impl MockAudioSink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockSinkState::default())),
            should_fail_play: false,
            error_message: "mock speaker error".to_string(),
        }
    }

    /// Configure the mock to fail on play, like a missing output device
    pub fn with_play_failure(mut self) -> Self {
        self.should_fail_play = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockSinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frames accepted so far, in play order.
    pub fn played(&self) -> Vec<PcmFrame> {
        self.state().played.clone()
    }

    /// Number of `play` calls, failed ones included.
    pub fn play_attempts(&self) -> usize {
        self.state().attempts
    }

    /// Number of stops that cancelled active playback.
    pub fn stop_count(&self) -> usize {
        self.state().stops
    }
}

impl Default for MockAudioSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for MockAudioSink {
    fn play(&mut self, frame: PcmFrame) -> Result<()> {
        let mut state = self.state();
        state.attempts += 1;
        if self.should_fail_play {
            return Err(ReflectaError::AudioPlayback {
                message: self.error_message.clone(),
            });
        }
        state.active = true;
        state.played.push(frame);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.state();
        if state.active {
            state.active = false;
            state.stops += 1;
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.state().active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_plays_frames_back_to_back_in_order() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue(vec![0.1, 0.2]);
        queue.enqueue(vec![0.3]);
        queue.enqueue(vec![0.4, 0.5]);

        let mut out = [0.0f32; 5];
        assert_eq!(queue.fill(&mut out, 1), 5);
        assert_eq!(out, [0.1, 0.2, 0.3, 0.4, 0.5]);
        assert_eq!(queue.next_sample(), None);
    }

    #[test]
    fn test_queue_pads_silence_when_drained() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue(vec![0.5]);

        let mut out = [1.0f32; 3];
        assert_eq!(queue.fill(&mut out, 1), 1);
        assert_eq!(out, [0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_queue_duplicates_mono_across_channels() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue(vec![0.25, -0.25]);

        let mut out = [0.0f32; 4];
        queue.fill(&mut out, 2);
        assert_eq!(out, [0.25, 0.25, -0.25, -0.25]);
    }

    #[test]
    fn test_queue_resumes_mid_frame_across_fills() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue(vec![0.1, 0.2, 0.3]);

        let mut first = [0.0f32; 2];
        queue.fill(&mut first, 1);
        assert_eq!(first, [0.1, 0.2]);

        queue.enqueue(vec![0.4]);
        let mut second = [0.0f32; 2];
        queue.fill(&mut second, 1);
        assert_eq!(second, [0.3, 0.4]);
    }

    #[test]
    fn test_queue_clear_cancels_current_frame() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue(vec![0.1, 0.2, 0.3]);
        queue.next_sample();
        queue.clear();

        assert_eq!(queue.next_sample(), None);

        queue.enqueue(vec![0.9]);
        assert_eq!(queue.next_sample(), Some(0.9));
    }

    #[test]
    fn test_queue_skips_empty_frames() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue(Vec::new());
        queue.enqueue(vec![0.7]);
        assert_eq!(queue.next_sample(), Some(0.7));
        assert_eq!(queue.next_sample(), None);
    }

    #[test]
    fn test_mock_sink_records_frames_in_order() {
        let mut sink = MockAudioSink::new();
        let handle = sink.clone();

        sink.play(PcmFrame::new(vec![1], 24000)).unwrap();
        sink.play(PcmFrame::new(vec![2], 24000)).unwrap();

        let played = handle.played();
        assert_eq!(played.len(), 2);
        assert_eq!(played[0].samples, vec![1]);
        assert_eq!(played[1].samples, vec![2]);
        assert!(handle.is_active());
    }

    #[test]
    fn test_mock_sink_surfaces_play_failure() {
        let mut sink = MockAudioSink::new().with_play_failure();
        assert!(matches!(
            sink.play(PcmFrame::new(vec![1], 24000)),
            Err(ReflectaError::AudioPlayback { .. })
        ));
        assert!(sink.played().is_empty());
        assert_eq!(sink.play_attempts(), 1);
    }

    #[test]
    fn test_mock_sink_stop_is_idempotent() {
        let mut sink = MockAudioSink::new();
        sink.stop().unwrap();
        assert_eq!(sink.stop_count(), 0);

        sink.play(PcmFrame::new(vec![1], 24000)).unwrap();
        sink.stop().unwrap();
        sink.stop().unwrap();
        assert_eq!(sink.stop_count(), 1);
        assert!(!sink.is_active());
    }
}

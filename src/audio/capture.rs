//! Real microphone capture using CPAL (Cross-Platform Audio Library).

use crate::audio::lease::{Device, DeviceLease};
use crate::audio::pcm::{self, FrameChunker};
use crate::audio::recorder::{CaptureConfig, CaptureSource, FrameCallback};
use crate::error::{ReflectaError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// This suppresses noisy ALSA/JACK/PipeWire messages that CPAL triggers
/// when probing audio backends.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2 (stderr).
/// Safe as long as no other thread is concurrently manipulating fd 2.
pub(crate) fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Suppress noisy JACK/ALSA error messages that occur during audio backend probing.
///
/// # Safety
/// This modifies environment variables which is safe when called before spawning threads.
pub fn suppress_audio_warnings() {
    // SAFETY: Called at startup before any threads are spawned
    unsafe {
        std::env::set_var("JACK_NO_START_SERVER", "1");
        std::env::set_var("JACK_NO_AUDIO_RESERVATION", "1");
        std::env::set_var("PIPEWIRE_DEBUG", "0");
        std::env::set_var("ALSA_DEBUG", "0");
        std::env::set_var("PW_LOG", "0");
    }
}

/// Preferred device names for PipeWire/PulseAudio desktops.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Sources exposed by the PipeWire/PulseAudio echo-cancel module.
///
/// The module runs WebRTC echo cancellation and noise suppression on the
/// captured signal.
const ECHO_CANCEL_PATTERNS: &[&str] = &["echo-cancel", "echocancel", "echo_cancel"];

/// Device name patterns to filter out (not useful for voice input).
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

fn matches_any(name: &str, patterns: &[&str]) -> bool {
    let lower = name.to_lowercase();
    patterns
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn should_filter_device(name: &str) -> bool {
    matches_any(name, FILTERED_PATTERNS)
}

fn is_preferred_device(name: &str) -> bool {
    matches_any(name, PREFERRED_DEVICES)
}

fn is_echo_cancel_device(name: &str) -> bool {
    matches_any(name, ECHO_CANCEL_PATTERNS)
}

/// List usable input devices, marking echo-cancel and preferred devices.
///
/// # Errors
/// Returns `ReflectaError::AudioCapture` if device enumeration fails.
pub fn list_input_devices() -> Result<Vec<String>> {
    let devices = with_suppressed_stderr(|| cpal::default_host().input_devices());
    let devices = devices.map_err(|e| ReflectaError::AudioCapture {
        message: format!("Failed to enumerate input devices: {}", e),
    })?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            if should_filter_device(&name) {
                continue;
            }
            if is_echo_cancel_device(&name) {
                device_names.push(format!("{} [echo-cancel]", name));
            } else if is_preferred_device(&name) {
                device_names.push(format!("{} [recommended]", name));
            } else {
                device_names.push(name);
            }
        }
    }

    Ok(device_names)
}

/// Pick the input device for `config`.
///
/// An explicit device name must match exactly. Otherwise, with echo
/// cancellation or noise suppression requested, an echo-cancel source wins;
/// then PipeWire/PulseAudio; then the system default.
fn select_input_device(config: &CaptureConfig) -> Result<cpal::Device> {
    let host = cpal::default_host();

    if let Some(name) = config.device.as_deref() {
        let devices = host
            .input_devices()
            .map_err(|e| ReflectaError::AudioCapture {
                message: format!("Failed to enumerate devices: {}", e),
            })?;
        for device in devices {
            if let Ok(device_name) = device.name()
                && device_name == name
            {
                return Ok(device);
            }
        }
        return Err(ReflectaError::AudioDeviceNotFound {
            device: name.to_string(),
        });
    }

    let candidates: Vec<(String, cpal::Device)> = host
        .input_devices()
        .map(|devices| {
            devices
                .filter_map(|device| device.name().ok().map(|name| (name, device)))
                .filter(|(name, _)| !should_filter_device(name))
                .collect()
        })
        .unwrap_or_default();

    let wants_processing = config.echo_cancellation || config.noise_suppression;
    let echo_cancel = candidates
        .iter()
        .position(|(name, _)| wants_processing && is_echo_cancel_device(name));
    let preferred = candidates
        .iter()
        .position(|(name, _)| is_preferred_device(name));

    if let Some(index) = echo_cancel.or(preferred)
        && let Some((_, device)) = candidates.into_iter().nth(index)
    {
        return Ok(device);
    }

    host.default_input_device()
        .ok_or_else(|| ReflectaError::AudioDeviceNotFound {
            device: "default".to_string(),
        })
}

/// Chunks converted samples into frames and hands them to the consumer.
struct FrameEmitter {
    chunker: FrameChunker,
    on_frame: FrameCallback,
}

impl FrameEmitter {
    fn push(&mut self, samples: &[i16]) {
        for frame in self.chunker.push(samples) {
            (self.on_frame)(frame);
        }
    }
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched from `CpalCapture`'s methods, which
/// take `&mut self`, so it is never accessed from two threads at once.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Microphone capture pipeline backed by CPAL.
///
/// Delivers 16-bit PCM mono frames at 16kHz. Tries the target format first
/// (i16 then f32), then falls back to the device's native config with
/// software channel mixing and resampling.
pub struct CpalCapture {
    config: CaptureConfig,
    stream: Option<SendableStream>,
    lease: Option<DeviceLease>,
}

impl CpalCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            stream: None,
            lease: None,
        }
    }

    fn build_stream(
        &self,
        device: &cpal::Device,
        emitter: &Arc<Mutex<FrameEmitter>>,
    ) -> Result<cpal::Stream> {
        let preferred_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_callback = |err: cpal::StreamError| {
            warn!(error = %err, "microphone stream error");
        };

        let sink = Arc::clone(emitter);
        if let Ok(stream) = device.build_input_stream(
            &preferred_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                if let Ok(mut emitter) = sink.lock() {
                    emitter.push(data);
                }
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        let sink = Arc::clone(emitter);
        if let Ok(stream) = device.build_input_stream(
            &preferred_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let converted: Vec<i16> = data.iter().map(|&s| pcm::f32_to_i16(s)).collect();
                if let Ok(mut emitter) = sink.lock() {
                    emitter.push(&converted);
                }
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        self.build_stream_native(device, emitter)
    }

    /// Build a stream using the device's native config, converting in software.
    fn build_stream_native(
        &self,
        device: &cpal::Device,
        emitter: &Arc<Mutex<FrameEmitter>>,
    ) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config =
            device
                .default_input_config()
                .map_err(|e| ReflectaError::AudioCapture {
                    message: format!("Failed to query default input config: {}", e),
                })?;

        let native_rate = default_config.sample_rate().0;
        let native_channels = default_config.channels() as usize;
        let target_rate = self.config.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        debug!(
            channels = native_channels,
            rate = native_rate,
            format = ?default_config.sample_format(),
            "using native microphone format, converting in software"
        );

        let err_callback = |err: cpal::StreamError| {
            warn!(error = %err, "microphone stream error");
        };
        let sink = Arc::clone(emitter);

        match default_config.sample_format() {
            SampleFormat::I16 => device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let mono = pcm::mix_to_mono(data, native_channels);
                        let converted = pcm::resample(&mono, native_rate, target_rate);
                        if let Ok(mut emitter) = sink.lock() {
                            emitter.push(&converted);
                        }
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| ReflectaError::AudioCapture {
                    message: format!("Failed to build native i16 stream: {}", e),
                }),
            SampleFormat::F32 => device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let samples: Vec<i16> = data.iter().map(|&s| pcm::f32_to_i16(s)).collect();
                        let mono = pcm::mix_to_mono(&samples, native_channels);
                        let converted = pcm::resample(&mono, native_rate, target_rate);
                        if let Ok(mut emitter) = sink.lock() {
                            emitter.push(&converted);
                        }
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| ReflectaError::AudioCapture {
                    message: format!("Failed to build native f32 stream: {}", e),
                }),
            fmt => Err(ReflectaError::AudioCapture {
                message: format!("Unsupported native sample format: {:?}", fmt),
            }),
        }
    }
}

impl CaptureSource for CpalCapture {
    fn start(&mut self, on_frame: FrameCallback) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let lease = DeviceLease::acquire(Device::Microphone)?;
        let device = with_suppressed_stderr(|| select_input_device(&self.config))?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let emitter = Arc::new(Mutex::new(FrameEmitter {
            chunker: FrameChunker::new(self.config.frame_samples, self.config.sample_rate),
            on_frame,
        }));
        let stream = self.build_stream(&device, &emitter)?;
        stream.play().map_err(|e| ReflectaError::AudioCapture {
            message: format!("Failed to start audio stream: {}", e),
        })?;

        info!(device = %device_name, "microphone capture started");
        self.stream = Some(SendableStream(stream));
        self.lease = Some(lease);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        let paused = stream.0.pause();
        drop(stream);
        self.lease = None;
        info!("microphone capture stopped");

        paused.map_err(|e| ReflectaError::AudioCapture {
            message: format!("Failed to stop audio stream: {}", e),
        })
    }

    fn is_recording(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "microphone release failed during drop");
        }
    }
}

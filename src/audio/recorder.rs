use crate::audio::pcm::PcmFrame;
use crate::config::AudioConfig;
use crate::defaults;
use crate::error::{ReflectaError, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Receives each capture frame as soon as it is complete.
///
/// Called on the audio driver's thread, so it must not block.
pub type FrameCallback = Box<dyn FnMut(PcmFrame) + Send + 'static>;

/// Trait for microphone capture pipelines.
///
/// This trait allows swapping implementations (real audio device vs mock).
pub trait CaptureSource: Send {
    /// Acquire the device and start delivering fixed-size frames to `on_frame`.
    ///
    /// On failure capture stays stopped; there is no automatic retry.
    fn start(&mut self, on_frame: FrameCallback) -> Result<()>;

    /// Release the device. Calling this while not recording is a no-op.
    fn stop(&mut self) -> Result<()>;

    /// Whether frames are currently being delivered.
    fn is_recording(&self) -> bool;
}

/// Configuration for capture initialization
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub frame_samples: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::CAPTURE_SAMPLE_RATE,
            frame_samples: defaults::CAPTURE_FRAME_SAMPLES,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

impl From<&AudioConfig> for CaptureConfig {
    fn from(audio: &AudioConfig) -> Self {
        Self {
            device: audio.input_device.clone(),
            frame_samples: audio.frame_samples,
            echo_cancellation: audio.echo_cancellation,
            noise_suppression: audio.noise_suppression,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct MockCaptureState {
    callback: Option<FrameCallback>,
    recording: bool,
    starts: usize,
    stops: usize,
}

/// Mock capture source for testing.
///
/// Clones share state, so a test can keep one clone to push frames after
/// handing another to the engine.
#[derive(Clone)]
pub struct MockCaptureSource {
    state: Arc<Mutex<MockCaptureState>>,
    should_fail_start: bool,
    error_message: String,
}

impl MockCaptureSource {
    /// Create a new mock capture source with default settings
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockCaptureState::default())),
            should_fail_start: false,
            error_message: "mock microphone error".to_string(),
        }
    }

    /// Configure the mock to fail on start, like a denied permission
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the error message for failures
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    fn state(&self) -> MutexGuard<'_, MockCaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a frame as if the microphone produced it.
    ///
    /// Returns false if capture is not running.
    pub fn emit(&self, frame: PcmFrame) -> bool {
        let mut state = self.state();
        if !state.recording {
            return false;
        }
        match state.callback.as_mut() {
            Some(callback) => {
                callback(frame);
                true
            }
            None => false,
        }
    }

    /// Number of successful starts.
    pub fn start_count(&self) -> usize {
        self.state().starts
    }

    /// Number of stops that actually released the device.
    pub fn stop_count(&self) -> usize {
        self.state().stops
    }
}

impl Default for MockCaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for MockCaptureSource {
    fn start(&mut self, on_frame: FrameCallback) -> Result<()> {
        if self.should_fail_start {
            return Err(ReflectaError::AudioCapture {
                message: self.error_message.clone(),
            });
        }
        let mut state = self.state();
        if state.recording {
            return Ok(());
        }
        state.callback = Some(on_frame);
        state.recording = true;
        state.starts += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.state();
        if state.recording {
            state.recording = false;
            state.callback = None;
            state.stops += 1;
        }
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.state().recording
    }
}

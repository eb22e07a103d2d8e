//! Microphone capture and speaker playback.
//!
//! Capture delivers fixed-size 16 kHz mono frames; playback queues remote
//! frames and plays them back-to-back. The CPAL implementations are behind
//! the `cpal-audio` feature; the traits and mocks are always available.

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod lease;
pub mod pcm;
#[cfg(feature = "cpal-audio")]
pub mod playback;
pub mod player;
pub mod recorder;

#[cfg(feature = "cpal-audio")]
pub use capture::CpalCapture;
pub use lease::{Device, DeviceLease};
pub use pcm::{FrameChunker, PcmFrame};
#[cfg(feature = "cpal-audio")]
pub use playback::CpalPlayback;
pub use player::{AudioSink, MockAudioSink, PlaybackQueue};
pub use recorder::{CaptureConfig, CaptureSource, FrameCallback, MockCaptureSource};

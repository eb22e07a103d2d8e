//! Error types for reflecta.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReflectaError {
    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    // Audio device errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio device already in use: {device}")]
    AudioDeviceBusy { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("Audio playback failed: {message}")]
    AudioPlayback { message: String },

    // Streaming transport errors
    #[error("No API key configured for the conversational backend")]
    MissingCredential,

    #[error("Streaming channel is not connected")]
    NotConnected,

    #[error("Streaming connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Streaming handshake failed: {message}")]
    Handshake { message: String },

    #[error("Streaming protocol error: {message}")]
    Protocol { message: String },

    // Fallback request errors
    #[error("Fallback request failed: {message}")]
    FallbackRequest { message: String },

    #[error("Malformed fallback response: {message}")]
    FallbackResponse { message: String },

    // Session and persistence errors
    #[error("{kind} record not found: {id}")]
    RecordNotFound { kind: &'static str, id: String },

    #[error("Content item not found: {id}")]
    ContentNotFound { id: String },

    #[error("No interview session is active")]
    NoActiveSession,

    #[error("Interview session {id} is still active")]
    SessionAlreadyActive { id: String },

    #[error("Persistence failed: {message}")]
    Persistence { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReflectaError {
    /// True for failures of the audio hardware layer (capture or playback).
    ///
    /// These degrade a session to text-only instead of ending it.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            ReflectaError::AudioDeviceNotFound { .. }
                | ReflectaError::AudioDeviceBusy { .. }
                | ReflectaError::AudioCapture { .. }
                | ReflectaError::AudioPlayback { .. }
        )
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, ReflectaError>;

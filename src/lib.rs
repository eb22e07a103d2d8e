//! reflecta - Conversational interview engine for a personal learning tracker
//!
//! Runs a spoken or typed AI interview about something the user learned,
//! over a streaming channel when available and single requests otherwise.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
pub mod config;
pub mod defaults;
pub mod error;
pub mod fallback;
pub mod prompt;
pub mod session;
pub mod telemetry;
pub mod transport;

// Composition root - needs real devices
#[cfg(feature = "cpal-audio")]
pub mod app;

// Collaborator seams (capture → transport → playback, store, fallback)
pub use audio::player::AudioSink;
pub use audio::recorder::CaptureSource;
pub use fallback::client::QuestionGenerator;
pub use session::store::RecordStore;
pub use transport::connection::Connector;

// Engine
pub use session::orchestrator::{
    DeliveryMode, SessionOrchestrator, SessionState, StartSessionInput, Stores,
};
pub use transport::connection::{ConnectionManager, ConnectionState, Credentials};

// Error handling
pub use error::{ReflectaError, Result};

// Config
pub use config::{Config, OverlapPolicy};

/// Build version string with optional git commit hash.
///
/// Returns `"0.3.1+abc1234"` when git hash is available, `"0.3.1"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

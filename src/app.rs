//! Composition root for embedding applications.
//!
//! Wires the real microphone, speaker, websocket connector and HTTP fallback
//! client into a `SessionOrchestrator`. The caller supplies the record stores.

use crate::audio::capture::{CpalCapture, suppress_audio_warnings};
use crate::audio::playback::CpalPlayback;
use crate::audio::recorder::CaptureConfig;
use crate::config::Config;
use crate::error::Result;
use crate::fallback::gemini::GeminiQuestionClient;
use crate::session::orchestrator::{SessionOrchestrator, StartSessionInput, Stores};
use crate::telemetry;
use crate::transport::connection::{ConnectionManager, LiveSettings};
use crate::transport::websocket::WebSocketConnector;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Load the configuration file (or defaults), apply environment overrides,
/// validate, and install the tracing subscriber.
///
/// `path` defaults to `Config::default_path()`.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path.map(Path::to_path_buf).or_else(Config::default_path) {
        Some(path) => Config::load_or_default(&path)?,
        None => Config::default(),
    }
    .with_env_overrides();

    config.validate().context("Invalid configuration")?;
    telemetry::init_tracing(&config.logging);
    Ok(config)
}

/// Build an orchestrator backed by real devices and network clients.
pub fn build_orchestrator(config: &Config, stores: Stores) -> Result<SessionOrchestrator> {
    // Suppress noisy JACK/ALSA warnings before audio init
    suppress_audio_warnings();

    let credentials = config.credentials();
    let settings = LiveSettings::from_config(&config.live)?;
    let connector = WebSocketConnector::new(&config.live.url);
    let (connection, events) = ConnectionManager::new(Arc::new(connector), settings);
    let questions = GeminiQuestionClient::new(&config.fallback, credentials.clone())?;

    info!(
        realtime = config.live.enabled,
        has_key = credentials.is_some(),
        model = %config.live.model,
        "building session engine"
    );

    Ok(SessionOrchestrator::new(
        config.session.clone(),
        stores,
        connection,
        events,
        Arc::new(questions),
    )
    .with_credentials(credentials)
    .with_realtime(config.live.enabled)
    .with_capture(Box::new(CpalCapture::new(CaptureConfig::from(&config.audio))))
    .with_playback(Box::new(CpalPlayback::new(
        config.audio.output_device.clone(),
    ))))
}

/// Start input for `content_id` using the configured voice preference.
pub fn session_input(config: &Config, content_id: &str) -> StartSessionInput {
    let input = StartSessionInput::new(content_id);
    if config.audio.voice_input {
        input.with_voice()
    } else {
        input
    }
}

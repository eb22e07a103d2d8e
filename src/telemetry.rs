//! Tracing subscriber setup for applications embedding the engine.

use crate::config::LoggingConfig;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::Level;

static TRACING_INIT: OnceLock<bool> = OnceLock::new();

/// Resolve the configured level name, falling back to INFO on unknown names.
fn resolve_level(name: &str) -> Level {
    Level::from_str(name.trim()).unwrap_or(Level::INFO)
}

fn init_tracing_once(config: &LoggingConfig, once: &OnceLock<bool>) -> bool {
    *once.get_or_init(|| {
        let level = resolve_level(&config.level);
        let builder = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_target(true);
        let installed = if config.json {
            tracing::subscriber::set_global_default(builder.json().finish())
        } else {
            tracing::subscriber::set_global_default(builder.finish())
        };
        installed.is_ok()
    })
}

/// Install the global tracing subscriber.
///
/// Only the first call has an effect. Returns false when another subscriber
/// was already installed by the host application.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    init_tracing_once(config, &TRACING_INIT)
}

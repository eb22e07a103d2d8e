use crate::defaults;
use crate::error::{ReflectaError, Result};
use crate::transport::connection::Credentials;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub live: LiveConfig,
    pub fallback: FallbackConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

/// Streaming channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LiveConfig {
    /// Attempt the streaming channel before falling back to single requests.
    pub enabled: bool,
    pub url: String,
    pub model: String,
    pub voice: String,
    pub api_key: Option<String>,
    /// Humantime duration, e.g. "10s".
    pub handshake_timeout: String,
}

/// Stateless question endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FallbackConfig {
    pub endpoint: String,
    pub model: String,
    /// Humantime duration, e.g. "30s".
    pub timeout: String,
    pub temperature: f32,
}

/// Audio device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    /// Capture the microphone while the streaming channel is open.
    pub voice_input: bool,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub frame_samples: usize,
}

/// Session behaviour configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub on_overlap: OverlapPolicy,
    pub default_question: String,
    pub default_follow_up: String,
    pub kickoff_message: String,
}

/// What `start_session` does when another session is still running.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Persist the running session as completed, then start the new one.
    #[default]
    EndPrevious,
    /// Discard the running session, then start the new one.
    CancelPrevious,
    /// Refuse with `SessionAlreadyActive`.
    Reject,
}

/// Tracing subscriber configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: defaults::LIVE_URL.to_string(),
            model: defaults::LIVE_MODEL.to_string(),
            voice: defaults::LIVE_VOICE.to_string(),
            api_key: None,
            handshake_timeout: defaults::HANDSHAKE_TIMEOUT.to_string(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::FALLBACK_ENDPOINT.to_string(),
            model: defaults::FALLBACK_MODEL.to_string(),
            timeout: defaults::FALLBACK_TIMEOUT.to_string(),
            temperature: defaults::FALLBACK_TEMPERATURE,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            voice_input: true,
            echo_cancellation: true,
            noise_suppression: true,
            frame_samples: defaults::CAPTURE_FRAME_SAMPLES,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            on_overlap: OverlapPolicy::default(),
            default_question: defaults::DEFAULT_OPENING_QUESTION.to_string(),
            default_follow_up: defaults::DEFAULT_FOLLOW_UP.to_string(),
            kickoff_message: defaults::KICKOFF_MESSAGE.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json: false,
        }
    }
}

impl LiveConfig {
    /// Parsed handshake timeout.
    pub fn handshake_timeout(&self) -> Result<Duration> {
        parse_duration("live.handshake_timeout", &self.handshake_timeout)
    }
}

impl FallbackConfig {
    /// Parsed request timeout.
    pub fn timeout(&self) -> Result<Duration> {
        parse_duration("fallback.timeout", &self.timeout)
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| ReflectaError::ConfigInvalidValue {
        key: key.to_string(),
        message: format!("'{}' is not a duration: {}", value, e),
    })
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if the file doesn't exist.
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - REFLECTA_API_KEY, then GEMINI_API_KEY → live.api_key
    /// - REFLECTA_REALTIME ("0"/"false" disables) → live.enabled
    /// - REFLECTA_INPUT_DEVICE → audio.input_device
    /// - REFLECTA_OUTPUT_DEVICE → audio.output_device
    pub fn with_env_overrides(mut self) -> Self {
        let api_key = ["REFLECTA_API_KEY", "GEMINI_API_KEY"]
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|value| !value.is_empty());
        if let Some(key) = api_key {
            self.live.api_key = Some(key);
        }

        if let Ok(realtime) = std::env::var("REFLECTA_REALTIME")
            && !realtime.is_empty()
        {
            self.live.enabled = !matches!(
                realtime.to_ascii_lowercase().as_str(),
                "0" | "false" | "off" | "no"
            );
        }

        if let Ok(device) = std::env::var("REFLECTA_INPUT_DEVICE")
            && !device.is_empty()
        {
            self.audio.input_device = Some(device);
        }

        if let Ok(device) = std::env::var("REFLECTA_OUTPUT_DEVICE")
            && !device.is_empty()
        {
            self.audio.output_device = Some(device);
        }

        self
    }

    /// Check values that serde cannot validate on its own.
    pub fn validate(&self) -> Result<()> {
        self.live.handshake_timeout()?;
        self.fallback.timeout()?;

        if !(self.live.url.starts_with("ws://") || self.live.url.starts_with("wss://")) {
            return Err(ReflectaError::ConfigInvalidValue {
                key: "live.url".to_string(),
                message: "must be a ws:// or wss:// URL".to_string(),
            });
        }

        if self.audio.frame_samples == 0 {
            return Err(ReflectaError::ConfigInvalidValue {
                key: "audio.frame_samples".to_string(),
                message: "must be positive".to_string(),
            });
        }

        if !(0.0..=2.0).contains(&self.fallback.temperature) {
            return Err(ReflectaError::ConfigInvalidValue {
                key: "fallback.temperature".to_string(),
                message: "must be between 0.0 and 2.0".to_string(),
            });
        }

        Ok(())
    }

    /// Credentials for the conversational backend, if an API key is configured.
    pub fn credentials(&self) -> Option<Credentials> {
        self.live
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(Credentials::new)
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/reflecta/config.toml on Linux
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("reflecta").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_reflecta_env() {
        remove_env("REFLECTA_API_KEY");
        remove_env("GEMINI_API_KEY");
        remove_env("REFLECTA_REALTIME");
        remove_env("REFLECTA_INPUT_DEVICE");
        remove_env("REFLECTA_OUTPUT_DEVICE");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert!(config.live.enabled);
        assert_eq!(config.live.api_key, None);
        assert_eq!(config.live.handshake_timeout, "10s");
        assert_eq!(config.fallback.model, "gemini-2.0-flash");
        assert_eq!(config.audio.frame_samples, 1600);
        assert!(config.audio.voice_input);
        assert!(config.audio.echo_cancellation);
        assert_eq!(config.session.on_overlap, OverlapPolicy::EndPrevious);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [live]
            enabled = false
            model = "models/custom-live"
            handshake_timeout = "3s"

            [fallback]
            timeout = "5s"
            temperature = 0.2

            [audio]
            input_device = "echo-cancel-source"
            voice_input = false
            frame_samples = 800

            [session]
            on_overlap = "cancel_previous"
            default_question = "What stayed with you?"

            [logging]
            level = "debug"
            json = true
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert!(!config.live.enabled);
        assert_eq!(config.live.model, "models/custom-live");
        assert_eq!(
            config.live.handshake_timeout().unwrap(),
            Duration::from_secs(3)
        );
        assert_eq!(config.fallback.timeout().unwrap(), Duration::from_secs(5));
        assert_eq!(config.fallback.temperature, 0.2);
        assert_eq!(
            config.audio.input_device,
            Some("echo-cancel-source".to_string())
        );
        assert!(!config.audio.voice_input);
        assert_eq!(config.audio.frame_samples, 800);
        assert_eq!(config.session.on_overlap, OverlapPolicy::CancelPrevious);
        assert_eq!(config.session.default_question, "What stayed with you?");
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let toml_content = r#"
            [session]
            on_overlap = "reject"
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.session.on_overlap, OverlapPolicy::Reject);
        assert_eq!(config.live, LiveConfig::default());
        assert_eq!(config.audio, AudioConfig::default());
        assert_eq!(
            config.session.default_follow_up,
            defaults::DEFAULT_FOLLOW_UP
        );
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = r#"
            [live
            url = "broken
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(invalid_toml.as_bytes()).unwrap();

        assert!(Config::load(temp_file.path()).is_err());
        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let missing_path = Path::new("/tmp/nonexistent_reflecta_config_12345.toml");
        let config = Config::load_or_default(missing_path).unwrap();

        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_rejects_bad_duration() {
        let mut config = Config::default();
        config.live.handshake_timeout = "soon".to_string();

        match config.validate() {
            Err(ReflectaError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "live.handshake_timeout");
            }
            other => panic!("Expected ConfigInvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_http_live_url() {
        let mut config = Config::default();
        config.live.url = "https://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_frame_size() {
        let mut config = Config::default();
        config.audio.frame_samples = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_ignore_blank_key() {
        let mut config = Config::default();
        assert!(config.credentials().is_none());

        config.live.api_key = Some("   ".to_string());
        assert!(config.credentials().is_none());

        config.live.api_key = Some("secret".to_string());
        assert_eq!(config.credentials().unwrap().api_key(), "secret");
    }

    #[test]
    fn test_env_override_api_key_prefers_reflecta_variable() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_reflecta_env();

        set_env("GEMINI_API_KEY", "gemini-key");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.live.api_key, Some("gemini-key".to_string()));

        set_env("REFLECTA_API_KEY", "reflecta-key");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.live.api_key, Some("reflecta-key".to_string()));

        clear_reflecta_env();
    }

    #[test]
    fn test_env_override_realtime_and_devices() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_reflecta_env();

        set_env("REFLECTA_REALTIME", "false");
        set_env("REFLECTA_INPUT_DEVICE", "pipewire");
        set_env("REFLECTA_OUTPUT_DEVICE", "pulse");
        let config = Config::default().with_env_overrides();

        assert!(!config.live.enabled);
        assert_eq!(config.audio.input_device, Some("pipewire".to_string()));
        assert_eq!(config.audio.output_device, Some("pulse".to_string()));

        clear_reflecta_env();
    }

    #[test]
    fn test_env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_reflecta_env();

        set_env("REFLECTA_API_KEY", "");
        set_env("REFLECTA_REALTIME", "");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.live.api_key, None);
        assert!(config.live.enabled);

        clear_reflecta_env();
    }

    #[test]
    fn test_default_path_is_xdg_compliant() {
        if let Some(path) = Config::default_path() {
            let path_str = path.to_string_lossy();
            assert!(path_str.contains("reflecta"));
            assert!(path_str.ends_with("config.toml"));
        }
    }
}

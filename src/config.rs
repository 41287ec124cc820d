use crate::audio::capture::CaptureConfig;
use crate::audio::playback::RendererConfig;
use crate::defaults;
use crate::error::{Result, TutorlinkError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
#[cfg(feature = "cli")]
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub audio: AudioConfig,
}

/// Session endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Websocket endpoint of the tutoring agent service.
    pub endpoint: String,
    /// User id carried as a connection parameter.
    pub user_id: String,
}

/// Audio pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture device name. None selects the best default.
    pub device: Option<String>,
    /// Capture block duration in milliseconds (one block per frame).
    pub capture_block_ms: u32,
    /// Bounded depth of the outbound audio queue, in blocks.
    pub send_queue_blocks: usize,
    /// Playback ring buffer length in seconds.
    pub playback_buffer_secs: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::DEFAULT_ENDPOINT.to_string(),
            user_id: defaults::DEFAULT_USER_ID.to_string(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            capture_block_ms: defaults::CAPTURE_BLOCK_MS,
            send_queue_blocks: defaults::SEND_QUEUE_BLOCKS,
            playback_buffer_secs: defaults::PLAYBACK_BUFFER_SECS,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Panics on invalid TOML so a broken config never runs silently.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(TutorlinkError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::default()
            }
            Err(e) => panic!("Failed to load config from {}: {}", path.display(), e),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - TUTORLINK_ENDPOINT → session.endpoint
    /// - TUTORLINK_USER → session.user_id
    /// - TUTORLINK_AUDIO_DEVICE → audio.device
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("TUTORLINK_ENDPOINT")
            && !endpoint.is_empty()
        {
            self.session.endpoint = endpoint;
        }

        if let Ok(user_id) = std::env::var("TUTORLINK_USER")
            && !user_id.is_empty()
        {
            self.session.user_id = user_id;
        }

        if let Ok(device) = std::env::var("TUTORLINK_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.audio.device = Some(device);
        }

        self
    }

    /// Capture pipeline settings derived from this configuration.
    pub fn capture_config(&self) -> CaptureConfig {
        let block_samples = (defaults::CAPTURE_SAMPLE_RATE as usize
            * self.audio.capture_block_ms as usize)
            / 1000;
        CaptureConfig {
            device: self.audio.device.clone(),
            sample_rate: defaults::CAPTURE_SAMPLE_RATE,
            block_samples: block_samples.max(1),
            queue_blocks: self.audio.send_queue_blocks.max(1),
            poll_interval_ms: defaults::CAPTURE_POLL_INTERVAL_MS,
        }
    }

    /// Playback pipeline settings derived from this configuration.
    pub fn renderer_config(&self) -> RendererConfig {
        RendererConfig {
            sample_rate: defaults::PLAYBACK_SAMPLE_RATE,
            buffer_secs: self.audio.playback_buffer_secs.max(1),
        }
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/tutorlink/config.toml on Linux
    #[cfg(feature = "cli")]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tutorlink")
            .join("config.toml")
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

    fn clear_tutorlink_env() {
        remove_env("TUTORLINK_ENDPOINT");
        remove_env("TUTORLINK_USER");
        remove_env("TUTORLINK_AUDIO_DEVICE");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.session.endpoint, "ws://127.0.0.1:8000/ws");
        assert_eq!(config.session.user_id, "student");

        assert_eq!(config.audio.device, None);
        assert_eq!(config.audio.capture_block_ms, 100);
        assert_eq!(config.audio.send_queue_blocks, 32);
        assert_eq!(config.audio.playback_buffer_secs, 180);
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [session]
            endpoint = "wss://tutor.example.edu/ws"
            user_id = "student-42"

            [audio]
            device = "pipewire"
            capture_block_ms = 50
            send_queue_blocks = 16
            playback_buffer_secs = 60
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.session.endpoint, "wss://tutor.example.edu/ws");
        assert_eq!(config.session.user_id, "student-42");
        assert_eq!(config.audio.device, Some("pipewire".to_string()));
        assert_eq!(config.audio.capture_block_ms, 50);
        assert_eq!(config.audio.send_queue_blocks, 16);
        assert_eq!(config.audio.playback_buffer_secs, 60);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let toml_content = r#"
            [session]
            user_id = "guest"
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.session.user_id, "guest");

        // Everything else should be defaults
        assert_eq!(config.session.endpoint, "ws://127.0.0.1:8000/ws");
        assert_eq!(config.audio.device, None);
        assert_eq!(config.audio.capture_block_ms, 100);
    }

    #[test]
    fn test_env_override_endpoint() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_tutorlink_env();

        set_env("TUTORLINK_ENDPOINT", "ws://10.0.0.5:9000/ws");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.session.endpoint, "ws://10.0.0.5:9000/ws");
        assert_eq!(config.session.user_id, "student"); // Not overridden

        clear_tutorlink_env();
    }

    #[test]
    fn test_env_override_all() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_tutorlink_env();

        set_env("TUTORLINK_ENDPOINT", "wss://remote/ws");
        set_env("TUTORLINK_USER", "teacher-1");
        set_env("TUTORLINK_AUDIO_DEVICE", "pulse");

        let config = Config::default().with_env_overrides();

        assert_eq!(config.session.endpoint, "wss://remote/ws");
        assert_eq!(config.session.user_id, "teacher-1");
        assert_eq!(config.audio.device, Some("pulse".to_string()));

        clear_tutorlink_env();
    }

    #[test]
    fn test_env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_tutorlink_env();

        set_env("TUTORLINK_USER", "");
        let config = Config::default().with_env_overrides();

        // Empty string should not override default
        assert_eq!(config.session.user_id, "student");

        clear_tutorlink_env();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = r#"
            [session
            endpoint = "broken
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(invalid_toml.as_bytes()).unwrap();

        let result = Config::load(temp_file.path());

        assert!(matches!(result, Err(TutorlinkError::ConfigParse(_))));
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let missing_path = Path::new("/tmp/nonexistent_tutorlink_config_12345.toml");
        let config = Config::load_or_default(missing_path);

        // Should return defaults
        assert_eq!(config, Config::default());
    }

    #[test]
    #[should_panic(expected = "Failed to load config")]
    fn test_load_or_default_panics_on_invalid_toml() {
        let invalid_toml = r#"
            [session
            endpoint = "broken
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(invalid_toml.as_bytes()).unwrap();

        // Should panic on invalid TOML, not return defaults
        Config::load_or_default(temp_file.path());
    }

    #[test]
    fn test_capture_config_derives_block_samples() {
        let mut config = Config::default();
        config.audio.capture_block_ms = 50;
        let capture = config.capture_config();
        // 50ms at 16kHz mono
        assert_eq!(capture.block_samples, 800);
        assert_eq!(capture.sample_rate, 16_000);
    }

    #[test]
    fn test_renderer_config_uses_playback_rate() {
        let renderer = Config::default().renderer_config();
        assert_eq!(renderer.sample_rate, 24_000);
        assert_eq!(renderer.buffer_secs, 180);
    }

    #[test]
    #[cfg(feature = "cli")]
    fn test_default_path_is_xdg_compliant() {
        let path = Config::default_path();
        let path_str = path.to_string_lossy();

        assert!(path_str.contains("tutorlink"));
        assert!(path_str.ends_with("config.toml"));
    }
}

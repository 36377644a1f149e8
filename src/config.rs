use crate::defaults;
use crate::error::{Result, VoxError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub stream: StreamConfig,
    pub playback: PlaybackConfig,
}

/// Where generation requests are sent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
}

/// Per-stream tunables.
///
/// Every stream copies this at construction, so changing the client's
/// defaults never affects a stream that is already running.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamConfig {
    /// Frames per playback block.
    pub block_size: usize,
    /// Maximum bytes per body read.
    pub download_chunk_size: usize,
    /// Playback queue capacity in blocks.
    pub buffer_depth: usize,
    /// Concurrent connection attempts allowed by the admission gate.
    pub max_in_flight: usize,
    /// Blocks' worth of undecodable bytes tolerated before failing.
    pub decode_retry_limit: u32,
    /// Consecutive playback queue timeouts tolerated before failing.
    pub put_retry_limit: u32,
}

/// Output device selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PlaybackConfig {
    pub device: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::API_ENDPOINT.to_string(),
            timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            block_size: defaults::BLOCK_SIZE,
            download_chunk_size: defaults::DOWNLOAD_CHUNK_SIZE,
            buffer_depth: defaults::BUFFER_DEPTH,
            max_in_flight: defaults::MAX_IN_FLIGHT,
            decode_retry_limit: defaults::DECODE_RETRY_LIMIT,
            put_retry_limit: defaults::PUT_RETRY_LIMIT,
        }
    }
}

impl StreamConfig {
    /// How long the feeder may block on a full playback queue.
    ///
    /// One full queue's worth of audio: `block_size * buffer_depth / sample_rate`.
    pub fn put_timeout(&self, sample_rate: u32) -> Duration {
        let frames = (self.block_size * self.buffer_depth) as f64;
        Duration::from_secs_f64(frames / sample_rate.max(1) as f64)
    }

    /// Reject values that would stall or divide by zero at runtime.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, usize); 4] = [
            ("block_size", self.block_size),
            ("download_chunk_size", self.download_chunk_size),
            ("buffer_depth", self.buffer_depth),
            ("max_in_flight", self.max_in_flight),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(VoxError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
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

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Invalid TOML is reported as `ConfigParse`.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e) => {
                if e.downcast_ref::<std::io::Error>()
                    .map(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false)
                {
                    Ok(Self::default())
                } else {
                    Err(VoxError::ConfigParse {
                        message: format!("{}: {}", path.display(), e),
                    })
                }
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOXSTREAM_ENDPOINT → api.endpoint
    /// - VOXSTREAM_BLOCK_SIZE → stream.block_size (ignored unless a positive integer)
    /// - VOXSTREAM_OUTPUT_DEVICE → playback.device
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("VOXSTREAM_ENDPOINT")
            && !endpoint.is_empty()
        {
            self.api.endpoint = endpoint;
        }

        if let Ok(block_size) = std::env::var("VOXSTREAM_BLOCK_SIZE")
            && let Ok(parsed) = block_size.trim().parse::<usize>()
            && parsed > 0
        {
            self.stream.block_size = parsed;
        }

        if let Ok(device) = std::env::var("VOXSTREAM_OUTPUT_DEVICE")
            && !device.is_empty()
        {
            self.playback.device = Some(device);
        }

        self
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<()> {
        if self.api.endpoint.is_empty() {
            return Err(VoxError::ConfigInvalidValue {
                key: "endpoint".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        self.stream.validate()
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxstream/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("voxstream")
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

    fn clear_voxstream_env() {
        remove_env("VOXSTREAM_ENDPOINT");
        remove_env("VOXSTREAM_BLOCK_SIZE");
        remove_env("VOXSTREAM_OUTPUT_DEVICE");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.api.endpoint, "https://api.elevenlabs.io/v1");
        assert_eq!(config.api.timeout_secs, 900);

        assert_eq!(config.stream.block_size, 2048);
        assert_eq!(config.stream.download_chunk_size, 4096);
        assert_eq!(config.stream.buffer_depth, 8);
        assert_eq!(config.stream.max_in_flight, 2);

        assert_eq!(config.playback.device, None);
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [api]
            endpoint = "http://localhost:8080/v1"
            timeout_secs = 30

            [stream]
            block_size = 1024
            download_chunk_size = 512
            buffer_depth = 4
            max_in_flight = 3

            [playback]
            device = "pipewire"
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.api.endpoint, "http://localhost:8080/v1");
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.stream.block_size, 1024);
        assert_eq!(config.stream.download_chunk_size, 512);
        assert_eq!(config.stream.buffer_depth, 4);
        assert_eq!(config.stream.max_in_flight, 3);
        assert_eq!(config.playback.device, Some("pipewire".to_string()));
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let toml_content = r#"
            [stream]
            block_size = 512
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.stream.block_size, 512);
        assert_eq!(config.stream.buffer_depth, 8);
        assert_eq!(config.stream.decode_retry_limit, 64);
        assert_eq!(config.api, ApiConfig::default());
        assert_eq!(config.playback.device, None);
    }

    #[test]
    fn test_put_timeout_is_one_full_queue_of_audio() {
        let stream = StreamConfig {
            block_size: 2048,
            buffer_depth: 8,
            ..StreamConfig::default()
        };
        let timeout = stream.put_timeout(16384);
        assert_eq!(timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_put_timeout_survives_zero_sample_rate() {
        let timeout = StreamConfig::default().put_timeout(0);
        assert!(timeout > Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_zero_block_size() {
        let config = Config {
            stream: StreamConfig {
                block_size: 0,
                ..StreamConfig::default()
            },
            ..Config::default()
        };
        match config.validate() {
            Err(VoxError::ConfigInvalidValue { key, .. }) => assert_eq!(key, "block_size"),
            other => panic!("Expected ConfigInvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_empty_endpoint() {
        let mut config = Config::default();
        config.api.endpoint.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override_endpoint_and_device() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_voxstream_env();

        set_env("VOXSTREAM_ENDPOINT", "http://127.0.0.1:9000");
        set_env("VOXSTREAM_OUTPUT_DEVICE", "pulse");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.api.endpoint, "http://127.0.0.1:9000");
        assert_eq!(config.playback.device, Some("pulse".to_string()));
        assert_eq!(config.stream.block_size, 2048);

        clear_voxstream_env();
    }

    #[test]
    fn test_env_override_block_size_ignores_garbage() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_voxstream_env();

        set_env("VOXSTREAM_BLOCK_SIZE", "lots");
        assert_eq!(Config::default().with_env_overrides().stream.block_size, 2048);

        set_env("VOXSTREAM_BLOCK_SIZE", "0");
        assert_eq!(Config::default().with_env_overrides().stream.block_size, 2048);

        set_env("VOXSTREAM_BLOCK_SIZE", "1024");
        assert_eq!(Config::default().with_env_overrides().stream.block_size, 1024);

        clear_voxstream_env();
    }

    #[test]
    fn test_env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_voxstream_env();

        set_env("VOXSTREAM_ENDPOINT", "");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.api.endpoint, defaults::API_ENDPOINT);

        clear_voxstream_env();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = r#"
            [stream
            block_size = "broken
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(invalid_toml.as_bytes()).unwrap();

        assert!(Config::load(temp_file.path()).is_err());
        assert!(matches!(
            Config::load_or_default(temp_file.path()),
            Err(VoxError::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let missing_path = Path::new("/tmp/nonexistent_voxstream_config_12345.toml");
        let config = Config::load_or_default(missing_path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_default_path_ends_with_config_toml() {
        let path = Config::default_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.contains("voxstream"));
        assert!(path_str.ends_with("config.toml"));
    }
}

//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_server_port(),
        }
    }
}

/// Relay process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    /// Executable used to relay streams (default "ffmpeg")
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Output protocol of the relay (default "rtsp")
    #[serde(default = "default_relay_protocol")]
    pub protocol: String,
    /// Port derivation base: a stream without an explicit port relays on `base_port + id`
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// How long a freshly launched relay must survive to count as started
    #[serde(default = "default_start_grace_ms")]
    pub start_grace_ms: u64,
    /// How long a terminated relay gets before it is killed
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Pause between the stop and start halves of a restart
    #[serde(default = "default_restart_pause_ms")]
    pub restart_pause_ms: u64,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_relay_protocol() -> String {
    "rtsp".to_string()
}

fn default_base_port() -> u16 {
    8001
}

fn default_start_grace_ms() -> u64 {
    2000
}

fn default_stop_grace_ms() -> u64 {
    1000
}

fn default_restart_pause_ms() -> u64 {
    1000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            protocol: default_relay_protocol(),
            base_port: default_base_port(),
            start_grace_ms: default_start_grace_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            restart_pause_ms: default_restart_pause_ms(),
        }
    }
}

impl RelayConfig {
    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }
}

/// Health probe configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Executable used to probe sources (default "ffprobe")
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Hard timeout for a single probe in seconds (default 10)
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
    /// Background status refresh interval in seconds (0 = disabled)
    #[serde(default)]
    pub refresh_interval_secs: u64,
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    10
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: default_ffprobe_path(),
            timeout_secs: default_probe_timeout_secs(),
            refresh_interval_secs: 0,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Resource store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Directory holding the stream and status records
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/app/data")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CAM_GATEWAY_BIND_ADDRESS -> server.bind_address
    /// - CAM_GATEWAY_PORT -> server.port
    /// - FFMPEG_PATH -> relay.ffmpeg_path
    /// - RELAY_BASE_PORT -> relay.base_port
    /// - FFPROBE_PATH -> probe.ffprobe_path
    /// - PROBE_TIMEOUT_SECS -> probe.timeout_secs
    /// - PROBE_REFRESH_INTERVAL_SECS -> probe.refresh_interval_secs
    /// - DATABASE_URL -> store.data_dir
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CAM_GATEWAY_BIND_ADDRESS") {
            if !val.trim().is_empty() {
                self.server.bind_address = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("CAM_GATEWAY_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(val) = env::var("FFMPEG_PATH") {
            if !val.trim().is_empty() {
                self.relay.ffmpeg_path = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("RELAY_BASE_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.relay.base_port = port;
            }
        }

        if let Ok(val) = env::var("FFPROBE_PATH") {
            if !val.trim().is_empty() {
                self.probe.ffprobe_path = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("PROBE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.probe.timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("PROBE_REFRESH_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.probe.refresh_interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("DATABASE_URL") {
            if let Some(dir) = data_dir_from_database_url(&val) {
                self.store.data_dir = dir;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Default configuration with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}

/// Turn a `DATABASE_URL` value into the store's data directory.
///
/// Accepts a bare directory, a `file://` or `sqlite:///` prefixed path, or a
/// path to a `.db` file (in which case its parent directory is used).
pub fn data_dir_from_database_url(url: &str) -> Option<PathBuf> {
    let trimmed = url.trim();
    let path = trimmed
        .strip_prefix("sqlite:///")
        .map(str::to_string)
        .or_else(|| trimmed.strip_prefix("file://").map(str::to_string))
        .unwrap_or_else(|| trimmed.to_string());

    if path.is_empty() {
        return None;
    }

    let path = PathBuf::from(path);
    if path.extension().and_then(|e| e.to_str()) == Some("db") {
        let parent = path.parent()?;
        if parent.as_os_str().is_empty() {
            return Some(PathBuf::from("."));
        }
        return Some(parent.to_path_buf());
    }

    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("CAM_GATEWAY_BIND_ADDRESS");
        env::remove_var("CAM_GATEWAY_PORT");
        env::remove_var("FFMPEG_PATH");
        env::remove_var("RELAY_BASE_PORT");
        env::remove_var("FFPROBE_PATH");
        env::remove_var("PROBE_TIMEOUT_SECS");
        env::remove_var("PROBE_REFRESH_INTERVAL_SECS");
        env::remove_var("DATABASE_URL");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            port in 1u16..u16::MAX,
            base_port in 1024u16..60000,
            start_grace in 0u64..10_000,
            stop_grace in 0u64..10_000,
            timeout in 1u64..120,
            interval in 0u64..3600,
        ) {
            let toml_str = format!(
                r#"
[server]
bind_address = "127.0.0.1"
port = {}

[relay]
ffmpeg_path = "/usr/bin/ffmpeg"
protocol = "rtsp"
base_port = {}
start_grace_ms = {}
stop_grace_ms = {}

[probe]
ffprobe_path = "/usr/bin/ffprobe"
timeout_secs = {}
refresh_interval_secs = {}

[store]
data_dir = "/var/lib/cam-gateway"
"#,
                port, base_port, start_grace, stop_grace, timeout, interval
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.server.bind_address.as_str(), "127.0.0.1");
            prop_assert_eq!(config.server.port, port);
            prop_assert_eq!(config.relay.ffmpeg_path.as_str(), "/usr/bin/ffmpeg");
            prop_assert_eq!(config.relay.base_port, base_port);
            prop_assert_eq!(config.relay.start_grace_ms, start_grace);
            prop_assert_eq!(config.relay.stop_grace_ms, stop_grace);
            prop_assert_eq!(config.relay.restart_pause_ms, 1000);
            prop_assert_eq!(config.probe.timeout_secs, timeout);
            prop_assert_eq!(config.probe.refresh_interval_secs, interval);
            prop_assert_eq!(config.store.data_dir, PathBuf::from("/var/lib/cam-gateway"));
        }

        #[test]
        fn prop_env_overrides_base_port(
            initial in 1024u16..60000,
            override_port in 1024u16..60000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[relay]\nbase_port = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("RELAY_BASE_PORT", override_port.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.relay.base_port, override_port);
        }

        #[test]
        fn prop_env_overrides_probe_timeout(
            initial in 1u64..60,
            override_secs in 1u64..600,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[probe]\ntimeout_secs = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("PROBE_TIMEOUT_SECS", override_secs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.probe.timeout_secs, override_secs);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.relay.ffmpeg_path, "ffmpeg");
        assert_eq!(config.relay.protocol, "rtsp");
        assert_eq!(config.relay.base_port, 8001);
        assert_eq!(config.relay.start_grace(), Duration::from_secs(2));
        assert_eq!(config.relay.stop_grace(), Duration::from_secs(1));
        assert_eq!(config.relay.restart_pause(), Duration::from_secs(1));
        assert_eq!(config.probe.ffprobe_path, "ffprobe");
        assert_eq!(config.probe.timeout(), Duration::from_secs(10));
        assert_eq!(config.probe.refresh_interval_secs, 0);
        assert_eq!(config.store.data_dir, PathBuf::from("/app/data"));
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[relay]
base_port = 9000
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.relay.base_port, 9000);
        assert_eq!(config.relay.ffmpeg_path, "ffmpeg");
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.probe, ProbeConfig::default());
    }

    #[test]
    fn test_invalid_env_values_keep_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("CAM_GATEWAY_PORT", "not-a-port");
        env::set_var("PROBE_TIMEOUT_SECS", "-3");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.probe.timeout_secs, 10);
    }

    #[test]
    fn test_database_url_override_sets_data_dir() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("DATABASE_URL", "/srv/gateway/streams.db");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.store.data_dir, PathBuf::from("/srv/gateway"));
    }

    #[test]
    fn test_data_dir_from_database_url_variants() {
        assert_eq!(
            data_dir_from_database_url("sqlite:////app/data/streams.db"),
            Some(PathBuf::from("/app/data"))
        );
        assert_eq!(
            data_dir_from_database_url("file:///var/lib/cams"),
            Some(PathBuf::from("/var/lib/cams"))
        );
        assert_eq!(
            data_dir_from_database_url("streams.db"),
            Some(PathBuf::from("."))
        );
        assert_eq!(data_dir_from_database_url("   "), None);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = Config::load("/definitely/not/here/config.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}

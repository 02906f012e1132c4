use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CONFIG_ENV_VAR: &str = "PARLEY_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub connection: ConnectionSettings,
    pub sync: SyncSettings,
    pub event_bus: EventBusConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the realtime channel server.
    pub url: String,
    /// Base URL of the REST API. Falls back to `url` when unset.
    pub api_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:4545".to_string(),
            api_url: None,
        }
    }
}

impl ServerConfig {
    pub fn api_base_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Total connection attempts before giving up.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_seconds: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay_ms: 1000,
            connect_timeout_seconds: 20,
        }
    }
}

impl ConnectionSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// How far apart an optimistic message and its server copy may be
    /// timestamped and still be treated as the same message.
    pub reconcile_window_seconds: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            reconcile_window_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub session_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.url.trim().is_empty() {
            return Err(ConfigError::Invalid("server.url must not be empty".into()));
        }
        if !has_scheme(&self.server.url, &["http://", "https://", "ws://", "wss://"]) {
            return Err(ConfigError::Invalid(format!(
                "server.url must be an http(s) or ws(s) URL, got {}",
                self.server.url
            )));
        }
        // The REST API falls back to `server.url` and only speaks http(s).
        if !has_scheme(self.server.api_base_url(), &["http://", "https://"]) {
            return Err(ConfigError::Invalid(format!(
                "server.api_url must be an http(s) URL when server.url is {}",
                self.server.url
            )));
        }
        if self.connection.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "connection.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn has_scheme(url: &str, schemes: &[&str]) -> bool {
    let url = url.trim();
    schemes.iter().any(|scheme| url.starts_with(scheme))
}

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("chat", "parley", "parley")
}

pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Loads configuration from `$PARLEY_CONFIG` or the platform config
/// directory. A missing file yields defaults.
pub fn load_config() -> Result<Config, ConfigError> {
    let path = std::env::var_os(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .or_else(default_config_path);

    match path {
        Some(path) if path.exists() => load_config_from(&path),
        Some(path) => {
            debug!(path = %path.display(), "no config file, using defaults");
            Ok(Config::default())
        }
        None => Ok(Config::default()),
    }
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_match_protocol_policy() {
        let config = Config::default();
        assert_eq!(config.connection.max_attempts, 5);
        assert_eq!(config.connection.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.sync.reconcile_window_seconds, 120);
        assert_eq!(config.server.api_base_url(), "http://localhost:4545");
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nurl = \"https://chat.example.com\"\napi_url = \"https://api.example.com\"\n\n[connection]\nmax_attempts = 3"
        )
        .unwrap();

        let config = load_config_from(file.path()).unwrap();
        assert_eq!(config.server.url, "https://chat.example.com");
        assert_eq!(config.server.api_base_url(), "https://api.example.com");
        assert_eq!(config.connection.max_attempts, 3);
        assert_eq!(config.connection.retry_delay_ms, 1000);
        assert_eq!(config.event_bus.channel_capacity, 1024);
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[connection]\nmax_attempts = 0").unwrap();

        assert_matches!(load_config_from(file.path()), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nurl = 1").unwrap();

        let error = load_config_from(file.path()).unwrap_err();
        assert_matches!(error, ConfigError::Parse { .. });
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn non_http_server_url_is_rejected() {
        let config = Config {
            server: ServerConfig {
                url: "ftp://example.com".into(),
                api_url: None,
            },
            ..Config::default()
        };
        assert_matches!(config.validate(), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn websocket_server_url_needs_an_http_api_url() {
        let mut config = Config {
            server: ServerConfig {
                url: "wss://chat.example.com".into(),
                api_url: None,
            },
            ..Config::default()
        };
        assert_matches!(config.validate(), Err(ConfigError::Invalid(_)));

        config.server.api_url = Some("https://chat.example.com".into());
        assert!(config.validate().is_ok());
    }
}

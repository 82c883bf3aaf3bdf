//! gcs.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_STORE_HOST: &str = "127.0.0.1";
pub const DEFAULT_STORE_PORT: u16 = 6379;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GcsConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Where the backing store listens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub event_loop: EventLoopKind,
}

/// Which event-loop backend drives the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLoopKind {
    /// Minimal single-threaded reactor.
    #[default]
    Mini,
    /// tokio current-thread runtime.
    Tokio,
}

fn default_host() -> String {
    DEFAULT_STORE_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_STORE_PORT
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: None,
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl GcsConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GcsConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config: GcsConfig = toml::from_str("").unwrap();
        assert_eq!(config, GcsConfig::default());
        assert_eq!(config.store.address(), "127.0.0.1:6379");
        assert_eq!(config.store.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.client.event_loop, EventLoopKind::Mini);
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
[store]
host = "10.0.0.5"
port = 7000
connect_timeout_ms = 250

[client]
event_loop = "tokio"
"#;
        let config: GcsConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store.address(), "10.0.0.5:7000");
        assert_eq!(config.store.connect_timeout(), Duration::from_millis(250));
        assert_eq!(config.client.event_loop, EventLoopKind::Tokio);
    }

    #[test]
    fn test_round_trip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gcs.toml");
        let mut config = GcsConfig::default();
        config.store.port = 9999;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        assert_eq!(GcsConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result: Result<GcsConfig, _> = toml::from_str("[client]\nevent_loop = \"epoll\"\n");
        assert!(result.is_err());
    }
}

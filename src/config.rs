//! Client configuration.
//!
//! Resolution order (later wins):
//! 1. Built-in defaults (`localhost`, socket port 9090, HTTP port 8080)
//! 2. `<config dir>/xbmc-rpc/config.json` if it exists
//! 3. `XBMC_HOST`, `XBMC_WS_PORT`, `XBMC_HTTP_PORT`, `XBMC_PROTOCOL`,
//!    `XBMC_CACHE_PATH`
//!
//! Unparseable environment overrides are logged and ignored.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::cache::{default_durable_path, CacheConfig};
use crate::controller::Protocol;
use crate::session::SessionConfig;
use crate::transport::TransportError;

pub const ENV_HOST: &str = "XBMC_HOST";
pub const ENV_WS_PORT: &str = "XBMC_WS_PORT";
pub const ENV_HTTP_PORT: &str = "XBMC_HTTP_PORT";
pub const ENV_PROTOCOL: &str = "XBMC_PROTOCOL";
pub const ENV_CACHE_PATH: &str = "XBMC_CACHE_PATH";

/// Everything needed to reach and talk to one XBMC instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub ws_port: u16,
    pub http_port: u16,
    pub protocol: Protocol,
    /// Reconnect automatically after the connection drops.
    pub auto_retry: bool,
    pub cache: CacheConfig,
    /// Durable cache file; the platform cache directory when unset.
    pub durable_cache_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            ws_port: 9090,
            http_port: 8080,
            protocol: Protocol::Auto,
            auto_retry: true,
            cache: CacheConfig::default(),
            durable_cache_path: None,
        }
    }
}

/// `~/.config/xbmc-rpc/config.json` on Linux.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("xbmc-rpc").join("config.json"))
}

impl ClientConfig {
    /// Defaults, then the config file, then the environment.
    pub fn load() -> Result<Self> {
        let mut config = match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = parse_env(&lookup, ENV_WS_PORT) {
            self.ws_port = port;
        }
        if let Some(port) = parse_env(&lookup, ENV_HTTP_PORT) {
            self.http_port = port;
        }
        if let Some(protocol) = parse_env(&lookup, ENV_PROTOCOL) {
            self.protocol = protocol;
        }
        if let Some(path) = lookup(ENV_CACHE_PATH) {
            self.durable_cache_path = Some(PathBuf::from(path));
        }
    }

    pub fn ws_url(&self) -> Result<Url, TransportError> {
        endpoint("ws", &self.host, self.ws_port)
    }

    pub fn http_url(&self) -> Result<Url, TransportError> {
        endpoint("http", &self.host, self.http_port)
    }

    pub fn durable_cache_path(&self) -> Option<PathBuf> {
        self.durable_cache_path.clone().or_else(default_durable_path)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            auto_retry: self.auto_retry,
            ..SessionConfig::default()
        }
    }
}

fn parse_env<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}={}: {}", key, raw, e);
            None
        }
    }
}

fn endpoint(scheme: &str, host: &str, port: u16) -> Result<Url, TransportError> {
    let url = Url::parse(&format!("{}://{}:{}/jsonrpc", scheme, host, port))
        .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", host, e)))?;
    if url.host_str().is_none() {
        return Err(TransportError::InvalidEndpoint(format!("{}: no host", host)));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheTier;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.ws_url().unwrap().as_str(), "ws://localhost:9090/jsonrpc");
        assert_eq!(config.http_url().unwrap().as_str(), "http://localhost:8080/jsonrpc");
        assert_eq!(config.protocol, Protocol::Auto);
        assert!(config.session_config().auto_retry);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ClientConfig::default();
        config.apply_env(env(&[
            ("XBMC_HOST", "kodi.local"),
            ("XBMC_WS_PORT", "9999"),
            ("XBMC_HTTP_PORT", "not-a-port"),
            ("XBMC_PROTOCOL", "http"),
            ("XBMC_CACHE_PATH", "/tmp/xbmc-cache.json"),
        ]));

        assert_eq!(config.host, "kodi.local");
        assert_eq!(config.ws_port, 9999);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.protocol, Protocol::Http);
        assert_eq!(
            config.durable_cache_path(),
            Some(PathBuf::from("/tmp/xbmc-cache.json"))
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"host": "10.0.0.5", "protocol": "ws", "cache": {"default_tier": "durable"}}"#,
        )
        .unwrap();

        let config = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.protocol, Protocol::WebSocket);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.cache.default_tier, CacheTier::Durable);
        assert_eq!(config.cache.durable_days, 1);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ host: oops").unwrap();

        let err = ClientConfig::from_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid config"));
    }

    #[test]
    fn test_bad_host_is_rejected() {
        let config = ClientConfig {
            host: "bad host".to_string(),
            ..ClientConfig::default()
        };
        assert!(matches!(
            config.ws_url(),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }
}

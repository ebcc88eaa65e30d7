//! Node configuration, stored as TOML.
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration for a node talking to a stock local Tor daemon.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::onion::ControlAuth;

/// Contact-request server port.
pub const DEFAULT_REQUEST_PORT: u16 = 5000;
/// Contact-response server port.
pub const DEFAULT_RESPONSE_PORT: u16 = 5001;
/// Message server port.
pub const DEFAULT_MESSAGE_PORT: u16 = 5002;
/// Tor SOCKS5 port.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;
/// Tor control port.
pub const DEFAULT_CONTROL_PORT: u16 = 9051;
/// Hidden-service poll loop sleep.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

const APP_DIR: &str = "onionlink";

/// Errors loading or saving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No config or data directory could be determined")]
    NoConfigDir,

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Everything a node needs to listen, dial and publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Contact-request server port, local and onion.
    pub request_port: u16,

    /// Contact-response server port, local and onion.
    pub response_port: u16,

    /// Message server port, local and onion.
    pub message_port: u16,

    /// Address the servers bind to.
    pub bind_host: IpAddr,

    /// Tor SOCKS5 proxy used by clients.
    pub socks_proxy: SocketAddr,

    /// Tor control port on localhost.
    pub control_port: u16,

    pub control_auth: ControlAuth,

    /// Keep onion addresses across restarts.
    pub persistent_onions: bool,

    /// Directory for `<endpoint>.key` files. Defaults under the data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_dir: Option<PathBuf>,

    /// Issued request nonces. Defaults under the data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce_file: Option<PathBuf>,

    pub poll_interval_ms: u64,

    /// Give up on a peer's reply after this long. Unset waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_timeout_secs: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            request_port: DEFAULT_REQUEST_PORT,
            response_port: DEFAULT_RESPONSE_PORT,
            message_port: DEFAULT_MESSAGE_PORT,
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            socks_proxy: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_SOCKS_PORT),
            control_port: DEFAULT_CONTROL_PORT,
            control_auth: ControlAuth::Null,
            persistent_onions: false,
            key_dir: None,
            nonce_file: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            reply_timeout_secs: None,
        }
    }
}

impl NodeConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write to `path` as pretty TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// `<config_dir>/onionlink/config.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .map(|dir| dir.join(APP_DIR).join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ports = [self.request_port, self.response_port, self.message_port];
        if ports.contains(&0) {
            return Err(ConfigError::Invalid("server ports must be non-zero".into()));
        }
        if ports[0] == ports[1] || ports[1] == ports[2] || ports[0] == ports[2] {
            return Err(ConfigError::Invalid("server ports must be distinct".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.reply_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "reply_timeout_secs must be positive; omit it to wait forever".into(),
            ));
        }
        Ok(())
    }

    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.control_port)
    }

    pub fn bind_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind_host, port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_secs.map(Duration::from_secs)
    }

    /// Configured key directory, or `<data_dir>/onionlink/onion_keys`.
    pub fn key_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.key_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("onion_keys")),
        }
    }

    /// Configured nonce file, or `<data_dir>/onionlink/request_nonces.json`.
    pub fn nonce_file(&self) -> Result<PathBuf, ConfigError> {
        match &self.nonce_file {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("request_nonces.json")),
        }
    }
}

fn data_dir() -> Result<PathBuf, ConfigError> {
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/share")))
        .map(|dir| dir.join(APP_DIR))
        .ok_or(ConfigError::NoConfigDir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = NodeConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.control_addr().port(), 9051);
        assert_eq!(config.reply_timeout(), None);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "message_port = 6002\n\
             persistent_onions = true\n\
             control_auth = { cookie = \"/run/tor/control.authcookie\" }\n",
        )
        .unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.message_port, 6002);
        assert_eq!(config.request_port, DEFAULT_REQUEST_PORT);
        assert!(config.persistent_onions);
        assert_eq!(
            config.control_auth,
            ControlAuth::Cookie(PathBuf::from("/run/tor/control.authcookie"))
        );
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = NodeConfig {
            bind_host: "0.0.0.0".parse().unwrap(),
            control_auth: ControlAuth::Password("hunter2".into()),
            key_dir: Some(dir.path().join("keys")),
            reply_timeout_secs: Some(30),
            ..NodeConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.key_dir().unwrap(), dir.path().join("keys"));
        assert_eq!(loaded.reply_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_duplicate_ports_rejected() {
        let config = NodeConfig {
            response_port: DEFAULT_REQUEST_PORT,
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "reply_timeout_secs = 0\n").unwrap();
        assert!(matches!(
            NodeConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_toml_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "request_port = \"many\"\n").unwrap();
        assert!(matches!(
            NodeConfig::load(&path),
            Err(ConfigError::TomlParse(_))
        ));
    }
}

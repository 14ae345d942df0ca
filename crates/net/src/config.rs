//! Server and client configuration
//!
//! Loaded from an optional TOML file with `[server]` and `[client]` tables.
//! Every key has a default, so an empty or missing file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::DEFAULT_ADDR;

/// File name looked up in the platform config directory
pub const CONFIG_FILE: &str = "tcpchat.toml";

/// Relay server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on (`host:port`)
    pub bind: String,
    /// Frames queued per connection before broadcasts to it are dropped
    pub outbound_queue: usize,
    /// Longest a single socket write may take before the peer is dropped
    pub write_timeout_ms: u64,
    /// Largest accepted payload in bytes
    pub max_frame_size: usize,
    /// Send a direct "Welcome <addr>" frame to each new connection
    pub greet_new_peers: bool,
    /// How long shutdown waits for connection tasks before aborting them
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_ADDR.to_string(),
            outbound_queue: 256,
            write_timeout_ms: 5_000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            greet_new_peers: false,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl ServerConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.bind.trim().is_empty() {
            return Err(Error::Config("server.bind must not be empty".into()));
        }
        if self.outbound_queue == 0 {
            return Err(Error::Config("server.outbound_queue must be at least 1".into()));
        }
        if self.max_frame_size == 0 {
            return Err(Error::Config("server.max_frame_size must be at least 1".into()));
        }
        if self.write_timeout_ms == 0 {
            return Err(Error::Config("server.write_timeout_ms must be at least 1".into()));
        }
        Ok(())
    }
}

/// Terminal client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server to connect to (`host:port`)
    pub server: String,
    /// Largest accepted payload in bytes
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_ADDR.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml(s: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(s).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        config.server.validate()?;
        Ok(config)
    }

    /// Load from an explicit path; the file must exist
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load from the platform config directory, falling back to defaults
    /// when no file is present there
    pub fn load_default() -> Result<Self> {
        match default_path() {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "Loading config");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}

/// `<config_dir>/tcpchat.toml` for the current platform
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("io", "rustedskyline", "tcpchat")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_document_is_default() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.bind, "localhost:9090");
        assert!(!config.server.greet_new_peers);
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_toml(
            r#"
[server]
bind = "0.0.0.0:7000"
greet_new_peers = true

[client]
server = "chat.example:7000"
"#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:7000");
        assert!(config.server.greet_new_peers);
        assert_eq!(config.server.outbound_queue, 256);
        assert_eq!(config.client.server, "chat.example:7000");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Config::from_toml("[server]\noutbound_queue = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[server]\nbind = 42"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        fs::write(&path, "[server]\nwrite_timeout_ms = 250\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.write_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let result = Config::load(&temp.path().join("absent.toml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

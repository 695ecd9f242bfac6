// Configuration for the tandem CLI
//
// Stored as JSON in the platform config directory:
// - Linux: ~/.config/tandem/config.json
// - macOS: ~/Library/Application Support/tandem/config.json
// - Windows: %APPDATA%\tandem\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tandem_core::SessionConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings handed to every chat session
    pub session: SessionConfig,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("tandem");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn set_relay(&mut self, url: &str) -> Result<()> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            anyhow::bail!("Relay URL must start with ws:// or wss://: {}", url);
        }
        self.session.signaling.relay_url = url.to_string();
        Ok(())
    }

    pub fn set_directory(&mut self, url: &str) -> Result<()> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("Directory URL must start with http:// or https://: {}", url);
        }
        self.session.directory.base_url = url.trim_end_matches('/').to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_first_load_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_changes_survive_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set_relay("wss://relay.example/ws").unwrap();
        config.set_directory("https://relay.example/api/").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.session.signaling.relay_url, "wss://relay.example/ws");
        assert_eq!(reloaded.session.directory.base_url, "https://relay.example/api");
        assert_eq!(
            reloaded.session.signaling.max_reconnect_attempts,
            config.session.signaling.max_reconnect_attempts
        );
    }

    #[test]
    fn test_rejects_wrong_scheme() {
        let mut config = Config::default();
        assert!(config.set_relay("http://relay.example").is_err());
        assert!(config.set_directory("ws://relay.example").is_err());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"session": {"router": {"direct_send_timeout_ms": 250}}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.session.router.direct_send_timeout_ms, 250);
        assert_eq!(config.session.router.health_interval_ms, 5_000);
    }
}

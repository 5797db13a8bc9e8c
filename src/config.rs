//! Configuration
//!
//! Loaded from a TOML file; every field has a default so an empty file is
//! valid. A `.env` file and the `TABCAST_URL` / `TABCAST_TOKEN` variables
//! override the channel settings, which keeps tokens out of config files.
//!
//! ```toml
//! namespace = "news"
//! store_dir = "/tmp/tabcast"
//!
//! [channel]
//! url = "https://events.example.com"
//! transports = ["websocket", "polling"]
//!
//! [election]
//! heartbeat_interval = 2000
//! check_interval = 5000
//! stale_after = 5000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::channel::ChannelOptions;
use crate::election::ElectionTimings;
use crate::error::ConfigError;
use crate::logging::LoggingConfig;

pub const URL_ENV: &str = "TABCAST_URL";
pub const TOKEN_ENV: &str = "TABCAST_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Prefix of every shared store key
    pub namespace: String,

    /// Directory of the shared file store. Defaults to `tabcast` under the
    /// system temp dir.
    pub store_dir: Option<PathBuf>,

    pub channel: ChannelOptions,
    pub election: ElectionTimings,
    pub logging: LoggingConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            namespace: "tabcast".to_string(),
            store_dir: None,
            channel: ChannelOptions::default(),
            election: ElectionTimings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Read, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Pick up `TABCAST_URL` and `TABCAST_TOKEN`, reading `.env` first if
    /// present.
    pub fn apply_env(&mut self) {
        let _ = dotenvy::dotenv();
        self.apply_overrides(std::env::var(URL_ENV).ok(), std::env::var(TOKEN_ENV).ok());
    }

    pub fn apply_overrides(&mut self, url: Option<String>, token: Option<String>) {
        if let Some(url) = url.filter(|u| !u.is_empty()) {
            self.channel.url = url;
        }
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            self.channel.token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::Invalid("namespace must not be empty".into()));
        }
        if self.channel.transports.is_empty() {
            return Err(ConfigError::Invalid(
                "channel.transports must list at least one transport".into(),
            ));
        }
        url::Url::parse(&self.channel.url)
            .map_err(|e| ConfigError::Invalid(format!("channel.url {:?}: {e}", self.channel.url)))?;
        self.election.validate()
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("tabcast"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Transport;
    use std::time::Duration;

    #[test]
    fn empty_file_gives_defaults() {
        let config = RelayConfig::from_toml_str("").unwrap();
        assert_eq!(config, RelayConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_all_sections() {
        let config = RelayConfig::from_toml_str(
            r#"
            namespace = "news"
            store_dir = "/var/tmp/news"

            [channel]
            url = "https://events.example.com"
            transports = ["polling"]

            [channel.retry]
            max_attempts = 5

            [election]
            heartbeat_interval = 1000
            check_interval = 3000
            stale_after = 4000

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.namespace, "news");
        assert_eq!(config.store_dir(), PathBuf::from("/var/tmp/news"));
        assert_eq!(config.channel.transports, vec![Transport::Polling]);
        assert_eq!(config.channel.retry.max_attempts, 5);
        assert_eq!(config.election.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.election.stale_after, Duration::from_secs(4));
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_replace_channel_settings() {
        let mut config = RelayConfig::default();
        config.apply_overrides(Some("https://other".into()), Some("secret".into()));
        assert_eq!(config.channel.url, "https://other");
        assert_eq!(config.channel.token.as_deref(), Some("secret"));

        config.apply_overrides(Some(String::new()), None);
        assert_eq!(config.channel.url, "https://other");
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = RelayConfig::default();
        config.namespace.clear();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.channel.transports.clear();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.channel.url = "no scheme here".into();
        assert!(config.validate().is_err());

        assert!(RelayConfig::from_toml_str("namespace = 3").is_err());
    }
}

//! Application configuration management.
//!
//! This module handles loading and saving the session-layer configuration:
//! identity server URL, broadcast channel name, token lifetime, optional
//! refresh timeout, well-known routes and the credential store backend.
//!
//! Configuration is stored at `~/.config/tokenward/config.json`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::auth::credentials::{max_age_from_days, DEFAULT_MAX_AGE_DAYS};
use crate::auth::{FileTokenStore, KeyringTokenStore, TokenStore};
use crate::broadcast::DEFAULT_CHANNEL_NAME;
use crate::routes::Routes;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "tokenward";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Identity server used when nothing else is configured
pub const DEFAULT_BASE_URL: &str = "http://localhost:3333/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Keyring,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub channel_name: String,
    pub credential_max_age_days: i64,
    /// Unset means queued callers wait for the refresh exchange indefinitely
    pub refresh_timeout_secs: Option<u64>,
    pub routes: Routes,
    pub store: StoreBackend,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            credential_max_age_days: DEFAULT_MAX_AGE_DAYS,
            refresh_timeout_secs: None,
            routes: Routes::default(),
            store: StoreBackend::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let config: Self = serde_json::from_str(&contents)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings that would break the token store.
    pub fn validate(&self) -> Result<()> {
        max_age_from_days(self.credential_max_age_days)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn refresh_timeout(&self) -> Option<Duration> {
        self.refresh_timeout_secs.map(Duration::from_secs)
    }

    /// Build the configured token store backend.
    pub fn token_store(&self) -> Result<Arc<dyn TokenStore>> {
        Ok(match self.store {
            StoreBackend::Keyring => Arc::new(KeyringTokenStore::new(self.credential_max_age_days)?),
            StoreBackend::File => Arc::new(FileTokenStore::new(
                self.cache_dir()?,
                self.credential_max_age_days,
            )?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.base_url, "http://localhost:3333/");
        assert_eq!(config.channel_name, "auth");
        assert_eq!(config.credential_max_age_days, 30);
        assert_eq!(config.refresh_timeout(), None);
        assert_eq!(config.routes.entry, "/");
        assert_eq!(config.routes.landing, "/dashboard");
        assert_eq!(config.routes.error, "/error");
        assert_eq!(config.store, StoreBackend::Keyring);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"base_url":"https://id.example.com","refresh_timeout_secs":5,"store":"file","routes":{"landing":"/home"}}"#,
        )
        .unwrap();
        assert_eq!(config.base_url, "https://id.example.com");
        assert_eq!(config.refresh_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.store, StoreBackend::File);
        assert_eq!(config.routes.landing, "/home");
        assert_eq!(config.routes.entry, "/");
        assert_eq!(config.channel_name, "auth");
    }

    #[test]
    fn test_out_of_range_max_age_is_rejected() {
        assert!(Config::default().validate().is_ok());
        for days in [0, -1, 100_000_000, i64::MAX] {
            let config = Config {
                credential_max_age_days: days,
                store: StoreBackend::Keyring,
                ..Config::default()
            };
            assert!(config.validate().is_err(), "accepted {} days", days);
            assert!(config.token_store().is_err());
        }
    }
}

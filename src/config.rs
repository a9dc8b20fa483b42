//! Configuration for the monitor, loaded once at startup.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Public Matrix portal page listing the monitored properties
pub const DEFAULT_PORTAL_URL: &str =
    "https://matrix.centris.ca/Matrix/Public/Portal.aspx?ID=0-3319143035-10&eml=Y2JlYXVkZXRAcmF5aGFydmV5LmNh&L=2";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub monitor: MonitorConfig,
    pub api: ApiConfig,
    pub browser: BrowserConfig,
}

/// Settings for discovery, filtering and state files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub portal_url: String,
    /// Seen-set file (listing id -> first processed timestamp)
    pub seen_file: PathBuf,
    /// Rolling history of cycle stats
    pub stats_file: PathBuf,
    pub stats_history_len: usize,
    /// Where to keep a local copy of every extracted record, if anywhere
    pub archive_dir: Option<PathBuf>,
    pub interval_minutes: u64,
    pub listing_delay_secs: u64,
    /// None (or 0) means every new listing is processed in the cycle
    pub max_listings_per_cycle: Option<usize>,
    /// Listings submitted before this date are skipped
    pub min_submitted_date: Option<NaiveDate>,
    /// Ignore photos when deciding whether a record is complete
    pub skip_photos: bool,
    pub restart_backoff_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            portal_url: DEFAULT_PORTAL_URL.to_string(),
            seen_file: PathBuf::from("scraped_properties.json"),
            stats_file: PathBuf::from("monitoring_stats.json"),
            stats_history_len: 100,
            archive_dir: None,
            interval_minutes: 60,
            listing_delay_secs: 5,
            max_listings_per_cycle: None,
            min_submitted_date: None,
            skip_photos: false,
            restart_backoff_secs: 60,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    pub fn listing_delay(&self) -> Duration {
        Duration::from_secs(self.listing_delay_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_secs)
    }
}

/// Settings for the downstream HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// No endpoint means records are only kept locally
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    pub headers: BTreeMap<String, String>,
    /// String fields the API rejects as null
    pub normalize_fields: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("User-Agent".to_string(), "CentrisMonitor/1.0".to_string());

        Self {
            endpoint: None,
            timeout_secs: 30,
            headers,
            normalize_fields: vec![
                "quartier".to_string(),
                "annee_construction".to_string(),
                "statut".to_string(),
            ],
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Settings for the headless Chrome session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub window_size: (u32, u32),
    pub page_load_wait_secs: u64,
    pub max_scrolls: usize,
    pub panel_wait_secs: u64,
    /// Page snapshots are written here when discovery finds nothing
    pub debug_dir: Option<PathBuf>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            window_size: (1920, 1080),
            page_load_wait_secs: 5,
            max_scrolls: 10,
            panel_wait_secs: 3,
            debug_dir: None,
        }
    }
}

impl Config {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.portal_url.trim().is_empty() {
            return Err(ConfigError::Invalid("monitor.portal_url is empty".to_string()));
        }
        if self.monitor.interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "monitor.interval_minutes must be at least 1".to_string(),
            ));
        }
        if self.monitor.stats_history_len == 0 {
            return Err(ConfigError::Invalid(
                "monitor.stats_history_len must be at least 1".to_string(),
            ));
        }
        if let Some(endpoint) = &self.api.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "api.endpoint is not an http(s) URL: {}",
                    endpoint
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.monitor.interval(), Duration::from_secs(3600));
        assert_eq!(config.monitor.listing_delay(), Duration::from_secs(5));
        assert_eq!(config.monitor.stats_history_len, 100);
        assert_eq!(config.api.timeout(), Duration::from_secs(30));
        assert_eq!(config.api.headers.get("User-Agent").map(String::as_str), Some("CentrisMonitor/1.0"));
        assert!(config.api.endpoint.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [monitor]
            interval_minutes = 15
            min_submitted_date = "2025-12-20"
            max_listings_per_cycle = 3

            [api]
            endpoint = "https://api.example.com/robot/api/scraping"
            "#,
        )
        .unwrap();

        assert_eq!(config.monitor.interval_minutes, 15);
        assert_eq!(
            config.monitor.min_submitted_date,
            NaiveDate::from_ymd_opt(2025, 12, 20)
        );
        assert_eq!(config.monitor.max_listings_per_cycle, Some(3));
        assert_eq!(config.monitor.seen_file, PathBuf::from("scraped_properties.json"));
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.api.normalize_fields.len(), 3);
        assert!(config.browser.headless);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.monitor.interval_minutes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.api.endpoint = Some("ftp://nope".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(Config::load(None).is_ok());
    }
}

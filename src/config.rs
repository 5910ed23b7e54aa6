//! Configuration Module
//!
//! Backend endpoints and local paths, read from the environment.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PROJECT_ID: &str = "wp-veiculos";
const DEFAULT_STORAGE_BUCKET: &str = "wp-veiculos.firebasestorage.app";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub const ENV_API_KEY: &str = "WPV_FIREBASE_API_KEY";
pub const ENV_PROJECT_ID: &str = "WPV_FIREBASE_PROJECT_ID";
pub const ENV_STORAGE_BUCKET: &str = "WPV_FIREBASE_STORAGE_BUCKET";
pub const ENV_TIMEOUT_SECS: &str = "WPV_HTTP_TIMEOUT_SECS";
pub const ENV_DATA_DIR: &str = "WPV_DATA_DIR";

/// Runtime configuration for the hosted backend and local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Web API key of the Firebase project
    pub api_key: String,
    pub project_id: String,
    pub storage_bucket: String,
    pub request_timeout: Duration,
    /// Root for the session mirror and log files
    pub data_dir: PathBuf,
}

impl AppConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = read(ENV_API_KEY).ok_or(ConfigError::Missing(ENV_API_KEY))?;

        let request_timeout = match read(ENV_TIMEOUT_SECS) {
            Some(raw) => {
                let secs: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
                    key: ENV_TIMEOUT_SECS,
                    value: raw.clone(),
                })?;
                if secs == 0 {
                    return Err(ConfigError::Invalid { key: ENV_TIMEOUT_SECS, value: raw });
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        let data_dir = read(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        Ok(Self {
            api_key,
            project_id: read(ENV_PROJECT_ID).unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string()),
            storage_bucket: read(ENV_STORAGE_BUCKET)
                .unwrap_or_else(|| DEFAULT_STORAGE_BUCKET.to_string()),
            request_timeout,
            data_dir,
        })
    }

    /// Directory for rolling log files
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("WPVeiculos")
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

//! Configuration management for a store instance.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default period of the auto-delete sweep.
pub const DEFAULT_EXPIRY_INTERVAL: Duration = Duration::from_secs(60);
/// Number of entries between two progress callbacks during a sync import.
pub const DEFAULT_PROGRESS_INTERVAL: usize = 20;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the SQLite file; created if missing.
    pub path: PathBuf,
    /// Close the file after this long without work. `None` keeps it open.
    pub auto_close_after: Option<Duration>,
    /// Period of the auto-delete sweep. `None` disables the background sweep.
    pub expiry_interval: Option<Duration>,
    /// Log every statement at debug level.
    pub log_sql: bool,
    /// Entries between two progress callbacks during a sync import.
    pub progress_interval: usize,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            auto_close_after: None,
            expiry_interval: Some(DEFAULT_EXPIRY_INTERVAL),
            log_sql: false,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_auto_close(mut self, after: Duration) -> Self {
        self.auto_close_after = Some(after);
        self
    }

    pub fn with_expiry_interval(mut self, interval: Option<Duration>) -> Self {
        self.expiry_interval = interval;
        self
    }

    pub fn with_sql_logging(mut self, enabled: bool) -> Self {
        self.log_sql = enabled;
        self
    }

    pub fn with_progress_interval(mut self, entries: usize) -> Self {
        self.progress_interval = entries.max(1);
        self
    }

    /// Load configuration from environment variables (and a `.env` file).
    ///
    /// - `STOW_DB_PATH` (required)
    /// - `STOW_AUTO_CLOSE_SECS` (optional, 0 keeps the file open)
    /// - `STOW_EXPIRY_INTERVAL_SECS` (optional, 0 disables the sweep)
    /// - `STOW_LOG_SQL` (optional, `1`/`true`)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let path = env::var("STOW_DB_PATH").map_err(|_| ConfigError::MissingPath)?;
        let mut config = Self::new(path);

        if let Some(secs) = seconds_var("STOW_AUTO_CLOSE_SECS")? {
            config.auto_close_after = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(secs) = seconds_var("STOW_EXPIRY_INTERVAL_SECS")? {
            config.expiry_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Ok(value) = env::var("STOW_LOG_SQL") {
            config.log_sql = matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }
}

fn seconds_var(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidDuration(name)),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("STOW_DB_PATH environment variable is required")]
    MissingPath,

    #[error("Invalid {0} value, expected whole seconds")]
    InvalidDuration(&'static str),
}

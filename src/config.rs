/// Configuration for the storage backends
///
/// Local backends are configured programmatically through [`StorageConfig`].
/// The remote PostgreSQL backend reads its settings from `DB_*` environment
/// variables, optionally loaded from a `.env` file.
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::StorageError;

/// Linear backoff used by `execute_with_retry`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts before giving up
    pub max_retries: u32,
    /// Delay after the first failed attempt; later delays grow linearly
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Which local backend the orchestrator opens
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendChoice {
    #[default]
    DocumentStore,
    Sqlite,
}

/// Settings for the local backends and the services built on them
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Directory holding the collection files or `focusbook.db`
    pub data_dir: PathBuf,
    pub backend: BackendChoice,
    pub retry: RetryPolicy,
    /// Attempts the document store makes to open its files
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    /// Replacement for the bundled SQLite schema file
    pub sqlite_schema: Option<PathBuf>,
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            backend: BackendChoice::default(),
            retry: RetryPolicy::default(),
            connect_attempts: 3,
            connect_delay: Duration::from_millis(1000),
            sqlite_schema: None,
        }
    }

    pub fn with_backend(mut self, backend: BackendChoice) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_sqlite_schema(mut self, path: impl Into<PathBuf>) -> Self {
        self.sqlite_schema = Some(path.into());
        self
    }

    /// Path of the SQLite database file inside the data directory
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("focusbook.db")
    }

    /// Default data directory with a fallback chain
    ///
    /// Tries the home directory first, then the platform data and config
    /// directories and the working directory, keeping the first one that can
    /// be written to. Falls back to a temporary directory.
    pub fn default_data_dir() -> Result<PathBuf, std::io::Error> {
        let candidates = [
            dirs::home_dir().map(|p| p.join(".focusbook")),
            dirs::data_dir().map(|p| p.join("focusbook")),
            dirs::config_dir().map(|p| p.join("focusbook")),
            std::env::current_dir().ok().map(|p| p.join(".focusbook")),
        ];

        for candidate in candidates.iter().flatten() {
            if std::fs::create_dir_all(candidate).is_ok() {
                let probe = candidate.join(".test_write");
                if std::fs::write(&probe, "test").is_ok() {
                    let _ = std::fs::remove_file(&probe);
                    return Ok(candidate.clone());
                }
            }
        }

        let fallback = std::env::temp_dir().join("focusbook");
        std::fs::create_dir_all(&fallback)?;
        tracing::warn!("Using temporary directory for data: {}", fallback.display());
        Ok(fallback)
    }
}

/// Connection settings for the remote PostgreSQL backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub pool_size: usize,
    pub connect_timeout: Duration,
    /// Connect attempts after the first failure
    pub max_connect_retries: u32,
    /// First backoff delay; doubles after every failed attempt
    pub base_delay: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "focusbook".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            pool_size: 10,
            connect_timeout: Duration::from_millis(5000),
            max_connect_retries: 5,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl PostgresConfig {
    /// Read `DB_HOST`, `DB_PORT`, `DB_NAME`, `DB_USER`, `DB_PASSWORD`,
    /// `DB_POOL_SIZE` and `DB_CONNECT_TIMEOUT_MS`, after loading `.env` if present
    pub fn from_env() -> Result<Self, StorageError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StorageError> {
        let defaults = Self::default();

        let port = match lookup("DB_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| StorageError::Connection(format!("Invalid DB_PORT: {}", raw)))?,
            None => defaults.port,
        };
        let pool_size = match lookup("DB_POOL_SIZE") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|size| *size > 0)
                .ok_or_else(|| StorageError::Connection(format!("Invalid DB_POOL_SIZE: {}", raw)))?,
            None => defaults.pool_size,
        };
        let connect_timeout = match lookup("DB_CONNECT_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(raw.parse::<u64>().map_err(|_| {
                StorageError::Connection(format!("Invalid DB_CONNECT_TIMEOUT_MS: {}", raw))
            })?),
            None => defaults.connect_timeout,
        };

        Ok(Self {
            host: lookup("DB_HOST").unwrap_or(defaults.host),
            port,
            dbname: lookup("DB_NAME").unwrap_or(defaults.dbname),
            user: lookup("DB_USER").unwrap_or(defaults.user),
            password: lookup("DB_PASSWORD").unwrap_or(defaults.password),
            pool_size,
            connect_timeout,
            ..defaults
        })
    }

    /// Backoff before retry number `retry` (1-based): base, 2×base, 4×base...
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(retry.saturating_sub(1))
    }

    /// `host:port/dbname`, safe to log
    pub fn location(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.dbname)
    }
}

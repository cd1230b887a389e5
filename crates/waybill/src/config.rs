//! Environment-sourced configuration.
//!
//! The configuration is built exactly once at startup and passed to each
//! component by reference; no component reads ambient global state. A
//! `ConfigError` here halts the process before any job runs.

use std::env;
use std::path::PathBuf;

use crate::error::ConfigError;

const DEFAULT_BASE_DIR: &str = "/var/lib/waybill";
const DEFAULT_TARGET_TABLE: &str = "tracking_data";
const DEFAULT_UNIQUE_KEY: &str = "hawb";
const DEFAULT_COLUMNS: &str = "hawb,carrier,status";
const DEFAULT_STAGING_PREFIX: &str = "staging";

/// Database-facing settings: where the store lives and how the target
/// table is shaped.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path of the SQLite database holding ledger, dedup index and target table.
    pub path: PathBuf,
    /// Prefix for per-attempt staging tables.
    pub staging_prefix: String,
    /// Name of the table the upsert targets.
    pub target_table: String,
    /// Column whose value identifies a target-table row across files and time.
    pub unique_key: String,
    /// The full expected column list (lower-case). All of these must be
    /// present in an incoming sheet; unknown sheet columns are ignored.
    pub columns: Vec<String>,
}

/// Filesystem areas for payloads in flight and at rest.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub pending_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub errors_dir: PathBuf,
    /// Processed files older than this many days are swept.
    pub retention_days: u32,
}

/// Queue scheduling and retry settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Upper bound on jobs in `processing` at once. 1 (the default) gives
    /// strict enqueue-order execution.
    pub max_workers: usize,
    /// Retry ceiling for transient failures.
    pub max_retries: u32,
    /// Seconds between drain cycles in daemon mode.
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
}

impl Config {
    /// Loads and validates the configuration from `WAYBILL_*` environment
    /// variables. Defaults match the original deployment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_dir = PathBuf::from(var_or("WAYBILL_BASE_DIR", DEFAULT_BASE_DIR));

        let db_path = match env::var("WAYBILL_DB_PATH") {
            Ok(p) => PathBuf::from(p),
            Err(_) => base_dir.join("waybill.db"),
        };

        let columns_raw = var_or("WAYBILL_COLUMNS", DEFAULT_COLUMNS);
        let columns: Vec<String> = columns_raw
            .split(',')
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        let database = DatabaseConfig {
            path: db_path,
            staging_prefix: var_or("WAYBILL_STAGING_PREFIX", DEFAULT_STAGING_PREFIX),
            target_table: var_or("WAYBILL_TARGET_TABLE", DEFAULT_TARGET_TABLE),
            unique_key: var_or("WAYBILL_UNIQUE_KEY", DEFAULT_UNIQUE_KEY).to_ascii_lowercase(),
            columns,
        };

        let storage = StorageConfig {
            pending_dir: base_dir.join("pending"),
            processed_dir: base_dir.join("processed"),
            errors_dir: base_dir.join("errors"),
            retention_days: parse_var("WAYBILL_RETENTION_DAYS", 30)?,
        };

        let queue = QueueConfig {
            max_workers: parse_var("WAYBILL_MAX_WORKERS", 1)?,
            max_retries: parse_var("WAYBILL_MAX_RETRIES", 3)?,
            poll_interval_secs: parse_var("WAYBILL_POLL_INTERVAL_SECS", 3600)?,
        };

        let config = Config {
            database,
            storage,
            queue,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants that would otherwise surface mid-job.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("WAYBILL_TARGET_TABLE", &self.database.target_table),
            ("WAYBILL_UNIQUE_KEY", &self.database.unique_key),
            ("WAYBILL_STAGING_PREFIX", &self.database.staging_prefix),
        ] {
            if !is_valid_identifier(value) {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: format!("'{}' is not a valid SQL identifier", value),
                });
            }
        }

        if self.database.columns.is_empty() {
            return Err(ConfigError::Invalid {
                key: "WAYBILL_COLUMNS".to_string(),
                reason: "column list is empty".to_string(),
            });
        }
        for column in &self.database.columns {
            if !is_valid_identifier(column) {
                return Err(ConfigError::Invalid {
                    key: "WAYBILL_COLUMNS".to_string(),
                    reason: format!("'{}' is not a valid SQL identifier", column),
                });
            }
        }
        if !self.database.columns.contains(&self.database.unique_key) {
            return Err(ConfigError::Invalid {
                key: "WAYBILL_UNIQUE_KEY".to_string(),
                reason: format!(
                    "unique key '{}' is not in the configured column list",
                    self.database.unique_key
                ),
            });
        }

        if self.queue.max_workers == 0 {
            return Err(ConfigError::Invalid {
                key: "WAYBILL_MAX_WORKERS".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Creates the pending/processed/errors areas if they do not exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        for dir in [
            &self.storage.pending_dir,
            &self.storage.processed_dir,
            &self.storage.errors_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::CreateDirectory {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            reason: format!("{}", e),
        }),
        Err(_) => Ok(default),
    }
}

/// Identifiers interpolated into SQL are restricted to alphanumeric and
/// underscore, and must not start with a digit.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            database: DatabaseConfig {
                path: PathBuf::from(":memory:"),
                staging_prefix: "staging".to_string(),
                target_table: "tracking_data".to_string(),
                unique_key: "hawb".to_string(),
                columns: vec![
                    "hawb".to_string(),
                    "carrier".to_string(),
                    "status".to_string(),
                ],
            },
            storage: StorageConfig {
                pending_dir: PathBuf::from("/tmp/waybill/pending"),
                processed_dir: PathBuf::from("/tmp/waybill/processed"),
                errors_dir: PathBuf::from("/tmp/waybill/errors"),
                retention_days: 30,
            },
            queue: QueueConfig {
                max_workers: 1,
                max_retries: 3,
                poll_interval_secs: 3600,
            },
        }
    }

    #[test]
    fn test_valid_config_passes() {
        test_config().validate().unwrap();
    }

    #[test]
    fn test_unique_key_must_be_a_column() {
        let mut config = test_config();
        config.database.unique_key = "awb".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_sql_injection_in_table_name() {
        let mut config = test_config();
        config.database.target_table = "tracking_data; DROP TABLE jobs".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = test_config();
        config.queue.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("tracking_data"));
        assert!(is_valid_identifier("hawb"));
        assert!(is_valid_identifier("staging_2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("drop table"));
        assert!(!is_valid_identifier("a-b"));
    }

    #[test]
    fn test_rejects_empty_column_list() {
        let mut config = test_config();
        config.database.columns.clear();
        assert!(config.validate().is_err());
    }
}

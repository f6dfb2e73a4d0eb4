//! Configuration for the conversation history.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::history::core::errors::{HistoryError, HistoryResult};

/// Environment variable overriding [`StorageConfig::sqlite_path`].
pub const ENV_DB_PATH: &str = "CHAT_HISTORY_DB";

/// Environment variable overriding [`PersistenceConfig::debounce_ms`].
pub const ENV_DEBOUNCE_MS: &str = "CHAT_HISTORY_DEBOUNCE_MS";

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Write-back persistence settings.
    pub persistence: PersistenceConfig,
    /// Storage settings.
    pub storage: StorageConfig,
}

impl HistoryConfig {
    /// Build the default configuration with environment overrides applied.
    ///
    /// # Errors
    /// Returns an error if an override cannot be parsed or the result is invalid.
    pub fn from_env() -> HistoryResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            config.storage.sqlite_path = PathBuf::from(path);
        }

        if let Ok(raw) = std::env::var(ENV_DEBOUNCE_MS) {
            config.persistence.debounce_ms = raw.trim().parse().map_err(|_| {
                HistoryError::InvalidConfig(format!("{ENV_DEBOUNCE_MS} must be an integer, got {raw:?}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> HistoryResult<()> {
        if self.persistence.retry_delay_ms == 0 {
            return Err(HistoryError::InvalidConfig(
                "persistence.retry_delay_ms must be > 0".to_string(),
            ));
        }

        self.storage.validate()
    }
}

/// Write-back persistence settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Debounce window in milliseconds, measured from the first pending
    /// mutation. Zero flushes on every mutation.
    pub debounce_ms: u64,
    /// Delay before retrying writes that failed during a flush.
    pub retry_delay_ms: u64,
}

impl PersistenceConfig {
    /// Debounce window as a `Duration`.
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Retry delay as a `Duration`.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 400,
            retry_delay_ms: 5_000,
        }
    }
}

/// Storage configuration for the `SQLite` adapter.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `SQLite` database path.
    pub sqlite_path: PathBuf,
    /// Topic table name.
    pub topics_table: String,
    /// Message pair table name.
    pub pairs_table: String,
    /// Metadata table name.
    pub meta_table: String,
}

impl StorageConfig {
    /// Check that the table names are safe to splice into SQL.
    ///
    /// # Errors
    /// Returns `HistoryError::InvalidConfig` if a name is empty, holds
    /// anything but `[A-Za-z0-9_]`, or is shared by two tables.
    pub fn validate(&self) -> HistoryResult<()> {
        let tables = [&self.topics_table, &self.pairs_table, &self.meta_table];
        for table in tables {
            if table.is_empty() || !table.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
            {
                return Err(HistoryError::InvalidConfig(format!(
                    "table name {table:?} must be non-empty [A-Za-z0-9_]"
                )));
            }
        }
        if tables[0] == tables[1] || tables[0] == tables[2] || tables[1] == tables[2] {
            return Err(HistoryError::InvalidConfig(
                "storage table names must be distinct".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("chat_history.sqlite"),
            topics_table: "topics".to_string(),
            pairs_table: "pairs".to_string(),
            meta_table: "meta".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HistoryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.persistence.debounce(), Duration::from_millis(400));
    }

    #[test]
    fn test_rejects_unsafe_table_name() {
        let mut config = HistoryConfig::default();
        config.storage.pairs_table = "pairs; DROP TABLE topics".to_string();
        assert!(matches!(
            config.validate(),
            Err(HistoryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_storage_config_validates_on_its_own() {
        let mut storage = StorageConfig::default();
        assert!(storage.validate().is_ok());
        storage.topics_table = "topics--".to_string();
        assert!(matches!(
            storage.validate(),
            Err(HistoryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_shared_table_name() {
        let mut config = HistoryConfig::default();
        config.storage.meta_table = "topics".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: HistoryConfig =
            serde_json::from_str(r#"{"persistence":{"debounce_ms":0}}"#).unwrap();
        assert_eq!(config.persistence.debounce_ms, 0);
        assert_eq!(config.persistence.retry_delay_ms, 5_000);
        assert_eq!(config.storage.topics_table, "topics");
    }
}

// crates/alphred-config/src/config.rs
// ============================================================================
// Module: Alphred Configuration Model
// Description: TOML configuration with environment overrides and validation.
// Purpose: Produce a validated store config and execution defaults.
// Dependencies: alphred-store-sqlite, serde, thiserror, toml
// ============================================================================

//! ## Overview
//! The configuration file is optional: every field has a default, and the
//! `ALPHRED_DB_PATH` environment variable overrides the database location.
//! Validation is explicit and fails closed before anything touches the
//! database.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;

use alphred_store_sqlite::SqliteJournalMode;
use alphred_store_sqlite::SqliteStoreConfig;
use alphred_store_sqlite::SqliteSyncMode;
use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Environment variable overriding the database path.
pub const DB_PATH_ENV: &str = "ALPHRED_DB_PATH";
/// Default database path, relative to the process working directory.
pub const DEFAULT_DB_PATH: &str = "./alphred.db";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("config io error: {0}")]
    Io(String),
    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Configuration failed validation.
    #[error("config invalid: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Model
// ============================================================================

/// Database section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Path to the `SQLite` database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteJournalMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: SqliteJournalMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

/// Execution section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Step ceiling for run loops.
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    /// Provider used when a node names none.
    #[serde(default = "default_provider")]
    pub default_provider: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            default_provider: default_provider(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlphredConfig {
    /// Database section.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Execution section.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Returns the default database path.
fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

/// Returns the default busy timeout in milliseconds.
const fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Returns the default run-loop step ceiling.
const fn default_max_steps() -> u64 {
    1_000
}

/// Returns the default provider name.
fn default_provider() -> String {
    "scripted".to_string()
}

// ============================================================================
// SECTION: Loading
// ============================================================================

impl AlphredConfig {
    /// Loads configuration from an optional TOML file, then applies
    /// environment overrides and validates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on unreadable files, parse failures, or
    /// invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
                toml::from_str(&text).map_err(|err| ConfigError::Parse(err.to_string()))?
            }
            None => Self::default(),
        };
        if let Ok(override_path) = std::env::var(DB_PATH_ENV)
            && !override_path.is_empty()
        {
            config.database.path = PathBuf::from(override_path);
        }
        config.validate()?;
        Ok(config)
    }

    /// Validates field ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] on out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.busy_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "database.busy_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.execution.max_steps == 0 {
            return Err(ConfigError::Invalid(
                "execution.max_steps must be greater than zero".to_string(),
            ));
        }
        if self.execution.default_provider.is_empty() {
            return Err(ConfigError::Invalid(
                "execution.default_provider must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the store config, resolving a relative database path against
    /// `base_dir`.
    #[must_use]
    pub fn store_config(&self, base_dir: &Path) -> SqliteStoreConfig {
        let path = if self.database.path.is_absolute() {
            self.database.path.clone()
        } else {
            base_dir.join(&self.database.path)
        };
        SqliteStoreConfig {
            path,
            busy_timeout_ms: self.database.busy_timeout_ms,
            journal_mode: self.database.journal_mode,
            sync_mode: self.database.sync_mode,
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        reason = "Test-only panic-based assertions are permitted."
    )]

    use std::path::Path;
    use std::path::PathBuf;

    use super::AlphredConfig;
    use super::ConfigError;

    /// Defaults apply when no file is given.
    #[test]
    fn defaults_without_file() {
        let config = AlphredConfig::default();
        config.validate().unwrap();
        assert_eq!(config.database.path, PathBuf::from("./alphred.db"));
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert_eq!(config.execution.max_steps, 1_000);
        assert_eq!(config.execution.default_provider, "scripted");
    }

    /// TOML sections parse with partial overrides.
    #[test]
    fn parses_partial_toml() {
        let config: AlphredConfig = toml::from_str(
            r#"
            [database]
            path = "/var/lib/alphred/alphred.db"
            busy_timeout_ms = 250

            [execution]
            max_steps = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/alphred/alphred.db"));
        assert_eq!(config.database.busy_timeout_ms, 250);
        assert_eq!(config.execution.max_steps, 50);
        assert_eq!(config.execution.default_provider, "scripted");
    }

    /// Unknown keys are rejected.
    #[test]
    fn rejects_unknown_keys() {
        let parsed: Result<AlphredConfig, _> = toml::from_str("[database]\nbogus = 1\n");
        assert!(parsed.is_err());
    }

    /// Relative database paths resolve against the base directory.
    #[test]
    fn resolves_relative_database_path() {
        let config = AlphredConfig::default();
        let store = config.store_config(Path::new("/work/project"));
        assert_eq!(store.path, PathBuf::from("/work/project/./alphred.db"));
        assert_eq!(store.busy_timeout_ms, 5_000);
    }

    /// Zero ranges fail validation.
    #[test]
    fn validation_rejects_zero_ranges() {
        let mut config = AlphredConfig::default();
        config.database.busy_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AlphredConfig::default();
        config.execution.max_steps = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}

//! Store configuration via `depot.toml`
//!
//! On first open a commented default `depot.toml` is written into the base
//! directory. To change settings, edit the file and reopen.

use depot_concurrency::ManagerOptions;
use depot_core::{Error, Result};
use depot_storage::{BackendKind, BackendOptions, PostgresParams};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the base directory
pub const CONFIG_FILE_NAME: &str = "depot.toml";

/// Store configuration loaded from `depot.toml`
///
/// # Example
///
/// ```toml
/// backend = "postgres"
/// cache_size = 10000
///
/// [postgres]
/// host = "db.internal"
/// user = "depot"
/// database = "depot"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    /// Storage backend: `"sqlite"` or `"postgres"`
    pub backend: BackendKind,
    /// Maximum number of keys in the value cache, 0 disables it
    pub cache_size: usize,
    /// Refuse write transactions
    pub readonly: bool,
    /// How long `KeyFs::write` waits for the write slot, in milliseconds
    pub write_timeout_ms: u64,
    /// How often serial waits re-check the backend, in milliseconds
    pub notify_recheck_ms: u64,
    /// Connection parameters for the postgres backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresParams>,
}

impl Default for DepotConfig {
    fn default() -> Self {
        DepotConfig {
            backend: BackendKind::Sqlite,
            cache_size: 10_000,
            readonly: false,
            write_timeout_ms: 30_000,
            notify_recheck_ms: 500,
            postgres: None,
        }
    }
}

impl DepotConfig {
    /// Default config file content with comments
    pub fn default_toml() -> &'static str {
        r#"# depot store configuration
#
# Storage backend: "sqlite" (default) or "postgres"
#   "sqlite"   = index in .sqlite, blobs as files in this directory
#   "postgres" = index and blobs in a shared PostgreSQL database
backend = "sqlite"

# Number of keys kept in the in-memory value cache (0 disables it)
cache_size = 10000

# Refuse write transactions
readonly = false

# How long a write waits for the running write transaction, in milliseconds
write_timeout_ms = 30000

# How often serial waits poll the backend for commits made by other
# processes, in milliseconds
notify_recheck_ms = 500

# Connection parameters, used when backend = "postgres"
# [postgres]
# host = "localhost"
# port = 5432
# user = "depot"
# password = "secret"          # optional
# database = "depot"
# unix_socket = "/run/postgresql"  # optional, takes precedence over host
"#
    }

    /// Check values that parse but cannot work
    pub fn validate(&self) -> Result<()> {
        if self.notify_recheck_ms == 0 {
            return Err(Error::Config("notify_recheck_ms must be positive".into()));
        }
        if let Some(pg) = &self.postgres {
            if pg.database.is_empty() || pg.user.is_empty() {
                return Err(Error::Config(
                    "[postgres] needs a non-empty user and database".into(),
                ));
            }
        }
        Ok(())
    }

    /// Read, parse and validate a config file
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read, parsed or
    /// validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: DepotConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to `path`
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Backend selection derived from this config
    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            kind: self.backend,
            readonly: self.readonly,
            postgres: self.postgres.clone(),
        }
    }

    /// Transaction manager settings derived from this config
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            cache_capacity: self.cache_size,
            recheck_interval: self.notify_recheck(),
            readonly: self.readonly,
        }
    }

    /// `write_timeout_ms` as a duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// `notify_recheck_ms` as a duration
    pub fn notify_recheck(&self) -> Duration {
        Duration::from_millis(self.notify_recheck_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_toml_parses_to_default() {
        let config: DepotConfig = toml::from_str(DepotConfig::default_toml()).unwrap();
        assert_eq!(config, DepotConfig::default());
    }

    #[test]
    fn test_write_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        DepotConfig::write_default_if_missing(&path).unwrap();
        let config = DepotConfig::from_file(&path).unwrap();
        assert_eq!(config.backend, BackendKind::Sqlite);
    }

    #[test]
    fn test_write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "cache_size = 5\n").unwrap();
        DepotConfig::write_default_if_missing(&path).unwrap();
        assert_eq!(DepotConfig::from_file(&path).unwrap().cache_size, 5);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "").unwrap();
        assert_eq!(DepotConfig::from_file(&path).unwrap(), DepotConfig::default());
    }

    #[test]
    fn test_postgres_section() {
        let toml_str = r#"
backend = "postgres"

[postgres]
host = "db.internal"
port = 6432
password = "pw"
"#;
        let config: DepotConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend, BackendKind::Postgres);
        let pg = config.postgres.clone().unwrap();
        assert_eq!(pg.host, "db.internal");
        assert_eq!(pg.port, 6432);
        assert_eq!(pg.user, "depot");
        assert_eq!(pg.password.as_deref(), Some("pw"));
        assert_eq!(config.backend_options().kind, BackendKind::Postgres);
    }

    #[test]
    fn test_unknown_backend_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "backend = \"oracle\"\n").unwrap();
        assert!(matches!(DepotConfig::from_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_recheck_rejected() {
        let config = DepotConfig {
            notify_recheck_ms: 0,
            ..DepotConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = DepotConfig {
            readonly: true,
            postgres: Some(PostgresParams::default()),
            ..DepotConfig::default()
        };
        config.write_to_file(&path).unwrap();
        assert_eq!(DepotConfig::from_file(&path).unwrap(), config);
        assert!(config.manager_options().readonly);
    }
}

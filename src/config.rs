/// Store configuration
///
/// Loaded with priority: environment (`SQLSTORE_*`) > config file > defaults.
/// Every field has a default, so an empty source yields a usable store.

use std::path::Path;
use config::{Config, Environment, File};
use serde::Deserialize;
use tracing::debug;
use crate::core::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Prefixes every table reference
    pub database_schema: Option<String>,
    /// Rows per driver round trip while streaming
    pub fetch_size: u32,
    /// Pending rows a buffered insert holds before flushing
    pub batch_insert_size: usize,
    /// Default for returning key columns as attributes
    pub expose_primary_keys: bool,
    /// `schema.table` or `table` holding declared keys
    pub primary_key_metadata_table: Option<String>,
    pub session_startup_sql: Option<String>,
    pub session_close_sql: Option<String>,
    /// Default for the null-guard adapter
    pub two_valued_logic: bool,
    /// Log double closes of cursors
    pub leak_tracing: bool,
    /// Below this many locked rows the lock check only probes those rows
    pub lock_check_ceiling: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_schema: None,
            fetch_size: 1000,
            batch_insert_size: 1,
            expose_primary_keys: false,
            primary_key_metadata_table: None,
            session_startup_sql: None,
            session_close_sql: None,
            two_valued_logic: true,
            leak_tracing: false,
            lock_check_ceiling: 1000,
        }
    }
}

impl StoreConfig {
    /// Loads the optional file at `path`, then applies `SQLSTORE_*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self, StoreError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(StoreError::Config(format!("config file {} not found", path.display())));
            }
            builder = builder.add_source(File::from(path));
            debug!(path = %path.display(), "loading store config");
        }
        builder = builder.add_source(Environment::with_prefix("SQLSTORE").try_parsing(true));
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.fetch_size == 0 {
            return Err(StoreError::Config("fetch_size must be positive".to_string()));
        }
        if self.batch_insert_size == 0 {
            return Err(StoreError::Config("batch_insert_size must be positive".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_database_schema(mut self, schema: impl Into<String>) -> Self {
        self.database_schema = Some(schema.into());
        self
    }

    #[must_use]
    pub const fn with_batch_insert_size(mut self, size: usize) -> Self {
        self.batch_insert_size = size;
        self
    }

    #[must_use]
    pub const fn with_expose_primary_keys(mut self, expose: bool) -> Self {
        self.expose_primary_keys = expose;
        self
    }

    #[must_use]
    pub const fn with_two_valued_logic(mut self, enabled: bool) -> Self {
        self.two_valued_logic = enabled;
        self
    }

    #[must_use]
    pub fn with_session_sql(mut self, startup: Option<String>, close: Option<String>) -> Self {
        self.session_startup_sql = startup;
        self.session_close_sql = close;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.fetch_size, 1000);
        assert_eq!(config.batch_insert_size, 1);
        assert!(config.two_valued_logic);
        assert!(!config.expose_primary_keys);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "database_schema = \"gis\"").unwrap();
        writeln!(file, "batch_insert_size = 50").unwrap();
        writeln!(file, "two_valued_logic = false").unwrap();
        let config = StoreConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.database_schema.as_deref(), Some("gis"));
        assert_eq!(config.batch_insert_size, 50);
        assert!(!config.two_valued_logic);
        assert_eq!(config.fetch_size, 1000);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(matches!(StoreConfig::load(Some(&missing)), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_batch() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "batch_insert_size = 0").unwrap();
        assert!(matches!(StoreConfig::load(Some(file.path())), Err(StoreError::Config(_))));
    }
}

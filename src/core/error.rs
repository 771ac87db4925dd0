use std::fmt;
use thiserror::Error;

/// Error reported by a backend driver.
///
/// Drivers keep whatever they know about the failure in `message`; the
/// SQLSTATE code is optional because not every backend reports one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub message: String,
    pub sql_state: Option<String>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.sql_state = Some(state.into());
        self
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sql_state {
            Some(state) => write!(f, "{} (SQLSTATE {state})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DriverError {}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Feature type '{0}' not found")]
    SchemaNotFound(String),
    #[error("Attribute '{0}' not found")]
    AttributeNotFound(String),
    #[error("Cannot translate filter to SQL: {0}")]
    Translation(String),
    #[error("Property '{0}' cannot be resolved")]
    UnresolvedProperty(String),
    #[error("Join error: {0}")]
    Join(String),
    #[error("Virtual table error: {0}")]
    VirtualTable(String),
    #[error("SQL error: {0}")]
    Driver(#[from] DriverError),
    #[error("Insertion failed: {0}")]
    Insertion(String),
    #[error("Illegal update: {0}")]
    IllegalUpdate(String),
    #[error("Feature lock violation: {0}")]
    FeatureLock(String),
    #[error("Illegal state: {0}")]
    IllegalState(String),
    #[error("No more features")]
    NoSuchElement,
    #[error("Invalid feature id '{0}'")]
    InvalidFeatureId(String),
    #[error("Reprojection failed: {0}")]
    Reprojection(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    #[error("Evaluation error: {0}")]
    Evaluation(String),
}

impl From<config::ConfigError> for StoreError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<regex::Error> for StoreError {
    fn from(err: regex::Error) -> Self {
        Self::Config(format!("invalid validator pattern: {err}"))
    }
}

impl From<std::fmt::Error> for StoreError {
    fn from(err: std::fmt::Error) -> Self {
        Self::Translation(err.to_string())
    }
}

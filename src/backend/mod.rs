/// Backend seam - what the engine needs from a database driver
///
/// The engine is synchronous: every call blocks until the driver returns.
/// Placeholders are always `?`; a driver translates them if its wire format
/// differs. Result-set indices are 0-based.

pub mod recording;

pub use recording::{RecordingBackend, ResultRows};

use crate::core::{DriverError, SqlType, Value};

/// Borrowed from an external pool; the engine never configures pooling
pub trait ConnectionProvider: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>, DriverError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub sql_type: SqlType,
    pub type_name: String,
    pub nullable: bool,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, sql_type: SqlType, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type,
            type_name: type_name.into(),
            nullable: true,
        }
    }

    #[must_use]
    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// One row of unique-index metadata; `column` is `None` for the spurious
/// statistics row some drivers emit first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    pub index_name: String,
    pub column: Option<String>,
}

pub trait Connection: Send {
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn Statement>, DriverError>;
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), DriverError>;
    fn commit(&mut self) -> Result<(), DriverError>;
    fn rollback(&mut self) -> Result<(), DriverError>;
    fn close(&mut self) -> Result<(), DriverError>;

    // Metadata
    /// Primary-key column names in key-sequence order
    fn primary_keys(&mut self, schema: Option<&str>, table: &str) -> Result<Vec<String>, DriverError>;
    fn unique_indexes(&mut self, schema: Option<&str>, table: &str) -> Result<Vec<IndexColumn>, DriverError>;
    fn is_view(&mut self, schema: Option<&str>, table: &str) -> Result<bool, DriverError>;
    fn columns(&mut self, schema: Option<&str>, table: &str) -> Result<Vec<ColumnMetadata>, DriverError>;
}

/// Per-row result of a batch execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Count(u64),
    /// Row succeeded, affected count unknown
    SuccessNoInfo,
    Failed,
}

pub trait Statement: Send {
    fn set_fetch_size(&mut self, rows: u32);
    fn query(&mut self, params: &[Value]) -> Result<Box<dyn ResultSet>, DriverError>;
    /// Runs an update/insert/delete, returning the affected row count
    fn execute(&mut self, params: &[Value]) -> Result<u64, DriverError>;
    fn add_batch(&mut self, params: Vec<Value>);
    fn execute_batch(&mut self) -> Result<Vec<BatchOutcome>, DriverError>;
    /// Keys generated by the last execute, one row per inserted row
    fn generated_keys(&mut self) -> Result<Vec<Vec<Value>>, DriverError>;
    fn close(&mut self) -> Result<(), DriverError>;
}

pub trait ResultSet: Send {
    /// Advances to the next row; `false` once exhausted
    fn next(&mut self) -> Result<bool, DriverError>;
    fn column_count(&self) -> usize;
    fn column_name(&self, index: usize) -> Option<&str>;
    fn get(&self, index: usize) -> Result<Value, DriverError>;
    fn is_auto_increment(&self, index: usize) -> bool;
    /// JDBC-style type code and native type name of a column, for drivers
    /// that report result metadata
    fn column_type(&self, index: usize) -> Option<(SqlType, &str)> {
        let _ = index;
        None
    }
    fn close(&mut self) -> Result<(), DriverError>;
}

/// Runs a query and collects every row, closing the statement and result set
/// even when reading fails
pub fn fetch_all(
    conn: &mut dyn Connection,
    sql: &str,
    params: &[Value],
    columns: usize,
) -> Result<Vec<Vec<Value>>, DriverError> {
    let mut stmt = conn.prepare(sql)?;
    let result = stmt.query(params).and_then(|mut rs| {
        let rows = read_rows(rs.as_mut(), columns);
        if let Err(e) = rs.close() {
            tracing::warn!(error = %e, "failed to close result set");
        }
        rows
    });
    if let Err(e) = stmt.close() {
        tracing::warn!(error = %e, "failed to close statement");
    }
    result
}

fn read_rows(rs: &mut dyn ResultSet, columns: usize) -> Result<Vec<Vec<Value>>, DriverError> {
    let mut rows = Vec::new();
    while rs.next()? {
        rows.push((0..columns).map(|i| rs.get(i)).collect::<Result<Vec<_>, _>>()?);
    }
    Ok(rows)
}

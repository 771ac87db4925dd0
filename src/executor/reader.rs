/// Streaming feature cursor
///
/// OPEN (connection leased) -> PREPARED (statement built) -> STREAMING
/// (cursor iteration) -> CLOSED (result set, statement and, for auto-commit,
/// the connection released). Exhausting the cursor closes it; closing twice
/// is a no-op.

use tracing::{debug, trace, warn};
use crate::backend::{ResultSet, Statement};
use crate::core::{Feature, StoreError, Value};
use crate::sql::SqlStatement;
use super::connection::Lease;
use super::mapper::{BranchMapper, ResultMapper};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Open,
    Prepared,
    Streaming,
    Closed,
}

pub struct FeatureReader {
    lease: Option<Lease>,
    statement: Option<Box<dyn Statement>>,
    cursor: Option<Box<dyn ResultSet>>,
    primary: ResultMapper,
    branches: Vec<BranchMapper>,
    state: ReaderState,
    /// Memoized has-next answer for the current position
    ready: Option<bool>,
    checked: bool,
    leak_tracing: bool,
}

impl FeatureReader {
    /// Prepares and runs `statement` on `lease`. On failure everything
    /// acquired so far is released before the error is returned.
    pub fn open(
        lease: Lease,
        statement: &SqlStatement,
        params: &[Value],
        primary: ResultMapper,
        branches: Vec<BranchMapper>,
        fetch_size: u32,
        leak_tracing: bool,
    ) -> Result<Self, StoreError> {
        let mut reader = Self {
            lease: Some(lease),
            statement: None,
            cursor: None,
            primary,
            branches,
            state: ReaderState::Open,
            ready: None,
            checked: false,
            leak_tracing,
        };
        debug!(sql = %statement.sql, "executing query");
        trace!(?params, "query parameters");

        let prepared = match reader.lease.as_mut() {
            Some(lease) => lease.with(|conn| conn.prepare(&statement.sql)),
            None => return Err(StoreError::IllegalState("reader has no connection".to_string())),
        };
        let mut stmt = prepared?;
        stmt.set_fetch_size(fetch_size);
        reader.state = ReaderState::Prepared;
        let result = stmt.query(params);
        reader.statement = Some(stmt);
        reader.cursor = Some(result?);
        reader.state = ReaderState::Streaming;
        Ok(reader)
    }

    #[must_use]
    pub const fn state(&self) -> ReaderState {
        self.state
    }

    #[must_use]
    pub fn schema(&self) -> &std::sync::Arc<crate::core::FeatureSchema> {
        self.primary.schema()
    }

    /// Whether another row is available. Repeated calls without advancing
    /// do not touch the cursor.
    pub fn has_next(&mut self) -> Result<bool, StoreError> {
        self.checked = true;
        if let Some(ready) = self.ready {
            return Ok(ready);
        }
        let Some(cursor) = self.cursor.as_mut() else {
            self.ready = Some(false);
            return Ok(false);
        };
        match cursor.next() {
            Ok(true) => {
                self.ready = Some(true);
                Ok(true)
            }
            Ok(false) => {
                self.release();
                Ok(false)
            }
            Err(e) => {
                self.release();
                Err(e.into())
            }
        }
    }

    /// Decodes the next row. Calling this before `has_next` ever ran is a
    /// usage error; calling it past the end fails with `NoSuchElement`.
    pub fn next_feature(&mut self) -> Result<Feature, StoreError> {
        if !self.checked {
            return Err(StoreError::IllegalState("next called before has_next".to_string()));
        }
        if !self.has_next()? {
            return Err(StoreError::NoSuchElement);
        }
        self.ready = None;
        let mapped = match self.cursor.as_deref() {
            Some(cursor) => self.map_current(cursor),
            None => Err(StoreError::NoSuchElement),
        };
        if mapped.is_err() {
            self.release();
        }
        mapped
    }

    fn map_current(&self, cursor: &dyn ResultSet) -> Result<Feature, StoreError> {
        let mut feature = self.primary.map_row(cursor)?;
        for branch in &self.branches {
            feature.joined.push(branch.map_row(cursor)?);
        }
        Ok(feature)
    }

    /// Releases the cursor, statement and leased connection
    pub fn close(&mut self) {
        if !self.release() && self.leak_tracing {
            debug!(type_name = %self.primary.schema().name, "feature reader closed more than once");
        }
    }

    /// Each resource is closed even if closing an earlier one failed
    fn release(&mut self) -> bool {
        if self.state == ReaderState::Closed {
            return false;
        }
        if let Some(mut cursor) = self.cursor.take() {
            if let Err(e) = cursor.close() {
                warn!(error = %e, "failed to close result set");
            }
        }
        if let Some(mut stmt) = self.statement.take() {
            if let Err(e) = stmt.close() {
                warn!(error = %e, "failed to close statement");
            }
        }
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
        self.state = ReaderState::Closed;
        self.ready = Some(false);
        true
    }
}

impl Iterator for FeatureReader {
    type Item = Result<Feature, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => Some(self.next_feature()),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for FeatureReader {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for FeatureReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureReader")
            .field("type_name", &self.primary.schema().name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::backend::{RecordingBackend, ResultRows};
    use crate::core::{AttributeDescriptor, DataType, DriverError, FeatureSchema};
    use crate::dialect::GenericDialect;
    use crate::executor::connection::{Connector, SessionHooks};
    use crate::primary_key::{GenerationKind, PrimaryKey, PrimaryKeyColumn};
    use crate::transaction::Transaction;

    fn open(backend: &RecordingBackend) -> Result<FeatureReader, StoreError> {
        let connector = Connector::new(Arc::new(backend.clone()), SessionHooks::default());
        let lease = connector.acquire(&Transaction::auto_commit())?;
        let key = Arc::new(PrimaryKey::new(
            "roads",
            vec![PrimaryKeyColumn::new("id", DataType::Integer, GenerationKind::AutoGenerated)],
        ));
        let schema = Arc::new(FeatureSchema::new("roads", vec![AttributeDescriptor::new("name", DataType::Text)]));
        let mapper = ResultMapper::new(Arc::new(GenericDialect::new()), key, schema, false);
        let statement = SqlStatement {
            sql: "SELECT \"id\", \"name\" FROM \"roads\"".to_string(),
            bindings: Vec::new(),
        };
        FeatureReader::open(lease, &statement, &[], mapper, Vec::new(), 100, true)
    }

    fn two_rows() -> RecordingBackend {
        let backend = RecordingBackend::new();
        backend.on_query(
            "FROM \"roads\"",
            ResultRows::new(["id", "name"])
                .row(vec![Value::Integer(1), Value::Text("a".into())])
                .row(vec![Value::Integer(2), Value::Text("b".into())]),
        );
        backend
    }

    #[test]
    fn test_has_next_is_memoized() {
        let backend = two_rows();
        let mut reader = open(&backend).unwrap();
        assert!(reader.has_next().unwrap());
        assert!(reader.has_next().unwrap());
        assert_eq!(reader.next_feature().unwrap().id, "roads.1");
        assert_eq!(reader.next_feature().unwrap().id, "roads.2");
        assert!(!reader.has_next().unwrap());
    }

    #[test]
    fn test_next_before_has_next_is_illegal() {
        let backend = two_rows();
        let mut reader = open(&backend).unwrap();
        assert!(matches!(reader.next_feature(), Err(StoreError::IllegalState(_))));
    }

    #[test]
    fn test_reading_past_end() {
        let backend = two_rows();
        let mut reader = open(&backend).unwrap();
        assert_eq!(reader.by_ref().count(), 2);
        assert!(matches!(reader.next_feature(), Err(StoreError::NoSuchElement)));
    }

    #[test]
    fn test_exhaustion_releases_everything() {
        let backend = two_rows();
        let mut reader = open(&backend).unwrap();
        assert_eq!(backend.open_connections(), 1);
        let features: Vec<Feature> = reader.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(reader.state(), ReaderState::Closed);
        assert_eq!(backend.open_connections(), 0);
        assert_eq!(backend.open_cursors(), 0);
        reader.close();
        reader.close();
    }

    #[test]
    fn test_early_close_mid_stream() {
        let backend = two_rows();
        let mut reader = open(&backend).unwrap();
        assert!(reader.has_next().unwrap());
        reader.close();
        assert_eq!(backend.open_connections(), 0);
        assert_eq!(backend.open_cursors(), 0);
        assert!(!reader.has_next().unwrap());
    }

    #[test]
    fn test_failed_query_releases_connection() {
        let backend = RecordingBackend::new();
        backend.fail_on("FROM \"roads\"", DriverError::new("relation does not exist").with_state("42P01"));
        assert!(matches!(open(&backend), Err(StoreError::Driver(_))));
        assert_eq!(backend.open_connections(), 0);
        assert_eq!(backend.open_cursors(), 0);
    }
}

/// Scripted in-memory backend
///
/// Records every statement with its bound parameters and answers from a
/// list of substring-matched rules. Used by the dry-run explainer and by
/// tests; it does not interpret SQL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;
use crate::core::{DriverError, SqlType, Value};
use super::{
    BatchOutcome, ColumnMetadata, Connection, ConnectionProvider, IndexColumn, ResultSet, Statement,
};

/// Canned rows returned for a matching query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRows {
    pub columns: Vec<String>,
    pub auto_increment: Vec<bool>,
    pub column_types: Vec<Option<(SqlType, String)>>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultRows {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let auto_increment = vec![false; columns.len()];
        let column_types = vec![None; columns.len()];
        Self {
            columns,
            auto_increment,
            column_types,
            rows: Vec::new(),
        }
    }

    #[must_use]
    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }

    /// Reports `column` with a driver type in the result metadata
    #[must_use]
    pub fn typed(mut self, column: &str, sql_type: SqlType, type_name: &str) -> Self {
        if let Some(i) = self.columns.iter().position(|c| c == column) {
            self.column_types[i] = Some((sql_type, type_name.to_string()));
        }
        self
    }

    #[must_use]
    pub fn auto_increment(mut self, column: &str) -> Self {
        if let Some(i) = self.columns.iter().position(|c| c == column) {
            self.auto_increment[i] = true;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect,
    Query { sql: String, params: Vec<Value> },
    Execute { sql: String, params: Vec<Value> },
    Batch { sql: String, rows: Vec<Vec<Value>> },
    AutoCommit(bool),
    Commit,
    Rollback,
    Close,
}

impl Call {
    #[must_use]
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Query { sql, .. } | Self::Execute { sql, .. } | Self::Batch { sql, .. } => Some(sql),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Response {
    Rows(ResultRows),
    Count(u64),
    Batch(Vec<BatchOutcome>),
    Keys(Vec<Vec<Value>>),
    Fail(DriverError),
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    response: Response,
}

#[derive(Debug, Clone, Default)]
pub struct TableMeta {
    pub columns: Vec<ColumnMetadata>,
    pub primary_keys: Vec<String>,
    pub unique_indexes: Vec<IndexColumn>,
    pub is_view: bool,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    rules: Vec<Rule>,
    tables: HashMap<String, TableMeta>,
    open_connections: usize,
    open_statements: usize,
    open_result_sets: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingBackend {
    state: Arc<Mutex<State>>,
}

impl RecordingBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_rule(&self, pattern: &str, response: Response) -> &Self {
        self.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            response,
        });
        self
    }

    /// Queries whose SQL contains `pattern` return `rows`
    pub fn on_query(&self, pattern: &str, rows: ResultRows) -> &Self {
        self.add_rule(pattern, Response::Rows(rows))
    }

    /// Updates whose SQL contains `pattern` report `count` affected rows
    pub fn on_execute(&self, pattern: &str, count: u64) -> &Self {
        self.add_rule(pattern, Response::Count(count))
    }

    pub fn on_batch(&self, pattern: &str, outcomes: Vec<BatchOutcome>) -> &Self {
        self.add_rule(pattern, Response::Batch(outcomes))
    }

    /// Generated keys reported after a matching execute or batch
    pub fn on_generated_keys(&self, pattern: &str, keys: Vec<Vec<Value>>) -> &Self {
        self.add_rule(pattern, Response::Keys(keys))
    }

    pub fn fail_on(&self, pattern: &str, error: DriverError) -> &Self {
        self.add_rule(pattern, Response::Fail(error))
    }

    pub fn add_table(&self, name: &str, meta: TableMeta) -> &Self {
        self.lock().tables.insert(name.to_string(), meta);
        self
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// SQL text of every query, update and batch, in execution order
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| c.sql().map(str::to_string))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }

    /// Statements plus result sets not yet closed
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        let state = self.lock();
        state.open_statements + state.open_result_sets
    }
}

impl State {
    fn find(&self, sql: &str, accept: impl Fn(&Response) -> bool) -> Option<Response> {
        self.rules
            .iter()
            .find(|r| sql.contains(&r.pattern) && accept(&r.response))
            .map(|r| r.response.clone())
    }
}

impl ConnectionProvider for RecordingBackend {
    fn connect(&self) -> Result<Box<dyn Connection>, DriverError> {
        let mut state = self.lock();
        state.calls.push(Call::Connect);
        state.open_connections += 1;
        Ok(Box::new(RecordingConnection {
            backend: self.clone(),
            closed: false,
        }))
    }
}

struct RecordingConnection {
    backend: RecordingBackend,
    closed: bool,
}

impl RecordingConnection {
    fn table(&self, table: &str) -> TableMeta {
        self.backend.lock().tables.get(table).cloned().unwrap_or_default()
    }

    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::new("connection is closed").with_state("08003"));
        }
        Ok(())
    }
}

impl Connection for RecordingConnection {
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn Statement>, DriverError> {
        self.check_open()?;
        self.backend.lock().open_statements += 1;
        Ok(Box::new(RecordingStatement {
            backend: self.backend.clone(),
            sql: sql.to_string(),
            batch: Vec::new(),
            last_keys: Vec::new(),
            closed: false,
        }))
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), DriverError> {
        self.check_open()?;
        self.backend.lock().calls.push(Call::AutoCommit(auto_commit));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.check_open()?;
        self.backend.lock().calls.push(Call::Commit);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.check_open()?;
        self.backend.lock().calls.push(Call::Rollback);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            let mut state = self.backend.lock();
            state.calls.push(Call::Close);
            state.open_connections = state.open_connections.saturating_sub(1);
        }
        Ok(())
    }

    fn primary_keys(&mut self, _schema: Option<&str>, table: &str) -> Result<Vec<String>, DriverError> {
        self.check_open()?;
        Ok(self.table(table).primary_keys)
    }

    fn unique_indexes(&mut self, _schema: Option<&str>, table: &str) -> Result<Vec<IndexColumn>, DriverError> {
        self.check_open()?;
        Ok(self.table(table).unique_indexes)
    }

    fn is_view(&mut self, _schema: Option<&str>, table: &str) -> Result<bool, DriverError> {
        self.check_open()?;
        Ok(self.table(table).is_view)
    }

    fn columns(&mut self, _schema: Option<&str>, table: &str) -> Result<Vec<ColumnMetadata>, DriverError> {
        self.check_open()?;
        Ok(self.table(table).columns)
    }
}

struct RecordingStatement {
    backend: RecordingBackend,
    sql: String,
    batch: Vec<Vec<Value>>,
    last_keys: Vec<Vec<Value>>,
    closed: bool,
}

impl RecordingStatement {
    fn keys_for(&self, state: &State) -> Vec<Vec<Value>> {
        match state.find(&self.sql, |r| matches!(r, Response::Keys(_))) {
            Some(Response::Keys(keys)) => keys,
            _ => Vec::new(),
        }
    }
}

impl Statement for RecordingStatement {
    fn set_fetch_size(&mut self, _rows: u32) {}

    fn query(&mut self, params: &[Value]) -> Result<Box<dyn ResultSet>, DriverError> {
        let mut state = self.backend.lock();
        trace!(sql = %self.sql, ?params, "recorded query");
        state.calls.push(Call::Query {
            sql: self.sql.clone(),
            params: params.to_vec(),
        });
        let rows = match state.find(&self.sql, |r| matches!(r, Response::Rows(_) | Response::Fail(_))) {
            Some(Response::Fail(e)) => return Err(e),
            Some(Response::Rows(rows)) => rows,
            _ => ResultRows::default(),
        };
        state.open_result_sets += 1;
        Ok(Box::new(RecordingResultSet {
            backend: self.backend.clone(),
            rows,
            position: None,
            closed: false,
        }))
    }

    fn execute(&mut self, params: &[Value]) -> Result<u64, DriverError> {
        let mut state = self.backend.lock();
        trace!(sql = %self.sql, ?params, "recorded update");
        state.calls.push(Call::Execute {
            sql: self.sql.clone(),
            params: params.to_vec(),
        });
        self.last_keys = self.keys_for(&state);
        match state.find(&self.sql, |r| matches!(r, Response::Count(_) | Response::Fail(_))) {
            Some(Response::Fail(e)) => Err(e),
            Some(Response::Count(n)) => Ok(n),
            _ => Ok(1),
        }
    }

    fn add_batch(&mut self, params: Vec<Value>) {
        self.batch.push(params);
    }

    fn execute_batch(&mut self) -> Result<Vec<BatchOutcome>, DriverError> {
        let rows = std::mem::take(&mut self.batch);
        let mut state = self.backend.lock();
        let size = rows.len();
        state.calls.push(Call::Batch {
            sql: self.sql.clone(),
            rows,
        });
        self.last_keys = self.keys_for(&state);
        match state.find(&self.sql, |r| matches!(r, Response::Batch(_) | Response::Fail(_))) {
            Some(Response::Fail(e)) => Err(e),
            Some(Response::Batch(outcomes)) => Ok(outcomes),
            _ => Ok(vec![BatchOutcome::Count(1); size]),
        }
    }

    fn generated_keys(&mut self) -> Result<Vec<Vec<Value>>, DriverError> {
        Ok(std::mem::take(&mut self.last_keys))
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            let mut state = self.backend.lock();
            state.open_statements = state.open_statements.saturating_sub(1);
        }
        Ok(())
    }
}

struct RecordingResultSet {
    backend: RecordingBackend,
    rows: ResultRows,
    position: Option<usize>,
    closed: bool,
}

impl ResultSet for RecordingResultSet {
    fn next(&mut self) -> Result<bool, DriverError> {
        if self.closed {
            return Err(DriverError::new("result set is closed"));
        }
        let next = self.position.map_or(0, |p| p + 1);
        self.position = Some(next.min(self.rows.rows.len()));
        Ok(next < self.rows.rows.len())
    }

    fn column_count(&self) -> usize {
        self.rows.columns.len()
    }

    fn column_name(&self, index: usize) -> Option<&str> {
        self.rows.columns.get(index).map(String::as_str)
    }

    fn get(&self, index: usize) -> Result<Value, DriverError> {
        let row = self
            .position
            .and_then(|p| self.rows.rows.get(p))
            .ok_or_else(|| DriverError::new("no current row"))?;
        row.get(index)
            .cloned()
            .ok_or_else(|| DriverError::new(format!("column index {index} out of range")))
    }

    fn is_auto_increment(&self, index: usize) -> bool {
        self.rows.auto_increment.get(index).copied().unwrap_or(false)
    }

    fn column_type(&self, index: usize) -> Option<(SqlType, &str)> {
        self.rows
            .column_types
            .get(index)?
            .as_ref()
            .map(|(sql_type, name)| (*sql_type, name.as_str()))
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            let mut state = self.backend.lock();
            state.open_result_sets = state.open_result_sets.saturating_sub(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_query() {
        let backend = RecordingBackend::new();
        backend.on_query("FROM roads", ResultRows::new(["id"]).row(vec![Value::Integer(7)]));
        let mut conn = backend.connect().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM roads").unwrap();
        let mut rs = stmt.query(&[]).unwrap();
        assert!(rs.get(0).is_err());
        assert!(rs.next().unwrap());
        assert_eq!(rs.get(0).unwrap(), Value::Integer(7));
        assert!(!rs.next().unwrap());
        rs.close().unwrap();
        stmt.close().unwrap();
        conn.close().unwrap();
        assert_eq!(backend.open_connections(), 0);
        assert_eq!(backend.open_cursors(), 0);
        assert_eq!(backend.statements(), vec!["SELECT id FROM roads".to_string()]);
    }

    #[test]
    fn test_default_responses() {
        let backend = RecordingBackend::new();
        let mut conn = backend.connect().unwrap();
        let mut stmt = conn.prepare("INSERT INTO t VALUES (?)").unwrap();
        assert_eq!(stmt.execute(&[Value::Integer(1)]).unwrap(), 1);
        stmt.add_batch(vec![Value::Integer(2)]);
        stmt.add_batch(vec![Value::Integer(3)]);
        assert_eq!(stmt.execute_batch().unwrap(), vec![BatchOutcome::Count(1); 2]);
    }

    #[test]
    fn test_failure_rule() {
        let backend = RecordingBackend::new();
        backend.fail_on("DELETE", DriverError::new("boom").with_state("XX000"));
        let mut conn = backend.connect().unwrap();
        let mut stmt = conn.prepare("DELETE FROM t").unwrap();
        let err = stmt.execute(&[]).unwrap_err();
        assert_eq!(err.sql_state.as_deref(), Some("XX000"));
    }

    #[test]
    fn test_closed_connection_rejects_work() {
        let backend = RecordingBackend::new();
        let mut conn = backend.connect().unwrap();
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(conn.prepare("SELECT 1").is_err());
        assert_eq!(backend.open_connections(), 0);
    }
}

/// DML (Data Manipulation Language) operations
///
/// INSERT, UPDATE and DELETE against a table source. Inserts resolve key
/// values per row before any SQL runs. Updates and deletes push the whole
/// filter into one statement when the dialect can express it and otherwise
/// degrade to the row-by-row writer path.

use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;
use crate::backend::BatchOutcome;
use crate::core::{AttributeDescriptor, DataType, DriverError, Feature, StoreError, Value};
use crate::dialect::ExecutionMode;
use crate::filter::Filter;
use crate::primary_key::fid::encode_fid_values;
use crate::primary_key::{decode_fid, encode_fid, GenerationKind};
use crate::sql::{KeyValue, Query, SqlStatement, TableSource};
use crate::transaction::Transaction;
use super::connection::Lease;
use super::events::FeatureEvent;
use super::queries::QueryExecutor;
use super::store::{run_query, run_statement, DataStore};
use super::writer::UpdateWriter;

/// One prepared INSERT with the key values it will write
struct PendingInsert {
    index: usize,
    statement: SqlStatement,
    keys: Vec<KeyValue>,
}

pub struct DmlExecutor;

impl DmlExecutor {
    /// Insert `features`, writing each assigned id back into its feature.
    /// Returns the ids in input order.
    pub fn insert(
        store: &DataStore,
        type_name: &str,
        features: &mut [Feature],
        tx: &Transaction,
    ) -> Result<Vec<String>, StoreError> {
        if features.is_empty() {
            return Ok(Vec::new());
        }
        let source = store.source(type_name, tx, &HashMap::new())?;
        let mut lease = store.connector().acquire(tx)?;
        let result = Self::insert_on(store, &source, features, &mut lease);
        lease.release();
        let ids = result?;

        for (feature, id) in features.iter_mut().zip(&ids) {
            feature.id.clone_from(id);
        }
        for id in &ids {
            store.events().publish(&FeatureEvent::Added {
                type_name: type_name.to_string(),
                id: id.clone(),
            });
        }
        debug!(type_name, rows = ids.len(), "inserted features");
        Ok(ids)
    }

    fn insert_on(
        store: &DataStore,
        source: &TableSource,
        features: &[Feature],
        lease: &mut Lease,
    ) -> Result<Vec<String>, StoreError> {
        // 1. Key values, then one statement per row
        let builder = store.builder();
        let mut next_values = HashMap::new();
        let mut pending = Vec::with_capacity(features.len());
        for (index, feature) in features.iter().enumerate() {
            let keys = Self::key_values(store, source, feature, lease, &mut next_values)?;
            let statement = builder.insert(source, feature, &keys)?;
            pending.push(PendingInsert { index, statement, keys });
        }

        // 2. Execute
        let mut ids = vec![String::new(); features.len()];
        match store.dialect().execution_mode() {
            ExecutionMode::Prepared => {
                // Rows with the same key shape share SQL text and one batch
                let mut groups: Vec<(String, Vec<PendingInsert>)> = Vec::new();
                for row in pending {
                    match groups.iter_mut().find(|(sql, _)| *sql == row.statement.sql) {
                        Some((_, rows)) => rows.push(row),
                        None => groups.push((row.statement.sql.clone(), vec![row])),
                    }
                }
                for (sql, rows) in groups {
                    let generated = Self::execute_batch(store, lease, &sql, &rows)?;
                    for (i, row) in rows.iter().enumerate() {
                        ids[row.index] = Self::feature_id(source, &row.keys, generated.get(i));
                    }
                }
            }
            ExecutionMode::Textual => {
                for row in pending {
                    let generated = Self::execute_one(store, lease, &row)?;
                    ids[row.index] = Self::feature_id(source, &row.keys, generated.first());
                }
            }
        }
        Ok(ids)
    }

    /// Runs one batch and checks its per-row outcomes
    fn execute_batch(
        store: &DataStore,
        lease: &mut Lease,
        sql: &str,
        rows: &[PendingInsert],
    ) -> Result<Vec<Vec<Value>>, StoreError> {
        let wants_keys = rows.iter().any(|r| r.keys.contains(&KeyValue::Omit));
        debug!(sql, rows = rows.len(), "executing insert batch");
        let (outcomes, generated) = lease.with(|conn| -> Result<_, DriverError> {
            let mut stmt = conn.prepare(sql)?;
            for row in rows {
                stmt.add_batch(row.statement.params(store.dialect().as_ref()));
            }
            let result = stmt.execute_batch().and_then(|outcomes| {
                let generated = if wants_keys { stmt.generated_keys()? } else { Vec::new() };
                Ok((outcomes, generated))
            });
            if let Err(e) = stmt.close() {
                warn!(error = %e, "failed to close statement");
            }
            result
        })?;
        Self::check_batch(&outcomes, rows.len())?;
        Ok(generated)
    }

    fn execute_one(store: &DataStore, lease: &mut Lease, row: &PendingInsert) -> Result<Vec<Vec<Value>>, StoreError> {
        let wants_keys = row.keys.contains(&KeyValue::Omit);
        let params = row.statement.params(store.dialect().as_ref());
        debug!(sql = %row.statement.sql, "executing insert");
        Ok(lease.with(|conn| -> Result<_, DriverError> {
            let mut stmt = conn.prepare(&row.statement.sql)?;
            let result = stmt
                .execute(&params)
                .and_then(|_| if wants_keys { stmt.generated_keys() } else { Ok(Vec::new()) });
            if let Err(e) = stmt.close() {
                warn!(error = %e, "failed to close statement");
            }
            result
        })?)
    }

    /// Any failed row, or a count sum that differs from the row count, fails
    /// the insert. A row without count information skips the sum check.
    pub fn check_batch(outcomes: &[BatchOutcome], expected: usize) -> Result<(), StoreError> {
        if let Some(row) = outcomes.iter().position(|o| *o == BatchOutcome::Failed) {
            return Err(StoreError::Insertion(format!("batch row {row} failed")));
        }
        if outcomes.iter().any(|o| *o == BatchOutcome::SuccessNoInfo) {
            return Ok(());
        }
        let inserted: u64 = outcomes
            .iter()
            .map(|o| match o {
                BatchOutcome::Count(n) => *n,
                _ => 0,
            })
            .sum();
        if inserted != expected as u64 {
            return Err(StoreError::Insertion(format!("expected {expected} inserted rows, driver reported {inserted}")));
        }
        Ok(())
    }

    /// How each key column gets its value for `feature`
    fn key_values(
        store: &DataStore,
        source: &TableSource,
        feature: &Feature,
        lease: &mut Lease,
        next_values: &mut HashMap<String, i64>,
    ) -> Result<Vec<KeyValue>, StoreError> {
        let key = &source.key;
        if feature.use_provided_id && !key.is_null() {
            let values = decode_fid(source.type_name(), key, &feature.id, true)?;
            return Ok(values.into_iter().map(KeyValue::Value).collect());
        }
        let mut keys = Vec::with_capacity(key.columns.len());
        for column in &key.columns {
            let value = match &column.kind {
                GenerationKind::AutoGenerated => KeyValue::Omit,
                GenerationKind::Sequence(sequence) => {
                    let database_schema = store.config().database_schema.as_deref();
                    let next = store.dialect().next_sequence_value_sql(database_schema, sequence);
                    let rows = run_query(lease, store.dialect().as_ref(), &SqlStatement::new(format!("SELECT {next}")), 1)?;
                    match rows.into_iter().next().and_then(|row| row.into_iter().next()) {
                        Some(value) if !value.is_null() => KeyValue::Value(value),
                        _ => return Err(StoreError::Insertion(format!("sequence '{sequence}' returned no value"))),
                    }
                }
                GenerationKind::NonIncrementing => match feature.get(&column.name).filter(|v| !v.is_null()) {
                    Some(value) => KeyValue::Value(value.clone()),
                    None => KeyValue::Value(Self::next_key(store, source, &column.name, &column.data_type, lease, next_values)?),
                },
            };
            keys.push(value);
        }
        Ok(keys)
    }

    /// Next value for a key column the database does not fill: MAX + 1 for
    /// integers, tracked across the rows of one call, otherwise a random UUID
    fn next_key(
        store: &DataStore,
        source: &TableSource,
        column: &str,
        data_type: &DataType,
        lease: &mut Lease,
        next_values: &mut HashMap<String, i64>,
    ) -> Result<Value, StoreError> {
        match data_type {
            DataType::Integer | DataType::SmallInt => {
                let next = match next_values.get(column) {
                    Some(n) => *n,
                    None => {
                        let sql = store.builder().max_key(source.type_name(), column);
                        let rows = run_query(lease, store.dialect().as_ref(), &SqlStatement::new(sql), 1)?;
                        let max = rows.first().and_then(|r| r.first()).and_then(Value::as_int).unwrap_or(0);
                        max + 1
                    }
                };
                next_values.insert(column.to_string(), next + 1);
                Ok(Value::Integer(next))
            }
            DataType::Uuid => Ok(Value::Uuid(Uuid::new_v4())),
            DataType::Text | DataType::Unknown => Ok(Value::Text(Uuid::new_v4().to_string())),
            other => Err(StoreError::Insertion(format!(
                "cannot generate a value of type {other} for key column '{column}'"
            ))),
        }
    }

    fn feature_id(source: &TableSource, keys: &[KeyValue], generated: Option<&Vec<Value>>) -> String {
        let type_name = source.type_name();
        if keys.contains(&KeyValue::Omit) {
            return match generated {
                Some(row) => {
                    // Drivers report either every key column or only the generated ones
                    let mut row = row.iter();
                    let values: Vec<Value> = if row.len() == keys.len() {
                        row.cloned().collect()
                    } else {
                        keys.iter()
                            .map(|k| match k {
                                KeyValue::Value(v) => v.clone(),
                                _ => row.next().cloned().unwrap_or(Value::Null),
                            })
                            .collect()
                    };
                    encode_fid_values(type_name, &values)
                }
                None => {
                    warn!(type_name, "driver reported no generated key");
                    encode_fid(type_name, &[])
                }
            };
        }
        let values: Vec<Value> = keys
            .iter()
            .map(|k| match k {
                KeyValue::Value(v) => v.clone(),
                _ => Value::Null,
            })
            .collect();
        encode_fid_values(type_name, &values)
    }

    /// Sets `names` to `values` on every feature `filter` matches
    pub fn update(
        store: &DataStore,
        type_name: &str,
        names: &[&str],
        values: &[Value],
        filter: &Filter,
        tx: &Transaction,
    ) -> Result<u64, StoreError> {
        if names.len() != values.len() {
            return Err(StoreError::IllegalUpdate(format!("{} attributes but {} values", names.len(), values.len())));
        }
        let source = store.source(type_name, tx, &HashMap::new())?;
        if names.iter().all(|n| source.key.contains(n)) {
            return Err(StoreError::IllegalUpdate(format!(
                "update of '{type_name}' touches no column outside the primary key"
            )));
        }
        let attributes = names
            .iter()
            .map(|name| match source.schema.attribute(name) {
                Some(attr) => Ok(attr.clone()),
                None => source
                    .key
                    .column(name)
                    .map(|c| AttributeDescriptor::new(c.name.clone(), c.data_type.clone()))
                    .ok_or_else(|| StoreError::AttributeNotFound(format!("{type_name}.{name}"))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::check_locks(store, type_name, filter, tx)?;

        let split = QueryExecutor::split_filter(store, filter, store.config().two_valued_logic, &source);
        if split.has_post() {
            debug!(type_name, "updating row by row");
            let mut writer = UpdateWriter::open(store, &Query::new(type_name).with_filter(filter.clone()), tx)?;
            let mut count = 0;
            while let Some(staged) = writer.next()? {
                for (name, value) in names.iter().zip(values) {
                    if !source.key.contains(name) {
                        staged.set(name, value.clone())?;
                    }
                }
                writer.write()?;
                count += 1;
            }
            writer.close();
            return Ok(count);
        }

        let statement = store.builder().update(&source, &attributes, values, &split.pre)?;
        let mut lease = store.connector().acquire(tx)?;
        let result = run_statement(&mut lease, store.dialect().as_ref(), &statement);
        lease.release();
        let count = result?;
        store.events().publish(&FeatureEvent::Modified {
            type_name: type_name.to_string(),
            filter: filter.clone(),
        });
        Ok(count)
    }

    /// Deletes every feature `filter` matches and releases their locks
    pub fn delete(store: &DataStore, type_name: &str, filter: &Filter, tx: &Transaction) -> Result<u64, StoreError> {
        let source = store.source(type_name, tx, &HashMap::new())?;
        let locked = Self::check_locks(store, type_name, filter, tx)?;

        let split = QueryExecutor::split_filter(store, filter, store.config().two_valued_logic, &source);
        if split.has_post() {
            debug!(type_name, "deleting row by row");
            let mut writer = UpdateWriter::open(store, &Query::new(type_name).with_filter(filter.clone()), tx)?;
            let mut count = 0;
            while writer.next()?.is_some() {
                writer.remove()?;
                count += 1;
            }
            writer.close();
            return Ok(count);
        }

        let statement = store.builder().delete(&source, &split.pre)?;
        let mut lease = store.connector().acquire(tx)?;
        let result = run_statement(&mut lease, store.dialect().as_ref(), &statement);
        lease.release();
        let count = result?;
        store.locks().release(type_name, &locked);
        store.events().publish(&FeatureEvent::Removed {
            type_name: type_name.to_string(),
            filter: filter.clone(),
        });
        Ok(count)
    }

    /// Fails unless `tx` holds the lock of every locked feature `filter`
    /// matches. Under the configured ceiling only the locked ids are
    /// re-read; above it the full filter is.
    fn check_locks(store: &DataStore, type_name: &str, filter: &Filter, tx: &Transaction) -> Result<Vec<String>, StoreError> {
        let locked = store.locks().locked_ids(type_name);
        if locked.is_empty() {
            return Ok(Vec::new());
        }
        let narrowed = if locked.len() < store.config().lock_check_ceiling {
            Filter::Id(locked.clone()).and(filter.clone())
        } else {
            filter.clone()
        };
        let mut matched = Vec::new();
        for id in QueryExecutor::matching_ids(store, type_name, &narrowed, tx)? {
            if locked.contains(&id) {
                store.locks().check(type_name, &id, tx)?;
                matched.push(id);
            }
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_batch_counts() {
        let ok = vec![BatchOutcome::Count(1); 5];
        assert!(DmlExecutor::check_batch(&ok, 5).is_ok());
        assert!(matches!(DmlExecutor::check_batch(&ok, 6), Err(StoreError::Insertion(_))));
    }

    #[test]
    fn test_check_batch_failed_row() {
        let mut outcomes = vec![BatchOutcome::Count(1); 4];
        outcomes.push(BatchOutcome::Failed);
        assert!(matches!(DmlExecutor::check_batch(&outcomes, 5), Err(StoreError::Insertion(_))));
    }

    #[test]
    fn test_check_batch_without_info_skips_sum() {
        let outcomes = vec![BatchOutcome::SuccessNoInfo; 5];
        assert!(DmlExecutor::check_batch(&outcomes, 5).is_ok());
        let mixed = vec![BatchOutcome::Count(0), BatchOutcome::SuccessNoInfo];
        assert!(DmlExecutor::check_batch(&mixed, 2).is_ok());
    }
}

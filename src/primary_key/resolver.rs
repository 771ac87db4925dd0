/// Primary-key discovery
///
/// Tiers, first non-empty wins: virtual table declaration, key metadata
/// table, database-reported primary key, unique index, null key. Failures
/// while classifying a column degrade to "not generated"; only the primary
/// key metadata call itself is allowed to fail the lookup.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use crate::backend::{fetch_all, Connection};
use crate::core::{DataType, StoreError, Value};
use crate::dialect::Dialect;
use crate::sql::VirtualTable;
use super::{GenerationKind, PrimaryKey, PrimaryKeyColumn};

#[derive(Debug, Clone)]
pub struct PrimaryKeyResolver {
    dialect: Arc<dyn Dialect>,
    database_schema: Option<String>,
    /// `schema.table` or `table`
    metadata_table: Option<String>,
}

impl PrimaryKeyResolver {
    pub fn new(dialect: Arc<dyn Dialect>, database_schema: Option<String>, metadata_table: Option<String>) -> Self {
        Self {
            dialect,
            database_schema,
            metadata_table,
        }
    }

    pub fn resolve(
        &self,
        conn: &mut dyn Connection,
        table: &str,
        virtual_table: Option<&VirtualTable>,
    ) -> Result<PrimaryKey, StoreError> {
        if let Some(vt) = virtual_table {
            let key = Self::from_virtual_table(vt);
            debug!(table, columns = key.columns.len(), "primary key from virtual table");
            return Ok(key);
        }

        if self.metadata_table.is_some() {
            match self.from_metadata_table(conn, table) {
                Ok(Some(key)) => {
                    debug!(table, "primary key from metadata table");
                    return Ok(key);
                }
                Ok(None) => {}
                Err(e) => warn!(table, error = %e, "primary key metadata table lookup failed"),
            }
        }

        let schema = self.database_schema.as_deref();
        let key_columns = conn.primary_keys(schema, table)?;
        if !key_columns.is_empty() {
            debug!(table, ?key_columns, "primary key from database metadata");
            return Ok(self.classify(conn, table, &key_columns));
        }

        let is_view = conn.is_view(schema, table).unwrap_or_else(|e| {
            warn!(table, error = %e, "view check failed, assuming a table");
            false
        });
        if !is_view {
            if let Some(columns) = Self::first_unique_index(conn, schema, table) {
                debug!(table, ?columns, "primary key from unique index");
                return Ok(self.classify(conn, table, &columns));
            }
        }

        debug!(table, "no primary key");
        Ok(PrimaryKey::null(table))
    }

    fn from_virtual_table(vt: &VirtualTable) -> PrimaryKey {
        PrimaryKey::new(
            vt.name.clone(),
            vt.primary_key_columns
                .iter()
                .map(|c| PrimaryKeyColumn::new(c.clone(), DataType::Unknown, GenerationKind::NonIncrementing))
                .collect(),
        )
    }

    fn from_metadata_table(&self, conn: &mut dyn Connection, table: &str) -> Result<Option<PrimaryKey>, StoreError> {
        let Some(meta) = self.metadata_table.as_deref() else {
            return Ok(None);
        };
        let meta_name = match meta.split_once('.') {
            Some((schema, name)) => self.dialect.table_name(Some(schema), name),
            None => self.dialect.table_name(None, meta),
        };
        let (sql, params) = match &self.database_schema {
            Some(schema) => (
                format!(
                    "SELECT pk_column, pk_column_idx, pk_policy, pk_sequence FROM {meta_name} \
                     WHERE table_schema = ? AND table_name = ? ORDER BY pk_column_idx"
                ),
                vec![Value::Text(schema.clone()), Value::Text(table.to_string())],
            ),
            None => (
                format!(
                    "SELECT pk_column, pk_column_idx, pk_policy, pk_sequence FROM {meta_name} \
                     WHERE table_name = ? ORDER BY pk_column_idx"
                ),
                vec![Value::Text(table.to_string())],
            ),
        };
        let rows = fetch_all(conn, &sql, &params, 4)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let types = self.column_types(conn, table);
        let columns = rows
            .into_iter()
            .filter_map(|row| {
                let name = row[0].as_text()?.to_string();
                let policy = row[2].as_text().map(str::to_lowercase);
                let kind = match (policy.as_deref(), row[3].as_text()) {
                    (Some("autogenerated"), _) => GenerationKind::AutoGenerated,
                    (Some("sequence"), Some(seq)) if !seq.is_empty() => GenerationKind::Sequence(seq.to_string()),
                    (Some("sequence"), _) => {
                        warn!(table, column = %name, "sequence policy without a sequence name");
                        GenerationKind::NonIncrementing
                    }
                    _ => GenerationKind::NonIncrementing,
                };
                let data_type = types.get(&name).cloned().unwrap_or(DataType::Unknown);
                Some(PrimaryKeyColumn::new(name, data_type, kind))
            })
            .collect::<Vec<_>>();
        Ok((!columns.is_empty()).then(|| PrimaryKey::new(table, columns)))
    }

    /// Columns of the first unique index, skipping the empty statistics rows
    /// some drivers report
    fn first_unique_index(conn: &mut dyn Connection, schema: Option<&str>, table: &str) -> Option<Vec<String>> {
        let rows = match conn.unique_indexes(schema, table) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(table, error = %e, "unique index lookup failed");
                return None;
            }
        };
        let mut indexes: Vec<(String, Vec<String>)> = Vec::new();
        for row in rows {
            let Some(column) = row.column.filter(|c| !c.is_empty()) else {
                continue;
            };
            match indexes.iter_mut().find(|(name, _)| *name == row.index_name) {
                Some((_, columns)) => columns.push(column),
                None => indexes.push((row.index_name, vec![column])),
            }
        }
        indexes.into_iter().next().map(|(_, columns)| columns)
    }

    fn classify(&self, conn: &mut dyn Connection, table: &str, key_columns: &[String]) -> PrimaryKey {
        let types = self.column_types(conn, table);
        let auto = self.probe_auto_increment(conn, table, key_columns);
        let columns = key_columns
            .iter()
            .zip(auto)
            .map(|(name, is_auto)| {
                let kind = if is_auto {
                    GenerationKind::AutoGenerated
                } else {
                    match self
                        .dialect
                        .sequence_for_column(conn, self.database_schema.as_deref(), table, name)
                    {
                        Ok(Some(seq)) => GenerationKind::Sequence(seq),
                        Ok(None) => GenerationKind::NonIncrementing,
                        Err(e) => {
                            warn!(table, column = %name, error = %e, "sequence lookup failed");
                            GenerationKind::NonIncrementing
                        }
                    }
                };
                let data_type = types.get(name).cloned().unwrap_or(DataType::Unknown);
                PrimaryKeyColumn::new(name.clone(), data_type, kind)
            })
            .collect();
        PrimaryKey::new(table, columns)
    }

    /// Zero-row select; the driver reports auto-increment per column
    fn probe_auto_increment(&self, conn: &mut dyn Connection, table: &str, columns: &[String]) -> Vec<bool> {
        let list = columns
            .iter()
            .map(|c| self.dialect.escape_name(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {list} FROM {} WHERE 1 = 0",
            self.dialect.table_name(self.database_schema.as_deref(), table)
        );
        let probe = conn.prepare(&sql).and_then(|mut stmt| {
            let flags = stmt.query(&[]).map(|mut rs| {
                let flags = (0..columns.len()).map(|i| rs.is_auto_increment(i)).collect::<Vec<_>>();
                if let Err(e) = rs.close() {
                    warn!(error = %e, "failed to close result set");
                }
                flags
            });
            if let Err(e) = stmt.close() {
                warn!(error = %e, "failed to close statement");
            }
            flags
        });
        probe.unwrap_or_else(|e| {
            warn!(table, error = %e, "auto-increment probe failed");
            vec![false; columns.len()]
        })
    }

    fn column_types(&self, conn: &mut dyn Connection, table: &str) -> HashMap<String, DataType> {
        let mappings = self.dialect.type_mappings();
        match conn.columns(self.database_schema.as_deref(), table) {
            Ok(columns) => columns
                .into_iter()
                .map(|c| {
                    let class = mappings.class_for_column(&c.type_name, c.sql_type);
                    (c.name, class)
                })
                .collect(),
            Err(e) => {
                warn!(table, error = %e, "column metadata lookup failed");
                HashMap::new()
            }
        }
    }
}

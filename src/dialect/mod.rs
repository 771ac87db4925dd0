/// SQL dialects - backend-specific syntax, type mappings and capabilities
///
/// A dialect is one object implementing [`Dialect`]. Whether statements are
/// rendered with inline literals or `?` placeholders is a runtime property
/// ([`ExecutionMode`]), not a type hierarchy.

pub mod types;
pub mod postgis;
pub mod mysql;
pub mod generic;

pub use types::TypeMappings;
pub use postgis::PostgisDialect;
pub use mysql::MySqlDialect;
pub use generic::GenericDialect;

use std::fmt::{self, Write};
use std::sync::Arc;
use crate::backend::{Connection, ResultSet};
use crate::core::{AttributeDescriptor, DataType, Envelope, FeatureSchema, Geometry, GeometryKind, StoreError, Value};
use crate::filter::{FilterCapabilities, SpatialOp};
use crate::sql::AggregateKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Literals bound through `?` placeholders
    Prepared,
    /// Literals rendered into the SQL text
    Textual,
}

/// Geometry column metadata a dialect can introspect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryColumnInfo {
    pub kind: GeometryKind,
    pub srid: Option<i32>,
    pub dimension: u8,
}

pub trait Dialect: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn execution_mode(&self) -> ExecutionMode;

    /// Quotes an identifier, doubling embedded quote characters
    fn escape_name(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Table reference with the optional database schema prefix
    fn table_name(&self, database_schema: Option<&str>, table: &str) -> String {
        match database_schema {
            Some(schema) => format!("{}.{}", self.escape_name(schema), self.escape_name(table)),
            None => self.escape_name(table),
        }
    }

    fn filter_capabilities(&self) -> FilterCapabilities;

    fn supports_limit_offset(&self) -> bool;

    /// Appends native paging. Only called when `supports_limit_offset` is true.
    fn apply_limit_offset(&self, sql: &mut String, limit: Option<u64>, offset: u64) {
        if let Some(limit) = limit {
            let _ = write!(sql, " LIMIT {limit}");
        }
        if offset > 0 {
            let _ = write!(sql, " OFFSET {offset}");
        }
    }

    fn type_mappings(&self) -> &TypeMappings;

    fn supports_arrays(&self) -> bool {
        false
    }

    /// Backend aggregate function for `kind`; `None` disables pushdown
    fn aggregate_function_name(&self, kind: AggregateKind) -> Option<&'static str> {
        match kind {
            AggregateKind::Count => Some("count"),
            AggregateKind::Sum => Some("sum"),
            AggregateKind::Min => Some("min"),
            AggregateKind::Max => Some("max"),
            AggregateKind::Average => Some("avg"),
            AggregateKind::Unique => Some("distinct"),
            AggregateKind::StandardDeviation => None,
        }
    }

    /// SQL function implementing a filter function, when one exists
    fn function_name(&self, name: &str) -> Option<&'static str> {
        Some(match name.to_lowercase().as_str() {
            "strtouppercase" | "upper" => "UPPER",
            "strtolowercase" | "lower" => "LOWER",
            "strtrim" | "trim" => "TRIM",
            "strlength" | "length" => "LENGTH",
            "strconcat" | "concat" => "CONCAT",
            "abs" => "ABS",
            _ => return None,
        })
    }

    /// Whether ORDER BY can be pushed down for this attribute
    fn can_sort(&self, attribute: &AttributeDescriptor) -> bool {
        !attribute.is_geometry()
    }

    // Geometry encoding

    /// Select-list expression reading a geometry column as text
    fn encode_geometry_column(&self, column: &str, attribute: &AttributeDescriptor, simplify: Option<f64>) -> String;

    /// Select-list expression producing the envelope of a geometry column
    fn encode_geometry_envelope(&self, column: &str) -> String;

    fn decode_geometry_value(&self, value: Value) -> Result<Option<Geometry>, StoreError> {
        decode_wkt_value(value)
    }

    fn decode_geometry_envelope(&self, value: Value) -> Result<Option<Envelope>, StoreError> {
        Ok(self.decode_geometry_value(value)?.map(|g| g.envelope()).filter(|e| !e.is_null()))
    }

    /// Geometry rendered inline for textual statements
    fn encode_geometry_literal(&self, geometry: &Geometry, srid: Option<i32>, dimension: u8) -> String;

    /// Geometry placeholder for prepared statements; must contain exactly one `?`
    fn encode_geometry_placeholder(&self, srid: Option<i32>, dimension: u8) -> String;

    /// Driver value bound for a geometry placeholder
    fn prepare_geometry_value(&self, geometry: &Geometry) -> Value {
        Value::Text(geometry.to_wkt())
    }

    /// Spatial predicate over an encoded column and geometry; `None` if unsupported
    fn encode_spatial(&self, op: SpatialOp, column: &str, geometry: &str, distance: Option<f64>) -> Option<String>;

    /// Native column type for a geometry attribute in CREATE TABLE
    fn geometry_type_name(&self, attribute: &AttributeDescriptor) -> String;

    fn encode_value_literal(&self, value: &Value, out: &mut String) {
        encode_standard_literal(value, out);
    }

    // Schema management

    /// Column definition for a generated key column
    fn generated_key_column(&self, column: &str) -> String;

    /// Statements run after CREATE TABLE (spatial indexes, metadata registration)
    fn post_create_table(&self, _database_schema: Option<&str>, _schema: &FeatureSchema) -> Vec<String> {
        Vec::new()
    }

    /// Native type name for a column of `data_type`
    fn sql_type_name(&self, data_type: &DataType) -> String {
        let mappings = self.type_mappings();
        let sql = mappings.sql_type_for_class(data_type);
        mappings.sql_type_name(sql).unwrap_or("TEXT").to_string()
    }

    // Metadata hooks

    /// Sequence backing a key column, if any
    fn sequence_for_column(
        &self,
        _conn: &mut dyn Connection,
        _database_schema: Option<&str>,
        _table: &str,
        _column: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    fn next_sequence_value_sql(&self, database_schema: Option<&str>, sequence: &str) -> String {
        format!("NEXT VALUE FOR {}", self.table_name(database_schema, sequence))
    }

    /// Geometry column metadata from the backend's catalog
    fn geometry_column_info(
        &self,
        _conn: &mut dyn Connection,
        _database_schema: Option<&str>,
        _table: &str,
        _column: &str,
    ) -> Result<Option<GeometryColumnInfo>, StoreError> {
        Ok(None)
    }

    /// Fast-path bounds from index statistics; `None` falls back to SQL
    fn estimated_extent(
        &self,
        _conn: &mut dyn Connection,
        _database_schema: Option<&str>,
        _table: &str,
        _column: &str,
    ) -> Result<Option<Envelope>, StoreError> {
        Ok(None)
    }

    /// Reads a single-column primary key value for feature-id encoding
    fn read_key_value(&self, rs: &dyn ResultSet, index: usize) -> Result<Option<String>, StoreError> {
        let value = rs.get(index)?;
        Ok(if value.is_null() { None } else { Some(value.to_string()) })
    }
}

/// Text (or raw geometry) value read back as a geometry
pub fn decode_wkt_value(value: Value) -> Result<Option<Geometry>, StoreError> {
    match value {
        Value::Null => Ok(None),
        Value::Geometry(g) => Ok(Some(g)),
        Value::Text(s) if s.trim().is_empty() => Ok(None),
        Value::Text(s) => Geometry::parse_wkt(&s).map(Some),
        other => Err(StoreError::TypeMismatch(format!("expected WKT text, got {other:?}"))),
    }
}

/// ANSI literal rendering shared by the dialects
pub fn encode_standard_literal(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("NULL"),
        Value::Boolean(b) => out.push_str(if *b { "TRUE" } else { "FALSE" }),
        Value::SmallInt(_) | Value::Integer(_) | Value::Numeric(_) => {
            let _ = write!(out, "{value}");
        }
        Value::Real(r) => {
            let _ = write!(out, "{r:?}");
        }
        Value::Text(s) | Value::Json(s) => quote(s, out),
        Value::Date(_) => {
            let _ = write!(out, "DATE '{value}'");
        }
        Value::Time(_) => {
            let _ = write!(out, "TIME '{value}'");
        }
        Value::Timestamp(t) => {
            let _ = write!(out, "TIMESTAMP '{}'", t.format("%Y-%m-%d %H:%M:%S%.f"));
        }
        Value::TimestampTz(t) => {
            let _ = write!(out, "TIMESTAMP '{}'", t.to_rfc3339());
        }
        Value::Uuid(u) => quote(&u.to_string(), out),
        Value::Bytea(b) => {
            let _ = write!(out, "X'{}'", hex::encode(b));
        }
        Value::Geometry(g) => quote(&g.to_wkt(), out),
        Value::Array(_) => quote(&value.to_string(), out),
    }
}

/// Single-quoted string literal with embedded quotes doubled
pub fn quote(s: &str, out: &mut String) {
    out.push('\'');
    out.push_str(&s.replace('\'', "''"));
    out.push('\'');
}

/// Dialect by name, as used in configuration and the CLI
pub fn dialect_by_name(name: &str) -> Result<Arc<dyn Dialect>, StoreError> {
    match name.to_lowercase().as_str() {
        "postgis" | "postgres" | "postgresql" => Ok(Arc::new(PostgisDialect::new())),
        "mysql" | "mariadb" => Ok(Arc::new(MySqlDialect::new())),
        "generic" | "ansi" => Ok(Arc::new(GenericDialect::new())),
        other => Err(StoreError::Config(format!("unknown dialect '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_literals() {
        let render = |v: Value| {
            let mut out = String::new();
            encode_standard_literal(&v, &mut out);
            out
        };
        assert_eq!(render(Value::Text("O'Brien".to_string())), "'O''Brien'");
        assert_eq!(render(Value::Integer(-4)), "-4");
        assert_eq!(render(Value::Real(2.0)), "2.0");
        assert_eq!(render(Value::Null), "NULL");
        assert_eq!(render(Value::Bytea(vec![0xab])), "X'ab'");
    }

    #[test]
    fn test_dialect_by_name() {
        assert_eq!(dialect_by_name("PostGIS").unwrap().name(), "postgis");
        assert_eq!(dialect_by_name("mysql").unwrap().execution_mode(), ExecutionMode::Textual);
        assert!(matches!(dialect_by_name("oracle"), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_decode_wkt_value() {
        assert_eq!(decode_wkt_value(Value::Null).unwrap(), None);
        let g = decode_wkt_value(Value::Text("POINT (1 2)".to_string())).unwrap().unwrap();
        assert_eq!(g, Geometry::point(1.0, 2.0));
        assert!(decode_wkt_value(Value::Integer(1)).is_err());
    }
}

/// PostgreSQL + PostGIS, prepared-statement family

use std::fmt::Write;
use std::sync::OnceLock;
use tracing::debug;
use crate::backend::{fetch_all, Connection};
use crate::core::{AttributeDescriptor, DataType, Envelope, FeatureSchema, Geometry, GeometryKind, SqlType, StoreError, Value};
use crate::filter::{FilterCapabilities, SpatialOp};
use crate::sql::AggregateKind;
use super::{encode_standard_literal, quote, Dialect, ExecutionMode, GeometryColumnInfo, TypeMappings};

#[derive(Debug, Default)]
pub struct PostgisDialect {
    mappings: OnceLock<TypeMappings>,
}

impl PostgisDialect {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn build_mappings() -> TypeMappings {
        let mut m = TypeMappings::base();
        for (name, class) in [
            ("int2", DataType::SmallInt),
            ("smallint", DataType::SmallInt),
            ("int4", DataType::Integer),
            ("int8", DataType::Integer),
            ("serial", DataType::Integer),
            ("bigserial", DataType::Integer),
            ("float4", DataType::Real),
            ("float8", DataType::Real),
            ("numeric", DataType::Numeric),
            ("varchar", DataType::Text),
            ("bpchar", DataType::Text),
            ("text", DataType::Text),
            ("bool", DataType::Boolean),
            ("date", DataType::Date),
            ("time", DataType::Time),
            ("timestamp", DataType::Timestamp),
            ("timestamptz", DataType::TimestampTz),
            ("uuid", DataType::Uuid),
            ("json", DataType::Json),
            ("jsonb", DataType::Json),
            ("bytea", DataType::Bytea),
            ("geometry", DataType::Geometry(GeometryKind::Geometry)),
            ("geography", DataType::Geometry(GeometryKind::Geometry)),
            ("_int4", DataType::Array(Box::new(DataType::Integer))),
            ("_int8", DataType::Array(Box::new(DataType::Integer))),
            ("_text", DataType::Array(Box::new(DataType::Text))),
            ("_varchar", DataType::Array(Box::new(DataType::Text))),
            ("_float8", DataType::Array(Box::new(DataType::Real))),
        ] {
            m.register_type_name(name, class);
        }
        m.override_sql_type_name(SqlType::Blob, "BYTEA")
            .override_sql_type_name(SqlType::Double, "DOUBLE PRECISION")
            .override_sql_type_name(SqlType::TimestampWithTimezone, "TIMESTAMPTZ");
        m
    }

    /// `schema.table` as a plain string literal for catalog functions
    fn qualified_literal(database_schema: Option<&str>, table: &str) -> String {
        match database_schema {
            Some(s) => format!("\"{s}\".\"{table}\""),
            None => format!("\"{table}\""),
        }
    }
}

impl Dialect for PostgisDialect {
    fn name(&self) -> &'static str {
        "postgis"
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Prepared
    }

    fn filter_capabilities(&self) -> FilterCapabilities {
        FilterCapabilities::basic()
            .with_all_spatial()
            .with_arithmetic()
            .with_function("strToUpperCase")
            .with_function("strToLowerCase")
            .with_function("strTrim")
            .with_function("strLength")
            .with_function("strConcat")
            .with_function("abs")
    }

    fn supports_limit_offset(&self) -> bool {
        true
    }

    fn type_mappings(&self) -> &TypeMappings {
        self.mappings.get_or_init(Self::build_mappings)
    }

    fn supports_arrays(&self) -> bool {
        true
    }

    fn aggregate_function_name(&self, kind: AggregateKind) -> Option<&'static str> {
        match kind {
            AggregateKind::StandardDeviation => Some("stddev_samp"),
            AggregateKind::Count => Some("count"),
            AggregateKind::Sum => Some("sum"),
            AggregateKind::Min => Some("min"),
            AggregateKind::Max => Some("max"),
            AggregateKind::Average => Some("avg"),
            AggregateKind::Unique => Some("distinct"),
        }
    }

    fn function_name(&self, name: &str) -> Option<&'static str> {
        match name.to_lowercase().as_str() {
            "strlength" | "length" => Some("char_length"),
            "strtouppercase" | "upper" => Some("upper"),
            "strtolowercase" | "lower" => Some("lower"),
            "strtrim" | "trim" => Some("btrim"),
            "strconcat" | "concat" => Some("concat"),
            "abs" => Some("abs"),
            _ => None,
        }
    }

    fn encode_geometry_column(&self, column: &str, attribute: &AttributeDescriptor, simplify: Option<f64>) -> String {
        let is_point = matches!(
            attribute.data_type,
            DataType::Geometry(GeometryKind::Point | GeometryKind::MultiPoint)
        );
        match simplify {
            Some(distance) if !is_point && distance > 0.0 => {
                format!("ST_AsText(ST_Simplify({column}, {distance:?}))")
            }
            _ => format!("ST_AsText({column})"),
        }
    }

    fn encode_geometry_envelope(&self, column: &str) -> String {
        format!("ST_AsText(ST_Extent({column})::geometry)")
    }

    fn encode_geometry_literal(&self, geometry: &Geometry, srid: Option<i32>, _dimension: u8) -> String {
        let mut out = String::from("ST_GeomFromText(");
        quote(&geometry.to_wkt(), &mut out);
        if let Some(srid) = srid {
            let _ = write!(out, ", {srid}");
        }
        out.push(')');
        out
    }

    fn encode_geometry_placeholder(&self, srid: Option<i32>, _dimension: u8) -> String {
        match srid {
            Some(srid) => format!("ST_GeomFromText(?, {srid})"),
            None => "ST_GeomFromText(?)".to_string(),
        }
    }

    fn encode_spatial(&self, op: SpatialOp, column: &str, geometry: &str, distance: Option<f64>) -> Option<String> {
        let function = match op {
            SpatialOp::BBox => return Some(format!("{column} && {geometry}")),
            SpatialOp::DWithin => {
                return Some(format!("ST_DWithin({column}, {geometry}, {:?})", distance?));
            }
            SpatialOp::Beyond => {
                return Some(format!("NOT ST_DWithin({column}, {geometry}, {:?})", distance?));
            }
            SpatialOp::Intersects => "ST_Intersects",
            SpatialOp::Contains => "ST_Contains",
            SpatialOp::Within => "ST_Within",
            SpatialOp::Disjoint => "ST_Disjoint",
            SpatialOp::Touches => "ST_Touches",
            SpatialOp::Crosses => "ST_Crosses",
            SpatialOp::Overlaps => "ST_Overlaps",
            SpatialOp::Equals => "ST_Equals",
        };
        Some(format!("{function}({column}, {geometry})"))
    }

    fn geometry_type_name(&self, attribute: &AttributeDescriptor) -> String {
        let kind = match &attribute.data_type {
            DataType::Geometry(kind) => kind.as_str(),
            _ => GeometryKind::Geometry.as_str(),
        };
        let z = if attribute.coordinate_dimension == Some(3) { "Z" } else { "" };
        match attribute.srid {
            Some(srid) => format!("geometry({kind}{z}, {srid})"),
            None => format!("geometry({kind}{z})"),
        }
    }

    fn encode_value_literal(&self, value: &Value, out: &mut String) {
        match value {
            Value::Bytea(b) => {
                let _ = write!(out, "'\\x{}'::bytea", hex::encode(b));
            }
            Value::Uuid(u) => {
                let _ = write!(out, "'{u}'::uuid");
            }
            Value::Array(items) => {
                out.push_str("ARRAY[");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.encode_value_literal(item, out);
                }
                out.push(']');
            }
            other => encode_standard_literal(other, out),
        }
    }

    fn sql_type_name(&self, data_type: &DataType) -> String {
        match data_type {
            DataType::Uuid => "UUID".to_string(),
            DataType::Json => "JSONB".to_string(),
            DataType::Text => "VARCHAR".to_string(),
            DataType::Array(inner) => format!("{}[]", self.sql_type_name(inner)),
            other => {
                let mappings = self.type_mappings();
                let sql = mappings.sql_type_for_class(other);
                mappings.sql_type_name(sql).unwrap_or("TEXT").to_string()
            }
        }
    }

    fn generated_key_column(&self, column: &str) -> String {
        format!("{} SERIAL PRIMARY KEY", self.escape_name(column))
    }

    fn post_create_table(&self, database_schema: Option<&str>, schema: &FeatureSchema) -> Vec<String> {
        schema
            .geometry_attributes()
            .map(|attr| {
                format!(
                    "CREATE INDEX {} ON {} USING GIST ({})",
                    self.escape_name(&format!("spatial_{}_{}", schema.name, attr.name.to_lowercase())),
                    self.table_name(database_schema, &schema.name),
                    self.escape_name(&attr.name),
                )
            })
            .collect()
    }

    fn sequence_for_column(
        &self,
        conn: &mut dyn Connection,
        database_schema: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<Option<String>, StoreError> {
        let rows = fetch_all(
            conn,
            "SELECT pg_get_serial_sequence(?, ?)",
            &[
                Value::Text(Self::qualified_literal(database_schema, table)),
                Value::Text(column.to_string()),
            ],
            1,
        )?;
        let sequence = rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .and_then(|v| v.as_text().map(str::to_string));
        debug!(table, column, ?sequence, "sequence lookup");
        Ok(sequence)
    }

    fn next_sequence_value_sql(&self, database_schema: Option<&str>, sequence: &str) -> String {
        let mut out = String::from("nextval(");
        match database_schema {
            Some(schema) if !sequence.contains('.') => quote(&format!("\"{schema}\".\"{sequence}\""), &mut out),
            _ => quote(sequence, &mut out),
        }
        out.push(')');
        out
    }

    fn geometry_column_info(
        &self,
        conn: &mut dyn Connection,
        database_schema: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<Option<GeometryColumnInfo>, StoreError> {
        let rows = fetch_all(
            conn,
            "SELECT type, srid, coord_dimension FROM geometry_columns \
             WHERE f_table_schema = ? AND f_table_name = ? AND f_geometry_column = ?",
            &[
                Value::Text(database_schema.unwrap_or("public").to_string()),
                Value::Text(table.to_string()),
                Value::Text(column.to_string()),
            ],
            3,
        )?;
        Ok(rows.into_iter().next().map(|row| GeometryColumnInfo {
            kind: row[0]
                .as_text()
                .and_then(GeometryKind::from_name)
                .unwrap_or(GeometryKind::Geometry),
            // SRID 0 means "unknown" in PostGIS
            srid: row[1].as_int().and_then(|s| i32::try_from(s).ok()).filter(|s| *s > 0),
            dimension: row[2].as_int().and_then(|d| u8::try_from(d).ok()).unwrap_or(2),
        }))
    }

    fn estimated_extent(
        &self,
        conn: &mut dyn Connection,
        database_schema: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<Option<Envelope>, StoreError> {
        let rows = fetch_all(
            conn,
            "SELECT ST_AsText(ST_EstimatedExtent(?, ?, ?)::geometry)",
            &[
                Value::Text(database_schema.unwrap_or("public").to_string()),
                Value::Text(table.to_string()),
                Value::Text(column.to_string()),
            ],
            1,
        )?;
        match rows.into_iter().next().and_then(|row| row.into_iter().next()) {
            Some(value) => self.decode_geometry_envelope(value),
            None => Ok(None),
        }
    }
}

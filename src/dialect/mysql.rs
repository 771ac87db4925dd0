/// MySQL / MariaDB, textual family

use std::fmt::Write;
use std::sync::OnceLock;
use crate::core::{AttributeDescriptor, DataType, Geometry, GeometryKind, SqlType, Value};
use crate::filter::{FilterCapabilities, SpatialOp};
use super::{encode_standard_literal, quote, Dialect, ExecutionMode, TypeMappings};

/// Row count MySQL expects when only an offset is given
const NO_LIMIT: u64 = 18_446_744_073_709_551_615;

#[derive(Debug, Default)]
pub struct MySqlDialect {
    mappings: OnceLock<TypeMappings>,
}

impl MySqlDialect {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn build_mappings() -> TypeMappings {
        let mut m = TypeMappings::base();
        for (name, class) in [
            ("tinyint", DataType::SmallInt),
            ("smallint", DataType::SmallInt),
            ("int", DataType::Integer),
            ("integer", DataType::Integer),
            ("bigint", DataType::Integer),
            ("float", DataType::Real),
            ("double", DataType::Real),
            ("decimal", DataType::Numeric),
            ("varchar", DataType::Text),
            ("text", DataType::Text),
            ("longtext", DataType::Text),
            ("date", DataType::Date),
            ("time", DataType::Time),
            ("datetime", DataType::Timestamp),
            ("timestamp", DataType::Timestamp),
            ("json", DataType::Json),
            ("blob", DataType::Bytea),
            ("longblob", DataType::Bytea),
            ("geometry", DataType::Geometry(GeometryKind::Geometry)),
            ("point", DataType::Geometry(GeometryKind::Point)),
            ("linestring", DataType::Geometry(GeometryKind::LineString)),
            ("polygon", DataType::Geometry(GeometryKind::Polygon)),
            ("multipoint", DataType::Geometry(GeometryKind::MultiPoint)),
            ("multilinestring", DataType::Geometry(GeometryKind::MultiLineString)),
            ("multipolygon", DataType::Geometry(GeometryKind::MultiPolygon)),
            ("geometrycollection", DataType::Geometry(GeometryKind::GeometryCollection)),
        ] {
            m.register_type_name(name, class);
        }
        m.override_sql_type_name(SqlType::Varchar, "VARCHAR(255)")
            .override_sql_type_name(SqlType::Double, "DOUBLE")
            .override_sql_type_name(SqlType::TimestampWithTimezone, "DATETIME")
            .override_sql_type_name(SqlType::LongVarchar, "LONGTEXT");
        m
    }
}

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Textual
    }

    fn escape_name(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
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
    }

    fn supports_limit_offset(&self) -> bool {
        true
    }

    fn apply_limit_offset(&self, sql: &mut String, limit: Option<u64>, offset: u64) {
        match (limit, offset) {
            (Some(limit), 0) => {
                let _ = write!(sql, " LIMIT {limit}");
            }
            (limit, offset) => {
                let _ = write!(sql, " LIMIT {offset}, {}", limit.unwrap_or(NO_LIMIT));
            }
        }
    }

    fn type_mappings(&self) -> &TypeMappings {
        self.mappings.get_or_init(Self::build_mappings)
    }

    fn encode_geometry_column(&self, column: &str, _attribute: &AttributeDescriptor, _simplify: Option<f64>) -> String {
        format!("ST_AsText({column})")
    }

    /// MySQL has no aggregate extent; envelopes come back per row and are
    /// merged by the caller
    fn encode_geometry_envelope(&self, column: &str) -> String {
        format!("ST_AsText(ST_Envelope({column}))")
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
        Some(match op {
            SpatialOp::BBox => format!("MBRIntersects({column}, {geometry})"),
            SpatialOp::DWithin => format!("ST_Distance({column}, {geometry}) <= {:?}", distance?),
            SpatialOp::Beyond => format!("ST_Distance({column}, {geometry}) > {:?}", distance?),
            SpatialOp::Intersects => format!("ST_Intersects({column}, {geometry})"),
            SpatialOp::Contains => format!("ST_Contains({column}, {geometry})"),
            SpatialOp::Within => format!("ST_Within({column}, {geometry})"),
            SpatialOp::Disjoint => format!("ST_Disjoint({column}, {geometry})"),
            SpatialOp::Touches => format!("ST_Touches({column}, {geometry})"),
            SpatialOp::Crosses => format!("ST_Crosses({column}, {geometry})"),
            SpatialOp::Overlaps => format!("ST_Overlaps({column}, {geometry})"),
            SpatialOp::Equals => format!("ST_Equals({column}, {geometry})"),
        })
    }

    fn geometry_type_name(&self, attribute: &AttributeDescriptor) -> String {
        let kind = match &attribute.data_type {
            DataType::Geometry(kind) => kind.as_str(),
            _ => GeometryKind::Geometry.as_str(),
        };
        match attribute.srid {
            Some(srid) => format!("{kind} SRID {srid}"),
            None => kind.to_string(),
        }
    }

    fn encode_value_literal(&self, value: &Value, out: &mut String) {
        match value {
            Value::Boolean(b) => out.push_str(if *b { "1" } else { "0" }),
            Value::Text(s) | Value::Json(s) => {
                // backslash is an escape character in MySQL string literals
                quote(&s.replace('\\', "\\\\"), out);
            }
            Value::Timestamp(t) => {
                let _ = write!(out, "'{}'", t.format("%Y-%m-%d %H:%M:%S%.f"));
            }
            Value::TimestampTz(t) => {
                let _ = write!(out, "'{}'", t.naive_utc().format("%Y-%m-%d %H:%M:%S%.f"));
            }
            other => encode_standard_literal(other, out),
        }
    }

    fn generated_key_column(&self, column: &str) -> String {
        format!("{} INT AUTO_INCREMENT PRIMARY KEY", self.escape_name(column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtick_escaping() {
        let d = MySqlDialect::new();
        assert_eq!(d.escape_name("odd`name"), "`odd``name`");
        assert_eq!(d.table_name(Some("gis"), "roads"), "`gis`.`roads`");
    }

    #[test]
    fn test_limit_syntax() {
        let d = MySqlDialect::new();
        let mut sql = String::from("SELECT 1");
        d.apply_limit_offset(&mut sql, Some(3), 2);
        assert_eq!(sql, "SELECT 1 LIMIT 2, 3");

        let mut sql = String::from("SELECT 1");
        d.apply_limit_offset(&mut sql, None, 5);
        assert_eq!(sql, format!("SELECT 1 LIMIT 5, {NO_LIMIT}"));

        let mut sql = String::from("SELECT 1");
        d.apply_limit_offset(&mut sql, Some(7), 0);
        assert_eq!(sql, "SELECT 1 LIMIT 7");
    }

    #[test]
    fn test_literals() {
        let d = MySqlDialect::new();
        let mut out = String::new();
        d.encode_value_literal(&Value::Text("a\\b'c".to_string()), &mut out);
        assert_eq!(out, "'a\\\\b''c'");
        out.clear();
        d.encode_value_literal(&Value::Boolean(true), &mut out);
        assert_eq!(out, "1");
    }

    #[test]
    fn test_type_mapping() {
        let d = MySqlDialect::new();
        assert_eq!(d.type_mappings().class_for_column("DATETIME", SqlType::Other), DataType::Timestamp);
        assert_eq!(d.sql_type_name(&DataType::Text), "VARCHAR(255)");
        let attr = AttributeDescriptor::geometry("geom", GeometryKind::Point, Some(4326));
        assert_eq!(d.geometry_type_name(&attr), "POINT SRID 4326");
    }
}

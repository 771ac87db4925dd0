/// Lowest-common-denominator ANSI dialect
///
/// No native paging, no spatial pushdown and no function pushdown. Geometries
/// live in text columns as WKT, so every spatial predicate is evaluated in
/// process.

use std::sync::OnceLock;
use crate::core::{AttributeDescriptor, Geometry, SqlType};
use crate::filter::{FilterCapabilities, SpatialOp};
use super::{quote, Dialect, ExecutionMode, TypeMappings};

#[derive(Debug, Default)]
pub struct GenericDialect {
    mappings: OnceLock<TypeMappings>,
}

impl GenericDialect {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn build_mappings() -> TypeMappings {
        let mut m = TypeMappings::base();
        m.override_sql_type_name(SqlType::Blob, "VARBINARY");
        m
    }
}

impl Dialect for GenericDialect {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Textual
    }

    fn filter_capabilities(&self) -> FilterCapabilities {
        FilterCapabilities::basic()
    }

    fn supports_limit_offset(&self) -> bool {
        false
    }

    fn type_mappings(&self) -> &TypeMappings {
        self.mappings.get_or_init(Self::build_mappings)
    }

    fn function_name(&self, _name: &str) -> Option<&'static str> {
        None
    }

    fn encode_geometry_column(&self, column: &str, _attribute: &AttributeDescriptor, _simplify: Option<f64>) -> String {
        column.to_string()
    }

    fn encode_geometry_envelope(&self, column: &str) -> String {
        column.to_string()
    }

    fn encode_geometry_literal(&self, geometry: &Geometry, _srid: Option<i32>, _dimension: u8) -> String {
        let mut out = String::new();
        quote(&geometry.to_wkt(), &mut out);
        out
    }

    fn encode_geometry_placeholder(&self, _srid: Option<i32>, _dimension: u8) -> String {
        "?".to_string()
    }

    fn encode_spatial(&self, _op: SpatialOp, _column: &str, _geometry: &str, _distance: Option<f64>) -> Option<String> {
        None
    }

    fn geometry_type_name(&self, _attribute: &AttributeDescriptor) -> String {
        "TEXT".to_string()
    }

    fn generated_key_column(&self, column: &str) -> String {
        format!("{} INTEGER PRIMARY KEY", self.escape_name(column))
    }
}

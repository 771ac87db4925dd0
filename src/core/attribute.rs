use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use super::data_type::{DataType, SqlType};
use super::geometry::GeometryKind;

/// Integer code <-> label mapping for enumerated columns stored as numbers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnumMapping {
    codes: BTreeMap<i64, String>,
}

impl EnumMapping {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        Self {
            codes: entries.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }

    #[must_use]
    pub fn label(&self, code: i64) -> Option<&str> {
        self.codes.get(&code).map(String::as_str)
    }

    #[must_use]
    pub fn code(&self, label: &str) -> Option<i64> {
        self.codes.iter().find(|(_, v)| v.as_str() == label).map(|(k, _)| *k)
    }
}

/// Describes one attribute of a feature type and the native column behind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    /// Coordinate reference system of a geometry attribute (SRID)
    pub srid: Option<i32>,
    /// Native column metadata, when known
    pub native_type_name: Option<String>,
    pub native_type: Option<SqlType>,
    pub native_srid: Option<i32>,
    pub coordinate_dimension: Option<u8>,
    /// Output alias used when the column name collides in a join projection
    pub column_alias: Option<String>,
    pub enum_mapping: Option<EnumMapping>,
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            srid: None,
            native_type_name: None,
            native_type: None,
            native_srid: None,
            coordinate_dimension: None,
            column_alias: None,
            enum_mapping: None,
        }
    }

    pub fn geometry(name: impl Into<String>, kind: GeometryKind, srid: Option<i32>) -> Self {
        let mut attr = Self::new(name, DataType::Geometry(kind));
        attr.srid = srid;
        attr
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn with_native_type(mut self, name: impl Into<String>, code: SqlType) -> Self {
        self.native_type_name = Some(name.into());
        self.native_type = Some(code);
        self
    }

    #[must_use]
    pub const fn with_native_srid(mut self, srid: i32) -> Self {
        self.native_srid = Some(srid);
        self
    }

    #[must_use]
    pub const fn with_dimension(mut self, dimension: u8) -> Self {
        self.coordinate_dimension = Some(dimension);
        self
    }

    #[must_use]
    pub fn with_enum_mapping(mut self, mapping: EnumMapping) -> Self {
        self.enum_mapping = Some(mapping);
        self
    }

    #[must_use]
    pub const fn is_geometry(&self) -> bool {
        self.data_type.is_geometry()
    }

    /// Name under which the column appears in a result row
    #[must_use]
    pub fn output_name(&self) -> &str {
        self.column_alias.as_deref().unwrap_or(&self.name)
    }
}

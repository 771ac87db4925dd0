/// Row decoding
///
/// A row of a feature query always starts with the key columns, then one
/// column per selected attribute; join branches repeat that layout after the
/// primary type. Each value is read from the cursor once per row and kept in
/// the decoded feature.

use std::sync::Arc;
use tracing::warn;
use crate::backend::ResultSet;
use crate::core::{AttributeDescriptor, Feature, FeatureSchema, JoinedFeature, StoreError, Value};
use crate::dialect::Dialect;
use crate::primary_key::{encode_fid, PrimaryKey};
use crate::sql::JoinKind;

#[derive(Debug, Clone)]
pub struct ResultMapper {
    dialect: Arc<dyn Dialect>,
    key: Arc<PrimaryKey>,
    /// Returned schema; when keys are exposed its first attributes are the
    /// key columns
    schema: Arc<FeatureSchema>,
    exposed_keys: usize,
    /// Index of this type's first column in the row
    offset: usize,
}

impl ResultMapper {
    pub fn new(dialect: Arc<dyn Dialect>, key: Arc<PrimaryKey>, schema: Arc<FeatureSchema>, expose_keys: bool) -> Self {
        let exposed_keys = if expose_keys { key.columns.len() } else { 0 };
        Self {
            dialect,
            key,
            schema,
            exposed_keys,
            offset: 0,
        }
    }

    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    /// Columns this type occupies in a row
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.key.columns.len() + self.schema.attributes.len() - self.exposed_keys
    }

    /// Non-key attributes the SELECT must project, in order
    #[must_use]
    pub fn selected_attributes(&self) -> &[AttributeDescriptor] {
        &self.schema.attributes[self.exposed_keys..]
    }

    fn column_of(&self, index: usize) -> usize {
        if index < self.exposed_keys {
            self.offset + index
        } else {
            self.offset + self.key.columns.len() + index - self.exposed_keys
        }
    }

    /// Feature id of the current row
    pub fn encode_fid(&self, rs: &dyn ResultSet) -> Result<String, StoreError> {
        let type_name = self.schema.name.as_str();
        match self.key.columns.len() {
            0 => Ok(encode_fid(type_name, &[])),
            1 => Ok(encode_fid(type_name, &[self.dialect.read_key_value(rs, self.offset)?])),
            n => {
                let mut parts = Vec::with_capacity(n);
                for i in 0..n {
                    let value = rs.get(self.offset + i)?;
                    parts.push(if value.is_null() { None } else { Some(value.to_string()) });
                }
                Ok(encode_fid(type_name, &parts))
            }
        }
    }

    /// Value of the schema attribute at `index` in the current row
    pub fn decode(&self, rs: &dyn ResultSet, index: usize) -> Result<Value, StoreError> {
        let attr = self
            .schema
            .attributes
            .get(index)
            .ok_or_else(|| StoreError::AttributeNotFound(format!("#{index}")))?;
        let raw = rs.get(self.column_of(index))?;
        if attr.is_geometry() {
            return Ok(match self.dialect.decode_geometry_value(raw)? {
                Some(mut geometry) => {
                    if geometry.srid.is_none() {
                        geometry.srid = attr.srid;
                    }
                    Value::Geometry(geometry)
                }
                None => Value::Null,
            });
        }
        if let (Some(mapping), Some(code)) = (&attr.enum_mapping, raw.as_int()) {
            if let Some(label) = mapping.label(code) {
                return Ok(Value::Text(label.to_string()));
            }
        }
        Ok(Self::coerce(raw, attr))
    }

    fn coerce(raw: Value, attr: &AttributeDescriptor) -> Value {
        if raw.conforms_to(&attr.data_type) {
            return raw;
        }
        match raw.coerce_to(&attr.data_type) {
            Ok(value) => value,
            Err(e) => {
                warn!(attribute = %attr.name, expected = %attr.data_type, error = %e, "keeping value of unexpected type");
                raw
            }
        }
    }

    /// Decodes the current row into a feature
    pub fn map_row(&self, rs: &dyn ResultSet) -> Result<Feature, StoreError> {
        let id = self.encode_fid(rs)?;
        let values = (0..self.schema.attributes.len())
            .map(|i| self.decode(rs, i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Feature::new(id, Arc::clone(&self.schema), values))
    }

    /// True when an outer join matched nothing: every key column is NULL, or
    /// for a keyless type every attribute column
    pub fn is_absent(&self, rs: &dyn ResultSet) -> Result<bool, StoreError> {
        let columns = if self.key.is_null() {
            self.offset..self.offset + self.column_count()
        } else {
            self.offset..self.offset + self.key.columns.len()
        };
        for column in columns {
            if !rs.get(column)?.is_null() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Decoder of one join branch, placed after the primary type's columns
#[derive(Debug, Clone)]
pub struct BranchMapper {
    pub name: String,
    pub kind: JoinKind,
    pub mapper: ResultMapper,
}

impl BranchMapper {
    pub fn map_row(&self, rs: &dyn ResultSet) -> Result<JoinedFeature, StoreError> {
        let feature = if self.kind == JoinKind::Outer && self.mapper.is_absent(rs)? {
            None
        } else {
            Some(self.mapper.map_row(rs)?)
        };
        Ok(JoinedFeature {
            name: self.name.clone(),
            feature,
        })
    }
}

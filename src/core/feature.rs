use std::sync::Arc;
use super::error::StoreError;
use super::schema::FeatureSchema;
use super::value::Value;

/// A decoded row: identity plus attribute values in schema order
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: String,
    pub schema: Arc<FeatureSchema>,
    pub values: Vec<Value>,
    /// Features of joined types, one slot per join (None for an unmatched outer join)
    pub joined: Vec<JoinedFeature>,
    /// Insert using the key values encoded in `id` instead of generating them
    pub use_provided_id: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedFeature {
    pub name: String,
    pub feature: Option<Feature>,
}

impl Feature {
    #[must_use]
    pub fn new(id: impl Into<String>, schema: Arc<FeatureSchema>, values: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            schema,
            values,
            joined: Vec::new(),
            use_provided_id: false,
        }
    }

    /// Feature with every attribute NULL, the starting point of an insert
    #[must_use]
    pub fn empty(schema: Arc<FeatureSchema>) -> Self {
        let values = vec![Value::Null; schema.attributes.len()];
        Self::new(String::new(), schema, values)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema.index_of(name).and_then(|i| self.values.get(i))
    }

    pub fn set(&mut self, name: &str, value: Value) -> Result<(), StoreError> {
        let idx = self
            .schema
            .index_of(name)
            .ok_or_else(|| StoreError::AttributeNotFound(name.to_string()))?;
        self.values[idx] = value;
        Ok(())
    }

    #[must_use]
    pub fn joined(&self, name: &str) -> Option<&Feature> {
        self.joined
            .iter()
            .find(|j| j.name == name)
            .and_then(|j| j.feature.as_ref())
    }
}

/// Pending modifications of one feature.
///
/// Holds a copy of the row's values and a dirty bitmap. Nothing touches the
/// database until the owning writer commits the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedFeature {
    feature: Feature,
    dirty: Vec<bool>,
}

impl StagedFeature {
    #[must_use]
    pub fn new(feature: Feature) -> Self {
        let dirty = vec![false; feature.values.len()];
        Self { feature, dirty }
    }

    #[must_use]
    pub const fn feature(&self) -> &Feature {
        &self.feature
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.feature.id
    }

    pub fn set(&mut self, name: &str, value: Value) -> Result<(), StoreError> {
        let idx = self
            .feature
            .schema
            .index_of(name)
            .ok_or_else(|| StoreError::AttributeNotFound(name.to_string()))?;
        self.set_at(idx, value);
        Ok(())
    }

    pub fn set_at(&mut self, idx: usize, value: Value) {
        self.feature.values[idx] = value;
        self.dirty[idx] = true;
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.iter().any(|d| *d)
    }

    /// Indices of modified attributes, in schema order
    #[must_use]
    pub fn dirty_indices(&self) -> Vec<usize> {
        self.dirty
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.then_some(i))
            .collect()
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.feature.id = id.into();
    }

    pub const fn set_use_provided_id(&mut self, flag: bool) {
        self.feature.use_provided_id = flag;
    }

    #[must_use]
    pub fn into_feature(self) -> Feature {
        self.feature
    }
}

use serde::{Deserialize, Serialize};
use super::attribute::AttributeDescriptor;
use super::error::StoreError;

/// Feature type: a named, ordered list of attribute descriptors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub name: String,
    pub attributes: Vec<AttributeDescriptor>,
}

impl FeatureSchema {
    pub fn new(name: impl Into<String>, attributes: Vec<AttributeDescriptor>) -> Self {
        Self {
            name: name.into(),
            attributes,
        }
    }

    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// First geometry attribute, used when a spatial filter names no property
    #[must_use]
    pub fn default_geometry(&self) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.is_geometry())
    }

    pub fn geometry_attributes(&self) -> impl Iterator<Item = &AttributeDescriptor> {
        self.attributes.iter().filter(|a| a.is_geometry())
    }

    /// Sub-schema with the given attributes, in the requested order
    pub fn project(&self, names: &[String]) -> Result<Self, StoreError> {
        let attributes = names
            .iter()
            .map(|n| {
                self.attribute(n)
                    .cloned()
                    .ok_or_else(|| StoreError::AttributeNotFound(n.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(self.name.clone(), attributes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, GeometryKind};

    fn roads() -> FeatureSchema {
        FeatureSchema::new(
            "roads",
            vec![
                AttributeDescriptor::new("name", DataType::Text),
                AttributeDescriptor::geometry("geom", GeometryKind::LineString, Some(4326)),
                AttributeDescriptor::new("lanes", DataType::Integer),
            ],
        )
    }

    #[test]
    fn test_lookup() {
        let schema = roads();
        assert_eq!(schema.index_of("lanes"), Some(2));
        assert_eq!(schema.index_of("speed"), None);
        assert_eq!(schema.default_geometry().map(|a| a.name.as_str()), Some("geom"));
    }

    #[test]
    fn test_project() {
        let schema = roads();
        let projected = schema.project(&["lanes".to_string(), "name".to_string()]).unwrap();
        assert_eq!(projected.attributes[0].name, "lanes");
        assert_eq!(projected.attributes.len(), 2);
        assert!(matches!(
            schema.project(&["speed".to_string()]),
            Err(StoreError::AttributeNotFound(_))
        ));
    }
}

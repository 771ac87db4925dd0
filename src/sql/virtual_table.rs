/// Virtual tables - named, parameterized SQL exposed as feature types
///
/// The SQL text may carry `%name%` tokens, substituted from query hints after
/// validation, and at most one `:where_clause:` token that receives the
/// query's filter instead of an outer WHERE.

use std::collections::HashMap;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use crate::core::{GeometryKind, StoreError};

pub const WHERE_PLACEHOLDER: &str = ":where_clause:";

#[derive(Debug, Clone)]
pub struct VirtualTableParameter {
    pub name: String,
    pub default: Option<String>,
    /// Whole-value whitelist applied before substitution
    pub validator: Option<Regex>,
}

impl VirtualTableParameter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            validator: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Anchors `pattern` so it must match the entire value
    pub fn with_validator(mut self, pattern: &str) -> Result<Self, StoreError> {
        self.validator = Some(Regex::new(&format!("^(?:{pattern})$"))?);
        Ok(self)
    }

    fn resolve<'a>(&'a self, values: &'a HashMap<String, String>) -> Result<&'a str, StoreError> {
        match values.get(&self.name) {
            Some(value) => {
                if let Some(validator) = &self.validator {
                    if !validator.is_match(value) {
                        return Err(StoreError::VirtualTable(format!(
                            "value for parameter '{}' does not pass validation",
                            self.name
                        )));
                    }
                }
                Ok(value.as_str())
            }
            None => self.default.as_deref().ok_or_else(|| {
                StoreError::VirtualTable(format!("no value and no default for parameter '{}'", self.name))
            }),
        }
    }
}

/// Geometry column metadata declared on a virtual table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualGeometry {
    pub kind: GeometryKind,
    pub srid: Option<i32>,
    pub dimension: u8,
}

#[derive(Debug, Clone)]
pub struct VirtualTable {
    pub name: String,
    pub sql: String,
    pub parameters: Vec<VirtualTableParameter>,
    pub primary_key_columns: Vec<String>,
    pub geometries: HashMap<String, VirtualGeometry>,
}

impl VirtualTable {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            parameters: Vec::new(),
            primary_key_columns: Vec::new(),
            geometries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, parameter: VirtualTableParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    #[must_use]
    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_geometry(mut self, column: impl Into<String>, geometry: VirtualGeometry) -> Self {
        self.geometries.insert(column.into(), geometry);
        self
    }

    #[must_use]
    pub fn where_placeholder_count(&self) -> usize {
        self.sql.matches(WHERE_PLACEHOLDER).count()
    }

    #[must_use]
    pub fn has_where_placeholder(&self) -> bool {
        self.where_placeholder_count() > 0
    }

    /// Substitutes every `%name%` token in one pass over the original text,
    /// so a substituted value is never expanded again. Values are validated
    /// first and have single quotes doubled. Nothing is returned if any
    /// parameter fails.
    pub fn expand_parameters(&self, values: &HashMap<String, String>) -> Result<String, StoreError> {
        if self.parameters.is_empty() {
            return Ok(self.sql.clone());
        }
        let mut resolved = HashMap::with_capacity(self.parameters.len());
        for parameter in &self.parameters {
            let value = parameter.resolve(values)?;
            resolved.insert(parameter.name.as_str(), value.replace('\'', "''"));
        }
        let names: Vec<String> = self.parameters.iter().map(|p| regex::escape(&p.name)).collect();
        let tokens = Regex::new(&format!("%({})%", names.join("|")))?;
        let sql = tokens.replace_all(&self.sql, |caps: &Captures<'_>| {
            resolved.get(&caps[1]).map_or_else(|| caps[0].to_string(), Clone::clone)
        });
        Ok(sql.into_owned())
    }

    /// Fully expanded SQL with the where placeholder replaced by
    /// `(fragment)`, or by an always-true condition when there is no filter
    pub fn expand(&self, values: &HashMap<String, String>, where_fragment: Option<&str>) -> Result<String, StoreError> {
        let count = self.where_placeholder_count();
        if count > 1 {
            return Err(StoreError::VirtualTable(format!(
                "virtual table '{}' contains {count} {WHERE_PLACEHOLDER} tokens, at most one is allowed",
                self.name
            )));
        }
        let sql = self.expand_parameters(values)?;
        if count == 0 {
            return Ok(sql);
        }
        let replacement = match where_fragment {
            Some(fragment) => format!("({fragment})"),
            None => "1 = 1".to_string(),
        };
        Ok(sql.replacen(WHERE_PLACEHOLDER, &replacement, 1))
    }
}

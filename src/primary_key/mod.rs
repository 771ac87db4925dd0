/// Primary keys - model, resolution heuristics, caching and feature ids

pub mod cache;
pub mod fid;
pub mod resolver;

pub use cache::{KeyedCache, PrimaryKeyCache};
pub use fid::{decode_fid, encode_fid};
pub use resolver::PrimaryKeyResolver;

use serde::{Deserialize, Serialize};
use crate::core::DataType;

/// How values of a key column come into existence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationKind {
    /// Assigned by the database on insert (identity, serial, auto_increment)
    AutoGenerated,
    /// Drawn from the named sequence
    Sequence(String),
    /// Supplied by the writer
    NonIncrementing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyColumn {
    pub name: String,
    pub data_type: DataType,
    pub kind: GenerationKind,
}

impl PrimaryKeyColumn {
    pub fn new(name: impl Into<String>, data_type: DataType, kind: GenerationKind) -> Self {
        Self {
            name: name.into(),
            data_type,
            kind,
        }
    }

    #[must_use]
    pub const fn is_generated(&self) -> bool {
        !matches!(self.kind, GenerationKind::NonIncrementing)
    }
}

/// A table's identifying columns, in key order. No columns is the "null key":
/// the table has no usable identity and rows get synthesized ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub table: String,
    pub columns: Vec<PrimaryKeyColumn>,
}

impl PrimaryKey {
    pub fn new(table: impl Into<String>, columns: Vec<PrimaryKeyColumn>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    pub fn null(table: impl Into<String>) -> Self {
        Self::new(table, Vec::new())
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.columns.is_empty()
    }

    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.name == column)
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&PrimaryKeyColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_key() {
        let pk = PrimaryKey::null("roads");
        assert!(pk.is_null());
        assert!(!pk.contains("fid"));
    }

    #[test]
    fn test_lookup() {
        let pk = PrimaryKey::new(
            "roads",
            vec![
                PrimaryKeyColumn::new("region", DataType::Text, GenerationKind::NonIncrementing),
                PrimaryKeyColumn::new("id", DataType::Integer, GenerationKind::AutoGenerated),
            ],
        );
        assert!(pk.contains("id"));
        assert_eq!(pk.column_names().collect::<Vec<_>>(), vec!["region", "id"]);
        assert!(pk.column("id").is_some_and(PrimaryKeyColumn::is_generated));
        assert!(!pk.column("region").is_some_and(PrimaryKeyColumn::is_generated));
    }
}

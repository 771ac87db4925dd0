/// Query descriptor consumed by the statement builder and the executor

use std::collections::HashMap;
use crate::filter::{Filter, PropertyName};
use super::aggregate::AggregateRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    #[must_use]
    pub const fn sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortBy {
    /// Primary-key order
    Natural(SortOrder),
    Property { name: PropertyName, order: SortOrder },
}

impl SortBy {
    pub fn asc(name: &str) -> Self {
        Self::Property {
            name: PropertyName::parse(name),
            order: SortOrder::Ascending,
        }
    }

    pub fn desc(name: &str) -> Self {
        Self::Property {
            name: PropertyName::parse(name),
            order: SortOrder::Descending,
        }
    }
}

/// Query-scoped hints
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryHints {
    /// Geometry generalization distance passed to the dialect
    pub simplification_distance: Option<f64>,
    /// Overrides the store default for exposing primary-key columns
    pub expose_primary_keys: Option<bool>,
    /// Overrides the store default for the two-valued null adapter
    pub two_valued_logic: Option<bool>,
    /// Values for `%name%` tokens of a virtual table
    pub virtual_table_parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinKind {
    #[default]
    Inner,
    Outer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub type_name: String,
    pub alias: Option<String>,
    pub kind: JoinKind,
    /// Join condition relating the primary type to this one
    pub on: Filter,
    /// Extra restriction on the joined type
    pub filter: Filter,
    pub properties: Option<Vec<String>>,
}

impl Join {
    pub fn inner(type_name: impl Into<String>, on: Filter) -> Self {
        Self {
            type_name: type_name.into(),
            alias: None,
            kind: JoinKind::Inner,
            on,
            filter: Filter::Include,
            properties: None,
        }
    }

    pub fn outer(type_name: impl Into<String>, on: Filter) -> Self {
        Self {
            kind: JoinKind::Outer,
            ..Self::inner(type_name, on)
        }
    }

    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Vec<String>) -> Self {
        self.properties = Some(properties);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub type_name: String,
    pub filter: Filter,
    /// Selected properties; `None` returns every attribute
    pub properties: Option<Vec<String>>,
    pub sort: Vec<SortBy>,
    pub start_index: u64,
    pub max_features: Option<u64>,
    pub joins: Vec<Join>,
    pub hints: QueryHints,
}

impl Query {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            filter: Filter::Include,
            properties: None,
            sort: Vec::new(),
            start_index: 0,
            max_features: None,
            joins: Vec::new(),
            hints: QueryHints::default(),
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = Some(properties.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn sort_by(mut self, sort: SortBy) -> Self {
        self.sort.push(sort);
        self
    }

    #[must_use]
    pub const fn with_offset(mut self, offset: u64) -> Self {
        self.start_index = offset;
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: u64) -> Self {
        self.max_features = Some(limit);
        self
    }

    #[must_use]
    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    #[must_use]
    pub fn with_hints(mut self, hints: QueryHints) -> Self {
        self.hints = hints;
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.hints.virtual_table_parameters.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub const fn is_paged(&self) -> bool {
        self.start_index > 0 || self.max_features.is_some()
    }

    #[must_use]
    pub fn is_join(&self) -> bool {
        !self.joins.is_empty()
    }

    /// Whether a grouped or limited aggregate needs the subquery form
    #[must_use]
    pub fn aggregate_needs_subquery(&self, request: &AggregateRequest) -> bool {
        self.is_paged() || request.has_complex_grouping()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Expression;

    #[test]
    fn test_builder() {
        let q = Query::new("roads")
            .with_filter(Filter::is_null("name"))
            .with_properties(["name", "geom"])
            .sort_by(SortBy::desc("name"))
            .with_offset(10)
            .with_limit(5);
        assert!(q.is_paged());
        assert_eq!(q.properties.as_deref(), Some(&["name".to_string(), "geom".to_string()][..]));
        assert_eq!(
            q.sort[0],
            SortBy::Property { name: PropertyName::new("name"), order: SortOrder::Descending }
        );
    }

    #[test]
    fn test_aggregate_subquery_decision() {
        let plain = Query::new("roads");
        assert!(!plain.aggregate_needs_subquery(&AggregateRequest::count()));
        assert!(Query::new("roads").with_limit(3).aggregate_needs_subquery(&AggregateRequest::count()));
        let complex = AggregateRequest::count().group_by(Expression::Function {
            name: "abs".to_string(),
            args: vec![Expression::property("lanes")],
        });
        assert!(plain.aggregate_needs_subquery(&complex));
    }

    #[test]
    fn test_outer_join_builder() {
        let join = Join::outer("cities", Filter::Include).with_alias("c");
        assert_eq!(join.kind, JoinKind::Outer);
        assert_eq!(join.alias.as_deref(), Some("c"));
    }
}

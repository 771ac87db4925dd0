/// Filter capabilities - which predicate nodes a dialect can express in SQL

use std::collections::HashSet;
use super::{CompareOp, Expression, Filter, SpatialOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    And,
    Or,
    Not,
    Compare(CompareOp),
    Between,
    Like,
    IsNull,
    In,
    Id,
    Spatial(SpatialOp),
}

impl Filter {
    /// Node kind; `None` for Include/Exclude, which every dialect supports
    #[must_use]
    pub const fn kind(&self) -> Option<FilterKind> {
        Some(match self {
            Self::Include | Self::Exclude => return None,
            Self::And(_) => FilterKind::And,
            Self::Or(_) => FilterKind::Or,
            Self::Not(_) => FilterKind::Not,
            Self::Compare { op, .. } => FilterKind::Compare(*op),
            Self::Between { .. } => FilterKind::Between,
            Self::Like { .. } => FilterKind::Like,
            Self::IsNull(_) => FilterKind::IsNull,
            Self::In { .. } => FilterKind::In,
            Self::Id(_) => FilterKind::Id,
            Self::Spatial { op, .. } => FilterKind::Spatial(*op),
        })
    }
}

const COMPARISONS: [CompareOp; 6] = [
    CompareOp::Eq,
    CompareOp::Ne,
    CompareOp::Lt,
    CompareOp::Le,
    CompareOp::Gt,
    CompareOp::Ge,
];

const SPATIAL: [SpatialOp; 11] = [
    SpatialOp::BBox,
    SpatialOp::Intersects,
    SpatialOp::Contains,
    SpatialOp::Within,
    SpatialOp::Disjoint,
    SpatialOp::Touches,
    SpatialOp::Crosses,
    SpatialOp::Overlaps,
    SpatialOp::Equals,
    SpatialOp::DWithin,
    SpatialOp::Beyond,
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterCapabilities {
    filters: HashSet<FilterKind>,
    /// Lower-cased names of functions with an SQL rendering
    functions: HashSet<String>,
    arithmetic: bool,
}

impl FilterCapabilities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logic, comparisons, BETWEEN, LIKE, IS NULL, IN and id matching
    #[must_use]
    pub fn basic() -> Self {
        let mut caps = Self::new();
        caps.filters.extend([
            FilterKind::And,
            FilterKind::Or,
            FilterKind::Not,
            FilterKind::Between,
            FilterKind::Like,
            FilterKind::IsNull,
            FilterKind::In,
            FilterKind::Id,
        ]);
        caps.filters.extend(COMPARISONS.iter().map(|op| FilterKind::Compare(*op)));
        caps
    }

    #[must_use]
    pub fn with(mut self, kind: FilterKind) -> Self {
        self.filters.insert(kind);
        self
    }

    #[must_use]
    pub fn without(mut self, kind: FilterKind) -> Self {
        self.filters.remove(&kind);
        self
    }

    #[must_use]
    pub fn with_all_spatial(mut self) -> Self {
        self.filters.extend(SPATIAL.iter().map(|op| FilterKind::Spatial(*op)));
        self
    }

    #[must_use]
    pub fn with_function(mut self, name: &str) -> Self {
        self.functions.insert(name.to_lowercase());
        self
    }

    #[must_use]
    pub const fn with_arithmetic(mut self) -> Self {
        self.arithmetic = true;
        self
    }

    #[must_use]
    pub fn supports_kind(&self, kind: FilterKind) -> bool {
        self.filters.contains(&kind)
    }

    #[must_use]
    pub fn supports_function(&self, name: &str) -> bool {
        self.functions.contains(&name.to_lowercase())
    }

    #[must_use]
    pub fn supports_expression(&self, expr: &Expression) -> bool {
        match expr {
            Expression::Property(_) | Expression::Literal(_) => true,
            Expression::Function { name, args } => {
                self.supports_function(name) && args.iter().all(|a| self.supports_expression(a))
            }
            Expression::Arithmetic { left, right, .. } => {
                self.arithmetic && self.supports_expression(left) && self.supports_expression(right)
            }
        }
    }

    /// True when the whole tree, node kinds and expressions, can be rendered
    #[must_use]
    pub fn fully_supports(&self, filter: &Filter) -> bool {
        if let Some(kind) = filter.kind() {
            if !self.supports_kind(kind) {
                return false;
            }
        }
        match filter {
            Filter::Include | Filter::Exclude | Filter::Id(_) => true,
            Filter::And(children) | Filter::Or(children) => children.iter().all(|c| self.fully_supports(c)),
            Filter::Not(inner) => self.fully_supports(inner),
            Filter::Compare { left, right, .. } => {
                self.supports_expression(left) && self.supports_expression(right)
            }
            Filter::Between { expr, lower, upper } => {
                self.supports_expression(expr)
                    && self.supports_expression(lower)
                    && self.supports_expression(upper)
            }
            Filter::Like { expr, .. } | Filter::IsNull(expr) => self.supports_expression(expr),
            Filter::In { expr, values } => {
                self.supports_expression(expr) && values.iter().all(|v| self.supports_expression(v))
            }
            Filter::Spatial { property, geometry, .. } => {
                self.supports_expression(property) && self.supports_expression(geometry)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Geometry, Value};

    #[test]
    fn test_basic_capabilities() {
        let caps = FilterCapabilities::basic();
        assert!(caps.fully_supports(&Filter::equals("a", Value::Integer(1))));
        assert!(!caps.fully_supports(&Filter::bbox("geom", Geometry::point(0.0, 0.0))));
        assert!(caps.with_all_spatial().fully_supports(&Filter::bbox("geom", Geometry::point(0.0, 0.0))));
    }

    #[test]
    fn test_functions_must_be_declared() {
        let f = Filter::Compare {
            op: CompareOp::Eq,
            left: Expression::Function {
                name: "strToUpperCase".to_string(),
                args: vec![Expression::property("name")],
            },
            right: Expression::Literal(Value::Text("A".to_string())),
            match_case: true,
        };
        assert!(!FilterCapabilities::basic().fully_supports(&f));
        assert!(FilterCapabilities::basic().with_function("STRTOUPPERCASE").fully_supports(&f));
    }

    #[test]
    fn test_nested_unsupported_node() {
        let caps = FilterCapabilities::basic().without(FilterKind::Like);
        let f = Filter::Or(vec![
            Filter::equals("a", Value::Integer(1)),
            Filter::Like {
                expr: Expression::property("b"),
                pattern: "x%".to_string(),
                match_case: true,
            },
        ]);
        assert!(!caps.fully_supports(&f));
    }
}

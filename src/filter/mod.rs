/// Filter model - predicate and expression trees
///
/// Filters are plain values. Every rewrite (simplify, qualify, split,
/// null-guard) is a pure function returning a new tree, composed in that
/// order by the executor.

pub mod capabilities;
pub mod simplify;
pub mod split;
pub mod null_guard;
pub mod evaluate;

pub use capabilities::{FilterCapabilities, FilterKind};
pub use evaluate::FilterEvaluator;
pub use null_guard::apply_null_guards;
pub use simplify::simplify;
pub use split::{split, SplitFilter};

use crate::core::{Geometry, Value};
use std::fmt;

/// Reference to an attribute, optionally qualified by a feature type name
/// or a join alias (`alias.name`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyName {
    pub name: String,
    pub prefix: Option<String>,
}

impl PropertyName {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: None,
        }
    }

    pub fn qualified(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: Some(prefix.into()),
        }
    }

    /// Splits `prefix.name` on the last dot
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text.rsplit_once('.') {
            Some((prefix, name)) if !prefix.is_empty() && !name.is_empty() => {
                Self::qualified(prefix, name)
            }
            _ => Self::new(text),
        }
    }
}

impl fmt::Display for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(p) => write!(f, "{p}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ArithmeticOp {
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Property(PropertyName),
    Literal(Value),
    Function { name: String, args: Vec<Expression> },
    Arithmetic {
        op: ArithmeticOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
}

impl Expression {
    /// Property reference; `prefix.name` is split into a qualified name
    pub fn property(name: impl Into<String>) -> Self {
        Self::Property(PropertyName::parse(&name.into()))
    }

    #[must_use]
    pub const fn literal(value: Value) -> Self {
        Self::Literal(value)
    }

    #[must_use]
    pub const fn as_property(&self) -> Option<&PropertyName> {
        match self {
            Self::Property(p) => Some(p),
            _ => None,
        }
    }

    /// Calls `f` for every property name in the expression
    pub fn visit_properties(&self, f: &mut dyn FnMut(&PropertyName)) {
        match self {
            Self::Property(p) => f(p),
            Self::Literal(_) => {}
            Self::Function { args, .. } => args.iter().for_each(|a| a.visit_properties(f)),
            Self::Arithmetic { left, right, .. } => {
                left.visit_properties(f);
                right.visit_properties(f);
            }
        }
    }

    /// Rebuilds the expression with every property name passed through `f`
    pub fn map_properties<E>(
        &self,
        f: &mut dyn FnMut(&PropertyName) -> Result<PropertyName, E>,
    ) -> Result<Self, E> {
        Ok(match self {
            Self::Property(p) => Self::Property(f(p)?),
            Self::Literal(v) => Self::Literal(v.clone()),
            Self::Function { name, args } => Self::Function {
                name: name.clone(),
                args: args.iter().map(|a| a.map_properties(f)).collect::<Result<_, _>>()?,
            },
            Self::Arithmetic { op, left, right } => Self::Arithmetic {
                op: *op,
                left: Box::new(left.map_properties(f)?),
                right: Box::new(right.map_properties(f)?),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    #[must_use]
    pub const fn sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpatialOp {
    BBox,
    Intersects,
    Contains,
    Within,
    Disjoint,
    Touches,
    Crosses,
    Overlaps,
    Equals,
    DWithin,
    Beyond,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Include,
    Exclude,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Compare {
        op: CompareOp,
        left: Expression,
        right: Expression,
        match_case: bool,
    },
    Between {
        expr: Expression,
        lower: Expression,
        upper: Expression,
    },
    /// SQL LIKE semantics: `%` any run, `_` one char, `\` escapes
    Like {
        expr: Expression,
        pattern: String,
        match_case: bool,
    },
    IsNull(Expression),
    In {
        expr: Expression,
        values: Vec<Expression>,
    },
    /// Match by feature identifier
    Id(Vec<String>),
    Spatial {
        op: SpatialOp,
        property: Expression,
        geometry: Expression,
        /// Distance for DWithin/Beyond
        distance: Option<f64>,
    },
}

impl Filter {
    /// `name op value`, case sensitive
    pub fn compare(op: CompareOp, name: impl Into<String>, value: Value) -> Self {
        Self::Compare {
            op,
            left: Expression::property(name),
            right: Expression::Literal(value),
            match_case: true,
        }
    }

    pub fn equals(name: impl Into<String>, value: Value) -> Self {
        Self::compare(CompareOp::Eq, name, value)
    }

    pub fn is_null(name: impl Into<String>) -> Self {
        Self::IsNull(Expression::property(name))
    }

    pub fn not_null(name: impl Into<String>) -> Self {
        Self::Not(Box::new(Self::is_null(name)))
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Id(ids.into_iter().map(Into::into).collect())
    }

    pub fn bbox(name: impl Into<String>, geometry: Geometry) -> Self {
        Self::Spatial {
            op: SpatialOp::BBox,
            property: Expression::property(name),
            geometry: Expression::Literal(Value::Geometry(geometry)),
            distance: None,
        }
    }

    /// Conjunction of two filters, flattening trivial cases
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        simplify(&Self::And(vec![self, other]))
    }

    #[must_use]
    pub const fn is_include(&self) -> bool {
        matches!(self, Self::Include)
    }

    /// Calls `f` for every property name referenced anywhere in the tree
    pub fn visit_properties(&self, f: &mut dyn FnMut(&PropertyName)) {
        match self {
            Self::Include | Self::Exclude | Self::Id(_) => {}
            Self::And(children) | Self::Or(children) => {
                children.iter().for_each(|c| c.visit_properties(f));
            }
            Self::Not(inner) => inner.visit_properties(f),
            Self::Compare { left, right, .. } => {
                left.visit_properties(f);
                right.visit_properties(f);
            }
            Self::Between { expr, lower, upper } => {
                expr.visit_properties(f);
                lower.visit_properties(f);
                upper.visit_properties(f);
            }
            Self::Like { expr, .. } | Self::IsNull(expr) => expr.visit_properties(f),
            Self::In { expr, values } => {
                expr.visit_properties(f);
                values.iter().for_each(|v| v.visit_properties(f));
            }
            Self::Spatial { property, geometry, .. } => {
                property.visit_properties(f);
                geometry.visit_properties(f);
            }
        }
    }

    /// Rebuilds the filter with every property name passed through `f`
    pub fn map_properties<E>(
        &self,
        f: &mut dyn FnMut(&PropertyName) -> Result<PropertyName, E>,
    ) -> Result<Self, E> {
        Ok(match self {
            Self::Include => Self::Include,
            Self::Exclude => Self::Exclude,
            Self::Id(ids) => Self::Id(ids.clone()),
            Self::And(children) => Self::And(
                children.iter().map(|c| c.map_properties(f)).collect::<Result<_, _>>()?,
            ),
            Self::Or(children) => Self::Or(
                children.iter().map(|c| c.map_properties(f)).collect::<Result<_, _>>()?,
            ),
            Self::Not(inner) => Self::Not(Box::new(inner.map_properties(f)?)),
            Self::Compare { op, left, right, match_case } => Self::Compare {
                op: *op,
                left: left.map_properties(f)?,
                right: right.map_properties(f)?,
                match_case: *match_case,
            },
            Self::Between { expr, lower, upper } => Self::Between {
                expr: expr.map_properties(f)?,
                lower: lower.map_properties(f)?,
                upper: upper.map_properties(f)?,
            },
            Self::Like { expr, pattern, match_case } => Self::Like {
                expr: expr.map_properties(f)?,
                pattern: pattern.clone(),
                match_case: *match_case,
            },
            Self::IsNull(expr) => Self::IsNull(expr.map_properties(f)?),
            Self::In { expr, values } => Self::In {
                expr: expr.map_properties(f)?,
                values: values.iter().map(|v| v.map_properties(f)).collect::<Result<_, _>>()?,
            },
            Self::Spatial { op, property, geometry, distance } => Self::Spatial {
                op: *op,
                property: property.map_properties(f)?,
                geometry: geometry.map_properties(f)?,
                distance: *distance,
            },
        })
    }

    /// Names of all referenced properties, deduplicated, in first-seen order
    #[must_use]
    pub fn property_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        self.visit_properties(&mut |p: &PropertyName| {
            if !names.contains(&p.name) {
                names.push(p.name.clone());
            }
        });
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_name_parse() {
        assert_eq!(PropertyName::parse("a.name"), PropertyName::qualified("a", "name"));
        assert_eq!(PropertyName::parse("name"), PropertyName::new("name"));
        assert_eq!(PropertyName::parse(".name"), PropertyName::new(".name"));
    }

    #[test]
    fn test_property_names_collected() {
        let f = Filter::And(vec![
            Filter::equals("name", Value::Text("x".to_string())),
            Filter::Or(vec![Filter::is_null("age"), Filter::equals("name", Value::Null)]),
        ]);
        assert_eq!(f.property_names(), vec!["name".to_string(), "age".to_string()]);
    }

    #[test]
    fn test_map_properties_qualifies() {
        let f = Filter::equals("name", Value::Integer(1));
        let q: Result<Filter, ()> =
            f.map_properties(&mut |p: &PropertyName| Ok(PropertyName::qualified("a", p.name.clone())));
        match q.unwrap() {
            Filter::Compare { left, .. } => {
                assert_eq!(left, Expression::Property(PropertyName::qualified("a", "name")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

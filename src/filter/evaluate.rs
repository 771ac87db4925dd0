/// In-process filter evaluation
///
/// Evaluates post-filters against decoded features with two-valued logic:
/// any comparison involving NULL is false, `NOT` of that is true.
/// Supports: comparisons, BETWEEN, LIKE, IN, IS NULL, id matching, AND, OR,
/// NOT and the planar spatial operators.

use std::cmp::Ordering;
use crate::core::{Feature, Geometry, StoreError, Value};
use super::{ArithmeticOp, CompareOp, Expression, Filter, PropertyName, SpatialOp};

pub struct FilterEvaluator;

impl FilterEvaluator {
    /// Evaluate filter against a feature
    pub fn evaluate(filter: &Filter, feature: &Feature) -> Result<bool, StoreError> {
        match filter {
            Filter::Include => Ok(true),
            Filter::Exclude => Ok(false),
            Filter::And(children) => {
                for child in children {
                    if !Self::evaluate(child, feature)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Filter::Or(children) => {
                for child in children {
                    if Self::evaluate(child, feature)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Filter::Not(inner) => Ok(!Self::evaluate(inner, feature)?),
            Filter::Compare { op, left, right, match_case } => {
                let l = Self::value_of(left, feature)?;
                let r = Self::value_of(right, feature)?;
                Ok(Self::compare(*op, &l, &r, *match_case))
            }
            Filter::Between { expr, lower, upper } => {
                let v = Self::value_of(expr, feature)?;
                let lo = Self::value_of(lower, feature)?;
                let hi = Self::value_of(upper, feature)?;
                Ok(Self::compare(CompareOp::Ge, &v, &lo, true)
                    && Self::compare(CompareOp::Le, &v, &hi, true))
            }
            Filter::Like { expr, pattern, match_case } => {
                let v = Self::value_of(expr, feature)?;
                Ok(Self::match_like(&v, pattern, *match_case))
            }
            Filter::IsNull(expr) => Ok(Self::value_of(expr, feature)?.is_null()),
            Filter::In { expr, values } => {
                let v = Self::value_of(expr, feature)?;
                for candidate in values {
                    let c = Self::value_of(candidate, feature)?;
                    if Self::compare(CompareOp::Eq, &v, &c, true) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Filter::Id(ids) => Ok(ids.iter().any(|id| *id == feature.id)),
            Filter::Spatial { op, property, geometry, distance } => {
                let a = Self::value_of(property, feature)?;
                let b = Self::value_of(geometry, feature)?;
                match (a.as_geometry(), b.as_geometry()) {
                    (Some(a), Some(b)) => Ok(Self::spatial(*op, a, b, *distance)),
                    _ => Ok(false),
                }
            }
        }
    }

    /// Resolve an expression to a value for this feature
    pub fn value_of(expr: &Expression, feature: &Feature) -> Result<Value, StoreError> {
        match expr {
            Expression::Literal(v) => Ok(v.clone()),
            Expression::Property(p) => Self::property_value(p, feature),
            Expression::Function { name, args } => {
                let args = args
                    .iter()
                    .map(|a| Self::value_of(a, feature))
                    .collect::<Result<Vec<_>, _>>()?;
                Self::call(name, &args)
            }
            Expression::Arithmetic { op, left, right } => {
                let l = Self::value_of(left, feature)?;
                let r = Self::value_of(right, feature)?;
                Ok(Self::arithmetic(*op, &l, &r))
            }
        }
    }

    fn property_value(p: &PropertyName, feature: &Feature) -> Result<Value, StoreError> {
        let target = match &p.prefix {
            Some(prefix) if *prefix != feature.schema.name => {
                match feature.joined.iter().find(|j| j.name == *prefix) {
                    // Unmatched outer join: every joined attribute reads as NULL
                    Some(j) => match &j.feature {
                        Some(f) => f,
                        None => return Ok(Value::Null),
                    },
                    None => return Err(StoreError::UnresolvedProperty(p.to_string())),
                }
            }
            _ => feature,
        };
        target
            .get(&p.name)
            .cloned()
            .ok_or_else(|| StoreError::AttributeNotFound(p.to_string()))
    }

    fn compare(op: CompareOp, a: &Value, b: &Value, match_case: bool) -> bool {
        if a.is_null() || b.is_null() {
            return false;
        }
        let ordering = if match_case {
            a.compare(b)
        } else {
            match (a, b) {
                (Value::Text(x), Value::Text(y)) => Some(x.to_lowercase().cmp(&y.to_lowercase())),
                _ => a.compare(b),
            }
        };
        match ordering {
            Some(ord) => match op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
            },
            // Geometries, arrays and other unordered values only support equality
            None => match op {
                CompareOp::Eq => a == b,
                CompareOp::Ne => a != b,
                _ => false,
            },
        }
    }

    fn arithmetic(op: ArithmeticOp, a: &Value, b: &Value) -> Value {
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            let result = match op {
                ArithmeticOp::Add => x.checked_add(y),
                ArithmeticOp::Subtract => x.checked_sub(y),
                ArithmeticOp::Multiply => x.checked_mul(y),
                ArithmeticOp::Divide if y != 0 && x % y == 0 => Some(x / y),
                ArithmeticOp::Divide => None,
            };
            if let Some(v) = result {
                return Value::Integer(v);
            }
        }
        match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => {
                let v = match op {
                    ArithmeticOp::Add => x + y,
                    ArithmeticOp::Subtract => x - y,
                    ArithmeticOp::Multiply => x * y,
                    ArithmeticOp::Divide if y == 0.0 => return Value::Null,
                    ArithmeticOp::Divide => x / y,
                };
                Value::Real(v)
            }
            _ => Value::Null,
        }
    }

    /// Built-in functions with an in-process implementation
    fn call(name: &str, args: &[Value]) -> Result<Value, StoreError> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
        let text = |v: Value| match v {
            Value::Null => None,
            Value::Text(s) => Some(s),
            other => Some(other.to_string()),
        };
        Ok(match name.to_lowercase().as_str() {
            "strtouppercase" | "upper" => text(arg(0)).map_or(Value::Null, |s| Value::Text(s.to_uppercase())),
            "strtolowercase" | "lower" => text(arg(0)).map_or(Value::Null, |s| Value::Text(s.to_lowercase())),
            "strtrim" | "trim" => text(arg(0)).map_or(Value::Null, |s| Value::Text(s.trim().to_string())),
            "strlength" | "length" => text(arg(0))
                .map_or(Value::Null, |s| Value::Integer(i64::try_from(s.chars().count()).unwrap_or(i64::MAX))),
            "strconcat" | "concat" => match (text(arg(0)), text(arg(1))) {
                (Some(a), Some(b)) => Value::Text(a + &b),
                _ => Value::Null,
            },
            "abs" => match arg(0) {
                Value::SmallInt(i) => Value::SmallInt(i.checked_abs().ok_or_else(|| Self::overflow(name, i))?),
                Value::Integer(i) => Value::Integer(i.checked_abs().ok_or_else(|| Self::overflow(name, i))?),
                Value::Real(r) => Value::Real(r.abs()),
                Value::Numeric(d) => Value::Numeric(d.abs()),
                _ => Value::Null,
            },
            _ => return Err(StoreError::Unsupported(format!("function '{name}' in post-filter"))),
        })
    }

    fn overflow(function: &str, arg: impl std::fmt::Display) -> StoreError {
        StoreError::Evaluation(format!("{function}({arg}) overflows"))
    }

    fn spatial(op: SpatialOp, a: &Geometry, b: &Geometry, distance: Option<f64>) -> bool {
        let limit = distance.unwrap_or(0.0);
        match op {
            SpatialOp::BBox => a.envelope().intersects(&b.envelope()),
            SpatialOp::Intersects => a.intersects(b),
            SpatialOp::Contains => a.contains(b),
            SpatialOp::Within => a.within(b),
            SpatialOp::Disjoint => a.disjoint(b),
            SpatialOp::Touches => a.touches(b),
            SpatialOp::Crosses => a.crosses(b),
            SpatialOp::Overlaps => a.overlaps(b),
            SpatialOp::Equals => a.equals_topologically(b),
            SpatialOp::DWithin => a.distance(b).is_some_and(|d| d <= limit),
            SpatialOp::Beyond => a.distance(b).is_some_and(|d| d > limit),
        }
    }

    /// Match LIKE pattern
    /// Supports: % (any chars), _ (single char), \ escapes the next char
    fn match_like(value: &Value, pattern: &str, match_case: bool) -> bool {
        let text = match value {
            Value::Null => return false,
            Value::Text(s) => s.clone(),
            other => other.to_string(),
        };
        let (text, pattern) = if match_case {
            (text, pattern.to_string())
        } else {
            (text.to_lowercase(), pattern.to_lowercase())
        };
        let text_chars: Vec<char> = text.chars().collect();
        let tokens = Self::like_tokens(&pattern);
        Self::match_recursive(&text_chars, &tokens, 0, 0)
    }

    fn like_tokens(pattern: &str) -> Vec<LikeToken> {
        let mut tokens = Vec::new();
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            tokens.push(match c {
                '%' => LikeToken::Any,
                '_' => LikeToken::One,
                '\\' => LikeToken::Char(chars.next().unwrap_or('\\')),
                other => LikeToken::Char(other),
            });
        }
        tokens
    }

    fn match_recursive(text: &[char], pattern: &[LikeToken], ti: usize, pi: usize) -> bool {
        if pi >= pattern.len() {
            return ti >= text.len();
        }
        match pattern[pi] {
            // % matches zero or more characters
            LikeToken::Any => {
                (ti..=text.len()).any(|next| Self::match_recursive(text, pattern, next, pi + 1))
            }
            _ if ti >= text.len() => false,
            LikeToken::One => Self::match_recursive(text, pattern, ti + 1, pi + 1),
            LikeToken::Char(c) => text[ti] == c && Self::match_recursive(text, pattern, ti + 1, pi + 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LikeToken {
    Any,
    One,
    Char(char),
}

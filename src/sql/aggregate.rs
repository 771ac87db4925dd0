/// Aggregate request model and the in-process accumulator used when an
/// aggregate cannot be pushed down

use std::cmp::Ordering;
use crate::core::{StoreError, Value};
use crate::filter::Expression;

/// Closed set of supported aggregates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    Count,
    Sum,
    Min,
    Max,
    Average,
    /// Distinct values
    Unique,
    /// Sample standard deviation
    StandardDeviation,
}

impl AggregateKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Average => "average",
            Self::Unique => "unique",
            Self::StandardDeviation => "stddev",
        }
    }

    /// Whether the backend returns one row per distinct value instead of a scalar
    #[must_use]
    pub const fn is_multi_row(&self) -> bool {
        matches!(self, Self::Unique)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRequest {
    pub kind: AggregateKind,
    /// Aggregated expression; `None` is `count(*)`
    pub expression: Option<Expression>,
    pub group_by: Vec<Expression>,
}

impl AggregateRequest {
    #[must_use]
    pub const fn new(kind: AggregateKind, expression: Option<Expression>) -> Self {
        Self {
            kind,
            expression,
            group_by: Vec::new(),
        }
    }

    #[must_use]
    pub const fn count() -> Self {
        Self::new(AggregateKind::Count, None)
    }

    pub fn of(kind: AggregateKind, property: impl Into<String>) -> Self {
        Self::new(kind, Some(Expression::property(property)))
    }

    #[must_use]
    pub fn group_by(mut self, expression: Expression) -> Self {
        self.group_by.push(expression);
        self
    }

    #[must_use]
    pub const fn expression(&self) -> Option<&Expression> {
        self.expression.as_ref()
    }

    #[must_use]
    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }

    /// Group-by expressions that are not plain property references force a
    /// subquery with positional aliases
    #[must_use]
    pub fn has_complex_grouping(&self) -> bool {
        self.group_by.iter().any(|e| e.as_property().is_none())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupResult {
    pub key: Vec<Value>,
    pub value: AggregateValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateValue {
    Scalar(Value),
    Unique(Vec<Value>),
    Grouped(Vec<GroupResult>),
}

impl AggregateValue {
    #[must_use]
    pub const fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }
}

/// Running state of one aggregate over a value stream
#[derive(Debug, Clone)]
pub struct Accumulator {
    kind: AggregateKind,
    count: u64,
    int_sum: Option<i64>,
    float_sum: f64,
    any_float: bool,
    extreme: Option<Value>,
    distinct: Vec<Value>,
    // Welford running moments
    mean: f64,
    m2: f64,
}

impl Accumulator {
    #[must_use]
    pub const fn new(kind: AggregateKind) -> Self {
        Self {
            kind,
            count: 0,
            int_sum: Some(0),
            float_sum: 0.0,
            any_float: false,
            extreme: None,
            distinct: Vec::new(),
            mean: 0.0,
            m2: 0.0,
        }
    }

    /// Feeds one value; NULLs are ignored like SQL aggregates do
    pub fn add(&mut self, value: &Value) -> Result<(), StoreError> {
        if value.is_null() {
            return Ok(());
        }
        match self.kind {
            AggregateKind::Count => self.count += 1,
            AggregateKind::Sum | AggregateKind::Average => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| StoreError::TypeMismatch(format!("cannot sum {value:?}")))?;
                self.count += 1;
                self.float_sum += number;
                match value.as_int() {
                    Some(i) => self.int_sum = self.int_sum.and_then(|s| s.checked_add(i)),
                    None => self.any_float = true,
                }
            }
            AggregateKind::Min | AggregateKind::Max => {
                let wanted = if self.kind == AggregateKind::Min { Ordering::Less } else { Ordering::Greater };
                let replace = match &self.extreme {
                    None => true,
                    Some(current) => value.compare(current) == Some(wanted),
                };
                if replace {
                    self.extreme = Some(value.clone());
                }
            }
            AggregateKind::Unique => {
                if !self.distinct.contains(value) {
                    self.distinct.push(value.clone());
                }
            }
            AggregateKind::StandardDeviation => {
                let x = value
                    .as_f64()
                    .ok_or_else(|| StoreError::TypeMismatch(format!("cannot aggregate {value:?}")))?;
                self.count += 1;
                let delta = x - self.mean;
                self.mean += delta / self.count as f64;
                self.m2 += delta * (x - self.mean);
            }
        }
        Ok(())
    }

    /// Counts a row for `count(*)`
    pub const fn add_row(&mut self) {
        self.count += 1;
    }

    #[must_use]
    pub fn finish(self) -> AggregateValue {
        let scalar = match self.kind {
            AggregateKind::Count => Value::Integer(self.count as i64),
            AggregateKind::Sum if self.count == 0 => Value::Null,
            AggregateKind::Sum => match (self.any_float, self.int_sum) {
                (false, Some(sum)) => Value::Integer(sum),
                _ => Value::Real(self.float_sum),
            },
            AggregateKind::Average if self.count == 0 => Value::Null,
            AggregateKind::Average => Value::Real(self.float_sum / self.count as f64),
            AggregateKind::Min | AggregateKind::Max => self.extreme.unwrap_or(Value::Null),
            AggregateKind::Unique => return AggregateValue::Unique(self.distinct),
            AggregateKind::StandardDeviation if self.count < 2 => Value::Null,
            AggregateKind::StandardDeviation => Value::Real((self.m2 / (self.count - 1) as f64).sqrt()),
        };
        AggregateValue::Scalar(scalar)
    }
}

/// Accumulators keyed by group value, in first-seen group order
#[derive(Debug, Clone)]
pub struct GroupedAccumulator {
    kind: AggregateKind,
    groups: Vec<(Vec<Value>, Accumulator)>,
}

impl GroupedAccumulator {
    #[must_use]
    pub const fn new(kind: AggregateKind) -> Self {
        Self { kind, groups: Vec::new() }
    }

    pub fn group(&mut self, key: Vec<Value>) -> &mut Accumulator {
        let idx = match self.groups.iter().position(|(k, _)| *k == key) {
            Some(idx) => idx,
            None => {
                self.groups.push((key, Accumulator::new(self.kind)));
                self.groups.len() - 1
            }
        };
        &mut self.groups[idx].1
    }

    #[must_use]
    pub fn finish(self) -> AggregateValue {
        AggregateValue::Grouped(
            self.groups
                .into_iter()
                .map(|(key, acc)| GroupResult { key, value: acc.finish() })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kind: AggregateKind, values: &[Value]) -> AggregateValue {
        let mut acc = Accumulator::new(kind);
        for v in values {
            acc.add(v).unwrap();
        }
        acc.finish()
    }

    #[test]
    fn test_sum_keeps_integers() {
        let values = [Value::Integer(2), Value::Null, Value::Integer(5)];
        assert_eq!(run(AggregateKind::Sum, &values), AggregateValue::Scalar(Value::Integer(7)));
        let mixed = [Value::Integer(2), Value::Real(0.5)];
        assert_eq!(run(AggregateKind::Sum, &mixed), AggregateValue::Scalar(Value::Real(2.5)));
        assert_eq!(run(AggregateKind::Sum, &[]), AggregateValue::Scalar(Value::Null));
    }

    #[test]
    fn test_min_max_and_count() {
        let values = [Value::Integer(4), Value::Integer(-1), Value::Null, Value::Integer(9)];
        assert_eq!(run(AggregateKind::Min, &values), AggregateValue::Scalar(Value::Integer(-1)));
        assert_eq!(run(AggregateKind::Max, &values), AggregateValue::Scalar(Value::Integer(9)));
        assert_eq!(run(AggregateKind::Count, &values), AggregateValue::Scalar(Value::Integer(3)));
    }

    #[test]
    fn test_unique_preserves_first_seen_order() {
        let values = [
            Value::Text("b".to_string()),
            Value::Text("a".to_string()),
            Value::Text("b".to_string()),
        ];
        assert_eq!(
            run(AggregateKind::Unique, &values),
            AggregateValue::Unique(vec![Value::Text("b".to_string()), Value::Text("a".to_string())])
        );
    }

    #[test]
    fn test_sample_standard_deviation() {
        let values = [2, 4, 4, 4, 5, 5, 7, 9].map(Value::Integer);
        let AggregateValue::Scalar(Value::Real(sd)) = run(AggregateKind::StandardDeviation, &values) else {
            panic!("expected a real");
        };
        assert!((sd - 2.138_089_935).abs() < 1e-6);
    }

    #[test]
    fn test_grouped() {
        let mut acc = GroupedAccumulator::new(AggregateKind::Count);
        acc.group(vec![Value::Text("x".to_string())]).add_row();
        acc.group(vec![Value::Text("y".to_string())]).add_row();
        acc.group(vec![Value::Text("x".to_string())]).add_row();
        let AggregateValue::Grouped(groups) = acc.finish() else {
            panic!("expected groups");
        };
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].value, AggregateValue::Scalar(Value::Integer(2)));
    }

    #[test]
    fn test_complex_grouping_detection() {
        let simple = AggregateRequest::count().group_by(Expression::property("kind"));
        assert!(!simple.has_complex_grouping());
        let complex = AggregateRequest::count().group_by(Expression::Function {
            name: "strToUpperCase".to_string(),
            args: vec![Expression::property("kind")],
        });
        assert!(complex.has_complex_grouping());
    }
}

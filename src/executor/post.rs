/// In-process stream layers
///
/// Applied on top of a reader when the dialect could not push part of the
/// query into SQL: the residual filter, then sorting, then paging, then the
/// projection that drops properties fetched only for the residual filter.
/// Every layer ends its stream after passing on the first error.

use std::cmp::Ordering;
use std::sync::Arc;
use crate::core::{Feature, FeatureSchema, StoreError, Value};
use crate::filter::{Expression, Filter, FilterEvaluator};
use crate::sql::{Paging, SortBy, SortOrder};

pub type FeatureIter = Box<dyn Iterator<Item = Result<Feature, StoreError>> + Send>;

/// Feature sequence handed to callers. Dropping it (or calling `close`)
/// releases the underlying cursor, mid-stream included.
pub struct FeatureStream {
    inner: FeatureIter,
    schema: Arc<FeatureSchema>,
}

impl FeatureStream {
    pub fn new(inner: FeatureIter, schema: Arc<FeatureSchema>) -> Self {
        Self { inner, schema }
    }

    /// Schema of the features this stream yields
    #[must_use]
    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    pub fn close(self) {}

    /// Drains the stream; stops at the first error
    pub fn into_vec(self) -> Result<Vec<Feature>, StoreError> {
        self.collect()
    }
}

impl Iterator for FeatureStream {
    type Item = Result<Feature, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl std::fmt::Debug for FeatureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureStream").field("type_name", &self.schema.name).finish_non_exhaustive()
    }
}

/// What is left to do in memory after SQL did its part
#[derive(Debug, Clone)]
pub struct PostProcessor {
    pub filter: Filter,
    pub sort: Vec<SortBy>,
    pub paging: Paging,
    pub projection: Option<Arc<FeatureSchema>>,
}

impl Default for PostProcessor {
    fn default() -> Self {
        Self {
            filter: Filter::Include,
            sort: Vec::new(),
            paging: Paging::default(),
            projection: None,
        }
    }
}

impl PostProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.filter.is_include() && self.sort.is_empty() && self.paging.is_empty() && self.projection.is_none()
    }

    pub fn apply(self, source: FeatureIter) -> FeatureIter {
        let mut stream = source;
        if !self.filter.is_include() {
            stream = Box::new(Filtered {
                inner: stream,
                filter: self.filter,
                done: false,
            });
        }
        if !self.sort.is_empty() {
            stream = Box::new(Sorted {
                inner: Some(stream),
                sort: self.sort,
                sorted: Vec::new().into_iter(),
                failed: None,
            });
        }
        if !self.paging.is_empty() {
            stream = Box::new(Paged {
                inner: stream,
                skip: self.paging.offset,
                remaining: self.paging.limit,
                done: false,
            });
        }
        if let Some(schema) = self.projection {
            stream = Box::new(stream.map(move |f| f.map(|f| project(f, &schema))));
        }
        stream
    }
}

struct Filtered {
    inner: FeatureIter,
    filter: Filter,
    done: bool,
}

impl Iterator for Filtered {
    type Item = Result<Feature, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let result = self.inner.next()?.and_then(|feature| {
                FilterEvaluator::evaluate(&self.filter, &feature).map(|keep| keep.then_some(feature))
            });
            match result {
                Ok(Some(feature)) => return Some(Ok(feature)),
                Ok(None) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Buffers the whole input on first pull; an upstream error replaces the
/// buffered features
struct Sorted {
    inner: Option<FeatureIter>,
    sort: Vec<SortBy>,
    sorted: std::vec::IntoIter<Feature>,
    failed: Option<StoreError>,
}

impl Iterator for Sorted {
    type Item = Result<Feature, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(inner) = self.inner.take() {
            match inner.collect::<Result<Vec<_>, _>>() {
                Ok(mut features) => {
                    let sort = &self.sort;
                    features.sort_by(|a, b| compare_features(a, b, sort));
                    self.sorted = features.into_iter();
                }
                Err(e) => self.failed = Some(e),
            }
        }
        if let Some(e) = self.failed.take() {
            return Some(Err(e));
        }
        self.sorted.next().map(Ok)
    }
}

/// An error is passed on even while skipping the offset
struct Paged {
    inner: FeatureIter,
    skip: u64,
    remaining: Option<u64>,
    done: bool,
}

impl Iterator for Paged {
    type Item = Result<Feature, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.remaining == Some(0) {
                return None;
            }
            match self.inner.next()? {
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Ok(_) if self.skip > 0 => self.skip -= 1,
                Ok(f) => {
                    if let Some(n) = self.remaining.as_mut() {
                        *n -= 1;
                    }
                    return Some(Ok(f));
                }
            }
        }
    }
}

/// Orders features by `sort`; NULLs sort last ascending
#[must_use]
pub fn compare_features(a: &Feature, b: &Feature, sort: &[SortBy]) -> Ordering {
    for key in sort {
        let (ordering, order) = match key {
            SortBy::Natural(order) => (compare_ids(&a.id, &b.id), *order),
            SortBy::Property { name, order } => {
                let expr = Expression::Property(name.clone());
                let va = FilterEvaluator::value_of(&expr, a).unwrap_or(Value::Null);
                let vb = FilterEvaluator::value_of(&expr, b).unwrap_or(Value::Null);
                (compare_values(&va, &vb), *order)
            }
        };
        let ordering = match order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

/// Numeric key parts compare as numbers
fn compare_ids(a: &str, b: &str) -> Ordering {
    let parts_a = a.split('.');
    let parts_b = b.split('.');
    for (x, y) in parts_a.zip(parts_b) {
        let ordering = match (x.parse::<i64>(), y.parse::<i64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => x.cmp(y),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

/// Retypes `feature` to `schema`, dropping attributes it does not name
#[must_use]
pub fn project(feature: Feature, schema: &Arc<FeatureSchema>) -> Feature {
    let values = schema
        .attributes
        .iter()
        .map(|a| feature.get(&a.name).cloned().unwrap_or(Value::Null))
        .collect();
    Feature {
        id: feature.id,
        schema: Arc::clone(schema),
        values,
        joined: feature.joined,
        use_provided_id: feature.use_provided_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AttributeDescriptor, DataType};
    use crate::filter::CompareOp;

    fn schema() -> Arc<FeatureSchema> {
        Arc::new(FeatureSchema::new(
            "t",
            vec![
                AttributeDescriptor::new("n", DataType::Integer),
                AttributeDescriptor::new("label", DataType::Text),
            ],
        ))
    }

    fn rows(count: i64) -> FeatureIter {
        let schema = schema();
        let features: Vec<Result<Feature, StoreError>> = (0..count)
            .map(|i| {
                Ok(Feature::new(
                    format!("t.{i}"),
                    Arc::clone(&schema),
                    vec![Value::Integer(i), Value::Text(format!("row{i}"))],
                ))
            })
            .collect();
        Box::new(features.into_iter())
    }

    fn ids(stream: FeatureIter) -> Vec<String> {
        stream.map(|f| f.unwrap().id).collect()
    }

    #[test]
    fn test_paging_in_memory() {
        let post = PostProcessor {
            paging: Paging::new(2, Some(3)),
            ..PostProcessor::new()
        };
        assert_eq!(ids(post.apply(rows(10))), vec!["t.2", "t.3", "t.4"]);
    }

    #[test]
    fn test_filter_then_sort_then_page() {
        let post = PostProcessor {
            filter: Filter::compare(CompareOp::Ge, "n", Value::Integer(5)),
            sort: vec![SortBy::desc("n")],
            paging: Paging::new(1, Some(2)),
            projection: None,
        };
        assert_eq!(ids(post.apply(rows(10))), vec!["t.8", "t.7"]);
    }

    #[test]
    fn test_natural_order_is_numeric() {
        let mut items: Vec<Result<Feature, StoreError>> = rows(12).collect();
        items.reverse();
        let post = PostProcessor {
            sort: vec![SortBy::Natural(SortOrder::Ascending)],
            ..PostProcessor::new()
        };
        let sorted = ids(post.apply(Box::new(items.into_iter())));
        assert_eq!(sorted[..3], ["t.0", "t.1", "t.2"]);
        assert_eq!(sorted[11], "t.11");
    }

    #[test]
    fn test_projection_drops_filter_only_properties() {
        let projected = Arc::new(FeatureSchema::new("t", vec![AttributeDescriptor::new("label", DataType::Text)]));
        let post = PostProcessor {
            filter: Filter::equals("n", Value::Integer(3)),
            projection: Some(projected),
            ..PostProcessor::new()
        };
        let out: Vec<Feature> = post.apply(rows(5)).collect::<Result<_, _>>().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].values, vec![Value::Text("row3".into())]);
        assert!(out[0].get("n").is_none());
    }

    fn failing_after(ok: &[i64]) -> FeatureIter {
        let schema = schema();
        let mut items: Vec<Result<Feature, StoreError>> = ok
            .iter()
            .map(|i| Ok(Feature::new(format!("t.{i}"), Arc::clone(&schema), vec![Value::Integer(*i), Value::Null])))
            .collect();
        items.push(Err(StoreError::Unsupported("boom".to_string())));
        items.push(Ok(Feature::new("t.9", Arc::clone(&schema), vec![Value::Integer(9), Value::Null])));
        Box::new(items.into_iter())
    }

    fn outcomes(stream: FeatureIter) -> Vec<String> {
        stream
            .map(|f| match f {
                Ok(f) => f.id,
                Err(e) => format!("ERR {e}"),
            })
            .collect()
    }

    #[test]
    fn test_sort_error_discards_buffer() {
        let post = PostProcessor {
            sort: vec![SortBy::asc("n")],
            ..PostProcessor::new()
        };
        assert_eq!(outcomes(post.apply(failing_after(&[2, 1]))), vec!["ERR Unsupported operation: boom"]);
    }

    #[test]
    fn test_filter_and_paging_stop_at_error() {
        let filtered = PostProcessor {
            filter: Filter::compare(CompareOp::Ge, "n", Value::Integer(0)),
            ..PostProcessor::new()
        };
        assert_eq!(
            outcomes(filtered.apply(failing_after(&[1]))),
            vec!["t.1", "ERR Unsupported operation: boom"]
        );

        // The error surfaces even inside the skipped offset
        let paged = PostProcessor {
            paging: Paging::new(2, Some(5)),
            ..PostProcessor::new()
        };
        assert_eq!(outcomes(paged.apply(failing_after(&[1]))), vec!["ERR Unsupported operation: boom"]);
    }

    #[test]
    fn test_evaluation_error_ends_stream() {
        let post = PostProcessor {
            filter: Filter::equals("missing", Value::Integer(1)),
            ..PostProcessor::new()
        };
        let out: Vec<_> = post.apply(rows(3)).collect();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(StoreError::AttributeNotFound(_))));
    }
}

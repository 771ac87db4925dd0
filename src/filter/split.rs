/// Pre/post filter splitting
///
/// The pre-filter is the part a dialect can render in SQL; the post-filter is
/// the residue evaluated in-process over decoded rows. `pre AND post` is
/// always equivalent to the input.

use super::{simplify, Filter, FilterCapabilities};

#[derive(Debug, Clone, PartialEq)]
pub struct SplitFilter {
    pub pre: Filter,
    pub post: Filter,
}

impl SplitFilter {
    #[must_use]
    pub const fn has_post(&self) -> bool {
        !self.post.is_include()
    }
}

/// Splits `filter` against `caps`. Id filters can only be pushed down when the
/// table has a primary key (`can_id`).
#[must_use]
pub fn split(filter: &Filter, caps: &FilterCapabilities, can_id: bool) -> SplitFilter {
    let filter = simplify(filter);
    let (pre, post) = split_node(&filter, caps, can_id);
    SplitFilter {
        pre: simplify(&pre),
        post: simplify(&post),
    }
}

fn split_node(filter: &Filter, caps: &FilterCapabilities, can_id: bool) -> (Filter, Filter) {
    if pushable(filter, caps, can_id) {
        return (filter.clone(), Filter::Include);
    }
    match filter {
        // Conjunctions split per child; every other node moves as a whole
        Filter::And(children) => {
            let mut pre = Vec::new();
            let mut post = Vec::new();
            for child in children {
                let (p, q) = split_node(child, caps, can_id);
                pre.push(p);
                post.push(q);
            }
            (Filter::And(pre), Filter::And(post))
        }
        other => (Filter::Include, other.clone()),
    }
}

fn pushable(filter: &Filter, caps: &FilterCapabilities, can_id: bool) -> bool {
    caps.fully_supports(filter) && (can_id || !contains_id(filter))
}

fn contains_id(filter: &Filter) -> bool {
    match filter {
        Filter::Id(_) => true,
        Filter::And(children) | Filter::Or(children) => children.iter().any(contains_id),
        Filter::Not(inner) => contains_id(inner),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Geometry, Value};
    use crate::filter::Expression;

    fn like() -> Filter {
        Filter::Like {
            expr: Expression::property("name"),
            pattern: "A%".to_string(),
            match_case: true,
        }
    }

    #[test]
    fn test_fully_supported_goes_to_pre() {
        let f = Filter::equals("a", Value::Integer(1));
        let s = split(&f, &FilterCapabilities::basic(), true);
        assert_eq!(s.pre, f);
        assert!(!s.has_post());
    }

    #[test]
    fn test_and_splits_per_child() {
        let eq = Filter::equals("a", Value::Integer(1));
        let bbox = Filter::bbox("geom", Geometry::point(1.0, 1.0));
        let f = Filter::And(vec![eq.clone(), bbox.clone()]);
        let s = split(&f, &FilterCapabilities::basic(), true);
        assert_eq!(s.pre, eq);
        assert_eq!(s.post, bbox);
    }

    #[test]
    fn test_or_with_unsupported_child_moves_whole() {
        let caps = FilterCapabilities::basic().without(crate::filter::FilterKind::Like);
        let f = Filter::Or(vec![Filter::equals("a", Value::Integer(1)), like()]);
        let s = split(&f, &caps, true);
        assert_eq!(s.pre, Filter::Include);
        assert_eq!(s.post, f);
    }

    #[test]
    fn test_id_filter_needs_key() {
        let f = Filter::ids(["t.1"]);
        let s = split(&f, &FilterCapabilities::basic(), false);
        assert_eq!(s.pre, Filter::Include);
        assert_eq!(s.post, f);
        let s = split(&f, &FilterCapabilities::basic(), true);
        assert_eq!(s.pre, f);
    }
}

/// Two-valued logic adapter
///
/// SQL evaluates `a <> 5` to UNKNOWN for a NULL `a`, and `NOT (a = 5)` to
/// UNKNOWN as well, while in-memory evaluation treats any comparison with NULL
/// as false and negates that to true. Guarding every comparison on a nullable
/// property with `a IS NOT NULL` makes the SQL engine agree with the
/// in-memory semantics under negation.

use super::{Expression, Filter, PropertyName};

/// Wraps comparison, BETWEEN, LIKE and IN nodes with `NOT (p IS NULL)` for
/// each nullable property operand.
#[must_use]
pub fn apply_null_guards(filter: &Filter, is_nullable: &dyn Fn(&PropertyName) -> bool) -> Filter {
    match filter {
        Filter::And(children) => {
            Filter::And(children.iter().map(|c| apply_null_guards(c, is_nullable)).collect())
        }
        Filter::Or(children) => {
            Filter::Or(children.iter().map(|c| apply_null_guards(c, is_nullable)).collect())
        }
        Filter::Not(inner) => Filter::Not(Box::new(apply_null_guards(inner, is_nullable))),
        Filter::Compare { left, right, .. } => guard(filter, &[left, right], is_nullable),
        Filter::Between { expr, lower, upper } => guard(filter, &[expr, lower, upper], is_nullable),
        Filter::Like { expr, .. } => guard(filter, &[expr], is_nullable),
        Filter::In { expr, values } => {
            let mut operands = vec![expr];
            operands.extend(values.iter());
            guard(filter, &operands, is_nullable)
        }
        other => other.clone(),
    }
}

fn guard(
    node: &Filter,
    operands: &[&Expression],
    is_nullable: &dyn Fn(&PropertyName) -> bool,
) -> Filter {
    let mut guarded: Vec<PropertyName> = Vec::new();
    for operand in operands {
        if let Some(p) = operand.as_property() {
            if is_nullable(p) && !guarded.contains(p) {
                guarded.push(p.clone());
            }
        }
    }
    if guarded.is_empty() {
        return node.clone();
    }
    let mut parts = Vec::with_capacity(guarded.len() + 1);
    parts.push(node.clone());
    parts.extend(
        guarded
            .into_iter()
            .map(|p| Filter::IsNull(Expression::Property(p)).negate()),
    );
    Filter::And(parts)
}

/// Structural simplification: flatten nested AND/OR, fold Include/Exclude,
/// drop double negation.

use super::Filter;

#[must_use]
pub fn simplify(filter: &Filter) -> Filter {
    match filter {
        Filter::And(children) => {
            let mut out = Vec::with_capacity(children.len());
            for child in children.iter().map(simplify) {
                match child {
                    Filter::Include => {}
                    Filter::Exclude => return Filter::Exclude,
                    Filter::And(nested) => out.extend(nested),
                    other => out.push(other),
                }
            }
            match out.len() {
                0 => Filter::Include,
                1 => out.remove(0),
                _ => Filter::And(out),
            }
        }
        Filter::Or(children) => {
            let mut out = Vec::with_capacity(children.len());
            for child in children.iter().map(simplify) {
                match child {
                    Filter::Exclude => {}
                    Filter::Include => return Filter::Include,
                    Filter::Or(nested) => out.extend(nested),
                    other => out.push(other),
                }
            }
            match out.len() {
                0 => Filter::Exclude,
                1 => out.remove(0),
                _ => Filter::Or(out),
            }
        }
        Filter::Not(inner) => match simplify(inner) {
            Filter::Include => Filter::Exclude,
            Filter::Exclude => Filter::Include,
            Filter::Not(double) => *double,
            other => Filter::Not(Box::new(other)),
        },
        Filter::Id(ids) if ids.is_empty() => Filter::Exclude,
        other => other.clone(),
    }
}

/// CQL-like filter grammar
///
/// ```text
/// filter     := or
/// or         := and (OR and)*
/// and        := unary (AND unary)*
/// unary      := NOT unary | '(' filter ')' | INCLUDE | EXCLUDE | id_in | spatial | predicate
/// predicate  := expr ( op expr | [NOT] BETWEEN expr AND expr | [NOT] [I]LIKE 'p'
///                    | IS [NOT] NULL | [NOT] IN (expr, ...) )
/// expr       := term (('+' | '-') term)*
/// term       := factor (('*' | '/') factor)*
/// factor     := literal | function '(' args ')' | property | '(' expr ')'
/// ```

use crate::core::{Envelope, Geometry, Value};
use crate::core::geometry::wkt;
use crate::filter::{ArithmeticOp, CompareOp, Expression, Filter, PropertyName, SpatialOp};
use super::common::{identifier, keyword, non_keyword_identifier, number, string_literal, value, ws};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::char,
    combinator::{map, map_res, opt},
    multi::{many0, separated_list0, separated_list1},
    number::complete::double,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

pub fn filter(input: &str) -> IResult<&str, Filter> {
    or_filter(input)
}

fn or_filter(input: &str) -> IResult<&str, Filter> {
    map(
        separated_list1(ws(keyword("OR")), and_filter),
        |mut parts| if parts.len() == 1 { parts.remove(0) } else { Filter::Or(parts) },
    )(input)
}

fn and_filter(input: &str) -> IResult<&str, Filter> {
    map(
        separated_list1(ws(keyword("AND")), unary_filter),
        |mut parts| if parts.len() == 1 { parts.remove(0) } else { Filter::And(parts) },
    )(input)
}

fn unary_filter(input: &str) -> IResult<&str, Filter> {
    alt((
        map(preceded(ws(keyword("NOT")), unary_filter), Filter::negate),
        delimited(ws(char('(')), filter, ws(char(')'))),
        map(ws(keyword("INCLUDE")), |_| Filter::Include),
        map(ws(keyword("EXCLUDE")), |_| Filter::Exclude),
        id_filter,
        spatial_filter,
        predicate,
    ))(input)
}

/// `IN ('roads.1', 'roads.2')` with no left operand matches feature ids
fn id_filter(input: &str) -> IResult<&str, Filter> {
    map(
        preceded(
            ws(keyword("IN")),
            delimited(
                ws(char('(')),
                separated_list1(ws(char(',')), ws(string_literal)),
                ws(char(')')),
            ),
        ),
        Filter::Id,
    )(input)
}

fn spatial_op(input: &str) -> IResult<&str, SpatialOp> {
    alt((
        map(keyword("INTERSECTS"), |_| SpatialOp::Intersects),
        map(keyword("CONTAINS"), |_| SpatialOp::Contains),
        map(keyword("WITHIN"), |_| SpatialOp::Within),
        map(keyword("DISJOINT"), |_| SpatialOp::Disjoint),
        map(keyword("TOUCHES"), |_| SpatialOp::Touches),
        map(keyword("CROSSES"), |_| SpatialOp::Crosses),
        map(keyword("OVERLAPS"), |_| SpatialOp::Overlaps),
        map(keyword("EQUALS"), |_| SpatialOp::Equals),
    ))(input)
}

fn spatial_filter(input: &str) -> IResult<&str, Filter> {
    alt((bbox_filter, distance_filter, binary_spatial_filter))(input)
}

/// `BBOX(geom, minx, miny, maxx, maxy [, 'EPSG:4326'])`
fn bbox_filter(input: &str) -> IResult<&str, Filter> {
    let (input, _) = ws(keyword("BBOX"))(input)?;
    let (input, (prop, _, min_x, _, min_y, _, max_x, _, max_y, crs)) = delimited(
        ws(char('(')),
        tuple((
            property,
            ws(char(',')),
            ws(double),
            ws(char(',')),
            ws(double),
            ws(char(',')),
            ws(double),
            ws(char(',')),
            ws(double),
            opt(preceded(ws(char(',')), ws(crs_code))),
        )),
        ws(char(')')),
    )(input)?;
    let mut env = Envelope::new(min_x, min_y, max_x, max_y);
    env.srid = crs;
    Ok((
        input,
        Filter::Spatial {
            op: SpatialOp::BBox,
            property: Expression::Property(prop),
            geometry: Expression::Literal(Value::Geometry(Geometry::from_envelope(&env))),
            distance: None,
        },
    ))
}

/// `'EPSG:4326'` or a bare SRID
fn crs_code(input: &str) -> IResult<&str, i32> {
    alt((
        map_res(string_literal, |s: String| {
            let code = s.rsplit(':').next().unwrap_or_default().to_string();
            code.parse::<i32>()
        }),
        map_res(nom::character::complete::digit1, str::parse::<i32>),
    ))(input)
}

/// `DWITHIN(geom, POINT(1 2), 10, meters)` / `BEYOND(...)`
fn distance_filter(input: &str) -> IResult<&str, Filter> {
    let (input, op) = ws(alt((
        map(keyword("DWITHIN"), |_| SpatialOp::DWithin),
        map(keyword("BEYOND"), |_| SpatialOp::Beyond),
    )))(input)?;
    let (input, (prop, _, geometry, _, distance, _units)) = delimited(
        ws(char('(')),
        tuple((
            property,
            ws(char(',')),
            ws(wkt),
            ws(char(',')),
            ws(double),
            opt(preceded(ws(char(',')), ws(identifier))),
        )),
        ws(char(')')),
    )(input)?;
    Ok((
        input,
        Filter::Spatial {
            op,
            property: Expression::Property(prop),
            geometry: Expression::Literal(Value::Geometry(geometry)),
            distance: Some(distance),
        },
    ))
}

fn binary_spatial_filter(input: &str) -> IResult<&str, Filter> {
    let (input, op) = ws(spatial_op)(input)?;
    let (input, (prop, _, geometry)) = delimited(
        ws(char('(')),
        tuple((property, ws(char(',')), ws(wkt))),
        ws(char(')')),
    )(input)?;
    Ok((
        input,
        Filter::Spatial {
            op,
            property: Expression::Property(prop),
            geometry: Expression::Literal(Value::Geometry(geometry)),
            distance: None,
        },
    ))
}

fn compare_op(input: &str) -> IResult<&str, CompareOp> {
    // Two-character operators first
    alt((
        map(tag("<>"), |_| CompareOp::Ne),
        map(tag("!="), |_| CompareOp::Ne),
        map(tag("<="), |_| CompareOp::Le),
        map(tag(">="), |_| CompareOp::Ge),
        map(tag("="), |_| CompareOp::Eq),
        map(tag("<"), |_| CompareOp::Lt),
        map(tag(">"), |_| CompareOp::Gt),
    ))(input)
}

enum Tail {
    Compare(CompareOp, Expression),
    Between(bool, Expression, Expression),
    Like(bool, String, bool),
    IsNull(bool),
    In(bool, Vec<Expression>),
}

fn predicate_tail(input: &str) -> IResult<&str, Tail> {
    alt((
        map(pair(ws(compare_op), expression), |(op, rhs)| Tail::Compare(op, rhs)),
        map(
            tuple((
                opt(ws(keyword("NOT"))),
                ws(keyword("BETWEEN")),
                expression,
                ws(keyword("AND")),
                expression,
            )),
            |(not, _, lo, _, hi)| Tail::Between(not.is_some(), lo, hi),
        ),
        map(
            tuple((
                opt(ws(keyword("NOT"))),
                ws(alt((keyword("LIKE"), keyword("ILIKE")))),
                ws(string_literal),
            )),
            |(not, kw, pattern)| Tail::Like(not.is_some(), pattern, kw.eq_ignore_ascii_case("LIKE")),
        ),
        map(
            tuple((ws(keyword("IS")), opt(ws(keyword("NOT"))), ws(keyword("NULL")))),
            |(_, not, _)| Tail::IsNull(not.is_some()),
        ),
        map(
            tuple((
                opt(ws(keyword("NOT"))),
                ws(keyword("IN")),
                delimited(ws(char('(')), separated_list1(ws(char(',')), expression), ws(char(')'))),
            )),
            |(not, _, values)| Tail::In(not.is_some(), values),
        ),
    ))(input)
}

fn predicate(input: &str) -> IResult<&str, Filter> {
    let (input, lhs) = expression(input)?;
    let (input, tail) = predicate_tail(input)?;
    let filter = match tail {
        Tail::Compare(op, rhs) => Filter::Compare {
            op,
            left: lhs,
            right: rhs,
            match_case: true,
        },
        Tail::Between(not, lower, upper) => negate_if(
            not,
            Filter::Between {
                expr: lhs,
                lower,
                upper,
            },
        ),
        Tail::Like(not, pattern, match_case) => negate_if(
            not,
            Filter::Like {
                expr: lhs,
                pattern,
                match_case,
            },
        ),
        Tail::IsNull(not) => negate_if(not, Filter::IsNull(lhs)),
        Tail::In(not, values) => negate_if(not, Filter::In { expr: lhs, values }),
    };
    Ok((input, filter))
}

fn negate_if(not: bool, filter: Filter) -> Filter {
    if not { filter.negate() } else { filter }
}

/// Property name, optionally qualified: `name` or `alias.name`
pub fn property(input: &str) -> IResult<&str, PropertyName> {
    ws(map(
        pair(non_keyword_identifier, opt(preceded(char('.'), identifier))),
        |(first, second)| match second {
            Some(name) => PropertyName::qualified(first, name),
            None => PropertyName::new(first),
        },
    ))(input)
}

pub fn expression(input: &str) -> IResult<&str, Expression> {
    let (input, first) = term(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            map(char('+'), |_| ArithmeticOp::Add),
            map(char('-'), |_| ArithmeticOp::Subtract),
        ))),
        term,
    ))(input)?;
    Ok((input, fold_arithmetic(first, rest)))
}

fn term(input: &str) -> IResult<&str, Expression> {
    let (input, first) = factor(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            map(char('*'), |_| ArithmeticOp::Multiply),
            map(char('/'), |_| ArithmeticOp::Divide),
        ))),
        factor,
    ))(input)?;
    Ok((input, fold_arithmetic(first, rest)))
}

fn fold_arithmetic(first: Expression, rest: Vec<(ArithmeticOp, Expression)>) -> Expression {
    rest.into_iter().fold(first, |left, (op, right)| Expression::Arithmetic {
        op,
        left: Box::new(left),
        right: Box::new(right),
    })
}

fn factor(input: &str) -> IResult<&str, Expression> {
    alt((
        map(ws(number), Expression::Literal),
        map(ws(value), Expression::Literal),
        function_call,
        map(property, Expression::Property),
        delimited(ws(char('(')), expression, ws(char(')'))),
    ))(input)
}

fn function_call(input: &str) -> IResult<&str, Expression> {
    map(
        pair(
            ws(non_keyword_identifier),
            delimited(ws(char('(')), separated_list0(ws(char(',')), expression), ws(char(')'))),
        ),
        |(name, args)| Expression::Function { name, args },
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nom::combinator::all_consuming;

    fn parse(text: &str) -> Filter {
        all_consuming(filter)(text).unwrap().1
    }

    #[test]
    fn test_comparison() {
        assert_eq!(parse("age >= 30"), Filter::compare(CompareOp::Ge, "age", Value::Integer(30)));
        assert_eq!(parse("name <> 'x'"), Filter::compare(CompareOp::Ne, "name", Value::Text("x".to_string())));
    }

    #[test]
    fn test_precedence() {
        let f = parse("a = 1 OR b = 2 AND c = 3");
        match f {
            Filter::Or(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[1], Filter::And(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parenthesized_and_negated() {
        let f = parse("NOT (a = 1 OR a = 2)");
        assert!(matches!(f, Filter::Not(inner) if matches!(*inner, Filter::Or(_))));
    }

    #[test]
    fn test_between_like_null_in() {
        assert!(matches!(parse("age BETWEEN 1 AND 5"), Filter::Between { .. }));
        assert!(matches!(parse("name ILIKE 'a%'"), Filter::Like { match_case: false, .. }));
        assert_eq!(parse("name IS NOT NULL"), Filter::not_null("name"));
        assert!(matches!(parse("age NOT IN (1, 2)"), Filter::Not(_)));
    }

    #[test]
    fn test_id_filter() {
        assert_eq!(parse("IN ('roads.1', 'roads.2')"), Filter::ids(["roads.1", "roads.2"]));
    }

    #[test]
    fn test_spatial_filters() {
        match parse("BBOX(geom, 0, 0, 10, 10, 'EPSG:4326')") {
            Filter::Spatial { op: SpatialOp::BBox, geometry: Expression::Literal(Value::Geometry(g)), .. } => {
                assert_eq!(g.srid, Some(4326));
                assert_eq!(g.envelope().max_x, 10.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            parse("DWITHIN(geom, POINT (1 2), 10, meters)"),
            Filter::Spatial { op: SpatialOp::DWithin, distance: Some(d), .. } if d == 10.0
        ));
        assert!(matches!(
            parse("INTERSECTS(geom, POLYGON ((0 0, 0 1, 1 1, 0 0)))"),
            Filter::Spatial { op: SpatialOp::Intersects, .. }
        ));
    }

    #[test]
    fn test_qualified_property_and_arithmetic() {
        match parse("b.lanes * 2 > a.lanes + 1") {
            Filter::Compare { left: Expression::Arithmetic { left, .. }, right, .. } => {
                assert_eq!(*left, Expression::Property(PropertyName::qualified("b", "lanes")));
                assert!(matches!(right, Expression::Arithmetic { op: ArithmeticOp::Add, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_function_call() {
        assert!(matches!(
            parse("strToUpperCase(name) = 'A'"),
            Filter::Compare { left: Expression::Function { .. }, .. }
        ));
    }
}

use crate::core::{DataType, GeometryKind, Value};
use chrono::{NaiveDate, NaiveDateTime, DateTime, Utc};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while},
    character::complete::{alpha1, char, digit1, multispace0, none_of},
    combinator::{map, map_res, not, opt, peek, recognize, value as constant},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

pub fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

pub fn identifier(input: &str) -> IResult<&str, String> {
    map(
        recognize(pair(
            alt((alpha1, tag("_"))),
            take_while(|c: char| c.is_alphanumeric() || c == '_'),
        )),
        |s: &str| s.to_string(),
    )(input)
}

/// Words that terminate or structure a predicate and so cannot name a property
const KEYWORDS: &[&str] = &[
    "AND", "OR", "NOT", "IS", "NULL", "IN", "LIKE", "ILIKE", "BETWEEN", "TRUE", "FALSE",
    "INCLUDE", "EXCLUDE",
];

// Identifier that is not a reserved keyword
pub fn non_keyword_identifier(input: &str) -> IResult<&str, String> {
    use nom::combinator::verify;

    verify(identifier, |s: &String| {
        let upper = s.to_uppercase();
        !KEYWORDS.contains(&upper.as_str())
    })(input)
}

/// Case-insensitive keyword that is not the prefix of a longer identifier
pub fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(
        tag_no_case(word),
        not(peek(nom::character::complete::satisfy(|c: char| c.is_alphanumeric() || c == '_'))),
    )
}

fn precision(input: &str) -> IResult<&str, ()> {
    constant(
        (),
        opt(delimited(
            ws(char('(')),
            pair(ws(digit1), opt(preceded(ws(char(',')), ws(digit1)))),
            ws(char(')')),
        )),
    )(input)
}

fn geometry_type(input: &str) -> IResult<&str, DataType> {
    map_res(identifier, |name: String| {
        GeometryKind::from_name(&name)
            .map(DataType::Geometry)
            .ok_or("not a geometry type")
    })(input)
}

pub fn data_type(input: &str) -> IResult<&str, DataType> {
    let (input, base) = alt((
        // Numeric types with precision/scale
        map(
            pair(alt((keyword("NUMERIC"), keyword("DECIMAL"))), precision),
            |_| DataType::Numeric,
        ),
        // Integer types
        map(keyword("SMALLINT"), |_| DataType::SmallInt),
        map(
            alt((keyword("INTEGER"), keyword("BIGINT"), keyword("INT"), keyword("SERIAL"), keyword("BIGSERIAL"))),
            |_| DataType::Integer,
        ),
        // Floating point
        map(keyword("DOUBLE PRECISION"), |_| DataType::Real),
        map(alt((keyword("REAL"), keyword("FLOAT"), keyword("DOUBLE"))), |_| DataType::Real),
        // String types with length
        map(pair(alt((keyword("VARCHAR"), keyword("CHAR"))), precision), |_| DataType::Text),
        map(keyword("TEXT"), |_| DataType::Text),
        // Boolean
        map(alt((keyword("BOOLEAN"), keyword("BOOL"))), |_| DataType::Boolean),
        // Date/Time types
        map(keyword("TIMESTAMPTZ"), |_| DataType::TimestampTz),
        map(keyword("TIMESTAMP"), |_| DataType::Timestamp),
        map(keyword("DATE"), |_| DataType::Date),
        map(keyword("TIME"), |_| DataType::Time),
        // Special types
        map(keyword("UUID"), |_| DataType::Uuid),
        map(alt((keyword("JSONB"), keyword("JSON"))), |_| DataType::Json),
        map(keyword("BYTEA"), |_| DataType::Bytea),
        geometry_type,
    ))(input)?;
    // Array suffix: INTEGER[]
    let (input, array) = opt(pair(ws(char('[')), char(']')))(input)?;
    Ok((
        input,
        if array.is_some() { DataType::Array(Box::new(base)) } else { base },
    ))
}

/// Single-quoted string; `''` inside the quotes is one quote
pub fn string_literal(input: &str) -> IResult<&str, String> {
    map(
        delimited(
            char('\''),
            many0(alt((map(tag("''"), |_| '\''), none_of("'")))),
            char('\''),
        ),
        |chars: Vec<char>| chars.into_iter().collect(),
    )(input)
}

/// Signed integer or decimal number, with optional exponent
pub fn number(input: &str) -> IResult<&str, Value> {
    map_res(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit1)),
            opt(tuple((alt((char('e'), char('E'))), opt(alt((char('+'), char('-')))), digit1))),
        ))),
        |s: &str| -> Result<Value, String> {
            if s.contains(['.', 'e', 'E']) {
                s.parse::<f64>().map(Value::Real).map_err(|e| format!("{e:?}"))
            } else {
                s.parse::<i64>().map(Value::Integer).map_err(|e| format!("{e:?}"))
            }
        },
    )(input)
}

pub fn value(input: &str) -> IResult<&str, Value> {
    alt((
        // NULL
        map(keyword("NULL"), |_| Value::Null),

        // Boolean
        map(keyword("TRUE"), |_| Value::Boolean(true)),
        map(keyword("FALSE"), |_| Value::Boolean(false)),

        // Date/Timestamp/Text in quotes
        map(string_literal, |s: String| {
            // Try to parse as date first
            if let Ok(d) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
                return Value::Date(d);
            }
            // Try timestamp with timezone
            if let Ok(t) = DateTime::parse_from_rfc3339(&s) {
                return Value::TimestampTz(t.with_timezone(&Utc));
            }
            // Try timestamp without timezone
            if let Ok(t) = NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S") {
                return Value::Timestamp(t);
            }
            // Otherwise, treat as text
            Value::Text(s)
        }),

        number,
    ))(input)
}

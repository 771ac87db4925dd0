use crate::core::{AttributeDescriptor, DataType, FeatureSchema};
use super::common::{data_type, identifier, keyword, ws};
use nom::{
    branch::alt,
    character::complete::{char, digit1},
    combinator::{map_res, opt, recognize},
    multi::separated_list1,
    sequence::{delimited, pair, preceded},
    IResult,
};

/// Feature type described in DDL-like syntax:
/// `roads (fid INTEGER PRIMARY KEY, name VARCHAR(40) NOT NULL, geom LINESTRING SRID 4326)`
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub schema: FeatureSchema,
    /// Columns flagged PRIMARY KEY, in declaration order
    pub key_columns: Vec<(String, DataType)>,
}

struct ColumnDef {
    attribute: AttributeDescriptor,
    primary_key: bool,
}

fn srid(input: &str) -> IResult<&str, i32> {
    preceded(
        ws(keyword("SRID")),
        ws(map_res(recognize(pair(opt(char('-')), digit1)), str::parse::<i32>)),
    )(input)
}

fn column_def(input: &str) -> IResult<&str, ColumnDef> {
    let (input, name) = ws(identifier)(input)?;
    let (input, data_type) = ws(data_type)(input)?;
    let (input, srid) = opt(srid)(input)?;
    let (input, primary_key) = opt(ws(keyword("PRIMARY KEY")))(input)?;
    let (input, not_null) = opt(ws(keyword("NOT NULL")))(input)?;

    let mut attribute = match data_type {
        DataType::Geometry(kind) => AttributeDescriptor::geometry(name, kind, srid),
        other => AttributeDescriptor::new(name, other),
    };
    if not_null.is_some() || primary_key.is_some() {
        attribute = attribute.not_null();
    }
    Ok((
        input,
        ColumnDef {
            attribute,
            primary_key: primary_key.is_some(),
        },
    ))
}

pub fn table_definition(input: &str) -> IResult<&str, TableDefinition> {
    let (input, _) = opt(ws(alt((keyword("CREATE TABLE"), keyword("TABLE")))))(input)?;
    let (input, name) = ws(identifier)(input)?;
    let (input, columns) = delimited(
        ws(char('(')),
        separated_list1(ws(char(',')), column_def),
        ws(char(')')),
    )(input)?;

    let key_columns = columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| (c.attribute.name.clone(), c.attribute.data_type.clone()))
        .collect();
    let attributes = columns.into_iter().map(|c| c.attribute).collect();
    Ok((
        input,
        TableDefinition {
            schema: FeatureSchema::new(name, attributes),
            key_columns,
        },
    ))
}

/// Feature type names separated by commas, used for join lists
pub fn name_list(input: &str) -> IResult<&str, Vec<String>> {
    separated_list1(ws(char(',')), ws(identifier))(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::GeometryKind;

    #[test]
    fn test_table_definition() {
        let (_, def) = table_definition(
            "roads (fid INTEGER PRIMARY KEY, name VARCHAR(40) NOT NULL, geom LINESTRING SRID 4326, lanes int)",
        )
        .unwrap();
        assert_eq!(def.schema.name, "roads");
        assert_eq!(def.key_columns, vec![("fid".to_string(), DataType::Integer)]);
        let geom = def.schema.attribute("geom").unwrap();
        assert_eq!(geom.data_type, DataType::Geometry(GeometryKind::LineString));
        assert_eq!(geom.srid, Some(4326));
        assert!(!def.schema.attribute("name").unwrap().nullable);
        assert!(def.schema.attribute("lanes").unwrap().nullable);
    }

    #[test]
    fn test_create_table_prefix() {
        let (_, def) = table_definition("CREATE TABLE t (a TEXT)").unwrap();
        assert_eq!(def.schema.name, "t");
        assert!(def.key_columns.is_empty());
    }
}

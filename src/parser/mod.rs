// Module declarations
mod common;
mod filter;
mod schema;

pub use filter::{expression, property};
pub use schema::{name_list, TableDefinition};

use crate::core::StoreError;
use crate::filter::Filter;
use nom::combinator::all_consuming;

/// Parses CQL-like filter text. Empty input is `INCLUDE`.
pub fn parse_filter(input: &str) -> Result<Filter, StoreError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Filter::Include);
    }
    match all_consuming(filter::filter)(input) {
        Ok((_, filter)) => Ok(filter),
        Err(e) => Err(StoreError::Parse(format!("invalid filter '{input}': {e}"))),
    }
}

/// Parses a feature type definition, see [`TableDefinition`]
pub fn parse_table_definition(input: &str) -> Result<TableDefinition, StoreError> {
    let input = input.trim().trim_end_matches(';');
    match all_consuming(schema::table_definition)(input) {
        Ok((_, def)) => Ok(def),
        Err(e) => Err(StoreError::Parse(format!("invalid table definition: {e}"))),
    }
}

/// Feature id encoding
///
/// A feature id is `{type}.{key}`. With no key columns the key is a random
/// `fid-{uuid}`; one key column is written as is (dots included); several key
/// columns are joined with `.`, each part percent-escaping `%` and `.` and a
/// NULL part written as `%00`.

use uuid::Uuid;
use crate::core::{StoreError, Value};
use super::PrimaryKey;

const NULL_PART: &str = "%00";

/// Encodes already-read key values (in key order) into a feature id
#[must_use]
pub fn encode_fid(type_name: &str, key_values: &[Option<String>]) -> String {
    match key_values {
        [] => format!("{type_name}.fid-{}", Uuid::new_v4().simple()),
        [single] => format!("{type_name}.{}", single.as_deref().unwrap_or("null")),
        _ => {
            let parts: Vec<String> = key_values
                .iter()
                .map(|v| v.as_deref().map_or_else(|| NULL_PART.to_string(), escape_part))
                .collect();
            format!("{type_name}.{}", parts.join("."))
        }
    }
}

fn escape_part(part: &str) -> String {
    part.replace('%', "%25").replace('.', "%2E")
}

/// `None` for the NULL marker
fn unescape_part(part: &str) -> Result<Option<String>, String> {
    if part == NULL_PART {
        return Ok(None);
    }
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let escape = rest.get(at..at + 3).unwrap_or(&rest[at..]);
        match escape {
            "%25" => out.push('%'),
            "%2E" | "%2e" => out.push('.'),
            other => return Err(format!("bad escape '{other}' in key part '{part}'")),
        }
        rest = &rest[at + escape.len()..];
    }
    out.push_str(rest);
    Ok(Some(out))
}

/// Convenience over typed values
#[must_use]
pub fn encode_fid_values(type_name: &str, key_values: &[Value]) -> String {
    let strings: Vec<Option<String>> = key_values
        .iter()
        .map(|v| if v.is_null() { None } else { Some(v.to_string()) })
        .collect();
    encode_fid(type_name, &strings)
}

/// Decodes a feature id back into typed key values.
///
/// `strict` makes a part that does not convert to its column type an error;
/// otherwise the raw text is kept.
pub fn decode_fid(type_name: &str, key: &PrimaryKey, fid: &str, strict: bool) -> Result<Vec<Value>, StoreError> {
    let body = fid
        .strip_prefix(type_name)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(fid);
    let parts: Vec<Option<String>> = match key.columns.len() {
        0 => return Ok(Vec::new()),
        1 => vec![Some(body.to_string())],
        n => {
            let parts = body
                .split('.')
                .map(unescape_part)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::InvalidFeatureId(format!("'{fid}': {e}")))?;
            if parts.len() != n {
                return Err(StoreError::InvalidFeatureId(format!(
                    "'{fid}' has {} key parts, {} expects {n}",
                    parts.len(),
                    key.table
                )));
            }
            parts
        }
    };
    parts
        .into_iter()
        .zip(&key.columns)
        .map(|(part, column)| {
            let Some(part) = part else {
                return Ok(Value::Null);
            };
            let raw = Value::Text(part);
            match raw.coerce_to(&column.data_type) {
                Ok(v) => Ok(v),
                Err(_) if !strict => Ok(raw),
                Err(e) => Err(StoreError::InvalidFeatureId(format!("'{fid}': {e}"))),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::primary_key::{GenerationKind, PrimaryKeyColumn};

    fn key(columns: &[(&str, DataType)]) -> PrimaryKey {
        PrimaryKey::new(
            "roads",
            columns
                .iter()
                .map(|(n, t)| PrimaryKeyColumn::new(*n, t.clone(), GenerationKind::NonIncrementing))
                .collect(),
        )
    }

    #[test]
    fn test_null_key_synthesizes_unique_ids() {
        let a = encode_fid("roads", &[]);
        let b = encode_fid("roads", &[]);
        assert!(a.starts_with("roads.fid-"));
        assert_ne!(a, b);
        assert_eq!(decode_fid("roads", &PrimaryKey::null("roads"), &a, true).unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn test_single_key_keeps_dots() {
        let pk = key(&[("code", DataType::Text)]);
        let fid = encode_fid_values("roads", &[Value::Text("a.b".to_string())]);
        assert_eq!(fid, "roads.a.b");
        assert_eq!(decode_fid("roads", &pk, &fid, true).unwrap(), vec![Value::Text("a.b".to_string())]);
    }

    #[test]
    fn test_composite_round_trip() {
        let pk = key(&[("region", DataType::Text), ("id", DataType::Integer)]);
        let values = vec![Value::Text("north".to_string()), Value::Integer(42)];
        let fid = encode_fid_values("roads", &values);
        assert_eq!(fid, "roads.north.42");
        assert_eq!(decode_fid("roads", &pk, &fid, true).unwrap(), values);
    }

    #[test]
    fn test_composite_parts_are_escaped() {
        let pk = key(&[("region", DataType::Text), ("id", DataType::Integer), ("weight", DataType::Real)]);
        let values = vec![Value::Text("n.e 5%".to_string()), Value::Integer(42), Value::Real(1.5)];
        let fid = encode_fid_values("roads", &values);
        assert_eq!(fid, "roads.n%2Ee 5%25.42.1%2E5");
        assert_eq!(decode_fid("roads", &pk, &fid, true).unwrap(), values);

        let with_null = vec![Value::Null, Value::Integer(7), Value::Real(0.25)];
        let fid = encode_fid_values("roads", &with_null);
        assert_eq!(fid, "roads.%00.7.0%2E25");
        assert_eq!(decode_fid("roads", &pk, &fid, true).unwrap(), with_null);
        // Literal text "null" stays text
        let literal = vec![Value::Text("null".to_string()), Value::Integer(7), Value::Real(2.0)];
        let fid = encode_fid_values("roads", &literal);
        assert_eq!(decode_fid("roads", &pk, &fid, true).unwrap(), literal);
    }

    #[test]
    fn test_bad_escape() {
        let pk = key(&[("region", DataType::Text), ("id", DataType::Integer)]);
        assert!(matches!(
            decode_fid("roads", &pk, "roads.a%2.1", false),
            Err(StoreError::InvalidFeatureId(_))
        ));
    }

    #[test]
    fn test_wrong_part_count() {
        let pk = key(&[("region", DataType::Text), ("id", DataType::Integer)]);
        assert!(matches!(
            decode_fid("roads", &pk, "roads.42", false),
            Err(StoreError::InvalidFeatureId(_))
        ));
    }

    #[test]
    fn test_strictness() {
        let pk = key(&[("id", DataType::Integer)]);
        assert!(decode_fid("roads", &pk, "roads.abc", true).is_err());
        assert_eq!(
            decode_fid("roads", &pk, "roads.abc", false).unwrap(),
            vec![Value::Text("abc".to_string())]
        );
    }
}

use serde::{Deserialize, Serialize};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use uuid::Uuid;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use std::cmp::Ordering;
use std::str::FromStr;
use super::data_type::DataType;
use super::error::StoreError;
use super::geometry::Geometry;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    // Numeric types
    SmallInt(i16),
    Integer(i64),
    Real(f64),
    Numeric(Decimal),
    // String types
    Text(String),
    // Date/Time types
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    // Special types
    Uuid(Uuid),
    Json(String),
    Bytea(Vec<u8>),
    Geometry(Geometry),
    Array(Vec<Value>),
}

impl Value {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::SmallInt(i) => Some(*i as i64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Json(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::SmallInt(i) => Some(f64::from(*i)),
            Self::Integer(i) => Some(*i as f64),
            Self::Real(r) => Some(*r),
            Self::Numeric(d) => d.to_f64(),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_geometry(&self) -> Option<&Geometry> {
        match self {
            Self::Geometry(g) => Some(g),
            _ => None,
        }
    }

    /// Runtime type of the value; `None` for NULL, which matches any type
    #[must_use]
    pub fn data_type(&self) -> Option<DataType> {
        Some(match self {
            Self::Null => return None,
            Self::Boolean(_) => DataType::Boolean,
            Self::SmallInt(_) => DataType::SmallInt,
            Self::Integer(_) => DataType::Integer,
            Self::Real(_) => DataType::Real,
            Self::Numeric(_) => DataType::Numeric,
            Self::Text(_) => DataType::Text,
            Self::Date(_) => DataType::Date,
            Self::Time(_) => DataType::Time,
            Self::Timestamp(_) => DataType::Timestamp,
            Self::TimestampTz(_) => DataType::TimestampTz,
            Self::Uuid(_) => DataType::Uuid,
            Self::Json(_) => DataType::Json,
            Self::Bytea(_) => DataType::Bytea,
            Self::Geometry(g) => DataType::Geometry(g.kind()),
            Self::Array(items) => DataType::Array(Box::new(
                items
                    .iter()
                    .find_map(Self::data_type)
                    .unwrap_or(DataType::Unknown),
            )),
        })
    }

    /// Whether the value can be stored in an attribute of `target` type as is
    #[must_use]
    pub fn conforms_to(&self, target: &DataType) -> bool {
        match (self, target) {
            (Self::Null, _) | (_, DataType::Unknown) => true,
            (Self::Geometry(_), DataType::Geometry(_)) => true,
            (Self::Array(items), DataType::Array(inner)) => items.iter().all(|v| v.conforms_to(inner)),
            _ => self.data_type().as_ref() == Some(target),
        }
    }

    /// Best-effort conversion to `target`
    pub fn coerce_to(&self, target: &DataType) -> Result<Self, StoreError> {
        if self.conforms_to(target) {
            return Ok(self.clone());
        }
        let mismatch = || StoreError::TypeMismatch(format!("cannot convert {self:?} to {target}"));
        let converted = match (target, self) {
            (DataType::SmallInt, _) => self
                .coerce_to(&DataType::Integer)?
                .as_int()
                .and_then(|i| i16::try_from(i).ok())
                .map(Self::SmallInt),
            (DataType::Integer, Self::SmallInt(i)) => Some(Self::Integer(i64::from(*i))),
            (DataType::Integer, Self::Real(r)) if r.fract() == 0.0 => Some(Self::Integer(*r as i64)),
            (DataType::Integer, Self::Numeric(d)) if d.fract().is_zero() => d.to_i64().map(Self::Integer),
            (DataType::Integer, Self::Boolean(b)) => Some(Self::Integer(i64::from(*b))),
            (DataType::Integer, Self::Text(s)) => s.trim().parse().ok().map(Self::Integer),
            (DataType::Real, Self::Text(s)) => s.trim().parse().ok().map(Self::Real),
            (DataType::Real, _) => self.as_f64().map(Self::Real),
            (DataType::Numeric, Self::SmallInt(i)) => Some(Self::Numeric(Decimal::from(*i))),
            (DataType::Numeric, Self::Integer(i)) => Some(Self::Numeric(Decimal::from(*i))),
            (DataType::Numeric, Self::Real(r)) => Decimal::from_f64(*r).map(Self::Numeric),
            (DataType::Numeric, Self::Text(s)) => Decimal::from_str(s.trim()).ok().map(Self::Numeric),
            (DataType::Text, Self::Geometry(g)) => Some(Self::Text(g.to_wkt())),
            (DataType::Text, other) => Some(Self::Text(other.to_string())),
            (DataType::Boolean, Self::Text(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "1" | "y" | "yes" => Some(Self::Boolean(true)),
                "false" | "f" | "0" | "n" | "no" => Some(Self::Boolean(false)),
                _ => None,
            },
            (DataType::Boolean, Self::SmallInt(_) | Self::Integer(_)) => match self.as_int() {
                Some(0) => Some(Self::Boolean(false)),
                Some(1) => Some(Self::Boolean(true)),
                _ => None,
            },
            (DataType::Date, Self::Text(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok().map(Self::Date),
            (DataType::Date, Self::Timestamp(t)) => Some(Self::Date(t.date())),
            (DataType::Time, Self::Text(s)) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S").ok().map(Self::Time),
            (DataType::Timestamp, Self::Text(s)) => parse_timestamp(s.trim()).map(Self::Timestamp),
            (DataType::Timestamp, Self::Date(d)) => d.and_hms_opt(0, 0, 0).map(Self::Timestamp),
            (DataType::Timestamp, Self::TimestampTz(t)) => Some(Self::Timestamp(t.naive_utc())),
            (DataType::TimestampTz, Self::Text(s)) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|t| Self::TimestampTz(t.with_timezone(&Utc)))
                .or_else(|| parse_timestamp(s.trim()).map(|t| Self::TimestampTz(t.and_utc()))),
            (DataType::TimestampTz, Self::Timestamp(t)) => Some(Self::TimestampTz(t.and_utc())),
            (DataType::Uuid, Self::Text(s)) => Uuid::parse_str(s.trim()).ok().map(Self::Uuid),
            (DataType::Json, Self::Text(s)) => serde_json::from_str::<serde_json::Value>(s)
                .ok()
                .map(|_| Self::Json(s.clone())),
            (DataType::Bytea, Self::Text(s)) => s
                .strip_prefix("\\x")
                .and_then(|h| hex::decode(h).ok())
                .map(Self::Bytea),
            (DataType::Geometry(_), Self::Text(s)) => Geometry::parse_wkt(s).ok().map(Self::Geometry),
            (DataType::Array(inner), Self::Array(items)) => Some(Self::Array(
                items.iter().map(|v| v.coerce_to(inner)).collect::<Result<Vec<_>, _>>()?,
            )),
            _ => None,
        };
        converted.ok_or_else(mismatch)
    }

    /// SQL-style comparison; `None` when either side is NULL or the types
    /// are not comparable
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => None,
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            (Self::Time(a), Self::Time(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            (Self::TimestampTz(a), Self::TimestampTz(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::TimestampTz(b)) => Some(a.and_utc().cmp(b)),
            (Self::TimestampTz(a), Self::Timestamp(b)) => Some(a.cmp(&b.and_utc())),
            (Self::Uuid(a), Self::Uuid(b)) => Some(a.cmp(b)),
            (Self::Bytea(a), Self::Bytea(b)) => Some(a.cmp(b)),
            (Self::Numeric(a), Self::Numeric(b)) => Some(a.cmp(b)),
            // Cross-type numeric comparisons
            (Self::SmallInt(_) | Self::Integer(_), Self::SmallInt(_) | Self::Integer(_)) => {
                Some(self.as_int()?.cmp(&other.as_int()?))
            }
            (a, b) if a.as_f64().is_some() && b.as_f64().is_some() => a.as_f64()?.partial_cmp(&b.as_f64()?),
            // Text against a typed literal: compare in the literal's type
            (Self::Text(_), b) => b.data_type().and_then(|t| self.coerce_to(&t).ok())?.compare(b),
            (a, Self::Text(_)) => a.data_type().and_then(|t| other.coerce_to(&t).ok()).and_then(|b| a.compare(&b)),
            _ => None,
        }
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::SmallInt(i) => write!(f, "{i}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Numeric(d) => write!(f, "{d}"),
            Self::Text(s) | Self::Json(s) => write!(f, "{s}"),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::Time(t) => write!(f, "{}", t.format("%H:%M:%S")),
            Self::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S")),
            Self::TimestampTz(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S %Z")),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Bytea(b) => write!(f, "\\x{}", hex::encode(b)),
            Self::Geometry(g) => write!(f, "{g}"),
            Self::Array(items) => {
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(Value::Integer(42).to_string(), "42");
        assert_eq!(Value::Real(3.5).to_string(), "3.5");
        assert_eq!(Value::Text("hello".to_string()).to_string(), "hello");
        assert_eq!(Value::Bytea(vec![0xde, 0xad]).to_string(), "\\xdead");
        assert_eq!(
            Value::Array(vec![Value::Integer(1), Value::Integer(2)]).to_string(),
            "{1,2}"
        );
    }

    #[test]
    fn test_coerce_text_to_numbers() {
        let v = Value::Text("42".to_string());
        assert_eq!(v.coerce_to(&DataType::Integer).unwrap(), Value::Integer(42));
        assert_eq!(v.coerce_to(&DataType::SmallInt).unwrap(), Value::SmallInt(42));
        assert_eq!(v.coerce_to(&DataType::Real).unwrap(), Value::Real(42.0));
        assert!(Value::Text("abc".to_string()).coerce_to(&DataType::Integer).is_err());
    }

    #[test]
    fn test_coerce_between_numeric_types() {
        assert_eq!(Value::SmallInt(7).coerce_to(&DataType::Integer).unwrap(), Value::Integer(7));
        assert_eq!(Value::Real(2.0).coerce_to(&DataType::Integer).unwrap(), Value::Integer(2));
        assert!(Value::Real(2.5).coerce_to(&DataType::Integer).is_err());
        assert_eq!(
            Value::Integer(3).coerce_to(&DataType::Numeric).unwrap(),
            Value::Numeric(Decimal::from(3))
        );
    }

    #[test]
    fn test_coerce_temporal() {
        let d = Value::Text("2024-02-29".to_string()).coerce_to(&DataType::Date).unwrap();
        assert_eq!(d, Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()));
        let ts = Value::Text("2024-02-29 10:11:12".to_string())
            .coerce_to(&DataType::Timestamp)
            .unwrap();
        assert!(matches!(ts, Value::Timestamp(_)));
    }

    #[test]
    fn test_coerce_json_validates() {
        let doc = Value::Text("{\"lanes\": 2}".to_string());
        assert_eq!(doc.coerce_to(&DataType::Json).unwrap(), Value::Json("{\"lanes\": 2}".to_string()));
        assert!(Value::Text("{lanes".to_string()).coerce_to(&DataType::Json).is_err());
    }

    #[test]
    fn test_null_conforms_to_everything() {
        assert!(Value::Null.conforms_to(&DataType::Integer));
        assert_eq!(Value::Null.coerce_to(&DataType::Text).unwrap(), Value::Null);
    }

    #[test]
    fn test_compare_cross_type() {
        assert_eq!(Value::Integer(5).compare(&Value::SmallInt(3)), Some(Ordering::Greater));
        assert_eq!(Value::Real(1.5).compare(&Value::Integer(2)), Some(Ordering::Less));
        assert_eq!(Value::Text("10".to_string()).compare(&Value::Integer(10)), Some(Ordering::Equal));
        assert_eq!(Value::Null.compare(&Value::Integer(1)), None);
        assert_eq!(Value::Boolean(true).compare(&Value::Integer(1)), None);
    }

    #[test]
    fn test_value_equality() {
        assert_eq!(Value::Integer(42), Value::Integer(42));
        assert_ne!(Value::Integer(42), Value::Integer(43));
        assert_eq!(Value::Text("hello".to_string()), Value::Text("hello".to_string()));
    }
}

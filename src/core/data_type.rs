use serde::{Deserialize, Serialize};
use super::geometry::GeometryKind;

/// Semantic type of an attribute (the "binding class" of a column)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    // Numeric types
    SmallInt,
    Integer,
    Real,
    Numeric,
    // String types
    Text,
    // Date/Time types
    Date,
    Time,
    Timestamp,
    TimestampTz,
    // Special types
    Uuid,
    Json,
    Bytea,
    Geometry(GeometryKind),
    Array(Box<DataType>),
    /// Lookup miss in the type registries
    Unknown,
}

impl DataType {
    #[must_use]
    pub const fn is_geometry(&self) -> bool {
        matches!(self, Self::Geometry(_))
    }

    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::SmallInt | Self::Integer | Self::Real | Self::Numeric)
    }

    #[must_use]
    pub const fn is_integral(&self) -> bool {
        matches!(self, Self::SmallInt | Self::Integer)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Boolean => write!(f, "Boolean"),
            Self::SmallInt => write!(f, "SmallInt"),
            Self::Integer => write!(f, "Integer"),
            Self::Real => write!(f, "Real"),
            Self::Numeric => write!(f, "Numeric"),
            Self::Text => write!(f, "Text"),
            Self::Date => write!(f, "Date"),
            Self::Time => write!(f, "Time"),
            Self::Timestamp => write!(f, "Timestamp"),
            Self::TimestampTz => write!(f, "TimestampTz"),
            Self::Uuid => write!(f, "Uuid"),
            Self::Json => write!(f, "Json"),
            Self::Bytea => write!(f, "Bytea"),
            Self::Geometry(kind) => write!(f, "Geometry({})", kind.as_str()),
            Self::Array(inner) => write!(f, "Array<{inner}>"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Driver-level SQL type code, the portable vocabulary between drivers and
/// the type registries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Bit,
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Float,
    Double,
    Numeric,
    Decimal,
    Char,
    Varchar,
    LongVarchar,
    Clob,
    Date,
    Time,
    Timestamp,
    TimestampWithTimezone,
    Binary,
    VarBinary,
    LongVarBinary,
    Blob,
    Array,
    Other,
    Null,
}

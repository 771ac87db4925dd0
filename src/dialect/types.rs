/// SQL type registries
///
/// Append-only maps seeded with a base set and extended per backend. Every
/// lookup miss falls back to `DataType::Unknown` / `SqlType::Other` instead
/// of failing.

use std::collections::HashMap;
use crate::core::{DataType, SqlType};

#[derive(Debug, Clone, Default)]
pub struct TypeMappings {
    sql_type_to_class: HashMap<SqlType, DataType>,
    class_to_sql_type: HashMap<DataType, SqlType>,
    /// Keyed by lower-cased native type name
    type_name_to_class: HashMap<String, DataType>,
    /// Native type names used when creating columns
    sql_type_names: HashMap<SqlType, String>,
    sql_type_name_overrides: HashMap<SqlType, String>,
}

impl TypeMappings {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Portable base set shared by every dialect
    #[must_use]
    pub fn base() -> Self {
        let mut m = Self::empty();
        for (sql, class) in [
            (SqlType::Bit, DataType::Boolean),
            (SqlType::Boolean, DataType::Boolean),
            (SqlType::TinyInt, DataType::SmallInt),
            (SqlType::SmallInt, DataType::SmallInt),
            (SqlType::Integer, DataType::Integer),
            (SqlType::BigInt, DataType::Integer),
            (SqlType::Real, DataType::Real),
            (SqlType::Float, DataType::Real),
            (SqlType::Double, DataType::Real),
            (SqlType::Numeric, DataType::Numeric),
            (SqlType::Decimal, DataType::Numeric),
            (SqlType::Char, DataType::Text),
            (SqlType::Varchar, DataType::Text),
            (SqlType::LongVarchar, DataType::Text),
            (SqlType::Clob, DataType::Text),
            (SqlType::Date, DataType::Date),
            (SqlType::Time, DataType::Time),
            (SqlType::Timestamp, DataType::Timestamp),
            (SqlType::TimestampWithTimezone, DataType::TimestampTz),
            (SqlType::Binary, DataType::Bytea),
            (SqlType::VarBinary, DataType::Bytea),
            (SqlType::LongVarBinary, DataType::Bytea),
            (SqlType::Blob, DataType::Bytea),
        ] {
            m.register_sql_type(sql, class);
        }
        for (class, sql) in [
            (DataType::Boolean, SqlType::Boolean),
            (DataType::SmallInt, SqlType::SmallInt),
            (DataType::Integer, SqlType::BigInt),
            (DataType::Real, SqlType::Double),
            (DataType::Numeric, SqlType::Numeric),
            (DataType::Text, SqlType::Varchar),
            (DataType::Date, SqlType::Date),
            (DataType::Time, SqlType::Time),
            (DataType::Timestamp, SqlType::Timestamp),
            (DataType::TimestampTz, SqlType::TimestampWithTimezone),
            (DataType::Bytea, SqlType::Blob),
            (DataType::Uuid, SqlType::Varchar),
            (DataType::Json, SqlType::LongVarchar),
        ] {
            m.register_class(class, sql);
        }
        for (sql, name) in [
            (SqlType::Boolean, "BOOLEAN"),
            (SqlType::SmallInt, "SMALLINT"),
            (SqlType::Integer, "INTEGER"),
            (SqlType::BigInt, "BIGINT"),
            (SqlType::Real, "REAL"),
            (SqlType::Double, "DOUBLE PRECISION"),
            (SqlType::Numeric, "NUMERIC"),
            (SqlType::Varchar, "VARCHAR"),
            (SqlType::LongVarchar, "TEXT"),
            (SqlType::Date, "DATE"),
            (SqlType::Time, "TIME"),
            (SqlType::Timestamp, "TIMESTAMP"),
            (SqlType::TimestampWithTimezone, "TIMESTAMP WITH TIME ZONE"),
            (SqlType::Blob, "BLOB"),
        ] {
            m.sql_type_names.insert(sql, name.to_string());
        }
        m
    }

    pub fn register_sql_type(&mut self, sql: SqlType, class: DataType) -> &mut Self {
        self.sql_type_to_class.insert(sql, class);
        self
    }

    pub fn register_class(&mut self, class: DataType, sql: SqlType) -> &mut Self {
        self.class_to_sql_type.insert(class, sql);
        self
    }

    pub fn register_type_name(&mut self, name: &str, class: DataType) -> &mut Self {
        self.type_name_to_class.insert(name.to_lowercase(), class);
        self
    }

    pub fn override_sql_type_name(&mut self, sql: SqlType, name: &str) -> &mut Self {
        self.sql_type_name_overrides.insert(sql, name.to_string());
        self
    }

    #[must_use]
    pub fn class_for_sql_type(&self, sql: SqlType) -> DataType {
        self.sql_type_to_class.get(&sql).cloned().unwrap_or(DataType::Unknown)
    }

    #[must_use]
    pub fn class_for_type_name(&self, name: &str) -> Option<DataType> {
        self.type_name_to_class.get(&name.to_lowercase()).cloned()
    }

    /// Native type name first, then the driver's type code
    #[must_use]
    pub fn class_for_column(&self, type_name: &str, sql: SqlType) -> DataType {
        self.class_for_type_name(type_name)
            .unwrap_or_else(|| self.class_for_sql_type(sql))
    }

    #[must_use]
    pub fn sql_type_for_class(&self, class: &DataType) -> SqlType {
        match class {
            DataType::Array(_) => SqlType::Array,
            other => self.class_to_sql_type.get(other).copied().unwrap_or(SqlType::Other),
        }
    }

    /// Native name for a column of the given type, overrides first
    #[must_use]
    pub fn sql_type_name(&self, sql: SqlType) -> Option<&str> {
        self.sql_type_name_overrides
            .get(&sql)
            .or_else(|| self.sql_type_names.get(&sql))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_lookups() {
        let m = TypeMappings::base();
        assert_eq!(m.class_for_sql_type(SqlType::Varchar), DataType::Text);
        assert_eq!(m.sql_type_for_class(&DataType::Integer), SqlType::BigInt);
        assert_eq!(m.sql_type_name(SqlType::BigInt), Some("BIGINT"));
    }

    #[test]
    fn test_misses_fall_back() {
        let m = TypeMappings::base();
        assert_eq!(m.class_for_sql_type(SqlType::Other), DataType::Unknown);
        assert_eq!(m.sql_type_for_class(&DataType::Unknown), SqlType::Other);
        assert_eq!(m.class_for_type_name("hstore"), None);
        assert_eq!(m.class_for_column("hstore", SqlType::Other), DataType::Unknown);
    }

    #[test]
    fn test_overrides_win() {
        let mut m = TypeMappings::base();
        m.override_sql_type_name(SqlType::Double, "FLOAT8");
        m.register_type_name("TEXT", DataType::Text);
        assert_eq!(m.sql_type_name(SqlType::Double), Some("FLOAT8"));
        assert_eq!(m.class_for_column("text", SqlType::Other), DataType::Text);
    }
}

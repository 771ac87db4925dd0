/// Statement builder
///
/// Composes SELECT, INSERT, UPDATE, DELETE, COUNT, aggregate and bounds
/// statements for one table source. Filters handed in here are pre-filters:
/// already split and guarded, so everything in them is expressible.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use tracing::trace;
use crate::core::{AttributeDescriptor, DataType, Feature, FeatureSchema, StoreError, Value};
use crate::dialect::{Dialect, ExecutionMode};
use crate::filter::{Filter, PropertyName};
use crate::primary_key::PrimaryKey;
use super::aggregate::{AggregateKind, AggregateRequest};
use super::join::JoinInfo;
use super::query::{JoinKind, SortBy};
use super::translator::{BoundValue, FilterToSql, FilterTranslation, TableScope};
use super::virtual_table::VirtualTable;

/// Key column created when a new table declares none
pub const DEFAULT_KEY_COLUMN: &str = "fid";

/// A physical table or a virtual table, with its resolved key
#[derive(Debug, Clone)]
pub struct TableSource {
    /// Every non-key attribute of the type
    pub schema: Arc<FeatureSchema>,
    pub key: Arc<PrimaryKey>,
    pub virtual_table: Option<Arc<VirtualTable>>,
}

impl TableSource {
    pub fn new(schema: Arc<FeatureSchema>, key: Arc<PrimaryKey>) -> Self {
        Self {
            schema,
            key,
            virtual_table: None,
        }
    }

    #[must_use]
    pub fn with_virtual_table(mut self, virtual_table: Arc<VirtualTable>) -> Self {
        self.virtual_table = Some(virtual_table);
        self
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.schema.name
    }

    #[must_use]
    pub fn scope(&self) -> TableScope {
        TableScope::new(Arc::clone(&self.schema), Arc::clone(&self.key))
    }
}

/// Finished statement: SQL text plus bindings in placeholder order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub bindings: Vec<BoundValue>,
}

impl SqlStatement {
    /// Statement without bindings
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bindings: Vec::new(),
        }
    }

    fn push(&mut self, fragment: FilterTranslation) {
        self.sql.push_str(&fragment.sql);
        self.bindings.extend(fragment.bindings);
    }

    /// Driver values for the bindings; geometries go through the dialect
    #[must_use]
    pub fn params(&self, dialect: &dyn Dialect) -> Vec<Value> {
        self.bindings
            .iter()
            .map(|b| match &b.value {
                Value::Geometry(g) => dialect.prepare_geometry_value(g),
                other => other.clone(),
            })
            .collect()
    }
}

/// Paging pushed into SQL
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Paging {
    pub offset: u64,
    pub limit: Option<u64>,
}

impl Paging {
    #[must_use]
    pub const fn new(offset: u64, limit: Option<u64>) -> Self {
        Self { offset, limit }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.offset == 0 && self.limit.is_none()
    }
}

/// What a SELECT should return and how
#[derive(Debug, Clone, Copy)]
pub struct SelectRequest<'q> {
    /// Non-key attributes to project, in order
    pub attributes: &'q [AttributeDescriptor],
    pub filter: &'q Filter,
    pub sort: &'q [SortBy],
    pub paging: Paging,
    pub simplify: Option<f64>,
    pub parameters: &'q HashMap<String, String>,
}

/// How one key column gets its value on insert
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    /// Left to the database (auto-increment)
    Omit,
    Value(Value),
    /// SQL expression, e.g. a sequence's next value
    Sql(String),
}

pub struct StatementBuilder<'a> {
    dialect: &'a dyn Dialect,
    database_schema: Option<&'a str>,
}

impl<'a> StatementBuilder<'a> {
    pub fn new(dialect: &'a dyn Dialect, database_schema: Option<&'a str>) -> Self {
        Self {
            dialect,
            database_schema,
        }
    }

    /// Escaped table reference with the schema prefix
    #[must_use]
    pub fn table(&self, table: &str) -> String {
        self.dialect.table_name(self.database_schema, table)
    }

    /// Whether every sort key can be rendered as ORDER BY
    #[must_use]
    pub fn can_push_sort(&self, source: &TableSource, sort: &[SortBy]) -> bool {
        sort.iter().all(|s| match s {
            SortBy::Natural(_) => !source.key.is_null(),
            SortBy::Property { name, .. } => source
                .schema
                .attribute(&name.name)
                .is_none_or(|a| self.dialect.can_sort(a)),
        })
    }

    pub fn select(&self, source: &TableSource, request: &SelectRequest<'_>) -> Result<SqlStatement, StoreError> {
        let translator = FilterToSql::new(self.dialect, source.scope());
        let mut out = SqlStatement::default();
        out.sql.push_str("SELECT ");
        let mut columns: Vec<String> = source.key.column_names().map(|c| self.dialect.escape_name(c)).collect();
        for attr in request.attributes {
            columns.push(self.select_column(None, attr, request.simplify));
        }
        if columns.is_empty() {
            columns.push("1".to_string());
        }
        out.sql.push_str(&columns.join(", "));
        out.sql.push_str(" FROM ");
        let consumed = self.from_source(source, None, request.filter, request.parameters, &translator, &mut out)?;
        if !consumed {
            Self::where_clause(&translator, request.filter, &mut out)?;
        }
        // unknown sort attributes pass through as raw names
        let column = |p: &PropertyName| -> Result<String, StoreError> { Ok(self.dialect.escape_name(&p.name)) };
        self.order_by(source, None, request.sort, &column, &mut out.sql)?;
        self.paging(request.paging, &mut out.sql)?;
        trace!(sql = %out.sql, "built select");
        Ok(out)
    }

    /// SELECT over a planned join; primary columns come first, then each
    /// branch's key and attribute columns in branch order
    pub fn select_join(&self, info: &JoinInfo, request: &SelectRequest<'_>) -> Result<SqlStatement, StoreError> {
        let primary_alias = info.primary_alias.as_str();
        let mut translator = FilterToSql::new(self.dialect, info.primary.scope().with_alias(primary_alias));
        for branch in &info.branches {
            translator = translator.with_join_scope(branch.source.scope().with_alias(branch.alias.clone()));
        }

        let mut taken: Vec<&str> = info.primary.key.column_names().collect();
        taken.extend(info.primary.schema.attributes.iter().map(|a| a.name.as_str()));

        let mut columns: Vec<String> = info
            .primary
            .key
            .column_names()
            .map(|c| format!("{primary_alias}.{}", self.dialect.escape_name(c)))
            .collect();
        for attr in request.attributes {
            columns.push(self.select_column(Some(primary_alias), attr, request.simplify));
        }
        for branch in &info.branches {
            for key in branch.source.key.column_names() {
                let mut column = format!("{}.{}", branch.alias, self.dialect.escape_name(key));
                if taken.contains(&key) {
                    let _ = write!(column, " AS {}", self.dialect.escape_name(&format!("{}_{key}", branch.alias)));
                }
                columns.push(column);
            }
            for attr in &branch.attributes {
                columns.push(self.select_column(Some(&branch.alias), attr, request.simplify));
            }
        }

        let mut out = SqlStatement::default();
        out.sql.push_str("SELECT ");
        out.sql.push_str(&columns.join(", "));
        out.sql.push_str(" FROM ");
        self.from_source(&info.primary, Some(primary_alias), &Filter::Include, request.parameters, &translator, &mut out)?;
        for branch in &info.branches {
            out.sql.push_str(match branch.kind {
                JoinKind::Inner => " INNER JOIN ",
                JoinKind::Outer => " LEFT OUTER JOIN ",
            });
            self.from_source(&branch.source, Some(&branch.alias), &Filter::Include, request.parameters, &translator, &mut out)?;
            out.sql.push_str(" ON ");
            let condition = branch.on.clone().and(branch.pre.clone());
            out.push(translator.translate(&condition)?);
        }
        Self::where_clause(&translator, &info.pre, &mut out)?;
        let column = |p: &PropertyName| -> Result<String, StoreError> {
            match p.prefix {
                None => Ok(format!("{primary_alias}.{}", self.dialect.escape_name(&p.name))),
                Some(_) => translator.column(p),
            }
        };
        self.order_by(&info.primary, Some(primary_alias), request.sort, &column, &mut out.sql)?;
        self.paging(request.paging, &mut out.sql)?;
        trace!(sql = %out.sql, branches = info.branches.len(), "built join select");
        Ok(out)
    }

    pub fn insert(&self, source: &TableSource, feature: &Feature, keys: &[KeyValue]) -> Result<SqlStatement, StoreError> {
        if source.virtual_table.is_some() {
            return Err(StoreError::Unsupported(format!("'{}' is a virtual table and read-only", source.type_name())));
        }
        let mut columns = Vec::new();
        let mut values = SqlStatement::default();
        for (column, key) in source.key.columns.iter().zip(keys) {
            match key {
                KeyValue::Omit => continue,
                KeyValue::Value(v) => {
                    Self::separator(&mut values.sql, columns.len());
                    self.write_value(v, None, &column.data_type, &mut values)?;
                }
                KeyValue::Sql(expr) => {
                    Self::separator(&mut values.sql, columns.len());
                    values.sql.push_str(expr);
                }
            }
            columns.push(self.dialect.escape_name(&column.name));
        }
        for attr in &source.schema.attributes {
            if source.key.contains(&attr.name) {
                continue;
            }
            let value = feature.get(&attr.name).cloned().unwrap_or(Value::Null);
            Self::separator(&mut values.sql, columns.len());
            self.write_value(&value, Some(attr), &attr.data_type, &mut values)?;
            columns.push(self.dialect.escape_name(&attr.name));
        }

        let mut out = SqlStatement::default();
        let _ = write!(
            out.sql,
            "INSERT INTO {} ({}) VALUES ({})",
            self.table(source.type_name()),
            columns.join(", "),
            values.sql
        );
        out.bindings = values.bindings;
        Ok(out)
    }

    /// UPDATE of `attributes` to `values` for rows matching `filter`. Key
    /// columns are never written, and at least one non-key column must be.
    pub fn update(
        &self,
        source: &TableSource,
        attributes: &[AttributeDescriptor],
        values: &[Value],
        filter: &Filter,
    ) -> Result<SqlStatement, StoreError> {
        if attributes.iter().all(|a| source.key.contains(&a.name)) {
            return Err(StoreError::IllegalUpdate(format!(
                "update of '{}' touches no column outside the primary key",
                source.type_name()
            )));
        }
        if attributes.len() != values.len() {
            return Err(StoreError::IllegalUpdate(format!(
                "{} attributes but {} values",
                attributes.len(),
                values.len()
            )));
        }
        if source.virtual_table.is_some() {
            return Err(StoreError::Unsupported(format!("'{}' is a virtual table and read-only", source.type_name())));
        }
        let mut out = SqlStatement::default();
        let _ = write!(out.sql, "UPDATE {} SET ", self.table(source.type_name()));
        let mut written = 0;
        for (attr, value) in attributes.iter().zip(values) {
            if source.key.contains(&attr.name) {
                continue;
            }
            Self::separator(&mut out.sql, written);
            out.sql.push_str(&self.dialect.escape_name(&attr.name));
            out.sql.push_str(" = ");
            self.write_value(value, Some(attr), &attr.data_type, &mut out)?;
            written += 1;
        }
        let translator = FilterToSql::new(self.dialect, source.scope());
        Self::where_clause(&translator, filter, &mut out)?;
        Ok(out)
    }

    pub fn delete(&self, source: &TableSource, filter: &Filter) -> Result<SqlStatement, StoreError> {
        if source.virtual_table.is_some() {
            return Err(StoreError::Unsupported(format!("'{}' is a virtual table and read-only", source.type_name())));
        }
        let mut out = SqlStatement::default();
        let _ = write!(out.sql, "DELETE FROM {}", self.table(source.type_name()));
        let translator = FilterToSql::new(self.dialect, source.scope());
        Self::where_clause(&translator, filter, &mut out)?;
        Ok(out)
    }

    /// Row count; paging wraps the filtered rows in a subquery
    pub fn count(
        &self,
        source: &TableSource,
        filter: &Filter,
        paging: Paging,
        parameters: &HashMap<String, String>,
    ) -> Result<SqlStatement, StoreError> {
        let translator = FilterToSql::new(self.dialect, source.scope());
        let mut out = SqlStatement::default();
        if paging.is_empty() {
            out.sql.push_str("SELECT COUNT(*) FROM ");
            self.filtered_source(source, filter, parameters, &translator, &mut out)?;
        } else {
            out.sql.push_str("SELECT COUNT(*) FROM (SELECT ");
            out.sql.push_str(&self.key_projection(source));
            out.sql.push_str(" FROM ");
            self.filtered_source(source, filter, parameters, &translator, &mut out)?;
            self.natural_order(source, &mut out.sql);
            self.paging(paging, &mut out.sql)?;
            out.sql.push_str(") gt");
        }
        Ok(out)
    }

    /// Aggregate pushdown. `None` means the dialect cannot compute it and the
    /// caller must accumulate over a scan.
    pub fn aggregate(
        &self,
        source: &TableSource,
        request: &AggregateRequest,
        filter: &Filter,
        paging: Paging,
        parameters: &HashMap<String, String>,
    ) -> Result<Option<SqlStatement>, StoreError> {
        let Some(function) = self.dialect.aggregate_function_name(request.kind) else {
            return Ok(None);
        };
        if !paging.is_empty() && !self.dialect.supports_limit_offset() {
            return Ok(None);
        }
        let translator = FilterToSql::new(self.dialect, source.scope());
        let target = match request.expression() {
            Some(expr) => match translator.translate_expression(expr) {
                Ok(t) if t.bindings.is_empty() => Some(t.sql),
                _ => return Ok(None),
            },
            None => None,
        };
        let mut groups = Vec::with_capacity(request.group_by.len());
        for expr in &request.group_by {
            match translator.translate_expression(expr) {
                Ok(t) if t.bindings.is_empty() => groups.push(t.sql),
                _ => return Ok(None),
            }
        }

        let mut out = SqlStatement::default();
        if paging.is_empty() && !request.has_complex_grouping() {
            let value = target.unwrap_or_else(|| "*".to_string());
            out.sql.push_str("SELECT ");
            if request.kind == AggregateKind::Unique {
                let _ = write!(out.sql, "DISTINCT {value}");
            } else {
                for g in &groups {
                    let _ = write!(out.sql, "{g}, ");
                }
                let _ = write!(out.sql, "{function}({value})");
            }
            out.sql.push_str(" FROM ");
            self.filtered_source(source, filter, parameters, &translator, &mut out)?;
            if request.kind != AggregateKind::Unique && !groups.is_empty() {
                let _ = write!(out.sql, " GROUP BY {}", groups.join(", "));
            }
            return Ok(Some(out));
        }

        // Inner query materializes the rowset under fixed aliases, the outer
        // one aggregates over it
        let aliases: Vec<String> = (0..groups.len()).map(|i| format!("gb{i}")).collect();
        out.sql.push_str("SELECT ");
        if request.kind == AggregateKind::Unique {
            out.sql.push_str("DISTINCT gt_value");
        } else {
            for alias in &aliases {
                let _ = write!(out.sql, "{alias}, ");
            }
            let value = if target.is_some() { "gt_value" } else { "*" };
            let _ = write!(out.sql, "{function}({value})");
        }
        out.sql.push_str(" FROM (SELECT ");
        let mut inner = vec![format!("{} AS gt_value", target.as_deref().unwrap_or("1"))];
        inner.extend(groups.iter().zip(&aliases).map(|(g, a)| format!("{g} AS {a}")));
        out.sql.push_str(&inner.join(", "));
        out.sql.push_str(" FROM ");
        self.filtered_source(source, filter, parameters, &translator, &mut out)?;
        self.natural_order(source, &mut out.sql);
        self.paging(paging, &mut out.sql)?;
        out.sql.push_str(") gt");
        if request.kind != AggregateKind::Unique && !aliases.is_empty() {
            let _ = write!(out.sql, " GROUP BY {}", aliases.join(", "));
        }
        Ok(Some(out))
    }

    /// One envelope column per geometry attribute
    pub fn bounds(
        &self,
        source: &TableSource,
        geometries: &[&AttributeDescriptor],
        filter: &Filter,
        paging: Paging,
        parameters: &HashMap<String, String>,
    ) -> Result<SqlStatement, StoreError> {
        let translator = FilterToSql::new(self.dialect, source.scope());
        let envelopes: Vec<String> = geometries
            .iter()
            .map(|g| self.dialect.encode_geometry_envelope(&self.dialect.escape_name(&g.name)))
            .collect();
        let mut out = SqlStatement::default();
        out.sql.push_str("SELECT ");
        out.sql.push_str(&envelopes.join(", "));
        out.sql.push_str(" FROM ");
        if paging.is_empty() {
            self.filtered_source(source, filter, parameters, &translator, &mut out)?;
        } else {
            let columns: Vec<String> = geometries.iter().map(|g| self.dialect.escape_name(&g.name)).collect();
            let _ = write!(out.sql, "(SELECT {} FROM ", columns.join(", "));
            self.filtered_source(source, filter, parameters, &translator, &mut out)?;
            self.natural_order(source, &mut out.sql);
            self.paging(paging, &mut out.sql)?;
            out.sql.push_str(") gt");
        }
        Ok(out)
    }

    /// `SELECT MAX(col)` used to derive the next non-incrementing key value
    #[must_use]
    pub fn max_key(&self, table: &str, column: &str) -> String {
        format!("SELECT MAX({}) FROM {}", self.dialect.escape_name(column), self.table(table))
    }

    /// CREATE TABLE plus the dialect's follow-up statements. Without a
    /// declared key, an auto-generated `fid` column is added.
    #[must_use]
    pub fn create_table(&self, schema: &FeatureSchema, key: Option<&PrimaryKey>) -> Vec<String> {
        let mut columns = Vec::new();
        let declared = key.filter(|k| !k.is_null());
        match declared {
            Some(key) => {
                for column in &key.columns {
                    columns.push(format!(
                        "{} {} NOT NULL",
                        self.dialect.escape_name(&column.name),
                        self.dialect.sql_type_name(&column.data_type)
                    ));
                }
            }
            None => columns.push(self.dialect.generated_key_column(DEFAULT_KEY_COLUMN)),
        }
        for attr in &schema.attributes {
            if declared.is_some_and(|k| k.contains(&attr.name)) {
                continue;
            }
            let type_name = if attr.is_geometry() {
                self.dialect.geometry_type_name(attr)
            } else {
                self.dialect.sql_type_name(&attr.data_type)
            };
            let mut column = format!("{} {type_name}", self.dialect.escape_name(&attr.name));
            if !attr.nullable {
                column.push_str(" NOT NULL");
            }
            columns.push(column);
        }
        if let Some(key) = declared {
            let names: Vec<String> = key.column_names().map(|c| self.dialect.escape_name(c)).collect();
            columns.push(format!("PRIMARY KEY ({})", names.join(", ")));
        }
        let mut statements = vec![format!("CREATE TABLE {} ({})", self.table(&schema.name), columns.join(", "))];
        statements.extend(self.dialect.post_create_table(self.database_schema, schema));
        statements
    }

    #[must_use]
    pub fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE {}", self.table(table))
    }

    fn select_column(&self, alias: Option<&str>, attr: &AttributeDescriptor, simplify: Option<f64>) -> String {
        let escaped = self.dialect.escape_name(&attr.name);
        let column = match alias {
            Some(a) => format!("{a}.{escaped}"),
            None => escaped,
        };
        if attr.is_geometry() {
            let encoded = self.dialect.encode_geometry_column(&column, attr, simplify);
            format!("{encoded} AS {}", self.dialect.escape_name(attr.output_name()))
        } else if let Some(output) = &attr.column_alias {
            format!("{column} AS {}", self.dialect.escape_name(output))
        } else {
            column
        }
    }

    /// Appends the FROM target. Returns true when a virtual table's where
    /// placeholder consumed the filter.
    fn from_source(
        &self,
        source: &TableSource,
        alias: Option<&str>,
        filter: &Filter,
        parameters: &HashMap<String, String>,
        translator: &FilterToSql<'_>,
        out: &mut SqlStatement,
    ) -> Result<bool, StoreError> {
        let Some(vt) = &source.virtual_table else {
            out.sql.push_str(&self.table(source.type_name()));
            if let Some(alias) = alias {
                out.sql.push(' ');
                out.sql.push_str(alias);
            }
            return Ok(false);
        };
        let consumed = vt.has_where_placeholder();
        let fragment = if consumed && !filter.is_include() {
            Some(translator.translate(filter)?)
        } else {
            None
        };
        let sql = vt.expand(parameters, fragment.as_ref().map(|f| f.sql.as_str()))?;
        let alias = alias.map_or_else(|| self.dialect.escape_name(&vt.name), str::to_string);
        let _ = write!(out.sql, "({sql}) {alias}");
        if let Some(fragment) = fragment {
            out.bindings.extend(fragment.bindings);
        }
        Ok(consumed)
    }

    fn filtered_source(
        &self,
        source: &TableSource,
        filter: &Filter,
        parameters: &HashMap<String, String>,
        translator: &FilterToSql<'_>,
        out: &mut SqlStatement,
    ) -> Result<(), StoreError> {
        if !self.from_source(source, None, filter, parameters, translator, out)? {
            Self::where_clause(translator, filter, out)?;
        }
        Ok(())
    }

    fn where_clause(translator: &FilterToSql<'_>, filter: &Filter, out: &mut SqlStatement) -> Result<(), StoreError> {
        if filter.is_include() {
            return Ok(());
        }
        out.sql.push_str(" WHERE ");
        out.push(translator.translate(filter)?);
        Ok(())
    }

    fn order_by(
        &self,
        source: &TableSource,
        alias: Option<&str>,
        sort: &[SortBy],
        column: &dyn Fn(&PropertyName) -> Result<String, StoreError>,
        sql: &mut String,
    ) -> Result<(), StoreError> {
        if sort.is_empty() {
            return Ok(());
        }
        let mut keys = Vec::new();
        for s in sort {
            match s {
                SortBy::Natural(order) => {
                    if source.key.is_null() {
                        return Err(StoreError::Unsupported(format!(
                            "natural order on '{}' needs a primary key",
                            source.type_name()
                        )));
                    }
                    for c in source.key.column_names() {
                        let escaped = self.dialect.escape_name(c);
                        match alias {
                            Some(a) => keys.push(format!("{a}.{escaped} {}", order.sql())),
                            None => keys.push(format!("{escaped} {}", order.sql())),
                        }
                    }
                }
                SortBy::Property { name, order } => keys.push(format!("{} {}", column(name)?, order.sql())),
            }
        }
        let _ = write!(sql, " ORDER BY {}", keys.join(", "));
        Ok(())
    }

    fn natural_order(&self, source: &TableSource, sql: &mut String) {
        if source.key.is_null() {
            return;
        }
        let columns: Vec<String> = source.key.column_names().map(|c| self.dialect.escape_name(c)).collect();
        let _ = write!(sql, " ORDER BY {}", columns.join(", "));
    }

    fn paging(&self, paging: Paging, sql: &mut String) -> Result<(), StoreError> {
        if paging.is_empty() {
            return Ok(());
        }
        if !self.dialect.supports_limit_offset() {
            return Err(StoreError::Unsupported(format!(
                "the {} dialect has no native paging",
                self.dialect.name()
            )));
        }
        self.dialect.apply_limit_offset(sql, paging.limit, paging.offset);
        Ok(())
    }

    fn key_projection(&self, source: &TableSource) -> String {
        if source.key.is_null() {
            "1".to_string()
        } else {
            source
                .key
                .column_names()
                .map(|c| self.dialect.escape_name(c))
                .collect::<Vec<_>>()
                .join(", ")
        }
    }

    fn separator(sql: &mut String, written: usize) {
        if written > 0 {
            sql.push_str(", ");
        }
    }

    /// Value for INSERT/UPDATE, coerced to the column type. Geometry SRID
    /// comes from native metadata, then the value itself, then the
    /// attribute's declared reference system.
    fn write_value(
        &self,
        value: &Value,
        attr: Option<&AttributeDescriptor>,
        data_type: &DataType,
        out: &mut SqlStatement,
    ) -> Result<(), StoreError> {
        let value = match (value, attr.and_then(|a| a.enum_mapping.as_ref())) {
            (Value::Text(label), Some(mapping)) => mapping.code(label).map_or_else(|| value.clone(), Value::Integer),
            _ => value.clone(),
        };
        let value = if value.is_null() || value.conforms_to(data_type) || *data_type == DataType::Unknown {
            value
        } else {
            value.coerce_to(data_type)?
        };
        let mode = self.dialect.execution_mode();
        if let Value::Geometry(g) = &value {
            let srid = attr.and_then(|a| a.native_srid).or(g.srid).or_else(|| attr.and_then(|a| a.srid));
            let dimension = attr.and_then(|a| a.coordinate_dimension).unwrap_or_else(|| g.dimension());
            match mode {
                ExecutionMode::Prepared => {
                    out.sql.push_str(&self.dialect.encode_geometry_placeholder(srid, dimension));
                    out.bindings.push(BoundValue {
                        value: value.clone(),
                        data_type: data_type.clone(),
                        srid,
                        dimension,
                        attribute: attr.map(|a| a.name.clone()),
                    });
                }
                ExecutionMode::Textual => out.sql.push_str(&self.dialect.encode_geometry_literal(g, srid, dimension)),
            }
            return Ok(());
        }
        match mode {
            ExecutionMode::Prepared => {
                out.sql.push('?');
                let mut bound = BoundValue::new(value, data_type.clone());
                bound.attribute = attr.map(|a| a.name.clone());
                out.bindings.push(bound);
            }
            ExecutionMode::Textual => self.dialect.encode_value_literal(&value, &mut out.sql),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Geometry, GeometryKind};
    use crate::dialect::{GenericDialect, MySqlDialect, PostgisDialect};
    use crate::filter::{CompareOp, Expression};
    use crate::primary_key::{GenerationKind, PrimaryKeyColumn};
    use crate::sql::query::{Join, Query, SortOrder};
    use crate::sql::JoinPlanner;

    fn roads() -> TableSource {
        let schema = FeatureSchema::new(
            "roads",
            vec![
                AttributeDescriptor::new("name", DataType::Text),
                AttributeDescriptor::new("lanes", DataType::Integer),
                AttributeDescriptor::geometry("geom", GeometryKind::LineString, Some(4326)),
            ],
        );
        let key = PrimaryKey::new(
            "roads",
            vec![PrimaryKeyColumn::new("fid", DataType::Integer, GenerationKind::AutoGenerated)],
        );
        TableSource::new(Arc::new(schema), Arc::new(key))
    }

    fn request<'q>(source: &'q TableSource, filter: &'q Filter, sort: &'q [SortBy], params: &'q HashMap<String, String>) -> SelectRequest<'q> {
        SelectRequest {
            attributes: &source.schema.attributes,
            filter,
            sort,
            paging: Paging::default(),
            simplify: None,
            parameters: params,
        }
    }

    #[test]
    fn test_select_projects_key_first() {
        let d = PostgisDialect::new();
        let source = roads();
        let params = HashMap::new();
        let filter = Filter::equals("name", Value::Text("Main".to_string()));
        let sort = [SortBy::Natural(SortOrder::Descending)];
        let mut req = request(&source, &filter, &sort, &params);
        req.paging = Paging::new(20, Some(10));
        let stmt = StatementBuilder::new(&d, Some("gis")).select(&source, &req).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"fid\", \"name\", \"lanes\", ST_AsText(\"geom\") AS \"geom\" FROM \"gis\".\"roads\" \
             WHERE \"name\" = ? ORDER BY \"fid\" DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(stmt.bindings.len(), 1);
    }

    #[test]
    fn test_natural_order_requires_key() {
        let d = PostgisDialect::new();
        let mut source = roads();
        source.key = Arc::new(PrimaryKey::null("roads"));
        let params = HashMap::new();
        let sort = [SortBy::Natural(SortOrder::Ascending)];
        let req = request(&source, &Filter::Include, &sort, &params);
        assert!(StatementBuilder::new(&d, None).select(&source, &req).is_err());
    }

    #[test]
    fn test_tolerant_sort_and_unsupported_paging() {
        let d = GenericDialect::new();
        let source = roads();
        let params = HashMap::new();
        let sort = [SortBy::asc("speed")];
        let mut req = request(&source, &Filter::Include, &sort, &params);
        let stmt = StatementBuilder::new(&d, None).select(&source, &req).unwrap();
        assert!(stmt.sql.ends_with("ORDER BY \"speed\" ASC"));
        req.paging = Paging::new(2, Some(3));
        assert!(matches!(
            StatementBuilder::new(&d, None).select(&source, &req),
            Err(StoreError::Unsupported(_))
        ));
    }

    #[test]
    fn test_update_rejects_key_only() {
        let d = PostgisDialect::new();
        let source = roads();
        let fid = AttributeDescriptor::new("fid", DataType::Integer);
        let result = StatementBuilder::new(&d, None).update(&source, &[fid], &[Value::Integer(3)], &Filter::Include);
        assert!(matches!(result, Err(StoreError::IllegalUpdate(_))));
    }

    #[test]
    fn test_update_skips_key_columns() {
        let d = GenericDialect::new();
        let source = roads();
        let attrs = [
            AttributeDescriptor::new("fid", DataType::Integer),
            AttributeDescriptor::new("lanes", DataType::Integer),
        ];
        let stmt = StatementBuilder::new(&d, None)
            .update(&source, &attrs, &[Value::Integer(9), Value::Integer(4)], &Filter::ids(["roads.7"]))
            .unwrap();
        assert_eq!(stmt.sql, "UPDATE \"roads\" SET \"lanes\" = 4 WHERE ((\"fid\" = 7))");
    }

    #[test]
    fn test_insert_geometry_srid_priority() {
        let d = PostgisDialect::new();
        let mut source = roads();
        let mut schema = (*source.schema).clone();
        schema.attributes[2] = schema.attributes[2].clone().with_native_srid(3857);
        source.schema = Arc::new(schema);
        let mut feature = Feature::empty(Arc::clone(&source.schema));
        feature.set("name", Value::Text("A".to_string())).unwrap();
        feature
            .set("geom", Value::Geometry(Geometry::point(1.0, 2.0).with_srid(4326)))
            .unwrap();
        let stmt = StatementBuilder::new(&d, None).insert(&source, &feature, &[KeyValue::Omit]).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"roads\" (\"name\", \"lanes\", \"geom\") VALUES (?, ?, ST_GeomFromText(?, 3857))"
        );
        assert_eq!(stmt.bindings[2].srid, Some(3857));
        assert_eq!(stmt.params(&d)[2], Value::Text("POINT (1 2)".to_string()));
    }

    #[test]
    fn test_insert_with_sequence_key() {
        let d = MySqlDialect::new();
        let source = roads();
        let feature = Feature::empty(Arc::clone(&source.schema));
        let stmt = StatementBuilder::new(&d, None)
            .insert(&source, &feature, &[KeyValue::Value(Value::Integer(11))])
            .unwrap();
        assert!(stmt.sql.starts_with("INSERT INTO `roads` (`fid`, `name`, `lanes`, `geom`) VALUES (11, NULL, NULL, NULL)"));
    }

    #[test]
    fn test_count_with_paging_uses_subquery() {
        let d = PostgisDialect::new();
        let source = roads();
        let stmt = StatementBuilder::new(&d, None)
            .count(&source, &Filter::Include, Paging::new(0, Some(5)), &HashMap::new())
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(*) FROM (SELECT \"fid\" FROM \"roads\" ORDER BY \"fid\" LIMIT 5) gt"
        );
    }

    #[test]
    fn test_aggregate_forms() {
        let d = PostgisDialect::new();
        let source = roads();
        let b = StatementBuilder::new(&d, None);
        let params = HashMap::new();
        let sum = AggregateRequest::of(AggregateKind::Sum, "lanes").group_by(Expression::property("name"));
        let stmt = b.aggregate(&source, &sum, &Filter::Include, Paging::default(), &params).unwrap().unwrap();
        assert_eq!(stmt.sql, "SELECT \"name\", sum(\"lanes\") FROM \"roads\" GROUP BY \"name\"");

        let stmt = b
            .aggregate(&source, &sum, &Filter::Include, Paging::new(0, Some(3)), &params)
            .unwrap()
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT gb0, sum(gt_value) FROM (SELECT \"lanes\" AS gt_value, \"name\" AS gb0 FROM \"roads\" \
             ORDER BY \"fid\" LIMIT 3) gt GROUP BY gb0"
        );

        let unique = AggregateRequest::of(AggregateKind::Unique, "name");
        let stmt = b.aggregate(&source, &unique, &Filter::Include, Paging::default(), &params).unwrap().unwrap();
        assert_eq!(stmt.sql, "SELECT DISTINCT \"name\" FROM \"roads\"");
    }

    #[test]
    fn test_aggregate_without_function_falls_back() {
        let d = GenericDialect::new();
        let source = roads();
        let std = AggregateRequest::of(AggregateKind::StandardDeviation, "lanes");
        let stmt = StatementBuilder::new(&d, None)
            .aggregate(&source, &std, &Filter::Include, Paging::default(), &HashMap::new())
            .unwrap();
        assert!(stmt.is_none());
    }

    #[test]
    fn test_virtual_table_where_placeholder() {
        let d = PostgisDialect::new();
        let vt = VirtualTable::new("busy", "SELECT * FROM roads WHERE :where_clause: AND lanes > 2");
        let source = roads().with_virtual_table(Arc::new(vt));
        let params = HashMap::new();
        let filter = Filter::compare(CompareOp::Lt, "lanes", Value::Integer(6));
        let req = request(&source, &filter, &[], &params);
        let stmt = StatementBuilder::new(&d, None).select(&source, &req).unwrap();
        assert!(stmt.sql.ends_with(
            "FROM (SELECT * FROM roads WHERE (\"lanes\" < ?) AND lanes > 2) \"busy\""
        ));
        assert_eq!(stmt.bindings.len(), 1);
    }

    #[test]
    fn test_join_select_aliases_collisions() {
        let d = PostgisDialect::new();
        let primary = roads();
        let cities = TableSource::new(
            Arc::new(FeatureSchema::new(
                "cities",
                vec![
                    AttributeDescriptor::new("code", DataType::Text),
                    AttributeDescriptor::new("name", DataType::Text),
                ],
            )),
            Arc::new(PrimaryKey::new(
                "cities",
                vec![PrimaryKeyColumn::new("id", DataType::Integer, GenerationKind::AutoGenerated)],
            )),
        );
        let on = Filter::Compare {
            op: CompareOp::Eq,
            left: Expression::property("lanes"),
            right: Expression::property("cities.id"),
            match_case: true,
        };
        let query = Query::new("roads").join(Join::outer("cities", on));
        let info = JoinPlanner::new(&d, true).plan(&query, &primary, &[cities]).unwrap();
        let attrs = [primary.schema.attributes[0].clone()];
        let params = HashMap::new();
        let req = SelectRequest {
            attributes: &attrs,
            filter: &Filter::Include,
            sort: &[],
            paging: Paging::default(),
            simplify: None,
            parameters: &params,
        };
        let stmt = StatementBuilder::new(&d, None).select_join(&info, &req).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT a.\"fid\", a.\"name\", b.\"id\", b.\"code\", b.\"name\" AS \"b_name\" \
             FROM \"roads\" a LEFT OUTER JOIN \"cities\" b ON a.\"lanes\" = b.\"id\""
        );
    }

    #[test]
    fn test_create_table_adds_generated_key() {
        let d = GenericDialect::new();
        let schema = FeatureSchema::new(
            "poi",
            vec![AttributeDescriptor::new("label", DataType::Text).not_null()],
        );
        let statements = StatementBuilder::new(&d, None).create_table(&schema, None);
        assert_eq!(
            statements[0],
            "CREATE TABLE \"poi\" (\"fid\" INTEGER PRIMARY KEY, \"label\" VARCHAR NOT NULL)"
        );
        assert_eq!(StatementBuilder::new(&d, None).drop_table("poi"), "DROP TABLE \"poi\"");
    }
}

/// Filter to SQL translation
///
/// Walks a filter or expression tree and renders it for one dialect. In
/// prepared mode every literal becomes a placeholder and is appended to the
/// binding list in SQL text order; in textual mode literals are rendered
/// inline. Capability checks happen before this point: anything reaching the
/// translator is expected to be expressible, and an unencodable literal is a
/// translation error.

use std::sync::Arc;
use tracing::debug;
use crate::core::{AttributeDescriptor, DataType, FeatureSchema, Geometry, StoreError, Value};
use crate::dialect::{Dialect, ExecutionMode};
use crate::filter::{Expression, Filter, PropertyName, SpatialOp};
use crate::primary_key::{decode_fid, PrimaryKey};

/// A placeholder's value plus what the binder needs to know about it
#[derive(Debug, Clone, PartialEq)]
pub struct BoundValue {
    pub value: Value,
    pub data_type: DataType,
    /// Geometry SRID; `None` when unknown or not a geometry
    pub srid: Option<i32>,
    pub dimension: u8,
    /// Attribute the value is compared against or written to
    pub attribute: Option<String>,
}

impl BoundValue {
    pub fn new(value: Value, data_type: DataType) -> Self {
        Self {
            value,
            data_type,
            srid: None,
            dimension: 2,
            attribute: None,
        }
    }
}

/// Rendered SQL fragment and its bindings, in placeholder order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterTranslation {
    pub sql: String,
    pub bindings: Vec<BoundValue>,
}

impl FilterTranslation {
    /// Appends another fragment, keeping bindings in text order
    pub fn append(&mut self, other: Self) {
        self.sql.push_str(&other.sql);
        self.bindings.extend(other.bindings);
    }
}

/// One feature type visible to the translator
#[derive(Debug, Clone)]
pub struct TableScope {
    pub type_name: String,
    /// SQL alias used to qualify columns
    pub alias: Option<String>,
    pub schema: Arc<FeatureSchema>,
    pub key: Arc<PrimaryKey>,
}

impl TableScope {
    pub fn new(schema: Arc<FeatureSchema>, key: Arc<PrimaryKey>) -> Self {
        Self {
            type_name: schema.name.clone(),
            alias: None,
            schema,
            key,
        }
    }

    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    fn matches(&self, prefix: &str) -> bool {
        self.type_name == prefix || self.alias.as_deref() == Some(prefix)
    }

    fn data_type_of(&self, name: &str) -> Option<DataType> {
        self.schema
            .attribute(name)
            .map(|a| a.data_type.clone())
            .or_else(|| self.key.column(name).map(|c| c.data_type.clone()))
    }
}

/// Property resolved against a scope
struct Resolved<'s> {
    column: String,
    data_type: DataType,
    attribute: Option<&'s AttributeDescriptor>,
}

pub struct FilterToSql<'a> {
    dialect: &'a dyn Dialect,
    mode: ExecutionMode,
    primary: TableScope,
    joined: Vec<TableScope>,
    /// Unresolvable property names are errors instead of raw columns
    strict: bool,
}

impl<'a> FilterToSql<'a> {
    pub fn new(dialect: &'a dyn Dialect, primary: TableScope) -> Self {
        Self {
            dialect,
            mode: dialect.execution_mode(),
            primary,
            joined: Vec::new(),
            strict: false,
        }
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Makes a joined type addressable by its type name or alias. Joins are
    /// always strict.
    #[must_use]
    pub fn with_join_scope(mut self, scope: TableScope) -> Self {
        self.joined.push(scope);
        self.strict = true;
        self
    }

    #[must_use]
    pub const fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn translate(&self, filter: &Filter) -> Result<FilterTranslation, StoreError> {
        let mut out = FilterTranslation::default();
        let filter = map_enum_literals(filter, &self.primary.schema);
        self.filter(&filter, &mut out)?;
        debug!(sql = %out.sql, bindings = out.bindings.len(), "translated filter");
        Ok(out)
    }

    pub fn translate_expression(&self, expr: &Expression) -> Result<FilterTranslation, StoreError> {
        let mut out = FilterTranslation::default();
        self.expression(expr, None, &mut out)?;
        Ok(out)
    }

    /// Qualified, escaped column for a property name
    pub fn column(&self, property: &PropertyName) -> Result<String, StoreError> {
        Ok(self.resolve(property)?.column)
    }

    fn scope_for(&self, property: &PropertyName) -> Result<&TableScope, StoreError> {
        let Some(prefix) = property.prefix.as_deref() else {
            return Ok(&self.primary);
        };
        if self.primary.matches(prefix) {
            return Ok(&self.primary);
        }
        if let Some(scope) = self.joined.iter().find(|s| s.matches(prefix)) {
            return Ok(scope);
        }
        if self.strict {
            return Err(StoreError::UnresolvedProperty(property.to_string()));
        }
        Ok(&self.primary)
    }

    fn resolve(&self, property: &PropertyName) -> Result<Resolved<'_>, StoreError> {
        let scope = self.scope_for(property)?;
        let data_type = match scope.data_type_of(&property.name) {
            Some(t) => t,
            None if self.strict => return Err(StoreError::UnresolvedProperty(property.to_string())),
            None => DataType::Unknown,
        };
        let escaped = self.dialect.escape_name(&property.name);
        let column = match &scope.alias {
            Some(alias) => format!("{alias}.{escaped}"),
            None => escaped,
        };
        Ok(Resolved {
            column,
            data_type,
            attribute: scope.schema.attribute(&property.name),
        })
    }

    fn filter(&self, filter: &Filter, out: &mut FilterTranslation) -> Result<(), StoreError> {
        match filter {
            Filter::Include => out.sql.push_str("1 = 1"),
            Filter::Exclude => out.sql.push_str("1 = 0"),
            Filter::And(children) => self.junction(children, " AND ", "1 = 1", out)?,
            Filter::Or(children) => self.junction(children, " OR ", "1 = 0", out)?,
            Filter::Not(inner) => {
                out.sql.push_str("NOT (");
                self.filter(inner, out)?;
                out.sql.push(')');
            }
            Filter::Compare { op, left, right, match_case } => {
                let context = self.context_of(left).or(self.context_of(right));
                let fold = !match_case && self.is_textual(left, right, context.as_ref());
                self.operand(left, context.as_ref(), fold, out)?;
                out.sql.push(' ');
                out.sql.push_str(op.sql());
                out.sql.push(' ');
                self.operand(right, context.as_ref(), fold, out)?;
            }
            Filter::Between { expr, lower, upper } => {
                let context = self.context_of(expr);
                self.expression(expr, context.as_ref(), out)?;
                out.sql.push_str(" BETWEEN ");
                self.expression(lower, context.as_ref(), out)?;
                out.sql.push_str(" AND ");
                self.expression(upper, context.as_ref(), out)?;
            }
            Filter::Like { expr, pattern, match_case } => {
                let text = Context::text();
                self.operand(expr, Some(&text), !match_case, out)?;
                out.sql.push_str(" LIKE ");
                let pattern = Expression::Literal(Value::Text(pattern.clone()));
                self.operand(&pattern, Some(&text), !match_case, out)?;
                if matches!(&pattern, Expression::Literal(Value::Text(p)) if p.contains('\\')) {
                    out.sql.push_str(" ESCAPE ");
                    self.dialect.encode_value_literal(&Value::Text("\\".to_string()), &mut out.sql);
                }
            }
            Filter::IsNull(expr) => {
                self.expression(expr, None, out)?;
                out.sql.push_str(" IS NULL");
            }
            Filter::In { expr, values } => {
                if values.is_empty() {
                    out.sql.push_str("1 = 0");
                    return Ok(());
                }
                let context = self.context_of(expr);
                self.expression(expr, context.as_ref(), out)?;
                out.sql.push_str(" IN (");
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        out.sql.push_str(", ");
                    }
                    self.expression(v, context.as_ref(), out)?;
                }
                out.sql.push(')');
            }
            Filter::Id(ids) => self.ids(ids, out)?,
            Filter::Spatial { op, property, geometry, distance } => {
                self.spatial(*op, property, geometry, *distance, out)?;
            }
        }
        Ok(())
    }

    fn junction(
        &self,
        children: &[Filter],
        separator: &str,
        empty: &str,
        out: &mut FilterTranslation,
    ) -> Result<(), StoreError> {
        if children.is_empty() {
            out.sql.push_str(empty);
            return Ok(());
        }
        out.sql.push('(');
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                out.sql.push_str(separator);
            }
            self.filter(child, out)?;
        }
        out.sql.push(')');
        Ok(())
    }

    /// Key-column equalities per id, OR-ed together
    fn ids(&self, ids: &[String], out: &mut FilterTranslation) -> Result<(), StoreError> {
        let key = Arc::clone(&self.primary.key);
        if key.is_null() {
            return Err(StoreError::Translation(format!(
                "feature ids cannot be matched on '{}', it has no primary key",
                self.primary.type_name
            )));
        }
        let mut groups = Vec::new();
        for id in ids {
            match decode_fid(&self.primary.type_name, &key, id, false) {
                Ok(values) => groups.push(values),
                Err(e) => debug!(id, error = %e, "skipping undecodable feature id"),
            }
        }
        if groups.is_empty() {
            out.sql.push_str("1 = 0");
            return Ok(());
        }
        out.sql.push('(');
        for (g, values) in groups.into_iter().enumerate() {
            if g > 0 {
                out.sql.push_str(" OR ");
            }
            out.sql.push('(');
            for (i, (column, value)) in key.columns.iter().zip(values).enumerate() {
                if i > 0 {
                    out.sql.push_str(" AND ");
                }
                let property = PropertyName {
                    name: column.name.clone(),
                    prefix: self.primary.alias.clone(),
                };
                out.sql.push_str(&self.resolve(&property)?.column);
                out.sql.push_str(" = ");
                let context = Context {
                    data_type: column.data_type.clone(),
                    attribute: Some(column.name.clone()),
                    srid: None,
                    dimension: None,
                };
                self.literal(&value, Some(&context), out)?;
            }
            out.sql.push(')');
        }
        out.sql.push(')');
        Ok(())
    }

    fn spatial(
        &self,
        op: SpatialOp,
        property: &Expression,
        geometry: &Expression,
        distance: Option<f64>,
        out: &mut FilterTranslation,
    ) -> Result<(), StoreError> {
        let Expression::Property(name) = property else {
            return Err(StoreError::Translation("spatial filters need a geometry property".to_string()));
        };
        let resolved = self.resolve(name)?;
        let context = Context::from_resolved(&resolved);
        let mut geom_sql = FilterTranslation::default();
        self.expression(geometry, Some(&context), &mut geom_sql)?;
        let sql = self
            .dialect
            .encode_spatial(op, &resolved.column, &geom_sql.sql, distance)
            .ok_or_else(|| {
                StoreError::Translation(format!("{op:?} is not supported by the {} dialect", self.dialect.name()))
            })?;
        out.sql.push_str(&sql);
        out.bindings.extend(geom_sql.bindings);
        Ok(())
    }

    fn operand(
        &self,
        expr: &Expression,
        context: Option<&Context>,
        fold_case: bool,
        out: &mut FilterTranslation,
    ) -> Result<(), StoreError> {
        if fold_case {
            out.sql.push_str("UPPER(");
            self.expression(expr, context, out)?;
            out.sql.push(')');
            Ok(())
        } else {
            self.expression(expr, context, out)
        }
    }

    fn expression(&self, expr: &Expression, context: Option<&Context>, out: &mut FilterTranslation) -> Result<(), StoreError> {
        match expr {
            Expression::Property(p) => out.sql.push_str(&self.resolve(p)?.column),
            Expression::Literal(v) => self.literal(v, context, out)?,
            Expression::Function { name, args } => {
                let function = self.dialect.function_name(name).ok_or_else(|| {
                    StoreError::Translation(format!("function '{name}' has no SQL equivalent"))
                })?;
                out.sql.push_str(function);
                out.sql.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.sql.push_str(", ");
                    }
                    self.expression(arg, None, out)?;
                }
                out.sql.push(')');
            }
            Expression::Arithmetic { op, left, right } => {
                out.sql.push('(');
                self.expression(left, None, out)?;
                out.sql.push(' ');
                out.sql.push_str(op.symbol());
                out.sql.push(' ');
                self.expression(right, None, out)?;
                out.sql.push(')');
            }
        }
        Ok(())
    }

    fn literal(&self, value: &Value, context: Option<&Context>, out: &mut FilterTranslation) -> Result<(), StoreError> {
        let value = match context {
            Some(ctx) => ctx.convert(value)?,
            None => value.clone(),
        };
        let data_type = context
            .map(|c| c.data_type.clone())
            .filter(|t| *t != DataType::Unknown)
            .or_else(|| value.data_type())
            .unwrap_or(DataType::Unknown);
        match (&value, self.mode) {
            (Value::Geometry(g), mode) => {
                let srid = context.and_then(|c| c.srid).or(g.srid);
                let dimension = context.and_then(|c| c.dimension).unwrap_or_else(|| g.dimension());
                match mode {
                    ExecutionMode::Prepared => {
                        out.sql.push_str(&self.dialect.encode_geometry_placeholder(srid, dimension));
                        out.bindings.push(BoundValue {
                            value: value.clone(),
                            data_type,
                            srid,
                            dimension,
                            attribute: context.and_then(|c| c.attribute.clone()),
                        });
                    }
                    ExecutionMode::Textual => {
                        out.sql.push_str(&self.dialect.encode_geometry_literal(g, srid, dimension));
                    }
                }
            }
            (_, ExecutionMode::Prepared) => {
                out.sql.push('?');
                let mut bound = BoundValue::new(value, data_type);
                bound.attribute = context.and_then(|c| c.attribute.clone());
                out.bindings.push(bound);
            }
            (_, ExecutionMode::Textual) => self.dialect.encode_value_literal(&value, &mut out.sql),
        }
        Ok(())
    }

    fn context_of(&self, expr: &Expression) -> Option<Context> {
        let Expression::Property(p) = expr else {
            return None;
        };
        self.resolve(p).ok().map(|r| Context::from_resolved(&r))
    }

    fn is_textual(&self, left: &Expression, right: &Expression, context: Option<&Context>) -> bool {
        let text_literal = |e: &Expression| matches!(e, Expression::Literal(Value::Text(_)));
        matches!(context.map(|c| &c.data_type), Some(DataType::Text))
            || text_literal(left)
            || text_literal(right)
    }
}

/// Type information a literal is rendered against
struct Context {
    data_type: DataType,
    attribute: Option<String>,
    srid: Option<i32>,
    dimension: Option<u8>,
}

impl Context {
    const fn text() -> Self {
        Self {
            data_type: DataType::Text,
            attribute: None,
            srid: None,
            dimension: None,
        }
    }

    fn from_resolved(resolved: &Resolved<'_>) -> Self {
        let attribute = resolved.attribute;
        Self {
            data_type: resolved.data_type.clone(),
            attribute: attribute.map(|a| a.name.clone()),
            srid: attribute.and_then(|a| a.native_srid.or(a.srid)),
            dimension: attribute.and_then(|a| a.coordinate_dimension),
        }
    }

    /// Converts a literal to the context type, mapping enum labels to codes
    fn convert(&self, value: &Value) -> Result<Value, StoreError> {
        if value.is_null() || self.data_type == DataType::Unknown {
            return Ok(value.clone());
        }
        if let (DataType::Geometry(_), Value::Geometry(g)) = (&self.data_type, value) {
            return Ok(Value::Geometry(Geometry {
                shape: g.shape.clone(),
                srid: g.srid.or(self.srid),
            }));
        }
        value.coerce_to(&self.data_type).map_err(|e| {
            StoreError::Translation(format!(
                "literal {value:?} cannot be encoded as {} for '{}': {e}",
                self.data_type,
                self.attribute.as_deref().unwrap_or("?")
            ))
        })
    }
}

/// Enum labels are stored as codes; rewrites comparisons accordingly
pub fn map_enum_literals(filter: &Filter, schema: &FeatureSchema) -> Filter {
    let map = |expr: &Expression, other: &Expression| -> Expression {
        if let (Expression::Property(p), Expression::Literal(Value::Text(label))) = (other, expr) {
            if let Some(code) = schema
                .attribute(&p.name)
                .and_then(|a| a.enum_mapping.as_ref())
                .and_then(|m| m.code(label))
            {
                return Expression::Literal(Value::Integer(code));
            }
        }
        expr.clone()
    };
    match filter {
        Filter::And(children) => Filter::And(children.iter().map(|c| map_enum_literals(c, schema)).collect()),
        Filter::Or(children) => Filter::Or(children.iter().map(|c| map_enum_literals(c, schema)).collect()),
        Filter::Not(inner) => Filter::Not(Box::new(map_enum_literals(inner, schema))),
        Filter::Compare { op, left, right, match_case } => Filter::Compare {
            op: *op,
            left: map(left, right),
            right: map(right, left),
            match_case: *match_case,
        },
        Filter::In { expr, values } => Filter::In {
            expr: expr.clone(),
            values: values.iter().map(|v| map(v, expr)).collect(),
        },
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EnumMapping, GeometryKind};
    use crate::dialect::{GenericDialect, MySqlDialect, PostgisDialect};
    use crate::filter::CompareOp;
    use crate::primary_key::{GenerationKind, PrimaryKeyColumn};

    fn scope() -> TableScope {
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
        TableScope::new(Arc::new(schema), Arc::new(key))
    }

    #[test]
    fn test_prepared_bindings_follow_text_order() {
        let d = PostgisDialect::new();
        let filter = Filter::And(vec![
            Filter::equals("name", Value::Text("Main".to_string())),
            Filter::compare(CompareOp::Gt, "lanes", Value::Text("2".to_string())),
        ]);
        let t = FilterToSql::new(&d, scope()).translate(&filter).unwrap();
        assert_eq!(t.sql, "(\"name\" = ? AND \"lanes\" > ?)");
        assert_eq!(t.sql.matches('?').count(), t.bindings.len());
        assert_eq!(t.bindings[1].value, Value::Integer(2));
        assert_eq!(t.bindings[1].attribute.as_deref(), Some("lanes"));
    }

    #[test]
    fn test_inline_literals() {
        let d = GenericDialect::new();
        let filter = Filter::equals("name", Value::Text("O'Hare".to_string()));
        let t = FilterToSql::new(&d, scope()).translate(&filter).unwrap();
        assert_eq!(t.sql, "\"name\" = 'O''Hare'");
        assert!(t.bindings.is_empty());
    }

    #[test]
    fn test_uncoercible_literal_is_fatal() {
        let d = GenericDialect::new();
        let filter = Filter::equals("lanes", Value::Text("many".to_string()));
        assert!(matches!(
            FilterToSql::new(&d, scope()).translate(&filter),
            Err(StoreError::Translation(_))
        ));
    }

    #[test]
    fn test_id_filter() {
        let d = PostgisDialect::new();
        let t = FilterToSql::new(&d, scope())
            .translate(&Filter::ids(["roads.1", "roads.7"]))
            .unwrap();
        assert_eq!(t.sql, "((\"fid\" = ?) OR (\"fid\" = ?))");
        assert_eq!(t.bindings[1].value, Value::Integer(7));
    }

    #[test]
    fn test_id_filter_without_key() {
        let d = PostgisDialect::new();
        let mut s = scope();
        s.key = Arc::new(PrimaryKey::null("roads"));
        assert!(FilterToSql::new(&d, s).translate(&Filter::ids(["roads.1"])).is_err());
    }

    #[test]
    fn test_case_insensitive_compare() {
        let d = GenericDialect::new();
        let filter = Filter::Compare {
            op: CompareOp::Eq,
            left: Expression::property("name"),
            right: Expression::literal(Value::Text("main".to_string())),
            match_case: false,
        };
        let t = FilterToSql::new(&d, scope()).translate(&filter).unwrap();
        assert_eq!(t.sql, "UPPER(\"name\") = UPPER('main')");
    }

    #[test]
    fn test_like_escape() {
        let d = MySqlDialect::new();
        let filter = Filter::Like {
            expr: Expression::property("name"),
            pattern: "50\\%%".to_string(),
            match_case: true,
        };
        let t = FilterToSql::new(&d, scope()).translate(&filter).unwrap();
        assert_eq!(t.sql, "`name` LIKE '50\\\\%%' ESCAPE '\\\\'");
    }

    #[test]
    fn test_spatial_placeholder_carries_srid() {
        let d = PostgisDialect::new();
        let filter = Filter::bbox("geom", Geometry::point(1.0, 2.0));
        let t = FilterToSql::new(&d, scope()).translate(&filter).unwrap();
        assert_eq!(t.sql, "\"geom\" && ST_GeomFromText(?, 4326)");
        assert_eq!(t.bindings[0].srid, Some(4326));
    }

    #[test]
    fn test_alias_qualification_and_strictness() {
        let d = PostgisDialect::new();
        let translator = FilterToSql::new(&d, scope().with_alias("a")).strict(true);
        let t = translator.translate(&Filter::is_null("name")).unwrap();
        assert_eq!(t.sql, "a.\"name\" IS NULL");
        assert!(matches!(
            translator.translate(&Filter::is_null("speed")),
            Err(StoreError::UnresolvedProperty(_))
        ));
    }

    #[test]
    fn test_tolerant_unknown_property() {
        let d = PostgisDialect::new();
        let t = FilterToSql::new(&d, scope()).translate(&Filter::is_null("speed")).unwrap();
        assert_eq!(t.sql, "\"speed\" IS NULL");
    }

    #[test]
    fn test_empty_in_and_junctions() {
        let d = GenericDialect::new();
        let tr = FilterToSql::new(&d, scope());
        let empty_in = Filter::In { expr: Expression::property("lanes"), values: Vec::new() };
        assert_eq!(tr.translate(&empty_in).unwrap().sql, "1 = 0");
        assert_eq!(tr.translate(&Filter::Or(Vec::new())).unwrap().sql, "1 = 0");
        assert_eq!(tr.translate(&Filter::Include).unwrap().sql, "1 = 1");
    }

    #[test]
    fn test_enum_labels_become_codes() {
        let schema = FeatureSchema::new(
            "roads",
            vec![AttributeDescriptor::new("class", DataType::Integer)
                .with_enum_mapping(EnumMapping::new([(1, "primary"), (2, "secondary")]))],
        );
        let mapped = map_enum_literals(&Filter::equals("class", Value::Text("secondary".to_string())), &schema);
        assert_eq!(mapped, Filter::equals("class", Value::Integer(2)));
    }
}

/// Join planning
///
/// Assigns every participating type a SQL alias (`a` for the primary type,
/// then `b`, `c`, ...), qualifies each property reference with the alias of
/// the type that owns it, splits filters per branch and renames joined
/// columns that collide with primary ones to `{alias}_{column}`.

use std::sync::Arc;
use tracing::debug;
use crate::core::{AttributeDescriptor, FeatureSchema, StoreError};
use crate::dialect::Dialect;
use crate::filter::{apply_null_guards, simplify, split, Filter, PropertyName};
use super::builder::TableSource;
use super::query::{JoinKind, Query};

/// One joined type
#[derive(Debug, Clone)]
pub struct JoinBranch {
    /// SQL alias
    pub alias: String,
    /// Name joined features are published under: the user alias, else the type name
    pub name: String,
    pub kind: JoinKind,
    pub source: TableSource,
    /// Join condition, qualified with SQL aliases
    pub on: Filter,
    /// Pushed-down part of the branch filter (goes into ON)
    pub pre: Filter,
    /// Residual branch filter, qualified with public names
    pub post: Filter,
    /// Selected attributes with collision aliases applied
    pub attributes: Vec<AttributeDescriptor>,
}

#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub primary_alias: String,
    pub primary: TableSource,
    pub pre: Filter,
    pub post: Filter,
    pub branches: Vec<JoinBranch>,
}

impl JoinInfo {
    /// Every residual filter, primary and per branch
    #[must_use]
    pub fn post_filter(&self) -> Filter {
        let mut parts = vec![self.post.clone()];
        parts.extend(self.branches.iter().map(|b| b.post.clone()));
        simplify(&Filter::And(parts))
    }

    /// Primary-type properties referenced by residual filters; these must be
    /// fetched even when not selected
    #[must_use]
    pub fn primary_post_properties(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.post_filter().visit_properties(&mut |p: &PropertyName| {
            let owned = p.prefix.as_deref().is_none_or(|prefix| prefix == self.primary.schema.name);
            if owned && !names.contains(&p.name) {
                names.push(p.name.clone());
            }
        });
        names
    }
}

pub struct JoinPlanner<'a> {
    dialect: &'a dyn Dialect,
    two_valued: bool,
}

/// Scope index: 0 is the primary type, `i + 1` is branch `i`
struct Scopes<'q> {
    primary_name: &'q str,
    primary: &'q TableSource,
    branches: Vec<(String, Option<&'q str>, String, &'q TableSource)>, // (type name, user alias, sql alias, source)
}

impl Scopes<'_> {
    fn sql_alias(index: usize) -> String {
        let letter = b'a' + u8::try_from(index % 26).unwrap_or(0);
        let mut alias = String::from(char::from(letter));
        if index >= 26 {
            alias.push_str(&(index / 26).to_string());
        }
        alias
    }

    fn source(&self, index: usize) -> &TableSource {
        if index == 0 { self.primary } else { self.branches[index - 1].3 }
    }

    fn find_prefix(&self, prefix: &str) -> Option<usize> {
        if prefix == self.primary_name || prefix == Self::sql_alias(0) {
            return Some(0);
        }
        self.branches
            .iter()
            .position(|(type_name, user_alias, sql_alias, _)| {
                type_name == prefix || *user_alias == Some(prefix) || sql_alias == prefix
            })
            .map(|i| i + 1)
    }

    fn owns(&self, index: usize, name: &str) -> bool {
        let source = self.source(index);
        source.schema.attribute(name).is_some() || source.key.contains(name)
    }

    fn nullable(&self, index: usize, name: &str) -> bool {
        self.source(index).schema.attribute(name).is_some_and(|a| a.nullable)
    }

    fn public_name(&self, index: usize) -> String {
        if index == 0 {
            self.primary_name.to_string()
        } else {
            let (type_name, user_alias, _, _) = &self.branches[index - 1];
            user_alias.map_or_else(|| type_name.clone(), str::to_string)
        }
    }

    /// Rewrites every property to `sql_alias.name`; `home` is the branch an
    /// unqualified name may also belong to
    fn qualify(&self, filter: &Filter, home: Option<usize>) -> Result<Filter, StoreError> {
        filter.map_properties(&mut |p: &PropertyName| {
            let index = match p.prefix.as_deref() {
                Some(prefix) => self
                    .find_prefix(prefix)
                    .ok_or_else(|| StoreError::Join(format!("unknown type or alias '{prefix}' in '{p}'")))?,
                None if self.owns(0, &p.name) => 0,
                None => match home {
                    Some(h) if self.owns(h, &p.name) => h,
                    _ => return Err(StoreError::UnresolvedProperty(p.to_string())),
                },
            };
            if !self.owns(index, &p.name) {
                return Err(StoreError::UnresolvedProperty(p.to_string()));
            }
            Ok(PropertyName::qualified(Self::sql_alias(index), p.name.clone()))
        })
    }

    fn index_of_alias(&self, alias: &str) -> Option<usize> {
        (0..=self.branches.len()).find(|i| Self::sql_alias(*i) == alias)
    }

    /// SQL-alias qualified filter renamed for in-memory evaluation
    fn publish(&self, filter: &Filter) -> Filter {
        let renamed: Result<Filter, StoreError> = filter.map_properties(&mut |p: &PropertyName| {
            let public = p
                .prefix
                .as_deref()
                .and_then(|alias| self.index_of_alias(alias))
                .map(|i| self.public_name(i));
            Ok(PropertyName {
                name: p.name.clone(),
                prefix: public.or_else(|| p.prefix.clone()),
            })
        });
        renamed.unwrap_or_else(|_| filter.clone())
    }

    fn guard(&self, filter: &Filter) -> Filter {
        apply_null_guards(filter, &|p: &PropertyName| {
            p.prefix
                .as_deref()
                .and_then(|alias| self.index_of_alias(alias))
                .is_some_and(|i| self.nullable(i, &p.name))
        })
    }
}

impl<'a> JoinPlanner<'a> {
    pub fn new(dialect: &'a dyn Dialect, two_valued: bool) -> Self {
        Self { dialect, two_valued }
    }

    /// Plans `query` given the resolved primary source and one source per
    /// join, in join order
    pub fn plan(&self, query: &Query, primary: &TableSource, branches: &[TableSource]) -> Result<JoinInfo, StoreError> {
        if branches.len() != query.joins.len() {
            return Err(StoreError::Join(format!(
                "{} joins but {} resolved sources",
                query.joins.len(),
                branches.len()
            )));
        }
        for source in std::iter::once(primary).chain(branches) {
            if let Some(vt) = &source.virtual_table {
                if vt.has_where_placeholder() {
                    return Err(StoreError::Join(format!(
                        "virtual table '{}' uses a where-clause placeholder and cannot be joined",
                        vt.name
                    )));
                }
            }
        }

        let scopes = Scopes {
            primary_name: &query.type_name,
            primary,
            branches: query
                .joins
                .iter()
                .zip(branches)
                .enumerate()
                .map(|(i, (join, source))| {
                    (join.type_name.clone(), join.alias.as_deref(), Scopes::sql_alias(i + 1), source)
                })
                .collect(),
        };
        let caps = self.dialect.filter_capabilities();

        let qualified = scopes.qualify(&simplify(&query.filter), None)?;
        let primary_split = split(&qualified, &caps, !primary.key.is_null());
        let pre = if self.two_valued { scopes.guard(&primary_split.pre) } else { primary_split.pre };

        let mut taken: Vec<String> = primary.key.column_names().map(str::to_string).collect();
        taken.extend(primary.schema.attributes.iter().map(|a| a.name.clone()));

        let mut planned = Vec::with_capacity(branches.len());
        for (i, (join, source)) in query.joins.iter().zip(branches).enumerate() {
            let index = i + 1;
            let alias = Scopes::sql_alias(index);
            let on = scopes.qualify(&simplify(&join.on), Some(index))?;
            if !caps.fully_supports(&on) {
                return Err(StoreError::Join(format!(
                    "join condition on '{}' cannot be expressed in SQL",
                    join.type_name
                )));
            }
            let filter = scopes.qualify(&simplify(&join.filter), Some(index))?;
            let branch_split = split(&filter, &caps, !source.key.is_null());
            let branch_pre = if self.two_valued { scopes.guard(&branch_split.pre) } else { branch_split.pre };

            let attributes = Self::branch_attributes(&alias, join.properties.as_deref(), &source.schema, &taken)?;
            debug!(
                join = %join.type_name,
                alias = %alias,
                aliased = attributes.iter().filter(|a| a.column_alias.is_some()).count(),
                "planned join branch"
            );
            planned.push(JoinBranch {
                alias,
                name: scopes.public_name(index),
                kind: join.kind,
                source: source.clone(),
                on,
                pre: branch_pre,
                post: scopes.publish(&branch_split.post),
                attributes,
            });
        }

        Ok(JoinInfo {
            primary_alias: Scopes::sql_alias(0),
            primary: primary.clone(),
            pre,
            post: scopes.publish(&primary_split.post),
            branches: planned,
        })
    }

    fn branch_attributes(
        alias: &str,
        properties: Option<&[String]>,
        schema: &FeatureSchema,
        taken: &[String],
    ) -> Result<Vec<AttributeDescriptor>, StoreError> {
        let selected = match properties {
            Some(names) => schema.project(names)?.attributes,
            None => schema.attributes.clone(),
        };
        Ok(selected
            .into_iter()
            .map(|mut attr| {
                if taken.contains(&attr.name) {
                    attr.column_alias = Some(format!("{alias}_{}", attr.name));
                }
                attr
            })
            .collect())
    }
}

/// Convenience for callers holding `Arc`ed schemas
#[must_use]
pub fn branch_schema(branch: &JoinBranch) -> Arc<FeatureSchema> {
    Arc::new(FeatureSchema::new(branch.source.schema.name.clone(), branch.attributes.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, Geometry, GeometryKind, Value};
    use crate::dialect::{GenericDialect, PostgisDialect};
    use crate::filter::{CompareOp, Expression};
    use crate::primary_key::{GenerationKind, PrimaryKey, PrimaryKeyColumn};
    use crate::sql::query::Join;
    use crate::sql::VirtualTable;

    fn source(name: &str, attrs: Vec<AttributeDescriptor>) -> TableSource {
        TableSource::new(
            Arc::new(FeatureSchema::new(name, attrs)),
            Arc::new(PrimaryKey::new(
                name,
                vec![PrimaryKeyColumn::new("fid", DataType::Integer, GenerationKind::AutoGenerated)],
            )),
        )
    }

    fn roads() -> TableSource {
        source(
            "roads",
            vec![
                AttributeDescriptor::new("name", DataType::Text),
                AttributeDescriptor::new("city_id", DataType::Integer),
            ],
        )
    }

    fn cities() -> TableSource {
        source(
            "cities",
            vec![
                AttributeDescriptor::new("id", DataType::Integer).not_null(),
                AttributeDescriptor::new("name", DataType::Text),
                AttributeDescriptor::geometry("loc", GeometryKind::Point, Some(4326)),
            ],
        )
    }

    fn on_city() -> Filter {
        Filter::Compare {
            op: CompareOp::Eq,
            left: Expression::property("city_id"),
            right: Expression::Property(PropertyName::qualified("cities", "id")),
            match_case: true,
        }
    }

    #[test]
    fn test_collision_alias() {
        let d = PostgisDialect::new();
        let query = Query::new("roads").join(Join::inner("cities", on_city()));
        let info = JoinPlanner::new(&d, true).plan(&query, &roads(), &[cities()]).unwrap();
        let branch = &info.branches[0];
        assert_eq!(branch.alias, "b");
        let name = branch.attributes.iter().find(|a| a.name == "name").unwrap();
        assert_eq!(name.output_name(), "b_name");
        let id = branch.attributes.iter().find(|a| a.name == "id").unwrap();
        assert_eq!(id.column_alias, None);
    }

    #[test]
    fn test_qualification() {
        let d = PostgisDialect::new();
        let query = Query::new("roads").join(Join::inner("cities", on_city()));
        let info = JoinPlanner::new(&d, false).plan(&query, &roads(), &[cities()]).unwrap();
        assert_eq!(
            info.branches[0].on,
            Filter::Compare {
                op: CompareOp::Eq,
                left: Expression::Property(PropertyName::qualified("a", "city_id")),
                right: Expression::Property(PropertyName::qualified("b", "id")),
                match_case: true,
            }
        );
    }

    #[test]
    fn test_unresolvable_property_is_fatal() {
        let d = PostgisDialect::new();
        let query = Query::new("roads")
            .with_filter(Filter::equals("population", Value::Integer(1)))
            .join(Join::inner("cities", on_city()));
        assert!(matches!(
            JoinPlanner::new(&d, true).plan(&query, &roads(), &[cities()]),
            Err(StoreError::UnresolvedProperty(_))
        ));

        let query = Query::new("roads").join(Join::inner(
            "cities",
            Filter::equals("towns.id", Value::Integer(1)),
        ));
        assert!(matches!(
            JoinPlanner::new(&d, true).plan(&query, &roads(), &[cities()]),
            Err(StoreError::Join(_))
        ));
    }

    #[test]
    fn test_branch_filter_split_and_published() {
        let d = GenericDialect::new();
        let branch_filter = Filter::And(vec![
            Filter::equals("name", Value::Text("Oslo".to_string())),
            Filter::bbox("loc", Geometry::point(10.0, 59.0)),
        ]);
        let query = Query::new("roads").join(Join::inner("cities", on_city()).with_alias("c").with_filter(branch_filter));
        let info = JoinPlanner::new(&d, false).plan(&query, &roads(), &[cities()]).unwrap();
        let branch = &info.branches[0];
        // unqualified "name" resolves to the primary type first
        assert!(matches!(&branch.pre, Filter::Compare { left: Expression::Property(p), .. } if p.prefix.as_deref() == Some("a")));
        // the generic dialect has no spatial support, the bbox stays in memory
        assert!(matches!(&branch.post, Filter::Spatial { property: Expression::Property(p), .. } if p.prefix.as_deref() == Some("c")));
        assert_eq!(branch.name, "c");
    }

    #[test]
    fn test_null_guard_on_nullable_only() {
        let d = PostgisDialect::new();
        let query = Query::new("roads")
            .with_filter(Filter::compare(CompareOp::Ne, "cities.id", Value::Integer(5)))
            .join(Join::inner("cities", on_city()));
        let info = JoinPlanner::new(&d, true).plan(&query, &roads(), &[cities()]).unwrap();
        // cities.id is NOT NULL, so no guard is added
        assert!(matches!(info.pre, Filter::Compare { .. }));

        let query = Query::new("roads")
            .with_filter(Filter::compare(CompareOp::Ne, "name", Value::Text("x".to_string())))
            .join(Join::inner("cities", on_city()));
        let info = JoinPlanner::new(&d, true).plan(&query, &roads(), &[cities()]).unwrap();
        assert!(matches!(info.pre, Filter::And(ref parts) if parts.len() == 2));
    }

    #[test]
    fn test_placeholder_virtual_table_cannot_join() {
        let d = PostgisDialect::new();
        let mut vt_source = cities();
        vt_source.virtual_table = Some(Arc::new(VirtualTable::new(
            "cities",
            "SELECT * FROM c WHERE :where_clause:",
        )));
        let query = Query::new("roads").join(Join::inner("cities", on_city()));
        assert!(matches!(
            JoinPlanner::new(&d, true).plan(&query, &roads(), &[vt_source]),
            Err(StoreError::Join(_))
        ));
    }

    #[test]
    fn test_post_filter_uses_public_names() {
        let d = GenericDialect::new();
        let query = Query::new("roads")
            .with_filter(Filter::bbox("cities.loc", Geometry::point(10.0, 59.0)))
            .join(Join::outer("cities", on_city()));
        let info = JoinPlanner::new(&d, true).plan(&query, &roads(), &[cities()]).unwrap();
        let mut prefixes = Vec::new();
        info.post_filter().visit_properties(&mut |p: &PropertyName| prefixes.push(p.prefix.clone()));
        assert_eq!(prefixes, vec![Some("cities".to_string())]);
        assert!(info.primary_post_properties().is_empty());
    }
}

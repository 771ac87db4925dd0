/// Read paths: feature streams, counts, aggregates and bounds
///
/// Every path first decides how much of the query SQL can carry. Whatever the
/// dialect cannot express (a residual filter, an unsortable key, paging
/// without native LIMIT/OFFSET) is finished in memory by `PostProcessor`,
/// with identical results.

use std::sync::Arc;
use tracing::{debug, warn};
use crate::core::{AttributeDescriptor, Envelope, Feature, FeatureSchema, StoreError, Value};
use crate::filter::{apply_null_guards, split, Filter, FilterEvaluator, SplitFilter};
use crate::primary_key::PrimaryKey;
use crate::sql::join::branch_schema;
use crate::sql::{
    Accumulator, AggregateKind, AggregateRequest, AggregateValue, GroupResult, GroupedAccumulator, JoinPlanner, Paging,
    Query, SelectRequest, SortBy, SortOrder, TableSource,
};
use crate::transaction::Transaction;
use super::mapper::{BranchMapper, ResultMapper};
use super::post::{FeatureStream, PostProcessor};
use super::reader::FeatureReader;
use super::store::{run_query, DataStore};

/// How a query is divided between SQL and memory
#[derive(Debug)]
struct Plan {
    pre: Filter,
    post: PostProcessor,
    sql_sort: Vec<SortBy>,
    sql_paging: Paging,
}

pub struct QueryExecutor;

impl QueryExecutor {
    /// Streams the features `query` selects
    pub fn features(store: &DataStore, query: &Query, tx: &Transaction) -> Result<FeatureStream, StoreError> {
        if query.is_join() {
            return Self::join_features(store, query, tx);
        }
        let parameters = &query.hints.virtual_table_parameters;
        let source = store.source(&query.type_name, tx, parameters)?;
        let expose = store.expose_keys(query);
        let filter = Self::split_filter(store, &query.filter, store.two_valued(query), &source);

        // 1. Shape: returned schema plus what the residual work needs
        let mut needed = filter.post.property_names();
        let push_sort = store.builder().can_push_sort(&source, &query.sort);
        if !push_sort {
            needed.extend(Self::sort_properties(&query.sort));
        }
        let full = store.schema_for(&query.type_name, expose, tx, parameters)?;
        let (returned, fetched) = Self::shape(&full, &source.key, expose, query.properties.as_deref(), &needed)?;

        // 2. Split the work
        let plan = Self::plan(store, query, &source.key, filter, push_sort, &returned, &fetched);
        debug!(
            type_name = %query.type_name,
            post_filter = !plan.post.filter.is_include(),
            post_sort = !plan.post.sort.is_empty(),
            post_paging = !plan.post.paging.is_empty(),
            "planned feature query"
        );

        // 3. Build and open
        let mapper = ResultMapper::new(Arc::clone(store.dialect()), Arc::clone(&source.key), fetched, expose);
        let request = SelectRequest {
            attributes: mapper.selected_attributes(),
            filter: &plan.pre,
            sort: &plan.sql_sort,
            paging: plan.sql_paging,
            simplify: query.hints.simplification_distance,
            parameters,
        };
        let statement = store.builder().select(&source, &request)?;
        let params = statement.params(store.dialect().as_ref());
        let lease = store.connector().acquire(tx)?;
        let config = store.config();
        let reader = FeatureReader::open(lease, &statement, &params, mapper, Vec::new(), config.fetch_size, config.leak_tracing)?;
        Ok(FeatureStream::new(plan.post.apply(Box::new(reader)), returned))
    }

    fn join_features(store: &DataStore, query: &Query, tx: &Transaction) -> Result<FeatureStream, StoreError> {
        let parameters = &query.hints.virtual_table_parameters;
        let primary = store.source(&query.type_name, tx, parameters)?;
        let branches = query
            .joins
            .iter()
            .map(|join| store.source(&join.type_name, tx, parameters))
            .collect::<Result<Vec<_>, _>>()?;
        let dialect = store.dialect();
        let info = JoinPlanner::new(dialect.as_ref(), store.two_valued(query)).plan(query, &primary, &branches)?;

        let expose = store.expose_keys(query);
        let push_sort = store.builder().can_push_sort(&info.primary, &query.sort);
        let mut needed = info.primary_post_properties();
        if !push_sort {
            needed.extend(Self::sort_properties(&query.sort));
        }
        let full = store.schema_for(&query.type_name, expose, tx, parameters)?;
        let (returned, fetched) = Self::shape(&full, &primary.key, expose, query.properties.as_deref(), &needed)?;

        let filter = SplitFilter {
            pre: info.pre.clone(),
            post: info.post_filter(),
        };
        let plan = Self::plan(store, query, &primary.key, filter, push_sort, &returned, &fetched);

        let mapper = ResultMapper::new(Arc::clone(dialect), Arc::clone(&primary.key), fetched, expose);
        let mut offset = mapper.column_count();
        let mut mappers = Vec::with_capacity(info.branches.len());
        for branch in &info.branches {
            let branch_mapper =
                ResultMapper::new(Arc::clone(dialect), Arc::clone(&branch.source.key), branch_schema(branch), false)
                    .with_offset(offset);
            offset += branch_mapper.column_count();
            mappers.push(BranchMapper {
                name: branch.name.clone(),
                kind: branch.kind,
                mapper: branch_mapper,
            });
        }

        let request = SelectRequest {
            attributes: mapper.selected_attributes(),
            filter: &info.pre,
            sort: &plan.sql_sort,
            paging: plan.sql_paging,
            simplify: query.hints.simplification_distance,
            parameters,
        };
        let statement = store.builder().select_join(&info, &request)?;
        let params = statement.params(dialect.as_ref());
        let lease = store.connector().acquire(tx)?;
        let config = store.config();
        let reader = FeatureReader::open(lease, &statement, &params, mapper, mappers, config.fetch_size, config.leak_tracing)?;
        Ok(FeatureStream::new(plan.post.apply(Box::new(reader)), returned))
    }

    /// simplify -> split -> null-guard; the guard applies to the pushed part
    /// only since in-memory evaluation is already two-valued
    pub(crate) fn split_filter(store: &DataStore, filter: &Filter, two_valued: bool, source: &TableSource) -> SplitFilter {
        let caps = store.dialect().filter_capabilities();
        let filter = split(filter, &caps, !source.key.is_null());
        if !two_valued {
            return filter;
        }
        let nullable = |p: &crate::filter::PropertyName| source.schema.attribute(&p.name).is_some_and(|a| a.nullable);
        SplitFilter {
            pre: apply_null_guards(&filter.pre, &nullable),
            post: filter.post,
        }
    }

    fn plan(
        store: &DataStore,
        query: &Query,
        key: &PrimaryKey,
        filter: SplitFilter,
        push_sort: bool,
        returned: &Arc<FeatureSchema>,
        fetched: &Arc<FeatureSchema>,
    ) -> Plan {
        let (mut sql_sort, post_sort) = if push_sort {
            (query.sort.clone(), Vec::new())
        } else {
            (Vec::new(), query.sort.clone())
        };
        let paging = Paging::new(query.start_index, query.max_features);
        let push_paging =
            !filter.has_post() && push_sort && store.dialect().supports_limit_offset() && !paging.is_empty();
        if push_paging && sql_sort.is_empty() && !key.is_null() {
            sql_sort.push(SortBy::Natural(SortOrder::Ascending));
        }
        let (sql_paging, post_paging) = if push_paging {
            (paging, Paging::default())
        } else {
            (Paging::default(), paging)
        };
        let projection = (!Arc::ptr_eq(returned, fetched)).then(|| Arc::clone(returned));
        Plan {
            pre: filter.pre,
            post: PostProcessor {
                filter: filter.post,
                sort: post_sort,
                paging: post_paging,
                projection,
            },
            sql_sort,
            sql_paging,
        }
    }

    fn sort_properties(sort: &[SortBy]) -> Vec<String> {
        sort.iter()
            .filter_map(|s| match s {
                SortBy::Property { name, .. } if name.prefix.is_none() => Some(name.name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returned schema and fetched schema. The fetched one appends attributes
    /// only needed in memory; the two are the same `Arc` when nothing is
    /// appended. Exposed key attributes always lead both.
    fn shape(
        full: &Arc<FeatureSchema>,
        key: &PrimaryKey,
        expose: bool,
        properties: Option<&[String]>,
        needed: &[String],
    ) -> Result<(Arc<FeatureSchema>, Arc<FeatureSchema>), StoreError> {
        let Some(names) = properties else {
            return Ok((Arc::clone(full), Arc::clone(full)));
        };
        let selected = full.project(names)?;
        let exposed = if expose { key.columns.len().min(full.attributes.len()) } else { 0 };
        let mut returned: Vec<AttributeDescriptor> = full.attributes[..exposed].to_vec();
        returned.extend(selected.attributes.into_iter().filter(|a| !key.contains(&a.name)));

        let mut fetched = returned.clone();
        for name in needed {
            if key.contains(name) || fetched.iter().any(|a| &a.name == name) {
                continue;
            }
            if let Some(attr) = full.attribute(name) {
                fetched.push(attr.clone());
            }
        }
        let extra = fetched.len() > returned.len();
        let returned = Arc::new(FeatureSchema::new(full.name.clone(), returned));
        if !extra {
            return Ok((Arc::clone(&returned), returned));
        }
        Ok((returned, Arc::new(FeatureSchema::new(full.name.clone(), fetched))))
    }

    /// Number of features `query` selects
    pub fn count(store: &DataStore, query: &Query, tx: &Transaction) -> Result<u64, StoreError> {
        let parameters = &query.hints.virtual_table_parameters;
        let source = store.source(&query.type_name, tx, parameters)?;
        let filter = Self::split_filter(store, &query.filter, store.two_valued(query), &source);
        if query.is_join() || filter.has_post() {
            debug!(type_name = %query.type_name, "counting by scan");
            return Self::scan_count(store, query, tx);
        }

        let paging = Paging::new(query.start_index, query.max_features);
        let native = store.dialect().supports_limit_offset();
        let sql_paging = if native { paging } else { Paging::default() };
        let statement = store.builder().count(&source, &filter.pre, sql_paging, parameters)?;
        let mut lease = store.connector().acquire(tx)?;
        let rows = run_query(&mut lease, store.dialect().as_ref(), &statement, 1);
        lease.release();
        let total = rows?
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_int)
            .unwrap_or(0)
            .max(0) as u64;
        if native {
            return Ok(total);
        }
        let remaining = total.saturating_sub(paging.offset);
        Ok(paging.limit.map_or(remaining, |limit| remaining.min(limit)))
    }

    fn scan_count(store: &DataStore, query: &Query, tx: &Transaction) -> Result<u64, StoreError> {
        let mut scan = query.clone();
        scan.properties = Some(Vec::new());
        let mut count = 0;
        for feature in Self::features(store, &scan, tx)? {
            feature?;
            count += 1;
        }
        Ok(count)
    }

    /// Aggregate over the features `query` selects, pushed down when the
    /// dialect has the function and nothing is left for memory
    pub fn aggregate(
        store: &DataStore,
        query: &Query,
        request: &AggregateRequest,
        tx: &Transaction,
    ) -> Result<AggregateValue, StoreError> {
        let parameters = &query.hints.virtual_table_parameters;
        let source = store.source(&query.type_name, tx, parameters)?;
        let filter = Self::split_filter(store, &query.filter, store.two_valued(query), &source);
        if !query.is_join() && !filter.has_post() {
            let paging = Paging::new(query.start_index, query.max_features);
            if let Some(statement) = store.builder().aggregate(&source, request, &filter.pre, paging, parameters)? {
                let grouped = request.is_grouped() && request.kind != AggregateKind::Unique;
                let columns = if grouped { request.group_by.len() + 1 } else { 1 };
                let mut lease = store.connector().acquire(tx)?;
                let rows = run_query(&mut lease, store.dialect().as_ref(), &statement, columns);
                lease.release();
                return Ok(Self::aggregate_rows(request, grouped, rows?));
            }
        }
        debug!(type_name = %query.type_name, kind = request.kind.name(), "aggregating by scan");
        Self::scan_aggregate(store, query, request, tx)
    }

    fn aggregate_rows(request: &AggregateRequest, grouped: bool, rows: Vec<Vec<Value>>) -> AggregateValue {
        if request.kind == AggregateKind::Unique {
            return AggregateValue::Unique(rows.into_iter().filter_map(|row| row.into_iter().next()).collect());
        }
        if grouped {
            let groups = request.group_by.len();
            return AggregateValue::Grouped(
                rows.into_iter()
                    .map(|mut row| {
                        let value = row.pop().unwrap_or(Value::Null);
                        row.truncate(groups);
                        GroupResult {
                            key: row,
                            value: AggregateValue::Scalar(value),
                        }
                    })
                    .collect(),
            );
        }
        AggregateValue::Scalar(rows.into_iter().next().and_then(|row| row.into_iter().next()).unwrap_or(Value::Null))
    }

    fn scan_aggregate(
        store: &DataStore,
        query: &Query,
        request: &AggregateRequest,
        tx: &Transaction,
    ) -> Result<AggregateValue, StoreError> {
        let mut scan = query.clone();
        scan.properties = None;
        let stream = Self::features(store, &scan, tx)?;
        let target = |feature: &Feature, acc: &mut Accumulator| -> Result<(), StoreError> {
            match request.expression() {
                Some(expr) => acc.add(&FilterEvaluator::value_of(expr, feature)?),
                None => {
                    acc.add_row();
                    Ok(())
                }
            }
        };

        if request.is_grouped() && request.kind != AggregateKind::Unique {
            let mut groups = GroupedAccumulator::new(request.kind);
            for feature in stream {
                let feature = feature?;
                let key = request
                    .group_by
                    .iter()
                    .map(|expr| FilterEvaluator::value_of(expr, &feature))
                    .collect::<Result<Vec<_>, _>>()?;
                target(&feature, groups.group(key))?;
            }
            return Ok(groups.finish());
        }
        let mut acc = Accumulator::new(request.kind);
        for feature in stream {
            target(&feature?, &mut acc)?;
        }
        Ok(acc.finish())
    }

    /// Envelope of the geometry attributes of the selected features, merged
    /// in the reference system of the first non-empty one
    pub fn bounds(store: &DataStore, query: &Query, tx: &Transaction) -> Result<Envelope, StoreError> {
        let parameters = &query.hints.virtual_table_parameters;
        let source = store.source(&query.type_name, tx, parameters)?;
        let geometries: Vec<&AttributeDescriptor> = source
            .schema
            .geometry_attributes()
            .filter(|a| query.properties.as_ref().is_none_or(|names| names.contains(&a.name)))
            .collect();
        if geometries.is_empty() {
            return Ok(Envelope::null());
        }

        let paging = Paging::new(query.start_index, query.max_features);
        let filter = Self::split_filter(store, &query.filter, store.two_valued(query), &source);
        let plain = !query.is_join() && !filter.has_post();

        // 1. Index statistics
        if plain && filter.pre.is_include() && paging.is_empty() && source.virtual_table.is_none() {
            if let Some(envelope) = Self::estimated_bounds(store, &source, &geometries, tx)? {
                return Ok(envelope);
            }
        }

        // 2. Envelope aggregate in SQL
        if plain && (paging.is_empty() || store.dialect().supports_limit_offset()) {
            let statement = store.builder().bounds(&source, &geometries, &filter.pre, paging, parameters)?;
            let mut lease = store.connector().acquire(tx)?;
            let rows = run_query(&mut lease, store.dialect().as_ref(), &statement, geometries.len());
            lease.release();
            let mut envelopes = Vec::new();
            for row in rows? {
                for (value, attr) in row.into_iter().zip(&geometries) {
                    if let Some(envelope) = store.dialect().decode_geometry_envelope(value)? {
                        envelopes.push(Self::tag(envelope, attr.srid));
                    }
                }
            }
            return Self::merge(store, envelopes);
        }

        // 3. Scan
        debug!(type_name = %query.type_name, "computing bounds by scan");
        let mut scan = query.clone();
        scan.properties = Some(geometries.iter().map(|a| a.name.clone()).collect());
        let mut envelopes = Vec::new();
        for feature in Self::features(store, &scan, tx)? {
            let feature = feature?;
            for attr in &geometries {
                if let Some(geometry) = feature.get(&attr.name).and_then(Value::as_geometry) {
                    let envelope = geometry.envelope();
                    if !envelope.is_null() {
                        envelopes.push(Self::tag(envelope, geometry.srid.or(attr.srid)));
                    }
                }
            }
        }
        Self::merge(store, envelopes)
    }

    /// All-or-nothing: one column without statistics means the SQL path
    fn estimated_bounds(
        store: &DataStore,
        source: &TableSource,
        geometries: &[&AttributeDescriptor],
        tx: &Transaction,
    ) -> Result<Option<Envelope>, StoreError> {
        let mut lease = store.connector().acquire(tx)?;
        let database_schema = store.config().database_schema.as_deref();
        let estimates = lease.with(|conn| {
            let mut estimates = Vec::with_capacity(geometries.len());
            for attr in geometries {
                match store.dialect().estimated_extent(conn, database_schema, source.type_name(), &attr.name) {
                    Ok(Some(envelope)) => estimates.push(Self::tag(envelope, attr.srid)),
                    Ok(None) => return None,
                    Err(e) => {
                        warn!(column = %attr.name, error = %e, "extent estimate failed");
                        return None;
                    }
                }
            }
            Some(estimates)
        });
        lease.release();
        estimates.map(|e| Self::merge(store, e)).transpose()
    }

    fn tag(envelope: Envelope, srid: Option<i32>) -> Envelope {
        if envelope.srid.is_some() {
            envelope
        } else {
            envelope.with_srid(srid)
        }
    }

    fn merge(store: &DataStore, envelopes: Vec<Envelope>) -> Result<Envelope, StoreError> {
        let mut merged = Envelope::null();
        let mut target: Option<i32> = None;
        for envelope in envelopes {
            if envelope.is_null() {
                continue;
            }
            if merged.is_null() {
                target = envelope.srid;
                merged = envelope;
                continue;
            }
            let envelope = match (target, envelope.srid) {
                (Some(to), Some(from)) if to != from => {
                    let transform = store.transform().ok_or_else(|| {
                        StoreError::Reprojection(format!("no coordinate transform for EPSG:{from} -> EPSG:{to}"))
                    })?;
                    transform.transform(&envelope, to)?
                }
                _ => envelope,
            };
            merged.merge(&envelope);
        }
        Ok(merged.with_srid(target))
    }

    /// Ids of the features `filter` matches
    pub fn matching_ids(
        store: &DataStore,
        type_name: &str,
        filter: &Filter,
        tx: &Transaction,
    ) -> Result<Vec<String>, StoreError> {
        let query = Query::new(type_name).with_filter(filter.clone()).with_properties(std::iter::empty::<String>());
        Self::features(store, &query, tx)?.map(|f| f.map(|f| f.id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::backend::recording::TableMeta;
    use crate::backend::{ColumnMetadata, RecordingBackend, ResultRows};
    use crate::config::StoreConfig;
    use crate::core::{DataType, SqlType};
    use crate::dialect::{GenericDialect, MySqlDialect};
    use crate::filter::CompareOp;

    fn column(name: &str, type_name: &str, sql_type: SqlType) -> ColumnMetadata {
        ColumnMetadata {
            name: name.to_string(),
            sql_type,
            type_name: type_name.to_string(),
            nullable: name != "id",
        }
    }

    fn backend() -> RecordingBackend {
        let backend = RecordingBackend::new();
        backend.add_table(
            "roads",
            TableMeta {
                columns: vec![
                    column("id", "integer", SqlType::Integer),
                    column("name", "varchar", SqlType::Varchar),
                    column("lanes", "integer", SqlType::Integer),
                ],
                primary_keys: vec!["id".to_string()],
                ..TableMeta::default()
            },
        );
        backend
    }

    fn rows(count: i64) -> ResultRows {
        (0..count).fold(ResultRows::new(["id", "name", "lanes"]), |rows, i| {
            rows.row(vec![Value::Integer(i), Value::Text(format!("r{i}")), Value::Integer(i % 3)])
        })
    }

    #[test]
    fn test_paging_falls_back_to_memory() {
        let backend = backend();
        backend.on_query("FROM \"roads\"", rows(10));
        let store = DataStore::new(Arc::new(GenericDialect::new()), Arc::new(backend.clone()), StoreConfig::default());
        let query = Query::new("roads").with_offset(2).with_limit(3);
        let ids: Vec<String> = store
            .features(&query, &Transaction::auto_commit())
            .unwrap()
            .map(|f| f.unwrap().id)
            .collect();
        assert_eq!(ids, vec!["roads.2", "roads.3", "roads.4"]);
        let select = backend.statements().into_iter().find(|s| s.contains("\"lanes\"")).unwrap();
        assert!(!select.contains("LIMIT"));
    }

    #[test]
    fn test_native_paging_adds_natural_order() {
        let backend = backend();
        let store = DataStore::new(Arc::new(MySqlDialect::new()), Arc::new(backend.clone()), StoreConfig::default());
        let query = Query::new("roads").with_offset(2).with_limit(3);
        assert_eq!(store.features(&query, &Transaction::auto_commit()).unwrap().count(), 0);
        let select = backend.statements().into_iter().find(|s| s.contains("`lanes`")).unwrap();
        assert!(select.contains("ORDER BY `id` ASC"));
        assert!(select.ends_with("LIMIT 2, 3"));
    }

    #[test]
    fn test_count_applies_paging_arithmetic() {
        let backend = backend();
        backend.on_query("SELECT COUNT(*)", ResultRows::new(["count"]).row(vec![Value::Integer(10)]));
        let store = DataStore::new(Arc::new(GenericDialect::new()), Arc::new(backend), StoreConfig::default());
        let tx = Transaction::auto_commit();
        assert_eq!(store.count(&Query::new("roads"), &tx).unwrap(), 10);
        assert_eq!(store.count(&Query::new("roads").with_offset(8).with_limit(5), &tx).unwrap(), 2);
    }

    #[test]
    fn test_scan_aggregate_without_function() {
        let backend = backend();
        backend.on_query("FROM \"roads\"", rows(6));
        let store = DataStore::new(Arc::new(GenericDialect::new()), Arc::new(backend), StoreConfig::default());
        let request = AggregateRequest::of(AggregateKind::StandardDeviation, "lanes");
        let value = store.aggregate(&Query::new("roads"), &request, &Transaction::auto_commit()).unwrap();
        assert!(matches!(value, AggregateValue::Scalar(Value::Real(_))));
    }

    #[test]
    fn test_shape_fetches_post_filter_properties() {
        let full = Arc::new(FeatureSchema::new(
            "roads",
            vec![
                AttributeDescriptor::new("name", DataType::Text),
                AttributeDescriptor::new("lanes", DataType::Integer),
            ],
        ));
        let key = PrimaryKey::null("roads");
        let names = vec!["name".to_string()];
        let (returned, fetched) =
            QueryExecutor::shape(&full, &key, false, Some(&names), &["lanes".to_string()]).unwrap();
        assert_eq!(returned.attributes.len(), 1);
        assert_eq!(fetched.attributes.len(), 2);
        let (returned, fetched) = QueryExecutor::shape(&full, &key, false, Some(&names), &[]).unwrap();
        assert!(Arc::ptr_eq(&returned, &fetched));
        let filter = Filter::compare(CompareOp::Gt, "lanes", Value::Integer(1));
        assert_eq!(filter.property_names(), vec!["lanes".to_string()]);
    }
}

/// Data store facade
///
/// Owns the dialect, the connection source, the primary-key and schema
/// caches, the virtual table registry, feature locks and event listeners.
/// Query and mutation paths live in `QueryExecutor` and `DmlExecutor`; this
/// type resolves what they operate on.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use chrono::Duration;
use tracing::{debug, warn};
use crate::backend::{fetch_all, Connection, ConnectionProvider};
use crate::config::StoreConfig;
use crate::core::{
    AttributeDescriptor, CoordinateTransform, DataType, DriverError, Envelope, Feature, FeatureSchema, SqlType, StoreError,
    Value,
};
use crate::dialect::{dialect_by_name, Dialect};
use crate::filter::Filter;
use crate::primary_key::{decode_fid, KeyedCache, PrimaryKey, PrimaryKeyCache, PrimaryKeyResolver};
use crate::sql::{AggregateRequest, AggregateValue, Query, SqlStatement, StatementBuilder, TableSource, VirtualTable};
use crate::transaction::{FeatureLock, LockManager, Transaction, TransactionManager};
use super::connection::{Connector, Lease, SessionHooks};
use super::dml::DmlExecutor;
use super::events::{EventBus, FeatureEventSink};
use super::post::FeatureStream;
use super::queries::QueryExecutor;
use super::writer::{InsertWriter, UpdateWriter};

pub struct DataStore {
    dialect: Arc<dyn Dialect>,
    connector: Connector,
    config: StoreConfig,
    resolver: PrimaryKeyResolver,
    keys: PrimaryKeyCache,
    /// (type name, keys exposed) -> schema
    schemas: KeyedCache<(String, bool), Arc<FeatureSchema>>,
    virtual_tables: RwLock<HashMap<String, Arc<VirtualTable>>>,
    locks: LockManager,
    events: EventBus,
    transform: Option<Arc<dyn CoordinateTransform>>,
    transactions: TransactionManager,
}

impl DataStore {
    pub fn new(dialect: Arc<dyn Dialect>, provider: Arc<dyn ConnectionProvider>, config: StoreConfig) -> Self {
        let hooks = SessionHooks::new(config.session_startup_sql.clone(), config.session_close_sql.clone());
        let resolver = PrimaryKeyResolver::new(
            Arc::clone(&dialect),
            config.database_schema.clone(),
            config.primary_key_metadata_table.clone(),
        );
        debug!(dialect = dialect.name(), schema = ?config.database_schema, "opening data store");
        Self {
            dialect,
            connector: Connector::new(provider, hooks),
            config,
            resolver,
            keys: PrimaryKeyCache::new(),
            schemas: KeyedCache::new(),
            virtual_tables: RwLock::new(HashMap::new()),
            locks: LockManager::new(),
            events: EventBus::default(),
            transform: None,
            transactions: TransactionManager::new(),
        }
    }

    /// Store over the dialect registered under `dialect_name`
    pub fn open(
        dialect_name: &str,
        provider: Arc<dyn ConnectionProvider>,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        Ok(Self::new(dialect_by_name(dialect_name)?, provider, config))
    }

    #[must_use]
    pub fn with_coordinate_transform(mut self, transform: Arc<dyn CoordinateTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    #[must_use]
    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Starts an explicit transaction
    #[must_use]
    pub fn begin(&self) -> Transaction {
        self.transactions.begin()
    }

    pub fn subscribe(&self, sink: Arc<dyn FeatureEventSink>) {
        self.events.subscribe(sink);
    }

    pub(crate) const fn connector(&self) -> &Connector {
        &self.connector
    }

    pub(crate) const fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) const fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub(crate) fn transform(&self) -> Option<&dyn CoordinateTransform> {
        self.transform.as_deref()
    }

    pub(crate) fn builder(&self) -> StatementBuilder<'_> {
        StatementBuilder::new(self.dialect.as_ref(), self.config.database_schema.as_deref())
    }

    pub(crate) fn expose_keys(&self, query: &Query) -> bool {
        query.hints.expose_primary_keys.unwrap_or(self.config.expose_primary_keys)
    }

    pub(crate) fn two_valued(&self, query: &Query) -> bool {
        query.hints.two_valued_logic.unwrap_or(self.config.two_valued_logic)
    }

    // Virtual tables

    /// Registers `vt` under its name, replacing any previous definition
    pub fn register_virtual_table(&self, vt: VirtualTable) -> Result<(), StoreError> {
        let placeholders = vt.where_placeholder_count();
        if placeholders > 1 {
            return Err(StoreError::VirtualTable(format!(
                "virtual table '{}' has {placeholders} where-clause placeholders",
                vt.name
            )));
        }
        let name = vt.name.clone();
        self.virtual_tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::new(vt));
        self.invalidate(&name);
        debug!(name = %name, "registered virtual table");
        Ok(())
    }

    pub fn remove_virtual_table(&self, name: &str) -> Option<Arc<VirtualTable>> {
        let removed = self
            .virtual_tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        self.invalidate(name);
        removed
    }

    #[must_use]
    pub fn virtual_table(&self, name: &str) -> Option<Arc<VirtualTable>> {
        self.virtual_tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    // Schema

    /// Schema of `type_name` with the store's key exposure default
    pub fn schema(&self, type_name: &str) -> Result<Arc<FeatureSchema>, StoreError> {
        self.schema_for(
            type_name,
            self.config.expose_primary_keys,
            &Transaction::auto_commit(),
            &HashMap::new(),
        )
    }

    /// Schema with exposed key columns first when `expose` is set. Cached per
    /// (type, exposure); virtual table parameters only matter on a miss.
    pub fn schema_for(
        &self,
        type_name: &str,
        expose: bool,
        tx: &Transaction,
        parameters: &HashMap<String, String>,
    ) -> Result<Arc<FeatureSchema>, StoreError> {
        self.schemas
            .get_or_try_insert_with(&(type_name.to_string(), expose), || {
                let key = self.primary_key(type_name, tx)?;
                let columns = match self.virtual_table(type_name) {
                    Some(vt) => self.describe_virtual_table(&vt, tx, parameters)?,
                    None => self.describe_table(type_name, tx)?,
                };
                let mut attributes = Vec::with_capacity(columns.len());
                if expose {
                    for column in &key.columns {
                        let attr = columns
                            .iter()
                            .find(|a| a.name == column.name)
                            .cloned()
                            .unwrap_or_else(|| AttributeDescriptor::new(column.name.clone(), column.data_type.clone()));
                        attributes.push(attr.not_null());
                    }
                }
                attributes.extend(columns.into_iter().filter(|a| !key.contains(&a.name)));
                debug!(type_name, expose, attributes = attributes.len(), "built feature schema");
                Ok(Arc::new(FeatureSchema::new(type_name, attributes)))
            })
    }

    fn describe_table(&self, table: &str, tx: &Transaction) -> Result<Vec<AttributeDescriptor>, StoreError> {
        let mut lease = self.connector.acquire(tx)?;
        let result = lease.with(|conn| self.describe_columns(conn, table));
        lease.release();
        result
    }

    fn describe_columns(&self, conn: &mut dyn Connection, table: &str) -> Result<Vec<AttributeDescriptor>, StoreError> {
        let database_schema = self.config.database_schema.as_deref();
        let columns = conn.columns(database_schema, table)?;
        if columns.is_empty() {
            return Err(StoreError::SchemaNotFound(table.to_string()));
        }
        let mappings = self.dialect.type_mappings();
        let mut attributes = Vec::with_capacity(columns.len());
        for column in columns {
            let data_type = mappings.class_for_column(&column.type_name, column.sql_type);
            let mut attr = AttributeDescriptor::new(column.name.clone(), data_type)
                .with_native_type(column.type_name.clone(), column.sql_type);
            if !column.nullable {
                attr = attr.not_null();
            }
            if attr.is_geometry() {
                match self.dialect.geometry_column_info(conn, database_schema, table, &column.name) {
                    Ok(Some(info)) => {
                        attr.data_type = DataType::Geometry(info.kind);
                        attr.srid = info.srid;
                        attr.native_srid = info.srid;
                        attr.coordinate_dimension = Some(info.dimension);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(table, column = %column.name, error = %e, "geometry metadata lookup failed"),
                }
            }
            attributes.push(attr);
        }
        Ok(attributes)
    }

    /// Column names come from an empty probe query; geometry metadata only
    /// from the declaration
    fn describe_virtual_table(
        &self,
        vt: &VirtualTable,
        tx: &Transaction,
        parameters: &HashMap<String, String>,
    ) -> Result<Vec<AttributeDescriptor>, StoreError> {
        let sql = vt.expand(parameters, None)?;
        let probe = format!("SELECT * FROM ({sql}) vtable WHERE 1 = 0");
        debug!(sql = %probe, "probing virtual table columns");
        let mut lease = self.connector.acquire(tx)?;
        let columns = lease.with(|conn| -> Result<Vec<(String, Option<(SqlType, String)>)>, DriverError> {
            let mut stmt = conn.prepare(&probe)?;
            let columns = stmt.query(&[]).map(|mut rs| {
                let columns: Vec<_> = (0..rs.column_count())
                    .filter_map(|i| {
                        let name = rs.column_name(i)?.to_string();
                        let native = rs.column_type(i).map(|(code, type_name)| (code, type_name.to_string()));
                        Some((name, native))
                    })
                    .collect();
                if let Err(e) = rs.close() {
                    warn!(error = %e, "failed to close result set");
                }
                columns
            });
            if let Err(e) = stmt.close() {
                warn!(error = %e, "failed to close statement");
            }
            columns
        });
        lease.release();
        let columns = columns?;
        if columns.is_empty() {
            return Err(StoreError::VirtualTable(format!("virtual table '{}' returned no columns", vt.name)));
        }
        let mappings = self.dialect.type_mappings();
        Ok(columns
            .into_iter()
            .map(|(name, native)| match (vt.geometries.get(&name), native) {
                (Some(g), _) => {
                    let mut attr = AttributeDescriptor::geometry(name, g.kind, g.srid).with_dimension(g.dimension);
                    attr.native_srid = g.srid;
                    attr
                }
                (None, Some((code, type_name))) => {
                    let data_type = mappings.class_for_column(&type_name, code);
                    AttributeDescriptor::new(name, data_type).with_native_type(type_name, code)
                }
                (None, None) => AttributeDescriptor::new(name, DataType::Unknown),
            })
            .collect())
    }

    /// Emits CREATE TABLE plus the dialect's follow-up statements
    pub fn create_schema(
        &self,
        schema: &FeatureSchema,
        key: Option<&PrimaryKey>,
        tx: &Transaction,
    ) -> Result<(), StoreError> {
        if self.virtual_table(&schema.name).is_some() {
            return Err(StoreError::Unsupported(format!("'{}' is a virtual table", schema.name)));
        }
        let statements = self.builder().create_table(schema, key);
        let mut lease = self.connector.acquire(tx)?;
        let mut result = Ok(());
        for sql in &statements {
            if let Err(e) = run_statement(&mut lease, self.dialect.as_ref(), &SqlStatement::new(sql.clone())) {
                result = Err(e);
                break;
            }
        }
        lease.release();
        self.invalidate(&schema.name);
        result
    }

    pub fn remove_schema(&self, type_name: &str, tx: &Transaction) -> Result<(), StoreError> {
        if self.virtual_table(type_name).is_some() {
            return Err(StoreError::Unsupported(format!("'{type_name}' is a virtual table")));
        }
        let sql = self.builder().drop_table(type_name);
        let mut lease = self.connector.acquire(tx)?;
        let result = run_statement(&mut lease, self.dialect.as_ref(), &SqlStatement::new(sql));
        lease.release();
        self.invalidate(type_name);
        result.map(|_| ())
    }

    /// Drops cached key and schemas of `type_name` only
    pub fn invalidate(&self, type_name: &str) {
        self.keys.invalidate(&type_name.to_string());
        self.schemas.invalidate_where(|(name, _)| name == type_name);
    }

    // Primary keys

    pub fn primary_key(&self, type_name: &str, tx: &Transaction) -> Result<Arc<PrimaryKey>, StoreError> {
        self.keys.get_or_try_insert_with(&type_name.to_string(), || {
            let vt = self.virtual_table(type_name);
            let mut lease = self.connector.acquire(tx)?;
            let key = lease.with(|conn| self.resolver.resolve(conn, type_name, vt.as_deref()));
            lease.release();
            key.map(Arc::new)
        })
    }

    /// Key column values encoded in `fid`, typed per the key
    pub fn decode_fid(&self, type_name: &str, fid: &str, tx: &Transaction) -> Result<Vec<Value>, StoreError> {
        let key = self.primary_key(type_name, tx)?;
        decode_fid(type_name, &key, fid, true)
    }

    /// The table (or virtual table) behind `type_name` with its non-key
    /// attributes
    pub(crate) fn source(
        &self,
        type_name: &str,
        tx: &Transaction,
        parameters: &HashMap<String, String>,
    ) -> Result<TableSource, StoreError> {
        let schema = self.schema_for(type_name, false, tx, parameters)?;
        let key = self.primary_key(type_name, tx)?;
        let source = TableSource::new(schema, key);
        Ok(match self.virtual_table(type_name) {
            Some(vt) => source.with_virtual_table(vt),
            None => source,
        })
    }

    // Reads

    pub fn features(&self, query: &Query, tx: &Transaction) -> Result<FeatureStream, StoreError> {
        QueryExecutor::features(self, query, tx)
    }

    pub fn count(&self, query: &Query, tx: &Transaction) -> Result<u64, StoreError> {
        QueryExecutor::count(self, query, tx)
    }

    pub fn bounds(&self, query: &Query, tx: &Transaction) -> Result<Envelope, StoreError> {
        QueryExecutor::bounds(self, query, tx)
    }

    pub fn aggregate(
        &self,
        query: &Query,
        request: &AggregateRequest,
        tx: &Transaction,
    ) -> Result<AggregateValue, StoreError> {
        QueryExecutor::aggregate(self, query, request, tx)
    }

    // Writes

    /// Inserts `features`, writing the assigned ids back into them
    pub fn insert(&self, type_name: &str, features: &mut [Feature], tx: &Transaction) -> Result<Vec<String>, StoreError> {
        DmlExecutor::insert(self, type_name, features, tx)
    }

    pub fn update(
        &self,
        type_name: &str,
        names: &[&str],
        values: &[Value],
        filter: &Filter,
        tx: &Transaction,
    ) -> Result<u64, StoreError> {
        DmlExecutor::update(self, type_name, names, values, filter, tx)
    }

    pub fn delete(&self, type_name: &str, filter: &Filter, tx: &Transaction) -> Result<u64, StoreError> {
        DmlExecutor::delete(self, type_name, filter, tx)
    }

    /// Buffered inserts flushed every `batch_insert_size` rows
    pub fn insert_writer<'s>(&'s self, type_name: &str, tx: &'s Transaction) -> Result<InsertWriter<'s>, StoreError> {
        InsertWriter::open(self, type_name, tx)
    }

    /// Read-modify-write over the features `query` matches
    pub fn update_writer<'s>(&'s self, query: &Query, tx: &'s Transaction) -> Result<UpdateWriter<'s>, StoreError> {
        UpdateWriter::open(self, query, tx)
    }

    // Locks

    /// Locks every feature `filter` matches; `tx` receives the authorization
    pub fn lock_features(
        &self,
        type_name: &str,
        filter: &Filter,
        lock: &FeatureLock,
        tx: &Transaction,
    ) -> Result<usize, StoreError> {
        let ids = QueryExecutor::matching_ids(self, type_name, filter, tx)?;
        let locked = self.locks.lock_all(type_name, &ids, lock)?;
        tx.add_authorization(lock.authorization.clone());
        Ok(locked)
    }

    pub fn unlock(&self, authorization: &str) -> usize {
        self.locks.unlock(authorization)
    }

    pub fn refresh_locks(&self, authorization: &str, duration: Duration) -> usize {
        self.locks.refresh(authorization, duration)
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("dialect", &self.dialect.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Runs an update-style statement on `lease`, returning the affected rows
pub(crate) fn run_statement(lease: &mut Lease, dialect: &dyn Dialect, statement: &SqlStatement) -> Result<u64, StoreError> {
    let params = statement.params(dialect);
    debug!(sql = %statement.sql, "executing statement");
    tracing::trace!(?params, "statement parameters");
    let count = lease.with(|conn| -> Result<u64, DriverError> {
        let mut stmt = conn.prepare(&statement.sql)?;
        let result = stmt.execute(&params);
        if let Err(e) = stmt.close() {
            warn!(error = %e, "failed to close statement");
        }
        result
    })?;
    Ok(count)
}

/// Runs a query on `lease` and collects `columns` values per row
pub(crate) fn run_query(
    lease: &mut Lease,
    dialect: &dyn Dialect,
    statement: &SqlStatement,
    columns: usize,
) -> Result<Vec<Vec<Value>>, StoreError> {
    let params = statement.params(dialect);
    debug!(sql = %statement.sql, "executing query");
    tracing::trace!(?params, "query parameters");
    Ok(lease.with(|conn| fetch_all(conn, &statement.sql, &params, columns))?)
}

// End-to-end behaviour of DataStore against the recording backend
use std::sync::{Arc, Mutex};
use chrono::Duration;
use sqlstore::backend::recording::{Call, TableMeta};
use sqlstore::backend::{BatchOutcome, ColumnMetadata, RecordingBackend, ResultRows};
use sqlstore::core::SqlType;
use sqlstore::dialect::{GenericDialect, PostgisDialect};
use sqlstore::sql::{VirtualTableParameter, WHERE_PLACEHOLDER};
use sqlstore::{
    parse_filter, DataStore, Feature, FeatureEvent, FeatureEventSink, FeatureLock, Filter, Query, StoreConfig,
    StoreError, Transaction, Value, VirtualTable,
};

fn column(name: &str, type_name: &str, sql_type: SqlType) -> ColumnMetadata {
    let column = ColumnMetadata::new(name, sql_type, type_name);
    if name == "id" { column.not_null() } else { column }
}

fn roads_backend() -> RecordingBackend {
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

fn road_rows(ids: &[i64]) -> ResultRows {
    ids.iter().fold(ResultRows::new(["id", "name", "lanes"]), |rows, i| {
        rows.row(vec![Value::Integer(*i), Value::Text(format!("road {i}")), Value::Integer(2)])
    })
}

fn store(backend: &RecordingBackend) -> DataStore {
    DataStore::new(Arc::new(GenericDialect::new()), Arc::new(backend.clone()), StoreConfig::default())
}

fn selects(backend: &RecordingBackend) -> Vec<String> {
    backend
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("SELECT") && !s.contains("1 = 0"))
        .collect()
}

#[derive(Default)]
struct Collector {
    events: Mutex<Vec<FeatureEvent>>,
}

impl FeatureEventSink for Collector {
    fn on_event(&self, event: &FeatureEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[test]
fn test_features_decode_ids_from_key() {
    let backend = roads_backend();
    backend.on_query("FROM \"roads\"", road_rows(&[7, 8]));
    let store = store(&backend);
    let features = store
        .features(&Query::new("roads"), &Transaction::auto_commit())
        .unwrap()
        .into_vec()
        .unwrap();
    let ids: Vec<&str> = features.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, vec!["roads.7", "roads.8"]);
    // key columns are hidden unless exposed
    assert!(features[0].get("id").is_none());
    assert_eq!(features[0].get("name"), Some(&Value::Text("road 7".to_string())));
    assert_eq!(backend.open_connections(), 0);
    assert_eq!(backend.open_cursors(), 0);
}

#[test]
fn test_exposed_key_is_an_attribute() {
    let backend = roads_backend();
    backend.on_query("FROM \"roads\"", road_rows(&[3]));
    let store = DataStore::new(
        Arc::new(GenericDialect::new()),
        Arc::new(backend.clone()),
        StoreConfig::default().with_expose_primary_keys(true),
    );
    let schema = store.schema("roads").unwrap();
    assert_eq!(schema.attributes[0].name, "id");
    assert!(!schema.attributes[0].nullable);
    let feature = store
        .features(&Query::new("roads"), &Transaction::auto_commit())
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(feature.id, "roads.3");
    assert_eq!(feature.get("id"), Some(&Value::Integer(3)));
}

#[test]
fn test_null_guard_reaches_sql() {
    let backend = roads_backend();
    let store = store(&backend);
    let query = Query::new("roads").with_filter(parse_filter("lanes <> 5").unwrap());
    store.features(&query, &Transaction::auto_commit()).unwrap().close();
    let select = selects(&backend).pop().unwrap();
    assert!(select.contains("NOT (\"lanes\" IS NULL)"), "{select}");
}

#[test]
fn test_two_valued_logic_can_be_disabled() {
    let backend = roads_backend();
    let store = DataStore::new(
        Arc::new(GenericDialect::new()),
        Arc::new(backend.clone()),
        StoreConfig::default().with_two_valued_logic(false),
    );
    let query = Query::new("roads").with_filter(parse_filter("lanes <> 5").unwrap());
    store.features(&query, &Transaction::auto_commit()).unwrap().close();
    let select = selects(&backend).pop().unwrap();
    assert!(!select.contains("IS NULL"), "{select}");
}

#[test]
fn test_memory_paging_after_sql_sort() {
    let backend = roads_backend();
    backend.on_query("FROM \"roads\"", road_rows(&[5, 4, 3, 2, 1]));
    let store = store(&backend);
    let query = Query::new("roads")
        .sort_by(sqlstore::SortBy::desc("name"))
        .with_offset(1)
        .with_limit(2);
    let ids: Vec<String> = store
        .features(&query, &Transaction::auto_commit())
        .unwrap()
        .map(|f| f.unwrap().id)
        .collect();
    assert_eq!(ids, vec!["roads.4", "roads.3"]);
    let select = selects(&backend).pop().unwrap();
    assert!(select.ends_with("ORDER BY \"name\" DESC"), "{select}");
}

#[test]
fn test_insert_assigns_max_plus_one() {
    let backend = roads_backend();
    backend.on_query("SELECT MAX(", ResultRows::new(["max"]).row(vec![Value::Integer(41)]));
    let store = store(&backend);
    let sink = Arc::new(Collector::default());
    store.subscribe(sink.clone());

    let schema = store.schema("roads").unwrap();
    let mut features: Vec<Feature> = ["a", "b"]
        .iter()
        .map(|name| {
            let mut f = Feature::empty(Arc::clone(&schema));
            f.set("name", Value::Text((*name).to_string())).unwrap();
            f
        })
        .collect();
    let ids = store.insert("roads", &mut features, &Transaction::auto_commit()).unwrap();
    assert_eq!(ids, vec!["roads.42", "roads.43"]);
    assert_eq!(features[1].id, "roads.43");

    let inserts: Vec<String> = backend.statements().into_iter().filter(|s| s.starts_with("INSERT")).collect();
    assert_eq!(inserts.len(), 2);
    assert!(inserts[0].starts_with("INSERT INTO \"roads\" (\"id\", \"name\", \"lanes\") VALUES (42"), "{}", inserts[0]);

    let events = sink.events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            FeatureEvent::Added { type_name: "roads".to_string(), id: "roads.42".to_string() },
            FeatureEvent::Added { type_name: "roads".to_string(), id: "roads.43".to_string() },
        ]
    );
}

#[test]
fn test_provided_id_is_decoded_strictly() {
    let backend = roads_backend();
    let store = store(&backend);
    let schema = store.schema("roads").unwrap();
    let mut feature = Feature::empty(schema);
    feature.id = "roads.not-a-number".to_string();
    feature.use_provided_id = true;
    let err = store.insert("roads", &mut [feature], &Transaction::auto_commit()).unwrap_err();
    assert!(matches!(err, StoreError::InvalidFeatureId(_)));
}

fn postgis_store(backend: &RecordingBackend) -> DataStore {
    backend.on_query("WHERE 1 = 0", ResultRows::new(["id"]).auto_increment("id"));
    DataStore::new(Arc::new(PostgisDialect::new()), Arc::new(backend.clone()), StoreConfig::default())
}

fn new_roads(store: &DataStore, count: usize) -> Vec<Feature> {
    let schema = store.schema("roads").unwrap();
    (0..count).map(|_| Feature::empty(Arc::clone(&schema))).collect()
}

#[test]
fn test_batch_insert_reads_generated_keys() {
    let backend = roads_backend();
    backend.on_generated_keys("INSERT INTO", vec![vec![Value::Integer(10)], vec![Value::Integer(11)]]);
    let store = postgis_store(&backend);
    let mut features = new_roads(&store, 2);
    let ids = store.insert("roads", &mut features, &Transaction::auto_commit()).unwrap();
    assert_eq!(ids, vec!["roads.10", "roads.11"]);

    let calls = backend.calls();
    let batch = calls.iter().find(|c| matches!(c, Call::Batch { .. })).unwrap();
    match batch {
        Call::Batch { sql, rows } => {
            assert!(!sql.contains("\"id\""), "{sql}");
            assert_eq!(rows.len(), 2);
        }
        _ => unreachable!(),
    }
}

#[test]
fn test_batch_insert_failed_row() {
    let backend = roads_backend();
    let mut outcomes = vec![BatchOutcome::Count(1); 4];
    outcomes.push(BatchOutcome::Failed);
    backend.on_batch("INSERT INTO", outcomes);
    let store = postgis_store(&backend);
    let mut features = new_roads(&store, 5);
    let err = store.insert("roads", &mut features, &Transaction::auto_commit()).unwrap_err();
    assert!(matches!(err, StoreError::Insertion(_)));
}

#[test]
fn test_batch_insert_without_counts() {
    let backend = roads_backend();
    backend.on_batch("INSERT INTO", vec![BatchOutcome::SuccessNoInfo; 3]);
    let store = postgis_store(&backend);
    let mut features = new_roads(&store, 3);
    assert_eq!(store.insert("roads", &mut features, &Transaction::auto_commit()).unwrap().len(), 3);
}

#[test]
fn test_empty_flush_runs_nothing() {
    let backend = roads_backend();
    let store = store(&backend);
    let tx = Transaction::auto_commit();
    let mut writer = store.insert_writer("roads", &tx).unwrap();
    backend.clear_calls();
    assert!(writer.flush().unwrap().is_empty());
    assert!(writer.close().unwrap().is_empty());
    assert!(backend.calls().is_empty());
}

#[test]
fn test_insert_writer_batches() {
    let backend = roads_backend();
    backend.on_query("SELECT MAX(", ResultRows::new(["max"]).row(vec![Value::Integer(0)]));
    let store = DataStore::new(
        Arc::new(GenericDialect::new()),
        Arc::new(backend.clone()),
        StoreConfig::default().with_batch_insert_size(2),
    );
    let tx = Transaction::auto_commit();
    let mut writer = store.insert_writer("roads", &tx).unwrap();
    assert!(writer.write(writer.new_feature()).unwrap().is_empty());
    assert_eq!(writer.pending(), 1);
    assert_eq!(writer.write(writer.new_feature()).unwrap().len(), 2);
    writer.write(writer.new_feature()).unwrap();
    let ids = writer.close().unwrap();
    assert_eq!(ids, vec!["roads.1", "roads.2", "roads.1"]);
}

#[test]
fn test_dropped_insert_writer_flushes() {
    let backend = roads_backend();
    backend.on_query("SELECT MAX(", ResultRows::new(["max"]).row(vec![Value::Integer(9)]));
    let store = DataStore::new(
        Arc::new(GenericDialect::new()),
        Arc::new(backend.clone()),
        StoreConfig::default().with_batch_insert_size(10),
    );
    let sink = Arc::new(Collector::default());
    store.subscribe(sink.clone());
    let tx = Transaction::auto_commit();
    {
        let mut writer = store.insert_writer("roads", &tx).unwrap();
        writer.write(writer.new_feature()).unwrap();
        writer.write(writer.new_feature()).unwrap();
        assert_eq!(writer.pending(), 2);
    }
    let inserts = backend.statements().into_iter().filter(|s| s.starts_with("INSERT")).count();
    assert_eq!(inserts, 2);
    assert_eq!(sink.events.lock().unwrap().len(), 2);
}

#[test]
fn test_key_only_update_is_illegal() {
    let backend = roads_backend();
    let store = store(&backend);
    let tx = Transaction::auto_commit();
    let err = store
        .update("roads", &["id"], &[Value::Integer(3)], &Filter::Include, &tx)
        .unwrap_err();
    assert!(matches!(err, StoreError::IllegalUpdate(_)));
    let err = store
        .update("roads", &["width"], &[Value::Integer(3)], &Filter::Include, &tx)
        .unwrap_err();
    assert!(matches!(err, StoreError::AttributeNotFound(_)));
}

#[test]
fn test_update_and_delete_publish_events() {
    let backend = roads_backend();
    let store = store(&backend);
    let sink = Arc::new(Collector::default());
    store.subscribe(sink.clone());
    let tx = Transaction::auto_commit();
    let filter = parse_filter("lanes = 2").unwrap();
    store.update("roads", &["name"], &[Value::Text("main".to_string())], &filter, &tx).unwrap();
    store.delete("roads", &filter, &tx).unwrap();

    let statements = backend.statements();
    assert!(statements.iter().any(|s| s.starts_with("UPDATE \"roads\" SET \"name\" = 'main'")));
    assert!(statements.iter().any(|s| s.starts_with("DELETE FROM \"roads\"")));
    let events = sink.events.lock().unwrap();
    assert!(matches!(&events[0], FeatureEvent::Modified { type_name, .. } if type_name == "roads"));
    assert!(matches!(&events[1], FeatureEvent::Removed { type_name, .. } if type_name == "roads"));
}

#[test]
fn test_update_writer_writes_dirty_attributes() {
    let backend = roads_backend();
    backend.on_query("FROM \"roads\"", road_rows(&[1, 2]));
    let store = store(&backend);
    let tx = Transaction::auto_commit();
    let mut writer = store.update_writer(&Query::new("roads"), &tx).unwrap();
    let staged = writer.next().unwrap().unwrap();
    staged.set("lanes", Value::Integer(4)).unwrap();
    writer.write().unwrap();
    writer.next().unwrap().unwrap();
    writer.remove().unwrap();
    assert!(writer.next().unwrap().is_none());
    writer.close();

    let statements = backend.statements();
    let update = statements.iter().find(|s| s.starts_with("UPDATE")).unwrap();
    assert_eq!(update, "UPDATE \"roads\" SET \"lanes\" = 4 WHERE ((\"id\" = 1))");
    let delete = statements.iter().find(|s| s.starts_with("DELETE")).unwrap();
    assert_eq!(delete, "DELETE FROM \"roads\" WHERE ((\"id\" = 2))");
}

#[test]
fn test_locked_features_need_authorization() {
    let backend = roads_backend();
    backend.on_query("FROM \"roads\"", road_rows(&[1, 2]));
    let store = store(&backend);
    let holder = store.begin();
    let lock = FeatureLock::new("auth-1", Duration::minutes(5));
    assert_eq!(store.lock_features("roads", &Filter::Include, &lock, &holder).unwrap(), 2);

    let other = Transaction::auto_commit();
    let err = store.delete("roads", &Filter::Include, &other).unwrap_err();
    assert!(matches!(err, StoreError::FeatureLock(_)));

    store.delete("roads", &Filter::Include, &holder).unwrap();
    holder.commit().unwrap();
    holder.close();
    assert_eq!(store.unlock("auth-1"), 0);
}

#[test]
fn test_unlock_frees_features() {
    let backend = roads_backend();
    backend.on_query("FROM \"roads\"", road_rows(&[1]));
    let store = store(&backend);
    let holder = Transaction::auto_commit();
    let lock = FeatureLock::new("auth-2", Duration::minutes(5));
    store.lock_features("roads", &Filter::Include, &lock, &holder).unwrap();
    assert_eq!(store.refresh_locks("auth-2", Duration::minutes(10)), 1);
    assert_eq!(store.unlock("auth-2"), 1);
    let tx = Transaction::auto_commit();
    store.update("roads", &["lanes"], &[Value::Integer(1)], &Filter::Include, &tx).unwrap();
}

#[test]
fn test_explicit_transaction_shares_one_connection() {
    let backend = roads_backend();
    let store = store(&backend);
    store.schema("roads").unwrap();
    store.primary_key("roads", &Transaction::auto_commit()).unwrap();
    backend.clear_calls();

    let tx = store.begin();
    store.count(&Query::new("roads"), &tx).unwrap();
    store.delete("roads", &Filter::Include, &tx).unwrap();
    assert_eq!(backend.open_connections(), 1);
    tx.commit().unwrap();
    tx.close();
    assert_eq!(backend.open_connections(), 0);
    let calls = backend.calls();
    assert_eq!(calls.iter().filter(|c| **c == Call::Connect).count(), 1);
    assert!(calls.contains(&Call::AutoCommit(false)));
    assert!(calls.contains(&Call::Commit));
}

#[test]
fn test_session_hooks_wrap_each_connection() {
    let backend = roads_backend();
    let config = StoreConfig::default().with_session_sql(
        Some("SET search_path TO gis".to_string()),
        Some("RESET search_path".to_string()),
    );
    let store = DataStore::new(Arc::new(GenericDialect::new()), Arc::new(backend.clone()), config);
    store.schema("roads").unwrap();
    store.primary_key("roads", &Transaction::auto_commit()).unwrap();
    backend.clear_calls();

    store.count(&Query::new("roads"), &Transaction::auto_commit()).unwrap();
    let statements = backend.statements();
    assert_eq!(statements.first().map(String::as_str), Some("SET search_path TO gis"));
    assert_eq!(statements.last().map(String::as_str), Some("RESET search_path"));
    assert_eq!(backend.calls().last(), Some(&Call::Close));
}

fn virtual_backend() -> RecordingBackend {
    let backend = roads_backend();
    backend.on_query("WHERE 1 = 0", ResultRows::new(["id", "name"]));
    backend
}

#[test]
fn test_virtual_table_parameters_are_validated() {
    let backend = virtual_backend();
    let store = store(&backend);
    let parameter = VirtualTableParameter::new("min").with_default("1").with_validator("\\d+").unwrap();
    let vt = VirtualTable::new("wide_roads", "SELECT id, name FROM roads WHERE lanes >= %min%")
        .with_parameter(parameter)
        .with_primary_key(["id"]);
    store.register_virtual_table(vt).unwrap();

    let tx = Transaction::auto_commit();
    let query = Query::new("wide_roads").with_parameter("min", "3");
    store.features(&query, &tx).unwrap().close();
    assert!(selects(&backend).iter().any(|s| s.contains("lanes >= 3")));

    let query = Query::new("wide_roads").with_parameter("min", "1; DROP TABLE roads");
    let err = store.features(&query, &tx).map(|_| ()).unwrap_err();
    assert!(matches!(err, StoreError::VirtualTable(_)));
    assert!(!backend.statements().iter().any(|s| s.contains("DROP TABLE")));
}

#[test]
fn test_virtual_table_is_read_only() {
    let backend = virtual_backend();
    let store = store(&backend);
    store
        .register_virtual_table(VirtualTable::new("named", "SELECT id, name FROM roads").with_primary_key(["id"]))
        .unwrap();
    let err = store
        .update("named", &["name"], &[Value::Text("x".to_string())], &Filter::Include, &Transaction::auto_commit())
        .unwrap_err();
    assert!(matches!(err, StoreError::Unsupported(_)));
}

#[test]
fn test_virtual_table_columns_are_typed() {
    let backend = roads_backend();
    backend.on_query(
        "WHERE 1 = 0",
        ResultRows::new(["id", "name", "note"])
            .typed("id", SqlType::Integer, "int4")
            .typed("name", SqlType::Varchar, "varchar"),
    );
    let store = store(&backend);
    store
        .register_virtual_table(VirtualTable::new("typed", "SELECT id, name, note FROM roads").with_primary_key(["id"]))
        .unwrap();
    let schema = store.schema("typed").unwrap();
    assert_eq!(schema.attribute("name").unwrap().data_type, sqlstore::DataType::Text);
    // Columns the driver does not describe stay untyped
    assert_eq!(schema.attribute("note").unwrap().data_type, sqlstore::DataType::Unknown);
}

#[test]
fn test_single_where_placeholder() {
    let backend = virtual_backend();
    let store = store(&backend);
    let sql = format!("SELECT * FROM roads WHERE {WHERE_PLACEHOLDER} AND {WHERE_PLACEHOLDER}");
    let err = store.register_virtual_table(VirtualTable::new("twice", sql)).unwrap_err();
    assert!(matches!(err, StoreError::VirtualTable(_)));
    assert!(store.virtual_table("twice").is_none());
}

#[test]
fn test_unknown_type_has_no_schema() {
    let backend = RecordingBackend::new();
    let store = store(&backend);
    assert!(matches!(store.schema("missing"), Err(StoreError::SchemaNotFound(_))));
}

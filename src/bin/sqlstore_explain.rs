use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use clap::{Parser, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Cell, Table as ComfyTable};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use sqlstore::backend::recording::{Call, TableMeta};
use sqlstore::backend::{ColumnMetadata, RecordingBackend, ResultRows};
use sqlstore::core::{DataType, GeometryKind, StoreError, Value};
use sqlstore::parser::{parse_filter, parse_table_definition, TableDefinition};
use sqlstore::primary_key::{GenerationKind, PrimaryKey, PrimaryKeyColumn};
use sqlstore::sql::{AggregateKind, AggregateRequest, Query, SortBy};
use sqlstore::{dialect_by_name, DataStore, Dialect, StoreConfig, Transaction};

/// Prints the SQL sqlstore would run for a query, without a database
#[derive(Parser, Debug)]
#[command(name = "sqlstore-explain")]
#[command(about = "Dry-run SQL explainer for sqlstore dialects", long_about = None)]
struct Args {
    /// Dialect: postgis, mysql or generic
    #[arg(short = 'd', long, default_value = "postgis")]
    dialect: String,

    /// Feature type, e.g. "roads (fid INTEGER PRIMARY KEY, name VARCHAR, geom LINESTRING SRID 4326)"
    #[arg(short = 't', long)]
    table: String,

    /// CQL-like filter
    #[arg(short = 'f', long, default_value = "")]
    filter: String,

    /// Operation to explain
    #[arg(short = 'o', long, value_enum, default_value_t = Operation::Select)]
    operation: Operation,

    /// Comma separated properties to return
    #[arg(short = 'p', long, value_delimiter = ',')]
    properties: Option<Vec<String>>,

    /// Sort keys as `name` or `name:desc`; repeatable
    #[arg(short = 's', long)]
    sort: Vec<String>,

    #[arg(long, default_value_t = 0)]
    offset: u64,

    #[arg(long)]
    limit: Option<u64>,

    /// Property to aggregate (operation `sum`, `min`, `max`, `avg`, `unique`)
    #[arg(short = 'a', long)]
    attribute: Option<String>,

    /// Store configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Operation {
    Select,
    Count,
    Bounds,
    Sum,
    Min,
    Max,
    Avg,
    Unique,
    Delete,
    Create,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { tracing::Level::DEBUG } else { tracing::Level::WARN };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install log subscriber: {e}");
    }
}

/// Catalog answers for the declared table. The geometry catalog lookup is
/// answered with the first geometry column's declaration.
fn register_table(backend: &RecordingBackend, dialect: &dyn Dialect, def: &TableDefinition) {
    let mappings = dialect.type_mappings();
    let columns = def
        .schema
        .attributes
        .iter()
        .map(|attr| ColumnMetadata {
            name: attr.name.clone(),
            sql_type: mappings.sql_type_for_class(&attr.data_type),
            type_name: if attr.is_geometry() {
                "geometry".to_string()
            } else {
                dialect.sql_type_name(&attr.data_type).to_lowercase()
            },
            nullable: attr.nullable,
        })
        .collect();
    let keys: Vec<String> = def.key_columns.iter().map(|(name, _)| name.clone()).collect();
    backend.add_table(
        &def.schema.name,
        TableMeta {
            columns,
            primary_keys: keys.clone(),
            ..TableMeta::default()
        },
    );

    // Declared integer keys read back as auto-increment
    let mut probe = ResultRows::new(keys.iter().cloned());
    for (name, data_type) in &def.key_columns {
        if matches!(data_type, DataType::Integer | DataType::SmallInt) {
            probe = probe.auto_increment(name);
        }
    }
    backend.on_query("WHERE 1 = 0", probe);

    if let Some(geom) = def.schema.geometry_attributes().next() {
        let kind = match &geom.data_type {
            DataType::Geometry(kind) => *kind,
            _ => GeometryKind::Geometry,
        };
        backend.on_query(
            "FROM geometry_columns",
            ResultRows::new(["type", "srid", "coord_dimension"]).row(vec![
                Value::Text(kind.as_str().to_string()),
                Value::Integer(i64::from(geom.srid.unwrap_or(0))),
                Value::Integer(i64::from(geom.coordinate_dimension.unwrap_or(2))),
            ]),
        );
    }
}

fn parse_sort(text: &str) -> SortBy {
    match text.rsplit_once(':') {
        Some((name, order)) if order.eq_ignore_ascii_case("desc") => SortBy::desc(name),
        Some((name, _)) => SortBy::asc(name),
        None => SortBy::asc(text),
    }
}

fn build_query(args: &Args, type_name: &str) -> Result<Query, StoreError> {
    let mut query = Query::new(type_name).with_filter(parse_filter(&args.filter)?).with_offset(args.offset);
    if let Some(limit) = args.limit {
        query = query.with_limit(limit);
    }
    if let Some(properties) = &args.properties {
        query = query.with_properties(properties.iter().map(|p| p.trim().to_string()));
    }
    for sort in &args.sort {
        query = query.sort_by(parse_sort(sort));
    }
    Ok(query)
}

fn aggregate_kind(operation: Operation) -> Option<AggregateKind> {
    match operation {
        Operation::Sum => Some(AggregateKind::Sum),
        Operation::Min => Some(AggregateKind::Min),
        Operation::Max => Some(AggregateKind::Max),
        Operation::Avg => Some(AggregateKind::Average),
        Operation::Unique => Some(AggregateKind::Unique),
        _ => None,
    }
}

fn explain(args: &Args) -> Result<Vec<Call>, StoreError> {
    let config = StoreConfig::load(args.config.as_deref())?;
    let dialect = dialect_by_name(&args.dialect)?;
    let def = parse_table_definition(&args.table)?;
    let type_name = def.schema.name.clone();

    let backend = RecordingBackend::new();
    let store = DataStore::new(Arc::clone(&dialect), Arc::new(backend.clone()), config);
    let tx = Transaction::auto_commit();

    if args.operation == Operation::Create {
        let key = PrimaryKey::new(
            type_name.clone(),
            def.key_columns
                .iter()
                .map(|(name, data_type)| {
                    PrimaryKeyColumn::new(
                        name.clone(),
                        data_type.clone(),
                        GenerationKind::AutoGenerated,
                    )
                })
                .collect(),
        );
        store.create_schema(&def.schema, Some(&key), &tx)?;
        return Ok(backend.calls());
    }

    register_table(&backend, dialect.as_ref(), &def);
    // Metadata lookups are not part of the explained statement
    store.schema(&type_name)?;
    store.primary_key(&type_name, &tx)?;
    backend.clear_calls();

    let query = build_query(args, &type_name)?;
    match args.operation {
        Operation::Select => {
            store.features(&query, &tx)?.into_vec()?;
        }
        Operation::Count => {
            store.count(&query, &tx)?;
        }
        Operation::Bounds => {
            store.bounds(&query, &tx)?;
        }
        Operation::Delete => {
            store.delete(&type_name, &query.filter, &tx)?;
        }
        other => {
            let kind = aggregate_kind(other).ok_or_else(|| StoreError::Unsupported(format!("{other:?}")))?;
            let attribute = args
                .attribute
                .as_deref()
                .ok_or_else(|| StoreError::Config("--attribute is required for aggregates".to_string()))?;
            store.aggregate(&query, &AggregateRequest::of(kind, attribute), &tx)?;
        }
    }
    Ok(backend.calls())
}

fn render(calls: &[Call]) -> String {
    let mut table = ComfyTable::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![Cell::new("#"), Cell::new("kind"), Cell::new("sql"), Cell::new("parameters")]);
    let mut n = 0;
    for call in calls {
        let (kind, sql, params) = match call {
            Call::Query { sql, params } => ("query", sql, params.clone()),
            Call::Execute { sql, params } => ("execute", sql, params.clone()),
            Call::Batch { sql, rows } => ("batch", sql, rows.iter().flatten().cloned().collect()),
            _ => continue,
        };
        n += 1;
        let params: Vec<String> = params.iter().map(Value::to_string).collect();
        table.add_row(vec![
            Cell::new(n),
            Cell::new(kind),
            Cell::new(sql),
            Cell::new(params.join(", ")),
        ]);
    }
    format!("{table}\n({n} statements)")
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);
    match explain(&args) {
        Ok(calls) => {
            println!("{}", render(&calls));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

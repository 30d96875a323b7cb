//! ferry - replicate DynamoDB tables into PostgreSQL/Citus
//!
//! # Usage
//!
//! ```bash
//! # Create or extend the sink tables
//! ferry -c ferry.yaml replicate-schema
//!
//! # Schema, then a full rate-limited load
//! ferry --url postgres://localhost/ferry --tables Orders replicate-data --max-rate 100
//!
//! # Schema, load, then follow the change streams until Ctrl-C
//! ferry -c ferry.yaml replicate-changes
//!
//! # Without a sink URL the SQL is printed instead of executed
//! ferry --tables Orders replicate-schema
//! ```
//!
//! Exit codes: 0 success, 1 data/schema/emission failure, 2 unexpected
//! fault, 3 invalid arguments.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ferry_rdbc::emitter::BoxedEmitter;
use ferry_rdbc::stdout::StdoutEmitter;
use ferry_replicator::coordinator::{replicable_tables, replicate_all_data};
use ferry_replicator::lease::{LeaseManager, LeaseStore};
use ferry_replicator::progress::{FileProgressStore, MemoryProgressStore, ProgressStore};
use ferry_replicator::{
    ConversionMode, ReplicationCoordinator, ReplicationError, ReplicatorConfig, SinkRouter,
    SourceStore,
};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(version, about = "Replicate DynamoDB tables into PostgreSQL or Citus")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "FERRY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Flags applied over the configuration file
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Sink connection URL (SQL goes to stdout without one)
    #[arg(long, env = "FERRY_SINK_URL", global = true)]
    url: Option<String>,

    /// Sink connections (router workers)
    #[arg(long, global = true)]
    connections: Option<usize>,

    /// Tables to replicate, comma-separated (default: all)
    #[arg(long, value_delimiter = ',', global = true)]
    tables: Vec<String>,

    /// columns | document
    #[arg(long, global = true)]
    conversion: Option<String>,

    /// Lower-case column names
    #[arg(long, global = true)]
    lower_case: bool,

    /// Distribute tables with Citus
    #[arg(long, global = true)]
    citus: bool,

    /// Sink schema
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Source region
    #[arg(long, global = true)]
    region: Option<String>,

    /// Source endpoint override
    #[arg(long, global = true)]
    endpoint: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or extend the sink tables
    ReplicateSchema,
    /// Replicate schema, then load all items
    ReplicateData(LoadArgs),
    /// Replicate schema and data, then follow the change streams
    ReplicateChanges {
        #[command(flatten)]
        load: LoadArgs,

        /// Lease owner name
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// Validate configuration and print it
    Validate,
}

#[derive(Args, Debug, Default)]
struct LoadArgs {
    /// Read units per second per table (0 = unlimited)
    #[arg(long)]
    max_rate: Option<u64>,

    /// Scan segments per table
    #[arg(long)]
    segments: Option<u32>,

    /// Keep resumable scan progress in this directory
    #[arg(long)]
    progress_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(3)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let code = e
                .downcast_ref::<ReplicationError>()
                .map_or(2, ReplicationError::exit_code);
            ExitCode::from(code as u8)
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn load_config(cli: &Cli) -> Result<ReplicatorConfig> {
    let mut config = match &cli.config {
        Some(path) => ReplicatorConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ReplicatorConfig::default(),
    };

    let o = &cli.overrides;
    if let Some(url) = &o.url {
        config = config.with_sink_url(url);
    }
    if let Some(connections) = o.connections {
        config = config.with_connections(connections);
    }
    if !o.tables.is_empty() {
        config = config.with_tables(o.tables.clone());
    }
    if let Some(mode) = &o.conversion {
        config = config.with_conversion(mode.parse::<ConversionMode>()?);
    }
    if o.lower_case {
        config = config.with_lower_case_column_names(true);
    }
    if o.citus {
        config = config.with_citus(true);
    }
    if let Some(namespace) = &o.namespace {
        config = config.with_namespace(namespace);
    }
    if let Some(region) = &o.region {
        config = config.with_region(region);
    }
    if let Some(endpoint) = &o.endpoint {
        config = config.with_endpoint(endpoint);
    }

    let load = match &cli.command {
        Commands::ReplicateData(load) | Commands::ReplicateChanges { load, .. } => Some(load),
        _ => None,
    };
    if let Some(load) = load {
        if let Some(rate) = load.max_rate {
            config = config.with_max_rate(rate);
        }
        if let Some(segments) = load.segments {
            config = config.with_segments(segments);
        }
        if let Some(dir) = &load.progress_dir {
            config = config.with_progress_dir(dir);
        }
    }
    if let Commands::ReplicateChanges {
        worker_id: Some(id),
        ..
    } = &cli.command
    {
        config = config.with_worker_id(id);
    }

    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    if let Commands::Validate = cli.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let backend = Backend::connect(&config).await?;
    let tables = replicable_tables(
        backend.source.as_ref(),
        &config.tables,
        &config.stream.lease_table_prefix,
    )
    .await?;
    if tables.is_empty() {
        warn!("No tables to replicate");
    }

    let router = Arc::new(connect_sink(&config).await?);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                cancel.cancel();
            }
        });
    }

    let progress: Arc<dyn ProgressStore> = match &config.scan.progress_dir {
        Some(dir) => Arc::new(FileProgressStore::new(dir).await?),
        None => Arc::new(MemoryProgressStore::new()),
    };
    let worker_id = config.worker_id();
    let coordinators: Vec<Arc<ReplicationCoordinator>> = tables
        .iter()
        .map(|table| {
            let leases = LeaseManager::new(
                backend.lease_store(&config.lease_table(table)),
                worker_id.clone(),
                config.lease_ttl(),
            );
            Arc::new(
                ReplicationCoordinator::new(
                    table.clone(),
                    backend.source.clone(),
                    router.clone(),
                    Arc::new(config.translator()),
                )
                .with_scan_options(config.scan_options())
                .with_stream_options(config.stream_options())
                .with_progress_store(progress.clone())
                .with_leases(leases),
            )
        })
        .collect();

    let outcome = match cli.command {
        Commands::ReplicateSchema => replicate_schema(&coordinators).await,
        Commands::ReplicateData(_) => replicate_data(&coordinators, &config, &cancel).await,
        Commands::ReplicateChanges { .. } => {
            match replicate_data(&coordinators, &config, &cancel).await {
                Ok(()) => replicate_changes(&coordinators, &cancel).await,
                Err(e) => Err(e),
            }
        }
        Commands::Validate => Ok(()),
    };

    // the sink is closed on every path; the first failure wins
    let closed = router.close().await;
    let stats = router.stats();
    info!(
        upserts = stats.upserts,
        deletes = stats.deletes,
        bulk_rows = stats.bulk_rows,
        schema_changes = stats.schema_changes,
        failures = stats.failures,
        "Sink closed"
    );
    outcome?;
    closed?;
    Ok(())
}

async fn replicate_schema(coordinators: &[Arc<ReplicationCoordinator>]) -> Result<()> {
    for coordinator in coordinators {
        coordinator
            .replicate_schema()
            .await
            .with_context(|| format!("schema replication of {} failed", coordinator.table()))?;
    }
    Ok(())
}

async fn replicate_data(
    coordinators: &[Arc<ReplicationCoordinator>],
    config: &ReplicatorConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    replicate_schema(coordinators).await?;

    replicate_all_data(coordinators, config.scan.max_rate, cancel).await?;
    Ok(())
}

async fn replicate_changes(
    coordinators: &[Arc<ReplicationCoordinator>],
    cancel: &CancellationToken,
) -> Result<()> {
    let mut tasks = JoinSet::new();
    for coordinator in coordinators {
        let handle = coordinator.start_replicating_changes(cancel.clone())?;
        let table = coordinator.table().to_string();
        tasks.spawn(async move {
            let result = handle.await.map_err(ReplicationError::from).and_then(|r| r);
            (table, result)
        });
    }
    info!(tables = coordinators.len(), "Following change streams");

    let mut failure: Option<ReplicationError> = None;
    while let Some(joined) = tasks.join_next().await {
        let (table, result) = joined.map_err(ReplicationError::from)?;
        match result {
            Ok(summary) => info!(
                table = %table,
                records = summary.records,
                shards_finished = summary.shards_finished,
                "Change replication stopped"
            ),
            Err(ReplicationError::Cancelled) => {}
            Err(e) => {
                error!(table = %table, error = %e, "Change replication failed");
                cancel.cancel();
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }
    }
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

async fn connect_sink(config: &ReplicatorConfig) -> Result<SinkRouter> {
    let Some(url) = &config.sink.url else {
        info!("No sink URL configured, writing SQL to stdout");
        let emitter = StdoutEmitter::new().with_distribution(config.sink.citus);
        return Ok(SinkRouter::new(vec![Box::new(emitter) as BoxedEmitter])?);
    };
    connect_postgres(config, url).await
}

#[cfg(feature = "postgres")]
async fn connect_postgres(config: &ReplicatorConfig, url: &str) -> Result<SinkRouter> {
    use ferry_rdbc::connection::ConnectionConfig;
    use ferry_rdbc::postgres::PgTableEmitter;

    let connection = ConnectionConfig::new(url)
        .with_citus(config.sink.citus)
        .with_connect_timeout(config.sink.connect_timeout_ms);
    let mut emitters: Vec<BoxedEmitter> = Vec::with_capacity(config.sink.connections);
    for _ in 0..config.sink.connections {
        let emitter = PgTableEmitter::connect(&connection)
            .await
            .map_err(|e| ReplicationError::Emission {
                message: format!("failed to connect to {}", connection.redacted_url()),
                source: Some(e),
            })?;
        emitters.push(Box::new(emitter));
    }
    info!(
        url = %connection.redacted_url(),
        connections = emitters.len(),
        "Connected to sink"
    );
    Ok(SinkRouter::new(emitters)?)
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(_config: &ReplicatorConfig, _url: &str) -> Result<SinkRouter> {
    Err(ReplicationError::argument("ferry was built without PostgreSQL support").into())
}

/// Source store plus where its leases live
struct Backend {
    source: Arc<dyn SourceStore>,
    #[cfg(feature = "dynamodb")]
    client: aws_sdk_dynamodb::Client,
}

impl Backend {
    #[cfg(feature = "dynamodb")]
    async fn connect(config: &ReplicatorConfig) -> Result<Self> {
        let source = ferry_replicator::dynamodb::DynamoDbSource::connect(&config.source).await?;
        Ok(Self {
            client: source.client().clone(),
            source: Arc::new(source),
        })
    }

    #[cfg(not(feature = "dynamodb"))]
    async fn connect(_config: &ReplicatorConfig) -> Result<Self> {
        Err(ReplicationError::argument("ferry was built without DynamoDB support").into())
    }

    #[cfg(feature = "dynamodb")]
    fn lease_store(&self, table: &str) -> Arc<dyn LeaseStore> {
        Arc::new(ferry_replicator::dynamodb::DynamoDbLeaseStore::new(
            self.client.clone(),
            table,
        ))
    }

    #[cfg(not(feature = "dynamodb"))]
    fn lease_store(&self, _table: &str) -> Arc<dyn LeaseStore> {
        Arc::new(ferry_replicator::lease::MemoryLeaseStore::new())
    }
}

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use wal_logger::config::SinkKind;
use wal_logger::postgres::{PgClient, PollerSettings, ReplicationSource};
use wal_logger::sink::{ChangeSink, PostgresSink, StdoutSink};
use wal_logger::{ChangeOrchestrator, Config, KeyColumnCache};

#[derive(Parser, Debug)]
#[command(name = "wal-logger")]
#[command(about = "Logs PostgreSQL row changes read from a wal2json replication slot", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, value_enum, help = "Override the configured sink")]
    sink: Option<SinkKind>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting wal-logger");
    info!("Loading configuration from {:?}", args.config);

    let mut config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e).context("loading configuration");
        }
    };
    if let Some(kind) = args.sink {
        config.sink.kind = kind;
    }
    config.validate().context("validating configuration")?;

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        slot_name = %config.listener.slot_name,
        slot_policy = ?config.listener.slot_policy,
        poll_interval_ms = config.listener.poll_interval_ms,
        sink = ?config.sink.kind,
        "Configuration summary"
    );

    let cache = Arc::new(KeyColumnCache::new(
        Duration::from_secs(config.cache.ttl_secs),
        config.cache.schemas.clone(),
    ));
    let catalog = PgClient::connect(&config.postgres_connection())
        .await
        .context("connecting to source database")?;
    cache
        .init(&catalog)
        .await
        .context("loading primary keys")?;
    catalog.close().await;
    let _sweeper = cache.spawn_sweeper(config.cache.sweep_fraction);

    let source = PgClient::connect(&config.postgres_connection())
        .await
        .context("connecting to source database")?;
    let settings = PollerSettings::from_config(&config.listener, &config.wal2json);

    let sink: Box<dyn ChangeSink> = match config.sink.kind {
        SinkKind::Postgres => Box::new(PostgresSink::new(
            config.sink_postgres().connection_config(),
            config.sink.create_table,
        )),
        SinkKind::Stdout => Box::new(StdoutSink::new()),
    };

    let mut orchestrator = ChangeOrchestrator::new(source, settings, cache, sink);
    orchestrator.start().await.context("starting change capture")?;
    orchestrator.run_until(shutdown_signal()).await?;

    info!("wal-logger stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("wal_logger=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wal_logger=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

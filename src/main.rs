#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::net::SocketAddr;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use courier::{
    admin::{self, BreakerConfigUpdate},
    config::GatewayConfig,
    handlers::router,
    retry::{RetryPoller, StoreQueue},
    state::{AppState, breaker_manager},
    store::{DeliveryFeed, SqliteStore},
};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Parser)]
#[command(
    name = "courier",
    about = "Webhook gateway with circuit breaking, retries and CLI streaming",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server, the retry poller and the streaming hub
    Server,
    /// Inspect or tune per-endpoint circuit breakers
    #[command(subcommand)]
    CircuitBreakers(BreakerCommand),
    /// Requeue deliveries by status and age, ignoring their backoff
    Retry(RetryCommand),
}

#[derive(Debug, Subcommand)]
enum BreakerCommand {
    /// Print the breaker snapshot of an endpoint as JSON
    Get(GetCommand),
    /// Change a project's breaker config and reset its breakers
    Update(UpdateCommand),
}

#[derive(Debug, clap::Args)]
struct GetCommand {
    endpoint_id: String,
}

#[derive(Debug, clap::Args)]
struct UpdateCommand {
    project_id: String,
    #[arg(long = "sample_rate", alias = "sample-rate")]
    sample_rate: Option<u32>,
    #[arg(long = "failure_threshold", alias = "failure-threshold")]
    failure_threshold: Option<u32>,
    #[arg(long = "success_threshold", alias = "success-threshold")]
    success_threshold: Option<u32>,
    #[arg(long = "minimum_request_count", alias = "minimum-request-count")]
    minimum_request_count: Option<u64>,
    /// Window size in minutes
    #[arg(long = "observability_window", alias = "observability-window")]
    observability_window: Option<u64>,
    #[arg(
        long = "consecutive_failure_threshold",
        alias = "consecutive-failure-threshold"
    )]
    consecutive_failure_threshold: Option<u64>,
    /// Seconds an open breaker waits before probing
    #[arg(long = "breaker_timeout", alias = "breaker-timeout")]
    breaker_timeout: Option<u64>,
}

impl UpdateCommand {
    fn overrides(&self) -> BreakerConfigUpdate {
        BreakerConfigUpdate {
            sample_rate: self.sample_rate,
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            minimum_request_count: self.minimum_request_count,
            observability_window: self.observability_window,
            consecutive_failure_threshold: self.consecutive_failure_threshold,
            breaker_timeout: self.breaker_timeout,
        }
    }
}

#[derive(Debug, clap::Args)]
struct RetryCommand {
    /// Delivery status to select; repeat or comma-separate for several
    #[arg(long, required = true, value_delimiter = ',')]
    status: Vec<String>,
    /// How far back to look, e.g. 24h or 1h30m
    #[arg(long, default_value = "1h")]
    time: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let config = GatewayConfig::from_env();

    match cli.command {
        Commands::Server => {
            init_tracing();
            serve(config).await
        }
        Commands::CircuitBreakers(BreakerCommand::Get(cmd)) => {
            let store = open_store(&config).await?;
            let breakers = breaker_manager(&store, &config);
            let summary = admin::get_breaker(&breakers, &cmd.endpoint_id).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::CircuitBreakers(BreakerCommand::Update(cmd)) => {
            let overrides = cmd.overrides();
            if overrides.is_empty() {
                return Err("nothing to update, pass at least one threshold flag".into());
            }
            let store = open_store(&config).await?;
            let breakers = breaker_manager(&store, &config);
            let outcome =
                admin::update_breaker_config(&store, &breakers, &cmd.project_id, &overrides)
                    .await?;
            println!("{}", serde_json::to_string_pretty(&outcome.config)?);
            println!(
                "reset {} circuit breaker(s) for project {}",
                outcome.breakers_reset,
                cmd.project_id.trim()
            );
            Ok(())
        }
        Commands::Retry(cmd) => {
            let store = open_store(&config).await?;
            let queue = StoreQueue::new(Arc::new(store.clone()));
            let count = admin::requeue(&store, &queue, &cmd.status, &cmd.time, Utc::now()).await?;
            println!("requeued {count} deliveries");
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn connect(database_url: &str) -> Result<SqlitePool, BoxError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Store for one-shot admin commands; nothing listens on its feed.
async fn open_store(config: &GatewayConfig) -> Result<SqliteStore, BoxError> {
    let pool = connect(&config.database_url).await?;
    Ok(SqliteStore::new(pool, DeliveryFeed::new(1)))
}

async fn serve(config: GatewayConfig) -> Result<(), BoxError> {
    let pool = connect(&config.database_url).await?;
    let addr: SocketAddr = config.bind_addr.parse()?;
    let poll_interval = config.retry_poll_interval;
    let batch_size = config.retry_batch_size;

    let (state, hub) = AppState::new(pool, config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = hub.spawn(shutdown_rx.clone());
    let deliveries = Arc::new(state.store.clone());
    let poller = RetryPoller::new(
        deliveries.clone(),
        Arc::new(StoreQueue::new(deliveries)),
        poll_interval,
        batch_size,
    );
    tasks.push(tokio::spawn(poller.run(shutdown_rx.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "courier listening");

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(err) = signal {
                        warn!(error = %err, "failed to listen for ctrl-c");
                    }
                }
                _ = server_shutdown.changed() => {}
            }
        })
        .await?;

    info!("shutting down background tasks");
    if let Err(err) = shutdown_tx.send(true) {
        debug!(error = %err, "background tasks already stopped");
    }
    for task in tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    Ok(())
}

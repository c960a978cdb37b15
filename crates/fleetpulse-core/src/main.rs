//! FleetPulse CLI
//!
//! Command-line interface for the FleetPulse alert pipeline.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use fleetpulse::config::Config;
use fleetpulse::db::{Database, PgStore, RedisPool};
use fleetpulse::ingest::Simulator;
use fleetpulse::service::Service;

/// FleetPulse - Real-time alerts for IoT fleets
#[derive(Parser)]
#[command(name = "fleetpulse")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "FLEETPULSE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the alert pipeline
    Serve {
        /// HTTP port for /health and /ws (overrides configuration)
        #[arg(long, env = "FLEETPULSE_HTTP_PORT")]
        http_port: Option<u16>,
    },

    /// Push synthetic heartbeats for the given devices
    Simulate {
        /// Device ids, comma separated
        #[arg(long, env = "DEVICE_IDS", value_delimiter = ',', required = true)]
        devices: Vec<Uuid>,

        /// Time between heartbeat cycles (e.g. "5s", "1m")
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        interval: Duration,
    },

    /// Check that Redis and Postgres are reachable
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config, cli.verbose);

    let result = match cli.command {
        Commands::Serve { http_port } => run_serve(config, http_port).await,
        Commands::Simulate { devices, interval } => run_simulate(config, devices, interval).await,
        Commands::Check => run_check(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if config.logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn install_metrics(config: &Config) -> anyhow::Result<()> {
    if !config.metrics.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .metrics
        .listen
        .parse()
        .with_context(|| format!("invalid metrics.listen address {}", config.metrics.listen))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

async fn run_serve(mut config: Config, http_port: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = http_port {
        config.server.http_port = port;
    }
    install_metrics(&config)?;

    info!(
        host = %config.server.host,
        http_port = config.server.http_port,
        stream = %config.queue.stream,
        ack_policy = ?config.queue.ack_policy,
        "Starting FleetPulse"
    );

    let service = Service::new(config)
        .await
        .context("failed to reach Redis or Postgres")?;
    service.run().await?;
    Ok(())
}

async fn run_simulate(config: Config, devices: Vec<Uuid>, interval: Duration) -> anyhow::Result<()> {
    let redis = RedisPool::new(&config.redis)
        .await
        .context("failed to reach Redis")?;
    let simulator = Simulator::new(&redis, config.queue.stream.clone(), devices, interval);

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(simulator.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Ctrl+C received, stopping simulator");
    shutdown.cancel();

    task.await??;
    Ok(())
}

async fn run_check(config: Config) -> anyhow::Result<()> {
    let redis = RedisPool::new(&config.redis).await.context("Redis")?;
    println!("Redis:    ok ({})", config.redis.url);

    let postgres = PgStore::new(&config.database).await.context("Postgres")?;
    println!("Postgres: ok");

    Database { postgres, redis }
        .health_check()
        .await
        .context("health check")?;
    Ok(())
}

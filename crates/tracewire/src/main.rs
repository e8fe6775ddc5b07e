//! tracewire: demo worker for trace propagation across RPC boundaries
//!
//! Serves an HTTP API whose handlers call a Durable Object over traced RPC,
//! writing every captured transaction to `.tracewire/traces/`.

mod config;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracewire_tracing::{JsonlTransport, NoopTransport, ReportingLayer, SharedTransport};
use tracewire_worker::WorkerServer;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::Config;

/// Demo worker for distributed trace propagation
#[derive(Parser)]
#[command(name = "tracewire")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to .tracewire directory (default: search for .tracewire/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Port for the HTTP server (default: from config)
    #[arg(long, global = true, env = "TRACEWIRE_PORT")]
    port: Option<u16>,

    /// Environment tag attached to every transaction
    #[arg(long, global = true, env = "TRACEWIRE_ENVIRONMENT")]
    environment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker
    Serve {
        /// Host to bind to (default: from config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Initialize a new .tracewire directory with config file
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },
}

fn env_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Log output filtered by `filter`, plus shipping of events at `ship_level`
/// and above into the active trace. The two filters are independent.
fn subscriber<W>(
    writer: W,
    ansi: bool,
    filter: EnvFilter,
    ship_level: tracing::Level,
) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(ansi)
                .with_filter(filter),
        )
        .with(ReportingLayer::new(ship_level).with_filter(LevelFilter::from_level(ship_level)))
}

/// Initialize logging to stderr.
fn init_logging(verbose: bool, ship_level: tracing::Level) {
    subscriber(std::io::stderr, true, env_filter(verbose), ship_level).init();
}

/// Initialize logging to daily rotated files in `logs_dir`.
fn init_file_logging(logs_dir: &Path, verbose: bool, ship_level: tracing::Level) {
    if let Err(e) = std::fs::create_dir_all(logs_dir) {
        eprintln!("Warning: Failed to create logs directory: {}", e);
        init_logging(verbose, ship_level);
        return;
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, "tracewire.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Dropping the guard stops the writer thread
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    subscriber(non_blocking, false, env_filter(verbose), ship_level).init();
}

/// Load config from an explicit path or by walking up from the current directory.
///
/// Returns the config and the `.tracewire` directory it belongs to.
fn load_config(override_path: Option<&PathBuf>) -> Result<(Config, Option<PathBuf>)> {
    if let Some(path) = override_path {
        // Explicit path override - either the directory or the file itself
        let config_file = if path.is_dir() {
            path.join(config::CONFIG_FILE)
        } else {
            path.clone()
        };
        let data_dir = config_file.parent().unwrap_or(path).to_path_buf();
        let config = Config::from_file(&config_file)?;
        return Ok((config, Some(data_dir)));
    }

    match Config::find_and_load() {
        Ok(Some((config, data_dir))) => Ok((config, Some(data_dir))),
        Ok(None) => Ok((Config::default(), None)),
        Err(e) => {
            eprintln!("Warning: Error searching for config: {}, using defaults", e);
            Ok((Config::default(), None))
        }
    }
}

const DEFAULT_CONFIG: &str = r#"# tracewire configuration
# All paths are relative to this .tracewire/ directory unless absolute

[server]
host = "127.0.0.1"
port = 8787
enable_cors = true
object_name = "static-name"  # Durable Object the API routes call into
fork_delay_ms = 1000         # Delay before forked programs start
jitter_min_ms = 10
jitter_max_ms = 100

[reporting]
# environment = "development"
# release = "0.1.0"
traces_sample_rate = 1.0
debug = false
enable_logs = true
ignore_transactions = ["/favicon.ico"]
flush_timeout_ms = 2000      # Budget for each background flush
cloud_provider = "cloudflare"

[traces]
path = "traces"              # Stored in .tracewire/traces/
enabled = true
session_mode = false         # true: one file per run, false: one file per day

[logging]
to_file = false              # true: .tracewire/logs/tracewire.log, rotated daily
dir = "logs"
ship_level = "warn"          # Minimum level copied into traces, independent of RUST_LOG
"#;

fn run_init(force: bool) -> Result<()> {
    let data_dir = PathBuf::from(config::TRACEWIRE_DIR);
    let config_path = data_dir.join(config::CONFIG_FILE);

    if config_path.exists() && !force {
        anyhow::bail!(".tracewire/config.toml already exists. Use --force to overwrite.");
    }

    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
        info!("Created {}/", data_dir.display());
    }

    std::fs::write(&config_path, DEFAULT_CONFIG)?;
    info!("Created {}", config_path.display());
    info!("Next steps:");
    info!("  1. Edit .tracewire/config.toml to configure the worker");
    info!("  2. Run 'tracewire serve' and request /api/effect or /api/durable-object");
    Ok(())
}

async fn run_serve(
    mut config: Config,
    data_dir: PathBuf,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", host, port))?;
    config.server.host = host;

    let writer_config = config.writer_config(&data_dir);
    let transport: SharedTransport = if writer_config.enabled {
        info!("Writing traces to {}", writer_config.trace_path.display());
        Arc::new(JsonlTransport::new(writer_config)?)
    } else {
        info!("Trace output disabled");
        Arc::new(NoopTransport)
    };

    let server = WorkerServer::new(config.worker_config(addr), transport);
    info!("Starting tracewire worker on {}", addr);

    server
        .run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, config_dir) = load_config(cli.config.as_ref())?;
    if let Some(environment) = cli.environment {
        config.reporting.environment = Some(environment);
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("Config error: {}", e);
        }
        anyhow::bail!("Invalid configuration ({} errors)", errors.len());
    }

    let data_dir = config_dir.unwrap_or_else(|| PathBuf::from(config::TRACEWIRE_DIR));
    let ship_level = config.logging.ship_level()?;
    if config.logging.to_file {
        let logs_dir = Config::resolve_path(&data_dir, &config.logging.dir);
        init_file_logging(&logs_dir, cli.verbose, ship_level);
    } else {
        init_logging(cli.verbose, ship_level);
    }

    match cli.command {
        Commands::Serve { host } => run_serve(config, data_dir, host, cli.port).await,
        Commands::Init { force } => run_init(force),
    }
}

//! http-engine server binary.
//!
//! ```text
//! http-engine serve [--config PATH] [--host H] [--port P] [--workers N]
//!     → load + validate config, apply flags, re-validate
//!     → Supervisor: N worker processes (SO_REUSEPORT) or one in-process worker
//!
//! http-engine worker --config PATH --worker-id N     (spawned by the supervisor)
//!     → one current_thread runtime serving the Echo application
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use http_engine::app::Echo;
use http_engine::config::{load_config, validate_config, ServerConfig};
use http_engine::lifecycle::{run_worker, Supervisor, WorkerOptions};
use http_engine::observability::init_logging;

#[derive(Parser)]
#[command(name = "http-engine")]
#[command(about = "HTTP/1.1 and HTTP/2 server engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to bind
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of worker processes
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Run a single worker (used by the supervisor)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        worker_id: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            workers,
        } => serve(config.as_deref(), host, port, workers),
        Commands::Worker { config, worker_id } => worker(&config, worker_id),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            tracing::error!(error = %message, "Fatal error");
            eprintln!("http-engine: {message}");
            ExitCode::FAILURE
        }
    }
}

fn serve(
    path: Option<&Path>,
    host: Option<String>,
    port: Option<u16>,
    workers: Option<usize>,
) -> Result<(), String> {
    let mut config = match path {
        Some(path) => load_config(path).map_err(|e| format!("{}: {e}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(host) = host {
        config.listener.host = host;
    }
    if let Some(port) = port {
        config.listener.port = port;
    }
    if let Some(workers) = workers {
        config.listener.workers = workers;
    }
    validate_config(&config).map_err(|errors| {
        errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    })?;

    init_logging(&config.observability)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %config.listener.bind_address(),
        workers = config.listener.workers,
        tls = config.tls.is_some(),
        h2 = config.http2.enabled,
        "http-engine starting"
    );

    let supervisor = Supervisor::new(config).map_err(|e| e.to_string())?;
    tracing::debug!(mode = ?supervisor.mode(), "Worker layout");
    supervisor.run(Arc::new(Echo)).map_err(|e| e.to_string())?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn worker(path: &Path, worker_id: usize) -> Result<(), String> {
    let config = load_config(path).map_err(|e| format!("{}: {e}", path.display()))?;
    init_logging(&config.observability)?;
    run_worker(WorkerOptions { config, worker_id }, Arc::new(Echo)).map_err(|e| e.to_string())
}

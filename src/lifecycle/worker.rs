//! A single worker: one runtime, one listener, one accept loop.
//!
//! Workers share nothing with each other. Everything a worker touches
//! (buffer pool, rate limiter buckets, connection table) lives in its own
//! `EngineContext`.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::app::Application;
use crate::config::ServerConfig;
use crate::error::EngineError;
use crate::lifecycle::{install_signal_handlers, Shutdown};
use crate::observability::metrics::{init_metrics, worker_address};
use crate::server::Server;

/// What a worker needs to start.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub config: ServerConfig,
    pub worker_id: usize,
}

/// Run one worker to completion on the calling thread.
///
/// Builds a `current_thread` runtime, binds the listener and serves until
/// SIGTERM or SIGINT. Returns once connections have drained or the grace
/// period has run out; dropping the runtime aborts whatever is left.
pub fn run_worker(options: WorkerOptions, app: Arc<dyn Application>) -> Result<(), EngineError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .thread_name(format!("http-engine-worker-{}", options.worker_id))
        .build()?;

    let result = runtime.block_on(serve(options, app));
    runtime.shutdown_background();
    result
}

async fn serve(options: WorkerOptions, app: Arc<dyn Application>) -> Result<(), EngineError> {
    let WorkerOptions { config, worker_id } = options;

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(base) => {
                if let Err(e) = init_metrics(worker_address(base, worker_id)) {
                    tracing::warn!(worker_id, error = %e, "Metrics exporter not started");
                }
            }
            Err(e) => tracing::warn!(
                worker_id,
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Invalid metrics address"
            ),
        }
    }

    let server = Server::bind(config, app).await?;
    tracing::info!(
        worker_id,
        pid = std::process::id(),
        address = %server.local_addr()?,
        "Worker started"
    );

    let shutdown = Shutdown::new();
    install_signal_handlers(shutdown.clone())?;
    server.run(shutdown.subscribe()).await?;

    tracing::info!(worker_id, "Worker stopped");
    Ok(())
}

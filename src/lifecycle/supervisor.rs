//! Worker process supervision.
//!
//! With port sharing the supervisor re-executes its own binary once per
//! worker (`http-engine worker --config <file> --worker-id <n>`); every
//! worker binds the same port with SO_REUSEPORT and the kernel spreads
//! connections between them. The effective configuration, CLI overrides
//! included, is written to a temporary file so workers see
//! exactly what the supervisor validated.
//!
//! With one worker, or without port sharing, the only worker runs inside
//! the supervisor process.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::app::Application;
use crate::config::ServerConfig;
use crate::error::EngineError;
use crate::lifecycle::worker::{run_worker, WorkerOptions};
use crate::lifecycle::TerminationSignals;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to write worker configuration {path}: {source}")]
    ConfigWrite { path: PathBuf, source: io::Error },

    #[error("failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("failed to spawn worker {worker_id}: {source}")]
    Spawn { worker_id: usize, source: io::Error },

    #[error("supervisor runtime error: {0}")]
    Runtime(#[from] io::Error),

    #[error("worker failed: {0}")]
    Worker(#[from] EngineError),
}

/// How the workers of this supervisor are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    InProcess,
    Processes(usize),
}

impl WorkerMode {
    pub fn for_config(config: &ServerConfig) -> Self {
        let workers = config.listener.workers.max(1);
        if workers == 1 || !config.listener.reuse_port || !cfg!(unix) {
            WorkerMode::InProcess
        } else {
            WorkerMode::Processes(workers)
        }
    }
}

struct WorkerHandle {
    pid: Option<u32>,
    exited: bool,
    /// Tells the monitor task to kill the child it owns.
    kill: Option<oneshot::Sender<()>>,
}

/// Owns the worker processes of one server.
pub struct Supervisor {
    config: ServerConfig,
    mode: WorkerMode,
    executable: PathBuf,
    config_file: Option<PathBuf>,
    workers: HashMap<usize, WorkerHandle>,
    exits: JoinSet<(usize, io::Result<ExitStatus>)>,
}

impl Supervisor {
    pub fn new(config: ServerConfig) -> Result<Self, SupervisorError> {
        Ok(Self {
            mode: WorkerMode::for_config(&config),
            executable: std::env::current_exe()?,
            config,
            config_file: None,
            workers: HashMap::new(),
            exits: JoinSet::new(),
        })
    }

    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    /// Run the server until SIGTERM or SIGINT, then shut it down.
    ///
    /// `app` is only used in-process; worker processes build their own.
    pub fn run(mut self, app: Arc<dyn Application>) -> Result<(), SupervisorError> {
        match self.mode {
            WorkerMode::InProcess => {
                tracing::info!(workers = 1, "Running single in-process worker");
                run_worker(
                    WorkerOptions {
                        config: self.config.clone(),
                        worker_id: 0,
                    },
                    app,
                )?;
                Ok(())
            }
            WorkerMode::Processes(_) => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                let result = runtime.block_on(async {
                    let mut signals = TerminationSignals::register()?;
                    self.start()?;
                    tokio::select! {
                        name = signals.recv() => {
                            tracing::info!(signal = name, "Shutdown signal received");
                        }
                        _ = self.wait() => {
                            tracing::warn!("All workers exited");
                        }
                    }
                    self.drain();
                    self.stop().await;
                    Ok::<_, SupervisorError>(())
                });
                self.remove_config_file();
                result
            }
        }
    }

    /// Spawn every worker process.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        let WorkerMode::Processes(count) = self.mode else {
            return Ok(());
        };

        let path = std::env::temp_dir().join(format!("http-engine-{}.toml", std::process::id()));
        let rendered = toml::to_string(&self.config)?;
        std::fs::write(&path, rendered).map_err(|source| SupervisorError::ConfigWrite {
            path: path.clone(),
            source,
        })?;
        self.config_file = Some(path.clone());

        for worker_id in 0..count {
            let child = self.spawn_worker(worker_id, &path)?;
            tracing::info!(worker_id, pid = child.id(), "Worker spawned");
            self.adopt(worker_id, child);
        }
        Ok(())
    }

    fn adopt(&mut self, worker_id: usize, child: Child) {
        let (kill, killed) = oneshot::channel();
        self.workers.insert(
            worker_id,
            WorkerHandle {
                pid: child.id(),
                exited: false,
                kill: Some(kill),
            },
        );
        self.exits.spawn(wait_child(worker_id, child, killed));
    }

    fn spawn_worker(&self, worker_id: usize, config_path: &Path) -> Result<Child, SupervisorError> {
        Command::new(&self.executable)
            .arg("worker")
            .arg("--config")
            .arg(config_path)
            .arg("--worker-id")
            .arg(worker_id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn { worker_id, source })
    }

    /// Resolves once every worker has exited, logging each exit.
    pub async fn wait(&mut self) {
        while let Some(joined) = self.exits.join_next().await {
            self.record_exit(joined);
        }
    }

    /// Ask every live worker to shut down gracefully.
    pub fn drain(&self) {
        for (worker_id, handle) in &self.workers {
            if handle.exited {
                continue;
            }
            if let Some(pid) = handle.pid {
                tracing::debug!(worker_id, pid, "Sending SIGTERM");
                terminate(pid);
            }
        }
    }

    /// Wait up to the grace period for workers to exit, then kill the rest.
    pub async fn stop(&mut self) {
        let grace = Duration::from_secs(self.config.shutdown.grace_period_secs);
        // Workers drain for the same grace period; allow a little slack for exit.
        let deadline = tokio::time::Instant::now() + grace + Duration::from_secs(1);

        loop {
            match tokio::time::timeout_at(deadline, self.exits.join_next()).await {
                Ok(Some(joined)) => self.record_exit(joined),
                Ok(None) => break,
                Err(_) => {
                    for (worker_id, handle) in self.workers.iter_mut() {
                        if handle.exited {
                            continue;
                        }
                        if let Some(kill) = handle.kill.take() {
                            tracing::warn!(worker_id, pid = handle.pid, "Worker did not exit in time, killing");
                            let _ = kill.send(());
                        }
                    }
                    while let Some(joined) = self.exits.join_next().await {
                        self.record_exit(joined);
                    }
                    break;
                }
            }
        }
        tracing::info!("All workers stopped");
    }

    fn record_exit(&mut self, joined: Result<(usize, io::Result<ExitStatus>), tokio::task::JoinError>) {
        match joined {
            Ok((worker_id, status)) => {
                if let Some(handle) = self.workers.get_mut(&worker_id) {
                    handle.exited = true;
                }
                match status {
                    Ok(status) if status.success() => tracing::info!(worker_id, "Worker exited"),
                    Ok(status) => tracing::warn!(worker_id, status = %status, "Worker exited abnormally"),
                    Err(e) => tracing::error!(worker_id, error = %e, "Failed to wait for worker"),
                }
            }
            Err(e) => tracing::error!(error = %e, "Worker monitor task failed"),
        }
    }

    fn remove_config_file(&mut self) {
        if let Some(path) = self.config_file.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "Could not remove worker configuration");
            }
        }
    }
}

async fn wait_child(
    worker_id: usize,
    mut child: Child,
    killed: oneshot::Receiver<()>,
) -> (usize, io::Result<ExitStatus>) {
    tokio::select! {
        status = child.wait() => return (worker_id, status),
        Ok(()) = killed => {}
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(worker_id, error = %e, "SIGKILL failed");
    }
    (worker_id, child.wait().await)
}

fn terminate(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(errno) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(pid, error = %errno, "SIGTERM failed");
    }
}

//! OS signal handling.
//!
//! SIGTERM and SIGINT both mean "shut down gracefully". Handlers are
//! registered eagerly so a signal that arrives before the first poll is
//! not lost to the default disposition.

use tokio::signal::unix::{signal, Signal, SignalKind};

use super::shutdown::Shutdown;

pub struct TerminationSignals {
    term: Signal,
    int: Signal,
}

impl TerminationSignals {
    pub fn register() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }

    /// Name of the next termination signal received.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
        }
    }
}

/// Trigger `shutdown` when a termination signal arrives.
pub fn install(shutdown: Shutdown) -> std::io::Result<()> {
    let mut signals = TerminationSignals::register()?;
    tokio::spawn(async move {
        let name = signals.recv().await;
        tracing::info!(signal = name, "Shutdown signal received");
        shutdown.trigger();
    });
    Ok(())
}

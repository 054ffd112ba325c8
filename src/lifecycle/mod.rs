//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor (supervisor.rs):
//!     Load config → Validate → Spawn N workers → Wait for signal
//!     → SIGTERM each worker → Grace period → Kill stragglers
//!
//! Worker (worker.rs):
//!     Own runtime → Logging + metrics → Bind (SO_REUSEPORT) → Serve
//!     → Shutdown signal → Stop accepting → Drain → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Workers share nothing; the kernel spreads connections across them
//! - Shutdown has a deadline: forced exit after the grace period
//! - A single worker runs inside the supervisor process

pub mod shutdown;
pub mod signals;
pub mod supervisor;
pub mod worker;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::{install as install_signal_handlers, TerminationSignals};
pub use supervisor::{Supervisor, SupervisorError, WorkerMode};
pub use worker::{run_worker, WorkerOptions};

//! Per-worker I/O buffer pool.
//!
//! # Data Flow
//! ```text
//! connection read  → acquire(Standard) → read into handle → parse → drop handle
//! response write   → acquire(Large)    → serialize       → write → drop handle
//! ```
//!
//! # Design Decisions
//! - A semaphore bounds buffers in use; waiting is bounded by `acquire_timeout_ms`
//! - Free lists are mutated only inside short synchronous sections
//! - Handles return themselves on drop, so every exit path releases

pub mod pool;

pub use pool::{BufferHandle, BufferPool, PoolError, PoolStats, SizeClass};

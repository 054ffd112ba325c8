//! Flow-control windows (RFC 7540 Section 6.9).
//!
//! Windows are signed: a SETTINGS change to the initial window size may
//! push a send window below zero, after which the sender waits for
//! WINDOW_UPDATE credit.

use thiserror::Error;

use super::settings::MAX_WINDOW_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("peer sent more data than the advertised window")]
    Exceeded,
    #[error("window increment overflows 2^31-1")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window(i64);

impl Window {
    pub fn new(size: u32) -> Self {
        Self(i64::from(size))
    }

    pub fn available(&self) -> i64 {
        self.0
    }

    /// Bytes that may be sent right now.
    pub fn sendable(&self) -> usize {
        self.0.max(0) as usize
    }

    pub fn consume(&mut self, n: u32) -> Result<(), WindowError> {
        let n = i64::from(n);
        if n > self.0 {
            return Err(WindowError::Exceeded);
        }
        self.0 -= n;
        Ok(())
    }

    pub fn increase(&mut self, increment: u32) -> Result<(), WindowError> {
        self.adjust(i64::from(increment))
    }

    /// Applies a signed delta, as caused by an INITIAL_WINDOW_SIZE change.
    pub fn adjust(&mut self, delta: i64) -> Result<(), WindowError> {
        let next = self.0 + delta;
        if next > i64::from(MAX_WINDOW_SIZE) {
            return Err(WindowError::Overflow);
        }
        self.0 = next;
        Ok(())
    }
}

/// Receive side of a window, tracking consumed bytes so credit can be
/// returned in batches once half the target is used up.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveWindow {
    window: Window,
    target: u32,
    unreleased: u32,
}

impl ReceiveWindow {
    pub fn new(target: u32) -> Self {
        Self {
            window: Window::new(target),
            target,
            unreleased: 0,
        }
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn consume(&mut self, n: u32) -> Result<(), WindowError> {
        self.window.consume(n)
    }

    /// Marks `n` bytes as processed. Returns the WINDOW_UPDATE increment to
    /// send, if the threshold has been reached.
    pub fn release(&mut self, n: u32) -> Option<u32> {
        self.unreleased = self.unreleased.saturating_add(n);
        if self.unreleased < self.target / 2 || self.unreleased == 0 {
            return None;
        }
        let increment = self.unreleased;
        self.unreleased = 0;
        self.window.increase(increment).ok()?;
        Some(increment)
    }
}

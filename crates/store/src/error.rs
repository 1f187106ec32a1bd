use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by store operations.
///
/// Only timeouts and cancellations are expected in normal operation; the
/// orchestrator retries them. I/O failures propagate to the checkpoint
/// caller unchanged. Broken invariants never show up here: they go through
/// [`store_assert!`](crate::store_assert) and take the process down.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("timed out after {millis} ms waiting for the prime lock ({operation})")]
    Timeout { operation: &'static str, millis: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("store is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint file error: {0:#}")]
    Checkpoint(#[from] anyhow::Error),

    #[error("metadata error: {0}")]
    Metadata(String),
}

impl StoreError {
    /// Whether the orchestrator may simply run the operation again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Timeout { .. } | StoreError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Logs the violated invariant and panics.
///
/// A failed assertion means in-memory or on-disk state is corrupt; the
/// replica is expected to restart and recover from its last checkpoint.
#[macro_export]
macro_rules! store_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            let message = format!($($arg)+);
            tracing::error!(assertion = stringify!($cond), "{}", message);
            panic!("store invariant violated: {}", message);
        }
    };
}

/// Cooperative cancellation flag shared between a background task and
/// whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once [`cancel`](Self::cancel) has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

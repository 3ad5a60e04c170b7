//! Cooperative cancellation shared between a caller and its runs.
//!
//! The engine only looks at the token between commands: before each step,
//! before each retry attempt and between health polls. A command already in
//! flight finishes or hits its own timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    rollback: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation without rollback.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    /// Request cancellation and ask for the rollback plan to run.
    pub fn cancel_with_rollback(&self) {
        self.state.rollback.store(true, Ordering::SeqCst);
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn rollback_requested(&self) -> bool {
        self.state.rollback.load(Ordering::SeqCst)
    }
}

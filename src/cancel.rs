//! Process-wide cancellation signal.
//!
//! A single [`Cancellation`] token is created by the CLI and handed to every
//! long-running component. An OS interrupt or the `--timeout` watchdog trips
//! it; the worker pool stops executing queued jobs and the delta tool wrapper
//! kills its child process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable cancellation token. All clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

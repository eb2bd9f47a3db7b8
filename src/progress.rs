//! Progress and cancellation checkpoints for long operations.
//!
//! Workers are cooperative, not preemptible: long operations call
//! [`Progress::checkpoint`] at natural boundaries (per document, per rule,
//! per 100-unit window). The return value carries cancellation back into
//! the operation — `false` means "stop now"; the operation rolls back its
//! open transaction and returns [`EngineError::Canceled`].

use crate::error::EngineError;

/// Observer for long-running operations.
pub trait Progress: Send + Sync {
    /// Reports progress (0..=100) and a short human-readable message.
    /// Returns `false` when the operation should abort.
    fn checkpoint(&self, pct: u8, message: &str) -> bool;
}

/// No observation, never cancels. For synchronous callers and tests.
pub struct NoProgress;

impl Progress for NoProgress {
    fn checkpoint(&self, _pct: u8, _message: &str) -> bool {
        true
    }
}

/// Helper: turn a refused checkpoint into the typed cancellation error.
pub fn checkpoint(progress: &dyn Progress, pct: u8, message: &str) -> Result<(), EngineError> {
    if progress.checkpoint(pct, message) {
        Ok(())
    } else {
        Err(EngineError::Canceled)
    }
}

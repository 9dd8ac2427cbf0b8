//! Cooperative cancellation flag.
//!
//! Cancellation is a typed outcome ([`DocsinkError::Cancelled`]) threaded
//! through every async boundary, checked explicitly around each suspension
//! point. The flag itself is cheap to clone and share; raising it never
//! forcibly stops work; holders must observe it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{DocsinkError, Result};

/// Shared cancellation signal for one job's execution.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail fast with [`DocsinkError::Cancelled`] if the flag is raised.
    pub fn check(&self) -> Result<()> {
        if self.is_raised() {
            Err(DocsinkError::Cancelled)
        } else {
            Ok(())
        }
    }
}

//! Crawl progress counters with invariant checking.
//!
//! Every pipeline stage reports through one tracker. `total` only ever
//! grows (new pages/images discovered mid-crawl); `current` advances once
//! per attempted unit of work, including failures and skips.

use crate::error::{DocsinkError, Result};

/// Mutable progress counters for one crawl run. Not persisted.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    current: usize,
    total: usize,
    pages_processed: usize,
    images_processed: usize,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow the work estimate by `n` newly discovered units.
    pub fn add_total(&mut self, n: usize) {
        self.total += n;
    }

    /// Record one attempted unit of work.
    ///
    /// Returns an error if the increment would push `current` past
    /// `total`, which is a counter-corruption bug to surface, never to
    /// ignore.
    pub fn advance(&mut self) -> Result<()> {
        self.current += 1;
        if self.current > self.total {
            tracing::error!(
                current = self.current,
                total = self.total,
                "progress invariant violated: current exceeds total"
            );
            return Err(DocsinkError::validation(format!(
                "progress counter corruption: current {} exceeds total {}",
                self.current, self.total
            )));
        }
        Ok(())
    }

    pub fn page_done(&mut self) {
        self.pages_processed += 1;
    }

    pub fn image_done(&mut self) {
        self.images_processed += 1;
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn pages_processed(&self) -> usize {
        self.pages_processed
    }

    pub fn images_processed(&self) -> usize {
        self.images_processed
    }
}

impl std::fmt::Display for ProgressTracker {
    /// The `[current/total]` form used in log lines.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}]", self.current, self.total)
    }
}

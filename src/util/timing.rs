//! Debug guard for spotting slow sections.

use std::time::{Duration, Instant};

use tracing::debug;

/// Logs a debug line on drop when the watched section ran longer than the
/// configured threshold.
#[derive(Debug)]
pub struct TimeUsed {
    label: &'static str,
    threshold: Duration,
    start: Instant,
}

impl TimeUsed {
    /// Start watching a section identified by `label`.
    #[must_use]
    pub fn watch(label: &'static str, threshold: Duration) -> Self {
        Self {
            label,
            threshold,
            start: Instant::now(),
        }
    }
}

impl Drop for TimeUsed {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        if elapsed >= self.threshold {
            debug!(label = self.label, ?elapsed, "slow section");
        }
    }
}

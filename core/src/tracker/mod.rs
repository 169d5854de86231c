//! Offset bookkeeping shared between a fetcher and its completion callbacks.

pub mod gap;
pub mod pending;

use std::sync::atomic::{AtomicU64, Ordering};

pub use gap::{DEFAULT_GAP_WINDOW, GapTracker};
pub use pending::{PauseOffset, PendingWorkTracker};

/// The per-partition state completion callbacks are allowed to touch. Every
/// member synchronizes internally.
pub struct PartitionProgress {
    pub gap: GapTracker,
    pub pending: PendingWorkTracker,
    pub pause: PauseOffset,
    failed: AtomicU64,
}

impl PartitionProgress {
    pub fn new(gap_window: usize, label: impl Into<String>) -> Self {
        Self {
            gap: GapTracker::new(gap_window, label),
            pending: PendingWorkTracker::new(),
            pause: PauseOffset::new(),
            failed: AtomicU64::new(0),
        }
    }

    /// Counts a record that ended without being executed.
    pub fn record_failure(&self) -> u64 {
        self.failed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

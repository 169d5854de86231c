use parking_lot::Mutex;
use tracing::warn;

/// Default reorder window between submission and acknowledgement.
pub const DEFAULT_GAP_WINDOW: usize = 32_768;

const UNSET: i64 = -1;

/// Tracks which offsets of a contiguous stream have been acknowledged and
/// exposes the highest contiguous ("safe") commit point.
///
/// Acknowledgements may arrive in any order as long as they stay within a
/// window of `capacity` offsets of the safe point. When an acknowledgement
/// lands further ahead than that, the safe point is forced forward and the
/// skipped offsets are given up on, so memory stays bounded.
pub struct GapTracker {
    label: String,
    state: Mutex<GapState>,
}

struct GapState {
    /// Highest contiguous acknowledged offset.
    committed: i64,
    /// Highest submitted offset.
    submitted: i64,
    /// Slot `offset % len` holds `offset` once that offset is acknowledged.
    lag: Box<[i64]>,
}

impl GapState {
    fn idx(&self, offset: i64) -> usize {
        offset.rem_euclid(self.lag.len() as i64) as usize
    }
}

impl GapTracker {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, label: impl Into<String>) -> Self {
        assert!(capacity > 0, "gap tracker capacity must be positive");
        Self {
            label: label.into(),
            state: Mutex::new(GapState {
                committed: UNSET,
                submitted: UNSET,
                lag: vec![UNSET; capacity].into_boxed_slice(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().lag.len()
    }

    /// Hard reset: `safe()` becomes `offset` and everything at or below it is
    /// ignored from now on. Negative offsets are rejected.
    pub fn reset_to(&self, offset: i64) -> bool {
        if offset < 0 {
            return false;
        }
        let mut state = self.state.lock();
        state.lag.fill(UNSET);
        let idx = state.idx(offset);
        state.lag[idx] = offset;
        state.committed = offset;
        state.submitted = offset;
        true
    }

    /// Records that `offset` was dispatched downstream.
    pub fn submit(&self, offset: i64) {
        if offset < 0 {
            return;
        }
        let mut state = self.state.lock();
        if state.submitted == UNSET {
            let idx = state.idx(offset);
            state.lag[idx] = offset;
            state.committed = offset;
            state.submitted = offset;
        } else if offset > state.submitted {
            state.submitted = offset;
        }
    }

    /// Marks `offset` acknowledged and returns the resulting safe point.
    pub fn commit(&self, offset: i64) -> i64 {
        let mut state = self.state.lock();
        if offset <= state.committed || offset > state.submitted {
            return state.committed;
        }

        let window = state.lag.len() as i64;
        if offset - state.committed >= window {
            let forced = offset - window + 1;
            warn!(
                tracker = %self.label,
                from = state.committed,
                to = forced,
                "Gap tracker moving commit point past unacknowledged offsets"
            );
            state.committed = forced;
            let idx = state.idx(forced);
            state.lag[idx] = forced;
        }

        let idx = state.idx(offset);
        state.lag[idx] = offset;

        while state.committed < state.submitted {
            let next = state.committed + 1;
            if state.lag[state.idx(next)] != next {
                break;
            }
            state.committed = next;
        }
        state.committed
    }

    /// Current safe point; negative until the tracker is seeded.
    pub fn safe(&self) -> i64 {
        self.state.lock().committed
    }

    pub fn submitted(&self) -> i64 {
        self.state.lock().submitted
    }
}

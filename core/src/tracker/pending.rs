use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;

/// Counts submitted-but-unacknowledged records so shutdown can wait for them.
pub struct PendingWorkTracker {
    outstanding: watch::Sender<i64>,
    produced: AtomicU64,
    callbacks: AtomicU64,
}

impl Default for PendingWorkTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingWorkTracker {
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            outstanding,
            produced: AtomicU64::new(0),
            callbacks: AtomicU64::new(0),
        }
    }

    pub fn produce_work(&self) {
        self.produced.fetch_add(1, Ordering::SeqCst);
        self.outstanding.send_modify(|n| *n += 1);
    }

    /// Called from completion callbacks.
    pub fn consume_work(&self) {
        self.callbacks.fetch_add(1, Ordering::SeqCst);
        self.outstanding.send_modify(|n| *n -= 1);
    }

    /// Withdraws work whose submission was refused, without counting a
    /// callback.
    pub fn retract_work(&self) {
        self.produced.fetch_sub(1, Ordering::SeqCst);
        self.outstanding.send_modify(|n| *n -= 1);
    }

    pub fn outstanding(&self) -> i64 {
        *self.outstanding.borrow()
    }

    pub fn produced_count(&self) -> u64 {
        self.produced.load(Ordering::SeqCst)
    }

    pub fn callback_count(&self) -> u64 {
        self.callbacks.load(Ordering::SeqCst)
    }

    /// Waits until nothing is outstanding. Returns `false` if `timeout`
    /// elapsed first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut rx = self.outstanding.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n <= 0))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }
}

/// Lowest record offset whose downstream call reported transient overload.
/// Written by completion callbacks, read once at shutdown.
#[derive(Debug)]
pub struct PauseOffset(AtomicI64);

impl Default for PauseOffset {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseOffset {
    const UNSET: i64 = -1;

    pub fn new() -> Self {
        Self(AtomicI64::new(Self::UNSET))
    }

    /// Lowers the watermark to `offset` if it is unset or higher.
    pub fn record(&self, offset: i64) {
        if offset < 0 {
            return;
        }
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current == Self::UNSET || offset < current {
                    Some(offset)
                } else {
                    None
                }
            });
    }

    pub fn get(&self) -> Option<i64> {
        match self.0.load(Ordering::SeqCst) {
            Self::UNSET => None,
            offset => Some(offset),
        }
    }
}

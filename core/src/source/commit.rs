use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::decode::Decoder;
use crate::errors::BrokerError;
use crate::sink::Sink;
use crate::source::fetcher::PartitionFetcher;
use crate::source::{BrokerClient, BrokerConnection, OffsetCommit};
use crate::throttled_warn;

/// When the fetch loop pushes the safe offset to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Every loop iteration, whenever the safe offset moved.
    #[default]
    None,
    /// At most once per `interval_ms`.
    Time { interval_ms: u64 },
}

impl CommitPolicy {
    pub fn should_commit(&self, last_commit_at: Instant) -> bool {
        match self {
            CommitPolicy::None => true,
            CommitPolicy::Time { interval_ms } => {
                last_commit_at.elapsed() >= Duration::from_millis(*interval_ms)
            }
        }
    }
}

/// What to do with the final commit once draining finished or timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalCommit {
    Commit { use_pause: bool },
    Skip,
}

/// A timed-out drain leaves callbacks unaccounted for, so a pause offset
/// below the last committed point cannot be trusted and nothing is
/// committed.
pub fn final_commit_decision(drained: bool, pause: Option<i64>, last_committed: i64) -> FinalCommit {
    match pause {
        Some(pause) if !drained && pause < last_committed => FinalCommit::Skip,
        Some(_) => FinalCommit::Commit { use_pause: true },
        None => FinalCommit::Commit { use_pause: false },
    }
}

/// Offset to send to the coordinator, or `None` when there is nothing new.
///
/// Without a pause offset the commit point only moves forward. A pause
/// offset caps the target and may move it backwards so the overloaded record
/// is delivered again.
pub fn commit_target(safe: i64, pause: Option<i64>, last_committed: i64) -> Option<i64> {
    if safe < 0 {
        return None;
    }
    let target = match pause {
        Some(pause) => pause.min(safe),
        None if safe > last_committed => safe,
        None => return None,
    };
    (target != last_committed).then_some(target)
}

impl<B, S, D> PartitionFetcher<B, S, D>
where
    B: BrokerClient,
    S: Sink,
    D: Decoder,
{
    /// Sends the safe offset (capped by the pause offset when `use_pause`) to
    /// the group coordinator. Returns the committed offset, or `None` when
    /// there was nothing to commit. Failures are left for the next attempt.
    pub(crate) async fn commit_offset(&mut self, use_pause: bool) -> Result<Option<i64>, BrokerError> {
        let pause = if use_pause {
            self.progress.pause.get()
        } else {
            None
        };
        let Some(target) = commit_target(
            self.progress.gap.safe(),
            pause,
            self.last_committed_offset,
        ) else {
            return Ok(None);
        };
        if let Some(pause) = pause {
            info!(
                partition = %self.config.partition,
                pause,
                offset = target,
                "Using paused offset to commit"
            );
        }

        let mut last_error = BrokerError::NotConnected { role: "coordinator" };
        for _ in 0..self.config.options.commit_retries {
            let Some(coordinator) = self.resolver.coordinator() else {
                throttled_warn!(
                    self.throttle,
                    "commit-no-coordinator",
                    partition = %self.config.partition,
                    "Commit failed to get offset coordinator"
                );
                self.resolver.resolve_coordinator().await;
                continue;
            };

            let result = coordinator
                .commit_offset(
                    &self.config.group_id,
                    &self.config.partition,
                    OffsetCommit::now(target),
                )
                .await;
            match result {
                Ok(()) => {
                    debug!(
                        partition = %self.config.partition,
                        offset = target,
                        "Committed offset"
                    );
                    self.last_committed_offset = target;
                    self.last_commit_at = Instant::now();
                    return Ok(Some(target));
                }
                Err(e) if e.is_coordinator_error() => {
                    info!(
                        partition = %self.config.partition,
                        error = %e,
                        "Not coordinator for committing offset, updating coordinator"
                    );
                    self.resolver.resolve_coordinator().await;
                    last_error = e;
                }
                Err(e) => {
                    throttled_warn!(
                        self.throttle,
                        "commit-failed",
                        partition = %self.config.partition,
                        offset = target,
                        error = %e,
                        "Failed to commit offset"
                    );
                    if e.is_network() {
                        self.resolver.resolve_coordinator().await;
                    }
                    return Err(e);
                }
            }
        }
        Err(last_error)
    }
}

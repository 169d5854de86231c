use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::sleep_or_cancel;
use crate::config::FetcherConfig;
use crate::decode::Decoder;
use crate::errors::BrokerError;
use crate::sink::{Completion, Sink};
use crate::source::commit::{FinalCommit, final_commit_decision};
use crate::source::resolver::Resolver;
use crate::source::{BrokerClient, BrokerConnection, FetchedRecord, PartitionIdentity};
use crate::telemetry::LogThrottle;
use crate::throttled_warn;
use crate::tracker::PartitionProgress;

/// Attempts per offset lookup before the caller backs off.
const LOOKUP_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetcherState {
    Init,
    ResolvingOffset,
    Fetching,
    Draining,
    Stopped,
}

/// Reported by a fetcher when it stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetcherSummary {
    pub partition: PartitionIdentity,
    /// `-1` when nothing was ever committed.
    pub last_committed_offset: i64,
    pub submitted: u64,
    pub callbacks: u64,
    pub failed: u64,
}

enum FetchStep {
    Fetched(usize),
    /// Fetch connection is unusable, find the leader again.
    Failover,
    /// The cursor is invalid and must be resolved from scratch.
    Reset,
}

enum LogEnd {
    Earliest,
    Latest,
}

/// Drives the ingestion of one partition: resolves the starting offset,
/// fetches batches from the leader, hands each record to the sink and
/// commits the safe offset to the group coordinator.
///
/// Completion callbacks run wherever the sink runs them; they only touch the
/// shared [`PartitionProgress`]. Everything else belongs to the task calling
/// [`PartitionFetcher::run`].
pub struct PartitionFetcher<B: BrokerClient, S: Sink, D: Decoder> {
    pub(super) config: FetcherConfig,
    pub(super) resolver: Resolver<B>,
    sink: S,
    decoder: D,
    pub(super) progress: Arc<PartitionProgress>,
    shutdown: CancellationToken,
    pub(super) throttle: LogThrottle,
    state: watch::Sender<FetcherState>,

    /// Next offset to fetch, `-1` when unknown.
    current_offset: i64,
    pub(super) last_committed_offset: i64,
    pub(super) last_commit_at: Instant,
    submitted: u64,
}

impl<B, S, D> PartitionFetcher<B, S, D>
where
    B: BrokerClient,
    S: Sink,
    D: Decoder,
{
    pub fn new(
        config: FetcherConfig,
        client: Arc<B>,
        sink: S,
        decoder: D,
        shutdown: CancellationToken,
    ) -> Self {
        let resolver = Resolver::new(client, &config, shutdown.clone());
        let progress = Arc::new(PartitionProgress::new(
            config.options.gap_tracker_window,
            config.partition.to_string(),
        ));
        let (state, _) = watch::channel(FetcherState::Init);
        Self {
            config,
            resolver,
            sink,
            decoder,
            progress,
            shutdown,
            throttle: LogThrottle::default(),
            state,
            current_offset: -1,
            last_committed_offset: -1,
            last_commit_at: Instant::now(),
            submitted: 0,
        }
    }

    pub fn partition(&self) -> &PartitionIdentity {
        &self.config.partition
    }

    pub fn state(&self) -> FetcherState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<FetcherState> {
        self.state.subscribe()
    }

    pub fn progress(&self) -> Arc<PartitionProgress> {
        self.progress.clone()
    }

    fn set_state(&self, state: FetcherState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(partition = %self.config.partition, from = ?current, to = ?state, "Fetcher state change");
            *current = state;
            true
        });
    }

    fn should_stop(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return true;
        }
        self.config
            .options
            .max_errors
            .is_some_and(|max| self.progress.failed_count() >= max)
    }

    /// Runs until the shutdown token is cancelled (or the error budget is
    /// spent), then drains and makes the final commit.
    pub async fn run(mut self) -> FetcherSummary {
        info!(partition = %self.config.partition, "Starting partition fetcher");
        self.set_state(FetcherState::Init);
        self.resolver.connect_initial_leader().await;

        let backoff = self.config.options.backoff;
        let mut attempt = 1;
        while !self.should_stop() {
            if self.current_offset < 0 {
                self.set_state(FetcherState::ResolvingOffset);
                match self.resolve_start_offset().await {
                    Some(offset) => {
                        self.progress.gap.reset_to(offset);
                        self.last_committed_offset = offset;
                        self.current_offset = offset;
                        info!(
                            partition = %self.config.partition,
                            offset,
                            "Starting offset resolved"
                        );
                    }
                    None => {
                        info!(partition = %self.config.partition, "No valid offset found");
                        attempt = backoff.sleep(attempt, &self.shutdown).await;
                        continue;
                    }
                }
            }

            self.set_state(FetcherState::Fetching);
            match self.fetch_batch().await {
                FetchStep::Fetched(count) => {
                    attempt = 1;
                    if count == 0 {
                        sleep_or_cancel(self.config.wait_sleep(), &self.shutdown).await;
                    }
                }
                FetchStep::Failover => {
                    self.resolver.reset_leader().await;
                    continue;
                }
                FetchStep::Reset => {
                    attempt = backoff.sleep(attempt, &self.shutdown).await;
                    self.current_offset = -1;
                    continue;
                }
            }

            if self.should_stop() {
                break;
            }
            if self.config.options.commit_policy.should_commit(self.last_commit_at) {
                if let Err(e) = self.commit_offset(false).await {
                    debug!(partition = %self.config.partition, error = %e, "Periodic commit failed");
                }
            }
        }

        if !self.shutdown.is_cancelled() {
            error!(
                partition = %self.config.partition,
                failed = self.progress.failed_count(),
                "Too many failed records, stopping partition fetcher"
            );
        }
        self.drain_and_stop().await
    }

    /// Starting point: the group's committed offset clamped into the range
    /// the log still retains. `None` when any lookup failed.
    async fn resolve_start_offset(&mut self) -> Option<i64> {
        self.resolver.resolve_coordinator().await;
        if self.resolver.coordinator().is_none() {
            return None;
        }

        let earliest = self.log_offset(LogEnd::Earliest).await?;
        let latest = self.log_offset(LogEnd::Latest).await?;
        if latest == earliest {
            return Some(latest);
        }

        match self.committed_offset().await {
            Ok(committed) => Some(clamp_offset(committed, earliest, latest)),
            Err(e) => {
                throttled_warn!(
                    self.throttle,
                    "committed-offset",
                    partition = %self.config.partition,
                    error = %e,
                    "Unable to fetch committed offset"
                );
                None
            }
        }
    }

    async fn log_offset(&mut self, end: LogEnd) -> Option<i64> {
        let mut fault = BrokerError::NotConnected { role: "leader" };
        for _ in 0..LOOKUP_ATTEMPTS {
            let Some(leader) = self.resolver.leader() else {
                self.resolver.reset_leader().await;
                continue;
            };
            let result = match end {
                LogEnd::Earliest => leader.earliest_offset(&self.config.partition).await,
                LogEnd::Latest => leader.latest_offset(&self.config.partition).await,
            };
            match result {
                Ok(offset) => return Some(offset),
                Err(e) => {
                    fault = e;
                    self.resolver.reset_leader().await;
                }
            }
            if self.shutdown.is_cancelled() {
                break;
            }
        }
        throttled_warn!(
            self.throttle,
            "log-offset",
            partition = %self.config.partition,
            error = %fault,
            "Unable to fetch log offset"
        );
        None
    }

    async fn committed_offset(&mut self) -> Result<Option<i64>, BrokerError> {
        let backoff = self.config.options.backoff;
        let mut fault = BrokerError::NotConnected { role: "coordinator" };
        for attempt in 0..LOOKUP_ATTEMPTS {
            let Some(coordinator) = self.resolver.coordinator() else {
                self.resolver.resolve_coordinator().await;
                continue;
            };
            let result = coordinator
                .fetch_committed_offset(&self.config.group_id, &self.config.partition)
                .await;
            match result {
                Ok(offset) => return Ok(offset),
                Err(e) if e.is_network() => {
                    self.resolver.resolve_coordinator().await;
                    fault = e;
                }
                Err(e) => {
                    backoff.sleep(attempt + 1, &self.shutdown).await;
                    if e.is_coordinator_error()
                        || matches!(e, BrokerError::UnknownTopicOrPartition { .. })
                    {
                        self.resolver.resolve_coordinator().await;
                    }
                    fault = e;
                }
            }
            if self.shutdown.is_cancelled() {
                break;
            }
        }
        Err(fault)
    }

    async fn fetch_batch(&mut self) -> FetchStep {
        let Some(leader) = self.resolver.leader() else {
            return FetchStep::Failover;
        };
        let result = leader
            .fetch(
                &self.config.partition,
                self.current_offset,
                self.config.options.fetch_max_bytes,
            )
            .await;

        match result {
            Ok(records) => {
                let count = records.len();
                for record in records {
                    if record.offset < self.current_offset {
                        continue;
                    }
                    self.process_record(record);
                    if self.should_stop() {
                        break;
                    }
                }
                FetchStep::Fetched(count)
            }
            Err(BrokerError::OffsetOutOfRange { offset }) => {
                warn!(
                    partition = %self.config.partition,
                    offset,
                    "Invalid offset requested, resolving the starting offset again"
                );
                FetchStep::Reset
            }
            Err(e) if e.is_network() => {
                throttled_warn!(
                    self.throttle,
                    "fetch-network",
                    partition = %self.config.partition,
                    error = %e,
                    "Failed to fetch"
                );
                FetchStep::Failover
            }
            Err(e) => {
                throttled_warn!(
                    self.throttle,
                    "fetch-error",
                    partition = %self.config.partition,
                    error = %e,
                    "Failed to fetch messages"
                );
                self.config.options.backoff.sleep(1, &self.shutdown).await;
                FetchStep::Failover
            }
        }
    }

    fn process_record(&mut self, record: FetchedRecord) {
        let FetchedRecord {
            offset,
            next_offset,
            payload,
        } = record;
        self.progress.gap.submit(next_offset);

        match self.decoder.decode(&payload) {
            Ok(params) => {
                self.progress.pending.produce_work();
                let completion = Completion::new(offset, next_offset, self.progress.clone());
                // A refused completion is dropped by the sink, which withdraws
                // its pending work.
                if let Err(e) = self.sink.invoke(params, completion) {
                    debug!(
                        partition = %self.config.partition,
                        offset,
                        error = %e,
                        "Failed to process invocation, possibly bad data"
                    );
                    self.progress.record_failure();
                    self.progress.gap.commit(next_offset);
                }
            }
            Err(e) => {
                throttled_warn!(
                    self.throttle,
                    "decode",
                    partition = %self.config.partition,
                    offset,
                    error = %e,
                    "Failed to transform data"
                );
                self.progress.record_failure();
                self.progress.gap.commit(next_offset);
            }
        }

        self.submitted += 1;
        self.current_offset = next_offset;
    }

    async fn drain_and_stop(mut self) -> FetcherSummary {
        self.set_state(FetcherState::Draining);
        let drained = self
            .progress
            .pending
            .wait_for_drain(self.config.drain_timeout())
            .await;
        if !drained {
            warn!(
                partition = %self.config.partition,
                outstanding = self.progress.pending.outstanding(),
                "Timed out waiting for pending invocations to finish"
            );
        }

        let pause = self.progress.pause.get();
        match final_commit_decision(drained, pause, self.last_committed_offset) {
            FinalCommit::Skip => {
                warn!(
                    partition = %self.config.partition,
                    pause = ?pause,
                    last_committed = self.last_committed_offset,
                    "Refusing to commit paused offset because a timeout occurred waiting for pending invocations"
                );
            }
            FinalCommit::Commit { use_pause } => {
                if let Err(e) = self.commit_offset(use_pause).await {
                    warn!(partition = %self.config.partition, error = %e, "Final commit failed");
                }
            }
        }

        self.resolver.close().await;
        self.set_state(FetcherState::Stopped);

        let summary = FetcherSummary {
            partition: self.config.partition.clone(),
            last_committed_offset: self.last_committed_offset,
            submitted: self.submitted,
            callbacks: self.progress.pending.callback_count(),
            failed: self.progress.failed_count(),
        };
        info!(
            partition = %summary.partition,
            last_committed = summary.last_committed_offset,
            callbacks = summary.callbacks,
            submitted = summary.submitted,
            "Partition fetcher stopped"
        );
        summary
    }
}

/// Clamps the group's committed offset into `[earliest, latest]`. An unknown
/// committed offset starts from the earliest retained record.
pub fn clamp_offset(committed: Option<i64>, earliest: i64, latest: i64) -> i64 {
    match committed {
        Some(offset) if offset > latest => latest,
        Some(offset) if offset >= earliest => offset,
        _ => earliest,
    }
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{MockCluster, broker, eventually, fetcher_config};
use ingest_core::config::FetcherConfig;
use ingest_core::decode::{Decoder, JsonDecoder};
use ingest_core::errors::{DecodeError, SinkError};
use ingest_core::sink::{ChannelSink, Completion, Invocation, InvokeStatus, Param, Sink};
use ingest_core::source::{FetcherState, FetcherSummary, PartitionFetcher};
use ingest_core::tracker::PartitionProgress;

/// Executes invocations from a [`ChannelSink`]. `decide` picks the outcome
/// per record offset; `None` holds the completion without answering.
struct Executor {
    offsets: Arc<Mutex<Vec<i64>>>,
    held: Arc<Mutex<Vec<Completion>>>,
}

impl Executor {
    fn spawn(
        mut rx: mpsc::Receiver<Invocation>,
        decide: impl Fn(i64) -> Option<InvokeStatus> + Send + 'static,
    ) -> Self {
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let held = Arc::new(Mutex::new(Vec::new()));
        let (seen, parked) = (offsets.clone(), held.clone());
        tokio::spawn(async move {
            while let Some(Invocation { params, completion }) = rx.recv().await {
                let offset = completion.offset();
                assert_eq!(params[0]["offset"], offset);
                seen.lock().push(offset);
                match decide(offset) {
                    Some(status) => completion.complete(status),
                    None => parked.lock().push(completion),
                }
            }
        });
        Self { offsets, held }
    }

    fn offsets(&self) -> Vec<i64> {
        self.offsets.lock().clone()
    }
}

struct RejectingSink;

impl Sink for RejectingSink {
    fn invoke(&self, _params: Vec<Param>, _completion: Completion) -> Result<(), SinkError> {
        Err(SinkError::Rejected {
            reason: "bad data".to_string(),
        })
    }
}

struct Running {
    shutdown: CancellationToken,
    progress: Arc<PartitionProgress>,
    handle: tokio::task::JoinHandle<FetcherSummary>,
}

impl Running {
    async fn stop(self) -> FetcherSummary {
        self.shutdown.cancel();
        self.handle.await.unwrap()
    }
}

/// Decodes JSON but fails the record carrying `offset`.
struct FailingAt(i64);

impl Decoder for FailingAt {
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<Param>, DecodeError> {
        let params = JsonDecoder.decode(payload)?;
        if params[0]["offset"] == self.0 {
            return Err(DecodeError::Malformed {
                reason: "unexpected column".to_string(),
            });
        }
        Ok(params)
    }
}

fn start<S: Sink>(cluster: &MockCluster, config: FetcherConfig, sink: S) -> Running {
    start_with_decoder(cluster, config, sink, JsonDecoder)
}

fn start_with_decoder<S: Sink, D: Decoder>(
    cluster: &MockCluster,
    config: FetcherConfig,
    sink: S,
    decoder: D,
) -> Running {
    let shutdown = CancellationToken::new();
    let fetcher = PartitionFetcher::new(config, cluster.client(), sink, decoder, shutdown.clone());
    let progress = fetcher.progress();
    Running {
        shutdown,
        progress,
        handle: tokio::spawn(fetcher.run()),
    }
}

fn succeed_all(_offset: i64) -> Option<InvokeStatus> {
    Some(InvokeStatus::Success)
}

#[tokio::test]
async fn test_start_offset_clamped_up_to_earliest() {
    let cluster = MockCluster::new(broker("kafka-1"), 100, 110);
    cluster.with(|s| s.committed = Some(50));
    let (sink, rx) = ChannelSink::new(64);
    let executor = Executor::spawn(rx, succeed_all);

    let running = start(&cluster, fetcher_config(vec![broker("kafka-1")]), sink);
    eventually("all records committed", || cluster.committed() == Some(110)).await;
    let summary = running.stop().await;

    assert_eq!(executor.offsets(), (100..110).collect::<Vec<_>>());
    assert_eq!(cluster.with(|s| s.fetches[0].1), 100);
    assert_eq!(summary.last_committed_offset, 110);
    assert_eq!(summary.submitted, 10);
    assert_eq!(summary.callbacks, 10);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn test_start_offset_clamped_down_to_latest() {
    let cluster = MockCluster::new(broker("kafka-1"), 100, 500);
    cluster.with(|s| s.committed = Some(1000));
    let (sink, rx) = ChannelSink::new(64);
    let executor = Executor::spawn(rx, succeed_all);

    let running = start(&cluster, fetcher_config(vec![broker("kafka-1")]), sink);
    eventually("first fetch", || cluster.with(|s| !s.fetches.is_empty())).await;
    let summary = running.stop().await;

    assert_eq!(cluster.with(|s| s.fetches[0].1), 500);
    assert!(executor.offsets().is_empty());
    assert_eq!(summary.last_committed_offset, 500);
    assert_eq!(summary.submitted, 0);
}

#[tokio::test]
async fn test_empty_log_starts_at_latest() {
    let cluster = MockCluster::new(broker("kafka-1"), 42, 42);
    cluster.with(|s| s.committed = Some(7));
    let (sink, _rx) = ChannelSink::new(8);

    let running = start(&cluster, fetcher_config(vec![broker("kafka-1")]), sink);
    eventually("first fetch", || cluster.with(|s| !s.fetches.is_empty())).await;
    let summary = running.stop().await;

    assert_eq!(cluster.with(|s| s.fetches[0].1), 42);
    assert_eq!(summary.last_committed_offset, 42);
}

#[tokio::test]
async fn test_committed_offset_lookup_retries() {
    let cluster = MockCluster::new(broker("kafka-1"), 0, 4);
    cluster.with(|s| {
        s.committed = Some(2);
        s.committed_fetch_failures = 2;
    });
    let (sink, rx) = ChannelSink::new(64);
    let executor = Executor::spawn(rx, succeed_all);

    let running = start(&cluster, fetcher_config(vec![broker("kafka-1")]), sink);
    eventually("records committed", || cluster.committed() == Some(4)).await;
    running.stop().await;

    assert_eq!(executor.offsets(), vec![2, 3]);
}

#[tokio::test]
async fn test_rejected_records_do_not_block_commits() {
    let cluster = MockCluster::new(broker("kafka-1"), 0, 5);

    let running = start(&cluster, fetcher_config(vec![broker("kafka-1")]), RejectingSink);
    let progress = running.progress.clone();
    eventually("offsets committed", || cluster.committed() == Some(5)).await;
    let summary = running.stop().await;

    assert_eq!(progress.pending.outstanding(), 0);
    assert_eq!(summary.submitted, 5);
    assert_eq!(summary.failed, 5);
    assert_eq!(summary.callbacks, 0);
    assert_eq!(summary.last_committed_offset, 5);
}

#[tokio::test]
async fn test_decode_failure_does_not_block_commits() {
    let cluster = MockCluster::new(broker("kafka-1"), 10, 13);
    let (sink, rx) = ChannelSink::new(64);
    let executor = Executor::spawn(rx, succeed_all);

    let running = start_with_decoder(
        &cluster,
        fetcher_config(vec![broker("kafka-1")]),
        sink,
        FailingAt(11),
    );
    eventually("offsets committed", || cluster.committed() == Some(13)).await;
    let summary = running.stop().await;

    assert_eq!(executor.offsets(), vec![10, 12]);
    assert_eq!(summary.submitted, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.callbacks, 2);
    assert_eq!(summary.last_committed_offset, 13);
}

#[tokio::test]
async fn test_max_errors_stops_fetcher() {
    let cluster = MockCluster::new(broker("kafka-1"), 0, 5);
    let mut config = fetcher_config(vec![broker("kafka-1")]);
    config.options.max_errors = Some(3);

    let running = start(&cluster, config, RejectingSink);
    let summary = tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .expect("fetcher should stop by itself")
        .unwrap();

    assert_eq!(summary.failed, 3);
    assert_eq!(summary.submitted, 3);
    assert_eq!(summary.last_committed_offset, 3);
    assert_eq!(cluster.committed(), Some(3));
    assert!(!running.shutdown.is_cancelled());
}

#[tokio::test]
async fn test_shutdown_commits_pause_offset() {
    let cluster = MockCluster::new(broker("kafka-1"), 5, 8);
    cluster.with(|s| s.committed = Some(5));
    let (sink, rx) = ChannelSink::new(64);
    let executor = Executor::spawn(rx, |offset| {
        Some(if offset == 6 {
            InvokeStatus::TransientOverload
        } else {
            InvokeStatus::Success
        })
    });

    let running = start(&cluster, fetcher_config(vec![broker("kafka-1")]), sink);
    let progress = running.progress.clone();
    eventually("all callbacks", || progress.pending.callback_count() == 3).await;
    let summary = running.stop().await;

    assert_eq!(executor.offsets(), vec![5, 6, 7]);
    assert_eq!(progress.pause.get(), Some(6));
    assert_eq!(progress.gap.safe(), 6);
    assert_eq!(summary.last_committed_offset, 6);
    assert_eq!(cluster.committed(), Some(6));
    assert!(cluster.with(|s| s.commits.iter().all(|(_, offset)| *offset <= 6)));
}

#[tokio::test]
async fn test_drain_timeout_commits_safe_offset() {
    let cluster = MockCluster::new(broker("kafka-1"), 0, 3);
    let mut config = fetcher_config(vec![broker("kafka-1")]);
    config.options.drain_timeout_ms = 200;
    let (sink, rx) = ChannelSink::new(64);
    let executor = Executor::spawn(rx, |offset| (offset != 1).then_some(InvokeStatus::Success));

    let running = start(&cluster, config, sink);
    let progress = running.progress.clone();
    eventually("two callbacks", || progress.pending.callback_count() == 2).await;
    let summary = running.stop().await;

    assert_eq!(progress.pending.outstanding(), 1);
    assert_eq!(summary.last_committed_offset, 1);
    assert_eq!(summary.callbacks, 2);
    assert_eq!(cluster.committed(), Some(1));
    assert_eq!(executor.held.lock().len(), 1);
}

#[tokio::test]
async fn test_timed_out_drain_skips_commit_below_pause() {
    let cluster = MockCluster::new(broker("kafka-1"), 5, 8);
    cluster.with(|s| s.committed = Some(5));
    let mut config = fetcher_config(vec![broker("kafka-1")]);
    config.options.drain_timeout_ms = 200;
    let (sink, rx) = ChannelSink::new(64);
    let executor = Executor::spawn(rx, |offset| (offset == 5).then_some(InvokeStatus::Success));

    let running = start(&cluster, config, sink);
    let progress = running.progress.clone();
    eventually("record 5 committed", || cluster.committed() == Some(6)).await;
    eventually("records 6 and 7 held", || executor.held.lock().len() == 2).await;

    // Retention moves past the cursor, so the fetcher restarts at 9.
    cluster.with(|s| {
        s.earliest = 9;
        s.latest = 9;
    });
    eventually("fetching from 9", || {
        cluster.with(|s| s.fetches.last().map(|(_, offset)| *offset) == Some(9))
    })
    .await;

    let overloaded = {
        let mut held = executor.held.lock();
        let idx = held.iter().position(|c| c.offset() == 6).unwrap();
        held.remove(idx)
    };
    overloaded.complete(InvokeStatus::TransientOverload);
    assert_eq!(progress.pause.get(), Some(6));

    let commits_before = cluster.with(|s| s.commits.len());
    let summary = running.stop().await;

    assert_eq!(progress.pending.outstanding(), 1);
    assert_eq!(summary.last_committed_offset, 9);
    assert_eq!(cluster.with(|s| s.commits.len()), commits_before);
    assert_eq!(cluster.committed(), Some(6));
}

#[tokio::test]
async fn test_out_of_range_offset_resolves_again() {
    let cluster = MockCluster::new(broker("kafka-1"), 0, 3);
    let (sink, rx) = ChannelSink::new(64);
    let executor = Executor::spawn(rx, succeed_all);

    let running = start(&cluster, fetcher_config(vec![broker("kafka-1")]), sink);
    eventually("first records committed", || cluster.committed() == Some(3)).await;
    cluster.with(|s| {
        s.earliest = 10;
        s.latest = 12;
    });
    eventually("records after truncation", || cluster.committed() == Some(12)).await;
    let summary = running.stop().await;

    assert_eq!(executor.offsets(), vec![0, 1, 2, 10, 11]);
    assert_eq!(summary.last_committed_offset, 12);
}

#[tokio::test]
async fn test_leader_failover_ignores_stale_metadata() {
    let (kafka_1, kafka_2) = (broker("kafka-1"), broker("kafka-2"));
    let cluster = MockCluster::new(kafka_1.clone(), 0, 3);
    let (sink, rx) = ChannelSink::new(64);
    let executor = Executor::spawn(rx, succeed_all);

    let running = start(
        &cluster,
        fetcher_config(vec![kafka_1.clone(), kafka_2.clone()]),
        sink,
    );
    eventually("first records committed", || cluster.committed() == Some(3)).await;
    cluster.with(|s| {
        s.down.insert(kafka_1.clone());
        s.leader = kafka_2.clone();
        s.coordinator = kafka_2.clone();
        s.stale_metadata.push_back(kafka_1.clone());
        s.latest = 6;
    });
    eventually("records from new leader", || cluster.committed() == Some(6)).await;
    let summary = running.stop().await;

    assert_eq!(executor.offsets(), (0..6).collect::<Vec<_>>());
    assert!(cluster.with(|s| s.fetches.contains(&(kafka_2.clone(), 3))));
    assert!(cluster.with(|s| s.stale_metadata.is_empty()));
    assert_eq!(cluster.with(|s| s.commits.last().cloned()), Some((kafka_2, 6)));
    assert_eq!(summary.last_committed_offset, 6);
}

#[tokio::test]
async fn test_commit_follows_moved_coordinator() {
    let (kafka_1, kafka_2) = (broker("kafka-1"), broker("kafka-2"));
    let cluster = MockCluster::new(kafka_1.clone(), 0, 3);
    let (sink, rx) = ChannelSink::new(64);
    let _executor = Executor::spawn(rx, succeed_all);

    let running = start(
        &cluster,
        fetcher_config(vec![kafka_1.clone(), kafka_2.clone()]),
        sink,
    );
    eventually("first records committed", || cluster.committed() == Some(3)).await;
    cluster.with(|s| {
        s.coordinator = kafka_2.clone();
        s.latest = 5;
    });
    eventually("commit on new coordinator", || cluster.committed() == Some(5)).await;
    running.stop().await;

    let commits = cluster.with(|s| s.commits.clone());
    assert!(commits.contains(&(kafka_1, 3)));
    assert_eq!(commits.last(), Some(&(kafka_2, 5)));
}

#[tokio::test]
async fn test_state_transitions() {
    let cluster = MockCluster::new(broker("kafka-1"), 0, 1);
    let (sink, rx) = ChannelSink::new(8);
    let _executor = Executor::spawn(rx, succeed_all);

    let shutdown = CancellationToken::new();
    let fetcher = PartitionFetcher::new(
        fetcher_config(vec![broker("kafka-1")]),
        cluster.client(),
        sink,
        JsonDecoder,
        shutdown.clone(),
    );
    assert_eq!(fetcher.state(), FetcherState::Init);
    let mut state = fetcher.subscribe_state();
    let handle = tokio::spawn(fetcher.run());

    state
        .wait_for(|s| *s == FetcherState::Fetching)
        .await
        .unwrap();
    shutdown.cancel();
    let summary = handle.await.unwrap();

    assert_eq!(*state.borrow(), FetcherState::Stopped);
    assert_eq!(summary.partition.to_string(), "orders-0");
}

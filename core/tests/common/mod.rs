#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use ingest_core::backoff::Backoff;
use ingest_core::config::FetcherConfig;
use ingest_core::errors::BrokerError;
use ingest_core::source::{
    BrokerClient, BrokerConnection, FetchedRecord, HostAndPort, OffsetCommit, PartitionIdentity,
    PartitionMetadata, TopicMetadata,
};

pub const TOPIC: &str = "orders";
pub const PARTITION: i32 = 0;
pub const GROUP: &str = "importer";

pub fn broker(name: &str) -> HostAndPort {
    HostAndPort::new(name, 9092)
}

/// State of a single-partition cluster shared by every mock connection.
#[derive(Debug)]
pub struct ClusterState {
    pub leader: HostAndPort,
    pub coordinator: HostAndPort,
    pub down: HashSet<HostAndPort>,
    pub earliest: i64,
    pub latest: i64,
    pub committed: Option<i64>,
    /// Answers returned by metadata requests before falling back to `leader`.
    pub stale_metadata: VecDeque<HostAndPort>,
    pub fetches: Vec<(HostAndPort, i64)>,
    pub commits: Vec<(HostAndPort, i64)>,
    pub committed_fetch_failures: u32,
}

#[derive(Debug, Clone)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    pub fn new(leader: HostAndPort, earliest: i64, latest: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                coordinator: leader.clone(),
                leader,
                down: HashSet::new(),
                earliest,
                latest,
                committed: None,
                stale_metadata: VecDeque::new(),
                fetches: Vec::new(),
                commits: Vec::new(),
                committed_fetch_failures: 0,
            })),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut ClusterState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn client(&self) -> Arc<MockClient> {
        Arc::new(MockClient {
            cluster: self.clone(),
        })
    }

    pub fn committed(&self) -> Option<i64> {
        self.with(|s| s.committed)
    }

    fn check_up(&self, endpoint: &HostAndPort) -> Result<(), BrokerError> {
        if self.with(|s| s.down.contains(endpoint)) {
            return Err(BrokerError::Network {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

pub struct MockClient {
    cluster: MockCluster,
}

#[async_trait]
impl BrokerClient for MockClient {
    type Connection = MockConnection;

    async fn connect(
        &self,
        broker: &HostAndPort,
        _socket_timeout: Duration,
    ) -> Result<MockConnection, BrokerError> {
        self.cluster.check_up(broker)?;
        Ok(MockConnection {
            endpoint: broker.clone(),
            cluster: self.cluster.clone(),
        })
    }
}

pub struct MockConnection {
    endpoint: HostAndPort,
    cluster: MockCluster,
}

impl MockConnection {
    fn require_leader(&self, partition: &PartitionIdentity) -> Result<(), BrokerError> {
        self.cluster.check_up(&self.endpoint)?;
        if self.cluster.with(|s| s.leader != self.endpoint) {
            return Err(BrokerError::NotLeaderForPartition {
                topic: partition.topic.clone(),
                partition: partition.partition,
            });
        }
        Ok(())
    }

    fn require_coordinator(&self, group_id: &str) -> Result<(), BrokerError> {
        self.cluster.check_up(&self.endpoint)?;
        if self.cluster.with(|s| s.coordinator != self.endpoint) {
            return Err(BrokerError::NotCoordinator {
                group_id: group_id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    fn endpoint(&self) -> &HostAndPort {
        &self.endpoint
    }

    async fn topic_metadata(&self, topics: &[String]) -> Result<Vec<TopicMetadata>, BrokerError> {
        self.cluster.check_up(&self.endpoint)?;
        let leader = self
            .cluster
            .with(|s| s.stale_metadata.pop_front().unwrap_or_else(|| s.leader.clone()));
        Ok(topics
            .iter()
            .filter(|topic| *topic == TOPIC)
            .map(|topic| TopicMetadata {
                topic: topic.clone(),
                partitions: vec![PartitionMetadata {
                    partition: PARTITION,
                    leader: Some(leader.clone()),
                }],
            })
            .collect())
    }

    async fn fetch(
        &self,
        partition: &PartitionIdentity,
        offset: i64,
        _max_bytes: usize,
    ) -> Result<Vec<FetchedRecord>, BrokerError> {
        self.require_leader(partition)?;
        self.cluster.with(|s| {
            s.fetches.push((self.endpoint.clone(), offset));
            if offset < s.earliest || offset > s.latest {
                return Err(BrokerError::OffsetOutOfRange { offset });
            }
            Ok((offset..s.latest)
                .map(|o| FetchedRecord::new(o, format!(r#"{{"offset": {o}}}"#)))
                .collect())
        })
    }

    async fn earliest_offset(&self, partition: &PartitionIdentity) -> Result<i64, BrokerError> {
        self.require_leader(partition)?;
        Ok(self.cluster.with(|s| s.earliest))
    }

    async fn latest_offset(&self, partition: &PartitionIdentity) -> Result<i64, BrokerError> {
        self.require_leader(partition)?;
        Ok(self.cluster.with(|s| s.latest))
    }

    async fn find_coordinator(&self, _group_id: &str) -> Result<HostAndPort, BrokerError> {
        self.cluster.check_up(&self.endpoint)?;
        Ok(self.cluster.with(|s| s.coordinator.clone()))
    }

    async fn fetch_committed_offset(
        &self,
        group_id: &str,
        _partition: &PartitionIdentity,
    ) -> Result<Option<i64>, BrokerError> {
        self.require_coordinator(group_id)?;
        self.cluster.with(|s| {
            if s.committed_fetch_failures > 0 {
                s.committed_fetch_failures -= 1;
                return Err(BrokerError::CoordinatorUnavailable {
                    group_id: group_id.to_string(),
                });
            }
            Ok(s.committed)
        })
    }

    async fn commit_offset(
        &self,
        group_id: &str,
        _partition: &PartitionIdentity,
        commit: OffsetCommit,
    ) -> Result<(), BrokerError> {
        self.require_coordinator(group_id)?;
        self.cluster.with(|s| {
            s.committed = Some(commit.offset);
            s.commits.push((self.endpoint.clone(), commit.offset));
        });
        Ok(())
    }

    async fn close(&self) {}
}

pub fn fetcher_config(brokers: Vec<HostAndPort>) -> FetcherConfig {
    let mut config = FetcherConfig::new(brokers, PartitionIdentity::new(TOPIC, PARTITION), GROUP);
    config.options.backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5));
    config.options.drain_timeout_ms = 2_000;
    config
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

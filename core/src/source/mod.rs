pub mod commit;
pub mod fetcher;
pub mod resolver;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{BrokerError, ConfigError};

pub use commit::CommitPolicy;
pub use fetcher::{FetcherState, FetcherSummary, PartitionFetcher};
pub use resolver::Resolver;

const DEFAULT_BROKER_PORT: u16 = 9092;

/// Topic and partition a fetcher is bound to. Never changes for the lifetime
/// of a fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionIdentity {
    pub topic: String,
    pub partition: i32,
}

impl PartitionIdentity {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A broker endpoint. Parsed from `host:port`; the port defaults to 9092.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host names compare case-insensitively.
    pub fn same_endpoint(&self, other: &HostAndPort) -> bool {
        self.port == other.port && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = |reason: &str| ConfigError::InvalidAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = match trimmed.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| invalid(&e.to_string()))?;
                (host, port)
            }
            None => (trimmed, DEFAULT_BROKER_PORT),
        };
        if host.is_empty() {
            return Err(invalid("host is empty"));
        }
        Ok(HostAndPort::new(host, port))
    }
}

impl TryFrom<String> for HostAndPort {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HostAndPort> for String {
    fn from(value: HostAndPort) -> Self {
        value.to_string()
    }
}

/// One record of a fetched batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRecord {
    pub offset: i64,
    pub next_offset: i64,
    pub payload: Vec<u8>,
}

impl FetchedRecord {
    pub fn new(offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            offset,
            next_offset: offset + 1,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub partition: i32,
    /// `None` while the partition has no elected leader.
    pub leader: Option<HostAndPort>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub topic: String,
    pub partitions: Vec<PartitionMetadata>,
}

/// Payload of an offset-commit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommit {
    pub offset: i64,
    pub metadata: String,
    pub committed_at: DateTime<Utc>,
}

impl OffsetCommit {
    pub fn now(offset: i64) -> Self {
        Self {
            offset,
            metadata: "commit".to_string(),
            committed_at: Utc::now(),
        }
    }
}

/// Opens connections to individual brokers of the cluster.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn connect(
        &self,
        broker: &HostAndPort,
        socket_timeout: Duration,
    ) -> Result<Self::Connection, BrokerError>;
}

/// A connection to a single broker. Used both as the fetch connection to a
/// partition leader and as the offset connection to a group coordinator.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    fn endpoint(&self) -> &HostAndPort;

    async fn topic_metadata(&self, topics: &[String]) -> Result<Vec<TopicMetadata>, BrokerError>;

    /// Records at or after `offset`, in offset order. An empty batch means
    /// there is nothing new yet.
    async fn fetch(
        &self,
        partition: &PartitionIdentity,
        offset: i64,
        max_bytes: usize,
    ) -> Result<Vec<FetchedRecord>, BrokerError>;

    async fn earliest_offset(&self, partition: &PartitionIdentity) -> Result<i64, BrokerError>;

    async fn latest_offset(&self, partition: &PartitionIdentity) -> Result<i64, BrokerError>;

    async fn find_coordinator(&self, group_id: &str) -> Result<HostAndPort, BrokerError>;

    /// `None` when the group has never committed for this partition.
    async fn fetch_committed_offset(
        &self,
        group_id: &str,
        partition: &PartitionIdentity,
    ) -> Result<Option<i64>, BrokerError>;

    async fn commit_offset(
        &self,
        group_id: &str,
        partition: &PartitionIdentity,
        commit: OffsetCommit,
    ) -> Result<(), BrokerError>;

    async fn close(&self);
}

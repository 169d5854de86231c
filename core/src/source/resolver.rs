use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::FetcherConfig;
use crate::errors::BrokerError;
use crate::source::{BrokerClient, BrokerConnection, HostAndPort, PartitionIdentity, PartitionMetadata};
use crate::telemetry::LogThrottle;
use crate::throttled_warn;

/// Attempts made by [`Resolver::find_new_leader`] and
/// [`Resolver::resolve_coordinator`] before giving up for this round.
const RESOLVE_ATTEMPTS: u32 = 3;

/// Keeps track of where one partition's data and offsets live: the partition
/// leader serving fetches, and the group coordinator storing committed
/// offsets. Owns a connection to each.
///
/// Nothing here is fatal. Failing lookups leave the connection absent and
/// callers retry on their next loop iteration.
pub struct Resolver<B: BrokerClient> {
    client: Arc<B>,
    partition: PartitionIdentity,
    group_id: String,
    brokers: Vec<HostAndPort>,
    socket_timeout: Duration,
    backoff: Backoff,
    shutdown: CancellationToken,
    throttle: LogThrottle,

    leader: Option<HostAndPort>,
    leader_conn: Option<B::Connection>,
    coordinator: Option<HostAndPort>,
    coordinator_conn: Option<B::Connection>,
}

impl<B: BrokerClient> Resolver<B> {
    pub fn new(client: Arc<B>, config: &FetcherConfig, shutdown: CancellationToken) -> Self {
        Self {
            client,
            partition: config.partition.clone(),
            group_id: config.group_id.clone(),
            brokers: config.brokers.clone(),
            socket_timeout: config.socket_timeout(),
            backoff: config.options.backoff,
            shutdown,
            throttle: LogThrottle::default(),
            leader: config.leader.clone(),
            leader_conn: None,
            coordinator: None,
            coordinator_conn: None,
        }
    }

    pub fn leader(&self) -> Option<&B::Connection> {
        self.leader_conn.as_ref()
    }

    pub fn leader_endpoint(&self) -> Option<&HostAndPort> {
        self.leader.as_ref()
    }

    pub fn coordinator(&self) -> Option<&B::Connection> {
        self.coordinator_conn.as_ref()
    }

    pub fn coordinator_endpoint(&self) -> Option<&HostAndPort> {
        self.coordinator.as_ref()
    }

    /// Asks each broker in turn for the topic metadata and returns this
    /// partition's entry from the first broker that reports it.
    pub async fn find_leader(&mut self) -> Option<PartitionMetadata> {
        let topics = [self.partition.topic.clone()];
        for broker in &self.brokers {
            let conn = match self.client.connect(broker, self.socket_timeout).await {
                Ok(conn) => conn,
                Err(e) => {
                    throttled_warn!(
                        self.throttle,
                        "find-leader",
                        partition = %self.partition,
                        broker = %broker,
                        error = %e,
                        "Error in finding leader"
                    );
                    continue;
                }
            };
            let metadata = conn.topic_metadata(&topics).await;
            conn.close().await;

            match metadata {
                Ok(metadata) => {
                    let found = metadata
                        .into_iter()
                        .filter(|topic| topic.topic == self.partition.topic)
                        .flat_map(|topic| topic.partitions)
                        .find(|p| p.partition == self.partition.partition);
                    if found.is_some() {
                        return found;
                    }
                }
                Err(e) => {
                    throttled_warn!(
                        self.throttle,
                        "find-leader",
                        partition = %self.partition,
                        broker = %broker,
                        error = %e,
                        "Error in finding leader"
                    );
                }
            }
        }
        throttled_warn!(
            self.throttle,
            "no-leader",
            partition = %self.partition,
            "Failed to find leader"
        );
        None
    }

    /// Looks for the partition's leader after a failure. On the first attempt
    /// an answer naming the current leader is not trusted yet: metadata may
    /// still describe the broker that just went away.
    pub async fn find_new_leader(&mut self) -> Option<HostAndPort> {
        let current = self.leader.clone();
        for attempt in 0..RESOLVE_ATTEMPTS {
            match self.find_leader().await.and_then(|metadata| metadata.leader) {
                Some(leader)
                    if attempt == 0
                        && current.as_ref().is_some_and(|c| c.same_endpoint(&leader)) =>
                {
                    debug!(
                        partition = %self.partition,
                        leader = %leader,
                        "Metadata still reports the current leader, waiting for it to settle"
                    );
                }
                Some(leader) => return Some(leader),
                None => {}
            }
            if attempt + 1 == RESOLVE_ATTEMPTS {
                break;
            }
            self.backoff.sleep(attempt + 1, &self.shutdown).await;
            if self.shutdown.is_cancelled() {
                break;
            }
        }
        throttled_warn!(
            self.throttle,
            "no-new-leader",
            partition = %self.partition,
            "Failed to find new leader"
        );
        None
    }

    /// First leader lookup at startup. Uses whatever metadata reports, falling
    /// back to the configured leader.
    pub async fn connect_initial_leader(&mut self) {
        if let Some(leader) = self.find_leader().await.and_then(|metadata| metadata.leader) {
            self.leader = Some(leader);
        }
        self.connect_leader().await;
    }

    /// Drops the fetch connection, looks for a new leader and reconnects.
    /// When no leader is found the previous one is tried again.
    pub async fn reset_leader(&mut self) {
        if let Some(conn) = self.leader_conn.take() {
            conn.close().await;
        }

        match self.find_new_leader().await {
            Some(leader) => {
                if !self.leader.as_ref().is_some_and(|l| l.same_endpoint(&leader)) {
                    info!(
                        partition = %self.partition,
                        leader = %leader,
                        "Found new leader"
                    );
                }
                self.leader = Some(leader);
            }
            None => {
                if let Some(leader) = &self.leader {
                    throttled_warn!(
                        self.throttle,
                        "old-leader",
                        partition = %self.partition,
                        leader = %leader,
                        "Failed to find leader, continuing with old leader"
                    );
                }
            }
        }
        self.connect_leader().await;
    }

    async fn connect_leader(&mut self) {
        let Some(leader) = self.leader.clone() else {
            return;
        };
        match self.client.connect(&leader, self.socket_timeout).await {
            Ok(conn) => self.leader_conn = Some(conn),
            Err(e) => {
                throttled_warn!(
                    self.throttle,
                    "leader-connect",
                    partition = %self.partition,
                    leader = %leader,
                    error = %e,
                    "Failed to connect to leader"
                );
            }
        }
    }

    /// Finds the group coordinator and installs a connection to it. The old
    /// connection is closed only after the new one is in place. On failure
    /// the previous connection, if any, is left as it was.
    pub async fn resolve_coordinator(&mut self) {
        for attempt in 0..RESOLVE_ATTEMPTS {
            let mut probe_error: Option<BrokerError> = None;
            for broker in &self.brokers {
                let endpoint = match self.client.connect(broker, self.socket_timeout).await {
                    Ok(conn) => {
                        let found = conn.find_coordinator(&self.group_id).await;
                        conn.close().await;
                        found
                    }
                    Err(e) => Err(e),
                };
                let endpoint = match endpoint {
                    Ok(endpoint) => endpoint,
                    Err(e) => {
                        probe_error = Some(e);
                        continue;
                    }
                };

                match self.client.connect(&endpoint, self.socket_timeout).await {
                    Ok(conn) => {
                        info!(
                            partition = %self.partition,
                            coordinator = %endpoint,
                            "Offset coordinator found"
                        );
                        let previous = self.coordinator_conn.replace(conn);
                        self.coordinator = Some(endpoint);
                        if let Some(previous) = previous {
                            previous.close().await;
                        }
                        return;
                    }
                    Err(e) => probe_error = Some(e),
                }
            }

            if let Some(e) = probe_error {
                warn!(
                    partition = %self.partition,
                    group_id = %self.group_id,
                    error = %e,
                    "Failed to query all brokers for the offset coordinator"
                );
            }
            if attempt + 1 == RESOLVE_ATTEMPTS {
                break;
            }
            self.backoff.sleep(attempt + 1, &self.shutdown).await;
            if self.shutdown.is_cancelled() {
                break;
            }
        }
    }

    /// Closes both connections.
    pub async fn close(&mut self) {
        if let Some(conn) = self.leader_conn.take() {
            conn.close().await;
        }
        if let Some(conn) = self.coordinator_conn.take() {
            conn.close().await;
        }
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::errors::ConfigError;
use crate::source::{CommitPolicy, HostAndPort, PartitionIdentity};
use crate::tracker::DEFAULT_GAP_WINDOW;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    pub version: u32,
    pub brokers: Vec<HostAndPort>,
    pub group_id: String,
    #[serde(default)]
    pub fetch: FetchOptions,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    pub topic: String,
    pub partitions: Vec<i32>,
    /// Known leader for the topic's partitions, used until metadata says
    /// otherwise.
    #[serde(default)]
    pub leader: Option<HostAndPort>,
}

/// Tunables shared by every partition fetcher.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchOptions {
    pub fetch_max_bytes: usize,
    pub socket_timeout_ms: u64,
    pub commit_policy: CommitPolicy,
    pub gap_tracker_window: usize,
    pub wait_sleep_ms: u64,
    pub drain_timeout_ms: u64,
    pub commit_retries: u32,
    pub backoff: Backoff,
    /// Stop the fetcher once this many records have failed.
    pub max_errors: Option<u64>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            fetch_max_bytes: 65_536,
            socket_timeout_ms: 30_000,
            commit_policy: CommitPolicy::None,
            gap_tracker_window: DEFAULT_GAP_WINDOW,
            wait_sleep_ms: 1,
            drain_timeout_ms: 5_000,
            commit_retries: 3,
            backoff: Backoff::default(),
            max_errors: None,
        }
    }
}

/// Everything a single partition fetcher needs. Each worker owns its copy.
#[derive(Debug, Clone, Serialize)]
pub struct FetcherConfig {
    pub brokers: Vec<HostAndPort>,
    pub partition: PartitionIdentity,
    pub group_id: String,
    pub leader: Option<HostAndPort>,
    pub options: FetchOptions,
}

impl FetcherConfig {
    pub fn new(
        brokers: Vec<HostAndPort>,
        partition: PartitionIdentity,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            brokers,
            partition,
            group_id: group_id.into(),
            leader: None,
            options: FetchOptions::default(),
        }
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.options.socket_timeout_ms)
    }

    pub fn wait_sleep(&self) -> Duration {
        Duration::from_millis(self.options.wait_sleep_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.options.drain_timeout_ms)
    }
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<IngestConfig> {
    let config = match config_path {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

impl IngestConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: IngestConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var("INGEST_CONFIG")
            .map_err(|_| anyhow::anyhow!("INGEST_CONFIG environment variable not set"))?;
        let config: IngestConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::MissingField {
                field: "brokers".to_string(),
            });
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "group_id".to_string(),
            });
        }
        if self.streams.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "At least one stream must be configured".to_string(),
            });
        }
        for stream in &self.streams {
            if stream.topic.trim().is_empty() {
                return Err(ConfigError::ValidationFailed {
                    reason: "Topic cannot be empty".to_string(),
                });
            }
            if stream.partitions.is_empty() {
                return Err(ConfigError::ValidationFailed {
                    reason: format!("Topic {} has no partitions", stream.topic),
                });
            }
            if let Some(p) = stream.partitions.iter().find(|p| **p < 0) {
                return Err(ConfigError::Invalid {
                    message: format!("Partition {} of topic {} is negative", p, stream.topic),
                });
            }
        }

        let fetch = &self.fetch;
        if fetch.gap_tracker_window == 0 {
            return Err(ConfigError::Invalid {
                message: "gap_tracker_window must be positive".to_string(),
            });
        }
        if fetch.fetch_max_bytes == 0 {
            return Err(ConfigError::Invalid {
                message: "fetch_max_bytes must be positive".to_string(),
            });
        }
        if fetch.commit_retries == 0 {
            return Err(ConfigError::Invalid {
                message: "commit_retries must be positive".to_string(),
            });
        }
        if let CommitPolicy::Time { interval_ms: 0 } = fetch.commit_policy {
            return Err(ConfigError::Invalid {
                message: "time commit policy needs a positive interval_ms".to_string(),
            });
        }
        Ok(())
    }

    /// One fetcher configuration per `(topic, partition)`.
    pub fn fetcher_configs(&self) -> Vec<FetcherConfig> {
        self.streams
            .iter()
            .flat_map(|stream| {
                stream.partitions.iter().map(move |partition| FetcherConfig {
                    brokers: self.brokers.clone(),
                    partition: PartitionIdentity::new(stream.topic.clone(), *partition),
                    group_id: self.group_id.clone(),
                    leader: stream.leader.clone(),
                    options: self.fetch.clone(),
                })
            })
            .collect()
    }
}

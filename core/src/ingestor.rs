use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::IngestConfig;
use crate::decode::Decoder;
use crate::sink::Sink;
use crate::source::{BrokerClient, FetcherSummary, PartitionFetcher};

/// The ingestor runs one [`PartitionFetcher`] task per configured
/// `(topic, partition)`, all stopped through a shared shutdown token.
pub struct Ingestor {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<FetcherSummary>>,
}

impl Ingestor {
    /// Spawns the fetchers onto the current tokio runtime. Every fetcher gets
    /// its own decoder from `decoder_factory` and a clone of `sink`.
    pub fn start<B, S, D, F>(
        config: &IngestConfig,
        client: Arc<B>,
        sink: S,
        mut decoder_factory: F,
    ) -> Self
    where
        B: BrokerClient,
        S: Sink + Clone,
        D: Decoder,
        F: FnMut() -> D,
    {
        let shutdown = CancellationToken::new();
        let tasks: Vec<_> = config
            .fetcher_configs()
            .into_iter()
            .map(|fetcher_config| {
                let fetcher = PartitionFetcher::new(
                    fetcher_config,
                    client.clone(),
                    sink.clone(),
                    decoder_factory(),
                    shutdown.clone(),
                );
                tokio::spawn(fetcher.run())
            })
            .collect();
        info!(fetchers = tasks.len(), group_id = %config.group_id, "Ingestor started");
        Self { shutdown, tasks }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn fetcher_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signals every fetcher to stop and waits for their final commits.
    pub async fn shutdown(self) -> Vec<FetcherSummary> {
        info!("Shutting down ingestor");
        self.shutdown.cancel();
        self.wait().await
    }

    /// Waits for the fetchers without signalling them. Returns once all of
    /// them stopped on their own or through the shutdown token.
    pub async fn wait(self) -> Vec<FetcherSummary> {
        join_all(self.tasks)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(summary) => Some(summary),
                Err(e) => {
                    error!(error = %e, "Partition fetcher task failed");
                    None
                }
            })
            .collect()
    }

    /// Runs until Ctrl-C, then shuts down gracefully.
    pub async fn run_until_ctrl_c(self) -> Vec<FetcherSummary> {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        self.shutdown().await
    }
}

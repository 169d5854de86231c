pub mod backoff;
pub mod config;
pub mod decode;
pub mod errors;
pub mod ingestor;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod tracker;

pub use config::{FetchOptions, FetcherConfig, IngestConfig, load_config};
pub use errors::{BrokerError, ConfigError, DecodeError, SinkError};
pub use ingestor::Ingestor;
pub use source::{BrokerClient, BrokerConnection, FetcherSummary, PartitionFetcher};

use thiserror::Error;

/// Errors reported by a broker connection, either from the transport or as a
/// protocol error code in a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Network error talking to {endpoint}: {reason}")]
    Network { endpoint: String, reason: String },

    #[error("Requested offset {offset} is out of range")]
    OffsetOutOfRange { offset: i64 },

    #[error("Broker is not the coordinator for group {group_id}")]
    NotCoordinator { group_id: String },

    #[error("Coordinator for group {group_id} is not available")]
    CoordinatorUnavailable { group_id: String },

    #[error("Unknown topic or partition {topic}-{partition}")]
    UnknownTopicOrPartition { topic: String, partition: i32 },

    #[error("Broker is not the leader for {topic}-{partition}")]
    NotLeaderForPartition { topic: String, partition: i32 },

    #[error("Broker returned error code {code}")]
    Protocol { code: i16 },

    #[error("No connection to {role}")]
    NotConnected { role: &'static str },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Payload is not valid UTF-8: {reason}")]
    InvalidUtf8 { reason: String },

    #[error("Malformed record: {reason}")]
    Malformed { reason: String },

    #[error("Payload is empty")]
    Empty,
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink rejected invocation: {reason}")]
    Rejected { reason: String },

    #[error("Batch write of {rows} rows failed: {reason}")]
    BatchWrite { rows: usize, reason: String },

    #[error("Sink is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Invalid broker address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::Malformed {
            reason: err.to_string(),
        }
    }
}

impl From<csv::Error> for DecodeError {
    fn from(err: csv::Error) -> Self {
        match err.kind() {
            csv::ErrorKind::Utf8 { err, .. } => DecodeError::InvalidUtf8 {
                reason: err.to_string(),
            },
            _ => DecodeError::Malformed {
                reason: err.to_string(),
            },
        }
    }
}

impl BrokerError {
    /// Transport-level failures, which call for a leader or coordinator
    /// re-resolution rather than a targeted protocol response.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            BrokerError::Network { .. } | BrokerError::NotConnected { .. }
        )
    }

    pub fn is_coordinator_error(&self) -> bool {
        matches!(
            self,
            BrokerError::NotCoordinator { .. } | BrokerError::CoordinatorUnavailable { .. }
        )
    }
}

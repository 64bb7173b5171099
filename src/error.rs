//! Error types shared by the sensor and the receiver.
use thiserror::Error;

/// Reasons a delivery payload cannot be turned into a reading.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not a valid reading: {0}")]
    Json(#[from] serde_json::Error),
    #[error("reading has an empty sensor id")]
    EmptySensorId,
}

/// Failures reported by a queue service connection.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection failed: {0}")]
    Connection(String),
    #[error("queue '{queue}' already declared with different properties")]
    DeclareMismatch { queue: String },
    #[error("queue declaration failed: {0}")]
    Declare(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("consume failed: {0}")]
    Consume(String),
    #[error("acknowledging delivery {tag} failed: {reason}")]
    Ack { tag: u64, reason: String },
    #[error("queue channel closed")]
    Closed,
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                QueueError::Closed
            }
            other => QueueError::Connection(other.to_string()),
        }
    }
}

/// Failures reported by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(#[source] tokio_postgres::Error),
    #[error("could not ensure the schema: {0}")]
    Schema(#[source] tokio_postgres::Error),
    #[error("could not insert reading: {0}")]
    Insert(#[source] tokio_postgres::Error),
    #[error("store rejected reading: {0}")]
    Rejected(String),
    #[error("store unavailable")]
    Unavailable,
}

/// Errors that end one of the daemon loops.
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not encode reading: {0}")]
    Encode(#[from] serde_json::Error),
}

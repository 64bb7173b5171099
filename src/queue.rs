//! Contract of the queue service shared by the sensor and the receiver.
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::QueueError;

/// Name of the queue readings are published to.
pub const QUEUE_NAME: &str = "telemetry_queue";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Properties a queue is declared with.
pub struct QueueSpec
{
    pub name: String,
    /// Survives a broker restart.
    pub durable: bool,
    /// Restricted to the declaring connection.
    pub exclusive: bool,
    /// Deleted once the last consumer is gone.
    pub auto_delete: bool,
}

impl QueueSpec {
    /// The telemetry queue: not durable, shared, kept without consumers.
    pub fn telemetry() -> Self {
        Self {
            name: QUEUE_NAME.to_string(),
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Identifies one delivery on a channel. Acknowledgements target exactly one tag.
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A message handed to a consumer that has not been acknowledged yet.
pub struct Delivery
{
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// Set when the broker offered this message before.
    pub redelivered: bool,
}

/// Stream of deliveries for one consumer. Ends or errors when the channel is lost.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, QueueError>>;

/// An open channel to the queue service.
#[async_trait]
pub trait QueueChannel: Send + Sync
{
    /// Declares the queue. Repeating the declaration with the same properties is a no-op.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), QueueError>;

    /// Publishes `body` on the default exchange with the given routing key.
    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), QueueError>;

    /// Starts consuming `queue` with explicit acknowledgements.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, QueueError>;

    /// Acknowledges a single delivery. Never cumulative.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError>;
}

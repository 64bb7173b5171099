//! RabbitMQ implementation of the queue contract.
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use crate::bootstrap::Connector;
use crate::error::QueueError;
use crate::queue::{Delivery, DeliveryStream, DeliveryTag, QueueChannel, QueueSpec};

/// Opens AMQP connections to a broker.
#[derive(Debug, Clone)]
pub struct AmqpConnector
{
    uri: String,
    host: String,
}

impl AmqpConnector {
    /// # Arguments
    ///
    /// * `host` - Host name shown in status messages.
    ///
    /// * `uri` - Full `amqp://` URI including credentials and vhost.
    pub fn new(host: impl Into<String>, uri: impl Into<String>) -> Self {
        Self { uri: uri.into(), host: host.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Handle = AmqpChannel;
    type Error = QueueError;

    fn target(&self) -> String {
        format!("RabbitMQ at {}", self.host)
    }

    async fn connect(&self) -> Result<AmqpChannel, QueueError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|err| QueueError::Connection(err.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| QueueError::Connection(err.to_string()))?;
        log::debug!(target: "telemetryd::amqp", "Opened channel {}", channel.id());

        Ok(AmqpChannel { _connection: connection, channel })
    }
}

/// A channel together with the connection that owns it.
///
/// Dropping the handle closes the connection, which makes the broker requeue every
/// delivery that was not acknowledged.
pub struct AmqpChannel
{
    _connection: Connection,
    channel: Channel,
}

#[async_trait]
impl QueueChannel for AmqpChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), QueueError> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..QueueDeclareOptions::default()
        };
        match self.channel.queue_declare(&spec.name, options, FieldTable::default()).await {
            Ok(queue) => {
                log::debug!(target: "telemetryd::amqp", "Declared queue \'{}\' ({} messages, {} consumers)",
                            queue.name().as_str(), queue.message_count(), queue.consumer_count());
                Ok(())
            }
            Err(lapin::Error::ProtocolError(err))
                if matches!(err.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)) =>
            {
                Err(QueueError::DeclareMismatch { queue: spec.name.clone() })
            }
            Err(err) => Err(QueueError::Declare(err.to_string())),
        }
    }

    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), QueueError> {
        self.channel
            .basic_publish("", routing_key, BasicPublishOptions::default(), body, BasicProperties::default())
            .await
            .map_err(|err| QueueError::Publish(err.to_string()))?
            .await
            .map_err(|err| QueueError::Publish(err.to_string()))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, QueueError> {
        let options = BasicConsumeOptions { no_ack: false, ..BasicConsumeOptions::default() };
        let consumer = self.channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(|err| QueueError::Consume(err.to_string()))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|delivery| Delivery {
                        tag: DeliveryTag(delivery.delivery_tag),
                        body: delivery.data,
                        redelivered: delivery.redelivered,
                    })
                    .map_err(QueueError::from)
            })
            .boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.channel
            .basic_ack(tag.0, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| QueueError::Ack { tag: tag.0, reason: err.to_string() })
    }
}

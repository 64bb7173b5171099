//! The receiver loop: drains the telemetry queue into the store.
//!
//! Every delivery is decoded and inserted. Only a successful insert leads to an
//! acknowledgement of exactly that delivery tag. Decode and insert failures leave the
//! delivery unacknowledged so the broker offers it again; a payload that can never be
//! decoded is therefore redelivered forever, there is no dead-letter path.
use std::fmt;
use std::time::Duration;

use futures::StreamExt;

use crate::bootstrap::{Bootstrap, Connector};
use crate::config;
use crate::database::Store;
use crate::error::{DecodeError, Error, QueueError, StoreError};
use crate::queue::{Delivery, DeliveryStream, QueueChannel, QueueSpec};
use crate::record::{self, StoredReading};
use crate::shutdown::Shutdown;

/// Tag the receiver registers its consumer under.
pub const CONSUMER_TAG: &str = "telemetry-receiver";

#[derive(Debug, Clone)]
/// Parameters of the receiver loop.
pub struct ConsumerSettings
{
    pub queue: QueueSpec,
    /// Delay between readiness probes of the store.
    pub store_backoff: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue: QueueSpec::telemetry(),
            store_backoff: config::STORE_RETRY_BACKOFF,
        }
    }
}

#[derive(Debug)]
/// Why a delivery could not be persisted.
pub enum FailureReason
{
    Decode(DecodeError),
    Persist(StoreError),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Decode(err) => write!(f, "{}", err),
            FailureReason::Persist(err) => write!(f, "{}", err),
        }
    }
}

#[derive(Debug)]
/// Result of handling one delivery.
pub enum Outcome
{
    /// The reading was written and received the given key.
    Persisted(StoredReading),
    Failed(FailureReason),
}

/// Decodes a delivery and writes it to the store. Never acknowledges.
pub async fn process_delivery<S: Store + ?Sized>(store: &S, delivery: &Delivery) -> Outcome
{
    let reading = match record::decode(&delivery.body) {
        Ok(reading) => reading,
        Err(err) => return Outcome::Failed(FailureReason::Decode(err)),
    };

    match store.insert(&reading).await {
        Ok(id) => Outcome::Persisted(StoredReading { id, reading }),
        Err(err) => Outcome::Failed(FailureReason::Persist(err)),
    }
}

/// Acts on the outcome of a delivery: acknowledges it if and only if it was persisted.
///
/// # Returns
///
/// * `Ok(true)` - The delivery was acknowledged.
///
/// * `Ok(false)` - The delivery was left for redelivery.
///
/// * `Err(...)` - The acknowledgement could not be sent.
pub async fn settle<Q: QueueChannel + ?Sized>(channel: &Q, delivery: &Delivery, outcome: Outcome) -> Result<bool, QueueError>
{
    match outcome {
        Outcome::Persisted(stored) => {
            log::info!(target: "telemetryd::consumer", "[SAVED] {} - Temp: {:.1} (id {})",
                       stored.reading.sensor_id, stored.reading.temperature, stored.id);
            channel.ack(delivery.tag).await?;
            Ok(true)
        }
        Outcome::Failed(reason) => {
            log::error!(target: "telemetryd::consumer", "[ERROR] Could not save delivery {}: {}", delivery.tag, reason);
            Ok(false)
        }
    }
}

/// Handles deliveries one at a time until the stream ends or shutdown is requested.
///
/// # Errors
///
/// * `QueueError::Closed` - The delivery stream ended, i.e. the channel was lost.
///
/// * Any error reported by the stream or by an acknowledgement.
pub async fn drain<Q, S>(channel: &Q, store: &S, mut deliveries: DeliveryStream, shutdown: &Shutdown) -> Result<(), Error>
where
    Q: QueueChannel + ?Sized,
    S: Store + ?Sized,
{
    loop {
        let next = tokio::select! {
            next = deliveries.next() => next,
            _ = shutdown.triggered() => return Ok(()),
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => return Err(err.into()),
            None => return Err(QueueError::Closed.into()),
        };
        if delivery.redelivered {
            log::debug!(target: "telemetryd::consumer", "Delivery {} is a redelivery", delivery.tag);
        }

        let outcome = process_delivery(store, &delivery).await;
        settle(channel, &delivery, outcome).await?;
    }
}

/// Runs the receiver until shutdown is requested or the queue connection is lost.
///
/// Waits for the store with unbounded retries first. The queue connection is attempted once,
/// a failure there is returned as fatal.
pub async fn run<SC, QC>(store_connector: &SC, queue_connector: &QC, settings: &ConsumerSettings, shutdown: &Shutdown) -> Result<(), Error>
where
    SC: Connector,
    SC::Handle: Store,
    QC: Connector,
    QC::Handle: QueueChannel,
{
    let mut bootstrap = Bootstrap::new(store_connector, settings.store_backoff, shutdown.clone());
    let store = match bootstrap.establish().await {
        Some(established) => established.handle,
        None => return Ok(()),
    };

    log::info!(target: "telemetryd::consumer", "Connecting to {}...", queue_connector.target());
    let channel = queue_connector
        .connect()
        .await
        .map_err(|err| Error::Connect { target: queue_connector.target(), source: Box::new(err) })?;

    channel.declare_queue(&settings.queue).await?;
    let deliveries = channel.consume(&settings.queue.name, CONSUMER_TAG).await?;
    log::info!(target: "telemetryd::consumer", "Waiting for messages on \'{}\'...", settings.queue.name);

    drain(&channel, &store, deliveries, shutdown).await
}

//! The sensor loop: generates readings and publishes them on the telemetry queue.
//!
//! A session connects, declares the queue and then publishes one reading per interval. Any
//! failure ends the session; after the backoff a new session starts from scratch with a
//! freshly generated reading, the reading that failed to publish is not resent.
use std::time::Duration;

use rand::Rng;

use crate::bootstrap::{Bootstrap, Connector};
use crate::config;
use crate::error::Error;
use crate::queue::{QueueChannel, QueueSpec};
use crate::record::{self, ReadingGenerator};
use crate::shutdown::Shutdown;

#[derive(Debug, Clone)]
/// Parameters of the sensor loop.
pub struct ProducerSettings
{
    pub queue: QueueSpec,
    pub sensor_id: String,
    /// Delay after each publish.
    pub interval: Duration,
    /// Delay before reconnecting after a failure.
    pub retry_backoff: Duration,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            queue: QueueSpec::telemetry(),
            sensor_id: config::SENSOR_ID.to_string(),
            interval: config::PUBLISH_INTERVAL,
            retry_backoff: config::QUEUE_RETRY_BACKOFF,
        }
    }
}

/// Runs the sensor until shutdown is requested.
///
/// Connection, declaration and publish failures never end the loop, they restart it.
///
/// # Arguments
///
/// * `connector` - Opens channels to the queue service.
///
/// * `generator` - Source of readings, kept across sessions.
///
/// * `settings` - Queue, cadence and backoff.
///
/// * `shutdown` - Ends the loop when triggered.
pub async fn run<C, R>(connector: &C, generator: &mut ReadingGenerator<R>, settings: &ProducerSettings, shutdown: &Shutdown)
where
    C: Connector,
    C::Handle: QueueChannel,
    R: Rng,
{
    loop {
        let mut bootstrap = Bootstrap::new(connector, settings.retry_backoff, shutdown.clone());
        let established = match bootstrap.establish().await {
            Some(established) => established,
            None => break,
        };

        match publish_session(&established.handle, generator, settings, shutdown).await {
            Ok(()) => break,
            Err(err) => {
                log::warn!(target: "telemetryd::producer",
                           "Queue session failed: \'{}\'. Retrying in {} seconds...",
                           err, settings.retry_backoff.as_secs_f32());
            }
        }
        drop(established);

        if !shutdown.sleep(settings.retry_backoff).await {
            break;
        }
    }
    log::info!(target: "telemetryd::producer", "Sensor loop stopped");
}

/// Declares the queue and publishes readings until a failure or shutdown.
///
/// # Returns
///
/// * `Ok(())` - Shutdown was requested.
///
/// * `Err(...)` - Declaring the queue or publishing a reading failed.
pub async fn publish_session<Q, R>(channel: &Q, generator: &mut ReadingGenerator<R>, settings: &ProducerSettings, shutdown: &Shutdown) -> Result<(), Error>
where
    Q: QueueChannel,
    R: Rng,
{
    channel.declare_queue(&settings.queue).await?;
    log::info!(target: "telemetryd::producer", "Connected to the queue service! Sending data...");

    while !shutdown.is_triggered() {
        let reading = generator.next_reading();
        let body = record::encode(&reading)?;

        channel.publish(&settings.queue.name, &body).await?;
        log::info!(target: "telemetryd::producer", "[SENT] {}", String::from_utf8_lossy(&body));

        if !shutdown.sleep(settings.interval).await {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ConnectionRefused, MemoryBroker, MemoryChannel, MemoryConnector};
    use crate::record::decode;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;
    use tokio::time::Instant;

    /// Remembers when each connect succeeded.
    struct TimedConnector
    {
        inner: MemoryConnector,
        connected_at: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl Connector for TimedConnector {
        type Handle = MemoryChannel;
        type Error = ConnectionRefused;

        fn target(&self) -> String {
            self.inner.target()
        }

        async fn connect(&self) -> Result<MemoryChannel, ConnectionRefused> {
            let channel = self.inner.connect().await?;
            self.connected_at.lock().push(Instant::now());
            Ok(channel)
        }
    }

    fn generator() -> ReadingGenerator<StdRng> {
        ReadingGenerator::new("SAT-001", StdRng::seed_from_u64(3))
    }

    #[tokio::test(start_paused = true)]
    async fn session_publishes_once_per_interval() {
        let broker = MemoryBroker::new();
        let channel = broker.channel();
        let settings = ProducerSettings::default();
        let (trigger, shutdown) = crate::shutdown::channel();

        let session = tokio::spawn(async move {
            let mut generator = generator();
            publish_session(&channel, &mut generator, &settings, &shutdown).await
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        trigger.trigger();
        session.await.unwrap().unwrap();

        let bodies = broker.ready_bodies("telemetry_queue");
        assert_eq!(bodies.len(), 3);
        let readings: Vec<_> = bodies.iter().map(|body| decode(body).unwrap()).collect();
        assert!(readings.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));
        assert!(readings.iter().all(|reading| reading.sensor_id == "SAT-001"));
    }

    #[tokio::test(start_paused = true)]
    async fn session_fails_when_publish_fails() {
        let broker = MemoryBroker::new();
        let channel = broker.channel();
        broker.fail_next_publishes(1);

        let result = publish_session(&channel, &mut generator(), &ProducerSettings::default(), &Shutdown::never()).await;

        assert!(matches!(result, Err(Error::Queue(_))));
        assert_eq!(broker.pending_count("telemetry_queue"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_fails_on_conflicting_declaration() {
        let broker = MemoryBroker::new();
        broker.channel()
            .declare_queue(&QueueSpec { durable: true, ..QueueSpec::telemetry() })
            .await
            .unwrap();

        let result = publish_session(&broker.channel(), &mut generator(), &ProducerSettings::default(), &Shutdown::never()).await;

        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_waits_the_backoff_before_reconnecting() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(1);
        let connector = Arc::new(TimedConnector {
            inner: broker.connector(0),
            connected_at: Mutex::new(Vec::new()),
        });
        let (trigger, shutdown) = crate::shutdown::channel();
        let started = Instant::now();

        let sensor = {
            let connector = Arc::clone(&connector);
            tokio::spawn(async move {
                let mut generator = generator();
                run(connector.as_ref(), &mut generator, &ProducerSettings::default(), &shutdown).await
            })
        };

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(connector.connected_at.lock().len(), 1);
        assert_eq!(broker.pending_count("telemetry_queue"), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        trigger.trigger();
        sensor.await.unwrap();

        let connected_at = connector.connected_at.lock().clone();
        assert_eq!(connected_at, vec![started, started + Duration::from_secs(3)]);
        assert_eq!(broker.ready_count("telemetry_queue"), 1);
    }
}

use std::time::Duration;

use chrono::{TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;

use telemetryd::consumer::{self, ConsumerSettings};
use telemetryd::error::Error;
use telemetryd::memory::{MemoryBroker, MemoryStore};
use telemetryd::producer::{self, ProducerSettings};
use telemetryd::queue::{DeliveryTag, QueueChannel, QueueSpec, QUEUE_NAME};
use telemetryd::record::{decode, encode, Reading, ReadingGenerator};
use telemetryd::shutdown::{self, Shutdown};

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn sat_reading() -> Reading {
    Reading {
        sensor_id: "SAT-001".to_string(),
        temperature: 27.3,
        humidity: 55.0,
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

#[tokio::test(start_paused = true)]
async fn published_reading_is_saved_and_acked() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();

    let publisher = broker.channel();
    publisher.declare_queue(&QueueSpec::telemetry()).await.expect("declare");
    publisher
        .publish(QUEUE_NAME, &encode(&sat_reading()).expect("encode"))
        .await
        .expect("publish");

    let (trigger, shutdown) = shutdown::channel();
    let receiver = {
        let store_connector = store.connector();
        let queue_connector = broker.connector(0);
        tokio::spawn(async move {
            consumer::run(&store_connector, &queue_connector, &ConsumerSettings::default(), &shutdown).await
        })
    };

    wait_until(|| !store.rows().is_empty()).await;
    trigger.trigger();
    receiver.await.expect("join").expect("receiver");

    let rows = store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, 1);
    assert_eq!(rows[0].reading, sat_reading());
    assert_eq!(broker.acked_tags(), vec![DeliveryTag(1)]);
    assert_eq!(broker.pending_count(QUEUE_NAME), 0);
}

#[tokio::test(start_paused = true)]
async fn receiver_waits_for_the_store() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    store.fail_next_probes(3);

    let (trigger, shutdown) = shutdown::channel();
    let started = tokio::time::Instant::now();
    let receiver = {
        let store_connector = store.connector();
        let queue_connector = broker.connector(0);
        tokio::spawn(async move {
            consumer::run(&store_connector, &queue_connector, &ConsumerSettings::default(), &shutdown).await
        })
    };

    wait_until(|| store.schema_ready()).await;
    assert!(started.elapsed() >= Duration::from_secs(15));

    let publisher = broker.channel();
    publisher.declare_queue(&QueueSpec::telemetry()).await.expect("declare");
    publisher
        .publish(QUEUE_NAME, &encode(&sat_reading()).expect("encode"))
        .await
        .expect("publish");

    wait_until(|| store.rows().len() == 1).await;
    trigger.trigger();
    receiver.await.expect("join").expect("receiver");
    assert_eq!(broker.pending_count(QUEUE_NAME), 0);
}

#[tokio::test(start_paused = true)]
async fn queue_connection_failure_is_fatal_for_the_receiver() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();

    let result = consumer::run(&store.connector(), &broker.connector(1), &ConsumerSettings::default(), &Shutdown::never()).await;

    assert!(matches!(result, Err(Error::Connect { .. })));
}

#[tokio::test(start_paused = true)]
async fn receiver_stops_when_channel_is_lost() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();

    let receiver = {
        let store_connector = store.connector();
        let queue_connector = broker.connector(0);
        tokio::spawn(async move {
            consumer::run(&store_connector, &queue_connector, &ConsumerSettings::default(), &Shutdown::never()).await
        })
    };

    wait_until(|| store.schema_ready()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker.sever();

    let result = receiver.await.expect("join");
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn sensor_and_receiver_move_every_reading_into_the_store() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    broker.fail_next_publishes(1);

    let (trigger, shutdown) = shutdown::channel();

    let receiver = {
        let store_connector = store.connector();
        let queue_connector = broker.connector(0);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            consumer::run(&store_connector, &queue_connector, &ConsumerSettings::default(), &shutdown).await
        })
    };

    let sensor_connector = std::sync::Arc::new(broker.connector(2));
    let sensor = {
        let connector = std::sync::Arc::clone(&sensor_connector);
        tokio::spawn(async move {
            let mut generator = ReadingGenerator::new("SAT-001", StdRng::seed_from_u64(11));
            producer::run(connector.as_ref(), &mut generator, &ProducerSettings::default(), &shutdown).await
        })
    };

    tokio::time::sleep(Duration::from_millis(20_500)).await;
    trigger.trigger();
    sensor.await.expect("join sensor");
    receiver.await.expect("join receiver").expect("receiver");

    // Two refused connects, one session lost to the failed publish, then a healthy session.
    assert_eq!(sensor_connector.connects(), 2);

    let rows = store.rows();
    assert!(rows.len() >= 10, "only {} rows", rows.len());
    assert_eq!(broker.acked_tags().len(), rows.len());
    assert_eq!(broker.pending_count(QUEUE_NAME), 0);
    for (index, row) in rows.iter().enumerate() {
        assert_eq!(row.id, index as i32 + 1);
        assert_eq!(row.reading.sensor_id, "SAT-001");
    }
    assert!(rows.windows(2).all(|pair| pair[0].reading.timestamp <= pair[1].reading.timestamp));
}

#[tokio::test]
async fn both_roles_declare_the_same_queue() {
    let broker = MemoryBroker::new();
    let sensor = broker.channel();
    let receiver = broker.channel();

    sensor.declare_queue(&QueueSpec::telemetry()).await.expect("first declaration");
    receiver.declare_queue(&QueueSpec::telemetry()).await.expect("second declaration");
    sensor.declare_queue(&QueueSpec::telemetry()).await.expect("repeated declaration");

    sensor
        .publish(QUEUE_NAME, &encode(&sat_reading()).expect("encode"))
        .await
        .expect("publish");
    let bodies = broker.ready_bodies(QUEUE_NAME);
    assert_eq!(bodies.len(), 1);
    assert_eq!(decode(&bodies[0]).expect("decode"), sat_reading());
}

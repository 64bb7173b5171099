//! Telemetry pipeline with at-least-once delivery.
//!
//! The sensor (`telemetry-sensor`) publishes simulated [`record::Reading`]s on a work queue.
//! The receiver (`telemetry-receiver`) drains the queue into a postgres table and acknowledges
//! a delivery only after the reading was written.
pub mod amqp;
pub mod bootstrap;
pub mod config;
pub mod consumer;
pub mod database;
pub mod error;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod producer;
pub mod queue;
pub mod record;
pub mod shutdown;

pub use error::Error;

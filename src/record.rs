//! Module that contains the reading types exchanged between the sensor and the receiver.
//!
//! A [`Reading`] travels as a JSON object with the field names `SensorId`, `Temperature`,
//! `Humidity` and `Timestamp`. The receiver only wraps it into a [`StoredReading`] once the
//! store has assigned a key; the payload itself is never modified.
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
/// Struct representing one measurement recorded by a sensor at a specific timestamp.
pub struct Reading
{
    /// The identifier of the sensor that recorded the reading.
    pub sensor_id: String,
    /// Temperature value in celsius.
    pub temperature: f64,
    /// Relative humidity value in percent.
    pub humidity: f64,
    /// Timestamp the reading was recorded.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
/// A reading after it was written to the store.
pub struct StoredReading
{
    /// Surrogate key assigned by the store.
    pub id: i32,
    pub reading: Reading,
}

/// Serializes a reading into the JSON bytes published on the queue.
pub fn encode(reading: &Reading) -> Result<Vec<u8>, serde_json::Error>
{
    serde_json::to_vec(reading)
}

/// Parses the bytes of a delivery back into a reading.
///
/// # Errors
///
/// * `DecodeError::Json` - The payload is not a JSON object with exactly the reading fields.
///
/// * `DecodeError::EmptySensorId` - The payload names no sensor.
pub fn decode(payload: &[u8]) -> Result<Reading, DecodeError>
{
    let reading = serde_json::from_slice::<Reading>(payload)?;
    if reading.sensor_id.is_empty() {
        return Err(DecodeError::EmptySensorId);
    }
    Ok(reading)
}

/// Produces simulated readings for a single sensor.
///
/// Timestamps never go backwards for one generator, even if the wall clock does.
pub struct ReadingGenerator<R: Rng>
{
    sensor_id: String,
    rng: R,
    last_timestamp: Option<DateTime<Utc>>,
}

impl<R: Rng> ReadingGenerator<R>
{
    pub fn new(sensor_id: impl Into<String>, rng: R) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            rng,
            last_timestamp: None,
        }
    }

    /// Generates the next reading stamped with the current time.
    pub fn next_reading(&mut self) -> Reading {
        self.next_reading_at(Utc::now())
    }

    /// Generates the next reading for the given observation time.
    ///
    /// Temperature lies in `[20, 35)` and humidity in `[40, 60)`.
    pub fn next_reading_at(&mut self, now: DateTime<Utc>) -> Reading {
        let timestamp = match self.last_timestamp {
            Some(last) if now < last => last,
            _ => now,
        };
        self.last_timestamp = Some(timestamp);

        Reading {
            sensor_id: self.sensor_id.clone(),
            temperature: self.rng.gen_range(20.0..35.0),
            humidity: self.rng.gen_range(40.0..60.0),
            timestamp,
        }
    }
}

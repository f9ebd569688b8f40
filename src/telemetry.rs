//! Sensor sampling and telemetry payloads
//!
//! The binary's `run` command samples a [`SensorSource`] on a fixed interval
//! and publishes one [`TelemetryRecord`] per sample through the publisher.
//! Sensor failures are logged and the sample is skipped.

use crate::clock::ClockSource;
use crate::publisher::TelemetryPublisher;
use crate::transport::TransportSession;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Timestamp layout used in telemetry payloads
pub const TIMESTAMP_FORMAT: &str = "%A, %B %d %Y %H:%M:%S";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SensorError {
    #[error("Sensor unavailable: {0}")]
    Unavailable(String),
    #[error("Implausible reading: {0}")]
    Implausible(String),
}

/// One environmental sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    /// Degrees Celsius
    pub temperature: f32,
    /// Relative humidity, percent
    pub humidity: f32,
}

impl SensorReading {
    pub fn validate(self) -> Result<Self, SensorError> {
        if !self.temperature.is_finite() || !(-40.0..=85.0).contains(&self.temperature) {
            return Err(SensorError::Implausible(format!(
                "temperature {}",
                self.temperature
            )));
        }
        if !self.humidity.is_finite() || !(0.0..=100.0).contains(&self.humidity) {
            return Err(SensorError::Implausible(format!("humidity {}", self.humidity)));
        }
        Ok(self)
    }
}

/// Anything that can be sampled for temperature and humidity
pub trait SensorSource: Send {
    fn read(&mut self) -> Result<SensorReading, SensorError>;
}

/// Random-walk sensor for devices without attached hardware
#[derive(Debug)]
pub struct SimulatedSensor {
    current: SensorReading,
    rng: StdRng,
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Reproducible sequence of readings
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            current: SensorReading {
                temperature: 22.0,
                humidity: 45.0,
            },
            rng,
        }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for SimulatedSensor {
    fn read(&mut self) -> Result<SensorReading, SensorError> {
        let temperature = self.current.temperature + self.rng.gen_range(-0.5f32..=0.5);
        let humidity = self.current.humidity + self.rng.gen_range(-1.0f32..=1.0);

        self.current = SensorReading {
            temperature: temperature.clamp(-10.0, 45.0),
            humidity: humidity.clamp(5.0, 95.0),
        };
        Ok(self.current)
    }
}

/// JSON telemetry payload; readings are sent as two-decimal strings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub timestamp: String,
    #[serde(serialize_with = "two_decimals")]
    pub temperature: f32,
    #[serde(serialize_with = "two_decimals")]
    pub humidity: f32,
    pub device: String,
}

fn two_decimals<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:.2}"))
}

impl TelemetryRecord {
    pub fn new(
        reading: SensorReading,
        epoch: u64,
        offset: FixedOffset,
        device: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: format_timestamp(epoch, offset),
            temperature: reading.temperature,
            humidity: reading.humidity,
            device: device.into(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Format an epoch at a fixed UTC offset (pure function)
pub fn format_timestamp(epoch: u64, offset: FixedOffset) -> String {
    let utc = i64::try_from(epoch)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_default();
    utc.with_timezone(&offset).format(TIMESTAMP_FORMAT).to_string()
}

/// Whole-hour UTC offset; out-of-range values fall back to UTC
pub fn utc_offset(hours: i32) -> FixedOffset {
    hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(|| {
            warn!("Ignoring invalid UTC offset of {} hours", hours);
            Utc.fix()
        })
}

/// Settings for [`run_sensor_loop`]
#[derive(Debug, Clone)]
pub struct SamplingSettings {
    pub interval: Duration,
    pub subfolder: Option<String>,
    pub offset: FixedOffset,
    pub device: String,
}

/// Sample and publish until `shutdown` turns true
///
/// Returns the number of records published.
pub async fn run_sensor_loop<S, T>(
    publisher: TelemetryPublisher<S>,
    mut sensor: T,
    clock: Arc<dyn ClockSource>,
    settings: SamplingSettings,
    mut shutdown: watch::Receiver<bool>,
) -> u64
where
    S: TransportSession + 'static,
    T: SensorSource,
{
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut published = 0u64;

    info!(
        interval_secs = settings.interval.as_secs(),
        "Telemetry sampling started"
    );

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = ticker.tick() => {}
        }

        let reading = match sensor.read().and_then(SensorReading::validate) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Skipping sample: {e}");
                continue;
            }
        };
        let epoch = match clock.now() {
            Ok(epoch) => epoch,
            Err(e) => {
                warn!("Skipping sample: {e}");
                continue;
            }
        };

        let record = TelemetryRecord::new(reading, epoch, settings.offset, settings.device.clone());
        let payload = match record.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode telemetry: {e}");
                continue;
            }
        };

        match publisher.publish(settings.subfolder.as_deref(), payload).await {
            Ok(()) => {
                published += 1;
                debug!(
                    temperature = record.temperature,
                    humidity = record.humidity,
                    "Telemetry sample published"
                );
            }
            Err(e) => warn!("Telemetry sample not published: {e}"),
        }
    }

    info!(published, "Telemetry sampling stopped");
    published
}

//! Sensor sampling loop tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use telemetry_link::clock::ClockSource;
use telemetry_link::config::SupervisorConfig;
use telemetry_link::publisher::TelemetryPublisher;
use telemetry_link::telemetry::{
    run_sensor_loop, utc_offset, SamplingSettings, SensorError, SensorReading, SensorSource,
};
use telemetry_link::testing::{test_identity, ManualClock, MockIssuer, MockSession};
use tokio::sync::watch;

const T0: u64 = 1_700_000_000;

/// Sensor replaying a fixed sequence of results
struct ScriptedSensor {
    readings: VecDeque<Result<SensorReading, SensorError>>,
}

impl SensorSource for ScriptedSensor {
    fn read(&mut self) -> Result<SensorReading, SensorError> {
        self.readings
            .pop_front()
            .unwrap_or_else(|| Err(SensorError::Unavailable("script exhausted".to_string())))
    }
}

fn reading(temperature: f32, humidity: f32) -> Result<SensorReading, SensorError> {
    Ok(SensorReading {
        temperature,
        humidity,
    })
}

#[tokio::test(start_paused = true)]
async fn test_loop_publishes_each_valid_sample() {
    let clock = Arc::new(ManualClock::at(T0));
    let session = Arc::new(MockSession::new());
    let publisher = TelemetryPublisher::with_issuer(
        Arc::new(MockIssuer::new(test_identity())),
        clock.clone(),
        Arc::clone(&session),
        SupervisorConfig::default(),
    );
    publisher.start().await.unwrap();

    let sensor = ScriptedSensor {
        readings: VecDeque::from(vec![
            reading(21.5, 40.25),
            Err(SensorError::Unavailable("i2c timeout".to_string())),
            reading(22.126, 41.0),
            reading(200.0, 41.0),
        ]),
    };
    let settings = SamplingSettings {
        interval: Duration::from_secs(50),
        subfolder: Some("environment".to_string()),
        offset: utc_offset(0),
        device: "device-1".to_string(),
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sampler = tokio::spawn(run_sensor_loop(
        publisher.clone(),
        sensor,
        clock as Arc<dyn ClockSource>,
        settings,
        shutdown_rx,
    ));

    // Samples at 0s, 50s, 100s and 150s
    tokio::time::sleep(Duration::from_secs(175)).await;
    shutdown_tx.send(true).unwrap();

    assert_eq!(sampler.await.unwrap(), 2);

    let published = session.published();
    assert_eq!(published.len(), 2);
    assert!(published
        .iter()
        .all(|m| m.topic.as_deref() == Some("environment")));

    let first: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(first["timestamp"], "Tuesday, November 14 2023 22:13:20");
    assert_eq!(first["temperature"], "21.50");
    assert_eq!(first["humidity"], "40.25");
    assert_eq!(first["device"], "device-1");

    let second: serde_json::Value = serde_json::from_slice(&published[1].payload).unwrap();
    assert_eq!(second["temperature"], "22.13");

    publisher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_loop_exits_promptly_on_shutdown() {
    let clock = Arc::new(ManualClock::at(T0));
    let session = Arc::new(MockSession::new());
    let publisher = TelemetryPublisher::with_issuer(
        Arc::new(MockIssuer::new(test_identity())),
        clock.clone(),
        session,
        SupervisorConfig::default(),
    );

    let (_shutdown_tx, shutdown_rx) = watch::channel(true);

    let published = run_sensor_loop(
        publisher,
        ScriptedSensor {
            readings: VecDeque::new(),
        },
        clock as Arc<dyn ClockSource>,
        SamplingSettings {
            interval: Duration::from_secs(60),
            subfolder: None,
            offset: utc_offset(0),
            device: "device-1".to_string(),
        },
        shutdown_rx,
    )
    .await;

    assert_eq!(published, 0);
}

//! Telemetry link for constrained IoT devices
//!
//! Keeps one authenticated MQTT session to a cloud IoT broker alive and
//! publishes telemetry over it.
//!
//! # Overview
//!
//! - [`credential`] - ES256 JWT credentials issued from the device key
//! - [`transport`] - broker session abstraction and its MQTT implementation
//! - [`supervisor`] - control loop: renewal before expiry, reconnect with
//!   backoff, serialized publishing
//! - [`publisher`] - the application-facing facade
//! - [`telemetry`] - sensor sampling and JSON payloads for the binary
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telemetry_link::clock::SystemClock;
//! use telemetry_link::config::TelemetryConfig;
//! use telemetry_link::publisher::TelemetryPublisher;
//! use telemetry_link::transport::mqtt::MqttSession;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TelemetryConfig::load_from_file("telemetry.toml".as_ref())?;
//! let session = Arc::new(MqttSession::new(config.broker_settings()));
//! let publisher = TelemetryPublisher::new(
//!     config.device_identity()?,
//!     Arc::new(SystemClock),
//!     session,
//!     config.supervisor_config(),
//! )?;
//!
//! publisher.start().await?;
//! publisher.publish(None, r#"{"temperature":"21.50"}"#).await?;
//! publisher.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod credential;
pub mod error;
pub mod observability;
pub mod publisher;
pub mod supervisor;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use clock::{ClockSource, SystemClock};
pub use config::TelemetryConfig;
pub use credential::{Credential, CredentialIssuer, DeviceIdentity, JwtIssuer};
pub use error::{ClockError, ConnectError, IssueError, PublishError, PublishFailure, SigningError};
pub use publisher::TelemetryPublisher;
pub use supervisor::{ConnectionSupervisor, SessionState};
pub use transport::TransportSession;

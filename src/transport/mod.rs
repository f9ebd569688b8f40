//! Transport layer for broker communication
//!
//! This module provides the session abstraction the supervisor drives and the
//! MQTT implementation used on the device.

use crate::credential::{Credential, DeviceIdentity};
use crate::error::{ConnectError, PublishError};
use bytes::Bytes;

pub mod mqtt;

/// One secured, authenticated connection to the broker
///
/// This trait enables dependency injection and testing. Implementations never
/// retry; retry policy belongs to the connection supervisor.
#[async_trait::async_trait]
pub trait TransportSession: Send + Sync {
    /// Open the transport and authenticate using `credential` as the password.
    /// Any existing session is torn down first.
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        credential: &Credential,
    ) -> Result<(), ConnectError>;

    /// Send one telemetry message, optionally under an events subfolder
    async fn publish(&self, topic: Option<&str>, payload: Bytes) -> Result<(), PublishError>;

    /// Non-blocking liveness check
    fn is_alive(&self) -> bool;

    /// Resolves once the current link has died.
    ///
    /// Sessions that cannot observe their link never resolve; the
    /// supervisor's periodic liveness check still catches those.
    async fn link_lost(&self) {
        std::future::pending::<()>().await
    }

    /// Release the transport; safe to call when already disconnected
    async fn disconnect(&self);
}

//! Application-facing telemetry publisher
//!
//! Thin facade over the [`ConnectionSupervisor`]: callers hand it payloads and
//! never see credentials, sessions or retries.

use crate::clock::ClockSource;
use crate::config::SupervisorConfig;
use crate::credential::{CredentialIssuer, DeviceIdentity, JwtIssuer};
use crate::error::{PublishFailure, SigningError};
use crate::observability::MetricsCollector;
use crate::supervisor::{ConnectionSupervisor, PublishRequest, SessionState};
use crate::transport::TransportSession;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;

/// Publishes telemetry for one device over a supervised session
pub struct TelemetryPublisher<S: TransportSession + 'static> {
    supervisor: ConnectionSupervisor<S>,
}

impl<S: TransportSession + 'static> Clone for TelemetryPublisher<S> {
    fn clone(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
        }
    }
}

impl<S: TransportSession + 'static> TelemetryPublisher<S> {
    /// Build a publisher that signs ES256 credentials with the identity's key.
    ///
    /// Fails when the key material cannot be parsed.
    pub fn new(
        identity: DeviceIdentity,
        clock: Arc<dyn ClockSource>,
        session: Arc<S>,
        config: SupervisorConfig,
    ) -> Result<Self, SigningError> {
        let issuer = JwtIssuer::new(identity)?;
        Ok(Self::with_issuer(Arc::new(issuer), clock, session, config))
    }

    pub fn with_issuer(
        issuer: Arc<dyn CredentialIssuer>,
        clock: Arc<dyn ClockSource>,
        session: Arc<S>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            supervisor: ConnectionSupervisor::new(issuer, clock, session, config),
        }
    }

    pub async fn start(&self) -> Result<(), SigningError> {
        self.supervisor.start().await
    }

    pub async fn stop(&self) {
        self.supervisor.stop().await
    }

    /// Publish one message, optionally under an events subfolder.
    ///
    /// Waits (bounded) for a connected session; the session's own result is
    /// returned unchanged.
    pub async fn publish(
        &self,
        topic: Option<&str>,
        payload: impl Into<Bytes>,
    ) -> Result<(), PublishFailure> {
        self.supervisor
            .publish(PublishRequest::new(topic, payload))
            .await
    }

    pub fn status(&self) -> SessionState {
        self.supervisor.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionState> {
        self.supervisor.subscribe_status()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.supervisor.metrics()
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor<S> {
        &self.supervisor
    }
}

//! Device identity and time-bounded credentials
//!
//! A [`Credential`] is immutable once issued; renewal produces a new one that
//! supersedes the old. The supervisor owns the single current credential.

pub mod jwt;

use crate::clock::ClockSource;
use crate::error::IssueError;
use std::fmt;
use std::time::Duration;

pub use jwt::{parse_private_key, JwtIssuer};

/// Immutable device identity used for broker addressing and signing
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub project_id: String,
    pub location: String,
    pub registry_id: String,
    pub device_id: String,
    /// Private key material (colon-separated hex or PEM)
    pub private_key: String,
}

impl DeviceIdentity {
    pub fn new(
        project_id: impl Into<String>,
        location: impl Into<String>,
        registry_id: impl Into<String>,
        device_id: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            location: location.into(),
            registry_id: registry_id.into(),
            device_id: device_id.into(),
            private_key: private_key.into(),
        }
    }

    /// Fully-qualified device path, used as the MQTT client id
    pub fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project_id, self.location, self.registry_id, self.device_id
        )
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("project_id", &self.project_id)
            .field("location", &self.location)
            .field("registry_id", &self.registry_id)
            .field("device_id", &self.device_id)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Signed token valid over `[issued_at, expires_at)`
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    issued_at: u64,
    expires_at: u64,
}

impl Credential {
    pub fn new(token: String, issued_at: u64, expires_at: u64) -> Self {
        Self {
            token,
            issued_at,
            expires_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn issued_at(&self) -> u64 {
        self.issued_at
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// Seconds of validity left at `now` (zero once expired)
    pub fn remaining(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// True once remaining validity has dropped to the renewal margin
    pub fn needs_renewal(&self, now: u64, margin: Duration) -> bool {
        self.remaining(now) <= margin.as_secs()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &format_args!("<{} bytes>", self.token.len()))
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Produces signed, time-bounded credentials for one device
pub trait CredentialIssuer: Send + Sync {
    fn identity(&self) -> &DeviceIdentity;

    /// Issue a credential valid from `now` for `validity`.
    ///
    /// Deterministic for identical inputs and key material.
    fn issue(&self, now: u64, validity: Duration) -> Result<Credential, IssueError>;

    /// Issue using the current time of `clock`; refuses while unsynchronized
    fn issue_now(
        &self,
        clock: &dyn ClockSource,
        validity: Duration,
    ) -> Result<Credential, IssueError> {
        let now = clock.now()?;
        self.issue(now, validity)
    }
}

//! Thread-safe metrics collection
//!
//! Atomic counters for connection supervision and publishing. Each publisher
//! owns its own collector so independent instances (and tests) never share
//! counts.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Counters updated by the supervisor and publish path
#[derive(Debug)]
pub struct MetricsCollector {
    connect_attempts: AtomicU64,
    connections_established: AtomicU64,
    connect_failures: AtomicU64,
    credentials_issued: AtomicU64,
    credential_renewals: AtomicU64,
    link_losses: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    publishes_rejected: AtomicU64,
    credential_expires_at: AtomicU64,
    started_at: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connect_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            credentials_issued: AtomicU64::new(0),
            credential_renewals: AtomicU64::new(0),
            link_losses: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            publishes_rejected: AtomicU64::new(0),
            credential_expires_at: AtomicU64::new(0),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn connect_attempted(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn credential_issued(&self, expires_at: u64, renewal: bool) {
        self.credentials_issued.fetch_add(1, Ordering::Relaxed);
        if renewal {
            self.credential_renewals.fetch_add(1, Ordering::Relaxed);
        }
        self.credential_expires_at
            .store(expires_at, Ordering::Relaxed);
    }

    pub fn link_lost(&self) {
        self.link_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_rejected(&self) {
        self.publishes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let expires_at = self.credential_expires_at.load(Ordering::Relaxed);
        MetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            credentials_issued: self.credentials_issued.load(Ordering::Relaxed),
            credential_renewals: self.credential_renewals.load(Ordering::Relaxed),
            credential_expires_at: (expires_at > 0).then_some(expires_at),
            link_losses: self.link_losses.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            publishes_rejected: self.publishes_rejected.load(Ordering::Relaxed),
            uptime_seconds: current_timestamp()
                .saturating_sub(self.started_at.load(Ordering::Relaxed)),
        }
    }
}

/// Serializable view of [`MetricsCollector`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connect_attempts: u64,
    pub connections_established: u64,
    pub connect_failures: u64,
    pub credentials_issued: u64,
    pub credential_renewals: u64,
    pub credential_expires_at: Option<u64>,
    pub link_losses: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub publishes_rejected: u64,
    pub uptime_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

//! Health check HTTP server
//!
//! Exposes the supervised session state to a local watchdog or operator.
//! Disabled by default; enabled from the `[health]` config section.

use crate::observability::metrics::MetricsCollector;
use crate::supervisor::SessionState;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    device_id: String,
    port: u16,
    status_rx: watch::Receiver<SessionState>,
    metrics: Arc<MetricsCollector>,
}

impl HealthServer {
    pub fn new(
        device_id: String,
        port: u16,
        status_rx: watch::Receiver<SessionState>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            device_id,
            port,
            status_rx,
            metrics,
        }
    }

    /// Serve until the task is dropped
    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting health server on port {}", self.port);
        let port = self.port;
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
    }

    /// `/health`, `/ready`, `/live` and `/metrics`
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self.clone();
        let metrics_server = self;

        // GET /health - session and credential checks
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.health_status();
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /ready - a publish would be accepted right now
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let session = *server.status_rx.borrow();
                let response = ReadinessResponse {
                    ready: session.can_publish(),
                    session,
                    timestamp: current_timestamp(),
                };
                let code = if response.ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live - process is up
        let live_route = warp::path("live").and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        let metrics_route = warp::path("metrics").and(warp::get()).and_then(move || {
            let server = metrics_server.clone();
            async move { Ok::<_, Infallible>(warp::reply::json(&server.metrics.snapshot())) }
        });

        health_route.or(ready_route).or(live_route).or(metrics_route)
    }

    fn health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let snapshot = self.metrics.snapshot();

        let mut checks = HashMap::new();
        checks.insert("session".to_string(), self.check_session(now));
        checks.insert(
            "credential".to_string(),
            check_credential(snapshot.credential_expires_at, now),
        );

        let healthy = checks.values().all(|check| check.status == "healthy");

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            device_id: self.device_id.clone(),
            uptime_seconds: snapshot.uptime_seconds,
            checks,
        }
    }

    fn check_session(&self, now: u64) -> HealthCheck {
        let state = *self.status_rx.borrow();
        HealthCheck {
            status: if state.can_publish() { "healthy" } else { "unhealthy" }.to_string(),
            message: Some(format!("Broker session {state}")),
            last_check: now,
        }
    }
}

fn check_credential(expires_at: Option<u64>, now: u64) -> HealthCheck {
    let (status, message) = match expires_at {
        None => ("unhealthy", "No credential issued yet".to_string()),
        Some(exp) if exp <= now => ("expired", format!("Credential expired at {exp}")),
        Some(exp) => ("healthy", format!("Credential valid for {}s", exp - now)),
    };
    HealthCheck {
        status: status.to_string(),
        message: Some(message),
        last_check: now,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    device_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    session: SessionState,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

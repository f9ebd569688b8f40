//! Connection supervisor behavior over virtual time
//!
//! Runs the real control loop against the scripted session with tokio's
//! paused clock, so hours of credential lifetime pass instantly.

use std::sync::Arc;
use std::time::Duration;
use telemetry_link::clock::ClockSource;
use telemetry_link::config::{BackoffConfig, SupervisorConfig};
use telemetry_link::error::{ClockError, PublishFailure};
use telemetry_link::supervisor::{ConnectionSupervisor, PublishRequest, SessionState, TickOutcome};
use telemetry_link::testing::{test_identity, ManualClock, MockIssuer, MockSession};
use telemetry_link::transport::TransportSession;
use tokio::time::Instant;

const T0: u64 = 1_700_000_000;

/// Wall clock that advances with tokio's (paused) clock
struct VirtualClock {
    base_epoch: u64,
    start: Instant,
}

impl VirtualClock {
    fn starting_at(base_epoch: u64) -> Self {
        Self {
            base_epoch,
            start: Instant::now(),
        }
    }
}

impl ClockSource for VirtualClock {
    fn now(&self) -> Result<u64, ClockError> {
        Ok(self.base_epoch + self.start.elapsed().as_secs())
    }
}

fn config(jitter: f64) -> SupervisorConfig {
    SupervisorConfig {
        credential_validity: Duration::from_secs(1200),
        renewal_margin: Duration::from_secs(120),
        check_interval: Duration::from_secs(60),
        backoff: BackoffConfig {
            min: Duration::from_secs(1),
            max: Duration::from_secs(8),
            multiplier: 2.0,
            jitter,
        },
        ..SupervisorConfig::default()
    }
}

fn supervisor(
    clock: Arc<dyn ClockSource>,
    session: Arc<MockSession>,
    config: SupervisorConfig,
) -> ConnectionSupervisor<MockSession> {
    ConnectionSupervisor::new(
        Arc::new(MockIssuer::new(test_identity())),
        clock,
        session,
        config,
    )
}

async fn wait_for_connects(session: &MockSession, count: usize) {
    tokio::time::timeout(Duration::from_secs(3600), async {
        while session.connects().len() < count {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("expected connect attempts never happened");
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_intervals_never_shrink() {
    let clock: Arc<dyn ClockSource> = Arc::new(VirtualClock::starting_at(T0));
    let session = Arc::new(MockSession::new());
    session.fail_next_connects(6);
    let supervisor = supervisor(clock, Arc::clone(&session), config(0.2));

    supervisor.start().await.unwrap();
    wait_for_connects(&session, 7).await;

    let attempts: Vec<Instant> = session.connects().iter().map(|c| c.at).collect();
    let intervals: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();

    for pair in intervals.windows(2) {
        assert!(pair[1] >= pair[0], "intervals shrank: {intervals:?}");
    }
    for interval in &intervals {
        assert!(*interval >= Duration::from_secs(1), "{intervals:?}");
        assert!(*interval <= Duration::from_secs(8), "{intervals:?}");
    }
    assert_eq!(supervisor.status(), SessionState::Connected);
    assert_eq!(supervisor.metrics().snapshot().connect_failures, 6);

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsynchronized_clock_never_connects() {
    let clock = Arc::new(ManualClock::unsynchronized());
    let session = Arc::new(MockSession::new());
    let supervisor = supervisor(clock.clone(), Arc::clone(&session), config(0.0));

    supervisor.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert!(session.connects().is_empty());
    assert_eq!(supervisor.status(), SessionState::Disconnected);
    assert!(supervisor.current_credential().await.is_none());

    let result = supervisor
        .publish(PublishRequest::new(None, &b"early"[..]))
        .await;
    assert_eq!(
        result,
        Err(PublishFailure::PublisherUnavailable(Duration::from_secs(5)))
    );

    clock.set(T0);
    wait_for_connects(&session, 1).await;
    assert_eq!(session.connects()[0].credential.issued_at(), T0);

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_renewal_happens_inside_margin() {
    let clock = Arc::new(ManualClock::at(T0));
    let session = Arc::new(MockSession::with_clock(clock.clone()));
    let supervisor = supervisor(clock.clone(), Arc::clone(&session), config(0.0));

    assert_eq!(supervisor.tick().await, TickOutcome::Connected);

    let mut renewals = Vec::new();
    for minute in 1..=20u64 {
        clock.set(T0 + minute * 60);
        match supervisor.tick().await {
            TickOutcome::Renewed => renewals.push(T0 + minute * 60),
            TickOutcome::Healthy => {}
            other => panic!("unexpected outcome at minute {minute}: {other:?}"),
        }
    }

    assert_eq!(renewals, vec![T0 + 1080]);
    let renewed = &session.connects()[1].credential;
    assert_eq!(renewed.issued_at(), T0 + 1080);
    assert_eq!(renewed.expires_at(), T0 + 2280);
}

#[tokio::test(start_paused = true)]
async fn test_expired_credential_is_never_presented() {
    let clock: Arc<dyn ClockSource> = Arc::new(VirtualClock::starting_at(T0));
    let session = Arc::new(MockSession::with_clock(Arc::clone(&clock)));
    let supervisor = supervisor(Arc::clone(&clock), Arc::clone(&session), config(0.0));

    supervisor.start().await.unwrap();

    // Three hours with a link drop every 25 minutes
    for _ in 0..7 {
        tokio::time::sleep(Duration::from_secs(25 * 60)).await;
        session.drop_link();
    }
    tokio::time::sleep(Duration::from_secs(120)).await;

    let connects = session.connects();
    assert!(connects.len() > 7, "only {} connects", connects.len());
    for record in &connects {
        let now = record.at_epoch.expect("session has a clock");
        assert!(
            !record.credential.is_expired(now),
            "expired credential presented at {now}: {:?}",
            record.credential
        );
        assert!(record.credential.issued_at() <= now);
    }
    assert_eq!(supervisor.metrics().snapshot().link_losses, 7);
    assert_eq!(supervisor.status(), SessionState::Connected);

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_reconnects_after_min_backoff() {
    let clock: Arc<dyn ClockSource> = Arc::new(VirtualClock::starting_at(T0));
    let session = Arc::new(MockSession::new());
    let supervisor = supervisor(clock, Arc::clone(&session), config(0.0));

    supervisor.start().await.unwrap();
    wait_for_connects(&session, 1).await;

    let dropped = Instant::now();
    session.drop_link();
    tokio::task::yield_now().await;
    assert_eq!(supervisor.status(), SessionState::Disconnected);

    wait_for_connects(&session, 2).await;
    let second = session.connects()[1].at;

    // Reported by the session right away, retried one minimum backoff later
    assert_eq!(second - dropped, Duration::from_secs(1));
    assert_eq!(supervisor.status(), SessionState::Connected);

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_link_loss_found_at_next_check() {
    let clock: Arc<dyn ClockSource> = Arc::new(VirtualClock::starting_at(T0));
    let session = Arc::new(MockSession::new());
    let supervisor = supervisor(clock, Arc::clone(&session), config(0.0));

    supervisor.start().await.unwrap();
    wait_for_connects(&session, 1).await;
    let first = session.connects()[0].at;

    session.drop_link_silently();
    wait_for_connects(&session, 2).await;
    let second = session.connects()[1].at;

    // Noticed by the liveness check, retried one minimum backoff later
    assert_eq!(second - first, Duration::from_secs(61));

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_and_restart() {
    let clock: Arc<dyn ClockSource> = Arc::new(VirtualClock::starting_at(T0));
    let session = Arc::new(MockSession::new());
    let supervisor = supervisor(clock, Arc::clone(&session), config(0.0));

    supervisor.start().await.unwrap();
    supervisor.start().await.unwrap();
    wait_for_connects(&session, 1).await;

    supervisor.stop().await;
    assert_eq!(supervisor.status(), SessionState::Disconnected);
    assert!(!session.is_alive());
    assert!(session.disconnects() >= 1);
    assert_eq!(
        supervisor
            .publish(PublishRequest::new(None, &b"late"[..]))
            .await,
        Err(PublishFailure::Stopped)
    );

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(session.connects().len(), 1, "stopped supervisor reconnected");

    supervisor.start().await.unwrap();
    wait_for_connects(&session, 2).await;
    assert_eq!(supervisor.status(), SessionState::Connected);

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_status_watch_observes_transitions() {
    let clock: Arc<dyn ClockSource> = Arc::new(VirtualClock::starting_at(T0));
    let session = Arc::new(MockSession::new());
    session.fail_next_connects(1);
    let supervisor = supervisor(clock, Arc::clone(&session), config(0.0));
    let mut status = supervisor.subscribe_status();

    supervisor.start().await.unwrap();
    status
        .wait_for(|state| *state == SessionState::Failed)
        .await
        .unwrap();
    status
        .wait_for(|state| *state == SessionState::Connected)
        .await
        .unwrap();

    supervisor.stop().await;
}

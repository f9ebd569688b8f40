//! Connection supervision
//!
//! The [`ConnectionSupervisor`] owns the single current credential and the
//! broker session. A background control loop ticks every check interval (or
//! sooner after a failure) and keeps the session alive: it renews the
//! credential before expiry, reconnects with backoff after failures and
//! refuses to connect while the clock is unsynchronized.
//!
//! Publishes are serialized: at most one is in flight on the session, callers
//! beyond the configured queue depth are rejected immediately.

pub mod backoff;
pub mod state;

pub use backoff::Backoff;
pub use state::{log_state_transition, SessionState, TickOutcome};

use crate::clock::ClockSource;
use crate::config::SupervisorConfig;
use crate::credential::{Credential, CredentialIssuer};
use crate::error::{ClockError, ConnectError, IssueError, PublishError, PublishFailure, SigningError};
use crate::link_span;
use crate::observability::MetricsCollector;
use crate::transport::TransportSession;
use bytes::Bytes;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// One telemetry message handed to the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    /// Events subfolder; `None` publishes to the default events topic
    pub topic: Option<String>,
    pub payload: Bytes,
}

impl PublishRequest {
    pub fn new(topic: Option<&str>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.map(str::to_owned),
            payload: payload.into(),
        }
    }
}

struct Inner {
    state: SessionState,
    credential: Option<Credential>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

struct Shared<S> {
    issuer: Arc<dyn CredentialIssuer>,
    clock: Arc<dyn ClockSource>,
    session: Arc<S>,
    config: SupervisorConfig,
    inner: Mutex<Inner>,
    fatal: OnceLock<SigningError>,
    state_tx: watch::Sender<SessionState>,
    /// `true` while the control loop is not running
    stopped_tx: watch::Sender<bool>,
    wake: Notify,
    admission: Semaphore,
    service: Mutex<()>,
    metrics: Arc<MetricsCollector>,
}

/// Keeps one authenticated broker session alive and serializes publishes on it
pub struct ConnectionSupervisor<S: TransportSession + 'static> {
    shared: Arc<Shared<S>>,
    control_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<S: TransportSession + 'static> Clone for ConnectionSupervisor<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            control_task: Arc::clone(&self.control_task),
        }
    }
}

impl<S: TransportSession + 'static> ConnectionSupervisor<S> {
    pub fn new(
        issuer: Arc<dyn CredentialIssuer>,
        clock: Arc<dyn ClockSource>,
        session: Arc<S>,
        config: SupervisorConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (stopped_tx, _) = watch::channel(true);
        let backoff = Backoff::new(config.backoff);
        let admission = Semaphore::new(config.queue_depth.saturating_add(1));

        Self {
            shared: Arc::new(Shared {
                issuer,
                clock,
                session,
                inner: Mutex::new(Inner {
                    state: SessionState::Disconnected,
                    credential: None,
                    backoff,
                    retry_at: None,
                }),
                fatal: OnceLock::new(),
                state_tx,
                stopped_tx,
                wake: Notify::new(),
                admission,
                service: Mutex::new(()),
                metrics: Arc::new(MetricsCollector::new()),
                config,
            }),
            control_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Launch the control loop. Idempotent while running.
    ///
    /// Fails if a previous signing failure halted the supervisor.
    pub async fn start(&self) -> Result<(), SigningError> {
        if let Some(fatal) = self.shared.fatal.get() {
            return Err(fatal.clone());
        }

        let mut task = self.control_task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Connection supervisor already running");
            return Ok(());
        }

        self.shared.stopped_tx.send_replace(false);
        let supervisor = self.clone();
        let span = link_span!(device_id = %self.shared.issuer.identity().device_id);
        *task = Some(tokio::spawn(supervisor.run().instrument(span)));
        Ok(())
    }

    /// Halt the control loop and release the session.
    ///
    /// Pending and in-flight publishes fail with [`PublishFailure::Stopped`].
    pub async fn stop(&self) {
        self.shared.stopped_tx.send_replace(true);

        if let Some(handle) = self.control_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        let mut inner = self.shared.inner.lock().await;
        self.shared.session.disconnect().await;
        inner.retry_at = None;
        inner.backoff.reset();
        self.transition(&mut inner, SessionState::Disconnected);
        info!("Connection supervisor stopped");
    }

    /// Run one control step: liveness, renewal, or (re)connect
    pub async fn tick(&self) -> TickOutcome {
        if self.shared.fatal.get().is_some() {
            return TickOutcome::Halted;
        }

        let mut inner = self.shared.inner.lock().await;
        let now = self.shared.clock.now();

        if inner.state != SessionState::Connected {
            return self.reconnect(&mut inner, now).await;
        }

        if !self.shared.session.is_alive() {
            self.shared.metrics.link_lost();
            self.shared.session.disconnect().await;
            self.transition(&mut inner, SessionState::Disconnected);
            return TickOutcome::LinkLost;
        }

        let now = match now {
            Ok(now) => now,
            Err(e) => {
                warn!("Skipping renewal check: {e}");
                return TickOutcome::Healthy;
            }
        };

        let renewal_due = inner
            .credential
            .as_ref()
            .map_or(true, |c| c.needs_renewal(now, self.shared.config.renewal_margin));
        if !renewal_due {
            return TickOutcome::Healthy;
        }

        self.renew(&mut inner, now).await
    }

    /// Submit one message and wait for the session's result
    pub async fn publish(&self, request: PublishRequest) -> Result<(), PublishFailure> {
        let mut stopped_rx = self.shared.stopped_tx.subscribe();
        if *stopped_rx.borrow_and_update() {
            return Err(PublishFailure::Stopped);
        }
        if let Some(fatal) = self.shared.fatal.get() {
            return Err(PublishFailure::Signing(fatal.clone()));
        }

        let Ok(_permit) = self.shared.admission.try_acquire() else {
            self.shared.metrics.publish_rejected();
            let depth = self.shared.config.queue_depth;
            warn!(depth, "Publish rejected, queue full");
            return Err(PublishFailure::QueueFull { depth });
        };

        tokio::select! {
            biased;
            _ = stopped_rx.wait_for(|stopped| *stopped) => Err(PublishFailure::Stopped),
            result = self.publish_in_turn(request) => result,
        }
    }

    pub fn status(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch channel that observes every state transition
    pub fn subscribe_status(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.shared.metrics)
    }

    pub async fn current_credential(&self) -> Option<Credential> {
        self.shared.inner.lock().await.credential.clone()
    }

    /// Signing failure that halted the supervisor, if any
    pub fn fatal_error(&self) -> Option<SigningError> {
        self.shared.fatal.get().cloned()
    }

    async fn run(self) {
        let mut stopped_rx = self.shared.stopped_tx.subscribe();
        let check_interval = self.shared.config.check_interval;
        let min_backoff = self.shared.config.backoff.min;
        info!("Connection supervisor started");

        loop {
            if *stopped_rx.borrow_and_update() {
                break;
            }

            let outcome = self.tick().await;
            debug!(?outcome, "Control tick complete");

            let Some(delay) = outcome.next_delay(check_interval, min_backoff) else {
                error!("Control loop halted");
                break;
            };

            let watch_link = outcome.session_up();
            tokio::select! {
                _ = stopped_rx.changed() => {}
                _ = tokio::time::sleep(delay) => {}
                _ = self.shared.wake.notified() => {
                    debug!("Control loop woken early");
                }
                _ = self.shared.session.link_lost(), if watch_link => {
                    debug!("Session reported link loss");
                }
            }
        }
    }

    async fn reconnect(&self, inner: &mut Inner, now: Result<u64, ClockError>) -> TickOutcome {
        if let Some(retry_at) = inner.retry_at {
            let current = Instant::now();
            if current < retry_at {
                return TickOutcome::RetryIn(retry_at - current);
            }
        }

        let now = match now {
            Ok(now) => now,
            Err(e) => {
                debug!("Not connecting: {e}");
                self.transition(inner, SessionState::Disconnected);
                return TickOutcome::AwaitingClock;
            }
        };

        let margin = self.shared.config.renewal_margin;
        let credential = match inner.credential.clone() {
            Some(current) if !current.needs_renewal(now, margin) => current,
            _ => match self.issue(inner, now, false) {
                Ok(issued) => issued,
                Err(e) if e.is_fatal() => return self.halt(inner, e).await,
                Err(e) => {
                    warn!("Not connecting: {e}");
                    self.transition(inner, SessionState::Disconnected);
                    return TickOutcome::AwaitingClock;
                }
            },
        };

        self.transition(inner, SessionState::Connecting);
        self.establish(inner, credential, TickOutcome::Connected).await
    }

    async fn renew(&self, inner: &mut Inner, now: u64) -> TickOutcome {
        self.transition(inner, SessionState::Reauthenticating);

        let credential = match self.issue(inner, now, true) {
            Ok(issued) => issued,
            Err(e) if e.is_fatal() => return self.halt(inner, e).await,
            Err(e) => {
                let expired = inner.credential.as_ref().map_or(true, |c| c.is_expired(now));
                if expired {
                    warn!("Credential expired and cannot be renewed: {e}");
                    self.shared.session.disconnect().await;
                    self.transition(inner, SessionState::Disconnected);
                    return TickOutcome::AwaitingClock;
                }
                warn!("Renewal deferred, keeping current credential: {e}");
                self.transition(inner, SessionState::Connected);
                return TickOutcome::Healthy;
            }
        };

        self.establish(inner, credential, TickOutcome::Renewed).await
    }

    fn issue(&self, inner: &mut Inner, now: u64, renewal: bool) -> Result<Credential, IssueError> {
        let credential = self
            .shared
            .issuer
            .issue(now, self.shared.config.credential_validity)?;

        info!(
            issued_at = credential.issued_at(),
            expires_at = credential.expires_at(),
            renewal,
            "Issued device credential"
        );
        self.shared
            .metrics
            .credential_issued(credential.expires_at(), renewal);
        inner.credential = Some(credential.clone());
        Ok(credential)
    }

    async fn establish(
        &self,
        inner: &mut Inner,
        credential: Credential,
        on_success: TickOutcome,
    ) -> TickOutcome {
        let shared = &self.shared;
        // ConnAck wait plus the post-connect subscribes
        let connect_timeout = shared.config.connect_timeout + shared.config.operation_timeout;
        shared.metrics.connect_attempted();

        let result = match tokio::time::timeout(
            connect_timeout,
            shared.session.connect(shared.issuer.identity(), &credential),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout(connect_timeout)),
        };

        match result {
            Ok(()) => {
                shared.metrics.connection_established();
                inner.backoff.reset();
                inner.retry_at = None;
                self.transition(inner, SessionState::Connected);
                on_success
            }
            Err(e) => {
                shared.metrics.connect_failed();
                shared.session.disconnect().await;
                let delay = inner.backoff.next_delay();
                inner.retry_at = Some(Instant::now() + delay);
                warn!(
                    attempt = inner.backoff.attempt(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Connect failed: {e}"
                );
                self.transition(inner, SessionState::Failed);
                TickOutcome::RetryIn(delay)
            }
        }
    }

    async fn halt(&self, inner: &mut Inner, e: IssueError) -> TickOutcome {
        let signing = match e {
            IssueError::Signing(signing) => signing,
            other => SigningError::Encoding(other.to_string()),
        };
        error!("Credential signing failed, supervisor halted: {signing}");

        let _ = self.shared.fatal.set(signing);
        self.shared.session.disconnect().await;
        self.transition(inner, SessionState::Failed);
        // Wake waiting publishers even when the state was already Failed
        self.shared.state_tx.send_replace(SessionState::Failed);
        TickOutcome::Halted
    }

    async fn publish_in_turn(&self, request: PublishRequest) -> Result<(), PublishFailure> {
        let _turn = self.shared.service.lock().await;
        let deadline = Instant::now() + self.shared.config.publish_timeout;

        // The link may have died since the last control tick
        loop {
            self.wait_until_connected(deadline).await?;
            if self.shared.session.is_alive() {
                break;
            }
            self.drop_session().await;
        }

        let operation_timeout = self.shared.config.operation_timeout;
        let bytes = request.payload.len();
        let result = match tokio::time::timeout(
            operation_timeout,
            self.shared
                .session
                .publish(request.topic.as_deref(), request.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(operation_timeout)),
        };

        match result {
            Ok(()) => {
                self.shared.metrics.message_published();
                debug!(topic = ?request.topic, bytes, "Telemetry published");
                Ok(())
            }
            Err(e) => {
                self.shared.metrics.publish_failed();
                warn!(topic = ?request.topic, "Publish failed: {e}");
                if matches!(e, PublishError::Transport(_) | PublishError::NotConnected) {
                    self.drop_session().await;
                }
                Err(e.into())
            }
        }
    }

    async fn wait_until_connected(&self, deadline: Instant) -> Result<(), PublishFailure> {
        let mut state_rx = self.shared.state_tx.subscribe();
        if state_rx.borrow_and_update().can_publish() {
            return Ok(());
        }

        let unavailable = |waited: Duration| match self.shared.fatal.get() {
            Some(fatal) => PublishFailure::Signing(fatal.clone()),
            None => PublishFailure::PublisherUnavailable(waited),
        };

        if !self.shared.config.wait_for_connection {
            return Err(unavailable(Duration::ZERO));
        }

        let publish_timeout = self.shared.config.publish_timeout;
        let fatal = &self.shared.fatal;
        let ready = state_rx.wait_for(|state| state.can_publish() || fatal.get().is_some());
        let waited = tokio::time::timeout_at(deadline, ready)
            .await
            .map(|result| result.map(|_| ()));
        match waited {
            Ok(Ok(())) => match fatal.get() {
                Some(fatal) => Err(PublishFailure::Signing(fatal.clone())),
                None => Ok(()),
            },
            Ok(Err(_)) => Err(PublishFailure::Stopped),
            Err(_) => Err(unavailable(publish_timeout)),
        }
    }

    /// Tear down a session found dead by a publish and wake the control loop,
    /// which reconnects after the minimum backoff
    async fn drop_session(&self) {
        let mut inner = self.shared.inner.lock().await;
        if inner.state == SessionState::Connected {
            self.shared.metrics.link_lost();
            self.shared.session.disconnect().await;
            inner.retry_at = Some(Instant::now() + self.shared.config.backoff.min);
            self.transition(&mut inner, SessionState::Disconnected);
        }
        drop(inner);
        self.shared.wake.notify_one();
    }

    fn transition(&self, inner: &mut Inner, to: SessionState) {
        if inner.state == to {
            return;
        }
        log_state_transition(inner.state, to);
        inner.state = to;
        self.shared.state_tx.send_replace(to);
    }
}

//! Mock implementations for testing
//!
//! Provides a settable clock, a scripted transport session and a credential
//! issuer that needs no key material, so the supervisor can be exercised
//! without a broker.

use crate::clock::{check_synchronized, ClockSource};
use crate::credential::{Credential, CredentialIssuer, DeviceIdentity};
use crate::error::{ClockError, ConnectError, IssueError, PublishError, SigningError};
use crate::transport::TransportSession;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Valid P-256 private scalar in the colon-separated hex form `openssl ec -text` prints
pub const TEST_PRIVATE_KEY: &str = "3c:b5:72:c2:b8:09:e3:f3:84:8d:b2:41:03:b3:9a:14:\
                                    b1:4e:a1:f9:76:09:d3:ff:d3:e2:0e:a5:78:0d:32:f3";

pub fn test_identity() -> DeviceIdentity {
    DeviceIdentity::new(
        "test-project",
        "us-central1",
        "test-registry",
        "device-1",
        TEST_PRIVATE_KEY,
    )
}

/// Clock whose epoch is set by the test; zero reads as unsynchronized
#[derive(Debug, Default)]
pub struct ManualClock {
    epoch: AtomicU64,
}

impl ManualClock {
    pub fn unsynchronized() -> Self {
        Self::default()
    }

    pub fn at(epoch: u64) -> Self {
        Self {
            epoch: AtomicU64::new(epoch),
        }
    }

    pub fn set(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.epoch.fetch_add(by.as_secs(), Ordering::SeqCst);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> Result<u64, ClockError> {
        check_synchronized(self.epoch())
    }
}

/// Issuer producing unsigned placeholder tokens with real validity windows
#[derive(Debug)]
pub struct MockIssuer {
    identity: DeviceIdentity,
    fail_signing: bool,
    issued: AtomicUsize,
}

impl MockIssuer {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            fail_signing: false,
            issued: AtomicUsize::new(0),
        }
    }

    /// Every issue fails with a malformed-key error
    pub fn failing(identity: DeviceIdentity) -> Self {
        Self {
            fail_signing: true,
            ..Self::new(identity)
        }
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

impl CredentialIssuer for MockIssuer {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn issue(&self, now: u64, validity: Duration) -> Result<Credential, IssueError> {
        if self.fail_signing {
            return Err(SigningError::MalformedKey("mock key rejected".to_string()).into());
        }
        let now = check_synchronized(now)?;
        if validity.as_secs() == 0 {
            return Err(SigningError::InvalidValidity.into());
        }

        let expires_at = now
            .checked_add(validity.as_secs())
            .ok_or(SigningError::InvalidValidity)?;

        let serial = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(Credential::new(
            format!("mock-token-{serial}-{now}"),
            now,
            expires_at,
        ))
    }
}

/// One connect call observed by [`MockSession`]
#[derive(Debug, Clone)]
pub struct ConnectRecord {
    pub credential: Credential,
    /// Device clock reading at the call, when the session was given a clock
    pub at_epoch: Option<u64>,
    pub at: Instant,
}

/// One message accepted by [`MockSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: Option<String>,
    pub payload: Bytes,
}

/// Scripted result for the next publish
#[derive(Debug, Clone)]
pub enum PublishBehavior {
    Succeed,
    Fail(PublishError),
    /// Never completes
    Hang,
}

#[derive(Debug, Default)]
struct MockState {
    connect_failures: usize,
    connects: Vec<ConnectRecord>,
    published: Vec<PublishedMessage>,
    publish_script: VecDeque<PublishBehavior>,
    disconnects: usize,
}

/// Transport session with scripted connect and publish outcomes
#[derive(Default)]
pub struct MockSession {
    clock: Option<Arc<dyn ClockSource>>,
    state: Mutex<MockState>,
    alive: AtomicBool,
    link_down: Notify,
    publish_attempted: Notify,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject connects whose credential has expired according to `clock`
    pub fn with_clock(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            clock: Some(clock),
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `count` connects are refused
    pub fn fail_next_connects(&self, count: usize) {
        self.state().connect_failures = count;
    }

    /// Queue outcomes for upcoming publishes; unscripted publishes succeed
    pub fn script_publishes(&self, behaviors: impl IntoIterator<Item = PublishBehavior>) {
        self.state().publish_script.extend(behaviors);
    }

    /// Simulate the broker link dying without a disconnect call
    pub fn drop_link(&self) {
        self.mark_dead();
    }

    /// Like [`drop_link`](Self::drop_link), but the loss is only visible
    /// through [`TransportSession::is_alive`]
    pub fn drop_link_silently(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.link_down.notify_waiters();
    }

    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.state().connects.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    /// Resolves once a publish call has reached the session
    pub async fn publish_attempted(&self) {
        self.publish_attempted.notified().await;
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn connect(
        &self,
        _identity: &DeviceIdentity,
        credential: &Credential,
    ) -> Result<(), ConnectError> {
        let at_epoch = self.clock.as_ref().and_then(|clock| clock.now().ok());
        let mut state = self.state();
        state.connects.push(ConnectRecord {
            credential: credential.clone(),
            at_epoch,
            at: Instant::now(),
        });

        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            self.alive.store(false, Ordering::SeqCst);
            return Err(ConnectError::Refused("scripted failure".to_string()));
        }
        if at_epoch.is_some_and(|now| credential.is_expired(now)) {
            self.alive.store(false, Ordering::SeqCst);
            return Err(ConnectError::Refused("credential expired".to_string()));
        }

        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: Option<&str>, payload: Bytes) -> Result<(), PublishError> {
        self.publish_attempted.notify_one();
        if !self.is_alive() {
            return Err(PublishError::NotConnected);
        }

        let behavior = self
            .state()
            .publish_script
            .pop_front()
            .unwrap_or(PublishBehavior::Succeed);

        match behavior {
            PublishBehavior::Succeed => {
                self.state().published.push(PublishedMessage {
                    topic: topic.map(str::to_owned),
                    payload,
                });
                Ok(())
            }
            PublishBehavior::Fail(error) => {
                if matches!(error, PublishError::Transport(_)) {
                    self.mark_dead();
                }
                Err(error)
            }
            PublishBehavior::Hang => std::future::pending().await,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn link_lost(&self) {
        let down = self.link_down.notified();
        tokio::pin!(down);
        down.as_mut().enable();
        if !self.is_alive() {
            return;
        }
        down.await;
    }

    async fn disconnect(&self) {
        self.mark_dead();
        self.state().disconnects += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::unsynchronized();
        assert!(!clock.is_synchronized());

        clock.set(1_700_000_000);
        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now(), Ok(1_700_000_060));
    }

    #[test]
    fn test_mock_issuer_windows() {
        let issuer = MockIssuer::new(test_identity());
        let credential = issuer.issue(1_700_000_000, Duration::from_secs(1200)).unwrap();
        assert_eq!(credential.expires_at(), 1_700_001_200);
        assert_eq!(issuer.issued(), 1);

        assert!(matches!(
            issuer.issue(5, Duration::from_secs(1200)),
            Err(IssueError::Clock(_))
        ));
        assert_eq!(
            issuer.issue(1_700_000_000, Duration::from_secs(u64::MAX)),
            Err(IssueError::Signing(SigningError::InvalidValidity))
        );
    }

    #[tokio::test]
    async fn test_mock_session_scripts() {
        let session = MockSession::new();
        session.fail_next_connects(1);
        let credential = Credential::new("t".to_string(), 1_700_000_000, 1_700_001_200);

        assert!(session.connect(&test_identity(), &credential).await.is_err());
        assert!(session.connect(&test_identity(), &credential).await.is_ok());
        assert!(session.is_alive());

        session.script_publishes([PublishBehavior::Fail(PublishError::Transport("reset".into()))]);
        assert!(session.publish(None, Bytes::from_static(b"a")).await.is_err());
        assert!(!session.is_alive());
        assert_eq!(session.connects().len(), 2);
    }
}

//! Error types for the credential and connection-supervision layer
//!
//! Errors are split by the component that produces them. Transport and connect
//! failures are absorbed by the supervisor (retry with backoff); signing
//! failures are configuration errors and are surfaced immediately.

use std::time::Duration;
use thiserror::Error;

/// Wall-clock precondition failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("Clock is not synchronized (reads epoch {now})")]
    Unsynchronized { now: u64 },
}

/// Key material or token encoding failures. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("Malformed private key: {0}")]
    MalformedKey(String),
    #[error("Token encoding failed: {0}")]
    Encoding(String),
    #[error("Credential validity must be at least one second")]
    InvalidValidity,
}

/// Reasons a credential could not be issued
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IssueError {
    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),
    #[error("Refusing to issue credential: {0}")]
    Clock(#[from] ClockError),
}

impl IssueError {
    /// Signing failures can never succeed on retry
    pub fn is_fatal(&self) -> bool {
        matches!(self, IssueError::Signing(_))
    }
}

/// Transport-level connect/authentication failures. Retried by the supervisor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Transport failure during connect: {0}")]
    Transport(String),
    #[error("Broker refused connection: {0}")]
    Refused(String),
    #[error("No connection acknowledgement within {0:?}")]
    Timeout(Duration),
}

/// Failures of a single publish on the live session
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("No live session")]
    NotConnected,
    #[error("Transport failure during publish: {0}")]
    Transport(String),
    #[error("Broker did not accept publish within {0:?}")]
    Timeout(Duration),
}

/// Result of a caller-facing publish
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishFailure {
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("No connected session within {0:?}")]
    PublisherUnavailable(Duration),
    #[error("Publisher stopped")]
    Stopped,
    #[error("Publish queue full (depth {depth})")]
    QueueFull { depth: usize },
    #[error("Credential signing failed: {0}")]
    Signing(SigningError),
}

impl From<SigningError> for PublishFailure {
    fn from(e: SigningError) -> Self {
        PublishFailure::Signing(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_error_fatality() {
        assert!(IssueError::Signing(SigningError::MalformedKey("bad".into())).is_fatal());
        assert!(IssueError::Signing(SigningError::InvalidValidity).is_fatal());
        assert!(!IssueError::Clock(ClockError::Unsynchronized { now: 0 }).is_fatal());
    }

    #[test]
    fn test_publish_error_is_surfaced_verbatim() {
        let failure: PublishFailure = PublishError::NotConnected.into();
        assert_eq!(failure, PublishFailure::Publish(PublishError::NotConnected));
        assert_eq!(failure.to_string(), "No live session");
    }

    #[test]
    fn test_error_display() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(ClockError::Unsynchronized { now: 12 }),
            Box::new(SigningError::Encoding("x".into())),
            Box::new(ConnectError::Refused("bad password".into())),
            Box::new(ConnectError::Timeout(Duration::from_millis(500))),
            Box::new(PublishError::Timeout(Duration::from_secs(1))),
            Box::new(PublishFailure::QueueFull { depth: 1 }),
            Box::new(PublishFailure::PublisherUnavailable(Duration::from_secs(5))),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}

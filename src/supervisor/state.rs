//! Session state and pure control-loop decisions
//!
//! Everything here is free of I/O so the supervisor's reasoning can be tested
//! without a transport.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Health of the supervised broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session; waiting for start, clock sync, or the next attempt
    Disconnected,
    /// Connect attempt in progress
    Connecting,
    /// Live session authenticated with the current credential
    Connected,
    /// Replacing the credential and re-authenticating
    Reauthenticating,
    /// Last connect attempt failed; retry scheduled after backoff
    Failed,
}

impl SessionState {
    /// Only a connected session accepts publishes
    pub fn can_publish(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reauthenticating => "reauthenticating",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What one control tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Session alive, credential not yet due for renewal
    Healthy,
    /// Credential renewed and session re-established
    Renewed,
    /// Session established from a disconnected state
    Connected,
    /// Connect or re-authentication failed; next attempt after the delay
    RetryIn(Duration),
    /// Liveness check failed; session torn down
    LinkLost,
    /// Clock not yet synchronized; nothing attempted
    AwaitingClock,
    /// Credential signing failed; the supervisor will not retry
    Halted,
}

impl TickOutcome {
    /// Delay until the next tick, or `None` when the loop should exit (pure function)
    pub fn next_delay(&self, check_interval: Duration, min_backoff: Duration) -> Option<Duration> {
        match self {
            TickOutcome::Halted => None,
            TickOutcome::RetryIn(delay) => Some(*delay),
            TickOutcome::LinkLost => Some(min_backoff),
            TickOutcome::Healthy
            | TickOutcome::Renewed
            | TickOutcome::Connected
            | TickOutcome::AwaitingClock => Some(check_interval),
        }
    }

    /// True when the tick left a live session behind
    pub fn session_up(&self) -> bool {
        matches!(
            self,
            TickOutcome::Healthy | TickOutcome::Renewed | TickOutcome::Connected
        )
    }
}

/// Log a state transition (pure logging function)
pub fn log_state_transition(from: SessionState, to: SessionState) {
    match (from, to) {
        (SessionState::Connecting, SessionState::Connected) => {
            info!("Broker session established");
        }
        (SessionState::Reauthenticating, SessionState::Connected) => {
            info!("Re-authenticated with renewed credential");
        }
        (SessionState::Connected, SessionState::Reauthenticating) => {
            info!("Credential due for renewal, re-authenticating");
        }
        (SessionState::Connected, SessionState::Disconnected) => {
            warn!("Broker session lost");
        }
        (_, SessionState::Failed) => {
            error!("Broker session failed from state {}", from);
        }
        _ => {
            info!("Session state: {} -> {}", from, to);
        }
    }
}

//! Wall-clock source for credential issuance
//!
//! Credentials carry absolute epoch timestamps, so nothing may be issued until
//! the device clock has been set from a trusted source.

use crate::error::ClockError;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Any epoch below this is treated as a clock that has not been set yet
/// (2017-11-14, well after any plausible factory-default RTC value).
pub const MIN_SYNCHRONIZED_EPOCH: u64 = 1_510_644_967;

/// Supplies current epoch time in seconds
pub trait ClockSource: Send + Sync {
    /// Current epoch seconds, or `Unsynchronized` until time has been set
    fn now(&self) -> Result<u64, ClockError>;

    fn is_synchronized(&self) -> bool {
        self.now().is_ok()
    }
}

/// System wall clock, considered synchronized once it reads a plausible epoch
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> Result<u64, ClockError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        check_synchronized(now)
    }
}

/// Classify a raw epoch reading (pure function)
pub fn check_synchronized(now: u64) -> Result<u64, ClockError> {
    if now < MIN_SYNCHRONIZED_EPOCH {
        Err(ClockError::Unsynchronized { now })
    } else {
        Ok(now)
    }
}

/// Bounded wait for the clock to become synchronized
///
/// Run once at setup before the first credential is issued. Gives up after
/// `timeout`.
pub async fn wait_until_synchronized(
    clock: &dyn ClockSource,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<u64, ClockError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match clock.now() {
            Ok(now) => {
                info!(epoch = now, "Clock synchronized");
                return Ok(now);
            }
            Err(e) if tokio::time::Instant::now() >= deadline => {
                warn!("Clock still unsynchronized after {:?}", timeout);
                return Err(e);
            }
            Err(_) => {
                debug!("Waiting on time sync...");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

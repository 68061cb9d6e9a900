//! Injectable time source.
//!
//! Components that reason about wall-clock minutes or pacing take an
//! `Arc<dyn Clock>` so tests can drive time by hand.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// A source of the current time that can also wait.
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Wait for `duration` as measured by this clock.
    async fn sleep(&self, duration: Duration);
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A clock that only moves when told to.
///
/// `sleep` advances the clock instead of waiting, so code that backs off
/// completes immediately under test.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the beginning of a wall-clock minute.
    pub fn at_minute_start() -> Self {
        let now = Utc::now().timestamp();
        let start = DateTime::from_timestamp(now - now.rem_euclid(60), 0).unwrap_or_else(Utc::now);
        Self::new(start)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn advance(&self, duration: Duration) {
        let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        *self.now.lock() += delta;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::at_minute_start();
        let start = clock.now();
        assert_eq!(start.timestamp() % 60, 0);

        clock.sleep(Duration::from_secs(5)).await;
        assert_eq!((clock.now() - start).num_seconds(), 5);
    }
}

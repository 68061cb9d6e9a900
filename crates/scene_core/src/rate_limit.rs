//! Dual-constraint rate limiter.
//!
//! A call may proceed only when both hold:
//!
//! 1. usage recorded in the current wall-clock minute plus the estimated
//!    cost stays within `tokens_per_minute_limit`;
//! 2. at least `min_delay_seconds` have passed since the caller's last
//!    recorded call.
//!
//! `wait_time` is zero exactly when `can_proceed` is true. Both are computed
//! by one function against one reading of the clock.
//!
//! `acquire` reserves the estimated cost under the same lock that checks the
//! budget, so concurrent callers see each other's in-flight calls. The
//! reservation is replaced by the actual cost in `record_usage`. A reservation
//! that is never recorded (the call was cancelled) only counts against the
//! minute it was made in.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::clock::{Clock, SystemClock};

const MINUTE: Duration = Duration::from_secs(60);

/// Rate limiter errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Estimated cost {cost} exceeds the per-minute limit of {limit} tokens")]
    CostExceedsLimit { cost: u64, limit: u64 },
}

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub tokens_per_minute_limit: u64,
    pub min_delay_seconds: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_minute_limit: 40_000,
            min_delay_seconds: 0.5,
        }
    }
}

impl RateLimitConfig {
    pub fn new(tokens_per_minute_limit: u64, min_delay_seconds: f64) -> Self {
        Self {
            tokens_per_minute_limit,
            min_delay_seconds,
        }
    }

    fn min_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.min_delay_seconds.max(0.0)).unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    /// Minute key -> tokens used in that minute
    windows: BTreeMap<i64, u64>,
    /// Caller id -> last recorded call
    pacing: HashMap<String, DateTime<Utc>>,
    /// Caller id -> in-flight reservations, oldest first
    reservations: HashMap<String, VecDeque<Reservation>>,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    minute: i64,
    cost: u64,
}

impl LimiterState {
    fn prune(&mut self, current_minute: i64) {
        self.windows.retain(|minute, _| *minute >= current_minute - 1);
        self.reservations.retain(|_, queue| {
            queue.retain(|r| r.minute >= current_minute);
            !queue.is_empty()
        });
    }

    fn reserved_in(&self, minute: i64) -> u64 {
        self.reservations
            .values()
            .flatten()
            .filter(|r| r.minute == minute)
            .map(|r| r.cost)
            .sum()
    }
}

/// Rate limiter shared by every session of an orchestrator.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

fn minute_key(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(60)
}

fn until_next_minute(now: DateTime<Utc>) -> Duration {
    let into_minute = Duration::new(
        now.timestamp().rem_euclid(60) as u64,
        now.timestamp_subsec_nanos().min(999_999_999),
    );
    MINUTE.saturating_sub(into_minute).max(Duration::from_millis(1))
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Whether `caller` may spend `cost` tokens right now.
    pub fn can_proceed(&self, caller: &str, cost: u64) -> bool {
        self.wait_time(caller, cost).is_zero()
    }

    /// How long `caller` must wait before spending `cost` tokens.
    ///
    /// In-flight reservations count as spent.
    pub fn wait_time(&self, caller: &str, cost: u64) -> Duration {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.wait_locked(&mut state, now, caller, cost)
    }

    fn wait_locked(&self, state: &mut LimiterState, now: DateTime<Utc>, caller: &str, cost: u64) -> Duration {
        let current = minute_key(now);
        state.prune(current);

        let used = state.windows.get(&current).copied().unwrap_or(0) + state.reserved_in(current);
        let window_wait = if used.saturating_add(cost) > self.config.tokens_per_minute_limit {
            until_next_minute(now)
        } else {
            Duration::ZERO
        };

        let pacing_wait = match state.pacing.get(caller) {
            Some(last) => {
                let elapsed = (now - *last).to_std().unwrap_or(Duration::ZERO);
                self.config.min_delay().saturating_sub(elapsed)
            }
            None => Duration::ZERO,
        };

        window_wait.max(pacing_wait)
    }

    /// Reserve `cost` for `caller` if it may proceed now, otherwise return
    /// the wait.
    fn try_reserve(&self, caller: &str, cost: u64) -> Duration {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let wait = self.wait_locked(&mut state, now, caller, cost);
        if wait.is_zero() {
            state.reservations.entry(caller.to_string()).or_default().push_back(Reservation {
                minute: minute_key(now),
                cost,
            });
        }
        wait
    }

    /// Record a finished call.
    ///
    /// Call only after the external call has succeeded or failed definitively.
    /// Replaces the caller's oldest reservation with the actual cost.
    pub fn record_usage(&self, caller: &str, cost: u64) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let current = minute_key(now);
        state.prune(current);
        if let Some(queue) = state.reservations.get_mut(caller) {
            queue.pop_front();
            if queue.is_empty() {
                state.reservations.remove(caller);
            }
        }
        *state.windows.entry(current).or_insert(0) += cost;
        state.pacing.insert(caller.to_string(), now);
        debug!("Recorded {} tokens for {}", cost, caller);
    }

    /// Tokens recorded in the current minute.
    pub fn current_usage(&self) -> u64 {
        let current = minute_key(self.clock.now());
        self.state.lock().windows.get(&current).copied().unwrap_or(0)
    }

    /// Tokens reserved by calls that have not been recorded yet.
    pub fn reserved(&self) -> u64 {
        let current = minute_key(self.clock.now());
        let mut state = self.state.lock();
        state.prune(current);
        state.reserved_in(current)
    }

    /// Number of minute buckets still retained.
    pub fn window_count(&self) -> usize {
        let current = minute_key(self.clock.now());
        let mut state = self.state.lock();
        state.prune(current);
        state.windows.len()
    }

    /// Wait until `caller` may spend `cost` tokens, then reserve them.
    ///
    /// Follow with `record_usage` once the call is done. Returns the total
    /// time waited. A cost larger than the whole limit can
    /// never proceed and is rejected.
    pub async fn acquire(&self, caller: &str, cost: u64) -> Result<Duration, RateLimitError> {
        if cost > self.config.tokens_per_minute_limit {
            return Err(RateLimitError::CostExceedsLimit {
                cost,
                limit: self.config.tokens_per_minute_limit,
            });
        }

        let mut waited = Duration::ZERO;
        loop {
            let wait = self.try_reserve(caller, cost);
            if wait.is_zero() {
                return Ok(waited);
            }
            debug!("Rate limit: {} waits {:?} for {} tokens", caller, wait, cost);
            self.clock.sleep(wait).await;
            waited += wait;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(limit: u64, delay: f64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = ManualClock::at_minute_start().shared();
        let limiter = RateLimiter::with_clock(RateLimitConfig::new(limit, delay), clock.clone());
        (limiter, clock)
    }

    #[test]
    fn test_aggregate_window() {
        let (limiter, _clock) = limiter(1000, 0.0);
        assert!(limiter.can_proceed("a", 1000));
        assert!(!limiter.can_proceed("a", 1001));

        limiter.record_usage("a", 600);
        assert!(limiter.can_proceed("b", 400));
        assert!(!limiter.can_proceed("b", 401));
    }

    #[test]
    fn test_full_usage_blocks_next_call() {
        let (limiter, _clock) = limiter(500, 0.0);
        limiter.record_usage("caller", 500);
        assert!(!limiter.can_proceed("caller", 1));
        assert!(limiter.wait_time("caller", 1) > Duration::ZERO);
    }

    #[test]
    fn test_pacing() {
        let (limiter, clock) = limiter(10_000, 2.0);
        limiter.record_usage("structure", 10);

        assert!(!limiter.can_proceed("structure", 10));
        assert_eq!(limiter.wait_time("structure", 10), Duration::from_secs(2));
        assert!(limiter.can_proceed("surface", 10));

        clock.advance(Duration::from_millis(1500));
        assert_eq!(limiter.wait_time("structure", 10), Duration::from_millis(500));

        clock.advance(Duration::from_millis(500));
        assert!(limiter.can_proceed("structure", 10));
    }

    #[test]
    fn test_wait_time_consistent_with_can_proceed() {
        let (limiter, clock) = limiter(1000, 1.5);
        let callers = ["concept", "structure", "surface"];
        for step in 0..40u64 {
            let caller = callers[(step % 3) as usize];
            let cost = (step * 137) % 700;
            let wait = limiter.wait_time(caller, cost);
            assert_eq!(limiter.can_proceed(caller, cost), wait.is_zero());
            if step % 2 == 0 {
                limiter.record_usage(caller, cost / 2);
            }
            clock.advance(Duration::from_millis(700));
        }
    }

    #[test]
    fn test_windows_pruned_after_two_minutes() {
        let (limiter, clock) = limiter(1000, 0.0);
        limiter.record_usage("a", 900);
        clock.advance(Duration::from_secs(60));
        limiter.record_usage("a", 10);
        assert_eq!(limiter.window_count(), 2);

        clock.advance(Duration::from_secs(120));
        assert_eq!(limiter.window_count(), 0);
        assert_eq!(limiter.current_usage(), 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_next_minute() {
        let (limiter, clock) = limiter(1000, 0.0);
        clock.advance(Duration::from_secs(45));
        limiter.record_usage("a", 800);

        let waited = limiter.acquire("a", 400).await.unwrap();
        assert_eq!(waited, Duration::from_secs(15));
        assert_eq!(limiter.reserved(), 400);
        assert!(limiter.can_proceed("a", 600));
        assert!(!limiter.can_proceed("a", 601));
    }

    #[tokio::test]
    async fn test_concurrent_acquirers_stay_within_limit() {
        let (limiter, _clock) = limiter(1000, 0.0);
        let limiter = Arc::new(limiter);

        let mut handles = Vec::new();
        for caller in ["surface", "light_camera", "motion"] {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let waited = limiter.acquire(caller, 400).await.unwrap();
                tokio::task::yield_now().await;
                limiter.record_usage(caller, 400);
                waited
            }));
        }

        let mut waits = Vec::new();
        for handle in handles {
            waits.push(handle.await.unwrap());
        }
        waits.sort();

        assert_eq!(&waits[..2], &[Duration::ZERO, Duration::ZERO]);
        assert!(waits[2] >= Duration::from_secs(60));
        assert_eq!(limiter.reserved(), 0);
        assert!(limiter.current_usage() <= 1000);
    }

    #[test]
    fn test_record_replaces_reservation() {
        let (limiter, _clock) = limiter(1000, 0.0);
        assert!(limiter.try_reserve("concept", 700).is_zero());
        assert!(!limiter.can_proceed("structure", 400));

        limiter.record_usage("concept", 250);
        assert_eq!(limiter.reserved(), 0);
        assert_eq!(limiter.current_usage(), 250);
        assert!(limiter.can_proceed("structure", 750));
    }

    #[test]
    fn test_unrecorded_reservation_expires_with_its_minute() {
        let (limiter, clock) = limiter(1000, 0.0);
        assert!(limiter.try_reserve("motion", 900).is_zero());
        assert!(!limiter.can_proceed("motion", 200));

        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.reserved(), 0);
        assert!(limiter.can_proceed("motion", 1000));
    }

    #[tokio::test]
    async fn test_acquire_rejects_oversized_cost() {
        let (limiter, _clock) = limiter(100, 0.0);
        let err = limiter.acquire("a", 101).await.unwrap_err();
        assert_eq!(err, RateLimitError::CostExceedsLimit { cost: 101, limit: 100 });
    }
}

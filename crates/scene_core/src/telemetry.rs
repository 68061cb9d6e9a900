//! Telemetry handle passed into components.
//!
//! Carries a parent tracing span and a set of counters. There is no global
//! instance; the orchestrator creates one and hands clones down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Span;

#[derive(Debug, Default)]
struct Counters {
    sessions_started: AtomicU64,
    sessions_failed: AtomicU64,
    generation_calls: AtomicU64,
    retries: AtomicU64,
    substitutions: AtomicU64,
    timeouts: AtomicU64,
    dropped_notifications: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub sessions_started: u64,
    pub sessions_failed: u64,
    pub generation_calls: u64,
    pub retries: u64,
    pub substitutions: u64,
    pub timeouts: u64,
    pub dropped_notifications: u64,
}

/// Cloneable telemetry handle.
#[derive(Debug, Clone)]
pub struct Telemetry {
    span: Span,
    counters: Arc<Counters>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::disabled()
    }
}

impl Telemetry {
    /// Handle with an `orchestrator` span named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            span: tracing::info_span!("orchestrator", name = %name),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Handle with counters but no span.
    pub fn disabled() -> Self {
        Self {
            span: Span::none(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn session_started(&self) {
        self.counters.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.counters.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation_call(&self) {
        self.counters.generation_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry(&self) {
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn substitution(&self) {
        self.counters.substitutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_notification(&self) {
        self.counters.dropped_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let c = &self.counters;
        TelemetrySnapshot {
            sessions_started: c.sessions_started.load(Ordering::Relaxed),
            sessions_failed: c.sessions_failed.load(Ordering::Relaxed),
            generation_calls: c.generation_calls.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            substitutions: c.substitutions.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            dropped_notifications: c.dropped_notifications.load(Ordering::Relaxed),
        }
    }
}

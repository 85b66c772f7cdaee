//! Gateway counters
//!
//! Owned by the server instance and shared by `Arc`; there is no global
//! registry.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use netdiag_tools::Outcome;

#[derive(Debug, Default)]
pub struct Metrics {
    sessions_opened: AtomicU64,
    sessions_active: AtomicU64,
    invocations_started: AtomicU64,
    invocations_completed: AtomicU64,
    invocations_failed: AtomicU64,
    invocations_timed_out: AtomicU64,
    invocations_cancelled: AtomicU64,
    validation_rejections: AtomicU64,
    concurrency_rejections: AtomicU64,
    rate_limited_requests: AtomicU64,
}

/// Point-in-time copy served by `GET /api/v1/metrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_active: u64,
    pub invocations_started: u64,
    pub invocations_completed: u64,
    pub invocations_failed: u64,
    pub invocations_timed_out: u64,
    pub invocations_cancelled: u64,
    pub validation_rejections: u64,
    pub concurrency_rejections: u64,
    pub rate_limited_requests: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        // Saturate rather than wrap if a close is ever double-counted.
        let _ = self
            .sessions_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn invocation_started(&self) {
        self.invocations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invocation_finished(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Succeeded => &self.invocations_completed,
            Outcome::Failed => &self.invocations_failed,
            Outcome::TimedOut => &self.invocations_timed_out,
            Outcome::Cancelled => &self.invocations_cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn validation_rejected(&self) {
        self.validation_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn concurrency_rejected(&self) {
        self.concurrency_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited(&self) {
        self.rate_limited_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            sessions_opened: load(&self.sessions_opened),
            sessions_active: load(&self.sessions_active),
            invocations_started: load(&self.invocations_started),
            invocations_completed: load(&self.invocations_completed),
            invocations_failed: load(&self.invocations_failed),
            invocations_timed_out: load(&self.invocations_timed_out),
            invocations_cancelled: load(&self.invocations_cancelled),
            validation_rejections: load(&self.validation_rejections),
            concurrency_rejections: load(&self.concurrency_rejections),
            rate_limited_requests: load(&self.rate_limited_requests),
        }
    }
}

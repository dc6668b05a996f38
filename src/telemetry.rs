//! Fire-and-forget counters.
//!
//! Counters are kept in process so the status endpoint and tests can read
//! them, and mirrored to the `metrics` facade when that feature is enabled.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::counter!(name).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
fn metric_gauge(name: &'static str, value: i64) {
    metrics::gauge!(name).set(value as f64);
}

#[cfg(not(feature = "metrics"))]
fn metric_gauge(_name: &'static str, _value: i64) {}

#[derive(Debug, Default)]
pub struct Telemetry {
    awaiting: AtomicI64,
    requests_scheduled: AtomicU64,
    requests_cancelled: AtomicU64,
    callbacks_succeeded: AtomicU64,
    callbacks_failed: AtomicU64,
    callbacks_retried: AtomicU64,
    overloads: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub awaiting: i64,
    pub requests_scheduled: u64,
    pub requests_cancelled: u64,
    pub callbacks_succeeded: u64,
    pub callbacks_failed: u64,
    pub callbacks_retried: u64,
    pub overloads: u64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn awaiting_added(&self, count: i64) {
        let now = self.awaiting.fetch_add(count, Ordering::Relaxed) + count;
        metric_gauge("callback.awaiting", now);
    }

    pub fn awaiting_removed(&self) {
        let now = self.awaiting.fetch_sub(1, Ordering::Relaxed) - 1;
        metric_gauge("callback.awaiting", now);
    }

    pub fn set_awaiting(&self, count: i64) {
        self.awaiting.store(count, Ordering::Relaxed);
        metric_gauge("callback.awaiting", count);
    }

    pub fn awaiting(&self) -> i64 {
        self.awaiting.load(Ordering::Relaxed)
    }

    pub fn request_scheduled(&self) {
        self.requests_scheduled.fetch_add(1, Ordering::Relaxed);
        metric_inc("callback.request.scheduled");
    }

    pub fn request_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
        metric_inc("callback.request.cancelled");
    }

    pub fn callback_succeeded(&self) {
        self.callbacks_succeeded.fetch_add(1, Ordering::Relaxed);
        metric_inc("callback.delivery.success");
    }

    pub fn callback_failed(&self) {
        self.callbacks_failed.fetch_add(1, Ordering::Relaxed);
        metric_inc("callback.delivery.failed");
    }

    pub fn callback_retried(&self) {
        self.callbacks_retried.fetch_add(1, Ordering::Relaxed);
        metric_inc("callback.delivery.retry_scheduled");
    }

    pub fn overloaded(&self) {
        self.overloads.fetch_add(1, Ordering::Relaxed);
        metric_inc("callback.dispatch.overload");
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            awaiting: self.awaiting.load(Ordering::Relaxed),
            requests_scheduled: self.requests_scheduled.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            callbacks_succeeded: self.callbacks_succeeded.load(Ordering::Relaxed),
            callbacks_failed: self.callbacks_failed.load(Ordering::Relaxed),
            callbacks_retried: self.callbacks_retried.load(Ordering::Relaxed),
            overloads: self.overloads.load(Ordering::Relaxed),
        }
    }
}

//! Per-destination retry backoff.
//!
//! Failures are grouped by URL authority (`host:port`), so one failing
//! service slows down without penalising others. Each authority keeps a
//! consecutive-failure count that expires a fixed window after its most
//! recent failure.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use url::Url;

/// Quiet period after which a destination's failures are forgotten.
pub const DEFAULT_FORGIVENESS_WINDOW: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone, Copy)]
struct FailureEntry {
    ordinal: usize,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RetryHeuristics {
    intervals: Vec<Duration>,
    window: Duration,
    failures: Mutex<HashMap<String, FailureEntry>>,
}

impl RetryHeuristics {
    /// `intervals` is the ascending list of delays; an empty list means
    /// immediate retries.
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self::with_window(intervals, DEFAULT_FORGIVENESS_WINDOW)
    }

    pub fn with_window(intervals: Vec<Duration>, window: Duration) -> Self {
        Self {
            intervals,
            window,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }

    /// Record a retryable failure and return the delay before the next try.
    pub fn on_retryable_failure(&self, url: &Url) -> Duration {
        self.on_retryable_failure_at(url, Utc::now())
    }

    pub fn on_retryable_failure_at(&self, url: &Url, now: DateTime<Utc>) -> Duration {
        let key = authority(url);
        let expires_at = now + chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::hours(6));

        let ordinal = {
            let mut failures = self.failures.lock();
            failures.retain(|_, entry| entry.expires_at > now);
            let entry = failures
                .entry(key)
                .and_modify(|e| e.ordinal = e.ordinal.saturating_add(1))
                .or_insert(FailureEntry { ordinal: 0, expires_at });
            entry.expires_at = expires_at;
            entry.ordinal
        };

        self.interval_for(ordinal)
    }

    /// Forget the destination's failures.
    pub fn on_success(&self, url: &Url) {
        self.failures.lock().remove(&authority(url));
    }

    /// Consecutive failures currently recorded for the destination.
    pub fn failure_count(&self, url: &Url) -> usize {
        self.failures
            .lock()
            .get(&authority(url))
            .map_or(0, |e| e.ordinal + 1)
    }

    fn interval_for(&self, ordinal: usize) -> Duration {
        self.intervals
            .get(ordinal)
            .or_else(|| self.intervals.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// `host:port` with the scheme's default port filled in.
pub fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn heuristics() -> RetryHeuristics {
        RetryHeuristics::new(vec![
            Duration::from_secs(10),
            Duration::from_secs(60),
            Duration::from_secs(600),
        ])
    }

    #[test]
    fn delays_escalate_then_clamp() {
        let h = heuristics();
        let target = url("http://svc.test/a");
        let delays: Vec<u64> = (0..5).map(|_| h.on_retryable_failure(&target).as_secs()).collect();
        assert_eq!(delays, vec![10, 60, 600, 600, 600]);
    }

    #[test]
    fn grouping_is_by_authority_not_path() {
        let h = heuristics();
        h.on_retryable_failure(&url("http://svc.test/a"));
        assert_eq!(h.on_retryable_failure(&url("http://svc.test:80/b?q=1")).as_secs(), 60);
        assert_eq!(h.on_retryable_failure(&url("http://other.test/a")).as_secs(), 10);
        assert_eq!(h.on_retryable_failure(&url("https://svc.test/a")).as_secs(), 10);
    }

    #[test]
    fn success_resets_the_destination() {
        let h = heuristics();
        let target = url("http://svc.test/a");
        h.on_retryable_failure(&target);
        h.on_retryable_failure(&target);
        assert_eq!(h.failure_count(&target), 2);

        h.on_success(&target);
        assert_eq!(h.failure_count(&target), 0);
        assert_eq!(h.on_retryable_failure(&target).as_secs(), 10);
    }

    #[test]
    fn quiet_period_forgives_failures() {
        let h = RetryHeuristics::with_window(
            vec![Duration::from_secs(1), Duration::from_secs(2)],
            Duration::from_secs(60),
        );
        let target = url("http://svc.test/a");
        let start = Utc::now();
        assert_eq!(h.on_retryable_failure_at(&target, start).as_secs(), 1);
        assert_eq!(
            h.on_retryable_failure_at(&target, start + chrono::Duration::seconds(30)).as_secs(),
            2
        );
        // window slides from the most recent failure
        assert_eq!(
            h.on_retryable_failure_at(&target, start + chrono::Duration::seconds(80)).as_secs(),
            2
        );
        assert_eq!(
            h.on_retryable_failure_at(&target, start + chrono::Duration::seconds(200)).as_secs(),
            1
        );
    }

    #[test]
    fn empty_interval_list_retries_immediately() {
        let h = RetryHeuristics::new(Vec::new());
        assert_eq!(h.on_retryable_failure(&url("http://svc.test/")), Duration::ZERO);
    }

    #[test]
    fn authority_fills_default_ports() {
        assert_eq!(authority(&url("https://Svc.Test/x")), "svc.test:443");
        assert_eq!(authority(&url("http://svc.test:8080/x")), "svc.test:8080");
    }
}

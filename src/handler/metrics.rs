//! Per-handler dispatch statistics.

use super::Outcome;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters updated by every dispatched message. Read-only diagnostics.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    messages: AtomicU64,
    bytes: AtomicU64,
    latency_total_ns: AtomicU64,
    latency_max_ns: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    unhandled: AtomicU64,
    closed: AtomicU64,
}

impl HandlerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one dispatched message: its outcome, payload size and processing latency.
    #[inline]
    pub fn record(&self, outcome: Outcome, bytes: usize, latency: Duration) {
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.latency_total_ns.fetch_add(ns, Ordering::Relaxed);
        self.latency_max_ns.fetch_max(ns, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Success => &self.succeeded,
            Outcome::Fail => &self.failed,
            Outcome::Unhandled => &self.unhandled,
            Outcome::Closed => &self.closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            latency_total: Duration::from_nanos(self.latency_total_ns.load(Ordering::Relaxed)),
            latency_max: Duration::from_nanos(self.latency_max_ns.load(Ordering::Relaxed)),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.messages,
            &self.bytes,
            &self.latency_total_ns,
            &self.latency_max_ns,
            &self.succeeded,
            &self.failed,
            &self.unhandled,
            &self.closed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages: u64,
    pub bytes: u64,
    pub latency_total: Duration,
    pub latency_max: Duration,
    pub succeeded: u64,
    pub failed: u64,
    pub unhandled: u64,
    pub closed: u64,
}

impl MetricsSnapshot {
    pub fn mean_latency(&self) -> Duration {
        if self.messages == 0 {
            Duration::ZERO
        } else {
            let mean = self.latency_total.as_nanos() / u128::from(self.messages);
            Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_resets() {
        let metrics = HandlerMetrics::new();
        metrics.record(Outcome::Success, 3, Duration::from_micros(10));
        metrics.record(Outcome::Closed, 2, Duration::from_micros(30));
        metrics.record(Outcome::Unhandled, 1, Duration::from_micros(20));

        let snap = metrics.snapshot();
        assert_eq!(snap.messages, 3);
        assert_eq!(snap.bytes, 6);
        assert_eq!(snap.latency_max, Duration::from_micros(30));
        assert_eq!(snap.mean_latency(), Duration::from_micros(20));
        assert_eq!((snap.succeeded, snap.failed, snap.unhandled, snap.closed), (1, 0, 1, 1));

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert_eq!(MetricsSnapshot::default().mean_latency(), Duration::ZERO);
    }
}

//! Operational surface — §6.6. Non-core hooks only: a counter/histogram
//! sink and a readiness probe. Neither is wired to any particular metrics
//! backend or HTTP framework; callers inject an implementation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `on_event(name, labels, value)` — a counter increment or a histogram
/// observation, the sink's choice which. `tracing` carries structured logs;
/// this is strictly for numeric time series.
pub trait MetricsSink: Send + Sync {
    fn on_event(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

/// Discards everything. Used where the caller hasn't wired a real sink.
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn on_event(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
}

/// Emits each event as a `tracing` event at `debug` level — useful in
/// development or when the operator's log pipeline already aggregates
/// structured fields into a metrics backend.
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn on_event(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        tracing::debug!(target: "des_store::metrics", metric = name, value, ?labels);
    }
}

fn now_unix_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// `ready() -> bool` computed from the last-successful timestamp of three
/// checks the packer performs anyway in its normal operation: lease renewal,
/// a DB ping, and an object-store HEAD. A probe is ready only if all three
/// have succeeded within `max_staleness`.
pub struct ReadinessProbe {
    last_lease_renew_ms: AtomicI64,
    last_db_ping_ms: AtomicI64,
    last_object_store_head_ms: AtomicI64,
    max_staleness: Duration,
}

impl ReadinessProbe {
    pub fn new(max_staleness: Duration) -> Arc<Self> {
        Arc::new(Self {
            last_lease_renew_ms: AtomicI64::new(0),
            last_db_ping_ms: AtomicI64::new(0),
            last_object_store_head_ms: AtomicI64::new(0),
            max_staleness,
        })
    }

    pub fn record_lease_renew(&self) {
        self.last_lease_renew_ms.store(now_unix_ms(), Ordering::Relaxed);
    }

    pub fn record_db_ping(&self) {
        self.last_db_ping_ms.store(now_unix_ms(), Ordering::Relaxed);
    }

    pub fn record_object_store_head(&self) {
        self.last_object_store_head_ms.store(now_unix_ms(), Ordering::Relaxed);
    }

    pub fn ready(&self) -> bool {
        let cutoff = now_unix_ms() - self.max_staleness.as_millis() as i64;
        [
            self.last_lease_renew_ms.load(Ordering::Relaxed),
            self.last_db_ping_ms.load(Ordering::Relaxed),
            self.last_object_store_head_ms.load(Ordering::Relaxed),
        ]
        .into_iter()
        .all(|ts| ts >= cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_until_all_three_checks_recorded() {
        let probe = ReadinessProbe::new(Duration::from_secs(60));
        assert!(!probe.ready());
        probe.record_lease_renew();
        probe.record_db_ping();
        assert!(!probe.ready());
        probe.record_object_store_head();
        assert!(probe.ready());
    }

    #[test]
    fn becomes_not_ready_once_stale() {
        let probe = ReadinessProbe::new(Duration::from_millis(0));
        probe.record_lease_renew();
        probe.record_db_ping();
        probe.record_object_store_head();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!probe.ready());
    }
}

use ahash::AHashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{OnceLock, PoisonError, RwLock};

/// Metric names recorded by the engine.
pub mod names {
    /// Labels: `outcome` = accepted | duplicate | rejected | processed | failed | ignored.
    pub const WEBHOOK_EVENTS_TOTAL: &str = "webhook_events_total";
    /// Labels: `resource`, `outcome` = ok | not_found | auth | rate_limited | transient | client | decode.
    pub const CHANNEL_REQUESTS_TOTAL: &str = "channel_requests_total";
    pub const CHANNEL_REQUEST_DURATION: &str = "channel_request_duration_seconds";
    /// Labels: `outcome` = created | updated | unchanged | failed | ignored | cancelled | skipped_as_unverified.
    pub const RECONCILE_RECORDS_TOTAL: &str = "reconcile_records_total";
    pub const RECONCILE_RUNS_TOTAL: &str = "reconcile_runs_total";
    pub const WEBHOOK_QUEUE_DEPTH: &str = "webhook_queue_depth";
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION: &str = "http_request_duration_seconds";
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_bits: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // f64 sum kept as bits for a lock-free add.
        let mut current = self.sum_bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self.sum_bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if let Some(i) = self.buckets.iter().position(|b| value <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Seconds; channel calls routinely take a few hundred milliseconds.
fn default_duration_buckets() -> Vec<f64> {
    vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted `key=value` pairs distinguishing series of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort();
        Self(v)
    }

    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Run `f` on the series under `key`, creating it with `init` on first use.
/// Existing series only ever take the read lock.
fn with_series<K: Eq + Hash, V>(
    lock: &RwLock<AHashMap<K, V>>,
    key: K,
    init: impl FnOnce() -> V,
    f: impl FnOnce(&V),
) {
    {
        let map = lock.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(series) = map.get(&key) {
            f(series);
            return;
        }
    }
    let mut map = lock.write().unwrap_or_else(PoisonError::into_inner);
    f(map.entry(key).or_insert_with(init));
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<(String, Labels), Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        if amount == 0 {
            return;
        }
        with_series(
            &self.counters,
            (name.to_string(), Labels::new(labels)),
            AtomicU64::default,
            |c| {
                c.fetch_add(amount, Ordering::Relaxed);
            },
        );
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&key).map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        with_series(&self.gauges, name.to_string(), AtomicI64::default, |g| {
            g.store(value, Ordering::Relaxed)
        });
    }

    /// Observe a value; unknown series get the default duration buckets.
    pub fn record_histogram_with(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_series(
            &self.histograms,
            (name.to_string(), Labels::new(labels)),
            || Histogram::new(default_duration_buckets()),
            |h| h.observe(value),
        );
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            let mut series: Vec<(&String, &Labels, u64)> = map
                .iter()
                .map(|((name, labels), v)| (name, labels, v.load(Ordering::Relaxed)))
                .collect();
            series.sort_by(|a, b| (a.0, &a.1 .0).cmp(&(b.0, &b.1 .0)));
            let mut last: Option<&String> = None;
            for (name, labels, value) in series {
                if last != Some(name) {
                    out.push_str(&format!("# TYPE {} counter\n", name));
                    last = Some(name);
                }
                out.push_str(&format!("{}{} {}\n", name, labels.prometheus_str(), value));
            }
        }

        {
            let map = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let val = map[name].load(Ordering::Relaxed);
                out.push_str(&format!("# TYPE {} gauge\n{} {}\n", name, name, val));
            }
        }

        {
            let map = self.histograms.read().unwrap_or_else(PoisonError::into_inner);
            let mut keys: Vec<&(String, Labels)> = map.keys().collect();
            keys.sort_by(|a, b| (&a.0, &a.1 .0).cmp(&(&b.0, &b.1 .0)));
            let mut last: Option<&String> = None;
            for key in keys {
                let (name, labels) = key;
                let h = &map[key];
                if last != Some(name) {
                    out.push_str(&format!("# TYPE {} histogram\n", name));
                    last = Some(name);
                }
                let mut cumulative = 0u64;
                for (i, boundary) in h.buckets.iter().enumerate() {
                    cumulative += h.counts[i].load(Ordering::Relaxed);
                    let le = boundary.to_string();
                    let mut pairs: Vec<(&str, &str)> =
                        labels.0.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                    pairs.push(("le", &le));
                    out.push_str(&format!(
                        "{}_bucket{} {}\n",
                        name,
                        Labels::new(&pairs).prometheus_str(),
                        cumulative
                    ));
                }
                let mut pairs: Vec<(&str, &str)> =
                    labels.0.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                pairs.push(("le", "+Inf"));
                out.push_str(&format!(
                    "{}_bucket{} {}\n",
                    name,
                    Labels::new(&pairs).prometheus_str(),
                    h.count()
                ));
                out.push_str(&format!("{}_sum{} {}\n", name, labels.prometheus_str(), h.sum()));
                out.push_str(&format!(
                    "{}_count{} {}\n",
                    name,
                    labels.prometheus_str(),
                    h.count()
                ));
            }
        }

        out
    }
}

// ---------------------------------------------------------------------------
// Global singleton and recording helpers
// ---------------------------------------------------------------------------

pub fn global_metrics() -> &'static MetricsCollector {
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::new)
}

pub fn record_channel_request(resource: &str, outcome: &str, seconds: f64) {
    let m = global_metrics();
    m.increment_counter(
        names::CHANNEL_REQUESTS_TOTAL,
        &[("resource", resource), ("outcome", outcome)],
    );
    m.record_histogram_with(names::CHANNEL_REQUEST_DURATION, &[("resource", resource)], seconds);
}

pub fn record_webhook_event(outcome: &str) {
    global_metrics().increment_counter(names::WEBHOOK_EVENTS_TOTAL, &[("outcome", outcome)]);
}

pub fn record_reconcile_records(outcome: &str, count: u64) {
    global_metrics().increment_counter_by(
        names::RECONCILE_RECORDS_TOTAL,
        &[("outcome", outcome)],
        count,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_keyed_by_labels() {
        let m = MetricsCollector::new();
        m.increment_counter("webhook_events_total", &[("outcome", "accepted")]);
        m.increment_counter("webhook_events_total", &[("outcome", "accepted")]);
        m.increment_counter("webhook_events_total", &[("outcome", "duplicate")]);
        assert_eq!(
            m.get_counter("webhook_events_total", &[("outcome", "accepted")]),
            2
        );
        assert_eq!(
            m.get_counter("webhook_events_total", &[("outcome", "duplicate")]),
            1
        );
        assert_eq!(m.get_counter("webhook_events_total", &[("outcome", "x")]), 0);
    }

    #[test]
    fn label_order_does_not_matter() {
        let m = MetricsCollector::new();
        m.increment_counter("c", &[("a", "1"), ("b", "2")]);
        m.increment_counter("c", &[("b", "2"), ("a", "1")]);
        assert_eq!(m.get_counter("c", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn zero_increment_creates_no_series() {
        let m = MetricsCollector::new();
        m.increment_counter_by("reconcile_records_total", &[("outcome", "failed")], 0);
        assert!(!m.export_prometheus().contains("reconcile_records_total"));
    }

    #[test]
    fn histogram_buckets_are_cumulative_in_export() {
        let m = MetricsCollector::new();
        m.record_histogram_with("d", &[("resource", "reservations")], 0.02);
        m.record_histogram_with("d", &[("resource", "reservations")], 0.3);
        let text = m.export_prometheus();
        assert!(text.contains("# TYPE d histogram"));
        assert!(text.contains("d_bucket{le=\"0.05\",resource=\"reservations\"} 1"));
        assert!(text.contains("d_bucket{le=\"0.5\",resource=\"reservations\"} 2"));
        assert!(text.contains("d_count{resource=\"reservations\"} 2"));
    }

    #[test]
    fn gauge_set_and_export() {
        let m = MetricsCollector::new();
        m.set_gauge("webhook_queue_depth", 3);
        m.set_gauge("webhook_queue_depth", 1);
        let text = m.export_prometheus();
        assert!(text.contains("webhook_queue_depth 1"));
        assert!(!text.contains("webhook_queue_depth 3"));
    }

    #[test]
    fn label_values_are_escaped() {
        let labels = Labels::new(&[("path", "a\"b")]);
        assert_eq!(labels.prometheus_str(), "{path=\"a\\\"b\"}");
    }
}

//! # Metrics Pipeline
//!
//! Two cooperating latency collectors behind one recording API:
//!
//! - [`StreamingPercentile`]: bounded ring of recent samples, sorted lazily on query.
//! - [`HistogramBucket`]: fixed linear buckets with under/overflow counters.
//!
//! [`MetricsPipeline`] serialises every recording call through a single mutex so
//! drivers that deliver results from background threads can record directly.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{Clock, MonotonicClock};
use crate::reading::ClientId;

/// Default number of recent latency samples kept for percentile queries.
pub const DEFAULT_WINDOW: usize = 100_000;
/// Per-client sample window used for the client breakdown.
pub const CLIENT_WINDOW: usize = 10_000;

// ─── Streaming Percentile ───────────────────────────────────────────────────

/// Order-statistic estimator over the most recent `capacity` samples.
#[derive(Debug, Clone)]
pub struct StreamingPercentile {
    window: VecDeque<f64>,
    capacity: usize,
    sorted: Option<Vec<f64>>,
}

impl StreamingPercentile {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            sorted: None,
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.sorted = None;
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Value at rank `floor(p/100 * N)`, clamped to the window. `None` when empty.
    pub fn percentile(&mut self, p: f64) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let window = &self.window;
        let sorted = self.sorted.get_or_insert_with(|| {
            let mut v: Vec<f64> = window.iter().copied().collect();
            v.sort_by(f64::total_cmp);
            v
        });
        let n = sorted.len();
        let idx = ((p / 100.0) * n as f64).floor().max(0.0) as usize;
        Some(sorted[idx.min(n - 1)])
    }

    pub fn percentiles(&mut self) -> Percentiles {
        Percentiles {
            p50: self.percentile(50.0).unwrap_or(0.0),
            p75: self.percentile(75.0).unwrap_or(0.0),
            p90: self.percentile(90.0).unwrap_or(0.0),
            p95: self.percentile(95.0).unwrap_or(0.0),
            p99: self.percentile(99.0).unwrap_or(0.0),
        }
    }

    /// Samples in arrival order.
    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.window.iter().copied()
    }
}

impl Default for StreamingPercentile {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Tail percentiles in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

// ─── Histogram ──────────────────────────────────────────────────────────────

/// Linear-bucket histogram over `[min, max)`.
#[derive(Debug, Clone)]
pub struct HistogramBucket {
    min: f64,
    max: f64,
    width: f64,
    buckets: Vec<u64>,
    underflow: u64,
    overflow: u64,
    count: u64,
    sum: f64,
}

/// Serializable view of a [`HistogramBucket`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub bucket_width: f64,
    pub underflow: u64,
    pub overflow: u64,
    pub buckets: Vec<u64>,
}

impl HistogramBucket {
    /// `num_buckets` is raised to 1 and an empty range widened to 1.0.
    pub fn new(min: f64, max: f64, num_buckets: usize) -> Self {
        let num_buckets = num_buckets.max(1);
        let max = if max > min { max } else { min + 1.0 };
        Self {
            min,
            max,
            width: (max - min) / num_buckets as f64,
            buckets: vec![0; num_buckets],
            underflow: 0,
            overflow: 0,
            count: 0,
            sum: 0.0,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if value < self.min {
            self.underflow += 1;
        } else if value >= self.max {
            self.overflow += 1;
        } else {
            let idx = ((value - self.min) / self.width) as usize;
            let last = self.buckets.len() - 1;
            self.buckets[idx.min(last)] += 1;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn bucket_width(&self) -> f64 {
        self.width
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Walks buckets in order and interpolates inside the one crossing rank
    /// `p/100 * count`. Underflow counts toward the rank; if the rank lands in
    /// the overflow, returns `max`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let target = (p / 100.0) * self.count as f64;
        let mut cumulative = self.underflow as f64;
        for (i, &n) in self.buckets.iter().enumerate() {
            cumulative += n as f64;
            if cumulative >= target {
                let start = self.min + i as f64 * self.width;
                if n == 0 {
                    return Some(start);
                }
                let fraction = (cumulative - target) / n as f64;
                return Some(start + self.width - fraction * self.width);
            }
        }
        Some(self.max)
    }

    pub fn stats(&self) -> HistogramStats {
        HistogramStats {
            count: self.count,
            sum: self.sum,
            mean: self.mean().unwrap_or(0.0),
            min: self.min,
            max: self.max,
            bucket_width: self.width,
            underflow: self.underflow,
            overflow: self.overflow,
            buckets: self.buckets.clone(),
        }
    }
}

impl Default for HistogramBucket {
    /// 0-1000 ms in 10 ms buckets.
    fn default() -> Self {
        Self::new(0.0, 1000.0, 100)
    }
}

// ─── Snapshot ───────────────────────────────────────────────────────────────

/// Latency statistics over the recorded samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub percentiles: Percentiles,
}

/// Per-client latency breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub client_id: ClientId,
    pub packet_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat_min_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat_max_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat_avg_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat_p50_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat_p95_ms: Option<f64>,
}

/// Cumulative counters plus derived statistics at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub duration_sec: f64,
    pub sent: u64,
    pub recv: u64,
    pub lost: u64,
    /// `1 - recv / max(sent, 1)`.
    pub loss: f64,
    pub throughput_msg_sec: f64,
    pub errors: u64,
    pub error_types: BTreeMap<String, u64>,
    /// `None` until at least one latency sample is recorded.
    pub latency: Option<LatencyStats>,
    pub histogram: HistogramStats,
}

impl MetricsSnapshot {
    pub fn loss_percent(&self) -> f64 {
        self.loss * 100.0
    }
}

/// Fraction of `sent` that never arrived.
pub fn loss_ratio(sent: u64, recv: u64) -> f64 {
    (1.0 - recv as f64 / sent.max(1) as f64).clamp(0.0, 1.0)
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ClientStats {
    window: StreamingPercentile,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl ClientStats {
    fn new() -> Self {
        Self {
            window: StreamingPercentile::new(CLIENT_WINDOW),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn add(&mut self, ms: f64) {
        self.window.add(ms);
        self.count += 1;
        self.sum += ms;
        self.min = self.min.min(ms);
        self.max = self.max.max(ms);
    }
}

#[derive(Debug)]
struct Collector {
    latencies: StreamingPercentile,
    histogram: HistogramBucket,
    sent: u64,
    recv: u64,
    lost: u64,
    latency_count: u64,
    latency_sum: f64,
    latency_min: f64,
    latency_max: f64,
    errors: Vec<String>,
    error_types: BTreeMap<String, u64>,
    clients: BTreeMap<ClientId, ClientStats>,
    ended: Option<Duration>,
}

/// Thread-safe recording front end for one run.
pub struct MetricsPipeline {
    clock: Arc<dyn Clock>,
    started: Duration,
    inner: Mutex<Collector>,
}

impl MetricsPipeline {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// Pipeline whose elapsed time is measured on `clock`, starting now.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_collectors(clock, DEFAULT_WINDOW, HistogramBucket::default())
    }

    pub fn with_collectors(
        clock: Arc<dyn Clock>,
        window: usize,
        histogram: HistogramBucket,
    ) -> Self {
        let started = clock.now();
        Self {
            clock,
            started,
            inner: Mutex::new(Collector {
                latencies: StreamingPercentile::new(window),
                histogram,
                sent: 0,
                recv: 0,
                lost: 0,
                latency_count: 0,
                latency_sum: 0.0,
                latency_min: f64::INFINITY,
                latency_max: f64::NEG_INFINITY,
                errors: Vec::new(),
                error_types: BTreeMap::new(),
                clients: BTreeMap::new(),
                ended: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Collector> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_send(&self) {
        self.lock().sent += 1;
    }

    /// Records `n` sends at once, for counts harvested after the fact.
    pub fn record_sends(&self, n: u64) {
        self.lock().sent += n;
    }

    pub fn record_recv(&self) {
        self.lock().recv += 1;
    }

    pub fn record_loss(&self, n: u64) {
        self.lock().lost += n;
    }

    /// Records one latency sample, optionally attributed to `client`.
    pub fn record_latency(&self, ms: f64, client: Option<&ClientId>) {
        if !ms.is_finite() {
            debug!(ms, "ignoring non-finite latency sample");
            return;
        }
        let mut c = self.lock();
        c.latencies.add(ms);
        c.histogram.add(ms);
        c.latency_count += 1;
        c.latency_sum += ms;
        c.latency_min = c.latency_min.min(ms);
        c.latency_max = c.latency_max.max(ms);
        if let Some(client) = client {
            c.clients
                .entry(client.clone())
                .or_insert_with(ClientStats::new)
                .add(ms);
        }
    }

    pub fn record_error(&self, kind: &str, message: &str) {
        let mut c = self.lock();
        c.errors.push(format!("{kind}: {message}"));
        *c.error_types.entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Freezes the end time used for duration-derived metrics. Later calls are no-ops.
    pub fn finalize(&self) {
        let now = self.clock.now();
        let mut c = self.lock();
        if c.ended.is_none() {
            c.ended = Some(now);
        }
    }

    pub fn sent(&self) -> u64 {
        self.lock().sent
    }

    pub fn recv(&self) -> u64 {
        self.lock().recv
    }

    pub fn elapsed(&self) -> Duration {
        let end = self.lock().ended;
        end.unwrap_or_else(|| self.clock.now()).saturating_sub(self.started)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let duration = self.elapsed().as_secs_f64();
        let mut c = self.lock();
        // Asynchronous receipts can outrun the send counter; never report more
        // deliveries than sends.
        let recv = c.recv.min(c.sent);
        let latency = (c.latency_count > 0).then(|| LatencyStats {
            samples: c.latency_count,
            avg_ms: c.latency_sum / c.latency_count as f64,
            min_ms: c.latency_min,
            max_ms: c.latency_max,
            percentiles: c.latencies.percentiles(),
        });
        MetricsSnapshot {
            duration_sec: duration,
            sent: c.sent,
            recv,
            lost: c.lost,
            loss: loss_ratio(c.sent, recv),
            throughput_msg_sec: if duration > 0.0 {
                recv as f64 / duration
            } else {
                0.0
            },
            errors: c.errors.len() as u64,
            error_types: c.error_types.clone(),
            latency,
            histogram: c.histogram.stats(),
        }
    }

    /// Per-client breakdown, ordered by client id.
    pub fn client_summaries(&self) -> Vec<ClientSummary> {
        let mut c = self.lock();
        c.clients
            .iter_mut()
            .map(|(id, stats)| ClientSummary {
                client_id: id.clone(),
                packet_count: stats.count,
                lat_min_ms: Some(stats.min),
                lat_max_ms: Some(stats.max),
                lat_avg_ms: Some(stats.sum / stats.count as f64),
                lat_p50_ms: stats.window.percentile(50.0),
                lat_p95_ms: stats.window.percentile(95.0),
            })
            .collect()
    }

    /// Retained latency samples in arrival order.
    pub fn latency_samples(&self) -> Vec<f64> {
        self.lock().latencies.samples().collect()
    }

    pub fn error_log(&self) -> Vec<String> {
        self.lock().errors.clone()
    }
}

impl Default for MetricsPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    #[test]
    fn ring_percentile_uses_floor_rank() {
        let mut sp = StreamingPercentile::new(100);
        for v in 1..=10 {
            sp.add(v as f64);
        }
        assert_eq!(sp.percentile(50.0), Some(6.0));
        assert_eq!(sp.percentile(0.0), Some(1.0));
        assert_eq!(sp.percentile(100.0), Some(10.0));
        assert_eq!(sp.percentile(99.0), Some(10.0));
    }

    #[test]
    fn ring_evicts_oldest() {
        let mut sp = StreamingPercentile::new(3);
        for v in [100.0, 1.0, 2.0, 3.0] {
            sp.add(v);
        }
        assert_eq!(sp.len(), 3);
        assert_eq!(sp.samples().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);
        assert_eq!(sp.percentile(99.0), Some(3.0));
    }

    #[test]
    fn empty_collectors_report_nothing() {
        let mut sp = StreamingPercentile::default();
        assert_eq!(sp.percentile(50.0), None);
        let h = HistogramBucket::default();
        assert_eq!(h.percentile(50.0), None);
        assert_eq!(h.mean(), None);
    }

    #[test]
    fn histogram_tracks_out_of_range() {
        let mut h = HistogramBucket::new(0.0, 100.0, 10);
        h.add(-5.0);
        h.add(5.0);
        h.add(100.0);
        h.add(250.0);
        let stats = h.stats();
        assert_eq!(stats.underflow, 1);
        assert_eq!(stats.overflow, 2);
        assert_eq!(stats.buckets[0], 1);
        assert_eq!(stats.count, 4);
        assert!((stats.mean - 87.5).abs() < 1e-9);
        assert_eq!(h.percentile(99.0), Some(100.0));
    }

    #[test]
    fn histogram_interpolates_inside_bucket() {
        let mut h = HistogramBucket::new(0.0, 100.0, 10);
        for _ in 0..4 {
            h.add(15.0);
        }
        // Rank 2 of 4 falls halfway through the 10-20 bucket.
        let p50 = h.percentile(50.0).unwrap();
        assert!((p50 - 15.0).abs() < 1e-9, "{p50}");
    }

    #[test]
    fn snapshot_counts_and_loss() {
        let clock = ManualClock::new();
        let m = MetricsPipeline::with_clock(Arc::new(clock.clone()));
        for _ in 0..4 {
            m.record_send();
        }
        m.record_recv();
        m.record_recv();
        m.record_latency(10.0, Some(&ClientId::indexed(0)));
        m.record_latency(30.0, Some(&ClientId::indexed(0)));
        m.record_error("send", "connection refused");
        clock.advance(Duration::from_secs(2));
        m.finalize();
        clock.advance(Duration::from_secs(10));

        let snap = m.snapshot();
        assert_eq!((snap.sent, snap.recv, snap.errors), (4, 2, 1));
        assert!((snap.loss - 0.5).abs() < 1e-9);
        assert!((snap.duration_sec - 2.0).abs() < 1e-9);
        assert!((snap.throughput_msg_sec - 1.0).abs() < 1e-9);
        assert_eq!(snap.error_types.get("send"), Some(&1));
        let lat = snap.latency.unwrap();
        assert_eq!(lat.samples, 2);
        assert!((lat.avg_ms - 20.0).abs() < 1e-9);
        assert_eq!((lat.min_ms, lat.max_ms), (10.0, 30.0));
        assert_eq!(m.error_log(), vec!["send: connection refused".to_string()]);
    }

    #[test]
    fn recv_never_exceeds_sent_in_snapshot() {
        let m = MetricsPipeline::new();
        m.record_recv();
        let snap = m.snapshot();
        assert_eq!(snap.recv, 0);
        assert_eq!(snap.loss, 1.0);
    }

    #[test]
    fn client_breakdown() {
        let m = MetricsPipeline::new();
        let a = ClientId::indexed(0);
        for v in [5.0, 1.0, 3.0] {
            m.record_latency(v, Some(&a));
        }
        m.record_latency(100.0, None);
        let clients = m.client_summaries();
        assert_eq!(clients.len(), 1);
        let c = &clients[0];
        assert_eq!(c.packet_count, 3);
        assert_eq!(c.lat_min_ms, Some(1.0));
        assert_eq!(c.lat_max_ms, Some(5.0));
        assert_eq!(c.lat_p50_ms, Some(3.0));
        assert_eq!(m.latency_samples(), vec![5.0, 1.0, 3.0, 100.0]);
    }

    #[test]
    fn concurrent_recording() {
        let m = Arc::new(MetricsPipeline::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        m.record_send();
                        m.record_recv();
                        m.record_latency(i as f64 % 50.0, None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = m.snapshot();
        assert_eq!(snap.sent, 4000);
        assert_eq!(snap.recv, 4000);
        assert_eq!(snap.histogram.count, 4000);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn histogram_and_ring_agree_on_median(
            samples in prop::collection::vec(0.0f64..1000.0, 10_000..12_000)
        ) {
            let mut ring = StreamingPercentile::default();
            let mut hist = HistogramBucket::default();
            for &s in &samples {
                ring.add(s);
                hist.add(s);
            }
            let a = ring.percentile(50.0).unwrap();
            let b = hist.percentile(50.0).unwrap();
            prop_assert!((a - b).abs() <= hist.bucket_width() + 1e-9, "ring {a} vs hist {b}");
        }

        #[test]
        fn loss_stays_in_unit_range(ops in prop::collection::vec(0u8..3, 0..200)) {
            let m = MetricsPipeline::new();
            for op in ops {
                match op {
                    0 => m.record_send(),
                    1 => m.record_recv(),
                    _ => m.record_loss(1),
                }
            }
            let snap = m.snapshot();
            prop_assert!(snap.recv <= snap.sent);
            prop_assert!((0.0..=1.0).contains(&snap.loss));
        }
    }
}

//! Metrics collection utilities.
//!
//! Aggregates global and per-host capture statistics, with body-fetch
//! latency percentiles over a sliding window.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Aggregated counters across all hosts.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub exchanges_finished: u64,
    pub exchanges_matched: u64,
    pub exchanges_discarded: u64,
    pub records_extracted: u64,
    pub protocol_violations: u64,
    pub fetch_failures: u64,
    pub decode_failures: u64,
    pub extraction_failures: u64,
    pub transport_failures: u64,
    pub average_fetch_latency: Option<Duration>,
    pub p95_fetch_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            exchanges_finished: 0,
            exchanges_matched: 0,
            exchanges_discarded: 0,
            records_extracted: 0,
            protocol_violations: 0,
            fetch_failures: 0,
            decode_failures: 0,
            extraction_failures: 0,
            transport_failures: 0,
            average_fetch_latency: None,
            p95_fetch_latency: None,
        }
    }
}

/// Host-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct HostStats {
    pub host: String,
    pub exchanges_finished: u64,
    pub exchanges_matched: u64,
    pub exchanges_discarded: u64,
    pub records_extracted: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_status: Option<u16>,
    pub average_fetch_latency: Option<Duration>,
    pub p95_fetch_latency: Option<Duration>,
}

impl HostStats {
    fn from_accumulator(host: &str, acc: &HostAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        Self {
            host: host.to_string(),
            exchanges_finished: acc.finished,
            exchanges_matched: acc.matched,
            exchanges_discarded: acc.discarded,
            records_extracted: acc.extracted,
            failures: acc.failures,
            consecutive_failures: acc.consecutive_failures,
            last_status: acc.last_status,
            average_fetch_latency: avg,
            p95_fetch_latency: p95,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub hosts: Vec<HostStats>,
}

impl MetricsSnapshot {
    pub fn host(&self, host: &str) -> Option<&HostStats> {
        self.hosts.iter().find(|stats| stats.host == host)
    }
}

/// Pipeline stage a per-exchange failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    Fetch,
    Decode,
    Extraction,
}

#[derive(Debug)]
struct HostAccumulator {
    finished: u64,
    matched: u64,
    discarded: u64,
    extracted: u64,
    failures: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    consecutive_failures: u32,
    last_status: Option<u16>,
}

impl HostAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            finished: 0,
            matched: 0,
            discarded: 0,
            extracted: 0,
            failures: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            consecutive_failures: 0,
            last_status: None,
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        percentile_stats(self.latencies.iter().cloned().collect())
    }
}

fn percentile_stats(mut samples: Vec<Duration>) -> (Option<Duration>, Option<Duration>) {
    if samples.is_empty() {
        return (None, None);
    }
    samples.sort_unstable();
    let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
    let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    hosts: HashMap<String, HostAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            hosts: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, host: &str) -> &mut HostAccumulator {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| HostAccumulator::new(self.max_window))
    }
}

/// Thread-safe metrics collector shared by the capture backends.
#[derive(Clone, Debug)]
pub struct CaptureMetrics {
    inner: Arc<Mutex<MetricsState>>,
}

impl CaptureMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(128))),
        }
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    pub fn record_finished(&self, host: &str, status: Option<u16>, matched: bool) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.exchanges_finished += 1;
        if matched {
            guard.global.exchanges_matched += 1;
        }
        let acc = guard.accumulator_mut(host);
        acc.finished += 1;
        if matched {
            acc.matched += 1;
        }
        if status.is_some() {
            acc.last_status = status;
        }
    }

    pub fn record_discarded(&self, host: &str) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.exchanges_discarded += 1;
        guard.accumulator_mut(host).discarded += 1;
    }

    pub fn record_violation(&self) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.protocol_violations += 1;
    }

    pub fn record_fetch(&self, host: &str, latency: Duration) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.accumulator_mut(host).record_latency(latency);

        // Global figures cover the union of the per-host windows.

        let samples: Vec<_> = guard
            .hosts
            .values()
            .flat_map(|acc| acc.latencies.iter())
            .cloned()
            .collect();
        let (avg, p95) = percentile_stats(samples);
        guard.global.average_fetch_latency = avg;
        guard.global.p95_fetch_latency = p95;
    }

    pub fn record_failure(&self, host: &str, stage: FailureStage) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        match stage {
            FailureStage::Fetch => guard.global.fetch_failures += 1,
            FailureStage::Decode => guard.global.decode_failures += 1,
            FailureStage::Extraction => guard.global.extraction_failures += 1,
        }
        guard.accumulator_mut(host).record_failure();
    }

    pub fn record_extracted(&self, host: &str) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.records_extracted += 1;
        let acc = guard.accumulator_mut(host);
        acc.extracted += 1;
        acc.consecutive_failures = 0;
    }

    pub fn record_transport_failure(&self) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.transport_failures += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.inner.lock().expect("metrics lock poisoned");
        let hosts = guard
            .hosts
            .iter()
            .map(|(host, acc)| HostStats::from_accumulator(host, acc))
            .collect();
        MetricsSnapshot {
            global: guard.global.clone(),
            hosts,
        }
    }
}

impl Default for CaptureMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn records_pipeline_outcomes() {
        let metrics = CaptureMetrics::new();
        metrics.record_finished("shopee.tw", Some(200), true);
        metrics.record_finished("shopee.tw", None, false);
        metrics.record_fetch("shopee.tw", Duration::from_millis(40));
        metrics.record_failure("shopee.tw", FailureStage::Decode);
        metrics.record_failure("shopee.tw", FailureStage::Extraction);
        metrics.record_extracted("shopee.tw");
        metrics.record_violation();

        let snapshot = metrics.snapshot();
        let host = snapshot.host("shopee.tw").unwrap();
        assert_eq!(host.exchanges_finished, 2);
        assert_eq!(host.exchanges_matched, 1);
        assert_eq!(host.failures, 2);
        assert_eq!(host.consecutive_failures, 0);
        assert_eq!(host.records_extracted, 1);
        assert_eq!(host.last_status, Some(200));
        assert_eq!(host.p95_fetch_latency, Some(Duration::from_millis(40)));

        assert_eq!(snapshot.global.decode_failures, 1);
        assert_eq!(snapshot.global.extraction_failures, 1);
        assert_eq!(snapshot.global.protocol_violations, 1);
    }

    #[test]
    fn latency_window_is_bounded() {
        let metrics = CaptureMetrics::with_window(16);
        for ms in 0..40u64 {
            metrics.record_fetch("h", Duration::from_millis(ms));
        }
        let snapshot = metrics.snapshot();
        let host = snapshot.host("h").unwrap();
        assert_eq!(host.p95_fetch_latency, Some(Duration::from_millis(39)));
        assert!(host.average_fetch_latency.unwrap() >= Duration::from_millis(24));
    }

    #[test]
    fn global_latency_is_the_window_mean() {
        let metrics = CaptureMetrics::new();
        metrics.record_fetch("shopee.tw", Duration::from_millis(100));
        for _ in 0..4 {
            metrics.record_fetch("shopee.tw", Duration::ZERO);
        }

        let snapshot = metrics.snapshot();
        let host = snapshot.host("shopee.tw").unwrap();
        let global = snapshot.global.average_fetch_latency.unwrap();
        assert_eq!(Some(global), host.average_fetch_latency);
        assert!(global.abs_diff(Duration::from_millis(20)) < Duration::from_micros(1));
        assert_eq!(snapshot.global.p95_fetch_latency, Some(Duration::from_millis(100)));
    }

    #[test]
    fn global_latency_spans_hosts() {
        let metrics = CaptureMetrics::new();
        metrics.record_fetch("a.example", Duration::from_millis(10));
        metrics.record_fetch("b.example", Duration::from_millis(30));

        let global = metrics.snapshot().global;
        let avg = global.average_fetch_latency.unwrap();
        assert!(avg.abs_diff(Duration::from_millis(20)) < Duration::from_micros(1));
        assert_eq!(global.p95_fetch_latency, Some(Duration::from_millis(30)));
    }
}

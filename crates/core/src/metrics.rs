//! Labelled time-series collection, windowed aggregation, and built-in
//! alert rules.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::RwLock;

const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_MAX_POINTS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

#[derive(Debug, Clone, Copy)]
pub struct Point {
    pub at: Instant,
    pub value: f64,
}

/// A single labelled series, e.g. `wan_latency_ms{wan="starlink"}`.
struct Series {
    kind: MetricKind,
    points: Vec<Point>,
}

impl Series {
    fn push(&mut self, value: f64, max_points: usize) {
        self.points.push(Point { at: Instant::now(), value });
        if self.points.len() > max_points {
            let overflow = self.points.len() - max_points;
            self.points.drain(0..overflow);
        }
    }

    fn prune(&mut self, retention: Duration) {
        self.points.retain(|p| p.at.elapsed() <= retention);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WindowStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
    pub stddev: f64,
    pub count: usize,
}

/// The fixed set of aggregation windows the aggregator reports over.
pub const WINDOWS: &[Duration] = &[
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(6 * 60 * 60),
    Duration::from_secs(24 * 60 * 60),
    Duration::from_secs(7 * 24 * 60 * 60),
];

pub struct MetricsStore {
    series: RwLock<AHashMap<String, Series>>,
    retention: Duration,
    max_points: usize,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::with_bounds(DEFAULT_RETENTION, DEFAULT_MAX_POINTS)
    }

    pub fn with_bounds(retention: Duration, max_points: usize) -> Self {
        Self { series: RwLock::new(AHashMap::new()), retention, max_points }
    }

    pub fn record(&self, key: &str, kind: MetricKind, value: f64) {
        let mut series = self.series.write();
        let entry = series.entry(key.to_string()).or_insert_with(|| Series { kind, points: Vec::new() });
        entry.push(value, self.max_points);
    }

    /// Prunes every series against the retention window; intended to run
    /// on every write plus an hourly background sweep.
    pub fn prune_all(&self) {
        let mut series = self.series.write();
        for s in series.values_mut() {
            s.prune(self.retention);
        }
    }

    pub fn window_stats(&self, key: &str, window: Duration) -> Option<WindowStats> {
        let series = self.series.read();
        let s = series.get(key)?;
        let mut values: Vec<f64> = s.points.iter().filter(|p| p.at.elapsed() <= window).map(|p| p.value).collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        Some(compute_stats(&values))
    }

    pub fn moving_average(&self, key: &str, window: Duration) -> Option<f64> {
        self.window_stats(key, window).map(|s| s.avg)
    }

    /// Exponential moving average with smoothing factor `alpha` over the
    /// series in time order, oldest to newest.
    pub fn ema(&self, key: &str, alpha: f64) -> Option<f64> {
        let series = self.series.read();
        let s = series.get(key)?;
        let mut iter = s.points.iter();
        let mut acc = iter.next()?.value;
        for p in iter {
            acc = alpha * p.value + (1.0 - alpha) * acc;
        }
        Some(acc)
    }

    /// Flags the latest point as anomalous if its Z-score against the
    /// series' mean/stddev exceeds `threshold`.
    pub fn is_anomalous(&self, key: &str, threshold: f64) -> bool {
        let series = self.series.read();
        let Some(s) = series.get(key) else { return false };
        if s.points.len() < 2 {
            return false;
        }
        let values: Vec<f64> = s.points.iter().map(|p| p.value).collect();
        let stats = compute_stats(&sorted(&values));
        if stats.stddev == 0.0 {
            return false;
        }
        let latest = values[values.len() - 1];
        ((latest - stats.avg) / stats.stddev).abs() > threshold
    }

    /// Slope of a simple linear regression of value over sample index;
    /// positive means the series trends upward.
    pub fn trend(&self, key: &str) -> Option<f64> {
        let series = self.series.read();
        let s = series.get(key)?;
        if s.points.len() < 2 {
            return None;
        }
        let n = s.points.len() as f64;
        let xs: Vec<f64> = (0..s.points.len()).map(|i| i as f64).collect();
        let ys: Vec<f64> = s.points.iter().map(|p| p.value).collect();
        let mean_x = xs.iter().sum::<f64>() / n;
        let mean_y = ys.iter().sum::<f64>() / n;
        let numerator: f64 = xs.iter().zip(&ys).map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
        let denominator: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
        if denominator == 0.0 {
            return Some(0.0);
        }
        Some(numerator / denominator)
    }

    pub fn downsample(&self, key: &str, bucket: Duration, method: DownsampleMethod) -> Vec<f64> {
        let series = self.series.read();
        let Some(s) = series.get(key) else { return Vec::new() };
        if s.points.is_empty() {
            return Vec::new();
        }

        let mut buckets: BTreeMap<u64, Vec<f64>> = BTreeMap::new();
        let origin = s.points[0].at;
        for p in &s.points {
            let bucket_idx = (p.at.duration_since(origin).as_secs_f64() / bucket.as_secs_f64()) as u64;
            buckets.entry(bucket_idx).or_default().push(p.value);
        }

        buckets.into_values().map(|values| downsample_bucket(&values, method)).collect()
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownsampleMethod {
    Avg,
    Sum,
    Min,
    Max,
    Median,
    First,
    Last,
}

fn downsample_bucket(values: &[f64], method: DownsampleMethod) -> f64 {
    match method {
        DownsampleMethod::Avg => values.iter().sum::<f64>() / values.len() as f64,
        DownsampleMethod::Sum => values.iter().sum(),
        DownsampleMethod::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
        DownsampleMethod::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        DownsampleMethod::Median => compute_stats(&sorted(values)).median,
        DownsampleMethod::First => values[0],
        DownsampleMethod::Last => values[values.len() - 1],
    }
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.total_cmp(b));
    v
}

fn compute_stats(sorted_values: &[f64]) -> WindowStats {
    let count = sorted_values.len();
    let sum: f64 = sorted_values.iter().sum();
    let avg = sum / count as f64;
    let variance = sorted_values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / count as f64;

    WindowStats {
        min: sorted_values[0],
        max: sorted_values[count - 1],
        avg,
        median: percentile(sorted_values, 0.5),
        p95: percentile(sorted_values, 0.95),
        p99: percentile(sorted_values, 0.99),
        stddev: variance.sqrt(),
        count,
    }
}

fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    let idx = ((sorted_values.len() - 1) as f64 * p).round() as usize;
    sorted_values[idx]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: Instant,
    pub resolved_at: Option<Instant>,
}

#[derive(Default)]
pub struct AlertList {
    alerts: RwLock<Vec<Alert>>,
}

const ALERT_HISTORY_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

impl AlertList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises `id` only if no unresolved alert with that id exists.
    pub fn raise(&self, id: &str, severity: AlertSeverity, message: impl Into<String>) -> bool {
        let mut alerts = self.alerts.write();
        if alerts.iter().any(|a| a.id == id && a.resolved_at.is_none()) {
            return false;
        }
        alerts.push(Alert { id: id.to_string(), severity, message: message.into(), raised_at: Instant::now(), resolved_at: None });
        true
    }

    pub fn resolve(&self, id: &str) {
        let mut alerts = self.alerts.write();
        for alert in alerts.iter_mut().filter(|a| a.id == id && a.resolved_at.is_none()) {
            alert.resolved_at = Some(Instant::now());
        }
    }

    /// Drops alerts resolved more than 24h ago.
    pub fn sweep(&self) -> usize {
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|a| a.resolved_at.map(|t| t.elapsed() < ALERT_HISTORY_RETENTION).unwrap_or(true));
        before - alerts.len()
    }

    pub fn active(&self) -> Vec<Alert> {
        self.alerts.read().iter().filter(|a| a.resolved_at.is_none()).cloned().collect()
    }
}

/// WAN latency/loss and quota thresholds, emitting into `alerts` via the
/// built-in rule set from section 4.10.
pub fn evaluate_wan_health_alerts(alerts: &AlertList, wan_id: u8, avg_latency_ms: f64, avg_loss_pct: f64) {
    let latency_id = format!("wan-{wan_id}-latency");
    if avg_latency_ms > 200.0 {
        alerts.raise(&latency_id, AlertSeverity::Warning, format!("WAN {wan_id} latency {avg_latency_ms:.1}ms exceeds 200ms"));
    } else {
        alerts.resolve(&latency_id);
    }

    let loss_id = format!("wan-{wan_id}-loss");
    if avg_loss_pct > 5.0 {
        alerts.raise(&loss_id, AlertSeverity::Warning, format!("WAN {wan_id} loss {avg_loss_pct:.1}% exceeds 5%"));
    } else {
        alerts.resolve(&loss_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPeriod {
    Daily,
    Weekly,
    Monthly,
}

pub fn evaluate_quota_alert(alerts: &AlertList, session_id: &str, period: QuotaPeriod, used: u64, quota: u64) {
    if quota == 0 || used <= quota {
        return;
    }
    let (suffix, severity) = match period {
        QuotaPeriod::Daily => ("daily", AlertSeverity::Warning),
        QuotaPeriod::Weekly => ("weekly", AlertSeverity::Warning),
        QuotaPeriod::Monthly => ("monthly", AlertSeverity::Critical),
    };
    let id = format!("quota-{session_id}-{suffix}");
    alerts.raise(&id, severity, format!("session {session_id} exceeded {suffix} quota ({used}/{quota} bytes)"));
}

#[cfg(feature = "metrics-prometheus")]
pub mod prometheus_export {
    //! Adapter exposing the store as Prometheus text format for a
    //! `TelemetrySink`.
    use prometheus::{Encoder, Registry, TextEncoder};

    pub fn encode(registry: &Registry) -> String {
        let metric_families = registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buf).expect("encoding registered metrics never fails");
        String::from_utf8(buf).expect("prometheus text encoding is always valid utf-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_stats_computes_percentiles() {
        let store = MetricsStore::new();
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            store.record("latency", MetricKind::Gauge, v);
        }
        let stats = store.window_stats("latency", Duration::from_secs(60)).unwrap();
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 50.0);
        assert_eq!(stats.median, 30.0);
    }

    #[test]
    fn alert_raise_is_deduplicated_while_unresolved() {
        let alerts = AlertList::new();
        assert!(alerts.raise("wan-1-latency", AlertSeverity::Warning, "slow"));
        assert!(!alerts.raise("wan-1-latency", AlertSeverity::Warning, "slow again"));
        assert_eq!(alerts.active().len(), 1);
    }

    #[test]
    fn resolved_alert_can_be_raised_again() {
        let alerts = AlertList::new();
        alerts.raise("wan-1-latency", AlertSeverity::Warning, "slow");
        alerts.resolve("wan-1-latency");
        assert!(alerts.raise("wan-1-latency", AlertSeverity::Warning, "slow again"));
    }

    #[test]
    fn wan_health_alerts_fire_past_thresholds() {
        let alerts = AlertList::new();
        evaluate_wan_health_alerts(&alerts, 1, 250.0, 1.0);
        assert_eq!(alerts.active().len(), 1);
        assert_eq!(alerts.active()[0].id, "wan-1-latency");
    }

    #[test]
    fn monthly_quota_breach_is_critical() {
        let alerts = AlertList::new();
        evaluate_quota_alert(&alerts, "sess-1", QuotaPeriod::Monthly, 200, 100);
        let active = alerts.active();
        assert_eq!(active[0].severity, AlertSeverity::Critical);
    }

    #[test]
    fn trend_detects_upward_slope() {
        let store = MetricsStore::new();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            store.record("growth", MetricKind::Gauge, v);
        }
        let trend = store.trend("growth").unwrap();
        assert!(trend > 0.0);
    }

    #[test]
    fn downsample_avg_reduces_bucketed_points() {
        let store = MetricsStore::new();
        for v in [1.0, 2.0, 3.0, 4.0] {
            store.record("x", MetricKind::Gauge, v);
        }
        let buckets = store.downsample("x", Duration::from_secs(3600), DownsampleMethod::Avg);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0], 2.5);
    }
}

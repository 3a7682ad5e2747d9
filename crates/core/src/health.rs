//! Per-WAN health monitor: rolling latency/jitter/loss, consecutive
//! success/failure counters driving state transitions, and an adaptive
//! probe interval.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

const RING_CAPACITY: usize = 64;
const MIN_INTERVAL: Duration = Duration::from_secs(5);
const MAX_INTERVAL: Duration = Duration::from_secs(60);
const AUTO_ELECTION_BATCH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeMethod {
    Ping,
    Tcp,
    Http,
    Dns,
    Auto,
}

pub const CONCRETE_METHODS: [ProbeMethod; 4] =
    [ProbeMethod::Ping, ProbeMethod::Tcp, ProbeMethod::Http, ProbeMethod::Dns];

#[derive(Debug, Clone)]
pub struct HealthSample {
    pub wan_id: u8,
    pub method: ProbeMethod,
    pub start_time: Instant,
    pub rtt: Duration,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RollingStats {
    pub avg_latency_ms: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
}

struct MethodTally {
    probes: u32,
    successes: u32,
    total_latency_ms: f64,
}

impl Default for MethodTally {
    fn default() -> Self {
        Self {
            probes: 0,
            successes: 0,
            total_latency_ms: 0.0,
        }
    }
}

impl MethodTally {
    fn record(&mut self, rtt_ms: f64, success: bool) {
        self.probes += 1;
        if success {
            self.successes += 1;
            self.total_latency_ms += rtt_ms;
        }
    }

    fn reliability(&self) -> f64 {
        if self.probes == 0 {
            return 0.0;
        }
        let success_rate = self.successes as f64 / self.probes as f64;
        let avg_latency = if self.successes == 0 {
            0.0
        } else {
            self.total_latency_ms / self.successes as f64
        };
        success_rate * (1.0 / (1.0 + avg_latency / 100.0))
    }
}

/// State machine thresholds. `success_threshold` consecutive successes
/// bring a `Down` WAN back up; `failure_threshold` consecutive failures
/// bring any WAN down.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            success_threshold: 3,
            failure_threshold: 3,
        }
    }
}

pub struct HealthMonitor {
    samples: VecDeque<HealthSample>,
    thresholds: HealthThresholds,
    consecutive_successes: u32,
    consecutive_failures: u32,
    interval: Duration,
    base_interval: Duration,
    auto_tallies: std::collections::HashMap<ProbeMethod, MethodTally>,
    auto_probes_since_election: usize,
    elected_auto_method: ProbeMethod,
}

impl HealthMonitor {
    pub fn new(base_interval: Duration, thresholds: HealthThresholds) -> Self {
        Self {
            samples: VecDeque::with_capacity(RING_CAPACITY),
            thresholds,
            consecutive_successes: 0,
            consecutive_failures: 0,
            interval: base_interval,
            base_interval,
            auto_tallies: std::collections::HashMap::new(),
            auto_probes_since_election: 0,
            elected_auto_method: ProbeMethod::Ping,
        }
    }

    /// Record a probe result, update the ring buffer, consecutive
    /// counters, adaptive interval and (for `Auto`) per-method tallies.
    /// Returns `true` if this probe should flip the WAN's Up/Down
    /// consecutive-counter state (caller applies the transition to the
    /// WAN record itself).
    pub fn record(&mut self, sample: HealthSample) {
        if self.samples.len() == RING_CAPACITY {
            self.samples.pop_front();
        }

        if sample.success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            self.interval = (self.interval.mul_f64(1.2)).min(MAX_INTERVAL).max(self.base_interval.min(MAX_INTERVAL));
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            self.interval = (self.interval / 2).max(MIN_INTERVAL);
        }

        if sample.method != ProbeMethod::Auto {
            let tally = self.auto_tallies.entry(sample.method).or_default();
            tally.record(sample.rtt.as_secs_f64() * 1000.0, sample.success);
            self.auto_probes_since_election += 1;

            if self.auto_probes_since_election >= AUTO_ELECTION_BATCH {
                self.elect_auto_method();
            }
        }

        self.samples.push_back(sample);
    }

    fn elect_auto_method(&mut self) {
        self.auto_probes_since_election = 0;
        if let Some((method, _)) = self
            .auto_tallies
            .iter()
            .max_by(|(_, a), (_, b)| a.reliability().total_cmp(&b.reliability()))
        {
            self.elected_auto_method = *method;
        }
    }

    /// The concrete method `Auto` currently resolves to for the next probe batch.
    pub fn auto_elected_method(&self) -> ProbeMethod {
        self.elected_auto_method
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn should_transition_up(&self) -> bool {
        self.consecutive_successes >= self.thresholds.success_threshold
    }

    pub fn should_transition_down(&self) -> bool {
        self.consecutive_failures >= self.thresholds.failure_threshold
    }

    /// Rolling average latency, mean-absolute-delta jitter and loss
    /// percentage over the ring buffer.
    pub fn rolling_stats(&self) -> RollingStats {
        if self.samples.is_empty() {
            return RollingStats::default();
        }

        let total = self.samples.len() as f64;
        let failures = self.samples.iter().filter(|s| !s.success).count() as f64;

        let latencies: Vec<f64> = self
            .samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.rtt.as_secs_f64() * 1000.0)
            .collect();

        let avg_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        let jitter_ms = if latencies.len() < 2 {
            0.0
        } else {
            let deltas: Vec<f64> = latencies.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
            deltas.iter().sum::<f64>() / deltas.len() as f64
        };

        RollingStats {
            avg_latency_ms,
            jitter_ms,
            loss_pct: (failures / total) * 100.0,
        }
    }
}

/// Pick the best WAN from a set of candidates by
/// `uptime - 0.5*normalized_latency - 2*loss_pct`, ties broken by WAN id.
pub fn best_wan(candidates: &[(u8, f64 /* uptime_ratio */, RollingStats)]) -> Option<u8> {
    if candidates.is_empty() {
        return None;
    }

    let max_latency = candidates
        .iter()
        .map(|(_, _, s)| s.avg_latency_ms)
        .fold(0.0_f64, f64::max)
        .max(1.0);

    let scored: Vec<(u8, f64)> = candidates
        .iter()
        .map(|(id, uptime, stats)| {
            let normalized_latency = stats.avg_latency_ms / max_latency;
            let score = uptime - 0.5 * normalized_latency - 2.0 * (stats.loss_pct / 100.0);
            (*id, score)
        })
        .collect();

    let mut best: Option<(u8, f64)> = None;
    for (id, score) in scored {
        best = Some(match best {
            None => (id, score),
            Some((best_id, best_score)) => {
                if score > best_score || (score == best_score && id < best_id) {
                    (id, score)
                } else {
                    (best_id, best_score)
                }
            }
        });
    }
    best.map(|(id, _)| id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(success: bool, rtt_ms: u64) -> HealthSample {
        HealthSample {
            wan_id: 1,
            method: ProbeMethod::Ping,
            start_time: Instant::now(),
            rtt: Duration::from_millis(rtt_ms),
            success,
        }
    }

    #[test]
    fn transitions_up_after_success_threshold() {
        let mut monitor = HealthMonitor::new(Duration::from_secs(5), HealthThresholds::default());
        assert!(!monitor.should_transition_up());
        for _ in 0..3 {
            monitor.record(sample(true, 20));
        }
        assert!(monitor.should_transition_up());
    }

    #[test]
    fn transitions_down_after_failure_threshold() {
        let mut monitor = HealthMonitor::new(Duration::from_secs(5), HealthThresholds::default());
        for _ in 0..3 {
            monitor.record(sample(false, 0));
        }
        assert!(monitor.should_transition_down());
    }

    #[test]
    fn interval_halves_on_failure_and_floors_at_min() {
        let mut monitor = HealthMonitor::new(Duration::from_secs(8), HealthThresholds::default());
        for _ in 0..10 {
            monitor.record(sample(false, 0));
        }
        assert_eq!(monitor.interval(), MIN_INTERVAL);
    }

    #[test]
    fn interval_grows_on_success_and_caps_at_max() {
        let mut monitor = HealthMonitor::new(Duration::from_secs(40), HealthThresholds::default());
        for _ in 0..40 {
            monitor.record(sample(true, 10));
        }
        assert_eq!(monitor.interval(), MAX_INTERVAL);
    }

    #[test]
    fn best_wan_prefers_higher_uptime_lower_latency_lower_loss() {
        let good = RollingStats {
            avg_latency_ms: 10.0,
            jitter_ms: 1.0,
            loss_pct: 0.0,
        };
        let bad = RollingStats {
            avg_latency_ms: 200.0,
            jitter_ms: 20.0,
            loss_pct: 10.0,
        };

        let winner = best_wan(&[(1, 0.99, good), (2, 0.99, bad)]);
        assert_eq!(winner, Some(1));
    }

    #[test]
    fn best_wan_breaks_ties_by_id() {
        let stats = RollingStats::default();
        let winner = best_wan(&[(5, 1.0, stats), (2, 1.0, stats)]);
        assert_eq!(winner, Some(2));
    }
}

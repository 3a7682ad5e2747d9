//! The WAN scheduler: load-balances outbound packets across member
//! links with per-flow affinity.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::RwLock;
use protocol::FlowKey;

use crate::error::{Error, Result};
use crate::wan::{WanInterface, WanMetrics};

/// Per-flow affinity persists while the chosen WAN stays available and
/// for at least this long, matching the `PerFlow` mode's dwell time.
const FLOW_AFFINITY_MIN_DWELL: Duration = Duration::from_secs(5 * 60);

/// The flow->WAN affinity map is wiped in bulk on this cadence. Finer
/// per-flow expiry (on top of the dwell time above) is a legitimate
/// refinement; the bulk wipe is kept as a coarse backstop.
const FLOW_AFFINITY_GC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Duplication is used when the primary WAN's rolling loss exceeds this.
const FEC_LOSS_THRESHOLD_PCT: f64 = 5.0;

/// Packets above this priority get duplicated onto a backup WAN.
const DUPLICATE_PRIORITY_THRESHOLD: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    RoundRobin,
    Weighted,
    LeastUsed,
    LeastLatency,
    PerFlow,
    Adaptive,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub primary: u8,
    pub backups: Vec<u8>,
    pub use_fec: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RouteRequest {
    pub flow_key: FlowKey,
    pub priority: u16,
    pub force_duplicate: bool,
}

struct Affinity {
    wan_id: u8,
    assigned_at: Instant,
}

pub struct Scheduler {
    wans: RwLock<AHashMap<u8, WanInterface>>,
    mode: SchedulerMode,
    round_robin_cursor: AtomicUsize,
    affinity: RwLock<AHashMap<FlowKey, Affinity>>,
    affinity_gc_last_run: RwLock<Instant>,
}

impl Scheduler {
    pub fn new(mode: SchedulerMode) -> Self {
        Self {
            wans: RwLock::new(AHashMap::new()),
            mode,
            round_robin_cursor: AtomicUsize::new(0),
            affinity: RwLock::new(AHashMap::new()),
            affinity_gc_last_run: RwLock::new(Instant::now()),
        }
    }

    pub fn add_wan(&self, wan: WanInterface) {
        self.wans.write().insert(wan.id, wan);
    }

    pub fn remove_wan(&self, id: u8) {
        self.wans.write().remove(&id);
    }

    pub fn update_metrics(&self, id: u8, metrics: WanMetrics) {
        if let Some(wan) = self.wans.write().get_mut(&id) {
            wan.metrics = metrics;
        }
    }

    pub fn set_state(&self, id: u8, state: protocol::WanState) {
        if let Some(wan) = self.wans.write().get_mut(&id) {
            wan.state = state;
        }
    }

    pub fn record_bandwidth_usage(&self, id: u8, bytes: u64) {
        if let Some(wan) = self.wans.write().get_mut(&id) {
            wan.bytes_used = wan.bytes_used.saturating_add(bytes);
        }
    }

    fn available_wans(&self) -> Vec<WanInterface> {
        self.wans
            .read()
            .values()
            .filter(|w| w.is_available())
            .cloned()
            .collect()
    }

    fn maybe_gc_affinity(&self) {
        let mut last_run = self.affinity_gc_last_run.write();
        if last_run.elapsed() >= FLOW_AFFINITY_GC_INTERVAL {
            self.affinity.write().clear();
            *last_run = Instant::now();
        }
    }

    pub fn route(&self, req: RouteRequest) -> Result<RouteDecision> {
        self.maybe_gc_affinity();

        let available = self.available_wans();
        if available.is_empty() {
            return Err(Error::NoAvailableWan);
        }

        let primary = match self.mode {
            SchedulerMode::RoundRobin => self.pick_round_robin(&available),
            SchedulerMode::Weighted => Self::pick_weighted(&available),
            SchedulerMode::LeastUsed => Self::pick_least_used(&available),
            SchedulerMode::LeastLatency => Self::pick_least_latency(&available),
            SchedulerMode::PerFlow => self.pick_per_flow(&available, &req.flow_key),
            SchedulerMode::Adaptive => self.pick_adaptive(&available, &req.flow_key),
        };

        let use_fec = primary.metrics.avg_loss_pct > FEC_LOSS_THRESHOLD_PCT;
        let should_duplicate = req.priority > DUPLICATE_PRIORITY_THRESHOLD || req.force_duplicate;

        let backups = if should_duplicate {
            available
                .iter()
                .find(|w| w.id != primary.id)
                .map(|w| vec![w.id])
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(RouteDecision {
            primary: primary.id,
            backups,
            use_fec,
        })
    }

    fn pick_round_robin(&self, available: &[WanInterface]) -> WanInterface {
        let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % available.len();
        available[idx].clone()
    }

    fn weighted_score(wan: &WanInterface) -> f64 {
        let latency_term = 100.0 / (wan.metrics.avg_latency_ms + 1.0);
        let loss_term = 1.0 - (wan.metrics.avg_loss_pct / 100.0).clamp(0.0, 1.0);
        let utilization = if wan.config.max_bandwidth_bps == 0 {
            0.0
        } else {
            (wan.bytes_used as f64 / wan.config.max_bandwidth_bps as f64).clamp(0.0, 1.0)
        };
        let bandwidth_term = 1.0 - utilization;

        wan.config.weight * latency_term * loss_term * bandwidth_term
    }

    fn pick_weighted(available: &[WanInterface]) -> WanInterface {
        available
            .iter()
            .max_by(|a, b| Self::weighted_score(a).total_cmp(&Self::weighted_score(b)))
            .cloned()
            .expect("available is non-empty")
    }

    fn pick_least_used(available: &[WanInterface]) -> WanInterface {
        available
            .iter()
            .min_by_key(|w| w.bytes_used)
            .cloned()
            .expect("available is non-empty")
    }

    fn pick_least_latency(available: &[WanInterface]) -> WanInterface {
        available
            .iter()
            .min_by(|a, b| a.metrics.avg_latency_ms.total_cmp(&b.metrics.avg_latency_ms))
            .cloned()
            .expect("available is non-empty")
    }

    fn pick_per_flow(&self, available: &[WanInterface], flow_key: &FlowKey) -> WanInterface {
        let mut affinity = self.affinity.write();

        if let Some(entry) = affinity.get(flow_key) {
            if let Some(wan) = available.iter().find(|w| w.id == entry.wan_id) {
                return wan.clone();
            }
            // The previously-affined WAN is no longer available; fall through
            // and pick a new one below, replacing the stale entry.
        }

        let idx = (flow_key.fnv1a() as usize) % available.len();
        let chosen = available[idx].clone();
        affinity.insert(
            *flow_key,
            Affinity {
                wan_id: chosen.id,
                assigned_at: Instant::now(),
            },
        );
        chosen
    }

    fn pick_adaptive(&self, available: &[WanInterface], flow_key: &FlowKey) -> WanInterface {
        let max_priority = available.iter().map(|w| w.config.priority).max().unwrap_or(0);
        let min_priority = available.iter().map(|w| w.config.priority).min().unwrap_or(0);

        if max_priority > 200 {
            Self::pick_least_latency(available)
        } else if min_priority < 50 {
            Self::pick_least_used(available)
        } else {
            let _ = flow_key;
            Self::pick_weighted(available)
        }
    }

    /// True once a flow's affinity entry has persisted for at least the
    /// minimum dwell time; exposed mainly for tests of the `PerFlow` mode.
    pub fn affinity_is_sticky(&self, flow_key: &FlowKey) -> bool {
        self.affinity
            .read()
            .get(flow_key)
            .is_some_and(|a| a.assigned_at.elapsed() >= FLOW_AFFINITY_MIN_DWELL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{L4Proto, LinkKind, WanState};

    fn flow(port: u16) -> FlowKey {
        FlowKey {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "93.184.216.34".parse().unwrap(),
            src_port: port,
            dst_port: 443,
            proto: L4Proto::Tcp,
        }
    }

    fn up_wan(id: u8) -> WanInterface {
        let mut wan = WanInterface::new(id, format!("wan{id}"), LinkKind::Cable, crate::wan::WanConfig::default());
        wan.state = WanState::Up;
        wan
    }

    #[test]
    fn no_available_wan_errors() {
        let scheduler = Scheduler::new(SchedulerMode::RoundRobin);
        let err = scheduler
            .route(RouteRequest {
                flow_key: flow(1),
                priority: 0,
                force_duplicate: false,
            })
            .unwrap_err();
        assert_eq!(err, Error::NoAvailableWan);
    }

    #[test]
    fn round_robin_cycles_through_available_wans() {
        let scheduler = Scheduler::new(SchedulerMode::RoundRobin);
        scheduler.add_wan(up_wan(1));
        scheduler.add_wan(up_wan(2));

        let mut seen = std::collections::HashSet::new();
        for i in 0..4 {
            let decision = scheduler
                .route(RouteRequest {
                    flow_key: flow(i),
                    priority: 0,
                    force_duplicate: false,
                })
                .unwrap();
            seen.insert(decision.primary);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn per_flow_is_sticky_for_same_flow() {
        let scheduler = Scheduler::new(SchedulerMode::PerFlow);
        scheduler.add_wan(up_wan(1));
        scheduler.add_wan(up_wan(2));
        scheduler.add_wan(up_wan(3));

        let f = flow(777);
        let first = scheduler
            .route(RouteRequest {
                flow_key: f,
                priority: 0,
                force_duplicate: false,
            })
            .unwrap()
            .primary;

        for _ in 0..10 {
            let again = scheduler
                .route(RouteRequest {
                    flow_key: f,
                    priority: 0,
                    force_duplicate: false,
                })
                .unwrap()
                .primary;
            assert_eq!(again, first);
        }
    }

    #[test]
    fn high_priority_packet_duplicates_to_a_backup() {
        let scheduler = Scheduler::new(SchedulerMode::RoundRobin);
        scheduler.add_wan(up_wan(1));
        scheduler.add_wan(up_wan(2));

        let decision = scheduler
            .route(RouteRequest {
                flow_key: flow(1),
                priority: 255,
                force_duplicate: false,
            })
            .unwrap();

        assert_eq!(decision.backups.len(), 1);
        assert_ne!(decision.backups[0], decision.primary);
    }

    #[test]
    fn high_loss_enables_fec() {
        let scheduler = Scheduler::new(SchedulerMode::LeastLatency);
        let mut wan = up_wan(1);
        wan.metrics.avg_loss_pct = 12.0;
        scheduler.add_wan(wan);

        let decision = scheduler
            .route(RouteRequest {
                flow_key: flow(1),
                priority: 0,
                force_duplicate: false,
            })
            .unwrap();
        assert!(decision.use_fec);
    }

    #[test]
    fn least_used_picks_lowest_byte_counter() {
        let scheduler = Scheduler::new(SchedulerMode::LeastUsed);
        scheduler.add_wan(up_wan(1));
        scheduler.add_wan(up_wan(2));
        scheduler.record_bandwidth_usage(1, 10_000);

        let decision = scheduler
            .route(RouteRequest {
                flow_key: flow(1),
                priority: 0,
                force_duplicate: false,
            })
            .unwrap();
        assert_eq!(decision.primary, 2);
    }
}

//! The `WanInterface` record shared (read-mostly) by the scheduler,
//! failover controller and health monitor.

use protocol::{LinkKind, WanState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanConfig {
    pub weight: f64,
    pub max_bandwidth_bps: u64,
    pub priority: u16,
    pub enabled: bool,
}

impl Default for WanConfig {
    fn default() -> Self {
        Self {
            weight: 1.0,
            max_bandwidth_bps: u64::MAX,
            priority: 100,
            enabled: true,
        }
    }
}

/// Rolling metrics sampled by the health monitor and consumed by the
/// scheduler.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WanMetrics {
    pub avg_latency_ms: f64,
    pub jitter_ms: f64,
    pub avg_loss_pct: f64,
    pub sampled_bandwidth_bps: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanInterface {
    pub id: u8,
    pub name: String,
    pub kind: LinkKind,
    pub config: WanConfig,
    pub state: WanState,
    pub metrics: WanMetrics,
    /// Bytes sent in the current accounting window; reset by the caller,
    /// used by the `LeastUsed` scheduling mode.
    pub bytes_used: u64,
}

impl WanInterface {
    pub fn new(id: u8, name: impl Into<String>, kind: LinkKind, config: WanConfig) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            state: if config.enabled { WanState::Down } else { WanState::Disabled },
            config,
            metrics: WanMetrics::default(),
            bytes_used: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.state, WanState::Up | WanState::Recovering)
    }
}

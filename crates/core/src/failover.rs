//! The health-and-failover controller: subscribes to health
//! transitions and decides which WAN is currently active, with
//! anti-flap dampening on failback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// No two failovers on the same controller happen within this window
/// unless one is a manual `force_failover_to`.
const FAILBACK_DAMPENING: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverReason {
    ActiveWanDown,
    HigherPriorityRecovered,
    ManualPin,
}

pub type FailoverCallback = Arc<dyn Fn(Option<u8>, u8, FailoverReason) + Send + Sync>;

struct WanEntry {
    id: u8,
    priority: u16,
    insertion_order: usize,
    healthy: bool,
}

pub struct FailoverController {
    wans: RwLock<Vec<WanEntry>>,
    active: RwLock<Option<u8>>,
    last_failover: RwLock<Option<Instant>>,
    callback: RwLock<Option<FailoverCallback>>,
}

impl Default for FailoverController {
    fn default() -> Self {
        Self::new()
    }
}

impl FailoverController {
    pub fn new() -> Self {
        Self {
            wans: RwLock::new(Vec::new()),
            active: RwLock::new(None),
            last_failover: RwLock::new(None),
            callback: RwLock::new(None),
        }
    }

    pub fn set_callback(&self, callback: FailoverCallback) {
        *self.callback.write() = Some(callback);
    }

    pub fn register_wan(&self, id: u8, priority: u16) {
        let mut wans = self.wans.write();
        let insertion_order = wans.len();
        wans.push(WanEntry {
            id,
            priority,
            insertion_order,
            healthy: false,
        });
    }

    pub fn active_wan(&self) -> Option<u8> {
        *self.active.read()
    }

    fn best_healthy(wans: &[WanEntry]) -> Option<&WanEntry> {
        wans.iter()
            .filter(|w| w.healthy)
            .min_by_key(|w| (w.priority, w.insertion_order))
    }

    /// Feed a health-state transition for `id`. Idempotent: repeating the
    /// same `healthy` value for an already-settled WAN produces no
    /// further transition.
    pub fn on_health_update(&self, id: u8, healthy: bool) {
        {
            let mut wans = self.wans.write();
            if let Some(entry) = wans.iter_mut().find(|w| w.id == id) {
                if entry.healthy == healthy {
                    return;
                }
                entry.healthy = healthy;
            } else {
                return;
            }
        }

        self.reconcile(FailoverReason::ActiveWanDown);
    }

    fn reconcile(&self, fallback_reason: FailoverReason) {
        let wans = self.wans.read();
        let active = *self.active.read();

        let active_is_healthy = active.is_some_and(|id| wans.iter().any(|w| w.id == id && w.healthy));

        if !active_is_healthy {
            // The active WAN (if any) just went unhealthy: fail over
            // immediately, dampening does not apply.
            if let Some(best) = Self::best_healthy(&wans) {
                let old = active;
                let new_id = best.id;
                drop(wans);
                self.commit_failover(old, new_id, fallback_reason);
            } else {
                drop(wans);
                *self.active.write() = None;
            }
            return;
        }

        // Active WAN is healthy. Check whether a strictly higher-priority
        // WAN has recovered and dampening allows a failback.
        if let Some(best) = Self::best_healthy(&wans) {
            let active_id = active.expect("active_is_healthy implies Some");
            if best.id != active_id {
                let dampened = self
                    .last_failover
                    .read()
                    .is_some_and(|t| t.elapsed() < FAILBACK_DAMPENING);

                if !dampened {
                    let new_id = best.id;
                    drop(wans);
                    self.commit_failover(Some(active_id), new_id, FailoverReason::HigherPriorityRecovered);
                }
            }
        }
    }

    fn commit_failover(&self, old: Option<u8>, new_id: u8, reason: FailoverReason) {
        if old == Some(new_id) {
            return;
        }

        *self.active.write() = Some(new_id);
        *self.last_failover.write() = Some(Instant::now());

        if let Some(cb) = self.callback.read().clone() {
            cb(old, new_id, reason);
        }
    }

    /// Manual pin: bypasses dampening. Fails if the target is not
    /// currently healthy.
    pub fn force_failover_to(&self, id: u8) -> Result<()> {
        let healthy = self.wans.read().iter().any(|w| w.id == id && w.healthy);
        if !healthy {
            return Err(Error::WanUnhealthy);
        }

        let old = *self.active.read();
        self.commit_failover(old, id, FailoverReason::ManualPin);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fails_over_to_next_priority_when_active_goes_down() {
        let controller = FailoverController::new();
        controller.register_wan(1, 10);
        controller.register_wan(2, 20);

        controller.on_health_update(1, true);
        controller.on_health_update(2, true);
        assert_eq!(controller.active_wan(), Some(1));

        controller.on_health_update(1, false);
        assert_eq!(controller.active_wan(), Some(2));
    }

    #[test]
    fn failback_is_dampened_within_five_seconds() {
        let controller = FailoverController::new();
        controller.register_wan(1, 10);
        controller.register_wan(2, 20);

        controller.on_health_update(2, true);
        assert_eq!(controller.active_wan(), Some(2));

        controller.on_health_update(1, true);
        // Priority 1 just recovered but dampening blocks immediate failback.
        assert_eq!(controller.active_wan(), Some(2));
    }

    #[test]
    fn manual_pin_bypasses_dampening_but_requires_healthy_target() {
        let controller = FailoverController::new();
        controller.register_wan(1, 10);
        controller.register_wan(2, 20);
        controller.on_health_update(1, true);
        controller.on_health_update(2, true);

        assert_eq!(controller.force_failover_to(2), Ok(()));
        assert_eq!(controller.active_wan(), Some(2));

        controller.on_health_update(3, false); // unknown id, no-op
        assert_eq!(controller.force_failover_to(9), Err(Error::WanUnhealthy));
    }

    #[test]
    fn idempotent_repeated_health_updates_produce_one_transition() {
        let controller = FailoverController::new();
        controller.register_wan(1, 10);

        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = transitions.clone();
        controller.set_callback(Arc::new(move |_old, _new, _reason| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        for _ in 0..5 {
            controller.on_health_update(1, true);
        }
        assert_eq!(transitions.load(Ordering::Relaxed), 1);
    }
}

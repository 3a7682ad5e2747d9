//! Per-application policy: which WAN/mark/traffic-class a classified
//! flow should be steered through.

use parking_lot::RwLock;
use protocol::{Category, TrafficClass};

#[derive(Debug, Clone)]
pub struct Policy {
    pub name: String,
    pub protocol: Option<String>,
    pub category: Option<Category>,
    pub wan_id: Option<u8>,
    pub mark: u32,
    pub priority: u16,
    pub bandwidth_limit_bps: Option<u64>,
    pub traffic_class: TrafficClass,
    pub enabled: bool,
}

#[derive(Default)]
pub struct PolicyStore {
    policies: RwLock<Vec<Policy>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, policy: Policy) {
        self.policies.write().push(policy);
    }

    /// First enabled policy whose `protocol` matches exactly; failing
    /// that, the first enabled policy whose `category` matches; else
    /// `None`.
    pub fn get_policy_for_protocol(&self, protocol: &str, category: Category) -> Option<Policy> {
        let policies = self.policies.read();

        if let Some(p) = policies
            .iter()
            .find(|p| p.enabled && p.protocol.as_deref() == Some(protocol))
        {
            return Some(p.clone());
        }

        policies
            .iter()
            .find(|p| p.enabled && p.category == Some(category))
            .cloned()
    }
}

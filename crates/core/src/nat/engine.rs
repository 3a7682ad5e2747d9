//! Server-side NAT engine: per-session port-mapped address translation.
//!
//! `translate_inbound` keeps an inverse index keyed on
//! `(public_ip, public_port, proto)` so the data path is O(1) rather than
//! scanning every session's table.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::RwLock;
use protocol::L4Proto;
use rand::Rng;

use crate::error::{Error, Result};

const PORT_RANGE_START: u16 = 10_000;
const PORT_RANGE_END: u16 = 65_535;
const PORT_ALLOC_RETRIES: u32 = 16;
const DEFAULT_MAPPING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub proto: L4Proto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InverseKey {
    pub public_ip: Ipv4Addr,
    pub public_port: u16,
    pub proto: L4Proto,
}

#[derive(Debug, Clone)]
pub struct NatMapping {
    pub session_id: String,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub public_ip: Ipv4Addr,
    pub public_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub proto: L4Proto,
    pub created_at: Instant,
    pub last_used: Instant,
    pub bytes_forward: u64,
    pub bytes_reverse: u64,
    pub pkts_forward: u64,
    pub pkts_reverse: u64,
}

impl NatMapping {
    fn is_expired(&self, timeout: Duration) -> bool {
        self.last_used.elapsed() > timeout
    }
}

struct SessionTable {
    public_ip: Ipv4Addr,
    mappings: AHashMap<MappingKey, NatMapping>,
    used_ports: std::collections::HashSet<u16>,
}

/// Owns one session's mappings plus the cross-session inverse index used
/// by `translate_inbound`.
pub struct NatEngine {
    mapping_timeout: Duration,
    sessions: RwLock<AHashMap<String, SessionTable>>,
    inverse: RwLock<AHashMap<InverseKey, (String, MappingKey)>>,
}

impl NatEngine {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_MAPPING_TIMEOUT)
    }

    pub fn with_timeout(mapping_timeout: Duration) -> Self {
        Self {
            mapping_timeout,
            sessions: RwLock::new(AHashMap::new()),
            inverse: RwLock::new(AHashMap::new()),
        }
    }

    pub fn register_session(&self, session_id: &str, public_ip: Ipv4Addr) {
        self.sessions.write().insert(
            session_id.to_string(),
            SessionTable { public_ip, mappings: AHashMap::new(), used_ports: std::collections::HashSet::new() },
        );
    }

    /// Drops every mapping owned by `session_id`, releasing its public
    /// ports and scrubbing the inverse index.
    pub fn drop_session(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        let Some(table) = sessions.remove(session_id) else { return };

        let mut inverse = self.inverse.write();
        for key in table.mappings.keys() {
            let Some(mapping) = table.mappings.get(key) else { continue };
            inverse.remove(&InverseKey { public_ip: mapping.public_ip, public_port: mapping.public_port, proto: mapping.proto });
        }
    }

    /// Returns the existing mapping for `(src_ip, src_port, proto)` if
    /// present, else allocates a fresh random public port bound to
    /// `session_id`'s public IP.
    pub fn translate_outbound(
        &self,
        session_id: &str,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        proto: L4Proto,
    ) -> Result<NatMapping> {
        let key = MappingKey { src_ip, src_port, proto };

        let mut sessions = self.sessions.write();
        let table = sessions.get_mut(session_id).ok_or(Error::SessionNotFound)?;

        if let Some(existing) = table.mappings.get_mut(&key) {
            existing.last_used = Instant::now();
            return Ok(existing.clone());
        }

        let public_port = allocate_port(&table.used_ports)?;
        table.used_ports.insert(public_port);

        let now = Instant::now();
        let mapping = NatMapping {
            session_id: session_id.to_string(),
            src_ip,
            src_port,
            public_ip: table.public_ip,
            public_port,
            dst_ip,
            dst_port,
            proto,
            created_at: now,
            last_used: now,
            bytes_forward: 0,
            bytes_reverse: 0,
            pkts_forward: 0,
            pkts_reverse: 0,
        };

        table.mappings.insert(key, mapping.clone());
        self.inverse.write().insert(
            InverseKey { public_ip: mapping.public_ip, public_port, proto },
            (session_id.to_string(), key),
        );

        Ok(mapping)
    }

    /// O(1) lookup via the inverse index: `(public_ip, public_port, proto)
    /// -> (session_id, mapping_key)`.
    pub fn translate_inbound(&self, public_ip: Ipv4Addr, public_port: u16, proto: L4Proto) -> Result<(NatMapping, String)> {
        let inverse_key = InverseKey { public_ip, public_port, proto };
        let (session_id, mapping_key) = {
            let inverse = self.inverse.read();
            inverse.get(&inverse_key).cloned().ok_or(Error::NoMapping)?
        };

        let mut sessions = self.sessions.write();
        let table = sessions.get_mut(&session_id).ok_or(Error::NoMapping)?;
        let mapping = table.mappings.get_mut(&mapping_key).ok_or(Error::NoMapping)?;
        mapping.last_used = Instant::now();
        Ok((mapping.clone(), session_id))
    }

    pub fn record_forward(&self, session_id: &str, key: MappingKey, bytes: u64) {
        if let Some(table) = self.sessions.write().get_mut(session_id) {
            if let Some(mapping) = table.mappings.get_mut(&key) {
                mapping.bytes_forward += bytes;
                mapping.pkts_forward += 1;
                mapping.last_used = Instant::now();
            }
        }
    }

    /// Removes expired mappings (no traffic within `mapping_timeout`) and
    /// releases their ports. Intended to run every 30s.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        let mut sessions = self.sessions.write();
        let mut inverse = self.inverse.write();

        for table in sessions.values_mut() {
            let timeout = self.mapping_timeout;
            let expired: Vec<MappingKey> = table
                .mappings
                .iter()
                .filter(|(_, m)| m.is_expired(timeout))
                .map(|(k, _)| *k)
                .collect();

            for key in expired {
                if let Some(mapping) = table.mappings.remove(&key) {
                    table.used_ports.remove(&mapping.public_port);
                    inverse.remove(&InverseKey { public_ip: mapping.public_ip, public_port: mapping.public_port, proto: mapping.proto });
                    removed += 1;
                }
            }
        }

        removed
    }

    pub fn mapping_count(&self, session_id: &str) -> usize {
        self.sessions.read().get(session_id).map(|t| t.mappings.len()).unwrap_or(0)
    }
}

impl Default for NatEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn allocate_port(used: &std::collections::HashSet<u16>) -> Result<u16> {
    let mut rng = rand::rng();
    for _ in 0..PORT_ALLOC_RETRIES {
        let candidate = rng.random_range(PORT_RANGE_START..=PORT_RANGE_END);
        if !used.contains(&candidate) {
            return Ok(candidate);
        }
    }
    (PORT_RANGE_START..=PORT_RANGE_END)
        .find(|p| !used.contains(p))
        .ok_or(Error::NoPortsAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    #[test]
    fn outbound_then_inbound_round_trips_to_original_private_endpoint() {
        let engine = NatEngine::new();
        engine.register_session("sess-1", ip(203, 0, 113, 9));

        let mapping = engine
            .translate_outbound("sess-1", ip(192, 168, 1, 100), 5000, ip(8, 8, 8, 8), 53, L4Proto::Udp)
            .unwrap();

        let (inbound, session_id) = engine.translate_inbound(mapping.public_ip, mapping.public_port, L4Proto::Udp).unwrap();
        assert_eq!(session_id, "sess-1");
        assert_eq!(inbound.src_ip, ip(192, 168, 1, 100));
        assert_eq!(inbound.src_port, 5000);
    }

    #[test]
    fn destroying_session_releases_its_mapping() {
        let engine = NatEngine::new();
        engine.register_session("sess-1", ip(203, 0, 113, 9));
        let mapping = engine
            .translate_outbound("sess-1", ip(192, 168, 1, 100), 5000, ip(8, 8, 8, 8), 53, L4Proto::Udp)
            .unwrap();

        engine.drop_session("sess-1");

        assert_eq!(
            engine.translate_inbound(mapping.public_ip, mapping.public_port, L4Proto::Udp).unwrap_err(),
            Error::NoMapping
        );
    }

    #[test]
    fn repeated_outbound_for_same_tuple_reuses_mapping() {
        let engine = NatEngine::new();
        engine.register_session("sess-1", ip(203, 0, 113, 9));
        let a = engine
            .translate_outbound("sess-1", ip(192, 168, 1, 100), 5000, ip(8, 8, 8, 8), 53, L4Proto::Udp)
            .unwrap();
        let b = engine
            .translate_outbound("sess-1", ip(192, 168, 1, 100), 5000, ip(1, 1, 1, 1), 53, L4Proto::Udp)
            .unwrap();
        assert_eq!(a.public_port, b.public_port);
    }

    #[test]
    fn sweep_removes_stale_mappings_and_frees_the_inverse_index() {
        let engine = NatEngine::with_timeout(Duration::from_millis(1));
        engine.register_session("sess-1", ip(203, 0, 113, 9));
        let mapping = engine
            .translate_outbound("sess-1", ip(192, 168, 1, 100), 5000, ip(8, 8, 8, 8), 53, L4Proto::Udp)
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(engine.sweep(), 1);
        assert_eq!(
            engine.translate_inbound(mapping.public_ip, mapping.public_port, L4Proto::Udp).unwrap_err(),
            Error::NoMapping
        );
    }
}

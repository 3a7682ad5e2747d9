use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::kinds::L4Proto;

/// Canonical 5-tuple identifying a flow. Order-independence for
/// bidirectional lookup is not required; upload vs. download is tracked
/// by the caller at packet admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: L4Proto,
}

impl FlowKey {
    /// FNV-1a over `src_ip || dst_ip || src_port || dst_port || proto`,
    /// used by the `PerFlow` scheduling mode for its consistent-hash WAN
    /// assignment.
    pub fn fnv1a(&self) -> u64 {
        const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = OFFSET_BASIS;
        let mut feed = |bytes: &[u8]| {
            for &b in bytes {
                hash ^= b as u64;
                hash = hash.wrapping_mul(PRIME);
            }
        };

        match self.src_ip {
            IpAddr::V4(v4) => feed(&v4.octets()),
            IpAddr::V6(v6) => feed(&v6.octets()),
        }
        match self.dst_ip {
            IpAddr::V4(v4) => feed(&v4.octets()),
            IpAddr::V6(v6) => feed(&v6.octets()),
        }
        feed(&self.src_port.to_be_bytes());
        feed(&self.dst_port.to_be_bytes());
        feed(&[match self.proto {
            L4Proto::Tcp => 0u8,
            L4Proto::Udp => 1u8,
        }]);

        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_is_deterministic() {
        let key = FlowKey {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "93.184.216.34".parse().unwrap(),
            src_port: 51234,
            dst_port: 443,
            proto: L4Proto::Tcp,
        };

        assert_eq!(key.fnv1a(), key.fnv1a());
    }

    #[test]
    fn fnv1a_differs_on_port_change() {
        let mut key = FlowKey {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "93.184.216.34".parse().unwrap(),
            src_port: 51234,
            dst_port: 443,
            proto: L4Proto::Tcp,
        };

        let a = key.fnv1a();
        key.src_port += 1;
        assert_ne!(a, key.fnv1a());
    }
}

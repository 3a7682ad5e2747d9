//! STUN binding request/response (RFC 5389 subset), NAT-kind
//! classification, CGNAT scoring, hole punching, and relay framing.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use protocol::STUN_MAGIC_COOKIE;

use crate::error::{Error, Result};

const HEADER_LEN: usize = 20;
const TRANSACTION_ID_LEN: usize = 12;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_XOR_MAPPED_ADDRESS_RFC: u16 = 0x0020;
const ATTR_XOR_MAPPED_ADDRESS_LEGACY: u16 = 0x8020;
const ADDRESS_FAMILY_IPV4: u8 = 0x01;

const CHANGE_IP_BIT: u32 = 0x04;
const CHANGE_PORT_BIT: u32 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    BindingRequest,
    BindingResponse,
}

impl StunMessageType {
    fn tag(self) -> u16 {
        match self {
            Self::BindingRequest => 0x0001,
            Self::BindingResponse => 0x0101,
        }
    }

    fn from_tag(tag: u16) -> Option<Self> {
        Some(match tag {
            0x0001 => Self::BindingRequest,
            0x0101 => Self::BindingResponse,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunAttribute {
    MappedAddress(SocketAddrV4),
    XorMappedAddress(SocketAddrV4),
    ChangeRequest { change_ip: bool, change_port: bool },
}

impl StunAttribute {
    fn type_and_value(self, transaction_id: &[u8; TRANSACTION_ID_LEN]) -> (u16, BytesMut) {
        match self {
            Self::MappedAddress(addr) => (ATTR_MAPPED_ADDRESS, encode_address(addr)),
            Self::XorMappedAddress(addr) => (ATTR_XOR_MAPPED_ADDRESS_RFC, encode_xor_address(addr, transaction_id)),
            Self::ChangeRequest { change_ip, change_port } => {
                let mut flags = 0u32;
                if change_ip {
                    flags |= CHANGE_IP_BIT;
                }
                if change_port {
                    flags |= CHANGE_PORT_BIT;
                }
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(flags);
                (ATTR_CHANGE_REQUEST, buf)
            }
        }
    }
}

fn encode_address(addr: SocketAddrV4) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u8(0);
    buf.put_u8(ADDRESS_FAMILY_IPV4);
    buf.put_u16(addr.port());
    buf.put_u32((*addr.ip()).into());
    buf
}

fn decode_address(mut value: &[u8]) -> Option<SocketAddrV4> {
    if value.len() < 8 || value.get_u8() != 0 || value.get_u8() != ADDRESS_FAMILY_IPV4 {
        return None;
    }
    let port = value.get_u16();
    let ip = Ipv4Addr::from(value.get_u32());
    Some(SocketAddrV4::new(ip, port))
}

fn encode_xor_address(addr: SocketAddrV4, _transaction_id: &[u8; TRANSACTION_ID_LEN]) -> BytesMut {
    let xor_port = addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16;
    let xor_ip = u32::from(*addr.ip()) ^ STUN_MAGIC_COOKIE;
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u8(0);
    buf.put_u8(ADDRESS_FAMILY_IPV4);
    buf.put_u16(xor_port);
    buf.put_u32(xor_ip);
    buf
}

fn decode_xor_address(mut value: &[u8]) -> Option<SocketAddrV4> {
    if value.len() < 8 || value.get_u8() != 0 || value.get_u8() != ADDRESS_FAMILY_IPV4 {
        return None;
    }
    let port = value.get_u16() ^ (STUN_MAGIC_COOKIE >> 16) as u16;
    let ip = Ipv4Addr::from(value.get_u32() ^ STUN_MAGIC_COOKIE);
    Some(SocketAddrV4::new(ip, port))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub kind: StunMessageType,
    pub transaction_id: [u8; TRANSACTION_ID_LEN],
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    pub fn binding_request(transaction_id: [u8; TRANSACTION_ID_LEN]) -> Self {
        Self {
            kind: StunMessageType::BindingRequest,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn binding_response(transaction_id: [u8; TRANSACTION_ID_LEN], mapped: SocketAddrV4) -> Self {
        Self {
            kind: StunMessageType::BindingResponse,
            transaction_id,
            attributes: vec![StunAttribute::XorMappedAddress(mapped)],
        }
    }

    pub fn change_request(transaction_id: [u8; TRANSACTION_ID_LEN], change_ip: bool, change_port: bool) -> Self {
        Self {
            kind: StunMessageType::BindingRequest,
            transaction_id,
            attributes: vec![StunAttribute::ChangeRequest { change_ip, change_port }],
        }
    }

    pub fn mapped_address(&self) -> Option<SocketAddrV4> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::XorMappedAddress(addr) | StunAttribute::MappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        for attr in &self.attributes {
            let (attr_type, value) = attr.type_and_value(&self.transaction_id);
            let padded_len = value.len().div_ceil(4) * 4;
            body.put_u16(attr_type);
            body.put_u16(value.len() as u16);
            body.put_slice(&value);
            body.put_bytes(0, padded_len - value.len());
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        buf.put_u16(self.kind.tag());
        buf.put_u16(body.len() as u16);
        buf.put_u32(STUN_MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);
        buf.put_slice(&body);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::StunMalformed);
        }

        let type_tag = buf.get_u16();
        let kind = StunMessageType::from_tag(type_tag).ok_or(Error::StunMalformed)?;
        let body_len = buf.get_u16() as usize;

        let magic_cookie = buf.get_u32();
        if magic_cookie != STUN_MAGIC_COOKIE {
            return Err(Error::StunMalformed);
        }

        if buf.len() < TRANSACTION_ID_LEN + body_len {
            return Err(Error::StunMalformed);
        }

        let mut transaction_id = [0u8; TRANSACTION_ID_LEN];
        transaction_id.copy_from_slice(&buf[..TRANSACTION_ID_LEN]);
        buf.advance(TRANSACTION_ID_LEN);

        let mut body = &buf[..body_len];
        let mut attributes = Vec::new();
        while body.len() >= 4 {
            let attr_type = body.get_u16();
            let attr_len = body.get_u16() as usize;
            if body.len() < attr_len {
                break;
            }
            let value = &body[..attr_len];
            let padded = attr_len.div_ceil(4) * 4;

            match attr_type {
                ATTR_MAPPED_ADDRESS => {
                    if let Some(addr) = decode_address(value) {
                        attributes.push(StunAttribute::MappedAddress(addr));
                    }
                }
                ATTR_XOR_MAPPED_ADDRESS_RFC | ATTR_XOR_MAPPED_ADDRESS_LEGACY => {
                    if let Some(addr) = decode_xor_address(value) {
                        attributes.push(StunAttribute::XorMappedAddress(addr));
                    }
                }
                ATTR_CHANGE_REQUEST => {
                    if value.len() >= 4 {
                        let flags = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                        attributes.push(StunAttribute::ChangeRequest {
                            change_ip: flags & CHANGE_IP_BIT != 0,
                            change_port: flags & CHANGE_PORT_BIT != 0,
                        });
                    }
                }
                _ => {}
            }

            if body.len() < padded {
                break;
            }
            body.advance(padded);
        }

        Ok(Self { kind, transaction_id, attributes })
    }
}

/// Closed set of NAT behaviours this coordinator can classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatKind {
    Unknown,
    Open,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
    Blocked,
}

/// `100.64.0.0/10`, RFC 6598 shared address space reserved for CGNAT.
pub fn is_cgnat_range(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000
}

/// Returns `(confirmed_cgnat, score)`. `confirmed_cgnat` is true only for
/// addresses in `100.64.0.0/10`, per invariant 10, and always carries
/// score `1.0`. Otherwise the score is a heuristic sum of indicators,
/// each contributing independently.
pub fn cgnat_score(local_ip: Ipv4Addr, local_port: u16, public_port: u16) -> (bool, f64) {
    if is_cgnat_range(local_ip) {
        return (true, 1.0);
    }

    let mut score = 0.0;
    if public_port > 40_000 {
        score += 0.3;
    }
    if (public_port as i64 - local_port as i64).unsigned_abs() > 10_000 {
        score += 0.2;
    }
    (false, score)
}

pub fn shared_ip_likely(score: f64) -> bool {
    score > 0.3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct,
    HolePunch,
    Relay,
}

/// Both peers directly reachable -> `Direct`. Either peer forces or needs
/// a relay (CGNAT with `force_relay`, or no relay available while one is
/// needed) -> `Relay`, otherwise -> `HolePunch`.
pub fn select_strategy(local: NatKind, remote: NatKind, force_relay: bool, relay_available: bool) -> Strategy {
    let both_open = local == NatKind::Open && remote == NatKind::Open;
    if both_open && !force_relay {
        return Strategy::Direct;
    }

    let needs_relay = force_relay || local == NatKind::Symmetric && remote == NatKind::Symmetric;
    if needs_relay {
        if relay_available {
            return Strategy::Relay;
        }
        return Strategy::HolePunch;
    }

    Strategy::HolePunch
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchState {
    Idle,
    Punching,
    SimPunching,
    Established,
    Failed,
}

const SIM_PUNCH_BURST_WINDOW: Duration = Duration::from_secs(2);
const SIM_PUNCH_BURST_INTERVAL: Duration = Duration::from_millis(100);
const KEEPALIVE_FLOOR: Duration = Duration::from_secs(5);
const KEEPALIVE_CAP: Duration = Duration::from_secs(60);
const KEEPALIVE_ADJUST_COOLDOWN: Duration = Duration::from_secs(5 * 60);

pub struct HolePuncher {
    pub state: PunchState,
    retry_interval: Duration,
    max_attempts: u32,
    attempts: u32,
    started_at: Instant,
    keepalive_interval: Duration,
    consecutive_keepalive_successes: u32,
    last_keepalive_adjustment: Instant,
}

impl HolePuncher {
    pub fn new(retry_interval: Duration, max_attempts: u32) -> Self {
        let now = Instant::now();
        Self {
            state: PunchState::Idle,
            retry_interval,
            max_attempts,
            attempts: 0,
            started_at: now,
            keepalive_interval: KEEPALIVE_FLOOR,
            consecutive_keepalive_successes: 0,
            last_keepalive_adjustment: now,
        }
    }

    pub fn begin(&mut self, simultaneous: bool) {
        self.state = if simultaneous { PunchState::SimPunching } else { PunchState::Punching };
        self.attempts = 0;
        self.started_at = Instant::now();
    }

    /// Interval to wait before the next punch packet, honoring the
    /// sim-punch fast burst for the first 2 s.
    pub fn next_interval(&self) -> Duration {
        if self.state == PunchState::SimPunching && self.started_at.elapsed() < SIM_PUNCH_BURST_WINDOW {
            SIM_PUNCH_BURST_INTERVAL
        } else {
            self.retry_interval
        }
    }

    /// Records one punch attempt; transitions to `Failed` once
    /// `max_attempts` is exhausted without a reply.
    pub fn record_attempt(&mut self) -> Result<()> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            self.state = PunchState::Failed;
            return Err(Error::HolePunchFailed);
        }
        Ok(())
    }

    pub fn confirm(&mut self) {
        self.state = PunchState::Established;
    }

    /// Adapts the keepalive interval: grows by 1.5x (capped at 60s) after
    /// 10 consecutive successes spaced at least 5 minutes since the last
    /// adjustment; any failure halves it down to a 5s floor immediately.
    pub fn record_keepalive(&mut self, success: bool) -> Duration {
        if success {
            self.consecutive_keepalive_successes += 1;
            if self.consecutive_keepalive_successes >= 10
                && self.last_keepalive_adjustment.elapsed() >= KEEPALIVE_ADJUST_COOLDOWN
            {
                self.keepalive_interval = (self.keepalive_interval.mul_f64(1.5)).min(KEEPALIVE_CAP);
                self.last_keepalive_adjustment = Instant::now();
                self.consecutive_keepalive_successes = 0;
            }
        } else {
            self.consecutive_keepalive_successes = 0;
            self.keepalive_interval = (self.keepalive_interval / 2).max(KEEPALIVE_FLOOR);
            self.last_keepalive_adjustment = Instant::now();
        }
        self.keepalive_interval
    }

    pub fn punch_targets(base_port: u16, peer_is_symmetric: bool) -> Vec<u16> {
        if !peer_is_symmetric {
            return vec![base_port];
        }
        (base_port.saturating_sub(5)..=base_port.saturating_add(5)).collect()
    }
}

/// `RELAY:<verb>[:<args>]` ASCII framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Alloc,
    Allocated(String),
    Connect { from: String, to: String },
    ConnOk { from: String, to: String },
    Data { from: String, to: String, payload: Vec<u8> },
    Disconnect(String),
    Keepalive(String),
    Ping(String),
    Pong(String),
}

impl RelayMessage {
    pub fn encode(&self) -> String {
        match self {
            Self::Alloc => "RELAY:ALLOC".to_string(),
            Self::Allocated(id) => format!("RELAY:ALLOC:{id}"),
            Self::Connect { from, to } => format!("RELAY:CONNECT:{from}:{to}"),
            Self::ConnOk { from, to } => format!("RELAY:CONNOK:{from}:{to}"),
            Self::Data { from, to, payload } => {
                format!("RELAY:DATA:{from}:{to}:{}", base64::Engine::encode(&base64::engine::general_purpose::STANDARD, payload))
            }
            Self::Disconnect(id) => format!("RELAY:DISCONNECT:{id}"),
            Self::Keepalive(id) => format!("RELAY:KEEPALIVE:{id}"),
            Self::Ping(id) => format!("RELAY:PING:{id}"),
            Self::Pong(id) => format!("RELAY:PONG:{id}"),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(5, ':');
        if parts.next()? != "RELAY" {
            return None;
        }
        let verb = parts.next()?;
        match verb {
            "ALLOC" => match parts.next() {
                Some(id) => Some(Self::Allocated(id.to_string())),
                None => Some(Self::Alloc),
            },
            "CONNECT" => Some(Self::Connect { from: parts.next()?.to_string(), to: parts.next()?.to_string() }),
            "CONNOK" => Some(Self::ConnOk { from: parts.next()?.to_string(), to: parts.next()?.to_string() }),
            "DATA" => {
                let from = parts.next()?.to_string();
                let to = parts.next()?.to_string();
                let encoded = parts.next()?;
                let payload = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded).ok()?;
                Some(Self::Data { from, to, payload })
            }
            "DISCONNECT" => Some(Self::Disconnect(parts.next()?.to_string())),
            "KEEPALIVE" => Some(Self::Keepalive(parts.next()?.to_string())),
            "PING" => Some(Self::Ping(parts.next()?.to_string())),
            "PONG" => Some(Self::Pong(parts.next()?.to_string())),
            _ => None,
        }
    }
}

/// Rolling bytes/sec cap over 1 s buckets, used by relay clients.
pub struct BandwidthLimiter {
    max_bytes_per_sec: u64,
    bucket_start: Instant,
    bucket_bytes: u64,
}

impl BandwidthLimiter {
    pub fn new(max_bytes_per_sec: u64) -> Self {
        Self { max_bytes_per_sec, bucket_start: Instant::now(), bucket_bytes: 0 }
    }

    pub fn allow(&mut self, bytes: u64) -> bool {
        if self.bucket_start.elapsed() >= Duration::from_secs(1) {
            self.bucket_start = Instant::now();
            self.bucket_bytes = 0;
        }
        if self.bucket_bytes + bytes > self.max_bytes_per_sec {
            return false;
        }
        self.bucket_bytes += bytes;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stun_binding_request_round_trips() {
        let request = StunMessage::binding_request([7u8; TRANSACTION_ID_LEN]);
        let encoded = request.encode();
        let decoded = StunMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn stun_binding_response_carries_xor_mapped_address() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 5), 54321);
        let response = StunMessage::binding_response([1u8; TRANSACTION_ID_LEN], addr);
        let encoded = response.encode();
        let decoded = StunMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.mapped_address(), Some(addr));
    }

    #[test]
    fn rejects_wrong_magic_cookie() {
        let request = StunMessage::binding_request([0u8; TRANSACTION_ID_LEN]);
        let mut encoded = request.encode();
        encoded[4] = 0xFF;
        assert_eq!(StunMessage::decode(&encoded).unwrap_err(), Error::StunMalformed);
    }

    #[test]
    fn cgnat_range_always_confirmed_with_full_confidence() {
        let (confirmed, score) = cgnat_score(Ipv4Addr::new(100, 64, 3, 9), 5000, 5000);
        assert!(confirmed);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn cgnat_score_accumulates_indicators() {
        let (confirmed, score) = cgnat_score(Ipv4Addr::new(192, 168, 1, 1), 1000, 45_000);
        assert!(!confirmed);
        assert!((score - 0.5).abs() < 1e-9);
        assert!(shared_ip_likely(score));
    }

    #[test]
    fn strategy_prefers_direct_when_both_open() {
        assert_eq!(select_strategy(NatKind::Open, NatKind::Open, false, true), Strategy::Direct);
    }

    #[test]
    fn strategy_falls_back_to_hole_punch_without_relay() {
        assert_eq!(select_strategy(NatKind::Symmetric, NatKind::Symmetric, false, false), Strategy::HolePunch);
    }

    #[test]
    fn hole_puncher_fails_after_max_attempts() {
        let mut puncher = HolePuncher::new(Duration::from_millis(500), 3);
        puncher.begin(false);
        assert!(puncher.record_attempt().is_ok());
        assert!(puncher.record_attempt().is_ok());
        assert_eq!(puncher.record_attempt().unwrap_err(), Error::HolePunchFailed);
        assert_eq!(puncher.state, PunchState::Failed);
    }

    #[test]
    fn keepalive_halves_on_failure_and_floors_at_five_seconds() {
        let mut puncher = HolePuncher::new(Duration::from_millis(500), 5);
        let interval = puncher.record_keepalive(false);
        assert_eq!(interval, KEEPALIVE_FLOOR);
    }

    #[test]
    fn relay_message_round_trips() {
        let msg = RelayMessage::Data { from: "a".to_string(), to: "b".to_string(), payload: vec![1, 2, 3] };
        let encoded = msg.encode();
        assert_eq!(RelayMessage::parse(&encoded), Some(msg));
    }

    #[test]
    fn bandwidth_limiter_rejects_over_cap_within_bucket() {
        let mut limiter = BandwidthLimiter::new(100);
        assert!(limiter.allow(60));
        assert!(!limiter.allow(60));
    }
}

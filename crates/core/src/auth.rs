//! Authentication: PSK / HMAC token / certificate and mutual-TLS
//! verification, session lifetime, a fixed-window rate limiter, and
//! peer/IP authorization.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Psk,
    Token,
    Certificate,
    MutualTls,
}

/// `base64url(payload_json).base64url(signature)`, signature =
/// `HMAC-SHA256(payload, token_secret)`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TokenPayload {
    pub id: String,
    pub peer_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

pub fn issue_token(payload: &TokenPayload, secret: &[u8]) -> String {
    let payload_json = serde_json::to_vec(payload).expect("TokenPayload always serializes");
    let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload_json.as_slice());
    let signature_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{payload_b64}.{signature_b64}")
}

pub fn verify_token(token: &str, secret: &[u8], now_unix: i64) -> Result<TokenPayload> {
    let (payload_b64, signature_b64) = token.split_once('.').ok_or(Error::InvalidToken)?;

    let payload_json = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| Error::InvalidToken)?;
    let signature = URL_SAFE_NO_PAD.decode(signature_b64).map_err(|_| Error::InvalidToken)?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&payload_json);
    mac.verify_slice(&signature).map_err(|_| Error::InvalidToken)?;

    let payload: TokenPayload = serde_json::from_slice(&payload_json).map_err(|_| Error::InvalidToken)?;
    if now_unix >= payload.expires_at {
        return Err(Error::ExpiredToken);
    }

    Ok(payload)
}

/// Constant-time comparison, used for PSK and for the decoded token
/// signature via `hmac::Mac::verify_slice`.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// A certificate entry held in the trust store: the authoritative
/// validity window and the peer id it is bound to. Keyed by `cert_id`
/// in `TrustStore`.
#[derive(Debug, Clone)]
pub struct TrustedCertificate {
    pub cert_id: String,
    pub peer_id: String,
    pub not_before: i64,
    pub not_after: i64,
}

/// What a connecting peer presents for `Certificate`/`MutualTls` auth:
/// just the id of a certificate it claims to hold. The trust store
/// carries the actual validity window, so a presented id can't forge
/// an extended lifetime for itself.
#[derive(Debug, Clone)]
pub struct PresentedCertificate {
    pub cert_id: String,
    pub peer_id: String,
}

/// Certificates trusted by this gateway, keyed by certificate id.
#[derive(Default)]
pub struct TrustStore {
    certs: RwLock<AHashMap<String, TrustedCertificate>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trust(&self, cert: TrustedCertificate) {
        self.certs.write().insert(cert.cert_id.clone(), cert);
    }

    pub fn revoke(&self, cert_id: &str) -> bool {
        self.certs.write().remove(cert_id).is_some()
    }

    /// Verifies a presented certificate: its id must be in the trust
    /// store, bound to the same peer id, and `now_unix` must fall
    /// within its `[not_before, not_after)` window. Used for both
    /// `Certificate` and `MutualTls` auth — the latter additionally
    /// requires the transport layer to have completed a mutual
    /// handshake before this check runs.
    pub fn verify(&self, presented: &PresentedCertificate, now_unix: i64) -> Result<()> {
        let certs = self.certs.read();
        let cert = certs.get(&presented.cert_id).ok_or(Error::CertificateUntrusted)?;
        if cert.peer_id != presented.peer_id {
            return Err(Error::CertificateUntrusted);
        }
        if now_unix < cert.not_before || now_unix >= cert.not_after {
            return Err(Error::CertificateExpired);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub peer_id: String,
    pub method: AuthMethod,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub last_access: Instant,
    pub attributes: AHashMap<String, String>,
}

impl Session {
    fn new(id: String, peer_id: String, method: AuthMethod, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer_id,
            method,
            created_at: now,
            expires_at: now + ttl,
            last_access: now,
            attributes: AHashMap::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

pub struct SessionStore {
    sessions: RwLock<AHashMap<String, Session>>,
    ttl: Duration,
    next_id: std::sync::atomic::AtomicU64,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(AHashMap::new()),
            ttl,
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn create(&self, peer_id: &str, method: AuthMethod) -> Session {
        let id = format!(
            "sess-{}",
            self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        );
        let session = Session::new(id, peer_id.to_string(), method, self.ttl);
        self.sessions.write().insert(session.id.clone(), session.clone());
        session
    }

    pub fn touch(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(id)?;
        session.last_access = Instant::now();
        Some(session.clone())
    }

    pub fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired());
        before - sessions.len()
    }
}

/// Fixed-window counter per client IP: `max_rate` positive `allow()`
/// results per `window`.
pub struct RateLimiter {
    max_rate: u32,
    window: Duration,
    windows: RwLock<AHashMap<IpAddr, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(max_rate: u32, window: Duration) -> Self {
        Self {
            max_rate,
            window,
            windows: RwLock::new(AHashMap::new()),
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        let mut windows = self.windows.write();
        let now = Instant::now();

        let entry = windows.entry(ip).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }

        if entry.1 < self.max_rate {
            entry.1 += 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SecurityPolicy {
    pub id: String,
    pub allowed_peers: Vec<String>,
    pub denied_peers: Vec<String>,
    pub allowed_ips: Vec<ipnet_shim::CidrBlock>,
    pub denied_ips: Vec<ipnet_shim::CidrBlock>,
    pub require_encryption: bool,
    pub require_auth: bool,
}

impl SecurityPolicy {
    pub fn check_access(&self, peer: &str, ip: IpAddr) -> bool {
        if self.denied_peers.iter().any(|p| p == peer) {
            return false;
        }
        if self.denied_ips.iter().any(|cidr| cidr.contains(ip)) {
            return false;
        }
        if !self.allowed_peers.is_empty() && !self.allowed_peers.iter().any(|p| p == peer) {
            return false;
        }
        if !self.allowed_ips.is_empty() && !self.allowed_ips.iter().any(|cidr| cidr.contains(ip)) {
            return false;
        }
        true
    }
}

/// A tiny hand-rolled CIDR matcher; kept local rather than pulling in a
/// dedicated crate since the gateway only ever needs containment checks
/// against IPv4/IPv6 prefixes configured by the operator.
pub mod ipnet_shim {
    use std::net::IpAddr;

    #[derive(Debug, Clone, Copy)]
    pub struct CidrBlock {
        pub network: IpAddr,
        pub prefix_len: u8,
    }

    impl CidrBlock {
        pub fn new(network: IpAddr, prefix_len: u8) -> Self {
            Self { network, prefix_len }
        }

        pub fn contains(&self, ip: IpAddr) -> bool {
            match (self.network, ip) {
                (IpAddr::V4(net), IpAddr::V4(addr)) => {
                    let mask = u32::MAX.checked_shl(32 - self.prefix_len as u32).unwrap_or(0);
                    (u32::from(net) & mask) == (u32::from(addr) & mask)
                }
                (IpAddr::V6(net), IpAddr::V6(addr)) => {
                    let mask = u128::MAX.checked_shl(128 - self.prefix_len as u32).unwrap_or(0);
                    (u128::from(net) & mask) == (u128::from(addr) & mask)
                }
                _ => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips() {
        let secret = b"topsecret";
        let payload = TokenPayload {
            id: "t1".to_string(),
            peer_id: "peer-a".to_string(),
            issued_at: 1000,
            expires_at: 2000,
        };
        let token = issue_token(&payload, secret);
        let verified = verify_token(&token, secret, 1500).unwrap();
        assert_eq!(verified.peer_id, "peer-a");
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = b"topsecret";
        let payload = TokenPayload {
            id: "t1".to_string(),
            peer_id: "peer-a".to_string(),
            issued_at: 1000,
            expires_at: 2000,
        };
        let token = issue_token(&payload, secret);
        assert_eq!(verify_token(&token, secret, 3000).unwrap_err(), Error::ExpiredToken);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let secret = b"topsecret";
        let payload = TokenPayload {
            id: "t1".to_string(),
            peer_id: "peer-a".to_string(),
            issued_at: 1000,
            expires_at: 2000,
        };
        let mut token = issue_token(&payload, secret);
        token.push('x');
        assert_eq!(verify_token(&token, secret, 1500).unwrap_err(), Error::InvalidToken);
    }

    #[test]
    fn rate_limiter_allows_exactly_max_rate_per_window() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        let allowed = (0..10).filter(|_| limiter.allow(ip)).count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn trust_store_accepts_a_cert_within_its_validity_window() {
        let store = TrustStore::new();
        store.trust(TrustedCertificate {
            cert_id: "cert-1".to_string(),
            peer_id: "peer-a".to_string(),
            not_before: 1000,
            not_after: 2000,
        });

        let presented = PresentedCertificate { cert_id: "cert-1".to_string(), peer_id: "peer-a".to_string() };
        assert!(store.verify(&presented, 1500).is_ok());
    }

    #[test]
    fn trust_store_rejects_an_expired_cert() {
        let store = TrustStore::new();
        store.trust(TrustedCertificate {
            cert_id: "cert-1".to_string(),
            peer_id: "peer-a".to_string(),
            not_before: 1000,
            not_after: 2000,
        });

        let presented = PresentedCertificate { cert_id: "cert-1".to_string(), peer_id: "peer-a".to_string() };
        assert_eq!(store.verify(&presented, 2000).unwrap_err(), Error::CertificateExpired);
        assert_eq!(store.verify(&presented, 500).unwrap_err(), Error::CertificateExpired);
    }

    #[test]
    fn trust_store_rejects_a_cert_id_it_has_never_seen() {
        let store = TrustStore::new();
        let presented = PresentedCertificate { cert_id: "unknown".to_string(), peer_id: "peer-a".to_string() };
        assert_eq!(store.verify(&presented, 1500).unwrap_err(), Error::CertificateUntrusted);
    }

    #[test]
    fn trust_store_rejects_a_cert_bound_to_a_different_peer() {
        let store = TrustStore::new();
        store.trust(TrustedCertificate {
            cert_id: "cert-1".to_string(),
            peer_id: "peer-a".to_string(),
            not_before: 1000,
            not_after: 2000,
        });

        let presented = PresentedCertificate { cert_id: "cert-1".to_string(), peer_id: "someone-else".to_string() };
        assert_eq!(store.verify(&presented, 1500).unwrap_err(), Error::CertificateUntrusted);
    }

    #[test]
    fn revoking_a_cert_removes_it_from_the_trust_store() {
        let store = TrustStore::new();
        store.trust(TrustedCertificate {
            cert_id: "cert-1".to_string(),
            peer_id: "peer-a".to_string(),
            not_before: 1000,
            not_after: 2000,
        });
        assert!(store.revoke("cert-1"));

        let presented = PresentedCertificate { cert_id: "cert-1".to_string(), peer_id: "peer-a".to_string() };
        assert_eq!(store.verify(&presented, 1500).unwrap_err(), Error::CertificateUntrusted);
    }

    #[test]
    fn security_policy_denies_listed_peer() {
        let policy = SecurityPolicy {
            id: "p1".to_string(),
            denied_peers: vec!["bad-peer".to_string()],
            ..Default::default()
        };
        assert!(!policy.check_access("bad-peer", "1.2.3.4".parse().unwrap()));
        assert!(policy.check_access("good-peer", "1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn security_policy_allow_list_is_exclusive() {
        let policy = SecurityPolicy {
            id: "p1".to_string(),
            allowed_peers: vec!["only-this".to_string()],
            ..Default::default()
        };
        assert!(policy.check_access("only-this", "1.2.3.4".parse().unwrap()));
        assert!(!policy.check_access("someone-else", "1.2.3.4".parse().unwrap()));
    }
}

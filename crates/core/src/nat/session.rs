//! Server-side session manager: public-IP pool allocation, session
//! lifecycle, and bandwidth/quota accounting.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::RwLock;
use protocol::LinkKind;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Idle,
    Suspended,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bandwidth_up_bps: u64,
    pub bandwidth_down_bps: u64,
    pub daily_quota_bytes: u64,
    pub monthly_quota_bytes: u64,
    pub idle_timeout: Duration,
    pub session_timeout: Option<Duration>,
    pub allowed_wans: Vec<u8>,
    pub priority: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bandwidth_up_bps: u64::MAX,
            bandwidth_down_bps: u64::MAX,
            daily_quota_bytes: u64::MAX,
            monthly_quota_bytes: u64::MAX,
            idle_timeout: Duration::from_secs(5 * 60),
            session_timeout: None,
            allowed_wans: Vec::new(),
            priority: 100,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WanCounter {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone)]
pub struct ServerSession {
    pub id: String,
    pub client_id: String,
    pub remote_addr: SocketAddr,
    pub public_ip: Ipv4Addr,
    pub state: SessionState,
    pub config: SessionConfig,
    pub started_at: Instant,
    pub last_seen: Instant,
    pub bytes_today: u64,
    pub bytes_this_month: u64,
    pub per_wan: AHashMap<u8, WanCounter>,
}

impl ServerSession {
    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Active && self.last_seen.elapsed() > self.config.idle_timeout
    }

    pub fn record_traffic(&mut self, wan_id: u8, link: LinkKind, bytes_sent: u64, bytes_received: u64) {
        let _ = link;
        self.last_seen = Instant::now();
        if self.state == SessionState::Authenticated || self.state == SessionState::Idle {
            self.state = SessionState::Active;
        }
        let counter = self.per_wan.entry(wan_id).or_default();
        counter.bytes_sent += bytes_sent;
        counter.bytes_received += bytes_received;
        self.bytes_today += bytes_sent + bytes_received;
        self.bytes_this_month += bytes_sent + bytes_received;
    }

    pub fn over_quota(&self) -> bool {
        self.bytes_today > self.config.daily_quota_bytes || self.bytes_this_month > self.config.monthly_quota_bytes
    }
}

struct PublicIpPool {
    free: VecDeque<Ipv4Addr>,
    allocated: std::collections::HashSet<Ipv4Addr>,
    pool_size: usize,
}

impl PublicIpPool {
    fn new(start: Ipv4Addr, size: usize) -> Self {
        let base = u32::from(start);
        let free = (0..size as u32).map(|offset| Ipv4Addr::from(base + offset)).collect();
        Self { free, allocated: std::collections::HashSet::new(), pool_size: size }
    }

    fn allocate(&mut self) -> Option<Ipv4Addr> {
        let ip = self.free.pop_front()?;
        self.allocated.insert(ip);
        Some(ip)
    }

    fn release(&mut self, ip: Ipv4Addr) {
        if self.allocated.remove(&ip) {
            self.free.push_back(ip);
        }
    }

    fn conserves_pool(&self) -> bool {
        self.free.len() + self.allocated.len() == self.pool_size
    }
}

pub struct SessionManager {
    max_clients: usize,
    max_clients_per_ip: usize,
    max_sessions_per_client: usize,
    pool: RwLock<PublicIpPool>,
    sessions: RwLock<AHashMap<String, ServerSession>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl SessionManager {
    pub fn new(
        pool_start: Ipv4Addr,
        pool_size: usize,
        max_clients: usize,
        max_clients_per_ip: usize,
        max_sessions_per_client: usize,
    ) -> Self {
        Self {
            max_clients,
            max_clients_per_ip,
            max_sessions_per_client,
            pool: RwLock::new(PublicIpPool::new(pool_start, pool_size)),
            sessions: RwLock::new(AHashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn create_session(&self, client_id: &str, remote_addr: SocketAddr, config: SessionConfig) -> Result<ServerSession> {
        let mut sessions = self.sessions.write();

        if sessions.len() >= self.max_clients {
            return Err(Error::SessionLimitReached);
        }

        let per_client = sessions.values().filter(|s| s.client_id == client_id).count();
        if per_client >= self.max_sessions_per_client {
            return Err(Error::SessionLimitReached);
        }

        let per_ip = sessions.values().filter(|s| s.remote_addr.ip() == remote_addr.ip()).count();
        if per_ip >= self.max_clients_per_ip {
            return Err(Error::SessionLimitReached);
        }

        let public_ip = self.pool.write().allocate().ok_or(Error::SessionLimitReached)?;

        let id = format!("sess-{}", self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        let now = Instant::now();
        let session = ServerSession {
            id: id.clone(),
            client_id: client_id.to_string(),
            remote_addr,
            public_ip,
            state: SessionState::Authenticated,
            config,
            started_at: now,
            last_seen: now,
            bytes_today: 0,
            bytes_this_month: 0,
            per_wan: AHashMap::new(),
        };

        sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Releases the session's public IP back to the pool and removes it.
    /// Callers are responsible for also calling `NatEngine::drop_session`.
    pub fn remove_session(&self, session_id: &str) -> Option<ServerSession> {
        let session = self.sessions.write().remove(session_id)?;
        self.pool.write().release(session.public_ip);
        Some(session)
    }

    pub fn get(&self, session_id: &str) -> Option<ServerSession> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn touch(&self, session_id: &str, wan_id: u8, link: LinkKind, bytes_sent: u64, bytes_received: u64) -> Option<ServerSession> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(session_id)?;
        session.record_traffic(wan_id, link, bytes_sent, bytes_received);
        Some(session.clone())
    }

    /// Demotes sessions idle past `idle_timeout` to `Idle`. Does not
    /// remove them; removal is an explicit `remove_session` call.
    pub fn sweep_idle(&self) -> usize {
        let mut sessions = self.sessions.write();
        let mut demoted = 0;
        for session in sessions.values_mut() {
            if session.is_idle() {
                session.state = SessionState::Idle;
                demoted += 1;
            }
        }
        demoted
    }

    pub fn pool_conserves(&self) -> bool {
        self.pool.read().conserves_pool()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("192.168.1.100:{port}").parse().unwrap()
    }

    #[test]
    fn create_then_remove_session_conserves_the_public_ip_pool() {
        let manager = SessionManager::new(Ipv4Addr::new(203, 0, 113, 0), 4, 10, 10, 10);
        let session = manager.create_session("client-a", addr(5000), SessionConfig::default()).unwrap();
        assert!(manager.pool_conserves());

        manager.remove_session(&session.id);
        assert!(manager.pool_conserves());
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn exhausted_pool_returns_session_limit_reached() {
        let manager = SessionManager::new(Ipv4Addr::new(203, 0, 113, 0), 1, 10, 10, 10);
        manager.create_session("client-a", addr(5000), SessionConfig::default()).unwrap();
        let second = manager.create_session("client-b", addr(5001), SessionConfig::default());
        assert_eq!(second.unwrap_err(), Error::SessionLimitReached);
    }

    #[test]
    fn session_becomes_active_on_first_traffic_then_idle_after_timeout() {
        let manager = SessionManager::new(Ipv4Addr::new(203, 0, 113, 0), 4, 10, 10, 10);
        let config = SessionConfig { idle_timeout: Duration::from_millis(1), ..Default::default() };
        let session = manager.create_session("client-a", addr(5000), config).unwrap();
        assert_eq!(session.state, SessionState::Authenticated);

        manager.touch(&session.id, 1, LinkKind::Fiber, 100, 0);
        assert_eq!(manager.get(&session.id).unwrap().state, SessionState::Active);

        std::thread::sleep(Duration::from_millis(5));
        manager.sweep_idle();
        assert_eq!(manager.get(&session.id).unwrap().state, SessionState::Idle);
    }

    #[test]
    fn quota_tracking_flags_sessions_over_their_daily_limit() {
        let manager = SessionManager::new(Ipv4Addr::new(203, 0, 113, 0), 4, 10, 10, 10);
        let config = SessionConfig { daily_quota_bytes: 100, ..Default::default() };
        let session = manager.create_session("client-a", addr(5000), config).unwrap();

        manager.touch(&session.id, 1, LinkKind::Fiber, 80, 80);
        let updated = manager.get(&session.id).unwrap();
        assert!(updated.over_quota());
    }
}

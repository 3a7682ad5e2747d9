//! Lifecycle events the server emits for an external `MgmtSurface` /
//! `TelemetrySink` to pick up — analogous to the teacher's RFC-cited
//! `Observer` hook, but for gateway-specific events rather than TURN
//! allocations.

use std::net::SocketAddr;

use gwcore::failover::FailoverReason;

#[derive(Debug, Clone)]
pub enum Event {
    SessionCreated { session_id: String, client_id: String, remote_addr: SocketAddr },
    SessionDestroyed { session_id: String },
    Failover { from_wan: Option<u8>, to_wan: u8, reason: FailoverReason },
    AuthFailure { remote_addr: SocketAddr },
    QuotaBreached { session_id: String, period: &'static str },
}

/// Receives lifecycle events. The default impl just logs; a real
/// deployment wires this to its `MgmtSurface`/`TelemetrySink`.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: Event);
}

pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn on_event(&self, event: Event) {
        match event {
            Event::SessionCreated { session_id, client_id, remote_addr } => {
                log::info!("session created: id={session_id}, client={client_id}, remote={remote_addr}");
            }
            Event::SessionDestroyed { session_id } => {
                log::info!("session destroyed: id={session_id}");
            }
            Event::Failover { from_wan, to_wan, reason } => {
                log::warn!("failover: from={from_wan:?}, to={to_wan}, reason={reason:?}");
            }
            Event::AuthFailure { remote_addr } => {
                log::warn!("auth failure: remote={remote_addr}");
            }
            Event::QuotaBreached { session_id, period } => {
                log::warn!("quota breached: session={session_id}, period={period}");
            }
        }
    }
}

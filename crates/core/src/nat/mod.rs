//! NAT traversal: STUN discovery and classification, hole punching, relay
//! fallback, and the server-side translation/session engine.

pub mod engine;
pub mod session;
pub mod traversal;

pub use engine::{NatEngine, NatMapping};
pub use session::{ServerSession, SessionConfig, SessionManager, SessionState};
pub use traversal::{
    HolePuncher, NatKind, PunchState, RelayMessage, Strategy, StunAttribute, StunMessage, StunMessageType,
    cgnat_score, select_strategy,
};

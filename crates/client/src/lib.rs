//! The companion client: one UDP socket per uplink dialing the server,
//! a STUN handshake per uplink to discover its own public mapping, and
//! a sequence-numbered encrypted send path reusing the same wire codec
//! and crypto the server speaks.

pub mod link;
pub mod session;

pub use link::{ClientLink, LinkConfig};
pub use session::ClientSession;

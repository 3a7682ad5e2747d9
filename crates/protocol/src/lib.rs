//! Wire-level protocol types shared by the wan-gateway server and client.
//!
//! This crate mirrors the role `turn-server-codec` plays for the TURN
//! server: it owns the on-the-wire layout and the small closed enums the
//! rest of the workspace builds policy on top of. It pulls in no async
//! runtime and no crypto so it can be depended on by both the gateway
//! core and the companion client without dragging either in.

pub mod envelope;
pub mod flow;
pub mod kinds;

pub use envelope::{Header, PacketError};
pub use flow::FlowKey;
pub use kinds::{Category, EncryptionKind, L4Proto, LinkKind, TrafficClass, WanState};

/// Current wire protocol version. Peers receiving any other value MUST
/// discard the packet.
pub const PROTOCOL_VERSION: u8 = 1;

/// STUN magic cookie, fixed by RFC 5389.
pub const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;

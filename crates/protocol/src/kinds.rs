use serde::{Deserialize, Serialize};

/// AEAD cipher carried on the wire in the packet header.
///
/// `None` means the payload is plaintext; peers MUST still reject an
/// encryption tag they don't recognise rather than guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionKind {
    None,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl EncryptionKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::None,
            1 => Self::Aes256Gcm,
            2 => Self::ChaCha20Poly1305,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Aes256Gcm => 1,
            Self::ChaCha20Poly1305 => 2,
        }
    }
}

/// Layer-4 protocol of a flow's 5-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum L4Proto {
    Tcp,
    Udp,
}

/// Physical/logical kind of a WAN member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkKind {
    Cable,
    Dsl,
    Fiber,
    Wireless,
    Cellular,
    Satellite,
    Other,
}

/// Liveness state of a WAN interface.
///
/// `Disabled` -> `Down` -> (consecutive successes) -> `Recovering` ->
/// (sustained) -> `Up`. Any probe failure beyond the configured
/// threshold demotes the interface straight back to `Down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WanState {
    Disabled,
    Down,
    Recovering,
    Up,
}

/// Closed set of traffic categories produced by the DPI classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Unknown,
    Web,
    Streaming,
    Social,
    Gaming,
    Communication,
    FileTransfer,
    Email,
    Vpn,
    System,
}

/// Closed set of scheduling priorities used by policy. Smaller numeric
/// value sorts first (higher priority); values double as fwmark-table
/// priority weights in `RoutingBackend` rule ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrafficClass {
    RealTime = 10,
    Interactive = 20,
    Streaming = 30,
    Default = 40,
    Bulk = 50,
    Background = 60,
}

impl TrafficClass {
    pub fn priority(self) -> u16 {
        self as u16
    }
}

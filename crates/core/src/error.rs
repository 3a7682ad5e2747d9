//! The closed set of error kinds produced by the gateway core.
//!
//! Data-path errors (`DecryptionFailed`, `ReplayDetected`,
//! `SignatureNoMatch`) are expected to be counted in metrics and the
//! packet dropped by the caller — they never unwind past the per-packet
//! handler. Session and control-plane errors propagate and are also
//! expected to be emitted as security/audit events by the caller.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    NoAvailableWan,
    WanUnhealthy,
    FlowTableFull,
    SignatureNoMatch,
    DecryptionFailed,
    ReplayDetected,
    InvalidKeySize,
    ExpiredKey,
    InvalidToken,
    ExpiredToken,
    CertificateUntrusted,
    CertificateExpired,
    AuthFailed,
    InvalidCredentials,
    RateLimitExceeded,
    Unauthorized,
    StunTimeout,
    StunMalformed,
    HolePunchFailed,
    RelayUnavailable,
    NoMapping,
    NoPortsAvailable,
    SessionLimitReached,
    SessionNotFound,
    SessionExpired,
    QuotaExceeded,
    TooFewShards,
    ShardSizeMismatch,
    Cancelled,
    Timeout,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

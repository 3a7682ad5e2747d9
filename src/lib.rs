//! The multi-WAN bonding gateway's root crate: configuration, the UDP
//! overlay runtime, and lifecycle events. The scheduling, crypto, DPI,
//! FEC, NAT and auth logic itself lives in `wan-gateway-core`.

pub mod config;
pub mod observer;
pub mod server;

pub use config::Config;
pub use server::Gateway;

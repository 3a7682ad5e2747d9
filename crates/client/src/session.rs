//! Aggregates every configured uplink into one session: STUN discovery
//! on connect, a shared outbound sequence counter, and AEAD framing
//! reused from the gateway core so the server decrypts with the exact
//! same code path it uses for any other peer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use gwcore::crypto::{KeyStore, SessionKey};
use protocol::{EncryptionKind, Header};

use crate::link::{ClientLink, Error as LinkError, LinkConfig, Result as LinkResult};

/// One overlay session against the server: a peer id (used to key the
/// server's `KeyStore` and NAT session table), a set of uplinks, and
/// the locally-owned encryption state.
pub struct ClientSession {
    peer_id: String,
    encryption: EncryptionKind,
    keys: Arc<KeyStore>,
    sequence: AtomicU64,
    links: Vec<ClientLink>,
    next_link: AtomicU64,
}

impl ClientSession {
    /// Binds every configured uplink and performs a STUN discovery pass
    /// on each so the caller can log or report the resulting public
    /// mappings before sending any traffic.
    pub async fn connect(
        peer_id: impl Into<String>,
        encryption: EncryptionKind,
        link_configs: Vec<LinkConfig>,
    ) -> LinkResult<Self> {
        let mut links = Vec::with_capacity(link_configs.len());
        for config in link_configs {
            let link = ClientLink::bind(config).await?;
            match link.discover_mapping().await {
                Ok(mapped) => log::info!("link {} mapped to {mapped}", link.config.link_id),
                Err(err) => log::warn!("link {} STUN discovery failed: {err}", link.config.link_id),
            }
            links.push(link);
        }

        if links.is_empty() {
            return Err(LinkError::Malformed);
        }

        Ok(Self {
            peer_id: peer_id.into(),
            encryption,
            keys: Arc::new(KeyStore::new()),
            sequence: AtomicU64::new(0),
            links,
            next_link: AtomicU64::new(0),
        })
    }

    fn session_key(&self) -> SessionKey {
        self.keys.get_or_create_session_key(&self.peer_id)
    }

    fn pick_link(&self) -> &ClientLink {
        let idx = self.next_link.fetch_add(1, Ordering::Relaxed) as usize % self.links.len();
        &self.links[idx]
    }

    /// Encrypts `payload`, wraps it in a wire header, and round-robins
    /// it across the bound uplinks. Round-robin here is a simple local
    /// default; the server's own scheduler governs return traffic.
    pub async fn send(&self, payload: &[u8]) -> LinkResult<()> {
        let key = self.session_key();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        let ciphertext = gwcore::crypto::encrypt(&key, self.encryption, sequence, payload)
            .map_err(LinkError::from)?;

        let timestamp_ns = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i64;

        let header = Header::new(self.encryption, sequence, timestamp_ns, Bytes::from(self.peer_id.clone().into_bytes()));
        let framed = header.encode(&ciphertext).map_err(|_| LinkError::Malformed)?;

        self.pick_link().send(&framed).await
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn send_round_robins_across_every_bound_link() {
        let server_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let configs = vec![
            LinkConfig {
                link_id: 1,
                bind: "127.0.0.1:0".parse().unwrap(),
                server: server_a.local_addr().unwrap(),
                stun_timeout: std::time::Duration::from_millis(50),
            },
            LinkConfig {
                link_id: 2,
                bind: "127.0.0.1:0".parse().unwrap(),
                server: server_b.local_addr().unwrap(),
                stun_timeout: std::time::Duration::from_millis(50),
            },
        ];

        let session = ClientSession::connect("peer-a", EncryptionKind::Aes256Gcm, configs).await.unwrap();
        assert_eq!(session.link_count(), 2);

        session.send(b"one").await.unwrap();
        session.send(b"two").await.unwrap();

        let mut buf = [0u8; 1500];
        let (n_a, _) = server_a.recv_from(&mut buf).await.unwrap();
        assert!(n_a > 0);

        let (n_b, _) = server_b.recv_from(&mut buf).await.unwrap();
        assert!(n_b > 0);
    }
}

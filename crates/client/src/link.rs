//! A single uplink: one UDP socket bound locally and dialed at the
//! server, plus the STUN exchange used to discover its public mapping.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use bytes::Bytes;
use gwcore::nat::traversal::{StunMessage, StunMessageType};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Timeout,
    Malformed,
    NoMappedAddress,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<gwcore::Error> for Error {
    fn from(_value: gwcore::Error) -> Self {
        Self::Malformed
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for one uplink: which local address to bind and which
/// server address to dial. `link_id` matches the server's configured
/// `Interface::id` so both sides agree which WAN a datagram travelled.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub link_id: u8,
    pub bind: SocketAddr,
    pub server: SocketAddr,
    pub stun_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            link_id: 0,
            bind: SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            server: SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 9100),
            stun_timeout: Duration::from_secs(3),
        }
    }
}

/// One uplink's live socket, dialed at the server and ready to carry
/// overlay traffic.
pub struct ClientLink {
    pub config: LinkConfig,
    socket: UdpSocket,
}

impl ClientLink {
    pub async fn bind(config: LinkConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind).await?;
        socket.connect(config.server).await?;
        Ok(Self { config, socket })
    }

    /// Sends a STUN binding request over this link's socket and awaits
    /// the response, returning the server's view of our public mapping.
    pub async fn discover_mapping(&self) -> Result<SocketAddrV4> {
        let mut transaction_id = [0u8; 12];
        rand::rng().fill(&mut transaction_id);

        let request = StunMessage::binding_request(transaction_id);
        self.socket.send(&request.encode()).await?;

        let mut buf = [0u8; 1500];
        let n = timeout(self.config.stun_timeout, self.socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Timeout)??;

        let response = StunMessage::decode(&buf[..n]).map_err(|_| Error::Malformed)?;
        if response.kind != StunMessageType::BindingResponse || response.transaction_id != transaction_id {
            return Err(Error::Malformed);
        }

        response.mapped_address().ok_or(Error::NoMappedAddress)
    }

    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        self.socket.send(payload).await?;
        Ok(())
    }

    pub async fn recv(&self, buf: &mut [u8]) -> Result<Bytes> {
        let n = self.socket.recv(buf).await?;
        Ok(Bytes::copy_from_slice(&buf[..n]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_connects_to_the_configured_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let config = LinkConfig {
            link_id: 1,
            bind: "127.0.0.1:0".parse().unwrap(),
            server: server_addr,
            stun_timeout: Duration::from_millis(200),
        };

        let link = ClientLink::bind(config).await.unwrap();
        link.send(b"hello").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, link.socket.local_addr().unwrap());
    }
}

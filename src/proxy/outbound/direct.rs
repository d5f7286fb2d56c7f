use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::common::{Address, BoxUdpTransport, ProxyStream, UdpPacket, UdpTransport};
use crate::proxy::outbound::TransportDialer;
use crate::proxy::{DialOptions, OutboundHandler, Session};

pub struct DirectOutbound {
    tag: String,
    dialer: TransportDialer,
}

impl DirectOutbound {
    pub fn with_dialer(tag: String, dialer: TransportDialer) -> Self {
        Self { tag, dialer }
    }
}

#[async_trait]
impl OutboundHandler for DirectOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn typ(&self) -> &str {
        "direct"
    }

    fn dependencies(&self) -> Vec<String> {
        self.dialer.detour_tag().map(String::from).into_iter().collect()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn supports_dial_override(&self) -> bool {
        true
    }

    async fn connect(&self, session: &Session, opts: &DialOptions) -> Result<ProxyStream> {
        debug!(target = %session.target, "direct connect");
        self.dialer.dial(&session.target, opts).await
    }

    async fn connect_udp(&self, session: &Session, _opts: &DialOptions) -> Result<BoxUdpTransport> {
        let resolved = session.target.resolve().await?;
        let bind = if resolved.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        Ok(Box::new(DirectUdpTransport { socket }))
    }
}

struct DirectUdpTransport {
    socket: UdpSocket,
}

#[async_trait]
impl UdpTransport for DirectUdpTransport {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        let addr = packet.addr.resolve().await?;
        self.socket.send_to(&packet.data, addr).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<UdpPacket> {
        let mut buf = vec![0u8; 65535];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok(UdpPacket {
            addr: Address::Ip(from),
            data: Bytes::from(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;
    use crate::proxy::outbound::{transport_dialer, BuildContext};
    use crate::proxy::Network;

    fn test_context() -> BuildContext {
        BuildContext {
            manager: Weak::new(),
            cache: None,
            history: std::sync::Arc::new(crate::proxy::group::history::HistoryStorage::new()),
            pause: crate::common::PauseManager::new(),
            detour_override: None,
        }
    }

    fn plain_direct(tag: &str) -> DirectOutbound {
        let ctx = test_context();
        DirectOutbound::with_dialer(
            tag.to_string(),
            transport_dialer(&ctx, &Default::default()),
        )
    }

    #[tokio::test]
    async fn connect_localhost() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let outbound = plain_direct("direct");
        let session = Session::tcp(Address::Ip(addr));
        let stream = outbound.connect(&session, &DialOptions::default()).await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn udp_roundtrip() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let outbound = plain_direct("direct");
        let mut session = Session::tcp(Address::Ip(peer_addr));
        session.network = Network::Udp;
        let transport = outbound
            .connect_udp(&session, &DialOptions::default())
            .await
            .unwrap();

        transport
            .send(UdpPacket {
                addr: Address::Ip(peer_addr),
                data: Bytes::from_static(b"ping"),
            })
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        peer.send_to(b"pong", from).await.unwrap();

        let reply = transport.recv().await.unwrap();
        assert_eq!(&reply.data[..], b"pong");
    }

    #[test]
    fn no_dependencies_without_detour() {
        let outbound = plain_direct("direct");
        assert!(outbound.dependencies().is_empty());
        assert!(outbound.supports_dial_override());
    }
}

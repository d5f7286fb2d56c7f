use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::common::{Address, ProxyStream};
use crate::config::types::OutboundConfig;
use crate::proxy::outbound::{transport_dialer, BuildContext, TransportDialer};
use crate::proxy::{DialOptions, Network, OutboundHandler, Session};

/// SOCKS5 CONNECT 出站
pub struct Socks5Outbound {
    tag: String,
    server: Address,
    username: Option<String>,
    password: Option<String>,
    dialer: TransportDialer,
}

impl Socks5Outbound {
    pub fn new(ctx: &BuildContext, config: &OutboundConfig) -> Result<Self> {
        let server = config.settings.server_addr()?;
        Ok(Self {
            tag: config.tag.clone(),
            server,
            username: config.settings.username.clone(),
            password: config.settings.password.clone(),
            dialer: transport_dialer(ctx, &config.settings),
        })
    }

    async fn handshake(&self, mut stream: ProxyStream, target: &Address) -> Result<ProxyStream> {
        let with_auth = self.username.is_some();
        if with_auth {
            stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await?;
        } else {
            stream.write_all(&[0x05, 0x01, 0x00]).await?;
        }

        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await?;
        if method[0] != 0x05 {
            anyhow::bail!("SOCKS5 bad version: {}", method[0]);
        }
        match method[1] {
            0x00 => {}
            0x02 => {
                let user = self.username.as_deref().unwrap_or_default();
                let pass = self.password.as_deref().unwrap_or_default();
                let mut req = vec![0x01, user.len() as u8];
                req.extend_from_slice(user.as_bytes());
                req.push(pass.len() as u8);
                req.extend_from_slice(pass.as_bytes());
                stream.write_all(&req).await?;
                let mut resp = [0u8; 2];
                stream.read_exact(&mut resp).await?;
                if resp[1] != 0x00 {
                    anyhow::bail!("SOCKS5 auth rejected");
                }
            }
            other => anyhow::bail!("SOCKS5 unsupported auth method: {}", other),
        }

        let mut req = vec![0x05, 0x01, 0x00];
        match target {
            Address::Ip(addr) => {
                match addr.ip() {
                    std::net::IpAddr::V4(v4) => {
                        req.push(0x01);
                        req.extend_from_slice(&v4.octets());
                    }
                    std::net::IpAddr::V6(v6) => {
                        req.push(0x04);
                        req.extend_from_slice(&v6.octets());
                    }
                }
                req.extend_from_slice(&addr.port().to_be_bytes());
            }
            Address::Domain(domain, port) => {
                req.push(0x03);
                req.push(domain.len() as u8);
                req.extend_from_slice(domain.as_bytes());
                req.extend_from_slice(&port.to_be_bytes());
            }
        }
        stream.write_all(&req).await?;

        let mut resp = [0u8; 4];
        stream.read_exact(&mut resp).await?;
        if resp[1] != 0x00 {
            anyhow::bail!("SOCKS5 CONNECT failed: reply={}", resp[1]);
        }
        // 吞掉绑定地址
        match resp[3] {
            0x01 => {
                let mut buf = [0u8; 6];
                stream.read_exact(&mut buf).await?;
            }
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut buf = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut buf).await?;
            }
            0x04 => {
                let mut buf = [0u8; 18];
                stream.read_exact(&mut buf).await?;
            }
            other => anyhow::bail!("SOCKS5 bad address type in reply: {}", other),
        }

        Ok(stream)
    }
}

#[async_trait]
impl OutboundHandler for Socks5Outbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn typ(&self) -> &str {
        "socks"
    }

    fn network(&self) -> Vec<Network> {
        vec![Network::Tcp]
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
        debug!(server = %self.server, target = %session.target, "socks5 connect");
        let stream = self.dialer.dial(&self.server, opts).await?;
        self.handshake(stream, &session.target).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;
    use crate::config::types::OutboundSettings;

    fn test_context() -> BuildContext {
        BuildContext {
            manager: Weak::new(),
            cache: None,
            history: std::sync::Arc::new(crate::proxy::group::history::HistoryStorage::new()),
            pause: crate::common::PauseManager::new(),
            detour_override: None,
        }
    }

    fn socks_config(tag: &str, addr: &str, port: u16) -> OutboundConfig {
        OutboundConfig {
            tag: tag.to_string(),
            protocol: "socks".to_string(),
            settings: OutboundSettings {
                address: Some(addr.to_string()),
                port: Some(port),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// 最小 SOCKS5 服务端：无认证，应答成功后回显
    async fn serve_socks5_once(listener: tokio::net::TcpListener) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        stream.write_all(&[0x05, 0x00]).await.unwrap();

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.unwrap();
        match head[3] {
            0x01 => {
                let mut rest = [0u8; 6];
                stream.read_exact(&mut rest).await.unwrap();
            }
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.unwrap();
                let mut rest = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut rest).await.unwrap();
            }
            _ => panic!("unexpected atyp"),
        }
        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(&buf[..n]).await.unwrap();
    }

    #[tokio::test]
    async fn connect_through_local_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_socks5_once(listener));

        let ctx = test_context();
        let outbound =
            Socks5Outbound::new(&ctx, &socks_config("s5", &addr.ip().to_string(), addr.port()))
                .unwrap();

        let session = Session::tcp(Address::Domain("example.com".to_string(), 80));
        let mut stream = outbound
            .connect(&session, &DialOptions::default())
            .await
            .unwrap();

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.await.unwrap();
    }

    #[test]
    fn missing_server_fails() {
        let ctx = test_context();
        let config = OutboundConfig::leaf("s5", "socks");
        assert!(Socks5Outbound::new(&ctx, &config).is_err());
    }

    #[test]
    fn detour_appears_in_dependencies() {
        let ctx = test_context();
        let mut config = socks_config("s5", "1.2.3.4", 1080);
        config.settings.detour = Some("relay".to_string());
        let outbound = Socks5Outbound::new(&ctx, &config).unwrap();
        assert_eq!(outbound.dependencies(), vec!["relay"]);
    }
}

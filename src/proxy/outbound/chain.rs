use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::common::{Address, ProxyStream};
use crate::proxy::{ArcOutbound, DialOptions, Dialer, OutboundHandler, Session};

/// 链式拨号替身
///
/// `hops = [d1, d2, …, dn]` 表示被替换出站的传输连接先经 dn 发出，而 dn
/// 自己的传输连接又经 d(n-1) 发出，依此类推，d1 直接落地。健康检查用它
/// 实现「成员经组级前置链探测」。
pub struct ChainDialer {
    hops: Vec<ArcOutbound>,
}

impl ChainDialer {
    pub fn new(hops: Vec<ArcOutbound>) -> Result<Self> {
        if hops.is_empty() {
            anyhow::bail!("chain dialer requires at least one hop");
        }
        Ok(Self { hops })
    }

    /// 所有跳的传输层都要能被替身接管，否则整条链无法成立
    pub fn redirectable(hops: &[ArcOutbound]) -> bool {
        hops.iter().all(|hop| hop.supports_dial_override())
    }
}

#[async_trait]
impl Dialer for ChainDialer {
    async fn dial(&self, addr: &Address) -> Result<ProxyStream> {
        let (last, rest) = self
            .hops
            .split_last()
            .ok_or_else(|| anyhow::anyhow!("empty chain"))?;
        debug!(hop = last.tag(), target = %addr, remaining = rest.len(), "chain dial");
        let opts = if rest.is_empty() {
            DialOptions::default()
        } else {
            DialOptions {
                detour_override: Some(Arc::new(ChainDialer {
                    hops: rest.to_vec(),
                })),
            }
        };
        last.connect(&Session::tcp(addr.clone()), &opts).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::proxy::outbound::direct::DirectOutbound;
    use crate::proxy::outbound::{transport_dialer, BuildContext};

    fn direct(tag: &str) -> ArcOutbound {
        let ctx = BuildContext {
            manager: Weak::new(),
            cache: None,
            history: std::sync::Arc::new(crate::proxy::group::history::HistoryStorage::new()),
            pause: crate::common::PauseManager::new(),
            detour_override: None,
        };
        Arc::new(DirectOutbound::with_dialer(
            tag.to_string(),
            transport_dialer(&ctx, &Default::default()),
        ))
    }

    #[test]
    fn empty_chain_rejected() {
        assert!(ChainDialer::new(Vec::new()).is_err());
    }

    #[test]
    fn redirectable_requires_every_hop() {
        let hops = vec![direct("a"), direct("b")];
        assert!(ChainDialer::redirectable(&hops));

        let mut hops = hops;
        hops.push(Arc::new(super::super::block::BlockOutbound::new(
            "blocked".to_string(),
        )));
        assert!(!ChainDialer::redirectable(&hops));
    }

    #[tokio::test]
    async fn single_hop_dials_target() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let chain = ChainDialer::new(vec![direct("hop")]).unwrap();
        let mut stream = chain.dial(&Address::Ip(addr)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }
}

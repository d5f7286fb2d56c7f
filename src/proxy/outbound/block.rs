use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::common::{BoxUdpTransport, ProxyStream};
use crate::proxy::{DialOptions, OutboundHandler, Session};

/// 丢弃所有连接的出站
pub struct BlockOutbound {
    tag: String,
}

impl BlockOutbound {
    pub fn new(tag: String) -> Self {
        Self { tag }
    }
}

#[async_trait]
impl OutboundHandler for BlockOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn typ(&self) -> &str {
        "block"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self, session: &Session, _opts: &DialOptions) -> Result<ProxyStream> {
        debug!(target = %session.target, "connection blocked");
        anyhow::bail!("connection blocked")
    }

    async fn connect_udp(&self, _session: &Session, _opts: &DialOptions) -> Result<BoxUdpTransport> {
        anyhow::bail!("connection blocked")
    }
}

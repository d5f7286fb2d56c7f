pub mod group;
pub mod outbound;

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::app::outbound_manager::OutboundManager;
use crate::app::proxy_provider::Provider;
use crate::common::{Address, BoxUdpTransport, Error, ProxyStream};

/// 网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

/// 连接会话元数据
#[derive(Debug, Clone)]
pub struct Session {
    pub target: Address,
    pub source: Option<SocketAddr>,
    pub inbound_tag: String,
    pub network: Network,
}

impl Session {
    /// 内部发起的 TCP 会话（探测、订阅下载等）
    pub fn tcp(target: Address) -> Self {
        Self {
            target,
            source: None,
            inbound_tag: String::new(),
            network: Network::Tcp,
        }
    }
}

/// 拨号能力：出站内部传输层与健康检查的链式替换共用
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &Address) -> Result<ProxyStream>;
}

/// 单次拨号附加选项
///
/// `detour_override` 在拨号时替换出站的传输层拨号器，出站对自己服务器的
/// 连接改经替身发起。只有传输层走统一拨号器的出站会消费它。
#[derive(Clone, Default)]
pub struct DialOptions {
    pub detour_override: Option<Arc<dyn Dialer>>,
}

impl std::fmt::Debug for dyn OutboundHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundHandler")
            .field("tag", &self.tag())
            .field("typ", &self.typ())
            .finish()
    }
}

/// 出站处理器 trait
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    fn tag(&self) -> &str;
    fn typ(&self) -> &str;

    fn network(&self) -> Vec<Network> {
        vec![Network::Tcp, Network::Udp]
    }

    /// 拨号时引用的其他出站标签；管理器据此排启动顺序
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any;

    /// 组能力视图；非组返回 None
    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        None
    }

    /// 传输层拨号是否会消费 DialOptions 里的替身
    fn supports_dial_override(&self) -> bool {
        false
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, session: &Session, opts: &DialOptions) -> Result<ProxyStream>;

    async fn connect_udp(
        &self,
        _session: &Session,
        _opts: &DialOptions,
    ) -> Result<BoxUdpTransport> {
        Err(Error::Unsupported(format!("{} does not support udp", self.typ())).into())
    }
}

pub type ArcOutbound = Arc<dyn OutboundHandler>;

/// 代理组能力：把拨号委托给某个成员
#[async_trait]
pub trait OutboundGroup: OutboundHandler {
    /// 当前选中成员的标签，未选中时为空串
    async fn now(&self) -> String;

    /// 全部成员标签，按 provider 声明顺序拼接
    async fn all(&self) -> Vec<String>;

    async fn outbound(&self, tag: &str) -> Option<ArcOutbound>;

    async fn outbounds(&self) -> Vec<ArcOutbound>;

    fn provider(&self, tag: &str) -> Option<Arc<dyn Provider>>;

    fn providers(&self) -> Vec<Arc<dyn Provider>>;

    /// 健康检查能力视图；没有自带探测的组返回 None
    fn as_check_group(&self) -> Option<&dyn OutboundCheckGroup> {
        None
    }
}

/// 自带健康检查的组（url-test、load-balance）
#[async_trait]
pub trait OutboundCheckGroup: OutboundGroup {
    /// 对全部成员做一轮探测，返回成员标签到 RTT 的映射
    async fn check_all(&self) -> Result<HashMap<String, u16>>;

    /// 只探测指定 provider 的成员
    async fn check_provider(&self, tag: &str) -> Result<HashMap<String, u16>>;

    /// 探测单个成员
    async fn check_outbound(&self, tag: &str) -> Result<u16>;
}

const REAL_OUTBOUND_MAX_DEPTH: usize = 100;

/// 沿 `now()` 递归下钻到具体的叶子出站
///
/// 组图是活的，两次调用之间可能被管理面改写，所以用深度上限而不是
/// 已访问集合来防环。
pub async fn real_outbound(
    manager: &OutboundManager,
    outbound: ArcOutbound,
) -> Result<ArcOutbound> {
    let mut current = outbound;
    let mut depth = 0;
    loop {
        let next_tag = match current.as_group() {
            None => None,
            Some(group) => Some(group.now().await),
        };
        let Some(now) = next_tag else {
            return Ok(current);
        };
        depth += 1;
        if depth > REAL_OUTBOUND_MAX_DEPTH {
            return Err(Error::DeepOrCyclic.into());
        }
        current = manager
            .find_outbound(&now)
            .await
            .ok_or_else(|| Error::NotFound(format!("outbound not found: {}", now)))?;
    }
}

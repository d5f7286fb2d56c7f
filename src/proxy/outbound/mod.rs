pub mod block;
pub mod chain;
pub mod direct;
pub mod socks5;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpStream;

use crate::app::outbound_manager::OutboundManager;
use crate::common::pause::PauseManager;
use crate::common::{Address, Error, ProxyStream};
use crate::config::types::{OutboundConfig, OutboundSettings};
use crate::proxy::group::history::HistoryStorage;
use crate::proxy::group::persistence::CacheFile;
use crate::proxy::{ArcOutbound, DialOptions, Dialer, OutboundHandler, Session};

/// 出站构建时的环境
pub struct BuildContext {
    pub manager: Weak<OutboundManager>,
    pub cache: Option<Arc<CacheFile>>,
    pub history: Arc<HistoryStorage>,
    pub pause: PauseManager,
    /// 复制出站时注入的拨号替身
    pub detour_override: Option<DetourOverride>,
}

impl BuildContext {
    pub fn with_override(&self, detour_override: DetourOverride) -> Self {
        Self {
            manager: self.manager.clone(),
            cache: self.cache.clone(),
            history: self.history.clone(),
            pause: self.pause.clone(),
            detour_override: Some(detour_override),
        }
    }
}

/// 构建期拨号替身，带「是否被消费」探针
///
/// 只有传输层经过统一拨号器的出站会在构建时取走替身；`used` 保持 false
/// 说明该出站类型不可替换，复制方应当报错。
#[derive(Clone)]
pub struct DetourOverride {
    dialer: Arc<dyn Dialer>,
    used: Arc<AtomicBool>,
}

impl DetourOverride {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            used: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 取走替身并标记已消费
    pub fn consume(&self) -> Arc<dyn Dialer> {
        self.used.store(true, Ordering::SeqCst);
        self.dialer.clone()
    }

    pub fn used(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

enum DialMode {
    Direct,
    /// 流量先经指定出站转发
    Detour(String),
    /// 构建时被替身接管
    Override(Arc<dyn Dialer>),
}

/// 叶子出站的统一传输层拨号器
///
/// 优先级：单次拨号替身 > 构建期替身 > detour > 直连。
pub struct TransportDialer {
    manager: Weak<OutboundManager>,
    mode: DialMode,
}

impl TransportDialer {
    /// detour 配置对应的依赖标签
    pub fn detour_tag(&self) -> Option<&str> {
        match &self.mode {
            DialMode::Detour(tag) => Some(tag),
            _ => None,
        }
    }

    pub async fn dial(&self, addr: &Address, opts: &DialOptions) -> Result<ProxyStream> {
        if let Some(redirect) = &opts.detour_override {
            return redirect.dial(addr).await;
        }
        match &self.mode {
            DialMode::Direct => {
                let resolved = addr.resolve().await?;
                let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(resolved))
                    .await
                    .map_err(|_| {
                        anyhow::anyhow!("connect timeout after {:?} to {}", CONNECT_TIMEOUT, addr)
                    })??;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            DialMode::Detour(tag) => {
                let manager = self
                    .manager
                    .upgrade()
                    .ok_or_else(|| anyhow::anyhow!("outbound manager dropped"))?;
                let detour = manager
                    .find_outbound(tag)
                    .await
                    .ok_or_else(|| Error::NotFound(format!("outbound not found: {}", tag)))?;
                detour
                    .connect(&Session::tcp(addr.clone()), &DialOptions::default())
                    .await
            }
            DialMode::Override(dialer) => dialer.dial(addr).await,
        }
    }
}

/// 按构建环境与出站配置装配传输层拨号器
pub fn transport_dialer(ctx: &BuildContext, settings: &OutboundSettings) -> TransportDialer {
    if let Some(detour_override) = &ctx.detour_override {
        return TransportDialer {
            manager: ctx.manager.clone(),
            mode: DialMode::Override(detour_override.consume()),
        };
    }
    let mode = match &settings.detour {
        Some(tag) => DialMode::Detour(tag.clone()),
        None => DialMode::Direct,
    };
    TransportDialer {
        manager: ctx.manager.clone(),
        mode,
    }
}

pub type OutboundFactory =
    Arc<dyn Fn(&BuildContext, &OutboundConfig) -> Result<ArcOutbound> + Send + Sync>;

/// 出站类型注册表
pub struct OutboundRegistry {
    factories: HashMap<String, OutboundFactory>,
}

impl Default for OutboundRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, protocol: &str, factory: OutboundFactory) {
        self.factories.insert(protocol.to_string(), factory);
    }

    pub fn create(&self, ctx: &BuildContext, config: &OutboundConfig) -> Result<ArcOutbound> {
        let factory = self
            .factories
            .get(&config.protocol)
            .ok_or_else(|| anyhow::anyhow!("unsupported outbound protocol: {}", config.protocol))?;
        factory(ctx, config)
    }
}

/// 内置出站类型 + 组类型
pub fn default_registry() -> OutboundRegistry {
    let mut registry = OutboundRegistry::new();
    registry.register(
        "direct",
        Arc::new(|ctx, config| {
            Ok(Arc::new(direct::DirectOutbound::with_dialer(
                config.tag.clone(),
                transport_dialer(ctx, &config.settings),
            )) as ArcOutbound)
        }),
    );
    registry.register(
        "block",
        Arc::new(|_ctx, config| {
            Ok(Arc::new(block::BlockOutbound::new(config.tag.clone())) as ArcOutbound)
        }),
    );
    registry.register(
        "socks",
        Arc::new(|ctx, config| {
            Ok(Arc::new(socks5::Socks5Outbound::new(ctx, config)?) as ArcOutbound)
        }),
    );
    crate::proxy::group::register_group_types(&mut registry);
    registry
}

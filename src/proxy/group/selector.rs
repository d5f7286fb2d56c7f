use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info};

use crate::app::proxy_provider::Provider;
use crate::common::{BoxUdpTransport, Error, ProxyStream};
use crate::config::types::OutboundConfig;
use crate::proxy::group::persistence::CacheFile;
use crate::proxy::group::GroupAdapter;
use crate::proxy::outbound::BuildContext;
use crate::proxy::{
    ArcOutbound, DialOptions, Network, OutboundGroup, OutboundHandler, Session,
};

/// 手动选择代理组
///
/// 启动时的选中顺序：缓存里的持久化选择 → 配置的 default → 首个成员。
pub struct SelectorGroup {
    adapter: GroupAdapter,
    default_tag: Option<String>,
    store_selected: bool,
    cache: Option<Arc<CacheFile>>,
    selected: RwLock<Option<ArcOutbound>>,
}

impl SelectorGroup {
    pub fn new(ctx: &BuildContext, config: &OutboundConfig) -> Self {
        Self {
            adapter: GroupAdapter::new(
                config.tag.clone(),
                ctx.manager.clone(),
                config.group.clone(),
            ),
            default_tag: config.group.default.clone(),
            store_selected: config.group.store_selected,
            cache: ctx.cache.clone(),
            selected: RwLock::new(None),
        }
    }

    fn set_selected(&self, outbound: ArcOutbound) {
        *self.selected.write().expect("selector lock poisoned") = Some(outbound);
    }

    fn current(&self) -> Option<ArcOutbound> {
        self.selected.read().expect("selector lock poisoned").clone()
    }

    /// 切换选中成员；未知成员返回 false 且不改状态
    pub async fn select_outbound(&self, tag: &str) -> bool {
        let Some(outbound) = self.adapter.find(tag).await else {
            return false;
        };
        self.set_selected(outbound);
        if self.store_selected {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.store_selected(self.adapter.tag(), tag) {
                    error!(group = self.adapter.tag(), error = %e, "store selected");
                }
            }
        }
        info!(group = self.adapter.tag(), selected = tag, "selection changed");
        true
    }
}

#[async_trait]
impl OutboundHandler for SelectorGroup {
    fn tag(&self) -> &str {
        self.adapter.tag()
    }

    fn typ(&self) -> &str {
        "selector"
    }

    fn network(&self) -> Vec<Network> {
        match self.current() {
            Some(selected) => selected.network(),
            None => vec![Network::Tcp, Network::Udp],
        }
    }

    fn dependencies(&self) -> Vec<String> {
        self.adapter.dependencies()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_group(&self) -> Option<&dyn OutboundGroup> {
        Some(self)
    }

    async fn start(&self) -> Result<()> {
        self.adapter.init_providers()?;

        if self.store_selected {
            if let Some(cache) = &self.cache {
                if let Some(saved) = cache.load_selected(self.adapter.tag()) {
                    if let Some(outbound) = self.adapter.find(&saved).await {
                        self.set_selected(outbound);
                        return Ok(());
                    }
                }
            }
        }

        if let Some(default_tag) = &self.default_tag {
            let outbound = self
                .adapter
                .find(default_tag)
                .await
                .ok_or_else(|| Error::DefaultMissing(default_tag.clone()))?;
            self.set_selected(outbound);
            return Ok(());
        }

        if let Some(first) = self.adapter.member_outbounds().await.into_iter().next() {
            self.set_selected(first);
        }
        Ok(())
    }

    async fn connect(&self, session: &Session, opts: &DialOptions) -> Result<ProxyStream> {
        let selected = self
            .current()
            .ok_or_else(|| Error::NotFound(format!("selector[{}] is empty", self.adapter.tag())))?;
        selected.connect(session, opts).await
    }

    async fn connect_udp(&self, session: &Session, opts: &DialOptions) -> Result<BoxUdpTransport> {
        let selected = self
            .current()
            .ok_or_else(|| Error::NotFound(format!("selector[{}] is empty", self.adapter.tag())))?;
        selected.connect_udp(session, opts).await
    }
}

#[async_trait]
impl OutboundGroup for SelectorGroup {
    async fn now(&self) -> String {
        self.current()
            .map(|s| s.tag().to_string())
            .unwrap_or_default()
    }

    async fn all(&self) -> Vec<String> {
        self.adapter.all().await
    }

    async fn outbound(&self, tag: &str) -> Option<ArcOutbound> {
        self.adapter.find(tag).await
    }

    async fn outbounds(&self) -> Vec<ArcOutbound> {
        self.adapter.member_outbounds().await
    }

    fn provider(&self, tag: &str) -> Option<Arc<dyn Provider>> {
        self.adapter.provider(tag)
    }

    fn providers(&self) -> Vec<Arc<dyn Provider>> {
        self.adapter.providers()
    }
}

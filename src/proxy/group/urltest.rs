use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::app::proxy_provider::Provider;
use crate::common::pause::PauseManager;
use crate::common::{BoxUdpTransport, Error, ProxyStream};
use crate::config::types::{HealthCheckOptions, OutboundConfig};
use crate::proxy::group::health::HealthCheck;
use crate::proxy::group::history::HistoryStorage;
use crate::proxy::group::GroupAdapter;
use crate::proxy::outbound::BuildContext;
use crate::proxy::{
    ArcOutbound, DialOptions, Network, OutboundCheckGroup, OutboundGroup, OutboundHandler, Session,
};

/// 低于该差值不切换，防止在相近节点间来回抖动
const DEFAULT_TOLERANCE: u16 = 50;

/// 自动选择代理组：按最近一次探测的最低 RTT 选成员
///
/// 选择在每次读取时按当前采样惰性重算；只有新的最优成员比当前选择
/// 快出 tolerance 毫秒以上才切换，平手按声明顺序。
pub struct UrlTestGroup {
    adapter: GroupAdapter,
    tolerance: u16,
    check_options: HealthCheckOptions,
    history: Arc<HistoryStorage>,
    pause: PauseManager,
    health: OnceLock<Arc<HealthCheck>>,
    selected: RwLock<Option<ArcOutbound>>,
}

impl UrlTestGroup {
    pub fn new(ctx: &BuildContext, config: &OutboundConfig) -> Self {
        let mut check_options = config.group.check.clone().unwrap_or_default();
        if let Some(url) = &config.group.url {
            check_options.destination = Some(url.clone());
        }
        if let Some(interval) = config.group.interval {
            check_options.interval = Some(interval);
        }
        Self {
            adapter: GroupAdapter::new(
                config.tag.clone(),
                ctx.manager.clone(),
                config.group.clone(),
            ),
            tolerance: config.group.tolerance.unwrap_or(DEFAULT_TOLERANCE),
            check_options,
            history: ctx.history.clone(),
            pause: ctx.pause.clone(),
            health: OnceLock::new(),
            selected: RwLock::new(None),
        }
    }

    pub fn health(&self) -> Option<&Arc<HealthCheck>> {
        self.health.get()
    }

    fn require_health(&self) -> Result<&Arc<HealthCheck>> {
        self.health
            .get()
            .ok_or_else(|| anyhow::anyhow!("group[{}] not started", self.adapter.tag()))
    }

    fn current(&self) -> Option<ArcOutbound> {
        self.selected.read().expect("urltest lock poisoned").clone()
    }

    fn set_selected(&self, outbound: ArcOutbound) {
        *self.selected.write().expect("urltest lock poisoned") = Some(outbound);
    }

    /// 按最新采样重算选择
    async fn update_selection(&self) {
        let Some(health) = self.health.get() else {
            return;
        };
        let members = self.adapter.member_outbounds().await;
        if members.is_empty() {
            return;
        }

        // 声明顺序遍历 + 严格小于，天然实现平手保序
        let mut best: Option<(ArcOutbound, u16)> = None;
        for member in &members {
            let Some(storage_tag) = self.adapter.sample_tag(member).await else {
                continue;
            };
            let Some(sample) = health.storage.latest(&storage_tag) else {
                continue;
            };
            if sample.delay.is_failed() {
                continue;
            }
            let rtt = sample.delay.value();
            if best.as_ref().map(|(_, b)| rtt < *b).unwrap_or(true) {
                best = Some((member.clone(), rtt));
            }
        }

        let current = self.current();
        let current_valid = current
            .as_ref()
            .map(|c| members.iter().any(|m| m.tag() == c.tag()))
            .unwrap_or(false);
        let current_rtt = if current_valid {
            match &current {
                Some(c) => match self.adapter.sample_tag(c).await {
                    Some(storage_tag) => health
                        .storage
                        .latest(&storage_tag)
                        .filter(|s| !s.delay.is_failed())
                        .map(|s| s.delay.value()),
                    None => None,
                },
                None => None,
            }
        } else {
            None
        };

        match (best, current_rtt) {
            (Some((candidate, best_rtt)), Some(current_rtt)) => {
                let improved =
                    (best_rtt as u32) + (self.tolerance as u32) < (current_rtt as u32);
                let current_tag = current.as_ref().map(|c| c.tag().to_string()).unwrap_or_default();
                if improved && candidate.tag() != current_tag {
                    info!(
                        group = self.adapter.tag(),
                        from = current_tag,
                        to = candidate.tag(),
                        rtt = best_rtt,
                        "auto-switched"
                    );
                    self.set_selected(candidate);
                }
            }
            (Some((candidate, _)), None) => {
                // 当前没数据、已失败或已被热更新移除
                self.set_selected(candidate);
            }
            (None, _) => {
                if !current_valid {
                    if let Some(first) = members.into_iter().next() {
                        self.set_selected(first);
                    }
                }
            }
        }
    }

    async fn pick(&self) -> Result<ArcOutbound> {
        self.update_selection().await;
        self.current().ok_or_else(|| {
            Error::NotFound(format!("url-test group[{}] is empty", self.adapter.tag())).into()
        })
    }
}

#[async_trait]
impl OutboundHandler for UrlTestGroup {
    fn tag(&self) -> &str {
        self.adapter.tag()
    }

    fn typ(&self) -> &str {
        "urltest"
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

        let health = HealthCheck::new(
            self.adapter.manager().map(|m| Arc::downgrade(&m))?,
            self.adapter.providers(),
            self.adapter.providers_by_tag(),
            &self.check_options,
            Some(self.history.clone()),
            self.pause.clone(),
        );
        health.start()?;
        let _ = self.health.set(health);

        if self.current().is_none() {
            if let Some(first) = self.adapter.member_outbounds().await.into_iter().next() {
                self.set_selected(first);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(health) = self.health.get() {
            health.close();
        }
        Ok(())
    }

    async fn connect(&self, session: &Session, opts: &DialOptions) -> Result<ProxyStream> {
        self.pick().await?.connect(session, opts).await
    }

    async fn connect_udp(&self, session: &Session, opts: &DialOptions) -> Result<BoxUdpTransport> {
        self.pick().await?.connect_udp(session, opts).await
    }
}

#[async_trait]
impl OutboundGroup for UrlTestGroup {
    async fn now(&self) -> String {
        self.update_selection().await;
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

    fn as_check_group(&self) -> Option<&dyn OutboundCheckGroup> {
        Some(self)
    }
}

#[async_trait]
impl OutboundCheckGroup for UrlTestGroup {
    async fn check_all(&self) -> Result<HashMap<String, u16>> {
        self.require_health()?.check_all().await
    }

    async fn check_provider(&self, tag: &str) -> Result<HashMap<String, u16>> {
        self.require_health()?.check_provider(tag).await
    }

    async fn check_outbound(&self, tag: &str) -> Result<u16> {
        self.require_health()?.check_outbound(tag).await
    }
}

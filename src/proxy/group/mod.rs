pub mod health;
pub mod history;
pub mod loadbalance;
pub mod persistence;
pub mod selector;
pub mod urltest;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use anyhow::Result;

use crate::app::outbound_manager::OutboundManager;
use crate::app::proxy_provider::{MemoryProvider, Provider};
use crate::common::Error;
use crate::config::types::GroupOptions;
use crate::proxy::outbound::OutboundRegistry;
use crate::proxy::{ArcOutbound, OutboundHandler};

/// 注册内置组类型
pub fn register_group_types(registry: &mut OutboundRegistry) {
    registry.register(
        "selector",
        Arc::new(|ctx, config| {
            Ok(Arc::new(selector::SelectorGroup::new(ctx, config)) as ArcOutbound)
        }),
    );
    for alias in ["urltest", "url-test"] {
        registry.register(
            alias,
            Arc::new(|ctx, config| {
                Ok(Arc::new(urltest::UrlTestGroup::new(ctx, config)) as ArcOutbound)
            }),
        );
    }
    for alias in ["loadbalance", "load-balance"] {
        registry.register(
            alias,
            Arc::new(|ctx, config| {
                Ok(Arc::new(loadbalance::LoadBalanceGroup::new(ctx, config)) as ArcOutbound)
            }),
        );
    }
}

/// 组的复合成员视图
///
/// 同级出站成员折叠成位置 0 的内存 provider，其后按声明顺序接真正的
/// provider；成员枚举、查找都按这个顺序展开。provider 列表在 start 时
/// 解析一次，之后只读。
pub struct GroupAdapter {
    tag: String,
    options: GroupOptions,
    manager: Weak<OutboundManager>,
    providers: RwLock<Vec<Arc<dyn Provider>>>,
    providers_by_tag: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl GroupAdapter {
    pub fn new(tag: String, manager: Weak<OutboundManager>, options: GroupOptions) -> Self {
        Self {
            tag,
            options,
            manager,
            providers: RwLock::new(Vec::new()),
            providers_by_tag: RwLock::new(HashMap::new()),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn manager(&self) -> Result<Arc<OutboundManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("outbound manager dropped"))
    }

    /// 同级成员即启动依赖；provider 成员不进管理器的依赖图
    pub fn dependencies(&self) -> Vec<String> {
        self.options.outbounds.clone()
    }

    /// 解析成员引用。组 start 时调用一次。
    pub fn init_providers(&self) -> Result<()> {
        if self.options.outbounds.is_empty() && self.options.providers.is_empty() {
            anyhow::bail!("missing outbound and provider tags");
        }
        let manager = self.manager()?;

        let mut peers = Vec::with_capacity(self.options.outbounds.len());
        for tag in &self.options.outbounds {
            let outbound = manager
                .outbound(tag)
                .ok_or_else(|| Error::NotFound(format!("outbound not found: {}", tag)))?;
            peers.push(outbound);
        }

        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
        let mut providers_by_tag = HashMap::new();
        if !peers.is_empty() {
            providers.push(Arc::new(MemoryProvider::new(String::new(), peers)));
        }
        for tag in &self.options.providers {
            let provider = manager
                .provider(tag)
                .ok_or_else(|| Error::NotFound(format!("provider not found: {}", tag)))?;
            providers.push(provider.clone());
            providers_by_tag.insert(tag.clone(), provider);
        }

        *self.providers.write().expect("group lock poisoned") = providers;
        *self.providers_by_tag.write().expect("group lock poisoned") = providers_by_tag;
        Ok(())
    }

    pub fn providers(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.read().expect("group lock poisoned").clone()
    }

    pub fn provider(&self, tag: &str) -> Option<Arc<dyn Provider>> {
        self.providers_by_tag
            .read()
            .expect("group lock poisoned")
            .get(tag)
            .cloned()
    }

    pub fn providers_by_tag(&self) -> HashMap<String, Arc<dyn Provider>> {
        self.providers_by_tag
            .read()
            .expect("group lock poisoned")
            .clone()
    }

    /// 全部成员标签
    pub async fn all(&self) -> Vec<String> {
        let mut tags = Vec::new();
        for provider in self.providers() {
            for outbound in provider.outbounds().await {
                tags.push(outbound.tag().to_string());
            }
        }
        tags
    }

    /// 按标签查找成员
    pub async fn find(&self, tag: &str) -> Option<ArcOutbound> {
        for provider in self.providers() {
            if let Some(outbound) = provider.outbound(tag).await {
                return Some(outbound);
            }
        }
        None
    }

    /// 全部成员，按声明顺序
    pub async fn member_outbounds(&self) -> Vec<ArcOutbound> {
        let mut outbounds = Vec::new();
        for provider in self.providers() {
            outbounds.extend(provider.outbounds().await);
        }
        outbounds
    }

    /// 成员在采样存储里的键：组成员用下钻后的叶子标签
    pub async fn sample_tag(&self, member: &ArcOutbound) -> Option<String> {
        if member.as_group().is_none() {
            return Some(member.tag().to_string());
        }
        let manager = self.manager().ok()?;
        let real = crate::proxy::real_outbound(&manager, member.clone())
            .await
            .ok()?;
        Some(real.tag().to_string())
    }
}

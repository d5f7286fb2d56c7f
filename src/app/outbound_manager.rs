//! 出站注册表与生命周期协调
//!
//! 持有全部出站与依赖图：按依赖顺序启动、检测环路、运行中增删改，
//! 以及面向管理面的查询与变更入口。锁只盖内存操作，I/O 都在锁外。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::app::proxy_provider::{Provider, ProviderManager};
use crate::common::pause::PauseManager;
use crate::common::Error;
use crate::config::types::OutboundConfig;
use crate::proxy::group::history::HistoryStorage;
use crate::proxy::group::persistence::CacheFile;
use crate::proxy::group::selector::SelectorGroup;
use crate::proxy::outbound::{BuildContext, DetourOverride, OutboundRegistry};
use crate::proxy::{real_outbound, ArcOutbound, Dialer, OutboundHandler};

/// 单个出站启动/关闭超过该时长时告警（不打断）
const START_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ManagerState {
    started: bool,
    outbounds: Vec<ArcOutbound>,
    outbound_by_tag: HashMap<String, ArcOutbound>,
    /// 被依赖表：key 被 value 里的出站引用
    depend_by_tag: HashMap<String, Vec<String>>,
    conf_by_tag: HashMap<String, OutboundConfig>,
    default_outbound: Option<ArcOutbound>,
}

pub struct OutboundManager {
    weak_self: Weak<OutboundManager>,
    registry: OutboundRegistry,
    providers: Arc<ProviderManager>,
    default_tag: String,
    cache: Option<Arc<CacheFile>>,
    history: Arc<HistoryStorage>,
    pause: PauseManager,
    /// 兜底 direct，默认出站永不为空
    fallback: ArcOutbound,
    state: Mutex<ManagerState>,
}

impl OutboundManager {
    pub fn new(
        registry: OutboundRegistry,
        providers: Arc<ProviderManager>,
        default_tag: String,
        cache: Option<Arc<CacheFile>>,
        history: Arc<HistoryStorage>,
        pause: PauseManager,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<OutboundManager>| {
            let ctx = BuildContext {
                manager: weak.clone(),
                cache: cache.clone(),
                history: history.clone(),
                pause: pause.clone(),
                detour_override: None,
            };
            let fallback = registry
                .create(&ctx, &OutboundConfig::leaf("direct", "direct"))
                .expect("builtin direct outbound");
            Self {
                weak_self: weak.clone(),
                registry,
                providers,
                default_tag,
                cache,
                history,
                pause,
                fallback,
                state: Mutex::new(ManagerState::default()),
            }
        })
    }

    pub fn build_context(&self) -> BuildContext {
        BuildContext {
            manager: self.weak_self.clone(),
            cache: self.cache.clone(),
            history: self.history.clone(),
            pause: self.pause.clone(),
            detour_override: None,
        }
    }

    pub fn history(&self) -> &Arc<HistoryStorage> {
        &self.history
    }

    pub fn pause(&self) -> &PauseManager {
        &self.pause
    }

    pub fn cache(&self) -> Option<&Arc<CacheFile>> {
        self.cache.as_ref()
    }

    pub fn provider(&self, tag: &str) -> Option<Arc<dyn Provider>> {
        self.providers.provider(tag)
    }

    pub fn providers(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.providers()
    }

    pub fn provider_manager(&self) -> &Arc<ProviderManager> {
        &self.providers
    }

    /// 注册表里按标签查找
    pub fn outbound(&self, tag: &str) -> Option<ArcOutbound> {
        let state = self.state.lock().expect("manager lock poisoned");
        state.outbound_by_tag.get(tag).cloned()
    }

    /// 注册表查不到时继续在各 provider 里找
    pub async fn find_outbound(&self, tag: &str) -> Option<ArcOutbound> {
        if let Some(outbound) = self.outbound(tag) {
            return Some(outbound);
        }
        for provider in self.providers.providers() {
            if let Some(outbound) = provider.outbound(tag).await {
                return Some(outbound);
            }
        }
        None
    }

    /// 注册顺序快照
    pub fn outbounds(&self) -> Vec<ArcOutbound> {
        let state = self.state.lock().expect("manager lock poisoned");
        state.outbounds.clone()
    }

    /// 默认出站：配置指定 → 首个注册 → 内置 direct
    pub fn default_outbound(&self) -> ArcOutbound {
        let state = self.state.lock().expect("manager lock poisoned");
        state
            .default_outbound
            .clone()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// 不注册、不纳管地构建一个出站（provider 成员用）
    pub fn build_unmanaged(&self, config: &OutboundConfig) -> Result<ArcOutbound> {
        self.registry.create(&self.build_context(), config)
    }

    /// 创建并注册出站
    ///
    /// 同名出站被替换（旧的关闭）。管理器已启动时，新出站先同步走完
    /// 启动流程再对外可见。
    pub async fn create(&self, config: OutboundConfig) -> Result<()> {
        if config.tag.is_empty() {
            return Err(Error::Invalid("outbound tag must not be empty".to_string()).into());
        }
        let outbound = self.registry.create(&self.build_context(), &config)?;

        let started = self.state.lock().expect("manager lock poisoned").started;
        if started {
            start_with_watchdog(&outbound)
                .await
                .with_context(|| start_context(outbound.as_ref()))?;
        }

        let replaced = {
            let mut state = self.state.lock().expect("manager lock poisoned");
            let tag = config.tag.clone();

            let replaced = state.outbound_by_tag.remove(&tag);
            if let Some(old) = &replaced {
                let old_ptr = Arc::as_ptr(old) as *const ();
                state
                    .outbounds
                    .retain(|o| Arc::as_ptr(o) as *const () != old_ptr);
                remove_dependencies(&mut state, &tag, old);
            }

            state.outbound_by_tag.insert(tag.clone(), outbound.clone());
            state.outbounds.push(outbound.clone());
            for dependency in outbound.dependencies() {
                state
                    .depend_by_tag
                    .entry(dependency)
                    .or_default()
                    .push(tag.clone());
            }

            if tag == self.default_tag
                || (self.default_tag.is_empty() && state.default_outbound.is_none())
            {
                state.default_outbound = Some(outbound.clone());
                if state.started {
                    info!(tag = %tag, "updated default outbound");
                }
            }
            state.conf_by_tag.insert(tag, config);
            replaced
        };

        if let Some(old) = replaced {
            if started {
                if let Err(e) = old.close().await {
                    warn!(tag = old.tag(), error = %e, "close replaced outbound");
                }
            }
        }
        Ok(())
    }

    /// 摘除并关闭出站
    ///
    /// 仍被其他出站依赖时拒绝；被摘的是默认出站时顺延到首个剩余出站。
    pub async fn remove(&self, tag: &str) -> Result<()> {
        let (outbound, started) = {
            let mut state = self.state.lock().expect("manager lock poisoned");
            let outbound = state
                .outbound_by_tag
                .get(tag)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("outbound not found: {}", tag)))?;

            if let Some(dependents) = state.depend_by_tag.get(tag) {
                if !dependents.is_empty() {
                    return Err(Error::Invalid(format!(
                        "outbound[{}] is depended by {}",
                        tag,
                        dependents.join(", ")
                    ))
                    .into());
                }
            }

            state.outbound_by_tag.remove(tag);
            let target = Arc::as_ptr(&outbound) as *const ();
            state
                .outbounds
                .retain(|o| Arc::as_ptr(o) as *const () != target);
            state.conf_by_tag.remove(tag);
            remove_dependencies(&mut state, tag, &outbound);

            let was_default = state
                .default_outbound
                .as_ref()
                .map(|d| Arc::as_ptr(d) as *const () == target)
                .unwrap_or(false);
            if was_default {
                state.default_outbound = state.outbounds.first().cloned();
                if let Some(promoted) = &state.default_outbound {
                    info!(tag = promoted.tag(), "updated default outbound");
                }
            }
            (outbound, state.started)
        };

        if started {
            outbound
                .close()
                .await
                .with_context(|| format!("close outbound/{}[{}]", outbound.typ(), tag))?;
        }
        Ok(())
    }

    /// 按依赖顺序启动全部出站
    ///
    /// 不动点扫描：每一轮启动所有依赖已就绪的出站，直到全部启动或
    /// 无法推进；停滞时沿未满足的依赖走出环路或缺失报告。已启动的
    /// 管理器上重复调用不做任何事。
    pub async fn start(&self) -> Result<()> {
        let outbounds = {
            let mut state = self.state.lock().expect("manager lock poisoned");
            if state.started {
                return Ok(());
            }
            state.started = true;

            if !self.default_tag.is_empty() && state.default_outbound.is_none() {
                state.started = false;
                return Err(Error::DefaultMissing(self.default_tag.clone()).into());
            }
            state.outbounds.clone()
        };

        if let Err(e) = self.start_outbounds(&outbounds).await {
            self.state.lock().expect("manager lock poisoned").started = false;
            return Err(e);
        }
        Ok(())
    }

    async fn start_outbounds(&self, outbounds: &[ArcOutbound]) -> Result<()> {
        let mut started: HashMap<String, bool> = HashMap::new();
        loop {
            let mut progressed = false;
            'next: for outbound in outbounds {
                let tag = outbound.tag();
                if started.get(tag).copied().unwrap_or(false) {
                    continue;
                }
                for dependency in outbound.dependencies() {
                    if !started.get(&dependency).copied().unwrap_or(false) {
                        continue 'next;
                    }
                }
                started.insert(tag.to_string(), true);
                progressed = true;
                start_with_watchdog(outbound)
                    .await
                    .with_context(|| start_context(outbound.as_ref()))?;
            }

            if started.len() == outbounds.len() {
                return Ok(());
            }
            if progressed {
                continue;
            }

            // 停滞：从任一未启动出站沿未满足依赖走出问题报告
            let stuck = outbounds
                .iter()
                .find(|o| !started.get(o.tag()).copied().unwrap_or(false))
                .expect("stalled sweep must leave an unstarted outbound");
            return Err(self.lint_unstarted(&started, stuck));
        }
    }

    fn lint_unstarted(&self, started: &HashMap<String, bool>, stuck: &ArcOutbound) -> anyhow::Error {
        let mut tree = vec![stuck.tag().to_string()];
        let mut current = stuck.clone();
        loop {
            let problem = current
                .dependencies()
                .into_iter()
                .find(|d| !started.get(d).copied().unwrap_or(false));
            let Some(problem) = problem else {
                return anyhow::anyhow!(
                    "outbound[{}] stalled without unmet dependency",
                    current.tag()
                );
            };
            if tree.contains(&problem) {
                return Error::Cycle(format!("{} -> {}", tree.join(" -> "), problem)).into();
            }
            let next = self.outbound(&problem);
            let Some(next) = next else {
                return Error::DependencyMissing {
                    dependency: problem,
                    outbound: current.tag().to_string(),
                }
                .into();
            };
            tree.push(problem);
            current = next;
        }
    }

    /// 逆注册序关闭全部出站，单个失败不阻断收尾
    pub async fn close(&self) -> Result<()> {
        let outbounds = {
            let mut state = self.state.lock().expect("manager lock poisoned");
            if !state.started {
                return Ok(());
            }
            state.started = false;
            let outbounds = std::mem::take(&mut state.outbounds);
            state.outbound_by_tag.clear();
            state.depend_by_tag.clear();
            state.conf_by_tag.clear();
            state.default_outbound = None;
            outbounds
        };

        let mut errors = Vec::new();
        for outbound in outbounds.iter().rev() {
            if let Err(e) = close_with_watchdog(outbound).await {
                errors.push(format!(
                    "close outbound/{}[{}]: {}",
                    outbound.typ(),
                    outbound.tag(),
                    e
                ));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(errors.join("; ")))
        }
    }

    /// 以指定拨号器为替身重建出站副本
    ///
    /// 副本不纳管，调用方负责关闭；原出站不受影响。构建过程没消费
    /// 替身（该类型不经统一拨号器）时报 NotOverridable。
    pub async fn dup_override_detour(
        &self,
        tag: &str,
        dialer: Arc<dyn Dialer>,
    ) -> Result<ArcOutbound> {
        let config = {
            let state = self.state.lock().expect("manager lock poisoned");
            state
                .conf_by_tag
                .get(tag)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("outbound not found: {}", tag)))?
        };

        let detour_override = DetourOverride::new(dialer);
        let ctx = self.build_context().with_override(detour_override.clone());
        let outbound = self.registry.create(&ctx, &config)?;
        if !detour_override.used() {
            return Err(Error::NotOverridable(tag.to_string()).into());
        }
        start_with_watchdog(&outbound)
            .await
            .with_context(|| start_context(outbound.as_ref()))?;
        Ok(outbound)
    }

    // ─── 管理面查询/变更 ───

    /// selector 组切换选中成员
    pub async fn select_outbound(&self, group_tag: &str, member_tag: &str) -> bool {
        let Some(outbound) = self.outbound(group_tag) else {
            return false;
        };
        match outbound.as_any().downcast_ref::<SelectorGroup>() {
            Some(selector) => selector.select_outbound(member_tag).await,
            None => false,
        }
    }

    /// 组当前选中成员
    pub async fn group_now(&self, group_tag: &str) -> Option<String> {
        let outbound = self.outbound(group_tag)?;
        let group = outbound.as_group()?;
        Some(group.now().await)
    }

    /// 对指定出站（组先下钻到叶子）做一次延迟探测并写入全局历史
    pub async fn test_delay(
        &self,
        tag: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<u16> {
        let outbound = self
            .find_outbound(tag)
            .await
            .ok_or_else(|| Error::NotFound(format!("outbound not found: {}", tag)))?;
        let real = real_outbound(self, outbound).await?;
        let delay =
            crate::app::latency_test::url_test_with_timeout(real.as_ref(), url, timeout).await;
        match delay {
            Ok(rtt) => {
                self.history
                    .store(real.tag(), crate::proxy::group::history::Delay::Rtt(rtt));
                Ok(rtt)
            }
            Err(e) => {
                self.history
                    .store(real.tag(), crate::proxy::group::history::Delay::Failed);
                Err(e)
            }
        }
    }
}

fn start_context(outbound: &dyn OutboundHandler) -> String {
    format!("start outbound/{}[{}]", outbound.typ(), outbound.tag())
}

fn remove_dependencies(state: &mut ManagerState, tag: &str, outbound: &ArcOutbound) {
    for dependency in outbound.dependencies() {
        if let Some(dependents) = state.depend_by_tag.get_mut(&dependency) {
            dependents.retain(|t| t != tag);
            if dependents.is_empty() {
                state.depend_by_tag.remove(&dependency);
            }
        }
    }
}

/// 启动慢于阈值时告警，但继续等它完成
async fn start_with_watchdog(outbound: &ArcOutbound) -> Result<()> {
    let fut = outbound.start();
    tokio::pin!(fut);
    tokio::select! {
        result = &mut fut => result,
        _ = tokio::time::sleep(START_TIMEOUT) => {
            warn!(
                tag = outbound.tag(),
                timeout = ?START_TIMEOUT,
                "outbound start is taking too long"
            );
            fut.await
        }
    }
}

async fn close_with_watchdog(outbound: &ArcOutbound) -> Result<()> {
    let fut = outbound.close();
    tokio::pin!(fut);
    tokio::select! {
        result = &mut fut => result,
        _ = tokio::time::sleep(STOP_TIMEOUT) => {
            warn!(
                tag = outbound.tag(),
                timeout = ?STOP_TIMEOUT,
                "outbound close is taking too long"
            );
            fut.await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::outbound::default_registry;

    fn new_manager_with_default(default_tag: &str) -> Arc<OutboundManager> {
        OutboundManager::new(
            default_registry(),
            Arc::new(ProviderManager::new()),
            default_tag.to_string(),
            None,
            Arc::new(HistoryStorage::new()),
            PauseManager::new(),
        )
    }

    fn new_manager() -> Arc<OutboundManager> {
        new_manager_with_default("")
    }

    #[tokio::test]
    async fn create_empty_tag_is_invalid() {
        let manager = new_manager();
        let err = manager
            .create(OutboundConfig::leaf("", "direct"))
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Invalid(_))));
    }

    #[tokio::test]
    async fn create_unknown_protocol_fails() {
        let manager = new_manager();
        assert!(manager
            .create(OutboundConfig::leaf("x", "quantum-tunnel"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn lookup_and_insertion_order() {
        let manager = new_manager();
        manager.create(OutboundConfig::leaf("a", "direct")).await.unwrap();
        manager.create(OutboundConfig::leaf("b", "block")).await.unwrap();

        assert!(manager.outbound("a").is_some());
        assert!(manager.outbound("ghost").is_none());
        let tags: Vec<_> = manager.outbounds().iter().map(|o| o.tag().to_string()).collect();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn first_created_becomes_default() {
        let manager = new_manager();
        manager.create(OutboundConfig::leaf("a", "direct")).await.unwrap();
        manager.create(OutboundConfig::leaf("b", "direct")).await.unwrap();
        assert_eq!(manager.default_outbound().tag(), "a");
    }

    #[tokio::test]
    async fn configured_default_wins() {
        let manager = new_manager_with_default("b");
        manager.create(OutboundConfig::leaf("a", "direct")).await.unwrap();
        manager.create(OutboundConfig::leaf("b", "direct")).await.unwrap();
        assert_eq!(manager.default_outbound().tag(), "b");
    }

    #[tokio::test]
    async fn default_falls_back_to_builtin_direct() {
        let manager = new_manager();
        assert_eq!(manager.default_outbound().tag(), "direct");
        assert_eq!(manager.default_outbound().typ(), "direct");
    }

    #[tokio::test]
    async fn start_fails_when_configured_default_missing() {
        let manager = new_manager_with_default("ghost");
        manager.create(OutboundConfig::leaf("a", "direct")).await.unwrap();
        let err = manager.start().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::DefaultMissing(_))
        ));
    }

    #[tokio::test]
    async fn replace_moves_to_end_and_keeps_identity_fresh() {
        let manager = new_manager();
        manager.create(OutboundConfig::leaf("a", "direct")).await.unwrap();
        manager.create(OutboundConfig::leaf("b", "direct")).await.unwrap();

        let before = manager.outbound("a").unwrap();
        manager.create(OutboundConfig::leaf("a", "block")).await.unwrap();
        let after = manager.outbound("a").unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.typ(), "block");
        let tags: Vec<_> = manager.outbounds().iter().map(|o| o.tag().to_string()).collect();
        assert_eq!(tags, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let manager = new_manager();
        let err = manager.remove("ghost").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn remove_depended_outbound_is_rejected() {
        let manager = new_manager();
        manager.create(OutboundConfig::leaf("a", "direct")).await.unwrap();
        let mut selector = OutboundConfig::leaf("sel", "selector");
        selector.group.outbounds = vec!["a".to_string()];
        manager.create(selector).await.unwrap();

        let err = manager.remove("a").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("depended by"), "got: {}", message);
        assert!(message.contains("sel"), "got: {}", message);
        assert!(manager.outbound("a").is_some());

        // 依赖者先走，之后就能移除
        manager.remove("sel").await.unwrap();
        manager.remove("a").await.unwrap();
        assert!(manager.outbound("a").is_none());
    }

    #[tokio::test]
    async fn remove_default_promotes_first_remaining() {
        let manager = new_manager();
        manager.create(OutboundConfig::leaf("a", "direct")).await.unwrap();
        manager.create(OutboundConfig::leaf("b", "direct")).await.unwrap();
        assert_eq!(manager.default_outbound().tag(), "a");

        manager.remove("a").await.unwrap();
        assert_eq!(manager.default_outbound().tag(), "b");
    }

    #[tokio::test]
    async fn start_orders_by_dependencies_and_is_idempotent() {
        let manager = new_manager();
        let mut selector = OutboundConfig::leaf("sel", "selector");
        selector.group.outbounds = vec!["a".to_string()];
        // 依赖者先注册，启动扫描仍须先启动 a
        manager.create(selector).await.unwrap();
        manager.create(OutboundConfig::leaf("a", "direct")).await.unwrap();

        manager.start().await.unwrap();
        assert_eq!(manager.group_now("sel").await.as_deref(), Some("a"));
        // 不动点：重复启动无副作用
        manager.start().await.unwrap();
    }

    #[tokio::test]
    async fn cycle_is_reported_with_path() {
        let manager = new_manager();
        let mut x = OutboundConfig::leaf("X", "selector");
        x.group.outbounds = vec!["Y".to_string()];
        let mut y = OutboundConfig::leaf("Y", "selector");
        y.group.outbounds = vec!["X".to_string()];
        manager.create(x).await.unwrap();
        manager.create(y).await.unwrap();

        let err = manager.start().await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(
            message.contains("circular outbound dependency"),
            "got: {}",
            message
        );
        assert!(
            message.contains("X -> Y -> X") || message.contains("Y -> X -> Y"),
            "got: {}",
            message
        );
    }

    #[tokio::test]
    async fn missing_dependency_is_reported() {
        let manager = new_manager();
        let mut selector = OutboundConfig::leaf("sel", "selector");
        selector.group.outbounds = vec!["ghost".to_string()];
        manager.create(selector).await.unwrap();

        let err = manager.start().await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(
            message.contains("dependency[ghost] not found for outbound[sel]"),
            "got: {}",
            message
        );
    }

    #[tokio::test]
    async fn create_after_start_is_visible_and_started() {
        let manager = new_manager();
        manager.create(OutboundConfig::leaf("a", "direct")).await.unwrap();
        manager.start().await.unwrap();

        let mut selector = OutboundConfig::leaf("sel", "selector");
        selector.group.outbounds = vec!["a".to_string()];
        manager.create(selector).await.unwrap();
        // 已启动管理器上的新建同步走完启动流程
        assert_eq!(manager.group_now("sel").await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn close_resets_registry() {
        let manager = new_manager();
        manager.create(OutboundConfig::leaf("a", "direct")).await.unwrap();
        manager.start().await.unwrap();
        manager.close().await.unwrap();
        assert!(manager.outbound("a").is_none());
        assert!(manager.outbounds().is_empty());
    }

    #[tokio::test]
    async fn select_outbound_admin_path() {
        let manager = new_manager();
        manager.create(OutboundConfig::leaf("a", "direct")).await.unwrap();
        manager.create(OutboundConfig::leaf("b", "direct")).await.unwrap();
        let mut selector = OutboundConfig::leaf("sel", "selector");
        selector.group.outbounds = vec!["a".to_string(), "b".to_string()];
        manager.create(selector).await.unwrap();
        manager.start().await.unwrap();

        assert!(manager.select_outbound("sel", "b").await);
        assert_eq!(manager.group_now("sel").await.as_deref(), Some("b"));
        assert!(!manager.select_outbound("sel", "ghost").await);
        assert!(!manager.select_outbound("a", "b").await);
        assert!(!manager.select_outbound("ghost", "b").await);
    }
}

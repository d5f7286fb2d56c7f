//! 组级健康检查
//!
//! 周期性探测成员延迟，维护滑动窗口，并区分「成员坏死」与「整网断连」：
//! 同一轮内只要有任一成员成功，网络即视为可用；全员失败时再探一次
//! 连通性兜底地址，仍失败则这一轮不记失败样本。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::latency_test::url_test;
use crate::app::outbound_manager::OutboundManager;
use crate::app::proxy_provider::Provider;
use crate::common::pause::PauseManager;
use crate::common::Error;
use crate::config::types::{HealthCheckOptions, NormalizedCheckOptions};
use crate::proxy::group::history::{Delay, HistoryStorage, Storages};
use crate::proxy::outbound::chain::ChainDialer;
use crate::proxy::{real_outbound, ArcOutbound, DialOptions, OutboundHandler};

/// 单次探测超时
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// 单轮并发探测数上限
const CHECK_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connectivity {
    Unknown,
    Up,
    Down,
}

/// 单轮探测的共享上下文
///
/// 同一轮内去重（同一标签可能出现在多个 provider 下），并汇聚网络
/// 连通性结论。成功探测会主动上报连通；失败探测查询时若还没有结论，
/// 就对兜底地址做一次直连探测，结果缓存给同轮后续失败者。
pub struct CheckContext {
    connectivity_url: Option<String>,
    checked: Mutex<HashSet<String>>,
    connected: tokio::sync::Mutex<Connectivity>,
}

impl CheckContext {
    pub fn new(connectivity_url: Option<String>) -> Self {
        Self {
            connectivity_url,
            checked: Mutex::new(HashSet::new()),
            connected: tokio::sync::Mutex::new(Connectivity::Unknown),
        }
    }

    pub fn report_checked(&self, tag: &str) {
        self.checked
            .lock()
            .expect("check context lock poisoned")
            .insert(tag.to_string());
    }

    pub fn checked(&self, tag: &str) -> bool {
        self.checked
            .lock()
            .expect("check context lock poisoned")
            .contains(tag)
    }

    pub async fn report_connected(&self) {
        *self.connected.lock().await = Connectivity::Up;
    }

    /// 网络是否可用；未知时做一次兜底探测并缓存结论
    pub async fn connected(&self) -> bool {
        let mut state = self.connected.lock().await;
        if *state == Connectivity::Unknown {
            *state = self.probe_connectivity().await;
        }
        *state == Connectivity::Up
    }

    async fn probe_connectivity(&self) -> Connectivity {
        let Some(url) = &self.connectivity_url else {
            // 未配置兜底地址时无从判断，按可用处理
            return Connectivity::Up;
        };
        let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "connectivity client build failed");
                return Connectivity::Down;
            }
        };
        match client.head(url.as_str()).send().await {
            Ok(_) => Connectivity::Up,
            Err(_) => Connectivity::Down,
        }
    }
}

/// 健康检查器，由 url-test / load-balance 组持有
pub struct HealthCheck {
    weak_self: Weak<HealthCheck>,
    manager: Weak<OutboundManager>,
    providers: Vec<Arc<dyn Provider>>,
    providers_by_tag: HashMap<String, Arc<dyn Provider>>,
    options: NormalizedCheckOptions,
    pub storage: Arc<Storages>,
    global_history: Option<Arc<HistoryStorage>>,
    pause: PauseManager,
    detour_of: Mutex<Vec<ArcOutbound>>,
    chain_fallback_warned: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

impl HealthCheck {
    pub fn new(
        manager: Weak<OutboundManager>,
        providers: Vec<Arc<dyn Provider>>,
        providers_by_tag: HashMap<String, Arc<dyn Provider>>,
        options: &HealthCheckOptions,
        global_history: Option<Arc<HistoryStorage>>,
        pause: PauseManager,
    ) -> Arc<Self> {
        let options = options.normalized();
        let max_age = options.interval * (options.sampling as u32 + 1);
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            manager,
            providers,
            providers_by_tag,
            storage: Arc::new(Storages::new(options.sampling, max_age)),
            options,
            global_history,
            pause,
            detour_of: Mutex::new(Vec::new()),
            chain_fallback_warned: AtomicBool::new(false),
            cancel: Mutex::new(None),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("health check alive")
    }

    pub fn destination(&self) -> &str {
        &self.options.destination
    }

    /// 启动周期探测。等待所有 provider 就绪后立即做第一轮。
    pub fn start(&self) -> Result<()> {
        let mut cancel_slot = self.cancel.lock().expect("health lock poisoned");
        if cancel_slot.is_some() {
            return Ok(());
        }

        if !self.options.detour_of.is_empty() {
            let manager = self
                .manager
                .upgrade()
                .ok_or_else(|| anyhow::anyhow!("outbound manager dropped"))?;
            let mut resolved = Vec::with_capacity(self.options.detour_of.len());
            for tag in &self.options.detour_of {
                let outbound = manager.outbound(tag).ok_or_else(|| {
                    Error::NotFound(format!("detour_of: outbound not found: {}", tag))
                })?;
                resolved.push(outbound);
            }
            *self.detour_of.lock().expect("health lock poisoned") = resolved;
        }

        let token = CancellationToken::new();
        *cancel_slot = Some(token.clone());
        drop(cancel_slot);

        let this = self.arc();
        tokio::spawn(async move {
            for provider in &this.providers {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = provider.wait() => {}
                }
            }
            tokio::spawn(this.clone().check_loop(token.clone()));
            tokio::spawn(this.clone().cleanup_loop(token));
        });
        Ok(())
    }

    /// 取消所有周期任务；在途探测在下一个 I/O 点自行退出
    pub fn close(&self) {
        if let Some(token) = self.cancel.lock().expect("health lock poisoned").take() {
            token.cancel();
        }
    }

    /// 外部网络接口变化时触发一轮计划外探测
    pub fn interface_updated(&self) {
        let this = self.arc();
        tokio::spawn(async move {
            let _ = this.check_all().await;
        });
    }

    /// 路由面上报连接级失败。已知失败不重复记，避免污染失败计数。
    pub fn report_failure(&self, outbound: &dyn OutboundHandler) {
        if outbound.as_group().is_some() {
            return;
        }
        let tag = outbound.tag();
        let known_failed = self
            .storage
            .latest(tag)
            .map(|s| s.delay.is_failed())
            .unwrap_or(false);
        if !known_failed {
            self.storage.put(tag, Delay::Failed);
        }
    }

    async fn check_loop(self: Arc<Self>, token: CancellationToken) {
        // 第一轮不等周期
        let first = self.clone();
        tokio::spawn(async move {
            let _ = first.check_all().await;
        });

        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            self.pause.wait_active().await;
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    // 探测轮不与 tick 串行，慢轮允许重叠
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _ = this.check_all().await;
                    });
                }
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            self.pause.wait_active().await;
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => self.cleanup().await,
            }
        }
    }

    /// 丢弃已不属于任何 provider 的采样
    async fn cleanup(&self) {
        for tag in self.storage.list() {
            if self.member(&tag).await.is_none() {
                self.storage.delete(&tag);
            }
        }
    }

    async fn member(&self, tag: &str) -> Option<ArcOutbound> {
        for provider in &self.providers {
            if let Some(outbound) = provider.outbound(tag).await {
                return Some(outbound);
            }
        }
        None
    }

    /// 对全部 provider 的成员做一轮探测
    ///
    /// 单个成员的失败只记日志与样本，不影响整轮结果；返回的映射只含
    /// 探测成功的成员。
    pub async fn check_all(&self) -> Result<HashMap<String, u16>> {
        let meta = Arc::new(CheckContext::new(self.options.connectivity.clone()));
        let mut join = JoinSet::new();
        let sem = Arc::new(Semaphore::new(CHECK_CONCURRENCY));
        for provider in self.providers.clone() {
            self.spawn_provider_checks(&meta, &mut join, &sem, provider).await;
        }
        Ok(Self::collect(join).await)
    }

    /// 只探测指定 provider 的成员
    pub async fn check_provider(&self, tag: &str) -> Result<HashMap<String, u16>> {
        let provider = self
            .providers_by_tag
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("provider not found: {}", tag)))?;
        let meta = Arc::new(CheckContext::new(self.options.connectivity.clone()));
        let mut join = JoinSet::new();
        let sem = Arc::new(Semaphore::new(CHECK_CONCURRENCY));
        self.spawn_provider_checks(&meta, &mut join, &sem, provider).await;
        Ok(Self::collect(join).await)
    }

    /// 探测单个成员，下钻到具体叶子
    pub async fn check_outbound(&self, tag: &str) -> Result<u16> {
        let meta = CheckContext::new(self.options.connectivity.clone());
        let outbound = self
            .member(tag)
            .await
            .ok_or_else(|| Error::NotFound(format!("outbound not found: {}", tag)))?;
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("outbound manager dropped"))?;
        let real = real_outbound(&manager, outbound).await?;
        self.check_one(&meta, real).await
    }

    async fn spawn_provider_checks(
        &self,
        meta: &Arc<CheckContext>,
        join: &mut JoinSet<(String, Result<u16>)>,
        sem: &Arc<Semaphore>,
        provider: Arc<dyn Provider>,
    ) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        for outbound in provider.outbounds().await {
            let real = match real_outbound(&manager, outbound).await {
                Ok(real) => real,
                Err(e) => {
                    debug!(error = %e, "skipping unresolvable member");
                    continue;
                }
            };
            let tag = real.tag().to_string();
            if meta.checked(&tag) {
                continue;
            }
            meta.report_checked(&tag);

            let this = self.arc();
            let meta = meta.clone();
            let sem = sem.clone();
            join.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let result = this.check_one(&meta, real).await;
                (tag, result)
            });
        }
    }

    async fn collect(mut join: JoinSet<(String, Result<u16>)>) -> HashMap<String, u16> {
        let mut results = HashMap::new();
        while let Some(joined) = join.join_next().await {
            if let Ok((tag, Ok(rtt))) = joined {
                results.insert(tag, rtt);
            }
        }
        results
    }

    /// 无条件探测指定出站并记录样本
    async fn check_one(&self, meta: &CheckContext, outbound: ArcOutbound) -> Result<u16> {
        let tag = outbound.tag().to_string();
        meta.report_checked(&tag);

        let opts = self.probe_options(&outbound);
        let probed = tokio::time::timeout(
            PROBE_TIMEOUT,
            url_test(outbound.as_ref(), &self.options.destination, &opts),
        )
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("probe timeout")));

        match probed {
            Ok(rtt) => {
                debug!(outbound = %tag, rtt, "outbound available");
                meta.report_connected().await;
                self.storage.put(&tag, Delay::Rtt(rtt));
                if let Some(history) = &self.global_history {
                    history.store(&tag, Delay::Rtt(rtt));
                }
                Ok(rtt)
            }
            Err(e) => {
                if !meta.connected().await {
                    // 断网期间不烧失败样本
                    return Err(Error::NoNetwork.into());
                }
                debug!(outbound = %tag, error = %e, "outbound unavailable");
                self.storage.put(&tag, Delay::Failed);
                if let Some(history) = &self.global_history {
                    history.store(&tag, Delay::Failed);
                }
                Err(e)
            }
        }
    }

    /// 组配置了前置链时，把成员的传输层替换为链式替身
    fn probe_options(&self, outbound: &ArcOutbound) -> DialOptions {
        let detour = self.detour_of.lock().expect("health lock poisoned").clone();
        if detour.is_empty() {
            return DialOptions::default();
        }
        if ChainDialer::redirectable(&detour) && outbound.supports_dial_override() {
            match ChainDialer::new(detour) {
                Ok(chain) => {
                    return DialOptions {
                        detour_override: Some(Arc::new(chain)),
                    }
                }
                Err(e) => debug!(error = %e, "chain dialer build failed"),
            }
        }
        if !self.chain_fallback_warned.swap(true, Ordering::SeqCst) {
            warn!(
                destination = %self.options.destination,
                "detour chain not redirectable, probing members directly"
            );
        }
        DialOptions::default()
    }
}

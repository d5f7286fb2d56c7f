use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::app::proxy_provider::Provider;
use crate::common::pause::PauseManager;
use crate::common::{BoxUdpTransport, Error, ProxyStream, UdpPacket, UdpTransport};
use crate::config::types::{HealthCheckOptions, OutboundConfig, PickOptions};
use crate::proxy::group::health::HealthCheck;
use crate::proxy::group::history::{HistoryStorage, SampleStats};
use crate::proxy::group::GroupAdapter;
use crate::proxy::outbound::BuildContext;
use crate::proxy::{
    ArcOutbound, DialOptions, Network, OutboundCheckGroup, OutboundGroup, OutboundHandler, Session,
};

/// 候选打分方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Objective {
    /// 剔除失败过多或窗口内无采样的成员
    Alive,
    /// 按中位 RTT 排序，超出上限的剔除
    Rtt,
    /// 按 RTT 倒数加权随机
    Weighted,
}

impl Objective {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("rtt") => Objective::Rtt,
            Some("weighted") => Objective::Weighted,
            _ => Objective::Alive,
        }
    }
}

/// 候选池内的选取策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Random,
    RoundRobin,
    /// 相同目标主机稳定落在同一成员
    ConsistentHashing,
    /// 在途连接最少者优先
    LeastLoaded,
}

impl Strategy {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("round-robin") => Strategy::RoundRobin,
            Some("consistent-hashing") => Strategy::ConsistentHashing,
            Some("least-loaded") => Strategy::LeastLoaded,
            _ => Strategy::Random,
        }
    }
}

/// 负载均衡代理组
///
/// 不保存长期选择，每次拨号都基于当前健康快照重新选取。
pub struct LoadBalanceGroup {
    adapter: GroupAdapter,
    objective: Objective,
    strategy: Strategy,
    pick_options: PickOptions,
    check_options: HealthCheckOptions,
    history: Arc<HistoryStorage>,
    pause: PauseManager,
    health: OnceLock<Arc<HealthCheck>>,
    round_robin: AtomicUsize,
    inflight: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl LoadBalanceGroup {
    pub fn new(ctx: &BuildContext, config: &OutboundConfig) -> Self {
        let pick_options = config.group.pick.clone().unwrap_or_default();
        Self {
            adapter: GroupAdapter::new(
                config.tag.clone(),
                ctx.manager.clone(),
                config.group.clone(),
            ),
            objective: Objective::parse(pick_options.objective.as_deref()),
            strategy: Strategy::parse(pick_options.strategy.as_deref()),
            pick_options,
            check_options: config.group.check.clone().unwrap_or_default(),
            history: ctx.history.clone(),
            pause: ctx.pause.clone(),
            health: OnceLock::new(),
            round_robin: AtomicUsize::new(0),
            inflight: Mutex::new(HashMap::new()),
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

    fn counter(&self, tag: &str) -> Arc<AtomicUsize> {
        self.inflight
            .lock()
            .expect("loadbalance lock poisoned")
            .entry(tag.to_string())
            .or_default()
            .clone()
    }

    fn stats_of(&self, tag: &str) -> SampleStats {
        self.health
            .get()
            .and_then(|h| h.storage.stats(tag))
            .unwrap_or_default()
    }

    fn alive(&self, stats: &SampleStats) -> bool {
        stats.total > 0 && stats.fail <= self.pick_options.max_fail
    }

    /// 目标函数筛出候选池；全灭时回退到全员，拨号不至于直接失败
    async fn candidates(&self) -> Vec<(ArcOutbound, SampleStats)> {
        let members = self.adapter.member_outbounds().await;
        let mut scored: Vec<(ArcOutbound, SampleStats)> = Vec::with_capacity(members.len());
        for member in &members {
            let stats = match self.adapter.sample_tag(member).await {
                Some(storage_tag) => self.stats_of(&storage_tag),
                None => SampleStats::default(),
            };
            if self.alive(&stats) {
                scored.push((member.clone(), stats));
            }
        }

        match self.objective {
            Objective::Alive => {}
            Objective::Rtt | Objective::Weighted => {
                if self.pick_options.max_rtt > 0 {
                    scored.retain(|(_, stats)| stats.median <= self.pick_options.max_rtt);
                }
                scored.sort_by_key(|(_, stats)| stats.median);
            }
        }

        let banded = self.apply_baselines(scored);
        let mut chosen = banded;
        if self.pick_options.expected > 0 && chosen.len() > self.pick_options.expected {
            chosen.truncate(self.pick_options.expected);
        }

        if chosen.is_empty() {
            debug!(group = self.adapter.tag(), "no live candidates, falling back to all members");
            return members
                .into_iter()
                .map(|m| {
                    let stats = self.stats_of(m.tag());
                    (m, stats)
                })
                .collect();
        }
        chosen
    }

    /// 逐层放宽 RTT 阈值，取首个满足候选数的层；空层不产生候选
    fn apply_baselines(
        &self,
        scored: Vec<(ArcOutbound, SampleStats)>,
    ) -> Vec<(ArcOutbound, SampleStats)> {
        if self.pick_options.baselines.is_empty() {
            return scored;
        }
        let need = self.pick_options.expected.max(1);
        for baseline in &self.pick_options.baselines {
            let band: Vec<_> = scored
                .iter()
                .filter(|(_, stats)| stats.median <= *baseline)
                .cloned()
                .collect();
            if band.len() >= need {
                return band;
            }
        }
        scored
    }

    async fn pick(&self, session: &Session) -> Result<ArcOutbound> {
        let candidates = self.candidates().await;
        if candidates.is_empty() {
            return Err(Error::NotFound(format!(
                "load-balance group[{}] is empty",
                self.adapter.tag()
            ))
            .into());
        }

        let index = match self.strategy {
            Strategy::Random => {
                if self.objective == Objective::Weighted {
                    weighted_index(&candidates)
                } else {
                    rand::thread_rng().gen_range(0..candidates.len())
                }
            }
            Strategy::RoundRobin => {
                self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            Strategy::ConsistentHashing => {
                let mut hasher = DefaultHasher::new();
                session.target.host().hash(&mut hasher);
                (hasher.finish() % candidates.len() as u64) as usize
            }
            Strategy::LeastLoaded => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, (member, _))| self.counter(member.tag()).load(Ordering::Relaxed))
                .map(|(i, _)| i)
                .unwrap_or(0),
        };

        Ok(candidates[index].0.clone())
    }
}

/// RTT 倒数加权抽样
fn weighted_index(candidates: &[(ArcOutbound, SampleStats)]) -> usize {
    let weights: Vec<f64> = candidates
        .iter()
        .map(|(_, stats)| 1.0 / f64::from(stats.median.max(1)))
        .collect();
    let total: f64 = weights.iter().sum();
    let mut roll = rand::thread_rng().gen_range(0.0..total);
    for (i, w) in weights.iter().enumerate() {
        if roll < *w {
            return i;
        }
        roll -= w;
    }
    candidates.len() - 1
}

#[async_trait]
impl OutboundHandler for LoadBalanceGroup {
    fn tag(&self) -> &str {
        self.adapter.tag()
    }

    fn typ(&self) -> &str {
        "loadbalance"
    }

    fn network(&self) -> Vec<Network> {
        vec![Network::Tcp, Network::Udp]
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
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(health) = self.health.get() {
            health.close();
        }
        Ok(())
    }

    async fn connect(&self, session: &Session, opts: &DialOptions) -> Result<ProxyStream> {
        let member = self.pick(session).await?;
        let counter = self.counter(member.tag());
        counter.fetch_add(1, Ordering::Relaxed);
        match member.connect(session, opts).await {
            Ok(stream) => Ok(Box::new(CountedStream {
                inner: stream,
                _guard: InflightGuard(counter),
            })),
            Err(e) => {
                counter.fetch_sub(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn connect_udp(&self, session: &Session, opts: &DialOptions) -> Result<BoxUdpTransport> {
        let member = self.pick(session).await?;
        let counter = self.counter(member.tag());
        counter.fetch_add(1, Ordering::Relaxed);
        match member.connect_udp(session, opts).await {
            Ok(transport) => Ok(Box::new(CountedUdp {
                inner: transport,
                _guard: InflightGuard(counter),
            })),
            Err(e) => {
                counter.fetch_sub(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl OutboundGroup for LoadBalanceGroup {
    async fn now(&self) -> String {
        // 逐连接选取，没有固定选中
        String::new()
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
impl OutboundCheckGroup for LoadBalanceGroup {
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

/// 连接计数守卫：流被丢弃时在途数回落
struct InflightGuard(Arc<AtomicUsize>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

struct CountedStream {
    inner: ProxyStream,
    _guard: InflightGuard,
}

impl AsyncRead for CountedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct CountedUdp {
    inner: BoxUdpTransport,
    _guard: InflightGuard,
}

#[async_trait]
impl UdpTransport for CountedUdp {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        self.inner.send(packet).await
    }

    async fn recv(&self) -> Result<UdpPacket> {
        self.inner.recv().await
    }
}

//! Outbound providers: named, refreshable sources of outbounds.
//!
//! Two variants: an in-memory provider wrapping a fixed list (inline config
//! and group peer members), and a remote provider that periodically fetches a
//! subscription, parses it into outbound configs and rebuilds its set. The
//! remote variant serves a cached copy when the very first fetch fails, and
//! skips rebuilding when the body hash is unchanged.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::outbound_manager::OutboundManager;
use crate::common::{http, Error, ReadyLatch};
use crate::config::subscription::{parse_subscription, ProviderInfo};
use crate::config::types::ProviderConfig;
use crate::proxy::{ArcOutbound, DialOptions, OutboundHandler};

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A named source of outbounds.
#[async_trait]
pub trait Provider: Send + Sync {
    fn tag(&self) -> &str;

    fn typ(&self) -> &str;

    async fn start(self: Arc<Self>) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Refresh the outbound set. No-op for fixed providers.
    async fn update(&self) -> Result<()> {
        Ok(())
    }

    async fn updated_at(&self) -> Option<SystemTime> {
        None
    }

    /// Subscription traffic/expiry metadata, when the upstream reports it.
    async fn info(&self) -> Option<ProviderInfo> {
        None
    }

    /// Block until the first update has completed (or immediately for
    /// fixed providers).
    async fn wait(&self) {}

    async fn outbounds(&self) -> Vec<ArcOutbound>;

    async fn outbound(&self, tag: &str) -> Option<ArcOutbound>;
}

/// Fixed list of outbounds, always ready.
pub struct MemoryProvider {
    tag: String,
    outbounds: Vec<ArcOutbound>,
    by_tag: HashMap<String, ArcOutbound>,
}

impl MemoryProvider {
    pub fn new(tag: String, outbounds: Vec<ArcOutbound>) -> Self {
        let by_tag = outbounds
            .iter()
            .map(|o| (o.tag().to_string(), o.clone()))
            .collect();
        Self {
            tag,
            outbounds,
            by_tag,
        }
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn typ(&self) -> &str {
        "inline"
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        Ok(())
    }

    async fn outbounds(&self) -> Vec<ArcOutbound> {
        self.outbounds.clone()
    }

    async fn outbound(&self, tag: &str) -> Option<ArcOutbound> {
        self.by_tag.get(tag).cloned()
    }
}

#[derive(Default)]
struct RemoteState {
    detour: Option<ArcOutbound>,
    loaded_hash: String,
    updated_at: Option<SystemTime>,
    info: Option<ProviderInfo>,
    outbounds: Vec<ArcOutbound>,
    by_tag: HashMap<String, ArcOutbound>,
}

/// Remote subscription provider.
pub struct RemoteProvider {
    tag: String,
    url: String,
    interval: Duration,
    cache_file: Option<PathBuf>,
    download_detour: Option<String>,
    include: Option<Regex>,
    exclude: Option<Regex>,
    manager: Weak<OutboundManager>,
    ready: ReadyLatch,
    /// Serializes concurrent update calls; fetch I/O happens under this
    /// gate but never under the state lock.
    update_gate: tokio::sync::Mutex<()>,
    state: RwLock<RemoteState>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl RemoteProvider {
    pub fn new(manager: Weak<OutboundManager>, config: &ProviderConfig) -> Result<Self> {
        if config.tag.is_empty() {
            anyhow::bail!("provider tag is required");
        }
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("provider URL is required"))?;

        let include = config
            .include
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| anyhow::anyhow!("provider include pattern: {}", e))?;
        let exclude = config
            .exclude
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| anyhow::anyhow!("provider exclude pattern: {}", e))?;

        let interval = match config.interval {
            Some(secs) if secs > 0 => Duration::from_secs(secs).max(MIN_REFRESH_INTERVAL),
            _ => DEFAULT_REFRESH_INTERVAL,
        };

        Ok(Self {
            tag: config.tag.clone(),
            url,
            interval,
            cache_file: config.cache_file.as_ref().map(PathBuf::from),
            download_detour: config.download_detour.clone(),
            include,
            exclude,
            manager,
            ready: ReadyLatch::new(),
            update_gate: tokio::sync::Mutex::new(()),
            state: RwLock::new(RemoteState::default()),
            cancel: Mutex::new(None),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    fn selected_by_tag(&self, tag: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(tag) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(tag),
            None => true,
        }
    }

    fn read_state<T>(&self, f: impl FnOnce(&RemoteState) -> T) -> T {
        f(&self.state.read().expect("provider lock poisoned"))
    }

    async fn dialer_outbound(&self) -> Result<ArcOutbound> {
        if let Some(detour) = self.read_state(|s| s.detour.clone()) {
            return Ok(detour);
        }
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("outbound manager dropped"))?;
        Ok(manager.default_outbound())
    }

    async fn download(&self) -> Result<Vec<u8>> {
        let outbound = self.dialer_outbound().await?;
        let (status, body) = tokio::time::timeout(
            FETCH_TIMEOUT,
            http::fetch(outbound.as_ref(), &self.url, &DialOptions::default()),
        )
        .await
        .map_err(|_| anyhow::anyhow!("fetch timeout after {:?}", FETCH_TIMEOUT))??;
        if status != 200 {
            anyhow::bail!("unexpected status code: {}", status);
        }
        Ok(body)
    }

    async fn update_inner(&self) -> Result<()> {
        let fetched = self.download().await;
        let (body, updated_at) = match fetched {
            Ok(body) => {
                let now = SystemTime::now();
                let hash = content_hash(&body);
                let unchanged = self.read_state(|s| s.loaded_hash == hash);
                if let Some(path) = &self.cache_file {
                    if unchanged {
                        touch(path);
                    } else {
                        write_cache(path, &body);
                    }
                }
                if unchanged {
                    // 内容没变：只推进时间戳，成员对象保持原样
                    self.state.write().expect("provider lock poisoned").updated_at = Some(now);
                    return Ok(());
                }
                (body, now)
            }
            Err(e) => {
                // 已有内容时吞下这次失败，等下个周期重试
                if self.read_state(|s| !s.loaded_hash.is_empty()) {
                    return Err(Error::FetchFailure(e.to_string()).into());
                }
                let Some(path) = &self.cache_file else {
                    return Err(Error::FetchFailure(e.to_string()).into());
                };
                if !path.exists() {
                    return Err(Error::FetchFailure(e.to_string()).into());
                }
                warn!(provider = %self.tag, error = %e, "fetch failed");
                info!(provider = %self.tag, cache = %path.display(), "loading cache file");
                let meta = std::fs::metadata(path)?;
                let updated_at = meta.modified().unwrap_or_else(|_| SystemTime::now());
                (std::fs::read(path)?, updated_at)
            }
        };

        self.rebuild(&body, updated_at).await
    }

    async fn rebuild(&self, body: &[u8], updated_at: SystemTime) -> Result<()> {
        let text = String::from_utf8_lossy(body);
        let (configs, provider_info) = parse_subscription(&text)?;

        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("outbound manager dropped"))?;

        let mut outbounds: Vec<ArcOutbound> = Vec::with_capacity(configs.len());
        let mut by_tag = HashMap::new();
        for mut config in configs {
            if !self.selected_by_tag(&config.tag) {
                continue;
            }
            // provider 前缀保证全局标签唯一
            config.tag = format!("{} {}", self.tag, config.tag);
            match manager.build_unmanaged(&config) {
                Ok(outbound) => {
                    by_tag.insert(config.tag.clone(), outbound.clone());
                    outbounds.push(outbound);
                }
                Err(e) => {
                    warn!(provider = %self.tag, tag = %config.tag, error = %e, "create outbound failed");
                }
            }
        }
        info!(provider = %self.tag, count = outbounds.len(), "links loaded");

        let mut state = self.state.write().expect("provider lock poisoned");
        state.loaded_hash = content_hash(body);
        state.updated_at = Some(updated_at);
        state.info = provider_info;
        state.outbounds = outbounds;
        state.by_tag = by_tag;
        Ok(())
    }

    async fn refresh_loop(self: Arc<Self>, token: CancellationToken) {
        if let Err(e) = self.update().await {
            warn!(provider = %self.tag, error = %e, "update failed");
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.update().await {
                        warn!(provider = %self.tag, error = %e, "update failed");
                    }
                }
            }
        }
    }

    /// 解析下载用 detour 并启动拉取循环
    pub fn start_refresh(self: Arc<Self>) -> Result<()> {
        let mut cancel_slot = self.cancel.lock().expect("provider lock poisoned");
        if cancel_slot.is_some() {
            return Ok(());
        }

        if let Some(detour_tag) = &self.download_detour {
            let manager = self
                .manager
                .upgrade()
                .ok_or_else(|| anyhow::anyhow!("outbound manager dropped"))?;
            let detour = manager.outbound(detour_tag).ok_or_else(|| {
                Error::NotFound(format!("detour outbound not found: {}", detour_tag))
            })?;
            self.state.write().expect("provider lock poisoned").detour = Some(detour);
        }

        let token = CancellationToken::new();
        *cancel_slot = Some(token.clone());
        drop(cancel_slot);

        tokio::spawn(self.clone().refresh_loop(token));
        Ok(())
    }

    /// 取消拉取循环
    pub fn shutdown(&self) {
        if let Some(token) = self.cancel.lock().expect("provider lock poisoned").take() {
            token.cancel();
        }
    }
}

#[async_trait]
impl Provider for RemoteProvider {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn typ(&self) -> &str {
        "remote"
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        self.start_refresh()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        let _gate = self.update_gate.lock().await;
        let result = self.update_inner().await;
        // 首次尝试（无论成败）之后就绪，等待方不再阻塞
        self.ready.set();
        result
    }

    async fn updated_at(&self) -> Option<SystemTime> {
        self.read_state(|s| s.updated_at)
    }

    async fn info(&self) -> Option<ProviderInfo> {
        self.read_state(|s| s.info.clone())
    }

    async fn wait(&self) {
        self.ready.wait().await;
    }

    async fn outbounds(&self) -> Vec<ArcOutbound> {
        self.read_state(|s| s.outbounds.clone())
    }

    async fn outbound(&self, tag: &str) -> Option<ArcOutbound> {
        self.read_state(|s| s.by_tag.get(tag).cloned())
    }
}

fn content_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn touch(path: &PathBuf) {
    let result = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(e) = result {
        warn!(cache = %path.display(), error = %e, "update cache file mtime failed");
    }
}

fn write_cache(path: &PathBuf, body: &[u8]) {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    if let Err(e) = std::fs::write(path, body) {
        warn!(cache = %path.display(), error = %e, "write cache file failed");
        return;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666));
    }
}

/// Registry of providers in declaration order.
pub struct ProviderManager {
    inner: RwLock<ProviderRegistry>,
}

#[derive(Default)]
struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
    by_tag: HashMap<String, Arc<dyn Provider>>,
}

impl Default for ProviderManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ProviderRegistry::default()),
        }
    }

    pub fn register(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let mut inner = self.inner.write().expect("provider registry lock poisoned");
        let tag = provider.tag().to_string();
        if inner.by_tag.contains_key(&tag) {
            anyhow::bail!("duplicate provider tag '{}'", tag);
        }
        inner.by_tag.insert(tag, provider.clone());
        inner.providers.push(provider);
        Ok(())
    }

    pub fn provider(&self, tag: &str) -> Option<Arc<dyn Provider>> {
        self.inner
            .read()
            .expect("provider registry lock poisoned")
            .by_tag
            .get(tag)
            .cloned()
    }

    pub fn providers(&self) -> Vec<Arc<dyn Provider>> {
        self.inner
            .read()
            .expect("provider registry lock poisoned")
            .providers
            .clone()
    }

    pub async fn start_all(&self) -> Result<()> {
        for provider in self.providers() {
            provider.start().await?;
        }
        Ok(())
    }

    pub async fn close_all(&self) -> Result<()> {
        for provider in self.providers() {
            provider.close().await?;
        }
        Ok(())
    }
}

pub mod latency_test;
pub mod outbound_manager;
pub mod proxy_provider;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use crate::common::pause::PauseManager;
use crate::config::types::{Config, ProviderConfig};
use crate::proxy::group::history::HistoryStorage;
use crate::proxy::group::persistence::CacheFile;
use crate::proxy::outbound::default_registry;

use outbound_manager::OutboundManager;
use proxy_provider::{MemoryProvider, Provider, ProviderManager, RemoteProvider};

/// 出站核心的装配结果
pub struct App {
    pub manager: Arc<OutboundManager>,
    pub providers: Arc<ProviderManager>,
    pub pause: PauseManager,
}

impl App {
    /// 从配置装配管理器、provider 与出站；不启动任何循环
    pub async fn build(config: &Config) -> Result<App> {
        config.validate()?;

        let pause = PauseManager::new();
        let history = Arc::new(HistoryStorage::new());
        let cache = config
            .experimental
            .cache_file
            .as_ref()
            .map(|path| Arc::new(CacheFile::load_or_default(PathBuf::from(path))));
        let providers = Arc::new(ProviderManager::new());

        let manager = OutboundManager::new(
            default_registry(),
            providers.clone(),
            config.route.final_tag.clone(),
            cache,
            history,
            pause.clone(),
        );

        for provider_config in &config.providers {
            let provider = build_provider(&manager, provider_config)
                .with_context(|| format!("provider[{}]", provider_config.tag))?;
            providers.register(provider)?;
        }

        for outbound_config in &config.outbounds {
            manager
                .create(outbound_config.clone())
                .await
                .with_context(|| format!("outbound[{}]", outbound_config.tag))?;
        }

        Ok(App {
            manager,
            providers,
            pause,
        })
    }

    /// 启动 provider 刷新与出站（含组的健康检查）
    pub async fn start(&self) -> Result<()> {
        self.providers.start_all().await?;
        self.manager.start().await
    }

    pub async fn close(&self) -> Result<()> {
        let closed = self.manager.close().await;
        if let Err(e) = self.providers.close_all().await {
            warn!(error = %e, "close providers");
        }
        closed
    }
}

fn build_provider(
    manager: &Arc<OutboundManager>,
    config: &ProviderConfig,
) -> Result<Arc<dyn Provider>> {
    match config.provider_type.as_str() {
        "remote" => Ok(Arc::new(RemoteProvider::new(
            Arc::downgrade(manager),
            config,
        )?)),
        "inline" => {
            let mut members = Vec::with_capacity(config.outbounds.len());
            for member_config in &config.outbounds {
                let mut member_config = member_config.clone();
                member_config.tag = format!("{} {}", config.tag, member_config.tag);
                match manager.build_unmanaged(&member_config) {
                    Ok(outbound) => members.push(outbound),
                    Err(e) => {
                        warn!(provider = %config.tag, tag = %member_config.tag, error = %e, "create outbound failed");
                    }
                }
            }
            Ok(Arc::new(MemoryProvider::new(config.tag.clone(), members)))
        }
        other => anyhow::bail!("unsupported provider type: {}", other),
    }
}

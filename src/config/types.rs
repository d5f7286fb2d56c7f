use anyhow::Result;
use serde::{Deserialize, Deserializer};

use crate::common::Address;

/// 顶层配置（核心子集）
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub route: RouteConfig,
    #[serde(default)]
    pub experimental: ExperimentalConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for ob in &self.outbounds {
            if ob.tag.is_empty() {
                anyhow::bail!("outbound tag must not be empty");
            }
            if !seen.insert(ob.tag.as_str()) {
                anyhow::bail!("duplicate outbound tag '{}'", ob.tag);
            }
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.providers {
            if p.tag.is_empty() {
                anyhow::bail!("provider tag must not be empty");
            }
            if !seen.insert(p.tag.as_str()) {
                anyhow::bail!("duplicate provider tag '{}'", p.tag);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RouteConfig {
    /// 默认出站标签；为空时回落到首个注册的出站
    #[serde(default, rename = "final")]
    pub final_tag: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExperimentalConfig {
    /// 策略组选择结果持久化文件
    #[serde(default)]
    pub cache_file: Option<String>,
}

/// 单个出站的配置；组类型把成员与探测参数放在 `group` 平铺字段里
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboundConfig {
    #[serde(default)]
    pub tag: String,
    #[serde(rename = "type")]
    pub protocol: String,
    #[serde(default)]
    pub settings: OutboundSettings,
    #[serde(flatten)]
    pub group: GroupOptions,
}

impl OutboundConfig {
    pub fn leaf(tag: &str, protocol: &str) -> Self {
        Self {
            tag: tag.to_string(),
            protocol: protocol.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboundSettings {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub uuid: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub method: Option<String>,
    pub security: Option<String>,
    pub sni: Option<String>,
    #[serde(default)]
    pub allow_insecure: bool,
    pub flow: Option<String>,
    pub alter_id: Option<u16>,
    pub fingerprint: Option<String>,
    pub public_key: Option<String>,
    pub short_id: Option<String>,
    pub up_mbps: Option<u64>,
    pub down_mbps: Option<u64>,
    pub obfs: Option<String>,
    /// 经由哪个出站转发本出站的流量（链式前置）
    pub detour: Option<String>,
}

impl OutboundSettings {
    /// 服务器地址，缺 address/port 时报错
    pub fn server_addr(&self) -> Result<Address> {
        let host = self
            .address
            .clone()
            .ok_or_else(|| anyhow::anyhow!("missing server address"))?;
        let port = self
            .port
            .ok_or_else(|| anyhow::anyhow!("missing server port"))?;
        Ok(Address::Domain(host, port))
    }
}

/// 组公共选项 + 各组类型的专有字段
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupOptions {
    /// 同级出站成员（按标签引用）
    #[serde(default)]
    pub outbounds: Vec<String>,
    /// 订阅源成员（按 provider 标签引用）
    #[serde(default)]
    pub providers: Vec<String>,
    /// selector: 初始选中成员
    #[serde(default)]
    pub default: Option<String>,
    /// selector: 选择结果写入缓存文件
    #[serde(default)]
    pub store_selected: bool,
    /// url-test: 探测地址（覆盖 check.destination）
    #[serde(default)]
    pub url: Option<String>,
    /// url-test: 探测周期秒数（覆盖 check.interval）
    #[serde(default)]
    pub interval: Option<u64>,
    /// url-test: 切换容差（毫秒）
    #[serde(default)]
    pub tolerance: Option<u16>,
    /// load-balance: 健康检查参数
    #[serde(default)]
    pub check: Option<HealthCheckOptions>,
    /// load-balance: 选取策略参数
    #[serde(default)]
    pub pick: Option<PickOptions>,
}

/// 健康检查参数
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthCheckOptions {
    /// 探测周期秒数，默认 60，最小 10
    #[serde(default)]
    pub interval: Option<u64>,
    /// 滑动窗口长度，默认 10
    #[serde(default)]
    pub sampling: Option<u64>,
    /// 探测地址
    #[serde(default)]
    pub destination: Option<String>,
    /// 连通性兜底地址：全员失败时用来区分「节点坏」和「断网」
    #[serde(default)]
    pub connectivity: Option<String>,
    /// 探测时的前置链，成员流量依次经过这些出站
    #[serde(default, deserialize_with = "string_or_list")]
    pub detour_of: Vec<String>,
}

pub const DEFAULT_CHECK_DESTINATION: &str = "http://www.gstatic.com/generate_204";
pub const MIN_CHECK_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SAMPLING: usize = 10;

impl HealthCheckOptions {
    /// 应用默认值与下限
    pub fn normalized(&self) -> NormalizedCheckOptions {
        let interval = self
            .interval
            .unwrap_or(DEFAULT_CHECK_INTERVAL_SECS)
            .max(MIN_CHECK_INTERVAL_SECS);
        let sampling = match self.sampling {
            Some(n) if n > 0 => n as usize,
            _ => DEFAULT_SAMPLING,
        };
        NormalizedCheckOptions {
            interval: std::time::Duration::from_secs(interval),
            sampling,
            destination: self
                .destination
                .clone()
                .unwrap_or_else(|| DEFAULT_CHECK_DESTINATION.to_string()),
            connectivity: self.connectivity.clone(),
            detour_of: self.detour_of.clone(),
        }
    }
}

/// 归一化后的健康检查参数
#[derive(Debug, Clone)]
pub struct NormalizedCheckOptions {
    pub interval: std::time::Duration,
    pub sampling: usize,
    pub destination: String,
    pub connectivity: Option<String>,
    pub detour_of: Vec<String>,
}

/// load-balance 选取参数
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PickOptions {
    /// alive | rtt | weighted
    #[serde(default)]
    pub objective: Option<String>,
    /// random | round-robin | consistent-hashing | least-loaded
    #[serde(default)]
    pub strategy: Option<String>,
    /// 候选池上限，0 表示不限
    #[serde(default)]
    pub expected: usize,
    /// RTT 分层阈值（毫秒），逐层放宽直到候选数满足 expected
    #[serde(default)]
    pub baselines: Vec<u16>,
    /// rtt 目标下的中位 RTT 上限（毫秒），0 表示不限
    #[serde(default)]
    pub max_rtt: u16,
    /// alive 目标下窗口内允许的失败次数上限
    #[serde(default)]
    pub max_fail: usize,
}

/// 订阅源配置
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub tag: String,
    /// remote | inline
    #[serde(rename = "type", default = "default_provider_type")]
    pub provider_type: String,
    #[serde(default)]
    pub url: Option<String>,
    /// 拉取周期秒数，默认 1 小时，最小 1 分钟
    #[serde(default)]
    pub interval: Option<u64>,
    /// 候选标签保留条件（正则）
    #[serde(default)]
    pub include: Option<String>,
    /// 候选标签排除条件（正则）
    #[serde(default)]
    pub exclude: Option<String>,
    /// 原始订阅内容落盘路径，首次拉取失败时兜底
    #[serde(default)]
    pub cache_file: Option<String>,
    /// 经由哪个出站下载订阅；缺省用默认出站
    #[serde(default)]
    pub download_detour: Option<String>,
    /// inline: 固定成员列表
    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,
}

fn default_provider_type() -> String {
    "remote".to_string()
}

/// detour_of 兼容单字符串与列表两种写法，统一成列表
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

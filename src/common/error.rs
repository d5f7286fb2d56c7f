use thiserror::Error;

/// 核心错误类型
///
/// 调用方需要区分的错误都在这里；其余一律 anyhow 包装上抛。
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid: {0}")]
    Invalid(String),

    /// 依赖图成环，消息携带完整环路路径
    #[error("circular outbound dependency: {0}")]
    Cycle(String),

    #[error("dependency[{dependency}] not found for outbound[{outbound}]")]
    DependencyMissing {
        dependency: String,
        outbound: String,
    },

    #[error("default outbound not found: {0}")]
    DefaultMissing(String),

    #[error("fetch provider: {0}")]
    FetchFailure(String),

    /// 全员失败且连通性探测也失败：网络不可用，而非节点坏死
    #[error("no network")]
    NoNetwork,

    #[error("[{0}] detour not overridable")]
    NotOverridable(String),

    #[error("too deep or loop nesting of outbound groups")]
    DeepOrCyclic,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::other(e.to_string())
    }
}

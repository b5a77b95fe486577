//! 内核错误类型
//!
//! 配置错误在启动时致命；计划不一致不走这里（反应器转入 Invalid 后在下一 tick 修复）；
//! 同步失败上抛给 Agent，整个进程终止。

use thiserror::Error;

use crate::plan::Tick;

/// 分配、配置与同步阶段可能出现的错误
#[derive(Error, Debug)]
pub enum KernelError {
    /// 两个反应器声明同一条时间线的 Internal 所有权
    #[error("Timeline {timeline} already served by {server}, cannot be claimed by {claimant}")]
    DuplicateServer {
        timeline: String,
        server: String,
        claimant: String,
    },

    #[error("Duplicate reactor name: {0}")]
    DuplicateReactor(String),

    #[error("Unknown reactor component: {0}")]
    UnknownComponent(String),

    /// External 时间线没有服务者
    #[error("No server for timeline {timeline} observed by {reactor}")]
    MissingServer { timeline: String, reactor: String },

    /// 反应器订阅了自己的 Internal 时间线
    #[error("Reactor {reactor} cannot observe its own timeline {timeline}")]
    SelfDependency { reactor: String, timeline: String },

    #[error("Cyclic dependency between reactors: {0}")]
    CyclicDependency(String),

    #[error("Unknown timeline: {0}")]
    UnknownTimeline(String),

    /// 同步失败：没有"部分反应器失同步"的语义，直接终止
    #[error("Synchronization failure in {reactor} at tick {tick}")]
    SynchronizationFailure { reactor: String, tick: Tick },

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;

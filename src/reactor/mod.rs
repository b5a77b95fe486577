//! 反应器协议
//!
//! 每个反应器声明自己服务（Internal）和订阅（External）的时间线，在 tick 边界上被 Agent 回调：
//!
//! 1. `handle_tick_start`：所有反应器按注册顺序，派发待发送的请求
//! 2. `synchronize`：按依赖顺序，把执行前沿整理成一致状态并发布取值
//! 3. `has_work` / `resume`：时钟尚未推进时协作式审议，`resume` 只做一小步就返回
//!
//! 反应器之间只交换两种消息：观测（`notify`）与目标请求 / 撤回（`handle_request` / `handle_recall`），
//! 都经 [`ReactorContext`] 路由，反应器从不直接调用彼此。

pub mod adapter;
pub mod graph;
pub mod observer;
pub mod registry;

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::bus::{ReactorContext, ServerInfo};
use crate::core::error::Result;
use crate::plan::{Domain, Interval, Tick, Token, TokenKey};

pub use adapter::Adapter;
pub use graph::DependencyGraph;
pub use observer::ObserverReactor;
pub use registry::{ReactorFactory, ReactorRegistry};

/// 时间线上发布的一个取值
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timeline: String,
    pub predicate: String,
    #[serde(default)]
    pub params: BTreeMap<String, Domain>,
}

impl Observation {
    pub fn new(timeline: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self {
            timeline: timeline.into(),
            predicate: predicate.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, dom: Domain) -> Self {
        self.params.insert(name.into(), dom);
        self
    }

    /// 从已发布的 Token 取快照
    pub fn from_token(token: &Token) -> Self {
        Self {
            timeline: token.timeline().to_string(),
            predicate: token.predicate().to_string(),
            params: token
                .params()
                .map(|(name, dom)| (name.to_string(), dom.clone()))
                .collect(),
        }
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.timeline, self.predicate)?;
        if !self.params.is_empty() {
            let items: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "({})", items.join(", "))?;
        }
        Ok(())
    }
}

/// 发往服务者的目标请求快照；`key` 是请求方本地 Token 的键，服务者据此建外键
#[derive(Clone, Debug, PartialEq)]
pub struct GoalRequest {
    pub key: TokenKey,
    pub timeline: String,
    pub predicate: String,
    pub params: BTreeMap<String, Domain>,
    pub start: Interval,
    pub end: Interval,
    pub duration: Interval,
}

impl GoalRequest {
    pub fn from_token(token: &Token) -> Self {
        Self {
            key: token.key(),
            timeline: token.timeline().to_string(),
            predicate: token.predicate().to_string(),
            params: token
                .params()
                .map(|(name, dom)| (name.to_string(), dom.clone()))
                .collect(),
            start: token.start().last,
            end: token.end().last,
            duration: token.duration().last,
        }
    }
}

impl fmt::Display for GoalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({}) start={} end={}",
            self.timeline, self.predicate, self.key, self.start, self.end
        )
    }
}

/// 时间线声明：(externals, internals)
#[derive(Clone, Debug, Default)]
pub struct TimelineModes {
    pub externals: Vec<String>,
    pub internals: Vec<String>,
}

/// 所有反应器共有的属性与计数
#[derive(Clone, Debug)]
pub struct ReactorBase {
    name: String,
    lookahead: Tick,
    latency: Tick,
    log: bool,
    sync_steps: u64,
    search_steps: u64,
}

impl ReactorBase {
    pub fn new(name: impl Into<String>, lookahead: Tick, latency: Tick) -> Self {
        Self {
            name: name.into(),
            lookahead,
            latency,
            log: false,
            sync_steps: 0,
            search_steps: 0,
        }
    }

    pub fn with_log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lookahead(&self) -> Tick {
        self.lookahead
    }

    pub fn latency(&self) -> Tick {
        self.latency
    }

    pub fn log_enabled(&self) -> bool {
        self.log
    }

    pub fn sync_steps(&self) -> u64 {
        self.sync_steps
    }

    pub fn search_steps(&self) -> u64 {
        self.search_steps
    }

    pub fn add_sync_steps(&mut self, n: u64) {
        self.sync_steps += n;
    }

    pub fn add_search_steps(&mut self, n: u64) {
        self.search_steps += n;
    }

    pub fn reset_counters(&mut self) {
        self.sync_steps = 0;
        self.search_steps = 0;
    }
}

/// 反应器 trait：生命周期回调与消息处理
///
/// 默认实现对应一个什么都不做的纯反应式组件。
pub trait Reactor: Send {
    fn base(&self) -> &ReactorBase;

    fn base_mut(&mut self) -> &mut ReactorBase;

    fn name(&self) -> &str {
        self.base().name()
    }

    /// 供测试与诊断向下转型
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// 声明订阅与服务的时间线
    fn query_timeline_modes(&self) -> TimelineModes;

    /// 分配完成后调用一次；`servers` 为本反应器各 External 时间线的服务者信息
    fn handle_init(
        &mut self,
        _initial_tick: Tick,
        _servers: &HashMap<String, ServerInfo>,
        _ctx: &mut ReactorContext<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn handle_tick_start(&mut self, _ctx: &mut ReactorContext<'_>) {}

    /// 返回 false 表示无法同步，Agent 将整体终止
    fn synchronize(&mut self, ctx: &mut ReactorContext<'_>) -> bool;

    fn has_work(&mut self, _ctx: &mut ReactorContext<'_>) -> bool {
        false
    }

    /// 审议一小步；不得阻塞
    fn resume(&mut self, _ctx: &mut ReactorContext<'_>) {}

    fn notify(&mut self, _obs: &Observation, _ctx: &mut ReactorContext<'_>) {}

    /// 接受返回 true
    fn handle_request(&mut self, _goal: &GoalRequest, _ctx: &mut ReactorContext<'_>) -> bool {
        false
    }

    fn handle_recall(&mut self, _goal: &GoalRequest, _ctx: &mut ReactorContext<'_>) {}

    /// 拆除前调用：上报剩余目标的结局
    fn shutdown(&mut self, _ctx: &mut ReactorContext<'_>) {}
}

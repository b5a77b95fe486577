//! teleo - tick 驱动的反应器执行内核
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 时钟、消息总线、Agent 主循环、事件与观测日志、终止管理
//! - **plan**: 变量域、Token、时间线、规则模型与最小计划数据库
//! - **reactor**: 反应器协议、依赖图、组件注册表、Adapter / Observer
//! - **deliberative**: 基于计划数据库的审议反应器与执行前沿同步
//! - **search**: 目标排序器与回溯搜索
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod deliberative;
pub mod observability;
pub mod plan;
pub mod reactor;
pub mod search;

pub use crate::core::{Agent, AgentBuilder, KernelError};
pub use crate::deliberative::DbCore;
pub use crate::reactor::{GoalRequest, Observation, Reactor};

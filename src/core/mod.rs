//! 执行内核：时钟、消息总线、Agent 主循环、事件与观测日志、终止管理

pub mod agent;
pub mod builder;
pub mod bus;
pub mod clock;
pub mod error;
pub mod event;
pub mod monitor;
pub mod observation_log;
pub mod shutdown;

pub use agent::Agent;
pub use builder::{build_clock, AgentBuilder};
pub use bus::{ReactorContext, ServerInfo};
pub use clock::{Clock, ClockStats, PseudoClock, RealTimeClock, ResourceUsage};
pub use error::{KernelError, Result};
pub use event::{AgentListener, EventKind, EventLog, MissionEvent};
pub use monitor::{PerformanceMonitor, TickData};
pub use observation_log::{ObservationLog, ObservationRecord};
pub use shutdown::{ShutdownManager, ShutdownReason};

//! 只订阅、不服务的记录型反应器：把收到的观测写进日志并保留在内存里

use std::any::Any;

use crate::config::ReactorConfig;
use crate::core::bus::ReactorContext;
use crate::plan::Tick;

use super::{Observation, Reactor, ReactorBase, TimelineModes};

pub struct ObserverReactor {
    base: ReactorBase,
    timelines: Vec<String>,
    received: Vec<(Tick, Observation)>,
}

impl ObserverReactor {
    /// 配置中声明的所有时间线都作为订阅
    pub fn from_config(cfg: &ReactorConfig) -> Self {
        Self {
            base: ReactorBase::new(cfg.name.clone(), 0, cfg.latency).with_log(cfg.log),
            timelines: cfg.timelines.iter().map(|tl| tl.name.clone()).collect(),
            received: Vec::new(),
        }
    }

    pub fn received(&self) -> &[(Tick, Observation)] {
        &self.received
    }
}

impl Reactor for ObserverReactor {
    fn base(&self) -> &ReactorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ReactorBase {
        &mut self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn query_timeline_modes(&self) -> TimelineModes {
        TimelineModes {
            externals: self.timelines.clone(),
            internals: Vec::new(),
        }
    }

    fn synchronize(&mut self, _ctx: &mut ReactorContext<'_>) -> bool {
        true
    }

    fn notify(&mut self, obs: &Observation, ctx: &mut ReactorContext<'_>) {
        let tick = ctx.current_tick();
        tracing::info!("{}: [{}] observed {}", self.name(), tick, obs);
        self.received.push((tick, obs.clone()));
    }
}

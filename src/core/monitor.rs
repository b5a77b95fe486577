//! 每 tick 的性能记录：同步耗时、审议耗时与审议步数

use std::time::Duration;

use crate::plan::Tick;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickData {
    pub tick: Tick,
    pub synchronization: Duration,
    pub deliberation: Duration,
    pub resumes: u32,
}

#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    ticks: Vec<TickData>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tick_data(&mut self, data: TickData) {
        tracing::debug!(
            "tick {} sync={:?} deliberation={:?} resumes={}",
            data.tick,
            data.synchronization,
            data.deliberation,
            data.resumes
        );
        self.ticks.push(data);
    }

    pub fn ticks(&self) -> &[TickData] {
        &self.ticks
    }

    pub fn total_synchronization(&self) -> Duration {
        self.ticks.iter().map(|t| t.synchronization).sum()
    }

    pub fn total_deliberation(&self) -> Duration {
        self.ticks.iter().map(|t| t.deliberation).sum()
    }

    /// 最慢的同步 tick
    pub fn worst_synchronization(&self) -> Option<&TickData> {
        self.ticks.iter().max_by_key(|t| t.synchronization)
    }
}

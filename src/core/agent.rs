//! Agent：分配反应器、计算依赖顺序、驱动 tick 循环
//!
//! 每个 tick：
//! 1. 所有反应器按注册顺序 `handle_tick_start`
//! 2. 按依赖顺序 `synchronize`，任一失败即致命
//! 3. 时钟尚未推进时，按依赖顺序挑第一个有审议预算且 `has_work` 的反应器 `resume` 一次
//! 4. 没有反应器可执行后睡到时钟推进，然后 tick 加一

use std::collections::HashMap;
use std::time::Instant;

use crate::core::bus::{Bus, ServerInfo};
use crate::core::clock::Clock;
use crate::core::error::{KernelError, Result};
use crate::core::event::{AgentListener, EventLog};
use crate::core::monitor::{PerformanceMonitor, TickData};
use crate::core::observation_log::ObservationLog;
use crate::core::shutdown::{ShutdownManager, ShutdownReason};
use crate::plan::Tick;
use crate::reactor::{DependencyGraph, Reactor};

pub struct Agent {
    name: String,
    bus: Bus,
    /// 同步顺序（依赖拓扑序）
    sorted: Vec<usize>,
    /// 本 tick 还可能有审议工作的反应器
    deliberators: Vec<usize>,
    clock: Box<dyn Clock>,
    current_tick: Tick,
    shutdown: ShutdownManager,
    monitor: PerformanceMonitor,
    torn_down: bool,
}

impl Agent {
    /// 分配：校验时间线所有权、计算依赖顺序并初始化所有反应器
    pub fn new(
        name: impl Into<String>,
        final_tick: Tick,
        clock: Box<dyn Clock>,
        reactors: Vec<Box<dyn Reactor>>,
        event_log: EventLog,
    ) -> Result<Self> {
        let name = name.into();
        let mut bus = Bus::new(final_tick, event_log);

        let mut servers: HashMap<String, usize> = HashMap::new();
        let mut externals: Vec<Vec<String>> = Vec::new();
        for reactor in reactors {
            if bus.index_of(reactor.name()).is_some() {
                return Err(KernelError::DuplicateReactor(reactor.name().to_string()));
            }
            let modes = reactor.query_timeline_modes();
            let idx = bus.add_reactor(reactor);
            for timeline in modes.internals {
                if let Some(&owner) = servers.get(&timeline) {
                    return Err(KernelError::DuplicateServer {
                        timeline,
                        server: bus.reactor_name(owner).unwrap_or_default().to_string(),
                        claimant: bus.reactor_name(idx).unwrap_or_default().to_string(),
                    });
                }
                bus.set_server(&timeline, idx);
                servers.insert(timeline, idx);
            }
            externals.push(modes.externals);
        }

        let mut graph = DependencyGraph::new(bus.len());
        for (idx, timelines) in externals.iter().enumerate() {
            let reactor = bus.reactor_name(idx).unwrap_or_default().to_string();
            for timeline in timelines {
                match servers.get(timeline) {
                    Some(&server) if server == idx => {
                        return Err(KernelError::SelfDependency {
                            reactor,
                            timeline: timeline.clone(),
                        });
                    }
                    Some(&server) => {
                        graph.add_edge(server, idx);
                        bus.add_observer(timeline, idx);
                    }
                    None => {
                        return Err(KernelError::MissingServer {
                            timeline: timeline.clone(),
                            reactor,
                        });
                    }
                }
            }
        }

        let sorted = graph.sort().map_err(|cycle| {
            let names: Vec<&str> = cycle.iter().filter_map(|&i| bus.reactor_name(i)).collect();
            KernelError::CyclicDependency(names.join(", "))
        })?;

        for &idx in &sorted {
            let server_dir: HashMap<String, ServerInfo> = externals[idx]
                .iter()
                .filter_map(|tl| bus.server_info(tl).map(|info| (tl.clone(), info)))
                .collect();
            bus.with_reactor(idx, |r, ctx| r.handle_init(0, &server_dir, ctx))
                .unwrap_or(Ok(()))?;
        }

        let order: Vec<&str> = sorted.iter().filter_map(|&i| bus.reactor_name(i)).collect();
        tracing::info!("[{}] reactors in synchronization order: {}", name, order.join(", "));

        Ok(Self {
            name,
            bus,
            deliberators: Vec::new(),
            sorted,
            clock,
            current_tick: 0,
            shutdown: ShutdownManager::new(),
            monitor: PerformanceMonitor::new(),
            torn_down: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick
    }

    pub fn final_tick(&self) -> Tick {
        self.bus.final_tick()
    }

    pub fn is_mission_complete(&self) -> bool {
        self.current_tick >= self.bus.final_tick()
    }

    /// 时间线的服务者
    pub fn owner(&self, timeline: &str) -> Option<&str> {
        self.bus.owner(timeline)
    }

    pub fn reactor(&self, name: &str) -> Option<&dyn Reactor> {
        self.bus.index_of(name).and_then(|i| self.bus.reactor(i))
    }

    /// 同步顺序中的反应器名
    pub fn sorted_reactors(&self) -> Vec<&str> {
        self.sorted
            .iter()
            .filter_map(|&i| self.bus.reactor_name(i))
            .collect()
    }

    pub fn event_log(&self) -> &EventLog {
        self.bus.event_log()
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn add_listener(&mut self, listener: Box<dyn AgentListener>) {
        self.bus.add_listener(listener);
    }

    pub fn set_observation_log(&mut self, log: ObservationLog) {
        self.bus.set_observation_log(log);
    }

    /// 终止管理器的句柄（信号处理器用它设置终止标志）
    pub fn shutdown_manager(&self) -> ShutdownManager {
        self.shutdown.clone()
    }

    pub fn use_shutdown_manager(&mut self, manager: ShutdownManager) {
        self.shutdown = manager;
    }

    pub fn terminate(&self) {
        self.shutdown.shutdown(ShutdownReason::Requested);
    }

    pub fn is_terminated(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// 执行一个 tick；任务结束或已终止返回 false
    pub fn do_next(&mut self) -> Result<bool> {
        if self.is_terminated() || self.is_mission_complete() {
            return Ok(false);
        }
        let tick = self.current_tick;
        self.bus.set_current_tick(tick);
        self.deliberators = self.sorted.clone();

        for idx in 0..self.bus.len() {
            self.bus.with_reactor(idx, |r, ctx| {
                r.base_mut().reset_counters();
                r.handle_tick_start(ctx);
            });
        }

        let sync_started = Instant::now();
        for i in 0..self.sorted.len() {
            if self.is_terminated() {
                return Ok(false);
            }
            let idx = self.sorted[i];
            let synchronized = self
                .bus
                .with_reactor(idx, |r, ctx| r.synchronize(ctx))
                .unwrap_or(false);
            if !synchronized {
                let reactor = self.bus.reactor_name(idx).unwrap_or_default().to_string();
                tracing::error!("[{}] synchronization failed in {} at tick {}", self.name, reactor, tick);
                self.shutdown
                    .shutdown(ShutdownReason::SynchronizationFailure(reactor.clone()));
                return Err(KernelError::SynchronizationFailure { reactor, tick });
            }
        }
        let synchronization = sync_started.elapsed();

        let deliberation_started = Instant::now();
        let mut resumes = 0;
        while self.clock.get_next_tick() <= tick && self.execute_reactor() {
            resumes += 1;
        }
        let deliberation = deliberation_started.elapsed();

        while self.clock.get_next_tick() <= tick {
            self.clock.sleep();
        }

        self.monitor.add_tick_data(TickData {
            tick,
            synchronization,
            deliberation,
            resumes,
        });
        self.current_tick += 1;
        Ok(true)
    }

    /// 按依赖顺序挑第一个可审议的反应器执行一步；没有则返回 false
    fn execute_reactor(&mut self) -> bool {
        while let Some(&idx) = self.deliberators.first() {
            if self.bus.lookahead(idx) > 0
                && self
                    .bus
                    .with_reactor(idx, |r, ctx| r.has_work(ctx))
                    .unwrap_or(false)
            {
                self.bus.with_reactor(idx, |r, ctx| r.resume(ctx));
                return true;
            }
            self.deliberators.remove(0);
        }
        false
    }

    /// 启动时钟并循环执行直到任务结束或被终止；最后拆除所有反应器
    pub fn run(&mut self) -> Result<()> {
        tracing::info!(
            "[{}] mission starting, final tick {}",
            self.name,
            self.bus.final_tick()
        );
        self.clock.start();
        let result = loop {
            match self.do_next() {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        if result.is_ok() && self.is_mission_complete() {
            self.shutdown.shutdown(ShutdownReason::MissionComplete);
        }
        tracing::info!(
            "[{}] mission stopped at tick {}, {:?} (sync {:?}, deliberation {:?})",
            self.name,
            self.current_tick,
            self.shutdown.reason(),
            self.monitor.total_synchronization(),
            self.monitor.total_deliberation()
        );
        self.teardown();
        result
    }

    /// 拆除：先让每个反应器上报目标结局，再释放
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        for idx in 0..self.bus.len() {
            self.bus.with_reactor(idx, |r, ctx| r.shutdown(ctx));
        }
        self.bus.flush_logs();
        drop(self.bus.take_reactors());
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.teardown();
    }
}

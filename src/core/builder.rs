//! Agent 构建器：从配置实例化时钟、反应器与日志
//!
//! 反应器按 `[[reactors]]` 的顺序经组件注册表创建，这也是它们的注册顺序。
//! 日志文件（事件日志、观测日志）写到 `<log_dir>/<agent>.*`；`in_memory()` 关闭文件输出。

use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::config::{AppConfig, ClockKind, ClockSection};
use crate::core::agent::Agent;
use crate::core::clock::{Clock, PseudoClock, RealTimeClock};
use crate::core::error::Result;
use crate::core::event::{AgentListener, EventLog};
use crate::core::observation_log::ObservationLog;
use crate::reactor::{Reactor, ReactorRegistry};

pub struct AgentBuilder {
    config: AppConfig,
    registry: ReactorRegistry,
    clock: Option<Box<dyn Clock>>,
    listeners: Vec<Box<dyn AgentListener>>,
    write_files: bool,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: ReactorRegistry::new(),
            clock: None,
            listeners: Vec::new(),
            write_files: true,
        }
    }

    /// 替换组件注册表（追加自定义组件时使用）
    pub fn with_registry(mut self, registry: ReactorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// 指定时钟，忽略 `[clock]` 段
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_listener(mut self, listener: Box<dyn AgentListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// 不写任何日志文件
    pub fn in_memory(mut self) -> Self {
        self.write_files = false;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build_reactors(&self) -> Result<Vec<Box<dyn Reactor>>> {
        self.config
            .reactors
            .iter()
            .map(|cfg| self.registry.create(cfg))
            .collect()
    }

    fn log_path(&self, suffix: &str) -> PathBuf {
        self.config
            .agent
            .log_dir
            .join(format!("{}.{}", self.config.agent.name, suffix))
    }

    fn build_event_log(&self) -> Result<EventLog> {
        let log = EventLog::new(self.config.agent.event_log);
        if !(self.write_files && log.is_enabled()) {
            return Ok(log);
        }
        let path = self.log_path("events.log");
        let file = open_append(&path)?;
        tracing::debug!("event log at {}", path.display());
        Ok(log.with_sink(Box::new(BufWriter::new(file))))
    }

    pub fn build(mut self) -> Result<Agent> {
        let reactors = self.build_reactors()?;
        let event_log = self.build_event_log()?;
        let clock = self
            .clock
            .take()
            .unwrap_or_else(|| build_clock(&self.config.clock));

        let agent_cfg = &self.config.agent;
        let mut agent = Agent::new(
            agent_cfg.name.clone(),
            agent_cfg.final_tick,
            clock,
            reactors,
            event_log,
        )?;

        if self.write_files && agent_cfg.observation_log {
            let path = self.log_path("obs.jsonl");
            agent.set_observation_log(ObservationLog::open(&path)?);
            tracing::info!("recording observations to {}", path.display());
        }
        for listener in self.listeners.drain(..) {
            agent.add_listener(listener);
        }
        Ok(agent)
    }
}

/// 伪时钟每步睡眠 `seconds_per_tick / steps_per_tick`，整体节奏接近实时
pub fn build_clock(cfg: &ClockSection) -> Box<dyn Clock> {
    match cfg.kind {
        ClockKind::Pseudo => {
            let steps = cfg.steps_per_tick.max(1);
            Box::new(PseudoClock::new(
                cfg.seconds_per_tick / steps as f64,
                cfg.steps_per_tick,
                cfg.stats,
            ))
        }
        ClockKind::Realtime => Box::new(RealTimeClock::new(cfg.seconds_per_tick, cfg.stats)),
    }
}

fn open_append(path: &Path) -> Result<std::fs::File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::core::error::KernelError;

    const TWO_REACTORS: &str = r#"
        [agent]
        name = "lamp"
        final_tick = 3
        event_log = true
        observation_log = true

        [[reactors]]
        name = "world"
        component = "Adapter"
        timelines = [{ name = "light" }]
        observations = [{ tick = 0, timeline = "light", predicate = "Holds", params = { value = "on" } }]

        [[reactors]]
        name = "watcher"
        component = "Observer"
        timelines = [{ name = "light", mode = "external" }]
    "#;

    #[test]
    fn test_build_writes_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = parse_config(TWO_REACTORS).unwrap();
        cfg.agent.log_dir = dir.path().to_path_buf();

        let mut agent = AgentBuilder::new(cfg)
            .with_clock(Box::new(PseudoClock::new(0.0, 2, false)))
            .build()
            .unwrap();
        assert_eq!(agent.sorted_reactors(), vec!["world", "watcher"]);
        agent.run().unwrap();
        assert_eq!(agent.current_tick(), 3);

        let events = std::fs::read_to_string(dir.path().join("lamp.events.log")).unwrap();
        assert_eq!(events.lines().next(), Some("0 NOTIFY light Holds"));
        let records = ObservationLog::read_all(&dir.path().join("lamp.obs.jsonl")).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_unknown_component_fails_build() {
        let mut cfg = parse_config(TWO_REACTORS).unwrap();
        cfg.reactors[1].component = "Telescope".into();
        let err = AgentBuilder::new(cfg).in_memory().build().err().unwrap();
        assert!(matches!(err, KernelError::UnknownComponent(_)));
    }

    #[test]
    fn test_pseudo_clock_from_config() {
        let mut clock = build_clock(&ClockSection {
            kind: ClockKind::Pseudo,
            seconds_per_tick: 0.0,
            steps_per_tick: 3,
            stats: false,
        });
        let ticks: Vec<_> = (0..7).map(|_| clock.get_next_tick()).collect();
        assert_eq!(ticks, vec![0, 0, 0, 1, 1, 1, 2]);
    }
}

//! Adapter：外部世界的纯反应式替身
//!
//! 服务配置中声明的 Internal 时间线。每个 tick 同步时发布：
//! - 脚本化观测（`observations`）与回放日志（`replay`）中时刻已到的取值
//! - 已接受、开始时间区间包含当前 tick 的请求，视为指令已执行
//!
//! 同一 tick 同一时间线只发布一个取值，脚本优先于请求。

use std::any::Any;
use std::collections::BTreeMap;

use crate::config::ReactorConfig;
use crate::core::bus::ReactorContext;
use crate::core::error::{KernelError, Result};
use crate::core::observation_log::ObservationLog;
use crate::plan::{Tick, TimelineMode};

use super::{GoalRequest, Observation, Reactor, ReactorBase, TimelineModes};

pub struct Adapter {
    base: ReactorBase,
    timelines: Vec<String>,
    /// 按 tick 排列的待发布观测
    script: BTreeMap<Tick, Vec<Observation>>,
    requests: Vec<GoalRequest>,
    published: Vec<(Tick, Observation)>,
}

impl Adapter {
    pub fn from_config(cfg: &ReactorConfig) -> Result<Self> {
        let mut timelines = Vec::new();
        for tl in &cfg.timelines {
            if tl.mode != TimelineMode::Internal {
                return Err(KernelError::Config(format!(
                    "adapter {} can only serve internal timelines, {} is {:?}",
                    cfg.name, tl.name, tl.mode
                )));
            }
            timelines.push(tl.name.clone());
        }

        let mut script: BTreeMap<Tick, Vec<Observation>> = BTreeMap::new();
        for obs in &cfg.observations {
            script.entry(obs.tick).or_default().push(Observation {
                timeline: obs.timeline.clone(),
                predicate: obs.predicate.clone(),
                params: obs.params.clone(),
            });
        }
        if let Some(path) = &cfg.replay {
            let records = ObservationLog::read_all(path)?;
            tracing::info!("{}: replaying {} observations from {}", cfg.name, records.len(), path.display());
            for record in records {
                script.entry(record.tick).or_default().push(record.observation);
            }
        }
        if let Some(obs) = script
            .values()
            .flatten()
            .find(|o| !timelines.contains(&o.timeline))
        {
            return Err(KernelError::Config(format!(
                "adapter {} scripts {} on an undeclared timeline",
                cfg.name, obs
            )));
        }

        Ok(Self {
            base: ReactorBase::new(cfg.name.clone(), 0, cfg.latency).with_log(cfg.log),
            timelines,
            script,
            requests: Vec::new(),
            published: Vec::new(),
        })
    }

    /// 已发布的 (tick, 观测)
    pub fn published(&self) -> &[(Tick, Observation)] {
        &self.published
    }

    pub fn pending_requests(&self) -> &[GoalRequest] {
        &self.requests
    }

    fn serves(&self, timeline: &str) -> bool {
        self.timelines.iter().any(|t| t == timeline)
    }
}

impl Reactor for Adapter {
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
            externals: Vec::new(),
            internals: self.timelines.clone(),
        }
    }

    fn synchronize(&mut self, ctx: &mut ReactorContext<'_>) -> bool {
        let now = ctx.current_tick();
        let mut outgoing: BTreeMap<String, Observation> = BTreeMap::new();

        let due: Vec<Tick> = self.script.range(..=now).map(|(&t, _)| t).collect();
        for tick in due {
            for obs in self.script.remove(&tick).unwrap_or_default() {
                if tick < now {
                    tracing::warn!("{}: {} scripted for tick {} published late", self.name(), obs, tick);
                }
                outgoing.insert(obs.timeline.clone(), obs);
            }
        }

        let mut kept = Vec::with_capacity(self.requests.len());
        for goal in std::mem::take(&mut self.requests) {
            if goal.start.ub < now {
                tracing::warn!("{}: request {} expired", self.name(), goal);
            } else if goal.start.lb <= now && !outgoing.contains_key(&goal.timeline) {
                tracing::debug!("{}: executing {}", self.name(), goal);
                outgoing.insert(
                    goal.timeline.clone(),
                    Observation {
                        timeline: goal.timeline.clone(),
                        predicate: goal.predicate.clone(),
                        params: goal.params.clone(),
                    },
                );
            } else {
                kept.push(goal);
            }
        }
        self.requests = kept;

        for obs in outgoing.into_values() {
            if self.base.log_enabled() {
                tracing::info!("{}: [{}] {}", self.name(), now, obs);
            }
            ctx.notify(&obs);
            self.published.push((now, obs));
        }
        true
    }

    fn handle_request(&mut self, goal: &GoalRequest, _ctx: &mut ReactorContext<'_>) -> bool {
        if !self.serves(&goal.timeline) {
            return false;
        }
        if self.requests.iter().any(|g| g.key == goal.key) {
            return true;
        }
        self.requests.push(goal.clone());
        true
    }

    fn handle_recall(&mut self, goal: &GoalRequest, _ctx: &mut ReactorContext<'_>) {
        self.requests.retain(|g| g.key != goal.key);
    }

    fn shutdown(&mut self, _ctx: &mut ReactorContext<'_>) {
        if !self.requests.is_empty() {
            tracing::info!("{}: {} requests never executed", self.name(), self.requests.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScriptedObservation, TimelineConfig};
    use crate::plan::Domain;

    fn scripted(tick: Tick, timeline: &str, predicate: &str) -> ScriptedObservation {
        ScriptedObservation {
            tick,
            timeline: timeline.into(),
            predicate: predicate.into(),
            params: Default::default(),
        }
    }

    #[test]
    fn test_rejects_undeclared_script_timeline() {
        let cfg = ReactorConfig::new("world", "Adapter")
            .with_timeline(TimelineConfig::internal("light"))
            .with_observation(scripted(0, "door", "Open"));
        assert!(matches!(Adapter::from_config(&cfg), Err(KernelError::Config(_))));
    }

    #[test]
    fn test_replay_log_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.obs.jsonl");
        let mut log = ObservationLog::open(&path).unwrap();
        log.record(2, &Observation::new("light", "Holds").with_param("value", Domain::symbol("off")))
            .unwrap();
        log.flush().unwrap();

        let mut cfg = ReactorConfig::new("world", "Adapter")
            .with_timeline(TimelineConfig::internal("light"))
            .with_observation(scripted(0, "light", "Holds"));
        cfg.replay = Some(path);
        let adapter = Adapter::from_config(&cfg).unwrap();
        assert_eq!(adapter.script.len(), 2);
        assert_eq!(adapter.script[&2][0].params["value"], Domain::symbol("off"));
    }
}

//! 消息总线：按时间线路由观测、请求与撤回
//!
//! 反应器存放在槽位里。回调某个反应器时先把它从槽位取出，回调结束后放回；
//! 回调期间它通过 [`ReactorContext`] 访问总线，进而触达其他反应器。
//! 若消息路由到一个正处于回调中的反应器（槽位为空），记录警告并按拒绝处理。

use std::collections::HashMap;

use crate::core::event::{AgentListener, EventKind, EventLog};
use crate::core::observation_log::ObservationLog;
use crate::plan::Tick;
use crate::reactor::{GoalRequest, Observation, Reactor};

/// 服务者信息：请求方据此计算派发窗口
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub reactor: String,
    pub latency: Tick,
    pub lookahead: Tick,
}

struct Slot {
    name: String,
    latency: Tick,
    lookahead: Tick,
    reactor: Option<Box<dyn Reactor>>,
}

pub struct Bus {
    slots: Vec<Slot>,
    servers: HashMap<String, usize>,
    observers: HashMap<String, Vec<usize>>,
    current_tick: Tick,
    final_tick: Tick,
    event_log: EventLog,
    observation_log: Option<ObservationLog>,
    listeners: Vec<Box<dyn AgentListener>>,
}

impl Bus {
    pub(crate) fn new(final_tick: Tick, event_log: EventLog) -> Self {
        Self {
            slots: Vec::new(),
            servers: HashMap::new(),
            observers: HashMap::new(),
            current_tick: 0,
            final_tick,
            event_log,
            observation_log: None,
            listeners: Vec::new(),
        }
    }

    /// 注册反应器，返回其注册序号
    pub(crate) fn add_reactor(&mut self, reactor: Box<dyn Reactor>) -> usize {
        let base = reactor.base();
        self.slots.push(Slot {
            name: base.name().to_string(),
            latency: base.latency(),
            lookahead: base.lookahead(),
            reactor: Some(reactor),
        });
        self.slots.len() - 1
    }

    pub(crate) fn set_server(&mut self, timeline: &str, idx: usize) {
        self.servers.insert(timeline.to_string(), idx);
    }

    /// 观测者按注册顺序追加
    pub(crate) fn add_observer(&mut self, timeline: &str, idx: usize) {
        let list = self.observers.entry(timeline.to_string()).or_default();
        if !list.contains(&idx) {
            list.push(idx);
        }
    }

    pub(crate) fn set_observation_log(&mut self, log: ObservationLog) {
        self.observation_log = Some(log);
    }

    pub(crate) fn add_listener(&mut self, listener: Box<dyn AgentListener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn set_current_tick(&mut self, tick: Tick) {
        self.current_tick = tick;
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick
    }

    pub fn final_tick(&self) -> Tick {
        self.final_tick
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn reactor_name(&self, idx: usize) -> Option<&str> {
        self.slots.get(idx).map(|s| s.name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.name == name)
    }

    pub fn lookahead(&self, idx: usize) -> Tick {
        self.slots.get(idx).map(|s| s.lookahead).unwrap_or(0)
    }

    /// 时间线的服务者名
    pub fn owner(&self, timeline: &str) -> Option<&str> {
        self.servers
            .get(timeline)
            .and_then(|&i| self.reactor_name(i))
    }

    pub fn server_info(&self, timeline: &str) -> Option<ServerInfo> {
        let slot = self.servers.get(timeline).and_then(|&i| self.slots.get(i))?;
        Some(ServerInfo {
            reactor: slot.name.clone(),
            latency: slot.latency,
            lookahead: slot.lookahead,
        })
    }

    pub fn reactor(&self, idx: usize) -> Option<&dyn Reactor> {
        self.slots.get(idx).and_then(|s| s.reactor.as_deref())
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub(crate) fn flush_logs(&mut self) {
        self.event_log.flush();
        if let Some(log) = self.observation_log.as_mut() {
            if let Err(e) = log.flush() {
                tracing::warn!("observation log flush failed: {}", e);
            }
        }
    }

    /// 取出反应器执行回调后放回；槽位为空（正在回调中）时返回 None
    pub(crate) fn with_reactor<R>(
        &mut self,
        idx: usize,
        f: impl FnOnce(&mut dyn Reactor, &mut ReactorContext<'_>) -> R,
    ) -> Option<R> {
        let mut reactor = self.slots.get_mut(idx)?.reactor.take()?;
        let result = {
            let mut ctx = ReactorContext { bus: self, me: idx };
            f(reactor.as_mut(), &mut ctx)
        };
        if let Some(slot) = self.slots.get_mut(idx) {
            slot.reactor = Some(reactor);
        }
        Some(result)
    }

    pub(crate) fn take_reactors(&mut self) -> Vec<Box<dyn Reactor>> {
        self.slots.iter_mut().filter_map(|s| s.reactor.take()).collect()
    }

    fn notify(&mut self, from: usize, obs: &Observation) {
        let tick = self.current_tick;
        self.event_log
            .record(tick, EventKind::Notify, &obs.timeline, &obs.predicate);
        if let Some(log) = self.observation_log.as_mut() {
            if let Err(e) = log.record(tick, obs) {
                tracing::warn!("observation log write failed: {}", e);
            }
        }
        let observers = self.observers.get(&obs.timeline).cloned().unwrap_or_default();
        for idx in observers.into_iter().filter(|&i| i != from) {
            if self.with_reactor(idx, |r, ctx| r.notify(obs, ctx)).is_none() {
                tracing::warn!(
                    "observer {} busy, dropped {}",
                    self.reactor_name(idx).unwrap_or("?"),
                    obs
                );
            }
        }
    }

    fn request(&mut self, from: usize, goal: &GoalRequest) -> bool {
        self.event_log
            .record(self.current_tick, EventKind::Request, &goal.timeline, &goal.predicate);
        let Some(&server) = self.servers.get(&goal.timeline) else {
            tracing::warn!("no server for {}", goal);
            return false;
        };
        if server == from {
            return false;
        }
        match self.with_reactor(server, |r, ctx| r.handle_request(goal, ctx)) {
            Some(accepted) => accepted,
            None => {
                tracing::warn!("server for {} busy, request rejected", goal.timeline);
                false
            }
        }
    }

    fn recall(&mut self, from: usize, goal: &GoalRequest) {
        self.event_log
            .record(self.current_tick, EventKind::Recall, &goal.timeline, &goal.predicate);
        let Some(&server) = self.servers.get(&goal.timeline) else {
            return;
        };
        if server == from {
            return;
        }
        if self
            .with_reactor(server, |r, ctx| r.handle_recall(goal, ctx))
            .is_none()
        {
            tracing::warn!("server for {} busy, recall dropped", goal.timeline);
        }
    }
}

/// 回调期间反应器对总线的视图
pub struct ReactorContext<'a> {
    bus: &'a mut Bus,
    me: usize,
}

impl ReactorContext<'_> {
    pub fn current_tick(&self) -> Tick {
        self.bus.current_tick
    }

    pub fn final_tick(&self) -> Tick {
        self.bus.final_tick
    }

    /// 本反应器名
    pub fn name(&self) -> &str {
        self.bus.reactor_name(self.me).unwrap_or("")
    }

    pub fn server_info(&self, timeline: &str) -> Option<ServerInfo> {
        self.bus.server_info(timeline)
    }

    /// 发布取值给该时间线的所有订阅者（注册顺序）
    pub fn notify(&mut self, obs: &Observation) {
        self.bus.notify(self.me, obs);
    }

    /// 向时间线的服务者发请求，接受返回 true
    pub fn request(&mut self, goal: &GoalRequest) -> bool {
        self.bus.request(self.me, goal)
    }

    pub fn recall(&mut self, goal: &GoalRequest) {
        self.bus.recall(self.me, goal);
    }

    pub fn notify_rejected(&mut self, goal: &GoalRequest) {
        let name = self.name().to_string();
        tracing::info!("[{}] goal rejected: {}", name, goal);
        for l in self.bus.listeners.iter_mut() {
            l.notify_rejected(&name, goal);
        }
    }

    pub fn notify_completed(&mut self, goal: &GoalRequest) {
        let name = self.name().to_string();
        tracing::info!("[{}] goal completed: {}", name, goal);
        for l in self.bus.listeners.iter_mut() {
            l.notify_completed(&name, goal);
        }
    }
}

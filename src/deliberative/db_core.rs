//! DbCore：基于计划数据库的审议反应器
//!
//! 状态机：
//! - Inactive → Active：空闲时被 `resume`，开启一个审议周期
//! - Active → Inactive：视界内没有剩余缺陷
//! - 任意 → Invalid：传播失败、搜索耗尽、缺少预期的观测或审议超时
//! - Invalid → Inactive：只能在下一次 `synchronize` 中通过 relax + resolve 修复
//!
//! 每个 tick：`handle_tick_start` 启动可执行的动作并派发请求；`synchronize` 整理执行前沿、
//! 提交、发布 Internal 时间线的取值、更新目标并归档过去的 Token。
//!
//! 回调期间要发往总线的消息先放入发件箱，回调结束前统一经 [`ReactorContext`] 发出；
//! 派发请求需要即时的接受结果，直接走 `ctx.request`。

use std::any::Any;
use std::collections::{BTreeSet, HashMap};

use crate::config::{ReactorConfig, TokenConfig};
use crate::core::bus::{ReactorContext, ServerInfo};
use crate::core::error::{KernelError, Result};
use crate::plan::{
    Domain, Interval, Model, ObjectKind, PlanDatabase, Tick, Timeline, TimelineMode, TokenKey,
    PLUS_INFINITY,
};
use crate::reactor::{GoalRequest, Observation, Reactor, ReactorBase, TimelineModes};
use crate::search::{DbSolver, Flaw, GoalCandidate, Position};

use super::bookkeeping::Bookkeeping;
use super::container::TimelineContainer;
use super::synchronizer::Synchronizer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreState {
    Inactive,
    Active,
    Invalid,
}

#[derive(Debug)]
enum Outgoing {
    Notify(Observation),
    Recall(GoalRequest),
    Completed(GoalRequest),
    Rejected(GoalRequest),
}

pub struct DbCore {
    base: ReactorBase,
    db: PlanDatabase,
    books: Bookkeeping,
    synchronizer: Synchronizer,
    solver: DbSolver,
    state: CoreState,
    current_tick_cycle: Tick,
    last_complete_tick: Option<Tick>,
    /// 被撤回、等待下一次修复时删除的本地目标
    recall_buffer: Vec<TokenKey>,
    invalid_reason: Option<String>,
    now: Tick,
    outbox: Vec<Outgoing>,
    position_source: Option<String>,
}

impl DbCore {
    /// 按配置建立时间线、规则、初始目标与事实
    pub fn from_config(cfg: &ReactorConfig) -> Result<Self> {
        let mut db = PlanDatabase::new(Model::new(cfg.rules.clone()));
        let mut books = Bookkeeping::new(cfg.name.clone());

        for tl in &cfg.timelines {
            let timeline = match tl.kind {
                ObjectKind::Actions => Timeline::actions(tl.name.clone()),
                ObjectKind::Timeline => Timeline::new(tl.name.clone(), tl.mode),
            };
            let timeline = match &tl.default_predicate {
                Some(p) => timeline.with_default(p.clone()),
                None => timeline,
            }
            .persistent(tl.persistent);
            db.add_timeline(timeline)?;

            match (tl.kind, tl.mode) {
                (ObjectKind::Timeline, TimelineMode::Internal) => {
                    books.internals.push((tl.name.clone(), None));
                }
                (ObjectKind::Timeline, TimelineMode::External) => {
                    books
                        .externals
                        .insert(tl.name.clone(), TimelineContainer::new(tl.name.clone()));
                }
                _ => {}
            }
        }

        for goal in &cfg.goals {
            let key = db.create_token(&goal.timeline, &goal.predicate, true)?;
            apply_token_config(&mut db, key, goal);
        }

        for fact in &cfg.facts {
            let internal = db
                .timeline(&fact.timeline)
                .ok_or_else(|| KernelError::UnknownTimeline(fact.timeline.clone()))?
                .mode()
                == TimelineMode::Internal;
            if !internal {
                return Err(KernelError::Config(format!(
                    "fact {}.{} of {} must be on an internal timeline",
                    fact.timeline, fact.predicate, cfg.name
                )));
            }
            let key = db.create_token(&fact.timeline, &fact.predicate, false)?;
            apply_token_config(&mut db, key, fact);
            db.set_fact(key);
            db.restrict_start(key, Interval::singleton(0));
            db.restrict_end(key, Interval::at_least(1));
            let empty = db
                .token(key)
                .is_some_and(|t| t.start().base.is_empty() || t.end().base.is_empty());
            if empty {
                return Err(KernelError::Config(format!(
                    "fact {}.{} of {} cannot hold from tick 0",
                    fact.timeline, fact.predicate, cfg.name
                )));
            }
            db.activate(key);
        }

        let solver = DbSolver::new(
            cfg.solver.max_iterations,
            cfg.solver.plateau,
            cfg.solver.speed,
        );

        Ok(Self {
            base: ReactorBase::new(cfg.name.clone(), cfg.lookahead, cfg.latency).with_log(cfg.log),
            db,
            books,
            synchronizer: Synchronizer::new(),
            solver,
            state: CoreState::Inactive,
            current_tick_cycle: 0,
            last_complete_tick: None,
            recall_buffer: Vec::new(),
            invalid_reason: None,
            now: 0,
            outbox: Vec::new(),
            position_source: cfg.solver.position_source.clone(),
        })
    }

    pub fn state(&self) -> CoreState {
        self.state
    }

    /// 最近一次转入 Invalid 的原因
    pub fn invalid_reason(&self) -> Option<&str> {
        self.invalid_reason.as_deref()
    }

    pub fn db(&self) -> &PlanDatabase {
        &self.db
    }

    pub fn books(&self) -> &Bookkeeping {
        &self.books
    }

    pub fn goals(&self) -> &BTreeSet<TokenKey> {
        &self.books.goals
    }

    pub fn committed(&self) -> &BTreeSet<TokenKey> {
        &self.books.committed
    }

    pub fn solver(&self) -> &DbSolver {
        &self.solver
    }

    pub fn last_complete_tick(&self) -> Option<Tick> {
        self.last_complete_tick
    }

    /// 审议视界 [start, end]
    pub fn horizon(&self) -> Interval {
        let final_tick = self.books.final_tick;
        let start = final_tick
            .saturating_sub(1)
            .min((self.current_tick_cycle + 1).saturating_add(self.base.latency()));
        let end = final_tick.min(start.saturating_add(self.base.lookahead()));
        Interval::new(start, end)
    }

    fn enter(&mut self, ctx: &ReactorContext<'_>) {
        self.now = ctx.current_tick();
        self.books.final_tick = ctx.final_tick();
    }

    fn flush(&mut self, ctx: &mut ReactorContext<'_>) {
        for msg in std::mem::take(&mut self.outbox) {
            match msg {
                Outgoing::Notify(obs) => ctx.notify(&obs),
                Outgoing::Recall(goal) => ctx.recall(&goal),
                Outgoing::Completed(goal) => ctx.notify_completed(&goal),
                Outgoing::Rejected(goal) => ctx.notify_rejected(&goal),
            }
        }
    }

    fn sync_books(&mut self) {
        self.books.absorb(&mut self.db);
        self.books.process_pending(&mut self.db, self.now);
    }

    fn propagate(&mut self) -> bool {
        if self.state == CoreState::Invalid {
            return false;
        }
        if self.db.propagate() {
            self.sync_books();
        } else {
            let reason = self.db.last_failure().unwrap_or("unknown").to_string();
            tracing::info!("{}: inconsistent plan at tick {}", self.name(), self.now);
            self.mark_invalid(format!("The constraint network is inconsistent: {}", reason));
        }
        self.state != CoreState::Invalid
    }

    fn mark_invalid(&mut self, reason: String) {
        if self.state != CoreState::Invalid {
            self.dispatch_recalls();
        }
        tracing::warn!("{} is marked invalid at tick {}: {}", self.name(), self.now, reason);
        self.state = CoreState::Invalid;
        self.invalid_reason = Some(reason);
    }

    fn goal_request(&self, key: TokenKey) -> Option<GoalRequest> {
        let mut request = GoalRequest::from_token(self.db.token(key)?);
        if let Some(remote) = self.books.foreign_keys.remote(key) {
            request.key = remote;
        }
        Some(request)
    }

    /// 终止 Token；目标同时上报结局
    fn terminate(&mut self, key: TokenKey) {
        let Some(token) = self.db.token(key) else {
            return;
        };
        tracing::debug!("{}: terminating {}", self.name(), token);
        if self.books.is_goal(&self.db, key) {
            let rejected = token.is_inactive() || token.is_rejected();
            if let Some(request) = self.goal_request(key) {
                self.outbox.push(if rejected {
                    Outgoing::Rejected(request)
                } else {
                    Outgoing::Completed(request)
                });
            }
        }
        self.db.terminate(key);
    }

    fn commit_and_restrict(&mut self, key: TokenKey) {
        self.db.commit(key);
        let Some(token) = self.db.token(key) else {
            return;
        };
        let start = token.start();
        let fix_start = (!start.base.is_singleton()).then_some(start.last);
        let params: Vec<(String, Domain)> = token
            .params()
            .map(|(name, dom)| (name.to_string(), dom.clone()))
            .collect();

        if let Some(last) = fix_start {
            self.db.restrict_start(key, last);
        }
        self.db.restrict_end(key, Interval::at_least(self.now));
        for (name, dom) in params {
            self.db.restrict_param(key, &name, &dom);
        }
    }

    // ---- 派发 ----

    fn dispatch_commands(&mut self, ctx: &mut ReactorContext<'_>) {
        if self.state != CoreState::Inactive {
            return;
        }
        let now = self.now;
        let uncontrollables = self.books.active_uncontrollable_events(&self.db, now);
        let timelines: Vec<String> = self.books.externals.keys().cloned().collect();

        for name in timelines {
            let Some(server) = self.books.externals.get(&name).and_then(|tc| tc.server().cloned()) else {
                continue;
            };
            let Some(window) = dispatch_window(now, &server, self.books.final_tick) else {
                continue;
            };
            let ub = window.ub;
            tracing::debug!("{}: dispatch window for {} is {}", self.name(), name, window);

            for key in self.db.sequence(&name) {
                let Some(token) = self.db.token(key) else {
                    continue;
                };
                let dispatched = self
                    .books
                    .externals
                    .get(&name)
                    .is_some_and(|tc| tc.is_dispatched(key));
                if token.is_committed() || dispatched {
                    continue;
                }
                let start = token.start().last;
                if start.lb > ub {
                    break;
                }
                if self.has_pending_predecessors(key, &uncontrollables, true) {
                    break;
                }
                if start.ub < now {
                    continue;
                }
                if !start.intersects(&window) {
                    continue;
                }

                let request = GoalRequest::from_token(token);
                let has_dispatch_time = token.param("dispatch_time").is_some();
                tracing::debug!("{}: dispatching {}", self.name(), request);
                if !ctx.request(&request) {
                    break;
                }
                if let Some(tc) = self.books.externals.get_mut(&name) {
                    tc.mark_dispatched(key);
                }
                if has_dispatch_time {
                    self.db
                        .restrict_param(key, "dispatch_time", &Domain::int(now as i64));
                }
            }
        }
    }

    fn dispatch_recalls(&mut self) {
        for tc in self.books.externals.values() {
            for key in tc.dispatched() {
                let Some(token) = self.db.token(key) else {
                    continue;
                };
                if token.end().base.ub > self.now {
                    tracing::debug!("{}: recalling {}", self.books.name, token);
                    self.outbox.push(Outgoing::Recall(GoalRequest::from_token(token)));
                }
            }
        }
    }

    /// 候选 Token 是否必须等某个尚未结束的外部事件
    fn has_pending_predecessors(
        &self,
        key: TokenKey,
        uncontrollables: &[TokenKey],
        require_different_timeline: bool,
    ) -> bool {
        let Some(token) = self.db.token(key) else {
            return false;
        };
        uncontrollables.iter().any(|&u| {
            let same = self
                .db
                .token(u)
                .is_some_and(|t| t.timeline() == token.timeline());
            !(require_different_timeline && same) && u != key && self.db.precedes(u, key)
        })
    }

    // ---- 动作 ----

    fn update_actions(&mut self) {
        if self.state != CoreState::Inactive {
            return;
        }
        let now = self.now;
        let mut uncontrollables: Option<Vec<TokenKey>> = None;
        let actions: Vec<TokenKey> = self.books.actions.iter().copied().collect();

        for key in actions {
            let Some(token) = self.db.token(key) else {
                continue;
            };
            let start = *token.start();
            let end = token.end().last;

            if token.is_committed() {
                if end.contains(now) {
                    self.db.restrict_end(key, Interval::at_least(now));
                    if !self.propagate() {
                        return;
                    }
                }
                continue;
            }
            if start.base.is_singleton() || !start.last.contains(now) {
                continue;
            }

            let inactive = token.is_inactive();
            let active = token.is_active();
            let pending = {
                let events = uncontrollables
                    .get_or_insert_with(|| self.books.active_uncontrollable_events(&self.db, now));
                !start.last.is_singleton() && self.has_pending_predecessors(key, events, false)
            };
            if pending || inactive {
                self.db.restrict_start(key, Interval::at_least(now));
            } else if active {
                if let Some(t) = self.db.token(key) {
                    tracing::info!("{}: starting {}", self.books.name, t);
                }
                self.db.specify_start(key, now);
            }
            if !self.propagate() {
                return;
            }
        }
    }

    // ---- 同步 ----

    fn is_solver_timed_out(&mut self) -> bool {
        if self.state == CoreState::Active && self.horizon().lb <= self.now {
            tracing::info!("{}: planning failed to complete in time", self.name());
            self.mark_invalid("The solver could not complete in time".to_string());
            return true;
        }
        false
    }

    /// 惯性假设：本 tick 没有新观测的 External 时间线延续当前取值
    fn complete_external_timelines(&mut self) -> bool {
        let stale: Vec<String> = self
            .books
            .externals
            .values()
            .filter(|tc| tc.last_observed() < self.now)
            .map(|tc| tc.name().to_string())
            .collect();
        for name in stale {
            if !self.extend_current_value(&name) {
                tracing::debug!("{}: failed to extend {}", self.name(), name);
                return false;
            }
        }
        true
    }

    fn extend_current_value(&mut self, timeline: &str) -> bool {
        if self.state == CoreState::Invalid {
            return false;
        }
        let now = self.now;
        let value = self.db.value_at(timeline, now.saturating_sub(1));
        let extendable = value.and_then(|k| self.db.token(k)).is_some_and(|t| {
            t.end().last.ub != now && (now != 0 || self.books.is_observation(t.key()))
        });
        let Some(key) = value.filter(|_| extendable) else {
            tracing::info!("{}: missed expected observation on {}", self.name(), timeline);
            self.mark_invalid(format!(
                "Expected an observation for {}. Are observations being generated? The plan may simply be broken.",
                timeline
            ));
            return false;
        };

        if !self.db.token(key).is_some_and(|t| t.is_committed()) {
            self.commit_and_restrict(key);
        }
        let end_ub = self.db.token(key).map_or(PLUS_INFINITY, |t| t.end().base.ub);
        self.db.restrict_end(key, Interval::new(now + 1, end_ub));
        self.propagate()
    }

    fn process_recalls(&mut self) {
        for key in std::mem::take(&mut self.recall_buffer) {
            if self.db.contains(key) {
                tracing::debug!("{}: removing recalled goal {}", self.books.name, key);
                self.db.discard(key);
            }
        }
        self.sync_books();
    }

    fn commit(&mut self) {
        if self.state == CoreState::Invalid {
            return;
        }
        let observations: Vec<TokenKey> = self.books.observations.iter().copied().collect();
        for key in observations {
            let active = match self.db.token(key) {
                Some(t) if t.is_active() => key,
                Some(t) if t.is_merged() => match t.active_token() {
                    Some(a) => a,
                    None => continue,
                },
                _ => continue,
            };
            if !self.db.token(active).is_some_and(|t| t.is_committed()) {
                self.commit_and_restrict(active);
            }
            if !self.propagate() {
                return;
            }
        }

        let later = Interval::at_least(self.now + 1);
        let actions: Vec<TokenKey> = self.books.actions.iter().copied().collect();
        for key in actions {
            let Some(token) = self.db.token(key) else {
                continue;
            };
            if !token.is_active() || token.is_committed() {
                continue;
            }
            if token.start().last.ub <= self.now {
                self.commit_and_restrict(key);
            } else {
                self.db.restrict_start(key, later);
            }
            if !self.propagate() {
                return;
            }
        }
    }

    /// 发布 Internal 时间线上开始时间落在当前 tick 的取值
    fn notify_observers(&mut self) {
        if self.state == CoreState::Invalid {
            return;
        }
        let now = self.now;
        for i in 0..self.books.internals.len() {
            let (name, last_published) = self.books.internals[i].clone();
            if last_published == Some(now) {
                continue;
            }
            for key in self.db.sequence(&name) {
                let Some(token) = self.db.token(key) else {
                    continue;
                };
                let (start, end) = (token.start().last, token.end().last);
                if start.lb > now {
                    break;
                }
                // 已结束或尚未到最晚开始时间
                if end.ub <= now || start.ub > now {
                    continue;
                }
                if !token.is_committed() {
                    self.commit_and_restrict(key);
                }
                if start.ub == now && !self.books.notified.contains(&key) {
                    self.db.restrict_start(key, Interval::singleton(now));
                    if !self.propagate() {
                        return;
                    }
                    if let Some(t) = self.db.token(key) {
                        self.outbox.push(Outgoing::Notify(Observation::from_token(t)));
                    }
                    self.books.internals[i].1 = Some(now);
                    self.books.notified.insert(key);
                }
            }
        }
    }

    fn update_goals(&mut self) {
        if self.state == CoreState::Invalid {
            return;
        }
        let now = self.now;
        let mut garbage = Vec::new();
        let goals: Vec<TokenKey> = self.books.goals.iter().copied().collect();

        for key in goals {
            let Some(token) = self.db.token(key) else {
                continue;
            };
            let latest_start = token.start().last.ub;
            if token.is_inactive() {
                if latest_start < now {
                    tracing::debug!("{}: rejecting timed out goal {}", self.books.name, token);
                    self.db.reject(key);
                } else {
                    self.db.restrict_start(key, Interval::at_least(now));
                }
                if !self.propagate() {
                    return;
                }
            }
            let Some(token) = self.db.token(key) else {
                continue;
            };
            if self.state == CoreState::Inactive && token.is_rejected() {
                garbage.push(key);
            }
            if token.is_active() && !token.is_committed() && latest_start >= now {
                self.db.restrict_start(key, Interval::at_least(now));
            }
        }

        for key in garbage {
            self.terminate(key);
        }
        self.sync_books();
    }

    // ---- 归档 ----

    fn archive(&mut self) {
        if self.state != CoreState::Inactive {
            return;
        }
        if !self.propagate() {
            return;
        }

        let committed: Vec<TokenKey> = self.books.committed.iter().copied().collect();
        for key in committed {
            if self.restrict_committed(key) && self.update_related_tokens(key) {
                tracing::debug!("{}: {} can be terminated", self.books.name, key);
                self.db.disconnect_constraints(key);
                self.books.committed.remove(&key);
                self.books.terminable.insert(key);
            }
        }

        let terminable: Vec<TokenKey> = self.books.terminable.iter().copied().collect();
        for key in terminable {
            if self.can_be_terminated(key) {
                self.terminate(key);
            }
        }
        self.sync_books();

        let terminated: Vec<TokenKey> = self.books.terminated.iter().copied().collect();
        for key in terminated {
            self.db.discard(key);
        }
        self.sync_books();
        let db = &self.db;
        let purged = self.books.foreign_keys.purge(|k| db.contains(k));
        if purged > 0 {
            tracing::debug!("{}: purged {} orphaned keys", self.books.name, purged);
        }
    }

    /// 过去的已提交 Token 固化最终取值并返回 true；否则把结束时间推到当前 tick 之后
    fn restrict_committed(&mut self, key: TokenKey) -> bool {
        let Some(token) = self.db.token(key) else {
            return false;
        };
        let finished = token.end().last.ub <= self.now;
        if finished {
            self.db.restrict_base_domains(key);
        } else {
            self.db.restrict_end(key, Interval::at_least(self.now));
        }
        self.propagate();
        finished
    }

    /// 处理主从与合并关系以便删除该 Token；仍被引用时返回 false
    fn update_related_tokens(&mut self, key: TokenKey) -> bool {
        if !self.propagate() {
            return false;
        }
        let Some(token) = self.db.token(key) else {
            return false;
        };
        let slaves = token.slaves().to_vec();
        let merged = token.merged_tokens().to_vec();

        for slave in slaves {
            let Some(s) = self.db.token(slave) else {
                continue;
            };
            if s.is_merged() {
                let carrier = s.active_token();
                let (start, end, duration) = (s.start().base, s.end().base, s.duration().base);
                if let Some(a) = carrier.filter(|a| self.db.token(*a).is_some_and(|t| !t.is_terminated())) {
                    self.db.restrict_start(a, start);
                    self.db.restrict_end(a, end);
                    self.db.restrict_duration(a, duration);
                    if !self.propagate() {
                        return false;
                    }
                }
                self.terminate(slave);
                continue;
            }
            if s.is_committed() {
                self.db.unlink_master(slave);
                continue;
            }
            if !self.books.in_scope(slave) {
                self.terminate(slave);
                continue;
            }
            if s.end().last.lb > self.now {
                self.db.restrict_base_domains(slave);
                self.db.unlink_master(slave);
                continue;
            }
            self.terminate(slave);
        }

        let mut can_terminate = true;
        for m in merged {
            match self.db.token(m) {
                Some(t) if t.master().is_none() => self.terminate(m),
                Some(_) => can_terminate = false,
                None => {}
            }
        }
        can_terminate
    }

    fn can_be_terminated(&self, key: TokenKey) -> bool {
        let Some(master) = self.db.token(key).and_then(|t| t.master()) else {
            return true;
        };
        match self.db.token(master) {
            None => true,
            Some(m) if m.is_terminated() || self.now > m.end().base.ub => true,
            Some(_) => !self.db.has_pending_rules(master),
        }
    }

    // ---- 审议 ----

    fn deactivate_solver(&mut self) {
        self.solver.clear();
        self.current_tick_cycle = self.now;
        self.last_complete_tick = Some(self.now);
    }

    /// 视界内需要审议的未决 Token
    fn in_deliberation_window(&self, key: TokenKey, horizon: Interval) -> bool {
        if !self.books.in_scope(key) {
            return false;
        }
        let Some(token) = self.db.token(key) else {
            return false;
        };
        let (start, end) = (token.start().last, token.end().last);
        if end.ub <= self.now || start.lb >= horizon.ub {
            return false;
        }
        if start.ub < horizon.ub || start.ub < self.books.final_tick {
            return true;
        }
        token.master().is_some_and(|m| {
            self.books.is_action(m) || !self.db.can_precede(m, key)
        })
    }

    fn open_flaws(&self, horizon: Interval) -> Vec<Flaw> {
        self.db
            .tokens()
            .filter(|t| t.is_inactive())
            .map(|t| t.key())
            .filter(|&k| self.in_deliberation_window(k, horizon))
            .map(|key| Flaw {
                key,
                is_goal: self.books.is_goal(&self.db, key),
            })
            .collect()
    }

    /// 位置相关的目标：可拒绝且 x、y 都是确定的数值
    fn goal_candidates(&self, horizon: Interval) -> Vec<GoalCandidate> {
        self.books
            .goals
            .iter()
            .filter_map(|&key| {
                let t = self.db.token(key)?;
                if t.is_terminated() || !t.is_rejectable() {
                    return None;
                }
                if t.end().last.ub <= self.now || t.start().last.lb >= horizon.ub {
                    return None;
                }
                let x = t.param("x").and_then(Domain::as_f64)?;
                let y = t.param("y").and_then(Domain::as_f64)?;
                let priority = t
                    .param("priority")
                    .and_then(Domain::as_f64)
                    .map_or(0, |p| p as i32);
                Some(GoalCandidate {
                    key,
                    priority,
                    position: Position::new(x, y),
                    start: t.start().last,
                    end: t.end().last,
                    active: !t.is_inactive() && !t.is_rejected(),
                })
            })
            .collect()
    }

    /// 位置源时间线上已开始的最后一个带确定 x、y 的取值
    fn current_position(&self) -> Position {
        let mut position = Position::default();
        let Some(source) = self.position_source.as_deref() else {
            return position;
        };
        for key in self.db.sequence(source) {
            let Some(t) = self.db.token(key) else {
                continue;
            };
            if t.start().last.lb > self.now {
                break;
            }
            let x = t.param("x").and_then(Domain::as_f64);
            let y = t.param("y").and_then(Domain::as_f64);
            if let (Some(x), Some(y)) = (x, y) {
                position = Position::new(x, y);
            }
        }
        position
    }

    fn log_plan(&self) {
        if !self.base.log_enabled() {
            return;
        }
        for tl in self.db.timelines() {
            let tokens: Vec<String> = self
                .db
                .sequence(tl.name())
                .into_iter()
                .filter_map(|k| self.db.token(k).map(|t| t.to_string()))
                .collect();
            if !tokens.is_empty() {
                tracing::info!("{}:   {} = [{}]", self.name(), tl.name(), tokens.join(", "));
            }
        }
    }
}

/// `[now + latency, min(now + latency + lookahead, final_tick)]`；为空时返回 None
fn dispatch_window(now: Tick, server: &ServerInfo, final_tick: Tick) -> Option<Interval> {
    let lb = now.saturating_add(server.latency);
    let ub = lb.saturating_add(server.lookahead).min(final_tick);
    (lb <= ub).then(|| Interval::new(lb, ub))
}

fn apply_token_config(db: &mut PlanDatabase, key: TokenKey, cfg: &TokenConfig) {
    if let Some((lb, ub)) = cfg.start {
        db.restrict_start(key, Interval::new(lb, ub));
    }
    if let Some((lb, ub)) = cfg.end {
        db.restrict_end(key, Interval::new(lb, ub));
    }
    if let Some((lb, ub)) = cfg.duration {
        db.restrict_duration(key, Interval::new(lb, ub));
    }
    for (name, dom) in &cfg.params {
        db.restrict_param(key, name, dom);
    }
}

impl Reactor for DbCore {
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
            externals: self.books.externals.keys().cloned().collect(),
            internals: self.books.internals.iter().map(|(n, _)| n.clone()).collect(),
        }
    }

    fn handle_init(
        &mut self,
        initial_tick: Tick,
        servers: &HashMap<String, ServerInfo>,
        ctx: &mut ReactorContext<'_>,
    ) -> Result<()> {
        self.enter(ctx);
        self.now = initial_tick;
        self.current_tick_cycle = initial_tick;
        for (timeline, info) in servers {
            if let Some(tc) = self.books.externals.get_mut(timeline) {
                tc.set_server(info.clone());
            }
        }
        self.sync_books();
        if !self.db.propagate() {
            return Err(KernelError::Config(format!(
                "initial plan of {} is inconsistent: {}",
                self.name(),
                self.db.last_failure().unwrap_or("unknown")
            )));
        }
        self.sync_books();
        tracing::debug!(
            "{}: initialized with {} goals, horizon {}",
            self.name(),
            self.books.goals.len(),
            self.horizon()
        );
        Ok(())
    }

    fn handle_tick_start(&mut self, ctx: &mut ReactorContext<'_>) {
        self.enter(ctx);
        if self.state == CoreState::Invalid {
            tracing::debug!("{}: invalid, repair required", self.name());
            return;
        }
        if self.propagate() {
            if self.state == CoreState::Inactive {
                self.current_tick_cycle = self.now;
            }
            self.update_actions();
            if self.propagate() {
                self.dispatch_commands(ctx);
            }
        }
        self.flush(ctx);
    }

    fn synchronize(&mut self, ctx: &mut ReactorContext<'_>) -> bool {
        self.enter(ctx);
        self.sync_books();
        let now = self.now;

        let needs_repair = self.is_solver_timed_out()
            || !self.complete_external_timelines()
            || !self.synchronizer.resolve(&mut self.db, &mut self.books, now);
        if needs_repair {
            tracing::info!("{}: repairing plan at tick {}", self.name(), now);
            self.solver.reset(&mut self.db);
            self.process_recalls();
            self.current_tick_cycle = now;
            self.state = CoreState::Inactive;

            let repaired = self
                .synchronizer
                .relax(&mut self.db, &mut self.books, now, true)
                && self.synchronizer.resolve(&mut self.db, &mut self.books, now);
            self.base.add_sync_steps(self.synchronizer.step_count());
            if !repaired {
                tracing::error!("{}: [{}] repair failed", self.name(), now);
                self.mark_invalid(format!("Repair failed at tick {}", now));
                self.flush(ctx);
                return false;
            }
            tracing::info!("{}: [{}] Repaired plan", self.name(), now);
            self.log_plan();
        } else {
            self.base.add_sync_steps(self.synchronizer.step_count());
        }

        self.commit();
        self.notify_observers();
        self.update_goals();
        self.archive();
        self.flush(ctx);
        self.state != CoreState::Invalid
    }

    fn has_work(&mut self, ctx: &mut ReactorContext<'_>) -> bool {
        self.enter(ctx);
        match self.state {
            CoreState::Invalid => false,
            CoreState::Active => true,
            CoreState::Inactive => {
                self.last_complete_tick != Some(self.now)
                    && self.books.final_tick >= self.current_tick_cycle + 1
            }
        }
    }

    fn resume(&mut self, ctx: &mut ReactorContext<'_>) {
        self.enter(ctx);
        let now = self.now;
        if self.state == CoreState::Invalid {
            tracing::info!("{}: invalid, not resuming deliberation", self.name());
            return;
        }
        if self.solver.is_exhausted() {
            tracing::info!("{}: [{}] No plan found", self.name(), now);
            self.mark_invalid("Solver exhausted. No plan found.".to_string());
            self.flush(ctx);
            return;
        }
        if !self.propagate() {
            self.flush(ctx);
            return;
        }
        if self.state == CoreState::Inactive {
            self.state = CoreState::Active;
            self.current_tick_cycle = now;
            tracing::debug!("{}: starting cycle for tick {}", self.name(), now);
        }

        let horizon = self.horizon();
        self.solver.set_horizon(horizon);
        self.solver.set_position(self.current_position());
        let candidates = self.goal_candidates(horizon);
        self.solver.update_goals(&self.db, candidates);
        let flaws = self.open_flaws(horizon);
        self.solver.step(&mut self.db, &flaws);
        self.base.add_search_steps(1);
        self.sync_books();

        if self.solver.no_more_flaws() {
            if self.solver.depth() > 0 {
                tracing::info!("{}: [{}] New plan", self.name(), now);
                self.log_plan();
            }
            self.deactivate_solver();
            self.state = CoreState::Inactive;
            tracing::debug!("{}: deliberation completed", self.name());
        }
        self.flush(ctx);
    }

    fn notify(&mut self, obs: &Observation, ctx: &mut ReactorContext<'_>) {
        self.enter(ctx);
        let now = self.now;
        if !self.books.externals.contains_key(&obs.timeline) {
            tracing::warn!("{}: observation on unknown timeline {}", self.name(), obs);
            return;
        }
        let key = match self.db.create_token(&obs.timeline, &obs.predicate, false) {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!("{}: observation {} dropped: {}", self.name(), obs, e);
                return;
            }
        };
        self.db.restrict_start(key, Interval::singleton(now));
        self.db.restrict_end(key, Interval::new(now + 1, PLUS_INFINITY));
        for (name, dom) in &obs.params {
            self.db.restrict_param(key, name, dom);
        }
        if let Some(tc) = self.books.externals.get_mut(&obs.timeline) {
            tc.update_last_observed(now);
        }
        self.books.observations.insert(key);
        self.sync_books();
        tracing::debug!("{}: observed {} at tick {}", self.name(), obs, now);
    }

    fn handle_request(&mut self, goal: &GoalRequest, ctx: &mut ReactorContext<'_>) -> bool {
        self.enter(ctx);
        if self.books.foreign_keys.contains(goal.key) {
            return true;
        }
        let internal = self
            .db
            .timeline(&goal.timeline)
            .is_some_and(|tl| tl.mode() == TimelineMode::Internal);
        if !internal {
            tracing::warn!("{}: request for {} refused, not served here", self.name(), goal);
            return false;
        }
        let key = match self.db.create_token(&goal.timeline, &goal.predicate, true) {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!("{}: request {} refused: {}", self.name(), goal, e);
                return false;
            }
        };
        self.db.restrict_start(key, goal.start);
        self.db.restrict_end(key, goal.end);
        self.db.restrict_duration(key, goal.duration);
        for (name, dom) in &goal.params {
            self.db.restrict_param(key, name, dom);
        }
        self.books.foreign_keys.insert(goal.key, key);
        self.sync_books();
        tracing::debug!("{}: local goal {} for request {}", self.name(), key, goal);
        true
    }

    fn handle_recall(&mut self, goal: &GoalRequest, ctx: &mut ReactorContext<'_>) {
        self.enter(ctx);
        if let Some(local) = self.books.foreign_keys.remove(goal.key) {
            tracing::debug!("{}: recall of {} buffered", self.name(), goal);
            self.recall_buffer.push(local);
        }
    }

    fn shutdown(&mut self, ctx: &mut ReactorContext<'_>) {
        self.enter(ctx);
        let goals: Vec<TokenKey> = self.books.goals.iter().copied().collect();
        for key in goals {
            let Some(token) = self.db.token(key) else {
                continue;
            };
            if token.is_terminated() || token.master().is_some() {
                continue;
            }
            let rejected = token.is_inactive() || token.is_rejected();
            if let Some(request) = self.goal_request(key) {
                self.outbox.push(if rejected {
                    Outgoing::Rejected(request)
                } else {
                    Outgoing::Completed(request)
                });
            }
        }
        tracing::info!(
            "{}: shutting down with {} tokens, state {:?}",
            self.name(),
            self.db.len(),
            self.state
        );
        self.flush(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimelineConfig;
    use crate::core::bus::Bus;
    use crate::core::event::EventLog;
    use crate::plan::{Relation, Rule, SlaveSpec};

    fn with_core<R>(bus: &mut Bus, f: impl FnOnce(&mut DbCore, &mut ReactorContext<'_>) -> R) -> R {
        bus.with_reactor(0, |r, ctx| {
            let core = r
                .as_any_mut()
                .downcast_mut::<DbCore>()
                .expect("reactor 0 is a DbCore");
            f(core, ctx)
        })
        .expect("reactor 0 is idle")
    }

    fn bus_with(cfg: ReactorConfig, final_tick: Tick) -> Bus {
        let mut bus = Bus::new(final_tick, EventLog::new(false));
        let core = DbCore::from_config(&cfg).unwrap();
        bus.add_reactor(Box::new(core));
        with_core(&mut bus, |core, ctx| core.handle_init(0, &HashMap::new(), ctx)).unwrap();
        bus
    }

    #[test]
    fn test_from_config_rejects_external_facts() {
        let cfg = ReactorConfig::new("r", "DbCore")
            .with_timeline(TimelineConfig::external("light"))
            .with_fact(TokenConfig::new("light", "On"));
        assert!(matches!(DbCore::from_config(&cfg), Err(KernelError::Config(_))));

        let cfg = ReactorConfig::new("r", "DbCore").with_goal(TokenConfig::new("nowhere", "On"));
        assert!(matches!(
            DbCore::from_config(&cfg),
            Err(KernelError::UnknownTimeline(_))
        ));
    }

    #[test]
    fn test_horizon_follows_cycle_latency_and_lookahead() {
        let cfg = ReactorConfig::new("r", "DbCore")
            .with_lookahead(5)
            .with_latency(2)
            .with_timeline(TimelineConfig::internal("light"));
        let bus = bus_with(cfg, 6);
        let core = bus.reactor(0).unwrap().as_any().downcast_ref::<DbCore>().unwrap();
        assert_eq!(core.horizon(), Interval::new(3, 6));

        let cfg = ReactorConfig::new("r", "DbCore")
            .with_lookahead(u64::MAX)
            .with_latency(u64::MAX)
            .with_timeline(TimelineConfig::internal("light"));
        let bus = bus_with(cfg, 6);
        let core = bus.reactor(0).unwrap().as_any().downcast_ref::<DbCore>().unwrap();
        assert_eq!(core.horizon(), Interval::new(5, 6));
    }

    #[test]
    fn test_fact_is_published_at_tick_zero() {
        let cfg = ReactorConfig::new("r", "DbCore")
            .with_timeline(TimelineConfig::internal("light"))
            .with_fact(TokenConfig::new("light", "Holds").with_param("value", Domain::symbol("on")));
        let mut bus = bus_with(cfg, 10);
        assert!(with_core(&mut bus, |core, ctx| core.synchronize(ctx)));

        let core = bus.reactor(0).unwrap().as_any().downcast_ref::<DbCore>().unwrap();
        assert_eq!(core.state(), CoreState::Inactive);
        let value = core.db().value_at("light", 0).unwrap();
        assert!(core.db().token(value).unwrap().is_committed());
        assert!(core.books().notified.contains(&value));
    }

    #[test]
    fn test_second_synchronize_in_same_tick_changes_nothing() {
        let cfg = ReactorConfig::new("r", "DbCore")
            .with_timeline(TimelineConfig::internal("light").with_default("Off"));
        let mut bus = bus_with(cfg, 10);
        assert!(with_core(&mut bus, |core, ctx| core.synchronize(ctx)));
        let (committed, notified) = with_core(&mut bus, |core, _| {
            (core.committed().clone(), core.books().notified.clone())
        });
        assert_eq!(committed.len(), 1);

        assert!(with_core(&mut bus, |core, ctx| core.synchronize(ctx)));
        let core = bus.reactor(0).unwrap().as_any().downcast_ref::<DbCore>().unwrap();
        assert_eq!(core.committed(), &committed);
        assert_eq!(core.books().notified, notified);
        assert_eq!(core.db().sequence("light").len(), 1);
    }

    #[test]
    fn test_dispatch_window_bounds() {
        let server = |latency, lookahead| ServerInfo {
            reactor: "s".into(),
            latency,
            lookahead,
        };
        assert_eq!(dispatch_window(2, &server(1, 3), 20), Some(Interval::new(3, 6)));
        assert_eq!(dispatch_window(2, &server(1, 3), 5), Some(Interval::new(3, 5)));
        assert_eq!(dispatch_window(2, &server(4, 0), 5), None);

        // 超大的前瞻或延迟封顶到任务结束
        assert_eq!(dispatch_window(3, &server(0, u64::MAX), 10), Some(Interval::new(3, 10)));
        assert_eq!(dispatch_window(3, &server(u64::MAX, u64::MAX), 10), None);
    }

    #[test]
    fn test_committed_value_is_archived_only_once_released() {
        let cfg = ReactorConfig::new("r", "DbCore")
            .with_timeline(TimelineConfig::internal("light"))
            .with_timeline(TimelineConfig::internal("camera"))
            .with_rule(Rule {
                timeline: "camera".into(),
                predicate: "Shoot".into(),
                duration: None,
                slaves: vec![SlaveSpec {
                    timeline: "light".into(),
                    predicate: "Holds".into(),
                    relation: Relation::ContainedBy,
                    params: Default::default(),
                    duration: None,
                }],
            });
        let mut bus = bus_with(cfg, 10);

        // light 上已提交的过去取值，Shoot 的从属 Token 合并在它上面
        let (value, shoot, slave) = with_core(&mut bus, |core, _| {
            let value = core.db.create_token("light", "Holds", false).unwrap();
            core.db.specify_start(value, 0);
            core.db.restrict_end(value, Interval::new(1, 2));
            assert!(core.db.activate(value));
            assert!(core.db.commit(value));

            let shoot = core.db.create_token("camera", "Shoot", false).unwrap();
            core.db.specify_start(shoot, 0);
            core.db.restrict_end(shoot, Interval::singleton(1));
            assert!(core.db.activate(shoot));
            let slave = core.db.fire_rules(shoot)[0];
            assert!(core.db.merge(slave, value));
            assert!(core.propagate());
            (value, shoot, slave)
        });
        assert!(with_core(&mut bus, |core, _| core.committed().contains(&value)));

        bus.set_current_tick(3);
        with_core(&mut bus, |core, ctx| {
            core.enter(ctx);
            core.archive();
        });
        let core = bus.reactor(0).unwrap().as_any().downcast_ref::<DbCore>().unwrap();
        assert_eq!(core.state(), CoreState::Inactive);
        assert!(core.db().contains(value));
        assert!(core.db().contains(slave));
        assert!(core.committed().contains(&value));
        assert!(!core.books().terminable.contains(&value));

        // 主 Token 不在了，合并的从属 Token 随之结束，过去的取值可以删除
        bus.set_current_tick(4);
        with_core(&mut bus, |core, ctx| {
            core.enter(ctx);
            core.db.discard(shoot);
            core.archive();
        });
        let core = bus.reactor(0).unwrap().as_any().downcast_ref::<DbCore>().unwrap();
        assert!(!core.db().contains(value));
        assert!(!core.db().contains(slave));
        assert!(core.committed().is_empty());
        assert!(core.books().terminated.is_empty());
    }

    #[test]
    fn test_timed_out_goal_is_rejected() {
        let cfg = ReactorConfig::new("r", "DbCore").with_timeline(TimelineConfig::internal("light"));
        let mut bus = bus_with(cfg, 10);
        bus.set_current_tick(3);

        let remote = TokenKey::next();
        let request = GoalRequest {
            key: remote,
            timeline: "light".into(),
            predicate: "On".into(),
            params: Default::default(),
            start: Interval::new(0, 2),
            end: Interval::FULL,
            duration: Interval::at_least(1),
        };
        let accepted = with_core(&mut bus, |core, ctx| core.handle_request(&request, ctx));
        assert!(accepted);
        assert!(with_core(&mut bus, |core, ctx| core.synchronize(ctx)));

        let core = bus.reactor(0).unwrap().as_any().downcast_ref::<DbCore>().unwrap();
        assert!(core.goals().is_empty());
        assert!(core.db().is_empty());
        assert!(core.books().foreign_keys.is_empty());
        assert_eq!(core.solver().depth(), 0);
    }

    #[test]
    fn test_recall_is_buffered_until_repair() {
        let cfg = ReactorConfig::new("r", "DbCore").with_timeline(TimelineConfig::internal("light"));
        let mut bus = bus_with(cfg, 10);
        let remote = TokenKey::next();
        let request = GoalRequest {
            key: remote,
            timeline: "light".into(),
            predicate: "On".into(),
            params: Default::default(),
            start: Interval::new(4, 6),
            end: Interval::FULL,
            duration: Interval::at_least(1),
        };
        assert!(with_core(&mut bus, |core, ctx| core.handle_request(&request, ctx)));
        with_core(&mut bus, |core, ctx| core.handle_recall(&request, ctx));

        let core = bus.reactor(0).unwrap().as_any().downcast_ref::<DbCore>().unwrap();
        assert_eq!(core.goals().len(), 1);
        assert!(core.books().foreign_keys.is_empty());
        assert_eq!(core.recall_buffer.len(), 1);
    }
}

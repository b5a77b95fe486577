//! 执行前沿同步
//!
//! `resolve`：对同步范围内的每个未决 Token，先尝试合并到等价的活动 Token，
//! 否则依次尝试各插入位置并展开规则；最后用默认谓词填补 Internal 时间线在当前 tick 的空缺。
//!
//! 同步范围：在作用域内、不是目标、未激活，且必然覆盖当前 tick（最晚开始 <= now < 最晚结束），
//! 或者是主 Token 已激活、最早开始 <= now 的从属 Token。
//!
//! `relax`：撤销目标、观测与其余未提交 Token 的决策，可选地丢弃非持久 Internal 时间线上的前沿取值；
//! 已提交的历史和缓冲的观测始终保留。

use crate::plan::{Interval, PlanDatabase, Tick, TimelineMode, TokenKey, PLUS_INFINITY};

use super::bookkeeping::Bookkeeping;

/// 单次 resolve 的决策步数上限
const MAX_STEPS: u64 = 100_000;

#[derive(Debug, Default)]
pub struct Synchronizer {
    step_count: u64,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 最近一次 resolve 的决策步数
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn resolve(&mut self, db: &mut PlanDatabase, books: &mut Bookkeeping, now: Tick) -> bool {
        self.step_count = 0;
        if !self.resolve_tokens(db, books, now) {
            return false;
        }
        if !self.complete_internal_timelines(db, books, now) {
            return false;
        }
        books.absorb(db);
        books.process_pending(db, now);
        true
    }

    fn resolve_tokens(&mut self, db: &mut PlanDatabase, books: &mut Bookkeeping, now: Tick) -> bool {
        loop {
            books.absorb(db);
            books.process_pending(db, now);

            let mut progressed = self.fire_frontier_rules(db, now);
            let agenda: Vec<TokenKey> = books
                .agenda
                .iter()
                .copied()
                .filter(|&k| in_sync_scope(db, books, k, now))
                .collect();
            for key in agenda {
                // 前面的决策可能已改变它的状态
                if !db.token(key).is_some_and(|t| t.is_inactive()) {
                    continue;
                }
                if !self.resolve_token(db, key) {
                    tracing::debug!(
                        "[{}] failed to resolve {} at tick {}",
                        books.name,
                        describe(db, key),
                        now
                    );
                    return false;
                }
                progressed = true;
            }

            if !progressed {
                return true;
            }
            if self.step_count > MAX_STEPS {
                tracing::warn!("[{}] synchronization exceeded {} steps", books.name, MAX_STEPS);
                return false;
            }
        }
    }

    /// 已进入前沿但规则尚未展开的活动 Token（例如初始事实）
    fn fire_frontier_rules(&mut self, db: &mut PlanDatabase, now: Tick) -> bool {
        let ready: Vec<TokenKey> = db
            .tokens()
            .filter(|t| t.is_active() && t.start().last.lb <= now)
            .map(|t| t.key())
            .filter(|&k| db.has_pending_rules(k))
            .collect();
        for &key in &ready {
            self.step_count += 1;
            db.fire_rules(key);
        }
        !ready.is_empty()
    }

    fn resolve_token(&mut self, db: &mut PlanDatabase, key: TokenKey) -> bool {
        for candidate in db.merge_candidates(key) {
            self.step_count += 1;
            if db.merge(key, candidate) {
                if db.propagate() {
                    return true;
                }
                db.split(key);
                db.propagate();
            }
        }

        for pos in db.insertion_positions(key) {
            self.step_count += 1;
            if db.insert(key, pos) {
                db.fire_rules(key);
                if db.propagate() {
                    return true;
                }
                db.deactivate(key);
                db.propagate();
            }
        }

        false
    }

    /// 用默认谓词填补 Internal 时间线在当前 tick 的空缺
    fn complete_internal_timelines(
        &mut self,
        db: &mut PlanDatabase,
        books: &Bookkeeping,
        now: Tick,
    ) -> bool {
        for (name, _) in &books.internals {
            let Some(predicate) = db
                .timeline(name)
                .filter(|tl| !tl.is_actions())
                .and_then(|tl| tl.default_predicate())
                .map(str::to_string)
            else {
                continue;
            };
            if db.value_at(name, now).is_some() {
                continue;
            }
            if !self.insert_default_value(db, name, &predicate, now) {
                tracing::debug!(
                    "[{}] could not fill {} with {} at tick {}",
                    books.name,
                    name,
                    predicate,
                    now
                );
                return false;
            }
        }
        true
    }

    fn insert_default_value(&mut self, db: &mut PlanDatabase, timeline: &str, predicate: &str, now: Tick) -> bool {
        let key = match db.create_token(timeline, predicate, false) {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!("default value for {} not created: {}", timeline, e);
                return false;
            }
        };
        db.restrict_start(key, Interval::new(0, now));
        db.restrict_end(key, Interval::new(now + 1, PLUS_INFINITY));

        for pos in db.insertion_positions(key) {
            self.step_count += 1;
            if db.insert(key, pos) {
                db.fire_rules(key);
                if db.propagate() {
                    return true;
                }
                db.deactivate(key);
                db.propagate();
            }
        }
        db.discard(key);
        db.propagate();
        false
    }

    /// 撤销前沿上的决策以便重新 resolve；返回传播结果
    pub fn relax(
        &mut self,
        db: &mut PlanDatabase,
        books: &mut Bookkeeping,
        now: Tick,
        discard_current_values: bool,
    ) -> bool {
        tracing::info!("[{}] relaxing plan at tick {}", books.name, now);
        books.absorb(db);

        let goals: Vec<TokenKey> = books.goals.iter().copied().collect();
        for key in goals {
            retract(db, key);
        }
        let observations: Vec<TokenKey> = books.observations.iter().copied().collect();
        for key in observations {
            retract(db, key);
        }
        let remaining: Vec<TokenKey> = db.tokens().map(|t| t.key()).collect();
        for key in remaining {
            retract(db, key);
        }

        if discard_current_values {
            books.absorb(db);
            let doomed: Vec<TokenKey> = db
                .tokens()
                .filter(|t| t.is_inactive() && t.master().is_none() && !t.is_fact())
                .map(|t| t.key())
                .filter(|&k| !books.goals.contains(&k) && !books.is_observation(k))
                .filter(|&k| {
                    db.token(k)
                        .and_then(|t| db.timeline(t.timeline()))
                        .is_some_and(|tl| {
                            tl.mode() == TimelineMode::Internal && !tl.is_actions() && !tl.is_persistent()
                        })
                })
                .collect();
            for key in doomed {
                tracing::debug!("[{}] discarding current value {}", books.name, describe(db, key));
                db.discard(key);
            }
        }

        books.absorb(db);
        books.process_pending(db, now);
        db.propagate()
    }
}

/// 拆开合并、撤销未提交的激活
fn retract(db: &mut PlanDatabase, key: TokenKey) {
    let Some(token) = db.token(key) else {
        return;
    };
    if token.is_merged() {
        db.split(key);
    } else if token.is_active() && !token.is_committed() {
        db.deactivate(key);
    }
}

fn in_sync_scope(db: &PlanDatabase, books: &Bookkeeping, key: TokenKey, now: Tick) -> bool {
    // 目标由审议负责
    if !books.in_scope(key) || books.is_goal(db, key) {
        return false;
    }
    let Some(token) = db.token(key) else {
        return false;
    };
    if !token.is_inactive() {
        return false;
    }
    let in_tick_horizon = token.start().last.ub <= now && token.end().last.ub > now;
    let is_unit = token.start().last.lb <= now
        && token
            .master()
            .and_then(|m| db.token(m))
            .is_some_and(|m| m.is_active());
    in_tick_horizon || is_unit
}

fn describe(db: &PlanDatabase, key: TokenKey) -> String {
    db.token(key)
        .map(|t| t.to_string())
        .unwrap_or_else(|| key.to_string())
}

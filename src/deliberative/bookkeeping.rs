//! 审议反应器的簿记集合
//!
//! 目标、动作、观测、待同步议程、已提交、可终止、已终止等集合只依据计划数据库的
//! 变化事件增删（[`Bookkeeping::absorb`]），新建 Token 在 [`Bookkeeping::process_pending`] 中分类。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::plan::{DbEvent, ForeignKeys, Interval, PlanDatabase, Tick, TimelineMode, TokenKey};

use super::container::TimelineContainer;

#[derive(Debug, Default)]
pub struct Bookkeeping {
    pub(crate) name: String,
    pub(crate) goals: BTreeSet<TokenKey>,
    pub(crate) actions: BTreeSet<TokenKey>,
    pub(crate) observations: BTreeSet<TokenKey>,
    /// 等待同步决策的 Token
    pub(crate) agenda: BTreeSet<TokenKey>,
    pub(crate) pending: BTreeSet<TokenKey>,
    pub(crate) committed: BTreeSet<TokenKey>,
    pub(crate) terminable: BTreeSet<TokenKey>,
    pub(crate) terminated: BTreeSet<TokenKey>,
    pub(crate) scope: HashMap<TokenKey, bool>,
    pub(crate) externals: BTreeMap<String, TimelineContainer>,
    /// Internal 时间线及其最近一次发布的 tick
    pub(crate) internals: Vec<(String, Option<Tick>)>,
    pub(crate) foreign_keys: ForeignKeys,
    /// 已发布过的 Token
    pub(crate) notified: HashSet<TokenKey>,
    pub(crate) final_tick: Tick,
}

impl Bookkeeping {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn in_scope(&self, key: TokenKey) -> bool {
        self.scope.get(&key).copied().unwrap_or(false)
    }

    pub fn is_goal(&self, db: &PlanDatabase, key: TokenKey) -> bool {
        self.goals.contains(&key) && db.token(key).is_some_and(|t| t.master().is_none())
    }

    pub fn is_observation(&self, key: TokenKey) -> bool {
        self.observations.contains(&key)
    }

    pub fn is_action(&self, key: TokenKey) -> bool {
        self.actions.contains(&key)
    }

    /// 按数据库事件更新各集合
    pub fn absorb(&mut self, db: &mut PlanDatabase) {
        for event in db.drain_events() {
            match event {
                DbEvent::Added(k) => {
                    self.pending.insert(k);
                }
                DbEvent::Merged(k) | DbEvent::Activated(k) => {
                    self.agenda.remove(&k);
                }
                DbEvent::Split(k) => {
                    self.agenda.insert(k);
                }
                DbEvent::Deactivated(k) => {
                    self.agenda.insert(k);
                    self.actions.remove(&k);
                }
                DbEvent::Rejected(k) => {
                    if let Some(t) = db.token(k) {
                        tracing::info!("[{}] Rejected {}", self.name, t);
                    }
                    self.agenda.remove(&k);
                }
                DbEvent::Committed(k) => {
                    self.committed.insert(k);
                }
                DbEvent::Terminated(k) => {
                    self.terminated.insert(k);
                }
                DbEvent::Removed(k) => self.forget(k),
            }
        }
    }

    fn forget(&mut self, key: TokenKey) {
        self.scope.remove(&key);
        for set in [
            &mut self.goals,
            &mut self.actions,
            &mut self.observations,
            &mut self.agenda,
            &mut self.pending,
            &mut self.committed,
            &mut self.terminable,
            &mut self.terminated,
        ] {
            set.remove(&key);
        }
        self.foreign_keys.remove_local(key);
        for tc in self.externals.values_mut() {
            tc.handle_removal(key);
        }
        self.notified.remove(&key);
    }

    /// 把新建 Token 分类为动作、目标或忽略，并加入议程
    pub fn process_pending(&mut self, db: &mut PlanDatabase, now: Tick) {
        let last_start = self.final_tick.saturating_sub(1);
        let pending = std::mem::take(&mut self.pending);
        for key in pending {
            let Some(token) = db.token(key) else {
                continue;
            };
            let Some(timeline) = db.timeline(token.timeline()) else {
                continue;
            };

            let in_scope = if timeline.is_actions() {
                let external_master = token
                    .master()
                    .and_then(|m| db.token(m))
                    .and_then(|m| db.timeline(m.timeline()))
                    .is_some_and(|tl| tl.mode() == TimelineMode::External);
                if external_master
                    || token.start().last.lb > last_start
                    || token.end().last.lb > self.final_tick
                {
                    tracing::debug!("[{}] excluding action {}", self.name, token);
                    false
                } else {
                    db.restrict_start(key, Interval::new(now, last_start));
                    self.actions.insert(key);
                    true
                }
            } else {
                let in_scope = timeline.mode() != TimelineMode::Ignore;
                if in_scope && token.master().is_none() && token.is_rejectable() {
                    tracing::debug!("[{}] adding goal {}", self.name, token);
                    self.goals.insert(key);
                    db.restrict_start(key, Interval::new(0, last_start));
                    db.restrict_end(key, Interval::new(0, self.final_tick));
                }
                in_scope
            };

            self.scope.insert(key, in_scope);
            if in_scope {
                self.agenda.insert(key);
            }
        }
    }

    /// 仍在等待对方确认结束的外部 Token：已提交、结束时间包含当前 tick 且未确定
    pub fn active_uncontrollable_events(&self, db: &PlanDatabase, now: Tick) -> Vec<TokenKey> {
        self.committed
            .iter()
            .copied()
            .filter(|&k| {
                db.token(k).is_some_and(|t| {
                    self.externals.contains_key(t.timeline())
                        && t.end().last.contains(now)
                        && !t.end().last.is_singleton()
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Model, Timeline};

    fn setup() -> (PlanDatabase, Bookkeeping) {
        let mut db = PlanDatabase::new(Model::default());
        db.add_timeline(Timeline::new("light", TimelineMode::Internal)).unwrap();
        db.add_timeline(Timeline::new("noise", TimelineMode::Ignore)).unwrap();
        db.add_timeline(Timeline::actions("arm")).unwrap();
        let mut books = Bookkeeping::new("test");
        books.final_tick = 20;
        (db, books)
    }

    #[test]
    fn test_classifies_new_tokens() {
        let (mut db, mut books) = setup();
        let goal = db.create_token("light", "Holds", true).unwrap();
        let value = db.create_token("light", "Holds", false).unwrap();
        let ignored = db.create_token("noise", "Hum", true).unwrap();
        let action = db.create_token("arm", "Move", false).unwrap();
        books.absorb(&mut db);
        books.process_pending(&mut db, 3);

        assert!(books.is_goal(&db, goal));
        assert!(!books.is_goal(&db, value));
        assert!(books.in_scope(value));
        assert!(!books.in_scope(ignored));
        assert!(!books.agenda.contains(&ignored));
        assert!(books.is_action(action));

        assert_eq!(db.token(goal).unwrap().start().base, Interval::new(0, 19));
        assert_eq!(db.token(goal).unwrap().end().base, Interval::new(0, 20));
        assert_eq!(db.token(action).unwrap().start().base, Interval::new(3, 19));
    }

    #[test]
    fn test_removal_clears_every_set() {
        let (mut db, mut books) = setup();
        let goal = db.create_token("light", "Holds", true).unwrap();
        books.absorb(&mut db);
        books.process_pending(&mut db, 0);
        books.foreign_keys.insert(TokenKey::next(), goal);
        books.notified.insert(goal);

        db.activate(goal);
        db.commit(goal);
        books.absorb(&mut db);
        assert!(books.committed.contains(&goal));
        assert!(!books.agenda.contains(&goal));

        db.discard(goal);
        books.absorb(&mut db);
        assert!(books.goals.is_empty());
        assert!(books.committed.is_empty());
        assert!(books.scope.is_empty());
        assert!(books.foreign_keys.is_empty());
        assert!(books.notified.is_empty());
    }
}

//! 审议搜索引擎
//!
//! 两个子求解器串联：先由 [`GoalManager`] 决定位置相关目标的取舍与顺序，
//! 再由按时间顺序回溯的缺陷求解器逐个处理视界内的开放条件：
//! 从属 Token 优先，其次是目标排序结果中的目标，被省略的目标优先尝试拒绝。
//!
//! 每次 `step` 只做一个决策（或一次回溯），由反应器的 `resume` 驱动。

use std::collections::BTreeSet;

use crate::plan::{Interval, PlanDatabase, TokenKey};

use super::goal_manager::{GoalCandidate, GoalManager, Position};

/// 一个开放条件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Flaw {
    pub key: TokenKey,
    /// 无主、可拒绝
    pub is_goal: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Choice {
    Merge(TokenKey),
    Insert(usize),
    Reject,
}

#[derive(Debug)]
struct Decision {
    key: TokenKey,
    applied: Choice,
    remaining: Vec<Choice>,
}

#[derive(Debug)]
pub struct DbSolver {
    goal_manager: GoalManager,
    decisions: Vec<Decision>,
    step_count: u64,
    exhausted: bool,
    done: bool,
}

impl DbSolver {
    pub fn new(max_iterations: u32, plateau: u32, speed: f64) -> Self {
        Self {
            goal_manager: GoalManager::new(max_iterations, plateau, speed),
            decisions: Vec::new(),
            step_count: 0,
            exhausted: false,
            done: false,
        }
    }

    pub fn goal_manager(&self) -> &GoalManager {
        &self.goal_manager
    }

    pub fn set_horizon(&mut self, horizon: Interval) {
        self.goal_manager.set_horizon(horizon);
    }

    pub fn set_position(&mut self, position: Position) {
        self.goal_manager.set_position(position);
    }

    /// 同步目标排序器的候选集：新目标触发重新排序，消失的目标被移除
    pub fn update_goals(&mut self, db: &PlanDatabase, candidates: Vec<GoalCandidate>) {
        let current: BTreeSet<TokenKey> = candidates.iter().map(|c| c.key).collect();
        let vanished: Vec<TokenKey> = self
            .goal_manager
            .candidates()
            .map(|c| c.key)
            .filter(|k| !current.contains(k))
            .collect();
        for key in vanished {
            let rejected = db.token(key).map_or(true, |t| t.is_rejected());
            self.goal_manager.remove_flaw(key, rejected);
        }
        for c in candidates {
            if self.goal_manager.is_managed(c.key) {
                self.goal_manager.update_flaw(c);
            } else {
                self.goal_manager.add_flaw(c);
            }
        }
    }

    pub fn no_more_flaws(&self) -> bool {
        self.done
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// 决策栈深度
    pub fn depth(&self) -> usize {
        self.decisions.len()
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// 执行一步；`flaws` 为当前视界内的开放条件
    pub fn step(&mut self, db: &mut PlanDatabase, flaws: &[Flaw]) {
        if self.exhausted || self.done {
            return;
        }
        self.step_count += 1;

        if !self.goal_manager.no_more_flaws() {
            self.goal_manager.step();
            return;
        }

        let Some(flaw) = self.select_flaw(db, flaws) else {
            tracing::debug!("solver: no more flaws at depth {}", self.depth());
            self.done = true;
            return;
        };

        let choices = self.choices_for(db, flaw);
        if let Some(decision) = try_choices(db, flaw.key, choices) {
            tracing::debug!("solver: {:?} for {}", decision.applied, decision.key);
            self.decisions.push(decision);
        } else {
            self.backtrack(db);
        }
    }

    fn select_flaw(&self, db: &PlanDatabase, flaws: &[Flaw]) -> Option<Flaw> {
        let open = |f: &&Flaw| db.token(f.key).is_some_and(|t| t.is_inactive());
        if let Some(f) = flaws.iter().filter(open).find(|f| !f.is_goal) {
            return Some(*f);
        }
        let goals: Vec<&Flaw> = flaws.iter().filter(open).filter(|f| f.is_goal).collect();
        for key in self.goal_manager.solution() {
            if let Some(f) = goals.iter().find(|f| f.key == *key) {
                return Some(**f);
            }
        }
        goals.first().map(|f| **f)
    }

    fn choices_for(&self, db: &PlanDatabase, flaw: Flaw) -> Vec<Choice> {
        let mut choices: Vec<Choice> = db
            .merge_candidates(flaw.key)
            .into_iter()
            .map(Choice::Merge)
            .chain(db.insertion_positions(flaw.key).into_iter().map(Choice::Insert))
            .collect();
        if db.token(flaw.key).is_some_and(|t| t.is_rejectable()) {
            if self.goal_manager.omissions().contains(&flaw.key) {
                choices.insert(0, Choice::Reject);
            } else {
                choices.push(Choice::Reject);
            }
        }
        choices
    }

    /// 撤销最近的决策并尝试它的下一个选择；栈空仍无解则耗尽
    fn backtrack(&mut self, db: &mut PlanDatabase) {
        while let Some(decision) = self.decisions.pop() {
            undo(db, decision.key, decision.applied);
            db.propagate();
            if let Some(next) = try_choices(db, decision.key, decision.remaining) {
                tracing::debug!("solver: backtracked to {:?} for {}", next.applied, next.key);
                self.decisions.push(next);
                return;
            }
        }
        tracing::debug!("solver: search space exhausted");
        self.exhausted = true;
    }

    /// 撤销所有决策，回到开始搜索前的状态
    pub fn reset(&mut self, db: &mut PlanDatabase) {
        while let Some(decision) = self.decisions.pop() {
            undo(db, decision.key, decision.applied);
        }
        db.propagate();
        self.clear();
    }

    /// 保留已做的决策，清空搜索状态
    pub fn clear(&mut self) {
        self.decisions.clear();
        self.goal_manager.clear();
        self.exhausted = false;
        self.done = false;
    }
}

fn try_choices(db: &mut PlanDatabase, key: TokenKey, mut choices: Vec<Choice>) -> Option<Decision> {
    while !choices.is_empty() {
        let choice = choices.remove(0);
        if apply(db, key, choice) {
            return Some(Decision {
                key,
                applied: choice,
                remaining: choices,
            });
        }
    }
    None
}

fn apply(db: &mut PlanDatabase, key: TokenKey, choice: Choice) -> bool {
    let applied = match choice {
        Choice::Merge(onto) => db.merge(key, onto),
        Choice::Insert(pos) => {
            let inserted = db.insert(key, pos);
            if inserted {
                db.fire_rules(key);
            }
            inserted
        }
        Choice::Reject => db.reject(key),
    };
    if !applied {
        return false;
    }
    if db.propagate() {
        return true;
    }
    undo(db, key, choice);
    db.propagate();
    false
}

fn undo(db: &mut PlanDatabase, key: TokenKey, choice: Choice) {
    match choice {
        Choice::Merge(_) => {
            db.split(key);
        }
        Choice::Insert(_) => {
            db.deactivate(key);
        }
        Choice::Reject => {
            db.unreject(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Model, Timeline, TimelineMode};

    fn db() -> PlanDatabase {
        let mut db = PlanDatabase::new(Model::default());
        db.add_timeline(Timeline::new("camera", TimelineMode::Internal)).unwrap();
        db
    }

    fn goal(db: &mut PlanDatabase, start: Interval, end: Interval) -> Flaw {
        let key = db.create_token("camera", "Shoot", true).unwrap();
        db.restrict_start(key, start);
        db.restrict_end(key, end);
        Flaw { key, is_goal: true }
    }

    fn run(solver: &mut DbSolver, db: &mut PlanDatabase, flaws: &[Flaw]) {
        for _ in 0..50 {
            if solver.no_more_flaws() || solver.is_exhausted() {
                break;
            }
            solver.step(db, flaws);
        }
    }

    #[test]
    fn test_plans_compatible_goals() {
        let mut db = db();
        let a = goal(&mut db, Interval::new(2, 4), Interval::new(3, 5));
        let b = goal(&mut db, Interval::new(6, 8), Interval::new(7, 9));
        let mut solver = DbSolver::new(1000, 5, 1.0);
        run(&mut solver, &mut db, &[b, a]);

        assert!(solver.no_more_flaws());
        assert_eq!(solver.depth(), 2);
        assert_eq!(db.sequence("camera"), vec![a.key, b.key]);
    }

    #[test]
    fn test_rejects_conflicting_goal_after_backtracking() {
        let mut db = db();
        let a = goal(&mut db, Interval::new(2, 2), Interval::new(6, 6));
        let b = goal(&mut db, Interval::new(3, 3), Interval::new(5, 5));
        let mut solver = DbSolver::new(1000, 5, 1.0);
        run(&mut solver, &mut db, &[a, b]);

        assert!(solver.no_more_flaws());
        assert!(db.token(a.key).unwrap().is_active());
        assert!(db.token(b.key).unwrap().is_rejected());
    }

    #[test]
    fn test_exhausted_when_nothing_fits() {
        let mut db = db();
        let fixed = db.create_token("camera", "Hold", false).unwrap();
        db.restrict_start(fixed, Interval::new(0, 0));
        db.restrict_end(fixed, Interval::new(10, 10));
        db.activate(fixed);
        let slave = db.create_token("camera", "Shoot", false).unwrap();
        db.restrict_start(slave, Interval::new(2, 2));
        db.restrict_end(slave, Interval::new(4, 4));

        let mut solver = DbSolver::new(1000, 5, 1.0);
        run(&mut solver, &mut db, &[Flaw { key: slave, is_goal: false }]);
        assert!(solver.is_exhausted());
        assert!(db.token(slave).unwrap().is_inactive());
    }

    #[test]
    fn test_reset_undoes_decisions() {
        let mut db = db();
        let a = goal(&mut db, Interval::new(2, 4), Interval::new(3, 5));
        let mut solver = DbSolver::new(1000, 5, 1.0);
        run(&mut solver, &mut db, &[a]);
        assert!(db.token(a.key).unwrap().is_active());

        solver.reset(&mut db);
        assert!(db.token(a.key).unwrap().is_inactive());
        assert_eq!(solver.depth(), 0);
        assert!(!solver.no_more_flaws());
    }
}

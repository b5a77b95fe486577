//! 目标排序：在时间预算内挑选并排列位置相关的目标
//!
//! 局部搜索（爬山，允许平台移动）：
//! - 初始解为空序列，所有目标放入"省略"集合
//! - 邻域：插入省略目标（仅当前解可行时）、两两交换、移除未激活目标（仅当前解不可行时）
//! - 候选不劣于当前解即接受；严格改进时重置平台计数
//! - 达到 `max_iterations` 或连续 `plateau` 轮无严格改进即结束
//!
//! 效用为 Σ10^(5−priority)，代价为路径长度 / 速度 + 冲突数·10^5，代价不超过预算即可行。

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::plan::{Interval, TokenKey};

const MAX_PRIORITY: i32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GoalManagerState {
    /// 有新目标到达，下一步重新生成初始解
    RequirePlanning,
    Planning,
    Done,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// 参与排序的目标快照
#[derive(Clone, Debug, PartialEq)]
pub struct GoalCandidate {
    pub key: TokenKey,
    pub priority: i32,
    pub position: Position,
    pub start: Interval,
    pub end: Interval,
    /// 已激活的目标不会被移除
    pub active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    pub feasible: bool,
    pub cost: f64,
    pub utility: f64,
}

#[derive(Debug)]
pub struct GoalManager {
    max_iterations: u32,
    plateau: u32,
    speed: f64,
    state: GoalManagerState,
    candidates: BTreeMap<TokenKey, GoalCandidate>,
    solution: Vec<TokenKey>,
    omissions: BTreeSet<TokenKey>,
    iteration: u32,
    watchdog: u32,
    time_budget: f64,
    horizon: Interval,
    position: Position,
}

impl GoalManager {
    pub fn new(max_iterations: u32, plateau: u32, speed: f64) -> Self {
        Self {
            max_iterations,
            plateau,
            speed: if speed > 0.0 { speed } else { 1.0 },
            state: GoalManagerState::Done,
            candidates: BTreeMap::new(),
            solution: Vec::new(),
            omissions: BTreeSet::new(),
            iteration: 0,
            watchdog: 0,
            time_budget: 0.0,
            horizon: Interval::new(0, 0),
            position: Position::default(),
        }
    }

    pub fn state(&self) -> GoalManagerState {
        self.state
    }

    pub fn solution(&self) -> &[TokenKey] {
        &self.solution
    }

    pub fn omissions(&self) -> &BTreeSet<TokenKey> {
        &self.omissions
    }

    pub fn candidates(&self) -> impl Iterator<Item = &GoalCandidate> {
        self.candidates.values()
    }

    pub fn is_managed(&self, key: TokenKey) -> bool {
        self.candidates.contains_key(&key)
    }

    pub fn time_budget(&self) -> f64 {
        self.time_budget
    }

    /// 当前位置（来自位置源时间线，默认原点）
    pub fn set_position(&mut self, position: Position) {
        self.position = position;
    }

    /// 预算取审议视界的宽度；在重新生成初始解时生效
    pub fn set_horizon(&mut self, horizon: Interval) {
        self.horizon = horizon;
    }

    pub fn no_more_flaws(&self) -> bool {
        self.state == GoalManagerState::Done
    }

    pub fn add_flaw(&mut self, candidate: GoalCandidate) {
        tracing::debug!("goal manager: adding {}", candidate.key);
        self.candidates.insert(candidate.key, candidate);
        self.state = GoalManagerState::RequirePlanning;
    }

    /// 刷新已知目标的快照（激活状态、时间界），不触发重新规划
    pub fn update_flaw(&mut self, candidate: GoalCandidate) {
        if let Some(c) = self.candidates.get_mut(&candidate.key) {
            *c = candidate;
        }
    }

    /// 目标离开（被拒绝、被删除或已解决）
    pub fn remove_flaw(&mut self, key: TokenKey, rejected: bool) {
        if self.candidates.remove(&key).is_none() {
            return;
        }
        tracing::debug!("goal manager: removing {}", key);
        if rejected {
            self.state = GoalManagerState::RequirePlanning;
        } else {
            self.solution.retain(|k| *k != key);
        }
        self.omissions.remove(&key);
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
        self.solution.clear();
        self.omissions.clear();
        self.state = GoalManagerState::Done;
    }

    /// 搜索结束后，解中第一个尚未激活的目标
    pub fn next_goal(&self) -> Option<TokenKey> {
        if !self.no_more_flaws() {
            return None;
        }
        self.solution
            .iter()
            .find(|k| self.candidates.get(k).is_some_and(|c| !c.active))
            .copied()
    }

    pub fn step(&mut self) {
        if self.no_more_flaws() {
            return;
        }
        if self.state == GoalManagerState::RequirePlanning {
            self.generate_initial_solution();
            self.iteration = 0;
            self.watchdog = 0;
        }
        if self.solution.is_empty() && self.omissions.is_empty() {
            tracing::debug!("goal manager: no goals");
            self.state = GoalManagerState::Done;
            return;
        }

        self.state = GoalManagerState::Planning;
        if self.iteration >= self.max_iterations || self.watchdog >= self.plateau {
            self.finish();
            return;
        }
        self.iteration += 1;
        self.watchdog += 1;

        let (candidate, delta) = self.select_neighbor();
        if candidate == self.solution {
            self.finish();
            return;
        }
        let result = self.compare(&candidate, &self.solution);
        if result == Ordering::Less {
            self.finish();
            return;
        }
        if let Some(delta) = delta {
            match candidate.len().cmp(&self.solution.len()) {
                Ordering::Less => {
                    self.omissions.insert(delta);
                }
                Ordering::Greater => {
                    self.omissions.remove(&delta);
                }
                Ordering::Equal => {}
            }
        }
        self.solution = candidate;
        if result == Ordering::Greater {
            self.watchdog = 0;
        }
        tracing::debug!("goal manager: switching to {}", self.solution_string(&self.solution));
    }

    fn finish(&mut self) {
        self.state = GoalManagerState::Done;
        tracing::debug!("goal manager: returning {}", self.solution_string(&self.solution));
    }

    fn generate_initial_solution(&mut self) {
        self.solution.clear();
        self.omissions = self.candidates.keys().copied().collect();
        self.time_budget = self.horizon.ub.saturating_sub(self.horizon.lb) as f64;
        tracing::debug!(
            "goal manager: time budget {} for horizon {}",
            self.time_budget,
            self.horizon
        );
    }

    /// 邻域中最好的解（平局取后者）及其变动的目标
    fn select_neighbor(&self) -> (Vec<TokenKey>, Option<TokenKey>) {
        let mut best = self.solution.clone();
        let mut delta = None;
        let feasible = self.evaluate(&self.solution).feasible;

        let mut consider = |c: Vec<TokenKey>, t: Option<TokenKey>, best: &mut Vec<TokenKey>| {
            if self.compare(&c, best) != Ordering::Less {
                *best = c;
                delta = t;
            }
        };

        if feasible {
            for &t in &self.omissions {
                for pos in 0..=self.solution.len() {
                    let mut c = self.solution.clone();
                    c.insert(pos, t);
                    consider(c, Some(t), &mut best);
                }
            }
        }

        for i in 0..self.solution.len() {
            for j in i + 1..self.solution.len() {
                let mut c = self.solution.clone();
                c.swap(i, j);
                consider(c, None, &mut best);
            }
        }

        if !feasible {
            for &t in &self.solution {
                if self.candidates.get(&t).is_some_and(|c| c.active) {
                    continue;
                }
                let c: Vec<TokenKey> = self.solution.iter().copied().filter(|k| *k != t).collect();
                consider(c, Some(t), &mut best);
            }
        }

        (best, delta)
    }

    pub fn evaluate(&self, sequence: &[TokenKey]) -> Evaluation {
        let mut utility = 0.0;
        let mut path = 0.0;
        let mut conflicts = 0u32;
        let mut current = self.position;
        let mut predecessor: Option<&GoalCandidate> = None;

        for key in sequence {
            let Some(goal) = self.candidates.get(key) else {
                continue;
            };
            utility += 10f64.powi(MAX_PRIORITY.saturating_sub(goal.priority));
            if let Some(p) = predecessor {
                if p.end.lb > goal.start.ub {
                    conflicts += 1;
                }
            }
            path += current.distance(&goal.position);
            current = goal.position;
            predecessor = Some(goal);
        }

        let cost = path / self.speed + conflicts as f64 * 10f64.powi(MAX_PRIORITY);
        Evaluation {
            feasible: cost <= self.time_budget,
            cost,
            utility,
        }
    }

    /// `a` 相对 `b`：Greater 为更好
    ///
    /// 都不可行时先比代价再比效用；都可行时先比效用再比代价；可行总是优于不可行。
    pub fn compare(&self, a: &[TokenKey], b: &[TokenKey]) -> Ordering {
        let ea = self.evaluate(a);
        let eb = self.evaluate(b);
        let by_cost = eb.cost.partial_cmp(&ea.cost).unwrap_or(Ordering::Equal);
        let by_utility = ea.utility.partial_cmp(&eb.utility).unwrap_or(Ordering::Equal);
        match (ea.feasible, eb.feasible) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => by_cost.then(by_utility),
            (true, true) => by_utility.then(by_cost),
        }
    }

    /// `"k1:k2:(cost/utility), feasible."`
    pub fn solution_string(&self, sequence: &[TokenKey]) -> String {
        let e = self.evaluate(sequence);
        let mut s = String::new();
        for key in sequence {
            s.push_str(&format!("{}:", key));
        }
        s.push_str(&format!(
            "({}/{}), {}",
            e.cost,
            e.utility,
            if e.feasible { "feasible." } else { "infeasible." }
        ));
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goal(priority: i32, x: f64) -> GoalCandidate {
        GoalCandidate {
            key: TokenKey::next(),
            priority,
            position: Position::new(x, 0.0),
            start: Interval::FULL,
            end: Interval::FULL,
            active: false,
        }
    }

    fn manager(budget: u64, goals: &[GoalCandidate]) -> GoalManager {
        let mut gm = GoalManager::new(1000, 5, 1.0);
        gm.set_horizon(Interval::new(1, 1 + budget));
        for g in goals {
            gm.add_flaw(g.clone());
        }
        gm
    }

    fn run(gm: &mut GoalManager) {
        for _ in 0..100 {
            if gm.no_more_flaws() {
                break;
            }
            gm.step();
        }
        assert!(gm.no_more_flaws());
    }

    #[test]
    fn test_picks_best_feasible_pair() {
        let goals = [goal(0, 3.0), goal(1, 6.0), goal(2, 9.0)];
        let mut gm = manager(7, &goals);
        run(&mut gm);

        assert_eq!(gm.solution(), &[goals[0].key, goals[1].key]);
        assert!(gm.omissions().contains(&goals[2].key));
        assert_eq!(
            gm.solution_string(gm.solution()),
            format!("{}:{}:(6/110000), feasible.", goals[0].key, goals[1].key)
        );
        assert_eq!(gm.next_goal(), Some(goals[0].key));
    }

    #[test]
    fn test_compare_properties() {
        let goals = [goal(0, 3.0), goal(1, 20.0)];
        let mut gm = manager(7, &goals);
        gm.step();

        let feasible = vec![goals[0].key];
        let infeasible = vec![goals[0].key, goals[1].key];
        assert_eq!(gm.compare(&feasible, &feasible), Ordering::Equal);
        assert_eq!(gm.compare(&feasible, &infeasible), Ordering::Greater);
        assert_eq!(gm.compare(&infeasible, &feasible), Ordering::Less);
        assert_eq!(gm.evaluate(&infeasible), gm.evaluate(&infeasible));
        assert!(gm.solution_string(&infeasible).ends_with("infeasible."));
    }

    #[test]
    fn test_extreme_priorities_do_not_overflow() {
        let goals = [goal(i32::MIN, 1.0), goal(i32::MAX, 2.0)];
        let gm = manager(7, &goals);
        assert!(gm.evaluate(&[goals[0].key]).utility.is_infinite());
        assert_eq!(gm.evaluate(&[goals[1].key]).utility, 0.0);
        assert_eq!(gm.compare(&[goals[0].key], &[goals[1].key]), Ordering::Greater);
    }

    #[test]
    fn test_temporal_conflicts_are_costed() {
        let mut a = goal(0, 1.0);
        let mut b = goal(0, 2.0);
        a.end = Interval::new(10, 12);
        b.start = Interval::new(0, 5);
        let gm = manager(100, &[a.clone(), b.clone()]);
        let e = gm.evaluate(&[a.key, b.key]);
        assert!(!e.feasible);
        assert_eq!(e.cost, 2.0 + 100000.0);
        assert!(gm.evaluate(&[b.key, a.key]).feasible);
    }

    #[test]
    fn test_rejected_goal_requires_replanning() {
        let goals = [goal(0, 1.0), goal(0, 2.0)];
        let mut gm = manager(10, &goals);
        run(&mut gm);
        assert_eq!(gm.solution().len(), 2);

        gm.remove_flaw(goals[1].key, false);
        assert_eq!(gm.solution(), &[goals[0].key]);
        assert!(gm.no_more_flaws());

        gm.remove_flaw(goals[0].key, true);
        assert_eq!(gm.state(), GoalManagerState::RequirePlanning);
        gm.step();
        assert!(gm.no_more_flaws());
        assert!(gm.solution().is_empty());
    }
}

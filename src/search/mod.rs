//! 审议搜索：目标排序器与按时间顺序回溯的缺陷求解器

pub mod goal_manager;
pub mod solver;

pub use goal_manager::{Evaluation, GoalCandidate, GoalManager, GoalManagerState, Position};
pub use solver::{DbSolver, Flaw};

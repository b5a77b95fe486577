//! 计划层：变量域、Token、时间线、规则模型与最小计划数据库

pub mod database;
pub mod domain;
pub mod foreign_keys;
pub mod model;
pub mod timeline;
pub mod token;

pub use database::{ConstraintKind, DbEvent, Endpoint, PlanDatabase, Point};
pub use domain::{Domain, Interval, Tick, Value, PLUS_INFINITY};
pub use foreign_keys::ForeignKeys;
pub use model::{Model, Relation, Rule, SlaveSpec};
pub use timeline::{ObjectKind, Timeline, TimelineMode};
pub use token::{Token, TokenKey, TokenState};

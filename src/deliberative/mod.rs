//! 审议反应器：计划数据库 + 执行前沿同步 + 搜索引擎

pub mod bookkeeping;
pub mod container;
pub mod db_core;
pub mod synchronizer;

pub use self::bookkeeping::Bookkeeping;
pub use self::container::TimelineContainer;
pub use self::db_core::{CoreState, DbCore};
pub use self::synchronizer::Synchronizer;

//! 时间线与动作对象

use serde::{Deserialize, Serialize};

use super::token::TokenKey;

/// 时间线模式
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimelineMode {
    /// 本反应器是服务者，发布取值、接收请求
    #[default]
    Internal,
    /// 其他反应器内部时间线的只读镜像
    External,
    /// 不参与同步与规划
    Ignore,
}

/// 对象类别：普通时间线（互斥序列）或动作容器（可重叠，由反应器自行启动）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    #[default]
    Timeline,
    Actions,
}

/// 时间线：按时间排列、互不重叠的活动 Token 序列
#[derive(Clone, Debug)]
pub struct Timeline {
    pub(crate) name: String,
    pub(crate) mode: TimelineMode,
    pub(crate) kind: ObjectKind,
    /// 执行前沿出现空档时填充的默认谓词
    pub(crate) default_predicate: Option<String>,
    /// 修复时是否保留前沿取值
    pub(crate) persistent: bool,
    pub(crate) sequence: Vec<TokenKey>,
}

impl Timeline {
    pub fn new(name: impl Into<String>, mode: TimelineMode) -> Self {
        Self {
            name: name.into(),
            mode,
            kind: ObjectKind::Timeline,
            default_predicate: None,
            persistent: false,
            sequence: Vec::new(),
        }
    }

    /// 动作容器
    pub fn actions(name: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Actions,
            ..Self::new(name, TimelineMode::Internal)
        }
    }

    pub fn with_default(mut self, predicate: impl Into<String>) -> Self {
        self.default_predicate = Some(predicate.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> TimelineMode {
        self.mode
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn is_actions(&self) -> bool {
        self.kind == ObjectKind::Actions
    }

    pub fn default_predicate(&self) -> Option<&str> {
        self.default_predicate.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// 活动 Token 序列（时间顺序）
    pub fn sequence(&self) -> &[TokenKey] {
        &self.sequence
    }
}

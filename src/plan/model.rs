//! 领域模型：主 Token 激活后派生的从属 Token（规则）
//!
//! 规则在配置里声明，例如：
//!
//! ```toml
//! [[reactors.rules]]
//! timeline = "camera"
//! predicate = "Shoot"
//! slaves = [{ timeline = "light", predicate = "Holds", relation = "contained_by", params = { value = "on" } }]
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;

use super::domain::{Domain, Interval, Tick};

/// 主从之间的时间关系
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// 主结束 = 从开始
    Meets,
    /// 从结束 = 主开始
    MetBy,
    /// 主包含从
    Contains,
    /// 从包含主
    ContainedBy,
    /// 主结束 <= 从开始
    Before,
    /// 从结束 <= 主开始
    After,
    /// 起止相同
    Equals,
}

/// 从属 Token 模板
#[derive(Clone, Debug, Deserialize)]
pub struct SlaveSpec {
    pub timeline: String,
    pub predicate: String,
    pub relation: Relation,
    #[serde(default)]
    pub params: BTreeMap<String, Domain>,
    /// 持续时间 [min, max]
    #[serde(default)]
    pub duration: Option<(Tick, Tick)>,
}

/// 规则：`timeline.predicate` 的 Token 激活后派生的从属 Token
#[derive(Clone, Debug, Deserialize)]
pub struct Rule {
    pub timeline: String,
    pub predicate: String,
    /// 该谓词自身的持续时间 [min, max]，创建 Token 时即生效
    #[serde(default)]
    pub duration: Option<(Tick, Tick)>,
    #[serde(default)]
    pub slaves: Vec<SlaveSpec>,
}

/// 规则集合
#[derive(Clone, Debug, Default)]
pub struct Model {
    rules: Vec<Rule>,
}

impl Model {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn rules_for<'a>(&'a self, timeline: &'a str, predicate: &'a str) -> impl Iterator<Item = &'a Rule> + 'a {
        self.rules
            .iter()
            .filter(move |r| r.timeline == timeline && r.predicate == predicate)
    }

    /// 有派生从属 Token 的规则
    pub fn has_rules(&self, timeline: &str, predicate: &str) -> bool {
        self.rules_for(timeline, predicate).any(|r| !r.slaves.is_empty())
    }

    /// 谓词声明的持续时间（多条规则取交）
    pub fn duration_for(&self, timeline: &str, predicate: &str) -> Option<Interval> {
        self.rules_for(timeline, predicate)
            .filter_map(|r| r.duration)
            .map(|(min, max)| Interval::new(min, max))
            .reduce(|a, b| a.intersect(&b))
    }
}

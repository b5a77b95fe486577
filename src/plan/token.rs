//! Token：时间线上的一段计划或观测活动

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::domain::{Domain, Interval, PLUS_INFINITY};

/// Token 键：进程内唯一、稳定的整数 id（跨反应器的外键也用它）
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize)]
pub struct TokenKey(u64);

static NEXT_TOKEN_KEY: AtomicU64 = AtomicU64::new(1);

impl TokenKey {
    pub fn next() -> Self {
        Self(NEXT_TOKEN_KEY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token 生命周期状态
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum TokenState {
    /// 新建，尚未决策
    Inactive,
    /// 已放入时间线
    Active,
    /// 合并到另一个等价的活动 Token 上
    Merged,
    /// 被拒绝（仅可拒绝的 Token）
    Rejected,
    /// 已落入执行前沿之后，不再撤销
    Committed,
    /// 归档完毕，等待丢弃
    Terminated,
}

/// 时间变量：基础域只收窄，当前域由传播从基础域重新推导
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Var {
    pub base: Interval,
    pub last: Interval,
}

impl Var {
    pub fn new(base: Interval) -> Self {
        Self { base, last: base }
    }

    pub fn restrict_base(&mut self, dom: Interval) {
        self.base = self.base.intersect(&dom);
        self.last = self.last.intersect(&dom);
    }
}

/// 参数变量；None 表示域为空
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub base: Option<Domain>,
    pub last: Option<Domain>,
}

impl Param {
    pub fn new(base: Domain) -> Self {
        Self {
            last: Some(base.clone()),
            base: Some(base),
        }
    }

    pub fn restrict_base(&mut self, dom: &Domain) {
        self.base = self.base.as_ref().and_then(|b| b.intersect(dom));
        self.last = self.last.as_ref().and_then(|l| l.intersect(dom));
    }
}

/// 时间线上的 Token
#[derive(Clone, Debug)]
pub struct Token {
    pub(crate) key: TokenKey,
    pub(crate) timeline: String,
    pub(crate) predicate: String,
    pub(crate) start: Var,
    pub(crate) end: Var,
    pub(crate) duration: Var,
    pub(crate) params: BTreeMap<String, Param>,
    pub(crate) state: TokenState,
    pub(crate) rejectable: bool,
    pub(crate) fact: bool,
    pub(crate) master: Option<TokenKey>,
    pub(crate) slaves: Vec<TokenKey>,
    /// 合并时指向承载它的活动 Token
    pub(crate) active_token: Option<TokenKey>,
    pub(crate) merged: Vec<TokenKey>,
    pub(crate) rules_fired: bool,
}

impl Token {
    pub(crate) fn new(timeline: &str, predicate: &str, rejectable: bool) -> Self {
        Self {
            key: TokenKey::next(),
            timeline: timeline.to_string(),
            predicate: predicate.to_string(),
            start: Var::new(Interval::FULL),
            end: Var::new(Interval::FULL),
            duration: Var::new(Interval::new(1, PLUS_INFINITY)),
            params: BTreeMap::new(),
            state: TokenState::Inactive,
            rejectable,
            fact: false,
            master: None,
            slaves: Vec::new(),
            active_token: None,
            merged: Vec::new(),
            rules_fired: false,
        }
    }

    pub fn key(&self) -> TokenKey {
        self.key
    }

    pub fn timeline(&self) -> &str {
        &self.timeline
    }

    pub fn predicate(&self) -> &str {
        &self.predicate
    }

    pub fn start(&self) -> &Var {
        &self.start
    }

    pub fn end(&self) -> &Var {
        &self.end
    }

    pub fn duration(&self) -> &Var {
        &self.duration
    }

    /// 参数当前域
    pub fn param(&self, name: &str) -> Option<&Domain> {
        self.params.get(name).and_then(|p| p.last.as_ref())
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &Domain)> {
        self.params
            .iter()
            .filter_map(|(name, p)| p.last.as_ref().map(|d| (name.as_str(), d)))
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    pub fn is_inactive(&self) -> bool {
        self.state == TokenState::Inactive
    }

    /// 活动（含已提交）
    pub fn is_active(&self) -> bool {
        matches!(self.state, TokenState::Active | TokenState::Committed)
    }

    pub fn is_merged(&self) -> bool {
        self.state == TokenState::Merged
    }

    pub fn is_rejected(&self) -> bool {
        self.state == TokenState::Rejected
    }

    pub fn is_committed(&self) -> bool {
        self.state == TokenState::Committed
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TokenState::Terminated
    }

    pub fn is_rejectable(&self) -> bool {
        self.rejectable
    }

    pub fn is_fact(&self) -> bool {
        self.fact
    }

    pub fn master(&self) -> Option<TokenKey> {
        self.master
    }

    pub fn slaves(&self) -> &[TokenKey] {
        &self.slaves
    }

    pub fn active_token(&self) -> Option<TokenKey> {
        self.active_token
    }

    pub fn merged_tokens(&self) -> &[TokenKey] {
        &self.merged
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({}) start={} end={}",
            self.timeline, self.predicate, self.key, self.start.last, self.end.last
        )
    }
}

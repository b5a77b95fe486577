//! 内置的最小计划数据库
//!
//! 只实现内核需要的窄接口：Token 的创建、激活、合并、拒绝、提交、终止与丢弃，
//! 基础域收窄，`propagate()` 以及时间线序列枚举。传播是简单的区间界收窄：
//! 每次从基础域重新推导当前域，迭代到不动点；任何变量为空即判定不一致。
//!
//! 状态变化通过事件队列通知上层（`drain_events`），上层的簿记集合只依据这些事件增删。

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::core::error::{KernelError, Result};

use super::domain::{Domain, Interval, Tick};
use super::model::{Model, Relation, SlaveSpec};
use super::timeline::{ObjectKind, Timeline};
use super::token::{Param, Token, TokenKey, TokenState, Var};

/// 时间点：Token 的开始或结束
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Endpoint {
    Start,
    End,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Point {
    pub token: TokenKey,
    pub endpoint: Endpoint,
}

impl Point {
    pub fn start(token: TokenKey) -> Self {
        Self {
            token,
            endpoint: Endpoint::Start,
        }
    }

    pub fn end(token: TokenKey) -> Self {
        Self {
            token,
            endpoint: Endpoint::End,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConstraintKind {
    /// a <= b
    Precedes,
    /// a == b
    Equals,
}

/// 两个时间点之间的约束
#[derive(Clone, Copy, Debug)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub a: Point,
    pub b: Point,
}

impl Constraint {
    fn involves(&self, key: TokenKey) -> bool {
        self.a.token == key || self.b.token == key
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ConstraintId(u64);

/// 数据库变化通知
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DbEvent {
    Added(TokenKey),
    Activated(TokenKey),
    Deactivated(TokenKey),
    Merged(TokenKey),
    Split(TokenKey),
    Rejected(TokenKey),
    Committed(TokenKey),
    Terminated(TokenKey),
    Removed(TokenKey),
}

/// 计划数据库
#[derive(Debug, Default)]
pub struct PlanDatabase {
    tokens: BTreeMap<TokenKey, Token>,
    timelines: Vec<Timeline>,
    timeline_index: HashMap<String, usize>,
    model: Model,
    constraints: BTreeMap<ConstraintId, Constraint>,
    next_constraint: u64,
    events: VecDeque<DbEvent>,
    last_failure: Option<String>,
}

impl PlanDatabase {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn add_timeline(&mut self, timeline: Timeline) -> Result<()> {
        if self.timeline_index.contains_key(timeline.name()) {
            return Err(KernelError::Config(format!(
                "timeline {} declared twice",
                timeline.name()
            )));
        }
        self.timeline_index
            .insert(timeline.name().to_string(), self.timelines.len());
        self.timelines.push(timeline);
        Ok(())
    }

    pub fn timeline(&self, name: &str) -> Option<&Timeline> {
        self.timeline_index.get(name).map(|&i| &self.timelines[i])
    }

    pub fn timelines(&self) -> impl Iterator<Item = &Timeline> {
        self.timelines.iter()
    }

    /// 时间线上的活动 Token（时间顺序）；动作容器按键序返回活动 Token
    pub fn sequence(&self, timeline: &str) -> Vec<TokenKey> {
        match self.timeline(timeline) {
            Some(tl) if tl.kind() == ObjectKind::Timeline => tl.sequence().to_vec(),
            Some(_) => self
                .tokens
                .values()
                .filter(|t| t.timeline == timeline && t.is_active())
                .map(|t| t.key)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn token(&self, key: TokenKey) -> Option<&Token> {
        self.tokens.get(&key)
    }

    pub fn contains(&self, key: TokenKey) -> bool {
        self.tokens.contains_key(&key)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// 最近一次传播失败的原因
    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn drain_events(&mut self) -> Vec<DbEvent> {
        self.events.drain(..).collect()
    }

    // ---- 创建与收窄 ----

    pub fn create_token(&mut self, timeline: &str, predicate: &str, rejectable: bool) -> Result<TokenKey> {
        if !self.timeline_index.contains_key(timeline) {
            return Err(KernelError::UnknownTimeline(timeline.to_string()));
        }
        let mut token = Token::new(timeline, predicate, rejectable);
        if let Some(duration) = self.model.duration_for(timeline, predicate) {
            token.duration.restrict_base(duration);
        }
        let key = token.key;
        self.tokens.insert(key, token);
        self.events.push_back(DbEvent::Added(key));
        Ok(key)
    }

    pub fn set_fact(&mut self, key: TokenKey) {
        if let Some(t) = self.tokens.get_mut(&key) {
            t.fact = true;
        }
    }

    pub fn restrict_start(&mut self, key: TokenKey, dom: Interval) {
        if let Some(t) = self.tokens.get_mut(&key) {
            t.start.restrict_base(dom);
        }
    }

    pub fn restrict_end(&mut self, key: TokenKey, dom: Interval) {
        if let Some(t) = self.tokens.get_mut(&key) {
            t.end.restrict_base(dom);
        }
    }

    pub fn restrict_duration(&mut self, key: TokenKey, dom: Interval) {
        if let Some(t) = self.tokens.get_mut(&key) {
            t.duration.restrict_base(dom);
        }
    }

    pub fn specify_start(&mut self, key: TokenKey, tick: Tick) {
        self.restrict_start(key, Interval::singleton(tick));
    }

    pub fn restrict_param(&mut self, key: TokenKey, name: &str, dom: &Domain) {
        if let Some(t) = self.tokens.get_mut(&key) {
            match t.params.get_mut(name) {
                Some(p) => p.restrict_base(dom),
                None => {
                    t.params.insert(name.to_string(), Param::new(dom.clone()));
                }
            }
        }
    }

    /// 基础域收窄到当前域（把传播结果固化下来）
    pub fn restrict_base_domains(&mut self, key: TokenKey) {
        if let Some(t) = self.tokens.get_mut(&key) {
            for var in [&mut t.start, &mut t.end, &mut t.duration] {
                let last = var.last;
                var.restrict_base(last);
            }
            for p in t.params.values_mut() {
                if let Some(last) = p.last.clone() {
                    p.restrict_base(&last);
                }
            }
        }
    }

    // ---- 状态迁移 ----

    /// 默认插入位置：按最早开始时间排序
    pub fn insertion_point(&self, key: TokenKey) -> usize {
        let Some(token) = self.tokens.get(&key) else {
            return 0;
        };
        let Some(tl) = self.timeline(&token.timeline) else {
            return 0;
        };
        let lb = token.start.last.lb;
        tl.sequence()
            .iter()
            .position(|k| self.tokens.get(k).is_some_and(|t| t.start.last.lb > lb))
            .unwrap_or(tl.sequence().len())
    }

    /// 所有可能的插入位置，默认位置排在最前
    pub fn insertion_positions(&self, key: TokenKey) -> Vec<usize> {
        let Some(token) = self.tokens.get(&key) else {
            return Vec::new();
        };
        let len = match self.timeline(&token.timeline) {
            Some(tl) if tl.kind() == ObjectKind::Timeline => tl.sequence().len(),
            _ => return vec![0],
        };
        let first = self.insertion_point(key);
        std::iter::once(first)
            .chain((0..=len).filter(|&p| p != first))
            .collect()
    }

    pub fn activate(&mut self, key: TokenKey) -> bool {
        let pos = self.insertion_point(key);
        self.insert(key, pos)
    }

    /// 激活并放到时间线序列的 `pos` 处
    pub fn insert(&mut self, key: TokenKey, pos: usize) -> bool {
        let Some(token) = self.tokens.get_mut(&key) else {
            return false;
        };
        if token.state != TokenState::Inactive {
            return false;
        }
        let Some(&idx) = self.timeline_index.get(&token.timeline) else {
            return false;
        };
        token.state = TokenState::Active;
        let tl = &mut self.timelines[idx];
        if tl.kind == ObjectKind::Timeline {
            let pos = pos.min(tl.sequence.len());
            tl.sequence.insert(pos, key);
        }
        self.events.push_back(DbEvent::Activated(key));
        true
    }

    /// 两个 Token 是否可以合并：同一时间线与谓词，候选已激活，时间和参数相交
    pub fn compatible(&self, key: TokenKey, candidate: TokenKey) -> bool {
        if key == candidate {
            return false;
        }
        let (Some(t), Some(c)) = (self.tokens.get(&key), self.tokens.get(&candidate)) else {
            return false;
        };
        if t.timeline != c.timeline || t.predicate != c.predicate || !c.is_active() {
            return false;
        }
        if !t.start.last.intersects(&c.start.last)
            || !t.end.last.intersects(&c.end.last)
            || !t.duration.last.intersects(&c.duration.last)
        {
            return false;
        }
        t.params.iter().all(|(name, p)| match (&p.last, c.params.get(name)) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(a), Some(b)) => b.last.as_ref().is_some_and(|b| a.intersect(b).is_some()),
        })
    }

    pub fn merge_candidates(&self, key: TokenKey) -> Vec<TokenKey> {
        let Some(token) = self.tokens.get(&key) else {
            return Vec::new();
        };
        self.sequence(&token.timeline)
            .into_iter()
            .filter(|&c| self.compatible(key, c))
            .collect()
    }

    pub fn merge(&mut self, key: TokenKey, onto: TokenKey) -> bool {
        if !self.compatible(key, onto) {
            return false;
        }
        match self.tokens.get(&key) {
            Some(t) if t.state == TokenState::Inactive => {}
            _ => return false,
        }
        if let Some(t) = self.tokens.get_mut(&key) {
            t.state = TokenState::Merged;
            t.active_token = Some(onto);
        }
        if let Some(a) = self.tokens.get_mut(&onto) {
            a.merged.push(key);
        }
        self.events.push_back(DbEvent::Merged(key));
        true
    }

    pub fn split(&mut self, key: TokenKey) -> bool {
        let onto = match self.tokens.get_mut(&key) {
            Some(t) if t.state == TokenState::Merged => {
                t.state = TokenState::Inactive;
                t.active_token.take()
            }
            _ => return false,
        };
        if let Some(a) = onto.and_then(|k| self.tokens.get_mut(&k)) {
            a.merged.retain(|k| *k != key);
        }
        self.events.push_back(DbEvent::Split(key));
        true
    }

    /// 撤销激活：移出序列，拆开合并到它上面的 Token，丢弃未提交的从属 Token
    pub fn deactivate(&mut self, key: TokenKey) -> bool {
        let (merged, slaves) = match self.tokens.get(&key) {
            Some(t) if t.state == TokenState::Active => (t.merged.clone(), t.slaves.clone()),
            _ => return false,
        };
        for m in merged {
            self.split(m);
        }
        for s in slaves {
            if self.tokens.get(&s).is_some_and(|t| !t.is_committed()) {
                self.discard(s);
            }
        }
        self.remove_from_sequence(key);
        if let Some(t) = self.tokens.get_mut(&key) {
            t.state = TokenState::Inactive;
            t.rules_fired = false;
        }
        self.events.push_back(DbEvent::Deactivated(key));
        true
    }

    pub fn reject(&mut self, key: TokenKey) -> bool {
        match self.tokens.get_mut(&key) {
            Some(t) if t.rejectable && t.state == TokenState::Inactive => {
                t.state = TokenState::Rejected;
            }
            _ => return false,
        }
        self.events.push_back(DbEvent::Rejected(key));
        true
    }

    /// 撤销拒绝，重新回到待决策状态
    pub fn unreject(&mut self, key: TokenKey) -> bool {
        match self.tokens.get_mut(&key) {
            Some(t) if t.state == TokenState::Rejected => {
                t.state = TokenState::Inactive;
            }
            _ => return false,
        }
        self.events.push_back(DbEvent::Deactivated(key));
        true
    }

    pub fn commit(&mut self, key: TokenKey) -> bool {
        match self.tokens.get_mut(&key) {
            Some(t) if t.state == TokenState::Active => {
                t.state = TokenState::Committed;
            }
            _ => return false,
        }
        self.events.push_back(DbEvent::Committed(key));
        true
    }

    pub fn terminate(&mut self, key: TokenKey) -> bool {
        match self.tokens.get_mut(&key) {
            Some(t) if t.state != TokenState::Terminated => {
                t.state = TokenState::Terminated;
            }
            _ => return false,
        }
        self.remove_from_sequence(key);
        self.events.push_back(DbEvent::Terminated(key));
        true
    }

    /// 彻底删除：解除主从与合并关系，删除相关约束
    pub fn discard(&mut self, key: TokenKey) {
        let Some(token) = self.tokens.get(&key) else {
            return;
        };
        let master = token.master;
        let active = token.active_token;
        let merged = token.merged.clone();
        let slaves = token.slaves.clone();

        for m in merged {
            self.split(m);
        }
        for s in slaves {
            if let Some(t) = self.tokens.get_mut(&s) {
                t.master = None;
            }
        }
        if let Some(m) = master.and_then(|k| self.tokens.get_mut(&k)) {
            m.slaves.retain(|k| *k != key);
        }
        if let Some(a) = active.and_then(|k| self.tokens.get_mut(&k)) {
            a.merged.retain(|k| *k != key);
        }
        self.remove_from_sequence(key);
        self.constraints.retain(|_, c| !c.involves(key));
        self.tokens.remove(&key);
        self.events.push_back(DbEvent::Removed(key));
    }

    /// 断开主从关系
    pub fn unlink_master(&mut self, key: TokenKey) {
        let master = self.tokens.get_mut(&key).and_then(|t| t.master.take());
        if let Some(m) = master.and_then(|k| self.tokens.get_mut(&k)) {
            m.slaves.retain(|k| *k != key);
        }
    }

    fn remove_from_sequence(&mut self, key: TokenKey) {
        let Some(idx) = self
            .tokens
            .get(&key)
            .and_then(|t| self.timeline_index.get(&t.timeline).copied())
        else {
            return;
        };
        self.timelines[idx].sequence.retain(|k| *k != key);
    }

    // ---- 规则与约束 ----

    /// 激活后尚未展开的规则
    pub fn has_pending_rules(&self, key: TokenKey) -> bool {
        self.tokens.get(&key).is_some_and(|t| {
            t.is_active() && !t.rules_fired && self.model.has_rules(&t.timeline, &t.predicate)
        })
    }

    /// 展开规则，返回新建的从属 Token
    pub fn fire_rules(&mut self, key: TokenKey) -> Vec<TokenKey> {
        let Some(token) = self.tokens.get(&key) else {
            return Vec::new();
        };
        if !token.is_active() || token.rules_fired {
            return Vec::new();
        }
        let specs: Vec<SlaveSpec> = self
            .model
            .rules_for(&token.timeline, &token.predicate)
            .flat_map(|r| r.slaves.iter().cloned())
            .collect();
        if let Some(t) = self.tokens.get_mut(&key) {
            t.rules_fired = true;
        }

        let mut created = Vec::new();
        for spec in specs {
            let slave = match self.create_token(&spec.timeline, &spec.predicate, false) {
                Ok(k) => k,
                Err(e) => {
                    tracing::warn!("rule for token {} skipped: {}", key, e);
                    continue;
                }
            };
            for (name, dom) in &spec.params {
                self.restrict_param(slave, name, dom);
            }
            if let Some((min, max)) = spec.duration {
                self.restrict_duration(slave, Interval::new(min, max));
            }
            if let Some(s) = self.tokens.get_mut(&slave) {
                s.master = Some(key);
            }
            if let Some(m) = self.tokens.get_mut(&key) {
                m.slaves.push(slave);
            }
            self.relate(key, slave, spec.relation);
            created.push(slave);
        }
        created
    }

    fn relate(&mut self, master: TokenKey, slave: TokenKey, relation: Relation) {
        use ConstraintKind::{Equals, Precedes};
        let (ms, me) = (Point::start(master), Point::end(master));
        let (ss, se) = (Point::start(slave), Point::end(slave));
        let pairs = match relation {
            Relation::Meets => vec![(Equals, me, ss)],
            Relation::MetBy => vec![(Equals, se, ms)],
            Relation::Contains => vec![(Precedes, ms, ss), (Precedes, se, me)],
            Relation::ContainedBy => vec![(Precedes, ss, ms), (Precedes, me, se)],
            Relation::Before => vec![(Precedes, me, ss)],
            Relation::After => vec![(Precedes, se, ms)],
            Relation::Equals => vec![(Equals, ms, ss), (Equals, me, se)],
        };
        for (kind, a, b) in pairs {
            self.add_constraint(kind, a, b);
        }
    }

    pub fn add_constraint(&mut self, kind: ConstraintKind, a: Point, b: Point) -> ConstraintId {
        let id = ConstraintId(self.next_constraint);
        self.next_constraint += 1;
        self.constraints.insert(id, Constraint { kind, a, b });
        id
    }

    pub fn constraints_on(&self, key: TokenKey) -> Vec<ConstraintId> {
        self.constraints
            .iter()
            .filter(|(_, c)| c.involves(key))
            .map(|(id, _)| *id)
            .collect()
    }

    /// 断开约束：另一端的基础域固化为当前域，然后删除约束
    pub fn disconnect_constraints(&mut self, key: TokenKey) {
        for id in self.constraints_on(key) {
            let Some(c) = self.constraints.remove(&id) else {
                continue;
            };
            for p in [c.a, c.b] {
                if p.token == key {
                    continue;
                }
                if let Some(t) = self.tokens.get_mut(&p.token) {
                    let var = var_mut(t, p.endpoint);
                    let last = var.last;
                    var.restrict_base(last);
                }
            }
        }
    }

    // ---- 传播 ----

    /// 从基础域重新推导当前域；任何变量为空或无法收敛返回 false
    pub fn propagate(&mut self) -> bool {
        self.last_failure = None;
        for t in self.tokens.values_mut() {
            t.start.last = t.start.base;
            t.end.last = t.end.base;
            t.duration.last = t.duration.base;
            for p in t.params.values_mut() {
                p.last = p.base.clone();
            }
        }

        let edges = self.active_edges();
        let merges: Vec<(TokenKey, TokenKey)> = self
            .tokens
            .values()
            .filter(|t| t.state == TokenState::Merged)
            .filter_map(|t| t.active_token.map(|a| (t.key, a)))
            .collect();
        let max_rounds = 2 * (self.tokens.len() + edges.len()) + 16;

        for _ in 0..max_rounds {
            match self.propagation_round(&edges, &merges) {
                Ok(false) => return true,
                Ok(true) => {}
                Err(reason) => {
                    tracing::debug!("propagation failed: {}", reason);
                    self.last_failure = Some(reason);
                    return false;
                }
            }
        }
        self.last_failure = Some("propagation did not converge".to_string());
        false
    }

    /// 参与传播的点约束：存储约束加时间线序列上的先后关系
    fn active_edges(&self) -> Vec<Constraint> {
        let live = |k: &TokenKey| {
            self.tokens
                .get(k)
                .is_some_and(|t| t.state != TokenState::Rejected)
        };
        let mut edges: Vec<Constraint> = self
            .constraints
            .values()
            .filter(|c| live(&c.a.token) && live(&c.b.token))
            .copied()
            .collect();
        for tl in &self.timelines {
            for pair in tl.sequence.windows(2) {
                edges.push(Constraint {
                    kind: ConstraintKind::Precedes,
                    a: Point::end(pair[0]),
                    b: Point::start(pair[1]),
                });
            }
        }
        edges
    }

    fn propagation_round(
        &mut self,
        edges: &[Constraint],
        merges: &[(TokenKey, TokenKey)],
    ) -> std::result::Result<bool, String> {
        let mut changed = false;

        for t in self.tokens.values_mut() {
            if matches!(t.state, TokenState::Rejected | TokenState::Terminated) {
                continue;
            }
            changed |= narrow_duration(t)?;
        }

        for &(merged, active) in merges {
            let (Some(m), Some(a)) = (self.tokens.get(&merged), self.tokens.get(&active)) else {
                continue;
            };
            let start = m.start.last.intersect(&a.start.last);
            let end = m.end.last.intersect(&a.end.last);
            let duration = m.duration.last.intersect(&a.duration.last);
            let mut params = Vec::new();
            for (name, p) in &m.params {
                if let Some(q) = a.params.get(name) {
                    let joined = match (&p.last, &q.last) {
                        (Some(x), Some(y)) => x.intersect(y),
                        _ => None,
                    };
                    params.push((name.clone(), joined));
                }
            }
            for key in [merged, active] {
                let Some(t) = self.tokens.get_mut(&key) else {
                    continue;
                };
                changed |= set_last(t, |t| &mut t.start, start)?;
                changed |= set_last(t, |t| &mut t.end, end)?;
                changed |= set_last(t, |t| &mut t.duration, duration)?;
                for (name, dom) in &params {
                    if dom.is_none() {
                        return Err(format!("parameter {} of {} became empty", name, t));
                    }
                    let Some(p) = t.params.get_mut(name) else {
                        continue;
                    };
                    if p.last != *dom {
                        p.last = dom.clone();
                        changed = true;
                    }
                }
            }
        }

        for c in edges {
            let (Some(a), Some(b)) = (self.point_last(c.a), self.point_last(c.b)) else {
                continue;
            };
            let (na, nb) = match c.kind {
                ConstraintKind::Precedes => (
                    a.intersect(&Interval::at_most(b.ub)),
                    b.intersect(&Interval::at_least(a.lb)),
                ),
                ConstraintKind::Equals => {
                    let x = a.intersect(&b);
                    (x, x)
                }
            };
            changed |= self.set_point(c.a, na)?;
            changed |= self.set_point(c.b, nb)?;
        }

        Ok(changed)
    }

    fn point_last(&self, p: Point) -> Option<Interval> {
        self.tokens.get(&p.token).map(|t| match p.endpoint {
            Endpoint::Start => t.start.last,
            Endpoint::End => t.end.last,
        })
    }

    fn set_point(&mut self, p: Point, dom: Interval) -> std::result::Result<bool, String> {
        let Some(t) = self.tokens.get_mut(&p.token) else {
            return Ok(false);
        };
        match p.endpoint {
            Endpoint::Start => set_last(t, |t| &mut t.start, dom),
            Endpoint::End => set_last(t, |t| &mut t.end, dom),
        }
    }

    // ---- 查询 ----

    /// a 是否可能排在 b 之前
    pub fn can_precede(&self, a: TokenKey, b: TokenKey) -> bool {
        match (self.tokens.get(&a), self.tokens.get(&b)) {
            (Some(a), Some(b)) => a.end.last.lb <= b.start.last.ub,
            _ => false,
        }
    }

    /// `from` 的结束是否经约束链必然先于 `to` 的开始
    pub fn precedes(&self, from: TokenKey, to: TokenKey) -> bool {
        let mut adjacency: HashMap<Point, Vec<Point>> = HashMap::new();
        for c in self.active_edges() {
            adjacency.entry(c.a).or_default().push(c.b);
            if c.kind == ConstraintKind::Equals {
                adjacency.entry(c.b).or_default().push(c.a);
            }
        }
        for t in self.tokens.values() {
            adjacency
                .entry(Point::start(t.key))
                .or_default()
                .push(Point::end(t.key));
            if let Some(a) = t.active_token {
                for e in [Endpoint::Start, Endpoint::End] {
                    let (m, p) = (Point { token: t.key, endpoint: e }, Point { token: a, endpoint: e });
                    adjacency.entry(m).or_default().push(p);
                    adjacency.entry(p).or_default().push(m);
                }
            }
        }

        let target = Point::start(to);
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([Point::end(from)]);
        while let Some(p) = queue.pop_front() {
            if p == target {
                return true;
            }
            if !seen.insert(p) {
                continue;
            }
            if let Some(next) = adjacency.get(&p) {
                queue.extend(next.iter().copied());
            }
        }
        false
    }

    /// 时间线在 `tick` 时刻的取值
    pub fn value_at(&self, timeline: &str, tick: Tick) -> Option<TokenKey> {
        let tl = self.timeline(timeline)?;
        tl.sequence()
            .iter()
            .rev()
            .find(|k| {
                self.tokens
                    .get(*k)
                    .is_some_and(|t| t.start.last.lb <= tick && t.end.last.ub > tick)
            })
            .copied()
    }
}

fn var_mut(t: &mut Token, endpoint: Endpoint) -> &mut Var {
    match endpoint {
        Endpoint::Start => &mut t.start,
        Endpoint::End => &mut t.end,
    }
}

fn set_last(
    t: &mut Token,
    field: impl Fn(&mut Token) -> &mut Var,
    dom: Interval,
) -> std::result::Result<bool, String> {
    if dom.is_empty() {
        return Err(format!("{} has an empty domain", t));
    }
    let var = field(t);
    if var.last == dom {
        return Ok(false);
    }
    var.last = dom;
    Ok(true)
}

/// end = start + duration
fn narrow_duration(t: &mut Token) -> std::result::Result<bool, String> {
    if t.params.values().any(|p| p.last.is_none()) {
        return Err(format!("a parameter of {} is empty", t));
    }
    let (s, e, d) = (t.start.last, t.end.last, t.duration.last);
    let end = e.intersect(&s.plus(&d));
    let start = s.intersect(&end.minus(&d));
    let duration = d.intersect(&end.minus(&start));
    let mut changed = set_last(t, |t| &mut t.start, start)?;
    changed |= set_last(t, |t| &mut t.end, end)?;
    changed |= set_last(t, |t| &mut t.duration, duration)?;
    Ok(changed)
}

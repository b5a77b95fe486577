//! 变量域：整数时间区间与参数域
//!
//! 时间用 `Tick`（u64）表示，`PLUS_INFINITY` 代表无上界。区间只会收窄：
//! `lb > ub` 即空域，传播时据此判定不一致。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 离散逻辑时间单位
pub type Tick = u64;

/// 无上界
pub const PLUS_INFINITY: Tick = Tick::MAX;

/// 区间运算的内部宽整数表示，避免 u64 加减溢出
const WIDE_INF: i128 = i128::MAX / 4;

fn widen(t: Tick) -> i128 {
    if t == PLUS_INFINITY {
        WIDE_INF
    } else {
        t as i128
    }
}

fn narrow(v: i128) -> Tick {
    if v <= 0 {
        0
    } else if v >= WIDE_INF || v >= PLUS_INFINITY as i128 {
        PLUS_INFINITY
    } else {
        v as Tick
    }
}

/// 闭区间 [lb, ub]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub lb: Tick,
    pub ub: Tick,
}

impl Interval {
    /// [0, +inf]
    pub const FULL: Interval = Interval {
        lb: 0,
        ub: PLUS_INFINITY,
    };

    pub const EMPTY: Interval = Interval { lb: 1, ub: 0 };

    pub fn new(lb: Tick, ub: Tick) -> Self {
        Self { lb, ub }
    }

    pub fn singleton(t: Tick) -> Self {
        Self { lb: t, ub: t }
    }

    /// [lb, +inf]
    pub fn at_least(lb: Tick) -> Self {
        Self {
            lb,
            ub: PLUS_INFINITY,
        }
    }

    /// [0, ub]
    pub fn at_most(ub: Tick) -> Self {
        Self { lb: 0, ub }
    }

    pub fn is_empty(&self) -> bool {
        self.lb > self.ub
    }

    pub fn is_singleton(&self) -> bool {
        self.lb == self.ub
    }

    pub fn is_bounded(&self) -> bool {
        self.ub != PLUS_INFINITY
    }

    pub fn contains(&self, t: Tick) -> bool {
        self.lb <= t && t <= self.ub
    }

    pub fn intersect(&self, other: &Interval) -> Interval {
        Interval {
            lb: self.lb.max(other.lb),
            ub: self.ub.min(other.ub),
        }
    }

    pub fn intersects(&self, other: &Interval) -> bool {
        !self.intersect(other).is_empty()
    }

    pub fn is_subset_of(&self, other: &Interval) -> bool {
        self.is_empty() || (other.lb <= self.lb && self.ub <= other.ub)
    }

    /// 区间加法：{a + b | a ∈ self, b ∈ other}
    pub fn plus(&self, other: &Interval) -> Interval {
        if self.is_empty() || other.is_empty() {
            return Interval::EMPTY;
        }
        Interval {
            lb: narrow(widen(self.lb) + widen(other.lb)),
            ub: narrow(widen(self.ub) + widen(other.ub)),
        }
    }

    /// 区间减法：{a - b | a ∈ self, b ∈ other}，负数部分截断到 0，整体为负则为空
    pub fn minus(&self, other: &Interval) -> Interval {
        if self.is_empty() || other.is_empty() {
            return Interval::EMPTY;
        }
        let ub = if self.ub == PLUS_INFINITY {
            WIDE_INF
        } else {
            widen(self.ub) - widen(other.lb)
        };
        if ub < 0 {
            return Interval::EMPTY;
        }
        let lb = if other.ub == PLUS_INFINITY {
            0
        } else {
            widen(self.lb) - widen(other.ub)
        };
        Interval {
            lb: narrow(lb),
            ub: narrow(ub),
        }
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::FULL
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "[empty]");
        }
        if self.ub == PLUS_INFINITY {
            write!(f, "[{}, +inf]", self.lb)
        } else {
            write!(f, "[{}, {}]", self.lb, self.ub)
        }
    }
}

/// 参数值
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Symbol(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Symbol(s) => write!(f, "{}", s),
        }
    }
}

/// 参数域：单值、枚举集合或实数区间
///
/// 配置中 `x = 3` 为单值，`color = ["red", "blue"]` 为集合，`speed = { min = 0.5, max = 2.0 }` 为区间。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Domain {
    Range { min: f64, max: f64 },
    Set(Vec<Value>),
    Singleton(Value),
}

impl Domain {
    pub fn value(v: Value) -> Self {
        Domain::Singleton(v)
    }

    pub fn int(i: i64) -> Self {
        Domain::Singleton(Value::Int(i))
    }

    pub fn float(x: f64) -> Self {
        Domain::Singleton(Value::Float(x))
    }

    pub fn symbol(s: impl Into<String>) -> Self {
        Domain::Singleton(Value::Symbol(s.into()))
    }

    pub fn is_singleton(&self) -> bool {
        match self {
            Domain::Singleton(_) => true,
            Domain::Set(values) => values.len() == 1,
            Domain::Range { min, max } => min == max,
        }
    }

    pub fn singleton(&self) -> Option<Value> {
        match self {
            Domain::Singleton(v) => Some(v.clone()),
            Domain::Set(values) if values.len() == 1 => values.first().cloned(),
            Domain::Range { min, max } if min == max => Some(Value::Float(*min)),
            _ => None,
        }
    }

    /// 单值且为数值时返回
    pub fn as_f64(&self) -> Option<f64> {
        self.singleton().and_then(|v| v.as_f64())
    }

    pub fn contains(&self, v: &Value) -> bool {
        match self {
            Domain::Singleton(s) => s == v,
            Domain::Set(values) => values.iter().any(|x| x == v),
            Domain::Range { min, max } => v.as_f64().is_some_and(|x| *min <= x && x <= *max),
        }
    }

    /// 求交；结果为空返回 None
    pub fn intersect(&self, other: &Domain) -> Option<Domain> {
        match (self, other) {
            (Domain::Singleton(a), _) => other.contains(a).then(|| Domain::Singleton(a.clone())),
            (_, Domain::Singleton(b)) => self.contains(b).then(|| Domain::Singleton(b.clone())),
            (Domain::Set(a), _) => {
                let kept: Vec<Value> = a.iter().filter(|v| other.contains(v)).cloned().collect();
                Self::from_values(kept)
            }
            (_, Domain::Set(b)) => {
                let kept: Vec<Value> = b.iter().filter(|v| self.contains(v)).cloned().collect();
                Self::from_values(kept)
            }
            (Domain::Range { min: a0, max: a1 }, Domain::Range { min: b0, max: b1 }) => {
                let lo = a0.max(*b0);
                let hi = a1.min(*b1);
                if lo > hi {
                    None
                } else if lo == hi {
                    Some(Domain::float(lo))
                } else {
                    Some(Domain::Range { min: lo, max: hi })
                }
            }
        }
    }

    fn from_values(mut values: Vec<Value>) -> Option<Domain> {
        match values.len() {
            0 => None,
            1 => values.pop().map(Domain::Singleton),
            _ => Some(Domain::Set(values)),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Singleton(v) => write!(f, "{}", v),
            Domain::Set(values) => {
                let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{{{}}}", items.join(", "))
            }
            Domain::Range { min, max } => write!(f, "[{}, {}]", min, max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_intersection() {
        let a = Interval::new(2, 10);
        let b = Interval::new(5, PLUS_INFINITY);
        assert_eq!(a.intersect(&b), Interval::new(5, 10));
        assert!(a.intersects(&b));
        assert!(!Interval::new(0, 1).intersects(&Interval::new(2, 3)));
        assert!(Interval::new(3, 2).is_empty());
    }

    #[test]
    fn test_interval_arithmetic_with_infinity() {
        let start = Interval::new(3, 5);
        let duration = Interval::at_least(1);
        assert_eq!(start.plus(&duration), Interval::new(4, PLUS_INFINITY));

        let end = Interval::new(10, 12);
        assert_eq!(end.minus(&duration), Interval::new(0, 11));
        assert_eq!(end.minus(&start), Interval::new(5, 9));
        assert!(Interval::new(1, 2).minus(&Interval::new(5, 6)).is_empty());
    }

    #[test]
    fn test_domain_intersection() {
        let set = Domain::Set(vec![Value::Symbol("on".into()), Value::Symbol("off".into())]);
        assert_eq!(set.intersect(&Domain::symbol("on")), Some(Domain::symbol("on")));
        assert_eq!(set.intersect(&Domain::symbol("dim")), None);

        let range = Domain::Range { min: 0.0, max: 5.0 };
        assert_eq!(range.intersect(&Domain::int(3)), Some(Domain::int(3)));
        assert!(Domain::int(3).intersect(&Domain::float(3.0)).is_some());
        assert_eq!(range.intersect(&Domain::Range { min: 5.0, max: 9.0 }), Some(Domain::float(5.0)));
    }
}

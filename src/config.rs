//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TELEO__*` 覆盖（双下划线表示嵌套，如 `TELEO__AGENT__FINAL_TICK=200`）。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::plan::{Domain, ObjectKind, Rule, Tick, TimelineMode};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub clock: ClockSection,
    pub reactors: Vec<ReactorConfig>,
}

/// [agent] 段：任务名、结束 tick、日志目录
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_name")]
    pub name: String,
    /// 任务在该 tick 结束（不含）
    #[serde(default = "default_final_tick")]
    pub final_tick: Tick,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 是否记录 NOTIFY / REQUEST / RECALL 事件
    #[serde(default = "default_true")]
    pub event_log: bool,
    /// 是否把发布的观测写入 `<log_dir>/<name>.obs.jsonl`
    #[serde(default)]
    pub observation_log: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            final_tick: default_final_tick(),
            log_dir: default_log_dir(),
            event_log: true,
            observation_log: false,
        }
    }
}

fn default_agent_name() -> String {
    "teleo".to_string()
}

fn default_final_tick() -> Tick {
    100
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClockKind {
    /// 按调用次数推进，测试用
    #[default]
    Pseudo,
    /// 后台线程按墙钟推进
    Realtime,
}

/// [clock] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ClockSection {
    #[serde(default)]
    pub kind: ClockKind,
    #[serde(default = "default_seconds_per_tick")]
    pub seconds_per_tick: f64,
    /// 伪时钟每隔多少次调用推进一个 tick
    #[serde(default = "default_steps_per_tick")]
    pub steps_per_tick: u32,
    /// 每次推进时采样进程资源占用
    #[serde(default)]
    pub stats: bool,
}

impl Default for ClockSection {
    fn default() -> Self {
        Self {
            kind: ClockKind::default(),
            seconds_per_tick: default_seconds_per_tick(),
            steps_per_tick: default_steps_per_tick(),
            stats: false,
        }
    }
}

fn default_seconds_per_tick() -> f64 {
    1.0
}

fn default_steps_per_tick() -> u32 {
    50
}

/// [[reactors]]：一个反应器的声明
#[derive(Debug, Clone, Deserialize)]
pub struct ReactorConfig {
    pub name: String,
    /// 组件名：DbCore / Adapter / Observer 或自定义注册
    #[serde(default = "default_component")]
    pub component: String,
    /// 0 表示纯反应式，从不被调度审议
    #[serde(default)]
    pub lookahead: Tick,
    #[serde(default)]
    pub latency: Tick,
    /// 是否输出计划日志
    #[serde(default)]
    pub log: bool,
    #[serde(default)]
    pub timelines: Vec<TimelineConfig>,
    /// 初始目标（无主、可拒绝）
    #[serde(default)]
    pub goals: Vec<TokenConfig>,
    /// 初始事实（不可拒绝，直接激活）
    #[serde(default)]
    pub facts: Vec<TokenConfig>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Adapter 的脚本化观测
    #[serde(default)]
    pub observations: Vec<ScriptedObservation>,
    /// Adapter 回放的观测日志
    #[serde(default)]
    pub replay: Option<PathBuf>,
    #[serde(default)]
    pub solver: SolverConfig,
}

impl ReactorConfig {
    pub fn new(name: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
            lookahead: 0,
            latency: 0,
            log: false,
            timelines: Vec::new(),
            goals: Vec::new(),
            facts: Vec::new(),
            rules: Vec::new(),
            observations: Vec::new(),
            replay: None,
            solver: SolverConfig::default(),
        }
    }

    pub fn with_lookahead(mut self, lookahead: Tick) -> Self {
        self.lookahead = lookahead;
        self
    }

    pub fn with_latency(mut self, latency: Tick) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_timeline(mut self, timeline: TimelineConfig) -> Self {
        self.timelines.push(timeline);
        self
    }

    pub fn with_goal(mut self, goal: TokenConfig) -> Self {
        self.goals.push(goal);
        self
    }

    pub fn with_fact(mut self, fact: TokenConfig) -> Self {
        self.facts.push(fact);
        self
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_observation(mut self, obs: ScriptedObservation) -> Self {
        self.observations.push(obs);
        self
    }
}

fn default_component() -> String {
    "DbCore".to_string()
}

/// [[reactors.timelines]]
#[derive(Debug, Clone, Deserialize)]
pub struct TimelineConfig {
    pub name: String,
    #[serde(default)]
    pub mode: TimelineMode,
    #[serde(default)]
    pub kind: ObjectKind,
    #[serde(default)]
    pub default_predicate: Option<String>,
    #[serde(default)]
    pub persistent: bool,
}

impl TimelineConfig {
    pub fn internal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: TimelineMode::Internal,
            kind: ObjectKind::Timeline,
            default_predicate: None,
            persistent: false,
        }
    }

    pub fn external(name: impl Into<String>) -> Self {
        Self {
            mode: TimelineMode::External,
            ..Self::internal(name)
        }
    }

    pub fn actions(name: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Actions,
            ..Self::internal(name)
        }
    }

    pub fn with_default(mut self, predicate: impl Into<String>) -> Self {
        self.default_predicate = Some(predicate.into());
        self
    }
}

/// 初始目标 / 事实：时间界为 [lb, ub] 二元组
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub timeline: String,
    pub predicate: String,
    #[serde(default)]
    pub start: Option<(Tick, Tick)>,
    #[serde(default)]
    pub end: Option<(Tick, Tick)>,
    #[serde(default)]
    pub duration: Option<(Tick, Tick)>,
    #[serde(default)]
    pub params: BTreeMap<String, Domain>,
}

impl TokenConfig {
    pub fn new(timeline: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self {
            timeline: timeline.into(),
            predicate: predicate.into(),
            start: None,
            end: None,
            duration: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_start(mut self, lb: Tick, ub: Tick) -> Self {
        self.start = Some((lb, ub));
        self
    }

    pub fn with_end(mut self, lb: Tick, ub: Tick) -> Self {
        self.end = Some((lb, ub));
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, dom: Domain) -> Self {
        self.params.insert(name.into(), dom);
        self
    }
}

/// Adapter 在指定 tick 发布的观测
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedObservation {
    pub tick: Tick,
    pub timeline: String,
    pub predicate: String,
    #[serde(default)]
    pub params: BTreeMap<String, Domain>,
}

/// [reactors.solver]：搜索与目标排序参数
#[derive(Debug, Clone, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// 连续多少轮无严格改进即停止
    #[serde(default = "default_plateau")]
    pub plateau: u32,
    /// 当前位置取自该时间线的 x / y 参数，未设置时为原点
    #[serde(default)]
    pub position_source: Option<String>,
    #[serde(default = "default_speed")]
    pub speed: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            plateau: default_plateau(),
            position_source: None,
            speed: default_speed(),
        }
    }
}

fn default_max_iterations() -> u32 {
    1000
}

fn default_plateau() -> u32 {
    5
}

fn default_speed() -> f64 {
    1.0
}

/// 从 config 目录加载配置，环境变量 TELEO__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TELEO__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TELEO")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 只从给定 TOML 文本解析（不读环境变量），测试与嵌入式使用
pub fn parse_config(toml_text: &str) -> Result<AppConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::from_str(toml_text, config::FileFormat::Toml))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reactor_config() {
        let cfg = parse_config(
            r#"
            [agent]
            name = "rover"
            final_tick = 20

            [[reactors]]
            name = "nav"
            lookahead = 5
            latency = 1

            [[reactors.timelines]]
            name = "path"
            default_predicate = "Idle"

            [[reactors.timelines]]
            name = "light"
            mode = "external"

            [[reactors.goals]]
            timeline = "path"
            predicate = "At"
            start = [2, 10]
            params = { x = 3, y = 0, priority = 1 }

            [[reactors.rules]]
            timeline = "path"
            predicate = "At"
            slaves = [{ timeline = "light", predicate = "Holds", relation = "contained_by", params = { value = "on" } }]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.agent.name, "rover");
        assert_eq!(cfg.agent.final_tick, 20);
        assert!(cfg.agent.event_log);
        assert_eq!(cfg.clock.kind, ClockKind::Pseudo);

        let nav = &cfg.reactors[0];
        assert_eq!(nav.component, "DbCore");
        assert_eq!(nav.timelines[1].mode, TimelineMode::External);
        assert_eq!(nav.timelines[0].default_predicate.as_deref(), Some("Idle"));
        assert_eq!(nav.goals[0].start, Some((2, 10)));
        assert_eq!(nav.goals[0].params["x"], Domain::int(3));
        assert_eq!(nav.rules[0].slaves[0].params["value"], Domain::symbol("on"));
        assert_eq!(nav.solver.max_iterations, 1000);
    }
}

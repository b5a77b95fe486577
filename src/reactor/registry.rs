//! 组件注册表
//!
//! 配置里的 `component` 字段按名查找工厂，工厂根据 [`ReactorConfig`] 构造反应器。
//! 默认注册 DbCore、Adapter、Observer 三种组件，宿主可以追加自定义组件。

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ReactorConfig;
use crate::core::error::{KernelError, Result};
use crate::deliberative::DbCore;

use super::{Adapter, ObserverReactor, Reactor};

pub type ReactorFactory = Arc<dyn Fn(&ReactorConfig) -> Result<Box<dyn Reactor>> + Send + Sync>;

pub struct ReactorRegistry {
    factories: HashMap<String, ReactorFactory>,
}

impl ReactorRegistry {
    /// 空注册表
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("DbCore", |cfg| Ok(Box::new(DbCore::from_config(cfg)?)));
        registry.register("Adapter", |cfg| Ok(Box::new(Adapter::from_config(cfg)?)));
        registry.register("Observer", |cfg| Ok(Box::new(ObserverReactor::from_config(cfg))));
        registry
    }

    /// 同名组件后注册者覆盖
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ReactorConfig) -> Result<Box<dyn Reactor>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn get(&self, name: &str) -> Option<ReactorFactory> {
        self.factories.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(&self, cfg: &ReactorConfig) -> Result<Box<dyn Reactor>> {
        let factory = self
            .factories
            .get(&cfg.component)
            .ok_or_else(|| KernelError::UnknownComponent(cfg.component.clone()))?;
        let reactor = factory(cfg)?;
        tracing::debug!("created reactor {} ({})", cfg.name, cfg.component);
        Ok(reactor)
    }
}

impl Default for ReactorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimelineConfig;

    #[test]
    fn test_default_components() {
        let registry = ReactorRegistry::new();
        assert_eq!(registry.names(), vec!["Adapter", "DbCore", "Observer"]);

        let cfg = ReactorConfig::new("nav", "DbCore").with_timeline(TimelineConfig::internal("path"));
        let reactor = registry.create(&cfg).unwrap();
        assert_eq!(reactor.name(), "nav");
        assert_eq!(reactor.query_timeline_modes().internals, vec!["path".to_string()]);
    }

    #[test]
    fn test_unknown_component() {
        let registry = ReactorRegistry::new();
        let cfg = ReactorConfig::new("x", "Teleporter");
        assert!(matches!(
            registry.create(&cfg),
            Err(KernelError::UnknownComponent(name)) if name == "Teleporter"
        ));
    }

    #[test]
    fn test_custom_component_overrides() {
        let mut registry = ReactorRegistry::empty();
        registry.register("Watcher", |cfg| Ok(Box::new(ObserverReactor::from_config(cfg))));
        assert!(registry.get("Watcher").is_some());
        assert!(registry.get("DbCore").is_none());
    }
}

//! External 时间线的本地记录：服务者、最近一次观测的 tick、已派发的 Token

use std::collections::BTreeSet;

use crate::core::bus::ServerInfo;
use crate::plan::{Tick, TokenKey};

#[derive(Debug, Clone)]
pub struct TimelineContainer {
    name: String,
    server: Option<ServerInfo>,
    last_observed: Tick,
    dispatched: BTreeSet<TokenKey>,
}

impl TimelineContainer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server: None,
            last_observed: 0,
            dispatched: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> Option<&ServerInfo> {
        self.server.as_ref()
    }

    pub fn set_server(&mut self, server: ServerInfo) {
        self.server = Some(server);
    }

    pub fn last_observed(&self) -> Tick {
        self.last_observed
    }

    pub fn update_last_observed(&mut self, tick: Tick) {
        self.last_observed = self.last_observed.max(tick);
    }

    pub fn is_dispatched(&self, key: TokenKey) -> bool {
        self.dispatched.contains(&key)
    }

    pub fn mark_dispatched(&mut self, key: TokenKey) {
        self.dispatched.insert(key);
    }

    pub fn dispatched(&self) -> impl Iterator<Item = TokenKey> + '_ {
        self.dispatched.iter().copied()
    }

    /// Token 被删除时停止跟踪
    pub fn handle_removal(&mut self, key: TokenKey) {
        self.dispatched.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_observed_never_goes_back() {
        let mut tc = TimelineContainer::new("light");
        assert_eq!(tc.last_observed(), 0);
        tc.update_last_observed(4);
        tc.update_last_observed(2);
        assert_eq!(tc.last_observed(), 4);
    }

    #[test]
    fn test_dispatch_tracking() {
        let mut tc = TimelineContainer::new("camera");
        let k = TokenKey::next();
        assert!(!tc.is_dispatched(k));
        tc.mark_dispatched(k);
        assert!(tc.is_dispatched(k));
        assert_eq!(tc.dispatched().count(), 1);
        tc.handle_removal(k);
        assert!(!tc.is_dispatched(k));
    }
}

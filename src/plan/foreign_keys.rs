//! 外键表：远端反应器的 Token 键 ↔ 本地 Token 键
//!
//! 每个反应器各持一份，只在调度线程上访问。

use std::collections::BTreeMap;

use super::token::TokenKey;

#[derive(Debug, Default)]
pub struct ForeignKeys {
    by_remote: BTreeMap<TokenKey, TokenKey>,
}

impl ForeignKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, remote: TokenKey, local: TokenKey) {
        self.by_remote.insert(remote, local);
    }

    pub fn local(&self, remote: TokenKey) -> Option<TokenKey> {
        self.by_remote.get(&remote).copied()
    }

    pub fn remote(&self, local: TokenKey) -> Option<TokenKey> {
        self.by_remote
            .iter()
            .find(|(_, l)| **l == local)
            .map(|(r, _)| *r)
    }

    pub fn contains(&self, remote: TokenKey) -> bool {
        self.by_remote.contains_key(&remote)
    }

    pub fn remove(&mut self, remote: TokenKey) -> Option<TokenKey> {
        self.by_remote.remove(&remote)
    }

    /// 本地 Token 被删除时同步移除
    pub fn remove_local(&mut self, local: TokenKey) {
        self.by_remote.retain(|_, l| *l != local);
    }

    /// 清理本地 Token 已不存在的条目，返回清理数量
    pub fn purge(&mut self, alive: impl Fn(TokenKey) -> bool) -> usize {
        let before = self.by_remote.len();
        self.by_remote.retain(|_, l| alive(*l));
        before - self.by_remote.len()
    }

    pub fn len(&self) -> usize {
        self.by_remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_remote.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purge_orphaned_keys() {
        let mut fk = ForeignKeys::new();
        let (r1, l1, r2, l2) = (TokenKey::next(), TokenKey::next(), TokenKey::next(), TokenKey::next());
        fk.insert(r1, l1);
        fk.insert(r2, l2);
        assert_eq!(fk.local(r1), Some(l1));
        assert_eq!(fk.remote(l2), Some(r2));

        assert_eq!(fk.purge(|l| l == l1), 1);
        assert!(fk.contains(r1));
        assert!(!fk.contains(r2));

        fk.remove_local(l1);
        assert!(fk.is_empty());
    }
}

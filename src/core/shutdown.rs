//! 终止标志
//!
//! 全局、幂等：Agent 在每个 tick 开头与各反应器同步之间检查；
//! tick 内的同步一旦开始总会完整执行完（成功或失败），不支持中途取消。
//! 只记录第一次终止的原因。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 终止原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// 调用了 `Agent::terminate`
    Requested,
    /// Ctrl+C
    Interrupted,
    /// SIGTERM
    Signal,
    /// 到达结束 tick
    MissionComplete,
    /// 某个反应器同步失败
    SynchronizationFailure(String),
}

/// 可在线程间克隆共享的终止标志
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 设置终止标志；已终止时什么也不做
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_some() {
                return;
            }
            tracing::debug!("termination requested: {:?}", reason);
            *slot = Some(reason);
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }

    /// 后台任务：收到 Ctrl+C 或 SIGTERM 时设置终止标志。需在 tokio 运行时内调用
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = wait_for_signal().await;
            tracing::info!("{:?}: terminating after the current tick", reason);
            manager.shutdown(reason);
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> ShutdownReason {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        let _ = tokio::signal::ctrl_c().await;
        return ShutdownReason::Interrupted;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => ShutdownReason::Interrupted,
        _ = sigterm.recv() => ShutdownReason::Signal,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> ShutdownReason {
    let _ = tokio::signal::ctrl_c().await;
    ShutdownReason::Interrupted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
        assert_eq!(manager.reason(), None);

        let token = manager.token();
        manager.shutdown(ShutdownReason::Requested);
        manager.shutdown(ShutdownReason::MissionComplete);
        assert!(manager.is_shutdown());
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Requested));
    }

    #[test]
    fn test_clones_share_the_flag() {
        let manager = ShutdownManager::new();
        let handle = manager.clone();
        std::thread::spawn(move || handle.shutdown(ShutdownReason::Signal))
            .join()
            .unwrap();
        assert!(manager.is_shutdown());
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }
}

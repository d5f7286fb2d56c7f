use std::sync::Arc;

use tokio::sync::watch;

/// 进程级暂停开关
///
/// 移动端挂起时由平台层调用 `pause`，健康检查等周期任务在
/// `wait_active` 处停驻，恢复后继续。克隆共享同一状态。
#[derive(Debug, Clone)]
pub struct PauseManager {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PauseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseManager {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        let _ = self.tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// 暂停期间阻塞，活动状态下立即返回。
    pub async fn wait_active(&self) {
        let mut rx = self.tx.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

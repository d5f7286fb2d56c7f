use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// 一次性就绪闩
///
/// 等价于关闭一次即生效的通知通道：`set` 幂等，`wait` 在置位后立即返回。
/// 订阅源首次拉取完成后置位，组启动流程在此阻塞。
#[derive(Debug, Default)]
pub struct ReadyLatch {
    ready: AtomicBool,
    notify: Notify,
}

impl ReadyLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// 置位。重复调用无副作用。
    pub fn set(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// 等待置位；已置位时立即返回。
    pub async fn wait(&self) {
        if self.is_ready() {
            return;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // 先注册再复查，避免 set 与注册之间的窗口丢通知
        notified.as_mut().enable();
        if self.is_ready() {
            return;
        }
        notified.await;
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// 协作式取消令牌。
///
/// # 教案式说明
/// - **意图 (Why)**：竞速失败方只能被“请求停止”，不能被强制终止；拨号实现需要一个既可轮询又可
///   `await` 的信号，以便在握手的任何挂起点及时退出并自行清理；
/// - **契约 (What)**：
///   - [`cancel`](Self::cancel) 幂等，返回 `true` 表示本次调用首次触发；
///   - 克隆出的令牌共享同一状态；
///   - [`cancelled`](Self::cancelled) 在已取消时立即完成；
/// - **执行 (How)**：原子位记录状态，`Notify` 唤醒等待者。等待方先登记 `Notified` 再检查原子位，
///   因此不会错过与检查交错发生的取消。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 等待取消发生。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_reports_first_trigger_only() {
        let token = Cancellation::new();
        let child = token.clone();
        assert!(child.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_wake_on_cancel() {
        let token = Cancellation::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_millis(10), waiter)
            .await
            .expect("waiter woke")
            .expect("join");
    }
}

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use spark_taps::{Cancellation, StackError};

use crate::error::{OperationKind, map_io_error};

/// 在保留取消语义的前提下执行 IO Future。
///
/// 取消先于 IO 结果被观察：同时就绪时返回 [`StackError::Cancelled`]，
/// 被丢弃的 IO Future 负责释放尚未完成的套接字。
pub(crate) async fn run_cancellable<F, T>(
    cancellation: &Cancellation,
    kind: OperationKind,
    peer: Option<SocketAddr>,
    future: F,
) -> Result<T, StackError>
where
    F: Future<Output = io::Result<T>>,
{
    if cancellation.is_cancelled() {
        return Err(StackError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(StackError::Cancelled),
        result = future => result.map_err(|err| map_io_error(kind, peer, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CONNECT;

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let token = Cancellation::new();
        token.cancel();
        let outcome = run_cancellable(&token, CONNECT, None, std::future::pending::<io::Result<()>>()).await;
        assert_eq!(outcome, Err(StackError::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_io() {
        let token = Cancellation::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            trigger.cancel();
        });
        let outcome = run_cancellable(&token, CONNECT, None, std::future::pending::<io::Result<()>>()).await;
        assert_eq!(outcome, Err(StackError::Cancelled));
    }
}

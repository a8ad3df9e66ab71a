use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use spark_taps::{Cancellation, Flow, OutboundFrame, StackError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{self, closed_error};
use crate::util::run_cancellable;

const READ_CHUNK: usize = 16 * 1024;

/// 已建立的 TCP 数据流。
///
/// # 教案式说明
/// - **意图 (Why)**：核心的接收任务与发送循环并发运行，读写半部各自加异步锁，互不阻塞；
/// - **契约 (What)**：
///   - `read` 返回 `Ok(None)` 表示对端发送了 FIN；
///   - `destroy` 幂等：首次调用触发关闭令牌并对写半部执行 `shutdown`，挂起中的读写随之返回；
/// - **风险 (Trade-offs)**：TCP 只交付字节流，消息边界由核心的分帧处理器负责恢复。
pub struct TcpFlow {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: Cancellation,
}

impl TcpFlow {
    pub(crate) fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: Cancellation::new(),
        }
    }
}

#[async_trait]
impl Flow for TcpFlow {
    async fn write(&self, frame: OutboundFrame) -> Result<(), StackError> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        let mut writer = self.writer.lock().await;
        let outcome = run_cancellable(&self.closed, error::WRITE, None, async {
            writer.write_all(&frame.payload).await?;
            if frame.immediate {
                writer.flush().await?;
            }
            Ok(())
        })
        .await;
        trace!(bytes = frame.payload.len(), "tcp frame written");
        outcome.map_err(|err| match err {
            StackError::Cancelled => closed_error(),
            other => other,
        })
    }

    async fn read(&self) -> Result<Option<Bytes>, StackError> {
        if self.closed.is_cancelled() {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        let mut buffer = BytesMut::with_capacity(READ_CHUNK);
        match run_cancellable(&self.closed, error::READ, None, reader.read_buf(&mut buffer)).await {
            Ok(0) | Err(StackError::Cancelled) => Ok(None),
            Ok(_) => Ok(Some(buffer.freeze())),
            Err(err) => Err(err),
        }
    }

    async fn destroy(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            trace!(error = %err, "tcp shutdown after destroy");
        }
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use spark_taps::{AcceptedFlow, Cancellation, ConcreteEndpoint, FlowListener, StackError};
use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{self, closed_error};
use crate::flow::TcpFlow;
use crate::util::run_cancellable;

/// 绑定在单个本地端点上的 TCP 监听器。
///
/// `destroy` 之后挂起中的 `accept` 立即返回错误，核心据此结束监听任务。
pub struct TcpFlowListener {
    listener: TcpListener,
    local: ConcreteEndpoint,
    stopped: Cancellation,
}

impl TcpFlowListener {
    pub(crate) fn new(listener: TcpListener, local: ConcreteEndpoint) -> Self {
        Self {
            listener,
            local,
            stopped: Cancellation::new(),
        }
    }
}

#[async_trait]
impl FlowListener for TcpFlowListener {
    async fn accept(&self) -> Result<AcceptedFlow, StackError> {
        let (stream, peer) = run_cancellable(&self.stopped, error::ACCEPT, None, self.listener.accept())
            .await
            .map_err(|err| match err {
                StackError::Cancelled => closed_error(),
                other => other,
            })?;
        debug!(local = %self.local.addr, peer = %peer, "tcp flow accepted");
        let remote = ConcreteEndpoint {
            addr: peer,
            interface: self.local.interface,
        };
        Ok(AcceptedFlow {
            flow: Arc::new(TcpFlow::new(stream)),
            remote,
        })
    }

    async fn destroy(&self) {
        self.stopped.cancel();
    }

    fn local_endpoint(&self) -> ConcreteEndpoint {
        self.local
    }
}

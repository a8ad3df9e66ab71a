//! # stack 模块说明
//!
//! ## 角色定位（Why）
//! - 把 Tokio 的 `TcpStream`/`TcpListener` 包装为核心可编排的 [`ProtocolStack`]；
//! - 只声明 TCP 真正提供的能力：完全可靠与保序。无 0-RTT（不实现 TFO），无原生消息边界。
//!
//! ## 契约要点（What）
//! - `dial` 观察取消令牌，取消后丢弃半开连接并返回 [`StackError::Cancelled`]；
//! - 连接建立后先做套接字配置，再调用安全参数上的信任校验回调，校验失败的连接被立即关闭。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::SockRef;
use spark_taps::parameters::{CapacityProfile, Capabilities, SecurityMetadata};
use spark_taps::{
    ConcreteEndpoint, DialOutcome, DialRequest, FinalizedParameters, FlowListener, ListenRequest,
    ParameterId, ProtocolStack, StackDescriptor, StackError,
};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

use crate::error::{self, map_io_error};
use crate::flow::TcpFlow;
use crate::listener::TcpFlowListener;
use crate::util::run_cancellable;

/// TCP 套接字级选项。
///
/// # 教案式说明
/// - **契约 (What)**：`nodelay` 为 `None` 时按连接的容量画像决定（`Interactive` 关闭 Nagle）；
///   `linger` 与 `keepalive` 直接下发到套接字。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub nodelay: Option<bool>,
    pub linger: Option<Duration>,
    pub keepalive: bool,
}

impl TcpOptions {
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = Some(nodelay);
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = Some(linger);
        self
    }

    pub fn with_keepalive(mut self, keepalive: bool) -> Self {
        self.keepalive = keepalive;
        self
    }
}

/// 基于 Tokio 的 TCP 协议栈。
#[derive(Clone, Debug)]
pub struct TcpStack {
    descriptor: StackDescriptor,
    options: TcpOptions,
}

impl Default for TcpStack {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpStack {
    pub const NAME: &'static str = "tcp";

    pub fn new() -> Self {
        Self::with_priority(1)
    }

    /// 指定排序优先级（数值越小越优先）。
    pub fn with_priority(priority: u8) -> Self {
        let capabilities = Capabilities::new()
            .with_flag(ParameterId::FullyReliable)
            .with_flag(ParameterId::OrderPreserved);
        Self {
            descriptor: StackDescriptor::new(Self::NAME, priority, capabilities).with_native_framing(false),
            options: TcpOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TcpOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &TcpOptions {
        &self.options
    }

    fn configure(&self, stream: &TcpStream, transport: &FinalizedParameters) -> Result<(), StackError> {
        let interactive = matches!(
            transport.get_capacity_profile(ParameterId::CapacityProfile),
            Ok(Some(CapacityProfile::Interactive))
        );
        let nodelay = self.options.nodelay.unwrap_or(interactive);
        let configure_err = |err: std::io::Error| map_io_error(error::CONFIGURE, None, err);
        stream.set_nodelay(nodelay).map_err(configure_err)?;
        let socket = SockRef::from(stream);
        if let Some(linger) = self.options.linger {
            socket.set_linger(Some(linger)).map_err(configure_err)?;
        }
        if self.options.keepalive {
            socket.set_keepalive(true).map_err(configure_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolStack for TcpStack {
    fn descriptor(&self) -> &StackDescriptor {
        &self.descriptor
    }

    async fn dial(&self, request: DialRequest<'_>) -> Result<DialOutcome, StackError> {
        let Some(remote) = request.path.remote.as_ref() else {
            return Err(StackError::Unsupported {
                stack: format!("{} requires a remote endpoint", Self::NAME),
            });
        };
        let peer = remote.addr;
        let local = request.path.local.as_ref().map(|endpoint| endpoint.addr);
        let stream = run_cancellable(request.cancellation, error::CONNECT, Some(peer), connect(local, peer)).await?;
        self.configure(&stream, request.transport)?;

        let metadata = SecurityMetadata {
            peer: Some(peer),
            ..SecurityMetadata::default()
        };
        if let Err(err) = request.security.verify_trust(&metadata) {
            warn!(peer = %peer, "tcp peer rejected by trust verifier");
            return Err(err);
        }
        debug!(peer = %peer, "tcp flow established");
        Ok(DialOutcome {
            flow: Arc::new(TcpFlow::new(stream)),
            early_data_accepted: false,
        })
    }

    async fn listen(&self, request: ListenRequest<'_>) -> Result<Arc<dyn FlowListener>, StackError> {
        let listener = TcpListener::bind(request.local.addr)
            .await
            .map_err(|err| map_io_error(error::BIND, None, err))?;
        let bound = listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, None, err))?;
        let mut endpoint = ConcreteEndpoint::new(bound);
        endpoint.interface = request.local.interface;
        debug!(local = %bound, "tcp listener bound");
        Ok(Arc::new(TcpFlowListener::new(listener, endpoint)))
    }
}

/// 指定本地端点时只绑定其地址，端口交给系统分配：同一端口可能已被 Rendezvous 的监听器占用。
async fn connect(local: Option<SocketAddr>, peer: SocketAddr) -> std::io::Result<TcpStream> {
    match local {
        Some(local) if local.is_ipv4() == peer.is_ipv4() && !local.ip().is_unspecified() => {
            let socket = if peer.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            socket.bind(SocketAddr::new(local.ip(), 0))?;
            socket.connect(peer).await
        }
        _ => TcpStream::connect(peer).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_offers_reliable_ordered_streams_only() {
        let stack = TcpStack::new();
        let descriptor = stack.descriptor();
        assert_eq!(&*descriptor.name, "tcp");
        assert!(!descriptor.native_framing);
        assert!(!descriptor.supports_early_data());
        assert!(descriptor.capabilities.satisfies(ParameterId::FullyReliable, None));
        assert!(!descriptor.capabilities.satisfies(ParameterId::Multistreaming, None));
    }

    #[test]
    fn options_builder_keeps_every_field() {
        let options = TcpOptions::default()
            .with_nodelay(true)
            .with_linger(Duration::from_secs(1))
            .with_keepalive(true);
        let stack = TcpStack::with_priority(3).with_options(options.clone());
        assert_eq!(stack.options(), &options);
        assert_eq!(stack.descriptor().priority, 3);
    }
}

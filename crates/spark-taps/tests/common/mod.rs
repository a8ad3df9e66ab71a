//! 集成测试共用的装配：脚本化协议栈 + 静态解析器 + 记录型处理器。
//!
//! `svc.test` 解析为 [`A`]、[`B`] 两个 IPv4 地址，排序后先 A 后 B。

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use spark_taps::test_stubs::{MockStack, RecordingHandler, StaticResolver};
use spark_taps::{
    CandidateSpecifier, Event, EstablishmentConfig, RemoteSpecifier, TapsError, TransportContext,
};

pub const HOST: &str = "svc.test";
pub const PORT: u16 = 443;
pub const A: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), PORT);
pub const B: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), PORT);

pub struct Harness {
    pub context: TransportContext,
    pub stack: MockStack,
    pub handler: Arc<RecordingHandler>,
}

impl Harness {
    pub fn new(stack: MockStack) -> Self {
        Self::with_config(stack, racing_config())
    }

    pub fn with_config(stack: MockStack, config: EstablishmentConfig) -> Self {
        Self::with_handler(stack, config, RecordingHandler::new())
    }

    pub fn with_handler(
        stack: MockStack,
        config: EstablishmentConfig,
        handler: Arc<RecordingHandler>,
    ) -> Self {
        let resolver = StaticResolver::new().with_host(HOST, [A.ip(), B.ip()]);
        let context = TransportContext::builder()
            .config(config)
            .stack(stack.clone().into_dyn())
            .resolver(Arc::new(resolver))
            .event_handler(handler.clone())
            .build()
            .expect("context");
        Self {
            context,
            stack,
            handler,
        }
    }

    pub fn specifier(&self) -> CandidateSpecifier {
        CandidateSpecifier::new(
            remote(),
            self.context.new_transport_parameters(),
            self.context.new_security_parameters(),
        )
    }

    /// 连接级（不带消息引用）的错误。
    pub fn connection_errors(&self) -> Vec<TapsError> {
        self.handler
            .events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Error {
                    message: None,
                    error,
                    ..
                } => Some(error),
                _ => None,
            })
            .collect()
    }
}

/// D = 100ms，其余保持默认。
pub fn racing_config() -> EstablishmentConfig {
    EstablishmentConfig::default().with_stagger_delay(Duration::from_millis(100))
}

pub fn remote() -> RemoteSpecifier {
    RemoteSpecifier::new().with_hostname(HOST).with_port(PORT)
}

/// 让后台任务把手头的工作做完。
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

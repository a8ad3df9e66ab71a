//! # stack 模块说明
//!
//! ## 角色定位（Why）
//! - 这里是核心与真实网络 IO 之间的唯一边界：协议栈实现负责 `dial`/`listen`/`write`/`read`/`destroy`，
//!   核心负责决定“拨哪条路径、何时放弃、谁是赢家”；
//! - 协议栈以 [`StackDescriptor`] 声明能力与优先级，候选生成器据此做纯谓词匹配，不满足的组合不会被拨号。
//!
//! ## 契约要点（What）
//! - `dial` 必须观察 [`DialRequest::cancellation`]：取消后尽快返回 [`StackError::Cancelled`]，
//!   并在返回前完成自身的清理（协作式取消，核心不会强行中止拨号任务）；
//! - `Flow::read` 返回 `Ok(None)` 表示对端正常结束；
//! - `Flow::destroy` 必须幂等。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cancel::Cancellation;
use crate::candidate::PathDescriptor;
use crate::endpoint::ConcreteEndpoint;
use crate::error::StackError;
use crate::message::MessageRef;
use crate::parameters::{CapacityProfile, Capabilities, FinalizedParameters, ParameterId, SecurityParameters};

/// 协议栈的静态描述。
#[derive(Clone, Debug)]
pub struct StackDescriptor {
    pub name: Arc<str>,
    /// 数值越小越优先，作为排序时的第一个平局裁决键。
    pub priority: u8,
    pub capabilities: Capabilities,
    /// 协议栈自身保留消息边界时为 `true`，此时不经过分帧处理器。
    pub native_framing: bool,
}

impl StackDescriptor {
    pub fn new(name: impl AsRef<str>, priority: u8, capabilities: Capabilities) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            priority,
            capabilities,
            native_framing: false,
        }
    }

    pub fn with_native_framing(mut self, native: bool) -> Self {
        self.native_framing = native;
        self
    }

    /// 是否支持在建连期间携带数据。
    pub fn supports_early_data(&self) -> bool {
        self.capabilities.satisfies(ParameterId::Idempotent0Rtt, None)
    }
}

/// 随拨号一并发送的 0-RTT 数据。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EarlyData {
    pub reference: MessageRef,
    pub content: Bytes,
}

/// 一次拨号请求。
pub struct DialRequest<'a> {
    pub path: &'a PathDescriptor,
    pub transport: &'a FinalizedParameters,
    pub security: &'a SecurityParameters,
    /// 仅当协议栈声明支持 0-RTT 时非空。
    pub early_data: &'a [EarlyData],
    pub cancellation: &'a Cancellation,
}

/// 拨号成功的结果。
pub struct DialOutcome {
    pub flow: Arc<dyn Flow>,
    /// 0-RTT 数据是否已随握手发出。
    pub early_data_accepted: bool,
}

impl fmt::Debug for DialOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialOutcome")
            .field("early_data_accepted", &self.early_data_accepted)
            .finish_non_exhaustive()
    }
}

/// 监听请求。
pub struct ListenRequest<'a> {
    pub local: &'a ConcreteEndpoint,
    pub transport: &'a FinalizedParameters,
    pub security: &'a SecurityParameters,
}

/// 交给协议栈的一帧数据及其逐消息提示。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundFrame {
    pub reference: MessageRef,
    pub payload: Bytes,
    /// 跳过协议栈可能的合并/批量发送。
    pub immediate: bool,
    pub idempotent: bool,
    pub corruption_tolerant: bool,
    pub capacity_profile: CapacityProfile,
}

/// 已建立的数据流。
#[async_trait]
pub trait Flow: Send + Sync + 'static {
    async fn write(&self, frame: OutboundFrame) -> Result<(), StackError>;

    async fn read(&self) -> Result<Option<Bytes>, StackError>;

    async fn destroy(&self);
}

/// 被动接入的数据流。
pub struct AcceptedFlow {
    pub flow: Arc<dyn Flow>,
    pub remote: ConcreteEndpoint,
}

/// 协议栈侧的监听器。
#[async_trait]
pub trait FlowListener: Send + Sync + 'static {
    async fn accept(&self) -> Result<AcceptedFlow, StackError>;

    async fn destroy(&self);

    fn local_endpoint(&self) -> ConcreteEndpoint;
}

/// 协议栈实例。
#[async_trait]
pub trait ProtocolStack: Send + Sync + 'static {
    fn descriptor(&self) -> &StackDescriptor;

    async fn dial(&self, request: DialRequest<'_>) -> Result<DialOutcome, StackError>;

    async fn listen(&self, request: ListenRequest<'_>) -> Result<Arc<dyn FlowListener>, StackError> {
        let _ = request;
        Err(StackError::Unsupported {
            stack: self.descriptor().name.to_string(),
        })
    }
}

/// 可用协议栈的注册表，按注册顺序枚举。
#[derive(Clone, Default)]
pub struct StackRegistry {
    stacks: Vec<Arc<dyn ProtocolStack>>,
}

impl fmt::Debug for StackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stacks.iter().map(|stack| stack.descriptor().name.clone()))
            .finish()
    }
}

impl StackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stack: Arc<dyn ProtocolStack>) {
        self.stacks.push(stack);
    }

    pub fn with(mut self, stack: Arc<dyn ProtocolStack>) -> Self {
        self.register(stack);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ProtocolStack>> {
        self.stacks.iter()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}

//! 出入站消息的数据模型。
//!
//! 消息引用是每条连接内部“竞技场”的句柄，而非指向消息本体的指针：消息离开队列后句柄依然可以安全地
//! 出现在前驱列表里，只是代表“已离开”。

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::parameters::CapacityProfile;

/// 连接内消息句柄，由连接按单调递增顺序签发。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MessageRef(u64);

impl MessageRef {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg#{}", self.0)
    }
}

/// 单条消息的发送属性。
///
/// `niceness` 为反向优先级，0 最紧急；`lifetime` 从提交时刻开始计时，`None` 表示永不过期。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendParameters {
    pub lifetime: Option<Duration>,
    pub niceness: u32,
    pub ordered: bool,
    pub immediate: bool,
    pub idempotent: bool,
    pub corruption_tolerant: bool,
    pub capacity_profile: CapacityProfile,
}

impl SendParameters {
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn with_niceness(mut self, niceness: u32) -> Self {
        self.niceness = niceness;
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn corruption_tolerant(mut self, tolerant: bool) -> Self {
        self.corruption_tolerant = tolerant;
        self
    }

    pub fn with_capacity_profile(mut self, profile: CapacityProfile) -> Self {
        self.capacity_profile = profile;
        self
    }
}

/// 待发送的消息：内容、发送属性与前驱引用。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    content: Bytes,
    parameters: SendParameters,
    antecedents: Vec<MessageRef>,
}

impl OutboundMessage {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            parameters: SendParameters::default(),
            antecedents: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: SendParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// 追加一个必须先离开队列的前驱。
    pub fn after(mut self, antecedent: MessageRef) -> Self {
        if !self.antecedents.contains(&antecedent) {
            self.antecedents.push(antecedent);
        }
        self
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn parameters(&self) -> &SendParameters {
        &self.parameters
    }

    pub fn antecedents(&self) -> &[MessageRef] {
        &self.antecedents
    }

    pub(crate) fn into_content(self) -> Bytes {
        self.content
    }

    pub(crate) fn force_idempotent(mut self) -> Self {
        self.parameters.idempotent = true;
        self
    }
}

/// 部分交付时的位置信息。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PartialDelivery {
    /// 本片段在完整消息中的字节偏移。
    pub offset: u64,
    /// 是否还有后续片段。
    pub more: bool,
}

/// 从连接上收到的一条消息（或其片段）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    payload: Bytes,
    partial: Option<PartialDelivery>,
}

impl InboundMessage {
    pub fn complete(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            partial: None,
        }
    }

    pub fn partial(payload: impl Into<Bytes>, offset: u64, more: bool) -> Self {
        Self {
            payload: payload.into(),
            partial: Some(PartialDelivery { offset, more }),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn is_partial(&self) -> bool {
        self.partial.is_some()
    }

    pub fn partial_delivery(&self) -> Option<PartialDelivery> {
        self.partial
    }
}

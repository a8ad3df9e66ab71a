//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为连接建立引擎对外暴露的错误语义提供集中定义；
//! - 严格区分两类错误：本地即可判定的编程错误（同步返回）与依赖网络时序的运行期状况（只经由事件投递）。
//!
//! ## 设计要求（What）
//! - [`TapsError`] 必须 `Clone + Send + Sync + 'static`，因为它会被装入 [`Event`](crate::event::Event)
//!   跨任务传递；
//! - 每个变体都有稳定错误码 `spark.taps.*` 与 [`ErrorCategory`]，供告警与测试断言使用；
//! - 协议栈边界使用独立的 [`StackError`]，通过 `From` 汇入 [`TapsError`]。

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::message::MessageRef;
use crate::parameters::ParameterId;

/// 引擎统一结果类型。
pub type Result<T, E = TapsError> = std::result::Result<T, E>;

/// 错误所属的投递通道。
///
/// - `Configuration`：调用即可发现的问题，只出现在同步返回值里；
/// - `Operational`：依赖网络行为的状况，只通过 `Error`/`Expired`/`Closed` 事件出现。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCategory {
    Configuration,
    Operational,
}

/// 单次候选拨号失败的记录。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttemptFailure {
    /// 候选路径的可读描述（协议栈、本地与远端地址）。
    pub candidate: String,
    pub error: StackError,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.candidate, self.error)
    }
}

/// 连接建立引擎的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合参数配置、候选生成、竞速建连与消息调度中的全部失败路径；
/// - **契约 (What)**：
///   - 同步类（[`ErrorCategory::Configuration`]）：`ConfigurationConflict`、`InvalidParameterValue`、
///     `MalformedSpecifier`、`InvalidAntecedent`、`AntecedentCycle`、`InvalidConfiguration`、
///     `ConnectionClosed`（关闭后发送）、`NotEstablished`、`Persistence`、`NoRuntime`；
///   - 异步类（[`ErrorCategory::Operational`]）：其余变体，只会出现在事件里。
///     `NoViableCandidates` 比较特殊：协议栈能力预检失败时同步返回，解析后过滤为空时异步投递；
/// - **设计权衡 (Trade-offs)**：上下文以 `String` 保存，牺牲少量分配换取 `Clone` 与可读性。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum TapsError {
    /// 同一参数在合并后的有效集合中同时出现 Require 与 Prohibit，或较窄层试图放宽强约束。
    #[error("configuration conflict on {parameter}: {detail}")]
    ConfigurationConflict {
        parameter: ParameterId,
        detail: String,
    },

    /// 取值类型与参数声明的形状不符，或参数不属于该集合的分组。
    #[error("invalid value for {parameter}: {detail}")]
    InvalidParameterValue {
        parameter: ParameterId,
        detail: String,
    },

    /// 端点描述缺少必要信息（例如远端既无主机名也无地址）。
    #[error("malformed endpoint specifier: {detail}")]
    MalformedSpecifier { detail: String },

    /// 过滤后没有任何可用候选，未进行任何网络 IO。
    #[error("no viable candidates: {detail}")]
    NoViableCandidates { detail: String },

    #[error("resolution of `{endpoint}` failed: {detail}")]
    ResolutionFailure { endpoint: String, detail: String },

    #[error("establishment timed out after {elapsed:?} ({attempts} attempts started)")]
    EstablishmentTimeout { elapsed: Duration, attempts: usize },

    #[error("all {} candidates failed", failures.len())]
    AllCandidatesFailed { failures: Vec<AttemptFailure> },

    /// 连接已关闭（或正在关闭）时继续发送。
    #[error("connection is closed")]
    ConnectionClosed,

    /// 连接尚未建立完成，无法执行该操作（例如 Clone）。
    #[error("connection is not established")]
    NotEstablished,

    /// 消息寿命到期仍未交给协议栈；只作为事件负载出现。
    #[error("message {message} expired before transmission")]
    MessageExpired { message: MessageRef },

    #[error("trust verification failed: {detail}")]
    TrustVerificationFailed { detail: String },

    /// 前驱引用未由本连接签发，或目标引用不处于预留状态。
    #[error("invalid antecedent reference {reference}: {detail}")]
    InvalidAntecedent { reference: MessageRef, detail: String },

    #[error("antecedent chain of {message} forms a cycle")]
    AntecedentCycle { message: MessageRef },

    #[error("invalid engine configuration: {detail}")]
    InvalidConfiguration { detail: String },

    /// 建立之后的协议栈失败（读写错误、对端复位等）。
    #[error("protocol stack failure: {0}")]
    Stack(StackError),

    #[error("framing failure: {detail}")]
    Framing { detail: String },

    #[error("state persistence failure: {detail}")]
    Persistence { detail: String },

    /// 构建上下文时没有可用的 Tokio 运行时。
    #[error("no tokio runtime available for the transport context")]
    NoRuntime,
}

impl TapsError {
    /// 稳定错误码，格式为 `spark.taps.<kind>`。
    pub fn code(&self) -> &'static str {
        match self {
            TapsError::ConfigurationConflict { .. } => "spark.taps.configuration_conflict",
            TapsError::InvalidParameterValue { .. } => "spark.taps.invalid_parameter_value",
            TapsError::MalformedSpecifier { .. } => "spark.taps.malformed_specifier",
            TapsError::NoViableCandidates { .. } => "spark.taps.no_viable_candidates",
            TapsError::ResolutionFailure { .. } => "spark.taps.resolution_failure",
            TapsError::EstablishmentTimeout { .. } => "spark.taps.establishment_timeout",
            TapsError::AllCandidatesFailed { .. } => "spark.taps.all_candidates_failed",
            TapsError::ConnectionClosed => "spark.taps.connection_closed",
            TapsError::NotEstablished => "spark.taps.not_established",
            TapsError::MessageExpired { .. } => "spark.taps.message_expired",
            TapsError::TrustVerificationFailed { .. } => "spark.taps.trust_verification_failed",
            TapsError::InvalidAntecedent { .. } => "spark.taps.invalid_antecedent",
            TapsError::AntecedentCycle { .. } => "spark.taps.antecedent_cycle",
            TapsError::InvalidConfiguration { .. } => "spark.taps.invalid_configuration",
            TapsError::Stack(_) => "spark.taps.stack",
            TapsError::Framing { .. } => "spark.taps.framing",
            TapsError::Persistence { .. } => "spark.taps.persistence",
            TapsError::NoRuntime => "spark.taps.no_runtime",
        }
    }

    /// 错误的投递通道。
    pub fn category(&self) -> ErrorCategory {
        match self {
            TapsError::ConfigurationConflict { .. }
            | TapsError::InvalidParameterValue { .. }
            | TapsError::MalformedSpecifier { .. }
            | TapsError::ConnectionClosed
            | TapsError::NotEstablished
            | TapsError::InvalidAntecedent { .. }
            | TapsError::AntecedentCycle { .. }
            | TapsError::InvalidConfiguration { .. }
            | TapsError::Persistence { .. }
            | TapsError::NoRuntime => ErrorCategory::Configuration,
            _ => ErrorCategory::Operational,
        }
    }

    pub(crate) fn conflict(parameter: ParameterId, detail: impl Into<String>) -> Self {
        TapsError::ConfigurationConflict {
            parameter,
            detail: detail.into(),
        }
    }

    pub(crate) fn invalid_value(parameter: ParameterId, detail: impl Into<String>) -> Self {
        TapsError::InvalidParameterValue {
            parameter,
            detail: detail.into(),
        }
    }

    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        TapsError::MalformedSpecifier {
            detail: detail.into(),
        }
    }
}

impl From<StackError> for TapsError {
    fn from(value: StackError) -> Self {
        match value {
            StackError::TrustVerificationFailed { detail } => {
                TapsError::TrustVerificationFailed { detail }
            }
            other => TapsError::Stack(other),
        }
    }
}

/// 协议栈边界（dial/listen/write/read）上报的错误。
///
/// # 教案式说明
/// - **意图 (Why)**：真实 IO 由外部协议栈完成，核心只需要足够的分类来决定“换下一个候选”
///   还是“关闭连接”；
/// - **契约 (What)**：`Cancelled` 仅在拨号观察到取消令牌后返回，竞速器不会把它计入失败原因的
///   诊断输出之外的任何逻辑；`Io` 携带实现方自定义的稳定错误码。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum StackError {
    #[error("connection refused by {peer}")]
    Refused { peer: String },

    #[error("{peer} is unreachable")]
    Unreachable { peer: String },

    #[error("attempt cancelled")]
    Cancelled,

    #[error("trust verification failed: {detail}")]
    TrustVerificationFailed { detail: String },

    #[error("operation not supported by stack `{stack}`")]
    Unsupported { stack: String },

    #[error("{code}: {detail}")]
    Io { code: &'static str, detail: String },
}

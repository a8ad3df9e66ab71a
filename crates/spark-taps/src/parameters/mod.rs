//! # 传输/安全参数模型
//!
//! ## 核心意图（Why）
//! - 以强类型枚举描述固定的参数宇宙（[`ParameterId`]），并用带标签的联合体 [`ParameterValue`]
//!   取代“按键存放任意值”的做法；取值在写入时即按 [`ValueShape`] 校验；
//! - 五级偏好（[`Preference`]）加可选取值构成 [`Disposition`]，是候选过滤与排序的唯一输入。
//!
//! ## 模块结构（How）
//! - `set`：不可变构建器 [`ParameterSet`] 与定稿结果 [`FinalizedParameters`]，含分层合并规则；
//! - `capabilities`：协议栈/路径实际提供的能力包 [`Capabilities`] 与匹配谓词；
//! - `security`：在参数集之外携带身份、预共享密钥与信任回调的 [`SecurityParameters`]。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod capabilities;
mod security;
mod set;

pub use capabilities::Capabilities;
pub use security::{
    ChallengeHandler, Identity, PreSharedKey, PrivateKey, SecurityMetadata, SecurityParameters,
    TrustVerifier,
};
pub use set::{FinalizedParameters, ParameterSet, ParameterSnapshot};

/// 参数所属分组。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterGroup {
    Transport,
    Security,
}

/// 参数作用的对象。
///
/// - `Stack`：由协议栈能力决定，候选生成阶段即可判定；
/// - `Path`：由解析出的本地端点决定（例如接口类型），解析之后才能判定；
/// - `Setting`：只是连接配置（超时、优先级等），不参与候选筛选，但仍参与冲突检测。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PropertyScope {
    Stack,
    Path,
    Setting,
}

/// 能力匹配时的比较方式。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Comparison {
    /// 提供值之一与请求值相等。
    Equal,
    /// 提供值之一不小于请求值（计数与容量类参数）。
    AtLeast,
}

/// 参数标识，固定宇宙。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterId {
    FullyReliable,
    OrderPreserved,
    PerMessageReliable,
    Idempotent0Rtt,
    Multistreaming,
    TimeoutNegotiation,
    ExtendedErrors,
    ChecksumControl,
    InterfaceType,
    CapacityProfile,
    Timeout,
    SuggestTimeout,
    RetransmissionThreshold,
    MinimumChecksumCoverage,
    GroupScheduler,
    MaxIdempotent0Rtt,
    MaxNoFragment,
    MaxNonPartialSend,
    MaxNonPartialReceive,
    Niceness,
    SupportedGroup,
    Ciphersuite,
    SignatureAlgorithm,
    SessionCacheCapacity,
    SessionCacheLifetime,
    SessionCacheReuse,
}

impl ParameterId {
    /// 全部参数，按声明顺序排列。
    pub const ALL: [ParameterId; 26] = [
        ParameterId::FullyReliable,
        ParameterId::OrderPreserved,
        ParameterId::PerMessageReliable,
        ParameterId::Idempotent0Rtt,
        ParameterId::Multistreaming,
        ParameterId::TimeoutNegotiation,
        ParameterId::ExtendedErrors,
        ParameterId::ChecksumControl,
        ParameterId::InterfaceType,
        ParameterId::CapacityProfile,
        ParameterId::Timeout,
        ParameterId::SuggestTimeout,
        ParameterId::RetransmissionThreshold,
        ParameterId::MinimumChecksumCoverage,
        ParameterId::GroupScheduler,
        ParameterId::MaxIdempotent0Rtt,
        ParameterId::MaxNoFragment,
        ParameterId::MaxNonPartialSend,
        ParameterId::MaxNonPartialReceive,
        ParameterId::Niceness,
        ParameterId::SupportedGroup,
        ParameterId::Ciphersuite,
        ParameterId::SignatureAlgorithm,
        ParameterId::SessionCacheCapacity,
        ParameterId::SessionCacheLifetime,
        ParameterId::SessionCacheReuse,
    ];

    /// 稳定的蛇形命名，用于日志与错误文案。
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FullyReliable => "fully_reliable",
            Self::OrderPreserved => "order_preserved",
            Self::PerMessageReliable => "per_message_reliable",
            Self::Idempotent0Rtt => "idempotent_0rtt",
            Self::Multistreaming => "multistreaming",
            Self::TimeoutNegotiation => "timeout_negotiation",
            Self::ExtendedErrors => "extended_errors",
            Self::ChecksumControl => "checksum_control",
            Self::InterfaceType => "interface_type",
            Self::CapacityProfile => "capacity_profile",
            Self::Timeout => "timeout",
            Self::SuggestTimeout => "suggest_timeout",
            Self::RetransmissionThreshold => "retransmission_threshold",
            Self::MinimumChecksumCoverage => "minimum_checksum_coverage",
            Self::GroupScheduler => "group_scheduler",
            Self::MaxIdempotent0Rtt => "max_idempotent_0rtt",
            Self::MaxNoFragment => "max_no_fragment",
            Self::MaxNonPartialSend => "max_non_partial_send",
            Self::MaxNonPartialReceive => "max_non_partial_receive",
            Self::Niceness => "niceness",
            Self::SupportedGroup => "supported_group",
            Self::Ciphersuite => "ciphersuite",
            Self::SignatureAlgorithm => "signature_algorithm",
            Self::SessionCacheCapacity => "session_cache_capacity",
            Self::SessionCacheLifetime => "session_cache_lifetime",
            Self::SessionCacheReuse => "session_cache_reuse",
        }
    }

    pub const fn group(self) -> ParameterGroup {
        match self {
            Self::SupportedGroup
            | Self::Ciphersuite
            | Self::SignatureAlgorithm
            | Self::SessionCacheCapacity
            | Self::SessionCacheLifetime
            | Self::SessionCacheReuse => ParameterGroup::Security,
            _ => ParameterGroup::Transport,
        }
    }

    /// 参数声明的取值形状。
    pub const fn shape(self) -> ValueShape {
        match self {
            Self::FullyReliable
            | Self::OrderPreserved
            | Self::PerMessageReliable
            | Self::Idempotent0Rtt
            | Self::Multistreaming
            | Self::TimeoutNegotiation
            | Self::ExtendedErrors
            | Self::ChecksumControl
            | Self::SessionCacheReuse => ValueShape::Boolean,
            Self::InterfaceType => ValueShape::Enum(EnumKind::Interface),
            Self::CapacityProfile => ValueShape::Enum(EnumKind::Capacity),
            Self::GroupScheduler => ValueShape::Enum(EnumKind::Scheduler),
            Self::Timeout | Self::SuggestTimeout | Self::SessionCacheLifetime => {
                ValueShape::Duration
            }
            Self::RetransmissionThreshold
            | Self::MinimumChecksumCoverage
            | Self::MaxIdempotent0Rtt
            | Self::MaxNoFragment
            | Self::MaxNonPartialSend
            | Self::MaxNonPartialReceive
            | Self::Niceness
            | Self::SupportedGroup
            | Self::Ciphersuite
            | Self::SignatureAlgorithm
            | Self::SessionCacheCapacity => ValueShape::Integer,
        }
    }

    pub const fn scope(self) -> PropertyScope {
        match self {
            Self::InterfaceType => PropertyScope::Path,
            Self::CapacityProfile
            | Self::Timeout
            | Self::SuggestTimeout
            | Self::RetransmissionThreshold
            | Self::MinimumChecksumCoverage
            | Self::GroupScheduler
            | Self::Niceness => PropertyScope::Setting,
            _ => PropertyScope::Stack,
        }
    }

    pub const fn comparison(self) -> Comparison {
        match self {
            Self::MaxIdempotent0Rtt
            | Self::MaxNoFragment
            | Self::MaxNonPartialSend
            | Self::MaxNonPartialReceive
            | Self::SessionCacheCapacity
            | Self::SessionCacheLifetime => Comparison::AtLeast,
            _ => Comparison::Equal,
        }
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 枚举型取值的具体种类。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EnumKind {
    Interface,
    Capacity,
    Scheduler,
}

/// 参数取值的形状。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ValueShape {
    Boolean,
    Integer,
    Duration,
    Enum(EnumKind),
}

impl fmt::Display for ValueShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueShape::Boolean => f.write_str("boolean"),
            ValueShape::Integer => f.write_str("integer"),
            ValueShape::Duration => f.write_str("duration"),
            ValueShape::Enum(EnumKind::Interface) => f.write_str("interface type"),
            ValueShape::Enum(EnumKind::Capacity) => f.write_str("capacity profile"),
            ValueShape::Enum(EnumKind::Scheduler) => f.write_str("scheduler kind"),
        }
    }
}

/// 网络接口类型。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    Loopback,
    Wired,
    Wifi,
    Cellular,
    Other,
}

/// 容量画像：提示协议栈在时延与吞吐之间如何取舍。
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CapacityProfile {
    #[default]
    Default,
    Interactive,
    ConstantRate,
    Bulk,
}

/// 连接组内的发送调度算法。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Fifo,
    RoundRobin,
    WeightedFair,
}

/// 参数取值的带标签联合体。
///
/// # 教案式说明
/// - **意图 (Why)**：以有限的形状集合覆盖全部参数，写入时即可按 [`ParameterId::shape`] 拒绝错配；
/// - **契约 (What)**：`Integer` 统一为 `u64`（计数、IANA 码点、优先级）；`Duration` 用于超时与寿命。
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    Boolean(bool),
    Integer(u64),
    Duration(Duration),
    Interface(InterfaceKind),
    Capacity(CapacityProfile),
    Scheduler(SchedulerKind),
}

impl ParameterValue {
    pub fn shape(&self) -> ValueShape {
        match self {
            ParameterValue::Boolean(_) => ValueShape::Boolean,
            ParameterValue::Integer(_) => ValueShape::Integer,
            ParameterValue::Duration(_) => ValueShape::Duration,
            ParameterValue::Interface(_) => ValueShape::Enum(EnumKind::Interface),
            ParameterValue::Capacity(_) => ValueShape::Enum(EnumKind::Capacity),
            ParameterValue::Scheduler(_) => ValueShape::Enum(EnumKind::Scheduler),
        }
    }

    /// 不携带请求值时，提供值是否算作“具备该能力”。
    pub(crate) fn is_affirmative(&self) -> bool {
        !matches!(self, ParameterValue::Boolean(false) | ParameterValue::Integer(0))
    }

    /// 判断 `self`（提供值）是否满足 `requested`。
    pub(crate) fn satisfies(&self, requested: &ParameterValue, comparison: Comparison) -> bool {
        match (comparison, self, requested) {
            (Comparison::AtLeast, ParameterValue::Integer(offered), ParameterValue::Integer(want)) => {
                offered >= want
            }
            (
                Comparison::AtLeast,
                ParameterValue::Duration(offered),
                ParameterValue::Duration(want),
            ) => offered >= want,
            _ => self == requested,
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Boolean(value)
    }
}

impl From<u64> for ParameterValue {
    fn from(value: u64) -> Self {
        ParameterValue::Integer(value)
    }
}

impl From<u32> for ParameterValue {
    fn from(value: u32) -> Self {
        ParameterValue::Integer(u64::from(value))
    }
}

impl From<Duration> for ParameterValue {
    fn from(value: Duration) -> Self {
        ParameterValue::Duration(value)
    }
}

impl From<InterfaceKind> for ParameterValue {
    fn from(value: InterfaceKind) -> Self {
        ParameterValue::Interface(value)
    }
}

impl From<CapacityProfile> for ParameterValue {
    fn from(value: CapacityProfile) -> Self {
        ParameterValue::Capacity(value)
    }
}

impl From<SchedulerKind> for ParameterValue {
    fn from(value: SchedulerKind) -> Self {
        ParameterValue::Scheduler(value)
    }
}

/// 偏好强度。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preference {
    Require,
    Prefer,
    Ignore,
    Avoid,
    Prohibit,
}

impl Preference {
    /// Require 与 Prohibit 不可协商。
    pub const fn is_firm(self) -> bool {
        matches!(self, Preference::Require | Preference::Prohibit)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Preference::Require => "require",
            Preference::Prefer => "prefer",
            Preference::Ignore => "ignore",
            Preference::Avoid => "avoid",
            Preference::Prohibit => "prohibit",
        }
    }
}

/// 附着在某个参数上的偏好及可选取值。
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Disposition {
    pub preference: Preference,
    pub value: Option<ParameterValue>,
}

impl Disposition {
    pub fn new(preference: Preference, value: Option<ParameterValue>) -> Self {
        Self { preference, value }
    }

    /// 以更窄一层（或同一集合中更晚一次调用）的 `next` 收窄当前偏好。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：同一规则既用于集合内部按调用顺序折叠，也用于 context → association → call
    ///   的分层合并，保证“强约束不可被悄悄降级”；
    /// - **契约 (What)**：
    ///   - 强约束之后出现相反的强约束 → 冲突；
    ///   - 强约束之后出现 Ignore，或与之相悖的软偏好（Require 后 Avoid、Prohibit 后 Prefer）→ 冲突；
    ///   - 同向强约束重复声明但取值不同 → 冲突；
    ///   - 与强约束同向的软偏好 → 保留强约束；软偏好之后的任何偏好 → 直接替换；
    /// - **返回值**：`Err` 携带人类可读的冲突原因，由调用方包装为
    ///   [`TapsError::ConfigurationConflict`](crate::TapsError::ConfigurationConflict)。
    pub(crate) fn narrow(&self, next: &Disposition) -> Result<Disposition, String> {
        use Preference::*;

        if !self.preference.is_firm() {
            return Ok(next.clone());
        }
        match (self.preference, next.preference) {
            (Require, Prohibit) | (Prohibit, Require) => Err(format!(
                "{} cannot be combined with {}",
                self.preference.as_str(),
                next.preference.as_str()
            )),
            (_, Ignore) => Err(format!(
                "ignore cannot relax a {} disposition",
                self.preference.as_str()
            )),
            (Require, Avoid) | (Prohibit, Prefer) => Err(format!(
                "{} contradicts an inherited {}",
                next.preference.as_str(),
                self.preference.as_str()
            )),
            (Require, Require) | (Prohibit, Prohibit) => match (&self.value, &next.value) {
                (Some(current), Some(incoming)) if current != incoming => Err(format!(
                    "{} redeclared with a different value ({current:?} vs {incoming:?})",
                    self.preference.as_str()
                )),
                (None, Some(_)) => Ok(next.clone()),
                _ => Ok(self.clone()),
            },
            _ => Ok(self.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_id_has_a_stable_name_and_a_group() {
        let security = ParameterId::ALL
            .iter()
            .filter(|id| id.group() == ParameterGroup::Security)
            .count();
        assert_eq!(security, 6);
        assert_eq!(ParameterId::Idempotent0Rtt.to_string(), "idempotent_0rtt");
    }

    #[test]
    fn narrowing_keeps_firm_dispositions() {
        let require = Disposition::new(Preference::Require, None);
        let prefer = Disposition::new(Preference::Prefer, None);
        assert_eq!(require.narrow(&prefer), Ok(require.clone()));
        assert!(require.narrow(&Disposition::new(Preference::Avoid, None)).is_err());
        assert!(require.narrow(&Disposition::new(Preference::Ignore, None)).is_err());
        assert!(require.narrow(&Disposition::new(Preference::Prohibit, None)).is_err());
        assert_eq!(prefer.narrow(&require), Ok(require));
    }

    #[test]
    fn at_least_comparison_applies_to_counters_only() {
        let offered = ParameterValue::Integer(1200);
        assert!(offered.satisfies(&ParameterValue::Integer(1000), Comparison::AtLeast));
        assert!(!offered.satisfies(&ParameterValue::Integer(1000), Comparison::Equal));
    }
}

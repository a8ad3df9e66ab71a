use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    CapacityProfile, Disposition, EnumKind, InterfaceKind, ParameterGroup, ParameterId, ParameterValue,
    Preference, SchedulerKind, ValueShape,
};
use crate::error::{Result, TapsError};

/// 不可变的参数集合构建器。
///
/// # 教案式说明
/// - **意图 (Why)**：一份基础集合常被多个候选描述复用，因此所有 `require/prefer/...` 都返回新值，
///   接收者保持不变；内部以 `Arc` 共享未修改的部分，派生集合之间不会相互影响；
/// - **契约 (What)**：
///   - 构建器本身从不失败：取值形状错配或分组错配会被记下，在 [`finalize`](Self::finalize) 时以
///     [`TapsError::InvalidParameterValue`] 报告；
///   - Require/Prohibit 冲突同样推迟到定稿时以 [`TapsError::ConfigurationConflict`] 报告，绝不会拖到
///     建连阶段；
///   - [`set`](Self::set) 是唯一立即校验的写入口，错配直接返回错误；
/// - **执行 (How)**：每个参数保留按调用顺序记录的偏好历史，定稿时用
///   [`Disposition::narrow`] 逐条折叠；分层合并只是把各层历史按 context → association → call 串接。
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterSet {
    group: ParameterGroup,
    dispositions: Arc<BTreeMap<ParameterId, Vec<Disposition>>>,
    values: Arc<BTreeMap<ParameterId, ParameterValue>>,
    invalid: Option<(ParameterId, String)>,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self::transport()
    }
}

impl ParameterSet {
    /// 空的传输参数集合。
    pub fn transport() -> Self {
        Self::empty(ParameterGroup::Transport)
    }

    /// 空的安全参数集合。
    pub fn security() -> Self {
        Self::empty(ParameterGroup::Security)
    }

    fn empty(group: ParameterGroup) -> Self {
        Self {
            group,
            dispositions: Arc::new(BTreeMap::new()),
            values: Arc::new(BTreeMap::new()),
            invalid: None,
        }
    }

    pub fn group(&self) -> ParameterGroup {
        self.group
    }

    pub fn require(&self, id: ParameterId) -> Self {
        self.with_disposition(id, Preference::Require, None)
    }

    pub fn require_value(&self, id: ParameterId, value: impl Into<ParameterValue>) -> Self {
        self.with_disposition(id, Preference::Require, Some(value.into()))
    }

    pub fn prefer(&self, id: ParameterId) -> Self {
        self.with_disposition(id, Preference::Prefer, None)
    }

    pub fn prefer_value(&self, id: ParameterId, value: impl Into<ParameterValue>) -> Self {
        self.with_disposition(id, Preference::Prefer, Some(value.into()))
    }

    /// 显式忽略某个参数，用于抵消系统默认偏好。
    pub fn ignore(&self, id: ParameterId) -> Self {
        self.with_disposition(id, Preference::Ignore, None)
    }

    pub fn avoid(&self, id: ParameterId) -> Self {
        self.with_disposition(id, Preference::Avoid, None)
    }

    pub fn avoid_value(&self, id: ParameterId, value: impl Into<ParameterValue>) -> Self {
        self.with_disposition(id, Preference::Avoid, Some(value.into()))
    }

    pub fn prohibit(&self, id: ParameterId) -> Self {
        self.with_disposition(id, Preference::Prohibit, None)
    }

    pub fn prohibit_value(&self, id: ParameterId, value: impl Into<ParameterValue>) -> Self {
        self.with_disposition(id, Preference::Prohibit, Some(value.into()))
    }

    /// 追加一条偏好记录并返回新集合。
    pub fn with_disposition(
        &self,
        id: ParameterId,
        preference: Preference,
        value: Option<ParameterValue>,
    ) -> Self {
        let mut next = self.clone();
        if let Err(detail) = self.check(id, value.as_ref()) {
            if next.invalid.is_none() {
                next.invalid = Some((id, detail));
            }
            return next;
        }
        Arc::make_mut(&mut next.dispositions)
            .entry(id)
            .or_default()
            .push(Disposition::new(preference, value));
        next
    }

    /// 写入参数的当前取值，立即按声明形状校验。
    pub fn set(&self, id: ParameterId, value: impl Into<ParameterValue>) -> Result<Self> {
        let value = value.into();
        self.check(id, Some(&value))
            .map_err(|detail| TapsError::invalid_value(id, detail))?;
        let mut next = self.clone();
        Arc::make_mut(&mut next.values).insert(id, value);
        Ok(next)
    }

    /// 参数的当前取值：优先显式 `set` 的值，其次是最近一条带值的偏好。
    pub fn get(&self, id: ParameterId) -> Option<ParameterValue> {
        if let Some(value) = self.values.get(&id) {
            return Some(value.clone());
        }
        self.dispositions
            .get(&id)
            .and_then(|history| history.iter().rev().find_map(|d| d.value.clone()))
    }

    pub fn get_bool(&self, id: ParameterId) -> Result<Option<bool>> {
        typed::boolean(id, self.get(id))
    }

    pub fn get_integer(&self, id: ParameterId) -> Result<Option<u64>> {
        typed::integer(id, self.get(id))
    }

    pub fn get_duration(&self, id: ParameterId) -> Result<Option<Duration>> {
        typed::duration(id, self.get(id))
    }

    pub fn get_interface(&self, id: ParameterId) -> Result<Option<InterfaceKind>> {
        typed::interface(id, self.get(id))
    }

    pub fn get_capacity_profile(&self, id: ParameterId) -> Result<Option<CapacityProfile>> {
        typed::capacity(id, self.get(id))
    }

    pub fn get_scheduler(&self, id: ParameterId) -> Result<Option<SchedulerKind>> {
        typed::scheduler(id, self.get(id))
    }

    /// 某参数按调用顺序记录的全部偏好。
    pub fn dispositions(&self, id: ParameterId) -> &[Disposition] {
        self.dispositions.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.dispositions.is_empty() && self.values.is_empty()
    }

    /// 将本集合单独定稿。
    pub fn finalize(&self) -> Result<FinalizedParameters> {
        Self::finalize_layers(&[self])
    }

    /// 按从宽到窄的顺序合并多层集合并定稿。
    ///
    /// 冲突检测在此一次性完成；返回的 [`FinalizedParameters`] 对每个参数只保留一条有效偏好。
    pub fn finalize_layers(layers: &[&ParameterSet]) -> Result<FinalizedParameters> {
        if let Some((id, detail)) = layers.iter().find_map(|layer| layer.invalid.as_ref()) {
            return Err(TapsError::invalid_value(*id, detail.clone()));
        }

        let mut effective: BTreeMap<ParameterId, Disposition> = BTreeMap::new();
        let mut values = BTreeMap::new();
        for layer in layers {
            for (id, history) in layer.dispositions.iter() {
                for next in history {
                    let merged = match effective.get(id) {
                        Some(current) => current
                            .narrow(next)
                            .map_err(|detail| TapsError::conflict(*id, detail))?,
                        None => next.clone(),
                    };
                    effective.insert(*id, merged);
                }
            }
            for (id, value) in layer.values.iter() {
                values.insert(*id, value.clone());
            }
        }
        Ok(FinalizedParameters {
            dispositions: effective,
            values,
        })
    }

    pub fn snapshot(&self) -> ParameterSnapshot {
        ParameterSnapshot {
            group: self.group,
            dispositions: self
                .dispositions
                .iter()
                .map(|(id, history)| (*id, history.clone()))
                .collect(),
            values: self
                .values
                .iter()
                .map(|(id, value)| (*id, value.clone()))
                .collect(),
        }
    }

    /// 从快照恢复集合；快照中的每一条记录都会重新经过形状校验。
    pub fn from_snapshot(snapshot: ParameterSnapshot) -> Result<Self> {
        let mut set = Self::empty(snapshot.group);
        for (id, history) in snapshot.dispositions {
            for disposition in history {
                set = set.with_disposition(id, disposition.preference, disposition.value);
            }
        }
        for (id, value) in snapshot.values {
            set = set.set(id, value)?;
        }
        if let Some((id, detail)) = set.invalid.take() {
            return Err(TapsError::invalid_value(id, detail));
        }
        Ok(set)
    }

    fn check(&self, id: ParameterId, value: Option<&ParameterValue>) -> Result<(), String> {
        if id.group() != self.group {
            return Err(format!(
                "{:?} parameter used in a {:?} parameter set",
                id.group(),
                self.group
            ));
        }
        match value {
            Some(value) if value.shape() != id.shape() => Err(format!(
                "expected {}, found {}",
                id.shape(),
                value.shape()
            )),
            _ => Ok(()),
        }
    }
}

/// 参数集合的可序列化形式，供持久化使用。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub group: ParameterGroup,
    pub dispositions: Vec<(ParameterId, Vec<Disposition>)>,
    pub values: Vec<(ParameterId, ParameterValue)>,
}

/// 定稿后的有效参数：每个参数至多一条偏好，且已通过冲突检测。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FinalizedParameters {
    dispositions: BTreeMap<ParameterId, Disposition>,
    values: BTreeMap<ParameterId, ParameterValue>,
}

impl FinalizedParameters {
    pub fn disposition(&self, id: ParameterId) -> Option<&Disposition> {
        self.dispositions.get(&id)
    }

    /// 未声明的参数视为 Ignore。
    pub fn preference(&self, id: ParameterId) -> Preference {
        self.dispositions
            .get(&id)
            .map(|d| d.preference)
            .unwrap_or(Preference::Ignore)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParameterId, &Disposition)> {
        self.dispositions.iter().map(|(id, d)| (*id, d))
    }

    pub fn value(&self, id: ParameterId) -> Option<&ParameterValue> {
        self.values
            .get(&id)
            .or_else(|| self.dispositions.get(&id).and_then(|d| d.value.as_ref()))
    }

    pub fn get_bool(&self, id: ParameterId) -> Result<Option<bool>> {
        typed::boolean(id, self.value(id).cloned())
    }

    pub fn get_integer(&self, id: ParameterId) -> Result<Option<u64>> {
        typed::integer(id, self.value(id).cloned())
    }

    pub fn get_duration(&self, id: ParameterId) -> Result<Option<Duration>> {
        typed::duration(id, self.value(id).cloned())
    }

    pub fn get_capacity_profile(&self, id: ParameterId) -> Result<Option<CapacityProfile>> {
        typed::capacity(id, self.value(id).cloned())
    }

    pub fn is_empty(&self) -> bool {
        self.dispositions.is_empty() && self.values.is_empty()
    }
}

/// 按声明形状取出具体类型；形状不符时返回 `InvalidParameterValue`。
mod typed {
    use super::*;

    fn mismatch(id: ParameterId, wanted: &str) -> TapsError {
        TapsError::invalid_value(id, format!("declared as {}, requested as {wanted}", id.shape()))
    }

    pub(super) fn boolean(id: ParameterId, value: Option<ParameterValue>) -> Result<Option<bool>> {
        if id.shape() != ValueShape::Boolean {
            return Err(mismatch(id, "boolean"));
        }
        Ok(match value {
            Some(ParameterValue::Boolean(v)) => Some(v),
            _ => None,
        })
    }

    pub(super) fn integer(id: ParameterId, value: Option<ParameterValue>) -> Result<Option<u64>> {
        if id.shape() != ValueShape::Integer {
            return Err(mismatch(id, "integer"));
        }
        Ok(match value {
            Some(ParameterValue::Integer(v)) => Some(v),
            _ => None,
        })
    }

    pub(super) fn duration(
        id: ParameterId,
        value: Option<ParameterValue>,
    ) -> Result<Option<Duration>> {
        if id.shape() != ValueShape::Duration {
            return Err(mismatch(id, "duration"));
        }
        Ok(match value {
            Some(ParameterValue::Duration(v)) => Some(v),
            _ => None,
        })
    }

    pub(super) fn interface(
        id: ParameterId,
        value: Option<ParameterValue>,
    ) -> Result<Option<InterfaceKind>> {
        match (id.shape(), value) {
            (ValueShape::Enum(EnumKind::Interface), Some(ParameterValue::Interface(v))) => {
                Ok(Some(v))
            }
            (ValueShape::Enum(EnumKind::Interface), _) => Ok(None),
            _ => Err(mismatch(id, "interface type")),
        }
    }

    pub(super) fn capacity(
        id: ParameterId,
        value: Option<ParameterValue>,
    ) -> Result<Option<CapacityProfile>> {
        match (id.shape(), value) {
            (ValueShape::Enum(EnumKind::Capacity), Some(ParameterValue::Capacity(v))) => {
                Ok(Some(v))
            }
            (ValueShape::Enum(EnumKind::Capacity), _) => Ok(None),
            _ => Err(mismatch(id, "capacity profile")),
        }
    }

    pub(super) fn scheduler(
        id: ParameterId,
        value: Option<ParameterValue>,
    ) -> Result<Option<SchedulerKind>> {
        match (id.shape(), value) {
            (
                ValueShape::Enum(EnumKind::Scheduler),
                Some(ParameterValue::Scheduler(v)),
            ) => Ok(Some(v)),
            (ValueShape::Enum(EnumKind::Scheduler), _) => Ok(None),
            _ => Err(mismatch(id, "scheduler kind")),
        }
    }
}

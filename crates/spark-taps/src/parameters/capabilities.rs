use std::collections::BTreeMap;

use super::{ParameterId, ParameterValue, Preference};
use crate::parameters::FinalizedParameters;

/// 协议栈或路径实际提供的能力包。
///
/// # 教案式说明
/// - **意图 (Why)**：候选过滤只需要回答“某参数在此候选上是否成立”，因此能力包以“参数 → 提供值列表”
///   表示，同一参数可以提供多个值（例如多个密码套件）；
/// - **契约 (What)**：[`satisfies`](Self::satisfies) 是纯谓词；未出现的参数一律视为不具备；
/// - **执行 (How)**：按 [`ParameterId::comparison`] 选择相等或“不小于”比较。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    offered: BTreeMap<ParameterId, Vec<ParameterValue>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一项提供值，返回新能力包。
    pub fn with(mut self, id: ParameterId, value: impl Into<ParameterValue>) -> Self {
        self.insert(id, value.into());
        self
    }

    /// 以布尔真值声明一项能力。
    pub fn with_flag(self, id: ParameterId) -> Self {
        self.with(id, true)
    }

    pub fn insert(&mut self, id: ParameterId, value: ParameterValue) {
        let values = self.offered.entry(id).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    pub fn offered(&self, id: ParameterId) -> &[ParameterValue] {
        self.offered.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 参数（可选带请求值）在本能力包上是否成立。
    pub fn satisfies(&self, id: ParameterId, requested: Option<&ParameterValue>) -> bool {
        let offered = self.offered(id);
        match requested {
            None => offered.iter().any(ParameterValue::is_affirmative),
            Some(requested) => offered
                .iter()
                .any(|value| value.satisfies(requested, id.comparison())),
        }
    }

    /// 合并两份能力包（协议栈能力 ∪ 路径属性）。
    pub fn union(&self, other: &Capabilities) -> Capabilities {
        let mut merged = self.clone();
        for (id, values) in &other.offered {
            for value in values {
                merged.insert(*id, value.clone());
            }
        }
        merged
    }

    /// 只按 `scope` 过滤的强约束谓词：Require 必须成立，Prohibit 必须不成立。
    ///
    /// 候选生成阶段只检查协议栈作用域的参数，路径作用域的参数留给解析之后的过滤器。
    pub(crate) fn meets_firm(
        &self,
        parameters: &FinalizedParameters,
        scope: super::PropertyScope,
    ) -> Result<(), ParameterId> {
        for (id, disposition) in parameters.iter() {
            if id.scope() != scope {
                continue;
            }
            let holds = self.satisfies(id, disposition.value.as_ref());
            match disposition.preference {
                Preference::Require if !holds => return Err(id),
                Preference::Prohibit if holds => return Err(id),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{InterfaceKind, ParameterSet, PropertyScope};

    #[test]
    fn missing_capabilities_never_satisfy() {
        let caps = Capabilities::new();
        assert!(!caps.satisfies(ParameterId::FullyReliable, None));
    }

    #[test]
    fn false_flags_do_not_count_as_offered() {
        let caps = Capabilities::new().with(ParameterId::Multistreaming, false);
        assert!(!caps.satisfies(ParameterId::Multistreaming, None));
        assert!(caps.satisfies(ParameterId::Multistreaming, Some(&false.into())));
    }

    #[test]
    fn firm_check_is_scoped() {
        let caps = Capabilities::new().with_flag(ParameterId::FullyReliable);
        let params = ParameterSet::transport()
            .require(ParameterId::FullyReliable)
            .require_value(ParameterId::InterfaceType, InterfaceKind::Wifi)
            .finalize()
            .expect("finalize");
        assert_eq!(caps.meets_firm(&params, PropertyScope::Stack), Ok(()));
        assert_eq!(
            caps.meets_firm(&params, PropertyScope::Path),
            Err(ParameterId::InterfaceType)
        );
    }
}

use std::cmp::Reverse;

use tracing::debug;

use crate::candidate::RawCandidate;
use crate::error::{Result, TapsError};
use crate::parameters::{FinalizedParameters, ParameterId, Preference, PropertyScope};

/// 单个候选的判定结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// 违反 Require 或命中 Prohibit。
    Rejected(ParameterId),
    /// 通过过滤，附带偏好得分。
    Accepted(i64),
}

/// 按候选自身的有效参数判定：Require 必须成立，Prohibit 必须不成立；
/// 每个成立的 Prefer 加一分，每个成立的 Avoid 减一分。只作用于配置类之外的参数。
pub fn evaluate(candidate: &RawCandidate) -> Verdict {
    let mut score = 0i64;
    for parameters in [candidate.transport(), candidate.security_parameters()] {
        match evaluate_set(candidate, parameters) {
            Verdict::Accepted(partial) => score += partial,
            rejected => return rejected,
        }
    }
    Verdict::Accepted(score)
}

fn evaluate_set(candidate: &RawCandidate, parameters: &FinalizedParameters) -> Verdict {
    let mut score = 0i64;
    for (id, disposition) in parameters.iter() {
        if id.scope() == PropertyScope::Setting {
            continue;
        }
        let holds = candidate
            .path
            .properties
            .satisfies(id, disposition.value.as_ref());
        match (disposition.preference, holds) {
            (Preference::Require, false) | (Preference::Prohibit, true) => {
                return Verdict::Rejected(id);
            }
            (Preference::Prefer, true) => score += 1,
            (Preference::Avoid, true) => score -= 1,
            _ => {}
        }
    }
    Verdict::Accepted(score)
}

/// 过滤并排序候选。
///
/// # 教案式说明
/// - **意图 (Why)**：网络时序不确定，但“先拨谁”必须确定：同样的输入永远得到同样的顺序；
/// - **契约 (What)**：
///   - 纯函数，不做任何 IO；
///   - 过滤后为空返回 [`TapsError::NoViableCandidates`]；
///   - 排序键依次为：得分降序、协议栈优先级升序、IPv6 先于 IPv4、原始枚举序；
/// - **执行 (How)**：先计算 `(键, 候选)` 对再稳定排序，枚举序作为最后一键使结果与排序算法无关。
pub fn filter_and_rank(candidates: &[RawCandidate]) -> Result<Vec<RawCandidate>> {
    let mut survivors = Vec::with_capacity(candidates.len());
    let mut first_rejection = None;
    for candidate in candidates {
        match evaluate(candidate) {
            Verdict::Accepted(score) => survivors.push((score, candidate)),
            Verdict::Rejected(id) => {
                debug!(candidate = %candidate.path, parameter = %id, "candidate filtered out");
                first_rejection.get_or_insert((id, candidate.path.to_string()));
            }
        }
    }

    if survivors.is_empty() {
        let detail = match first_rejection {
            Some((id, path)) => format!("every candidate was filtered out (e.g. {path} fails {id})"),
            None => "no candidates were generated".to_owned(),
        };
        return Err(TapsError::NoViableCandidates { detail });
    }

    survivors.sort_by_key(|(score, candidate)| {
        (
            Reverse(*score),
            candidate.path.priority,
            !candidate.path.is_ipv6(),
            candidate.ordinal,
        )
    });
    Ok(survivors
        .into_iter()
        .map(|(_, candidate)| candidate.clone())
        .collect())
}

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use super::{ParameterId, ParameterSet, ParameterValue};
use crate::error::{Result, StackError, TapsError};

/// 本地身份：DER 编码的证书链，首个元素为叶子证书。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    pub certificate_chain: Vec<Bytes>,
}

/// DER 编码的公私钥对。
#[derive(Clone, Eq, PartialEq)]
pub struct PrivateKey {
    pub private_der: Bytes,
    pub public_der: Bytes,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("private_der", &"<redacted>")
            .field("public_der_len", &self.public_der.len())
            .finish()
    }
}

/// 与身份标识绑定的预共享密钥。
#[derive(Clone, Eq, PartialEq)]
pub struct PreSharedKey {
    pub identity: String,
    pub key: Bytes,
}

impl fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreSharedKey")
            .field("identity", &self.identity)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// 握手期间交给信任校验与挑战回调的关联元数据。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SecurityMetadata {
    pub peer: Option<SocketAddr>,
    pub server_name: Option<String>,
    pub certificate_chain: Vec<Bytes>,
}

/// 信任校验回调：返回 `Ok(true)` 表示信任该关联。
pub trait TrustVerifier: Send + Sync {
    fn verify(&self, metadata: &SecurityMetadata) -> Result<bool>;
}

impl<F> TrustVerifier for F
where
    F: Fn(&SecurityMetadata) -> Result<bool> + Send + Sync,
{
    fn verify(&self, metadata: &SecurityMetadata) -> Result<bool> {
        self(metadata)
    }
}

/// 身份挑战回调：返回 `Ok(true)` 表示本端成功应答挑战。
pub trait ChallengeHandler: Send + Sync {
    fn handle(&self, metadata: &SecurityMetadata) -> Result<bool>;
}

impl<F> ChallengeHandler for F
where
    F: Fn(&SecurityMetadata) -> Result<bool> + Send + Sync,
{
    fn handle(&self, metadata: &SecurityMetadata) -> Result<bool> {
        self(metadata)
    }
}

/// 安全参数：安全分组的 [`ParameterSet`] 加上身份材料与回调。
///
/// # 教案式说明
/// - **意图 (Why)**：身份与回调由协议栈在握手时不透明地使用，核心只负责携带，不解释其内容；
/// - **契约 (What)**：与 [`ParameterSet`] 一样是不可变构建器，所有 `add_*`/`*_with` 返回新值；
///   身份材料以 `Arc` 共享，复制代价恒定；
/// - **风险 (Trade-offs)**：回调不可序列化，持久化时只保存参数部分。
#[derive(Clone)]
pub struct SecurityParameters {
    parameters: ParameterSet,
    identities: Arc<Vec<Identity>>,
    private_keys: Arc<Vec<PrivateKey>>,
    pre_shared_keys: Arc<Vec<PreSharedKey>>,
    trust: Option<Arc<dyn TrustVerifier>>,
    challenge: Option<Arc<dyn ChallengeHandler>>,
}

impl Default for SecurityParameters {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SecurityParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityParameters")
            .field("parameters", &self.parameters)
            .field("identities", &self.identities.len())
            .field("private_keys", &self.private_keys.len())
            .field("pre_shared_keys", &self.pre_shared_keys.len())
            .field("trust_verifier", &self.trust.is_some())
            .field("challenge_handler", &self.challenge.is_some())
            .finish()
    }
}

impl SecurityParameters {
    pub fn new() -> Self {
        Self {
            parameters: ParameterSet::security(),
            identities: Arc::new(Vec::new()),
            private_keys: Arc::new(Vec::new()),
            pre_shared_keys: Arc::new(Vec::new()),
            trust: None,
            challenge: None,
        }
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    /// 以变换函数派生新的参数部分，身份材料与回调原样保留。
    pub fn map_parameters(&self, f: impl FnOnce(&ParameterSet) -> ParameterSet) -> Self {
        let mut next = self.clone();
        next.parameters = f(&self.parameters);
        next
    }

    pub fn with_parameters(&self, parameters: ParameterSet) -> Self {
        self.map_parameters(|_| parameters)
    }

    pub fn require_value(&self, id: ParameterId, value: impl Into<ParameterValue>) -> Self {
        self.map_parameters(|p| p.require_value(id, value))
    }

    pub fn prefer_value(&self, id: ParameterId, value: impl Into<ParameterValue>) -> Self {
        self.map_parameters(|p| p.prefer_value(id, value))
    }

    pub fn avoid_value(&self, id: ParameterId, value: impl Into<ParameterValue>) -> Self {
        self.map_parameters(|p| p.avoid_value(id, value))
    }

    pub fn prohibit_value(&self, id: ParameterId, value: impl Into<ParameterValue>) -> Self {
        self.map_parameters(|p| p.prohibit_value(id, value))
    }

    pub fn set(&self, id: ParameterId, value: impl Into<ParameterValue>) -> Result<Self> {
        let parameters = self.parameters.set(id, value)?;
        Ok(self.with_parameters(parameters))
    }

    pub fn get(&self, id: ParameterId) -> Option<ParameterValue> {
        self.parameters.get(id)
    }

    pub fn add_identity(&self, identity: Identity) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.identities).push(identity);
        next
    }

    pub fn add_private_key(&self, key: PrivateKey) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.private_keys).push(key);
        next
    }

    pub fn add_pre_shared_key(&self, key: impl Into<Bytes>, identity: impl Into<String>) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.pre_shared_keys).push(PreSharedKey {
            identity: identity.into(),
            key: key.into(),
        });
        next
    }

    pub fn verify_trust_with(&self, verifier: impl TrustVerifier + 'static) -> Self {
        let mut next = self.clone();
        next.trust = Some(Arc::new(verifier));
        next
    }

    pub fn handle_challenge_with(&self, handler: impl ChallengeHandler + 'static) -> Self {
        let mut next = self.clone();
        next.challenge = Some(Arc::new(handler));
        next
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn private_keys(&self) -> &[PrivateKey] {
        &self.private_keys
    }

    pub fn pre_shared_keys(&self) -> &[PreSharedKey] {
        &self.pre_shared_keys
    }

    pub fn has_trust_verifier(&self) -> bool {
        self.trust.is_some()
    }

    /// 供协议栈在握手中调用：未注册回调时默认信任。
    pub fn verify_trust(&self, metadata: &SecurityMetadata) -> Result<(), StackError> {
        let Some(verifier) = &self.trust else {
            return Ok(());
        };
        match verifier.verify(metadata) {
            Ok(true) => Ok(()),
            Ok(false) => Err(StackError::TrustVerificationFailed {
                detail: format!(
                    "peer {} rejected by trust verifier",
                    metadata
                        .peer
                        .map(|addr| addr.to_string())
                        .unwrap_or_else(|| "<unknown>".to_owned())
                ),
            }),
            Err(err) => Err(StackError::TrustVerificationFailed {
                detail: err.to_string(),
            }),
        }
    }

    /// 供协议栈在收到身份挑战时调用：未注册回调时视为无法应答。
    pub fn answer_challenge(&self, metadata: &SecurityMetadata) -> Result<bool, StackError> {
        match &self.challenge {
            Some(handler) => handler
                .handle(metadata)
                .map_err(|err: TapsError| StackError::TrustVerificationFailed {
                    detail: err.to_string(),
                }),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejecting_verifier_maps_to_trust_failure() {
        let params = SecurityParameters::new().verify_trust_with(|_: &SecurityMetadata| Ok(false));
        let err = params
            .verify_trust(&SecurityMetadata::default())
            .unwrap_err();
        assert!(matches!(err, StackError::TrustVerificationFailed { .. }));
    }

    #[test]
    fn builders_share_identity_material() {
        let base = SecurityParameters::new().add_pre_shared_key(&b"secret"[..], "client-a");
        let derived = base.prefer_value(ParameterId::Ciphersuite, 0x1301u64);
        assert_eq!(derived.pre_shared_keys().len(), 1);
        assert!(base.parameters().is_empty());
    }
}

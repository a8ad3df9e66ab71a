//! # candidate 模块说明
//!
//! ## 角色定位（Why）
//! - 把“应用想要什么”（端点描述 + 参数集）展开成“可以拨什么”（具体地址对 × 协议栈）；
//! - 协议栈能力预检在解析之前同步完成：没有任何协议栈能满足 Require 集合时，调用方立即得到
//!   `NoViableCandidates`，不发生任何网络 IO。
//!
//! ## 执行流程（How）
//! 1. [`prepare`]：校验端点描述、按层定稿参数、筛出能力满足的协议栈（纯同步）；
//! 2. [`generate`]：逐个描述调用解析器，将远端 × 本地 × 协议栈做笛卡尔积，地址族不一致的组合直接跳过；
//!    部分描述解析失败时只要还有别的描述产出候选就继续，全部失败才返回首个解析错误。

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tracing::debug;

use crate::endpoint::{ConcreteEndpoint, LocalSpecifier, RemoteSpecifier};
use crate::error::{Result, TapsError};
use crate::parameters::{
    Capabilities, FinalizedParameters, InterfaceKind, ParameterId, ParameterSet, PropertyScope,
    SecurityParameters,
};
use crate::resolver::Resolver;
use crate::stack::{ProtocolStack, StackRegistry};

/// 候选描述：一组互斥的备选之一。
#[derive(Clone, Debug, Default)]
pub struct CandidateSpecifier {
    pub remote: RemoteSpecifier,
    pub local: LocalSpecifier,
    pub transport: ParameterSet,
    pub security: SecurityParameters,
}

impl CandidateSpecifier {
    pub fn new(remote: RemoteSpecifier, transport: ParameterSet, security: SecurityParameters) -> Self {
        Self {
            remote,
            local: LocalSpecifier::new(),
            transport,
            security,
        }
    }

    pub fn with_local(mut self, local: LocalSpecifier) -> Self {
        self.local = local;
        self
    }
}

/// 解析完成的路径：端点对、协议栈与该路径实际提供的属性。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathDescriptor {
    pub remote: Option<ConcreteEndpoint>,
    pub local: Option<ConcreteEndpoint>,
    pub stack: Arc<str>,
    pub priority: u8,
    /// 协议栈能力 ∪ 路径属性。
    pub properties: Capabilities,
}

impl PathDescriptor {
    /// 远端是否为 IPv6；监听路径按本地地址判断。
    pub fn is_ipv6(&self) -> bool {
        self.remote
            .or(self.local)
            .map(|endpoint| endpoint.is_ipv6())
            .unwrap_or(false)
    }
}

impl fmt::Display for PathDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.stack)?;
        match self.local {
            Some(local) => write!(f, "{local}")?,
            None => f.write_str("*")?,
        }
        match self.remote {
            Some(remote) => write!(f, "->{remote}"),
            None => Ok(()),
        }
    }
}

/// 经过参数定稿与协议栈预检的描述。
#[derive(Clone)]
pub(crate) struct PreparedSpecifier {
    pub remote: RemoteSpecifier,
    pub local: LocalSpecifier,
    pub transport: Arc<FinalizedParameters>,
    pub security_parameters: Arc<FinalizedParameters>,
    pub security: SecurityParameters,
    pub stacks: Vec<Arc<dyn ProtocolStack>>,
}

/// 候选的用途。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Role {
    Dial,
    Listen,
}

/// 未经过滤排序的候选。
#[derive(Clone)]
pub struct RawCandidate {
    /// 枚举顺序，作为排序的最后一个平局裁决键。
    pub ordinal: usize,
    pub path: PathDescriptor,
    pub(crate) stack: Arc<dyn ProtocolStack>,
    pub(crate) transport: Arc<FinalizedParameters>,
    pub(crate) security_parameters: Arc<FinalizedParameters>,
    pub(crate) security: SecurityParameters,
}

impl fmt::Debug for RawCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawCandidate")
            .field("ordinal", &self.ordinal)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RawCandidate {
    pub fn transport(&self) -> &FinalizedParameters {
        &self.transport
    }

    pub fn security_parameters(&self) -> &FinalizedParameters {
        &self.security_parameters
    }
}

/// 同步准备阶段：端点校验、分层定稿与协议栈能力预检。
///
/// `layers` 为从宽到窄的上层参数（上下文默认值等），描述自身的参数集作为最窄层之前的一层，
/// `overrides` 作为最窄层。
pub(crate) fn prepare(
    specifier: &CandidateSpecifier,
    transport_defaults: &ParameterSet,
    security_defaults: &ParameterSet,
    overrides: Option<&ParameterSet>,
    registry: &StackRegistry,
    role: Role,
) -> Result<PreparedSpecifier> {
    match role {
        Role::Dial => specifier.remote.validate()?,
        Role::Listen if !specifier.remote.is_empty() => specifier.remote.validate()?,
        Role::Listen => {}
    }
    specifier.local.validate()?;

    let mut transport_layers = vec![transport_defaults, &specifier.transport];
    if let Some(overrides) = overrides {
        transport_layers.push(overrides);
    }
    let transport = ParameterSet::finalize_layers(&transport_layers)?;
    let security_parameters =
        ParameterSet::finalize_layers(&[security_defaults, specifier.security.parameters()])?;

    let stacks = registry
        .iter()
        .filter(|stack| {
            let caps = &stack.descriptor().capabilities;
            caps.meets_firm(&transport, PropertyScope::Stack).is_ok()
                && caps.meets_firm(&security_parameters, PropertyScope::Stack).is_ok()
        })
        .cloned()
        .collect();

    Ok(PreparedSpecifier {
        remote: specifier.remote.clone(),
        local: specifier.local.clone(),
        transport: Arc::new(transport),
        security_parameters: Arc::new(security_parameters),
        security: specifier.security.clone(),
        stacks,
    })
}

/// 全部描述都没有可用协议栈时的同步错误。
pub(crate) fn ensure_capable(prepared: &[PreparedSpecifier]) -> Result<()> {
    if prepared.iter().all(|spec| spec.stacks.is_empty()) {
        return Err(TapsError::NoViableCandidates {
            detail: "no registered protocol stack satisfies the required properties".into(),
        });
    }
    Ok(())
}

/// 异步生成阶段：解析并做笛卡尔积。
pub(crate) async fn generate(
    prepared: &[PreparedSpecifier],
    resolver: &dyn Resolver,
    role: Role,
) -> Result<Vec<RawCandidate>> {
    let mut candidates = Vec::new();
    let mut first_failure: Option<TapsError> = None;
    let mut resolved_any = false;

    for spec in prepared.iter().filter(|spec| !spec.stacks.is_empty()) {
        let locals = match resolver.resolve_local(&spec.local).await {
            Ok(locals) => locals,
            Err(err) => {
                debug!(error = %err, "local resolution failed");
                first_failure.get_or_insert(err);
                continue;
            }
        };
        let pairs: Vec<(Option<ConcreteEndpoint>, Option<ConcreteEndpoint>)> = match role {
            Role::Dial => {
                let remotes = match resolver.resolve_remote(&spec.remote).await {
                    Ok(remotes) => remotes,
                    Err(err) => {
                        debug!(error = %err, "remote resolution failed");
                        first_failure.get_or_insert(err);
                        continue;
                    }
                };
                dial_pairs(&remotes, &locals)
            }
            Role::Listen => listen_locals(locals)
                .into_iter()
                .map(|local| (None, Some(local)))
                .collect(),
        };
        resolved_any = true;

        for (remote, local) in pairs {
            for stack in &spec.stacks {
                let descriptor = stack.descriptor();
                let properties = descriptor.capabilities.union(&path_properties(remote, local));
                candidates.push(RawCandidate {
                    ordinal: candidates.len(),
                    path: PathDescriptor {
                        remote,
                        local,
                        stack: descriptor.name.clone(),
                        priority: descriptor.priority,
                        properties,
                    },
                    stack: stack.clone(),
                    transport: spec.transport.clone(),
                    security_parameters: spec.security_parameters.clone(),
                    security: spec.security.clone(),
                });
            }
        }
    }

    if !resolved_any && let Some(err) = first_failure {
        return Err(err);
    }
    debug!(count = candidates.len(), "raw candidates generated");
    Ok(candidates)
}

fn dial_pairs(
    remotes: &[ConcreteEndpoint],
    locals: &[ConcreteEndpoint],
) -> Vec<(Option<ConcreteEndpoint>, Option<ConcreteEndpoint>)> {
    let mut pairs = Vec::new();
    for remote in remotes {
        if locals.is_empty() {
            pairs.push((Some(*remote), None));
            continue;
        }
        for local in locals {
            if local.addr.is_ipv6() == remote.addr.is_ipv6() {
                pairs.push((Some(*remote), Some(*local)));
            }
        }
    }
    pairs
}

fn listen_locals(locals: Vec<ConcreteEndpoint>) -> Vec<ConcreteEndpoint> {
    if !locals.is_empty() {
        return locals;
    }
    vec![
        ConcreteEndpoint::new(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)),
        ConcreteEndpoint::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
    ]
}

fn path_properties(remote: Option<ConcreteEndpoint>, local: Option<ConcreteEndpoint>) -> Capabilities {
    let interface = local.and_then(|local| local.interface).or_else(|| {
        match (remote, local) {
            (Some(remote), None) if remote.addr.ip().is_loopback() => Some(InterfaceKind::Loopback),
            _ => None,
        }
    });
    match interface {
        Some(kind) => Capabilities::new().with(ParameterId::InterfaceType, kind),
        None => Capabilities::new(),
    }
}

/// 被动接入后按实际端点重算路径：本地接口未知时，回环对端意味着回环接口。
pub(crate) fn accepted_path(
    mut candidate: RawCandidate,
    remote: ConcreteEndpoint,
    local: ConcreteEndpoint,
) -> RawCandidate {
    let interface = local
        .interface
        .or(remote.interface)
        .or_else(|| remote.addr.ip().is_loopback().then_some(InterfaceKind::Loopback));
    let observed = match interface {
        Some(kind) => Capabilities::new().with(ParameterId::InterfaceType, kind),
        None => Capabilities::new(),
    };
    candidate.path.properties = candidate.stack.descriptor().capabilities.union(&observed);
    candidate.path.remote = Some(remote);
    candidate.path.local = Some(local);
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;
    use crate::test_stubs::MockStack;

    fn registry() -> StackRegistry {
        StackRegistry::new()
            .with(MockStack::reliable("tcp", 1).into_dyn())
            .with(MockStack::unreliable("udp", 2).into_dyn())
    }

    #[test]
    fn required_capabilities_prune_stacks_before_resolution() {
        let spec = CandidateSpecifier::new(
            RemoteSpecifier::new().with_hostname("localhost").with_port(80),
            ParameterSet::transport().require(ParameterId::FullyReliable),
            SecurityParameters::new(),
        );
        let prepared = prepare(
            &spec,
            &ParameterSet::transport(),
            &ParameterSet::security(),
            None,
            &registry(),
            Role::Dial,
        )
        .expect("prepare");
        let names: Vec<_> = prepared
            .stacks
            .iter()
            .map(|s| s.descriptor().name.to_string())
            .collect();
        assert_eq!(names, vec!["tcp"]);
    }

    #[test]
    fn impossible_requirements_fail_synchronously() {
        let spec = CandidateSpecifier::new(
            RemoteSpecifier::new().with_hostname("localhost").with_port(80),
            ParameterSet::transport().require(ParameterId::Multistreaming),
            SecurityParameters::new(),
        );
        let prepared = prepare(
            &spec,
            &ParameterSet::transport(),
            &ParameterSet::security(),
            None,
            &registry(),
            Role::Dial,
        )
        .expect("prepare");
        let err = ensure_capable(&[prepared]).unwrap_err();
        assert_eq!(err.code(), "spark.taps.no_viable_candidates");
    }

    #[tokio::test]
    async fn cross_product_skips_family_mismatch() {
        let spec = CandidateSpecifier::new(
            RemoteSpecifier::new().with_hostname("localhost").with_port(80),
            ParameterSet::transport(),
            SecurityParameters::new(),
        )
        .with_local(LocalSpecifier::new().with_address(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let prepared = prepare(
            &spec,
            &ParameterSet::transport(),
            &ParameterSet::security(),
            None,
            &registry(),
            Role::Dial,
        )
        .expect("prepare");
        let candidates = generate(&[prepared], &StaticResolver::new(), Role::Dial)
            .await
            .expect("generate");
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| !c.path.is_ipv6()));
        assert_eq!(candidates[0].ordinal, 0);
        assert_eq!(candidates[1].ordinal, 1);
    }

    #[tokio::test]
    async fn resolution_failure_surfaces_when_nothing_resolves() {
        let spec = CandidateSpecifier::new(
            RemoteSpecifier::new().with_hostname("missing.invalid").with_port(80),
            ParameterSet::transport(),
            SecurityParameters::new(),
        );
        let prepared = prepare(
            &spec,
            &ParameterSet::transport(),
            &ParameterSet::security(),
            None,
            &registry(),
            Role::Dial,
        )
        .expect("prepare");
        let err = generate(&[prepared], &StaticResolver::new(), Role::Dial)
            .await
            .unwrap_err();
        assert!(matches!(err, TapsError::ResolutionFailure { .. }));
    }
}

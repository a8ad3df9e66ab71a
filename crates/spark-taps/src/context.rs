//! # context 模块说明
//!
//! ## 角色定位（Why）
//! - [`TransportContext`] 是应用的入口：持有协议栈注册表、解析器、引擎配置与各类默认值，
//!   并作为预连接、参数集合与端点描述的工厂；
//! - 上下文本身不持有任何连接，连接与监听器由各自的后台任务驱动。
//!
//! ## 并发（How）
//! - 运行期共享部分收拢在 [`Engine`] 中，以 `Arc` 交给连接与监听器；
//! - 默认值存放在 `RwLock` 中，预连接创建时拍下快照，之后修改默认值不影响已创建的预连接。

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::info;

use crate::candidate::CandidateSpecifier;
use crate::config::EstablishmentConfig;
use crate::connection::{Connection, Seed};
use crate::endpoint::{LocalSpecifier, RemoteSpecifier};
use crate::error::{Result, TapsError};
use crate::event::{EventHandler, IgnoreEvents};
use crate::framing::{FramingHandler, LengthPrefixFraming};
use crate::listener::Listener;
use crate::message::SendParameters;
use crate::parameters::{ParameterSet, SecurityParameters};
use crate::persistence::{self, ContextState, JsonPersistence, Persistence};
use crate::preconnection::Preconnection;
use crate::resolver::{Resolver, StaticResolver};
use crate::stack::{ProtocolStack, StackRegistry};

/// 连接与监听器共享的运行期部件。
pub(crate) struct Engine {
    pub config: EstablishmentConfig,
    pub stacks: StackRegistry,
    pub resolver: Arc<dyn Resolver>,
    pub runtime: Handle,
    next_connection: AtomicU64,
    next_listener: AtomicU64,
}

impl Engine {
    fn new(
        config: EstablishmentConfig,
        stacks: StackRegistry,
        resolver: Arc<dyn Resolver>,
        runtime: Handle,
    ) -> Self {
        Self {
            config,
            stacks,
            resolver,
            runtime,
            next_connection: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_listener_id(&self) -> u64 {
        self.next_listener.fetch_add(1, Ordering::Relaxed)
    }
}

/// 预连接创建时拍下的默认值。
#[derive(Clone)]
pub(crate) struct Defaults {
    pub transport: ParameterSet,
    pub security: ParameterSet,
    pub send: SendParameters,
    pub handler: Arc<dyn EventHandler>,
    pub framing: Arc<dyn FramingHandler>,
}

impl Defaults {
    pub fn seed(&self, engine: &Arc<Engine>) -> Seed {
        Seed {
            engine: engine.clone(),
            handler: self.handler.clone(),
            framing: self.framing.clone(),
            send_defaults: self.send.clone(),
        }
    }
}

/// 传输服务上下文。
///
/// # 教案式说明
/// - **意图 (Why)**：把“注册了哪些协议栈、如何解析名字、默认偏好是什么”集中在一个可克隆的句柄里；
/// - **契约 (What)**：
///   - 默认参数在设置时即完成定稿校验，冲突同步返回 `ConfigurationConflict`；
///   - `save`/`restore` 只处理配置类状态，见 [`crate::persistence`]；
///   - `restore` 会以新配置重建引擎，已存在的连接继续使用旧引擎直至结束；
/// - **风险 (Trade-offs)**：克隆的上下文共享默认值，一处修改处处可见。
#[derive(Clone)]
pub struct TransportContext {
    engine: Arc<RwLock<Arc<Engine>>>,
    defaults: Arc<RwLock<Defaults>>,
    persistence: Arc<dyn Persistence>,
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engine = self.engine.read();
        f.debug_struct("TransportContext")
            .field("config", &engine.config)
            .field("stacks", &engine.stacks)
            .finish_non_exhaustive()
    }
}

impl TransportContext {
    pub fn builder() -> TransportContextBuilder {
        TransportContextBuilder::default()
    }

    pub(crate) fn engine(&self) -> Arc<Engine> {
        self.engine.read().clone()
    }

    pub(crate) fn defaults(&self) -> Defaults {
        self.defaults.read().clone()
    }

    pub fn config(&self) -> EstablishmentConfig {
        self.engine.read().config.clone()
    }

    /// 以上下文默认值为起点的传输参数集合。
    pub fn new_transport_parameters(&self) -> ParameterSet {
        self.defaults.read().transport.clone()
    }

    /// 空的安全参数，偏好从上下文默认值开始。
    pub fn new_security_parameters(&self) -> SecurityParameters {
        let defaults = self.defaults.read().security.clone();
        SecurityParameters::new().with_parameters(defaults)
    }

    pub fn new_remote(&self) -> RemoteSpecifier {
        RemoteSpecifier::new()
    }

    pub fn new_local(&self) -> LocalSpecifier {
        LocalSpecifier::new()
    }

    pub fn transport_defaults(&self) -> ParameterSet {
        self.defaults.read().transport.clone()
    }

    /// 替换传输默认参数；集合自身冲突时同步报错且不生效。
    pub fn set_transport_defaults(&self, defaults: ParameterSet) -> Result<()> {
        defaults.finalize()?;
        self.defaults.write().transport = defaults;
        Ok(())
    }

    pub fn security_defaults(&self) -> ParameterSet {
        self.defaults.read().security.clone()
    }

    pub fn set_security_defaults(&self, defaults: ParameterSet) -> Result<()> {
        defaults.finalize()?;
        self.defaults.write().security = defaults;
        Ok(())
    }

    pub fn default_send_parameters(&self) -> SendParameters {
        self.defaults.read().send.clone()
    }

    pub fn set_default_send_parameters(&self, parameters: SendParameters) {
        self.defaults.write().send = parameters;
    }

    pub fn event_handler(&self) -> Arc<dyn EventHandler> {
        self.defaults.read().handler.clone()
    }

    /// 设置之后创建的预连接所用的事件处理器。
    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.defaults.write().handler = handler;
    }

    pub fn framing_handler(&self) -> Arc<dyn FramingHandler> {
        self.defaults.read().framing.clone()
    }

    pub fn set_framing_handler(&self, framing: Arc<dyn FramingHandler>) {
        self.defaults.write().framing = framing;
    }

    /// 创建预连接；默认值在此刻拍下快照。
    pub fn preconnect(&self, specifiers: Vec<CandidateSpecifier>) -> Preconnection {
        Preconnection::new(self.engine(), self.defaults(), specifiers)
    }

    /// 单个描述的主动连接快捷方式。
    pub fn initiate(&self, specifier: CandidateSpecifier) -> Result<Connection> {
        self.preconnect(vec![specifier]).initiate()
    }

    pub fn rendezvous(&self, specifier: CandidateSpecifier) -> Result<Connection> {
        self.preconnect(vec![specifier]).rendezvous()
    }

    pub fn listen(&self, specifier: CandidateSpecifier) -> Result<Listener> {
        self.preconnect(vec![specifier]).listen()
    }

    /// 导出当前可持久化状态。
    pub fn state(&self) -> ContextState {
        let defaults = self.defaults.read();
        ContextState {
            config: self.config(),
            transport_defaults: defaults.transport.snapshot(),
            security_defaults: defaults.security.snapshot(),
            send_defaults: defaults.send.clone(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.persistence.save(&self.state())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let blob = self.serialize()?;
        persistence::write_file(path.as_ref(), &blob)?;
        info!(path = %path.as_ref().display(), "transport context saved");
        Ok(())
    }

    /// 从字节恢复状态；任一部分校验失败时整体不生效。
    pub fn restore_from(&self, blob: &[u8]) -> Result<()> {
        let state = self.persistence.restore(blob)?;
        self.apply(state)
    }

    pub fn restore(&self, path: impl AsRef<Path>) -> Result<()> {
        let blob = persistence::read_file(path.as_ref())?;
        self.restore_from(&blob)?;
        info!(path = %path.as_ref().display(), "transport context restored");
        Ok(())
    }

    fn apply(&self, state: ContextState) -> Result<()> {
        state.config.validate()?;
        let transport = ParameterSet::from_snapshot(state.transport_defaults)?;
        let security = ParameterSet::from_snapshot(state.security_defaults)?;
        transport.finalize()?;
        security.finalize()?;

        let mut engine = self.engine.write();
        *engine = Arc::new(Engine::new(
            state.config,
            engine.stacks.clone(),
            engine.resolver.clone(),
            engine.runtime.clone(),
        ));
        let mut defaults = self.defaults.write();
        defaults.transport = transport;
        defaults.security = security;
        defaults.send = state.send_defaults;
        Ok(())
    }
}

/// 上下文构建器。
#[derive(Default)]
pub struct TransportContextBuilder {
    config: EstablishmentConfig,
    stacks: StackRegistry,
    resolver: Option<Arc<dyn Resolver>>,
    handler: Option<Arc<dyn EventHandler>>,
    framing: Option<Arc<dyn FramingHandler>>,
    runtime: Option<Handle>,
    persistence: Option<Arc<dyn Persistence>>,
    transport_defaults: Option<ParameterSet>,
    security_defaults: Option<ParameterSet>,
    send_defaults: SendParameters,
}

impl TransportContextBuilder {
    pub fn config(mut self, config: EstablishmentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stack(mut self, stack: Arc<dyn ProtocolStack>) -> Self {
        self.stacks.register(stack);
        self
    }

    pub fn stacks(mut self, stacks: StackRegistry) -> Self {
        self.stacks = stacks;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn framing_handler(mut self, framing: Arc<dyn FramingHandler>) -> Self {
        self.framing = Some(framing);
        self
    }

    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn transport_defaults(mut self, defaults: ParameterSet) -> Self {
        self.transport_defaults = Some(defaults);
        self
    }

    pub fn security_defaults(mut self, defaults: ParameterSet) -> Self {
        self.security_defaults = Some(defaults);
        self
    }

    pub fn send_defaults(mut self, parameters: SendParameters) -> Self {
        self.send_defaults = parameters;
        self
    }

    /// 校验配置与默认参数并构建上下文；未指定运行时时取当前 Tokio 运行时。
    pub fn build(self) -> Result<TransportContext> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| TapsError::NoRuntime)?,
        };
        let transport = self.transport_defaults.unwrap_or_else(ParameterSet::transport);
        let security = self.security_defaults.unwrap_or_else(ParameterSet::security);
        transport.finalize()?;
        security.finalize()?;

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(StaticResolver::new()));
        let engine = Engine::new(self.config, self.stacks, resolver, runtime);
        Ok(TransportContext {
            engine: Arc::new(RwLock::new(Arc::new(engine))),
            defaults: Arc::new(RwLock::new(Defaults {
                transport,
                security,
                send: self.send_defaults,
                handler: self.handler.unwrap_or_else(|| Arc::new(IgnoreEvents)),
                framing: self
                    .framing
                    .unwrap_or_else(|| Arc::new(LengthPrefixFraming::default())),
            })),
            persistence: self
                .persistence
                .unwrap_or_else(|| Arc::new(JsonPersistence::default())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::ParameterId;

    #[tokio::test]
    async fn conflicting_defaults_are_rejected_synchronously() {
        let context = TransportContext::builder().build().expect("context");
        let conflicting = ParameterSet::transport()
            .require(ParameterId::FullyReliable)
            .prohibit(ParameterId::FullyReliable);
        let err = context
            .set_transport_defaults(conflicting)
            .expect_err("conflict");
        assert_eq!(err.code(), "spark.taps.configuration_conflict");
        assert!(context.transport_defaults().is_empty());
    }

    #[test]
    fn building_outside_a_runtime_fails() {
        let err = TransportContext::builder().build().expect_err("no runtime");
        assert_eq!(err, TapsError::NoRuntime);
    }

    #[tokio::test]
    async fn restore_replaces_config_and_defaults() {
        let source = TransportContext::builder()
            .config(EstablishmentConfig::default().with_max_concurrent_attempts(2))
            .transport_defaults(ParameterSet::transport().prefer(ParameterId::Multistreaming))
            .build()
            .expect("source");
        let blob = source.serialize().expect("serialize");

        let target = TransportContext::builder().build().expect("target");
        target.restore_from(&blob).expect("restore");
        assert_eq!(target.config().max_concurrent_attempts, 2);
        assert_eq!(target.state(), source.state());
    }

    #[tokio::test]
    async fn invalid_restored_config_leaves_context_untouched() {
        let context = TransportContext::builder().build().expect("context");
        let mut state = context.state();
        state.config.max_concurrent_attempts = 0;
        let blob = JsonPersistence::default().save(&state).expect("save");
        assert!(context.restore_from(&blob).is_err());
        assert_eq!(context.config(), EstablishmentConfig::default());
    }
}

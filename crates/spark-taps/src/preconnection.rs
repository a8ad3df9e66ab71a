//! 预连接：批量候选描述与建立调用族。
//!
//! 同步阶段只做本地可判定的检查（端点格式、参数冲突、协议栈能力），通过后立刻返回句柄；
//! 解析、拨号与失败一律交给后台任务并以事件报告。

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::candidate::{self, CandidateSpecifier, PreparedSpecifier, Role};
use crate::context::{Defaults, Engine};
use crate::connection::{Connection, Plan};
use crate::error::{Result, TapsError};
use crate::listener::Listener;
use crate::message::{MessageRef, OutboundMessage};
use crate::parameters::ParameterSet;

/// 一组互斥的候选描述，以及建立期间随拨号发送的 0-RTT 消息。
///
/// # 教案式说明
/// - **意图 (Why)**：同一目标可能有多种到达方式（不同端口、不同协议栈偏好），预连接把它们合并为
///   一次竞速；
/// - **契约 (What)**：
///   - 上下文默认值在创建时拍下快照；
///   - `initial_send` 返回的引用与建立后连接上的引用一致，消息被强制标记为幂等；
///   - 可克隆，克隆体可以独立地再次 `initiate`；
/// - **风险 (Trade-offs)**：0-RTT 数据可能被多个竞速候选各发送一次，接收方必须容忍重复。
#[derive(Clone)]
pub struct Preconnection {
    engine: Arc<Engine>,
    defaults: Defaults,
    specifiers: Vec<CandidateSpecifier>,
    initial: Vec<OutboundMessage>,
}

impl fmt::Debug for Preconnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preconnection")
            .field("specifiers", &self.specifiers.len())
            .field("initial", &self.initial.len())
            .finish()
    }
}

impl Preconnection {
    pub(crate) fn new(engine: Arc<Engine>, defaults: Defaults, specifiers: Vec<CandidateSpecifier>) -> Self {
        Self {
            engine,
            defaults,
            specifiers,
            initial: Vec::new(),
        }
    }

    pub fn add_specifier(&mut self, specifier: CandidateSpecifier) {
        self.specifiers.push(specifier);
    }

    pub fn specifiers(&self) -> &[CandidateSpecifier] {
        &self.specifiers
    }

    /// 登记一条 0-RTT 消息。
    pub fn initial_send(&mut self, message: OutboundMessage) -> MessageRef {
        let reference = MessageRef::new(self.initial.len() as u64);
        self.initial.push(message.force_idempotent());
        reference
    }

    /// 主动建立连接。
    pub fn initiate(&self) -> Result<Connection> {
        self.establish(None, false)
    }

    /// 带调用级参数覆盖的主动建立；覆盖层是最窄的一层，不能放宽上层的强约束。
    pub fn initiate_with(&self, overrides: &ParameterSet) -> Result<Connection> {
        self.establish(Some(overrides), false)
    }

    /// 同时拨号与在本地候选上等待入站，先成功的路径胜出。
    pub fn rendezvous(&self) -> Result<Connection> {
        self.establish(None, true)
    }

    /// 在全部可用本地候选上监听。
    pub fn listen(&self) -> Result<Listener> {
        let prepared = self.prepare(None, Role::Listen)?;
        Ok(Listener::start(self.engine.clone(), &self.defaults, prepared))
    }

    fn prepare(&self, overrides: Option<&ParameterSet>, role: Role) -> Result<Vec<PreparedSpecifier>> {
        if self.specifiers.is_empty() {
            return Err(TapsError::malformed("preconnection holds no candidate specifier"));
        }
        let prepared = self
            .specifiers
            .iter()
            .map(|spec| {
                candidate::prepare(
                    spec,
                    &self.defaults.transport,
                    &self.defaults.security,
                    overrides,
                    &self.engine.stacks,
                    role,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        candidate::ensure_capable(&prepared)?;
        Ok(prepared)
    }

    fn establish(&self, overrides: Option<&ParameterSet>, rendezvous: bool) -> Result<Connection> {
        let prepared = self.prepare(overrides, Role::Dial)?;
        let transport = prepared
            .first()
            .map(|spec| spec.transport.clone())
            .unwrap_or_default();
        let connection = Connection::new(self.defaults.seed(&self.engine), None, transport);
        let early = connection.submit_early(&self.initial)?;
        debug!(
            connection = connection.id().get(),
            specifiers = prepared.len(),
            early = early.len(),
            rendezvous,
            "establishment scheduled"
        );
        let plan = if rendezvous {
            Plan::Rendezvous { prepared, early }
        } else {
            Plan::Dial { prepared, early }
        };
        connection.start(plan);
        Ok(connection)
    }
}

#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = r#"
# spark-taps

## 设计动机（Why）
- **定位**：Transport Services 风格的连接建立引擎。应用只描述“想要什么”（端点与传输偏好），
  引擎负责“怎么到达”：候选生成、约束过滤与偏好排序、错峰竞速建连，以及建立后的消息调度与事件分发。
- **架构角色**：位于应用与具体协议栈之间。真实网络 IO 由实现 [`ProtocolStack`] 的外部协议栈完成，
  名字解析由 [`Resolver`] 完成，本 crate 只编排它们。

## 核心契约（What）
- **同步与异步分离**：本地即可判定的问题（参数冲突、端点格式、前驱引用）由调用同步返回；
  一切依赖网络时序的结果（解析失败、拨号失败、消息过期、建立后的错误）只经由 [`EventHandler`] 投递；
- **事件保证**：每条连接恰好一个 Ready 且先于其余事件；恰好一个终止事件（Closed，或建立失败时的
  连接级 Error），此后不再投递；处理器在无锁状态下被调用，可在回调内重入任何 API；
- **竞速**：第一个候选立即拨号，之后每隔错峰延迟启动下一个（在途尝试失败时立即启动），
  首个成功者胜出，其余尝试被协作式取消。

## 实现策略（How）
- 参数集合是持久化值类型，`require`/`prefer` 等操作返回新集合；分层在定稿时一次性合并并检测冲突；
- 每条连接一个驱动任务（竞速 → 晋升 → 发送循环）、一个接收任务与一个事件投递任务；
- 发送队列是消息引用竞技场，前驱关系在提交时做可达性扫描，成环即拒绝。

## 风险与考量（Trade-offs）
- 0-RTT 数据会随每个支持早期数据的候选各发送一次，接收方必须容忍重复；
- Rendezvous 每次调用只产生一条连接，拨出与接入谁先成功谁胜出。
"#]

mod cancel;
mod candidate;
mod config;
mod connection;
mod context;
mod endpoint;
mod error;
mod event;
mod framing;
mod listener;
mod message;
pub mod parameters;
mod persistence;
mod preconnection;
mod racer;
mod ranker;
mod resolver;
mod scheduler;
mod stack;
pub mod test_stubs;

pub use cancel::Cancellation;
pub use candidate::{CandidateSpecifier, PathDescriptor, RawCandidate};
pub use config::EstablishmentConfig;
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use context::{TransportContext, TransportContextBuilder};
pub use endpoint::{
    ConcreteEndpoint, EndpointAlternative, EndpointRole, EndpointSpecifier, Local, LocalSpecifier, Remote,
    RemoteSpecifier, well_known_port,
};
pub use error::{AttemptFailure, ErrorCategory, Result, StackError, TapsError};
pub use event::{Antecedent, Event, EventHandler, EventKind, IgnoreEvents};
pub use framing::{FramingHandler, LengthPrefixFraming};
pub use listener::{Listener, ListenerId};
pub use message::{InboundMessage, MessageRef, OutboundMessage, PartialDelivery, SendParameters};
pub use parameters::{
    FinalizedParameters, ParameterId, ParameterSet, ParameterValue, Preference, SecurityParameters,
};
pub use persistence::{ContextState, JsonPersistence, Persistence};
pub use preconnection::Preconnection;
pub use ranker::{Verdict, evaluate, filter_and_rank};
pub use resolver::{Resolver, StaticResolver};
pub use stack::{
    AcceptedFlow, DialOutcome, DialRequest, EarlyData, Flow, FlowListener, ListenRequest,
    OutboundFrame, ProtocolStack, StackDescriptor, StackRegistry,
};

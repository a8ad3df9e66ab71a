//! # event 模块说明
//!
//! ## 角色定位（Why）
//! - 连接生命周期完全通过事件驱动：Ready / Sent / Expired / Error / Closed；
//! - 处理器可能在回调中重入 API（在 Ready 里 `send`、在 Sent 里 `close`），因此回调绝不能在持有
//!   连接、队列或分发器内部锁的情况下执行。
//!
//! ## 执行机制（How）
//! - 事件先经过“闸门”（[`Gate`]，`parking_lot::Mutex` 保护）判定是否允许投递，再写入无界通道；
//!   闸门与入队在同一临界区内完成，因此通道顺序即判定顺序；
//! - 每条连接一个投递任务，从通道取出事件后在无锁状态下调用处理器；
//! - 处理器存放在 `ArcSwap` 中，可随时替换，投递时取最新值。
//!
//! ## 投递保证（What）
//! - 每条连接恰好一个 Ready，且先于任何 Sent/Expired/Closed；
//! - 恰好一个终止事件（Closed，或建立失败时的连接级 Error），之后不再投递任何事件；
//! - 建立失败的连接不会收到 Ready：先收到每条待发消息的 Error，再收到一个连接级 Error。

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::warn;

use crate::connection::Connection;
use crate::error::TapsError;
use crate::listener::Listener;
use crate::message::MessageRef;

/// 应用事件处理器；每个方法默认忽略事件。
#[allow(unused_variables)]
pub trait EventHandler: Send + Sync + 'static {
    fn ready(&self, connection: &Connection, antecedent: Option<&Antecedent>) {}

    fn sent(&self, connection: &Connection, message: MessageRef) {}

    fn expired(&self, connection: &Connection, message: MessageRef) {}

    fn error(&self, connection: &Connection, message: Option<MessageRef>, error: &TapsError) {}

    fn closed(&self, connection: &Connection, error: Option<&TapsError>) {}

    fn listener_error(&self, listener: &Listener, error: &TapsError) {}

    fn listener_stopped(&self, listener: &Listener) {}
}

/// 什么都不做的处理器，作为上下文的默认值。
#[derive(Clone, Copy, Debug, Default)]
pub struct IgnoreEvents;

impl EventHandler for IgnoreEvents {}

/// 连接的来历：接入它的监听器，或克隆它的源连接。
#[derive(Clone, Debug)]
pub enum Antecedent {
    Listener(Listener),
    Connection(Connection),
}

/// 事件种类。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    Ready,
    Sent,
    Expired,
    Error,
    Closed,
    ListenerError,
    ListenerStopped,
}

/// 一条事件及其负载。
#[derive(Clone, Debug)]
pub enum Event {
    Ready {
        connection: Connection,
        antecedent: Option<Antecedent>,
    },
    Sent {
        connection: Connection,
        message: MessageRef,
    },
    Expired {
        connection: Connection,
        message: MessageRef,
    },
    Error {
        connection: Connection,
        message: Option<MessageRef>,
        error: TapsError,
    },
    Closed {
        connection: Connection,
        error: Option<TapsError>,
    },
    ListenerError {
        listener: Listener,
        error: TapsError,
    },
    ListenerStopped {
        listener: Listener,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Ready { .. } => EventKind::Ready,
            Event::Sent { .. } => EventKind::Sent,
            Event::Expired { .. } => EventKind::Expired,
            Event::Error { .. } => EventKind::Error,
            Event::Closed { .. } => EventKind::Closed,
            Event::ListenerError { .. } => EventKind::ListenerError,
            Event::ListenerStopped { .. } => EventKind::ListenerStopped,
        }
    }

    pub fn connection(&self) -> Option<&Connection> {
        match self {
            Event::Ready { connection, .. }
            | Event::Sent { connection, .. }
            | Event::Expired { connection, .. }
            | Event::Error { connection, .. }
            | Event::Closed { connection, .. } => Some(connection),
            Event::ListenerError { .. } | Event::ListenerStopped { .. } => None,
        }
    }

    pub fn message(&self) -> Option<MessageRef> {
        match self {
            Event::Sent { message, .. } | Event::Expired { message, .. } => Some(*message),
            Event::Error { message, .. } => *message,
            _ => None,
        }
    }

    /// 在无锁状态下调用处理器对应的方法。
    pub fn dispatch_to(&self, handler: &dyn EventHandler) {
        match self {
            Event::Ready {
                connection,
                antecedent,
            } => handler.ready(connection, antecedent.as_ref()),
            Event::Sent {
                connection,
                message,
            } => handler.sent(connection, *message),
            Event::Expired {
                connection,
                message,
            } => handler.expired(connection, *message),
            Event::Error {
                connection,
                message,
                error,
            } => handler.error(connection, *message, error),
            Event::Closed { connection, error } => handler.closed(connection, error.as_ref()),
            Event::ListenerError { listener, error } => handler.listener_error(listener, error),
            Event::ListenerStopped { listener } => handler.listener_stopped(listener),
        }
    }
}

/// 可原子替换的处理器槽位。
pub(crate) struct HandlerSlot(pub Arc<dyn EventHandler>);

pub(crate) type SharedHandler = Arc<ArcSwap<HandlerSlot>>;

pub(crate) fn shared_handler(handler: Arc<dyn EventHandler>) -> SharedHandler {
    Arc::new(ArcSwap::from_pointee(HandlerSlot(handler)))
}

/// 单连接的投递闸门。
#[derive(Debug, Default)]
struct Gate {
    ready: bool,
    terminated: bool,
}

/// 闸门判定结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Admission {
    Deliver { terminal: bool },
    Drop(&'static str),
}

impl Gate {
    fn admit(&mut self, kind: EventKind, has_message: bool) -> Admission {
        if self.terminated {
            return Admission::Drop("connection already terminated");
        }
        match kind {
            EventKind::Ready if self.ready => Admission::Drop("duplicate ready"),
            EventKind::Ready => {
                self.ready = true;
                Admission::Deliver { terminal: false }
            }
            EventKind::Sent | EventKind::Expired if !self.ready => {
                Admission::Drop("message event before ready")
            }
            EventKind::Error if !self.ready && !has_message => {
                self.terminated = true;
                Admission::Deliver { terminal: true }
            }
            EventKind::Closed if !self.ready => Admission::Drop("closed before ready"),
            EventKind::Closed => {
                self.terminated = true;
                Admission::Deliver { terminal: true }
            }
            _ => Admission::Deliver { terminal: false },
        }
    }
}

/// 单连接事件分发器。
pub(crate) struct Dispatcher {
    gate: Mutex<Gate>,
    tx: mpsc::UnboundedSender<(Event, bool)>,
    handler: SharedHandler,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("gate", &*self.gate.lock())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn spawn(runtime: &Handle, handler: Arc<dyn EventHandler>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = shared_handler(handler);
        runtime.spawn(deliver(rx, handler.clone()));
        Self {
            gate: Mutex::new(Gate::default()),
            tx,
            handler,
        }
    }

    pub fn handler(&self) -> Arc<dyn EventHandler> {
        self.handler.load().0.clone()
    }

    pub fn set_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handler.store(Arc::new(HandlerSlot(handler)));
    }

    /// 判定并入队；返回事件是否会被投递。
    pub fn emit(&self, event: Event) -> bool {
        let mut gate = self.gate.lock();
        match gate.admit(event.kind(), event.message().is_some()) {
            Admission::Deliver { terminal } => self.tx.send((event, terminal)).is_ok(),
            Admission::Drop(reason) => {
                warn!(
                    connection = event.connection().map(|c| c.id().get()),
                    kind = ?event.kind(),
                    reason,
                    "event dropped"
                );
                false
            }
        }
    }
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<(Event, bool)>, handler: SharedHandler) {
    while let Some((event, terminal)) = rx.recv().await {
        let current = handler.load_full();
        event.dispatch_to(current.0.as_ref());
        if terminal {
            break;
        }
    }
}

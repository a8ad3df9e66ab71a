//! 测试替身：脚本化协议栈与记录型事件处理器。
//!
//! 这些类型不做任何真实 IO，供单元测试、集成测试与下游协议栈的契约测试复用。
//! 配合 `#[tokio::test(start_paused = true)]` 使用时，脚本里的延迟在虚拟时间中精确成立。

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use crate::cancel::Cancellation;
use crate::connection::Connection;
use crate::endpoint::ConcreteEndpoint;
use crate::error::{StackError, TapsError};
use crate::event::{Antecedent, Event, EventHandler, EventKind};
use crate::listener::Listener;
use crate::message::MessageRef;
use crate::parameters::{Capabilities, ParameterId, SecurityMetadata};
use crate::stack::{
    AcceptedFlow, DialOutcome, DialRequest, Flow, FlowListener, ListenRequest, OutboundFrame,
    ProtocolStack, StackDescriptor,
};

pub use crate::resolver::StaticResolver;

/// 单个远端地址的拨号脚本。
#[derive(Clone, Debug)]
pub enum Script {
    /// 经过 `after` 后握手成功。
    Succeed { after: Duration },
    /// 经过 `after` 后失败。
    Fail { after: Duration, error: StackError },
    /// 永不完成，只能被取消。
    Hang,
}

impl Script {
    pub fn succeed_after(millis: u64) -> Self {
        Script::Succeed {
            after: Duration::from_millis(millis),
        }
    }

    pub fn refuse_after(millis: u64) -> Self {
        Script::Fail {
            after: Duration::from_millis(millis),
            error: StackError::Refused {
                peer: "scripted".into(),
            },
        }
    }
}

#[derive(Default)]
struct MockLog {
    dials: Vec<SocketAddr>,
    cancellations: Vec<SocketAddr>,
    flows: Vec<(SocketAddr, Arc<MockFlow>)>,
    early_data: Vec<(SocketAddr, Vec<(MessageRef, Bytes)>)>,
    listeners: Vec<Arc<MockListener>>,
}

struct MockState {
    scripts: Mutex<HashMap<SocketAddr, Script>>,
    fallback: Mutex<Script>,
    log: Mutex<MockLog>,
    notify: Notify,
    next_port: AtomicU16,
}

/// 脚本化协议栈。
///
/// # 教案式说明
/// - **意图 (Why)**：竞速、0-RTT 与调度的时序性质需要可控的拨号结果与延迟；
/// - **契约 (What)**：
///   - 每个远端地址一条 [`Script`]，未登记的地址使用兜底脚本（默认立即成功）；
///   - 记录拨号起点、被取消的尝试、建立出的数据流与随拨号携带的早期数据；
///   - 克隆体共享全部状态，便于注册后继续观察。
#[derive(Clone)]
pub struct MockStack {
    descriptor: StackDescriptor,
    state: Arc<MockState>,
}

impl MockStack {
    fn with_capabilities(name: &str, priority: u8, capabilities: Capabilities) -> Self {
        Self {
            descriptor: StackDescriptor::new(name, priority, capabilities),
            state: Arc::new(MockState {
                scripts: Mutex::new(HashMap::new()),
                fallback: Mutex::new(Script::succeed_after(0)),
                log: Mutex::new(MockLog::default()),
                notify: Notify::new(),
                next_port: AtomicU16::new(40_000),
            }),
        }
    }

    /// 可靠、保序的流式协议栈（需要分帧）。
    pub fn reliable(name: &str, priority: u8) -> Self {
        Self::with_capabilities(
            name,
            priority,
            Capabilities::new()
                .with_flag(ParameterId::FullyReliable)
                .with_flag(ParameterId::OrderPreserved),
        )
    }

    /// 不可靠的报文协议栈，自带消息边界。
    pub fn unreliable(name: &str, priority: u8) -> Self {
        let mut stack = Self::with_capabilities(
            name,
            priority,
            Capabilities::new().with_flag(ParameterId::PerMessageReliable),
        );
        stack.descriptor = stack.descriptor.with_native_framing(true);
        stack
    }

    /// 声明支持 0-RTT，拨号时接受早期数据。
    pub fn with_early_data(mut self) -> Self {
        self.descriptor.capabilities = self
            .descriptor
            .capabilities
            .clone()
            .with_flag(ParameterId::Idempotent0Rtt);
        self
    }

    pub fn with_native_framing(mut self, native: bool) -> Self {
        self.descriptor = self.descriptor.with_native_framing(native);
        self
    }

    pub fn into_dyn(self) -> Arc<dyn ProtocolStack> {
        Arc::new(self)
    }

    /// 为某个远端地址登记脚本。
    pub fn script(&self, remote: SocketAddr, script: Script) -> &Self {
        self.state.scripts.lock().insert(remote, script);
        self
    }

    /// 未登记地址使用的脚本。
    pub fn fallback(&self, script: Script) -> &Self {
        *self.state.fallback.lock() = script;
        self
    }

    /// 按启动顺序记录的拨号目标。
    pub fn dials(&self) -> Vec<SocketAddr> {
        self.state.log.lock().dials.clone()
    }

    pub fn cancellations(&self) -> Vec<SocketAddr> {
        self.state.log.lock().cancellations.clone()
    }

    /// 握手成功的数据流（包括之后被丢弃的迟到者）。
    pub fn flows(&self) -> Vec<(SocketAddr, Arc<MockFlow>)> {
        self.state.log.lock().flows.clone()
    }

    pub fn flow_to(&self, remote: SocketAddr) -> Option<Arc<MockFlow>> {
        self.state
            .log
            .lock()
            .flows
            .iter()
            .find(|(addr, _)| *addr == remote)
            .map(|(_, flow)| flow.clone())
    }

    pub fn early_data(&self) -> Vec<(SocketAddr, Vec<(MessageRef, Bytes)>)> {
        self.state.log.lock().early_data.clone()
    }

    pub fn listeners(&self) -> Vec<Arc<MockListener>> {
        self.state.log.lock().listeners.clone()
    }

    /// 等待至少 `count` 个监听器绑定完成。
    pub async fn wait_for_listeners(&self, count: usize) -> Vec<Arc<MockListener>> {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let listeners = self.listeners();
            if listeners.len() >= count {
                return listeners;
            }
            notified.await;
        }
    }

    fn script_for(&self, remote: SocketAddr) -> Script {
        self.state
            .scripts
            .lock()
            .get(&remote)
            .cloned()
            .unwrap_or_else(|| self.state.fallback.lock().clone())
    }

    fn open_flow(&self, remote: SocketAddr) -> Arc<MockFlow> {
        let flow = Arc::new(MockFlow::new());
        self.state.log.lock().flows.push((remote, flow.clone()));
        self.state.notify.notify_waiters();
        flow
    }
}

#[async_trait]
impl ProtocolStack for MockStack {
    fn descriptor(&self) -> &StackDescriptor {
        &self.descriptor
    }

    async fn dial(&self, request: DialRequest<'_>) -> Result<DialOutcome, StackError> {
        let remote = request
            .path
            .remote
            .map(|endpoint| endpoint.addr)
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        self.state.log.lock().dials.push(remote);

        let outcome = tokio::select! {
            biased;
            _ = request.cancellation.cancelled() => Err(StackError::Cancelled),
            outcome = run_script(self.script_for(remote)) => outcome,
        };
        if matches!(outcome, Err(StackError::Cancelled)) {
            self.state.log.lock().cancellations.push(remote);
        }
        outcome?;

        request.security.verify_trust(&SecurityMetadata {
            peer: Some(remote),
            ..SecurityMetadata::default()
        })?;

        let early_data_accepted = !request.early_data.is_empty();
        if early_data_accepted {
            let carried = request
                .early_data
                .iter()
                .map(|data| (data.reference, data.content.clone()))
                .collect();
            self.state.log.lock().early_data.push((remote, carried));
        }
        Ok(DialOutcome {
            flow: self.open_flow(remote),
            early_data_accepted,
        })
    }

    async fn listen(&self, request: ListenRequest<'_>) -> Result<Arc<dyn FlowListener>, StackError> {
        let mut local = *request.local;
        if local.addr.port() == 0 {
            local
                .addr
                .set_port(self.state.next_port.fetch_add(1, Ordering::Relaxed));
        }
        let listener = Arc::new(MockListener::new(local));
        self.state.log.lock().listeners.push(listener.clone());
        self.state.notify.notify_waiters();
        Ok(listener as Arc<dyn FlowListener>)
    }
}

async fn run_script(script: Script) -> Result<(), StackError> {
    match script {
        Script::Succeed { after } => {
            tokio::time::sleep(after).await;
            Ok(())
        }
        Script::Fail { after, error } => {
            tokio::time::sleep(after).await;
            Err(error)
        }
        Script::Hang => std::future::pending().await,
    }
}

/// 内存数据流：记录写入，读取由测试注入。
pub struct MockFlow {
    writes: Mutex<Vec<OutboundFrame>>,
    write_delay: Mutex<Option<Duration>>,
    fail_writes: AtomicBool,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    destroyed: Cancellation,
    written: Notify,
}

impl MockFlow {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            writes: Mutex::new(Vec::new()),
            write_delay: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            destroyed: Cancellation::new(),
            written: Notify::new(),
        }
    }

    /// 已写入的帧，按写入顺序。
    pub fn writes(&self) -> Vec<OutboundFrame> {
        self.writes.lock().clone()
    }

    pub fn written_payloads(&self) -> Vec<Bytes> {
        self.writes.lock().iter().map(|frame| frame.payload.clone()).collect()
    }

    /// 每次写入前等待的时长。
    pub fn delay_writes(&self, delay: Duration) {
        *self.write_delay.lock() = Some(delay);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Release);
    }

    /// 模拟对端发来的字节。
    pub fn push_inbound(&self, bytes: impl Into<Bytes>) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(bytes.into());
        }
    }

    /// 模拟对端结束发送。
    pub fn finish_inbound(&self) {
        self.inbound_tx.lock().take();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.is_cancelled()
    }

    /// 等待至少 `count` 次写入。
    pub async fn wait_for_writes(&self, count: usize) -> Vec<OutboundFrame> {
        loop {
            let notified = self.written.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let writes = self.writes();
            if writes.len() >= count {
                return writes;
            }
            notified.await;
        }
    }
}

impl Default for MockFlow {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Flow for MockFlow {
    async fn write(&self, frame: OutboundFrame) -> Result<(), StackError> {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.destroyed.is_cancelled() {
            return Err(StackError::Io {
                code: "spark.taps.mock.destroyed",
                detail: "flow destroyed".into(),
            });
        }
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(StackError::Io {
                code: "spark.taps.mock.write",
                detail: "scripted write failure".into(),
            });
        }
        self.writes.lock().push(frame);
        self.written.notify_waiters();
        Ok(())
    }

    async fn read(&self) -> Result<Option<Bytes>, StackError> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.destroyed.cancelled() => Ok(None),
            chunk = rx.recv() => Ok(chunk),
        }
    }

    async fn destroy(&self) {
        self.destroyed.cancel();
    }
}

/// 内存监听器：测试通过 [`MockListener::inject`] 送入入站数据流。
pub struct MockListener {
    local: ConcreteEndpoint,
    tx: mpsc::UnboundedSender<AcceptedFlow>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AcceptedFlow>>,
    destroyed: Cancellation,
}

impl MockListener {
    fn new(local: ConcreteEndpoint) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            local,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            destroyed: Cancellation::new(),
        }
    }

    pub fn local(&self) -> ConcreteEndpoint {
        self.local
    }

    /// 模拟一条来自 `remote` 的入站数据流。
    pub fn inject(&self, remote: SocketAddr) -> Arc<MockFlow> {
        let flow = Arc::new(MockFlow::new());
        let _ = self.tx.send(AcceptedFlow {
            flow: flow.clone(),
            remote: ConcreteEndpoint::new(remote),
        });
        flow
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.is_cancelled()
    }
}

#[async_trait]
impl FlowListener for MockListener {
    async fn accept(&self) -> Result<AcceptedFlow, StackError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.destroyed.cancelled() => Err(StackError::Cancelled),
            accepted = rx.recv() => accepted.ok_or(StackError::Cancelled),
        }
    }

    async fn destroy(&self) {
        self.destroyed.cancel();
    }

    fn local_endpoint(&self) -> ConcreteEndpoint {
        self.local
    }
}

type ReadyHook = Box<dyn Fn(&Connection) + Send + Sync>;

/// 记录每一条事件的处理器。
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
    notify: Notify,
    on_ready: Mutex<Option<ReadyHook>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 在 Ready 回调中执行 `hook`，用于验证重入。
    pub fn with_ready_hook(hook: impl Fn(&Connection) + Send + Sync + 'static) -> Arc<Self> {
        let handler = Self::default();
        *handler.on_ready.lock() = Some(Box::new(hook));
        Arc::new(handler)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(Event::kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|event| event.kind() == kind).count()
    }

    /// 某个消息引用收到的事件种类。
    pub fn message_events(&self, message: MessageRef) -> Vec<EventKind> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.message() == Some(message))
            .map(Event::kind)
            .collect()
    }

    /// 等待 `kind` 事件累计达到 `count` 条。
    pub async fn wait_for(&self, kind: EventKind, count: usize) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count(kind) >= count {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }
}

impl EventHandler for RecordingHandler {
    fn ready(&self, connection: &Connection, antecedent: Option<&Antecedent>) {
        self.record(Event::Ready {
            connection: connection.clone(),
            antecedent: antecedent.cloned(),
        });
        if let Some(hook) = self.on_ready.lock().as_ref() {
            hook(connection);
        }
    }

    fn sent(&self, connection: &Connection, message: MessageRef) {
        self.record(Event::Sent {
            connection: connection.clone(),
            message,
        });
    }

    fn expired(&self, connection: &Connection, message: MessageRef) {
        self.record(Event::Expired {
            connection: connection.clone(),
            message,
        });
    }

    fn error(&self, connection: &Connection, message: Option<MessageRef>, error: &TapsError) {
        self.record(Event::Error {
            connection: connection.clone(),
            message,
            error: error.clone(),
        });
    }

    fn closed(&self, connection: &Connection, error: Option<&TapsError>) {
        self.record(Event::Closed {
            connection: connection.clone(),
            error: error.cloned(),
        });
    }

    fn listener_error(&self, listener: &Listener, error: &TapsError) {
        self.record(Event::ListenerError {
            listener: listener.clone(),
            error: error.clone(),
        });
    }

    fn listener_stopped(&self, listener: &Listener) {
        self.record(Event::ListenerStopped {
            listener: listener.clone(),
        });
    }
}

//! # connection 模块说明
//!
//! ## 角色定位（Why）
//! - [`Connection`] 是把候选竞速、消息调度与事件分发绑在一起的聚合对象，并独占生命周期状态机；
//! - 对外的全部操作都是同步、非阻塞的：建立、发送与关闭的网络侧结果只经由事件返回。
//!
//! ## 任务划分（How）
//! - **驱动任务**：先执行建立（候选生成 → 过滤排序 → 竞速），胜出后晋升为 Established 并投递 Ready，
//!   随后进入发送循环；发送循环在写入协议栈的同时并发地清扫到期消息；
//! - **接收任务**：从数据流读取字节，按需经分帧处理器切分后送入有界入站队列；
//! - **分发任务**：见 [`crate::event`]，在无锁状态下调用处理器。
//!
//! ## 锁与事件（What）
//! - 锁顺序固定为“生命周期 → 队列 → 分发闸门”，事件只做入队，绝不在锁内调用处理器；
//! - 消息类事件（Sent/Expired/Error）在队列锁内完成判定与入队，终止流程同样在队列锁内清空队列，
//!   因此任何一条消息都不会同时得到 Sent 与 Error，也不会在 Closed 之后出现事件。

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cancel::Cancellation;
use crate::candidate::{self, PathDescriptor, PreparedSpecifier, RawCandidate, Role};
use crate::context::Engine;
use crate::error::{Result, StackError, TapsError};
use crate::event::{Antecedent, Dispatcher, Event, EventHandler};
use crate::framing::FramingHandler;
use crate::message::{InboundMessage, MessageRef, OutboundMessage, SendParameters};
use crate::parameters::FinalizedParameters;
use crate::racer::{self, Attempt, Contender, RaceSettings};
use crate::ranker::{self, Verdict};
use crate::scheduler::MessageQueue;
use crate::stack::{DialRequest, EarlyData, Flow, ListenRequest, OutboundFrame};

/// 连接标识，在同一上下文内单调递增。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// 连接生命周期状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    /// 正在生成候选与竞速。
    Initiating,
    Established,
    /// 已请求优雅关闭，队列中的消息仍在发送。
    Closing,
    Closed,
    /// 建立失败，从未进入 Established。
    Failed,
}

impl ConnectionState {
    /// 判断状态是否允许跃迁至 `target`。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：所有状态写入都先经过此函数，保证状态图与实现一致；
    /// - **契约 (What)**：`Initiating → Established | Failed`，`Established → Closing | Closed`，
    ///   `Closing → Closed`；`Closed` 与 `Failed` 是终态。
    pub fn can_transition_to(self, target: ConnectionState) -> bool {
        matches!(
            (self, target),
            (ConnectionState::Initiating, ConnectionState::Established)
                | (ConnectionState::Initiating, ConnectionState::Failed)
                | (ConnectionState::Established, ConnectionState::Closing)
                | (ConnectionState::Established, ConnectionState::Closed)
                | (ConnectionState::Closing, ConnectionState::Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// 是否仍接受新消息。
    pub fn accepts_messages(self) -> bool {
        matches!(self, ConnectionState::Initiating | ConnectionState::Established)
    }
}

/// 可原子替换的分帧处理器槽位。
struct FramingSlot(Arc<dyn FramingHandler>);

struct Lifecycle {
    state: ConnectionState,
    close_requested: bool,
    flow: Option<Arc<dyn Flow>>,
    path: Option<PathDescriptor>,
    native_framing: bool,
    transport: Arc<FinalizedParameters>,
    candidate: Option<RawCandidate>,
}

impl Lifecycle {
    /// Initiating 阶段的关闭请求同样使后续发送失败。
    fn accepts_messages(&self) -> bool {
        !self.close_requested && self.state.accepts_messages()
    }
}

struct ConnectionInner {
    id: ConnectionId,
    engine: Arc<Engine>,
    antecedent: Option<Antecedent>,
    send_defaults: SendParameters,
    lifecycle: Mutex<Lifecycle>,
    queue: Mutex<MessageQueue>,
    wake: Notify,
    abort_race: Cancellation,
    shutdown: Cancellation,
    dispatcher: Dispatcher,
    framing: ArcSwap<FramingSlot>,
    /// 随拨号携带的 0-RTT 消息。
    early: Mutex<Vec<MessageRef>>,
    inbound_tx: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
}

/// 一条逻辑连接的句柄，克隆代价为一次引用计数。
///
/// # 教案式说明
/// - **意图 (Why)**：应用只持有句柄，生命周期由内部任务驱动，句柄可在任意线程并发使用；
/// - **契约 (What)**：
///   - `send*`：同步入队，关闭生效后返回 [`TapsError::ConnectionClosed`]；
///   - `close`：幂等，可并发调用，整个生命周期恰好产生一个 Closed；
///   - `abort`：立即终止，未发出的消息各得到一个 Error；
///   - `clone_connection`：对同一路径再建一条连接，新连接的前驱是本连接；
/// - **风险 (Trade-offs)**：Initiating 阶段调用 `close`/`abort` 会中止竞速，连接以 Failed 结束
///   （连接级 Error 携带 `ConnectionClosed`），不会收到 Closed。
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

/// 建立计划。
pub(crate) enum Plan {
    /// 主动拨号（Initiate）。
    Dial {
        prepared: Vec<PreparedSpecifier>,
        early: Vec<EarlyData>,
    },
    /// 拨号与本地接受同时竞速（Rendezvous）。
    Rendezvous {
        prepared: Vec<PreparedSpecifier>,
        early: Vec<EarlyData>,
    },
    /// 固定候选（Clone）。
    Fixed { candidate: RawCandidate },
    /// 监听器已接入的数据流。
    Accepted { established: Established },
}

/// 一条已建立的数据流及其候选。
pub(crate) struct Established {
    pub flow: Arc<dyn Flow>,
    pub candidate: RawCandidate,
    pub early_data_accepted: bool,
}

impl Contender for Established {
    fn discard(self) -> BoxFuture<'static, ()> {
        async move { self.flow.destroy().await }.boxed()
    }
}

/// 连接构造所需的上下文快照。
#[derive(Clone)]
pub(crate) struct Seed {
    pub engine: Arc<Engine>,
    pub handler: Arc<dyn EventHandler>,
    pub framing: Arc<dyn FramingHandler>,
    pub send_defaults: SendParameters,
}

impl Connection {
    pub(crate) fn new(
        seed: Seed,
        antecedent: Option<Antecedent>,
        transport: Arc<FinalizedParameters>,
    ) -> Self {
        let id = ConnectionId::new(seed.engine.next_connection_id());
        let (inbound_tx, inbound_rx) = mpsc::channel(seed.engine.config.receive_buffer);
        let dispatcher = Dispatcher::spawn(&seed.engine.runtime, seed.handler);
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                antecedent,
                send_defaults: seed.send_defaults,
                lifecycle: Mutex::new(Lifecycle {
                    state: ConnectionState::Initiating,
                    close_requested: false,
                    flow: None,
                    path: None,
                    native_framing: false,
                    transport,
                    candidate: None,
                }),
                queue: Mutex::new(MessageQueue::new()),
                wake: Notify::new(),
                abort_race: Cancellation::new(),
                shutdown: Cancellation::new(),
                dispatcher,
                framing: ArcSwap::from_pointee(FramingSlot(seed.framing)),
                early: Mutex::new(Vec::new()),
                inbound_tx: Mutex::new(Some(inbound_tx)),
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                engine: seed.engine,
            }),
        }
    }

    /// 在建立开始前提交 0-RTT 消息，返回随拨号携带的数据。
    pub(crate) fn submit_early(&self, messages: &[OutboundMessage]) -> Result<Vec<EarlyData>> {
        let mut queue = self.inner.queue.lock();
        let now = Instant::now();
        let mut early = Vec::with_capacity(messages.len());
        for message in messages {
            let message = message.clone().force_idempotent();
            let content = message.content().clone();
            let reference = queue.submit(None, message, now)?;
            early.push(EarlyData { reference, content });
        }
        self.inner
            .early
            .lock()
            .extend(early.iter().map(|data| data.reference));
        Ok(early)
    }

    /// 启动驱动任务。
    pub(crate) fn start(&self, plan: Plan) {
        let connection = self.clone();
        let span = info_span!("taps.race", connection = self.inner.id.get());
        self.inner
            .engine
            .runtime
            .spawn(async move { connection.drive(plan).await }.instrument(span));
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.lock().state
    }

    /// 胜出路径；建立完成前为 `None`。
    pub fn path(&self) -> Option<PathDescriptor> {
        self.inner.lifecycle.lock().path.clone()
    }

    /// 连接的来历，Ready 之前即已确定且不再改变。
    pub fn antecedent(&self) -> Option<Antecedent> {
        self.inner.antecedent.clone()
    }

    /// 当前生效的传输参数快照。
    pub fn transport_parameters(&self) -> Arc<FinalizedParameters> {
        self.inner.lifecycle.lock().transport.clone()
    }

    pub fn event_handler(&self) -> Arc<dyn EventHandler> {
        self.inner.dispatcher.handler()
    }

    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner.dispatcher.set_handler(handler);
    }

    pub fn framing_handler(&self) -> Arc<dyn FramingHandler> {
        self.inner.framing.load().0.clone()
    }

    pub fn set_framing_handler(&self, framing: Arc<dyn FramingHandler>) {
        self.inner.framing.store(Arc::new(FramingSlot(framing)));
    }

    /// 以连接的默认发送参数发送一段字节。
    pub fn send(&self, content: impl Into<Bytes>) -> Result<MessageRef> {
        let message =
            OutboundMessage::new(content).with_parameters(self.inner.send_defaults.clone());
        self.submit(None, message)
    }

    /// 发送一条完整描述的消息。
    pub fn send_message(&self, message: OutboundMessage) -> Result<MessageRef> {
        self.submit(None, message)
    }

    /// 以预留引用的身份发送消息。
    pub fn send_with_ref(&self, reference: MessageRef, message: OutboundMessage) -> Result<()> {
        self.submit(Some(reference), message).map(|_| ())
    }

    /// 预留一个消息引用，供后续消息引用为前驱。
    pub fn reserve_message_ref(&self) -> Result<MessageRef> {
        let lifecycle = self.inner.lifecycle.lock();
        if !lifecycle.accepts_messages() {
            return Err(TapsError::ConnectionClosed);
        }
        Ok(self.inner.queue.lock().reserve())
    }

    fn submit(&self, reserved: Option<MessageRef>, message: OutboundMessage) -> Result<MessageRef> {
        let reference = {
            let lifecycle = self.inner.lifecycle.lock();
            if !lifecycle.accepts_messages() {
                return Err(TapsError::ConnectionClosed);
            }
            self.inner
                .queue
                .lock()
                .submit(reserved, message, Instant::now())?
        };
        self.inner.wake.notify_one();
        Ok(reference)
    }

    /// 等待下一条入站消息；连接结束后返回 `ConnectionClosed`。
    pub async fn receive(&self) -> Result<InboundMessage> {
        let mut rx = self.inner.inbound_rx.lock().await;
        rx.recv().await.ok_or(TapsError::ConnectionClosed)
    }

    /// 优雅关闭：已排队的消息继续发送，之后投递 Closed。
    pub fn close(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        match lifecycle.state {
            ConnectionState::Initiating => {
                lifecycle.close_requested = true;
                drop(lifecycle);
                self.inner.abort_race.cancel();
            }
            ConnectionState::Established => {
                lifecycle.state = ConnectionState::Closing;
                drop(lifecycle);
                debug!(connection = self.inner.id.get(), "close requested");
                self.inner.wake.notify_one();
            }
            _ => {}
        }
    }

    /// 立即终止：不再发送任何排队消息。
    pub fn abort(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        match lifecycle.state {
            ConnectionState::Initiating => {
                lifecycle.close_requested = true;
                drop(lifecycle);
                self.inner.abort_race.cancel();
            }
            ConnectionState::Established | ConnectionState::Closing => {
                drop(lifecycle);
                let connection = self.clone();
                self.inner
                    .engine
                    .runtime
                    .spawn(async move { connection.finish(None).await });
            }
            _ => {}
        }
    }

    /// 对同一路径再建立一条连接，新连接的前驱为本连接。
    pub fn clone_connection(&self) -> Result<Connection> {
        let candidate = {
            let lifecycle = self.inner.lifecycle.lock();
            if lifecycle.state != ConnectionState::Established {
                return Err(TapsError::NotEstablished);
            }
            lifecycle.candidate.clone().ok_or(TapsError::NotEstablished)?
        };
        let seed = Seed {
            engine: self.inner.engine.clone(),
            handler: self.event_handler(),
            framing: self.framing_handler(),
            send_defaults: self.inner.send_defaults.clone(),
        };
        let child = Connection::new(
            seed,
            Some(Antecedent::Connection(self.clone())),
            candidate.transport.clone(),
        );
        child.start(Plan::Fixed { candidate });
        Ok(child)
    }

    fn emit(&self, event: Event) -> bool {
        self.inner.dispatcher.emit(event)
    }

    async fn drive(self, plan: Plan) {
        let established = match plan {
            Plan::Accepted { established } => established,
            plan => match self.establish(plan).await {
                Ok(established) => established,
                Err(error) => {
                    self.fail(error);
                    return;
                }
            },
        };
        if !self.promote(established).await {
            return;
        }
        let span = info_span!("taps.scheduler", connection = self.inner.id.get());
        self.send_loop().instrument(span).await;
    }

    /// 建立阶段：解析、过滤排序与竞速共享同一个截止时间，全程响应 `close`/`abort`。
    async fn establish(&self, plan: Plan) -> Result<Established> {
        let engine = &self.inner.engine;
        let started_at = Instant::now();
        let deadline = started_at + engine.config.establishment_timeout;
        let framing = self.framing_handler();

        let (active, passive) = match plan {
            Plan::Dial { prepared, early } => {
                let ranked = self.before_deadline(deadline, started_at, rank(&prepared, engine)).await?;
                (dial_attempts(ranked, &early, &framing), None)
            }
            Plan::Rendezvous { prepared, early } => {
                let ranked = self.before_deadline(deadline, started_at, rank(&prepared, engine)).await?;
                let passive = accept_attempt(prepared, engine.clone());
                (dial_attempts(ranked, &early, &framing), Some(passive))
            }
            Plan::Fixed { candidate } => (dial_attempts(vec![candidate], &[], &framing), None),
            Plan::Accepted { established } => return Ok(established),
        };

        let settings = RaceSettings {
            stagger_delay: engine.config.stagger_delay,
            timeout: deadline.saturating_duration_since(Instant::now()),
            max_concurrent: engine.config.max_concurrent_attempts,
        };
        let victory = racer::race(active, passive, settings, &self.inner.abort_race).await?;
        debug!(
            candidate = %victory.label,
            attempts = victory.attempts_started,
            "establishment finished"
        );
        Ok(victory.winner)
    }

    /// 在截止时间与中止信号的约束下等待竞速前的步骤。
    async fn before_deadline<T>(
        &self,
        deadline: Instant,
        started_at: Instant,
        step: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.inner.abort_race.cancelled() => {
                debug!(connection = self.inner.id.get(), "establishment aborted before racing");
                Err(TapsError::ConnectionClosed)
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(connection = self.inner.id.get(), "establishment timed out before racing");
                Err(TapsError::EstablishmentTimeout {
                    elapsed: started_at.elapsed(),
                    attempts: 0,
                })
            }
            outcome = step => outcome,
        }
    }

    /// 晋升为 Established 并投递 Ready；关闭请求先到时改为失败。
    async fn promote(&self, established: Established) -> bool {
        let Established {
            flow,
            candidate,
            early_data_accepted,
        } = established;
        let native_framing = candidate.stack.descriptor().native_framing;

        // Ready 在生命周期锁内入队：并发的 abort 只能在此之后完成跃迁，Closed 不会先于 Ready。
        let promoted = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.close_requested
                || !lifecycle.state.can_transition_to(ConnectionState::Established)
            {
                false
            } else {
                lifecycle.state = ConnectionState::Established;
                lifecycle.flow = Some(flow.clone());
                lifecycle.path = Some(candidate.path.clone());
                lifecycle.native_framing = native_framing;
                lifecycle.transport = candidate.transport.clone();
                lifecycle.candidate = Some(candidate.clone());
                self.emit(Event::Ready {
                    connection: self.clone(),
                    antecedent: self.inner.antecedent.clone(),
                });
                true
            }
        };
        if !promoted {
            flow.destroy().await;
            self.fail(TapsError::ConnectionClosed);
            return false;
        }
        info!(connection = self.inner.id.get(), path = %candidate.path, "connection established");

        if early_data_accepted {
            let early = std::mem::take(&mut *self.inner.early.lock());
            let mut queue = self.inner.queue.lock();
            for reference in early {
                if queue.take_queued(reference) {
                    self.emit(Event::Sent {
                        connection: self.clone(),
                        message: reference,
                    });
                }
            }
        }

        self.spawn_receiver(flow, native_framing);
        true
    }

    fn fail(&self, error: TapsError) {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if !lifecycle.state.can_transition_to(ConnectionState::Failed) {
                return;
            }
            lifecycle.state = ConnectionState::Failed;
        }
        self.inner.shutdown.cancel();
        self.inner.inbound_tx.lock().take();
        warn!(connection = self.inner.id.get(), error = %error, code = error.code(), "establishment failed");
        {
            let mut queue = self.inner.queue.lock();
            for reference in queue.drain_all() {
                self.emit(Event::Error {
                    connection: self.clone(),
                    message: Some(reference),
                    error: error.clone(),
                });
            }
        }
        self.emit(Event::Error {
            connection: self.clone(),
            message: None,
            error,
        });
    }

    /// 进入 Closed：未完成的消息各得到一个 `ConnectionClosed` 错误，销毁数据流，投递 Closed。
    pub(crate) async fn finish(&self, error: Option<TapsError>) {
        let flow = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if !lifecycle.state.can_transition_to(ConnectionState::Closed) {
                return;
            }
            lifecycle.state = ConnectionState::Closed;
            lifecycle.flow.take()
        };
        self.inner.shutdown.cancel();
        self.inner.wake.notify_one();
        self.inner.inbound_tx.lock().take();
        {
            let mut queue = self.inner.queue.lock();
            for reference in queue.drain_all() {
                self.emit(Event::Error {
                    connection: self.clone(),
                    message: Some(reference),
                    error: TapsError::ConnectionClosed,
                });
            }
        }
        if let Some(flow) = flow {
            flow.destroy().await;
        }
        match &error {
            Some(error) => warn!(connection = self.inner.id.get(), error = %error, "connection closed with error"),
            None => info!(connection = self.inner.id.get(), "connection closed"),
        }
        self.emit(Event::Closed {
            connection: self.clone(),
            error,
        });
    }

    fn sweep_expired(&self) {
        let mut queue = self.inner.queue.lock();
        for reference in queue.expire_due(Instant::now()) {
            warn!(connection = self.inner.id.get(), message = reference.get(), "message expired before transmission");
            self.emit(Event::Expired {
                connection: self.clone(),
                message: reference,
            });
        }
    }

    fn frame_for(&self, reference: MessageRef, message: OutboundMessage) -> Result<OutboundFrame> {
        let native = self.inner.lifecycle.lock().native_framing;
        let parameters = message.parameters().clone();
        let content = message.into_content();
        let payload = if native {
            content
        } else {
            self.framing_handler().frame(&content)?
        };
        Ok(OutboundFrame {
            reference,
            payload,
            immediate: parameters.immediate,
            idempotent: parameters.idempotent,
            corruption_tolerant: parameters.corruption_tolerant,
            capacity_profile: parameters.capacity_profile,
        })
    }

    /// 写入协议栈，等待期间继续清扫到期消息。
    async fn transmit(&self, flow: &Arc<dyn Flow>, frame: OutboundFrame) -> Result<()> {
        let write = flow.write(frame);
        tokio::pin!(write);
        loop {
            let deadline = self.inner.queue.lock().next_deadline();
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => return Err(TapsError::ConnectionClosed),
                result = &mut write => return result.map_err(TapsError::from),
                _ = sleep_until(deadline) => self.sweep_expired(),
            }
        }
    }

    fn complete_message(&self, reference: MessageRef, outcome: &Result<()>) {
        let mut queue = self.inner.queue.lock();
        if !queue.complete(reference) {
            return;
        }
        let event = match outcome {
            Ok(()) => {
                debug!(connection = self.inner.id.get(), message = reference.get(), "message sent");
                Event::Sent {
                    connection: self.clone(),
                    message: reference,
                }
            }
            Err(error) => Event::Error {
                connection: self.clone(),
                message: Some(reference),
                error: error.clone(),
            },
        };
        self.emit(event);
    }

    async fn send_loop(&self) {
        let Some(flow) = self.inner.lifecycle.lock().flow.clone() else {
            return;
        };
        loop {
            if self.inner.shutdown.is_cancelled() {
                return;
            }
            self.sweep_expired();
            let next = self.inner.queue.lock().next_ready();
            if let Some((reference, message)) = next {
                let frame = match self.frame_for(reference, message) {
                    Ok(frame) => frame,
                    Err(error) => {
                        self.complete_message(reference, &Err(error));
                        continue;
                    }
                };
                match self.transmit(&flow, frame).await {
                    Ok(()) => self.complete_message(reference, &Ok(())),
                    Err(TapsError::ConnectionClosed) => return,
                    Err(error) => {
                        self.complete_message(reference, &Err(error.clone()));
                        self.finish(Some(error)).await;
                        return;
                    }
                }
                continue;
            }

            if self.state() == ConnectionState::Closing {
                self.finish(None).await;
                return;
            }
            let deadline = self.inner.queue.lock().next_deadline();
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => return,
                _ = self.inner.wake.notified() => {}
                _ = sleep_until(deadline) => {}
            }
        }
    }

    fn spawn_receiver(&self, flow: Arc<dyn Flow>, native_framing: bool) {
        let Some(tx) = self.inner.inbound_tx.lock().clone() else {
            return;
        };
        let connection = self.clone();
        let span = info_span!("taps.receive", connection = self.inner.id.get());
        self.inner.engine.runtime.spawn(
            async move {
                let outcome = connection.receive_loop(flow, native_framing, tx).await;
                if let Err(error) = outcome {
                    connection.finish(Some(error)).await;
                } else if !connection.inner.shutdown.is_cancelled() {
                    connection.finish(None).await;
                }
            }
            .instrument(span),
        );
    }

    /// 读取循环；`Ok(())` 表示对端结束或本端停止，`Err` 表示需要以错误关闭。
    async fn receive_loop(
        &self,
        flow: Arc<dyn Flow>,
        native_framing: bool,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Result<()> {
        let mut buffer = BytesMut::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                chunk = flow.read() => chunk.map_err(TapsError::from)?,
            };
            let Some(chunk) = chunk else {
                debug!(connection = self.inner.id.get(), "peer finished the flow");
                return Ok(());
            };
            if native_framing {
                if tx.send(InboundMessage::complete(chunk)).await.is_err() {
                    return Ok(());
                }
                continue;
            }
            buffer.extend_from_slice(&chunk);
            let framing = self.framing_handler();
            while let Some(message) = framing.deframe(&mut buffer)? {
                if tx.send(message).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending::<()>().await,
    }
}

/// 生成候选并过滤排序。
async fn rank(prepared: &[PreparedSpecifier], engine: &Engine) -> Result<Vec<RawCandidate>> {
    let raw = candidate::generate(prepared, engine.resolver.as_ref(), Role::Dial).await?;
    ranker::filter_and_rank(&raw)
}

fn dial_attempts(
    ranked: Vec<RawCandidate>,
    early: &[EarlyData],
    framing: &Arc<dyn FramingHandler>,
) -> Vec<Attempt<Established>> {
    ranked
        .into_iter()
        .map(|candidate| {
            let early = early_for(&candidate, early, framing);
            Attempt::new(candidate.path.to_string(), move |token: Cancellation| {
                async move {
                    let outcome = candidate
                        .stack
                        .dial(DialRequest {
                            path: &candidate.path,
                            transport: &candidate.transport,
                            security: &candidate.security,
                            early_data: &early,
                            cancellation: &token,
                        })
                        .await?;
                    Ok::<_, StackError>(Established {
                        flow: outcome.flow,
                        early_data_accepted: outcome.early_data_accepted && !early.is_empty(),
                        candidate,
                    })
                }
                .boxed()
            })
        })
        .collect()
}

/// 只有声明支持 0-RTT 的协议栈才携带早期数据；流式协议栈携带已分帧的字节。
fn early_for(
    candidate: &RawCandidate,
    early: &[EarlyData],
    framing: &Arc<dyn FramingHandler>,
) -> Vec<EarlyData> {
    let descriptor = candidate.stack.descriptor();
    if early.is_empty() || !descriptor.supports_early_data() {
        return Vec::new();
    }
    let mut framed = Vec::with_capacity(early.len());
    for data in early {
        let content = if descriptor.native_framing {
            data.content.clone()
        } else {
            match framing.frame(&data.content) {
                Ok(content) => content,
                Err(error) => {
                    warn!(candidate = %candidate.path, error = %error, "early data cannot be framed, sending after establishment");
                    return Vec::new();
                }
            }
        };
        framed.push(EarlyData {
            reference: data.reference,
            content,
        });
    }
    framed
}

/// Rendezvous 的被动一侧：在全部本地候选上监听，接受第一条入站数据流。
fn accept_attempt(prepared: Vec<PreparedSpecifier>, engine: Arc<Engine>) -> Attempt<Established> {
    Attempt::new("rendezvous-accept", move |token: Cancellation| {
        async move {
            let raw = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(StackError::Cancelled),
                raw = candidate::generate(&prepared, engine.resolver.as_ref(), Role::Listen) => raw,
            }
            .map_err(|error| StackError::Io {
                code: "spark.taps.rendezvous_listen",
                detail: error.to_string(),
            })?;
            let mut listeners = Vec::new();
            for candidate in raw {
                let Some(local) = candidate.path.local else {
                    continue;
                };
                match candidate
                    .stack
                    .listen(ListenRequest {
                        local: &local,
                        transport: &candidate.transport,
                        security: &candidate.security,
                    })
                    .await
                {
                    Ok(listener) => listeners.push((candidate, listener)),
                    Err(error) => debug!(candidate = %candidate.path, error = %error, "rendezvous listen skipped"),
                }
            }
            if listeners.is_empty() {
                return Err(StackError::Unsupported {
                    stack: "rendezvous".into(),
                });
            }

            let accepts = listeners.iter().map(|(candidate, listener)| {
                let candidate = candidate.clone();
                let listener = listener.clone();
                async move {
                    loop {
                        let accepted = listener.accept().await?;
                        let path = candidate::accepted_path(candidate.clone(), accepted.remote, listener.local_endpoint());
                        if let Verdict::Rejected(parameter) = ranker::evaluate(&path) {
                            debug!(remote = %accepted.remote, parameter = %parameter, "inbound flow refused by path constraints");
                            accepted.flow.destroy().await;
                            continue;
                        }
                        return Ok::<_, StackError>(Established {
                            flow: accepted.flow,
                            candidate: path,
                            early_data_accepted: false,
                        });
                    }
                }
                .boxed()
            });
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(StackError::Cancelled),
                first = future::select_ok(accepts) => first.map(|(established, _)| established),
            };
            for (_, listener) in &listeners {
                listener.destroy().await;
            }
            outcome
        }
        .boxed()
    })
}

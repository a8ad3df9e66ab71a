//! # listener 模块说明
//!
//! ## 角色定位（Why）
//! - `listen` 的返回值：在每个可用本地候选上绑定协议栈监听器，把接入的数据流包装为 [`Connection`]；
//! - 接入的连接以监听器为前驱，和主动建立的连接一样经由事件驱动。
//!
//! ## 执行（How）
//! - 绑定任务：候选生成（监听角色）→ 过滤排序 → 逐个 `listen`，单个失败只报告不中止；
//! - 每个绑定成功的监听器一个接入循环，与 `stop` 的取消信号竞争；
//! - 接入的数据流按实际对端重算路径属性并重新过滤，命中 Prohibit 的数据流直接销毁，不产生事件；
//! - 监听器级别的失败经 [`EventHandler::listener_error`] 报告，结束时恰好一次 `listener_stopped`。

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cancel::Cancellation;
use crate::candidate::{self, PreparedSpecifier, RawCandidate, Role};
use crate::connection::{Connection, Established, Plan, Seed};
use crate::context::{Defaults, Engine};
use crate::endpoint::ConcreteEndpoint;
use crate::error::{Result, TapsError};
use crate::event::{Antecedent, Event, EventHandler, HandlerSlot, SharedHandler, shared_handler};
use crate::framing::FramingHandler;
use crate::message::SendParameters;
use crate::ranker::{self, Verdict};
use crate::stack::{Flow, FlowListener, ListenRequest};

/// 监听器标识。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

struct ListenerInner {
    id: ListenerId,
    engine: Arc<Engine>,
    handler: SharedHandler,
    framing: Arc<dyn FramingHandler>,
    send_defaults: SendParameters,
    stopped: Cancellation,
    bound: Cancellation,
    flows: Mutex<Vec<Arc<dyn FlowListener>>>,
}

/// 被动建立的入口句柄。
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.inner.id)
            .field("stopped", &self.inner.stopped.is_cancelled())
            .finish()
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Listener {}

impl Listener {
    pub(crate) fn start(engine: Arc<Engine>, defaults: &Defaults, prepared: Vec<PreparedSpecifier>) -> Self {
        let id = ListenerId(engine.next_listener_id());
        let listener = Self {
            inner: Arc::new(ListenerInner {
                id,
                handler: shared_handler(defaults.handler.clone()),
                framing: defaults.framing.clone(),
                send_defaults: defaults.send.clone(),
                stopped: Cancellation::new(),
                bound: Cancellation::new(),
                flows: Mutex::new(Vec::new()),
                engine,
            }),
        };
        let task = listener.clone();
        let span = info_span!("taps.listen", listener = id.get());
        listener
            .inner
            .engine
            .runtime
            .spawn(async move { task.bind(prepared).await }.instrument(span));
        listener
    }

    pub fn id(&self) -> ListenerId {
        self.inner.id
    }

    pub fn event_handler(&self) -> Arc<dyn EventHandler> {
        self.inner.handler.load().0.clone()
    }

    /// 替换处理器；之后接入的连接与监听器事件都使用新处理器。
    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner.handler.store(Arc::new(HandlerSlot(handler)));
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.is_cancelled()
    }

    /// 当前已绑定的本地端点。
    pub fn local_endpoints(&self) -> Vec<ConcreteEndpoint> {
        self.inner
            .flows
            .lock()
            .iter()
            .map(|flow| flow.local_endpoint())
            .collect()
    }

    /// 等待绑定阶段结束，返回绑定成功的本地端点。
    pub async fn bound(&self) -> Vec<ConcreteEndpoint> {
        self.inner.bound.cancelled().await;
        self.local_endpoints()
    }

    /// 停止接入并释放全部绑定；已接入的连接不受影响。幂等。
    pub fn stop(&self) {
        if !self.inner.stopped.cancel() {
            return;
        }
        let listener = self.clone();
        self.inner.engine.runtime.spawn(async move {
            let flows = std::mem::take(&mut *listener.inner.flows.lock());
            for flow in flows {
                flow.destroy().await;
            }
            info!(listener = listener.inner.id.get(), "listener stopped");
            listener.dispatch(Event::ListenerStopped {
                listener: listener.clone(),
            });
        });
    }

    fn dispatch(&self, event: Event) {
        let handler = self.inner.handler.load_full();
        event.dispatch_to(handler.0.as_ref());
    }

    fn report(&self, error: TapsError) {
        warn!(listener = self.inner.id.get(), error = %error, code = error.code(), "listener error");
        self.dispatch(Event::ListenerError {
            listener: self.clone(),
            error,
        });
    }

    async fn bind(self, prepared: Vec<PreparedSpecifier>) {
        let bound = match self.bind_all(&prepared).await {
            Ok(bound) => bound,
            Err(error) => {
                self.inner.bound.cancel();
                self.report(error);
                self.stop();
                return;
            }
        };

        {
            let mut flows = self.inner.flows.lock();
            if !self.inner.stopped.is_cancelled() {
                flows.extend(bound.iter().map(|(_, flow)| flow.clone()));
            }
        }
        self.inner.bound.cancel();
        if self.inner.stopped.is_cancelled() {
            for (_, flow) in bound {
                flow.destroy().await;
            }
            return;
        }

        for (candidate, flow) in bound {
            let listener = self.clone();
            let span = info_span!("taps.accept", local = %flow.local_endpoint());
            self.inner
                .engine
                .runtime
                .spawn(async move { listener.accept_loop(candidate, flow).await }.instrument(span));
        }
    }

    async fn bind_all(
        &self,
        prepared: &[PreparedSpecifier],
    ) -> Result<Vec<(RawCandidate, Arc<dyn FlowListener>)>> {
        let raw = candidate::generate(prepared, self.inner.engine.resolver.as_ref(), Role::Listen).await?;
        let ranked = ranker::filter_and_rank(&raw)?;
        let mut bound = Vec::new();
        for candidate in ranked {
            let Some(local) = candidate.path.local else {
                continue;
            };
            let outcome = candidate
                .stack
                .listen(ListenRequest {
                    local: &local,
                    transport: &candidate.transport,
                    security: &candidate.security,
                })
                .await;
            match outcome {
                Ok(flow) => {
                    debug!(candidate = %candidate.path, bound = %flow.local_endpoint(), "listening");
                    bound.push((candidate, flow));
                }
                Err(error) => self.report(error.into()),
            }
        }
        if bound.is_empty() {
            return Err(TapsError::NoViableCandidates {
                detail: "no local candidate could be bound".into(),
            });
        }
        Ok(bound)
    }

    async fn accept_loop(self, candidate: RawCandidate, flow: Arc<dyn FlowListener>) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.inner.stopped.cancelled() => return,
                accepted = flow.accept() => accepted,
            };
            match accepted {
                Ok(accepted) => {
                    let candidate =
                        candidate::accepted_path(candidate.clone(), accepted.remote, flow.local_endpoint());
                    if let Verdict::Rejected(parameter) = ranker::evaluate(&candidate) {
                        debug!(remote = %accepted.remote, parameter = %parameter, "inbound flow refused by path constraints");
                        accepted.flow.destroy().await;
                        continue;
                    }
                    let connection = self.adopt(candidate, accepted.flow);
                    debug!(connection = connection.id().get(), remote = %accepted.remote, "flow accepted");
                }
                Err(error) => {
                    if !self.inner.stopped.is_cancelled() {
                        self.report(error.into());
                    }
                    return;
                }
            }
        }
    }

    fn adopt(&self, candidate: RawCandidate, flow: Arc<dyn Flow>) -> Connection {
        let seed = Seed {
            engine: self.inner.engine.clone(),
            handler: self.event_handler(),
            framing: self.inner.framing.clone(),
            send_defaults: self.inner.send_defaults.clone(),
        };
        let connection = Connection::new(
            seed,
            Some(Antecedent::Listener(self.clone())),
            candidate.transport.clone(),
        );
        connection.start(Plan::Accepted {
            established: Established {
                flow,
                candidate,
                early_data_accepted: false,
            },
        });
        connection
    }
}

//! # racer 模块说明
//!
//! ## 角色定位（Why）
//! - 按排序结果错峰拨号，第一个成功者胜出，其余尝试被协作式取消；
//! - 把不确定的网络时序收敛为确定的结果：至多一个赢家，失败只在全部候选失败或总超时后才成立。
//!
//! ## 并发模型（How）
//! - 每个尝试是 `JoinSet` 中的独立任务，各持一枚 [`Cancellation`]；
//! - 主循环以 `select!` 同时等待：外部中止、总超时、任一尝试结束、错峰计时器；
//! - 在途尝试失败时立即启动下一个候选（不必等满错峰间隔），并重置错峰计时器；
//! - 胜出后对其余令牌发出取消，再在后台任务中等待它们逐个结束；迟到的成功者其数据流被销毁。
//!   全程不使用 `abort`，拨号实现总能完成自身清理。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::error::{AttemptFailure, StackError, TapsError};

/// 竞速参与者：迟到的成功者需要被丢弃（销毁其数据流）。
pub(crate) trait Contender: Send + 'static {
    fn discard(self) -> BoxFuture<'static, ()>;
}

pub(crate) type AttemptFuture<T> = BoxFuture<'static, Result<T, StackError>>;

/// 待启动的尝试。
pub(crate) struct Attempt<T> {
    pub label: String,
    pub launch: Box<dyn FnOnce(Cancellation) -> AttemptFuture<T> + Send>,
}

impl<T: Contender> Attempt<T> {
    pub fn new(
        label: impl Into<String>,
        launch: impl FnOnce(Cancellation) -> AttemptFuture<T> + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            launch: Box::new(launch),
        }
    }
}

/// 竞速时序参数。
#[derive(Clone, Copy, Debug)]
pub(crate) struct RaceSettings {
    pub stagger_delay: Duration,
    pub timeout: Duration,
    pub max_concurrent: usize,
}

/// 竞速胜出的结果。
pub(crate) struct Victory<T> {
    pub winner: T,
    pub label: String,
    pub attempts_started: usize,
}

type Joined<T> = (usize, Result<T, StackError>);

struct Racer<T> {
    set: JoinSet<Joined<T>>,
    labels: Vec<String>,
    tokens: Vec<Cancellation>,
    passive_running: bool,
    passive_index: Option<usize>,
}

impl<T: Contender> Racer<T> {
    fn launch(&mut self, attempt: Attempt<T>) -> usize {
        let index = self.labels.len();
        let token = Cancellation::new();
        debug!(candidate = %attempt.label, index, "attempt started");
        let future = (attempt.launch)(token.clone());
        self.labels.push(attempt.label);
        self.tokens.push(token);
        self.set.spawn(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(StackError::Io {
                    code: "spark.taps.attempt_panicked",
                    detail: panic_detail(panic.as_ref()),
                }),
            };
            (index, outcome)
        });
        index
    }

    fn active_in_flight(&self) -> usize {
        self.set.len().saturating_sub(usize::from(self.passive_running))
    }

    fn active_started(&self) -> usize {
        self.labels.len() - usize::from(self.passive_index.is_some())
    }

    /// 取消全部尝试，并在后台等待它们结束。
    fn dismiss(mut self, winner: Option<usize>) {
        for (index, token) in self.tokens.iter().enumerate() {
            if Some(index) != winner && token.cancel() {
                debug!(candidate = %self.labels[index], "attempt cancelled");
            }
        }
        if self.set.is_empty() {
            return;
        }
        tokio::spawn(async move {
            while let Some(joined) = self.set.join_next().await {
                if let Ok((index, Ok(late))) = joined {
                    debug!(candidate = %self.labels[index], "late attempt succeeded, discarding it");
                    late.discard().await;
                }
            }
        });
    }
}

fn panic_detail(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "attempt panicked".to_owned()
    }
}

/// 执行一次竞速。
///
/// # 契约 (What)
/// - `active` 已按排序结果排列；`passive`（Rendezvous 的入站接受）在 t=0 启动且不占并发名额；
/// - 返回 `Ok` 时恰好一个尝试胜出，其余均已收到取消信号；
/// - `abort` 被触发时返回 [`TapsError::ConnectionClosed`]；
/// - 超时返回 [`TapsError::EstablishmentTimeout`]；全部失败返回 [`TapsError::AllCandidatesFailed`]。
pub(crate) async fn race<T: Contender>(
    active: Vec<Attempt<T>>,
    passive: Option<Attempt<T>>,
    settings: RaceSettings,
    abort: &Cancellation,
) -> Result<Victory<T>, TapsError> {
    let started_at = Instant::now();
    let deadline = tokio::time::sleep(settings.timeout);
    tokio::pin!(deadline);
    let stagger = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(stagger);

    let mut racer = Racer {
        set: JoinSet::new(),
        labels: Vec::new(),
        tokens: Vec::new(),
        passive_running: false,
        passive_index: None,
    };
    if let Some(passive) = passive {
        racer.passive_index = Some(racer.launch(passive));
        racer.passive_running = true;
    }

    let mut pending = active.into_iter();
    let mut next = pending.next();
    let mut failures: Vec<AttemptFailure> = Vec::new();
    let max_concurrent = settings.max_concurrent.max(1);

    loop {
        if next.is_none() && racer.set.is_empty() {
            warn!(failures = failures.len(), "all candidates failed");
            racer.dismiss(None);
            return Err(TapsError::AllCandidatesFailed { failures });
        }
        let can_launch = next.is_some() && racer.active_in_flight() < max_concurrent;

        tokio::select! {
            biased;
            _ = abort.cancelled() => {
                debug!("establishment aborted");
                racer.dismiss(None);
                return Err(TapsError::ConnectionClosed);
            }
            _ = &mut deadline => {
                let attempts = racer.active_started();
                warn!(attempts, "establishment timed out");
                racer.dismiss(None);
                return Err(TapsError::EstablishmentTimeout {
                    elapsed: started_at.elapsed(),
                    attempts,
                });
            }
            Some(joined) = racer.set.join_next(), if !racer.set.is_empty() => {
                // 尝试内的 panic 已在任务内转为失败；JoinError 只剩任务被运行时取消一种来源。
                let (index, outcome) = match joined {
                    Ok(joined) => joined,
                    Err(err) => {
                        warn!(error = %err, "attempt task ended abnormally");
                        failures.push(AttemptFailure {
                            candidate: "<unknown>".into(),
                            error: StackError::Io {
                                code: "spark.taps.attempt_panicked",
                                detail: err.to_string(),
                            },
                        });
                        if racer.set.is_empty() {
                            racer.passive_running = false;
                        }
                        if racer.active_in_flight() < max_concurrent
                            && let Some(attempt) = next.take()
                        {
                            racer.launch(attempt);
                            next = pending.next();
                            stagger.as_mut().reset(Instant::now() + settings.stagger_delay);
                        }
                        continue;
                    }
                };
                if Some(index) == racer.passive_index {
                    racer.passive_running = false;
                }
                match outcome {
                    Ok(winner) => {
                        let label = racer.labels[index].clone();
                        let attempts_started = racer.active_started();
                        info!(candidate = %label, elapsed_ms = started_at.elapsed().as_millis() as u64, "attempt won the race");
                        racer.dismiss(Some(index));
                        return Ok(Victory { winner, label, attempts_started });
                    }
                    Err(error) => {
                        warn!(candidate = %racer.labels[index], error = %error, "attempt failed");
                        failures.push(AttemptFailure {
                            candidate: racer.labels[index].clone(),
                            error,
                        });
                        if racer.active_in_flight() < max_concurrent
                            && let Some(attempt) = next.take()
                        {
                            racer.launch(attempt);
                            next = pending.next();
                            stagger.as_mut().reset(Instant::now() + settings.stagger_delay);
                        }
                    }
                }
            }
            _ = &mut stagger, if can_launch => {
                if let Some(attempt) = next.take() {
                    racer.launch(attempt);
                }
                next = pending.next();
                stagger.as_mut().reset(Instant::now() + settings.stagger_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Winner(&'static str, Arc<Mutex<Vec<String>>>);

    impl Contender for Winner {
        fn discard(self) -> BoxFuture<'static, ()> {
            async move { self.1.lock().push(format!("discard {}", self.0)) }.boxed()
        }
    }

    fn scripted(
        name: &'static str,
        delay_ms: u64,
        succeed: bool,
        log: Arc<Mutex<Vec<String>>>,
    ) -> Attempt<Winner> {
        Attempt::new(name, move |token: Cancellation| {
            async move {
                log.lock().push(format!("start {name}"));
                tokio::select! {
                    _ = token.cancelled() => {
                        log.lock().push(format!("cancel {name}"));
                        Err(StackError::Cancelled)
                    }
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                        if succeed {
                            Ok(Winner(name, log))
                        } else {
                            Err(StackError::Refused { peer: name.into() })
                        }
                    }
                }
            }
            .boxed()
        })
    }

    async fn explode(delay_ms: u64) -> Result<Winner, StackError> {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        panic!("dial implementation bug")
    }

    fn settings() -> RaceSettings {
        RaceSettings {
            stagger_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
            max_concurrent: 4,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn early_winner_prevents_later_dials() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let victory = race(
            vec![
                scripted("a", 50, true, log.clone()),
                scripted("b", 10, true, log.clone()),
            ],
            None,
            settings(),
            &Cancellation::new(),
        )
        .await
        .unwrap_or_else(|err| panic!("race failed: {err}"));
        assert_eq!(victory.label, "a");
        assert_eq!(victory.attempts_started, 1);
        assert_eq!(*log.lock(), vec!["start a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn failures_and_winner_are_logged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        race(
            vec![
                scripted("a", 5, false, log.clone()),
                scripted("b", 5, true, log.clone()),
            ],
            None,
            settings(),
            &Cancellation::new(),
        )
        .await
        .unwrap_or_else(|err| panic!("race failed: {err}"));
        assert!(logs_contain("attempt failed"));
        assert!(logs_contain("attempt won the race"));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_starts_next_attempt_early() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let begun = Instant::now();
        let victory = race(
            vec![
                scripted("a", 20, false, log.clone()),
                scripted("b", 130, true, log.clone()),
            ],
            None,
            settings(),
            &Cancellation::new(),
        )
        .await
        .unwrap_or_else(|err| panic!("race failed: {err}"));
        assert_eq!(victory.label, "b");
        assert_eq!(begun.elapsed(), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_winner_cancels_overlapping_attempt() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let victory = race(
            vec![
                scripted("a", 150, true, log.clone()),
                scripted("b", 500, true, log.clone()),
            ],
            None,
            settings(),
            &Cancellation::new(),
        )
        .await
        .unwrap_or_else(|err| panic!("race failed: {err}"));
        assert_eq!(victory.label, "a");
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(log.lock().contains(&"cancel b".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn every_failure_is_reported() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = race(
            vec![
                scripted("a", 10, false, log.clone()),
                scripted("b", 10, false, log.clone()),
            ],
            None,
            settings(),
            &Cancellation::new(),
        )
        .await
        .err()
        .expect("race must fail");
        match err {
            TapsError::AllCandidatesFailed { failures } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_fails_the_race() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = race(
            vec![scripted("a", 10_000, true, log.clone())],
            None,
            RaceSettings {
                timeout: Duration::from_millis(300),
                ..settings()
            },
            &Cancellation::new(),
        )
        .await
        .err()
        .expect("race must time out");
        assert!(matches!(err, TapsError::EstablishmentTimeout { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_defers_launches() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let victory = race(
            vec![
                scripted("a", 1_000, true, log.clone()),
                scripted("b", 10, true, log.clone()),
            ],
            None,
            RaceSettings {
                max_concurrent: 1,
                ..settings()
            },
            &Cancellation::new(),
        )
        .await
        .unwrap_or_else(|err| panic!("race failed: {err}"));
        assert_eq!(victory.label, "a");
        assert_eq!(*log.lock(), vec!["start a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_attempt_counts_as_failure_and_starts_next() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let broken = Attempt::new("broken", |_token: Cancellation| explode(5).boxed());
        let started = Instant::now();
        let victory = race(
            vec![broken, scripted("b", 10, true, log.clone())],
            None,
            settings(),
            &Cancellation::new(),
        )
        .await
        .unwrap_or_else(|err| panic!("race failed: {err}"));
        assert_eq!(victory.label, "b");
        assert_eq!(victory.attempts_started, 2);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_attempts_are_reported_with_their_label() {
        let broken = Attempt::new("broken", |_token: Cancellation| explode(0).boxed());
        let err = race(vec![broken], None, settings(), &Cancellation::new())
            .await
            .err()
            .expect("race must fail");
        let TapsError::AllCandidatesFailed { failures } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].candidate, "broken");
        assert!(matches!(
            &failures[0].error,
            StackError::Io { code: "spark.taps.attempt_panicked", detail } if detail == "dial implementation bug"
        ));
    }
}

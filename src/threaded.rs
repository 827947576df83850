//! 后台计算的提交、取消与阻塞取结果.
//!
//! 一次分析作为一个独立的工作单元在 rayon 线程池上运行. 调用方持有
//! [`ThreadedComputation`], 可随时请求取消 (工作单元通过 [`CancellationToken`]
//! 协作轮询), 最终通过 [`ThreadedComputation::get_result`] 阻塞等待结果.
//! 结果区分四种情况: 取消、等待被中断、工作单元自身的错误、其他计算失败.
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// 协作取消标记. 克隆共享同一个标记.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancellationToken").field(&self.is_cancelled()).finish()
    }
}

/// 绑定了网与参数的一次分析.
pub trait AnalysisCallable: Send + 'static {
    type Output: Send + 'static;
    type Error: std::error::Error + Send + 'static;

    fn call(self, cancel: &CancellationToken) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Error)]
pub enum ThreadedError<E> {
    #[error("computation was cancelled")]
    Cancelled,
    #[error("waiting for the computation was interrupted")]
    Interrupted,
    #[error(transparent)]
    Failed(E),
    #[error("computation failed: {message}")]
    Computation { message: String },
}

type Outcome<T, E> = Result<T, ThreadedError<E>>;

struct State<T, E> {
    outcome: Option<Outcome<T, E>>,
    published: bool,
    interrupted: bool,
}

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
    ready: Condvar,
}

impl<T, E> Shared<T, E> {
    fn lock(&self) -> MutexGuard<'_, State<T, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 发布结果. 在发布之前已请求取消时, 结果一律为 `Cancelled`.
    fn publish(&self, outcome: Outcome<T, E>, token: &CancellationToken) {
        let mut state = self.lock();
        if state.published {
            return;
        }
        state.outcome = Some(if token.is_cancelled() {
            Err(ThreadedError::Cancelled)
        } else {
            outcome
        });
        state.published = true;
        drop(state);
        self.ready.notify_all();
    }
}

/// 工作单元被丢弃而未发布结果时, 补发一个计算错误.
struct PublishGuard<T, E> {
    shared: Arc<Shared<T, E>>,
    token: CancellationToken,
}

impl<T, E> PublishGuard<T, E> {
    fn publish(&self, outcome: Outcome<T, E>) {
        self.shared.publish(outcome, &self.token);
    }
}

impl<T, E> Drop for PublishGuard<T, E> {
    fn drop(&mut self) {
        self.shared.publish(
            Err(ThreadedError::Computation {
                message: "worker terminated without producing a result".to_string(),
            }),
            &self.token,
        );
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "computation panicked".to_string()
    }
}

/// 用于唤醒阻塞在 `get_result` 上的调用方.
pub struct Interrupter<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Interrupter<T, E> {
    pub fn interrupt(&self) {
        self.shared.lock().interrupted = true;
        self.shared.ready.notify_all();
    }
}

impl<T, E> Clone for Interrupter<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// 一次性的后台计算句柄; `get_result` 消耗句柄.
pub struct ThreadedComputation<T, E> {
    shared: Arc<Shared<T, E>>,
    token: CancellationToken,
}

impl<T, E> ThreadedComputation<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + 'static,
{
    /// 在全局 rayon 线程池上启动计算, 立即返回.
    pub fn submit<C>(callable: C) -> Self
    where
        C: AnalysisCallable<Output = T, Error = E>,
    {
        let (handle, job) = Self::prepare(callable);
        rayon::spawn(job);
        handle
    }

    /// 在调用方提供的线程池上启动计算.
    pub fn submit_in<C>(pool: &rayon::ThreadPool, callable: C) -> Self
    where
        C: AnalysisCallable<Output = T, Error = E>,
    {
        let (handle, job) = Self::prepare(callable);
        pool.spawn(job);
        handle
    }

    fn prepare<C>(callable: C) -> (Self, impl FnOnce() + Send + 'static)
    where
        C: AnalysisCallable<Output = T, Error = E>,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                outcome: None,
                published: false,
                interrupted: false,
            }),
            ready: Condvar::new(),
        });
        let token = CancellationToken::new();
        let guard = PublishGuard {
            shared: Arc::clone(&shared),
            token: token.clone(),
        };

        let job = move || {
            if guard.token.is_cancelled() {
                guard.publish(Err(ThreadedError::Cancelled));
                return;
            }
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| callable.call(&guard.token))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(ThreadedError::Failed(err)),
                Err(payload) => {
                    let message = panic_message(payload);
                    log::error!("analysis panicked: {}", message);
                    Err(ThreadedError::Computation { message })
                }
            };
            guard.publish(outcome);
        };

        (Self { shared, token }, job)
    }
}

impl<T, E> ThreadedComputation<T, E> {
    /// 请求取消. 结果已发布时返回 `false`, 此时取消不生效.
    pub fn cancel(&self) -> bool {
        let state = self.shared.lock();
        if state.published {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.shared.lock().published
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn interrupter(&self) -> Interrupter<T, E> {
        Interrupter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 阻塞直到结果可用. 等待被中断时同时取消工作单元.
    pub fn get_result(self) -> Result<T, ThreadedError<E>> {
        let mut state = self.shared.lock();
        loop {
            if let Some(outcome) = state.outcome.take() {
                return outcome;
            }
            if state.interrupted {
                drop(state);
                self.token.cancel();
                return Err(ThreadedError::Interrupted);
            }
            state = self
                .shared
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T, E> fmt::Debug for ThreadedComputation<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedComputation")
            .field("cancelled", &self.token.is_cancelled())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Error, PartialEq, Eq)]
    #[error("bad input: {0}")]
    struct BadInput(u32);

    struct Work<F>(F);

    impl<F> AnalysisCallable for Work<F>
    where
        F: FnOnce(&CancellationToken) -> Result<u32, BadInput> + Send + 'static,
    {
        type Output = u32;
        type Error = BadInput;

        fn call(self, cancel: &CancellationToken) -> Result<u32, BadInput> {
            (self.0)(cancel)
        }
    }

    fn wait_for_cancel(cancel: &CancellationToken) -> Result<u32, BadInput> {
        while !cancel.is_cancelled() {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(0)
    }

    #[test]
    fn returns_value() {
        let computation = ThreadedComputation::submit(Work(|_: &CancellationToken| -> Result<u32, BadInput> { Ok(42) }));
        assert_eq!(computation.get_result().unwrap(), 42);
    }

    #[test]
    fn typed_error_is_unwrapped() {
        let computation = ThreadedComputation::submit(Work(|_: &CancellationToken| -> Result<u32, BadInput> {
            Err(BadInput(3))
        }));
        match computation.get_result() {
            Err(ThreadedError::Failed(err)) => assert_eq!(err, BadInput(3)),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn panic_becomes_computation_error() {
        let computation = ThreadedComputation::submit(Work(|_: &CancellationToken| -> Result<u32, BadInput> {
            panic!("boom")
        }));
        match computation.get_result() {
            Err(ThreadedError::Computation { message }) => assert!(message.contains("boom")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn cancel_before_completion() {
        let computation = ThreadedComputation::submit(Work(wait_for_cancel));
        thread::sleep(Duration::from_millis(10));
        assert!(computation.cancel());
        assert!(matches!(computation.get_result(), Err(ThreadedError::Cancelled)));
    }

    #[test]
    fn cancel_after_completion_has_no_effect() {
        let computation = ThreadedComputation::submit(Work(|_: &CancellationToken| -> Result<u32, BadInput> { Ok(7) }));
        while !computation.is_done() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!computation.cancel());
        assert_eq!(computation.get_result().unwrap(), 7);
    }

    #[test]
    fn interrupt_wakes_waiter_and_cancels_work() {
        let computation = ThreadedComputation::submit(Work(wait_for_cancel));
        let token = computation.cancellation_token();
        let interrupter = computation.interrupter();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            interrupter.interrupt();
        });
        assert!(matches!(computation.get_result(), Err(ThreadedError::Interrupted)));
        assert!(token.is_cancelled());
        waker.join().unwrap();
    }

    #[test]
    fn runs_on_supplied_pool() {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(|i| format!("analysis-{}", i))
            .build()
            .unwrap();
        let computation = ThreadedComputation::submit_in(
            &pool,
            Work(|_: &CancellationToken| -> Result<u32, BadInput> {
                let name = thread::current().name().map(str::to_string);
                assert_eq!(name.as_deref(), Some("analysis-0"));
                Ok(1)
            }),
        );
        assert_eq!(computation.get_result().unwrap(), 1);
    }
}

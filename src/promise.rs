use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::callback::{deliver, guard, BoxCallback};
use crate::combinators;
use crate::dispatch::Context;
use crate::outcome::Try;
use crate::{Cause, Error};

/// A single-assignment, thread-safe result cell with listeners.
///
/// Cloning a `Promise` clones the handle; every clone sees the same state.
/// The first of [`success`](Promise::success), [`failure`](Promise::failure),
/// [`complete`](Promise::complete) or [`cancel`](Promise::cancel) wins and
/// every later call is a no-op.
///
/// # Examples
///
/// ```
/// use promise_chain::{Context, Promise};
/// use futures::executor::block_on;
/// use std::thread;
///
/// let ctx = Context::with_config(Default::default()).unwrap();
/// let promise = Promise::<String>::new(&ctx);
/// let greeting = promise.map(|s| format!("{}!", s));
///
/// let producer = promise.clone();
/// let task = thread::spawn(move || producer.success("Hi".into()));
///
/// assert_eq!(block_on(greeting).unwrap(), "Hi!");
/// task.join().expect("The producer thread has panicked.");
/// ```
pub struct Promise<V> {
    inner: Arc<Inner<V>>,
}

struct Inner<V> {
    ctx: Context,
    state: Mutex<State<V>>,
    settled: Condvar,
}

#[derive(Clone)]
enum Phase<V> {
    Pending,
    Completed(Try<V>),
    Canceled,
}

impl<V: Clone> Phase<V> {
    fn outcome(&self) -> Result<V, Error> {
        match self {
            Phase::Pending => Err(Error::NotDone),
            Phase::Completed(Try::Success(value)) => Ok(value.clone()),
            Phase::Completed(Try::Failure(cause)) => Err(Error::Failed(cause.clone())),
            Phase::Canceled => Err(Error::Canceled),
        }
    }
}

struct State<V> {
    phase: Phase<V>,
    recovery: Option<Continuation<V>>,
    on_complete: Vec<BoxCallback<Try<V>>>,
    on_success: Vec<BoxCallback<V>>,
    on_failure: Vec<BoxCallback<Cause>>,
    mapped: Vec<Continuation<V>>,
    flat_mapped: Vec<Continuation<V>>,
    /// Promises canceled along with this one that no continuation owns.
    linked: Vec<Box<dyn Cancel>>,
    wakers: Vec<Waker>,
}

/// A child promise and the step that settles it from the parent's result.
struct Continuation<V> {
    child: Box<dyn Cancel>,
    resolve: Box<dyn FnOnce(Try<V>) + Send>,
}

pub(crate) trait Cancel: Send {
    fn cancel(&self) -> bool;
}

/// Work for the pathway that runs off the coordinating thread.
struct Background<V> {
    result: Try<V>,
    recovery: Option<Continuation<V>>,
    callbacks: Vec<BoxCallback<Try<V>>>,
    mapped: Vec<Continuation<V>>,
    flat_mapped: Vec<Continuation<V>>,
}

impl<V: Clone + 'static> Background<V> {
    fn is_empty(&self) -> bool {
        self.recovery.is_none()
            && self.callbacks.is_empty()
            && self.mapped.is_empty()
            && self.flat_mapped.is_empty()
    }

    fn run(self) {
        let Background {
            result,
            recovery,
            callbacks,
            mapped,
            flat_mapped,
        } = self;
        if let Some(hook) = recovery {
            (hook.resolve)(result.clone());
        }
        for callback in callbacks {
            deliver(callback, result.clone());
        }
        for continuation in mapped.into_iter().chain(flat_mapped) {
            (continuation.resolve)(result.clone());
        }
    }
}

/// Work for the pathway that runs on the coordinating thread.
struct Foreground<V> {
    result: Try<V>,
    on_success: Vec<BoxCallback<V>>,
    on_failure: Vec<BoxCallback<Cause>>,
}

impl<V: Clone + 'static> Foreground<V> {
    fn is_empty(&self) -> bool {
        match self.result {
            Try::Success(_) => self.on_success.is_empty(),
            Try::Failure(_) => self.on_failure.is_empty(),
        }
    }

    fn run(self) {
        match self.result {
            Try::Success(value) => {
                for callback in self.on_success {
                    deliver(callback, value.clone());
                }
            }
            Try::Failure(cause) => {
                for callback in self.on_failure {
                    deliver(callback, cause.clone());
                }
            }
        }
    }
}

impl<V> Clone for Promise<V> {
    fn clone(&self) -> Self {
        Promise {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone + Send + 'static> Promise<V> {
    pub fn new(ctx: &Context) -> Self {
        Promise {
            inner: Arc::new(Inner {
                ctx: ctx.clone(),
                state: Mutex::new(State {
                    phase: Phase::Pending,
                    recovery: None,
                    on_complete: Vec::new(),
                    on_success: Vec::new(),
                    on_failure: Vec::new(),
                    mapped: Vec::new(),
                    flat_mapped: Vec::new(),
                    linked: Vec::new(),
                    wakers: Vec::new(),
                }),
                settled: Condvar::new(),
            }),
        }
    }

    /// A promise that has already succeeded with `value`.
    pub fn successful(ctx: &Context, value: V) -> Self {
        let promise = Promise::new(ctx);
        promise.success(value);
        promise
    }

    /// A promise that has already failed with `error`.
    pub fn failed<E>(ctx: &Context, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let promise = Promise::new(ctx);
        promise.failure(error);
        promise
    }

    /// Completes with `value`. Returns `false` if the promise had already
    /// been completed or canceled.
    pub fn success(&self, value: V) -> bool {
        self.complete(Try::Success(value))
    }

    /// Completes with `error`. Returns `false` if the promise had already
    /// been completed or canceled.
    pub fn failure<E>(&self, error: E) -> bool
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.complete(Try::failure(error))
    }

    /// Completes with `result` and delivers it to every listener.
    ///
    /// The pathway that belongs to the calling thread runs before this
    /// returns; the other one is handed to the executor or coordinator.
    pub fn complete(&self, result: Try<V>) -> bool {
        let (background, foreground, wakers, _linked) = {
            let mut state = self.inner.state.lock();
            if !matches!(state.phase, Phase::Pending) {
                trace!("ignoring completion of a settled promise");
                return false;
            }
            if let Try::Failure(cause) = &result {
                debug!("promise not kept: {}", cause);
            }
            state.phase = Phase::Completed(result.clone());
            self.inner.settled.notify_all();
            let background = Background {
                result: result.clone(),
                recovery: state.recovery.take(),
                callbacks: mem::take(&mut state.on_complete),
                mapped: mem::take(&mut state.mapped),
                flat_mapped: mem::take(&mut state.flat_mapped),
            };
            let foreground = Foreground {
                result,
                on_success: mem::take(&mut state.on_success),
                on_failure: mem::take(&mut state.on_failure),
            };
            (
                background,
                foreground,
                mem::take(&mut state.wakers),
                mem::take(&mut state.linked),
            )
        };

        for waker in wakers {
            waker.wake();
        }

        let ctx = &self.inner.ctx;
        if ctx.on_coordinator_thread() {
            foreground.run();
            if !background.is_empty() {
                ctx.submit(Box::new(move || background.run()));
            }
        } else {
            background.run();
            if !foreground.is_empty() {
                ctx.schedule(Box::new(move || foreground.run()));
            }
        }
        true
    }

    /// Cancels a pending promise: its queued listeners never fire and every
    /// child still waiting on it is canceled too. Returns `false` if the
    /// promise had already been completed or canceled.
    ///
    /// A pathway already handed to another thread is not interrupted.
    pub fn cancel(&self) -> bool {
        // Listeners are dropped only after the lock is released.
        let (continuations, linked, wakers, _listeners) = {
            let mut state = self.inner.state.lock();
            if !matches!(state.phase, Phase::Pending) {
                return false;
            }
            state.phase = Phase::Canceled;
            self.inner.settled.notify_all();
            let listeners = (
                mem::take(&mut state.on_complete),
                mem::take(&mut state.on_success),
                mem::take(&mut state.on_failure),
            );
            let mut continuations: Vec<Continuation<V>> = state.recovery.take().into_iter().collect();
            continuations.append(&mut state.mapped);
            continuations.append(&mut state.flat_mapped);
            (
                continuations,
                mem::take(&mut state.linked),
                mem::take(&mut state.wakers),
                listeners,
            )
        };
        debug!(
            "promise canceled with {} dependent promises",
            continuations.len() + linked.len()
        );

        for waker in wakers {
            waker.wake();
        }
        for continuation in continuations {
            continuation.child.cancel();
        }
        for dependent in linked {
            dependent.cancel();
        }
        true
    }

    pub fn is_done(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Canceled)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Completed(Try::Failure(_)))
    }

    /// The result, once completed.
    pub fn result(&self) -> Option<Try<V>> {
        match &self.inner.state.lock().phase {
            Phase::Completed(result) => Some(result.clone()),
            _ => None,
        }
    }

    /// Runs `callback` with the result, off the coordinating thread.
    ///
    /// If the promise is already done the callback runs right away on the
    /// calling thread.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(Try<V>) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match state.phase.clone() {
            Phase::Pending => {
                trace!("queuing completion listener");
                state.on_complete.push(Box::new(callback));
            }
            Phase::Completed(result) => {
                drop(state);
                deliver(Box::new(callback), result);
            }
            Phase::Canceled => trace!("dropping completion listener of a canceled promise"),
        }
    }

    /// Runs `callback` with the value on the coordinating thread, if the
    /// promise succeeds.
    ///
    /// If the promise already succeeded the callback runs right away on the
    /// calling thread; if it already failed the callback is dropped.
    pub fn on_success<F>(&self, callback: F)
    where
        F: FnOnce(V) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match state.phase.clone() {
            Phase::Pending => state.on_success.push(Box::new(callback)),
            Phase::Completed(Try::Success(value)) => {
                drop(state);
                deliver(Box::new(callback), value);
            }
            Phase::Completed(Try::Failure(_)) | Phase::Canceled => {}
        }
    }

    /// Runs `callback` with the cause on the coordinating thread, if the
    /// promise fails.
    ///
    /// If the promise already failed the callback runs right away on the
    /// calling thread; if it already succeeded the callback is dropped.
    pub fn on_failure<F>(&self, callback: F)
    where
        F: FnOnce(Cause) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match state.phase.clone() {
            Phase::Pending => state.on_failure.push(Box::new(callback)),
            Phase::Completed(Try::Failure(cause)) => {
                drop(state);
                deliver(Box::new(callback), cause);
            }
            Phase::Completed(Try::Success(_)) | Phase::Canceled => {}
        }
    }

    /// A promise of `f` applied to this promise's value.
    ///
    /// A failure is forwarded without calling `f`. On an already completed
    /// promise `f` runs immediately on the calling thread; otherwise it runs
    /// on the background pathway. A panic in `f` fails the returned promise.
    pub fn map<T, F>(&self, f: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(V) -> T + Send + 'static,
    {
        let child = Promise::new(&self.inner.ctx);
        let mut state = self.inner.state.lock();
        match state.phase.clone() {
            Phase::Pending => {
                trace!("queuing map");
                let target = child.clone();
                state.mapped.push(Continuation {
                    child: Box::new(child.clone()),
                    resolve: Box::new(move |result: Try<V>| target.settle_mapped(result, f)),
                });
            }
            Phase::Completed(result) => {
                drop(state);
                trace!("executing instant map");
                child.settle_mapped(result, f);
            }
            Phase::Canceled => {
                drop(state);
                child.cancel();
            }
        }
        child
    }

    /// A promise of the promise `f` returns for this promise's value.
    ///
    /// The returned promise always relays the outcome of the inner one, even
    /// when this promise is already done. A failure is forwarded without
    /// calling `f`.
    pub fn flat_map<T, F>(&self, f: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(V) -> Promise<T> + Send + 'static,
    {
        let child = Promise::new(&self.inner.ctx);
        let mut state = self.inner.state.lock();
        match state.phase.clone() {
            Phase::Pending => {
                trace!("queuing flat map");
                let target = child.clone();
                state.flat_mapped.push(Continuation {
                    child: Box::new(child.clone()),
                    resolve: Box::new(move |result: Try<V>| target.settle_flat_mapped(result, f)),
                });
            }
            Phase::Completed(result) => {
                drop(state);
                child.settle_flat_mapped(result, f);
            }
            Phase::Canceled => {
                drop(state);
                child.cancel();
            }
        }
        child
    }

    /// A promise that takes this promise's value, or, if this promise fails,
    /// the outcome of one attempt at `recovery` run on the executor.
    ///
    /// `recovery` is never called when this promise succeeds, and never
    /// retried when it fails itself.
    pub fn recover<E, F>(&self, recovery: F) -> Promise<V>
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
        F: FnOnce() -> Result<V, E> + Send + 'static,
    {
        let recovered = Promise::new(&self.inner.ctx);
        let target = recovered.clone();
        let ctx = self.inner.ctx.clone();
        let hook = move |result: Try<V>| match result {
            Try::Success(value) => {
                target.success(value);
            }
            Try::Failure(cause) => {
                debug!("recovering from: {}", cause);
                combinators::create(&ctx, recovery).on_complete(move |outcome| {
                    target.complete(outcome);
                });
            }
        };

        let mut state = self.inner.state.lock();
        match state.phase.clone() {
            Phase::Pending if state.recovery.is_none() => {
                state.recovery = Some(Continuation {
                    child: Box::new(recovered.clone()),
                    resolve: Box::new(hook),
                });
            }
            Phase::Pending => {
                trace!("recovery hook taken, recovering through a completion listener");
                state.on_complete.push(Box::new(hook));
                state.linked.push(Box::new(recovered.clone()));
            }
            Phase::Completed(result) => {
                drop(state);
                hook(result);
            }
            Phase::Canceled => {
                drop(state);
                recovered.cancel();
            }
        }
        recovered
    }

    /// The value, without blocking.
    ///
    /// Fails with [`Error::NotDone`] while pending, [`Error::NotSucceeded`]
    /// after a failure and [`Error::Canceled`] after cancellation.
    pub fn get_value(&self) -> Result<V, Error> {
        match &self.inner.state.lock().phase {
            Phase::Pending => Err(Error::NotDone),
            Phase::Completed(Try::Success(value)) => Ok(value.clone()),
            Phase::Completed(Try::Failure(_)) => Err(Error::NotSucceeded),
            Phase::Canceled => Err(Error::Canceled),
        }
    }

    /// The failure cause, without blocking.
    pub fn get_error(&self) -> Result<Cause, Error> {
        match &self.inner.state.lock().phase {
            Phase::Pending => Err(Error::NotDone),
            Phase::Completed(Try::Failure(cause)) => Ok(cause.clone()),
            Phase::Completed(Try::Success(_)) => Err(Error::NotFailed),
            Phase::Canceled => Err(Error::Canceled),
        }
    }

    /// Blocks until the promise is completed or canceled.
    ///
    /// Prefer [`on_success`](Promise::on_success) and
    /// [`on_failure`](Promise::on_failure); calling this on the coordinating
    /// thread stalls every coordinator listener.
    pub fn get(&self) -> Result<V, Error> {
        let mut state = self.inner.state.lock();
        while matches!(state.phase, Phase::Pending) {
            self.inner.settled.wait(&mut state);
        }
        state.phase.outcome()
    }

    /// Like [`get`](Promise::get), giving up with [`Error::Timeout`] once
    /// `timeout` has elapsed.
    pub fn get_timeout(&self, timeout: Duration) -> Result<V, Error> {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => return self.get(),
        };
        let mut state = self.inner.state.lock();
        while matches!(state.phase, Phase::Pending) {
            if self.inner.settled.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        match state.phase {
            Phase::Pending => Err(Error::Timeout(timeout)),
            _ => state.phase.outcome(),
        }
    }

    /// Cancels `dependent` when this promise is canceled, immediately if it
    /// already was.
    fn link(&self, dependent: Box<dyn Cancel>) {
        let mut state = self.inner.state.lock();
        if matches!(state.phase, Phase::Pending) {
            state.linked.push(dependent);
            return;
        }
        let canceled = matches!(state.phase, Phase::Canceled);
        drop(state);
        if canceled {
            dependent.cancel();
        }
    }

    fn settle_mapped<U, F>(&self, result: Try<U>, f: F)
    where
        F: FnOnce(U) -> V,
    {
        match result {
            Try::Success(value) => match guard(move || f(value)) {
                Ok(mapped) => self.success(mapped),
                Err(panicked) => self.complete(Try::Failure(Arc::new(panicked))),
            },
            Try::Failure(cause) => self.complete(Try::Failure(cause)),
        };
    }

    fn settle_flat_mapped<U, F>(&self, result: Try<U>, f: F)
    where
        F: FnOnce(U) -> Promise<V>,
    {
        match result {
            Try::Success(value) => match guard(move || f(value)) {
                Ok(nested) => {
                    let target = self.clone();
                    nested.on_complete(move |outcome| {
                        target.complete(outcome);
                    });
                    nested.link(Box::new(self.clone()));
                }
                Err(panicked) => {
                    self.complete(Try::Failure(Arc::new(panicked)));
                }
            },
            Try::Failure(cause) => {
                self.complete(Try::Failure(cause));
            }
        }
    }
}

impl<V: Clone + Send + 'static> Cancel for Promise<V> {
    fn cancel(&self) -> bool {
        Promise::cancel(self)
    }
}

impl<V: Clone + Send + 'static> Future for Promise<V> {
    type Output = Result<V, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock();
        if matches!(state.phase, Phase::Pending) {
            // Several tasks may await clones of the same promise.
            if !state.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                state.wakers.push(cx.waker().clone());
            }
            return Poll::Pending;
        }
        Poll::Ready(state.phase.outcome())
    }
}

impl<V> fmt::Debug for Promise<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.inner.state.lock().phase {
            Phase::Pending => "pending",
            Phase::Completed(Try::Success(_)) => "succeeded",
            Phase::Completed(Try::Failure(_)) => "failed",
            Phase::Canceled => "canceled",
        };
        f.debug_struct("Promise").field("phase", &phase).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InlineExecutor, ManualCoordinator};
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn manual() -> (Context, Arc<ManualCoordinator>) {
        let coordinator = Arc::new(ManualCoordinator::new());
        (Context::new(Arc::new(InlineExecutor), coordinator.clone()), coordinator)
    }

    fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Clone + Send + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |value| sink.lock().push(value))
    }

    #[test]
    fn test_map_after_success_is_immediate() {
        let (ctx, _) = manual();
        let p = Promise::new(&ctx);
        p.success(5);
        let doubled = p.map(|x| x * 2);
        assert!(doubled.is_done());
        assert_eq!(doubled.get_value().unwrap(), 10);
    }

    #[test]
    fn test_map_after_failure_skips_transform() {
        let (ctx, _) = manual();
        let calls = Arc::new(AtomicUsize::new(0));
        let p = Promise::<i32>::new(&ctx);
        p.failure("x");
        let counter = calls.clone();
        let mapped = p.map(move |x| {
            counter.fetch_add(1, Ordering::SeqCst);
            x * 2
        });
        assert!(mapped.is_failed());
        assert_eq!(mapped.get_error().unwrap().to_string(), "x");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pending_map_resolves_on_completion() {
        let (ctx, _) = manual();
        let p = Promise::<i32>::new(&ctx);
        let mapped = p.map(|x| x + 1).map(|x| x.to_string());
        assert!(!mapped.is_done());
        p.success(41);
        assert_eq!(mapped.get_value().unwrap(), "42");
    }

    #[test]
    fn test_first_completion_wins() {
        let (ctx, _) = manual();
        let p = Promise::new(&ctx);
        assert!(p.success(1));
        assert!(!p.success(2));
        assert!(!p.failure("late"));
        assert!(!p.cancel());
        assert_eq!(p.get_value().unwrap(), 1);
        assert!(!p.is_failed());
        assert!(!p.is_cancelled());
    }

    #[test]
    fn test_late_listeners_fire_only_for_matching_variant() {
        let (ctx, _) = manual();
        let (seen, record) = recorder::<String>();

        let ok = Promise::successful(&ctx, 3);
        let r = record.clone();
        ok.on_success(move |v| r(format!("success {}", v)));
        let r = record.clone();
        ok.on_failure(move |e| r(format!("failure {}", e)));

        let bad = Promise::<i32>::failed(&ctx, "nope");
        let r = record.clone();
        bad.on_success(move |v| r(format!("success {}", v)));
        let r = record.clone();
        bad.on_failure(move |e| r(format!("failure {}", e)));
        let r = record.clone();
        bad.on_complete(move |t: Try<i32>| r(format!("complete {}", t.is_failure())));

        assert_eq!(
            *seen.lock(),
            vec!["success 3", "failure nope", "complete true"]
        );
    }

    #[test]
    fn test_listeners_fire_in_registration_order() {
        let (ctx, _) = manual();
        let (seen, record) = recorder::<u32>();
        let p = Promise::<u32>::new(&ctx);
        for i in 0..5 {
            let r = record.clone();
            p.on_complete(move |_| r(i));
        }
        for i in 10..15 {
            let r = record.clone();
            p.on_success(move |_| r(i));
        }
        p.success(0);
        // Completed on the coordinating thread: coordinator pathway first.
        assert_eq!(*seen.lock(), vec![10, 11, 12, 13, 14, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_worker_completion_defers_coordinator_pathway() {
        let (ctx, coordinator) = manual();
        let main = thread::current().id();
        let (seen, record) = recorder::<(&'static str, bool)>();
        let p = Promise::<u8>::new(&ctx);
        let r = record.clone();
        p.on_complete(move |_| r(("complete", thread::current().id() == main)));
        let r = record.clone();
        p.on_success(move |_| r(("success", thread::current().id() == main)));

        let producer = p.clone();
        thread::spawn(move || producer.success(1)).join().unwrap();
        assert_eq!(*seen.lock(), vec![("complete", false)]);
        assert_eq!(coordinator.run_pending(), 1);
        assert_eq!(*seen.lock(), vec![("complete", false), ("success", true)]);
    }

    #[test]
    fn test_cancel_drops_listeners_and_children() {
        let (ctx, coordinator) = manual();
        let (seen, record) = recorder::<&'static str>();
        let p = Promise::<i32>::new(&ctx);
        let r = record.clone();
        p.on_complete(move |_| r("complete"));
        let r = record.clone();
        p.on_success(move |_| r("success"));
        let r = record.clone();
        p.on_failure(move |_| r("failure"));
        let child = p.map(|x| x + 1);
        let grandchild = child.flat_map(move |x| Promise::successful(&ctx, x));
        let recovered = p.recover(|| Ok::<_, String>(0));

        assert!(p.cancel());
        assert!(!p.cancel());
        assert!(!p.success(1));
        coordinator.run_pending();

        assert!(seen.lock().is_empty());
        assert!(p.is_cancelled());
        assert!(!p.is_done());
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(recovered.is_cancelled());
    }

    #[test]
    fn test_registration_after_cancel() {
        let (ctx, _) = manual();
        let p = Promise::<i32>::new(&ctx);
        p.cancel();
        assert!(p.map(|x| x).is_cancelled());
        let inner_ctx = ctx.clone();
        assert!(p.flat_map(move |x| Promise::successful(&inner_ctx, x)).is_cancelled());
        assert!(p.recover(|| Ok::<_, String>(1)).is_cancelled());
    }

    #[test]
    fn test_accessor_state_errors() {
        let (ctx, _) = manual();
        let pending = Promise::<i32>::new(&ctx);
        assert!(matches!(pending.get_value(), Err(Error::NotDone)));
        assert!(matches!(pending.get_error(), Err(Error::NotDone)));

        let ok = Promise::successful(&ctx, 1);
        assert!(matches!(ok.get_error(), Err(Error::NotFailed)));

        let bad = Promise::<i32>::failed(&ctx, "bad");
        assert!(matches!(bad.get_value(), Err(Error::NotSucceeded)));

        pending.cancel();
        assert!(matches!(pending.get_value(), Err(Error::Canceled)));
        assert!(matches!(pending.get_error(), Err(Error::Canceled)));
    }

    #[test]
    fn test_blocking_get_variants() {
        let (ctx, _) = manual();
        let pending = Promise::<i32>::new(&ctx);
        assert!(matches!(
            pending.get_timeout(Duration::from_millis(20)),
            Err(Error::Timeout(_))
        ));

        let bad = Promise::<i32>::failed(&ctx, "bad");
        match bad.get() {
            Err(Error::Failed(cause)) => assert_eq!(cause.to_string(), "bad"),
            other => panic!("unexpected {:?}", other),
        }

        let canceled = Promise::<i32>::new(&ctx);
        canceled.cancel();
        assert!(matches!(canceled.get(), Err(Error::Canceled)));
        assert!(matches!(
            canceled.get_timeout(Duration::from_millis(1)),
            Err(Error::Canceled)
        ));
    }

    #[test]
    fn test_get_wakes_on_completion_from_another_thread() {
        let (ctx, _) = manual();
        let p = Promise::<String>::new(&ctx);
        let producer = p.clone();
        let task = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.success("done".into());
        });
        assert_eq!(p.get_timeout(Duration::from_secs(5)).unwrap(), "done");
        task.join().expect("The producer thread has panicked");
    }

    #[test]
    fn test_flat_map_relays_inner_promise() {
        let (ctx, _) = manual();
        let inner = Promise::<i32>::new(&ctx);
        let p = Promise::<i32>::new(&ctx);
        let relay = inner.clone();
        let chained = p.flat_map(move |x| relay.map(move |y| x + y));
        p.success(1);
        assert!(!chained.is_done());
        inner.success(2);
        assert_eq!(chained.get_value().unwrap(), 3);
    }

    #[test]
    fn test_flat_map_on_completed_routes_through_child() {
        let (ctx, _) = manual();
        let p = Promise::successful(&ctx, 2);
        let inner = Promise::<i32>::new(&ctx);
        let relay = inner.clone();
        let chained = p.flat_map(move |_| relay);
        assert!(!chained.is_done());
        chained.cancel();
        assert!(!inner.is_cancelled());
        inner.success(7);
        assert!(chained.is_cancelled());
    }

    #[test]
    fn test_cancel_reaches_every_recovery() {
        let (ctx, _) = manual();
        let p = Promise::<i32>::new(&ctx);
        let first = p.recover(|| Ok::<_, String>(1));
        let second = p.recover(|| Ok::<_, String>(2));
        assert!(p.cancel());
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(matches!(
            second.get_timeout(Duration::from_millis(50)),
            Err(Error::Canceled)
        ));
    }

    #[test]
    fn test_second_recovery_runs_after_failure() {
        let (ctx, _) = manual();
        let p = Promise::<i32>::new(&ctx);
        let first = p.recover(|| Ok::<_, String>(1));
        let second = p.recover(|| Ok::<_, String>(2));
        p.failure("down");
        assert_eq!(first.get_value().unwrap(), 1);
        assert_eq!(second.get_value().unwrap(), 2);
    }

    #[test]
    fn test_canceled_inner_cancels_flat_map_child() {
        let (ctx, _) = manual();
        let p = Promise::<i32>::new(&ctx);
        let inner = Promise::<i32>::new(&ctx);
        let relay = inner.clone();
        let chained = p.flat_map(move |_| relay);
        p.success(1);
        assert!(inner.cancel());
        assert!(chained.is_cancelled());
        assert!(matches!(
            chained.get_timeout(Duration::from_millis(50)),
            Err(Error::Canceled)
        ));

        let late = Promise::successful(&ctx, 1).flat_map(move |_| inner);
        assert!(late.is_cancelled());
    }

    #[test]
    fn test_flat_map_failure_skips_transform() {
        let (ctx, _) = manual();
        let p = Promise::<i32>::failed(&ctx, "broken");
        let chained = p.flat_map(|x: i32| -> Promise<i32> { panic!("must not run for {}", x) });
        assert_eq!(chained.get_error().unwrap().to_string(), "broken");
    }

    #[test]
    fn test_panicking_map_fails_child() {
        let (ctx, _) = manual();
        let p = Promise::successful(&ctx, 1);
        let mapped = p.map(|_| -> i32 { panic!("transform broke") });
        let cause = mapped.get_error().unwrap();
        assert!(cause.to_string().contains("transform broke"));
    }

    #[test]
    fn test_recover_adopts_single_attempt() {
        let (ctx, _) = manual();
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let bad = Promise::<i32>::new(&ctx);
        let recovered = bad.recover(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(7)
        });
        bad.failure("first");
        assert_eq!(recovered.get_value().unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let counter = attempts.clone();
        let still_bad = Promise::<i32>::failed(&ctx, "first").recover(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<i32, _>("second")
        });
        assert_eq!(still_bad.get_error().unwrap().to_string(), "second");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_recover_forwards_success() {
        let (ctx, _) = manual();
        let p = Promise::<i32>::new(&ctx);
        let first = p.recover(|| -> Result<i32, String> { panic!("never called") });
        let second = p.recover(|| -> Result<i32, String> { panic!("never called") });
        p.success(4);
        assert_eq!(first.get_value().unwrap(), 4);
        assert_eq!(second.get_value().unwrap(), 4);
    }

    #[test]
    fn test_listener_may_reenter_its_promise() {
        let (ctx, _) = manual();
        let (seen, record) = recorder::<i32>();
        let p = Promise::<i32>::new(&ctx);
        let other = Promise::<i32>::new(&ctx);
        let (again, target, r) = (p.clone(), other.clone(), record.clone());
        p.on_complete(move |t: Try<i32>| {
            let r2 = r.clone();
            again.on_complete(move |_| r2(1));
            target.success(t.value().copied().unwrap_or_default() * 10);
            r(0);
        });
        p.success(5);
        assert_eq!(*seen.lock(), vec![1, 0]);
        assert_eq!(other.get_value().unwrap(), 50);
    }

    #[test]
    fn test_await_completed_from_thread() {
        let (ctx, _) = manual();
        let p = Promise::<u64>::new(&ctx);
        let consumer = p.clone();
        let waiter = thread::spawn(move || block_on(consumer));
        thread::sleep(Duration::from_millis(10));
        p.success(9);
        assert_eq!(waiter.join().unwrap().unwrap(), 9);
    }

    #[test]
    fn test_await_canceled() {
        let (ctx, _) = manual();
        let p = Promise::<u64>::new(&ctx);
        p.cancel();
        assert!(matches!(block_on(p), Err(Error::Canceled)));
    }
}

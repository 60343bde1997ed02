//! Adapters that run user code with a captured context pushed.
//!
//! Only the call sites that resume user code (callbacks, listener
//! invocations, future polls) push the context. Plain accessors forward.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::{store, RequestContext};
use crate::error::{Error, Result};
use crate::executor::{Executor, Task};
use crate::future::{Outcome, ProgressivePromise, Promise};

/// Wraps a one-shot callback so it runs with `ctx` as the current context.
pub fn wrap<F, R>(ctx: Arc<dyn RequestContext>, f: F) -> impl FnOnce() -> R + Send
where
    F: FnOnce() -> R + Send + 'static,
{
    move || ctx.run(f)
}

/// Wraps a reusable one-argument callback so every call runs with `ctx` pushed.
pub fn wrap_fn<F, A, R>(ctx: Arc<dyn RequestContext>, mut f: F) -> impl FnMut(A) -> R + Send
where
    F: FnMut(A) -> R + Send + 'static,
{
    move |arg: A| ctx.run(|| f(arg))
}

// ---------------------------------------------------------------------------
// Futures
// ---------------------------------------------------------------------------

/// A future that pushes its context and enters the request span on every poll.
pub struct ContextAware<F> {
    ctx: Arc<dyn RequestContext>,
    inner: Pin<Box<F>>,
}

impl<F> fmt::Debug for ContextAware<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextAware")
            .field("ctx", &self.ctx.to_string())
            .finish_non_exhaustive()
    }
}

impl<F: Future> Future for ContextAware<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _guard = store::enter(Arc::clone(&self.ctx));
        let _span = self.ctx.span().clone().entered();
        self.inner.as_mut().poll(cx)
    }
}

/// Extension for attaching a context to any future.
pub trait WithContext: Future + Sized {
    fn with_context(self, ctx: Arc<dyn RequestContext>) -> ContextAware<Self> {
        ContextAware {
            ctx,
            inner: Box::pin(self),
        }
    }
}

impl<F: Future> WithContext for F {}

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

/// Executor decorator that runs every submitted task with a captured context.
pub struct ContextAwareExecutor {
    ctx: Arc<dyn RequestContext>,
    inner: Arc<dyn Executor>,
}

impl ContextAwareExecutor {
    #[must_use]
    pub fn new(ctx: Arc<dyn RequestContext>, inner: Arc<dyn Executor>) -> Self {
        Self { ctx, inner }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<dyn RequestContext> {
        &self.ctx
    }
}

impl Executor for ContextAwareExecutor {
    fn execute(&self, task: Task) {
        self.inner
            .execute(Box::new(wrap(Arc::clone(&self.ctx), task)));
    }
}

impl fmt::Debug for ContextAwareExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextAwareExecutor")
            .field("ctx", &self.ctx.to_string())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Promises
// ---------------------------------------------------------------------------

/// A [`ProgressivePromise`] whose listeners run with a captured context.
pub struct ContextAwarePromise<T> {
    ctx: Arc<dyn RequestContext>,
    inner: ProgressivePromise<T>,
}

impl<T> Clone for ContextAwarePromise<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> ContextAwarePromise<T> {
    #[must_use]
    pub fn new(ctx: Arc<dyn RequestContext>) -> Self {
        Self::wrap(ctx, ProgressivePromise::new())
    }

    #[must_use]
    pub fn wrap(ctx: Arc<dyn RequestContext>, inner: ProgressivePromise<T>) -> Self {
        Self { ctx, inner }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<dyn RequestContext> {
        &self.ctx
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let ctx = Arc::clone(&self.ctx);
        self.inner
            .add_listener(move |outcome| ctx.run(|| listener(outcome)));
    }

    pub fn add_progress_listener<F>(&self, mut listener: F)
    where
        F: FnMut(u64, Option<u64>) + Send + 'static,
    {
        let mut listener = wrap_fn(Arc::clone(&self.ctx), move |(progress, total): (u64, Option<u64>)| {
            listener(progress, total);
        });
        self.inner
            .add_progress_listener(move |progress, total| listener((progress, total)));
    }

    pub fn complete(&self, value: T) -> bool {
        self.inner.complete(value)
    }

    pub fn fail(&self, cause: Error) -> bool {
        self.inner.fail(cause)
    }

    pub fn try_complete(&self, outcome: Outcome<T>) -> bool {
        self.inner.try_complete(outcome)
    }

    /// # Errors
    ///
    /// See [`ProgressivePromise::set_progress`].
    pub fn set_progress(&self, progress: u64, total: Option<u64>) -> Result<()> {
        self.inner.set_progress(progress, total)
    }

    pub fn try_progress(&self, progress: u64, total: Option<u64>) -> bool {
        self.inner.try_progress(progress, total)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    #[must_use]
    pub fn cause(&self) -> Option<Error> {
        self.inner.cause()
    }

    /// # Errors
    ///
    /// The failure cause if the promise failed.
    pub fn get_now(&self, value_if_absent: T) -> Outcome<T> {
        self.inner.get_now(value_if_absent)
    }

    /// # Errors
    ///
    /// The failure cause if the promise failed.
    pub fn join(&self) -> Outcome<T> {
        self.inner.join()
    }

    /// The plain completion promise, e.g. for `.await`.
    #[must_use]
    pub fn promise(&self) -> Promise<T> {
        self.inner.promise().clone()
    }
}

impl<T> fmt::Debug for ContextAwarePromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextAwarePromise")
            .field("ctx", &self.ctx.to_string())
            .field("promise", &*self.inner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::context::test_support::TestContext;
    use crate::context::ContextId;
    use crate::executor::ImmediateEventLoop;

    fn current_id() -> Option<ContextId> {
        store::current().map(|c| c.id())
    }

    #[test]
    fn wrapped_callback_sees_context_on_another_thread() {
        let ctx = TestContext::arc("/wrapped");
        let expected = ctx.id();
        let task = wrap(ctx, current_id);

        let seen = std::thread::spawn(task).join().unwrap();
        assert_eq!(seen, Some(expected));
        assert!(current_id().is_none());
    }

    #[test]
    fn wrap_fn_pushes_on_every_call() {
        let ctx = TestContext::arc("/fn");
        let expected = ctx.id();
        let mut f = wrap_fn(ctx, |n: u32| (n * 2, current_id()));
        assert_eq!(f(2), (4, Some(expected)));
        assert_eq!(f(3), (6, Some(expected)));
        assert!(current_id().is_none());
    }

    #[tokio::test]
    async fn context_aware_future_is_scoped_to_polls() {
        let ctx = TestContext::arc("/future");
        let expected = ctx.id();
        let fut = async {
            let before = current_id();
            tokio::task::yield_now().await;
            (before, current_id())
        }
        .with_context(ctx);

        let (before, after) = tokio::spawn(fut).await.unwrap();
        assert_eq!(before, Some(expected));
        assert_eq!(after, Some(expected));
        assert!(current_id().is_none());
    }

    #[test]
    fn executor_propagates_context() {
        let ctx = TestContext::arc("/exec");
        let expected = ctx.id();
        let exec = ContextAwareExecutor::new(ctx, Arc::new(ImmediateEventLoop));
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        exec.execute(Box::new(move || *s.lock() = current_id()));
        assert_eq!(*seen.lock(), Some(expected));
    }

    #[test]
    fn promise_listeners_run_in_context() {
        let ctx = TestContext::arc("/promise");
        let expected = ctx.id();
        let promise: ContextAwarePromise<u32> = ContextAwarePromise::new(ctx);

        let progress_hits = Arc::new(AtomicUsize::new(0));
        let hits = progress_hits.clone();
        promise.add_progress_listener(move |_, _| {
            assert_eq!(current_id(), Some(expected));
            hits.fetch_add(1, Ordering::SeqCst);
        });
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        promise.add_listener(move |outcome| {
            *s.lock() = Some((*outcome.as_ref().unwrap(), current_id()));
        });

        promise.set_progress(1, Some(2)).unwrap();
        // Completing from a thread with no context still runs the listener in one.
        let completer = promise.clone();
        std::thread::spawn(move || completer.complete(11)).join().unwrap();

        assert_eq!(progress_hits.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), Some((11, Some(expected))));
        assert!(promise.is_done());
    }
}

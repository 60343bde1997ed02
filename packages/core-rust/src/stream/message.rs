use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::subscriber::{Subscriber, Subscription, SubscriptionHandle};
use super::writer::{Rejected, StreamWriter};
use crate::context::{store, RequestContext};
use crate::error::{Error, Result};
use crate::executor::EventLoop;
use crate::future::Promise;
use crate::resource::{safe_release, StreamObject};

/// Lifecycle of a stream.
///
/// `Open -> Closed -> Cleanup`, or `Open -> Cleanup` directly on cancellation
/// or abort. `Cleanup` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
    Cleanup,
}

/// Consumer side of a stream.
pub trait StreamMessage<T: StreamObject>: Send + Sync {
    /// `true` while the producer may still write.
    fn is_open(&self) -> bool;

    /// `true` if the stream is no longer open and nothing was ever written to it.
    fn is_empty(&self) -> bool;

    /// Resolves once the stream has fully terminated.
    ///
    /// Succeeds after `on_complete` was delivered; fails with the close cause,
    /// `CancelledSubscription` or `AbortedStream` otherwise.
    fn completion_future(&self) -> Promise<()>;

    /// Attaches `subscriber`. Every signal it receives runs on `executor`,
    /// with the request context current at subscription pushed.
    ///
    /// Only one subscriber is allowed; later ones are signalled
    /// `on_error(IllegalState)` and never see an element.
    fn subscribe<S>(&self, subscriber: S, executor: Arc<dyn EventLoop>)
    where
        S: Subscriber<T>,
        Self: Sized;

    /// Producer-side cancellation: releases everything still queued and fails
    /// the subscriber and the completion future with `AbortedStream`.
    fn abort(&self);
}

// ---------------------------------------------------------------------------
// Queue entries
// ---------------------------------------------------------------------------

struct DemandTask {
    promise: Promise<()>,
    task: Box<dyn FnOnce() + Send + 'static>,
}

impl DemandTask {
    fn run(self) {
        let DemandTask { promise, task } = self;
        if panic::catch_unwind(AssertUnwindSafe(task)).is_ok() {
            promise.complete(());
        } else {
            warn!("on_demand task panicked");
            promise.fail(Error::other(anyhow::anyhow!("on_demand task panicked")));
        }
    }
}

enum Pending<T> {
    Object(T),
    AwaitDemand(DemandTask),
    Close(Option<Error>),
}

/// Drops an entry that will never be delivered.
fn discard<T: StreamObject>(pending: Pending<T>) {
    match pending {
        Pending::Object(obj) => safe_release(obj),
        Pending::AwaitDemand(marker) => {
            marker.promise.fail(Error::ClosedPublisher);
        }
        Pending::Close(_) => {}
    }
}

fn release_all<T: StreamObject>(queue: VecDeque<Pending<T>>) {
    queue.into_iter().for_each(discard);
}

/// What the drain does with the entry at the head of the queue.
enum Step<T> {
    Deliver(Pending<T>),
    Discard(Pending<T>),
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct State<T> {
    state: StreamState,
    queue: VecDeque<Pending<T>>,
    /// Outstanding demand; `u64::MAX` is unbounded.
    demand: u64,
    executor: Option<Arc<dyn EventLoop>>,
    wrote_any: bool,
    drain_scheduled: bool,
}

impl<T> State<T> {
    /// Claims the drain if a subscriber is attached and no drain is pending.
    fn claim_drain(&mut self) -> Option<Arc<dyn EventLoop>> {
        if self.drain_scheduled {
            return None;
        }
        let executor = self.executor.clone()?;
        self.drain_scheduled = true;
        Some(executor)
    }

    fn next_deliverable(&mut self) -> Option<Step<T>> {
        let deliver = match self.queue.front()? {
            Pending::Close(_) => {
                self.state = StreamState::Cleanup;
                true
            }
            Pending::Object(_) if self.demand > 0 => {
                if self.demand != u64::MAX {
                    self.demand -= 1;
                }
                true
            }
            Pending::AwaitDemand(_) if self.demand > 0 => true,
            // A closed stream without demand must not hold its close behind a marker.
            Pending::AwaitDemand(_) if self.state != StreamState::Open => false,
            _ => return None,
        };
        let next = self.queue.pop_front()?;
        Some(if deliver {
            Step::Deliver(next)
        } else {
            Step::Discard(next)
        })
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    // Locked only by the drain (and by `subscribe` before the first drain).
    subscriber: Mutex<Option<Box<dyn Subscriber<T>>>>,
    completion: Promise<()>,
    /// Request context current when the subscriber attached.
    context: OnceLock<Arc<dyn RequestContext>>,
}

impl<T: StreamObject> Inner<T> {
    fn dispatch(self: &Arc<Self>, executor: Option<Arc<dyn EventLoop>>) {
        if let Some(executor) = executor {
            let inner = Arc::clone(self);
            executor.execute(Box::new(move || inner.drain()));
        }
    }

    /// Runs `f` with the subscriber's context pushed, if it had one.
    fn in_context<R>(&self, f: impl FnOnce() -> R) -> R {
        match self.context.get() {
            Some(ctx) => ctx.run(f),
            None => f(),
        }
    }

    fn drain(&self) {
        self.in_context(|| self.drain_in_context());
    }

    /// Delivers queued entries until demand runs out or the queue is empty.
    ///
    /// Runs on the subscriber's event loop with the drain flag held, so at
    /// most one entry is in flight at a time.
    fn drain_in_context(&self) {
        let mut slot = self.subscriber.lock();
        loop {
            let next = {
                let mut st = self.state.lock();
                match st.next_deliverable() {
                    Some(Step::Deliver(next)) => next,
                    Some(Step::Discard(expired)) => {
                        drop(st);
                        discard(expired);
                        continue;
                    }
                    None => {
                        st.drain_scheduled = false;
                        if st.state == StreamState::Cleanup {
                            drop(st);
                            // Dropping the subscriber ends its lifetime with the stream.
                            slot.take();
                        }
                        return;
                    }
                }
            };

            match next {
                Pending::Object(obj) => match slot.as_mut() {
                    Some(subscriber) => {
                        if let Err(cause) = subscriber.on_next(obj) {
                            debug!(error = %cause, "subscriber failed, closing stream");
                            // The drain flag is still ours; the loop picks up the failure.
                            let _ = self.fail(cause);
                        }
                    }
                    None => safe_release(obj),
                },
                Pending::AwaitDemand(marker) => marker.run(),
                Pending::Close(cause) => {
                    if let Some(mut subscriber) = slot.take() {
                        match &cause {
                            None => subscriber.on_complete(),
                            Some(cause) => subscriber.on_error(cause.clone()),
                        }
                    }
                    trace!(success = cause.is_none(), "stream completed");
                    match cause {
                        None => self.completion.complete(()),
                        Some(cause) => self.completion.fail(cause),
                    };
                }
            }
        }
    }

    /// Moves to `Cleanup`, releases everything queued and enqueues a
    /// terminal failure for the subscriber.
    ///
    /// Returns `None` if the stream was already in `Cleanup`, otherwise the
    /// event loop to dispatch the drain on, if one must be scheduled.
    fn fail(&self, cause: Error) -> Option<Option<Arc<dyn EventLoop>>> {
        let (dropped, executor) = {
            let mut st = self.state.lock();
            if st.state == StreamState::Cleanup {
                return None;
            }
            st.state = StreamState::Cleanup;
            let dropped = std::mem::take(&mut st.queue);
            st.queue.push_back(Pending::Close(Some(cause)));
            (dropped, st.claim_drain())
        };
        release_all(dropped);
        Some(executor)
    }
}

impl<T: StreamObject> SubscriptionHandle for Inner<T> {
    fn request(self: Arc<Self>, n: u64) {
        if n == 0 {
            let executor = self.fail(Error::invalid_argument(
                "request(0): non-positive subscription request",
            ));
            self.dispatch(executor.flatten());
            return;
        }
        let executor = {
            let mut st = self.state.lock();
            if st.state == StreamState::Cleanup && st.queue.is_empty() {
                return;
            }
            st.demand = st.demand.saturating_add(n);
            st.claim_drain()
        };
        self.dispatch(executor);
    }

    fn cancel(self: Arc<Self>) {
        let (dropped, executor) = {
            let mut st = self.state.lock();
            if st.state == StreamState::Cleanup {
                return;
            }
            st.state = StreamState::Cleanup;
            (std::mem::take(&mut st.queue), st.claim_drain())
        };
        debug!(pending = dropped.len(), "subscription cancelled");
        release_all(dropped);
        self.completion.fail(Error::CancelledSubscription);
        self.dispatch(executor);
    }
}

// ---------------------------------------------------------------------------
// DefaultStreamMessage
// ---------------------------------------------------------------------------

/// A queue-backed stream that is both the writer and the published message.
///
/// Cloning yields another handle to the same stream, so a producer can keep a
/// clone while the consumer subscribes through another.
pub struct DefaultStreamMessage<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DefaultStreamMessage<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: StreamObject> Default for DefaultStreamMessage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: StreamObject> DefaultStreamMessage<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    state: StreamState::Open,
                    queue: VecDeque::new(),
                    demand: 0,
                    executor: None,
                    wrote_any: false,
                    drain_scheduled: false,
                }),
                subscriber: Mutex::new(None),
                completion: Promise::new(),
                context: OnceLock::new(),
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.inner.state.lock().state
    }

    /// `true` while the stream accepts new elements.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == StreamState::Open
    }

    fn close0(&self, cause: Option<Error>) {
        let executor = {
            let mut st = self.inner.state.lock();
            if st.state != StreamState::Open {
                return;
            }
            st.state = StreamState::Closed;
            st.queue.push_back(Pending::Close(cause));
            st.claim_drain()
        };
        self.inner.dispatch(executor);
    }
}

impl<T: StreamObject> StreamWriter<T> for DefaultStreamMessage<T> {
    fn is_open(&self) -> bool {
        DefaultStreamMessage::is_open(self)
    }

    fn try_write(&self, obj: T) -> Result<bool, Rejected<T>> {
        if let Some(kind) = obj.managed_kind() {
            obj.touch("StreamWriter::try_write");
            if !kind.is_transferable() {
                return Err(Rejected::new(obj));
            }
        }

        let executor = {
            let mut st = self.inner.state.lock();
            if st.state != StreamState::Open {
                drop(st);
                safe_release(obj);
                return Ok(false);
            }
            st.queue.push_back(Pending::Object(obj));
            st.wrote_any = true;
            st.claim_drain()
        };
        self.inner.dispatch(executor);
        Ok(true)
    }

    fn on_demand<F>(&self, task: F) -> Promise<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let promise = Promise::new();
        let executor = {
            let mut st = self.inner.state.lock();
            if st.state != StreamState::Open {
                return Promise::failed(Error::ClosedPublisher);
            }
            st.queue.push_back(Pending::AwaitDemand(DemandTask {
                promise: promise.clone(),
                task: Box::new(task),
            }));
            st.claim_drain()
        };
        self.inner.dispatch(executor);
        promise
    }

    fn close(&self) {
        self.close0(None);
    }

    fn close_with_cause(&self, cause: Error) {
        self.close0(Some(cause));
    }
}

impl<T: StreamObject> StreamMessage<T> for DefaultStreamMessage<T> {
    fn is_open(&self) -> bool {
        DefaultStreamMessage::is_open(self)
    }

    fn is_empty(&self) -> bool {
        let st = self.inner.state.lock();
        st.state != StreamState::Open && !st.wrote_any
    }

    fn completion_future(&self) -> Promise<()> {
        self.inner.completion.clone()
    }

    fn subscribe<S>(&self, subscriber: S, executor: Arc<dyn EventLoop>)
    where
        S: Subscriber<T>,
    {
        let mut subscriber: Box<dyn Subscriber<T>> = Box::new(subscriber);
        let accepted = {
            let mut st = self.inner.state.lock();
            if st.executor.is_some() {
                false
            } else {
                st.executor = Some(Arc::clone(&executor));
                // Held until the first drain so writes cannot overtake `on_subscribe`.
                st.drain_scheduled = true;
                true
            }
        };

        if !accepted {
            executor.execute(Box::new(move || {
                subscriber.on_subscribe(Subscription::noop());
                subscriber.on_error(Error::illegal_state("only one subscriber allowed"));
            }));
            return;
        }

        *self.inner.subscriber.lock() = Some(subscriber);
        if let Some(ctx) = store::current() {
            let _ = self.inner.context.set(ctx);
        }
        let inner = Arc::clone(&self.inner);
        executor.execute(Box::new(move || {
            let handle = Arc::downgrade(&inner);
            let handle: Weak<dyn SubscriptionHandle> = handle;
            inner.in_context(|| {
                if let Some(subscriber) = inner.subscriber.lock().as_mut() {
                    subscriber.on_subscribe(Subscription::new(handle));
                }
            });
            inner.drain();
        }));
    }

    fn abort(&self) {
        if let Some(executor) = self.inner.fail(Error::AbortedStream) {
            self.inner.completion.fail(Error::AbortedStream);
            self.inner.dispatch(executor);
        }
    }
}

impl<T> fmt::Debug for DefaultStreamMessage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("DefaultStreamMessage")
            .field("state", &st.state)
            .field("pending", &st.queue.len())
            .field("demand", &st.demand)
            .finish_non_exhaustive()
    }
}

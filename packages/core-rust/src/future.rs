//! Single-assignment completion values.
//!
//! [`Promise`] is completed at most once, notifies registered listeners on the
//! completing thread, can be awaited as a `std::future::Future`, and can be
//! joined from blocking code. [`ProgressivePromise`] adds progress reporting.

use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Result carried by a completed promise.
pub type Outcome<T> = Result<T>;

type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

struct State<T> {
    outcome: Option<Outcome<T>>,
    listeners: Vec<Listener<T>>,
    wakers: Vec<Waker>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

/// A cloneable, single-assignment completion value.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        let status = match &state.outcome {
            None => "pending",
            Some(Ok(_)) => "success",
            Some(Err(_)) => "failure",
        };
        f.debug_struct("Promise").field("status", &status).finish()
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Creates an incomplete promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    outcome: None,
                    listeners: Vec::new(),
                    wakers: Vec::new(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Creates a promise already completed with `value`.
    #[must_use]
    pub fn completed(value: T) -> Self {
        let promise = Self::new();
        promise.complete(value);
        promise
    }

    /// Creates a promise already failed with `cause`.
    #[must_use]
    pub fn failed(cause: Error) -> Self {
        let promise = Self::new();
        promise.fail(cause);
        promise
    }

    /// Completes successfully. Returns `false` if already complete.
    pub fn complete(&self, value: T) -> bool {
        self.try_complete(Ok(value))
    }

    /// Completes with a failure. Returns `false` if already complete.
    pub fn fail(&self, cause: Error) -> bool {
        self.try_complete(Err(cause))
    }

    /// Sets the outcome if none has been set yet.
    ///
    /// Listeners run on the calling thread after the state lock is released.
    pub fn try_complete(&self, outcome: Outcome<T>) -> bool {
        let (listeners, wakers, snapshot) = {
            let mut state = self.shared.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            let snapshot = outcome.clone();
            state.outcome = Some(outcome);
            self.shared.done.notify_all();
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.wakers),
                snapshot,
            )
        };

        for waker in wakers {
            waker.wake();
        }
        for listener in listeners {
            listener(&snapshot);
        }
        true
    }

    /// Registers a completion listener.
    ///
    /// Runs immediately on the caller if the promise is already complete.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let ready = {
            let mut state = self.shared.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&ready);
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.shared.state.lock().outcome, Some(Ok(_)))
    }

    #[must_use]
    pub fn is_completed_exceptionally(&self) -> bool {
        matches!(self.shared.state.lock().outcome, Some(Err(_)))
    }

    /// The failure cause, or `None` if incomplete or successful.
    #[must_use]
    pub fn cause(&self) -> Option<Error> {
        match &self.shared.state.lock().outcome {
            Some(Err(cause)) => Some(cause.clone()),
            _ => None,
        }
    }

    /// Returns `value_if_absent` when incomplete, otherwise the outcome.
    ///
    /// # Errors
    ///
    /// Returns the failure cause if the promise completed with a failure.
    pub fn get_now(&self, value_if_absent: T) -> Outcome<T> {
        match &self.shared.state.lock().outcome {
            Some(outcome) => outcome.clone(),
            None => Ok(value_if_absent),
        }
    }

    /// Blocks the calling thread until the promise completes.
    ///
    /// # Errors
    ///
    /// Returns the failure cause if the promise completed with a failure.
    pub fn join(&self) -> Outcome<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.shared.done.wait(&mut state);
        }
    }

    /// Like [`join`](Self::join), giving up after `timeout`.
    ///
    /// Returns `None` if the promise is still incomplete when the timeout elapses.
    pub fn join_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.outcome.is_none() {
            if self.shared.done.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.outcome.clone()
    }
}

impl<T: Clone + Send + 'static> Future for Promise<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

// ---------------------------------------------------------------------------
// ProgressivePromise
// ---------------------------------------------------------------------------

type ProgressListener = Box<dyn FnMut(u64, Option<u64>) + Send + 'static>;

/// A [`Promise`] that also reports progress towards an optional total.
pub struct ProgressivePromise<T> {
    promise: Promise<T>,
    progress_listeners: Arc<Mutex<Vec<ProgressListener>>>,
}

impl<T> Clone for ProgressivePromise<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            progress_listeners: Arc::clone(&self.progress_listeners),
        }
    }
}

impl<T: Clone + Send + 'static> Default for ProgressivePromise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> ProgressivePromise<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            promise: Promise::new(),
            progress_listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reports progress to every progress listener.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `progress` exceeds a known `total`; `IllegalState`
    /// if the promise has already completed.
    pub fn set_progress(&self, progress: u64, total: Option<u64>) -> Result<()> {
        if let Some(total) = total {
            if progress > total {
                return Err(Error::invalid_argument(format!(
                    "progress: {progress} (expected: 0 <= progress <= total ({total}))"
                )));
            }
        }
        if self.promise.is_done() {
            return Err(Error::illegal_state("complete already"));
        }

        // Listeners run without the lock held so they may register more listeners.
        let mut listeners = std::mem::take(&mut *self.progress_listeners.lock());
        for listener in &mut listeners {
            listener(progress, total);
        }
        let mut slot = self.progress_listeners.lock();
        listeners.append(&mut slot);
        *slot = listeners;
        Ok(())
    }

    /// Like [`set_progress`](Self::set_progress), returning `false` instead of failing.
    pub fn try_progress(&self, progress: u64, total: Option<u64>) -> bool {
        self.set_progress(progress, total).is_ok()
    }

    /// Registers a listener invoked with `(progress, total)` on each report.
    pub fn add_progress_listener<F>(&self, listener: F)
    where
        F: FnMut(u64, Option<u64>) + Send + 'static,
    {
        self.progress_listeners.lock().push(Box::new(listener));
    }

    /// The underlying completion promise.
    #[must_use]
    pub fn promise(&self) -> &Promise<T> {
        &self.promise
    }
}

impl<T> Deref for ProgressivePromise<T> {
    type Target = Promise<T>;

    fn deref(&self) -> &Promise<T> {
        &self.promise
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn completes_once() {
        let p = Promise::new();
        assert!(p.complete(1));
        assert!(!p.complete(2));
        assert!(!p.fail(Error::ClosedPublisher));
        assert_eq!(p.join().unwrap(), 1);
        assert!(p.is_success());
        assert!(p.cause().is_none());
    }

    #[test]
    fn listeners_fire_before_and_after_completion() {
        let p: Promise<u32> = Promise::new();
        let hits = Arc::new(AtomicU32::new(0));

        let h = hits.clone();
        p.add_listener(move |o| {
            assert_eq!(*o.as_ref().unwrap(), 7);
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        p.complete(7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = hits.clone();
        p.add_listener(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn get_now_and_cause() {
        let p: Promise<u32> = Promise::new();
        assert_eq!(p.get_now(5).unwrap(), 5);

        p.fail(Error::AbortedStream);
        assert!(p.is_completed_exceptionally());
        assert!(matches!(p.cause(), Some(Error::AbortedStream)));
        assert!(matches!(p.get_now(5), Err(Error::AbortedStream)));
    }

    #[test]
    fn join_blocks_until_other_thread_completes() {
        let p: Promise<&'static str> = Promise::new();
        let completer = p.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete("done");
        });
        assert_eq!(p.join().unwrap(), "done");
        handle.join().unwrap();
    }

    #[test]
    fn join_timeout_returns_none_while_pending() {
        let p: Promise<()> = Promise::new();
        assert!(p.join_timeout(Duration::from_millis(10)).is_none());
    }

    #[tokio::test]
    async fn awaitable() {
        let p: Promise<u64> = Promise::new();
        let completer = p.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            completer.complete(99);
        });
        assert_eq!(p.await.unwrap(), 99);
    }

    #[test]
    fn progress_is_validated_and_reported() {
        let p: ProgressivePromise<()> = ProgressivePromise::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        p.add_progress_listener(move |progress, total| s.lock().push((progress, total)));

        p.set_progress(1, Some(3)).unwrap();
        p.set_progress(5, None).unwrap();
        assert!(matches!(
            p.set_progress(4, Some(3)),
            Err(Error::InvalidArgument(_))
        ));

        p.complete(());
        assert!(!p.try_progress(3, Some(3)));
        assert_eq!(*seen.lock(), vec![(1, Some(3)), (5, None)]);
    }
}

//! Completion value returned by RPC-style handlers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::context::store;
use crate::error::{Error, Result};
use crate::future::{Outcome, Promise};

/// A single-assignment RPC result: a value or a failure cause.
pub struct RpcResponse<T> {
    promise: Promise<T>,
}

impl<T> Clone for RpcResponse<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T> fmt::Debug for RpcResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RpcResponse").field(&self.promise).finish()
    }
}

/// What an upstream asynchronous step produced for an [`RpcResponse`].
#[derive(Debug)]
pub enum Reply<T> {
    Value(T),
    /// Another response whose eventual outcome should be adopted.
    Deferred(RpcResponse<T>),
}

impl<T> Clone for Reply<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        match self {
            Self::Value(v) => Self::Value(v.clone()),
            Self::Deferred(r) => Self::Deferred(r.clone()),
        }
    }
}

impl<T: Clone + Send + 'static> RpcResponse<T> {
    /// An incomplete response, to be completed by the handler.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            promise: Promise::new(),
        }
    }

    /// A response already completed with `value`.
    #[must_use]
    pub fn of(value: T) -> Self {
        Self {
            promise: Promise::completed(value),
        }
    }

    /// A response already failed with `cause`.
    #[must_use]
    pub fn of_failure(cause: Error) -> Self {
        Self {
            promise: Promise::failed(cause),
        }
    }

    /// Adopts the outcome of `stage`.
    ///
    /// A [`Reply::Deferred`] value is flattened: the returned response waits
    /// for the nested one and takes its outcome, with one wrapping layer
    /// peeled from a nested failure. A failure of `stage` itself is adopted
    /// as is.
    #[must_use]
    pub fn from(stage: &Promise<Reply<T>>) -> Self {
        let response = Self::pending();
        let target = response.clone();
        stage.add_listener(move |outcome| match outcome {
            Ok(Reply::Value(value)) => {
                target.complete(value.clone());
            }
            Ok(Reply::Deferred(nested)) => {
                let target = target.clone();
                nested.promise.add_listener(move |nested_outcome| match nested_outcome {
                    Ok(value) => {
                        target.complete(value.clone());
                    }
                    Err(cause) => {
                        target.fail(cause.clone().peel());
                    }
                });
            }
            Err(cause) => {
                target.fail(cause.clone());
            }
        });
        response
    }

    /// Adopts the outcome of a future, flattening deferred replies like [`from`](Self::from).
    pub async fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<Reply<T>>>,
    {
        match fut.await {
            Ok(Reply::Value(value)) => Self::of(value),
            Ok(Reply::Deferred(nested)) => match nested.promise.await {
                Ok(value) => Self::of(value),
                Err(cause) => Self::of_failure(cause.peel()),
            },
            Err(cause) => Self::of_failure(cause),
        }
    }

    /// Registers a completion listener.
    ///
    /// The request context current at registration, if any, is pushed while
    /// the listener runs, whichever thread completes the response.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        match store::current() {
            Some(ctx) => self
                .promise
                .add_listener(move |outcome| ctx.run(|| listener(outcome))),
            None => self.promise.add_listener(listener),
        }
    }

    pub fn complete(&self, value: T) -> bool {
        self.promise.complete(value)
    }

    pub fn fail(&self, cause: Error) -> bool {
        self.promise.fail(cause)
    }

    /// Blocks until the response completes.
    ///
    /// # Errors
    ///
    /// The failure cause if the call failed.
    pub fn join(&self) -> Outcome<T> {
        self.promise.join()
    }

    /// # Errors
    ///
    /// The failure cause if the call already failed.
    pub fn get_now(&self, value_if_absent: T) -> Outcome<T> {
        self.promise.get_now(value_if_absent)
    }

    /// `Some` iff the response completed with a failure.
    #[must_use]
    pub fn cause(&self) -> Option<Error> {
        self.promise.cause()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.promise.is_done()
    }

    #[must_use]
    pub fn is_completed_exceptionally(&self) -> bool {
        self.promise.is_completed_exceptionally()
    }

    /// The underlying completion promise.
    #[must_use]
    pub fn completion_future(&self) -> Promise<T> {
        self.promise.clone()
    }
}

impl<T: Clone + Send + 'static> Future for RpcResponse<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.promise).poll(cx)
    }
}

impl<T: Clone + Send + 'static> From<Promise<T>> for RpcResponse<T> {
    fn from(promise: Promise<T>) -> Self {
        Self { promise }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::context::test_support::TestContext;

    #[test]
    fn of_and_of_failure() {
        let ok = RpcResponse::of("pong".to_owned());
        assert_eq!(ok.join().unwrap(), "pong");
        assert!(ok.cause().is_none());

        let failed: RpcResponse<String> = RpcResponse::of_failure(Error::ClosedPublisher);
        assert!(failed.is_completed_exceptionally());
        assert!(matches!(failed.cause(), Some(Error::ClosedPublisher)));
        assert!(matches!(failed.join(), Err(Error::ClosedPublisher)));
    }

    #[test]
    fn get_now_returns_default_while_pending() {
        let pending: RpcResponse<u32> = RpcResponse::pending();
        assert_eq!(pending.get_now(0).unwrap(), 0);
        pending.complete(5);
        assert_eq!(pending.get_now(0).unwrap(), 5);
    }

    #[test]
    fn from_adopts_plain_value() {
        let stage = Promise::new();
        let response = RpcResponse::from(&stage);
        assert!(!response.is_done());
        stage.complete(Reply::Value(3_u64));
        assert_eq!(response.join().unwrap(), 3);
    }

    #[test]
    fn from_flattens_nested_response_and_peels_its_failure() {
        let root = Error::other(anyhow::anyhow!("backend down"));
        let nested: RpcResponse<u64> = RpcResponse::pending();
        let stage = Promise::completed(Reply::Deferred(nested.clone()));

        let response = RpcResponse::from(&stage);
        assert!(!response.is_done());

        nested.fail(root.into_completion());
        let cause = response.cause().unwrap();
        assert!(matches!(cause, Error::Other(_)));
        assert_eq!(cause.to_string(), "backend down");
    }

    #[test]
    fn from_flattens_nested_success() {
        let nested = RpcResponse::pending();
        let stage = Promise::new();
        let response = RpcResponse::from(&stage);
        stage.complete(Reply::Deferred(nested.clone()));
        nested.complete("late".to_owned());
        assert_eq!(response.join().unwrap(), "late");
    }

    #[test]
    fn from_keeps_a_failed_stage_cause_intact() {
        let stage: Promise<Reply<u64>> = Promise::new();
        let response = RpcResponse::from(&stage);
        stage.fail(Error::AbortedStream.into_completion());

        let cause = response.cause().unwrap();
        assert!(matches!(cause, Error::Completion(_)));
        assert!(matches!(cause.peel(), Error::AbortedStream));
    }

    #[test]
    fn listener_runs_in_the_registering_context() {
        let ctx = TestContext::arc("/rpc");
        let expected = ctx.id();
        let response: RpcResponse<u32> = RpcResponse::pending();
        let (tx, rx) = std::sync::mpsc::channel();

        ctx.run(|| {
            response.add_listener(move |outcome| {
                let seen = store::current().map(|c| c.id());
                let _ = tx.send((seen, outcome.as_ref().ok().copied()));
            });
        });
        assert!(store::current().is_none());

        let completer = response.clone();
        let popped = std::thread::spawn(move || {
            completer.complete(9);
            store::current().is_none()
        })
        .join()
        .unwrap();
        assert!(popped);

        assert_eq!(rx.recv().unwrap(), (Some(expected), Some(9)));
    }

    #[test]
    fn listener_without_a_context_runs_bare() {
        let response = RpcResponse::of(1_u8);
        let (tx, rx) = std::sync::mpsc::channel();
        response.add_listener(move |_| {
            let _ = tx.send(store::current().is_none());
        });
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn join_blocks_until_completed_elsewhere() {
        let response: RpcResponse<u8> = RpcResponse::pending();
        let completer = response.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            completer.complete(1);
        });
        assert_eq!(response.join().unwrap(), 1);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn from_future_keeps_its_own_failure_intact() {
        let response: RpcResponse<u32> =
            RpcResponse::from_future(async { Err(Error::ClosedPublisher.into_completion()) }).await;
        assert!(matches!(response.cause(), Some(Error::Completion(_))));
    }

    #[tokio::test]
    async fn from_future_flattens() {
        let nested: RpcResponse<u32> = RpcResponse::pending();
        let completer = nested.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            completer.fail(Error::AbortedStream.into_completion());
        });

        let response =
            RpcResponse::from_future(async move { Ok(Reply::Deferred(nested)) }).await;
        assert!(matches!(response.await, Err(Error::AbortedStream)));
    }
}

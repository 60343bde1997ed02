//! Request timeout middleware.
//!
//! The deadline follows the context's request timeout, measured from the
//! moment the request entered the layer. Changes made while the request is in
//! flight move the deadline. When it passes, the context's timeout handler
//! runs if one is set; otherwise the request fails with `RequestTimeout`.

use std::future::pending;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use ctrlshift_core::Error;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tower::{Layer, Service};
use tracing::debug;

use crate::service::{BoxFuture, ServiceRequest};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that enforces each context's request timeout.
#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces per-request timeouts.
///
/// Registers itself as the context's timeout change listener. A context that
/// already has a listener keeps the timeout it had when the call started.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S, I, O> Service<ServiceRequest<I>> for TimeoutService<S>
where
    S: Service<ServiceRequest<I>, Response = O, Error = Error> + Send,
    S::Future: Send + 'static,
    O: Send + 'static,
{
    type Response = O;
    type Error = Error;
    type Future = BoxFuture<O>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: ServiceRequest<I>) -> Self::Future {
        let ctx = Arc::clone(&request.ctx);
        let start = Instant::now();
        let (tx, mut rx) = watch::channel(ctx.request_timeout_millis());
        let mut listening = ctx
            .set_request_timeout_change_listener(Box::new(move |timeout_ms: u64| {
                tx.send_replace(timeout_ms);
            }))
            .is_ok();

        let fut = self.inner.call(request);
        Box::pin(async move {
            tokio::pin!(fut);
            let mut handled = false;
            loop {
                let timeout_ms = *rx.borrow_and_update();
                let deadline = start.checked_add(Duration::from_millis(timeout_ms));
                let disarmed = timeout_ms == 0 || handled || deadline.is_none();
                let deadline = deadline.unwrap_or(start);
                let expiry = async move {
                    if disarmed {
                        pending::<()>().await;
                    }
                    sleep_until(deadline).await;
                };

                tokio::select! {
                    result = &mut fut => return result,
                    changed = rx.changed(), if listening => {
                        listening = changed.is_ok();
                    }
                    () = expiry => {
                        let Some(handler) = ctx.request_timeout_handler() else {
                            debug!(ctx = %ctx, timeout_ms, "request timed out");
                            return Err(Error::RequestTimeout { timeout_ms });
                        };
                        debug!(ctx = %ctx, timeout_ms, "request timed out; running timeout handler");
                        handler.run();
                        handled = true;
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

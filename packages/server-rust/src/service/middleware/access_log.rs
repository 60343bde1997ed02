//! Access log middleware.
//!
//! Runs the inner service with the request context pushed, completes the
//! context's request log with the outcome, and records duration and outcome
//! on a `service` span.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use ctrlshift_core::{Error, WithContext};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::{BoxFuture, ServiceRequest};

// ---------------------------------------------------------------------------
// AccessLogLayer
// ---------------------------------------------------------------------------

/// Tower layer that logs every request served by the wrapped service.
#[derive(Debug, Clone)]
pub struct AccessLogLayer;

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService { inner }
    }
}

// ---------------------------------------------------------------------------
// AccessLogService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AccessLogService<S> {
    inner: S,
}

impl<S, I, O> Service<ServiceRequest<I>> for AccessLogService<S>
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
        let span = info_span!(
            parent: ctx.span(),
            "service",
            route = %ctx.route(),
            mapped_path = %ctx.mapped_path(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let inner = &mut self.inner;
        let fut = ctx.run(|| inner.call(request));
        let request_ctx = Arc::clone(&ctx).into_request_context();

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(_) => "error",
                };
                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                ctx.log().end_response(result.as_ref().map(|_| ()));
                match &result {
                    Ok(_) => tracing::info!(ctx = %ctx, duration_ms, outcome, "request complete"),
                    Err(e) => tracing::info!(ctx = %ctx, duration_ms, outcome, error = %e, "request complete"),
                }

                result
            }
            .instrument(span)
            .with_context(request_ctx),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

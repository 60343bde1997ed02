//! Request services and their composition.
//!
//! 1. **Routes** (`mapping`, `router`): path matchers and the specificity-ordered table
//! 2. **Services** (`RequestService`): tower services over [`ServiceRequest`]
//! 3. **Composition** (`composite`): one service dispatching to children by sub-path
//! 4. **Middleware** (`middleware`): tower layers for timeouts and access logging

pub mod composite;
pub mod config;
pub mod mapping;
pub mod middleware;
pub mod router;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use ctrlshift_core::{Error, Result};
use tower::Service;

pub use composite::{CompositeService, CompositeServiceEntry};
pub use config::{ServerConfig, ServiceConfig};
pub use mapping::{PathMapping, PathMappingContext, PathMappingResult};
pub use router::Router;

use crate::context::ServiceRequestContext;

// ---------------------------------------------------------------------------
// ServiceRequest / RequestService
// ---------------------------------------------------------------------------

/// A request paired with the context it is served in.
pub struct ServiceRequest<I> {
    pub ctx: Arc<dyn ServiceRequestContext>,
    pub req: I,
}

impl<I> ServiceRequest<I> {
    #[must_use]
    pub fn new(ctx: Arc<dyn ServiceRequestContext>, req: I) -> Self {
        Self { ctx, req }
    }
}

impl<I: fmt::Debug> fmt::Debug for ServiceRequest<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRequest")
            .field("ctx", &self.ctx.to_string())
            .field("req", &self.req)
            .finish()
    }
}

pub type BoxFuture<O> = Pin<Box<dyn Future<Output = Result<O>> + Send>>;

/// A tower service bound at a route.
pub trait RequestService<I, O>:
    Service<ServiceRequest<I>, Response = O, Error = Error, Future = BoxFuture<O>> + Send
{
    /// Called once when the service is bound.
    ///
    /// # Errors
    ///
    /// Implementations reject bindings they cannot serve.
    fn service_added(&mut self, config: &ServiceConfig) -> Result<()> {
        let _ = config;
        Ok(())
    }
}

/// A type-erased [`RequestService`].
pub type BoxedService<I, O> = Box<dyn RequestService<I, O>>;

/// Boxes any tower service over [`ServiceRequest`].
pub fn boxed<S, I, O>(service: S) -> BoxedService<I, O>
where
    S: Service<ServiceRequest<I>, Response = O, Error = Error> + Send + 'static,
    S::Future: Send + 'static,
    I: 'static,
    O: 'static,
{
    Box::new(ServiceWrapper(service))
}

// ---------------------------------------------------------------------------
// ServiceWrapper (type-erased adapter)
// ---------------------------------------------------------------------------

struct ServiceWrapper<S>(S);

impl<S, I, O> Service<ServiceRequest<I>> for ServiceWrapper<S>
where
    S: Service<ServiceRequest<I>, Response = O, Error = Error> + Send,
    S::Future: Send + 'static,
{
    type Response = O;
    type Error = Error;
    type Future = BoxFuture<O>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0.poll_ready(cx)
    }

    fn call(&mut self, req: ServiceRequest<I>) -> Self::Future {
        Box::pin(self.0.call(req))
    }
}

impl<S, I, O> RequestService<I, O> for ServiceWrapper<S>
where
    S: Service<ServiceRequest<I>, Response = O, Error = Error> + Send,
    S::Future: Send + 'static,
{
}

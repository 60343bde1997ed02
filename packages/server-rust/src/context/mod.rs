//! Server-side request contexts.
//!
//! [`ServiceRequestContext`] extends the core [`RequestContext`] with the
//! route a service was bound at, the mutable per-request knobs (timeout,
//! maximum length, timeout handler), and context forking for sub-dispatch.

mod default;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ctrlshift_core::context::ContextAwareExecutor;
use ctrlshift_core::{BufferAllocator, ContextAwareLogger, RequestContext, Result, SharedRequest};

pub use default::{DefaultServiceRequestContext, ServiceRequestContextBuilder};

use crate::service::config::ServiceConfig;
use crate::service::mapping::{PathMapping, PathMappingContext};
use crate::session::Session;

/// Invoked when a request's timeout elapses, in place of the default failure.
pub struct RequestTimeoutHandler(Box<dyn Fn() + Send + Sync>);

impl RequestTimeoutHandler {
    pub fn new(handler: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Box::new(handler))
    }

    pub fn run(&self) {
        (self.0)();
    }
}

impl fmt::Debug for RequestTimeoutHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestTimeoutHandler")
    }
}

/// Observes changes of a context's request timeout, in milliseconds.
pub type TimeoutChangeListener = Box<dyn Fn(u64) + Send + Sync>;

/// The context a service sees while handling one request.
pub trait ServiceRequestContext: RequestContext {
    fn session(&self) -> &Arc<Session>;

    fn config(&self) -> &Arc<ServiceConfig>;

    /// The mapping the current service was reached through.
    fn route(&self) -> &PathMapping;

    /// The request path relative to [`route`](Self::route).
    fn mapped_path(&self) -> &str;

    fn path_mapping_context(&self) -> &PathMappingContext;

    fn path_params(&self) -> &HashMap<String, String>;

    /// Current request timeout. `0` means no timeout.
    fn request_timeout_millis(&self) -> u64;

    /// Changes the request timeout and notifies the change listener on the
    /// context's event loop.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `timeout_ms` is negative; the previous value is kept.
    fn set_request_timeout_millis(&self, timeout_ms: i64) -> Result<()>;

    /// # Errors
    ///
    /// See [`set_request_timeout_millis`](Self::set_request_timeout_millis).
    fn set_request_timeout(&self, timeout: Duration) -> Result<()> {
        self.set_request_timeout_millis(i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX))
    }

    /// Maximum request length in bytes. `0` means unlimited.
    fn max_request_length(&self) -> u64;

    /// # Errors
    ///
    /// `InvalidArgument` if `max` is negative; the previous value is kept.
    fn set_max_request_length(&self, max: i64) -> Result<()>;

    fn request_timeout_handler(&self) -> Option<Arc<RequestTimeoutHandler>>;

    fn set_request_timeout_handler(&self, handler: RequestTimeoutHandler);

    /// Registers the single timeout change listener of this context.
    ///
    /// # Errors
    ///
    /// `IllegalState` if a listener was registered before.
    fn set_request_timeout_change_listener(&self, listener: TimeoutChangeListener) -> Result<()>;

    /// Forks a context for the same session.
    ///
    /// The fork gets a point-in-time copy of the attributes, its own request
    /// log, and the current timeout settings. `request` replaces the attached
    /// request when given.
    fn new_derived_context(&self, request: Option<SharedRequest>) -> Arc<dyn ServiceRequestContext>;

    fn into_request_context(self: Arc<Self>) -> Arc<dyn RequestContext>;

    fn alloc(&self) -> &BufferAllocator {
        self.session().alloc()
    }
}

impl dyn ServiceRequestContext {
    /// The session's blocking executor, running every task with this context.
    #[must_use]
    pub fn blocking_task_executor(self: &Arc<Self>) -> ContextAwareExecutor {
        ContextAwareExecutor::new(
            Arc::clone(self).into_request_context(),
            Arc::clone(self.session().blocking_executor()),
        )
    }

    /// A logger named after the service configuration.
    #[must_use]
    pub fn logger(self: &Arc<Self>) -> ContextAwareLogger {
        ContextAwareLogger::new(
            Arc::clone(self).into_request_context(),
            self.config().full_logger_name(),
        )
    }

    /// Runs `f` with this context pushed.
    pub fn run<R>(self: &Arc<Self>, f: impl FnOnce() -> R) -> R {
        Arc::clone(self).into_request_context().run(f)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use ctrlshift_core::{ImmediateEventLoop, SessionProtocol};
    use http::Method;

    use super::DefaultServiceRequestContext;
    use crate::service::config::{ServerConfig, ServiceConfig};
    use crate::service::mapping::PathMapping;
    use crate::session::Session;

    pub(crate) fn session() -> Arc<Session> {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        Arc::new(Session::new(
            SessionProtocol::H2C,
            addr,
            addr,
            Arc::new(ImmediateEventLoop),
            Arc::new(ImmediateEventLoop),
        ))
    }

    pub(crate) fn service_config(route: PathMapping) -> Arc<ServiceConfig> {
        Arc::new(ServiceConfig::new(route, Arc::new(ServerConfig::default())))
    }

    /// A GET context bound at the catch-all route.
    pub(crate) fn context_at(path: &str) -> Arc<DefaultServiceRequestContext> {
        DefaultServiceRequestContext::builder(session(), service_config(PathMapping::CatchAll), Method::GET, path)
            .build()
            .unwrap()
    }
}

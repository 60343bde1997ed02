//! Ambient per-request context and the wrappers that carry it across
//! asynchronous boundaries.

mod attrs;
mod aware;
mod log;
mod logger;
pub mod store;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use http::Method;
use uuid::Uuid;

pub use attrs::{AttributeKey, Attributes};
pub use aware::{wrap, wrap_fn, ContextAware, ContextAwareExecutor, ContextAwarePromise, WithContext};
pub use log::{RequestLog, RequestLogRecord};
pub use logger::ContextAwareLogger;
pub use store::ContextGuard;

use crate::executor::EventLoop;

/// Opaque, type-erased inbound request carried by a context.
pub type SharedRequest = Arc<dyn Any + Send + Sync>;

/// Unique identifier of one context instance. Derived contexts get their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Transport protocol of the session a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionProtocol {
    /// HTTP/1 over cleartext.
    H1C,
    /// HTTP/1 over TLS.
    H1,
    /// HTTP/2 over cleartext.
    H2C,
    /// HTTP/2 over TLS.
    H2,
}

impl SessionProtocol {
    /// Scheme text used in context descriptions, e.g. `h2c`.
    #[must_use]
    pub fn uri_text(self) -> &'static str {
        match self {
            Self::H1C => "h1c",
            Self::H1 => "h1",
            Self::H2C => "h2c",
            Self::H2 => "h2",
        }
    }

    #[must_use]
    pub fn is_tls(self) -> bool {
        matches!(self, Self::H1 | Self::H2)
    }
}

impl fmt::Display for SessionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri_text())
    }
}

/// Ambient record of one logical request.
///
/// Implementations are shared as `Arc<dyn RequestContext>` and made current
/// on a thread with [`store::push`] or [`store::enter`].
pub trait RequestContext: fmt::Display + Send + Sync + 'static {
    fn id(&self) -> ContextId;

    fn session_protocol(&self) -> SessionProtocol;

    fn method(&self) -> &Method;

    /// Absolute request path, without the query string.
    fn path(&self) -> &str;

    fn query(&self) -> Option<&str>;

    /// The inbound request object, if the transport attached one.
    fn request(&self) -> Option<&SharedRequest>;

    fn attrs(&self) -> &Attributes;

    fn log(&self) -> &RequestLog;

    /// The scheduling unit that owns this context's delivery and mutation.
    fn event_loop(&self) -> &Arc<dyn EventLoop>;

    /// The `request` span every context-aware continuation runs in.
    fn span(&self) -> &tracing::Span;

    fn as_any(&self) -> &dyn Any;
}

impl dyn RequestContext {
    /// Downcasts the attached request to `R`.
    #[must_use]
    pub fn request_as<R: Any + Send + Sync>(&self) -> Option<&R> {
        self.request()?.downcast_ref::<R>()
    }

    /// Runs `f` with this context pushed, then pops it.
    pub fn run<R>(self: &Arc<Self>, f: impl FnOnce() -> R) -> R {
        let _guard = store::enter(Arc::clone(self));
        let _span = self.span().enter();
        f()
    }
}

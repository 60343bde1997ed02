use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwapOption;
use ctrlshift_core::{
    Attributes, ContextId, Error, EventLoop, Executor, RequestContext, RequestLog, Result,
    SessionProtocol, SharedRequest,
};
use http::Method;
use tracing::{info_span, Span};

use super::{RequestTimeoutHandler, ServiceRequestContext, TimeoutChangeListener};
use crate::service::config::ServiceConfig;
use crate::service::mapping::{PathMapping, PathMappingContext, PathMappingResult};
use crate::session::Session;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`DefaultServiceRequestContext`] for an inbound request.
pub struct ServiceRequestContextBuilder {
    session: Arc<Session>,
    config: Arc<ServiceConfig>,
    method: Method,
    path: String,
    query: Option<String>,
    hostname: Option<String>,
    request: Option<SharedRequest>,
}

impl ServiceRequestContextBuilder {
    /// Sets the query string. Without it, a `?` in the path is split off.
    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    #[must_use]
    pub fn request(mut self, request: SharedRequest) -> Self {
        self.request = Some(request);
        self
    }

    /// Matches the request against the service route and starts its log.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a relative path, `NotFound` if the route of the
    /// service configuration does not match it.
    pub fn build(self) -> Result<Arc<DefaultServiceRequestContext>> {
        let (path, query) = match (self.query, self.path.find('?')) {
            (Some(query), _) => (self.path, Some(query)),
            (None, Some(at)) => {
                let mut path = self.path;
                let query = path.split_off(at + 1);
                path.pop();
                (path, Some(query))
            }
            (None, None) => (self.path, None),
        };
        if !path.starts_with('/') {
            return Err(Error::InvalidArgument(format!(
                "path: {path} (expected: an absolute path starting with '/')"
            )));
        }
        let hostname = self
            .hostname
            .unwrap_or_else(|| self.config.server().default_hostname.clone());

        let mapping_ctx = PathMappingContext::new(hostname.clone(), self.method, path, query);
        let mapping_result = self
            .config
            .route()
            .apply(&mapping_ctx)
            .ok_or_else(|| Error::NotFound {
                path: mapping_ctx.path().to_string(),
            })?;

        let server = self.config.server();
        let ctx = DefaultServiceRequestContext::new(
            self.session,
            Arc::clone(&self.config),
            mapping_ctx,
            mapping_result,
            self.request,
            Attributes::new(),
            Limits {
                request_timeout_ms: server.default_request_timeout_ms,
                max_request_length: server.default_max_request_length,
                timeout_handler: None,
            },
        );
        ctx.log.start_request(hostname);
        Ok(Arc::new(ctx))
    }
}

// ---------------------------------------------------------------------------
// DefaultServiceRequestContext
// ---------------------------------------------------------------------------

struct Limits {
    request_timeout_ms: u64,
    max_request_length: u64,
    timeout_handler: Option<Arc<RequestTimeoutHandler>>,
}

/// The request context created for each request received by a session.
pub struct DefaultServiceRequestContext {
    id: ContextId,
    session: Arc<Session>,
    config: Arc<ServiceConfig>,
    mapping_ctx: PathMappingContext,
    mapping_result: PathMappingResult,
    request: Option<SharedRequest>,
    attrs: Attributes,
    log: RequestLog,
    span: Span,
    request_timeout_ms: AtomicU64,
    max_request_length: AtomicU64,
    timeout_handler: ArcSwapOption<RequestTimeoutHandler>,
    timeout_listener: OnceLock<Arc<dyn Fn(u64) + Send + Sync>>,
    description: OnceLock<String>,
}

impl DefaultServiceRequestContext {
    #[must_use]
    pub fn builder(
        session: Arc<Session>,
        config: Arc<ServiceConfig>,
        method: Method,
        path: impl Into<String>,
    ) -> ServiceRequestContextBuilder {
        ServiceRequestContextBuilder {
            session,
            config,
            method,
            path: path.into(),
            query: None,
            hostname: None,
            request: None,
        }
    }

    fn new(
        session: Arc<Session>,
        config: Arc<ServiceConfig>,
        mapping_ctx: PathMappingContext,
        mapping_result: PathMappingResult,
        request: Option<SharedRequest>,
        attrs: Attributes,
        limits: Limits,
    ) -> Self {
        let id = ContextId::new();
        let span = info_span!(
            "request",
            ctx = %id,
            session = %session.id(),
            method = %mapping_ctx.method(),
            path = %mapping_ctx.path(),
        );
        Self {
            id,
            log: RequestLog::new(mapping_ctx.method().clone(), mapping_ctx.path()),
            session,
            config,
            mapping_ctx,
            mapping_result,
            request,
            attrs,
            span,
            request_timeout_ms: AtomicU64::new(limits.request_timeout_ms),
            max_request_length: AtomicU64::new(limits.max_request_length),
            timeout_handler: ArcSwapOption::new(limits.timeout_handler),
            timeout_listener: OnceLock::new(),
            description: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        self.mapping_ctx.hostname()
    }

    fn notify_timeout_change(&self, timeout_ms: u64) {
        let Some(listener) = self.timeout_listener.get() else {
            return;
        };
        let event_loop = self.session.event_loop();
        if event_loop.in_event_loop() {
            listener(timeout_ms);
        } else {
            let listener = Arc::clone(listener);
            event_loop.execute(Box::new(move || listener(timeout_ms)));
        }
    }
}

fn non_negative(name: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::InvalidArgument(format!("{name}: {value} (expected: >= 0)")))
}

impl fmt::Display for DefaultServiceRequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = self.description.get_or_init(|| {
            format!(
                "[{}://{}{}#{}]",
                self.session.protocol(),
                self.mapping_ctx.hostname(),
                self.mapping_ctx.path(),
                self.mapping_ctx.method(),
            )
        });
        f.write_str(description)
    }
}

impl fmt::Debug for DefaultServiceRequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultServiceRequestContext")
            .field("id", &self.id)
            .field("session", &self.session.id())
            .field("route", self.config.route())
            .field("path", &self.mapping_ctx.path())
            .field("mapped_path", &self.mapping_result.path())
            .finish_non_exhaustive()
    }
}

impl RequestContext for DefaultServiceRequestContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn session_protocol(&self) -> SessionProtocol {
        self.session.protocol()
    }

    fn method(&self) -> &Method {
        self.mapping_ctx.method()
    }

    fn path(&self) -> &str {
        self.mapping_ctx.path()
    }

    fn query(&self) -> Option<&str> {
        self.mapping_ctx.query()
    }

    fn request(&self) -> Option<&SharedRequest> {
        self.request.as_ref()
    }

    fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    fn log(&self) -> &RequestLog {
        &self.log
    }

    fn event_loop(&self) -> &Arc<dyn EventLoop> {
        self.session.event_loop()
    }

    fn span(&self) -> &Span {
        &self.span
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ServiceRequestContext for DefaultServiceRequestContext {
    fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn config(&self) -> &Arc<ServiceConfig> {
        &self.config
    }

    fn route(&self) -> &PathMapping {
        self.config.route()
    }

    fn mapped_path(&self) -> &str {
        self.mapping_result.path()
    }

    fn path_mapping_context(&self) -> &PathMappingContext {
        &self.mapping_ctx
    }

    fn path_params(&self) -> &HashMap<String, String> {
        self.mapping_result.params()
    }

    fn request_timeout_millis(&self) -> u64 {
        self.request_timeout_ms.load(Ordering::Acquire)
    }

    fn set_request_timeout_millis(&self, timeout_ms: i64) -> Result<()> {
        let timeout_ms = non_negative("request_timeout_millis", timeout_ms)?;
        let old = self.request_timeout_ms.swap(timeout_ms, Ordering::AcqRel);
        if old != timeout_ms {
            self.notify_timeout_change(timeout_ms);
        }
        Ok(())
    }

    fn max_request_length(&self) -> u64 {
        self.max_request_length.load(Ordering::Acquire)
    }

    fn set_max_request_length(&self, max: i64) -> Result<()> {
        let max = non_negative("max_request_length", max)?;
        self.max_request_length.store(max, Ordering::Release);
        Ok(())
    }

    fn request_timeout_handler(&self) -> Option<Arc<RequestTimeoutHandler>> {
        self.timeout_handler.load_full()
    }

    fn set_request_timeout_handler(&self, handler: RequestTimeoutHandler) {
        self.timeout_handler.store(Some(Arc::new(handler)));
    }

    fn set_request_timeout_change_listener(&self, listener: TimeoutChangeListener) -> Result<()> {
        let listener: Arc<dyn Fn(u64) + Send + Sync> = Arc::from(listener);
        self.timeout_listener
            .set(listener)
            .map_err(|_| Error::IllegalState("request timeout change listener set already".into()))
    }

    fn new_derived_context(&self, request: Option<SharedRequest>) -> Arc<dyn ServiceRequestContext> {
        let derived = Self::new(
            Arc::clone(&self.session),
            Arc::clone(&self.config),
            self.mapping_ctx.clone(),
            self.mapping_result.clone(),
            request.or_else(|| self.request.clone()),
            self.attrs.snapshot(),
            Limits {
                request_timeout_ms: self.request_timeout_millis(),
                max_request_length: self.max_request_length(),
                timeout_handler: self.request_timeout_handler(),
            },
        );
        derived.log.start_request(self.mapping_ctx.hostname());
        Arc::new(derived)
    }

    fn into_request_context(self: Arc<Self>) -> Arc<dyn RequestContext> {
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use ctrlshift_core::context::store;
    use ctrlshift_core::AttributeKey;
    use parking_lot::Mutex;

    use super::*;
    use crate::context::test_support::{context_at, session, service_config};

    const USER: AttributeKey<String> = AttributeKey::new("user");

    #[test]
    fn build_applies_the_route() {
        let config = service_config(PathMapping::prefix("/api/").unwrap());
        let ctx = DefaultServiceRequestContext::builder(session(), config, Method::POST, "/api/users?page=2")
            .hostname("example.com")
            .build()
            .unwrap();
        assert_eq!(ctx.path(), "/api/users");
        assert_eq!(ctx.query(), Some("page=2"));
        assert_eq!(ctx.mapped_path(), "/users");
        assert_eq!(ctx.to_string(), "[h2c://example.com/api/users#POST]");
        assert_eq!(ctx.request_timeout_millis(), 10_000);
        assert!(ctx.path_params().is_empty());
    }

    #[test]
    fn build_rejects_unrouted_and_relative_paths() {
        let config = service_config(PathMapping::prefix("/api/").unwrap());
        let unrouted =
            DefaultServiceRequestContext::builder(session(), Arc::clone(&config), Method::GET, "/other").build();
        assert!(matches!(unrouted, Err(Error::NotFound { path }) if path == "/other"));

        let relative = DefaultServiceRequestContext::builder(session(), config, Method::GET, "api/x").build();
        assert!(matches!(relative, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn negative_values_are_rejected_and_ignored() {
        let ctx = context_at("/a");
        ctx.set_request_timeout_millis(500).unwrap();
        assert!(matches!(ctx.set_request_timeout_millis(-1), Err(Error::InvalidArgument(_))));
        assert_eq!(ctx.request_timeout_millis(), 500);

        ctx.set_max_request_length(0).unwrap();
        assert!(matches!(ctx.set_max_request_length(-5), Err(Error::InvalidArgument(_))));
        assert_eq!(ctx.max_request_length(), 0);
    }

    #[test]
    fn timeout_listener_is_notified_once_per_change() {
        let ctx = context_at("/a");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        ctx.set_request_timeout_change_listener(Box::new(move |ms| s.lock().push(ms)))
            .unwrap();

        let second = ctx.set_request_timeout_change_listener(Box::new(|_| {}));
        assert!(matches!(second, Err(Error::IllegalState(_))));

        ctx.set_request_timeout_millis(200).unwrap();
        ctx.set_request_timeout_millis(200).unwrap();
        ctx.set_request_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(*seen.lock(), vec![200, 1000]);
    }

    #[test]
    fn derived_context_forks_state() {
        let ctx = context_at("/a");
        ctx.attrs().set(&USER, "alice".to_string());
        ctx.set_request_timeout_millis(1234).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        ctx.set_request_timeout_handler(RequestTimeoutHandler::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        let derived = ctx.new_derived_context(None);
        assert_ne!(derived.id(), ctx.id());
        assert_eq!(derived.path(), "/a");
        assert_eq!(derived.request_timeout_millis(), 1234);
        assert_eq!(derived.attrs().get(&USER).as_deref().map(String::as_str), Some("alice"));

        derived.attrs().set(&USER, "bob".to_string());
        assert_eq!(ctx.attrs().get(&USER).as_deref().map(String::as_str), Some("alice"));

        derived.request_timeout_handler().unwrap().run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // The listener stays with the original.
        derived
            .set_request_timeout_change_listener(Box::new(|_| {}))
            .unwrap();
    }

    #[test]
    fn derived_context_can_replace_the_request() {
        let ctx = context_at("/a");
        let request: SharedRequest = Arc::new(42_u32);
        let derived = ctx.new_derived_context(Some(request));
        let derived = derived.into_request_context();
        assert_eq!(derived.request_as::<u32>(), Some(&42));
    }

    #[test]
    fn listener_is_marshalled_onto_the_event_loop() {
        use std::net::SocketAddr;

        use ctrlshift_core::ImmediateEventLoop;

        use crate::event_loop::ThreadEventLoop;

        let event_loop = Arc::new(ThreadEventLoop::spawn("test-ctx-loop").unwrap());
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let session = Arc::new(Session::new(
            SessionProtocol::H1C,
            addr,
            addr,
            Arc::clone(&event_loop) as Arc<dyn EventLoop>,
            Arc::new(ImmediateEventLoop),
        ));
        let ctx = DefaultServiceRequestContext::builder(session, service_config(PathMapping::CatchAll), Method::GET, "/x")
            .build()
            .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let el = Arc::clone(&event_loop);
        ctx.set_request_timeout_change_listener(Box::new(move |ms| {
            let _ = tx.send((ms, el.in_event_loop()));
        }))
        .unwrap();

        ctx.set_request_timeout_millis(750).unwrap();
        let (ms, on_loop) = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(ms, 750);
        assert!(on_loop);
        assert_eq!(ctx.to_string(), "[h1c://localhost/x#GET]");
    }

    #[test]
    fn logger_and_blocking_executor_carry_the_context() {
        let ctx: Arc<dyn ServiceRequestContext> = context_at("/a");
        assert_eq!(ctx.logger().name(), "ctrlshift.services.__ROOT__");

        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let executor = ctx.blocking_task_executor();
        ctrlshift_core::Executor::execute(
            &executor,
            Box::new(move || *s.lock() = store::current().map(|c| c.id())),
        );
        assert_eq!(*seen.lock(), Some(ctx.id()));
    }
}

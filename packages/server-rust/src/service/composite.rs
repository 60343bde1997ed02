//! A service that dispatches to child services by sub-path.
//!
//! The composite matches the request's mapped path against its children.
//! A child bound at a prefix sees a context whose route is the parent prefix
//! joined with the child prefix, and whose mapped path is relative to it.
//! Exact and unmatched children behave as if called directly.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use ctrlshift_core::{
    Attributes, ContextId, Error, EventLoop, RequestContext, RequestLog, Result, SessionProtocol,
    SharedRequest, WithContext,
};
use http::Method;
use tower::Service;
use tracing::{debug, info_span, Span};

use super::config::ServiceConfig;
use super::mapping::{PathMapping, PathMappingContext, PathMappingResult};
use super::router::Router;
use super::{BoxFuture, BoxedService, RequestService, ServiceRequest};
use crate::context::{RequestTimeoutHandler, ServiceRequestContext, TimeoutChangeListener};
use crate::session::Session;

// ---------------------------------------------------------------------------
// CompositeServiceEntry
// ---------------------------------------------------------------------------

/// A child service and the mapping it is reached through.
pub struct CompositeServiceEntry<I, O> {
    mapping: PathMapping,
    service: BoxedService<I, O>,
}

impl<I, O> CompositeServiceEntry<I, O> {
    #[must_use]
    pub fn new(mapping: PathMapping, service: BoxedService<I, O>) -> Self {
        Self { mapping, service }
    }

    /// # Errors
    ///
    /// `InvalidArgument` if `prefix` is not absolute.
    pub fn of_prefix(prefix: &str, service: BoxedService<I, O>) -> Result<Self> {
        Ok(Self::new(PathMapping::prefix(prefix)?, service))
    }

    /// # Errors
    ///
    /// `InvalidArgument` if `path` is not absolute.
    pub fn of_exact(path: &str, service: BoxedService<I, O>) -> Result<Self> {
        Ok(Self::new(PathMapping::exact(path)?, service))
    }

    #[must_use]
    pub fn of_catch_all(service: BoxedService<I, O>) -> Self {
        Self::new(PathMapping::CatchAll, service)
    }

    #[must_use]
    pub fn mapping(&self) -> &PathMapping {
        &self.mapping
    }
}

impl<I, O> fmt::Debug for CompositeServiceEntry<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeServiceEntry")
            .field("mapping", &self.mapping)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CompositeService
// ---------------------------------------------------------------------------

/// Dispatches each request to the most specific matching child.
pub struct CompositeService<I, O> {
    services: Vec<BoxedService<I, O>>,
    router: Router<usize>,
    added: bool,
}

impl<I, O> CompositeService<I, O> {
    /// # Errors
    ///
    /// `InvalidArgument` if `entries` is empty.
    pub fn new(entries: impl IntoIterator<Item = CompositeServiceEntry<I, O>>) -> Result<Self> {
        let mut services = Vec::new();
        let mut routes = Vec::new();
        for (index, entry) in entries.into_iter().enumerate() {
            routes.push((entry.mapping, index));
            services.push(entry.service);
        }
        if services.is_empty() {
            return Err(Error::InvalidArgument(
                "services: empty (expected: at least one child service)".into(),
            ));
        }
        Ok(Self {
            services,
            router: Router::new(routes),
            added: false,
        })
    }

    /// The child registered at position `index`.
    #[must_use]
    pub fn service_at(&self, index: usize) -> Option<&BoxedService<I, O>> {
        self.services.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl<I, O> fmt::Debug for CompositeService<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeService")
            .field("router", &self.router)
            .field("added", &self.added)
            .finish_non_exhaustive()
    }
}

impl<I, O> Service<ServiceRequest<I>> for CompositeService<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    type Response = O;
    type Error = Error;
    type Future = BoxFuture<O>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Every child must be ready.
        for svc in &mut self.services {
            match svc.poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ServiceRequest<I>) -> Self::Future {
        let ServiceRequest { ctx, req } = request;
        let mapping_ctx = ctx.path_mapping_context().override_path(ctx.mapped_path());
        let Some(mapped) = self.router.find(&mapping_ctx) else {
            let path = ctx.mapped_path().to_string();
            debug!(ctx = %ctx, %path, "no child service matched");
            return Box::pin(async move { Err(Error::NotFound { path }) });
        };
        let index = *mapped.value;

        let Some(child_prefix) = mapped.mapping.prefix_str() else {
            return self.services[index].call(ServiceRequest::new(ctx, req));
        };
        let parent_prefix = ctx.route().prefix_str().unwrap_or("/");
        let route = match PathMapping::prefix(format!("{parent_prefix}{}", &child_prefix[1..])) {
            Ok(route) => route,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let view: Arc<dyn ServiceRequestContext> =
            Arc::new(CompositeServiceRequestContext::new(ctx, route, mapped.result));
        let svc = &mut self.services[index];
        let fut = view.run(|| svc.call(ServiceRequest::new(Arc::clone(&view), req)));
        Box::pin(fut.with_context(view.into_request_context()))
    }
}

impl<I, O> RequestService<I, O> for CompositeService<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn service_added(&mut self, config: &ServiceConfig) -> Result<()> {
        if self.added {
            return Err(Error::IllegalState(
                "cannot be added to more than one server".into(),
            ));
        }
        self.added = true;
        for svc in &mut self.services {
            svc.service_added(config)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CompositeServiceRequestContext
// ---------------------------------------------------------------------------

/// The view of a parent context that a prefix-bound child is served in.
///
/// Route, mapped path and path parameters are the child's, and attributes are
/// a copy taken at fork time. Method, path, request log and timeout state
/// stay the parent's.
struct CompositeServiceRequestContext {
    id: ContextId,
    parent: Arc<dyn ServiceRequestContext>,
    route: PathMapping,
    result: PathMappingResult,
    attrs: Attributes,
    span: Span,
}

impl CompositeServiceRequestContext {
    fn new(parent: Arc<dyn ServiceRequestContext>, route: PathMapping, result: PathMappingResult) -> Self {
        let span = info_span!(
            parent: parent.span(),
            "composite",
            route = %route,
            mapped_path = %result.path(),
        );
        Self {
            id: ContextId::new(),
            attrs: parent.attrs().snapshot(),
            parent,
            route,
            result,
            span,
        }
    }
}

impl fmt::Display for CompositeServiceRequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.parent, f)
    }
}

impl RequestContext for CompositeServiceRequestContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn session_protocol(&self) -> SessionProtocol {
        self.parent.session_protocol()
    }

    fn method(&self) -> &Method {
        self.parent.method()
    }

    fn path(&self) -> &str {
        self.parent.path()
    }

    fn query(&self) -> Option<&str> {
        self.parent.query()
    }

    fn request(&self) -> Option<&SharedRequest> {
        self.parent.request()
    }

    fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    fn log(&self) -> &RequestLog {
        self.parent.log()
    }

    fn event_loop(&self) -> &Arc<dyn EventLoop> {
        self.parent.event_loop()
    }

    fn span(&self) -> &Span {
        &self.span
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ServiceRequestContext for CompositeServiceRequestContext {
    fn session(&self) -> &Arc<Session> {
        self.parent.session()
    }

    fn config(&self) -> &Arc<ServiceConfig> {
        self.parent.config()
    }

    fn route(&self) -> &PathMapping {
        &self.route
    }

    fn mapped_path(&self) -> &str {
        self.result.path()
    }

    fn path_mapping_context(&self) -> &PathMappingContext {
        self.parent.path_mapping_context()
    }

    fn path_params(&self) -> &HashMap<String, String> {
        self.result.params()
    }

    fn request_timeout_millis(&self) -> u64 {
        self.parent.request_timeout_millis()
    }

    fn set_request_timeout_millis(&self, timeout_ms: i64) -> Result<()> {
        self.parent.set_request_timeout_millis(timeout_ms)
    }

    fn max_request_length(&self) -> u64 {
        self.parent.max_request_length()
    }

    fn set_max_request_length(&self, max: i64) -> Result<()> {
        self.parent.set_max_request_length(max)
    }

    fn request_timeout_handler(&self) -> Option<Arc<RequestTimeoutHandler>> {
        self.parent.request_timeout_handler()
    }

    fn set_request_timeout_handler(&self, handler: RequestTimeoutHandler) {
        self.parent.set_request_timeout_handler(handler);
    }

    fn set_request_timeout_change_listener(&self, listener: TimeoutChangeListener) -> Result<()> {
        self.parent.set_request_timeout_change_listener(listener)
    }

    fn new_derived_context(&self, request: Option<SharedRequest>) -> Arc<dyn ServiceRequestContext> {
        Arc::new(Self::new(
            self.parent.new_derived_context(request),
            self.route.clone(),
            self.result.clone(),
        ))
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
    use std::future::{ready, Ready};

    use ctrlshift_core::context::store;
    use tower::ServiceExt;

    use super::*;
    use crate::context::test_support::context_at;
    use crate::service::boxed;

    /// Replies with the route and mapped path it was reached through.
    #[derive(Clone)]
    struct Echo(&'static str);

    impl Service<ServiceRequest<()>> for Echo {
        type Response = String;
        type Error = Error;
        type Future = Ready<Result<String>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: ServiceRequest<()>) -> Self::Future {
            let ctx = &request.ctx;
            let current = store::current().map(|c| c.id());
            assert_eq!(current, Some(ctx.id()), "child must run with its context pushed");
            ready(Ok(format!(
                "{} {} {}",
                self.0,
                ctx.route().prefix_str().unwrap_or("-"),
                ctx.mapped_path()
            )))
        }
    }

    fn composite() -> CompositeService<(), String> {
        CompositeService::new([
            CompositeServiceEntry::of_prefix("/foo/", boxed(Echo("a"))).unwrap(),
            CompositeServiceEntry::of_exact("/bar", boxed(Echo("b"))).unwrap(),
        ])
        .unwrap()
    }

    async fn serve(svc: CompositeService<(), String>, path: &str) -> Result<String> {
        let ctx: Arc<dyn ServiceRequestContext> = context_at(path);
        let root = Arc::clone(&ctx).into_request_context();
        let _guard = store::enter(root);
        svc.oneshot(ServiceRequest::new(ctx, ())).await
    }

    #[tokio::test]
    async fn prefix_child_sees_its_sub_path() {
        assert_eq!(serve(composite(), "/foo/x").await.unwrap(), "a /foo/ /x");
    }

    #[tokio::test]
    async fn exact_child_sees_the_parent_context() {
        let ctx: Arc<dyn ServiceRequestContext> = context_at("/bar");
        let expected = ctx.id();
        let svc = CompositeService::new([CompositeServiceEntry::of_exact(
            "/bar",
            boxed(tower::service_fn(move |r: ServiceRequest<()>| async move {
                Ok::<_, Error>(r.ctx.id())
            })),
        )
        .unwrap()])
        .unwrap();
        assert_eq!(svc.oneshot(ServiceRequest::new(ctx, ())).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn unmatched_path_is_not_found() {
        let err = serve(composite(), "/baz").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { path } if path == "/baz"));
    }

    #[tokio::test]
    async fn nested_prefixes_concatenate() {
        let inner = CompositeService::new([CompositeServiceEntry::of_prefix("/b/", boxed(Echo("inner"))).unwrap()])
            .unwrap();
        let outer = CompositeService::new([CompositeServiceEntry::of_prefix("/a/", Box::new(inner)).unwrap()])
            .unwrap();
        assert_eq!(serve(outer, "/a/b/c").await.unwrap(), "inner /a/b/ /c");
    }

    #[tokio::test]
    async fn view_forks_attributes_and_shares_timeouts() {
        use ctrlshift_core::AttributeKey;
        const USER: AttributeKey<String> = AttributeKey::new("user");

        let svc = CompositeService::new([CompositeServiceEntry::of_prefix(
            "/p/",
            boxed(tower::service_fn(|r: ServiceRequest<()>| async move {
                let user = r.ctx.attrs().get(&USER);
                r.ctx.attrs().set(&USER, "child".to_string());
                r.ctx.set_request_timeout_millis(42)?;
                Ok::<_, Error>(user.as_deref().cloned())
            })),
        )
        .unwrap()])
        .unwrap();
        let ctx: Arc<dyn ServiceRequestContext> = context_at("/p/q");
        ctx.attrs().set(&USER, "parent".to_string());

        let seen = svc.oneshot(ServiceRequest::new(Arc::clone(&ctx), ())).await.unwrap();
        assert_eq!(seen.as_deref(), Some("parent"));
        assert_eq!(ctx.attrs().get(&USER).as_deref().map(String::as_str), Some("parent"));
        assert_eq!(ctx.request_timeout_millis(), 42);
    }

    #[test]
    fn empty_composite_is_rejected() {
        let entries: Vec<CompositeServiceEntry<(), String>> = Vec::new();
        assert!(matches!(CompositeService::new(entries), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn can_be_added_only_once() {
        let mut svc = composite();
        let config = crate::context::test_support::service_config(PathMapping::CatchAll);
        svc.service_added(&config).unwrap();
        assert!(matches!(svc.service_added(&config), Err(Error::IllegalState(_))));
        assert_eq!(svc.len(), 2);
        assert!(svc.service_at(1).is_some());
    }

    #[test]
    fn nested_composite_rejects_a_second_parent() {
        let config = crate::context::test_support::service_config(PathMapping::CatchAll);
        let mut inner = composite();
        inner.service_added(&config).unwrap();
        let mut outer = CompositeService::new([CompositeServiceEntry::of_catch_all(Box::new(inner))]).unwrap();
        assert!(matches!(outer.service_added(&config), Err(Error::IllegalState(_))));
    }
}

use std::fmt;
use std::sync::Arc;

use tracing::Level;

use super::RequestContext;

/// A named logger whose events carry the request's identity.
///
/// Each call pushes the context for its duration and parents the event to
/// the context's `request` span, so the `ctx`, `method` and `path` fields
/// appear on every line regardless of which thread emits it.
#[derive(Clone)]
pub struct ContextAwareLogger {
    ctx: Arc<dyn RequestContext>,
    name: Arc<str>,
}

macro_rules! level_methods {
    ($($method:ident => $level:expr),* $(,)?) => {
        $(
            pub fn $method(&self, args: fmt::Arguments<'_>) {
                self.ctx.run(|| {
                    tracing::event!(parent: self.ctx.span(), $level, logger = %self.name, "{}", args);
                });
            }
        )*
    };
}

impl ContextAwareLogger {
    #[must_use]
    pub fn new(ctx: Arc<dyn RequestContext>, name: impl Into<Arc<str>>) -> Self {
        Self {
            ctx,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn context(&self) -> &Arc<dyn RequestContext> {
        &self.ctx
    }

    level_methods! {
        trace => Level::TRACE,
        debug => Level::DEBUG,
        info => Level::INFO,
        warn => Level::WARN,
        error => Level::ERROR,
    }
}

impl fmt::Debug for ContextAwareLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextAwareLogger")
            .field("name", &self.name)
            .field("ctx", &self.ctx.to_string())
            .finish()
    }
}

//! Per-thread stack of active request contexts.
//!
//! Contexts are pushed with a scoped [`ContextGuard`] that pops on drop, so
//! every exit path (return, `?`, panic unwinding, future cancellation)
//! restores the previous state.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use super::RequestContext;
use crate::error::{Error, Result};

thread_local! {
    static STACK: RefCell<Vec<Arc<dyn RequestContext>>> = const { RefCell::new(Vec::new()) };
}

/// Restores the context stack to its state before the matching push.
///
/// Not `Send`: a guard must be dropped on the thread that created it.
#[must_use = "the context is popped as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ContextGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        // Truncating (rather than popping) keeps out-of-order drops harmless.
        let _ = STACK.try_with(|stack| stack.borrow_mut().truncate(self.depth));
    }
}

/// Makes `ctx` the current context until the guard is dropped.
///
/// # Errors
///
/// `IllegalState` if `require_old_context_absent` is set and another context
/// is already active on this thread.
pub fn push(
    ctx: Arc<dyn RequestContext>,
    require_old_context_absent: bool,
) -> Result<ContextGuard> {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        if require_old_context_absent {
            if let Some(old) = stack.last() {
                return Err(Error::illegal_state(format!(
                    "trying to call object wrapped with context {ctx}, but context is currently set to {old}. \
                     This means the callback was passed from one invocation to another which is not allowed."
                )));
            }
        }
        let depth = stack.len();
        stack.push(ctx);
        Ok(ContextGuard {
            depth,
            _not_send: PhantomData,
        })
    })
}

/// Like [`push`] without the absence check; nesting is always allowed.
pub fn enter(ctx: Arc<dyn RequestContext>) -> ContextGuard {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let depth = stack.len();
        stack.push(ctx);
        ContextGuard {
            depth,
            _not_send: PhantomData,
        }
    })
}

/// The innermost active context on this thread.
#[must_use]
pub fn current() -> Option<Arc<dyn RequestContext>> {
    STACK.with(|stack| stack.borrow().last().cloned())
}

/// Runs `f` with the innermost active context, if any.
pub fn map_current<R>(f: impl FnOnce(&dyn RequestContext) -> R) -> Option<R> {
    current().map(|ctx| f(ctx.as_ref()))
}

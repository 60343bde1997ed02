//! Scheduling-unit abstractions consumed from the transport layer.
//!
//! An [`EventLoop`] is the single logical thread that drives delivery and
//! context-affine mutation for one connection. Concrete loops live in the
//! server crate; [`ImmediateEventLoop`] runs everything inline on the caller.

use std::fmt;

/// A unit of work submitted to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Anything that can run a [`Task`], now or later.
pub trait Executor: Send + Sync {
    /// Submits a task for execution.
    fn execute(&self, task: Task);
}

/// A FIFO, single-threaded executor that owns a connection's delivery.
pub trait EventLoop: Executor {
    /// Returns `true` when called from the loop's own thread.
    fn in_event_loop(&self) -> bool;
}

/// Event loop that runs every task synchronously on the submitting thread.
///
/// Useful for tests and for callers that are already serialized.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateEventLoop;

impl Executor for ImmediateEventLoop {
    fn execute(&self, task: Task) {
        task();
    }
}

impl EventLoop for ImmediateEventLoop {
    fn in_event_loop(&self) -> bool {
        true
    }
}

impl fmt::Debug for dyn EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventLoop")
    }
}

impl fmt::Debug for dyn Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Executor")
    }
}

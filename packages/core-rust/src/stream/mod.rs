//! Backpressure-driven object streams.
//!
//! A stream has exactly one writer and at most one subscriber. Writers may
//! call [`StreamWriter`] methods from any thread; delivery to the
//! [`Subscriber`] is serialized onto the subscriber's event loop and never
//! exceeds the demand it has requested.
//!
//! Lifecycle: `Open -> Closed -> Cleanup`, or `Open -> Cleanup` directly on
//! cancellation or abort. Elements that never reach the subscriber are handed
//! to [`crate::resource::safe_release`].

mod message;
mod subscriber;
mod writer;

pub use message::{DefaultStreamMessage, StreamMessage, StreamState};
pub use subscriber::{Subscriber, Subscription};
pub use writer::{Rejected, StreamWriter};

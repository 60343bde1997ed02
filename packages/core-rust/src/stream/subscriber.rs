use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::Error;

/// Consumer side of a stream.
///
/// All callbacks for one subscriber run on the event loop it subscribed with,
/// one at a time.
pub trait Subscriber<T>: Send + 'static {
    /// First signal; hands over the subscription used to request elements.
    fn on_subscribe(&mut self, subscription: Subscription);

    /// Delivers one element.
    ///
    /// # Errors
    ///
    /// Returning an error fails the stream with that cause: remaining elements
    /// are released and the error is propagated through `on_error` and the
    /// completion future.
    fn on_next(&mut self, item: T) -> Result<(), Error>;

    /// Terminal signal for an unsuccessful stream.
    fn on_error(&mut self, cause: Error);

    /// Terminal signal for a successfully closed stream.
    fn on_complete(&mut self);
}

pub(crate) trait SubscriptionHandle: Send + Sync {
    fn request(self: Arc<Self>, n: u64);
    fn cancel(self: Arc<Self>);
}

/// Demand channel from a subscriber back to its stream.
#[derive(Clone, Default)]
pub struct Subscription {
    handle: Option<Weak<dyn SubscriptionHandle>>,
}

impl Subscription {
    pub(crate) fn new(handle: Weak<dyn SubscriptionHandle>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// A subscription that ignores every call.
    pub(crate) fn noop() -> Self {
        Self::default()
    }

    /// Grants credit for `n` more elements. `u64::MAX` means unbounded.
    ///
    /// `n == 0` fails the stream with `InvalidArgument`.
    pub fn request(&self, n: u64) {
        if let Some(handle) = self.handle.as_ref().and_then(Weak::upgrade) {
            handle.request(n);
        }
    }

    /// Stops delivery and releases every element not yet delivered.
    pub fn cancel(&self) {
        if let Some(handle) = self.handle.as_ref().and_then(Weak::upgrade) {
            handle.cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.handle.is_some())
            .finish()
    }
}

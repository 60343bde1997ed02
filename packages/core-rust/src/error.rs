//! Error taxonomy shared by streams, contexts, routing and RPC completion.
//!
//! Completion causes are delivered to every registered listener, so [`Error`]
//! is `Clone`. Arbitrary caller-supplied causes are carried as
//! `Arc<anyhow::Error>`.

use std::sync::Arc;

/// Errors raised by the framework core.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed call input (disallowed payload kind, negative timeout or length).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation is invalid for the current lifecycle state.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// Demand was awaited on a publisher that is already closed.
    #[error("publisher is closed")]
    ClosedPublisher,
    /// The subscriber cancelled its subscription.
    #[error("subscription cancelled")]
    CancelledSubscription,
    /// The producer aborted the stream.
    #[error("stream aborted")]
    AbortedStream,
    /// No route matched the request path.
    #[error("no route for path: {path}")]
    NotFound { path: String },
    /// The request did not complete within its timeout.
    #[error("request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },
    /// A failure re-surfaced through another asynchronous result.
    #[error("completion failed: {0}")]
    Completion(Box<Error>),
    /// Any other caller-supplied failure cause.
    #[error(transparent)]
    Other(Arc<anyhow::Error>),
}

impl Error {
    /// Wraps an arbitrary failure cause.
    pub fn other(cause: impl Into<anyhow::Error>) -> Self {
        Self::Other(Arc::new(cause.into()))
    }

    /// Wraps this error in one [`Error::Completion`] layer.
    #[must_use]
    pub fn into_completion(self) -> Self {
        Self::Completion(Box::new(self))
    }

    /// Removes one wrapping layer, exposing the cause underneath.
    ///
    /// Errors that are not wrappers are returned unchanged.
    #[must_use]
    pub fn peel(self) -> Self {
        match self {
            Self::Completion(inner) => *inner,
            other => other,
        }
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peel_removes_exactly_one_layer() {
        let inner = Error::other(anyhow::anyhow!("boom"));
        let twice = inner.clone().into_completion().into_completion();

        let once = twice.peel();
        assert!(matches!(once, Error::Completion(_)));
        assert!(matches!(once.peel(), Error::Other(_)));
    }

    #[test]
    fn peel_leaves_plain_errors_alone() {
        assert!(matches!(Error::ClosedPublisher.peel(), Error::ClosedPublisher));
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            Error::NotFound { path: "/baz".into() }.to_string(),
            "no route for path: /baz"
        );
        assert_eq!(Error::other(anyhow::anyhow!("custom")).to_string(), "custom");
    }
}

use std::fmt;

use crate::error::{Error, Result};
use crate::future::Promise;
use crate::resource::StreamObject;

/// Returned by [`StreamWriter::try_write`] when the element is a managed value
/// of a kind streams may not own.
///
/// The caller keeps ownership; dropping the error releases the element.
#[derive(thiserror::Error)]
#[error("can't publish a reference-counted value that is not a buffer or a buffer holder")]
pub struct Rejected<T> {
    element: T,
}

impl<T> Rejected<T> {
    pub(crate) fn new(element: T) -> Self {
        Self { element }
    }

    /// Takes the rejected element back.
    pub fn into_inner(self) -> T {
        self.element
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected").finish_non_exhaustive()
    }
}

impl<T> From<Rejected<T>> for Error {
    fn from(rejected: Rejected<T>) -> Self {
        Error::InvalidArgument(rejected.to_string())
    }
}

/// Produces the elements published by a stream.
///
/// Managed elements passed to the write methods are released by the stream
/// once they are no longer in use: when the write returns `false` or an
/// error, when the subscriber consumes them, or when the stream is cancelled,
/// aborted or failed.
pub trait StreamWriter<T: StreamObject> {
    /// `true` while the stream accepts new elements.
    fn is_open(&self) -> bool;

    /// Enqueues `obj` for publication.
    ///
    /// Returns `Ok(false)` and releases `obj` if the stream is no longer open.
    ///
    /// # Errors
    ///
    /// [`Rejected`] if `obj` is a managed value of a non-transferable kind.
    fn try_write(&self, obj: T) -> Result<bool, Rejected<T>>;

    /// Like [`try_write`](Self::try_write) with a lazily produced element.
    ///
    /// # Errors
    ///
    /// See [`try_write`](Self::try_write).
    fn try_write_with<F>(&self, supplier: F) -> Result<bool, Rejected<T>>
    where
        F: FnOnce() -> T,
        Self: Sized,
    {
        self.try_write(supplier())
    }

    /// Enqueues `obj`, failing if the stream is closed.
    ///
    /// # Errors
    ///
    /// `IllegalState` if the stream was already closed (the element is
    /// released), `InvalidArgument` if the element kind was rejected.
    fn write(&self, obj: T) -> Result<()> {
        if self.try_write(obj)? {
            Ok(())
        } else {
            Err(Error::illegal_state("stream closed"))
        }
    }

    /// Like [`write`](Self::write) with a lazily produced element.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    fn write_with<F>(&self, supplier: F) -> Result<()>
    where
        F: FnOnce() -> T,
        Self: Sized,
    {
        self.write(supplier())
    }

    /// Runs `task` once the subscriber has outstanding demand.
    ///
    /// The returned promise completes after `task` has run, or fails with
    /// `ClosedPublisher` if the stream closes first (in which case `task`
    /// never runs).
    fn on_demand<F>(&self, task: F) -> Promise<()>
    where
        F: FnOnce() + Send + 'static;

    /// Closes the stream successfully.
    fn close(&self);

    /// Closes the stream with `cause`.
    fn close_with_cause(&self, cause: Error);

    /// Writes `obj` and closes the stream successfully.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write). The stream is left open on error.
    fn close_with(&self, obj: T) -> Result<()> {
        self.write(obj)?;
        self.close();
        Ok(())
    }
}

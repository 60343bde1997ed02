//! Resource lifecycle guard for payloads with manually managed lifetimes.
//!
//! A payload entering a stream is moved into the stream's queue. When it
//! leaves the system without reaching a live subscriber (rejection,
//! cancellation, abort, failure) the stream hands it to [`safe_release`],
//! which drops it exactly once. Pooled buffers report their release to the
//! [`BufferAllocator`] that issued them.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::trace;

/// Lifetime management class of a stream element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedKind {
    /// A pooled byte buffer.
    Buffer,
    /// A value that owns exactly one pooled buffer.
    BufferHolder,
    /// A managed value of any other kind. Streams refuse these.
    Opaque,
}

impl ManagedKind {
    /// Whether a stream may take ownership of this kind of value.
    #[must_use]
    pub fn is_transferable(self) -> bool {
        matches!(self, Self::Buffer | Self::BufferHolder)
    }
}

/// Capability every stream element implements.
///
/// Plain values keep the defaults: they are not reference-managed and
/// [`safe_release`] simply drops them.
pub trait StreamObject: Send + 'static {
    /// `Some` if the value's underlying resource is manually managed.
    fn managed_kind(&self) -> Option<ManagedKind> {
        None
    }

    /// Records a diagnostic access hint on a managed value.
    fn touch(&self, _hint: &'static str) {}
}

macro_rules! plain_stream_object {
    ($($ty:ty),* $(,)?) => {
        $(impl StreamObject for $ty {})*
    };
}

plain_stream_object!(
    (),
    bool,
    i32,
    i64,
    u8,
    u32,
    u64,
    usize,
    String,
    &'static str,
    Vec<u8>,
    Bytes,
    serde_json::Value,
);

/// Releases `obj`. A no-op beyond dropping for values that are not managed.
pub fn safe_release<T: StreamObject>(obj: T) {
    if let Some(kind) = obj.managed_kind() {
        trace!(?kind, "releasing managed stream object");
    }
    drop(obj);
}

// ---------------------------------------------------------------------------
// BufferAllocator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AllocatorStats {
    next_id: AtomicU64,
    allocated: AtomicU64,
    released: AtomicU64,
}

/// Connection-scoped allocator handing out [`PooledBuffer`]s.
///
/// Cloning is cheap; clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct BufferAllocator {
    stats: Arc<AllocatorStats>,
}

impl BufferAllocator {
    /// Creates an allocator with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an empty buffer with at least `capacity` bytes reserved.
    #[must_use]
    pub fn buffer(&self, capacity: usize) -> PooledBuffer {
        self.lease(BytesMut::with_capacity(capacity))
    }

    /// Allocates a buffer holding a copy of `data`.
    #[must_use]
    pub fn copy_of(&self, data: &[u8]) -> PooledBuffer {
        self.lease(BytesMut::from(data))
    }

    /// Number of buffers handed out so far.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.stats.allocated.load(Ordering::Acquire)
    }

    /// Number of buffers released so far.
    #[must_use]
    pub fn released(&self) -> u64 {
        self.stats.released.load(Ordering::Acquire)
    }

    /// Buffers currently alive.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.allocated() - self.released()
    }

    fn lease(&self, buf: BytesMut) -> PooledBuffer {
        let id = self.stats.next_id.fetch_add(1, Ordering::Relaxed);
        self.stats.allocated.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            buf,
            lease: Lease {
                id,
                stats: Arc::clone(&self.stats),
            },
        }
    }
}

#[derive(Debug)]
struct Lease {
    id: u64,
    stats: Arc<AllocatorStats>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.stats.released.fetch_add(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// PooledBuffer / HttpData
// ---------------------------------------------------------------------------

/// A byte buffer leased from a [`BufferAllocator`]. Dropping it releases it.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    lease: Lease,
}

impl PooledBuffer {
    /// Allocator-assigned identifier, used in trace output.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.lease.id
    }

    /// Appends `data` to the buffer.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Copies the readable bytes out into an unmanaged [`Bytes`].
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl StreamObject for PooledBuffer {
    fn managed_kind(&self) -> Option<ManagedKind> {
        Some(ManagedKind::Buffer)
    }

    fn touch(&self, hint: &'static str) {
        trace!(buffer = self.lease.id, hint, "touch");
    }
}

/// A chunk of HTTP content backed by a pooled buffer.
#[derive(Debug)]
pub struct HttpData {
    content: PooledBuffer,
    end_of_stream: bool,
}

impl HttpData {
    #[must_use]
    pub fn new(content: PooledBuffer, end_of_stream: bool) -> Self {
        Self {
            content,
            end_of_stream,
        }
    }

    #[must_use]
    pub fn content(&self) -> &PooledBuffer {
        &self.content
    }

    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    #[must_use]
    pub fn into_content(self) -> PooledBuffer {
        self.content
    }
}

impl StreamObject for HttpData {
    fn managed_kind(&self) -> Option<ManagedKind> {
        Some(ManagedKind::BufferHolder)
    }

    fn touch(&self, hint: &'static str) {
        self.content.touch(hint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_tracks_release_on_drop() {
        let alloc = BufferAllocator::new();
        let a = alloc.copy_of(b"hello");
        let b = alloc.buffer(16);
        assert_eq!(alloc.allocated(), 2);
        assert_eq!(alloc.outstanding(), 2);

        safe_release(a);
        assert_eq!(alloc.released(), 1);
        drop(b);
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn http_data_releases_its_content_once() {
        let alloc = BufferAllocator::new();
        let data = HttpData::new(alloc.copy_of(b"chunk"), true);
        assert_eq!(data.managed_kind(), Some(ManagedKind::BufferHolder));
        assert_eq!(&**data.content(), b"chunk");

        safe_release(data);
        assert_eq!(alloc.released(), 1);
    }

    #[test]
    fn plain_values_are_unmanaged() {
        assert_eq!("text".to_string().managed_kind(), None);
        assert_eq!(Bytes::from_static(b"x").managed_kind(), None);
        safe_release(42_u64);
    }

    #[test]
    fn transferable_kinds() {
        assert!(ManagedKind::Buffer.is_transferable());
        assert!(ManagedKind::BufferHolder.is_transferable());
        assert!(!ManagedKind::Opaque.is_transferable());
    }

    #[test]
    fn pooled_buffer_extends_and_copies() {
        let alloc = BufferAllocator::new();
        let mut buf = alloc.buffer(4);
        buf.extend_from_slice(b"ab");
        buf.extend_from_slice(b"cd");
        assert_eq!(buf.to_bytes(), Bytes::from_static(b"abcd"));
        assert_eq!(buf.len(), 4);
    }
}

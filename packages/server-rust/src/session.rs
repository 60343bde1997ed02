//! Connection identity shared by every request context of one session.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ctrlshift_core::{BufferAllocator, EventLoop, Executor, SessionProtocol};

/// Unique identifier for a session, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One accepted connection and the collaborators that serve it.
pub struct Session {
    id: SessionId,
    protocol: SessionProtocol,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    event_loop: Arc<dyn EventLoop>,
    alloc: BufferAllocator,
    blocking_executor: Arc<dyn Executor>,
}

impl Session {
    #[must_use]
    pub fn new(
        protocol: SessionProtocol,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        event_loop: Arc<dyn EventLoop>,
        blocking_executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            protocol,
            local_addr,
            remote_addr,
            event_loop,
            alloc: BufferAllocator::new(),
            blocking_executor,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn protocol(&self) -> SessionProtocol {
        self.protocol
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[must_use]
    pub fn event_loop(&self) -> &Arc<dyn EventLoop> {
        &self.event_loop
    }

    /// The connection-scoped buffer allocator.
    #[must_use]
    pub fn alloc(&self) -> &BufferAllocator {
        &self.alloc
    }

    /// The executor for application work that may block.
    #[must_use]
    pub fn blocking_executor(&self) -> &Arc<dyn Executor> {
        &self.blocking_executor
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

//! Concrete scheduling units.
//!
//! [`ThreadEventLoop`] owns one OS thread that drains a FIFO task queue; every
//! context-affine mutation and stream delivery of a session runs there.
//! [`BlockingTaskExecutor`] runs application work on tokio's blocking pool.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};

use ctrlshift_core::{EventLoop, Executor, Task};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

// ---------------------------------------------------------------------------
// ThreadEventLoop
// ---------------------------------------------------------------------------

/// A single-threaded FIFO executor backed by a dedicated OS thread.
pub struct ThreadEventLoop {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadEventLoop {
    /// Starts the loop thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn the thread.
    pub fn spawn(name: impl Into<String>) -> anyhow::Result<Self> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();

        let loop_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Some(task) = rx.blocking_recv() {
                // A failing task must not take the whole loop down.
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(event_loop = %loop_name, "event loop task panicked");
                }
            }
            debug!(event_loop = %loop_name, "event loop stopped");
        })?;

        Ok(Self {
            name,
            tx: Mutex::new(Some(tx)),
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops accepting tasks, runs the ones already queued, and joins the thread.
    ///
    /// Called from the loop thread itself, only the queue is closed.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if self.in_event_loop() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!(event_loop = %self.name, "event loop thread terminated abnormally");
            }
        }
    }
}

impl Executor for ThreadEventLoop {
    fn execute(&self, task: Task) {
        let rejected = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(task).is_err(),
            None => true,
        };
        if rejected {
            warn!(event_loop = %self.name, "event loop is shut down; dropping task");
        }
    }
}

impl EventLoop for ThreadEventLoop {
    fn in_event_loop(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for ThreadEventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadEventLoop")
            .field("name", &self.name)
            .field("running", &self.tx.lock().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BlockingTaskExecutor
// ---------------------------------------------------------------------------

/// Runs tasks on a tokio runtime's blocking thread pool.
#[derive(Debug, Clone)]
pub struct BlockingTaskExecutor {
    handle: Handle,
}

impl BlockingTaskExecutor {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn current() -> anyhow::Result<Self> {
        Ok(Self::new(Handle::try_current()?))
    }
}

impl Executor for BlockingTaskExecutor {
    fn execute(&self, task: Task) {
        drop(self.handle.spawn_blocking(task));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn runs_tasks_in_fifo_order_on_its_thread() {
        let event_loop = Arc::new(ThreadEventLoop::spawn("test-loop-fifo").unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = seen.clone();
            let el = event_loop.clone();
            event_loop.execute(Box::new(move || {
                assert!(el.in_event_loop());
                seen.lock().push(i);
            }));
        }
        assert!(!event_loop.in_event_loop());
        event_loop.shutdown();
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_task_does_not_stop_the_loop() {
        let event_loop = ThreadEventLoop::spawn("test-loop-panic").unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        event_loop.execute(Box::new(|| panic!("task failed")));
        event_loop.execute(Box::new(move || r.store(true, Ordering::SeqCst)));
        event_loop.shutdown();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn tasks_after_shutdown_are_dropped() {
        let event_loop = ThreadEventLoop::spawn("test-loop-closed").unwrap();
        event_loop.shutdown();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        event_loop.execute(Box::new(move || r.store(true, Ordering::SeqCst)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(!ran.load(Ordering::SeqCst));
    }

    /// Requests one element at a time and records what it sees.
    struct OneByOne {
        event_loop: Arc<ThreadEventLoop>,
        subscription: Option<ctrlshift_core::Subscription>,
        tx: std::sync::mpsc::Sender<Option<(usize, bool)>>,
    }

    impl ctrlshift_core::Subscriber<ctrlshift_core::PooledBuffer> for OneByOne {
        fn on_subscribe(&mut self, subscription: ctrlshift_core::Subscription) {
            subscription.request(1);
            self.subscription = Some(subscription);
        }

        fn on_next(&mut self, item: ctrlshift_core::PooledBuffer) -> ctrlshift_core::Result<()> {
            let _ = self.tx.send(Some((item.len(), self.event_loop.in_event_loop())));
            if let Some(subscription) = &self.subscription {
                subscription.request(1);
            }
            Ok(())
        }

        fn on_error(&mut self, _cause: ctrlshift_core::Error) {}

        fn on_complete(&mut self) {
            let _ = self.tx.send(None);
        }
    }

    #[test]
    fn stream_delivers_on_the_loop_thread_and_releases_buffers() {
        use ctrlshift_core::{BufferAllocator, DefaultStreamMessage, StreamMessage, StreamWriter};

        let event_loop = Arc::new(ThreadEventLoop::spawn("test-loop-stream").unwrap());
        let alloc = BufferAllocator::new();
        let stream = DefaultStreamMessage::new();
        let (tx, rx) = std::sync::mpsc::channel();
        stream.subscribe(
            OneByOne {
                event_loop: Arc::clone(&event_loop),
                subscription: None,
                tx,
            },
            Arc::clone(&event_loop) as Arc<dyn EventLoop>,
        );

        for len in 1..=3 {
            stream.write(alloc.copy_of(&vec![0; len])).unwrap();
        }
        stream.close();

        let mut seen = Vec::new();
        while let Some((len, on_loop)) = rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            assert!(on_loop);
            seen.push(len);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(stream.completion_future().join().is_ok());
        assert_eq!(alloc.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_executor_runs_off_the_async_workers() {
        let executor = BlockingTaskExecutor::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.execute(Box::new(move || {
            let _ = tx.send(std::thread::current().name().map(str::to_owned));
        }));
        let name = rx.await.unwrap();
        assert!(name.is_some());
    }
}

//! The asynchronous substrate: epoll reactor, executors and task handles.
//!
//! The pieces are deliberately small: a [`EventLoop`] that parks tasks on fd
//! readiness, an [`Executor`] that runs them, and a [`Handle`] combining the
//! two so request code can spawn subtasks and await I/O without caring which
//! executor variant is underneath.

pub mod event_loop;
pub mod executor;
pub mod task;

use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

pub use event_loop::{Direction, EventLoop, Readiness};
pub use executor::{Executor, SequentialExecutor, ThreadPoolExecutor};
pub use task::JoinHandle;

use executor::TaskCell;

use crate::error::Result;

/// Cheap handle onto the running runtime, cloned into every spawned task.
#[derive(Clone)]
pub struct Handle {
    executor: Arc<dyn Executor>,
    event_loop: Arc<EventLoop>,
}

impl Handle {
    /// Schedules a task on the executor and returns a handle that can be
    /// awaited for its output.
    pub fn spawn<T, F>(&self, future: F) -> JoinHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (sender, join) = task::join_pair();
        let cell = TaskCell::new(
            async move {
                sender.complete(future.await);
            },
            &self.executor,
        );
        self.executor.schedule(cell);
        join
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn wait_read(&self, fd: RawFd, timeout: Option<Duration>) -> Readiness {
        self.event_loop.wait_read(fd, timeout)
    }

    pub fn wait_write(&self, fd: RawFd, timeout: Option<Duration>) -> Readiness {
        self.event_loop.wait_write(fd, timeout)
    }

    pub async fn wait_pid(&self, pid: i32, timeout: Option<Duration>) -> Result<i32> {
        self.event_loop.wait_pid(pid, timeout).await
    }
}

enum Flavor {
    /// Tasks run interleaved with reactor polls on the calling thread.
    Sequential(Arc<SequentialExecutor>),
    /// Tasks run on pool workers; the calling thread only drives the reactor.
    ThreadPool(#[allow(dead_code)] Arc<ThreadPoolExecutor>),
}

/// A bound pair of executor and event loop.
pub struct Runtime {
    handle: Handle,
    flavor: Flavor,
}

impl Runtime {
    pub fn sequential() -> Result<Runtime> {
        let executor = Arc::new(SequentialExecutor::new());
        let event_loop = Arc::new(EventLoop::new()?);
        Ok(Runtime {
            handle: Handle {
                executor: executor.clone(),
                event_loop,
            },
            flavor: Flavor::Sequential(executor),
        })
    }

    pub fn thread_pool(workers: usize) -> Result<Runtime> {
        let executor = Arc::new(ThreadPoolExecutor::new(workers)?);
        let event_loop = Arc::new(EventLoop::new()?);
        Ok(Runtime {
            handle: Handle {
                executor: executor.clone(),
                event_loop,
            },
            flavor: Flavor::ThreadPool(executor),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs `future` to completion, alternating executor drains with reactor
    /// polls (sequential) or parking in the reactor while workers run tasks
    /// (thread pool).
    pub fn block_on<T, F>(&self, future: F) -> T
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        // JoinHandle is Unpin; no boxing needed to poll it in place.
        let mut join = self.handle.spawn(future);
        let waker = Waker::from(Arc::new(Unpark {
            event_loop: self.handle.event_loop.clone(),
        }));
        let mut cx = Context::from_waker(&waker);

        loop {
            if let Poll::Ready(value) = Pin::new(&mut join).poll(&mut cx) {
                return value;
            }
            if let Flavor::Sequential(executor) = &self.flavor {
                executor.drain();
                if let Poll::Ready(value) = Pin::new(&mut join).poll(&mut cx) {
                    return value;
                }
            }
            if let Err(err) = self.handle.event_loop.poll() {
                // A reactor failure is unrecoverable for everything parked on it.
                panic!("event loop poll failed: {err}");
            }
        }
    }
}

/// Waker that interrupts a reactor blocked in `epoll_wait`.
struct Unpark {
    event_loop: Arc<EventLoop>,
}

impl Wake for Unpark {
    fn wake(self: Arc<Self>) {
        self.event_loop.unpark();
    }
}

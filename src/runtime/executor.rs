//! Task executors.
//!
//! Two variants share one interface: the sequential executor drains its run
//! queue on the calling thread, the thread-pool executor feeds a fixed set of
//! workers from a synchronized FIFO. Both run [`TaskCell`]s, which pair a
//! boxed future with the executor that reschedules it on wake.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::task::{Context, Wake, Waker};

/// A scheduled unit of work: a future plus the executor that owns it.
///
/// Waking a task pushes it back onto its executor's queue; the cell only
/// holds a weak reference so a dropped executor simply stops accepting work.
pub struct TaskCell {
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
    executor: Weak<dyn Executor>,
}

impl TaskCell {
    pub(crate) fn new(
        future: impl Future<Output = ()> + Send + 'static,
        executor: &Arc<dyn Executor>,
    ) -> Arc<Self> {
        Arc::new(TaskCell {
            future: Mutex::new(Some(Box::pin(future))),
            executor: Arc::downgrade(executor),
        })
    }

    /// Polls the task once; a finished future is dropped in place.
    fn run(self: Arc<Self>) {
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let mut slot = self.future.lock().unwrap();
        if let Some(future) = slot.as_mut() {
            if future.as_mut().poll(&mut cx).is_ready() {
                *slot = None;
            }
        }
    }
}

impl Wake for TaskCell {
    fn wake(self: Arc<Self>) {
        if let Some(executor) = self.executor.upgrade() {
            executor.schedule(self);
        }
    }
}

/// Something that can run scheduled tasks.
pub trait Executor: Send + Sync + 'static {
    fn schedule(&self, task: Arc<TaskCell>);

    /// True when no task is queued or currently executing.
    fn done(&self) -> bool;
}

/// Runs every task on the thread that calls [`SequentialExecutor::drain`].
#[derive(Default)]
pub struct SequentialExecutor {
    queue: Mutex<VecDeque<Arc<TaskCell>>>,
}

impl SequentialExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs queued tasks until the queue is empty, including tasks they
    /// schedule while running.
    pub fn drain(&self) {
        loop {
            let task = self.queue.lock().unwrap().pop_front();
            match task {
                Some(task) => task.run(),
                None => break,
            }
        }
    }
}

impl Executor for SequentialExecutor {
    fn schedule(&self, task: Arc<TaskCell>) {
        self.queue.lock().unwrap().push_back(task);
    }

    fn done(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

struct PoolState {
    queue: VecDeque<Arc<TaskCell>>,
    running: usize,
    stopped: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    condvar: Condvar,
}

/// Fixed-size worker pool consuming a shared FIFO.
pub struct ThreadPoolExecutor {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    pub fn new(size: usize) -> std::io::Result<Self> {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                running: 0,
                stopped: false,
            }),
            condvar: Condvar::new(),
        });

        let workers = (0..size.max(1))
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("palisade-worker-{i}"))
                    .spawn(move || worker_loop(shared))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(ThreadPoolExecutor {
            shared,
            workers: Mutex::new(workers),
        })
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    state.running += 1;
                    break task;
                }
                if state.stopped {
                    return;
                }
                state = shared.condvar.wait(state).unwrap();
            }
        };

        task.run();

        shared.state.lock().unwrap().running -= 1;
    }
}

impl Executor for ThreadPoolExecutor {
    fn schedule(&self, task: Arc<TaskCell>) {
        let mut state = self.shared.state.lock().unwrap();
        if state.stopped {
            return;
        }
        state.queue.push_back(task);
        drop(state);
        self.shared.condvar.notify_one();
    }

    fn done(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.queue.is_empty() && state.running == 0
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stopped = true;
            // Residual queued tasks are dropped, not run.
            state.queue.clear();
        }
        self.shared.condvar.notify_all();
        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }
    }
}

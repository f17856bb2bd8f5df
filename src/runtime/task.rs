//! Spawned task handles.
//!
//! A [`JoinHandle`] is the awaitable half of a one-shot handoff between the
//! task that produces a value and the task that consumes it. The two sides
//! race: whichever arrives second performs the wake. The state tag moves
//! through `EMPTY -> WAITING -> COMPLETE` (or straight to `COMPLETE`) with
//! compare-and-swap transitions, so exactly one wake occurs and a task never
//! completes twice.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

const EMPTY: u8 = 0;
const WAITING: u8 = 1;
const COMPLETE: u8 = 2;

struct JoinState<T> {
    state: AtomicU8,
    cell: Mutex<JoinCell<T>>,
}

struct JoinCell<T> {
    value: Option<T>,
    waker: Option<Waker>,
}

/// Producer side of the handoff; completed exactly once by the spawned task.
pub(crate) struct JoinSender<T> {
    state: Arc<JoinState<T>>,
}

/// Awaitable handle to a spawned task, yielding the task's output.
///
/// Dropping the handle without awaiting is fine: the shared slot is
/// reference-counted and the value is simply discarded.
pub struct JoinHandle<T> {
    state: Arc<JoinState<T>>,
}

pub(crate) fn join_pair<T>() -> (JoinSender<T>, JoinHandle<T>) {
    let state = Arc::new(JoinState {
        state: AtomicU8::new(EMPTY),
        cell: Mutex::new(JoinCell {
            value: None,
            waker: None,
        }),
    });
    (
        JoinSender {
            state: state.clone(),
        },
        JoinHandle { state },
    )
}

impl<T> JoinSender<T> {
    pub(crate) fn complete(self, value: T) {
        {
            let mut cell = self.state.cell.lock().unwrap();
            cell.value = Some(value);
        }
        // Publish after the value is in place; if the consumer was already
        // parked, the second arrival (us) performs the wake.
        let prev = self.state.state.swap(COMPLETE, Ordering::AcqRel);
        debug_assert_ne!(prev, COMPLETE, "task completed twice");
        if prev == WAITING {
            let waker = self.state.cell.lock().unwrap().waker.take();
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        if self.state.state.load(Ordering::Acquire) == COMPLETE {
            return Poll::Ready(self.take_value());
        }

        {
            let mut cell = self.state.cell.lock().unwrap();
            cell.waker = Some(cx.waker().clone());
        }

        match self.state.state.compare_exchange(
            EMPTY,
            WAITING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Poll::Pending,
            // Completed between the fast path and the CAS.
            Err(COMPLETE) => Poll::Ready(self.take_value()),
            // Re-polled while waiting; the fresh waker is already stored.
            Err(_) => Poll::Pending,
        }
    }
}

impl<T> JoinHandle<T> {
    fn take_value(&self) -> T {
        self.state
            .cell
            .lock()
            .unwrap()
            .value
            .take()
            .unwrap_or_else(|| panic!("join handle polled after completion"))
    }
}

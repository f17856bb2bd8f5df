//! The epoll reactor.
//!
//! Suspended tasks register an interest in `(fd, direction)` with an optional
//! deadline; [`EventLoop::poll`] blocks in `epoll_wait` up to the nearest
//! deadline and wakes the matching waiters. At most one waiter may exist per
//! `(fd, direction)` at any instant, and every registered waiter is woken
//! exactly once: on readiness, on timeout, or on loop teardown.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// The two pollable directions of a file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn flip(self) -> Direction {
        match self {
            Direction::Read => Direction::Write,
            Direction::Write => Direction::Read,
        }
    }

    fn epoll_bits(self) -> u32 {
        match self {
            Direction::Read => libc::EPOLLIN as u32,
            Direction::Write => libc::EPOLLOUT as u32,
        }
    }
}

/// Shared between the reactor and the [`Readiness`] future. The side that
/// arrives with the outcome wakes the stored waker; the slot is written at
/// most once.
struct WaiterState {
    inner: Mutex<WaiterInner>,
}

struct WaiterInner {
    outcome: Option<Result<()>>,
    waker: Option<Waker>,
}

impl WaiterState {
    fn new(waker: Waker) -> Arc<Self> {
        Arc::new(WaiterState {
            inner: Mutex::new(WaiterInner {
                outcome: None,
                waker: Some(waker),
            }),
        })
    }

    fn complete(&self, outcome: Result<()>) {
        let waker = {
            let mut inner = self.inner.lock().unwrap();
            if inner.outcome.is_some() {
                return;
            }
            inner.outcome = Some(outcome);
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

struct Waiter {
    state: Arc<WaiterState>,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct WaiterMaps {
    read: HashMap<RawFd, Waiter>,
    write: HashMap<RawFd, Waiter>,
}

impl WaiterMaps {
    /// The map for `direction` together with its opposite.
    fn split(&mut self, direction: Direction) -> (&mut HashMap<RawFd, Waiter>, &mut HashMap<RawFd, Waiter>) {
        match direction {
            Direction::Read => (&mut self.read, &mut self.write),
            Direction::Write => (&mut self.write, &mut self.read),
        }
    }

    fn nearest_deadline(&self) -> Option<Instant> {
        self.read
            .values()
            .chain(self.write.values())
            .filter_map(|w| w.deadline)
            .min()
    }
}

/// Single-threaded epoll-based reactor.
///
/// The waiter maps are guarded by a mutex held only across map mutation and
/// the matching `epoll_ctl` call; `epoll_wait` itself runs unlocked.
pub struct EventLoop {
    epoll_fd: RawFd,
    waiters: Mutex<WaiterMaps>,
    // Self-wake pipe: lets other threads interrupt a blocking `epoll_wait`.
    wake_read: RawFd,
    wake_write: RawFd,
}

impl EventLoop {
    pub fn new() -> Result<EventLoop> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(io::Error::last_os_error().into());
        }

        let mut pipe_fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err.into());
        }
        let [wake_read, wake_write] = pipe_fds;

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_read as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_read, &mut event) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epoll_fd);
                libc::close(wake_read);
                libc::close(wake_write);
            }
            return Err(err.into());
        }

        Ok(EventLoop {
            epoll_fd,
            waiters: Mutex::new(WaiterMaps::default()),
            wake_read,
            wake_write,
        })
    }

    /// Waits until `fd` is readable, failing with [`Error::Timeout`] if the
    /// deadline passes first.
    pub fn wait_read(self: &Arc<Self>, fd: RawFd, timeout: Option<Duration>) -> Readiness {
        self.wait_ready(fd, Direction::Read, timeout)
    }

    /// Waits until `fd` is writable, failing with [`Error::Timeout`] if the
    /// deadline passes first.
    pub fn wait_write(self: &Arc<Self>, fd: RawFd, timeout: Option<Duration>) -> Readiness {
        self.wait_ready(fd, Direction::Write, timeout)
    }

    pub fn wait_ready(self: &Arc<Self>, fd: RawFd, direction: Direction, timeout: Option<Duration>) -> Readiness {
        Readiness {
            event_loop: self.clone(),
            fd,
            direction,
            timeout,
            state: None,
        }
    }

    /// Waits for a child process to exit and returns its exit status.
    ///
    /// Exit notification rides a `pidfd`, which becomes readable when the
    /// child terminates, so the loop thread never blocks in `waitpid`.
    pub async fn wait_pid(self: &Arc<Self>, pid: i32, timeout: Option<Duration>) -> Result<i32> {
        let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        if pidfd == -1 {
            return Err(io::Error::last_os_error().into());
        }
        let pidfd = PidFd(pidfd as RawFd);

        self.wait_read(pidfd.0, timeout).await?;

        let mut status: libc::c_int = 0;
        loop {
            let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
            if rc >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
        Ok(libc::WEXITSTATUS(status))
    }

    /// Interrupts a concurrent [`EventLoop::poll`] call.
    pub fn unpark(&self) {
        let byte = 1u8;
        unsafe { libc::write(self.wake_write, &byte as *const u8 as *const libc::c_void, 1) };
    }

    /// True when no waiter of either direction is registered.
    pub fn is_idle(&self) -> bool {
        let maps = self.waiters.lock().unwrap();
        maps.read.is_empty() && maps.write.is_empty()
    }

    fn register(
        &self,
        fd: RawFd,
        direction: Direction,
        timeout: Option<Duration>,
        state: Arc<WaiterState>,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut maps = self.waiters.lock().unwrap();
        let (own, other) = maps.split(direction);

        if own.contains_key(&fd) {
            return Err(Error::InvalidArgument(
                "a waiter is already registered for this fd and direction",
            ));
        }
        let is_mod = other.contains_key(&fd);
        own.insert(fd, Waiter { state, deadline });

        let mut bits = direction.epoll_bits();
        if is_mod {
            bits |= direction.flip().epoll_bits();
        }
        let mut event = libc::epoll_event {
            events: bits,
            u64: fd as u64,
        };
        let op = if is_mod {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if rc == -1 {
            maps.split(direction).0.remove(&fd);
            return Err(io::Error::last_os_error().into());
        }
        drop(maps);

        // A registration from a worker thread must not sit out a poll that is
        // already blocking without it.
        self.unpark();
        Ok(())
    }

    /// Removes the waiter for `(fd, direction)`, downgrading or deleting the
    /// epoll registration to match the remaining interest.
    fn take_waiter(&self, fd: RawFd, direction: Direction) -> Option<Waiter> {
        let mut maps = self.waiters.lock().unwrap();
        let (own, other) = maps.split(direction);
        let waiter = own.remove(&fd)?;
        let rc = if other.contains_key(&fd) {
            let mut event = libc::epoll_event {
                events: direction.flip().epoll_bits(),
                u64: fd as u64,
            };
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event) }
        } else {
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) }
        };
        if rc == -1 {
            // The fd may already be closed; the kernel dropped it for us.
            tracing::trace!(fd, "epoll deregistration failed: {}", io::Error::last_os_error());
        }
        Some(waiter)
    }

    /// Cancels a registration if `state` still owns the slot. Used when a
    /// `Readiness` future is dropped before resolving.
    fn cancel(&self, fd: RawFd, direction: Direction, state: &Arc<WaiterState>) {
        let still_ours = {
            let mut maps = self.waiters.lock().unwrap();
            let (own, _) = maps.split(direction);
            matches!(own.get(&fd), Some(w) if Arc::ptr_eq(&w.state, state))
        };
        if still_ours {
            self.take_waiter(fd, direction);
        }
    }

    fn expire(&self, now: Instant) {
        // Removal happens in one critical section so a slot cannot change
        // hands between the sweep and the unregistration; the completions
        // run after the lock is released.
        let mut expired: Vec<Arc<WaiterState>> = Vec::new();
        {
            let mut maps = self.waiters.lock().unwrap();
            for direction in [Direction::Read, Direction::Write] {
                let overdue: Vec<RawFd> = {
                    let (own, _) = maps.split(direction);
                    own.iter()
                        .filter(|(_, w)| w.deadline.is_some_and(|d| d <= now))
                        .map(|(fd, _)| *fd)
                        .collect()
                };
                for fd in overdue {
                    let (own, other) = maps.split(direction);
                    let Some(waiter) = own.remove(&fd) else { continue };
                    let rc = if other.contains_key(&fd) {
                        let mut event = libc::epoll_event {
                            events: direction.flip().epoll_bits(),
                            u64: fd as u64,
                        };
                        unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event) }
                    } else {
                        unsafe {
                            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
                        }
                    };
                    if rc == -1 {
                        tracing::trace!(fd, "epoll deregistration failed: {}", io::Error::last_os_error());
                    }
                    expired.push(waiter.state);
                }
            }
        }
        for state in expired {
            state.complete(Err(Error::Timeout));
        }
    }

    fn complete_ready(&self, fd: RawFd, direction: Direction) {
        if let Some(waiter) = self.take_waiter(fd, direction) {
            waiter.state.complete(Ok(()));
        }
    }

    /// One reactor step: expire overdue waiters, then block in `epoll_wait`
    /// up to the nearest deadline and wake whatever became ready.
    pub fn poll(&self) -> Result<()> {
        let now = Instant::now();
        self.expire(now);
        let deadline = self.waiters.lock().unwrap().nearest_deadline();

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 16];
        let ready = loop {
            let timeout_ms: libc::c_int = match deadline {
                None => -1,
                Some(point) => {
                    let left = point.saturating_duration_since(Instant::now());
                    // Round up so a 50ms deadline does not spin at 49.9ms.
                    left.as_millis().saturating_add(1).min(i32::MAX as u128) as libc::c_int
                }
            };

            let rc = unsafe {
                libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), events.len() as libc::c_int, timeout_ms)
            };
            if rc == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    // Deadlines stay accurate: recompute the wait and retry,
                    // or fall through to the expiry sweep if it already passed.
                    if deadline.is_some_and(|point| Instant::now() >= point) {
                        break 0;
                    }
                    continue;
                }
                return Err(err.into());
            }
            break rc as usize;
        };

        for event in &events[..ready] {
            let fd = event.u64 as RawFd;
            if fd == self.wake_read {
                self.drain_wake_pipe();
                continue;
            }
            // Errors and hangups resolve both directions so neither side
            // stays parked on a dead fd.
            let both = event.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            if both || event.events & libc::EPOLLIN as u32 != 0 {
                self.complete_ready(fd, Direction::Read);
            }
            if both || event.events & libc::EPOLLOUT as u32 != 0 {
                self.complete_ready(fd, Direction::Write);
            }
        }

        self.expire(Instant::now());
        Ok(())
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe { libc::read(self.wake_read, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Teardown still counts as the one wake each waiter is owed.
        let maps = std::mem::take(&mut *self.waiters.lock().unwrap());
        for waiter in maps.read.into_values().chain(maps.write.into_values()) {
            waiter
                .state
                .complete(Err(Error::unknown("event loop shut down")));
        }
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

struct PidFd(RawFd);

impl Drop for PidFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// Future returned by [`EventLoop::wait_read`] / [`EventLoop::wait_write`].
pub struct Readiness {
    event_loop: Arc<EventLoop>,
    fd: RawFd,
    direction: Direction,
    timeout: Option<Duration>,
    state: Option<Arc<WaiterState>>,
}

impl Future for Readiness {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = &mut *self;
        match &this.state {
            None => {
                let state = WaiterState::new(cx.waker().clone());
                match this
                    .event_loop
                    .register(this.fd, this.direction, this.timeout, state.clone())
                {
                    Ok(()) => {
                        this.state = Some(state);
                        Poll::Pending
                    }
                    Err(err) => Poll::Ready(Err(err)),
                }
            }
            Some(state) => {
                let mut inner = state.inner.lock().unwrap();
                match inner.outcome.take() {
                    Some(outcome) => Poll::Ready(outcome),
                    None => {
                        inner.waker = Some(cx.waker().clone());
                        Poll::Pending
                    }
                }
            }
        }
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        if let Some(state) = &self.state {
            let resolved = state.inner.lock().unwrap().outcome.is_some();
            if !resolved {
                self.event_loop.cancel(self.fd, self.direction, state);
            }
        }
    }
}

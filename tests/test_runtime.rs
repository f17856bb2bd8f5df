//! Tests for the event loop, executors and task handles.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use palisade::error::Error;
use palisade::runtime::Runtime;

/// A pipe that stays silent until written to; used as a never-ready fd.
struct Pipe {
    read: RawFd,
    write: RawFd,
}

impl Pipe {
    fn new() -> Pipe {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0, "pipe2 failed");
        Pipe {
            read: fds[0],
            write: fds[1],
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

#[test]
fn test_sequential_block_on_returns_value() {
    let runtime = Runtime::sequential().unwrap();
    let value = runtime.block_on(async { 21 * 2 });
    assert_eq!(value, 42);
}

#[test]
fn test_thread_pool_block_on_returns_value() {
    let runtime = Runtime::thread_pool(4).unwrap();
    let value = runtime.block_on(async { "hello".to_string() });
    assert_eq!(value, "hello");
}

#[test]
fn test_spawned_task_joins_with_output() {
    let runtime = Runtime::sequential().unwrap();
    let handle = runtime.handle().clone();
    let value = runtime.block_on(async move {
        let join = handle.spawn(async { 7 });
        join.await + 1
    });
    assert_eq!(value, 8);
}

#[test]
fn test_join_handle_can_be_dropped_without_awaiting() {
    let runtime = Runtime::sequential().unwrap();
    let handle = runtime.handle().clone();
    let value = runtime.block_on(async move {
        let join = handle.spawn(async { vec![0u8; 1024] });
        drop(join);
        // The dropped task still ran (or will run) to completion; the
        // runtime itself keeps working.
        handle.spawn(async { 5 }).await
    });
    assert_eq!(value, 5);
}

#[test]
fn test_read_waiter_times_out_on_silent_fd() {
    let runtime = Runtime::sequential().unwrap();
    let handle = runtime.handle().clone();
    let pipe = Pipe::new();
    let fd = pipe.read;

    let start = Instant::now();
    let result = runtime.block_on(async move {
        handle.wait_read(fd, Some(Duration::from_millis(50))).await
    });
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(Error::Timeout)), "expected timeout, got {result:?}");
    assert!(elapsed >= Duration::from_millis(50), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(200), "fired late: {elapsed:?}");
    // No leaked registration remains.
    assert!(runtime.handle().event_loop().is_idle());
}

#[test]
fn test_read_waiter_resolves_when_data_arrives() {
    let runtime = Runtime::sequential().unwrap();
    let handle = runtime.handle().clone();
    let pipe = Pipe::new();
    let (read_fd, write_fd) = (pipe.read, pipe.write);

    let result = runtime.block_on(async move {
        let waiter = handle.spawn({
            let handle = handle.clone();
            async move { handle.wait_read(read_fd, Some(Duration::from_secs(5))).await }
        });
        let byte = 1u8;
        let rc = unsafe { libc::write(write_fd, &byte as *const u8 as *const libc::c_void, 1) };
        assert_eq!(rc, 1);
        waiter.await
    });
    assert!(result.is_ok());
    assert!(runtime.handle().event_loop().is_idle());
}

#[test]
fn test_double_registration_is_invalid() {
    let runtime = Runtime::sequential().unwrap();
    let handle = runtime.handle().clone();
    let pipe = Pipe::new();
    let yield_pipe = Pipe::new();
    let fd = pipe.read;
    let yield_fd = yield_pipe.read;

    let result = runtime.block_on(async move {
        let first = handle.spawn({
            let handle = handle.clone();
            async move { handle.wait_read(fd, Some(Duration::from_millis(200))).await }
        });
        // Suspend once so the first waiter registers before we try again.
        let _ = handle
            .wait_read(yield_fd, Some(Duration::from_millis(10)))
            .await;

        let second = handle.wait_read(fd, Some(Duration::from_millis(200))).await;
        let first = first.await;
        (first, second)
    });

    assert!(matches!(result.0, Err(Error::Timeout)));
    assert!(matches!(result.1, Err(Error::InvalidArgument(_))));
}

#[test]
fn test_read_and_write_waiters_coexist_on_one_fd() {
    let runtime = Runtime::sequential().unwrap();
    let handle = runtime.handle().clone();
    // A socketpair is writable immediately but silent for reads.
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(rc, 0);
    let fd = fds[0];

    let (read_result, write_result) = runtime.block_on(async move {
        let reader = handle.spawn({
            let handle = handle.clone();
            async move { handle.wait_read(fd, Some(Duration::from_millis(50))).await }
        });
        let writer = handle.spawn({
            let handle = handle.clone();
            async move { handle.wait_write(fd, Some(Duration::from_secs(5))).await }
        });
        (reader.await, writer.await)
    });

    // Only the write direction fires; the read waiter times out on its own.
    assert!(write_result.is_ok());
    assert!(matches!(read_result, Err(Error::Timeout)));
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
}

#[test]
fn test_wait_pid_returns_exit_status() {
    let runtime = Runtime::sequential().unwrap();
    let handle = runtime.handle().clone();

    let status = runtime.block_on(async move {
        let child = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 3")
            .spawn()
            .expect("failed to spawn child");
        handle.wait_pid(child.id() as i32, None).await
    });
    assert_eq!(status.unwrap(), 3);
}

#[test]
fn test_many_tasks_on_thread_pool() {
    let runtime = Runtime::thread_pool(4).unwrap();
    let handle = runtime.handle().clone();
    let total: u32 = runtime.block_on(async move {
        let joins: Vec<_> = (0..100u32).map(|i| handle.spawn(async move { i })).collect();
        let mut sum = 0;
        for join in joins {
            sum += join.await;
        }
        sum
    });
    assert_eq!(total, (0..100).sum());
}

//! Shutdown signal plumbing.
//!
//! The interrupt handler only writes one byte into a pipe; the read end is
//! an ordinary fd the event loop can wait on, so shutdown wakes the runtime
//! like any other readiness event.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::Result;
use crate::runtime::Handle;

static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(_signal: libc::c_int) {
    let fd = SIGNAL_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 1u8;
        unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
pub async fn shutdown(handle: &Handle) -> Result<()> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc == -1 {
        return Err(io::Error::last_os_error().into());
    }
    SIGNAL_FD.store(fds[1], Ordering::Relaxed);

    let handler = on_signal as extern "C" fn(libc::c_int) as usize as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }

    handle.wait_read(fds[0], None).await
}

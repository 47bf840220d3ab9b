use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::poll::PollSocket;
#[cfg(target_os = "linux")]
use crate::uring::UringSocket;
use crate::Result;

/// Direction of one kernel-async operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
}

/// One in-flight operation. `length` carries the requested byte count on
/// submission and is overwritten with bytes-transferred (or negative errno)
/// once the completion is reaped. `task` identifies the owning message task
/// in the worker's arena; identifiers, not pointers, cross this boundary.
pub struct Request {
    pub fd: RawFd,
    pub event: Event,
    pub data: *mut u8,
    pub length: i64,
    pub task: u64,
}

// The buffer behind `data` is owned by the task that owns this request and
// both only move between threads together with their worker.
unsafe impl Send for Request {}

/// A reaped completion. `user_data` is the submitting task's identifier, or
/// `LINK_TIMEOUT_DATA` for the timeout half of a linked pair, which callers
/// skip.
#[derive(Clone, Copy, Debug)]
pub struct Completion {
    pub user_data: u64,
    pub result: i32,
}

/// user_data marker for linked-timeout completions.
pub const LINK_TIMEOUT_DATA: u64 = u64::MAX;

/// The kernel-async backend: io_uring where available, poll(2) otherwise,
/// with identical semantics.
pub enum IoDriver {
    #[cfg(target_os = "linux")]
    Uring(UringSocket),
    Poll(PollSocket),
}

impl IoDriver {
    /// Prefer io_uring; fall back to poll when the kernel lacks it.
    pub fn new(entries: u32) -> Result<Self> {
        #[cfg(target_os = "linux")]
        match UringSocket::new(entries) {
            Ok(uring) => return Ok(IoDriver::Uring(uring)),
            Err(err) => {
                tracing::warn!(%err, "io_uring unavailable, using poll fallback");
            }
        }
        Ok(IoDriver::Poll(PollSocket::new(entries)))
    }

    pub fn poll_only(entries: u32) -> Self {
        IoDriver::Poll(PollSocket::new(entries))
    }

    /// Queue a send of `request.length` bytes.
    pub fn prep_send(&mut self, request: &Request) {
        match self {
            #[cfg(target_os = "linux")]
            IoDriver::Uring(uring) => uring.prep_send(request, None),
            IoDriver::Poll(poll) => poll.prep(request, None, 0),
        }
    }

    /// Queue a send with a kernel timeout; expiry completes with -ECANCELED
    /// (uring) or -ETIMEDOUT (poll), both treated as timeouts by the tasks.
    pub fn prep_send_timeout(&mut self, request: &Request, timeout: Duration) {
        match self {
            #[cfg(target_os = "linux")]
            IoDriver::Uring(uring) => uring.prep_send(request, Some(timeout)),
            IoDriver::Poll(poll) => poll.prep(request, Some(timeout), 0),
        }
    }

    /// Queue a receive of up to `request.length` bytes.
    pub fn prep_recv(&mut self, request: &Request, no_wait: bool) {
        let flags = if no_wait { libc::MSG_DONTWAIT } else { 0 };
        match self {
            #[cfg(target_os = "linux")]
            IoDriver::Uring(uring) => uring.prep_recv(request, None, flags),
            IoDriver::Poll(poll) => poll.prep(request, None, flags),
        }
    }

    pub fn prep_recv_timeout(&mut self, request: &Request, timeout: Duration, no_wait: bool) {
        let flags = if no_wait { libc::MSG_DONTWAIT } else { 0 };
        match self {
            #[cfg(target_os = "linux")]
            IoDriver::Uring(uring) => uring.prep_recv(request, Some(timeout), flags),
            IoDriver::Poll(poll) => poll.prep(request, Some(timeout), flags),
        }
    }

    /// Flush queued operations to the kernel; returns entries submitted
    /// (linked timeouts count as entries of their own).
    pub fn submit(&mut self) -> Result<usize> {
        match self {
            #[cfg(target_os = "linux")]
            IoDriver::Uring(uring) => uring.submit(),
            IoDriver::Poll(poll) => Ok(poll.submit()),
        }
    }

    /// Block for one completion.
    pub fn complete(&mut self) -> Result<Completion> {
        match self {
            #[cfg(target_os = "linux")]
            IoDriver::Uring(uring) => uring.complete(),
            IoDriver::Poll(poll) => poll.complete(),
        }
    }

    /// One completion when immediately available.
    pub fn peek(&mut self) -> Result<Option<Completion>> {
        match self {
            #[cfg(target_os = "linux")]
            IoDriver::Uring(uring) => Ok(uring.peek()),
            IoDriver::Poll(poll) => poll.peek(),
        }
    }

    /// Drain up to `limit` available completions without re-submitting.
    pub fn reap_many(&mut self, limit: usize, out: &mut Vec<Completion>) -> Result<usize> {
        let before = out.len();
        while out.len() - before < limit {
            match self.peek()? {
                Some(completion) => out.push(completion),
                None => break,
            }
        }
        Ok(out.len() - before)
    }
}

use std::time::Duration;

use io_uring::{opcode, squeue, types, IoUring};

use crate::io::{Completion, Request, LINK_TIMEOUT_DATA};
use crate::{Error, Result};

/// io_uring submission/completion wrapper. One instance per worker thread;
/// every queued operation records its owning task in user_data.
pub struct UringSocket {
    ring: IoUring,
    /// Timespecs referenced by not-yet-submitted LinkTimeout entries. The
    /// kernel copies them during submit, after which they are dropped.
    timespecs: Vec<Box<types::Timespec>>,
}

// Queued entries reference task-owned buffers; the ring only moves between
// threads together with its worker.
unsafe impl Send for UringSocket {}

impl UringSocket {
    pub fn new(entries: u32) -> Result<Self> {
        let ring = IoUring::new(entries.next_power_of_two()).map_err(Error::Ring)?;
        if !ring.params().is_feature_fast_poll() {
            return Err(Error::Ring(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "kernel lacks IORING_FEAT_FAST_POLL",
            )));
        }
        Ok(UringSocket {
            ring,
            timespecs: Vec::new(),
        })
    }

    fn push(&mut self, entry: squeue::Entry) {
        loop {
            // Make room by flushing when the submission queue is full.
            if unsafe { self.ring.submission().push(&entry) }.is_ok() {
                return;
            }
            if let Err(err) = self.ring.submit() {
                tracing::error!(%err, "io_uring submit while draining full queue");
                return;
            }
        }
    }

    pub fn prep_send(&mut self, request: &Request, timeout: Option<Duration>) {
        let entry = opcode::Send::new(
            types::Fd(request.fd),
            request.data as *const u8,
            request.length as u32,
        )
        .build()
        .user_data(request.task);
        match timeout {
            Some(timeout) => self.push_linked(entry, timeout),
            None => self.push(entry),
        }
    }

    pub fn prep_recv(&mut self, request: &Request, timeout: Option<Duration>, flags: i32) {
        let entry = opcode::Recv::new(types::Fd(request.fd), request.data, request.length as u32)
            .flags(flags)
            .build()
            .user_data(request.task);
        match timeout {
            Some(timeout) => self.push_linked(entry, timeout),
            None => self.push(entry),
        }
    }

    /// Queue `entry` linked to a kernel timeout. On expiry the operation
    /// completes with -ECANCELED and the timeout entry with -ETIME; the
    /// timeout entry carries the sentinel user_data and is skipped by the
    /// reaper.
    fn push_linked(&mut self, entry: squeue::Entry, timeout: Duration) {
        let ts = Box::new(
            types::Timespec::new()
                .sec(timeout.as_secs())
                .nsec(timeout.subsec_nanos()),
        );
        let timeout_entry = opcode::LinkTimeout::new(&*ts)
            .build()
            .user_data(LINK_TIMEOUT_DATA);
        self.timespecs.push(ts);
        self.push(entry.flags(squeue::Flags::IO_LINK));
        self.push(timeout_entry);
    }

    pub fn submit(&mut self) -> Result<usize> {
        let submitted = self.ring.submit().map_err(Error::Ring)?;
        // Consumed by the kernel during submit; safe to drop now.
        self.timespecs.clear();
        Ok(submitted)
    }

    pub fn complete(&mut self) -> Result<Completion> {
        loop {
            if let Some(completion) = self.peek() {
                return Ok(completion);
            }
            self.ring.submit_and_wait(1).map_err(Error::Ring)?;
        }
    }

    pub fn peek(&mut self) -> Option<Completion> {
        self.ring.completion().next().map(|cqe| Completion {
            user_data: cqe.user_data(),
            result: cqe.result(),
        })
    }
}

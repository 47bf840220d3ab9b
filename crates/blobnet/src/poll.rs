use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::io::{Completion, Event, Request};
use crate::{Error, Result};

struct PendingOp {
    user_data: u64,
    fd: RawFd,
    event: Event,
    data: *mut u8,
    length: i64,
    flags: i32,
    deadline: Option<Instant>,
    submitted: bool,
}

/// poll(2) fallback with the io_uring wrapper's semantics: queued
/// operations complete with bytes-transferred or negative errno, and
/// deadline expiry completes with -ETIMEDOUT. The actual send/recv syscall
/// runs once the fd polls ready.
pub struct PollSocket {
    ops: Vec<PendingOp>,
}

// Operations reference task-owned buffers; the driver moves between threads
// only together with its worker.
unsafe impl Send for PollSocket {}

impl PollSocket {
    pub fn new(entries: u32) -> Self {
        PollSocket {
            ops: Vec::with_capacity(entries as usize),
        }
    }

    pub fn prep(&mut self, request: &Request, timeout: Option<Duration>, flags: i32) {
        self.ops.push(PendingOp {
            user_data: request.task,
            fd: request.fd,
            event: request.event,
            data: request.data,
            length: request.length,
            flags,
            deadline: timeout.map(|t| Instant::now() + t),
            submitted: false,
        });
    }

    /// Mark queued operations in flight; returns how many were new.
    pub fn submit(&mut self) -> usize {
        let mut count = 0;
        for op in self.ops.iter_mut() {
            if !op.submitted {
                op.submitted = true;
                count += 1;
            }
        }
        count
    }

    pub fn complete(&mut self) -> Result<Completion> {
        loop {
            if let Some(completion) = self.wait_pass(None)? {
                return Ok(completion);
            }
        }
    }

    pub fn peek(&mut self) -> Result<Option<Completion>> {
        self.wait_pass(Some(Duration::ZERO))
    }

    /// One poll round over the in-flight fds. `budget` of None blocks until
    /// the nearest deadline (or readiness); Some bounds the wait.
    fn wait_pass(&mut self, budget: Option<Duration>) -> Result<Option<Completion>> {
        let now = Instant::now();
        let in_flight: Vec<usize> = self
            .ops
            .iter()
            .enumerate()
            .filter(|(_, op)| op.submitted)
            .map(|(i, _)| i)
            .collect();
        if in_flight.is_empty() {
            return Err(Error::Ring(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "no operation in flight",
            )));
        }

        let mut fds: Vec<libc::pollfd> = in_flight
            .iter()
            .map(|&i| libc::pollfd {
                fd: self.ops[i].fd,
                events: match self.ops[i].event {
                    Event::Read => libc::POLLIN,
                    Event::Write => libc::POLLOUT,
                },
                revents: 0,
            })
            .collect();

        let nearest_deadline = in_flight
            .iter()
            .filter_map(|&i| self.ops[i].deadline)
            .min()
            .map(|d| d.saturating_duration_since(now));
        let wait = match (budget, nearest_deadline) {
            (Some(b), Some(d)) => b.min(d),
            (Some(b), None) => b,
            (None, Some(d)) => d,
            (None, None) => Duration::from_millis(500),
        };

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, wait.as_millis() as i32) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(None);
            }
            return Err(Error::Ring(err));
        }

        let now = Instant::now();
        for (slot, &i) in in_flight.iter().enumerate() {
            let ready = fds[slot].revents
                & (fds[slot].events | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL)
                != 0;
            let no_wait = self.ops[i].flags & libc::MSG_DONTWAIT != 0;
            if ready || no_wait {
                match Self::try_op(&self.ops[i]) {
                    Some(result) => {
                        let op = self.ops.remove(i);
                        return Ok(Some(Completion {
                            user_data: op.user_data,
                            result,
                        }));
                    }
                    None if no_wait => {
                        let op = self.ops.remove(i);
                        return Ok(Some(Completion {
                            user_data: op.user_data,
                            result: -libc::EAGAIN,
                        }));
                    }
                    None => {}
                }
            }
            if self.ops[i].deadline.is_some_and(|d| d <= now) {
                let op = self.ops.remove(i);
                return Ok(Some(Completion {
                    user_data: op.user_data,
                    result: -libc::ETIMEDOUT,
                }));
            }
        }
        Ok(None)
    }

    /// Run the syscall against a ready fd. None means try again later
    /// (EAGAIN/EINTR); otherwise bytes-transferred or negative errno.
    fn try_op(op: &PendingOp) -> Option<i32> {
        let n = unsafe {
            match op.event {
                Event::Write => libc::send(
                    op.fd,
                    op.data as *const libc::c_void,
                    op.length as usize,
                    libc::MSG_NOSIGNAL,
                ),
                Event::Read => libc::recv(
                    op.fd,
                    op.data as *mut libc::c_void,
                    op.length as usize,
                    op.flags & !libc::MSG_DONTWAIT,
                ),
            }
        };
        if n >= 0 {
            return Some(n as i32);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => None,
            Some(errno) => Some(-errno),
            None => Some(-libc::EIO),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;

    fn request(fd: i32, event: Event, data: *mut u8, length: i64, task: u64) -> Request {
        Request {
            fd,
            event,
            data,
            length,
            task,
        }
    }

    fn pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        (client, server)
    }

    #[test]
    fn send_then_recv() {
        let (client, mut server) = pair();
        let mut poll = PollSocket::new(8);

        let payload = b"hello".to_vec();
        poll.prep(
            &request(
                client.as_raw_fd(),
                Event::Write,
                payload.as_ptr() as *mut u8,
                payload.len() as i64,
                1,
            ),
            None,
            0,
        );
        assert_eq!(poll.submit(), 1);
        let completion = poll.complete().unwrap();
        assert_eq!((completion.user_data, completion.result), (1, 5));

        let mut echo = [0u8; 5];
        server.read_exact(&mut echo).unwrap();
        server.write_all(&echo).unwrap();

        let mut buf = vec![0u8; 16];
        poll.prep(
            &request(
                client.as_raw_fd(),
                Event::Read,
                buf.as_mut_ptr(),
                buf.len() as i64,
                2,
            ),
            None,
            0,
        );
        poll.submit();
        let completion = poll.complete().unwrap();
        assert_eq!((completion.user_data, completion.result), (2, 5));
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn recv_deadline_times_out() {
        let (client, _server) = pair();
        let mut poll = PollSocket::new(8);
        let mut buf = vec![0u8; 16];
        poll.prep(
            &request(
                client.as_raw_fd(),
                Event::Read,
                buf.as_mut_ptr(),
                buf.len() as i64,
                9,
            ),
            Some(Duration::from_millis(25)),
            0,
        );
        poll.submit();
        let completion = poll.complete().unwrap();
        assert_eq!(completion.user_data, 9);
        assert_eq!(completion.result, -libc::ETIMEDOUT);
    }

    #[test]
    fn peek_is_non_blocking() {
        let (client, _server) = pair();
        let mut poll = PollSocket::new(8);
        let mut buf = vec![0u8; 16];
        poll.prep(
            &request(
                client.as_raw_fd(),
                Event::Read,
                buf.as_mut_ptr(),
                buf.len() as i64,
                4,
            ),
            None,
            0,
        );
        poll.submit();
        assert!(poll.peek().unwrap().is_none());
    }

    #[test]
    fn complete_without_in_flight_is_an_error() {
        let mut poll = PollSocket::new(8);
        assert!(poll.complete().is_err());
    }
}

use std::os::unix::io::RawFd;

use crate::connection::{ConnectionManager, TcpSettings};
use crate::http::helper::{self, Encoding, ResponseInfo};
use crate::io::{Event, Request};
use crate::message::{FailureCode, MessageResult, MessageState, OriginalMessage};
use crate::tls::{Progress, TlsIo, TlsSession};
use crate::Error;

/// Per-request state machine. `execute` is invoked by the worker whenever
/// progress is possible: once at submission, then once per completion of
/// the request it owns. Each invocation either queues exactly one kernel
/// operation and returns the awaiting state, or reaches Finished/Aborted.
///
/// Transient failures reset the exchange to Init and retry from offset 0;
/// the failure bitmask accumulates across retries, and the retry ceiling
/// turns the next failure into Aborted with RetryExhausted set.
pub struct HttpTask {
    msg: Box<OriginalMessage>,
    pub(crate) request: Option<Request>,
    send_offset: i64,
    recv_offset: i64,
    failures: u16,
    chunk_size: usize,
    settings: TcpSettings,
    info: Option<ResponseInfo>,
    tls: Option<TlsSession>,
    fd: RawFd,
    arena_id: u64,
}

impl HttpTask {
    pub fn new(
        msg: Box<OriginalMessage>,
        chunk_size: usize,
        settings: TcpSettings,
        arena_id: u64,
    ) -> Self {
        HttpTask {
            msg,
            request: None,
            send_offset: 0,
            recv_offset: 0,
            failures: 0,
            chunk_size,
            settings,
            info: None,
            tls: None,
            fd: -1,
            arena_id,
        }
    }

    pub fn state(&self) -> MessageState {
        self.msg.result.state()
    }

    fn set_state(&mut self, state: MessageState) {
        self.msg.result.state.0 = state;
    }

    pub fn message(&self) -> &OriginalMessage {
        &self.msg
    }

    pub fn into_message(self) -> Box<OriginalMessage> {
        self.msg
    }

    /// Response status once the preamble was parsed.
    pub fn response_info(&self) -> Option<&ResponseInfo> {
        self.info.as_ref()
    }

    fn total_send_length(&self) -> i64 {
        (self.msg.message.size() + self.msg.put_length()) as i64
    }

    /// The next slice to transmit: the request header first, then the
    /// borrowed PUT body.
    fn next_send_slice(&self) -> (*const u8, i64) {
        let header = self.msg.message.data();
        if self.msg.put_length() > 0 && self.send_offset >= header.len() as i64 {
            let body = self.msg.put_body.as_ref().unwrap();
            let at = self.send_offset as usize - header.len();
            (body[at..].as_ptr(), (body.len() - at) as i64)
        } else {
            let at = self.send_offset as usize;
            (header[at..].as_ptr(), (header.len() - at) as i64)
        }
    }

    /// Transient failure: clear progress and go back to Init, or pass the
    /// ceiling and abort. Returns whether the task may retry.
    fn reset(&mut self, conn: &mut ConnectionManager) -> bool {
        let aborted = self.failures > self.settings.retry_limit;
        self.failures += 1;
        if self.fd >= 0 {
            self.tls = None;
            conn.disconnect(self.fd, &self.msg.hostname, self.msg.port, None, 0, true);
            self.fd = -1;
        }
        self.request = None;
        if aborted {
            self.msg.result.failure.insert(FailureCode::RETRY_EXHAUSTED);
            self.set_state(MessageState::Aborted);
            tracing::debug!(
                id = self.msg.id,
                failures = self.failures,
                code = ?self.msg.result.failure_code(),
                "message aborted after retries"
            );
            return false;
        }
        self.msg.result.buffer_mut().clear();
        self.send_offset = 0;
        self.recv_offset = 0;
        self.info = None;
        self.set_state(MessageState::Init);
        true
    }

    /// Map a negative completion length onto a failure bit.
    fn classify(length: i64, base: FailureCode) -> FailureCode {
        if length == -(libc::ECANCELED as i64)
            || length == -(libc::EINTR as i64)
            || length == -(libc::ETIMEDOUT as i64)
        {
            FailureCode::TIMEOUT
        } else {
            base
        }
    }

    fn completed_length(&self) -> i64 {
        self.request.as_ref().map_or(0, |r| r.length)
    }

    /// Whether a negative length is just "not ready yet".
    fn benign(length: i64) -> bool {
        length == -(libc::EINPROGRESS as i64) || length == -(libc::EAGAIN as i64)
    }

    pub fn execute(&mut self, conn: &mut ConnectionManager) -> MessageState {
        loop {
            match self.state() {
                MessageState::Init => {
                    match conn.connect(
                        &self.msg.hostname,
                        self.msg.port,
                        self.msg.tls,
                        &self.settings,
                    ) {
                        Ok(fd) => self.fd = fd,
                        Err(err) => {
                            let bit = match err {
                                Error::ConnectTimeout(_) => FailureCode::CONNECT_TIMEOUT,
                                Error::Tls(_) | Error::TlsServerName(_) | Error::TlsRoots(_) => {
                                    FailureCode::TLS
                                }
                                _ => FailureCode::SOCKET_CREATE,
                            };
                            self.msg.result.failure.insert(bit);
                            self.set_state(MessageState::Aborted);
                            return MessageState::Aborted;
                        }
                    }
                    self.send_offset = 0;
                    if self.msg.tls {
                        match conn.take_tls_session(self.fd) {
                            Some(session) => self.tls = Some(session),
                            None => {
                                self.msg.result.failure.insert(FailureCode::TLS);
                                if !self.reset(conn) {
                                    return MessageState::Aborted;
                                }
                                continue;
                            }
                        }
                        self.set_state(MessageState::TlsHandshake);
                    } else {
                        self.set_state(MessageState::InitSending);
                    }
                }

                MessageState::TlsHandshake => match self.drive_tls(conn, TlsOp::Connect) {
                    Progress::Finished(_) => self.set_state(MessageState::InitSending),
                    Progress::Progress => return MessageState::TlsHandshake,
                    Progress::Aborted => {
                        self.msg.result.failure.insert(FailureCode::TLS);
                        if !self.reset(conn) {
                            return MessageState::Aborted;
                        }
                    }
                },

                MessageState::InitSending | MessageState::Sending if !self.msg.tls => {
                    if self.state() == MessageState::Sending {
                        let length = self.completed_length();
                        if length > 0 {
                            self.send_offset += length;
                        } else if !Self::benign(length) {
                            let bit = Self::classify(length, FailureCode::SEND);
                            self.msg.result.failure.insert(bit);
                            if !self.reset(conn) {
                                return MessageState::Aborted;
                            }
                            continue;
                        }
                        if self.send_offset >= self.total_send_length() {
                            self.set_state(MessageState::InitReceiving);
                            self.recv_offset = 0;
                            self.msg.result.buffer_mut().clear();
                            continue;
                        }
                    }
                    self.set_state(MessageState::Sending);
                    let (data, length) = self.next_send_slice();
                    let request = Request {
                        fd: self.fd,
                        event: Event::Write,
                        data: data as *mut u8,
                        length,
                        task: self.arena_id,
                    };
                    if length <= self.chunk_size as i64 {
                        conn.io_mut()
                            .prep_send_timeout(&request, self.settings.kernel_timeout());
                    } else {
                        conn.io_mut().prep_send(&request);
                    }
                    self.request = Some(request);
                    return MessageState::Sending;
                }

                MessageState::InitSending | MessageState::Sending => {
                    // TLS path: the shim owns completion bookkeeping.
                    self.set_state(MessageState::Sending);
                    let progress = {
                        let OriginalMessage {
                            message,
                            put_body,
                            result,
                            ..
                        } = &mut *self.msg;
                        let header = message.data();
                        let at = self.send_offset as usize;
                        let slice: &[u8] = match put_body.as_ref() {
                            Some(body) if at >= header.len() => &body[at - header.len()..],
                            _ => &header[at..],
                        };
                        let tls = self.tls.as_mut().expect("tls session during send");
                        let mut ctx = TlsIo {
                            io: conn.io_mut(),
                            request: &mut self.request,
                            fd: self.fd,
                            chunk_size: self.chunk_size,
                            kernel_timeout: self.settings.timeout,
                            recv_no_wait: self.settings.recv_no_wait,
                            task: self.arena_id,
                            failure: &mut result.failure,
                        };
                        tls.send(&mut ctx, slice)
                    };
                    match progress {
                        Progress::Finished(sent) => {
                            self.send_offset += sent;
                            if self.send_offset >= self.total_send_length() {
                                self.set_state(MessageState::InitReceiving);
                                self.recv_offset = 0;
                                let receive = self.msg.result.buffer_mut();
                                receive.clear();
                                if Self::ensure_chunk(receive, 0, self.chunk_size).is_err() {
                                    self.msg.result.failure.insert(FailureCode::RECV);
                                    self.set_state(MessageState::Aborted);
                                    return MessageState::Aborted;
                                }
                            }
                        }
                        Progress::Progress => return MessageState::Sending,
                        Progress::Aborted => {
                            if !self.reset(conn) {
                                return MessageState::Aborted;
                            }
                        }
                    }
                }

                MessageState::InitReceiving | MessageState::Receiving if !self.msg.tls => {
                    if self.state() == MessageState::Receiving {
                        let length = self.completed_length();
                        if length == 0 {
                            self.msg.result.failure.insert(FailureCode::EMPTY);
                            if !self.reset(conn) {
                                return MessageState::Aborted;
                            }
                            continue;
                        } else if length > 0 {
                            let size = self.msg.result.data.size();
                            let _ = self
                                .msg
                                .result
                                .data
                                .resize(size - (self.chunk_size - length as usize));
                            self.recv_offset += length;
                            match self.check_finished(conn) {
                                Outcome::Done(state) => return state,
                                Outcome::Retry => {
                                    if !self.reset(conn) {
                                        return MessageState::Aborted;
                                    }
                                    continue;
                                }
                                Outcome::More => {}
                            }
                        } else if !Self::benign(length) {
                            let bit = Self::classify(length, FailureCode::RECV);
                            self.msg.result.failure.insert(bit);
                            if !self.reset(conn) {
                                return MessageState::Aborted;
                            }
                            continue;
                        } else {
                            // Not ready: undo the provisional chunk.
                            let size = self.msg.result.data.size();
                            let _ = self.msg.result.data.resize(size - self.chunk_size);
                        }
                        if self.grow_receive_buffer().is_err() {
                            self.msg.result.failure.insert(FailureCode::RECV);
                            self.set_state(MessageState::Aborted);
                            return MessageState::Aborted;
                        }
                    }
                    let receive = &mut self.msg.result.data;
                    let at = self.recv_offset as usize;
                    if Self::ensure_chunk(receive, at, self.chunk_size).is_err() {
                        self.msg.result.failure.insert(FailureCode::RECV);
                        self.set_state(MessageState::Aborted);
                        return MessageState::Aborted;
                    }
                    let request = Request {
                        fd: self.fd,
                        event: Event::Read,
                        data: receive.as_mut_ptr_at(at),
                        length: self.chunk_size as i64,
                        task: self.arena_id,
                    };
                    conn.io_mut().prep_recv_timeout(
                        &request,
                        self.settings.kernel_timeout(),
                        self.settings.recv_no_wait,
                    );
                    self.request = Some(request);
                    self.set_state(MessageState::Receiving);
                    return MessageState::Receiving;
                }

                MessageState::InitReceiving | MessageState::Receiving => {
                    // TLS path.
                    self.set_state(MessageState::Receiving);
                    let at = self.recv_offset as usize;
                    let chunk = self.chunk_size;
                    let progress = {
                        let MessageResult { data, failure, .. } = &mut self.msg.result;
                        if Self::ensure_chunk(data, at, chunk).is_err() {
                            failure.insert(FailureCode::RECV);
                            None
                        } else {
                            let tls = self.tls.as_mut().expect("tls session during receive");
                            let mut ctx = TlsIo {
                                io: conn.io_mut(),
                                request: &mut self.request,
                                fd: self.fd,
                                chunk_size: chunk,
                                kernel_timeout: self.settings.timeout,
                                recv_no_wait: self.settings.recv_no_wait,
                                task: self.arena_id,
                                failure,
                            };
                            let window = &mut data.data_mut()[at..at + chunk];
                            Some(tls.recv(&mut ctx, window))
                        }
                    };
                    let Some(progress) = progress else {
                        // A fixed receive buffer too small for the answer.
                        self.set_state(MessageState::Aborted);
                        return MessageState::Aborted;
                    };
                    match progress {
                        Progress::Finished(0) => {
                            self.msg.result.failure.insert(FailureCode::EMPTY);
                            if !self.reset(conn) {
                                return MessageState::Aborted;
                            }
                        }
                        Progress::Finished(received) => {
                            let size = self.msg.result.data.size();
                            let _ = self
                                .msg
                                .result
                                .data
                                .resize(size - (chunk - received as usize));
                            self.recv_offset += received;
                            match self.check_finished(conn) {
                                Outcome::Done(state) => return state,
                                Outcome::Retry => {
                                    if !self.reset(conn) {
                                        return MessageState::Aborted;
                                    }
                                }
                                Outcome::More => {
                                    if self.grow_receive_buffer().is_err() {
                                        self.msg.result.failure.insert(FailureCode::RECV);
                                        self.set_state(MessageState::Aborted);
                                        return MessageState::Aborted;
                                    }
                                }
                            }
                        }
                        Progress::Progress => return MessageState::Receiving,
                        Progress::Aborted => {
                            if !self.reset(conn) {
                                return MessageState::Aborted;
                            }
                        }
                    }
                }

                MessageState::TlsShutdown => match self.drive_tls(conn, TlsOp::Shutdown) {
                    Progress::Progress => return MessageState::TlsShutdown,
                    Progress::Finished(_) | Progress::Aborted => {
                        // The exchange already succeeded; a failed shutdown
                        // does not fail the message.
                        if let Some(session) = self.tls.take() {
                            conn.restore_tls_session(self.fd, session);
                        }
                        conn.disconnect(
                            self.fd,
                            &self.msg.hostname,
                            self.msg.port,
                            Some(&self.settings),
                            (self.send_offset + self.recv_offset) as u64,
                            false,
                        );
                        self.set_state(MessageState::Finished);
                        return MessageState::Finished;
                    }
                },

                MessageState::Finished => return MessageState::Finished,
                MessageState::Aborted => return MessageState::Aborted,
            }
        }
    }

    /// Completion check shared by both transports. On completion the result
    /// window is stamped and the socket released (plain HTTP) or the TLS
    /// shutdown begins.
    fn check_finished(&mut self, conn: &mut ConnectionManager) -> Outcome {
        let received = self.recv_offset as usize;
        let data_ok = {
            let MessageResult { data, .. } = &self.msg.result;
            helper::finished(data.data(), received, &mut self.info)
        };
        match data_ok {
            Ok(true) => {
                let info = self.info.as_ref().unwrap();
                if info.status.retryable() {
                    tracing::debug!(
                        id = self.msg.id,
                        status = info.status.as_str(),
                        "throttled by server, retrying"
                    );
                    self.msg.result.failure.insert(FailureCode::HTTP_PROTOCOL);
                    return Outcome::Retry;
                }
                let body = match info.encoding {
                    Encoding::ContentLength(n) => n,
                    Encoding::Chunked => (received - info.header_length) as u64,
                };
                self.msg.result.size = body;
                self.msg.result.offset = info.header_length as u64;
                if self.msg.tls {
                    self.set_state(MessageState::TlsShutdown);
                    // Loop continues into TlsShutdown.
                    Outcome::More
                } else {
                    conn.disconnect(
                        self.fd,
                        &self.msg.hostname,
                        self.msg.port,
                        Some(&self.settings),
                        (self.send_offset + self.recv_offset) as u64,
                        false,
                    );
                    self.set_state(MessageState::Finished);
                    Outcome::Done(MessageState::Finished)
                }
            }
            Ok(false) => Outcome::More,
            Err(_) => {
                self.msg.result.failure.insert(FailureCode::HTTP_PROTOCOL);
                Outcome::Retry
            }
        }
    }

    /// Grow the receive buffer toward the predicted total once the
    /// preamble told us the Content-Length.
    fn grow_receive_buffer(&mut self) -> crate::Result<()> {
        let receive = &mut self.msg.result.data;
        if receive.capacity() < receive.size() + self.chunk_size {
            if let Some(info) = &self.info {
                let predicted =
                    info.content_length() as usize + info.header_length + self.chunk_size;
                let grown = receive.capacity() + receive.capacity() / 2;
                receive.reserve(predicted.max(grown))?;
            }
        }
        Ok(())
    }

    /// Make sure `chunk` writable bytes exist at `at`.
    fn ensure_chunk(
        buffer: &mut crate::buffer::ByteBuffer,
        at: usize,
        chunk: usize,
    ) -> crate::Result<()> {
        if buffer.size() < at + chunk {
            buffer.resize(at + chunk)?;
        }
        Ok(())
    }

    fn drive_tls(&mut self, conn: &mut ConnectionManager, op: TlsOp) -> Progress {
        let tls = self.tls.as_mut().expect("tls session while driving tls");
        let failure = &mut self.msg.result.failure;
        let mut ctx = TlsIo {
            io: conn.io_mut(),
            request: &mut self.request,
            fd: self.fd,
            chunk_size: self.chunk_size,
            kernel_timeout: self.settings.timeout,
            recv_no_wait: self.settings.recv_no_wait,
            task: self.arena_id,
            failure,
        };
        match op {
            TlsOp::Connect => tls.connect(&mut ctx),
            TlsOp::Shutdown => tls.shutdown(&mut ctx),
        }
    }
}

enum TlsOp {
    Connect,
    Shutdown,
}

enum Outcome {
    Done(MessageState),
    Retry,
    More,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buffer::ByteBuffer;
    use crate::io::LINK_TIMEOUT_DATA;
    use std::io::{Read, Write};
    use std::time::Duration;

    /// Accept one connection, read through the header terminator, answer
    /// with `response`, keep the socket open until dropped.
    fn one_shot_server(response: Vec<u8>) -> (std::net::TcpListener, u16) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = listener.try_clone().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = accept.accept().unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    return;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            stream.write_all(&response).unwrap();
            // Hold the connection open long enough for the client to parse.
            std::thread::sleep(Duration::from_millis(200));
        });
        (listener, port)
    }

    fn drive(task: &mut HttpTask, conn: &mut ConnectionManager) -> MessageState {
        let mut state = task.execute(conn);
        while !state.is_terminal() {
            conn.io_mut().submit().unwrap();
            let completion = loop {
                let completion = conn.io_mut().complete().unwrap();
                if completion.user_data != LINK_TIMEOUT_DATA {
                    break completion;
                }
            };
            if let Some(request) = task.request.as_mut() {
                request.length = completion.result as i64;
            }
            state = task.execute(conn);
        }
        state
    }

    #[test]
    fn get_round_trip_over_localhost() {
        let (_listener, port) =
            one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec());
        let mut conn = ConnectionManager::new(16, 8).unwrap();
        let request = format!("GET /x? HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n");
        let msg = Box::new(OriginalMessage::new(
            ByteBuffer::from_slice(request.as_bytes()),
            "localhost",
            port,
            false,
        ));
        let mut task = HttpTask::new(msg, 1 << 16, TcpSettings::default(), 1);

        let state = drive(&mut task, &mut conn);
        assert_eq!(state, MessageState::Finished);
        let msg = task.into_message();
        assert!(msg.result.success());
        assert!(msg.result.failure_code().is_empty());
        assert_eq!(msg.result.body(), b"hello");
        assert_eq!(msg.result.size(), 5);
    }

    #[test]
    fn error_status_still_finishes() {
        let (_listener, port) = one_shot_server(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found".to_vec(),
        );
        let mut conn = ConnectionManager::new(16, 8).unwrap();
        let request = format!("GET /gone? HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n");
        let msg = Box::new(OriginalMessage::new(
            ByteBuffer::from_slice(request.as_bytes()),
            "localhost",
            port,
            false,
        ));
        let mut task = HttpTask::new(msg, 1 << 16, TcpSettings::default(), 1);

        let state = drive(&mut task, &mut conn);
        assert_eq!(state, MessageState::Finished);
        let msg = task.into_message();
        assert!(msg.result.failure_code().is_empty());
        assert_eq!(
            task_status(&msg),
            crate::http::StatusCode::NotFound404.as_str()
        );
        assert!(msg.result.size() > 0, "error body is surfaced");

        fn task_status(msg: &OriginalMessage) -> &'static str {
            // Re-detect from the raw bytes; the task's info is private.
            helper::detect(msg.result.data())
                .unwrap()
                .unwrap()
                .status
                .as_str()
        }
    }

    #[test]
    fn chunked_response_completes() {
        let (_listener, port) = one_shot_server(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
                .to_vec(),
        );
        let mut conn = ConnectionManager::new(16, 8).unwrap();
        let request = format!("GET /c? HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n");
        let msg = Box::new(OriginalMessage::new(
            ByteBuffer::from_slice(request.as_bytes()),
            "localhost",
            port,
            false,
        ));
        let mut task = HttpTask::new(msg, 1 << 16, TcpSettings::default(), 1);

        let state = drive(&mut task, &mut conn);
        assert_eq!(state, MessageState::Finished);
        let msg = task.into_message();
        assert!(msg.result.success());
        assert!(msg.result.data().ends_with(b"0\r\n\r\n"));
    }

    #[test]
    fn silent_server_exhausts_retries() {
        // Listener that accepts but never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = listener.try_clone().unwrap();
        std::thread::spawn(move || {
            let mut held = Vec::new();
            while let Ok((stream, _)) = accept.accept() {
                held.push(stream);
            }
        });

        let mut conn = ConnectionManager::new(16, 8).unwrap();
        let settings = TcpSettings {
            timeout: Duration::from_millis(30),
            ..TcpSettings::default()
        };
        let request = format!("GET /never? HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n");
        let msg = Box::new(OriginalMessage::new(
            ByteBuffer::from_slice(request.as_bytes()),
            "localhost",
            port,
            false,
        ));
        let mut task = HttpTask::new(msg, 1 << 16, settings, 1);

        let state = drive(&mut task, &mut conn);
        assert_eq!(state, MessageState::Aborted);
        let msg = task.into_message();
        let code = msg.result.failure_code();
        assert!(code.contains(FailureCode::TIMEOUT), "got {code:?}");
        assert!(code.contains(FailureCode::RETRY_EXHAUSTED), "got {code:?}");
        assert!(!msg.result.success());
    }
}

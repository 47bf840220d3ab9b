use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use crate::io::{Event, IoDriver, Request};
use crate::message::FailureCode;
use crate::{Error, Result};

/// Outcome of driving a TLS operation. Progress means one more network
/// round trip is required: re-enter the same operation once the pending
/// request completes.
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    Finished(i64),
    Progress,
    Aborted,
}

/// Worker-scoped TLS capability: the client configuration and its session
/// store, shared by every session this worker opens. Resumption data is
/// keyed by server name inside the rustls config, so reconnects to the same
/// host skip the full handshake.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
}

impl TlsContext {
    pub fn new() -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in
            rustls_native_certs::load_native_certs().map_err(Error::TlsRoots)?
        {
            // Skip unparsable platform certificates instead of failing the
            // whole context.
            let _ = roots.add(cert);
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(TlsContext {
            config: Arc::new(config),
        })
    }

    pub fn session(&self, hostname: &str) -> Result<TlsSession> {
        let name = ServerName::try_from(hostname.to_string())
            .map_err(|_| Error::TlsServerName(hostname.to_string()))?;
        let conn = ClientConnection::new(self.config.clone(), name)?;
        Ok(TlsSession {
            conn,
            scratch: Vec::new(),
            phase: Phase::Idle,
            net_read: 0,
            sock_write: 0,
            pending_send: None,
            close_sent: false,
            shutdown_retried: false,
        })
    }
}

/// What the session needs from its caller to move ciphertext: the socket
/// driver, the task's request slot, and failure accounting.
pub struct TlsIo<'a> {
    pub io: &'a mut IoDriver,
    pub request: &'a mut Option<Request>,
    pub fd: RawFd,
    pub chunk_size: usize,
    pub kernel_timeout: Duration,
    pub recv_no_wait: bool,
    pub task: u64,
    pub failure: &'a mut FailureCode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Sending,
    Receiving,
    Aborted,
}

/// Outcome of one pump step over the ciphertext plumbing.
enum Pump {
    /// A socket operation was issued; wait for its completion.
    Blocked,
    /// Both directions are quiet.
    Quiet,
    Aborted,
}

/// A TLS exchange driven entirely through memory buffers: the engine never
/// touches the socket itself. Ciphertext moves between rustls and the
/// kernel through `scratch` in chunk-sized slices.
pub struct TlsSession {
    conn: ClientConnection,
    scratch: Vec<u8>,
    phase: Phase,
    /// Ciphertext staged in `scratch` for the current send round.
    net_read: usize,
    /// Portion of the staged ciphertext already flushed to the socket.
    sock_write: usize,
    /// Result of a plaintext write already applied to the engine, kept
    /// until its ciphertext is flushed.
    pending_send: Option<i64>,
    close_sent: bool,
    shutdown_retried: bool,
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("phase", &self.phase)
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

impl TlsSession {
    /// Drive the handshake. Finished(0) once the session is established.
    pub fn connect(&mut self, ctx: &mut TlsIo) -> Progress {
        match self.pump_completion(ctx) {
            Pump::Blocked => return Progress::Progress,
            Pump::Aborted => return Progress::Aborted,
            Pump::Quiet => {}
        }
        loop {
            if !self.conn.is_handshaking() {
                return Progress::Finished(0);
            }
            match self.pump_start(ctx) {
                Pump::Blocked => return Progress::Progress,
                Pump::Aborted => return Progress::Aborted,
                Pump::Quiet => {
                    // Handshaking without any transport demand is a stall.
                    ctx.failure.insert(FailureCode::TLS);
                    self.phase = Phase::Aborted;
                    return Progress::Aborted;
                }
            }
        }
    }

    /// Encrypt and send `data`. Finished(n) once all ciphertext is on the
    /// wire; the engine buffers the whole slice, so n is data.len().
    pub fn send(&mut self, ctx: &mut TlsIo, data: &[u8]) -> Progress {
        match self.pump_completion(ctx) {
            Pump::Blocked => return Progress::Progress,
            Pump::Aborted => return Progress::Aborted,
            Pump::Quiet => {}
        }
        if self.pending_send.is_none() {
            match self.conn.writer().write(data) {
                Ok(n) => self.pending_send = Some(n as i64),
                Err(_) => {
                    ctx.failure.insert(FailureCode::TLS);
                    self.phase = Phase::Aborted;
                    return Progress::Aborted;
                }
            }
        }
        match self.pump_start(ctx) {
            Pump::Blocked => Progress::Progress,
            Pump::Aborted => Progress::Aborted,
            Pump::Quiet => Progress::Finished(self.pending_send.take().unwrap_or(0)),
        }
    }

    /// Receive plaintext into `buf`. Finished(n) with n possibly 0 on a
    /// clean peer close.
    pub fn recv(&mut self, ctx: &mut TlsIo, buf: &mut [u8]) -> Progress {
        match self.pump_completion(ctx) {
            Pump::Blocked => return Progress::Progress,
            Pump::Aborted => return Progress::Aborted,
            Pump::Quiet => {}
        }
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Progress::Finished(n as i64),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    match self.pump_start(ctx) {
                        Pump::Blocked => return Progress::Progress,
                        Pump::Aborted => return Progress::Aborted,
                        Pump::Quiet => {
                            ctx.failure.insert(FailureCode::TLS);
                            self.phase = Phase::Aborted;
                            return Progress::Aborted;
                        }
                    }
                }
                Err(_) => {
                    ctx.failure.insert(FailureCode::TLS);
                    self.phase = Phase::Aborted;
                    return Progress::Aborted;
                }
            }
        }
    }

    /// Send close_notify and flush. Retried once on failure; the exchange
    /// outcome does not depend on a clean shutdown.
    pub fn shutdown(&mut self, ctx: &mut TlsIo) -> Progress {
        if !self.close_sent {
            self.conn.send_close_notify();
            self.close_sent = true;
        }
        match self.pump_completion(ctx) {
            Pump::Blocked => return Progress::Progress,
            Pump::Aborted => return self.retry_shutdown(ctx),
            Pump::Quiet => {}
        }
        match self.pump_start(ctx) {
            Pump::Blocked => Progress::Progress,
            Pump::Aborted => self.retry_shutdown(ctx),
            Pump::Quiet => Progress::Finished(0),
        }
    }

    fn retry_shutdown(&mut self, ctx: &mut TlsIo) -> Progress {
        if self.shutdown_retried {
            return Progress::Aborted;
        }
        self.shutdown_retried = true;
        self.phase = Phase::Idle;
        match self.pump_start(ctx) {
            Pump::Blocked => Progress::Progress,
            Pump::Aborted => Progress::Aborted,
            Pump::Quiet => Progress::Finished(0),
        }
    }

    /// Account the completion of the socket operation issued by an earlier
    /// pump round, then continue that round.
    fn pump_completion(&mut self, ctx: &mut TlsIo) -> Pump {
        match self.phase {
            Phase::Idle => Pump::Quiet,
            Phase::Aborted => Pump::Aborted,
            Phase::Sending => {
                let length = ctx.request.as_ref().map_or(0, |r| r.length);
                if length > 0 {
                    self.sock_write += length as usize;
                } else if length != -(libc::EINPROGRESS as i64) && length != -(libc::EAGAIN as i64)
                {
                    self.fail_io(ctx, length, FailureCode::SEND);
                    return Pump::Aborted;
                }
                self.continue_send(ctx)
            }
            Phase::Receiving => {
                let length = ctx.request.as_ref().map_or(0, |r| r.length);
                if length == 0 {
                    ctx.failure.insert(FailureCode::EMPTY);
                    self.phase = Phase::Aborted;
                    return Pump::Aborted;
                } else if length > 0 {
                    let mut taken = &self.scratch[..length as usize];
                    match self.conn.read_tls(&mut taken) {
                        Ok(_) => {}
                        Err(_) => {
                            ctx.failure.insert(FailureCode::TLS);
                            self.phase = Phase::Aborted;
                            return Pump::Aborted;
                        }
                    }
                    if self.conn.process_new_packets().is_err() {
                        ctx.failure.insert(FailureCode::TLS);
                        self.phase = Phase::Aborted;
                        return Pump::Aborted;
                    }
                    self.phase = Phase::Idle;
                    Pump::Quiet
                } else if length != -(libc::EINPROGRESS as i64)
                    && length != -(libc::EAGAIN as i64)
                {
                    self.fail_io(ctx, length, FailureCode::RECV);
                    Pump::Aborted
                } else {
                    // Spurious wakeup; read again.
                    self.issue_read(ctx);
                    Pump::Blocked
                }
            }
        }
    }

    /// Start a pump round: flush pending outbound ciphertext first, then
    /// satisfy the engine's inbound demand.
    fn pump_start(&mut self, ctx: &mut TlsIo) -> Pump {
        if self.phase == Phase::Aborted {
            return Pump::Aborted;
        }
        if self.scratch.len() < ctx.chunk_size {
            self.scratch.resize(ctx.chunk_size, 0);
        }
        if self.conn.wants_write() {
            self.net_read = 0;
            self.sock_write = 0;
            let Self { conn, scratch, .. } = self;
            while conn.wants_write() && self.net_read < scratch.len() {
                let mut window = &mut scratch[self.net_read..];
                match conn.write_tls(&mut window) {
                    Ok(0) => break,
                    Ok(n) => self.net_read += n,
                    Err(_) => {
                        ctx.failure.insert(FailureCode::TLS);
                        self.phase = Phase::Aborted;
                        return Pump::Aborted;
                    }
                }
            }
            self.phase = Phase::Sending;
            return self.continue_send(ctx);
        }
        if self.conn.wants_read() {
            self.phase = Phase::Receiving;
            self.issue_read(ctx);
            return Pump::Blocked;
        }
        self.phase = Phase::Idle;
        Pump::Quiet
    }

    /// Issue the next write slice of the staged ciphertext, or start the
    /// next round once everything staged is flushed.
    fn continue_send(&mut self, ctx: &mut TlsIo) -> Pump {
        if self.sock_write < self.net_read {
            let remaining = (self.net_read - self.sock_write) as i64;
            let request = Request {
                fd: ctx.fd,
                event: Event::Write,
                data: self.scratch[self.sock_write..].as_mut_ptr(),
                length: remaining,
                task: ctx.task,
            };
            if remaining <= ctx.chunk_size as i64 {
                ctx.io.prep_send_timeout(&request, ctx.kernel_timeout);
            } else {
                ctx.io.prep_send(&request);
            }
            *ctx.request = Some(request);
            return Pump::Blocked;
        }
        self.phase = Phase::Idle;
        self.pump_start(ctx)
    }

    fn issue_read(&mut self, ctx: &mut TlsIo) {
        let length = ctx.chunk_size.min(self.scratch.len()) as i64;
        let request = Request {
            fd: ctx.fd,
            event: Event::Read,
            data: self.scratch.as_mut_ptr(),
            length,
            task: ctx.task,
        };
        ctx.io
            .prep_recv_timeout(&request, ctx.kernel_timeout, ctx.recv_no_wait);
        *ctx.request = Some(request);
    }

    fn fail_io(&mut self, ctx: &mut TlsIo, length: i64, kind: FailureCode) {
        if length == -(libc::ECANCELED as i64)
            || length == -(libc::EINTR as i64)
            || length == -(libc::ETIMEDOUT as i64)
        {
            ctx.failure.insert(FailureCode::TIMEOUT);
        } else {
            ctx.failure.insert(kind);
        }
        self.phase = Phase::Aborted;
    }
}

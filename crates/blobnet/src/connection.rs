use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use crate::io::IoDriver;
use crate::map::ShardedMap;
use crate::resolver::{tld, Cache, SocketEntry, ThroughputCache};
use crate::tls::{TlsContext, TlsSession};
use crate::{Error, Result};

/// TCP options applied to every socket the engine constructs, plus the
/// request timeout and retry knobs derived from them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    pub non_blocking: bool,
    pub no_delay: bool,
    /// Issue receives with MSG_DONTWAIT (busy-poll mode).
    pub recv_no_wait: bool,
    pub keep_alive: bool,
    /// Seconds of idle before keepalive probes start.
    pub keep_idle: u32,
    /// Seconds between keepalive probes.
    pub keep_intvl: u32,
    /// Unanswered probes before the connection drops.
    pub keep_cnt: u32,
    /// SO_RCVBUF; 0 leaves the kernel default.
    pub recv_buffer: usize,
    pub reuse_ports: bool,
    /// TCP_LINGER2 (FIN_WAIT2 lifetime) in seconds; None leaves default.
    pub linger: Option<i32>,
    /// Per-operation timeout; also the kernel timeout attached to
    /// chunk-sized submissions.
    pub timeout: Duration,
    /// Return finished sockets to the idle pool instead of closing.
    pub reuse: bool,
    /// Transient-failure ceiling per message before it aborts.
    pub retry_limit: u16,
}

impl Default for TcpSettings {
    fn default() -> Self {
        TcpSettings {
            non_blocking: true,
            no_delay: false,
            recv_no_wait: false,
            keep_alive: true,
            keep_idle: 1,
            keep_intvl: 1,
            keep_cnt: 1,
            recv_buffer: 0,
            reuse_ports: false,
            linger: Some(1),
            timeout: Duration::from_millis(500),
            reuse: false,
            retry_limit: 8,
        }
    }
}

impl TcpSettings {
    /// The timeout handed to the kernel for each chunked submission.
    pub fn kernel_timeout(&self) -> Duration {
        self.timeout
    }
}

/// Fresh-resolve attempts before a connect gives up.
const CONNECT_RETRY_LIMIT: u32 = 16;

/// Unifies resolution, socket construction and TLS: `connect` yields a
/// ready fd, `disconnect` recycles or closes it. Owned by one worker; the
/// fd registry uses the sharded map, the resolver policies hang off the
/// destination's TLD.
pub struct ConnectionManager {
    io: IoDriver,
    sockets: ShardedMap<RawFd, Box<SocketEntry>>,
    resolvers: HashMap<String, Box<dyn Cache + Send>>,
    context: TlsContext,
    cached_entries: usize,
}

impl ConnectionManager {
    pub fn new(uring_entries: u32, cached_entries: usize) -> Result<Self> {
        let mut resolvers: HashMap<String, Box<dyn Cache + Send>> = HashMap::new();
        // By default, rank addresses by observed throughput.
        resolvers.insert(String::new(), Box::new(ThroughputCache::new()));
        Ok(ConnectionManager {
            io: IoDriver::new(uring_entries)?,
            sockets: ShardedMap::with_buckets(64),
            resolvers,
            context: TlsContext::new()?,
            cached_entries,
        })
    }

    pub fn io_mut(&mut self) -> &mut IoDriver {
        &mut self.io
    }

    pub fn tls_context(&self) -> &TlsContext {
        &self.context
    }

    /// Install a resolver policy for every destination under the hostname's
    /// TLD.
    pub fn add_resolver_policy(&mut self, hostname: &str, cache: Box<dyn Cache + Send>) {
        self.resolvers.insert(tld(hostname).to_string(), cache);
    }

    fn resolver_for(&mut self, hostname: &str) -> &mut Box<dyn Cache + Send> {
        let key = tld(hostname);
        if self.resolvers.contains_key(key) {
            self.resolvers.get_mut(key).unwrap()
        } else {
            self.resolvers.get_mut("").unwrap()
        }
    }

    /// Connect to `hostname:port`, preferring a pooled idle socket. On a
    /// miss the socket is built with `settings`, connected non-blocking and
    /// awaited via poll; timeouts and refusals retry with a fresh resolve.
    pub fn connect(
        &mut self,
        hostname: &str,
        port: u16,
        tls: bool,
        settings: &TcpSettings,
    ) -> Result<RawFd> {
        self.connect_with_retries(hostname, port, tls, settings, CONNECT_RETRY_LIMIT)
    }

    pub fn connect_with_retries(
        &mut self,
        hostname: &str,
        port: u16,
        tls: bool,
        settings: &TcpSettings,
        retry_limit: u32,
    ) -> Result<RawFd> {
        let mut attempts_left = retry_limit;
        loop {
            let mut entry = self.resolver_for(hostname).resolve(hostname, port, tls)?;

            if entry.socket.is_some() {
                // Pool hit: the connection is live, only the TLS session is
                // per-exchange.
                let fd = entry.fd();
                if tls {
                    entry.tls = Some(self.context.session(hostname)?);
                }
                tracing::trace!(hostname, fd, "reusing pooled connection");
                self.sockets.insert(fd, entry);
                return Ok(fd);
            }

            match self.connect_fresh(&mut entry, settings) {
                Ok(()) => {
                    let fd = entry.fd();
                    self.resolver_for(hostname).start_socket(fd);
                    if tls {
                        entry.tls = Some(self.context.session(hostname)?);
                    }
                    tracing::debug!(hostname, port, fd, tls, "connected");
                    self.sockets.insert(fd, entry);
                    return Ok(fd);
                }
                Err(err) if attempts_left > 0 && err_is_retryable(&err) => {
                    attempts_left -= 1;
                    tracing::debug!(hostname, port, %err, attempts_left, "connect retry");
                    // Deprioritize the address that failed us.
                    self.resolver_for(hostname).shutdown_socket(entry, 0);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Build, configure and connect the socket for a freshly resolved
    /// entry.
    fn connect_fresh(&self, entry: &mut SocketEntry, settings: &TcpSettings) -> Result<()> {
        let addr = entry.dns.addr;
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket =
            Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Error::SocketCreate)?;
        apply_settings(&socket, settings).map_err(Error::SocketCreate)?;

        let pending = match socket.connect(&addr.into()) {
            Ok(()) => false,
            Err(err)
                if err.raw_os_error() == Some(libc::EINPROGRESS)
                    || err.kind() == std::io::ErrorKind::WouldBlock =>
            {
                true
            }
            Err(err) => return Err(Error::SocketCreate(err)),
        };

        if pending {
            match await_writable(&socket, settings.timeout) {
                Ok(true) => {
                    if let Some(err) = socket.take_error().map_err(Error::SocketCreate)? {
                        return Err(Error::SocketCreate(err));
                    }
                }
                Ok(false) => return Err(Error::ConnectTimeout(entry.hostname.clone())),
                Err(err) => return Err(Error::SocketCreate(err)),
            }
        }

        apply_timeouts(&socket, settings).map_err(Error::SocketCreate)?;
        entry.socket = Some(socket);
        Ok(())
    }

    /// Release an fd: report the byte count to the resolver, then force
    /// shutdown (and blacklist the peer), park for reuse, or close.
    pub fn disconnect(
        &mut self,
        fd: RawFd,
        hostname: &str,
        port: u16,
        settings: Option<&TcpSettings>,
        bytes: u64,
        force_shutdown: bool,
    ) {
        let Some(entry) = self.sockets.remove(&fd) else {
            return;
        };
        let cached_entries = self.cached_entries;
        let cache = self.resolver_for(hostname);
        if force_shutdown {
            if let Some(socket) = &entry.socket {
                let _ = socket.shutdown(std::net::Shutdown::Both);
            }
            tracing::debug!(hostname, fd, "force shutdown");
            cache.shutdown_socket(entry, bytes);
        } else if settings.is_some_and(|s| s.reuse) && !hostname.is_empty() && port != 0 {
            cache.stop_socket(entry, bytes, cached_entries, true);
        } else {
            cache.stop_socket(entry, bytes, cached_entries, false);
        }
    }

    /// Move the fd's TLS session into the task driving it. At most one task
    /// holds an fd, so the session moves with it.
    pub fn take_tls_session(&mut self, fd: RawFd) -> Option<TlsSession> {
        self.sockets.with_mut(&fd, |entry| entry.tls.take()).flatten()
    }

    /// Hand a session back before the fd is parked, so pooled entries keep
    /// their TLS marker.
    pub fn restore_tls_session(&mut self, fd: RawFd, session: TlsSession) {
        self.sockets.with_mut(&fd, |entry| entry.tls = Some(session));
    }
}

fn err_is_retryable(err: &Error) -> bool {
    match err {
        Error::ConnectTimeout(_) => true,
        Error::SocketCreate(io) => matches!(
            io.raw_os_error(),
            Some(libc::ECONNREFUSED) | Some(libc::ECONNRESET) | Some(libc::ENETUNREACH)
        ),
        _ => false,
    }
}

fn apply_settings(socket: &Socket, settings: &TcpSettings) -> std::io::Result<()> {
    if settings.non_blocking {
        socket.set_nonblocking(true)?;
    }
    if settings.keep_alive {
        let mut keepalive = TcpKeepalive::new();
        if settings.keep_idle > 0 {
            keepalive = keepalive.with_time(Duration::from_secs(settings.keep_idle as u64));
        }
        if settings.keep_intvl > 0 {
            keepalive = keepalive.with_interval(Duration::from_secs(settings.keep_intvl as u64));
        }
        #[cfg(target_os = "linux")]
        if settings.keep_cnt > 0 {
            keepalive = keepalive.with_retries(settings.keep_cnt);
        }
        socket.set_tcp_keepalive(&keepalive)?;
    }
    if settings.no_delay {
        socket.set_nodelay(true)?;
    }
    if settings.reuse_ports {
        socket.set_reuse_port(true)?;
    }
    if settings.recv_buffer > 0 {
        socket.set_recv_buffer_size(settings.recv_buffer)?;
    }
    #[cfg(target_os = "linux")]
    if let Some(linger) = settings.linger {
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_LINGER2,
                &linger as *const i32 as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn apply_timeouts(socket: &Socket, settings: &TcpSettings) -> std::io::Result<()> {
    if settings.timeout.is_zero() {
        return Ok(());
    }
    socket.set_read_timeout(Some(settings.timeout))?;
    socket.set_write_timeout(Some(settings.timeout))?;
    #[cfg(target_os = "linux")]
    socket.set_tcp_user_timeout(Some(settings.timeout))?;
    Ok(())
}

/// Poll the socket for connect completion within `timeout`. Ok(false) on
/// deadline expiry.
fn await_writable(socket: &Socket, timeout: Duration) -> std::io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd: socket.as_raw_fd(),
        events: libc::POLLIN | libc::POLLOUT,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout.as_millis() as i32) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        return Ok(rc == 1);
    }
}

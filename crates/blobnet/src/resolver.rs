use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

use socket2::Socket;

use crate::tls::TlsSession;
use crate::{Error, Result};

/// A resolved address plus its standing in the cache. Higher priority means
/// "prefer me"; every pool hit costs one point so a single address is not
/// pinned forever.
#[derive(Debug)]
pub struct DnsEntry {
    pub addr: SocketAddr,
    pub cache_priority: i32,
}

/// A connected (or connectable) socket bound to one host. At most one task
/// holds an entry at a time; idle entries live in the cache pool.
pub struct SocketEntry {
    pub dns: DnsEntry,
    pub socket: Option<Socket>,
    pub tls: Option<TlsSession>,
    pub hostname: String,
    pub port: u16,
    /// FIFO stamp while pooled; bounds the number of parked fds.
    pub(crate) timestamp: u64,
}

impl SocketEntry {
    pub fn fd(&self) -> RawFd {
        self.socket.as_ref().map_or(-1, |s| s.as_raw_fd())
    }
}

impl std::fmt::Debug for SocketEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketEntry")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("fd", &self.fd())
            .field("tls", &self.tls.is_some())
            .field("priority", &self.dns.cache_priority)
            .finish()
    }
}

/// The registrable part of a domain: the last two labels.
pub fn tld(domain: &str) -> &str {
    match domain.rfind('.') {
        Some(last) => match domain[..last.saturating_sub(1)].rfind('.') {
            Some(prev) => &domain[prev + 1..],
            None => domain,
        },
        None => "",
    }
}

/// DNS lookup plus idle-socket pooling. Implementations may rank resolved
/// addresses (throughput, MTU health); each worker owns its caches, so
/// nothing here is thread-safe.
pub trait Cache {
    /// A pooled entry for the same host/port/TLS-ness, or a fresh lookup.
    fn resolve(&mut self, hostname: &str, port: u16, tls: bool) -> Result<Box<SocketEntry>>;

    /// The fd starts carrying traffic; begin its timing.
    fn start_socket(&mut self, _fd: RawFd) {}

    /// The fd went quiet after `bytes` transferred: park it for reuse or
    /// close it. `cached_entries` bounds the pool across all hosts.
    fn stop_socket(
        &mut self,
        entry: Box<SocketEntry>,
        bytes: u64,
        cached_entries: usize,
        reuse: bool,
    );

    /// The peer misbehaved: record the transfer, close, and stop
    /// preferring every cached address that shares this peer.
    fn shutdown_socket(&mut self, entry: Box<SocketEntry>, bytes: u64);
}

/// The default cache: plain getaddrinfo with priority-counted reuse.
pub struct DnsCache {
    pool: HashMap<String, VecDeque<Box<SocketEntry>>>,
    /// timestamp -> hostname, oldest first; caps open pooled fds.
    fifo: BTreeMap<u64, String>,
    timestamp: u64,
    default_priority: i32,
}

impl DnsCache {
    pub const DEFAULT_PRIORITY: i32 = 8;

    pub fn new() -> Self {
        DnsCache {
            pool: HashMap::new(),
            fifo: BTreeMap::new(),
            timestamp: 0,
            default_priority: Self::DEFAULT_PRIORITY,
        }
    }

    /// Resolve `hostname` to its first IPv4 address (IPv6 as fallback).
    pub fn lookup(hostname: &str, port: u16) -> Result<SocketAddr> {
        let addrs = (hostname, port)
            .to_socket_addrs()
            .map_err(|source| Error::Resolve {
                host: hostname.to_string(),
                port,
                source,
            })?
            .collect::<Vec<_>>();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or(addrs.first())
            .copied()
            .ok_or_else(|| Error::Resolve {
                host: hostname.to_string(),
                port,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address records"),
            })
    }

    /// Fresh entry with the default priority; hook point for subclassing
    /// policies that adjust priorities after lookup.
    pub fn fresh_entry(&self, hostname: &str, port: u16) -> Result<Box<SocketEntry>> {
        let addr = Self::lookup(hostname, port)?;
        Ok(Box::new(SocketEntry {
            dns: DnsEntry {
                addr,
                cache_priority: self.default_priority,
            },
            socket: None,
            tls: None,
            hostname: hostname.to_string(),
            port,
            timestamp: 0,
        }))
    }

    /// Take a matching idle entry out of the pool. Entries whose priority
    /// ran out are dropped during the scan.
    pub fn pool_take(&mut self, hostname: &str, port: u16, tls: bool) -> Option<Box<SocketEntry>> {
        let deque = self.pool.get_mut(hostname)?;
        let mut at = 0;
        while at < deque.len() {
            if deque[at].dns.cache_priority <= 0 {
                let stale = deque.remove(at).unwrap();
                self.fifo.remove(&stale.timestamp);
                tracing::debug!(hostname, fd = stale.fd(), "evicting drained dns entry");
                continue;
            }
            if deque[at].port == port && deque[at].tls.is_some() == tls {
                let mut entry = deque.remove(at).unwrap();
                self.fifo.remove(&entry.timestamp);
                entry.dns.cache_priority -= 1;
                return Some(entry);
            }
            at += 1;
        }
        None
    }

    /// Park an idle entry, evicting the oldest pooled fds past the cap.
    pub fn pool_park(&mut self, mut entry: Box<SocketEntry>, cached_entries: usize) {
        self.timestamp += 1;
        entry.timestamp = self.timestamp;
        self.fifo.insert(entry.timestamp, entry.hostname.clone());
        self.pool
            .entry(entry.hostname.clone())
            .or_default()
            .push_back(entry);

        while self.fifo.len() > cached_entries {
            let (&stamp, _) = self.fifo.iter().next().unwrap();
            let hostname = self.fifo.remove(&stamp).unwrap();
            if let Some(deque) = self.pool.get_mut(&hostname) {
                if let Some(at) = deque.iter().position(|e| e.timestamp == stamp) {
                    let evicted = deque.remove(at).unwrap();
                    tracing::debug!(hostname, fd = evicted.fd(), "pool cap reached, closing fd");
                }
            }
        }
    }

    /// Zero the priority of every pooled entry sharing `addr`'s peer, so a
    /// broken path stops being chosen.
    pub fn invalidate_peer(&mut self, addr: &SocketAddr) {
        for deque in self.pool.values_mut() {
            for entry in deque.iter_mut() {
                if entry.dns.addr.ip() == addr.ip() {
                    entry.dns.cache_priority = 0;
                }
            }
        }
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for DnsCache {
    fn resolve(&mut self, hostname: &str, port: u16, tls: bool) -> Result<Box<SocketEntry>> {
        if let Some(entry) = self.pool_take(hostname, port, tls) {
            return Ok(entry);
        }
        self.fresh_entry(hostname, port)
    }

    fn stop_socket(
        &mut self,
        entry: Box<SocketEntry>,
        _bytes: u64,
        cached_entries: usize,
        reuse: bool,
    ) {
        if reuse && entry.socket.is_some() {
            self.pool_park(entry, cached_entries);
        }
        // Otherwise the entry drops here and its socket closes.
    }

    fn shutdown_socket(&mut self, entry: Box<SocketEntry>, _bytes: u64) {
        self.invalidate_peer(&entry.dns.addr);
    }
}

const MAX_HISTORY: usize = 128;

/// Ring of the most recent throughput samples with an order-maintained
/// shadow, so rank queries ("is this sample in the top third?") are a
/// binary search.
struct ThroughputWindow {
    ring: [f64; MAX_HISTORY],
    /// Descending; always mirrors the live ring contents.
    sorted: Vec<f64>,
    cursor: usize,
}

impl ThroughputWindow {
    fn new() -> Self {
        ThroughputWindow {
            ring: [0.0; MAX_HISTORY],
            sorted: Vec::with_capacity(MAX_HISTORY),
            cursor: 0,
        }
    }

    /// Record a sample and return its priority bonus: +1 for the top third,
    /// +2 more for the top sixth.
    fn record(&mut self, sample: f64) -> i32 {
        if self.cursor >= MAX_HISTORY {
            let expired = self.ring[self.cursor % MAX_HISTORY];
            let at = self.sorted.partition_point(|&x| x > expired);
            debug_assert!(self.sorted[at] == expired);
            self.sorted.remove(at);
        }
        self.ring[self.cursor % MAX_HISTORY] = sample;
        self.cursor += 1;
        let at = self.sorted.partition_point(|&x| x > sample);
        self.sorted.insert(at, sample);

        let count = self.sorted.len();
        let mut bonus = 0;
        if count > 3 && sample >= self.sorted[count / 3] {
            bonus += 1;
            if count > 6 && sample >= self.sorted[count / 6] {
                bonus += 2;
            }
        }
        bonus
    }
}

/// Ranks addresses by observed throughput: sockets that deliver above the
/// recent top-third mark promote their address, so the slow member of a
/// round-robin record set stops being chosen.
pub struct ThroughputCache {
    inner: DnsCache,
    window: ThroughputWindow,
    started: HashMap<RawFd, Instant>,
}

impl ThroughputCache {
    pub fn new() -> Self {
        ThroughputCache {
            inner: DnsCache::new(),
            window: ThroughputWindow::new(),
            started: HashMap::new(),
        }
    }
}

impl Default for ThroughputCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for ThroughputCache {
    fn resolve(&mut self, hostname: &str, port: u16, tls: bool) -> Result<Box<SocketEntry>> {
        self.inner.resolve(hostname, port, tls)
    }

    fn start_socket(&mut self, fd: RawFd) {
        self.started.insert(fd, Instant::now());
    }

    fn stop_socket(
        &mut self,
        mut entry: Box<SocketEntry>,
        bytes: u64,
        cached_entries: usize,
        reuse: bool,
    ) {
        self.record(&mut entry, bytes);
        self.inner.stop_socket(entry, bytes, cached_entries, reuse);
    }

    fn shutdown_socket(&mut self, mut entry: Box<SocketEntry>, bytes: u64) {
        self.record(&mut entry, bytes);
        self.inner.shutdown_socket(entry, bytes);
    }
}

impl ThroughputCache {
    fn record(&mut self, entry: &mut SocketEntry, bytes: u64) {
        let Some(begin) = self.started.remove(&entry.fd()) else {
            return;
        };
        let elapsed = begin.elapsed().as_secs_f64();
        if elapsed <= 0.0 || bytes == 0 {
            return;
        }
        let throughput = bytes as f64 / elapsed;
        let bonus = self.window.record(throughput);
        if bonus > 0 {
            entry.dns.cache_priority += bonus;
            tracing::trace!(
                addr = %entry.dns.addr,
                throughput,
                bonus,
                priority = entry.dns.cache_priority,
                "throughput promotion"
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn local_entry(hostname: &str, port: u16, priority: i32) -> Box<SocketEntry> {
        Box::new(SocketEntry {
            dns: DnsEntry {
                addr: SocketAddr::from(([127, 0, 0, 1], port)),
                cache_priority: priority,
            },
            socket: Some(
                Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap(),
            ),
            tls: None,
            hostname: hostname.to_string(),
            port,
            timestamp: 0,
        })
    }

    #[test]
    fn tld_of_domains() {
        assert_eq!(tld("bucket.s3.amazonaws.com"), "amazonaws.com");
        assert_eq!(tld("amazonaws.com"), "amazonaws.com");
        assert_eq!(tld("localhost"), "");
    }

    #[test]
    fn pool_hit_decrements_priority_and_matches_port_and_tls() {
        let mut cache = DnsCache::new();
        cache.pool_park(local_entry("h", 9000, 4), 16);
        assert!(cache.pool_take("h", 9001, false).is_none(), "port differs");
        assert!(cache.pool_take("h", 9000, true).is_none(), "tls differs");
        let entry = cache.pool_take("h", 9000, false).unwrap();
        assert_eq!(entry.dns.cache_priority, 3);
        assert!(cache.pool_take("h", 9000, false).is_none(), "pool emptied");
    }

    #[test]
    fn drained_entries_evict_on_next_consult() {
        let mut cache = DnsCache::new();
        cache.pool_park(local_entry("h", 9000, 0), 16);
        assert!(cache.pool_take("h", 9000, false).is_none());
        assert!(cache.fifo.is_empty());
    }

    #[test]
    fn pool_cap_closes_oldest() {
        let mut cache = DnsCache::new();
        for port in 0..4 {
            cache.pool_park(local_entry("h", 9000 + port, 4), 2);
        }
        assert_eq!(cache.fifo.len(), 2);
        assert!(cache.pool_take("h", 9000, false).is_none(), "oldest gone");
        assert!(cache.pool_take("h", 9003, false).is_some(), "newest kept");
    }

    #[test]
    fn peer_invalidation_zeroes_priority() {
        let mut cache = DnsCache::new();
        cache.pool_park(local_entry("a", 9000, 5), 16);
        cache.pool_park(local_entry("b", 9001, 5), 16);
        let broken = local_entry("c", 9002, 5);
        cache.invalidate_peer(&broken.dns.addr);
        assert!(cache.pool_take("a", 9000, false).is_none());
        assert!(cache.pool_take("b", 9001, false).is_none());
    }

    #[test]
    fn throughput_window_promotes_top_samples() {
        let mut window = ThroughputWindow::new();
        // Too few samples: never a bonus.
        assert_eq!(window.record(100.0), 0);
        assert_eq!(window.record(200.0), 0);
        assert_eq!(window.record(300.0), 0);
        // Mid-range sample against 3 existing ones.
        for i in 0..10 {
            window.record(10.0 + i as f64);
        }
        assert_eq!(window.record(1.0), 0, "slow sample earns nothing");
        assert_eq!(window.record(10_000.0), 3, "fast sample earns both tiers");
    }

    #[test]
    fn throughput_window_expires_old_samples() {
        let mut window = ThroughputWindow::new();
        for _ in 0..MAX_HISTORY {
            window.record(1_000_000.0);
        }
        // The old fast samples cycle out; slow ones take over the window.
        for _ in 0..MAX_HISTORY {
            window.record(1.0);
        }
        assert_eq!(window.sorted.len(), MAX_HISTORY);
        assert_eq!(window.sorted[0], 1.0, "fast samples fully expired");
    }
}

use std::collections::HashMap;
use std::net::IpAddr;
use std::os::unix::io::RawFd;

use blobnet::resolver::{tld, Cache, DnsCache, SocketEntry};
use blobnet::Result;

/// Resolver policy for AWS endpoints: resolved addresses are probed once
/// for a jumbo-frame-friendly path and, when the probe passes, pinned at
/// maximum priority.
pub struct AwsCache {
    inner: DnsCache,
    /// Per-IP probe results; a path's MTU does not change often.
    mtu_cache: HashMap<IpAddr, bool>,
}

impl AwsCache {
    pub fn new() -> Self {
        AwsCache {
            inner: DnsCache::new(),
            mtu_cache: HashMap::new(),
        }
    }
}

impl Default for AwsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for AwsCache {
    fn resolve(&mut self, hostname: &str, port: u16, tls: bool) -> Result<Box<SocketEntry>> {
        if let Some(entry) = self.inner.pool_take(hostname, port, tls) {
            return Ok(entry);
        }
        let mut entry = self.inner.fresh_entry(hostname, port)?;
        if tld(hostname) == "amazonaws.com" {
            let ip = entry.dns.addr.ip();
            let friendly = *self
                .mtu_cache
                .entry(ip)
                .or_insert_with(|| probe_jumbo_path(ip));
            if friendly {
                entry.dns.cache_priority = i32::MAX;
                tracing::debug!(%ip, hostname, "jumbo-frame path, pinning address");
            }
        }
        Ok(entry)
    }

    fn start_socket(&mut self, fd: RawFd) {
        self.inner.start_socket(fd);
    }

    fn stop_socket(
        &mut self,
        entry: Box<SocketEntry>,
        bytes: u64,
        cached_entries: usize,
        reuse: bool,
    ) {
        self.inner.stop_socket(entry, bytes, cached_entries, reuse);
    }

    fn shutdown_socket(&mut self, entry: Box<SocketEntry>, bytes: u64) {
        self.inner.shutdown_socket(entry, bytes);
    }
}

/// Explicit path-MTU probe: send a 1473-byte datagram with the DF bit set.
/// EMSGSIZE from the stack means the path tops out at the standard 1500
/// MTU; acceptance suggests jumbo frames fit.
#[cfg(target_os = "linux")]
fn probe_jumbo_path(ip: IpAddr) -> bool {
    use std::os::unix::io::AsRawFd;

    let IpAddr::V4(_) = ip else {
        return false;
    };
    let Ok(socket) = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    ) else {
        return false;
    };

    let dont_fragment: libc::c_int = libc::IP_PMTUDISC_DO;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            &dont_fragment as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return false;
    }

    // An unanswered discard-style port; only the local send matters.
    let target = std::net::SocketAddr::new(ip, 33434);
    if socket.connect(&target.into()).is_err() {
        return false;
    }
    let payload = [0u8; 1473];
    match socket.send(&payload) {
        Ok(_) => true,
        Err(err) => err.raw_os_error() != Some(libc::EMSGSIZE),
    }
}

#[cfg(not(target_os = "linux"))]
fn probe_jumbo_path(_ip: IpAddr) -> bool {
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn non_aws_hosts_skip_the_probe() {
        let mut cache = AwsCache::new();
        let entry = cache.resolve("localhost", 80, false).unwrap();
        assert_eq!(entry.dns.cache_priority, DnsCache::DEFAULT_PRIORITY);
        assert!(cache.mtu_cache.is_empty());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn loopback_probe_is_memoized() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let mut cache = AwsCache::new();
        cache.mtu_cache.insert(ip, true);
        // A second consult must not re-probe; the memo stands.
        assert_eq!(cache.mtu_cache.get(&ip), Some(&true));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn jumbo_probe_runs_against_loopback() {
        // Loopback has a 64 KiB MTU: the DF probe must pass.
        assert!(probe_jumbo_path("127.0.0.1".parse().unwrap()));
    }
}

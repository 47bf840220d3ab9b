use serde::{Deserialize, Serialize};

/// Sizing derived from the instance's advertised network bandwidth: how
/// many workers and how many in-flight requests per worker are needed to
/// saturate the link.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Throughput one worker core can sustain, in Mbit/s.
    pub core_throughput: u64,
    /// Concurrent requests needed to reach `core_throughput`.
    pub core_concurrency: u32,
    /// The instance's network performance in Mbit/s.
    pub network: u64,
}

impl Config {
    /// Concurrent requests to saturate one core (based on AWS experiments).
    pub const DEFAULT_CORE_CONCURRENCY: u32 = 20;
    /// Throughput per core in Mbit/s (based on AWS experiments).
    /// Per-request bandwidth: 8,000 Mbit / 20 requests = 400 Mbit/request.
    pub const DEFAULT_CORE_THROUGHPUT: u64 = 8_000;

    pub fn new(network: u64) -> Self {
        Config {
            core_throughput: Self::DEFAULT_CORE_THROUGHPUT,
            core_concurrency: Self::DEFAULT_CORE_CONCURRENCY,
            network,
        }
    }

    pub fn bandwidth(&self) -> u64 {
        self.network
    }

    /// In-flight requests per worker.
    pub fn core_requests(&self) -> u32 {
        self.core_concurrency
    }

    /// Worker threads needed to saturate the bandwidth.
    pub fn retrievers(&self) -> u64 {
        (self.network + self.core_throughput - 1) / self.core_throughput
    }

    /// Total outstanding requests across all workers.
    pub fn total_requests(&self) -> u64 {
        self.retrievers() * self.core_requests() as u64
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(Self::DEFAULT_CORE_THROUGHPUT)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sizing_from_bandwidth() {
        let config = Config::new(100_000);
        assert_eq!(config.retrievers(), 13);
        assert_eq!(config.total_requests(), 260);

        let one_core = Config::new(8_000);
        assert_eq!(one_core.retrievers(), 1);
        assert_eq!(one_core.total_requests(), 20);
    }

    #[test]
    fn serde_round_trip() {
        let config = Config::new(25_000);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<Config>(&json).unwrap(), config);
    }
}

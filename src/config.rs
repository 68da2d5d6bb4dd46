//! Core configuration consumed by the adapter and the prefetcher.

use std::time::Duration;

use serde::Deserialize;

/// Freshness window for cached capability results when a call site does not
/// supply its own.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Disables background prefetching entirely. Useful for backends where
    /// the extra speculative load is undesirable.
    pub slow: bool,
    /// Freshness window for cached listings and metadata.
    pub ttl: Duration,
    /// How long a prefetched file handle is held open before being dropped.
    pub hold_open: Duration,
    /// Number of background prefetch workers.
    pub prefetch_workers: usize,
    /// Queue depth for pending prefetch jobs; jobs past it are dropped.
    pub prefetch_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slow: false,
            ttl: DEFAULT_TTL,
            hold_open: DEFAULT_TTL,
            prefetch_workers: 4,
            prefetch_queue: 256,
        }
    }
}

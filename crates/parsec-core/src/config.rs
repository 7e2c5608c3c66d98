//! Core configuration (spec §5/§9 ambient concerns), modeled on the
//! teacher's `settings::GuardSettings`: a plain `Default`-derived struct
//! persisted as JSON.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Default block size for new files (spec §3 `FileManifest.blocksize`).
    pub default_blocksize: u64,
    /// Byte budget for the clean block cache before LRU eviction kicks in
    /// (spec §4.1).
    pub clean_cache_max_bytes: u64,
    /// Debounce window for the sync monitor collapsing bursts of
    /// `fs.entry.updated` events into one `sync_by_id` call (spec §4.8).
    pub sync_debounce_ms: u64,
    /// Per-RPC timeout against the realm service (spec §5 "Timeouts").
    pub rpc_timeout_ms: u64,
    /// Reconnection backoff floor/cap (spec §5 "exponential backoff with a
    /// cap").
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Message monitor poll interval (spec §4.3/§4.8).
    pub message_poll_interval_ms: u64,
    /// Backend connection monitor heartbeat interval (spec §4.8).
    pub heartbeat_interval_ms: u64,
    /// Maximum vlobs fetched per reencryption batch (spec §4.7, hard
    /// ceiling of 1000 regardless of config).
    pub reencryption_batch_size: u32,
    /// Bound on the per-subscriber event bus queue (spec §5 "bounded;
    /// slow subscribers drop oldest with a logged warning").
    pub event_bus_queue_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_blocksize: 512 * 1024,
            clean_cache_max_bytes: 512 * 1024 * 1024,
            sync_debounce_ms: 100,
            rpc_timeout_ms: 30_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 60_000,
            message_poll_interval_ms: 15_000,
            heartbeat_interval_ms: 30_000,
            reencryption_batch_size: 1000,
            event_bus_queue_size: 1024,
        }
    }
}

impl CoreConfig {
    pub fn reencryption_batch_size(&self) -> u32 {
        self.reencryption_batch_size.min(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reencryption_batch_is_capped_at_1000() {
        let mut c = CoreConfig::default();
        c.reencryption_batch_size = 5000;
        assert_eq!(c.reencryption_batch_size(), 1000);
    }
}

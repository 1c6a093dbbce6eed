//! Cache configuration (spec §6 "Configuration (enumerated options)").
//!
//! Loaded from a TOML file via `serde` + `toml`, with `clap` available for a
//! CLI-override layer on top of the file-sourced defaults.

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Every field name matches spec §6's table, snake_case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of index partitions. Should be small and odd (spec §4.3).
    pub nparts: usize,
    /// MRU slots per partition (spec §4.3).
    pub cache_entry_count: usize,
    /// Entry-count high water; triggers `reap()` on a cache miss (spec §4.4).
    pub entries_hwmark: u64,
    /// Descriptor high water, as a fraction of the system rlimit.
    pub fd_hwmark_percent: f32,
    /// Descriptor low water, as a fraction of the system rlimit.
    pub fd_lwmark_percent: f32,
    /// Hard descriptor limit, as a fraction of the system rlimit.
    pub fd_limit_percent: f32,
    /// Whether to hold descriptors open past use at all.
    pub use_fd_cache: bool,
    /// Max entries scanned per lane, per reclaimer pass (spec §4.4 `per_lane_work`).
    pub reaper_work: u32,
    /// Max total work per wake when in extremis (spec §4.4 `biggest_window`).
    pub biggest_window: u32,
    /// Percent progress required toward the watermark to avoid a futility increment.
    pub required_progress: u32,
    /// Consecutive futile passes before disabling descriptor caching.
    pub futility_count: u32,
    /// Base sleep of the reclaimer thread, in seconds.
    pub lru_run_interval_secs: u64,
    /// On a short readdir, surface a retry error instead of marking `DIR_POPULATED`.
    pub retry_readdir: bool,
    /// Default attribute TTL, in seconds.
    pub expire_time_attr_secs: u64,
    /// Number of LRU lanes. Spec §4.4: "a small prime roughly equal to
    /// `nparts` or a small multiple".
    pub lanes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            nparts: 7,
            cache_entry_count: 32,
            entries_hwmark: 100_000,
            fd_hwmark_percent: 0.90,
            fd_lwmark_percent: 0.50,
            fd_limit_percent: 0.99,
            use_fd_cache: true,
            reaper_work: 50,
            biggest_window: 200,
            required_progress: 5,
            futility_count: 8,
            lru_run_interval_secs: 90,
            retry_readdir: false,
            expire_time_attr_secs: 60,
            lanes: 7,
        }
    }
}

impl CacheConfig {
    /// Parse a TOML configuration file, as `clap`-driven binaries built on
    /// this crate are expected to do at startup.
    pub fn from_toml_str(text: &str) -> Result<Self, CacheError> {
        toml::from_str(text).map_err(|_| CacheError::InitFailed("invalid configuration TOML"))
    }

    /// Reject watermark combinations that would make the reclaimer either
    /// never fire or never stop (spec §4.4's low/high-water relationship).
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.nparts == 0 {
            return Err(CacheError::InitFailed("nparts must be nonzero"));
        }
        if self.lanes == 0 {
            return Err(CacheError::InitFailed("lanes must be nonzero"));
        }
        if !(0.0..=1.0).contains(&self.fd_lwmark_percent)
            || !(0.0..=1.0).contains(&self.fd_hwmark_percent)
            || !(0.0..=1.0).contains(&self.fd_limit_percent)
        {
            return Err(CacheError::InitFailed("fd watermark percentages must be in 0..=1"));
        }
        if self.fd_lwmark_percent >= self.fd_hwmark_percent {
            return Err(CacheError::InitFailed("fd_lwmark_percent must be < fd_hwmark_percent"));
        }
        if self.fd_hwmark_percent > self.fd_limit_percent {
            return Err(CacheError::InitFailed("fd_hwmark_percent must be <= fd_limit_percent"));
        }
        if self.futility_count == 0 {
            return Err(CacheError::InitFailed("futility_count must be nonzero"));
        }
        Ok(())
    }
}

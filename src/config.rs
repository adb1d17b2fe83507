//! Centralized configuration for quiverfs.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - Config::from_env() reads QFS_* variables; builder-style overrides on top.
//!
//! Durability-oriented defaults:
//! - data_fsync = true (fsync database file on every applied transaction).
//! - retain_ltx = 16 (компактация префикса, когда записей в ltx/ больше).
//!   All of the above can be overridden via ENV or setters.

use std::fmt;

/// Top-level configuration for a quiverfs Store.
#[derive(Clone, Debug)]
pub struct Config {
    /// Whether to fsync the database file after applying a transaction.
    /// Env: QFS_DATA_FSYNC (default true; "0|false|off|no" => false)
    pub data_fsync: bool,

    /// How many delta records to keep before the background thread compacts
    /// the prefix into a single record. 0 disables compaction.
    /// Env: QFS_RETAIN_LTX (default 16)
    pub retain_ltx: usize,

    /// Interval of the background compaction sweep, seconds. 0 disables
    /// the thread entirely.
    /// Env: QFS_COMPACT_INTERVAL_SECS (default 60)
    pub compact_interval_secs: u64,

    /// Backoff between lease/stream attempts in the monitor loop, ms.
    /// Env: QFS_LEASE_BACKOFF_MS (default 1000)
    pub lease_backoff_ms: u64,

    /// Log every FUSE request at debug level.
    /// Env: QFS_FUSE_DEBUG (default false)
    pub fuse_debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_fsync: true,
            retain_ltx: 16,
            compact_interval_secs: 60,
            lease_backoff_ms: 1000,
            fuse_debug: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("QFS_DATA_FSYNC") {
            let s = v.trim().to_ascii_lowercase();
            cfg.data_fsync = !(s == "0" || s == "false" || s == "off" || s == "no");
        }
        if let Ok(v) = std::env::var("QFS_RETAIN_LTX") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.retain_ltx = n;
            }
        }
        if let Ok(v) = std::env::var("QFS_COMPACT_INTERVAL_SECS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.compact_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("QFS_LEASE_BACKOFF_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.lease_backoff_ms = n;
            }
        }
        if let Ok(v) = std::env::var("QFS_FUSE_DEBUG") {
            let s = v.trim().to_ascii_lowercase();
            cfg.fuse_debug = s == "1" || s == "true" || s == "on" || s == "yes";
        }

        cfg
    }

    /// Fluent setters (builder-style) to override specific fields.

    pub fn with_data_fsync(mut self, on: bool) -> Self {
        self.data_fsync = on;
        self
    }

    pub fn with_retain_ltx(mut self, n: usize) -> Self {
        self.retain_ltx = n;
        self
    }

    pub fn with_compact_interval_secs(mut self, secs: u64) -> Self {
        self.compact_interval_secs = secs;
        self
    }

    pub fn with_lease_backoff_ms(mut self, ms: u64) -> Self {
        self.lease_backoff_ms = ms;
        self
    }

    pub fn with_fuse_debug(mut self, on: bool) -> Self {
        self.fuse_debug = on;
        self
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Config {{ data_fsync: {}, retain_ltx: {}, compact_interval_secs: {}, \
             lease_backoff_ms: {}, fuse_debug: {} }}",
            self.data_fsync,
            self.retain_ltx,
            self.compact_interval_secs,
            self.lease_backoff_ms,
            self.fuse_debug,
        )
    }
}

//! Runtime configuration. A small struct with a `Default` impl and
//! optional environment-variable overrides, the same weight the teacher
//! crate gives `WriteConfig` — not a config-file layer, which nothing this
//! size in the corpus reaches for.

use std::env;

use crate::constants::DBS_EXTENT_BATCH;

#[derive(Debug, Clone)]
pub struct DbsConfig {
    /// How many extent records are read/written per batch scan.
    pub extent_batch: usize,
    /// Call `sync_data()` at each write-ordering barrier described in the
    /// concurrency section. Disabling this is only useful for throwaway
    /// test devices; production use should leave it on.
    pub fsync_barriers: bool,
    /// Take the advisory exclusive `flock()` on open/init. `flock()` is
    /// scoped per open-file-description, so a second `DeviceContext` on the
    /// same path from the *same process* is denied exactly like a second
    /// process would be; callers that intentionally hold more than one
    /// `DeviceContext` on a path within one process (tests, or a caller
    /// that already serializes access itself) disable this.
    pub advisory_lock: bool,
}

impl Default for DbsConfig {
    fn default() -> Self {
        Self {
            extent_batch: DBS_EXTENT_BATCH,
            fsync_barriers: true,
            advisory_lock: true,
        }
    }
}

impl DbsConfig {
    /// Load overrides from the environment: `DBS_EXTENT_BATCH`,
    /// `DBS_FSYNC_BARRIERS` and `DBS_ADVISORY_LOCK` (`0`/`false` disables).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = env::var("DBS_EXTENT_BATCH") {
            if let Ok(value) = raw.parse() {
                config.extent_batch = value;
            }
        }
        if let Ok(raw) = env::var("DBS_FSYNC_BARRIERS") {
            config.fsync_barriers = !matches!(raw.as_str(), "0" | "false");
        }
        if let Ok(raw) = env::var("DBS_ADVISORY_LOCK") {
            config.advisory_lock = !matches!(raw.as_str(), "0" | "false");
        }
        config
    }
}

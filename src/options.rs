//! Engine options
//!
//! A snapshot copied once at initialization. The worker keeps reading it
//! after the host has torn down its own configuration during shutdown, so
//! nothing in here is shared with the host after `Engine::init`.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default permitted number of units with loaded code
pub const DEFAULT_CACHE_SIZE: usize = 1000;
/// Default call count before a method is queued
pub const DEFAULT_MIN_CALLS_TO_ADD: u64 = 5;
/// Minimum value for the cache size
pub const MIN_CACHE_SIZE: usize = 10;
/// How long the synchronous wait gives the worker
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Sleep between polls of the synchronous wait and pause drain
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration of the JIT engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Number of calls before a method body is queued for compilation
    pub min_calls: u64,
    /// Maximum number of units with loaded native code
    pub max_cache_size: usize,
    /// Verbosity level (0 = quiet)
    pub verbose: u8,
    /// Emit warnings even when not verbose
    pub warnings: bool,
    /// Keep temporary artifacts on shutdown
    pub save_temps: bool,
    /// Block call sites until their method is compiled
    pub wait: bool,
    /// Ceiling of the synchronous wait
    #[serde(with = "duration_ms")]
    pub wait_timeout: Duration,
    /// Poll interval of the synchronous wait and of `pause(wait)`
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Header included by generated code; must be readable when set
    pub header_path: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            min_calls: DEFAULT_MIN_CALLS_TO_ADD,
            max_cache_size: DEFAULT_CACHE_SIZE,
            verbose: 0,
            warnings: false,
            save_temps: false,
            wait: false,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            header_path: None,
        }
    }
}

impl EngineOptions {
    /// Replace unset or out-of-range values with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.min_calls == 0 {
            self.min_calls = DEFAULT_MIN_CALLS_TO_ADD;
        }
        if self.max_cache_size == 0 {
            self.max_cache_size = DEFAULT_CACHE_SIZE;
        }
        if self.max_cache_size < MIN_CACHE_SIZE {
            self.max_cache_size = MIN_CACHE_SIZE;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        self
    }

    /// Parse options from a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load options from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Whether timeout warnings should be printed
    pub fn warnings_enabled(&self) -> bool {
        self.warnings || self.verbose > 0
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

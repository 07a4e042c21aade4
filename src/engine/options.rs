#![forbid(unsafe_code)]

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{Result, UfoError};

/// Tuning knobs for an [`Instance`](crate::engine::Instance).
///
/// Every field has a default, so a TOML document only needs the keys it
/// wants to change:
///
/// ```toml
/// ring_capacity = 4096
/// high_water_mark_bytes = 1073741824
/// low_water_mark_bytes = 536870912
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceOptions {
    /// Initial slots in the eviction ring.
    pub ring_capacity: usize,
    /// Whether a full ring doubles instead of failing the fault.
    pub ring_growable: bool,
    /// Pages preallocated for the population scratch buffer.
    pub initial_scratch_pages: usize,
    /// Bounded wait between readiness checks.
    pub poll_timeout_ms: u64,
    /// Interrupted waits tolerated in a row before the worker gives up.
    pub max_consecutive_interrupts: u32,
    /// Worker threads requested. Only one worker is run per instance.
    pub concurrency: usize,
    /// Resident bytes above which eviction starts. Requires the low mark.
    pub high_water_mark_bytes: Option<usize>,
    /// Resident bytes eviction brings usage down to.
    pub low_water_mark_bytes: Option<usize>,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            ring_capacity: 1024,
            ring_growable: true,
            initial_scratch_pages: 20,
            poll_timeout_ms: 200,
            max_consecutive_interrupts: 3,
            concurrency: 1,
            high_water_mark_bytes: None,
            low_water_mark_bytes: None,
        }
    }
}

impl InstanceOptions {
    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let opts: Self =
            toml::from_str(text).map_err(|err| UfoError::InvalidOptions(err.to_string()))?;
        Ok(opts.normalize())
    }

    /// Reads and parses a TOML options file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Clamps zero values to their smallest usable setting.
    pub fn normalize(mut self) -> Self {
        if self.ring_capacity == 0 {
            self.ring_capacity = 1;
        }
        if self.initial_scratch_pages == 0 {
            self.initial_scratch_pages = 1;
        }
        if self.poll_timeout_ms == 0 {
            self.poll_timeout_ms = 1;
        }
        if self.concurrency == 0 {
            self.concurrency = 1;
        }
        self
    }

    /// [`InstanceOptions::poll_timeout_ms`] as a duration.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Water marks given in the options, if both are present.
    pub fn memory_limits(&self) -> Result<Option<MemoryLimits>> {
        match (self.high_water_mark_bytes, self.low_water_mark_bytes) {
            (Some(high), Some(low)) => MemoryLimits::new(high, low).map(Some),
            (None, None) => Ok(None),
            _ => Err(UfoError::InvalidOptions(
                "high_water_mark_bytes and low_water_mark_bytes must be set together".into(),
            )),
        }
    }
}

/// Resident-memory budget for populated chunks.
///
/// Eviction starts when a fault would push usage above `high` and stops
/// once the incoming chunk fits under `low`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryLimits {
    /// High water mark in bytes.
    pub high: usize,
    /// Low water mark in bytes.
    pub low: usize,
}

impl MemoryLimits {
    /// Validates that `high` exceeds `low`.
    pub fn new(high: usize, low: usize) -> Result<Self> {
        if high <= low {
            return Err(UfoError::InvalidConfig(
                "high water mark must exceed low water mark",
            ));
        }
        Ok(Self { high, low })
    }
}

//! Hole punching configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_DIRECT_DIAL_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_STREAM_TIMEOUT};

/// Hole punching configuration (TOML-serializable).
///
/// Runtime collaborators (listen address source, address filter, tracer) are
/// supplied through [`HolePuncherBuilder`](crate::HolePuncherBuilder).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HolePunchConfig {
    /// Timeout in milliseconds for the opportunistic direct dial and for each
    /// timed connect attempt.
    pub direct_dial_timeout_ms: u64,

    /// Deadline in milliseconds for a whole rendezvous exchange.
    pub stream_timeout_ms: u64,

    /// Number of rendezvous + timed connect rounds before giving up.
    pub max_retries: u32,

    /// Keep the client/server role assignment deployed peers expect.
    ///
    /// Older peers picked the opposite roles for the timed connect: the
    /// initiator of the rendezvous acted as server. Disabling this makes the
    /// initiator the client.
    pub legacy_role_behavior: bool,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        Self {
            direct_dial_timeout_ms: millis(DEFAULT_DIRECT_DIAL_TIMEOUT),
            stream_timeout_ms: millis(DEFAULT_STREAM_TIMEOUT),
            max_retries: DEFAULT_MAX_RETRIES,
            legacy_role_behavior: true,
        }
    }
}

impl HolePunchConfig {
    pub fn with_direct_dial_timeout(mut self, timeout: Duration) -> Self {
        self.direct_dial_timeout_ms = millis(timeout);
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout_ms = millis(timeout);
        self
    }

    /// Set the number of punch rounds. Zero is treated as one.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_legacy_role_behavior(mut self, legacy: bool) -> Self {
        self.legacy_role_behavior = legacy;
        self
    }

    pub fn direct_dial_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_dial_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    /// Number of punch rounds, at least one.
    pub fn max_retries(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

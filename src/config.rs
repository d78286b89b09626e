//! Engine configuration.
//!
//! All values are whole seconds so they can be written by hand in a JSON
//! config file. Missing fields fall back to the defaults below.

use std::time::Duration;

use serde::Deserialize;

/// Marbles handed to every seated participant.
pub const DEFAULT_STARTING_MARBLES: u32 = 10;

/// How long a disconnected participant still counts as in the game.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 15;

/// How long the result screen stays up before the round advances.
pub const DEFAULT_RESULT_COOLDOWN_SECS: u64 = 5;

/// Keepalive cadence on each push stream.
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 5;

/// Display names longer than this are cut.
pub const DEFAULT_MAX_NAME_LEN: usize = 24;

/// Registry sweep cadence (15 minutes).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 15 * 60;

/// Finished sessions idle longer than this are swept (1 hour).
pub const DEFAULT_FINISHED_TTL_SECS: u64 = 60 * 60;

/// Any session idle longer than this is swept (4 hours).
pub const DEFAULT_IDLE_TTL_SECS: u64 = 4 * 60 * 60;

/// Per-session tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub starting_marbles: u32,
    pub grace_period_secs: u64,
    pub result_cooldown_secs: u64,
    pub keepalive_interval_secs: u64,
    pub max_name_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            starting_marbles: DEFAULT_STARTING_MARBLES,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            result_cooldown_secs: DEFAULT_RESULT_COOLDOWN_SECS,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            max_name_len: DEFAULT_MAX_NAME_LEN,
        }
    }
}

impl SessionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn result_cooldown(&self) -> Duration {
        Duration::from_secs(self.result_cooldown_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Registry lifecycle tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub sweep_interval_secs: u64,
    pub finished_ttl_secs: u64,
    pub idle_ttl_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            finished_ttl_secs: DEFAULT_FINISHED_TTL_SECS,
            idle_ttl_secs: DEFAULT_IDLE_TTL_SECS,
        }
    }
}

impl RegistryConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn finished_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.finished_ttl_secs as i64)
    }

    pub fn idle_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_ttl_secs as i64)
    }
}

/// Combined configuration, as loaded from a config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub session: SessionConfig,
    pub registry: RegistryConfig,
}

impl EngineConfig {
    /// Parse a JSON config document. Absent keys keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

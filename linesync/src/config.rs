//! Session timing configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::presence::PALETTE_SIZE;

/// Per-session configuration.
///
/// Missing fields in a config file fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Snapshot poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Presence heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Quiet period before a burst of edits is saved
    pub save_debounce_ms: u64,
    /// How long after a save incoming snapshots are distrusted
    pub grace_period_ms: u64,
    /// Capacity of the session event channel
    pub event_capacity: usize,
    /// Number of author colors in use
    pub palette_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            heartbeat_interval_ms: 5000,
            save_debounce_ms: 500,
            grace_period_ms: 2000,
            event_capacity: 64,
            palette_size: PALETTE_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Reject values the timers cannot run with.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("save_debounce_ms", self.save_debounce_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(SyncError::Config(format!("{name} must be greater than zero")));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config("event_capacity must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

//! Clock configuration.

use crate::error::{ClockError, ClockResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for starting a [`SystemClock`](crate::SystemClock).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Seconds between wire-offset resyncs.
    pub resync_interval_secs: f64,
    /// Bracketed samples taken per resync; the tightest bracket wins.
    pub sync_attempts: u32,
    /// Name of the run-loop thread. The resync thread appends `-resync`.
    pub thread_name: String,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: 20.0,
            sync_attempts: 1,
            thread_name: "system-clock".to_string(),
        }
    }
}

impl ClockConfig {
    pub fn from_toml_str(s: &str) -> ClockResult<Self> {
        let config: ClockConfig =
            toml::from_str(s).map_err(|e| ClockError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ClockResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClockError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> ClockResult<()> {
        if !self.resync_interval_secs.is_finite() || self.resync_interval_secs <= 0.0 {
            return Err(ClockError::Config(format!(
                "resync_interval_secs must be positive and finite, got {}",
                self.resync_interval_secs
            )));
        }
        if Duration::try_from_secs_f64(self.resync_interval_secs).is_err() {
            return Err(ClockError::Config(format!(
                "resync_interval_secs is too large, got {}",
                self.resync_interval_secs
            )));
        }
        if self.sync_attempts == 0 {
            return Err(ClockError::Config(
                "sync_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The resync interval, saturating for values `validate` would reject.
    pub fn resync_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.resync_interval_secs).unwrap_or(Duration::MAX)
    }
}

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default time to wait for a reply. Long enough for slow motion commands
/// such as a full-length `drive_distance`.
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 30_000;

/// Runtime settings for a [`Robot`](crate::Robot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// How long a request waits for its reply. `None` waits forever.
    pub reply_timeout_ms: Option<u64>,
    /// Frequency of A4 used when converting note names.
    pub reference_pitch_hz: f64,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: Some(DEFAULT_REPLY_TIMEOUT_MS),
            reference_pitch_hz: 440.0,
        }
    }
}

impl RobotConfig {
    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

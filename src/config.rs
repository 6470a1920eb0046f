//! Manager tunables.
//!
//! Timeouts and the per-uid quota are injected configuration rather than
//! constants.  Firmware queue depth and session limits are not here: they
//! come from the HAL capability query.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    // --- Timeouts ---
    /// Deadline for any HAL command response (ms).
    pub command_timeout_ms: u64,
    /// Deadline for a follow-up message, re-armed per transmission attempt (ms).
    pub send_message_timeout_ms: u64,

    // --- Messaging ---
    /// Host plus firmware queue occupancy allowed per uid.
    pub max_queued_messages_per_uid: usize,
    /// Largest `retry_count` a send request may ask for.
    pub max_send_retries: u8,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5_000,
            send_message_timeout_ms: 10_000,
            max_queued_messages_per_uid: 50,
            max_send_retries: 5,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Tunable("command_timeout_ms must be non-zero"));
        }
        if self.send_message_timeout_ms == 0 {
            return Err(ConfigError::Tunable("send_message_timeout_ms must be non-zero"));
        }
        if self.max_queued_messages_per_uid == 0 {
            return Err(ConfigError::Tunable("max_queued_messages_per_uid must be non-zero"));
        }
        Ok(())
    }

    /// Read a JSON config file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }
}

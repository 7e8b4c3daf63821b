use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

use crate::{HubError, HubResult};

/// Hub configuration
///
/// Durations are stored as plain integers so the whole struct can be filled
/// from `ROOMCAST_*` environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubConfig {
    /// Capacity of each session's outbound queue, fixed at session creation
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Capacity of the hub's intake channel
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,

    /// Interval between liveness pings sent by a session's write pump
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// A session that has not answered a ping within this window is dropped
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,

    /// Period of the hub's sweep tick
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// How long an emptied room's state is kept for a later rejoin
    #[serde(default = "default_room_retention_secs")]
    pub room_retention_secs: u64,

    /// Maximum number of history entries replayed to a joining session
    #[serde(default = "default_history_replay_limit")]
    pub history_replay_limit: usize,
}

fn default_outbound_capacity() -> usize {
    64
}

fn default_intake_capacity() -> usize {
    1024
}

fn default_ping_interval_ms() -> u64 {
    25_000
}

fn default_liveness_timeout_ms() -> u64 {
    60_000
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_room_retention_secs() -> u64 {
    300
}

fn default_history_replay_limit() -> usize {
    50
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            intake_capacity: default_intake_capacity(),
            ping_interval_ms: default_ping_interval_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            room_retention_secs: default_room_retention_secs(),
            history_replay_limit: default_history_replay_limit(),
        }
    }
}

impl HubConfig {
    /// Load configuration from `ROOMCAST_*` environment variables
    ///
    /// Missing variables fall back to their defaults.
    pub fn from_env() -> HubResult<Self> {
        match envy::prefixed("ROOMCAST_").from_env::<HubConfig>() {
            Ok(config) => {
                config.validate()?;
                info!("Hub configuration loaded: {:?}", config);
                Ok(config)
            }
            Err(e) => {
                error!("Failed to load hub configuration: {}", e);
                Err(HubError::Env(e))
            }
        }
    }

    /// Reject values the hub cannot run with
    pub fn validate(&self) -> HubResult<()> {
        if self.outbound_capacity == 0 {
            return Err(HubError::Config(
                "outbound_capacity must be greater than zero".to_string(),
            ));
        }
        if self.intake_capacity == 0 {
            return Err(HubError::Config(
                "intake_capacity must be greater than zero".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 || self.ping_interval_ms == 0 {
            return Err(HubError::Config(
                "tick and ping intervals must be greater than zero".to_string(),
            ));
        }
        if self.ping_interval_ms >= self.liveness_timeout_ms {
            return Err(HubError::Config(format!(
                "ping_interval_ms ({}) must be shorter than liveness_timeout_ms ({})",
                self.ping_interval_ms, self.liveness_timeout_ms
            )));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn room_retention(&self) -> Duration {
        Duration::from_secs(self.room_retention_secs)
    }
}

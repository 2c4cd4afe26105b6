use std::time::Duration;

use serde::{Deserialize, Serialize};

use routelens_core::{BucketClock, DEFAULT_DAILY_DIVISIONS, MINUTES_PER_DAY};
use routelens_engine::{AggregationConfig, ConfigError, RefreshConfig};

/// Recognized configuration surface. Timer settings are plain milliseconds
/// so the struct deserializes directly from embedder-provided JSON/TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub min_changes_to_update: u64,
    pub forced_update_timeout_ms: u64,
    pub cluster_refresh_period_ms: u64,
    pub daily_divisions: u32,
    pub clock: BucketClock,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            min_changes_to_update: 100,
            forced_update_timeout_ms: 5 * 60 * 1000,
            cluster_refresh_period_ms: 30 * 60 * 1000,
            daily_divisions: DEFAULT_DAILY_DIVISIONS,
            clock: BucketClock::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.aggregation().validate()?;
        self.refresh().validate()
    }

    pub fn granularity_minutes(&self) -> u32 {
        MINUTES_PER_DAY / self.daily_divisions
    }

    pub fn aggregation(&self) -> AggregationConfig {
        AggregationConfig {
            min_changes_to_update: self.min_changes_to_update,
            forced_update_timeout: Duration::from_millis(self.forced_update_timeout_ms),
            daily_divisions: self.daily_divisions,
            clock: self.clock,
        }
    }

    pub fn refresh(&self) -> RefreshConfig {
        RefreshConfig {
            refresh_period: Duration::from_millis(self.cluster_refresh_period_ms),
        }
    }
}

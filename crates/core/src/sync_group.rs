//! Sync group configuration
//!
//! A sync group is a named partition of world state with its own tick rate
//! and membership. The configuration lives in the store and is immutable
//! during normal operation; the server reloads it only on admin request.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-group replication parameters, as stored in `config.sync_groups`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncGroupConfig {
    /// Group identifier, e.g. `public.NORMAL`
    pub sync_group: String,

    /// Server tick interval in milliseconds
    pub tick_rate_ms: u32,

    /// Number of ticks retained before trimming
    pub max_ticks_buffer: u32,

    /// Client-side render delay in milliseconds
    pub render_delay_ms: u32,

    /// Maximum client prediction window in milliseconds
    pub max_prediction_ms: u32,

    /// Allowed packet timing variance in milliseconds
    pub packet_timing_variance_ms: u32,
}

impl SyncGroupConfig {
    /// Tick interval as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.tick_rate_ms))
    }

    /// Age past which ticks and their snapshots are trimmed.
    ///
    /// Retention is `max_ticks_buffer x tick_rate_ms`.
    pub fn retention_window(&self) -> Duration {
        Duration::from_millis(u64::from(self.max_ticks_buffer) * u64::from(self.tick_rate_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(rate_ms: u32, max_ticks: u32) -> SyncGroupConfig {
        SyncGroupConfig {
            sync_group: "public.NORMAL".to_string(),
            tick_rate_ms: rate_ms,
            max_ticks_buffer: max_ticks,
            render_delay_ms: 100,
            max_prediction_ms: 250,
            packet_timing_variance_ms: 25,
        }
    }

    #[test]
    fn test_tick_interval() {
        assert_eq!(group(50, 2).tick_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_retention_window() {
        assert_eq!(group(50, 2).retention_window(), Duration::from_millis(100));
        assert_eq!(group(16, 60).retention_window(), Duration::from_millis(960));
    }
}

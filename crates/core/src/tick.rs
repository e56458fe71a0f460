//! Tick metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::TickHeader;

/// One completed tick of a sync group, as recorded in `tick.world_ticks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRecord {
    pub tick_id: Uuid,
    pub sync_group: String,

    /// Monotonically increasing per group; (sync_group, number) is unique.
    pub number: i64,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: f64,

    /// Entity rows captured into the snapshot for this tick
    pub entity_states_processed: i64,
    /// Script audit rows observed in the capture window
    pub script_states_processed: i64,
    /// Asset audit rows observed in the capture window
    pub asset_states_processed: i64,

    /// Capture took longer than the group's tick interval
    pub delayed: bool,
    /// Target interval minus capture duration; negative when delayed
    pub headroom_ms: f64,
}

impl TickRecord {
    /// The wire-format header sent with `SYNC_GROUP_UPDATES_RESPONSE`.
    pub fn header(&self) -> TickHeader {
        TickHeader {
            number: self.number,
            start_time: self.start_time,
            duration_ms: self.duration_ms,
            delayed: self.delayed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_projection() {
        let now = Utc::now();
        let tick = TickRecord {
            tick_id: Uuid::new_v4(),
            sync_group: "public.NORMAL".to_string(),
            number: 42,
            start_time: now,
            end_time: now,
            duration_ms: 3.5,
            entity_states_processed: 10,
            script_states_processed: 0,
            asset_states_processed: 0,
            delayed: false,
            headroom_ms: 46.5,
        };

        let header = tick.header();
        assert_eq!(header.number, 42);
        assert!(!header.delayed);
        assert_eq!(header.start_time, now);
    }
}

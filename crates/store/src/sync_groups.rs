//! Sync group configuration rows

use sqlx::Row;

use worldsync_core::SyncGroupConfig;

use crate::client::Store;
use crate::error::StoreError;

impl Store {
    /// Load every sync group's replication parameters from the store.
    ///
    /// Called at startup and again on admin reload; never on the tick path.
    pub async fn load_sync_groups(&self) -> Result<Vec<SyncGroupConfig>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT general__sync_group,
                   server__tick__rate_ms,
                   server__tick__max_ticks_buffer,
                   client__render_delay_ms,
                   client__max_prediction_ms,
                   network__packet_timing_variance_ms
            FROM config.sync_groups
            ORDER BY general__sync_group
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let groups = rows
            .into_iter()
            .map(|row| SyncGroupConfig {
                sync_group: row.get("general__sync_group"),
                tick_rate_ms: row.get::<i32, _>("server__tick__rate_ms") as u32,
                max_ticks_buffer: row.get::<i32, _>("server__tick__max_ticks_buffer") as u32,
                render_delay_ms: row.get::<i32, _>("client__render_delay_ms") as u32,
                max_prediction_ms: row.get::<i32, _>("client__max_prediction_ms") as u32,
                packet_timing_variance_ms: row
                    .get::<i32, _>("network__packet_timing_variance_ms")
                    as u32,
            })
            .collect();

        Ok(groups)
    }
}

//! Tick capture
//!
//! One capture is one transaction: take the group's advisory lock, trim
//! expired history, allocate the next tick number, snapshot every entity
//! row in the group, record audit counts, finalise metrics. If any step
//! fails the transaction rolls back and nothing of the tick exists.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use uuid::Uuid;

use worldsync_core::{SyncGroupConfig, TickRecord};

use crate::client::Store;
use crate::error::StoreError;

/// Result of one capture attempt.
#[derive(Debug)]
pub enum CaptureOutcome {
    /// The tick was committed
    Captured(TickRecord),
    /// Another writer holds the group's capture lock; nothing was written
    Contended,
}

/// Stable advisory-lock key for a sync group's capture path.
///
/// Deterministic hashing keeps the key identical across restarts and
/// processes, which is what makes the lock an exclusion between writers.
pub(crate) fn capture_lock_key(sync_group: &str) -> i64 {
    let mut hasher = DefaultHasher::new();
    "tick.capture".hash(&mut hasher);
    sync_group.hash(&mut hasher);
    hasher.finish() as i64
}

/// Delayed flag and headroom for a finished capture.
pub(crate) fn capture_metrics(interval_ms: f64, duration_ms: f64) -> (bool, f64) {
    (duration_ms > interval_ms, interval_ms - duration_ms)
}

impl Store {
    /// Capture one tick for `group`.
    pub async fn capture_tick(
        &self,
        group: &SyncGroupConfig,
    ) -> Result<CaptureOutcome, StoreError> {
        let started = Instant::now();
        let start_time = Utc::now();

        let mut tx = self.pool().begin().await?;

        let locked: bool = sqlx::query("SELECT pg_try_advisory_xact_lock($1) AS locked")
            .bind(capture_lock_key(&group.sync_group))
            .fetch_one(&mut *tx)
            .await?
            .get("locked");

        if !locked {
            tx.rollback().await?;
            return Ok(CaptureOutcome::Contended);
        }

        // Trim ticks past the retention window; snapshot rows cascade.
        let retention = Duration::milliseconds(group.retention_window().as_millis() as i64);
        sqlx::query(
            "DELETE FROM tick.world_ticks WHERE group__sync = $1 AND tick__start_time < $2",
        )
        .bind(&group.sync_group)
        .bind(start_time - retention)
        .execute(&mut *tx)
        .await?;

        let previous = sqlx::query(
            r#"
            SELECT tick__number, tick__start_time
            FROM tick.world_ticks
            WHERE group__sync = $1
            ORDER BY tick__number DESC
            LIMIT 1
            "#,
        )
        .bind(&group.sync_group)
        .fetch_optional(&mut *tx)
        .await?;

        let previous_start: Option<DateTime<Utc>> =
            previous.as_ref().map(|row| row.get("tick__start_time"));
        let number: i64 = previous
            .as_ref()
            .map(|row| row.get::<i64, _>("tick__number") + 1)
            .unwrap_or(1);

        let tick_id = Uuid::new_v4();

        // Placeholder row: end = start and zero counts until finalised.
        // Startup recovery uses exactly that shape to spot aborted captures.
        sqlx::query(
            r#"
            INSERT INTO tick.world_ticks (
                general__tick_id, group__sync, tick__number,
                tick__start_time, tick__end_time, tick__duration_ms,
                tick__entity_states_processed, tick__script_states_processed,
                tick__asset_states_processed, tick__is_delayed, tick__headroom_ms
            )
            VALUES ($1, $2, $3, $4, $4, 0, 0, 0, 0, false, 0)
            "#,
        )
        .bind(tick_id)
        .bind(&group.sync_group)
        .bind(number)
        .bind(start_time)
        .execute(&mut *tx)
        .await?;

        // Full snapshot of the group, one JSON object per entity row.
        let entity_count = sqlx::query(
            r#"
            INSERT INTO tick.entity_states (
                general__entity_state_id, general__tick_id,
                general__entity_id, group__sync, entity__state
            )
            SELECT gen_random_uuid(), $1, e.general__entity_id, e.group__sync, to_jsonb(e.*)
            FROM entity.entities e
            WHERE e.group__sync = $2
            "#,
        )
        .bind(tick_id)
        .bind(&group.sync_group)
        .execute(&mut *tx)
        .await?
        .rows_affected() as i64;

        let script_count =
            count_audit_rows(&mut tx, "tick.script_audit_log", &group.sync_group, previous_start, start_time)
                .await?;
        let asset_count =
            count_audit_rows(&mut tx, "tick.asset_audit_log", &group.sync_group, previous_start, start_time)
                .await?;

        let end_time = Utc::now();
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let (delayed, headroom_ms) =
            capture_metrics(f64::from(group.tick_rate_ms), duration_ms);

        sqlx::query(
            r#"
            UPDATE tick.world_ticks
            SET tick__end_time = $2,
                tick__duration_ms = $3,
                tick__entity_states_processed = $4,
                tick__script_states_processed = $5,
                tick__asset_states_processed = $6,
                tick__is_delayed = $7,
                tick__headroom_ms = $8
            WHERE general__tick_id = $1
            "#,
        )
        .bind(tick_id)
        .bind(end_time)
        .bind(duration_ms)
        .bind(entity_count)
        .bind(script_count)
        .bind(asset_count)
        .bind(delayed)
        .bind(headroom_ms)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CaptureOutcome::Captured(TickRecord {
            tick_id,
            sync_group: group.sync_group.clone(),
            number,
            start_time,
            end_time,
            duration_ms,
            entity_states_processed: entity_count,
            script_states_processed: script_count,
            asset_states_processed: asset_count,
            delayed,
            headroom_ms,
        }))
    }

    /// Delete tick rows left behind by a crash mid-capture.
    ///
    /// An aborted capture is recognisable as a placeholder that was never
    /// finalised: `end_time = start_time` with zero entity states. Runs once
    /// at startup, before the first tick loop starts.
    pub async fn purge_incomplete_ticks(&self) -> Result<u64, StoreError> {
        let purged = sqlx::query(
            r#"
            DELETE FROM tick.world_ticks
            WHERE tick__end_time = tick__start_time
              AND tick__entity_states_processed = 0
            "#,
        )
        .execute(self.pool())
        .await?
        .rows_affected();

        if purged > 0 {
            tracing::warn!(purged, "Removed incomplete ticks from a previous run");
        }

        Ok(purged)
    }
}

async fn count_audit_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: &str,
    sync_group: &str,
    window_start: Option<DateTime<Utc>>,
    window_end: DateTime<Utc>,
) -> Result<i64, StoreError> {
    // Table name comes from a fixed internal set, never from input.
    let statement = format!(
        r#"
        SELECT count(*) AS audit_count
        FROM {table}
        WHERE group__sync = $1
          AND ($2::timestamptz IS NULL OR operation_timestamp > $2)
          AND operation_timestamp <= $3
        "#
    );

    let row = sqlx::query(&statement)
        .bind(sync_group)
        .bind(window_start)
        .bind(window_end)
        .fetch_one(&mut **tx)
        .await?;

    Ok(row.get("audit_count"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_deterministic() {
        assert_eq!(
            capture_lock_key("public.NORMAL"),
            capture_lock_key("public.NORMAL")
        );
    }

    #[test]
    fn test_lock_key_distinct_per_group() {
        assert_ne!(
            capture_lock_key("public.NORMAL"),
            capture_lock_key("public.REALTIME")
        );
    }

    #[test]
    fn test_capture_metrics_on_time() {
        let (delayed, headroom) = capture_metrics(50.0, 3.5);
        assert!(!delayed);
        assert!((headroom - 46.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_capture_metrics_overrun() {
        let (delayed, headroom) = capture_metrics(50.0, 80.0);
        assert!(delayed);
        assert!(headroom < 0.0);
    }
}

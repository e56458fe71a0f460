//! Snapshot diffing
//!
//! Entities diff by full outer join of the two latest snapshots. Scripts
//! and assets diff through the audit log: each audited resource's
//! pre-window state (recorded by the store's triggers) is compared with its
//! current base-table row. Both paths classify at the JSON level with
//! [`worldsync_core::diff`].
//!
//! When a group has only one tick, every row becomes a synthetic INSERT so
//! late joiners bootstrap from the next delta batch.

use serde_json::{Map, Value};
use sqlx::Row;
use uuid::Uuid;

use worldsync_core::diff::classify;
use worldsync_core::{Operation, ResourceChange};

use crate::client::Store;
use crate::error::StoreError;

fn as_object(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

impl Store {
    /// Entity changes between the two latest ticks of `sync_group`.
    pub async fn diff_entities(
        &self,
        sync_group: &str,
    ) -> Result<Vec<ResourceChange>, StoreError> {
        let ticks = sqlx::query(
            r#"
            SELECT general__tick_id
            FROM tick.world_ticks
            WHERE group__sync = $1
            ORDER BY tick__number DESC
            LIMIT 2
            "#,
        )
        .bind(sync_group)
        .fetch_all(self.pool())
        .await?;

        let mut tick_ids = ticks
            .iter()
            .map(|row| row.get::<Uuid, _>("general__tick_id"));
        let (current, previous) = match (tick_ids.next(), tick_ids.next()) {
            (Some(current), previous) => (current, previous),
            (None, _) => return Ok(Vec::new()),
        };

        let Some(previous) = previous else {
            return self.bootstrap_entities(current).await;
        };

        let rows = sqlx::query(
            r#"
            SELECT COALESCE(prev.general__entity_id, curr.general__entity_id) AS entity_id,
                   prev.entity__state AS previous_state,
                   curr.entity__state AS current_state
            FROM (SELECT general__entity_id, entity__state
                  FROM tick.entity_states WHERE general__tick_id = $1) prev
            FULL OUTER JOIN
                 (SELECT general__entity_id, entity__state
                  FROM tick.entity_states WHERE general__tick_id = $2) curr
              ON prev.general__entity_id = curr.general__entity_id
            "#,
        )
        .bind(previous)
        .bind(current)
        .fetch_all(self.pool())
        .await?;

        let mut changes = Vec::new();
        for row in rows {
            let id: Uuid = row.get("entity_id");
            let prev = row
                .get::<Option<Value>, _>("previous_state")
                .and_then(as_object);
            let curr = row
                .get::<Option<Value>, _>("current_state")
                .and_then(as_object);

            if let Some(change) = classify(id, prev.as_ref(), curr.as_ref()) {
                changes.push(change);
            }
        }

        Ok(changes)
    }

    /// Every snapshot row of one tick as a synthetic INSERT.
    async fn bootstrap_entities(&self, tick_id: Uuid) -> Result<Vec<ResourceChange>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT general__entity_id, entity__state
            FROM tick.entity_states
            WHERE general__tick_id = $1
            "#,
        )
        .bind(tick_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ResourceChange {
                id: row.get("general__entity_id"),
                operation: Operation::Insert,
                changes: Some(row.get::<Value, _>("entity__state")),
            })
            .collect())
    }

    /// Script changes between the two latest ticks of `sync_group`.
    pub async fn diff_scripts(&self, sync_group: &str) -> Result<Vec<ResourceChange>, StoreError> {
        self.diff_audited(
            sync_group,
            "tick.script_audit_log",
            "general__script_id",
            "entity.entity_scripts",
        )
        .await
    }

    /// Asset changes between the two latest ticks of `sync_group`.
    pub async fn diff_assets(&self, sync_group: &str) -> Result<Vec<ResourceChange>, StoreError> {
        self.diff_audited(
            sync_group,
            "tick.asset_audit_log",
            "general__asset_id",
            "entity.entity_assets",
        )
        .await
    }

    /// Shared audit-window diff for scripts and assets.
    ///
    /// The audit trigger stores each resource's row state as it was before
    /// the mutation; the earliest audit row inside the window therefore
    /// carries the pre-window state (NULL when the resource did not exist).
    /// Missing or lost audit rows only lose a delta, never corrupt one:
    /// the next full snapshot diff is authoritative for entities and the
    /// base-table read here is authoritative for the current state.
    async fn diff_audited(
        &self,
        sync_group: &str,
        audit_table: &str,
        id_column: &str,
        base_table: &str,
    ) -> Result<Vec<ResourceChange>, StoreError> {
        let ticks = sqlx::query(
            r#"
            SELECT tick__start_time
            FROM tick.world_ticks
            WHERE group__sync = $1
            ORDER BY tick__number DESC
            LIMIT 2
            "#,
        )
        .bind(sync_group)
        .fetch_all(self.pool())
        .await?;

        let mut starts = ticks
            .iter()
            .map(|row| row.get::<chrono::DateTime<chrono::Utc>, _>("tick__start_time"));
        let (current_start, previous_start) = match (starts.next(), starts.next()) {
            (Some(current), previous) => (current, previous),
            (None, _) => return Ok(Vec::new()),
        };

        if previous_start.is_none() {
            return self.bootstrap_audited(sync_group, id_column, base_table).await;
        }

        // Earliest audit row per resource inside the window = pre-window state.
        // Table and column names come from a fixed internal set.
        let statement = format!(
            r#"
            SELECT DISTINCT ON (audit.{id_column})
                   audit.{id_column} AS resource_id,
                   audit.previous_state,
                   to_jsonb(base.*) AS current_state
            FROM {audit_table} audit
            LEFT JOIN {base_table} base ON base.{id_column} = audit.{id_column}
            WHERE audit.group__sync = $1
              AND audit.operation_timestamp > $2
              AND audit.operation_timestamp <= $3
            ORDER BY audit.{id_column}, audit.operation_timestamp ASC
            "#
        );

        let rows = sqlx::query(&statement)
            .bind(sync_group)
            .bind(previous_start)
            .bind(current_start)
            .fetch_all(self.pool())
            .await?;

        let mut changes = Vec::new();
        for row in rows {
            let id: Uuid = row.get("resource_id");
            let prev = row
                .get::<Option<Value>, _>("previous_state")
                .and_then(as_object);
            let curr = row
                .get::<Option<Value>, _>("current_state")
                .and_then(as_object);

            if let Some(change) = classify(id, prev.as_ref(), curr.as_ref()) {
                changes.push(change);
            }
        }

        Ok(changes)
    }

    /// All base rows of a group as synthetic INSERTs (first-tick bootstrap).
    async fn bootstrap_audited(
        &self,
        sync_group: &str,
        id_column: &str,
        base_table: &str,
    ) -> Result<Vec<ResourceChange>, StoreError> {
        let statement = format!(
            r#"
            SELECT base.{id_column} AS resource_id, to_jsonb(base.*) AS current_state
            FROM {base_table} base
            WHERE base.group__sync = $1
            "#
        );

        let rows = sqlx::query(&statement)
            .bind(sync_group)
            .fetch_all(self.pool())
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| ResourceChange {
                id: row.get("resource_id"),
                operation: Operation::Insert,
                changes: Some(row.get::<Value, _>("current_state")),
            })
            .collect())
    }
}

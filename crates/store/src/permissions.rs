//! Access policy checks
//!
//! The store's row-level policies are authoritative for what a session may
//! observe. The adapter only asks; it never reimplements policy.

use sqlx::Row;
use uuid::Uuid;

use worldsync_core::ResourceKind;

use crate::client::Store;
use crate::error::StoreError;

impl Store {
    /// May `session_id` subscribe to `sync_group`?
    pub async fn can_subscribe(
        &self,
        session_id: Uuid,
        sync_group: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT auth.can_read_sync_group($1, $2) AS allowed")
            .bind(session_id)
            .bind(sync_group)
            .fetch_one(self.pool())
            .await?;
        Ok(row.get("allowed"))
    }

    /// Of `candidates`, the sessions permitted to observe one change.
    pub async fn allowed_sessions(
        &self,
        sync_group: &str,
        kind: ResourceKind,
        resource_id: Uuid,
        candidates: &[Uuid],
    ) -> Result<Vec<Uuid>, StoreError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT unnest(auth.filter_allowed_sessions($1, $2, $3, $4)) AS session_id",
        )
        .bind(sync_group)
        .bind(kind.as_str())
        .bind(resource_id)
        .bind(candidates)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(|row| row.get("session_id")).collect())
    }
}

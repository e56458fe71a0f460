//! Session rows and identity context
//!
//! Sessions are minted by an out-of-band login path; this adapter only
//! reads, touches and invalidates them. The identity context is installed
//! per store acquisition and never assumed to survive one: every
//! transaction that acts on behalf of a session re-asserts it.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnection;
use sqlx::Row;
use uuid::Uuid;

use worldsync_config::ContextMode;

use crate::client::Store;
use crate::error::StoreError;

/// One row of `auth.agent_sessions`.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub session_id: Uuid,
    pub agent_id: Uuid,
    /// The opaque transport token as stored; compared byte-for-byte
    pub token: String,
    pub active: bool,
    pub expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl SessionRow {
    /// Usable ⇔ active and unexpired.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at > now
    }
}

impl Store {
    /// Fetch a session by id. `None` when the store has no such session.
    pub async fn fetch_session(&self, session_id: Uuid) -> Result<Option<SessionRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT general__session_id,
                   auth__agent_id,
                   session__jwt,
                   session__is_active,
                   session__expires_at,
                   session__last_seen_at
            FROM auth.agent_sessions
            WHERE general__session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|row| SessionRow {
            session_id: row.get("general__session_id"),
            agent_id: row.get("auth__agent_id"),
            token: row.get("session__jwt"),
            active: row.get("session__is_active"),
            expires_at: row.get("session__expires_at"),
            last_seen_at: row.get("session__last_seen_at"),
        }))
    }

    /// Mark a session inactive. Returns whether the store changed anything;
    /// callers treat repeated invalidation as success (idempotent logout).
    pub async fn invalidate_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT auth.invalidate_session($1) AS invalidated")
            .bind(session_id)
            .fetch_one(self.pool())
            .await?;
        Ok(row.get("invalidated"))
    }

    /// Advance last-seen. GREATEST keeps it monotone even if sweeps race.
    pub async fn touch_session(&self, session_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE auth.agent_sessions
            SET session__last_seen_at = GREATEST(session__last_seen_at, now())
            WHERE general__session_id = $1
            "#,
        )
        .bind(session_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Install the session's identity on one store connection.
    ///
    /// The store accepts or rejects the (session, token) pair; rejection
    /// aborts the caller's operation with `AUTH_CONTEXT_FAILED`.
    pub async fn install_agent_context(
        &self,
        conn: &mut PgConnection,
        session_id: Uuid,
        token: &str,
    ) -> Result<(), StoreError> {
        let accepted: bool = match self.context_mode() {
            ContextMode::Token => {
                sqlx::query("SELECT auth.set_agent_context($1, $2) AS ok")
                    .bind(session_id)
                    .bind(token)
                    .fetch_one(&mut *conn)
                    .await?
                    .get("ok")
            }
            ContextMode::SessionOnly => {
                sqlx::query("SELECT auth.set_agent_context($1) AS ok")
                    .bind(session_id)
                    .fetch_one(&mut *conn)
                    .await?
                    .get("ok")
            }
        };

        if accepted {
            Ok(())
        } else {
            Err(StoreError::AuthContext)
        }
    }

    /// Remove the identity from a connection before it returns to the pool.
    pub async fn clear_agent_context(&self, conn: &mut PgConnection) -> Result<(), StoreError> {
        sqlx::query("SELECT auth.clear_agent_context()")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(active: bool, expires_in: Duration) -> SessionRow {
        let now = Utc::now();
        SessionRow {
            session_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            token: "tok".to_string(),
            active,
            expires_at: now + expires_in,
            last_seen_at: now,
        }
    }

    #[test]
    fn test_usable_requires_active_and_unexpired() {
        let now = Utc::now();
        assert!(session(true, Duration::minutes(5)).is_usable(now));
        assert!(!session(false, Duration::minutes(5)).is_usable(now));
        assert!(!session(true, Duration::minutes(-5)).is_usable(now));
    }
}

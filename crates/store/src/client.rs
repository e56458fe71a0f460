//! Store connection pool

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use worldsync_config::{ContextMode, DatabaseConfig};

use crate::error::StoreError;

/// Handle to the store: the shared connection pool plus the few knobs the
/// adapter needs at call sites.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    context_mode: ContextMode,
    max_result_rows: usize,
    query_timeout: Duration,
}

impl Store {
    /// Connect and build the pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        tracing::info!(
            url = %mask_database_url(&config.url),
            max_connections = config.max_connections,
            "Connecting to store"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        Ok(Self {
            pool,
            context_mode: config.context_mode,
            max_result_rows: config.max_result_rows,
            query_timeout: Duration::from_millis(config.query_timeout_ms),
        })
    }

    /// Wrap an existing pool (tests and tools).
    pub fn from_pool(pool: PgPool, config: &DatabaseConfig) -> Self {
        Self {
            pool,
            context_mode: config.context_mode,
            max_result_rows: config.max_result_rows,
            query_timeout: Duration::from_millis(config.query_timeout_ms),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn context_mode(&self) -> ContextMode {
        self.context_mode
    }

    pub fn max_result_rows(&self) -> usize {
        self.max_result_rows
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Liveness probe used by `/health`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Mask credentials when logging a connection URL.
fn mask_database_url(url: &str) -> String {
    match url.find("://").zip(url.rfind('@')) {
        Some((scheme_end, at)) if at > scheme_end + 3 => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_database_url() {
        assert_eq!(
            mask_database_url("postgres://user:secret@db:5432/world"),
            "postgres://***@db:5432/world"
        );
        assert_eq!(
            mask_database_url("postgres://localhost/world"),
            "postgres://localhost/world"
        );
    }
}

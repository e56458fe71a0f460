//! Store adapter errors

use thiserror::Error;

/// Store adapter errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0}")]
    Sqlx(#[from] sqlx::Error),

    /// The store refused to install the session's identity
    #[error("AUTH_CONTEXT_FAILED")]
    AuthContext,

    /// A client query exceeded its execution deadline
    #[error("QUERY_TIMEOUT")]
    QueryTimeout,

    /// A client query produced more rows than the deployment cap
    #[error("Query result exceeded the row cap ({cap} rows)")]
    ResultTooLarge { cap: usize },

    /// A sync group name not present in `config.sync_groups`
    #[error("Unknown sync group: {0}")]
    UnknownSyncGroup(String),
}

impl StoreError {
    /// The message surfaced to clients in `QUERY_RESPONSE.error`.
    ///
    /// Database errors travel verbatim; everything else uses the stable
    /// error vocabulary.
    pub fn client_message(&self) -> String {
        match self {
            Self::Sqlx(sqlx::Error::Database(db)) => db.message().to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_client_messages() {
        assert_eq!(StoreError::AuthContext.client_message(), "AUTH_CONTEXT_FAILED");
        assert_eq!(StoreError::QueryTimeout.client_message(), "QUERY_TIMEOUT");
    }
}

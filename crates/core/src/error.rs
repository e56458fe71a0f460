//! Auth error vocabulary shared between the store adapter and the server

use thiserror::Error;

/// Reasons a transport token or session fails validation.
///
/// These are the only auth failures ever surfaced to a client; anything
/// more detailed stays in the logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Token could not be decoded at all
    #[error("TOKEN_MALFORMED")]
    TokenMalformed,

    /// Token decoded but does not match the stored credential
    #[error("TOKEN_INVALID")]
    TokenInvalid,

    /// Session exists but its expiry has passed
    #[error("SESSION_EXPIRED")]
    SessionExpired,

    /// Session was explicitly invalidated
    #[error("SESSION_REVOKED")]
    SessionRevoked,

    /// The store refused to install the session's identity context
    #[error("AUTH_CONTEXT_FAILED")]
    ContextFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(AuthError::TokenMalformed.to_string(), "TOKEN_MALFORMED");
        assert_eq!(AuthError::SessionExpired.to_string(), "SESSION_EXPIRED");
        assert_eq!(AuthError::ContextFailed.to_string(), "AUTH_CONTEXT_FAILED");
    }
}

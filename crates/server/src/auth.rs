//! Transport token validation
//!
//! The transport token is a JWT minted by the out-of-band login path. The
//! server does not hold the signing key; the authoritative check is the
//! byte-for-byte comparison against the token the store has on file for the
//! session, plus the store's active/expiry flags. Decoding here only
//! recovers the session id so the right row can be fetched.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use worldsync_core::AuthError;
use worldsync_store::{SessionRow, Store, StoreError};

/// Claims carried by the transport token.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionClaims {
    #[serde(rename = "sessionId")]
    pub session_id: Uuid,
    #[serde(rename = "agentId")]
    pub agent_id: Uuid,
}

/// Decode the token just far enough to learn which session it names.
///
/// Signature and expiry are NOT checked here; the store's stored token and
/// session row are the authority for both.
pub fn decode_token(token: &str) -> Result<SessionClaims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<SessionClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|_| AuthError::TokenMalformed)
}

/// Outcome of a full validation: everything the connection needs to bind.
#[derive(Debug, Clone)]
pub struct ValidatedSession {
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub token: String,
}

/// Full validation against the store. No side effects.
pub async fn validate_token(store: &Store, token: &str) -> Result<ValidatedSession, ServerAuthError> {
    let claims = decode_token(token)?;

    let row = store
        .fetch_session(claims.session_id)
        .await?
        .ok_or(AuthError::TokenInvalid)?;

    check_session(&row, token)?;

    Ok(ValidatedSession {
        session_id: row.session_id,
        agent_id: row.agent_id,
        token: token.to_string(),
    })
}

/// The byte-for-byte and liveness checks against one fetched row.
pub fn check_session(row: &SessionRow, presented_token: &str) -> Result<(), AuthError> {
    if row.token.as_bytes() != presented_token.as_bytes() {
        return Err(AuthError::TokenInvalid);
    }
    if !row.active {
        return Err(AuthError::SessionRevoked);
    }
    if row.expires_at <= chrono::Utc::now() {
        return Err(AuthError::SessionExpired);
    }
    Ok(())
}

/// Auth failures split transient store trouble from definitive rejection,
/// so the heartbeat sweep can retry the former and evict on the latter.
#[derive(Debug, thiserror::Error)]
pub enum ServerAuthError {
    #[error(transparent)]
    Rejected(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn mint_token(session_id: Uuid, agent_id: Uuid) -> String {
        let claims = json!({
            "sessionId": session_id,
            "agentId": agent_id,
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-signing-key"),
        )
        .unwrap()
    }

    fn row(token: &str, active: bool, expires_in: Duration) -> SessionRow {
        let now = Utc::now();
        SessionRow {
            session_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            token: token.to_string(),
            active,
            expires_at: now + expires_in,
            last_seen_at: now,
        }
    }

    #[test]
    fn test_decode_recovers_claims() {
        let session_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        let token = mint_token(session_id, agent_id);

        let claims = decode_token(&token).unwrap();
        assert_eq!(claims.session_id, session_id);
        assert_eq!(claims.agent_id, agent_id);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(
            decode_token("invalid-token").unwrap_err(),
            AuthError::TokenMalformed
        );
        assert_eq!(decode_token("").unwrap_err(), AuthError::TokenMalformed);
    }

    #[test]
    fn test_check_session_token_must_match_exactly() {
        let stored = row("token-a", true, Duration::minutes(5));
        assert_eq!(
            check_session(&stored, "token-b").unwrap_err(),
            AuthError::TokenInvalid
        );
        assert!(check_session(&stored, "token-a").is_ok());
    }

    #[test]
    fn test_check_session_revoked_before_expired() {
        let stored = row("tok", false, Duration::minutes(-5));
        // Revocation is reported even when also expired
        assert_eq!(
            check_session(&stored, "tok").unwrap_err(),
            AuthError::SessionRevoked
        );
    }

    #[test]
    fn test_check_session_expired() {
        let stored = row("tok", true, Duration::minutes(-1));
        assert_eq!(
            check_session(&stored, "tok").unwrap_err(),
            AuthError::SessionExpired
        );
    }
}

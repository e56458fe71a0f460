//! Worldsync replication server
//!
//! Owns the WebSocket multiplexer, the session registry and heartbeat
//! sweep, the per-sync-group tick loops, the notification bridge and the
//! REST auth endpoints. State and policy live in the store; this crate
//! moves permission-filtered deltas from the store to connected clients.

pub mod auth;
pub mod bridge;
pub mod fanout;
pub mod http;
pub mod metrics;
pub mod session;
pub mod state;
pub mod subscriptions;
pub mod tick;
pub mod websocket;

pub use auth::validate_token;
pub use bridge::NotificationBridge;
pub use http::create_router;
pub use metrics::init_metrics;
pub use session::{SessionHandle, SessionRegistry};
pub use state::AppState;
pub use subscriptions::SubscriptionIndex;

use axum::http::StatusCode;
use thiserror::Error;

use worldsync_core::AuthError;
use worldsync_store::StoreError;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Session outbound queue overflowed")]
    Backpressure,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ServerError> for StatusCode {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Auth(_) => StatusCode::UNAUTHORIZED,
            ServerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Backpressure => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Protocol(_) => StatusCode::BAD_REQUEST,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

//! HTTP endpoints
//!
//! REST surface of the server: the auth endpoints, operational probes and
//! the WebSocket upgrade route. Anything else is a 404.

use axum::{
    extract::{Json, State},
    http::{HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{decode_token, validate_token, ServerAuthError};
use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::websocket::ws_handler;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let cors_layer = build_cors_layer(
        &state.settings.server.cors_origins,
        state.settings.server.cors_enabled,
    );

    let auth_routes = Router::new()
        .route("/session/validate", post(validate_session))
        .route("/session/logout", post(logout_session))
        .route("/admin/reload-sync-groups", post(reload_sync_groups));

    Router::new()
        // WebSocket
        .route("/ws", get(ws_handler))
        // REST auth endpoints
        .nest(&state.settings.server.auth_base_path, auth_routes)
        // Operational probes
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(stats))
        // Prometheus metrics
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

/// Build CORS layer from configured origins
fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled {
        tracing::warn!("CORS is disabled - allowing all origins (NOT FOR PRODUCTION)");
        return CorsLayer::permissive();
    }

    let parsed_origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("Invalid CORS origin: {}", origin);
                None
            })
        })
        .collect();

    if parsed_origins.is_empty() {
        tracing::info!("No CORS origins configured, defaulting to localhost:3000");
        return CorsLayer::new()
            .allow_origin("http://localhost:3000".parse::<HeaderValue>().unwrap())
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any);
    }

    tracing::info!("CORS configured with {} origins", parsed_origins.len());
    CorsLayer::new()
        .allow_origin(parsed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_credentials(true)
}

/// Body of the session endpoints
#[derive(Debug, Deserialize)]
struct SessionRequest {
    token: String,
    #[serde(default)]
    provider: Option<String>,
}

/// POST {auth_base}/session/validate
async fn validate_session(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> impl IntoResponse {
    match validate_token(&state.store, &request.token).await {
        Ok(validated) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "agent_id": validated.agent_id,
                "session_id": validated.session_id,
            })),
        ),
        Err(ServerAuthError::Rejected(reason)) => {
            tracing::info!(
                %reason,
                provider = request.provider.as_deref().unwrap_or("system"),
                "Session validation rejected"
            );
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "success": false,
                    "error": reason.to_string(),
                })),
            )
        }
        Err(ServerAuthError::Store(error)) => {
            tracing::error!(%error, "Session validation hit a store error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "success": false,
                    "error": "Store unavailable",
                })),
            )
        }
    }
}

/// POST {auth_base}/session/logout
///
/// Succeeds regardless of prior validity; logging out twice is not an
/// error. The bound connection, if any, is closed by the next heartbeat
/// sweep.
async fn logout_session(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> impl IntoResponse {
    let Ok(claims) = decode_token(&request.token) else {
        return (
            StatusCode::OK,
            Json(serde_json::json!({"success": true})),
        );
    };

    match state.store.invalidate_session(claims.session_id).await {
        Ok(invalidated) => {
            tracing::info!(
                session_id = %claims.session_id,
                invalidated,
                "Session logout"
            );
            (StatusCode::OK, Json(serde_json::json!({"success": true})))
        }
        Err(error) => {
            tracing::error!(%error, "Logout hit a store error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "success": false,
                    "error": "Store unavailable",
                })),
            )
        }
    }
}

/// POST {auth_base}/admin/reload-sync-groups
async fn reload_sync_groups(State(state): State<AppState>) -> impl IntoResponse {
    match state.reload_sync_groups().await {
        Ok(count) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "success",
                "sync_groups": count,
            })),
        ),
        Err(error) => {
            tracing::error!(%error, "Sync group reload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "status": "error",
                    "message": error.to_string(),
                })),
            )
        }
    }
}

/// Liveness: process up and store reachable.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.ping().await.is_ok();
    let status_code = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(serde_json::json!({
            "status": if store_ok { "healthy" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "checks": {
                "store": if store_ok { "ok" } else { "unreachable" },
            }
        })),
    )
}

/// Readiness: store reachable and sync groups loaded.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.ping().await.is_ok();
    let groups_loaded = !state.sync_groups.read().is_empty();
    let ready = store_ok && groups_loaded;

    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(serde_json::json!({
            "status": if ready { "ready" } else { "not_ready" },
            "checks": {
                "store": if store_ok { "ok" } else { "unreachable" },
                "sync_groups": if groups_loaded { "ok" } else { "empty" },
            }
        })),
    )
}

/// Operational snapshot: uptime, connections and per-group tick health.
async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let ticks: serde_json::Map<String, serde_json::Value> = state
        .last_ticks
        .iter()
        .map(|entry| {
            let tick = entry.value();
            (
                entry.key().clone(),
                serde_json::json!({
                    "number": tick.number,
                    "start_time": tick.start_time,
                    "duration_ms": tick.duration_ms,
                    "delayed": tick.delayed,
                    "headroom_ms": tick.headroom_ms,
                    "entity_states": tick.entity_states_processed,
                }),
            )
        })
        .collect();

    Json(serde_json::json!({
        "uptime_seconds": state.uptime().as_secs(),
        "connections": state.registry.len(),
        "ticks": ticks,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NotificationBridge;
    use worldsync_config::Settings;
    use worldsync_store::Store;

    #[tokio::test]
    async fn test_router_creation() {
        let settings = Settings::default();
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy(&settings.database.url)
            .unwrap();
        let store = Store::from_pool(pool, &settings.database);
        let (bridge, _rx) = NotificationBridge::channel();
        let state = AppState::new(settings, store, bridge);

        let _ = create_router(state);
    }
}

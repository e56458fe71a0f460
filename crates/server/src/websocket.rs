//! WebSocket multiplexer
//!
//! Each accepted socket becomes two tasks: a read task (this connection's
//! control flow: heartbeats, queries, subscriptions) and a write task that
//! drains the bounded outbound queue. The session is validated before the
//! upgrade completes; a bad token never becomes a WebSocket.
//!
//! Queries are processed inline in the read task, so responses leave in
//! request order per connection even when clients pipeline.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query as QueryParams, State};
use axum::http::StatusCode;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use worldsync_core::{ClientFrame, CloseReason, ServerFrame};

use crate::auth::{validate_token, ServerAuthError};
use crate::metrics;
use crate::session::{Outbound, SessionHandle};
use crate::state::AppState;

/// Query-string parameters on the upgrade request.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: String,
    #[serde(default)]
    pub provider: Option<String>,
}

/// `GET /ws?token=…&provider=…`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    QueryParams(params): QueryParams<WsParams>,
    State(state): State<AppState>,
) -> Result<Response, StatusCode> {
    match validate_token(&state.store, &params.token).await {
        Ok(validated) => {
            tracing::debug!(
                session_id = %validated.session_id,
                provider = params.provider.as_deref().unwrap_or("system"),
                "WebSocket upgrade accepted"
            );
            Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, validated)))
        }
        Err(ServerAuthError::Rejected(reason)) => {
            tracing::info!(%reason, "WebSocket upgrade rejected");
            Err(StatusCode::UNAUTHORIZED)
        }
        Err(ServerAuthError::Store(error)) => {
            tracing::error!(%error, "Store unavailable during upgrade");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    validated: crate::auth::ValidatedSession,
) {
    metrics::record_connection_opened();

    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(state.settings.replication.outbound_queue_capacity);
    let cancel = CancellationToken::new();
    let handle = Arc::new(SessionHandle::new(validated, tx, cancel));

    // One live connection per session: a rebind displaces the old socket.
    if let Some(stale) = state.registry.bind(handle.clone()) {
        tracing::info!(
            session_id = %handle.session_id,
            "Session reconnected; closing previous connection"
        );
        stale.close(CloseReason::SessionExpired);
    }
    state.bridge.bind(handle.session_id).await;

    let _ = handle.enqueue(ServerFrame::ConnectionEstablished {
        agent_id: handle.agent_id,
    });

    let write_task = tokio::spawn(write_loop(sink, rx, handle.clone()));

    read_loop(stream, &state, &handle).await;

    // Teardown: cancel the write task, then unwind the session's presence.
    // The session row itself persists; only this connection goes away.
    handle.cancellation().cancel();
    let _ = write_task.await;

    state.bridge.unbind(handle.session_id).await;
    state.subscriptions.remove_session(handle.session_id);
    state.registry.unbind(handle.session_id, handle.connection_id);

    metrics::record_connection_closed();
    tracing::debug!(session_id = %handle.session_id, "Connection closed");
}

async fn read_loop(mut stream: SplitStream<WebSocket>, state: &AppState, handle: &SessionHandle) {
    let cancel = handle.cancellation();

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                handle.mark_seen();
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => process_frame(state, handle, frame).await,
                    Err(error) => {
                        tracing::debug!(
                            session_id = %handle.session_id,
                            %error,
                            "Unparseable frame"
                        );
                        let _ = handle.enqueue(ServerFrame::Error {
                            message: "Protocol violation".to_string(),
                        });
                        handle.close(CloseReason::ProtocolViolation);
                        break;
                    }
                }
            }
            Some(Ok(Message::Binary(_))) => {
                // The protocol is JSON text frames only
                let _ = handle.enqueue(ServerFrame::Error {
                    message: "Protocol violation".to_string(),
                });
                handle.close(CloseReason::ProtocolViolation);
                break;
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = handle.enqueue_pong(data);
            }
            Some(Ok(Message::Pong(_))) => {
                handle.mark_seen();
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(error)) => {
                if is_oversize_error(&error.to_string()) {
                    // An over-size frame is a protocol violation like any
                    // other malformed input, not a transport failure
                    let _ = handle.enqueue(ServerFrame::Error {
                        message: "Protocol violation".to_string(),
                    });
                    handle.close(CloseReason::ProtocolViolation);
                } else {
                    tracing::debug!(session_id = %handle.session_id, %error, "Socket read error");
                }
                break;
            }
        }
    }
}

/// Spot the socket layer's capacity errors among read failures.
///
/// The WebSocket stack enforces its message-size limit internally and
/// surfaces an overshoot as a read error whose display names the capacity
/// overrun; every other read error is a dead transport.
fn is_oversize_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("message too long") || message.contains("space limit exceeded")
}

async fn process_frame(state: &AppState, handle: &SessionHandle, frame: ClientFrame) {
    match frame {
        ClientFrame::Heartbeat => {
            let interval = Duration::from_millis(state.settings.session.heartbeat_interval_ms);
            if handle.should_touch_store(interval) {
                if let Err(error) = state.store.touch_session(handle.session_id).await {
                    tracing::warn!(session_id = %handle.session_id, %error, "Session touch failed");
                }
            }
            let _ = handle.enqueue(ServerFrame::HeartbeatAck);
        }

        ClientFrame::ConfigRequest => {
            let _ = handle.enqueue(ServerFrame::ConfigResponse(state.config_response()));
        }

        ClientFrame::Query {
            request_id,
            query,
            parameters,
        } => {
            let response = dispatch_query(state, handle, request_id, &query, &parameters).await;
            let _ = handle.enqueue(response);
        }

        ClientFrame::Subscribe { channel } => {
            let response = subscribe(state, handle, &channel).await;
            let _ = handle.enqueue(response);
        }

        ClientFrame::Unsubscribe { channel } => {
            state.subscriptions.unsubscribe(handle.session_id, &channel);
            let _ = handle.enqueue(ServerFrame::UnsubscribeResponse {
                channel,
                success: true,
            });
        }
    }
}

/// Execute one client query under the session's identity.
///
/// The global semaphore protects the store pool; per-connection ordering is
/// already guaranteed by processing frames inline in the read task.
async fn dispatch_query(
    state: &AppState,
    handle: &SessionHandle,
    request_id: String,
    query: &str,
    parameters: &[Value],
) -> ServerFrame {
    let Ok(_permit) = state.query_permits.acquire().await else {
        return ServerFrame::QueryResponse {
            request_id,
            result: None,
            error: Some("CONNECTION_CLOSED".to_string()),
        };
    };

    let started = std::time::Instant::now();
    let outcome = state
        .store
        .execute_as(handle.session_id, &handle.token, query, parameters)
        .await;
    metrics::record_query(started.elapsed(), outcome.is_ok());

    match outcome {
        Ok(rows) => ServerFrame::QueryResponse {
            request_id,
            result: Some(rows),
            error: None,
        },
        Err(error) => {
            tracing::debug!(
                session_id = %handle.session_id,
                error = %error,
                "Query failed"
            );
            ServerFrame::QueryResponse {
                request_id,
                result: None,
                error: Some(error.client_message()),
            }
        }
    }
}

/// Policy-checked subscribe. The store is authoritative; unknown groups and
/// policy rejections both come back as a failed response, never a close.
async fn subscribe(state: &AppState, handle: &SessionHandle, channel: &str) -> ServerFrame {
    if state.sync_group(channel).is_none() {
        return ServerFrame::SubscribeResponse {
            channel: channel.to_string(),
            success: false,
            error: Some("SUBSCRIBE_DENIED".to_string()),
        };
    }

    match state.store.can_subscribe(handle.session_id, channel).await {
        Ok(true) => {
            state.subscriptions.subscribe(handle.session_id, channel);
            tracing::debug!(
                session_id = %handle.session_id,
                sync_group = channel,
                "Subscribed"
            );
            ServerFrame::SubscribeResponse {
                channel: channel.to_string(),
                success: true,
                error: None,
            }
        }
        Ok(false) => ServerFrame::SubscribeResponse {
            channel: channel.to_string(),
            success: false,
            error: Some("SUBSCRIBE_DENIED".to_string()),
        },
        Err(error) => ServerFrame::SubscribeResponse {
            channel: channel.to_string(),
            success: false,
            error: Some(error.client_message()),
        },
    }
}

/// Drain the outbound queue into the socket until cancelled, then say
/// goodbye with the close reason the connection earned.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    handle: Arc<SessionHandle>,
) {
    let cancel = handle.cancellation();

    loop {
        let outbound = tokio::select! {
            _ = cancel.cancelled() => break,
            outbound = rx.recv() => outbound,
        };

        match outbound {
            Some(outbound) => {
                if send_outbound(&mut sink, outbound).await.is_err() {
                    handle.cancellation().cancel();
                    break;
                }
            }
            None => break,
        }
    }

    // Flush whatever was enqueued before the close decision (the ERROR
    // frame preceding a 1008 close rides out here).
    while let Ok(outbound) = rx.try_recv() {
        if send_outbound(&mut sink, outbound).await.is_err() {
            break;
        }
    }

    if let Some(reason) = handle.close_reason() {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: reason.code(),
                reason: reason.reason().into(),
            })))
            .await;
    }
    let _ = sink.close().await;
}

async fn send_outbound(
    sink: &mut SplitSink<WebSocket, Message>,
    outbound: Outbound,
) -> Result<(), axum::Error> {
    let message = match outbound {
        Outbound::Frame(frame) => match serde_json::to_string(&frame) {
            Ok(text) => Message::Text(text),
            Err(error) => {
                tracing::error!(%error, "Failed to serialise outbound frame");
                return Ok(());
            }
        },
        Outbound::Shared(text) => Message::Text(text.to_string()),
        Outbound::Pong(data) => Message::Pong(data),
    };

    sink.send(message).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversize_error_detected() {
        // The capacity error as the socket layer renders it
        assert!(is_oversize_error(
            "Space limit exceeded: Message too long: 20971520 > 2097152"
        ));
        assert!(is_oversize_error("Message too long: 131073 > 65536"));
    }

    #[test]
    fn test_other_read_errors_are_not_oversize() {
        assert!(!is_oversize_error("Connection reset without closing handshake"));
        assert!(!is_oversize_error("IO error: broken pipe"));
        assert!(!is_oversize_error(""));
    }
}

//! Notification bridge
//!
//! One task owns the process-wide LISTEN connection. Connections bind and
//! unbind their session's channel through the command handle; received
//! notifications are parsed and forwarded to the session's send queue as
//! notification frames. A lost listener reconnects with backoff inside
//! [`worldsync_store::Listener`]; anything missed during the gap is healed
//! by the next tick snapshot.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use worldsync_core::{
    NotificationChanges, NotificationPayload, ResourceKind, ServerFrame,
};
use worldsync_store::Listener;

use crate::metrics;
use crate::state::AppState;

/// Bind/unbind requests from connection lifecycle events.
#[derive(Debug)]
pub enum BridgeCommand {
    Bind(Uuid),
    Unbind(Uuid),
}

/// Cloneable handle used by the WebSocket layer.
#[derive(Clone)]
pub struct NotificationBridge {
    commands: mpsc::Sender<BridgeCommand>,
}

impl NotificationBridge {
    /// Create the handle and the receiver the bridge task will drain.
    pub fn channel() -> (Self, mpsc::Receiver<BridgeCommand>) {
        let (commands, rx) = mpsc::channel(256);
        (Self { commands }, rx)
    }

    /// Start listening on a session's channel.
    pub async fn bind(&self, session_id: Uuid) {
        let _ = self.commands.send(BridgeCommand::Bind(session_id)).await;
    }

    /// Stop listening on a session's channel.
    pub async fn unbind(&self, session_id: Uuid) {
        let _ = self.commands.send(BridgeCommand::Unbind(session_id)).await;
    }
}

/// Spawn the bridge task.
pub fn spawn(
    state: AppState,
    mut listener: Listener,
    mut commands: mpsc::Receiver<BridgeCommand>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Notification bridge shutting down");
                    break;
                }
                command = commands.recv() => {
                    match command {
                        Some(BridgeCommand::Bind(session_id)) => {
                            if let Err(error) = listener.listen(&session_id.to_string()).await {
                                tracing::warn!(%session_id, %error, "LISTEN failed");
                            }
                        }
                        Some(BridgeCommand::Unbind(session_id)) => {
                            if let Err(error) = listener.unlisten(&session_id.to_string()).await {
                                tracing::warn!(%session_id, %error, "UNLISTEN failed");
                            }
                        }
                        None => break,
                    }
                }
                notification = listener.recv() => {
                    forward(&state, &notification.channel, &notification.payload);
                }
            }
        }
    })
}

/// Parse one notification and enqueue it on the owning session.
fn forward(state: &AppState, channel: &str, raw: &str) {
    let Ok(session_id) = channel.parse::<Uuid>() else {
        tracing::debug!(channel, "Notification on a non-session channel; ignoring");
        return;
    };

    let Some(handle) = state.registry.get(session_id) else {
        // Session unbound between NOTIFY and delivery
        return;
    };

    let Some(payload) = NotificationPayload::parse(raw) else {
        tracing::debug!(%session_id, "Unparseable notification payload; dropping");
        return;
    };

    let frame = notification_frame(&payload);
    if handle.enqueue(frame).is_ok() {
        metrics::record_notification(payload.kind);
    }
}

/// Map a store notification onto its wire frame.
pub(crate) fn notification_frame(payload: &NotificationPayload) -> ServerFrame {
    let changes = NotificationChanges {
        operation: payload.operation,
        sync_group: payload.sync_group.clone(),
        timestamp: payload.timestamp,
        agent_id: payload.agent_id,
    };

    match payload.kind {
        ResourceKind::Entity => ServerFrame::NotificationEntityUpdate {
            entity_id: payload.id,
            changes,
        },
        ResourceKind::Script => ServerFrame::NotificationEntityScriptUpdate {
            script_id: payload.id,
            changes,
        },
        ResourceKind::Asset => ServerFrame::NotificationEntityAssetUpdate {
            asset_id: payload.id,
            changes,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use worldsync_core::Operation;

    fn payload(kind: ResourceKind) -> NotificationPayload {
        NotificationPayload {
            kind,
            id: Uuid::new_v4(),
            operation: Operation::Update,
            sync_group: "public.NORMAL".to_string(),
            timestamp: Utc::now(),
            agent_id: Some(Uuid::new_v4()),
        }
    }

    #[test]
    fn test_notification_frame_per_kind() {
        let entity = payload(ResourceKind::Entity);
        match notification_frame(&entity) {
            ServerFrame::NotificationEntityUpdate { entity_id, changes } => {
                assert_eq!(entity_id, entity.id);
                assert_eq!(changes.sync_group, "public.NORMAL");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let script = payload(ResourceKind::Script);
        assert!(matches!(
            notification_frame(&script),
            ServerFrame::NotificationEntityScriptUpdate { .. }
        ));

        let asset = payload(ResourceKind::Asset);
        assert!(matches!(
            notification_frame(&asset),
            ServerFrame::NotificationEntityAssetUpdate { .. }
        ));
    }

    #[test]
    fn test_notification_wire_tag() {
        let frame = notification_frame(&payload(ResourceKind::Entity));
        let encoded = serde_json::to_value(&frame).unwrap();
        assert_eq!(encoded["type"], "NOTIFICATION_ENTITY_UPDATE");
        assert_eq!(encoded["changes"]["operation"], "UPDATE");
    }
}

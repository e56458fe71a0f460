//! WebSocket protocol frames
//!
//! Every frame is a JSON object tagged by `type`. The frame set is closed:
//! both directions are exhaustive enums, and a tag the server does not know
//! is a protocol violation (close 1008), never a silent drop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::change::{Operation, ResourceChange};

/// Frames a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Heartbeat,
    ConfigRequest,
    Query {
        request_id: String,
        query: String,
        #[serde(default)]
        parameters: Vec<Value>,
    },
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
}

/// Frames the server may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    ConnectionEstablished {
        agent_id: Uuid,
    },
    HeartbeatAck,
    ConfigResponse(ConfigResponse),
    QueryResponse {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Vec<Value>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SubscribeResponse {
        channel: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    UnsubscribeResponse {
        channel: String,
        success: bool,
    },
    SyncGroupUpdatesResponse {
        sync_group: String,
        tick: TickHeader,
        entities: Vec<EntityUpdate>,
        scripts: Vec<ScriptUpdate>,
        assets: Vec<AssetUpdate>,
    },
    NotificationEntityUpdate {
        entity_id: Uuid,
        changes: NotificationChanges,
    },
    NotificationEntityScriptUpdate {
        script_id: Uuid,
        changes: NotificationChanges,
    },
    NotificationEntityAssetUpdate {
        asset_id: Uuid,
        changes: NotificationChanges,
    },
    Error {
        message: String,
    },
}

/// Tick metadata attached to every delta batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickHeader {
    pub number: i64,
    pub start_time: DateTime<Utc>,
    pub duration_ms: f64,
    pub delayed: bool,
}

/// Heartbeat timing advertised to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    pub interval: u64,
    pub timeout: u64,
}

/// Session lifecycle timing advertised to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionInfo {
    pub max_age_ms: u64,
    pub cleanup_interval_ms: u64,
    pub inactive_timeout_ms: u64,
}

/// Payload of `CONFIG_RESPONSE`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub heartbeat: HeartbeatInfo,
    pub session: SessionInfo,
}

/// One entity delta on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub entity_id: Uuid,
    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Value>,
}

/// One script delta on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptUpdate {
    pub script_id: Uuid,
    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Value>,
}

/// One asset delta on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetUpdate {
    pub asset_id: Uuid,
    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Value>,
}

impl From<&ResourceChange> for EntityUpdate {
    fn from(change: &ResourceChange) -> Self {
        Self {
            entity_id: change.id,
            operation: change.operation,
            changes: change.changes.clone(),
        }
    }
}

impl From<&ResourceChange> for ScriptUpdate {
    fn from(change: &ResourceChange) -> Self {
        Self {
            script_id: change.id,
            operation: change.operation,
            changes: change.changes.clone(),
        }
    }
}

impl From<&ResourceChange> for AssetUpdate {
    fn from(change: &ResourceChange) -> Self {
        Self {
            asset_id: change.id,
            operation: change.operation,
            changes: change.changes.clone(),
        }
    }
}

/// Mutation context attached to notification frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChanges {
    pub operation: Operation,
    pub sync_group: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_tags() {
        let frame: ClientFrame = serde_json::from_value(json!({"type": "HEARTBEAT"})).unwrap();
        assert!(matches!(frame, ClientFrame::Heartbeat));

        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "SUBSCRIBE", "channel": "public.NORMAL"}))
                .unwrap();
        assert!(matches!(frame, ClientFrame::Subscribe { channel } if channel == "public.NORMAL"));
    }

    #[test]
    fn test_query_frame_literal() {
        // The shape clients actually send, parameters omitted entirely.
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"QUERY","request_id":"r1","query":"SELECT auth.current_agent_id()"}"#,
        )
        .unwrap();

        match frame {
            ClientFrame::Query {
                request_id,
                query,
                parameters,
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(query, "SELECT auth.current_agent_id()");
                assert!(parameters.is_empty());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let result = serde_json::from_value::<ClientFrame>(json!({"type": "TELEPORT"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_server_frame_tags() {
        let agent_id = Uuid::new_v4();
        let encoded =
            serde_json::to_value(ServerFrame::ConnectionEstablished { agent_id }).unwrap();
        assert_eq!(encoded["type"], "CONNECTION_ESTABLISHED");
        assert_eq!(encoded["agent_id"], json!(agent_id));

        let encoded = serde_json::to_value(ServerFrame::HeartbeatAck).unwrap();
        assert_eq!(encoded, json!({"type": "HEARTBEAT_ACK"}));
    }

    #[test]
    fn test_query_response_omits_empty_sides() {
        let ok = ServerFrame::QueryResponse {
            request_id: "r1".to_string(),
            result: Some(vec![json!({"current_agent_id": "abc"})]),
            error: None,
        };
        let encoded = serde_json::to_value(&ok).unwrap();
        assert_eq!(encoded["type"], "QUERY_RESPONSE");
        assert!(encoded.get("error").is_none());

        let failed = ServerFrame::QueryResponse {
            request_id: "r2".to_string(),
            result: None,
            error: Some("relation does not exist".to_string()),
        };
        let encoded = serde_json::to_value(&failed).unwrap();
        assert!(encoded.get("result").is_none());
        assert_eq!(encoded["error"], "relation does not exist");
    }

    #[test]
    fn test_sync_group_updates_wire_shape() {
        let entity_id = Uuid::new_v4();
        let frame = ServerFrame::SyncGroupUpdatesResponse {
            sync_group: "public.NORMAL".to_string(),
            tick: TickHeader {
                number: 7,
                start_time: Utc::now(),
                duration_ms: 2.0,
                delayed: false,
            },
            entities: vec![EntityUpdate {
                entity_id,
                operation: Operation::Insert,
                changes: Some(json!({"general__entity_name": "Test WS Update Entity"})),
            }],
            scripts: vec![],
            assets: vec![],
        };

        let encoded = serde_json::to_value(&frame).unwrap();
        assert_eq!(encoded["type"], "SYNC_GROUP_UPDATES_RESPONSE");
        assert_eq!(encoded["tick"]["number"], 7);
        assert_eq!(encoded["entities"][0]["operation"], "INSERT");
        assert_eq!(
            encoded["entities"][0]["changes"]["general__entity_name"],
            "Test WS Update Entity"
        );
    }

    #[test]
    fn test_round_trip_all_client_frames() {
        let frames = vec![
            ClientFrame::Heartbeat,
            ClientFrame::ConfigRequest,
            ClientFrame::Query {
                request_id: "q".to_string(),
                query: "SELECT 1".to_string(),
                parameters: vec![json!(5), json!("text")],
            },
            ClientFrame::Subscribe {
                channel: "public.REALTIME".to_string(),
            },
            ClientFrame::Unsubscribe {
                channel: "public.REALTIME".to_string(),
            },
        ];

        for frame in frames {
            let encoded = serde_json::to_string(&frame).unwrap();
            let decoded: ClientFrame = serde_json::from_str(&encoded).unwrap();
            assert_eq!(
                serde_json::to_value(&frame).unwrap(),
                serde_json::to_value(&decoded).unwrap()
            );
        }
    }
}

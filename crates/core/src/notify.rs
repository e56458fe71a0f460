//! Store notification payloads
//!
//! The store NOTIFYs a channel named by the session id whenever a trigger
//! records a mutation relevant to that session. The payload is JSON with a
//! fixed shape; anything that fails to parse is dropped by the bridge (the
//! next tick snapshot restores correctness).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change::{Operation, ResourceKind};

/// One decoded NOTIFY payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub kind: ResourceKind,
    pub id: Uuid,
    pub operation: Operation,
    pub sync_group: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
}

impl NotificationPayload {
    /// Parse a raw NOTIFY payload. Returns `None` on any shape mismatch.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_payload() {
        let raw = r#"{
            "kind": "entity",
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "operation": "UPDATE",
            "sync_group": "public.NORMAL",
            "timestamp": "2025-01-15T12:00:00Z",
            "agent_id": "660e8400-e29b-41d4-a716-446655440001"
        }"#;

        let payload = NotificationPayload::parse(raw).unwrap();
        assert_eq!(payload.kind, ResourceKind::Entity);
        assert_eq!(payload.operation, Operation::Update);
        assert_eq!(payload.sync_group, "public.NORMAL");
        assert!(payload.agent_id.is_some());
    }

    #[test]
    fn test_parse_missing_agent_is_ok() {
        let raw = r#"{
            "kind": "script",
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "operation": "DELETE",
            "sync_group": "public.NORMAL",
            "timestamp": "2025-01-15T12:00:00Z"
        }"#;

        let payload = NotificationPayload::parse(raw).unwrap();
        assert_eq!(payload.kind, ResourceKind::Script);
        assert!(payload.agent_id.is_none());
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(NotificationPayload::parse("not json").is_none());
        assert!(NotificationPayload::parse(r#"{"kind": "volcano"}"#).is_none());
    }
}

//! Change sets
//!
//! A change set is the minimal diff between two consecutive snapshots of a
//! sync group, per resource kind. Field contents are opaque JSON owned by
//! clients; the server forwards and diffs them without interpretation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Resource kinds replicated through the tick engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Entity,
    Script,
    Asset,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Script => "script",
            Self::Asset => "asset",
        }
    }
}

/// Mutation classification between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One changed resource.
///
/// `changes` carries the full record on INSERT, the minimal field diff on
/// UPDATE, and nothing on DELETE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceChange {
    pub id: Uuid,
    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Value>,
}

/// All changes for one sync group between its two latest ticks.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub entities: Vec<ResourceChange>,
    pub scripts: Vec<ResourceChange>,
    pub assets: Vec<ResourceChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.scripts.is_empty() && self.assets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.scripts.len() + self.assets.len()
    }

    /// Iterate `(kind, change)` pairs across all three resource kinds.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, &ResourceChange)> {
        self.entities
            .iter()
            .map(|c| (ResourceKind::Entity, c))
            .chain(self.scripts.iter().map(|c| (ResourceKind::Script, c)))
            .chain(self.assets.iter().map(|c| (ResourceKind::Asset, c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_wire_format() {
        assert_eq!(serde_json::to_string(&Operation::Insert).unwrap(), "\"INSERT\"");
        assert_eq!(serde_json::to_string(&Operation::Delete).unwrap(), "\"DELETE\"");
    }

    #[test]
    fn test_delete_omits_changes() {
        let change = ResourceChange {
            id: Uuid::new_v4(),
            operation: Operation::Delete,
            changes: None,
        };
        let encoded = serde_json::to_value(&change).unwrap();
        assert!(encoded.get("changes").is_none());
    }

    #[test]
    fn test_changeset_iter_covers_all_kinds() {
        let change = |op| ResourceChange {
            id: Uuid::new_v4(),
            operation: op,
            changes: Some(json!({"k": "v"})),
        };
        let set = ChangeSet {
            entities: vec![change(Operation::Insert)],
            scripts: vec![change(Operation::Update)],
            assets: vec![change(Operation::Delete)],
        };

        let kinds: Vec<ResourceKind> = set.iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![ResourceKind::Entity, ResourceKind::Script, ResourceKind::Asset]
        );
        assert_eq!(set.len(), 3);
        assert!(!set.is_empty());
    }
}

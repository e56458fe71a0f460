//! Subscription fan-out
//!
//! The tick engine hands one change set per group per tick to this module.
//! For every change the store decides which subscribed sessions may observe
//! it; sessions with identical visibility form a permission class, and each
//! class's batch is serialised exactly once and shared across its members'
//! send queues.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use worldsync_core::{
    AssetUpdate, ChangeSet, EntityUpdate, ResourceChange, ResourceKind, ScriptUpdate, ServerFrame,
    TickRecord,
};

use crate::metrics;
use crate::state::AppState;

/// Deliver one tick's change set to every permitted subscriber.
pub async fn broadcast(state: &AppState, sync_group: &str, tick: &TickRecord, changes: &ChangeSet) {
    if changes.is_empty() {
        return;
    }

    let candidates = state.subscriptions.sessions_for(sync_group);
    if candidates.is_empty() {
        return;
    }

    let indexed: Vec<(ResourceKind, &ResourceChange)> = changes.iter().collect();

    // Ask the store per change; on error the change is delivered to nobody
    // (fail closed) and the next tick retries naturally.
    let mut visible: HashMap<Uuid, Vec<usize>> = HashMap::new();
    for (index, (kind, change)) in indexed.iter().enumerate() {
        match state
            .store
            .allowed_sessions(sync_group, *kind, change.id, &candidates)
            .await
        {
            Ok(allowed) => {
                for session_id in allowed {
                    visible.entry(session_id).or_default().push(index);
                }
            }
            Err(error) => {
                tracing::warn!(
                    sync_group,
                    resource_id = %change.id,
                    %error,
                    "Permission filter failed; withholding change this tick"
                );
            }
        }
    }

    for (indexes, sessions) in permission_classes(visible) {
        let frame = class_frame(sync_group, tick, &indexed, &indexes);
        let text: Arc<str> = match serde_json::to_string(&frame) {
            Ok(text) => text.into(),
            Err(error) => {
                tracing::error!(sync_group, %error, "Failed to serialise delta batch");
                return;
            }
        };

        for session_id in sessions {
            if let Some(handle) = state.registry.get(session_id) {
                if handle.enqueue_shared(text.clone()).is_err() {
                    metrics::record_backpressure_close(sync_group);
                }
            }
        }
    }

    metrics::record_fanout(sync_group, changes.len());
}

/// Group sessions by identical visibility.
///
/// The index lists arrive in increasing order (built by one in-order pass),
/// so equal visibility always hashes to the same class.
pub(crate) fn permission_classes(
    visible: HashMap<Uuid, Vec<usize>>,
) -> HashMap<Vec<usize>, Vec<Uuid>> {
    let mut classes: HashMap<Vec<usize>, Vec<Uuid>> = HashMap::new();
    for (session_id, indexes) in visible {
        classes.entry(indexes).or_default().push(session_id);
    }
    classes
}

/// Build the shared frame for one permission class.
pub(crate) fn class_frame(
    sync_group: &str,
    tick: &TickRecord,
    indexed: &[(ResourceKind, &ResourceChange)],
    indexes: &[usize],
) -> ServerFrame {
    let mut entities = Vec::new();
    let mut scripts = Vec::new();
    let mut assets = Vec::new();

    for &index in indexes {
        let (kind, change) = indexed[index];
        match kind {
            ResourceKind::Entity => entities.push(EntityUpdate::from(change)),
            ResourceKind::Script => scripts.push(ScriptUpdate::from(change)),
            ResourceKind::Asset => assets.push(AssetUpdate::from(change)),
        }
    }

    ServerFrame::SyncGroupUpdatesResponse {
        sync_group: sync_group.to_string(),
        tick: tick.header(),
        entities,
        scripts,
        assets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use worldsync_core::Operation;

    fn tick() -> TickRecord {
        let now = Utc::now();
        TickRecord {
            tick_id: Uuid::new_v4(),
            sync_group: "public.NORMAL".to_string(),
            number: 3,
            start_time: now,
            end_time: now,
            duration_ms: 1.0,
            entity_states_processed: 2,
            script_states_processed: 0,
            asset_states_processed: 0,
            delayed: false,
            headroom_ms: 49.0,
        }
    }

    fn change(op: Operation) -> ResourceChange {
        ResourceChange {
            id: Uuid::new_v4(),
            operation: op,
            changes: Some(json!({"general__entity_name": "x"})),
        }
    }

    #[test]
    fn test_permission_classes_group_equal_visibility() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        let mut visible = HashMap::new();
        visible.insert(a, vec![0, 1]);
        visible.insert(b, vec![0, 1]);
        visible.insert(c, vec![1]);

        let classes = permission_classes(visible);
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[&vec![0, 1]].len(), 2);
        assert_eq!(classes[&vec![1]], vec![c]);
    }

    #[test]
    fn test_class_frame_splits_by_kind() {
        let entity = change(Operation::Insert);
        let script = change(Operation::Update);
        let indexed = vec![
            (ResourceKind::Entity, &entity),
            (ResourceKind::Script, &script),
        ];

        let frame = class_frame("public.NORMAL", &tick(), &indexed, &[0, 1]);
        match frame {
            ServerFrame::SyncGroupUpdatesResponse {
                sync_group,
                tick,
                entities,
                scripts,
                assets,
            } => {
                assert_eq!(sync_group, "public.NORMAL");
                assert_eq!(tick.number, 3);
                assert_eq!(entities.len(), 1);
                assert_eq!(scripts.len(), 1);
                assert!(assets.is_empty());
                assert_eq!(entities[0].entity_id, entity.id);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_class_frame_respects_visibility_subset() {
        let visible_change = change(Operation::Insert);
        let hidden = change(Operation::Update);
        let indexed = vec![
            (ResourceKind::Entity, &visible_change),
            (ResourceKind::Entity, &hidden),
        ];

        let frame = class_frame("public.NORMAL", &tick(), &indexed, &[0]);
        match frame {
            ServerFrame::SyncGroupUpdatesResponse { entities, .. } => {
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].entity_id, visible_change.id);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

//! Session ↔ sync-group membership
//!
//! Two mirrored indices, mutated only by SUBSCRIBE/UNSUBSCRIBE and by
//! connection teardown. Locking is per map shard, so tick fan-out reading
//! one group never contends with traffic on another.

use std::collections::HashSet;

use dashmap::DashMap;
use uuid::Uuid;

/// Membership indices for subscription fan-out.
#[derive(Default)]
pub struct SubscriptionIndex {
    by_group: DashMap<String, HashSet<Uuid>>,
    by_session: DashMap<Uuid, HashSet<String>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a membership. Returns false when it already existed.
    pub fn subscribe(&self, session_id: Uuid, sync_group: &str) -> bool {
        let inserted = self
            .by_group
            .entry(sync_group.to_string())
            .or_default()
            .insert(session_id);
        self.by_session
            .entry(session_id)
            .or_default()
            .insert(sync_group.to_string());
        inserted
    }

    /// Remove a membership; idempotent.
    pub fn unsubscribe(&self, session_id: Uuid, sync_group: &str) {
        if let Some(mut sessions) = self.by_group.get_mut(sync_group) {
            sessions.remove(&session_id);
        }
        if let Some(mut groups) = self.by_session.get_mut(&session_id) {
            groups.remove(sync_group);
        }
    }

    /// Drop every membership of one session (connection teardown).
    pub fn remove_session(&self, session_id: Uuid) {
        if let Some((_, groups)) = self.by_session.remove(&session_id) {
            for group in groups {
                if let Some(mut sessions) = self.by_group.get_mut(&group) {
                    sessions.remove(&session_id);
                }
            }
        }
    }

    /// Sessions currently subscribed to a group.
    pub fn sessions_for(&self, sync_group: &str) -> Vec<Uuid> {
        self.by_group
            .get(sync_group)
            .map(|sessions| sessions.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Groups one session is subscribed to.
    pub fn groups_for(&self, session_id: Uuid) -> Vec<String> {
        self.by_session
            .get(&session_id)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, session_id: Uuid, sync_group: &str) -> bool {
        self.by_group
            .get(sync_group)
            .map(|sessions| sessions.contains(&session_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_updates_both_indices() {
        let index = SubscriptionIndex::new();
        let session = Uuid::new_v4();

        assert!(index.subscribe(session, "public.NORMAL"));
        assert!(index.is_subscribed(session, "public.NORMAL"));
        assert_eq!(index.sessions_for("public.NORMAL"), vec![session]);
        assert_eq!(index.groups_for(session), vec!["public.NORMAL".to_string()]);
    }

    #[test]
    fn test_duplicate_subscribe_reports_existing() {
        let index = SubscriptionIndex::new();
        let session = Uuid::new_v4();

        assert!(index.subscribe(session, "public.NORMAL"));
        assert!(!index.subscribe(session, "public.NORMAL"));
        assert_eq!(index.sessions_for("public.NORMAL").len(), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let index = SubscriptionIndex::new();
        let session = Uuid::new_v4();

        index.subscribe(session, "public.NORMAL");
        index.unsubscribe(session, "public.NORMAL");
        index.unsubscribe(session, "public.NORMAL");

        assert!(!index.is_subscribed(session, "public.NORMAL"));
        assert!(index.sessions_for("public.NORMAL").is_empty());
    }

    #[test]
    fn test_remove_session_clears_all_groups() {
        let index = SubscriptionIndex::new();
        let session = Uuid::new_v4();
        let other = Uuid::new_v4();

        index.subscribe(session, "public.NORMAL");
        index.subscribe(session, "public.REALTIME");
        index.subscribe(other, "public.NORMAL");

        index.remove_session(session);

        assert!(index.groups_for(session).is_empty());
        assert_eq!(index.sessions_for("public.NORMAL"), vec![other]);
        assert!(index.sessions_for("public.REALTIME").is_empty());
    }
}

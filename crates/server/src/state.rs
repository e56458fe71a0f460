//! Shared application state
//!
//! Everything is constructed explicitly at startup and passed by parameter;
//! there are no hidden singletons or initialisation-order surprises.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use worldsync_config::Settings;
use worldsync_core::{ConfigResponse, HeartbeatInfo, SessionInfo, SyncGroupConfig, TickRecord};
use worldsync_store::{Store, StoreError};

use crate::bridge::NotificationBridge;
use crate::session::SessionRegistry;
use crate::subscriptions::SubscriptionIndex;

/// Application state shared across handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Store,
    /// Active-sessions index
    pub registry: Arc<SessionRegistry>,
    /// Session ↔ sync-group membership
    pub subscriptions: Arc<SubscriptionIndex>,
    /// Global bound on in-flight client queries
    pub query_permits: Arc<Semaphore>,
    /// Handle into the notification bridge task
    pub bridge: NotificationBridge,
    /// Sync group configs, reloaded from the store on admin request
    pub sync_groups: Arc<RwLock<Vec<SyncGroupConfig>>>,
    /// Last completed tick per group, for /stats
    pub last_ticks: Arc<DashMap<String, TickRecord>>,
    /// Server-wide shutdown signal
    pub shutdown: CancellationToken,
    started_at: Instant,
}

impl AppState {
    pub fn new(settings: Settings, store: Store, bridge: NotificationBridge) -> Self {
        let query_permits = Arc::new(Semaphore::new(settings.replication.max_concurrent_queries));
        Self {
            settings: Arc::new(settings),
            store,
            registry: Arc::new(SessionRegistry::new()),
            subscriptions: Arc::new(SubscriptionIndex::new()),
            query_permits,
            bridge,
            sync_groups: Arc::new(RwLock::new(Vec::new())),
            last_ticks: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// The timing block advertised through `CONFIG_RESPONSE`.
    pub fn config_response(&self) -> ConfigResponse {
        let session = &self.settings.session;
        ConfigResponse {
            heartbeat: HeartbeatInfo {
                interval: session.heartbeat_interval_ms,
                timeout: session.heartbeat_timeout_ms,
            },
            session: SessionInfo {
                max_age_ms: session.max_age_ms,
                cleanup_interval_ms: session.cleanup_interval_ms,
                inactive_timeout_ms: session.inactive_timeout_ms,
            },
        }
    }

    /// Look up one group's current config.
    pub fn sync_group(&self, name: &str) -> Option<SyncGroupConfig> {
        self.sync_groups
            .read()
            .iter()
            .find(|group| group.sync_group == name)
            .cloned()
    }

    pub fn set_sync_groups(&self, groups: Vec<SyncGroupConfig>) {
        *self.sync_groups.write() = groups;
    }

    /// Re-read per-group configuration from the store.
    ///
    /// Running tick loops pick the new parameters up on their next
    /// iteration; groups added after startup need a restart to get a loop.
    pub async fn reload_sync_groups(&self) -> Result<usize, StoreError> {
        let fresh = self.store.load_sync_groups().await?;
        let known: Vec<String> = self
            .sync_groups
            .read()
            .iter()
            .map(|g| g.sync_group.clone())
            .collect();

        for group in &fresh {
            if !known.contains(&group.sync_group) {
                tracing::warn!(
                    sync_group = %group.sync_group,
                    "New sync group found on reload; its tick loop starts on next restart"
                );
            }
        }

        let count = fresh.len();
        self.set_sync_groups(fresh);
        Ok(count)
    }
}

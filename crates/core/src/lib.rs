//! Core types for the worldsync replication server
//!
//! This crate provides the foundational types used across all other crates:
//! - WebSocket protocol frames (client and server directions)
//! - Sync group configuration
//! - Tick and change-set types
//! - JSON-level field diffing
//! - Auth error vocabulary

pub mod change;
pub mod close;
pub mod diff;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod sync_group;
pub mod tick;

pub use change::{ChangeSet, Operation, ResourceChange, ResourceKind};
pub use close::CloseReason;
pub use diff::{apply_fields, classify, field_diff};
pub use error::AuthError;
pub use notify::NotificationPayload;
pub use protocol::{
    AssetUpdate, ClientFrame, ConfigResponse, EntityUpdate, HeartbeatInfo, NotificationChanges,
    ScriptUpdate, ServerFrame, SessionInfo, TickHeader,
};
pub use sync_group::SyncGroupConfig;
pub use tick::TickRecord;

//! PostgreSQL store adapter for the worldsync server
//!
//! The relational store is the authority for world state, sessions and
//! access policy. This crate is a thin adapter over it:
//! - Session validation, identity context, invalidation
//! - Client query execution under the caller's identity
//! - Tick capture (snapshot + trim + metrics) and snapshot diffing
//! - Sync group configuration
//! - Pooled LISTEN/NOTIFY listener
//! - Permission filtering for fan-out
//!
//! Nothing here interprets entity metadata; rows travel as opaque JSON.

pub mod client;
pub mod diffs;
pub mod error;
pub mod notify;
pub mod permissions;
pub mod query;
pub mod sessions;
pub mod sync_groups;
pub mod ticks;

pub use client::Store;
pub use error::StoreError;
pub use notify::{Listener, Notification};
pub use sessions::SessionRow;
pub use ticks::CaptureOutcome;

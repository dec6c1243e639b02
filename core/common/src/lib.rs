//! Common utilities and types shared across Tideline crates.
//!
//! This module provides the outbox data model (sync items, their actions and
//! statuses) and the error type used by the store and the sync engine.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    ConflictPolicy, ConflictRecord, ItemId, ItemStatus, NewItem, Priority, RecordId, SyncAction, SyncItem,
};

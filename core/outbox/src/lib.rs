//! Durable outbox for Tideline.
//!
//! This module provides the trait-based interface the sync engine uses to read
//! queued mutations and write their status back, along with two backends:
//! an in-memory store and a SQLite store that survives restarts.
//!
//! # Design Principles
//! - Storage isolation: the engine only ever talks to `OutboxStore`
//! - Coalescing lives in the store, so every backend keeps one pending item per record
//! - Per-item atomicity: no partially applied transitions are visible to readers

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{Disposition, Enqueued, OutboxStore, StatusCounts};

//! Tideline Sync Engine
//!
//! This module moves queued local mutations to a remote source of truth, including:
//! - Batch selection by priority and age
//! - Debounced, throttled, periodic, reconnect and manual triggers
//! - Conflict resolution with client-wins or server-wins policies
//! - Retry strategy with exponential backoff
//! - Typed status events for observers

pub mod batch;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod events;
pub mod handle;
pub mod network;
pub mod retry;
pub mod scheduler;
pub mod shared;
pub mod state;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use batch::BatchBuilder;
pub use config::{SyncConfig, TriggerMode};
pub use conflict::{ConflictResolver, Resolution};
pub use engine::{EnqueueOptions, PassStatus, SkipReason, SyncEngine, SyncOutcomeSummary};
pub use events::{EventBus, EventKind, Subscription, SyncEvent};
pub use handle::SyncHandle;
pub use network::{ConnectivityProbe, NetworkMonitor};
pub use retry::{RetryConfig, RetryCoordinator};
pub use scheduler::{SyncScheduler, SyncSchedulerHandle};
pub use state::{EngineStatus, HistoryEntry, SyncState};
pub use transport::{BatchTransport, PerItemOutcome, ServerOutcome};

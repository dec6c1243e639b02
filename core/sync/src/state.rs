//! Observable engine state.
//!
//! `SyncState` is a derived projection: it is rebuilt from the outbox and the
//! network monitor, never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Engine lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Idle,
    Syncing,
    /// The last pass could not reach the remote.
    Error,
}

/// Outcome of one pass as recorded in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub status: EngineStatus,
    /// Items in the batch.
    pub item_count: usize,
    pub synced: usize,
    pub failed: usize,
    pub conflicted: usize,
    pub error: Option<String>,
}

/// Snapshot of the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub status: EngineStatus,
    pub is_online: bool,
    /// Items pending or in flight.
    pub pending_count: usize,
    /// Items that need a manual resync.
    pub failed_count: usize,
    /// 0-100 progress through the current batch.
    pub sync_progress: u8,
    /// Last pass in which at least one item was accepted.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Most recent pass outcomes, oldest first.
    pub sync_history: VecDeque<HistoryEntry>,
}

impl SyncState {
    /// Create an idle state.
    pub fn new(is_online: bool) -> Self {
        Self {
            status: EngineStatus::Idle,
            is_online,
            pending_count: 0,
            failed_count: 0,
            sync_progress: 0,
            last_sync_time: None,
            sync_history: VecDeque::new(),
        }
    }

    /// Append a history entry, evicting the oldest beyond `limit`.
    pub fn record(&mut self, entry: HistoryEntry, limit: usize) {
        self.sync_history.push_back(entry);
        while self.sync_history.len() > limit.max(1) {
            self.sync_history.pop_front();
        }
    }

    /// Most recent history entry.
    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.sync_history.back()
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Percentage of `done` out of `total`, clamped to 0-100.
pub(crate) fn progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc::now(),
            status: EngineStatus::Idle,
            item_count: n,
            synced: n,
            failed: 0,
            conflicted: 0,
            error: None,
        }
    }

    #[test]
    fn test_history_is_bounded_oldest_first() {
        let mut state = SyncState::new(true);
        for n in 0..5 {
            state.record(entry(n), 3);
        }

        let counts: Vec<usize> = state.sync_history.iter().map(|e| e.item_count).collect();
        assert_eq!(counts, vec![2, 3, 4]);
        assert_eq!(state.last_entry().map(|e| e.item_count), Some(4));
    }

    #[test]
    fn test_progress() {
        assert_eq!(progress(0, 4), 0);
        assert_eq!(progress(1, 4), 25);
        assert_eq!(progress(4, 4), 100);
        assert_eq!(progress(0, 0), 100);
    }

    #[test]
    fn test_state_serialization() {
        let mut state = SyncState::new(false);
        state.record(entry(2), 10);

        let json = serde_json::to_string(&state).unwrap();
        let restored: SyncState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }
}

//! Outbox store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tideline_common::{ConflictRecord, ItemId, NewItem, Result, SyncItem};

/// What `enqueue` did with a submitted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// Stored as a new pending item.
    Inserted,
    /// Folded into an existing pending item for the same record.
    Coalesced,
    /// Cancelled an existing pending create; the item was removed.
    Cancelled,
}

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    /// Id of the inserted item, or of the existing item it was folded into.
    pub id: ItemId,
    pub disposition: Disposition,
}

/// Number of items per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub synced: usize,
    pub failed: usize,
    pub conflicted: usize,
}

impl StatusCounts {
    /// Items still awaiting confirmation from the remote.
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_flight
    }
}

/// Durable queue of local mutations awaiting transmission.
///
/// Every mutating call is atomic with respect to a single item: readers
/// never observe a half-applied transition.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Get the store name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Queue a mutation.
    ///
    /// # Postconditions
    /// - If a pending item exists for the same `(table, record_id)`, it absorbs
    ///   the new mutation instead of a second row being inserted
    /// - A create followed by a delete removes the pending item entirely
    ///
    /// # Errors
    /// - Invalid item (empty table name)
    /// - Storage errors
    async fn enqueue(&self, item: NewItem) -> Result<Enqueued>;

    /// Get an item by id.
    async fn get(&self, id: &ItemId) -> Result<Option<SyncItem>>;

    /// List pending items due at `now`, in selection order, at most `limit`.
    async fn list_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<SyncItem>>;

    /// Claim pending items for a sync pass and stamp the attempt time.
    ///
    /// Ids that are no longer pending are left untouched.
    async fn mark_in_flight(&self, ids: &[ItemId], now: DateTime<Utc>) -> Result<()>;

    /// Select the next batch and claim it in one step.
    ///
    /// # Postconditions
    /// - Returns what `list_pending(limit, now)` would, with every returned
    ///   item already `in_flight` and stamped with `now`
    /// - No enqueue can fold into a returned item between selection and claim
    async fn claim_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<SyncItem>>;

    /// Record a successful transmission.
    async fn mark_synced(&self, id: &ItemId) -> Result<()>;

    /// Record a permanent failure.
    async fn mark_failed(&self, id: &ItemId, error: &str) -> Result<()>;

    /// Return an item to the queue after a transient failure.
    ///
    /// # Postconditions
    /// - `retry_count` is incremented and `last_error` recorded
    /// - The item is not eligible before `next_attempt_at`
    /// - If a newer pending item exists for the same record, the retried item
    ///   is folded into it (see `SyncItem::absorb_older`) and removed, so the
    ///   stale payload is never sent after the newer one
    async fn schedule_retry(
        &self,
        id: &ItemId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Record that a conflict was settled in favour of the server.
    async fn mark_conflicted(&self, id: &ItemId, resolution: ConflictRecord) -> Result<()>;

    /// Number of pending and in-flight items.
    async fn count_pending(&self) -> Result<usize>;

    /// Totals for every status.
    async fn counts(&self) -> Result<StatusCounts>;

    /// Earliest backoff deadline among pending items, if any is scheduled.
    async fn next_retry_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Return every in-flight item to pending. Used after an unclean shutdown.
    ///
    /// Reverted items fold into newer pending items the same way
    /// `schedule_retry` does.
    async fn revert_in_flight(&self) -> Result<usize>;

    /// Reset failed items (all of them, or only `ids`) to pending with a fresh
    /// retry budget.
    async fn resync_failed(&self, ids: Option<&[ItemId]>) -> Result<usize>;

    /// Remove an item that is not currently in flight.
    ///
    /// # Errors
    /// - Item not found
    /// - Item is in flight
    async fn discard(&self, id: &ItemId) -> Result<()>;

    /// Delete synced items last attempted before `older_than`.
    async fn purge_synced(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

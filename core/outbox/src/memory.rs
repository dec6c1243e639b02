//! In-memory outbox store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use tideline_common::{ConflictRecord, Error, ItemId, ItemStatus, NewItem, Result, SyncItem};

use crate::store::{Disposition, Enqueued, OutboxStore, StatusCounts};

/// In-memory outbox.
///
/// Useful for testing and for deployments that accept losing the queue on
/// restart. All data is lost on drop.
pub struct MemoryStore {
    items: RwLock<HashMap<ItemId, SyncItem>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of every stored item, in selection order.
    pub fn snapshot(&self) -> Vec<SyncItem> {
        let mut items: Vec<SyncItem> = self.items.read().values().cloned().collect();
        items.sort_by(|a, b| a.selection_cmp(b));
        items
    }

    fn update<F>(&self, id: &ItemId, apply: F) -> Result<()>
    where
        F: FnOnce(&mut SyncItem),
    {
        let mut items = self.items.write();
        let item = items
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Sync item not found: {}", id)))?;
        apply(item);
        Ok(())
    }
}

/// Fold the item `id`, just returned to pending, into a newer pending item
/// for the same record.
fn fold_into_newer(items: &mut HashMap<ItemId, SyncItem>, id: &ItemId) {
    let Some(older) = items.get(id).cloned() else {
        return;
    };
    let newer = items
        .values()
        .find(|i| {
            i.id != older.id
                && i.status == ItemStatus::Pending
                && i.targets_same_record(&older.table, older.record_id.as_ref())
        })
        .map(|i| i.id.clone());
    let Some(newer) = newer else {
        return;
    };

    items.remove(id);
    let keep = match items.get_mut(&newer) {
        Some(current) => current.absorb_older(&older),
        None => true,
    };
    if keep {
        debug!("Folded requeued item {} into {}", id, newer);
    } else {
        debug!("Requeued item {} cancels pending {}", id, newer);
        items.remove(&newer);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn enqueue(&self, item: NewItem) -> Result<Enqueued> {
        item.validate()?;
        let mut items = self.items.write();

        let existing = items
            .values()
            .find(|i| {
                i.status == ItemStatus::Pending
                    && i.targets_same_record(&item.table, item.record_id.as_ref())
            })
            .map(|i| i.id.clone());

        if let Some(id) = existing {
            let keep = match items.get_mut(&id) {
                Some(current) => current.absorb(&item),
                None => true,
            };
            if keep {
                return Ok(Enqueued {
                    id,
                    disposition: Disposition::Coalesced,
                });
            }
            items.remove(&id);
            return Ok(Enqueued {
                id,
                disposition: Disposition::Cancelled,
            });
        }

        let item = item.into_item(Utc::now());
        let id = item.id.clone();
        items.insert(id.clone(), item);

        Ok(Enqueued {
            id,
            disposition: Disposition::Inserted,
        })
    }

    async fn get(&self, id: &ItemId) -> Result<Option<SyncItem>> {
        Ok(self.items.read().get(id).cloned())
    }

    async fn list_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<SyncItem>> {
        let mut due: Vec<SyncItem> = self
            .items
            .read()
            .values()
            .filter(|i| i.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.selection_cmp(b));
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_in_flight(&self, ids: &[ItemId], now: DateTime<Utc>) -> Result<()> {
        let mut items = self.items.write();
        for id in ids {
            if let Some(item) = items.get_mut(id) {
                if item.status == ItemStatus::Pending {
                    item.status = ItemStatus::InFlight;
                    item.last_attempt_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn claim_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<SyncItem>> {
        let mut items = self.items.write();
        let mut due: Vec<&mut SyncItem> = items.values_mut().filter(|i| i.is_due(now)).collect();
        due.sort_by(|a, b| a.selection_cmp(b));
        due.truncate(limit);

        Ok(due
            .into_iter()
            .map(|item| {
                item.status = ItemStatus::InFlight;
                item.last_attempt_at = Some(now);
                item.clone()
            })
            .collect())
    }

    async fn mark_synced(&self, id: &ItemId) -> Result<()> {
        self.update(id, |item| {
            item.status = ItemStatus::Synced;
            item.next_attempt_at = None;
            item.last_error = None;
        })
    }

    async fn mark_failed(&self, id: &ItemId, error: &str) -> Result<()> {
        self.update(id, |item| {
            item.status = ItemStatus::Failed;
            item.next_attempt_at = None;
            item.last_error = Some(error.to_string());
        })
    }

    async fn schedule_retry(
        &self,
        id: &ItemId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut items = self.items.write();
        let item = items
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Sync item not found: {}", id)))?;
        item.status = ItemStatus::Pending;
        item.retry_count += 1;
        item.next_attempt_at = Some(next_attempt_at);
        item.last_error = Some(error.to_string());

        fold_into_newer(&mut items, id);
        Ok(())
    }

    async fn mark_conflicted(&self, id: &ItemId, resolution: ConflictRecord) -> Result<()> {
        self.update(id, |item| {
            item.status = ItemStatus::Conflicted;
            item.next_attempt_at = None;
            item.resolution = Some(resolution);
        })
    }

    async fn count_pending(&self) -> Result<usize> {
        Ok(self.counts().await?.outstanding())
    }

    async fn counts(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for item in self.items.read().values() {
            match item.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::InFlight => counts.in_flight += 1,
                ItemStatus::Synced => counts.synced += 1,
                ItemStatus::Failed => counts.failed += 1,
                ItemStatus::Conflicted => counts.conflicted += 1,
            }
        }
        Ok(counts)
    }

    async fn next_retry_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .items
            .read()
            .values()
            .filter(|i| i.status == ItemStatus::Pending)
            .filter_map(|i| i.next_attempt_at)
            .min())
    }

    async fn revert_in_flight(&self) -> Result<usize> {
        let mut items = self.items.write();
        let mut reverted = Vec::new();
        for item in items.values_mut() {
            if item.status == ItemStatus::InFlight {
                item.status = ItemStatus::Pending;
                reverted.push(item.id.clone());
            }
        }
        for id in &reverted {
            fold_into_newer(&mut items, id);
        }
        Ok(reverted.len())
    }

    async fn resync_failed(&self, ids: Option<&[ItemId]>) -> Result<usize> {
        let mut reset = 0;
        for item in self.items.write().values_mut() {
            let selected = ids.map_or(true, |ids| ids.contains(&item.id));
            if selected && item.status == ItemStatus::Failed {
                item.status = ItemStatus::Pending;
                item.retry_count = 0;
                item.next_attempt_at = None;
                item.last_error = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn discard(&self, id: &ItemId) -> Result<()> {
        let mut items = self.items.write();
        match items.get(id) {
            None => Err(Error::NotFound(format!("Sync item not found: {}", id))),
            Some(item) if item.status == ItemStatus::InFlight => Err(Error::InvalidInput(
                format!("Cannot discard in-flight item: {}", id),
            )),
            Some(_) => {
                items.remove(id);
                Ok(())
            }
        }
    }

    async fn purge_synced(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, item| {
            !(item.status == ItemStatus::Synced
                && item.last_attempt_at.map_or(true, |at| at < older_than))
        });
        Ok(before - items.len())
    }
}

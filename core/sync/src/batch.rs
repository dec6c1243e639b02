//! Batch selection.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use tideline_common::{Result, SyncItem};
use tideline_outbox::OutboxStore;

/// Picks the next batch of due items from the outbox.
#[derive(Clone)]
pub struct BatchBuilder {
    store: Arc<dyn OutboxStore>,
}

impl BatchBuilder {
    /// Create a new batch builder.
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self { store }
    }

    /// Select up to `max_size` due items.
    ///
    /// Items are ordered by priority, then age, then id. Items that are in
    /// flight, failed or terminal are never selected.
    pub async fn build_batch(&self, max_size: usize, now: DateTime<Utc>) -> Result<Vec<SyncItem>> {
        if max_size == 0 {
            return Ok(Vec::new());
        }

        let mut batch: Vec<SyncItem> = self
            .store
            .list_pending(max_size, now)
            .await?
            .into_iter()
            .filter(|item| item.is_due(now))
            .collect();
        batch.sort_by(|a, b| a.selection_cmp(b));
        batch.truncate(max_size);

        debug!("Built batch of {} items from {}", batch.len(), self.store.name());
        Ok(batch)
    }

    /// Select up to `max_size` due items and claim them for a pass.
    ///
    /// Same order as [`build_batch`](Self::build_batch), but the returned items
    /// are already `in_flight`. Selection and claim happen in one store call,
    /// so a concurrent enqueue either lands in the claimed payload or queues
    /// a new item for the next pass.
    pub async fn claim_batch(&self, max_size: usize, now: DateTime<Utc>) -> Result<Vec<SyncItem>> {
        if max_size == 0 {
            return Ok(Vec::new());
        }

        let batch = self.store.claim_batch(max_size, now).await?;
        debug!("Claimed batch of {} items from {}", batch.len(), self.store.name());
        Ok(batch)
    }

    /// Whether at least one item is due at `now`.
    pub async fn has_ready(&self, now: DateTime<Utc>) -> Result<bool> {
        Ok(!self.store.list_pending(1, now).await?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;
    use serde_json::json;
    use tideline_common::{NewItem, Priority, SyncAction};
    use tideline_outbox::MemoryStore;

    fn builder() -> (Arc<MemoryStore>, BatchBuilder) {
        let store = Arc::new(MemoryStore::new());
        let builder = BatchBuilder::new(store.clone());
        (store, builder)
    }

    async fn enqueue(store: &MemoryStore, priority: i32) -> tideline_common::ItemId {
        store
            .enqueue(
                NewItem::new("todos", SyncAction::Create, json!({ "p": priority }))
                    .with_priority(Priority(priority)),
            )
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_priority_order() {
        let (store, builder) = builder();
        for p in [3, 1, 2] {
            enqueue(&store, p).await;
        }

        let batch = builder.build_batch(10, Utc::now()).await.unwrap();
        let priorities: Vec<i32> = batch.iter().map(|i| i.priority.0).collect();
        assert_eq!(priorities, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_zero_size_is_empty() {
        let (store, builder) = builder();
        enqueue(&store, 1).await;
        assert!(builder.build_batch(0, Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_excludes_in_flight_failed_and_backed_off() {
        let (store, builder) = builder();
        let now = Utc::now();

        let in_flight = enqueue(&store, 1).await;
        let failed = enqueue(&store, 2).await;
        let backed_off = enqueue(&store, 3).await;
        let ready = enqueue(&store, 4).await;

        store.mark_in_flight(&[in_flight], now).await.unwrap();
        store.mark_failed(&failed, "rejected").await.unwrap();
        store
            .schedule_retry(&backed_off, "503", now + ChronoDuration::seconds(30))
            .await
            .unwrap();

        let batch = builder.build_batch(10, now).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec![ready]);
        assert!(builder.has_ready(now).await.unwrap());

        let later = builder
            .build_batch(10, now + ChronoDuration::seconds(31))
            .await
            .unwrap();
        assert_eq!(later.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_takes_items_out_of_selection() {
        let (store, builder) = builder();
        for p in [3, 1, 2] {
            enqueue(&store, p).await;
        }
        let now = Utc::now();

        assert!(builder.claim_batch(0, now).await.unwrap().is_empty());

        let claimed = builder.claim_batch(2, now).await.unwrap();
        let priorities: Vec<i32> = claimed.iter().map(|i| i.priority.0).collect();
        assert_eq!(priorities, vec![1, 2]);

        let rest = builder.build_batch(10, now).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].priority.0, 3);
    }

    proptest! {
        #[test]
        fn test_batch_is_sorted_and_bounded(
            priorities in proptest::collection::vec(0i32..20, 0..30),
            max_size in 0usize..40,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (store, builder) = builder();
                for p in &priorities {
                    enqueue(&store, *p).await;
                }

                let batch = builder.build_batch(max_size, Utc::now()).await.unwrap();
                prop_assert_eq!(batch.len(), priorities.len().min(max_size));
                for pair in batch.windows(2) {
                    prop_assert!(pair[0].selection_cmp(&pair[1]).is_le());
                }
                Ok(())
            })?;
        }
    }
}

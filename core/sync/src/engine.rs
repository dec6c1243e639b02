//! Core sync engine that runs sync passes over the outbox.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use tideline_common::{
    ConflictPolicy, ConflictRecord, Error, ItemId, NewItem, Priority, RecordId, Result,
    SyncAction, SyncItem,
};
use tideline_outbox::{Enqueued, OutboxStore};

use crate::batch::BatchBuilder;
use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, Resolution};
use crate::events::{EventBus, EventKind, Subscription, SyncEvent};
use crate::network::NetworkMonitor;
use crate::retry::RetryCoordinator;
use crate::state::{progress, EngineStatus, HistoryEntry, SyncState};
use crate::transport::{BatchTransport, PerItemOutcome};

/// Optional settings for a single enqueue call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    /// Overrides the table-derived priority.
    pub priority: Option<Priority>,
    /// Remote record the mutation targets. Required for coalescing.
    pub record_id: Option<RecordId>,
}

impl EnqueueOptions {
    pub fn record(record_id: impl Into<RecordId>) -> Self {
        Self {
            record_id: Some(record_id.into()),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassStatus {
    /// The remote answered (individual items may still have failed).
    Completed,
    /// The remote could not be reached or timed out.
    Failed,
    Skipped(SkipReason),
}

/// Result of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcomeSummary {
    pub status: PassStatus,
    /// Items sent to the remote.
    pub attempted: usize,
    pub synced: usize,
    /// Items rescheduled after a transient failure.
    pub retried: usize,
    /// Items rejected or out of retries.
    pub failed: usize,
    pub conflicted: usize,
    pub duration: Duration,
    pub error: Option<String>,
    /// Time until the earliest scheduled retry, if any.
    pub next_retry_in: Option<Duration>,
}

impl SyncOutcomeSummary {
    fn empty(status: PassStatus) -> Self {
        Self {
            status,
            attempted: 0,
            synced: 0,
            retried: 0,
            failed: 0,
            conflicted: 0,
            duration: Duration::ZERO,
            error: None,
            next_retry_in: None,
        }
    }

    pub fn skipped(reason: SkipReason) -> Self {
        Self::empty(PassStatus::Skipped(reason))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, PassStatus::Skipped(_))
    }
}

/// Store-side effect of settling one item.
enum Applied {
    Synced,
    Retried,
    Failed(String),
    Conflicted(Option<serde_json::Value>),
}

/// Holds the single-flight flag for the duration of a pass.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Main sync engine: moves due outbox items to the remote, one pass at a time.
pub struct SyncEngine {
    /// Durable outbox.
    store: Arc<dyn OutboxStore>,
    /// Remote endpoint.
    transport: Arc<dyn BatchTransport>,
    /// Connectivity.
    network: Arc<NetworkMonitor>,
    /// Event bus shared with the network monitor.
    bus: EventBus,
    batches: BatchBuilder,
    /// Live configuration.
    config: RwLock<SyncConfig>,
    /// Observable state.
    state: RwLock<SyncState>,
    /// Set while a pass runs.
    in_flight: AtomicBool,
}

impl SyncEngine {
    /// Create a new sync engine.
    ///
    /// Items left in flight by a previous run are returned to the queue.
    pub async fn new(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn BatchTransport>,
        network: Arc<NetworkMonitor>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let reverted = store.revert_in_flight().await?;
        if reverted > 0 {
            warn!("Reverted {} items left in flight by a previous run", reverted);
        }

        let counts = store.counts().await?;
        let mut state = SyncState::new(network.is_online());
        state.pending_count = counts.outstanding();
        state.failed_count = counts.failed;

        info!(
            "Sync engine ready on {} store: {} pending, {} failed",
            store.name(),
            state.pending_count,
            state.failed_count
        );

        Ok(Self {
            batches: BatchBuilder::new(store.clone()),
            bus: network.bus().clone(),
            store,
            transport,
            network,
            config: RwLock::new(config),
            state: RwLock::new(state),
            in_flight: AtomicBool::new(false),
        })
    }

    /// Get a copy of the active configuration.
    pub fn config(&self) -> SyncConfig {
        self.config.read().clone()
    }

    /// Replace the configuration. Takes effect from the next pass.
    pub fn update_config(&self, config: SyncConfig) -> Result<()> {
        config.validate()?;
        info!("Sync configuration updated");
        *self.config.write() = config;
        Ok(())
    }

    /// Get the event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Get the network monitor.
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// Get the outbox store.
    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    /// Snapshot of the engine state.
    pub fn current_state(&self) -> SyncState {
        let mut state = self.state.read().clone();
        state.is_online = self.network.is_online();
        state
    }

    /// Call `listener` with every published state.
    pub fn on_status_changed<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        self.bus.subscribe(EventKind::SyncStatusChanged, move |event| {
            if let SyncEvent::SyncStatusChanged(state) = event {
                listener(state);
            }
        })
    }

    /// Whether a pass is running.
    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Queue a local mutation.
    ///
    /// Without an explicit priority, tables listed in `priority_tables` are
    /// queued as high priority.
    ///
    /// # Errors
    /// - Empty table name
    /// - Storage errors
    pub async fn enqueue(
        &self,
        table: impl Into<String>,
        action: SyncAction,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Enqueued> {
        let table = table.into();
        let priority = self.config.read().priority_for(&table, options.priority);

        let mut item = NewItem::new(table, action, payload).with_priority(priority);
        item.record_id = options.record_id;

        let enqueued = self.store.enqueue(item).await?;
        debug!("Enqueued {} ({:?})", enqueued.id, enqueued.disposition);

        self.publish_counts().await;
        Ok(enqueued)
    }

    /// Whether any item is due now.
    pub async fn has_ready_items(&self) -> Result<bool> {
        self.batches.has_ready(Utc::now()).await
    }

    /// Time until the earliest scheduled retry.
    pub async fn next_retry_delay(&self) -> Result<Option<Duration>> {
        Ok(self
            .store
            .next_retry_at()
            .await?
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)))
    }

    /// Return failed items (all, or only `ids`) to the queue with a fresh
    /// retry budget.
    pub async fn resync_failed(&self, ids: Option<&[ItemId]>) -> Result<usize> {
        let reset = self.store.resync_failed(ids).await?;
        info!("Resynced {} failed items", reset);
        self.publish_counts().await;
        Ok(reset)
    }

    /// Drop a queued item that is not in flight.
    pub async fn discard(&self, id: &ItemId) -> Result<()> {
        self.store.discard(id).await?;
        info!("Discarded sync item {}", id);
        self.publish_counts().await;
        Ok(())
    }

    /// Delete synced items older than `older_than`.
    pub async fn purge_synced(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let purged = self.store.purge_synced(older_than).await?;
        debug!("Purged {} synced items", purged);
        Ok(purged)
    }

    /// Run one sync pass.
    ///
    /// Transport failures end the pass in [`PassStatus::Failed`] rather than
    /// returning `Err`; every item of the batch is then retried later.
    ///
    /// # Errors
    /// - Storage errors while claiming the batch
    pub async fn sync_now(&self) -> Result<SyncOutcomeSummary> {
        if !self.network.is_online() {
            debug!("Offline, skipping sync pass");
            return Ok(SyncOutcomeSummary::skipped(SkipReason::Offline));
        }

        let Some(_guard) = FlightGuard::acquire(&self.in_flight) else {
            debug!("Sync pass already running");
            return Ok(SyncOutcomeSummary::skipped(SkipReason::AlreadyRunning));
        };

        let start = Instant::now();
        let config = self.config();

        let batch = self.batches.claim_batch(config.batch_size, Utc::now()).await?;
        if batch.is_empty() {
            debug!("Nothing to sync");
            let mut summary = SyncOutcomeSummary::empty(PassStatus::Completed);
            summary.next_retry_in = self.next_retry_delay().await?;
            return Ok(summary);
        }

        info!("Starting sync pass with {} items", batch.len());
        self.set_status(EngineStatus::Syncing, 0);
        self.publish_counts().await;

        let response = match timeout(config.sync_timeout, self.transport.transmit_batch(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(config.sync_timeout)),
        };

        let (mut outcomes, pass_error) = match response {
            Ok(outcomes) => (
                outcomes
                    .into_iter()
                    .map(|PerItemOutcome { item_id, outcome }| (item_id, outcome))
                    .collect::<HashMap<_, _>>(),
                None,
            ),
            Err(e) => {
                warn!("Sync transmission failed: {}", e);
                (HashMap::new(), Some(e.to_string()))
            }
        };

        let resolver = ConflictResolver::new(config.conflict_resolution);
        let retry = RetryCoordinator::new(config.retry_config());

        let mut summary = SyncOutcomeSummary::empty(match pass_error {
            Some(_) => PassStatus::Failed,
            None => PassStatus::Completed,
        });
        summary.attempted = batch.len();
        summary.error = pass_error.clone();

        let mut synced_tables = BTreeSet::new();
        let mut store_errors = 0;

        for (done, item) in batch.iter().enumerate() {
            let resolution = match outcomes.remove(&item.id) {
                Some(outcome) => resolver.resolve(item, &outcome),
                None => Resolution::Retry {
                    reason: pass_error
                        .clone()
                        .unwrap_or_else(|| "No outcome reported for item".to_string()),
                },
            };

            match self
                .apply_resolution(item, resolution, &retry, resolver.policy())
                .await
            {
                Ok(Applied::Synced) => {
                    summary.synced += 1;
                    synced_tables.insert(item.table.clone());
                }
                Ok(Applied::Retried) => summary.retried += 1,
                Ok(Applied::Failed(reason)) => {
                    summary.failed += 1;
                    warn!("Sync item {} on {} failed: {}", item.id, item.table, reason);
                    self.bus.publish(SyncEvent::ItemFailed {
                        item_id: item.id.clone(),
                        table: item.table.clone(),
                        reason,
                    });
                }
                Ok(Applied::Conflicted(server_version)) => {
                    summary.conflicted += 1;
                    self.bus.publish(SyncEvent::ConflictResolved {
                        item_id: item.id.clone(),
                        table: item.table.clone(),
                        record_id: item.record_id.clone(),
                        server_version,
                    });
                }
                Err(e) => {
                    error!("Failed to record outcome for sync item {}: {}", item.id, e);
                    store_errors += 1;
                }
            }

            self.state.write().sync_progress = progress(done + 1, batch.len());
            self.publish_counts().await;
        }

        if !outcomes.is_empty() {
            debug!("Ignoring {} outcomes for items outside the batch", outcomes.len());
        }

        if store_errors > 0 {
            // Only this pass can own in-flight items.
            match self.store.revert_in_flight().await {
                Ok(n) => warn!("Returned {} unsettled items to the queue", n),
                Err(e) => error!("Failed to return unsettled items to the queue: {}", e),
            }
        }

        summary.duration = start.elapsed();
        summary.next_retry_in = match self.next_retry_delay().await {
            Ok(delay) => delay,
            Err(e) => {
                warn!("Failed to read next retry time: {}", e);
                None
            }
        };

        self.finish_pass(&summary, config.history_limit);

        for table in synced_tables {
            self.bus.publish(SyncEvent::TableChanged { table });
        }
        self.publish_status();

        info!(
            "Sync pass finished in {:?}: {} synced, {} retried, {} failed, {} conflicted",
            summary.duration, summary.synced, summary.retried, summary.failed, summary.conflicted
        );

        Ok(summary)
    }

    /// Write the resolution for one item back to the store.
    async fn apply_resolution(
        &self,
        item: &SyncItem,
        resolution: Resolution,
        retry: &RetryCoordinator,
        policy: ConflictPolicy,
    ) -> Result<Applied> {
        match resolution {
            Resolution::Synced => {
                self.store.mark_synced(&item.id).await?;
                Ok(Applied::Synced)
            }
            Resolution::Retry { reason } => {
                if retry.should_retry(item) {
                    let delay = retry.next_delay(item);
                    let next_attempt_at = Utc::now()
                        + ChronoDuration::from_std(delay)
                            .unwrap_or_else(|_| ChronoDuration::days(1));
                    self.store
                        .schedule_retry(&item.id, &reason, next_attempt_at)
                        .await?;
                    debug!(
                        "Retrying sync item {} in {:?} (retry {} of {})",
                        item.id,
                        delay,
                        item.retry_count + 1,
                        retry.config().max_retries
                    );
                    Ok(Applied::Retried)
                } else {
                    let reason = format!(
                        "Giving up after {} attempts: {}",
                        item.retry_count + 1,
                        reason
                    );
                    self.store.mark_failed(&item.id, &reason).await?;
                    Ok(Applied::Failed(reason))
                }
            }
            Resolution::Reject { reason } => {
                self.store.mark_failed(&item.id, &reason).await?;
                Ok(Applied::Failed(reason))
            }
            Resolution::Conflicted { server_version } => {
                let record = ConflictRecord {
                    policy,
                    server_version: server_version.clone(),
                    resolved_at: Utc::now(),
                };
                self.store.mark_conflicted(&item.id, record).await?;
                info!("Sync item {} conflicted, keeping server version", item.id);
                Ok(Applied::Conflicted(server_version))
            }
        }
    }

    fn finish_pass(&self, summary: &SyncOutcomeSummary, history_limit: usize) {
        let now = Utc::now();
        let status = match summary.status {
            PassStatus::Failed => EngineStatus::Error,
            _ => EngineStatus::Idle,
        };

        let mut state = self.state.write();
        state.status = status;
        state.sync_progress = 100;
        if summary.synced > 0 {
            state.last_sync_time = Some(now);
        }
        state.record(
            HistoryEntry {
                timestamp: now,
                status,
                item_count: summary.attempted,
                synced: summary.synced,
                failed: summary.failed,
                conflicted: summary.conflicted,
                error: summary.error.clone(),
            },
            history_limit,
        );
    }

    fn set_status(&self, status: EngineStatus, sync_progress: u8) {
        {
            let mut state = self.state.write();
            state.status = status;
            state.sync_progress = sync_progress;
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        self.bus
            .publish(SyncEvent::SyncStatusChanged(self.current_state()));
    }

    /// Refresh the counters from the store and publish them.
    async fn publish_counts(&self) {
        let counts = match self.store.counts().await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("Failed to read outbox counts: {}", e);
                return;
            }
        };

        let (pending, failed) = (counts.outstanding(), counts.failed);
        {
            let mut state = self.state.write();
            state.pending_count = pending;
            state.failed_count = failed;
        }
        self.bus
            .publish(SyncEvent::SyncCountChanged { pending, failed });
    }
}

//! Application-facing entry point: the engine plus its running scheduler.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tideline_common::{ItemId, Result, SyncAction};
use tideline_outbox::Disposition;

use crate::config::SyncConfig;
use crate::engine::{EnqueueOptions, SyncEngine, SyncOutcomeSummary};
use crate::events::Subscription;
use crate::network::ConnectivityProbe;
use crate::scheduler::SyncScheduler;
use crate::state::SyncState;

/// Running sync service. Cloning yields another handle to the same service.
#[derive(Clone)]
pub struct SyncHandle {
    engine: Arc<SyncEngine>,
    scheduler: SyncScheduler,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SyncHandle {
    /// Spawn the scheduler for `engine` on the current runtime.
    pub fn start(engine: Arc<SyncEngine>) -> Self {
        let (scheduler, handle) = SyncScheduler::new(engine.clone());
        let task = tokio::spawn(handle.run());

        Self {
            engine,
            scheduler,
            tasks: Arc::new(Mutex::new(vec![task])),
        }
    }

    /// Get the underlying engine.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Queue a local mutation and schedule a pass.
    ///
    /// Returns the id of the queued item (or of the pending item it was
    /// folded into).
    pub async fn enqueue(
        &self,
        table: impl Into<String>,
        action: SyncAction,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<ItemId> {
        let enqueued = self.engine.enqueue(table, action, payload, options).await?;
        if enqueued.disposition != Disposition::Cancelled {
            self.scheduler.notify_enqueued();
        }
        Ok(enqueued.id)
    }

    /// Run a pass now, or join the running one.
    pub async fn trigger_sync(&self) -> Result<SyncOutcomeSummary> {
        self.scheduler.request_sync().await
    }

    pub fn on_status_changed<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        self.engine.on_status_changed(listener)
    }

    pub fn current_state(&self) -> SyncState {
        self.engine.current_state()
    }

    /// Replace the configuration; timers pick it up immediately.
    pub fn update_config(&self, config: SyncConfig) -> Result<()> {
        self.engine.update_config(config)?;
        self.scheduler.notify_config_changed();
        Ok(())
    }

    /// Requeue failed items and schedule a pass.
    pub async fn resync_failed(&self, ids: Option<&[ItemId]>) -> Result<usize> {
        let reset = self.engine.resync_failed(ids).await?;
        if reset > 0 {
            self.scheduler.notify_enqueued();
        }
        Ok(reset)
    }

    pub async fn discard(&self, id: &ItemId) -> Result<()> {
        self.engine.discard(id).await
    }

    /// Poll `probe` every `network_check_interval` until shutdown.
    pub fn watch_connectivity(&self, probe: Arc<dyn ConnectivityProbe>) {
        let every = self.engine.config().network_check_interval;
        debug!("Polling connectivity every {:?}", every);
        let task = self.engine.network().spawn_poller(probe, every);
        self.tasks.lock().push(task);
    }

    /// Stop the scheduler and connectivity polling.
    ///
    /// A running pass is allowed to finish.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        info!("Sync service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fast_retry_config, Harness, ScriptedTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Toggle(AtomicBool);

    impl ConnectivityProbe for Toggle {
        fn is_online(&self) -> Option<bool> {
            Some(self.0.load(Ordering::SeqCst))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_schedules_pass() {
        let h = Harness::new(ScriptedTransport::accept_all(), fast_retry_config()).await;
        let handle = SyncHandle::start(h.engine.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = handle.on_status_changed(move |state| sink.lock().push(state.status));

        let id = handle
            .enqueue("todos", SyncAction::Create, json!({ "title": "a" }), EnqueueOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.transport.batches(), vec![vec![id]]);
        assert_eq!(handle.current_state().pending_count, 0);
        assert_eq!(
            *seen.lock(),
            vec![crate::EngineStatus::Syncing, crate::EngineStatus::Idle]
        );

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_create_sends_nothing() {
        let h = Harness::new(ScriptedTransport::accept_all(), fast_retry_config()).await;
        let handle = SyncHandle::start(h.engine.clone());

        handle
            .enqueue("todos", SyncAction::Create, json!({}), EnqueueOptions::record(1))
            .await
            .unwrap();
        handle
            .enqueue("todos", SyncAction::Delete, json!({}), EnqueueOptions::record(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.transport.calls(), 0);
        assert_eq!(handle.current_state().pending_count, 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_poller_drives_reconnect() {
        let h = Harness::new(ScriptedTransport::accept_all(), fast_retry_config()).await;
        let probe = Arc::new(Toggle(AtomicBool::new(false)));

        let handle = SyncHandle::start(h.engine.clone());
        handle
            .update_config(fast_retry_config().with_network_check_interval(Duration::from_secs(1)))
            .unwrap();
        handle.watch_connectivity(probe.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.current_state().is_online);

        handle
            .enqueue("todos", SyncAction::Create, json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.transport.calls(), 0);

        probe.0.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.transport.calls(), 1);
        assert_eq!(handle.current_state().pending_count, 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_sync_reports_failure_as_state() {
        let config = fast_retry_config().with_max_retry_count(0);
        let h = Harness::new(ScriptedTransport::unreachable(), config).await;
        let handle = SyncHandle::start(h.engine.clone());
        tokio::time::sleep(Duration::from_millis(1)).await;
        h.engine
            .enqueue("todos", SyncAction::Create, json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let summary = handle.trigger_sync().await.unwrap();
        assert_eq!(summary.status, crate::PassStatus::Failed);
        assert_eq!(summary.failed, 1);
        assert_eq!(handle.current_state().status, crate::EngineStatus::Error);

        handle.shutdown().await;
    }
}

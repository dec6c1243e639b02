//! Shared fixtures for the sync crate's tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use tideline_common::{Error, ItemId, Result, SyncItem};
use tideline_outbox::MemoryStore;

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::events::{EventBus, SyncEvent};
use crate::network::NetworkMonitor;
use crate::transport::{BatchTransport, PerItemOutcome, ServerOutcome};

type Responder = Box<dyn Fn(&[SyncItem]) -> Result<Vec<PerItemOutcome>> + Send + Sync>;

/// Transport whose answers are produced by a closure.
pub(crate) struct ScriptedTransport {
    responder: Responder,
    delay: Option<Duration>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    batches: Mutex<Vec<Vec<ItemId>>>,
    payloads: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&[SyncItem]) -> Result<Vec<PerItemOutcome>> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: None,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            payloads: Mutex::new(Vec::new()),
        }
    }

    /// Sleep for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn accept_all() -> Self {
        Self::new(|items| Ok(items.iter().map(|i| PerItemOutcome::accepted(i.id.clone())).collect()))
    }

    pub fn always_transient() -> Self {
        Self::new(|items| {
            Ok(items
                .iter()
                .map(|i| {
                    PerItemOutcome::new(
                        i.id.clone(),
                        ServerOutcome::Transient {
                            reason: "503 Service Unavailable".to_string(),
                        },
                    )
                })
                .collect())
        })
    }

    pub fn conflict_all(server_version: serde_json::Value) -> Self {
        Self::new(move |items| {
            Ok(items
                .iter()
                .map(|i| {
                    PerItemOutcome::new(
                        i.id.clone(),
                        ServerOutcome::RejectedConflict {
                            server_version: Some(server_version.clone()),
                        },
                    )
                })
                .collect())
        })
    }

    pub fn unreachable() -> Self {
        Self::new(|_| Err(Error::Transport("connection refused".to_string())))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Ids of every batch sent so far, in call order.
    pub fn batches(&self) -> Vec<Vec<ItemId>> {
        self.batches.lock().clone()
    }

    /// Every payload sent so far, in transmission order.
    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.payloads.lock().clone()
    }
}

#[async_trait]
impl BatchTransport for ScriptedTransport {
    async fn transmit_batch(&self, items: &[SyncItem]) -> Result<Vec<PerItemOutcome>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.batches
            .lock()
            .push(items.iter().map(|i| i.id.clone()).collect());
        self.payloads
            .lock()
            .extend(items.iter().map(|i| i.payload.clone()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        (self.responder)(items)
    }
}

/// An engine over an in-memory outbox.
pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub network: Arc<NetworkMonitor>,
    pub transport: Arc<ScriptedTransport>,
    pub engine: Arc<SyncEngine>,
}

impl Harness {
    pub async fn new(transport: ScriptedTransport, config: SyncConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), transport, config).await
    }

    pub async fn with_store(
        store: Arc<MemoryStore>,
        transport: ScriptedTransport,
        config: SyncConfig,
    ) -> Self {
        init_tracing();
        let network = Arc::new(NetworkMonitor::new(EventBus::new()));
        let transport = Arc::new(transport);
        let engine = SyncEngine::new(store.clone(), transport.clone(), network.clone(), config)
            .await
            .unwrap();

        Self {
            store,
            network,
            transport,
            engine: Arc::new(engine),
        }
    }
}

/// Config with instant, deterministic retries.
pub(crate) fn fast_retry_config() -> SyncConfig {
    SyncConfig::default()
        .with_retry_delay(Duration::ZERO, Duration::ZERO)
        .with_retry_jitter(false)
        .with_auto_sync_interval(None)
}

/// Every event currently buffered in `rx`.
pub(crate) fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

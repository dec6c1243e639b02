//! Sync scheduling: periodic, debounced, throttled, reconnect and manual triggers.
//!
//! The scheduler is a single background task that owns every timer and runs
//! at most one pass future at a time. Triggers that arrive while a pass is
//! running are folded into a rerun once it completes.

use futures::future::BoxFuture;
use std::future::pending;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use tideline_common::{Error, Result};

use crate::config::TriggerMode;
use crate::engine::{PassStatus, SyncEngine, SyncOutcomeSummary};

type Reply = oneshot::Sender<Result<SyncOutcomeSummary>>;
type PassFuture = BoxFuture<'static, Result<SyncOutcomeSummary>>;

/// Messages accepted by the scheduler task.
enum SchedulerCommand {
    /// Run a pass now and report its outcome.
    Manual(Reply),
    /// A mutation was queued.
    Enqueued,
    /// The engine configuration was replaced.
    Reconfigure,
    Shutdown(oneshot::Sender<()>),
}

/// Client side of the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SyncScheduler {
    command_tx: mpsc::Sender<SchedulerCommand>,
}

impl SyncScheduler {
    /// Create a scheduler for `engine` and the handle that runs it.
    pub fn new(engine: Arc<SyncEngine>) -> (Self, SyncSchedulerHandle) {
        let (command_tx, command_rx) = mpsc::channel(100);
        let network_rx = engine.network().subscribe();

        let handle = SyncSchedulerHandle {
            engine,
            command_rx,
            network_rx,
        };

        (Self { command_tx }, handle)
    }

    /// Request a pass and wait for its outcome.
    ///
    /// If a pass is already running the request waits for it; a follow-up
    /// pass runs only when due items remain.
    pub async fn request_sync(&self) -> Result<SyncOutcomeSummary> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(SchedulerCommand::Manual(response_tx))
            .await
            .map_err(|_| Error::Scheduler("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Scheduler("Failed to receive sync result".to_string()))?
    }

    /// Tell the scheduler a mutation was queued.
    pub fn notify_enqueued(&self) {
        // A full channel already holds a trigger.
        if let Err(e) = self.command_tx.try_send(SchedulerCommand::Enqueued) {
            debug!("Enqueue notification not delivered: {}", e);
        }
    }

    /// Tell the scheduler to re-read the engine configuration.
    pub fn notify_config_changed(&self) {
        if let Err(e) = self.command_tx.try_send(SchedulerCommand::Reconfigure) {
            debug!("Reconfigure notification not delivered: {}", e);
        }
    }

    /// Stop the scheduler, letting a running pass finish first.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .command_tx
            .send(SchedulerCommand::Shutdown(ack_tx))
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    engine: Arc<SyncEngine>,
    command_rx: mpsc::Receiver<SchedulerCommand>,
    network_rx: watch::Receiver<bool>,
}

/// Pass bookkeeping owned by the scheduler task.
struct Runner {
    engine: Arc<SyncEngine>,
    pass: Option<PassFuture>,
    /// Callers answered by the running pass.
    waiters: Vec<Reply>,
    /// Callers that asked while a pass was running.
    coalesced: Vec<Reply>,
    rerun: bool,
    /// The network came back while a pass was running.
    reconnected: bool,
    /// Debounce or throttle deadline.
    trigger_at: Option<Instant>,
    /// Earliest backoff deadline.
    retry_at: Option<Instant>,
    last_started: Option<Instant>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task until shutdown.
    ///
    /// This should be spawned in a tokio task.
    pub async fn run(self) {
        let Self {
            engine,
            mut command_rx,
            mut network_rx,
        } = self;

        let mut runner = Runner::new(engine);
        let mut period = runner.engine.config().auto_sync_interval;
        let mut ticker = period.map(periodic_ticker);
        let mut network_open = true;
        let mut shutdown_ack = None;

        network_rx.borrow_and_update();
        info!("Sync scheduler started");

        if runner.engine.network().is_online() && has_ready(&runner.engine).await {
            debug!("Due items found at startup");
            runner.start();
        }

        loop {
            let config = runner.engine.config();
            if config.auto_sync_interval != period {
                debug!("Auto-sync interval changed to {:?}", config.auto_sync_interval);
                period = config.auto_sync_interval;
                ticker = period.map(periodic_ticker);
            }

            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(SchedulerCommand::Manual(reply)) => runner.manual(reply),
                    Some(SchedulerCommand::Enqueued) => runner.enqueued(config.trigger_mode),
                    Some(SchedulerCommand::Reconfigure) => debug!("Reloading scheduler configuration"),
                    Some(SchedulerCommand::Shutdown(ack)) => {
                        info!("Received shutdown request");
                        shutdown_ack = Some(ack);
                        break;
                    }
                    None => break,
                },

                result = wait_for_pass(&mut runner.pass) => {
                    runner.pass = None;
                    runner.complete(result, config.trigger_mode, config.batch_size).await;
                }

                changed = network_rx.changed(), if network_open => match changed {
                    Ok(()) => {
                        let online = *network_rx.borrow_and_update();
                        if online {
                            info!("Network restored, requesting sync");
                            runner.reconnect();
                        } else {
                            runner.trigger_at = None;
                            runner.retry_at = None;
                        }
                    }
                    Err(_) => network_open = false,
                },

                _ = wait_for_periodic(&mut ticker) => {
                    if runner.pass.is_some() {
                        debug!("Auto-sync tick skipped, pass running");
                    } else {
                        debug!("Triggering periodic sync");
                        runner.trigger();
                    }
                }

                _ = wait_until(runner.trigger_at) => {
                    runner.trigger_at = None;
                    runner.trigger();
                }

                _ = wait_until(runner.retry_at) => {
                    runner.retry_at = None;
                    debug!("Retry deadline reached");
                    runner.trigger();
                }
            }
        }

        runner.drain().await;
        info!("Sync scheduler stopped");
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }
}

impl Runner {
    fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            pass: None,
            waiters: Vec::new(),
            coalesced: Vec::new(),
            rerun: false,
            reconnected: false,
            trigger_at: None,
            retry_at: None,
            last_started: None,
        }
    }

    fn start(&mut self) {
        let engine = self.engine.clone();
        self.pass = Some(Box::pin(async move { engine.sync_now().await }));
        self.last_started = Some(Instant::now());
        self.trigger_at = None;
        self.retry_at = None;
        self.rerun = false;
        self.reconnected = false;
    }

    fn manual(&mut self, reply: Reply) {
        if self.pass.is_some() {
            self.coalesced.push(reply);
        } else {
            self.waiters.push(reply);
            self.start();
        }
    }

    /// Start a pass now, or once the running one completes.
    fn trigger(&mut self) {
        if !self.engine.network().is_online() {
            debug!("Offline, ignoring sync trigger");
            return;
        }
        if self.pass.is_some() {
            self.rerun = true;
        } else {
            self.start();
        }
    }

    /// Like `trigger`, but a rerun after the running pass skips the throttle.
    fn reconnect(&mut self) {
        if self.pass.is_some() {
            self.reconnected = true;
        }
        self.trigger();
    }

    fn enqueued(&mut self, mode: TriggerMode) {
        match mode {
            TriggerMode::Debounce { window } => {
                self.trigger_at = Some(Instant::now() + window);
            }
            TriggerMode::Throttle { interval } => self.schedule_slot(interval),
        }
    }

    /// Book the next throttle slot unless one is already booked.
    fn schedule_slot(&mut self, interval: Duration) {
        if self.trigger_at.is_some() {
            return;
        }
        let now = Instant::now();
        let slot = self
            .last_started
            .map_or(now, |started| (started + interval).max(now));
        self.trigger_at = Some(slot);
    }

    async fn complete(
        &mut self,
        result: Result<SyncOutcomeSummary>,
        mode: TriggerMode,
        batch_size: usize,
    ) {
        let mut backlog = false;
        match &result {
            Ok(summary) => {
                debug!("Sync pass ended: {:?}", summary.status);
                self.retry_at = summary.next_retry_in.map(|delay| Instant::now() + delay);
                backlog = summary.status == PassStatus::Completed && summary.attempted >= batch_size;
            }
            Err(e) => error!("Sync pass failed: {}", e),
        }

        let shared = share(&result);
        let mut waiters = mem::take(&mut self.waiters).into_iter();
        if let Some(first) = waiters.next() {
            let _ = first.send(result);
        }
        for waiter in waiters {
            let _ = waiter.send(share(&shared));
        }

        let coalesced = mem::take(&mut self.coalesced);
        let reconnected = mem::take(&mut self.reconnected);
        let wants_rerun = mem::take(&mut self.rerun) || backlog;

        if !coalesced.is_empty() {
            if has_ready(&self.engine).await {
                debug!("Running follow-up pass for {} coalesced requests", coalesced.len());
                self.waiters = coalesced;
                self.start();
            } else {
                for waiter in coalesced {
                    let _ = waiter.send(share(&shared));
                }
            }
            return;
        }

        if wants_rerun && has_ready(&self.engine).await {
            match mode {
                TriggerMode::Throttle { interval } if !reconnected => self.schedule_slot(interval),
                _ => self.trigger(),
            }
        }
    }

    /// Finish the running pass and answer everyone still waiting.
    async fn drain(&mut self) {
        if let Some(pass) = self.pass.take() {
            debug!("Waiting for running pass before stopping");
            let result = pass.await;
            let shared = share(&result);
            let mut waiters = mem::take(&mut self.waiters).into_iter();
            if let Some(first) = waiters.next() {
                let _ = first.send(result);
            }
            for waiter in waiters {
                let _ = waiter.send(share(&shared));
            }
        }
        for waiter in self.coalesced.drain(..) {
            let _ = waiter.send(Err(Error::Scheduler("Scheduler shut down".to_string())));
        }
    }
}

async fn has_ready(engine: &SyncEngine) -> bool {
    match engine.has_ready_items().await {
        Ok(ready) => ready,
        Err(e) => {
            error!("Failed to check for due items: {}", e);
            false
        }
    }
}

/// Copy a pass result for an additional waiter.
fn share(result: &Result<SyncOutcomeSummary>) -> Result<SyncOutcomeSummary> {
    match result {
        Ok(summary) => Ok(summary.clone()),
        Err(e) => Err(Error::Scheduler(e.to_string())),
    }
}

fn periodic_ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn wait_for_pass(pass: &mut Option<PassFuture>) -> Result<SyncOutcomeSummary> {
    match pass {
        Some(pass) => pass.await,
        None => pending().await,
    }
}

async fn wait_for_periodic(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

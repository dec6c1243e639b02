//! Connectivity tracking.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::events::{EventBus, EventKind, SyncEvent, Subscription};

/// Source of the runtime's connectivity signal.
pub trait ConnectivityProbe: Send + Sync {
    /// Current connectivity, or `None` when the signal is unavailable.
    fn is_online(&self) -> Option<bool>;
}

/// Tracks whether the remote is believed reachable.
///
/// The monitor never fails: without a signal it assumes it is online and
/// lets transmission failures reveal the truth.
pub struct NetworkMonitor {
    state: watch::Sender<bool>,
    bus: EventBus,
}

impl NetworkMonitor {
    /// Create a monitor that starts online.
    pub fn new(bus: EventBus) -> Self {
        let (state, _) = watch::channel(true);
        Self { state, bus }
    }

    /// Create a monitor seeded from `probe`.
    pub fn with_probe(bus: EventBus, probe: &dyn ConnectivityProbe) -> Self {
        let online = probe.is_online().unwrap_or(true);
        let (state, _) = watch::channel(online);
        debug!("Network monitor seeded: online={}", online);
        Self { state, bus }
    }

    /// Current connectivity.
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Feed a connectivity signal. Returns whether it was a transition.
    ///
    /// State is updated before any listener runs.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            info!("Network is now {}", if online { "online" } else { "offline" });
            self.bus.publish(SyncEvent::NetworkStatusChanged { online });
        }
        changed
    }

    /// Call `listener` with the new state on every transition.
    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.bus
            .subscribe(EventKind::NetworkStatusChanged, move |event| {
                if let SyncEvent::NetworkStatusChanged { online } = event {
                    listener(*online);
                }
            })
    }

    /// Watch channel for async consumers such as the scheduler.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Get the event bus this monitor publishes to.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Poll `probe` every `every` and feed its readings into the monitor.
    ///
    /// The task ends once the monitor is dropped. Readings of `None` leave
    /// the current state untouched.
    pub fn spawn_poller(
        self: &Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
        every: Duration,
    ) -> JoinHandle<()> {
        let monitor: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    debug!("Network monitor dropped, stopping poller");
                    break;
                };
                if let Some(online) = probe.is_online() {
                    monitor.set_online(online);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU8, Ordering};

    /// 0 = unknown, 1 = offline, 2 = online.
    struct FakeProbe(AtomicU8);

    impl ConnectivityProbe for FakeProbe {
        fn is_online(&self) -> Option<bool> {
            match self.0.load(Ordering::SeqCst) {
                1 => Some(false),
                2 => Some(true),
                _ => None,
            }
        }
    }

    #[test]
    fn test_unavailable_signal_defaults_online() {
        let probe = FakeProbe(AtomicU8::new(0));
        let monitor = NetworkMonitor::with_probe(EventBus::new(), &probe);
        assert!(monitor.is_online());
    }

    #[test]
    fn test_seeded_offline() {
        let probe = FakeProbe(AtomicU8::new(1));
        let monitor = NetworkMonitor::with_probe(EventBus::new(), &probe);
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_only_transitions_notify() {
        let monitor = NetworkMonitor::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _sub = monitor.on_change(move |online| sink.lock().push(online));

        assert!(!monitor.set_online(true));
        assert!(monitor.set_online(false));
        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));

        assert_eq!(*seen.lock(), vec![false, true]);
    }

    #[test]
    fn test_state_updated_before_listeners_run() {
        let monitor = Arc::new(NetworkMonitor::new(EventBus::new()));
        let observed = Arc::new(Mutex::new(None));

        let weak = Arc::downgrade(&monitor);
        let sink = observed.clone();
        let _sub = monitor.on_change(move |_| {
            if let Some(m) = weak.upgrade() {
                *sink.lock() = Some(m.is_online());
            }
        });

        monitor.set_online(false);
        assert_eq!(*observed.lock(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_feeds_transitions() {
        let probe = Arc::new(FakeProbe(AtomicU8::new(2)));
        let monitor = Arc::new(NetworkMonitor::new(EventBus::new()));
        let mut rx = monitor.subscribe();

        let poller = monitor.spawn_poller(probe.clone(), Duration::from_secs(5));

        probe.0.store(1, Ordering::SeqCst);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());

        probe.0.store(0, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!monitor.is_online());

        poller.abort();
    }
}

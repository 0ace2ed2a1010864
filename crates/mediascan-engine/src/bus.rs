//! In-process fan-out of scan events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use mediascan_core::{ScanEvent, ScanId, ScanProgressEvent};

/// Identifier of one bus subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

/// Snapshot of the bus, as seen by status queries.
#[derive(Debug, Clone, Default)]
pub struct BusState {
    /// Scan the last scan event belonged to.
    pub active_scan_id: Option<ScanId>,
    /// Last scan event; heartbeats and connection events are never cached.
    pub last_event: Option<Arc<ScanProgressEvent>>,
    pub subscriber_count: usize,
}

impl BusState {
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count > 0
    }
}

/// Publish/subscribe hub for scan events.
///
/// Each subscriber owns a bounded queue. Publishing never waits: a subscriber
/// whose queue is full or closed is dropped.
#[derive(Debug)]
pub struct ProgressBus {
    subscribers: DashMap<SubscriberId, mpsc::Sender<Arc<ScanProgressEvent>>>,
    next_id: AtomicU64,
    state: watch::Sender<BusState>,
    capacity: usize,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize, heartbeat_interval: Duration) -> Self {
        let (state, _) = watch::channel(BusState::default());
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            state,
            capacity: capacity.max(2),
            heartbeat_interval,
            shutdown: CancellationToken::new(),
            heartbeat: Mutex::new(None),
        }
    }

    /// Publish an event to every live subscriber.
    pub fn publish(&self, event: ScanProgressEvent) {
        let event = Arc::new(event);

        if event.is_scan_event() {
            let scan_id = event.scan_id().cloned();
            let cached = Arc::clone(&event);
            self.state.send_modify(|state| {
                state.active_scan_id = scan_id;
                state.last_event = Some(cached);
            });
        }

        self.fan_out(&event);
    }

    fn fan_out(&self, event: &Arc<ScanProgressEvent>) {
        let mut dropped = Vec::new();
        for entry in self.subscribers.iter() {
            if let Err(e) = entry.value().try_send(Arc::clone(event)) {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "closed",
                };
                debug!(subscriber = entry.key().0, reason, "dropping subscriber");
                dropped.push(*entry.key());
            }
        }

        if !dropped.is_empty() {
            for id in dropped {
                self.subscribers.remove(&id);
            }
            self.sync_count();
        }
    }

    /// Register an observer.
    ///
    /// The first event received is `connected`, followed by the last scan
    /// event if there is one.
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.capacity);

        let active = self.subscribers.len() + 1;
        let _ = tx.try_send(Arc::new(ScanProgressEvent::connected(active)));
        if let Some(last) = self.state.borrow().last_event.clone() {
            let _ = tx.try_send(last);
        }

        if !self.shutdown.is_cancelled() {
            self.subscribers.insert(id, tx);
        }
        self.sync_count();
        trace!(subscriber = id.0, "subscribed");

        Subscription { id, rx }
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.subscribers.remove(&id).is_some() {
            self.sync_count();
            trace!(subscriber = id.0, "unsubscribed");
        }
    }

    /// Current snapshot.
    pub fn current_state(&self) -> BusState {
        self.state.borrow().clone()
    }

    /// Watch the snapshot for changes.
    pub fn watch_state(&self) -> watch::Receiver<BusState> {
        self.state.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Forget the active scan and its last event.
    pub fn clear_scan_state(&self) {
        self.state.send_modify(|state| {
            state.active_scan_id = None;
            state.last_event = None;
        });
    }

    /// Start emitting heartbeats on the configured interval.
    ///
    /// Calling this more than once has no effect.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let bus: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.heartbeat_interval.max(Duration::from_millis(10));
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(bus) = bus.upgrade() else { break };
                        let count = bus.subscribers.len();
                        if count > 0 {
                            bus.fan_out(&Arc::new(ScanProgressEvent::heartbeat(count)));
                        }
                    }
                }
            }
        }));
    }

    /// Stop the heartbeat and disconnect every subscriber.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.subscribers.clear();
        self.sync_count();
        debug!("progress bus shut down");
    }

    fn sync_count(&self) {
        let count = self.subscribers.len();
        self.state.send_if_modified(|state| {
            if state.subscriber_count == count {
                false
            } else {
                state.subscriber_count = count;
                true
            }
        });
    }
}

/// A live subscription to the bus.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<ScanProgressEvent>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the subscriber was dropped by the bus.
    pub async fn recv(&mut self) -> Option<Arc<ScanProgressEvent>> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Arc<ScanProgressEvent>> {
        self.rx.try_recv().ok()
    }

    /// Convert into a `Stream` of events.
    pub fn into_stream(self) -> ReceiverStream<Arc<ScanProgressEvent>> {
        ReceiverStream::new(self.rx)
    }
}

/// Whether an event is a heartbeat.
pub fn is_heartbeat(event: &ScanProgressEvent) -> bool {
    matches!(event.kind, ScanEvent::Heartbeat(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediascan_core::{ControlAction, ProgressPayload, ScanPhase};

    fn progress(scan: &str, processed: u64) -> ScanProgressEvent {
        ScanProgressEvent::progress(
            ProgressPayload::new(ScanId::from(scan), ScanPhase::Metadata, 10.0, processed, 100)
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_subscribe_replays_connected_then_last_event() {
        let bus = ProgressBus::new(8, Duration::from_secs(30));
        bus.publish(progress("scan-1", 5));

        let mut sub = bus.subscribe();
        assert_eq!(sub.recv().await.unwrap().event_type(), "connected");
        let last = sub.recv().await.unwrap();
        assert_eq!(last.as_progress().unwrap().processed_files, 5);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_fan_out_and_state() {
        let bus = ProgressBus::new(8, Duration::from_secs(30));
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.current_state().subscriber_count, 2);

        bus.publish(progress("scan-2", 1));
        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await.unwrap().event_type(), "connected");
            assert_eq!(sub.recv().await.unwrap().event_type(), "progress");
        }

        let state = bus.current_state();
        assert_eq!(state.active_scan_id, Some(ScanId::from("scan-2")));
        assert!(state.has_subscribers());

        bus.clear_scan_state();
        assert!(bus.current_state().last_event.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped() {
        let bus = ProgressBus::new(2, Duration::from_secs(30));
        let mut slow = bus.subscribe();
        drop(bus.subscribe());

        // `connected` already occupies one slot of the slow queue.
        bus.publish(progress("scan-3", 1));
        bus.publish(progress("scan-3", 2));

        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(slow.recv().await.unwrap().event_type(), "connected");
        assert_eq!(slow.recv().await.unwrap().event_type(), "progress");
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = ProgressBus::new(8, Duration::from_secs(30));
        let sub = bus.subscribe();
        bus.unsubscribe(sub.id());
        bus.unsubscribe(sub.id());
        bus.unsubscribe(SubscriberId(999));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_control_events_are_cached() {
        let bus = ProgressBus::new(8, Duration::from_secs(30));
        bus.publish(ScanProgressEvent::control(
            ControlAction::Pause,
            ScanId::from("scan-4"),
            None,
        ));
        let state = bus.current_state();
        assert_eq!(state.last_event.unwrap().event_type(), "control_pause");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_are_not_cached() {
        let bus = Arc::new(ProgressBus::new(8, Duration::from_secs(1)));
        bus.start_heartbeat();
        let mut sub = bus.subscribe();
        assert_eq!(sub.recv().await.unwrap().event_type(), "connected");

        let beat = sub.recv().await.unwrap();
        assert!(is_heartbeat(&beat));
        assert!(bus.current_state().last_event.is_none());

        bus.shutdown();
        assert!(sub.recv().await.is_none());
    }
}

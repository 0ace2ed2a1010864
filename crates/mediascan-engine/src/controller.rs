//! Pause, resume and cancel handling for the active scan.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use strum::Display;
use tokio::sync::watch;
use tracing::info;

use mediascan_core::{ControlAction, ScanError, ScanId, ScanProgressEvent, ScanResult};

use crate::bus::ProgressBus;

/// Lifecycle state of the scan slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScanState {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl ScanState {
    /// Whether a scan currently occupies the slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Outcome of a checkpoint gate.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Cancelled,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSnapshot {
    pub scan_id: Option<ScanId>,
    pub state: ScanState,
    pub cancel_requested: bool,
}

#[derive(Debug, Default)]
struct Inner {
    scan_id: Option<ScanId>,
    state: ScanState,
    cancel_requested: bool,
}

/// Single authority over whether the in-flight scan may keep running.
///
/// Commands only record intent; the scan task observes them at
/// [`ScanController::checkpoint_gate`].
#[derive(Debug)]
pub struct ScanController {
    inner: Mutex<Inner>,
    changed: watch::Sender<u64>,
    bus: Arc<ProgressBus>,
}

impl ScanController {
    pub fn new(bus: Arc<ProgressBus>) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            changed,
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Claim the scan slot for `scan_id`.
    pub fn begin(&self, scan_id: ScanId) -> ScanResult<()> {
        let mut inner = self.lock();
        if inner.state.is_active() {
            return Err(ScanError::AlreadyRunning {
                scan_id: inner.scan_id.clone().unwrap_or_else(|| scan_id.clone()),
            });
        }
        inner.scan_id = Some(scan_id);
        inner.state = ScanState::Running;
        inner.cancel_requested = false;
        drop(inner);
        self.notify();
        Ok(())
    }

    fn active_guard(&self, scan_id: &ScanId) -> ScanResult<MutexGuard<'_, Inner>> {
        let inner = self.lock();
        if inner.state.is_active() && inner.scan_id.as_ref() == Some(scan_id) {
            Ok(inner)
        } else {
            Err(ScanError::NotFound {
                scan_id: scan_id.clone(),
            })
        }
    }

    /// Ask the scan to stop at its next checkpoint gate.
    pub fn request_pause(&self, scan_id: &ScanId) -> ScanResult<()> {
        let mut inner = self.active_guard(scan_id)?;
        if inner.state == ScanState::Paused || inner.cancel_requested {
            return Ok(());
        }
        inner.state = ScanState::Paused;
        self.bus.publish(ScanProgressEvent::control(
            ControlAction::Pause,
            scan_id.clone(),
            Some("Scan paused".to_string()),
        ));
        drop(inner);
        info!(%scan_id, "pause requested");
        self.notify();
        Ok(())
    }

    pub fn request_resume(&self, scan_id: &ScanId) -> ScanResult<()> {
        let mut inner = self.active_guard(scan_id)?;
        if inner.state == ScanState::Running || inner.cancel_requested {
            return Ok(());
        }
        inner.state = ScanState::Running;
        self.bus.publish(ScanProgressEvent::control(
            ControlAction::Resume,
            scan_id.clone(),
            Some("Scan resumed".to_string()),
        ));
        drop(inner);
        info!(%scan_id, "resume requested");
        self.notify();
        Ok(())
    }

    /// Ask the scan to stop for good. Wakes a paused scan.
    pub fn request_cancel(&self, scan_id: &ScanId) -> ScanResult<()> {
        let mut inner = self.active_guard(scan_id)?;
        if inner.cancel_requested {
            return Ok(());
        }
        inner.cancel_requested = true;
        self.bus.publish(ScanProgressEvent::control(
            ControlAction::Cancel,
            scan_id.clone(),
            Some("Scan cancelled".to_string()),
        ));
        drop(inner);
        info!(%scan_id, "cancel requested");
        self.notify();
        Ok(())
    }

    /// Wait while paused; report whether the scan may continue.
    pub async fn checkpoint_gate(&self) -> GateDecision {
        let mut changes = self.changed.subscribe();
        loop {
            {
                let inner = self.lock();
                if inner.cancel_requested {
                    return GateDecision::Cancelled;
                }
                if inner.state != ScanState::Paused {
                    return GateDecision::Proceed;
                }
            }
            if changes.changed().await.is_err() {
                return GateDecision::Cancelled;
            }
        }
    }

    /// Publish a scan event unless the scan is no longer live.
    ///
    /// Returns whether the event was published. Holding the state lock across
    /// the publish orders it strictly before any later `control_cancel`.
    pub fn publish_if_live(&self, scan_id: &ScanId, event: ScanProgressEvent) -> bool {
        let inner = self.lock();
        let live = inner.state.is_active()
            && !inner.cancel_requested
            && inner.scan_id.as_ref() == Some(scan_id);
        if live {
            self.bus.publish(event);
        }
        live
    }

    /// Publish the `complete` event of a live scan and mark it completed.
    ///
    /// The bus forgets the scan in the same step. Returns `false`, changing
    /// nothing, when the scan is no longer live.
    pub fn complete(&self, scan_id: &ScanId, event: ScanProgressEvent) -> bool {
        let mut inner = self.lock();
        let live = inner.state.is_active()
            && !inner.cancel_requested
            && inner.scan_id.as_ref() == Some(scan_id);
        if !live {
            return false;
        }
        self.bus.publish(event);
        self.bus.clear_scan_state();
        inner.state = ScanState::Completed;
        drop(inner);
        self.notify();
        true
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.lock().cancel_requested
    }

    /// Move the slot to a terminal state.
    pub fn finish(&self, state: ScanState) {
        let mut inner = self.lock();
        inner.state = state;
        inner.cancel_requested = false;
        drop(inner);
        self.notify();
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let inner = self.lock();
        ControllerSnapshot {
            scan_id: inner.scan_id.clone(),
            state: inner.state,
            cancel_requested: inner.cancel_requested,
        }
    }

    pub fn state(&self) -> ScanState {
        self.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn controller() -> (Arc<ProgressBus>, ScanController) {
        let bus = Arc::new(ProgressBus::new(16, Duration::from_secs(30)));
        let controller = ScanController::new(Arc::clone(&bus));
        (bus, controller)
    }

    #[test]
    fn test_begin_rejects_second_scan() {
        let (_bus, controller) = controller();
        let first = ScanId::from("scan-1");
        controller.begin(first.clone()).unwrap();

        let err = controller.begin(ScanId::from("scan-2")).unwrap_err();
        assert!(matches!(err, ScanError::AlreadyRunning { scan_id } if scan_id == first));

        controller.request_pause(&first).unwrap();
        assert!(controller.begin(ScanId::from("scan-3")).is_err());

        controller.finish(ScanState::Completed);
        assert!(controller.begin(ScanId::from("scan-4")).is_ok());
    }

    #[test]
    fn test_commands_require_active_scan() {
        let (_bus, controller) = controller();
        let id = ScanId::from("scan-1");
        assert!(matches!(
            controller.request_pause(&id),
            Err(ScanError::NotFound { .. })
        ));

        controller.begin(id.clone()).unwrap();
        assert!(matches!(
            controller.request_cancel(&ScanId::from("other")),
            Err(ScanError::NotFound { .. })
        ));

        controller.finish(ScanState::Cancelled);
        assert!(matches!(
            controller.request_resume(&id),
            Err(ScanError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_gate_waits_while_paused() {
        let (_bus, controller) = controller();
        let controller = Arc::new(controller);
        let id = ScanId::from("scan-1");
        controller.begin(id.clone()).unwrap();
        assert_eq!(controller.checkpoint_gate().await, GateDecision::Proceed);

        controller.request_pause(&id).unwrap();
        let waiting = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.checkpoint_gate().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        controller.request_resume(&id).unwrap();
        assert_eq!(waiting.await.unwrap(), GateDecision::Proceed);
    }

    #[tokio::test]
    async fn test_cancel_wakes_paused_gate() {
        let (bus, controller) = controller();
        let controller = Arc::new(controller);
        let id = ScanId::from("scan-1");
        controller.begin(id.clone()).unwrap();
        controller.request_pause(&id).unwrap();

        let waiting = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.checkpoint_gate().await })
        };
        controller.request_cancel(&id).unwrap();
        assert_eq!(waiting.await.unwrap(), GateDecision::Cancelled);

        let last = bus.current_state().last_event.unwrap();
        assert_eq!(last.event_type(), "control_cancel");
    }

    #[test]
    fn test_complete_clears_bus_and_frees_slot() {
        let (bus, controller) = controller();
        let id = ScanId::from("scan-1");
        controller.begin(id.clone()).unwrap();

        let event = ScanProgressEvent::control(ControlAction::Resume, id.clone(), None);
        assert!(controller.complete(&id, event.clone()));
        assert_eq!(controller.state(), ScanState::Completed);
        assert!(bus.current_state().last_event.is_none());
        assert!(!controller.complete(&id, event));
    }

    #[test]
    fn test_no_publish_after_cancel() {
        let (bus, controller) = controller();
        let id = ScanId::from("scan-1");
        controller.begin(id.clone()).unwrap();
        controller.request_cancel(&id).unwrap();

        let event = ScanProgressEvent::control(ControlAction::Resume, id.clone(), None);
        assert!(!controller.publish_if_live(&id, event));
        assert_eq!(
            bus.current_state().last_event.unwrap().event_type(),
            "control_cancel"
        );
    }
}

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    events::{Subscribers, Subscription},
    utils::lock,
};

use super::{
    backend::{DetectorBackend, DetectorEvent},
    capture::{BackendError, CaptureError},
    types::{CaptureReport, DetectorId, DetectorInfo, DetectorSpecification, DetectorStatus},
};

/// A detector with the annotations the core keeps for it.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Detector {
    pub id: DetectorId,
    pub specification: DetectorSpecification,
    pub status: DetectorStatus,
    pub dark_map_exposures: Vec<Duration>,
    pub last_report: Option<CaptureReport>,
}

#[derive(Default)]
struct RegistryState {
    detectors: Vec<DetectorInfo>,
    claims: HashSet<DetectorId>,
    dark_maps: HashMap<DetectorId, Vec<Duration>>,
    last_reports: HashMap<DetectorId, CaptureReport>,
}

impl RegistryState {
    fn detector(&self, info: &DetectorInfo) -> Detector {
        let status = match info.status {
            DetectorStatus::Disconnected => DetectorStatus::Disconnected,
            _ if self.claims.contains(&info.id) => DetectorStatus::Capturing,
            status => status,
        };

        Detector {
            id: info.id,
            specification: info.specification,
            status,
            dark_map_exposures: self.dark_maps.get(&info.id).cloned().unwrap_or_default(),
            last_report: self.last_reports.get(&info.id).cloned(),
        }
    }

    fn check_available(&self, id: DetectorId) -> Result<DetectorSpecification, CaptureError> {
        match self.detectors.iter().find(|info| info.id == id) {
            None => Err(CaptureError::DetectorNotFound(id)),
            Some(info) if info.status == DetectorStatus::Disconnected => {
                Err(CaptureError::DetectorDisconnected(id))
            }
            Some(_) if self.claims.contains(&id) => Err(CaptureError::DetectorBusy(id)),
            Some(info) => Ok(info.specification),
        }
    }

    fn snapshot(&self) -> Vec<Detector> {
        self.detectors.iter().map(|info| self.detector(info)).collect()
    }
}

type Listener = (CancellationToken, JoinHandle<()>);

/// The set of detectors the backend currently knows about.
///
/// The list is only ever replaced by backend snapshots; the registry never polls.
/// Subscribers get the full list after every change, one change at a time.
/// Callbacks must not call back into the registry.
pub struct DetectorRegistry {
    backend: Arc<dyn DetectorBackend>,
    state: Mutex<RegistryState>,
    subscribers: Arc<Subscribers<Vec<Detector>>>,
    notify_lock: Mutex<()>,
    listener: Mutex<Option<Listener>>,
}

impl DetectorRegistry {
    pub fn new(backend: Arc<dyn DetectorBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            state: Mutex::new(RegistryState::default()),
            subscribers: Arc::new(Subscribers::new()),
            notify_lock: Mutex::new(()),
            listener: Mutex::new(None),
        })
    }

    pub fn backend(&self) -> &Arc<dyn DetectorBackend> {
        &self.backend
    }

    pub fn list_detectors(&self) -> Vec<Detector> {
        lock(&self.state).snapshot()
    }

    pub fn get(&self, id: DetectorId) -> Option<Detector> {
        let state = lock(&self.state);
        state
            .detectors
            .iter()
            .find(|info| info.id == id)
            .map(|info| state.detector(info))
    }

    pub fn on_detectors_changed<F>(&self, callback: F) -> Subscription<Vec<Detector>>
    where
        F: Fn(&Vec<Detector>) + Send + Sync + 'static,
    {
        let id = self.subscribers.subscribe(callback);
        Subscription::new(id, &self.subscribers)
    }

    pub async fn scan(&self) -> Result<(), BackendError> {
        info!("Scanning for detectors");
        self.backend.scan_detectors().await
    }

    pub fn apply_event(&self, event: DetectorEvent) {
        match event {
            DetectorEvent::Snapshot(detectors) => {
                debug!("Detector snapshot with {} detector(s)", detectors.len());
                self.mutate(|state| {
                    state.detectors = detectors;
                    Some(())
                });
            }
        }
    }

    /// Applies backend events until the channel closes or [`shutdown`](Self::shutdown) is called.
    pub fn listen(self: &Arc<Self>, mut events: UnboundedReceiver<DetectorEvent>) {
        let token = CancellationToken::new();
        let registry: Weak<Self> = Arc::downgrade(self);
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = task_token.cancelled() => break,
                    event = events.recv() => event,
                };
                match (event, registry.upgrade()) {
                    (Some(event), Some(registry)) => registry.apply_event(event),
                    _ => break,
                }
            }
            debug!("Detector event listener stopped");
        });

        if let Some((previous, _)) = lock(&self.listener).replace((token, handle)) {
            warn!("Replacing an existing detector event listener");
            previous.cancel();
        }
    }

    pub fn shutdown(&self) {
        if let Some((token, _)) = lock(&self.listener).take() {
            token.cancel();
        }
        self.subscribers.clear();
        info!("Detector registry shut down");
    }

    /// Marks the detector as in use by one session.
    pub(crate) fn claim(&self, id: DetectorId) -> Result<DetectorSpecification, CaptureError> {
        let mut result = Err(CaptureError::DetectorNotFound(id));
        self.mutate(|state| {
            result = state.check_available(id);
            let specification = *result.as_ref().ok()?;
            state.claims.insert(id);
            Some(specification)
        });
        result
    }

    pub(crate) fn release(&self, id: DetectorId) {
        self.mutate(|state| state.claims.remove(&id).then_some(()));
    }

    pub(crate) fn record_report(&self, id: DetectorId, report: CaptureReport) {
        self.mutate(|state| {
            state.last_reports.insert(id, report);
            Some(())
        });
    }

    pub(crate) fn set_dark_map_exposures(&self, id: DetectorId, mut exposures: Vec<Duration>) {
        exposures.sort();
        exposures.dedup();
        self.mutate(|state| {
            state.dark_maps.insert(id, exposures);
            Some(())
        });
    }

    /// Runs `f` under the state lock and publishes a snapshot unless it returned `None`.
    fn mutate<R>(&self, f: impl FnOnce(&mut RegistryState) -> Option<R>) -> Option<R> {
        let _ordered = lock(&self.notify_lock);
        let (result, snapshot) = {
            let mut state = lock(&self.state);
            let result = f(&mut state)?;
            (result, state.snapshot())
        };
        self.subscribers.notify(&snapshot);
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use crate::capture::{
        simulated::{SimulatedBackend, SimulatedConfig},
        test_utils::info,
    };

    use super::*;

    fn registry() -> Arc<DetectorRegistry> {
        let (backend, _events) = SimulatedBackend::new(SimulatedConfig::default());
        DetectorRegistry::new(Arc::new(backend))
    }

    #[test]
    fn snapshots_replace_the_list_wholesale() {
        let registry = registry();
        let (a, b, c) = (
            info(DetectorStatus::Idle),
            info(DetectorStatus::Idle),
            info(DetectorStatus::Idle),
        );

        registry.apply_event(DetectorEvent::Snapshot(vec![a.clone(), b]));
        registry.apply_event(DetectorEvent::Snapshot(vec![c.clone()]));

        let ids: Vec<_> = registry.list_detectors().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![c.id]);
        assert!(registry.get(a.id).is_none());
    }

    #[test]
    fn subscribers_receive_complete_snapshots_in_order() {
        let registry = registry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = registry.on_detectors_changed(move |detectors| {
            sink.lock().unwrap().push(detectors.len());
        });

        let a = info(DetectorStatus::Idle);
        registry.apply_event(DetectorEvent::Snapshot(vec![a.clone()]));
        registry.apply_event(DetectorEvent::Snapshot(vec![a, info(DetectorStatus::Idle)]));
        registry.apply_event(DetectorEvent::Snapshot(vec![]));

        subscription.unsubscribe();
        subscription.unsubscribe();
        registry.apply_event(DetectorEvent::Snapshot(vec![info(DetectorStatus::Idle)]));

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn claims_are_exclusive_and_overlay_status() {
        let registry = registry();
        let idle = info(DetectorStatus::Idle);
        let gone = info(DetectorStatus::Disconnected);
        registry.apply_event(DetectorEvent::Snapshot(vec![idle.clone(), gone.clone()]));

        assert_eq!(registry.claim(idle.id).unwrap(), idle.specification);
        assert_eq!(registry.get(idle.id).unwrap().status, DetectorStatus::Capturing);
        assert!(matches!(registry.claim(idle.id), Err(CaptureError::DetectorBusy(_))));
        assert!(matches!(
            registry.claim(gone.id),
            Err(CaptureError::DetectorDisconnected(_))
        ));
        assert!(matches!(
            registry.claim(DetectorId::new_v4()),
            Err(CaptureError::DetectorNotFound(_))
        ));

        // The claim survives a snapshot that still lists the detector.
        registry.apply_event(DetectorEvent::Snapshot(vec![idle.clone()]));
        assert_eq!(registry.get(idle.id).unwrap().status, DetectorStatus::Capturing);

        registry.release(idle.id);
        assert_eq!(registry.get(idle.id).unwrap().status, DetectorStatus::Idle);
    }

    #[test]
    fn annotations_are_kept_across_snapshots() {
        let registry = registry();
        let detector = info(DetectorStatus::Idle);
        registry.apply_event(DetectorEvent::Snapshot(vec![detector.clone()]));
        let ms = Duration::from_millis;
        registry.set_dark_map_exposures(detector.id, vec![ms(200), ms(100), ms(200)]);

        registry.apply_event(DetectorEvent::Snapshot(vec![]));
        registry.apply_event(DetectorEvent::Snapshot(vec![detector.clone()]));

        assert_eq!(
            registry.get(detector.id).unwrap().dark_map_exposures,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn listen_applies_events_until_shutdown() {
        let registry = registry();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.listen(rx);

        let (changed_tx, mut changed_rx) = mpsc::unbounded_channel();
        let _subscription = registry.on_detectors_changed(move |detectors| {
            let _ = changed_tx.send(detectors.len());
        });

        tx.send(DetectorEvent::Snapshot(vec![info(DetectorStatus::Idle)])).unwrap();
        assert_eq!(changed_rx.recv().await, Some(1));

        registry.shutdown();
        // Subscribers were dropped, so the callback's sender is gone.
        assert_eq!(changed_rx.recv().await, None);
    }
}

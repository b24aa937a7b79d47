use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_stream::stream;
use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{pin_mut, StreamExt};
use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{image::PixelBuffer, utils::lock};

use super::{
    backend::{BackendEvent, DetectorBackend, DetectorEvent},
    capture::{BackendError, CaptureSettings, FullWellMode},
    types::{
        CaptureMode, CapturePlan, CaptureRequest, DetectorId, DetectorInfo, DetectorSpecification,
        DetectorStatus,
    },
};

const EVENT_BUFFER: usize = 32;

#[derive(Clone, Debug)]
pub struct SimulatedConfig {
    pub specification: DetectorSpecification,
    /// Time between frames. Defaults to the exposure time of each capture.
    pub frame_interval: Option<Duration>,
    /// When `false` the detector never answers a capture request.
    pub acknowledge: bool,
    /// Fail the capture after this many frames.
    pub fail_after: Option<u32>,
    /// Finish the frame being exposed when a cancel arrives, then stop.
    pub deliver_in_flight: bool,
    pub seed: u64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            specification: DetectorSpecification {
                width: 16,
                height: 8,
            },
            frame_interval: None,
            acknowledge: true,
            fail_after: None,
            deliver_in_flight: false,
            seed: 0x5eed,
        }
    }
}

struct SimulatedDetector {
    specification: DetectorSpecification,
    connected: bool,
    /// Generation and stop token of the running capture.
    capture: Option<(u64, CancellationToken)>,
}

/// An in-process detector driver producing synthetic frames.
pub struct SimulatedBackend {
    config: SimulatedConfig,
    detectors: Arc<Mutex<HashMap<DetectorId, SimulatedDetector>>>,
    order: Mutex<Vec<DetectorId>>,
    next_capture: AtomicU64,
    events: UnboundedSender<DetectorEvent>,
}

impl SimulatedBackend {
    pub fn new(config: SimulatedConfig) -> (Self, UnboundedReceiver<DetectorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let backend = Self {
            config,
            detectors: Arc::new(Mutex::new(HashMap::new())),
            order: Mutex::new(Vec::new()),
            next_capture: AtomicU64::new(0),
            events,
        };
        (backend, rx)
    }

    pub fn add_detector(&self) -> DetectorId {
        let id = DetectorId::new_v4();
        lock(&self.detectors).insert(
            id,
            SimulatedDetector {
                specification: self.config.specification,
                connected: true,
                capture: None,
            },
        );
        lock(&self.order).push(id);
        info!("Simulated detector {id} attached");
        id
    }

    pub fn connect(&self, id: DetectorId) {
        self.set_connected(id, true);
    }

    /// Disconnects the detector, aborting any capture running on it.
    pub fn disconnect(&self, id: DetectorId) {
        self.set_connected(id, false);
    }

    fn set_connected(&self, id: DetectorId, connected: bool) {
        if let Some(detector) = lock(&self.detectors).get_mut(&id) {
            detector.connected = connected;
            if !connected {
                if let Some((_, token)) = detector.capture.take() {
                    token.cancel();
                }
            }
        }
        let _ = self.events.send(self.snapshot());
    }

    pub fn snapshot(&self) -> DetectorEvent {
        let detectors = lock(&self.detectors);
        let list = lock(&self.order)
            .iter()
            .filter_map(|id| {
                detectors.get(id).map(|d| DetectorInfo {
                    id: *id,
                    specification: d.specification,
                    status: if d.connected {
                        DetectorStatus::Idle
                    } else {
                        DetectorStatus::Disconnected
                    },
                })
            })
            .collect();
        DetectorEvent::Snapshot(list)
    }
}

/// Seeded synthetic frames: a diagonal gradient with noise, or a fixed ramp in test mode.
fn synthetic_frames(
    width: u32,
    height: u32,
    settings: CaptureSettings,
    seed: u64,
) -> impl Stream<Item = PixelBuffer> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        let ceiling = match settings.full_well {
            FullWellMode::High => u16::MAX as u32,
            FullWellMode::Low => u16::MAX as u32 / 4,
        };
        loop {
            let data: Vec<u16> = (0..height)
                .flat_map(|y| (0..width).map(move |x| (x, y)))
                .map(|(x, y)| {
                    let base = (x + y) * 256;
                    let value = if settings.test_mode {
                        base
                    } else {
                        base + rng.gen_range(0..512)
                    };
                    value.min(ceiling) as u16
                })
                .collect();

            match PixelBuffer::from_u16(width, height, data) {
                Ok(frame) => yield frame,
                Err(_) => break,
            }
        }
    }
}

#[async_trait]
impl DetectorBackend for SimulatedBackend {
    async fn scan_detectors(&self) -> Result<(), BackendError> {
        self.events
            .send(self.snapshot())
            .map_err(|_| BackendError::new("scan", "nobody is listening for detector events"))
    }

    async fn run_capture(
        &self,
        request: CaptureRequest,
    ) -> Result<mpsc::Receiver<BackendEvent>, BackendError> {
        let CaptureRequest {
            detector_id,
            mode,
            settings,
        } = request;

        let token = CancellationToken::new();
        let generation = self.next_capture.fetch_add(1, Ordering::Relaxed);
        let specification = {
            let mut detectors = lock(&self.detectors);
            let detector = detectors.get_mut(&detector_id).ok_or_else(|| {
                BackendError::new("run_capture", format!("unknown detector {detector_id}"))
            })?;
            if !detector.connected {
                return Err(BackendError::new("run_capture", "detector is disconnected"));
            }
            if let Some((_, previous)) = detector.capture.replace((generation, token.clone())) {
                previous.cancel();
            }
            detector.specification
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let config = self.config.clone();
        let detectors = self.detectors.clone();

        tokio::spawn(async move {
            run_simulated_capture(&config, specification, mode, settings, &token, &tx).await;
            // A newer capture may already own the slot.
            if let Some(detector) = lock(&detectors).get_mut(&detector_id) {
                if detector.capture.as_ref().is_some_and(|(g, _)| *g == generation) {
                    detector.capture = None;
                }
            }
            debug!("Simulated capture on {detector_id} ended");
        });

        Ok(rx)
    }

    async fn cancel_capture(&self, detector_id: DetectorId) -> Result<(), BackendError> {
        if let Some(token) = lock(&self.detectors)
            .get_mut(&detector_id)
            .and_then(|d| d.capture.take())
            .map(|(_, token)| token)
        {
            token.cancel();
        }
        Ok(())
    }
}

async fn run_simulated_capture(
    config: &SimulatedConfig,
    specification: DetectorSpecification,
    mode: CaptureMode,
    settings: CaptureSettings,
    token: &CancellationToken,
    tx: &mpsc::Sender<BackendEvent>,
) {
    if !config.acknowledge {
        // Hold the channel open without answering until someone gives up.
        token.cancelled().await;
        return;
    }
    if tx.send(BackendEvent::Acknowledged).await.is_err() {
        return;
    }

    let (width, height) = settings.frame_size(&specification);
    let interval = config.frame_interval.unwrap_or(mode.exposure_time());
    let deadline = match &mode {
        CaptureMode::Stream(stream) => stream.duration.and_then(|d| Instant::now().checked_add(d)),
        CaptureMode::Sequence(_) => None,
    };
    let frames = synthetic_frames(width, height, settings, config.seed);
    pin_mut!(frames);

    let mut index: u32 = 0;
    let last = loop {
        if mode.total_steps().is_some_and(|total| index >= total)
            || deadline.is_some_and(|deadline| Instant::now() >= deadline)
        {
            break BackendEvent::Finished;
        }
        if config.fail_after == Some(index) {
            break BackendEvent::Failed(BackendError::new(
                "read_buffer",
                format!("simulated fault after {index} frames"),
            ));
        }

        let cancelled = tokio::select! {
            biased;
            _ = token.cancelled() => true,
            _ = sleep(interval) => false,
        };
        if cancelled && !config.deliver_in_flight {
            break BackendEvent::Stopped;
        }

        let Some(buffer) = frames.next().await else {
            break BackendEvent::Failed(BackendError::new("read_buffer", "frame source ended"));
        };
        if tx.send(BackendEvent::Frame { index, buffer }).await.is_err() {
            return;
        }
        index += 1;

        if cancelled {
            break BackendEvent::Stopped;
        }
    };

    let _ = tx.send(last).await;
}

#[cfg(test)]
mod tests {
    use crate::capture::{
        test_utils::{sequence, settings},
        CaptureSettingsBuilder,
    };

    use super::*;

    async fn drain(mut rx: mpsc::Receiver<BackendEvent>) -> Vec<BackendEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_sends_ack_frames_and_finish() {
        let (backend, _events) = SimulatedBackend::new(SimulatedConfig::default());
        let id = backend.add_detector();
        let rx = backend
            .run_capture(CaptureRequest {
                detector_id: id,
                mode: sequence(3, 10),
                settings: settings(),
            })
            .await
            .unwrap();

        let events = drain(rx).await;
        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], BackendEvent::Acknowledged));
        assert!(matches!(events[3], BackendEvent::Frame { index: 2, .. }));
        assert!(matches!(events[4], BackendEvent::Finished));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_follow_the_sensor_window_and_seed() {
        let (backend, _events) = SimulatedBackend::new(SimulatedConfig::default());
        let id = backend.add_detector();
        let request = CaptureRequest {
            detector_id: id,
            mode: sequence(1, 10),
            settings: CaptureSettingsBuilder::new()
                .roi(crate::image::Rect::new(0, 0, 4, 2))
                .build(),
        };

        let first = drain(backend.run_capture(request.clone()).await.unwrap()).await;
        let second = drain(backend.run_capture(request).await.unwrap()).await;
        match (&first[1], &second[1]) {
            (BackendEvent::Frame { buffer: a, .. }, BackendEvent::Frame { buffer: b, .. }) => {
                assert_eq!(a.dimensions(), (4, 2));
                assert_eq!(a, b);
            }
            other => panic!("expected frames, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_detectors_refuse_captures() {
        let (backend, mut events) = SimulatedBackend::new(SimulatedConfig::default());
        let id = backend.add_detector();
        backend.disconnect(id);

        match events.recv().await {
            Some(DetectorEvent::Snapshot(list)) => {
                assert_eq!(list[0].status, DetectorStatus::Disconnected)
            }
            None => panic!("expected a snapshot"),
        }
        let result = backend
            .run_capture(CaptureRequest {
                detector_id: id,
                mode: sequence(1, 10),
                settings: settings(),
            })
            .await;
        assert!(result.is_err());

        backend.connect(id);
        backend.scan_detectors().await.unwrap();
        let _ = events.recv().await;
        match events.recv().await {
            Some(DetectorEvent::Snapshot(list)) => assert_eq!(list[0].status, DetectorStatus::Idle),
            None => panic!("expected a snapshot"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_capture() {
        let (backend, _events) = SimulatedBackend::new(SimulatedConfig::default());
        let id = backend.add_detector();
        let mut rx = backend
            .run_capture(CaptureRequest {
                detector_id: id,
                mode: sequence(10, 10),
                settings: settings(),
            })
            .await
            .unwrap();

        assert!(matches!(rx.recv().await, Some(BackendEvent::Acknowledged)));
        assert!(matches!(rx.recv().await, Some(BackendEvent::Frame { index: 0, .. })));
        backend.cancel_capture(id).await.unwrap();
        backend.cancel_capture(id).await.unwrap();

        let rest = drain(rx).await;
        assert!(matches!(rest.last(), Some(BackendEvent::Stopped)));
        assert!(rest.len() <= 2);
    }
}

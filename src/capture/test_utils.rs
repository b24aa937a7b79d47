use std::{sync::Arc, time::Duration};

use uuid::Uuid;

use super::{
    capture::{CaptureSettings, CaptureSettingsBuilder},
    detector::DetectorRegistry,
    session::{SessionEvent, SessionEvents},
    simulated::{SimulatedBackend, SimulatedConfig},
    types::{
        CaptureMode, DetectorId, DetectorInfo, DetectorSpecification, DetectorStatus,
        SequenceCapture, StreamCapture,
    },
};

pub fn info(status: DetectorStatus) -> DetectorInfo {
    DetectorInfo {
        id: Uuid::new_v4(),
        specification: DetectorSpecification {
            width: 16,
            height: 8,
        },
        status,
    }
}

/// A simulated backend with one connected detector the registry already knows about.
pub fn simulated(
    config: SimulatedConfig,
) -> (Arc<SimulatedBackend>, Arc<DetectorRegistry>, DetectorId) {
    let (backend, _events) = SimulatedBackend::new(config);
    let backend = Arc::new(backend);
    let id = backend.add_detector();

    let registry = DetectorRegistry::new(backend.clone());
    registry.apply_event(backend.snapshot());
    (backend, registry, id)
}

pub fn sequence(num_frames: u32, exposure_ms: u64) -> CaptureMode {
    CaptureMode::Sequence(SequenceCapture {
        num_frames,
        exposure_time: Duration::from_millis(exposure_ms),
    })
}

pub fn stream(exposure_ms: u64, duration: Option<Duration>) -> CaptureMode {
    CaptureMode::Stream(StreamCapture {
        exposure_time: Duration::from_millis(exposure_ms),
        duration,
    })
}

pub fn settings() -> CaptureSettings {
    CaptureSettingsBuilder::new()
        .timeout(Duration::from_secs(1))
        .corrected(false)
        .build()
}

/// Reads events up to and including the terminal one.
pub async fn collect_events(mut events: SessionEvents) -> Vec<SessionEvent> {
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        let terminal = matches!(event, SessionEvent::Terminal(_));
        collected.push(event);
        if terminal {
            break;
        }
    }
    collected
}

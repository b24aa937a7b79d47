use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::image::PixelBuffer;

use super::{
    capture::BackendError,
    types::{CaptureRequest, DetectorId, DetectorInfo},
};

/// Messages from a running capture. A well-behaved backend sends `Acknowledged`,
/// any number of frames, then exactly one of `Finished`, `Stopped` or `Failed`.
#[derive(Debug)]
pub enum BackendEvent {
    Acknowledged,
    Frame { index: u32, buffer: PixelBuffer },
    Finished,
    /// The capture ended because `cancel_capture` was called.
    Stopped,
    Failed(BackendError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum DetectorEvent {
    /// Authoritative list of every known detector.
    Snapshot(Vec<DetectorInfo>),
}

/// The native detector driver as seen from the core.
#[async_trait]
pub trait DetectorBackend: Send + Sync {
    /// Starts a scan. Results arrive later as a [`DetectorEvent::Snapshot`].
    async fn scan_detectors(&self) -> Result<(), BackendError>;

    async fn run_capture(
        &self,
        request: CaptureRequest,
    ) -> Result<mpsc::Receiver<BackendEvent>, BackendError>;

    /// Idempotent; cancelling a detector with no capture running is a no-op.
    async fn cancel_capture(&self, detector_id: DetectorId) -> Result<(), BackendError>;
}

pub mod backend;
pub mod capture;
pub mod capture_manager;
pub mod corrections;
pub mod detector;
pub mod session;
pub mod simulated;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use backend::{BackendEvent, DetectorBackend, DetectorEvent};
pub use capture::{BackendError, CaptureError, CaptureSettings, CaptureSettingsBuilder, FullWellMode};
pub use capture_manager::CaptureManager;
pub use corrections::{dark_correct, DarkMapCatalogue};
pub use detector::{Detector, DetectorRegistry};
pub use session::{CaptureSession, SessionEvent, SessionEvents, SessionOptions, SessionOutcome};
pub use simulated::{SimulatedBackend, SimulatedConfig};
pub use types::{
    CaptureMode, CapturePhase, CapturePlan, CaptureReport, CaptureRequest, DetectorId,
    DetectorInfo, DetectorSpecification, DetectorStatus, PartialFramePolicy, SequenceCapture,
    SessionState, StreamCapture,
};

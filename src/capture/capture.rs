use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use thiserror::Error;

use crate::image::{ImageError, Rect, Region};

use super::types::{DetectorId, DetectorSpecification, SessionState};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[error("{context}: {message}")]
pub struct BackendError {
    pub context: String,
    pub message: String,
}

impl BackendError {
    pub fn new(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum CaptureError {
    #[error("cannot {operation} a session in state {state:?}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },

    #[error("invalid capture settings: {0}")]
    InvalidSettings(String),

    #[error("Detector {0} currently in use")]
    DetectorBusy(DetectorId),

    #[error("Detector {0} not found")]
    DetectorNotFound(DetectorId),

    #[error("Detector {0} is disconnected")]
    DetectorDisconnected(DetectorId),

    #[error("no response from the detector within {0:?}")]
    Timeout(Duration),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("image error: {0}")]
    Image(Arc<ImageError>),
}

impl From<ImageError> for CaptureError {
    fn from(err: ImageError) -> Self {
        CaptureError::Image(Arc::new(err))
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FullWellMode {
    #[default]
    High,
    Low,
}

/// Per-capture detector parameters. Build with [`CaptureSettingsBuilder`].
#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CaptureSettings {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    /// Sensor window in detector pixels.
    pub roi: Option<Rect>,
    pub full_well: FullWellMode,
    pub dds: bool,
    pub test_mode: bool,
    pub corrected: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        CaptureSettingsBuilder::new().build()
    }
}

impl CaptureSettings {
    /// Checks settings that do not depend on the detector.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.timeout.is_zero() {
            return Err(CaptureError::InvalidSettings(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Checks the sensor window against the detector's geometry.
    pub fn validate_for(&self, specification: &DetectorSpecification) -> Result<(), CaptureError> {
        self.validate()?;
        match self.roi {
            Some(roi) if !roi.fits_within(specification.width, specification.height) => {
                Err(CaptureError::InvalidSettings(format!(
                    "ROI {roi:?} does not fit the {}x{} sensor",
                    specification.width, specification.height
                )))
            }
            _ => Ok(()),
        }
    }

    /// Frame dimensions the detector will deliver with these settings.
    pub fn frame_size(&self, specification: &DetectorSpecification) -> (u32, u32) {
        self.roi
            .map(|roi| (roi.width, roi.height))
            .unwrap_or((specification.width, specification.height))
    }
}

pub struct CaptureSettingsBuilder {
    timeout: Duration,
    roi: Option<Rect>,
    full_well: FullWellMode,
    dds: bool,
    test_mode: bool,
    corrected: bool,
}

impl Default for CaptureSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSettingsBuilder {
    pub fn new() -> Self {
        CaptureSettingsBuilder {
            timeout: DEFAULT_TIMEOUT,
            roi: None,
            full_well: FullWellMode::High,
            dds: false,
            test_mode: false,
            corrected: true,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn roi(mut self, roi: Rect) -> Self {
        self.roi = Some(roi);
        self
    }

    pub fn full_well(mut self, full_well: FullWellMode) -> Self {
        self.full_well = full_well;
        self
    }

    pub fn dds(mut self, dds: bool) -> Self {
        self.dds = dds;
        self
    }

    pub fn test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    pub fn corrected(mut self, corrected: bool) -> Self {
        self.corrected = corrected;
        self
    }

    pub fn build(self) -> CaptureSettings {
        CaptureSettings {
            timeout: self.timeout,
            roi: self.roi,
            full_well: self.full_well,
            dds: self.dds,
            test_mode: self.test_mode,
            corrected: self.corrected,
        }
    }
}

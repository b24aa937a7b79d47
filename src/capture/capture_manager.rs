use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use log::{info, warn};

use crate::{
    config::CaptureConfig,
    image::{
        statistics::average_frames, ImageMetadataBuilder, ImageStack, PixelBuffer, Rect, Roi,
    },
    utils::lock,
};

use super::{
    backend::DetectorBackend,
    capture::{CaptureError, CaptureSettings, CaptureSettingsBuilder},
    corrections::{dark_correct, DarkMapCatalogue},
    detector::DetectorRegistry,
    session::{CaptureSession, SessionOptions, SessionOutcome},
    types::{CaptureMode, CapturePlan, DetectorId, SequenceCapture},
};

/// Ties the registry, sessions and dark-map corrections together for callers
/// that want finished image stacks rather than raw session events.
pub struct CaptureManager {
    registry: Arc<DetectorRegistry>,
    config: CaptureConfig,
    dark_maps: Mutex<HashMap<DetectorId, Arc<Mutex<DarkMapCatalogue>>>>,
}

impl CaptureManager {
    pub fn new(backend: Arc<dyn DetectorBackend>, config: CaptureConfig) -> Self {
        Self {
            registry: DetectorRegistry::new(backend),
            config,
            dark_maps: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<DetectorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn session(&self, detector_id: DetectorId) -> CaptureSession {
        CaptureSession::new(
            self.registry.clone(),
            detector_id,
            SessionOptions {
                partial_frame_policy: self.config.partial_frame_policy,
                stream_buffer_size: self.config.stream_buffer_size,
            },
        )
    }

    /// Settings with the configured timeout, for callers that do not need anything special.
    pub fn default_settings(&self) -> CaptureSettings {
        CaptureSettingsBuilder::new()
            .timeout(self.config.default_timeout())
            .build()
    }

    fn catalogue(&self, detector_id: DetectorId) -> Arc<Mutex<DarkMapCatalogue>> {
        lock(&self.dark_maps)
            .entry(detector_id)
            .or_insert_with(|| {
                let dir = self.config.dark_map_dir.join(detector_id.to_string());
                Arc::new(Mutex::new(DarkMapCatalogue::new(dir)))
            })
            .clone()
    }

    /// Reloads the detector's dark maps from disk and publishes their exposures.
    pub fn load_dark_maps(&self, detector_id: DetectorId) -> Vec<Duration> {
        let dir = self.config.dark_map_dir.join(detector_id.to_string());
        let catalogue = DarkMapCatalogue::load(dir);
        let exposures = catalogue.exposures();

        lock(&self.dark_maps).insert(detector_id, Arc::new(Mutex::new(catalogue)));
        self.registry
            .set_dark_map_exposures(detector_id, exposures.clone());
        exposures
    }

    /// Runs one capture to the end and collects its frames into a stack.
    ///
    /// A cancelled capture yields its partial frames, or `None` if there were none.
    pub async fn run_capture(
        &self,
        detector_id: DetectorId,
        settings: CaptureSettings,
        mode: CaptureMode,
    ) -> Result<Option<ImageStack>, CaptureError> {
        let session = self.session(detector_id);
        session.start(settings.clone(), mode.clone()).await?;
        let outcome = session.wait().await?;

        let frames = match outcome {
            SessionOutcome::Completed { frames, .. } => frames,
            SessionOutcome::Cancelled { frames, .. } if frames.is_empty() => return Ok(None),
            SessionOutcome::Cancelled { frames, .. } => frames,
            SessionOutcome::Failed { error, .. } => return Err(error),
        };

        let frames = if settings.corrected {
            self.correct(detector_id, mode.exposure_time(), settings.roi, frames)?
        } else {
            frames
        };

        let metadata = ImageMetadataBuilder::new()
            .capture_mode(mode)
            .capture_settings(settings)
            .detector_id(detector_id)
            .date_created(Utc::now())
            .build();
        Ok(Some(ImageStack::new(frames, metadata)?))
    }

    fn correct(
        &self,
        detector_id: DetectorId,
        exposure: Duration,
        roi: Option<Rect>,
        frames: Vec<Arc<PixelBuffer>>,
    ) -> Result<Vec<Arc<PixelBuffer>>, CaptureError> {
        let Some(frame_size) = frames.first().map(|frame| frame.dimensions()) else {
            return Ok(frames);
        };
        let catalogue = self.catalogue(detector_id);
        let catalogue = lock(&catalogue);
        let Some(dark) = catalogue.get(exposure) else {
            warn!(
                "No dark map for {}ms on {detector_id}, frames left uncorrected",
                exposure.as_millis()
            );
            return Ok(frames);
        };

        // Full-sensor maps are cut down to the capture window.
        let dark = match roi {
            _ if dark.dimensions() == frame_size => Some(dark.clone()),
            Some(roi) => dark
                .apply_roi(&Roi::from(roi))
                .ok()
                .map(|window| Arc::new(window.to_buffer()))
                .filter(|cropped| cropped.dimensions() == frame_size),
            None => None,
        };
        let Some(dark) = dark else {
            warn!(
                "Dark map for {}ms on {detector_id} does not fit {}x{} frames, frames left uncorrected",
                exposure.as_millis(),
                frame_size.0,
                frame_size.1
            );
            return Ok(frames);
        };

        info!("Dark correcting {} frame(s)", frames.len());
        frames
            .iter()
            .map(|frame| -> Result<_, CaptureError> {
                Ok(Arc::new(dark_correct(frame, &dark, self.config.dark_offset)?))
            })
            .collect()
    }

    /// Captures `num_frames` uncorrected frames per exposure, averages them and
    /// stores the result as that exposure's dark map.
    ///
    /// `settings` should match the captures the maps will correct; correction is
    /// always switched off for the dark frames themselves.
    pub async fn generate_dark_maps(
        &self,
        detector_id: DetectorId,
        settings: CaptureSettings,
        exposures: Vec<Duration>,
        num_frames: u32,
    ) -> Result<Vec<Duration>, CaptureError> {
        let catalogue = self.catalogue(detector_id);

        stream::iter(exposures)
            .then(|exposure| {
                let catalogue = catalogue.clone();
                let settings = CaptureSettings {
                    timeout: settings.timeout.max(exposure.saturating_mul(2)),
                    corrected: false,
                    ..settings.clone()
                };
                async move {
                    info!("Capturing dark frames for {}ms", exposure.as_millis());
                    let mode = CaptureMode::Sequence(SequenceCapture {
                        num_frames,
                        exposure_time: exposure,
                    });

                    let stack = self
                        .run_capture(detector_id, settings, mode)
                        .await?
                        .ok_or_else(|| {
                            CaptureError::InvalidSettings(
                                "dark map capture produced no frames".to_string(),
                            )
                        })?;
                    let average = average_frames(stack.images())?;
                    let path = lock(&catalogue).insert(exposure, average)?;
                    info!("Saved dark map to {}", path.display());
                    Ok::<_, CaptureError>(exposure)
                }
            })
            .try_collect::<Vec<_>>()
            .await?;

        let exposures = lock(&catalogue).exposures();
        self.registry
            .set_dark_map_exposures(detector_id, exposures.clone());
        Ok(exposures)
    }
}

use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use log::{error, info};

use cview_capture::{
    capture::{CaptureManager, CaptureMode, SequenceCapture, SimulatedBackend, SimulatedConfig},
    config::AppConfig,
    image::{save_stack, ImageService, ImageView},
    logging::setup_logger,
    utils::datetime_to_filename,
};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("{err}");
        eprintln!("cview-capture: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    setup_logger(&config.log)?;

    let (backend, detector_events) = SimulatedBackend::new(SimulatedConfig::default());
    let backend = Arc::new(backend);
    let manager = CaptureManager::new(backend.clone(), config.capture.clone());
    manager.registry().listen(detector_events);

    let detector_id = backend.add_detector();
    manager.registry().apply_event(backend.snapshot());
    manager.load_dark_maps(detector_id);

    let _detectors = manager.registry().on_detectors_changed(|detectors| {
        for detector in detectors {
            info!("Detector {} is {:?}", detector.id, detector.status);
        }
    });

    let mode = CaptureMode::Sequence(SequenceCapture {
        num_frames: 5,
        exposure_time: Duration::from_millis(100),
    });
    let Some(stack) = manager
        .run_capture(detector_id, manager.default_settings(), mode)
        .await?
    else {
        info!("Capture produced no frames");
        return Ok(());
    };

    let images = ImageService::new();
    let stack = images.add_stack(stack);

    let mut view = ImageView::new(stack.clone());
    view.set_saturation(config.display.saturation()?);
    if let Some(stats) = view.statistics()? {
        info!(
            "Frame 0: mean {:.1}, std dev {:.1}, range {}..{}",
            stats.mean, stats.std_dev, stats.min, stats.max
        );
    }

    let path = PathBuf::from(format!("Capture_{}.tif", datetime_to_filename(Utc::now())));
    let saved = save_stack(&stack, path)?;
    info!("Saved {} frame(s) to {}", stack.depth(), saved.display());

    manager.registry().shutdown();
    Ok(())
}

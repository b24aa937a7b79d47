use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::{error, info, warn};
use rayon::prelude::*;
use regex::Regex;

use crate::image::{open_image, save_image, ImageError, PixelBuffer, SaveFormat};

/// Offset added back after dark subtraction so noise below the dark level survives.
pub const DEFAULT_DARK_OFFSET: u16 = 300;

pub fn dark_map_file_name(exposure: Duration) -> String {
    format!("DarkMap_{}ms.tif", exposure.as_millis())
}

/// Dark maps for one detector, keyed by exposure time and backed by a directory.
#[derive(Debug, Default)]
pub struct DarkMapCatalogue {
    dir: PathBuf,
    maps: BTreeMap<Duration, Arc<PixelBuffer>>,
}

impl DarkMapCatalogue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            maps: BTreeMap::new(),
        }
    }

    /// Reads every `DarkMap_<ms>ms.tif` in `dir`. Unreadable files are skipped.
    pub fn load(dir: impl Into<PathBuf>) -> Self {
        let mut catalogue = Self::new(dir);
        info!("Looking for dark maps at {}", catalogue.dir.display());

        let entries = match fs::read_dir(&catalogue.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Failed to read dark map directory: {err}");
                return catalogue;
            }
        };

        let regex = match Regex::new(r"^DarkMap_(\d+)ms\.tif$") {
            Ok(regex) => regex,
            Err(err) => {
                error!("Invalid dark map pattern: {err}");
                return catalogue;
            }
        };

        for entry in entries.filter_map(Result::ok) {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(exposure_ms) = regex
                .captures(file_name)
                .and_then(|captures| captures.get(1))
                .and_then(|ms| ms.as_str().parse::<u64>().ok())
            else {
                continue;
            };

            let path = entry.path();
            match read_dark_map(&path) {
                Ok(map) => {
                    info!("Found dark map with exp time {exposure_ms}ms at {}", path.display());
                    catalogue
                        .maps
                        .insert(Duration::from_millis(exposure_ms), Arc::new(map));
                }
                Err(err) => error!("Failed to read dark map {}: {err}", path.display()),
            }
        }

        catalogue
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, exposure: Duration) -> Option<&Arc<PixelBuffer>> {
        self.maps.get(&exposure)
    }

    pub fn exposures(&self) -> Vec<Duration> {
        self.maps.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Saves the map next to the others and makes it available for correction.
    pub fn insert(&mut self, exposure: Duration, map: PixelBuffer) -> Result<PathBuf, ImageError> {
        fs::create_dir_all(&self.dir).map_err(|source| ImageError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(dark_map_file_name(exposure));
        save_image(&map, &path, SaveFormat::Tiff)?;
        self.maps.insert(exposure, Arc::new(map));
        Ok(path)
    }
}

fn read_dark_map(path: &Path) -> Result<PixelBuffer, ImageError> {
    let stack = open_image(path)?;
    let first = stack.get_image(0).ok_or(ImageError::EmptyStack)?;
    Ok(first.as_ref().clone())
}

/// `frame - dark + offset`, clamped to the 16-bit range.
pub fn dark_correct(
    frame: &PixelBuffer,
    dark: &PixelBuffer,
    offset: u16,
) -> Result<PixelBuffer, ImageError> {
    if frame.dimensions() != dark.dimensions() {
        return Err(ImageError::DimensionMismatch {
            width: frame.width(),
            height: frame.height(),
            len: dark.len(),
        });
    }

    let frame_values = frame.display_values();
    let dark_values = dark.display_values();
    let corrected = frame_values
        .par_iter()
        .zip(dark_values.par_iter())
        .map(|(&value, &dark)| {
            (value as i32 - dark as i32 + offset as i32).clamp(0, u16::MAX as i32) as u16
        })
        .collect();

    PixelBuffer::from_u16(frame.width(), frame.height(), corrected)
}

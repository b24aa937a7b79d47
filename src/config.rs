use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    capture::{corrections::DEFAULT_DARK_OFFSET, session::DEFAULT_STREAM_BUFFER_SIZE, PartialFramePolicy},
    image::{saturated_colour, SaturationHighlight},
    utils::parse_rgb,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid colour {value:?}: {reason}")]
    InvalidColour { value: String, reason: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.display.saturation()?;
        Ok(config)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub file: Option<PathBuf>,
    pub colored: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            file: None,
            colored: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub default_timeout_ms: u64,
    /// Number of newest frames a stream capture keeps.
    pub stream_buffer_size: usize,
    pub partial_frame_policy: PartialFramePolicy,
    /// Dark maps live in `<dark_map_dir>/<detector id>/`.
    pub dark_map_dir: PathBuf,
    pub dark_offset: u16,
}

impl CaptureConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5000,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            partial_frame_policy: PartialFramePolicy::default(),
            dark_map_dir: PathBuf::from("DarkMaps"),
            dark_offset: DEFAULT_DARK_OFFSET,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    /// Highlighting is off when unset.
    pub saturated_limit: Option<f64>,
    pub saturated_colour: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            saturated_limit: None,
            saturated_colour: "rgb(255, 0, 0)".to_string(),
        }
    }
}

impl DisplayConfig {
    pub fn saturation(&self) -> Result<Option<SaturationHighlight>, ConfigError> {
        let rgb = parse_rgb(&self.saturated_colour).map_err(|reason| ConfigError::InvalidColour {
            value: self.saturated_colour.clone(),
            reason,
        })?;

        Ok(self.saturated_limit.map(|saturated_limit| SaturationHighlight {
            saturated_limit,
            saturated_colour: saturated_colour(rgb),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config = AppConfig::from_json("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.capture.stream_buffer_size, 10);
        assert_eq!(config.capture.dark_offset, 300);
        assert_eq!(config.capture.default_timeout(), Duration::from_secs(5));
        assert_eq!(config.display.saturation().unwrap(), None);
    }

    #[test]
    fn partial_sections_keep_the_other_defaults() {
        let config = AppConfig::from_json(
            r#"{
                "log": { "level": "DEBUG" },
                "capture": { "partial_frame_policy": "IncludeInFlight", "dark_map_dir": "/tmp/maps" },
                "display": { "saturated_limit": 16383.0, "saturated_colour": "rgb(0, 255, 0)" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.log.level, LevelFilter::Debug);
        assert!(config.log.colored);
        assert_eq!(
            config.capture.partial_frame_policy,
            PartialFramePolicy::IncludeInFlight
        );
        assert_eq!(config.capture.dark_map_dir, PathBuf::from("/tmp/maps"));
        assert_eq!(config.capture.default_timeout_ms, 5000);
        assert_eq!(
            config.display.saturation().unwrap(),
            Some(SaturationHighlight {
                saturated_limit: 16383.0,
                saturated_colour: [0, 255, 0, 255],
            })
        );
    }

    #[test]
    fn bad_colours_and_json_are_rejected() {
        assert!(matches!(
            AppConfig::from_json(r#"{ "display": { "saturated_colour": "rgb(1, 2)" } }"#),
            Err(ConfigError::InvalidColour { .. })
        ));
        assert!(matches!(
            AppConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AppConfig::load(dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));

        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "capture": { "stream_buffer_size": 3 } }"#).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap().capture.stream_buffer_size, 3);
    }
}

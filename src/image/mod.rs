pub mod buffer;
pub mod error;
pub mod file;
pub mod render;
pub mod roi;
pub mod service;
pub mod stack;
pub mod statistics;
pub mod view;

pub use buffer::{BufferWindow, ImageU16, PixelBuffer, Sample, SampleData, SampleType};
pub use error::ImageError;
pub use file::{open_image, save_image, save_stack, SaveFormat};
pub use render::{saturated_colour, to_display_raster, DisplaySettings, SaturationHighlight};
pub use roi::{Circle, Point, Rect, Region, Roi};
pub use service::ImageService;
pub use stack::{ImageMetadata, ImageMetadataBuilder, ImageStack, ImageStackId, ImageStackSummary};
pub use statistics::{HistogramBin, LineProfile, LineProfileData, RegionStatistics, SignalToNoise};
pub use view::ImageView;

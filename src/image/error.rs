use std::path::PathBuf;

use thiserror::Error;

use super::{roi::Roi, stack::ImageStackId};

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("pixel ({x}, {y}) is outside the {width}x{height} buffer")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    #[error("region of interest {roi:?} does not fit inside a {width}x{height} buffer")]
    InvalidRoi { roi: Roi, width: u32, height: u32 },

    #[error("{len} samples cannot fill a {width}x{height} buffer")]
    DimensionMismatch { width: u32, height: u32, len: usize },

    #[error("buffer dimensions must be non-zero")]
    EmptyBuffer,

    #[error("an image stack needs at least one frame")]
    EmptyStack,

    #[error("couldn't set slice to {0}")]
    SliceOutOfRange(usize),

    #[error("image stack {0} not found")]
    StackNotFound(ImageStackId),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("couldn't access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("decode error: {0}")]
    Decode(#[from] ::image::ImageError),
}

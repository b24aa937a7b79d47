use std::{
    fs::File,
    io::{BufReader, BufWriter, Seek, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use ::image::{DynamicImage, ImageFormat};
use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use tiff::{
    decoder::{Decoder, DecodingResult},
    encoder::{colortype, TiffEncoder},
};

use super::{
    buffer::{PixelBuffer, SampleData},
    error::ImageError,
    stack::{ImageMetadataBuilder, ImageStack},
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveFormat {
    /// 8-bit greyscale, scaled down from 16 bits.
    Bitmap,
    Tiff,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ImageError + '_ {
    move |source| ImageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn is_tiff(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "tif" | "tiff"))
        .unwrap_or(false)
}

/// Opens a TIFF as a stack of every page, or any other format as one 16-bit frame.
pub fn open_image(path: impl AsRef<Path>) -> Result<ImageStack, ImageError> {
    let path = path.as_ref();
    let frames = if is_tiff(path) {
        open_tiff(path)?
    } else {
        let image = ::image::open(path)?.into_luma16();
        vec![Arc::new(PixelBuffer::try_from(image)?)]
    };

    info!("Opened {} frame(s) from {path:?}", frames.len());
    let metadata = ImageMetadataBuilder::new().date_created(Utc::now()).build();
    ImageStack::new(frames, metadata)
}

fn open_tiff(path: &Path) -> Result<Vec<Arc<PixelBuffer>>, ImageError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut decoder = Decoder::new(BufReader::new(file))?;
    let mut frames = Vec::new();

    loop {
        let (width, height) = decoder.dimensions()?;
        let frame = match decoder.read_image()? {
            DecodingResult::U16(data) => PixelBuffer::from_u16(width, height, data)?,
            DecodingResult::F32(data) => PixelBuffer::from_f32(width, height, data)?,
            _ => {
                return Err(ImageError::UnsupportedFormat(format!(
                    "{path:?}: only 16-bit and 32-bit float greyscale TIFFs are supported"
                )))
            }
        };
        frames.push(Arc::new(frame));

        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }

    Ok(frames)
}

fn write_page<W: Write + Seek>(
    encoder: &mut TiffEncoder<W>,
    buffer: &PixelBuffer,
) -> Result<(), ImageError> {
    let (width, height) = buffer.dimensions();
    match buffer.data() {
        SampleData::U16(data) => encoder.write_image::<colortype::Gray16>(width, height, data)?,
        SampleData::F32(data) => encoder.write_image::<colortype::Gray32Float>(width, height, data)?,
    }
    Ok(())
}

fn create(path: &Path) -> Result<BufWriter<File>, ImageError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(io_error(path))
}

pub fn save_image(
    buffer: &PixelBuffer,
    path: impl AsRef<Path>,
    format: SaveFormat,
) -> Result<(), ImageError> {
    let path = path.as_ref();
    match format {
        SaveFormat::Tiff => {
            let mut writer = create(path)?;
            let mut encoder = TiffEncoder::new(&mut writer)?;
            write_page(&mut encoder, buffer)?;
            drop(encoder);
            writer.flush().map_err(io_error(path))?;
        }
        SaveFormat::Bitmap => {
            DynamicImage::ImageLuma16(buffer.to_luma16())
                .to_luma8()
                .save_with_format(path, ImageFormat::Bmp)?;
        }
    }
    info!("Saved {}x{} image to {path:?}", buffer.width(), buffer.height());
    Ok(())
}

/// Writes every frame of the stack as one page of a multi-page TIFF.
pub fn save_stack(stack: &ImageStack, path: impl AsRef<Path>) -> Result<PathBuf, ImageError> {
    let path = path.as_ref();
    let mut writer = create(path)?;
    {
        let mut encoder = TiffEncoder::new(&mut writer)?;
        for image in stack.images() {
            write_page(&mut encoder, image)?;
        }
    }
    writer.flush().map_err(io_error(path))?;

    info!("Saved stack {} ({} frames) to {path:?}", stack.id(), stack.depth());
    Ok(path.to_path_buf())
}

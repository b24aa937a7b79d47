use std::borrow::Cow;

use ::image::{ImageBuffer, Luma};
use serde::{Deserialize, Serialize};

use super::{
    error::ImageError,
    roi::{Point, Rect, Region, Roi},
};

pub type ImageU16 = ImageBuffer<Luma<u16>, Vec<u16>>;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleType {
    U16,
    F32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Sample {
    U16(u16),
    F32(f32),
}

impl Sample {
    pub fn as_f64(self) -> f64 {
        match self {
            Sample::U16(v) => v as f64,
            Sample::F32(v) => v as f64,
        }
    }

    /// Float samples are clamped into the 16-bit range and truncated.
    pub fn to_u16_clamped(self) -> u16 {
        match self {
            Sample::U16(v) => v,
            Sample::F32(v) if v.is_nan() => 0,
            Sample::F32(v) => v.clamp(0.0, u16::MAX as f32) as u16,
        }
    }
}

/// Borrowed view of a buffer's storage in its native sample type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SampleData<'a> {
    U16(&'a [u16]),
    F32(&'a [f32]),
}

#[derive(Clone, Debug, PartialEq)]
enum Samples {
    U16(Vec<u16>),
    F32(Vec<f32>),
}

/// One frame of samples. The storage length is fixed at `width * height`.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    samples: Samples,
}

impl PixelBuffer {
    pub fn from_u16(width: u32, height: u32, data: Vec<u16>) -> Result<Self, ImageError> {
        check_dimensions(width, height, data.len())?;
        Ok(Self {
            width,
            height,
            samples: Samples::U16(data),
        })
    }

    pub fn from_f32(width: u32, height: u32, data: Vec<f32>) -> Result<Self, ImageError> {
        check_dimensions(width, height, data.len())?;
        Ok(Self {
            width,
            height,
            samples: Samples::F32(data),
        })
    }

    pub fn filled_u16(width: u32, height: u32, value: u16) -> Result<Self, ImageError> {
        let len = (width as usize) * (height as usize);
        Self::from_u16(width, height, vec![value; len])
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn len(&self) -> usize {
        match &self.samples {
            Samples::U16(data) => data.len(),
            Samples::F32(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample_type(&self) -> SampleType {
        match self.samples {
            Samples::U16(_) => SampleType::U16,
            Samples::F32(_) => SampleType::F32,
        }
    }

    pub fn get(&self, x: u32, y: u32) -> Result<Sample, ImageError> {
        if x >= self.width || y >= self.height {
            return Err(ImageError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok(self.sample_at(self.index(x, y)))
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    fn sample_at(&self, idx: usize) -> Sample {
        match &self.samples {
            Samples::U16(data) => Sample::U16(data[idx]),
            Samples::F32(data) => Sample::F32(data[idx]),
        }
    }

    pub fn as_u16(&self) -> Option<&[u16]> {
        match &self.samples {
            Samples::U16(data) => Some(data),
            Samples::F32(_) => None,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.samples {
            Samples::F32(data) => Some(data),
            Samples::U16(_) => None,
        }
    }

    pub fn data(&self) -> SampleData<'_> {
        match &self.samples {
            Samples::U16(data) => SampleData::U16(data),
            Samples::F32(data) => SampleData::F32(data),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Sample> + '_ {
        (0..self.len()).map(move |idx| self.sample_at(idx))
    }

    /// Samples in the 16-bit display domain, borrowed when no conversion is needed.
    pub fn display_values(&self) -> Cow<'_, [u16]> {
        match &self.samples {
            Samples::U16(data) => Cow::Borrowed(data),
            Samples::F32(data) => Cow::Owned(
                data.iter()
                    .map(|&v| Sample::F32(v).to_u16_clamped())
                    .collect(),
            ),
        }
    }

    pub fn to_luma16(&self) -> ImageU16 {
        // Dimensions were validated at construction.
        ImageBuffer::from_fn(self.width, self.height, |x, y| {
            Luma([self.sample_at(self.index(x, y)).to_u16_clamped()])
        })
    }

    /// Read-only window over `roi`, sharing this buffer's storage.
    pub fn apply_roi(&self, roi: &Roi) -> Result<BufferWindow<'_>, ImageError> {
        let bounds = roi.validate(self.width, self.height)?;
        Ok(BufferWindow {
            buffer: self,
            roi: *roi,
            bounds,
        })
    }
}

impl TryFrom<ImageU16> for PixelBuffer {
    type Error = ImageError;

    fn try_from(image: ImageU16) -> Result<Self, Self::Error> {
        let (width, height) = image.dimensions();
        Self::from_u16(width, height, image.into_raw())
    }
}

fn check_dimensions(width: u32, height: u32, len: usize) -> Result<(), ImageError> {
    if width == 0 || height == 0 {
        return Err(ImageError::EmptyBuffer);
    }
    let expected = (width as usize).checked_mul(height as usize);
    if expected != Some(len) {
        return Err(ImageError::DimensionMismatch { width, height, len });
    }
    Ok(())
}

/// A region of a [`PixelBuffer`]. Coordinates passed to [`BufferWindow::get`]
/// are relative to the region's bounding box.
#[derive(Clone, Copy, Debug)]
pub struct BufferWindow<'a> {
    buffer: &'a PixelBuffer,
    roi: Roi,
    bounds: Rect,
}

impl<'a> BufferWindow<'a> {
    pub fn roi(&self) -> &Roi {
        &self.roi
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn width(&self) -> u32 {
        self.bounds.width
    }

    pub fn height(&self) -> u32 {
        self.bounds.height
    }

    pub fn buffer(&self) -> &'a PixelBuffer {
        self.buffer
    }

    pub fn get(&self, x: u32, y: u32) -> Result<Sample, ImageError> {
        if x >= self.bounds.width || y >= self.bounds.height {
            return Err(ImageError::OutOfBounds {
                x,
                y,
                width: self.bounds.width,
                height: self.bounds.height,
            });
        }
        self.buffer.get(self.bounds.pos.x + x, self.bounds.pos.y + y)
    }

    /// Whether the window-relative point lies inside the region itself.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x < self.bounds.width
            && y < self.bounds.height
            && self
                .roi
                .contains(Point::new(self.bounds.pos.x + x, self.bounds.pos.y + y))
    }

    /// Buffer coordinates of every pixel inside the region, row-major.
    pub fn points(&self) -> impl Iterator<Item = Point> + 'a {
        let roi = self.roi;
        self.bounds.points().filter(move |p| roi.contains(*p))
    }

    pub fn samples(&self) -> impl Iterator<Item = Sample> + 'a {
        let buffer = self.buffer;
        self.points()
            .map(move |p| buffer.sample_at(buffer.index(p.x, p.y)))
    }

    /// Copies the bounding box into a new, independent buffer.
    pub fn to_buffer(&self) -> PixelBuffer {
        let Rect { pos, width, height } = self.bounds;
        let rows = (pos.y..pos.y + height).map(|y| {
            let start = self.buffer.index(pos.x, y);
            start..start + width as usize
        });
        let samples = match &self.buffer.samples {
            Samples::U16(data) => Samples::U16(rows.flat_map(|r| data[r].iter().copied()).collect()),
            Samples::F32(data) => Samples::F32(rows.flat_map(|r| data[r].iter().copied()).collect()),
        };
        PixelBuffer {
            width,
            height,
            samples,
        }
    }
}

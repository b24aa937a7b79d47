use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    capture::{CaptureMode, CaptureSettings, DetectorId},
    utils::serialize_dt,
};

use super::{buffer::PixelBuffer, error::ImageError};

pub type ImageStackId = Uuid;

#[derive(Clone, Serialize, Debug, Default)]
pub struct ImageMetadata {
    pub capture_mode: Option<CaptureMode>,
    pub capture_settings: Option<CaptureSettings>,
    pub detector_id: Option<DetectorId>,
    pub date_created: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct ImageMetadataBuilder {
    metadata: ImageMetadata,
}

impl ImageMetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture_mode(&mut self, mode: CaptureMode) -> &mut Self {
        self.metadata.capture_mode = Some(mode);
        self
    }

    pub fn capture_settings(&mut self, settings: CaptureSettings) -> &mut Self {
        self.metadata.capture_settings = Some(settings);
        self
    }

    pub fn detector_id(&mut self, id: DetectorId) -> &mut Self {
        self.metadata.detector_id = Some(id);
        self
    }

    pub fn date_created(&mut self, date: DateTime<Utc>) -> &mut Self {
        self.metadata.date_created = Some(date);
        self
    }

    pub fn build(&self) -> ImageMetadata {
        self.metadata.clone()
    }
}

/// One or more frames of identical dimensions, e.g. the output of a sequence capture.
#[derive(Debug)]
pub struct ImageStack {
    id: ImageStackId,
    images: Vec<Arc<PixelBuffer>>,
    metadata: ImageMetadata,
}

impl ImageStack {
    pub fn new(images: Vec<Arc<PixelBuffer>>, metadata: ImageMetadata) -> Result<Self, ImageError> {
        let first = images.first().ok_or(ImageError::EmptyStack)?;
        let (width, height) = first.dimensions();

        if let Some(odd) = images.iter().find(|img| img.dimensions() != (width, height)) {
            return Err(ImageError::DimensionMismatch {
                width,
                height,
                len: odd.len(),
            });
        }

        Ok(Self {
            id: ImageStackId::new_v4(),
            images,
            metadata,
        })
    }

    pub fn single(image: PixelBuffer) -> Self {
        Self {
            id: ImageStackId::new_v4(),
            images: vec![Arc::new(image)],
            metadata: ImageMetadata::default(),
        }
    }

    pub fn id(&self) -> ImageStackId {
        self.id
    }

    pub fn images(&self) -> &[Arc<PixelBuffer>] {
        &self.images
    }

    pub fn get_image(&self, idx: usize) -> Option<&Arc<PixelBuffer>> {
        self.images.get(idx)
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    pub fn width(&self) -> u32 {
        self.images[0].width()
    }

    pub fn height(&self) -> u32 {
        self.images[0].height()
    }

    pub fn depth(&self) -> usize {
        self.images.len()
    }

    pub fn summary(&self) -> ImageStackSummary {
        ImageStackSummary {
            id: self.id,
            width: self.width(),
            height: self.height(),
            depth: self.depth(),
            timestamp: self.metadata.date_created,
        }
    }
}

/// What subscribers of the image list see for each stack.
#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct ImageStackSummary {
    pub id: ImageStackId,
    pub width: u32,
    pub height: u32,
    pub depth: usize,
    #[serde(serialize_with = "serialize_dt")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_mismatched_stacks() {
        assert!(matches!(
            ImageStack::new(Vec::new(), ImageMetadata::default()),
            Err(ImageError::EmptyStack)
        ));

        let frames = vec![
            Arc::new(PixelBuffer::filled_u16(4, 4, 0).unwrap()),
            Arc::new(PixelBuffer::filled_u16(4, 2, 0).unwrap()),
        ];
        assert!(matches!(
            ImageStack::new(frames, ImageMetadata::default()),
            Err(ImageError::DimensionMismatch { width: 4, height: 4, len: 8 })
        ));
    }

    #[test]
    fn frames_are_shared_not_copied() {
        let frame = Arc::new(PixelBuffer::filled_u16(2, 2, 9).unwrap());
        let stack = ImageStack::new(vec![frame.clone(), frame.clone()], ImageMetadata::default())
            .unwrap();

        assert_eq!(stack.depth(), 2);
        assert!(Arc::ptr_eq(stack.get_image(1).unwrap(), &frame));
        assert_eq!(Arc::strong_count(&frame), 3);
    }

    #[test]
    fn summary_formats_timestamp() {
        let date = "2024-03-26T13:40:00Z".parse().unwrap();
        let metadata = ImageMetadataBuilder::new().date_created(date).build();
        let stack =
            ImageStack::new(vec![Arc::new(PixelBuffer::filled_u16(3, 2, 0).unwrap())], metadata)
                .unwrap();

        let json = serde_json::to_value(stack.summary()).unwrap();
        assert_eq!(json["timestamp"], "03/26/2024 13:40");
        assert_eq!(json["width"], 3);
    }
}

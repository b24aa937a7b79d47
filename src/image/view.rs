use std::sync::Arc;

use ::image::RgbaImage;
use log::debug;

use super::{
    buffer::{BufferWindow, PixelBuffer, Sample},
    error::ImageError,
    render::{to_display_raster, DisplaySettings, SaturationHighlight},
    roi::{Rect, Roi},
    stack::ImageStack,
    statistics::{
        calculate_histogram_min_max, column_profile, region_statistics, snr, HistogramBin,
        LineProfile, RegionStatistics, SignalToNoise,
    },
};

/// Display state for one slice of a shared [`ImageStack`].
///
/// Several views may point at the same stack; none of them can change its pixels.
/// Operations that need a window fall back to the whole frame when no ROI is set.
#[derive(Clone, Debug)]
pub struct ImageView {
    stack: Arc<ImageStack>,
    slice: usize,
    roi: Option<Roi>,
    settings: DisplaySettings,
}

impl ImageView {
    pub fn new(stack: Arc<ImageStack>) -> Self {
        Self {
            stack,
            slice: 0,
            roi: None,
            settings: DisplaySettings::default(),
        }
    }

    pub fn stack(&self) -> &Arc<ImageStack> {
        &self.stack
    }

    pub fn slice(&self) -> usize {
        self.slice
    }

    pub fn set_slice(&mut self, slice: usize) -> Result<(), ImageError> {
        if slice >= self.stack.depth() {
            return Err(ImageError::SliceOutOfRange(slice));
        }
        self.slice = slice;
        Ok(())
    }

    pub fn buffer(&self) -> &Arc<PixelBuffer> {
        // `set_slice` keeps the index below the depth and stacks are never empty.
        &self.stack.images()[self.slice]
    }

    pub fn roi(&self) -> Option<&Roi> {
        self.roi.as_ref()
    }

    /// Validated against the frame before it is stored.
    pub fn set_roi(&mut self, roi: Roi) -> Result<(), ImageError> {
        self.buffer().apply_roi(&roi)?;
        debug!("ROI set to {roi:?} on stack {}", self.stack.id());
        self.roi = Some(roi);
        Ok(())
    }

    pub fn clear_roi(&mut self) {
        self.roi = None;
    }

    pub fn settings(&self) -> &DisplaySettings {
        &self.settings
    }

    pub fn invert_colours(&mut self) {
        self.settings.invert_colours = !self.settings.invert_colours;
    }

    pub fn set_histogram_equalisation(&mut self, enabled: bool) {
        self.settings.histogram_equalisation = enabled;
    }

    pub fn set_saturation(&mut self, saturation: Option<SaturationHighlight>) {
        self.settings.saturation = saturation;
    }

    pub fn pixel_value(&self, x: u32, y: u32) -> Result<Sample, ImageError> {
        self.buffer().get(x, y)
    }

    pub fn render(&self) -> RgbaImage {
        to_display_raster(self.buffer(), &self.settings)
    }

    fn window(&self) -> Result<BufferWindow<'_>, ImageError> {
        let buffer = self.buffer();
        let roi = self
            .roi
            .unwrap_or_else(|| Rect::new(0, 0, buffer.width(), buffer.height()).into());
        buffer.apply_roi(&roi)
    }

    pub fn statistics(&self) -> Result<Option<RegionStatistics>, ImageError> {
        Ok(region_statistics(self.window()?.samples()))
    }

    pub fn histogram(&self, num_bins: u32) -> Result<Vec<HistogramBin>, ImageError> {
        Ok(calculate_histogram_min_max(self.window()?.samples(), num_bins))
    }

    pub fn line_profile(&self) -> Result<LineProfile, ImageError> {
        Ok(column_profile(&self.window()?))
    }

    pub fn snr(&self, window_size: u32, dark_offset: f64) -> Result<Option<SignalToNoise>, ImageError> {
        Ok(snr(&self.window()?, window_size, dark_offset))
    }

    /// Copies the ROI bounding box into a new buffer. The stack is untouched.
    pub fn crop(&self) -> Result<PixelBuffer, ImageError> {
        Ok(self.window()?.to_buffer())
    }
}

#[cfg(test)]
mod tests {
    use crate::image::{roi::Circle, stack::ImageMetadata};

    use super::*;

    fn view() -> ImageView {
        let frames = vec![
            Arc::new(PixelBuffer::from_u16(4, 2, vec![0, 1, 2, 3, 4, 5, 6, 7]).unwrap()),
            Arc::new(PixelBuffer::filled_u16(4, 2, 60000).unwrap()),
        ];
        ImageView::new(Arc::new(
            ImageStack::new(frames, ImageMetadata::default()).unwrap(),
        ))
    }

    #[test]
    fn slices_are_bounds_checked() {
        let mut view = view();
        assert!(view.set_slice(1).is_ok());
        assert_eq!(view.pixel_value(0, 0).unwrap(), Sample::U16(60000));
        assert!(matches!(view.set_slice(2), Err(ImageError::SliceOutOfRange(2))));
        assert_eq!(view.slice(), 1);
    }

    #[test]
    fn invalid_roi_leaves_previous_roi_in_place() {
        let mut view = view();
        view.set_roi(Rect::new(1, 0, 2, 2).into()).unwrap();
        assert!(view.set_roi(Circle::new(1, 1, 1).into()).is_err());
        assert_eq!(view.roi(), Some(&Roi::from(Rect::new(1, 0, 2, 2))));
    }

    #[test]
    fn statistics_default_to_the_whole_frame() {
        let mut view = view();
        let stats = view.statistics().unwrap().unwrap();
        assert_eq!(stats.count, 8);
        assert_eq!(stats.mean, 3.5);

        view.set_roi(Rect::new(2, 0, 2, 2).into()).unwrap();
        let stats = view.statistics().unwrap().unwrap();
        assert_eq!((stats.min, stats.max), (2.0, 7.0));

        let snr = view.snr(1, 0.0).unwrap().unwrap();
        assert_eq!(snr.background, Rect::new(2, 0, 1, 1));
        assert_eq!(snr.foreground, Rect::new(3, 1, 1, 1));
        assert_eq!(snr.snr, 2.5);
    }

    #[test]
    fn crop_creates_an_independent_buffer() {
        let mut view = view();
        view.set_roi(Rect::new(1, 1, 2, 1).into()).unwrap();
        let cropped = view.crop().unwrap();

        assert_eq!(cropped.as_u16().unwrap(), &[5, 6]);
        assert_eq!(view.buffer().len(), 8);
    }

    #[test]
    fn line_profile_averages_columns() {
        let view = view();
        let values: Vec<f64> = view.line_profile().unwrap().iter().map(|p| p.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn toggles_flow_into_rendering() {
        let mut view = view();
        view.set_slice(1).unwrap();
        assert_eq!(view.render().get_pixel(0, 0).0, [234, 234, 234, 255]);

        view.invert_colours();
        assert_eq!(view.render().get_pixel(0, 0).0, [21, 21, 21, 255]);

        view.set_saturation(Some(SaturationHighlight {
            saturated_limit: 50000.0,
            saturated_colour: [255, 0, 0, 255],
        }));
        assert_eq!(view.render().get_pixel(3, 1).0, [255, 0, 0, 255]);
    }

    #[test]
    fn views_share_the_stack() {
        let a = view();
        let b = ImageView::new(a.stack().clone());
        assert!(Arc::ptr_eq(a.buffer(), b.buffer()));
    }
}

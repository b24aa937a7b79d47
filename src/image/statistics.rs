use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

use super::{
    buffer::{BufferWindow, PixelBuffer, Sample},
    error::ImageError,
    roi::{Point, Rect},
};

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct RegionStatistics {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct HistogramBin {
    /// Lower edge of the bin.
    pub range: f64,
    pub count: u32,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct LineProfileData {
    pub idx: u32,
    pub value: f64,
}

pub type LineProfile = Vec<LineProfileData>;

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct SignalToNoise {
    pub snr: f64,
    /// Darkest square.
    pub background: Rect,
    /// Brightest square.
    pub foreground: Rect,
}

/// Population mean and standard deviation. `None` for an empty input.
pub fn region_statistics<I>(samples: I) -> Option<RegionStatistics>
where
    I: IntoIterator<Item = Sample>,
{
    let values: Vec<f64> = samples.into_iter().map(Sample::as_f64).collect();
    if values.is_empty() {
        return None;
    }

    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });

    Some(RegionStatistics {
        count,
        mean,
        std_dev: variance.sqrt(),
        min,
        max,
    })
}

/// Histogram spanning the observed minimum to maximum.
pub fn calculate_histogram_min_max<I>(samples: I, num_bins: u32) -> Vec<HistogramBin>
where
    I: IntoIterator<Item = Sample>,
{
    let values: Vec<f64> = samples.into_iter().map(Sample::as_f64).collect();
    if values.is_empty() || num_bins == 0 {
        return Vec::new();
    }

    let min_value = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_value = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let bin_size = (max_value - min_value) / num_bins as f64;

    let mut bins: Vec<HistogramBin> = (0..num_bins)
        .map(|i| HistogramBin {
            range: min_value + i as f64 * bin_size,
            count: 0,
        })
        .collect();

    for value in values {
        let bin_index = if bin_size > 0.0 {
            ((value - min_value) / bin_size) as usize
        } else {
            0
        };
        bins[bin_index.min(num_bins as usize - 1)].count += 1;
    }

    bins
}

/// Mean of every column of the window, only counting pixels inside the region.
pub fn column_profile(window: &BufferWindow<'_>) -> LineProfile {
    let bounds = window.bounds();
    let buffer = window.buffer();

    (bounds.pos.x..bounds.pos.x + bounds.width)
        .filter_map(|x| {
            let column: Vec<Sample> = (bounds.pos.y..bounds.pos.y + bounds.height)
                .filter(|&y| {
                    window.contains(x - bounds.pos.x, y - bounds.pos.y)
                })
                .filter_map(|y| buffer.get(x, y).ok())
                .collect();
            region_statistics(column).map(|stats| LineProfileData {
                idx: x,
                value: stats.mean,
            })
        })
        .collect()
}

/// Points on the straight line between `start` and `finish`, inclusive.
pub fn get_points_along_line(start: Point, finish: Point) -> Vec<Point> {
    let (x1, y1) = (start.x as i64, start.y as i64);
    let (x2, y2) = (finish.x as i64, finish.y as i64);
    let mut points = Vec::new();

    let dx = (x2 - x1).abs();
    let dy = (y2 - y1).abs();
    let step_x = if x1 < x2 { 1 } else { -1 };
    let step_y = if y1 < y2 { 1 } else { -1 };

    let (mut x, mut y) = (x1, y1);
    let mut err = dx - dy;

    while x != x2 || y != y2 {
        points.push(Point::new(x as u32, y as u32));
        let err2 = 2 * err;
        if err2 > -dy {
            err -= dy;
            x += step_x;
        }
        if err2 < dx {
            err += dx;
            y += step_y;
        }
    }
    points.push(Point::new(x as u32, y as u32));

    points
}

/// Samples along a line, failing if any point leaves the buffer.
pub fn line_profile(buffer: &PixelBuffer, start: Point, finish: Point) -> Result<LineProfile, ImageError> {
    get_points_along_line(start, finish)
        .into_iter()
        .enumerate()
        .map(|(idx, p)| {
            buffer.get(p.x, p.y).map(|sample| LineProfileData {
                idx: idx as u32,
                value: sample.as_f64(),
            })
        })
        .collect()
}

/// Compares the brightest and darkest `window_size` squares inside the window's
/// bounding box: `(fg - bg) / |bg - dark_offset|` over the square means.
///
/// `None` if no square fits.
pub fn snr(window: &BufferWindow<'_>, window_size: u32, dark_offset: f64) -> Option<SignalToNoise> {
    let bounds = window.bounds();
    if window_size == 0 || window_size > bounds.width || window_size > bounds.height {
        return None;
    }
    let buffer = window.buffer();

    let positions: Vec<(u32, u32)> = (0..=bounds.width - window_size)
        .flat_map(|dx| (0..=bounds.height - window_size).map(move |dy| (dx, dy)))
        .collect();
    let squares: Vec<(Rect, f64)> = positions
        .into_par_iter()
        .filter_map(|(dx, dy)| {
            let square = Rect::new(bounds.pos.x + dx, bounds.pos.y + dy, window_size, window_size);
            let samples = (square.pos.y..square.pos.y + window_size)
                .flat_map(|y| (square.pos.x..square.pos.x + window_size).map(move |x| (x, y)))
                .filter_map(|(x, y)| buffer.get(x, y).ok());
            region_statistics(samples).map(|stats| (square, stats.mean))
        })
        .collect();

    let background = squares.iter().min_by(|a, b| a.1.total_cmp(&b.1))?;
    let foreground = squares.iter().max_by(|a, b| a.1.total_cmp(&b.1))?;
    Some(SignalToNoise {
        snr: (foreground.1 - background.1) / (background.1 - dark_offset).abs(),
        background: background.0,
        foreground: foreground.0,
    })
}

/// Per-pixel mean of equally sized frames, rounded into a 16-bit buffer.
pub fn average_frames(frames: &[Arc<PixelBuffer>]) -> Result<PixelBuffer, ImageError> {
    let first = frames.first().ok_or(ImageError::EmptyStack)?;
    let (width, height) = first.dimensions();
    if let Some(odd) = frames.iter().find(|f| f.dimensions() != (width, height)) {
        return Err(ImageError::DimensionMismatch {
            width,
            height,
            len: odd.len(),
        });
    }

    let planes: Vec<_> = frames.iter().map(|f| f.display_values()).collect();
    let count = frames.len() as f64;
    let averaged = (0..first.len())
        .into_par_iter()
        .map(|idx| {
            let sum: f64 = planes.iter().map(|plane| plane[idx] as f64).sum();
            (sum / count).round() as u16
        })
        .collect();

    PixelBuffer::from_u16(width, height, averaged)
}

#[cfg(test)]
mod tests {
    use crate::image::roi::{Circle, Rect};

    use super::*;

    fn buffer(width: u32, height: u32, data: &[u16]) -> PixelBuffer {
        PixelBuffer::from_u16(width, height, data.to_vec()).unwrap()
    }

    #[test]
    fn snr_finds_the_bright_corner() {
        let mut data = vec![400u16; 16];
        for (x, y) in [(2, 2), (3, 2), (2, 3), (3, 3)] {
            data[y * 4 + x] = 1000;
        }
        let img = buffer(4, 4, &data);
        let window = img.apply_roi(&Rect::new(0, 0, 4, 4).into()).unwrap();

        let result = snr(&window, 2, 300.0).unwrap();
        assert_eq!(result.background, Rect::new(0, 0, 2, 2));
        assert_eq!(result.foreground, Rect::new(2, 2, 2, 2));
        assert!((result.snr - 6.0).abs() < 1e-9);

        assert!(snr(&window, 5, 300.0).is_none());
        assert!(snr(&window, 0, 300.0).is_none());
    }

    #[test]
    fn statistics_over_a_window() {
        let img = buffer(3, 2, &[1, 2, 3, 4, 5, 6]);
        let window = img.apply_roi(&Rect::new(1, 0, 2, 2).into()).unwrap();
        let stats = region_statistics(window.samples()).unwrap();

        assert_eq!(stats.count, 4);
        assert_eq!(stats.mean, 4.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 6.0);
        assert!((stats.std_dev - 2.5f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn empty_input_has_no_statistics() {
        assert!(region_statistics(Vec::new()).is_none());
        assert!(calculate_histogram_min_max(Vec::new(), 8).is_empty());
    }

    #[test]
    fn histogram_spans_min_to_max() {
        let img = buffer(4, 1, &[10, 10, 20, 30]);
        let bins = calculate_histogram_min_max(img.iter(), 2);
        assert_eq!(
            bins,
            vec![
                HistogramBin { range: 10.0, count: 2 },
                HistogramBin { range: 20.0, count: 2 },
            ]
        );

        let flat = buffer(2, 1, &[7, 7]);
        let bins = calculate_histogram_min_max(flat.iter(), 4);
        assert_eq!(bins[0].count, 2);
        assert_eq!(bins.iter().map(|b| b.count).sum::<u32>(), 2);
    }

    #[test]
    fn column_profile_respects_the_mask() {
        let img = buffer(3, 3, &[0, 1, 0, 1, 9, 1, 0, 1, 0]);
        let window = img.apply_roi(&Circle::new(1, 1, 1).into()).unwrap();
        let profile = column_profile(&window);

        let values: Vec<_> = profile.iter().map(|p| (p.idx, p.value)).collect();
        assert_eq!(values, vec![(0, 1.0), (1, 11.0 / 3.0), (2, 1.0)]);
    }

    #[test]
    fn line_points_include_both_ends() {
        let points = get_points_along_line(Point::new(0, 0), Point::new(3, 1));
        assert_eq!(points.first(), Some(&Point::new(0, 0)));
        assert_eq!(points.last(), Some(&Point::new(3, 1)));
        assert_eq!(points.len(), 4);
    }

    #[test]
    fn line_profile_fails_outside_the_buffer() {
        let img = buffer(2, 2, &[1, 2, 3, 4]);
        assert!(line_profile(&img, Point::new(0, 0), Point::new(1, 1)).is_ok());
        assert!(matches!(
            line_profile(&img, Point::new(0, 0), Point::new(2, 0)),
            Err(ImageError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn average_rounds_per_pixel() {
        let frames = vec![
            Arc::new(buffer(2, 1, &[10, 0])),
            Arc::new(buffer(2, 1, &[11, 3])),
        ];
        let avg = average_frames(&frames).unwrap();
        assert_eq!(avg.as_u16().unwrap(), &[11, 2]);
        assert!(matches!(average_frames(&[]), Err(ImageError::EmptyStack)));
    }
}

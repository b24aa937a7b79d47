use ::image::RgbaImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::buffer::{PixelBuffer, SampleData};

const RANGE_SIZE: usize = 1 << 16;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SaturationHighlight {
    /// Samples at or above this value are painted with `saturated_colour`.
    pub saturated_limit: f64,
    pub saturated_colour: [u8; 4],
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct DisplaySettings {
    pub histogram_equalisation: bool,
    pub invert_colours: bool,
    pub saturation: Option<SaturationHighlight>,
}

/// Maps `buffer` to an RGBA raster of the same size.
///
/// The stages run in a fixed order: equalise, scale to 8 bits, invert, then
/// the saturation override, which looks at the original sample value.
pub fn to_display_raster(buffer: &PixelBuffer, settings: &DisplaySettings) -> RgbaImage {
    let (width, height) = buffer.dimensions();
    let values = buffer.display_values();
    let lut = settings
        .histogram_equalisation
        .then(|| equalisation_lut(&values));

    let mut raster = RgbaImage::new(width, height);
    raster
        .par_chunks_exact_mut(4)
        .zip(values.par_iter())
        .enumerate()
        .for_each(|(idx, (pixel, &value))| {
            let equalised = lut.as_ref().map_or(value, |lut| lut[value as usize]);
            let mut scaled = (equalised >> 8) as u8;

            if settings.invert_colours {
                scaled = 255 - scaled;
            }

            let rgba = match settings.saturation {
                Some(highlight) if is_saturated(buffer, idx, highlight.saturated_limit) => {
                    highlight.saturated_colour
                }
                _ => [scaled, scaled, scaled, 255],
            };
            pixel.copy_from_slice(&rgba);
        });

    raster
}

fn is_saturated(buffer: &PixelBuffer, idx: usize, limit: f64) -> bool {
    let original = match buffer.data() {
        SampleData::U16(data) => data[idx] as f64,
        SampleData::F32(data) => data[idx] as f64,
    };
    original >= limit
}

pub fn saturated_colour(rgb: [u8; 3]) -> [u8; 4] {
    [rgb[0], rgb[1], rgb[2], 255]
}

pub fn calculate_histogram(values: &[u16]) -> Vec<u32> {
    values
        .par_iter()
        .fold(
            || vec![0u32; RANGE_SIZE],
            |mut histogram, &value| {
                histogram[value as usize] += 1;
                histogram
            },
        )
        .reduce(
            || vec![0u32; RANGE_SIZE],
            |mut a, b| {
                a.iter_mut().zip(b).for_each(|(a, b)| *a += b);
                a
            },
        )
}

/// Maps each 16-bit value through the empirical CDF onto `0..=u16::MAX`.
pub fn equalisation_lut(values: &[u16]) -> Vec<u16> {
    let histogram = calculate_histogram(values);
    let num_pixels = values.len() as f64;
    let max_intensity = u16::MAX as f64;

    let mut cdf: u64 = 0;
    histogram
        .iter()
        .map(|&freq| {
            cdf += freq as u64;
            if num_pixels == 0.0 {
                0
            } else {
                ((cdf as f64 / num_pixels) * max_intensity).round() as u16
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels(raster: &RgbaImage) -> Vec<[u8; 4]> {
        raster.pixels().map(|p| p.0).collect()
    }

    #[test]
    fn default_mapping_shifts_right_by_eight() {
        let buffer = PixelBuffer::from_u16(2, 1, vec![0x00FF, 0xFF00]).unwrap();
        let raster = to_display_raster(&buffer, &DisplaySettings::default());

        assert_eq!(raster.dimensions(), (2, 1));
        assert_eq!(channels(&raster), vec![[0, 0, 0, 255], [255, 255, 255, 255]]);
    }

    #[test]
    fn inversion_twice_round_trips() {
        let data: Vec<u16> = (0..64u16).map(|v| v * 1021).collect();
        let buffer = PixelBuffer::from_u16(8, 8, data).unwrap();
        let plain = to_display_raster(&buffer, &DisplaySettings::default());
        let inverted = to_display_raster(
            &buffer,
            &DisplaySettings {
                invert_colours: true,
                ..Default::default()
            },
        );

        for (p, i) in plain.pixels().zip(inverted.pixels()) {
            assert_eq!(255 - i.0[0], p.0[0]);
            assert_eq!(255 - (255 - i.0[0]), i.0[0]);
            assert_eq!(i.0[3], 255);
        }
    }

    #[test]
    fn equalisation_uses_the_full_output_range() {
        // Values bunched at the bottom of the 16-bit range render almost black without equalisation.
        let buffer = PixelBuffer::from_u16(4, 1, vec![10, 20, 30, 40]).unwrap();
        let plain = to_display_raster(&buffer, &DisplaySettings::default());
        assert!(plain.pixels().all(|p| p.0[0] == 0));

        let equalised = to_display_raster(
            &buffer,
            &DisplaySettings {
                histogram_equalisation: true,
                ..Default::default()
            },
        );
        let values: Vec<u8> = equalised.pixels().map(|p| p.0[0]).collect();
        assert_eq!(values, vec![64, 128, 191, 255]);
    }

    #[test]
    fn saturation_override_wins_over_inversion() {
        let buffer = PixelBuffer::from_u16(3, 1, vec![100, 16383, 20000]).unwrap();
        let settings = DisplaySettings {
            invert_colours: true,
            saturation: Some(SaturationHighlight {
                saturated_limit: 16383.0,
                saturated_colour: saturated_colour([255, 0, 0]),
            }),
            ..Default::default()
        };
        let raster = to_display_raster(&buffer, &settings);

        assert_eq!(
            channels(&raster),
            vec![[255, 255, 255, 255], [255, 0, 0, 255], [255, 0, 0, 255]]
        );
    }

    #[test]
    fn saturation_checks_the_original_value_not_the_equalised_one() {
        let buffer = PixelBuffer::from_u16(2, 1, vec![1, 2]).unwrap();
        let settings = DisplaySettings {
            histogram_equalisation: true,
            saturation: Some(SaturationHighlight {
                saturated_limit: 2.0,
                saturated_colour: [0, 0, 255, 255],
            }),
            ..Default::default()
        };
        let raster = to_display_raster(&buffer, &settings);
        assert_eq!(channels(&raster), vec![[128, 128, 128, 255], [0, 0, 255, 255]]);
    }

    #[test]
    fn float_buffers_render_through_the_clamped_domain() {
        let buffer = PixelBuffer::from_f32(2, 1, vec![-1.0, 70000.0]).unwrap();
        let raster = to_display_raster(&buffer, &DisplaySettings::default());
        assert_eq!(channels(&raster), vec![[0, 0, 0, 255], [255, 255, 255, 255]]);
    }

    #[test]
    fn rendering_is_deterministic() {
        let data: Vec<u16> = (0..100u16).map(|v| v.wrapping_mul(977)).collect();
        let buffer = PixelBuffer::from_u16(10, 10, data).unwrap();
        let settings = DisplaySettings {
            histogram_equalisation: true,
            ..Default::default()
        };
        assert_eq!(
            to_display_raster(&buffer, &settings),
            to_display_raster(&buffer, &settings)
        );
    }
}

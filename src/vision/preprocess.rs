//! Image preprocessing for text recognition
//!
//! Each step is independently toggled by [`PreprocessingOptions`] and works
//! on whatever the previous enabled step produced, so any step can be skipped.
//! Order: normalize, denoise, deskew, contrast/brightness, single channel.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, Rgba, RgbaImage};
use imageproc::filter::median_filter;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Preprocessing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingOptions {
    /// Master switch; when false the image is handed to recognition untouched
    pub enabled: bool,
    /// Rescale so the longer side lies in `[min_dimension, max_dimension]`
    pub normalize: bool,
    pub min_dimension: u32,
    pub max_dimension: u32,
    /// Median filter
    pub denoise: bool,
    pub denoise_radius: u32,
    /// Estimate and correct small rotations
    pub deskew: bool,
    pub max_skew_degrees: f32,
    /// Contrast factor around mid-gray; 1.0 leaves contrast unchanged
    pub contrast: f32,
    /// Brightness offset added to every channel
    pub brightness: i16,
    /// Convert to a single luma channel
    pub grayscale: bool,
}

impl Default for PreprocessingOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            normalize: true,
            min_dimension: 800,
            max_dimension: 2000,
            denoise: true,
            denoise_radius: 1,
            deskew: false,
            max_skew_degrees: 10.0,
            contrast: 1.2,
            brightness: 0,
            grayscale: true,
        }
    }
}

impl PreprocessingOptions {
    /// Every step off
    pub fn passthrough() -> Self {
        Self {
            enabled: false,
            normalize: false,
            denoise: false,
            deskew: false,
            contrast: 1.0,
            brightness: 0,
            grayscale: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.normalize {
            if self.max_dimension == 0 {
                return Err(ConfigError::invalid("preprocessing.max_dimension", "must be positive"));
            }
            if self.min_dimension > self.max_dimension {
                return Err(ConfigError::invalid(
                    "preprocessing.min_dimension",
                    "must not exceed max_dimension",
                ));
            }
        }
        if !(self.contrast > 0.0) {
            return Err(ConfigError::invalid("preprocessing.contrast", "must be positive"));
        }
        if !(self.max_skew_degrees >= 0.0) {
            return Err(ConfigError::invalid("preprocessing.max_skew_degrees", "must not be negative"));
        }
        Ok(())
    }
}

/// Apply the enabled preprocessing steps to a captured RGBA image
pub fn preprocess(image: &RgbaImage, options: &PreprocessingOptions) -> DynamicImage {
    if !options.enabled {
        debug!("OCR preprocessing disabled");
        return DynamicImage::ImageRgba8(image.clone());
    }

    debug!(
        "OCR preprocessing: normalize={}, denoise={}, deskew={}, contrast={}, brightness={}, grayscale={}",
        options.normalize, options.denoise, options.deskew, options.contrast, options.brightness, options.grayscale
    );

    let mut result = if options.normalize {
        normalize_size(image, options.min_dimension, options.max_dimension)
    } else {
        image.clone()
    };

    if options.denoise && options.denoise_radius > 0 {
        result = median_filter(&result, options.denoise_radius, options.denoise_radius);
    }

    if options.deskew {
        let angle = estimate_skew(&to_gray(&result), options.max_skew_degrees);
        if angle.abs() >= 0.5 {
            debug!("Deskewing by {:.1} degrees", angle);
            result = rotate_about_center(
                &result,
                angle.to_radians(),
                Interpolation::Bilinear,
                Rgba([255, 255, 255, 255]),
            );
        }
    }

    if (options.contrast - 1.0).abs() > 0.01 || options.brightness != 0 {
        apply_contrast_brightness(&mut result, options.contrast, options.brightness);
    }

    if options.grayscale {
        DynamicImage::ImageLuma8(to_gray(&result))
    } else {
        DynamicImage::ImageRgba8(result)
    }
}

/// Scale so the longer side fits `[min_dim, max_dim]`, keeping aspect ratio
fn normalize_size(image: &RgbaImage, min_dim: u32, max_dim: u32) -> RgbaImage {
    let (width, height) = image.dimensions();
    let longer = width.max(height);
    if longer == 0 {
        return image.clone();
    }

    let target = longer.clamp(min_dim.min(max_dim), max_dim);
    if target == longer {
        return image.clone();
    }

    let scale = target as f64 / longer as f64;
    let new_w = ((width as f64 * scale).round() as u32).max(1);
    let new_h = ((height as f64 * scale).round() as u32).max(1);
    debug!("Normalizing {}x{} -> {}x{}", width, height, new_w, new_h);
    imageops::resize(image, new_w, new_h, FilterType::Triangle)
}

/// Contrast around the midpoint (128) followed by a brightness offset.
/// Alpha is unchanged.
fn apply_contrast_brightness(image: &mut RgbaImage, factor: f32, offset: i16) {
    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut().take(3) {
            let val = *channel as f32;
            let adjusted = (val - 128.0) * factor + 128.0 + offset as f32;
            *channel = adjusted.clamp(0.0, 255.0) as u8;
        }
    }
}

fn to_gray(image: &RgbaImage) -> GrayImage {
    let (width, height) = image.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let [r, g, b, _] = image.get_pixel(x, y).0;
        let gray = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        Luma([gray.round().clamp(0.0, 255.0) as u8])
    })
}

/// Estimate text skew in degrees by maximizing the variance of the row
/// profile of dark pixels over candidate rotations. The returned angle is
/// the rotation that straightens the text.
pub fn estimate_skew(gray: &GrayImage, max_degrees: f32) -> f32 {
    const PROFILE_WIDTH: u32 = 400;
    const STEP_DEGREES: f32 = 0.5;

    let (width, height) = gray.dimensions();
    if width < 2 || height < 2 || max_degrees <= 0.0 {
        return 0.0;
    }

    let small = if width > PROFILE_WIDTH {
        let new_h = ((height as f64 * PROFILE_WIDTH as f64 / width as f64).round() as u32).max(2);
        imageops::resize(gray, PROFILE_WIDTH, new_h, FilterType::Triangle)
    } else {
        gray.clone()
    };

    let mean = small.pixels().map(|p| p[0] as f64).sum::<f64>() / (small.width() * small.height()) as f64;
    let dark_below = mean as u8;

    let steps = (max_degrees / STEP_DEGREES).floor() as i32;
    let mut best_angle = 0.0f32;
    let mut best_score = f64::MIN;

    for step in -steps..=steps {
        let angle = step as f32 * STEP_DEGREES;
        let rotated = rotate_about_center(&small, angle.to_radians(), Interpolation::Nearest, Luma([255]));
        let score = row_profile_variance(&rotated, dark_below);
        let tie = (score - best_score).abs() <= 1e-9;
        if score > best_score + 1e-9 || (tie && angle.abs() < best_angle.abs()) {
            best_score = score;
            best_angle = angle;
        }
    }

    best_angle
}

fn row_profile_variance(gray: &GrayImage, dark_below: u8) -> f64 {
    let rows: Vec<f64> = gray
        .rows()
        .map(|row| row.filter(|p| p[0] < dark_below).count() as f64)
        .collect();
    if rows.is_empty() {
        return 0.0;
    }
    let n = rows.len() as f64;
    let mean = rows.iter().sum::<f64>() / n;
    rows.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n
}

//! Frame analyzer
//!
//! Turns a preview frame into document presence, position and quality
//! metrics using classical heuristics: luma statistics, Laplacian variance,
//! Sobel edge density over overlapping blocks and a fixed document-sized
//! rectangle anchored at each edge-dense block.
//!
//! Analysis is a pure function of the frame and the settings.

use std::time::Instant;

use image::GrayImage;
use imageproc::gradients::sobel_gradients;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::capture::Frame;
use crate::config::{check_fraction, check_positive_fraction};
use crate::error::{AnalysisError, ConfigError};

/// Tunable thresholds for the analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Minimum document width/height as a fraction of the frame
    pub min_document_size: f64,
    /// Maximum document width/height as a fraction of the frame
    pub max_document_size: f64,
    /// Contrast at which the contrast term of the quality score saturates
    pub min_contrast: f64,
    /// Sharpness at which the sharpness term of the quality score saturates
    pub min_sharpness: f64,
    /// Allowed offset of the document center from the frame center, per axis
    pub position_tolerance: f64,
    /// Quality required before the scan controller considers a frame usable
    pub quality_threshold: f64,
    /// Sobel magnitude above which a pixel counts as an edge
    pub edge_threshold: f64,
    /// Side of the square blocks used for edge density (50% overlap)
    pub block_size: u32,
    /// Edge density bounds (exclusive) for a block to be a document candidate
    pub min_edge_density: f64,
    pub max_edge_density: f64,
    /// Document rectangle as a fraction of the frame
    pub document_width_ratio: f64,
    pub document_height_ratio: f64,
    /// Document rectangle pixel caps
    pub max_document_width: u32,
    pub max_document_height: u32,
    /// Centered rectangle tested when no block qualifies
    pub fallback_width_ratio: f64,
    pub fallback_height_ratio: f64,
    /// Local contrast the centered fallback rectangle must exceed
    pub fallback_min_contrast: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self::lenient()
    }
}

impl AnalysisSettings {
    /// Thresholds tuned for low-end or noisy cameras
    pub fn lenient() -> Self {
        Self {
            min_document_size: 0.15,
            max_document_size: 0.95,
            min_contrast: 0.15,
            min_sharpness: 0.3,
            position_tolerance: 0.2,
            quality_threshold: 0.5,
            edge_threshold: 30.0,
            block_size: 40,
            min_edge_density: 0.15,
            max_edge_density: 0.8,
            document_width_ratio: 0.6,
            document_height_ratio: 0.4,
            max_document_width: 1000,
            max_document_height: 700,
            fallback_width_ratio: 0.7,
            fallback_height_ratio: 0.5,
            fallback_min_contrast: 0.2,
        }
    }

    pub fn strict() -> Self {
        Self {
            min_document_size: 0.3,
            min_contrast: 0.3,
            min_sharpness: 0.5,
            position_tolerance: 0.1,
            quality_threshold: 0.7,
            ..Self::lenient()
        }
    }

    /// Structural check, reported once when a configuration is loaded or a
    /// session is started
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive_fraction("analysis.min_document_size", self.min_document_size)?;
        check_positive_fraction("analysis.max_document_size", self.max_document_size)?;
        if self.min_document_size > self.max_document_size {
            return Err(ConfigError::invalid(
                "analysis.min_document_size",
                "must not exceed max_document_size",
            ));
        }

        // Used as divisors in the quality score
        check_positive_fraction("analysis.min_contrast", self.min_contrast)?;
        check_positive_fraction("analysis.min_sharpness", self.min_sharpness)?;

        check_fraction("analysis.position_tolerance", self.position_tolerance)?;
        check_fraction("analysis.quality_threshold", self.quality_threshold)?;

        if !(self.edge_threshold >= 0.0) {
            return Err(ConfigError::invalid("analysis.edge_threshold", "must not be negative"));
        }
        if self.block_size == 0 {
            return Err(ConfigError::invalid("analysis.block_size", "must be at least 1"));
        }

        check_fraction("analysis.min_edge_density", self.min_edge_density)?;
        check_fraction("analysis.max_edge_density", self.max_edge_density)?;
        if self.min_edge_density >= self.max_edge_density {
            return Err(ConfigError::invalid(
                "analysis.min_edge_density",
                "must be below max_edge_density",
            ));
        }

        check_positive_fraction("analysis.document_width_ratio", self.document_width_ratio)?;
        check_positive_fraction("analysis.document_height_ratio", self.document_height_ratio)?;
        check_positive_fraction("analysis.fallback_width_ratio", self.fallback_width_ratio)?;
        check_positive_fraction("analysis.fallback_height_ratio", self.fallback_height_ratio)?;
        check_fraction("analysis.fallback_min_contrast", self.fallback_min_contrast)?;

        if self.max_document_width == 0 || self.max_document_height == 0 {
            return Err(ConfigError::invalid("analysis.max_document_width", "document caps must be positive"));
        }
        Ok(())
    }
}

/// Axis-aligned rectangle in frame pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.area() == 0
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }
}

/// Metrics for one analyzed frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub has_document: bool,
    pub is_positioned: bool,
    pub quality: f64,
    pub bounding_box: BoundingBox,
    pub sharpness: f64,
    pub contrast: f64,
    pub brightness: f64,
    /// Capture time of the analyzed frame
    #[serde(skip)]
    pub timestamp: Instant,
}

impl AnalysisResult {
    /// Whether this frame is good enough to trigger a capture
    pub fn is_ready(&self, quality_threshold: f64) -> bool {
        self.is_positioned && self.quality >= quality_threshold
    }
}

/// Analyze a frame
pub fn analyze(frame: &Frame, settings: &AnalysisSettings) -> Result<AnalysisResult, AnalysisError> {
    let luma = frame.to_luma()?;
    let (width, height) = luma.dimensions();

    let (mean, std_dev) = region_stats(&luma, BoundingBox::new(0, 0, width, height));
    let contrast = clamp_unit(std_dev / 128.0);
    let brightness = clamp_unit(mean / 255.0);
    let sharpness = clamp_unit(laplacian_variance(&luma) / 10_000.0);

    let edges = EdgeCounts::new(&luma, settings.edge_threshold);
    let bounding_box = locate_document(&luma, &edges, settings);
    let has_document = bounding_box.is_some();
    let bounding_box = bounding_box.unwrap_or_default();

    let is_positioned = has_document && is_centered(&bounding_box, width, height, settings.position_tolerance);

    let quality = quality_score(contrast, sharpness, brightness, settings);

    trace!(
        "Analyzed {}x{} frame: doc={} positioned={} quality={:.3} contrast={:.3} sharpness={:.3} brightness={:.3}",
        width,
        height,
        has_document,
        is_positioned,
        quality,
        contrast,
        sharpness,
        brightness
    );

    Ok(AnalysisResult {
        has_document,
        is_positioned,
        quality,
        bounding_box,
        sharpness,
        contrast,
        brightness,
        timestamp: frame.timestamp(),
    })
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn quality_score(contrast: f64, sharpness: f64, brightness: f64, settings: &AnalysisSettings) -> f64 {
    let contrast_term = (contrast / settings.min_contrast).min(1.0);
    let sharpness_term = (sharpness / settings.min_sharpness).min(1.0);
    let brightness_term = 1.0 - 2.0 * (brightness - 0.5).abs();
    clamp_unit(0.4 * contrast_term + 0.4 * sharpness_term + 0.2 * brightness_term)
}

/// Mean and standard deviation of the luma values inside `region`
fn region_stats(luma: &GrayImage, region: BoundingBox) -> (f64, f64) {
    let count = region.area();
    if count == 0 {
        return (0.0, 0.0);
    }

    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for y in region.y..region.y + region.height {
        for x in region.x..region.x + region.width {
            let v = luma.get_pixel(x, y)[0] as f64;
            sum += v;
            sum_sq += v * v;
        }
    }

    let n = count as f64;
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    (mean, variance.sqrt())
}

/// Variance of the 4-neighbour Laplacian over interior pixels
fn laplacian_variance(luma: &GrayImage) -> f64 {
    let (width, height) = luma.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| luma.get_pixel(x, y)[0] as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let lap = 4.0 * px(x, y) - px(x, y - 1) - px(x - 1, y) - px(x + 1, y) - px(x, y + 1);
            sum += lap;
            sum_sq += lap * lap;
        }
    }

    let n = ((width - 2) as u64 * (height - 2) as u64) as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Summed-area table of edge pixels, for constant-time block density
struct EdgeCounts {
    stride: usize,
    table: Vec<u32>,
}

impl EdgeCounts {
    fn new(luma: &GrayImage, threshold: f64) -> Self {
        let gradients = sobel_gradients(luma);
        let (width, height) = gradients.dimensions();
        let stride = width as usize + 1;
        let mut table = vec![0u32; stride * (height as usize + 1)];

        for y in 0..height as usize {
            let mut row_sum = 0u32;
            for x in 0..width as usize {
                if gradients.get_pixel(x as u32, y as u32)[0] as f64 > threshold {
                    row_sum += 1;
                }
                table[(y + 1) * stride + x + 1] = table[y * stride + x + 1] + row_sum;
            }
        }

        Self { stride, table }
    }

    /// Edge pixels inside `[x, x + w) x [y, y + h)`
    fn count(&self, x: u32, y: u32, w: u32, h: u32) -> u32 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let at = |x: usize, y: usize| self.table[y * self.stride + x];
        at(x1, y1) + at(x0, y0) - at(x1, y0) - at(x0, y1)
    }
}

/// Pick the best document rectangle, if any
fn locate_document(luma: &GrayImage, edges: &EdgeCounts, settings: &AnalysisSettings) -> Option<BoundingBox> {
    let (width, height) = luma.dimensions();

    let mut candidates = edge_dense_candidates(edges, width, height, settings);
    if candidates.is_empty() {
        candidates.extend(centered_fallback(luma, settings));
    }

    trace!("{} document candidates", candidates.len());

    let mut best: Option<(f64, BoundingBox)> = None;
    for candidate in candidates {
        if !fits_size_limits(&candidate, width, height, settings) {
            continue;
        }
        let score = candidate_score(&candidate, width, height);
        if best.map_or(true, |(best_score, _)| score > best_score) {
            best = Some((score, candidate));
        }
    }

    best.map(|(_, bbox)| bbox)
}

fn edge_dense_candidates(
    edges: &EdgeCounts,
    width: u32,
    height: u32,
    settings: &AnalysisSettings,
) -> Vec<BoundingBox> {
    let block = settings.block_size.max(1);
    if width < block || height < block {
        return Vec::new();
    }

    let step = (block / 2).max(1) as usize;
    let block_pixels = (block * block) as f64;
    let mut candidates = Vec::new();

    for by in (0..=height - block).step_by(step) {
        for bx in (0..=width - block).step_by(step) {
            let density = edges.count(bx, by, block, block) as f64 / block_pixels;
            if density > settings.min_edge_density && density < settings.max_edge_density {
                candidates.push(anchor_document(
                    bx + block / 2,
                    by + block / 2,
                    width,
                    height,
                    settings,
                ));
            }
        }
    }

    candidates
}

/// Document-sized rectangle centered on `(cx, cy)`, kept inside the frame
fn anchor_document(cx: u32, cy: u32, width: u32, height: u32, settings: &AnalysisSettings) -> BoundingBox {
    let doc_w = ((width as f64 * settings.document_width_ratio).round() as u32)
        .min(settings.max_document_width)
        .min(width);
    let doc_h = ((height as f64 * settings.document_height_ratio).round() as u32)
        .min(settings.max_document_height)
        .min(height);

    let x = cx.saturating_sub(doc_w / 2).min(width - doc_w);
    let y = cy.saturating_sub(doc_h / 2).min(height - doc_h);

    BoundingBox::new(x, y, doc_w, doc_h)
}

fn centered_fallback(luma: &GrayImage, settings: &AnalysisSettings) -> Option<BoundingBox> {
    let (width, height) = luma.dimensions();
    let w = ((width as f64 * settings.fallback_width_ratio).round() as u32).min(width);
    let h = ((height as f64 * settings.fallback_height_ratio).round() as u32).min(height);
    let region = BoundingBox::new((width - w) / 2, (height - h) / 2, w, h);

    let (_, std_dev) = region_stats(luma, region);
    let local_contrast = clamp_unit(std_dev / 128.0);
    trace!("Fallback region local contrast {:.3}", local_contrast);

    (local_contrast > settings.fallback_min_contrast).then_some(region)
}

fn fits_size_limits(candidate: &BoundingBox, width: u32, height: u32, settings: &AnalysisSettings) -> bool {
    let w_ratio = candidate.width as f64 / width as f64;
    let h_ratio = candidate.height as f64 / height as f64;
    let range = settings.min_document_size..=settings.max_document_size;
    range.contains(&w_ratio) && range.contains(&h_ratio)
}

fn candidate_score(candidate: &BoundingBox, width: u32, height: u32) -> f64 {
    let frame_area = width as f64 * height as f64;
    let size_score = (candidate.area() as f64 / (frame_area * 0.3)).min(1.0);

    let (cx, cy) = candidate.center();
    let distance = ((cx - width as f64 / 2.0).powi(2) + (cy - height as f64 / 2.0).powi(2)).sqrt();
    let position_score = (1.0 - distance / (width as f64 + height as f64)).max(0.0);

    0.7 * size_score + 0.3 * position_score
}

fn is_centered(bbox: &BoundingBox, width: u32, height: u32, tolerance: f64) -> bool {
    let (cx, cy) = bbox.center();
    let dx = (cx / width as f64 - 0.5).abs();
    let dy = (cy / height as f64 - 0.5).abs();
    dx <= tolerance && dy <= tolerance
}

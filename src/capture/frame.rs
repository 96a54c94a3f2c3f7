//! Frame data structures for camera content

use std::time::Instant;

use image::{DynamicImage, GrayImage, RgbaImage};

use crate::error::{AnalysisError, CaptureError};

/// Pixel layout of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel, row-major RGBA
    Rgba8,
    /// 1 byte per pixel, row-major luma
    Luma8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Luma8 => 1,
        }
    }
}

/// A low-resolution preview frame sampled from the camera
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw pixel data
    data: Vec<u8>,
    /// Frame width in pixels
    width: u32,
    /// Frame height in pixels
    height: u32,
    /// Buffer layout
    format: PixelFormat,
    /// Timestamp when frame was captured
    timestamp: Instant,
}

impl Frame {
    /// Create a new RGBA frame stamped with the current time
    pub fn rgba(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self::with_timestamp(data, width, height, PixelFormat::Rgba8, Instant::now())
    }

    /// Create a new luma frame stamped with the current time
    pub fn luma(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self::with_timestamp(data, width, height, PixelFormat::Luma8, Instant::now())
    }

    pub fn with_timestamp(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        timestamp: Instant,
    ) -> Self {
        Self {
            data,
            width,
            height,
            format,
            timestamp,
        }
    }

    pub fn from_image(image: &DynamicImage) -> Self {
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self::rgba(rgba.into_raw(), width, height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Get frame dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Check that the buffer matches the declared size and layout
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.width == 0 || self.height == 0 {
            return Err(AnalysisError::EmptyFrame {
                width: self.width,
                height: self.height,
            });
        }

        let expected = self.width as usize * self.height as usize * self.format.bytes_per_pixel();
        if self.data.len() != expected {
            return Err(AnalysisError::BufferSizeMismatch {
                expected,
                actual: self.data.len(),
            });
        }

        Ok(())
    }

    /// Convert to a luma image using `0.299R + 0.587G + 0.114B`
    pub fn to_luma(&self) -> Result<GrayImage, AnalysisError> {
        self.validate()?;

        let luma = match self.format {
            PixelFormat::Luma8 => self.data.clone(),
            PixelFormat::Rgba8 => self
                .data
                .chunks_exact(4)
                .map(|px| {
                    let y = 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64;
                    y.round().clamp(0.0, 255.0) as u8
                })
                .collect(),
        };

        GrayImage::from_raw(self.width, self.height, luma).ok_or(AnalysisError::BufferSizeMismatch {
            expected: self.width as usize * self.height as usize,
            actual: self.data.len() / self.format.bytes_per_pixel(),
        })
    }
}

/// A one-shot high-resolution still handed to the extraction engine
#[derive(Debug, Clone)]
pub struct CapturedImage {
    image: RgbaImage,
    captured_at: Instant,
}

impl CapturedImage {
    pub fn new(image: RgbaImage) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
        }
    }

    /// Build from raw RGBA bytes, rejecting mismatched or empty buffers
    pub fn from_rgba(data: Vec<u8>, width: u32, height: u32) -> Result<Self, CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::EmptyImage);
        }
        RgbaImage::from_raw(width, height, data)
            .map(Self::new)
            .ok_or_else(|| CaptureError::Device(format!("buffer does not match {width}x{height} RGBA")))
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

impl From<DynamicImage> for CapturedImage {
    fn from(image: DynamicImage) -> Self {
        Self::new(image.to_rgba8())
    }
}

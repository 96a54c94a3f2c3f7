//! Camera Capture Layer
//!
//! The core only needs two primitives from the camera layer: a non-blocking
//! preview frame and a one-shot high-resolution capture. Device enumeration,
//! permissions and stream lifecycle live behind the [`FrameSource`] trait.

pub mod frame;

use async_trait::async_trait;
use image::{DynamicImage, RgbaImage};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::error::CaptureError;

pub use frame::{CapturedImage, Frame, PixelFormat};

/// Source of camera frames
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Most recent preview frame, if one is available. Must not block.
    fn next_frame(&self) -> Option<Frame>;

    /// One-shot high-resolution capture. May take a while.
    async fn capture_high_res(&self) -> Result<CapturedImage, CaptureError>;

    /// Camera readiness as reported by the permission/lifecycle layer.
    /// `false` means the camera may not be used.
    fn readiness(&self) -> watch::Receiver<bool>;
}

/// Frame source that replays a single still image, for demos and tests
pub struct StillFrameSource {
    preview: Frame,
    high_res: RgbaImage,
    ready_tx: watch::Sender<bool>,
    captures: Mutex<u32>,
}

impl StillFrameSource {
    /// Use the image for both preview frames and high-resolution captures
    pub fn new(image: &DynamicImage) -> Self {
        Self::with_preview(Frame::from_image(image), image.to_rgba8())
    }

    pub fn with_preview(preview: Frame, high_res: RgbaImage) -> Self {
        let (ready_tx, _) = watch::channel(true);
        Self {
            preview,
            high_res,
            ready_tx,
            captures: Mutex::new(0),
        }
    }

    /// Grant or revoke camera readiness
    pub fn set_ready(&self, ready: bool) {
        self.ready_tx.send_replace(ready);
    }

    /// Number of high-resolution captures served so far
    pub fn capture_count(&self) -> u32 {
        *self.captures.lock()
    }
}

#[async_trait]
impl FrameSource for StillFrameSource {
    fn next_frame(&self) -> Option<Frame> {
        Some(Frame::with_timestamp(
            self.preview.data().to_vec(),
            self.preview.width(),
            self.preview.height(),
            self.preview.format(),
            std::time::Instant::now(),
        ))
    }

    async fn capture_high_res(&self) -> Result<CapturedImage, CaptureError> {
        if !*self.ready_tx.borrow() {
            return Err(CaptureError::Unavailable("camera not ready".to_string()));
        }
        let count = {
            let mut captures = self.captures.lock();
            *captures += 1;
            *captures
        };
        debug!("Serving still capture #{}", count);
        Ok(CapturedImage::new(self.high_res.clone()))
    }

    fn readiness(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }
}

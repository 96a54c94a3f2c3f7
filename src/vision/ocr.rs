//! Text recognition backend
//!
//! The OCR engine itself is an external collaborator. The extraction engine
//! only needs raw text and a confidence number from it.

use std::sync::atomic::{AtomicU32, Ordering};

use image::DynamicImage;
use tracing::debug;

use crate::error::RecognitionError;

/// Raw output of a recognition backend
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedText {
    /// Recognized text, lines separated by `\n`
    pub text: String,
    /// Backend confidence, nominally 0.0 - 1.0 (not trusted to be in range)
    pub confidence: f64,
}

/// OCR backend. Recognition is CPU-bound and is always called off the
/// frame sampling task.
pub trait RecognitionBackend: Send + Sync {
    fn recognize(&self, image: &DynamicImage) -> Result<RecognizedText, RecognitionError>;
}

/// Backend that returns the same text for every image.
///
/// Useful for demos and for replaying text produced by another OCR tool.
pub struct FixedTextBackend {
    text: String,
    confidence: f64,
    calls: AtomicU32,
}

impl FixedTextBackend {
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence,
            calls: AtomicU32::new(0),
        }
    }

    /// Number of images recognized so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RecognitionBackend for FixedTextBackend {
    fn recognize(&self, image: &DynamicImage) -> Result<RecognizedText, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Fixed-text recognition on {}x{} image",
            image.width(),
            image.height()
        );
        Ok(RecognizedText {
            text: self.text.clone(),
            confidence: self.confidence,
        })
    }
}

//! Error taxonomy
//!
//! Per-attempt errors (capture, recognition) are folded into the scan
//! controller's retry logic and only surface through the terminal outcome.
//! Structural errors are reported once, when configuration is validated.

use thiserror::Error;

/// A frame could not be analyzed. The tick is skipped, the session continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("frame has zero size ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },

    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    BufferSizeMismatch { expected: usize, actual: usize },
}

/// The frame source failed to deliver a high-resolution image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),

    #[error("capture failed: {0}")]
    Device(String),

    #[error("captured image is empty")]
    EmptyImage,
}

/// The recognition backend produced nothing usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecognitionError {
    #[error("recognition backend returned no text")]
    NoText,

    #[error("recognition backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Recognition(#[from] RecognitionError),

    #[error("captured image has zero size")]
    EmptyImage,

    #[error("extraction cancelled")]
    Cancelled,
}

/// Structural configuration errors, reported at configuration time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid pattern for field `{field}` of {document_type}: {source}")]
    Pattern {
        document_type: String,
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("unknown field name `{0}`")]
    UnknownField(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Why a capture attempt, a manual scan request or a whole session did not
/// produce an accepted result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScanFailure {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("confidence {confidence:.2} below threshold {threshold:.2}")]
    LowConfidence { confidence: f64, threshold: f64 },

    #[error("all {attempts} capture attempts used")]
    AttemptsExhausted { attempts: u32 },

    #[error("a capture is already in flight")]
    Busy,

    #[error("no active scan session")]
    Inactive,

    #[error("scan cancelled")]
    Cancelled,

    #[error("camera permission revoked")]
    PermissionRevoked,

    #[error("auto-entry timeout elapsed")]
    TimedOut,
}

/// A session could not be started.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("camera is not ready")]
    NotReady,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

//! id-scan - live ID-document capture
//!
//! Watches a camera preview for a well-positioned ID document, captures a
//! still when the frame is good enough, recognizes its text and extracts
//! named fields with a confidence score.

pub mod capture;
pub mod config;
pub mod error;
pub mod extraction;
pub mod pipeline;
pub mod scan;
pub mod vision;

pub use capture::{CapturedImage, Frame, FrameSource, PixelFormat, StillFrameSource};
pub use config::{AppConfig, DetectionProfile};
pub use error::{
    AnalysisError, CaptureError, ConfigError, ExtractionError, RecognitionError, ScanFailure, StartError,
};
pub use extraction::{
    validate, DocumentType, ExtractionEngine, ExtractionResult, FieldName, ValidationResult,
};
pub use pipeline::{PipelineSettings, ScanPipeline, SessionHandle};
pub use scan::{ScanEvent, ScanOutcome, ScanSettings};
pub use vision::{analyze, AnalysisResult, AnalysisSettings, PreprocessingOptions, RecognitionBackend};

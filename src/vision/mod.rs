//! Vision Layer
//!
//! Frame analysis on low-resolution previews, and preprocessing plus text
//! recognition on high-resolution captures.

pub mod analyzer;
pub mod ocr;
pub mod preprocess;

pub use analyzer::{analyze, AnalysisResult, AnalysisSettings, BoundingBox};
pub use ocr::{FixedTextBackend, RecognitionBackend, RecognizedText};
pub use preprocess::{preprocess, PreprocessingOptions};

//! Extraction Engine
//!
//! Turns a captured document image into structured fields:
//! preprocessing, recognition, document classification, pattern-based field
//! extraction and a combined confidence score.

pub mod schema;
pub mod validation;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::capture::CapturedImage;
use crate::error::{ExtractionError, RecognitionError};
use crate::vision::preprocess::{preprocess, PreprocessingOptions};
use crate::vision::RecognitionBackend;

pub use schema::{DocumentType, FieldName, FieldSchema, SchemaConfig, SchemaRegistry};
pub use validation::{validate, validate_with_schema, ValidationResult};

/// Confidence bonus for each key field found
const KEY_FIELD_BONUS: f64 = 0.1;

/// Structured result of one capture attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub raw_text: String,
    pub document_type: DocumentType,
    pub fields: BTreeMap<FieldName, String>,
    /// Combined confidence (0.0 - 1.0)
    pub confidence: f64,
}

impl ExtractionResult {
    pub fn field(&self, name: FieldName) -> Option<&str> {
        self.fields.get(&name).map(String::as_str)
    }
}

/// Extraction engine bound to a recognition backend and a schema set
pub struct ExtractionEngine {
    backend: Arc<dyn RecognitionBackend>,
    schemas: SchemaRegistry,
}

impl ExtractionEngine {
    /// Create an engine with the built-in schemas
    pub fn new(backend: Arc<dyn RecognitionBackend>) -> Self {
        Self::with_schemas(backend, SchemaRegistry::builtin())
    }

    pub fn with_schemas(backend: Arc<dyn RecognitionBackend>, schemas: SchemaRegistry) -> Self {
        Self { backend, schemas }
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Run the full extraction pipeline on a captured image
    pub fn extract(
        &self,
        image: &CapturedImage,
        options: &PreprocessingOptions,
    ) -> Result<ExtractionResult, ExtractionError> {
        self.extract_cancellable(image, options, &CancellationToken::new())
    }

    /// Same as [`extract`](Self::extract), checking `cancel` between stages
    pub fn extract_cancellable(
        &self,
        image: &CapturedImage,
        options: &PreprocessingOptions,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult, ExtractionError> {
        let start = Instant::now();
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(ExtractionError::EmptyImage);
        }

        let prepared = preprocess(image.image(), options);
        debug!(
            "Preprocessed {}x{} capture to {}x{} in {:?}",
            width,
            height,
            prepared.width(),
            prepared.height(),
            start.elapsed()
        );

        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }

        let recognized = self.backend.recognize(&prepared)?;
        if recognized.text.trim().is_empty() {
            return Err(RecognitionError::NoText.into());
        }

        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }

        let result = self.extract_from_text(&recognized.text, recognized.confidence);
        info!(
            "Extracted {} fields from {} (confidence {:.2}) in {:?}",
            result.fields.len(),
            result.document_type,
            result.confidence,
            start.elapsed()
        );
        Ok(result)
    }

    /// Classification, field extraction and scoring on already recognized text
    pub fn extract_from_text(&self, raw_text: &str, backend_confidence: f64) -> ExtractionResult {
        let document_type = DocumentType::classify(raw_text);
        let schema = self.schemas.get(document_type);
        let fields = extract_fields(raw_text, &schema);
        let confidence = score_confidence(backend_confidence, &fields, &schema);

        ExtractionResult {
            raw_text: raw_text.to_string(),
            document_type,
            fields,
            confidence,
        }
    }

    /// Validate fields against this engine's schema for the type
    pub fn validate(&self, fields: &BTreeMap<FieldName, String>, document_type: DocumentType) -> ValidationResult {
        validate_with_schema(fields, &self.schemas.get(document_type))
    }
}

/// Run every schema pattern over the text. Values are trimmed and
/// whitespace-collapsed; a full name fills first/last name when neither
/// matched on its own.
pub fn extract_fields(text: &str, schema: &FieldSchema) -> BTreeMap<FieldName, String> {
    let mut fields = BTreeMap::new();

    for field in schema.fields() {
        let value = field
            .pattern
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| collapse_whitespace(m.as_str()));

        if let Some(value) = value.filter(|v| !v.is_empty()) {
            debug!("Field {} = {:?}", field.name, value);
            fields.insert(field.name, value);
        }
    }

    let has_split_name = fields.contains_key(&FieldName::FirstName) || fields.contains_key(&FieldName::LastName);
    if !has_split_name {
        if let Some(full_name) = fields.get(&FieldName::FullName).cloned() {
            let mut tokens = full_name.split_whitespace();
            if let Some(first) = tokens.next() {
                fields.insert(FieldName::FirstName, first.to_string());
            }
            let rest = tokens.collect::<Vec<_>>().join(" ");
            if !rest.is_empty() {
                fields.insert(FieldName::LastName, rest);
            }
        }
    }

    fields
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Backend confidence averaged with the schema coverage, plus a bonus per
/// key field, clamped to `[0, 1]`
pub fn score_confidence(backend_confidence: f64, fields: &BTreeMap<FieldName, String>, schema: &FieldSchema) -> f64 {
    let backend = if backend_confidence.is_nan() { 0.0 } else { backend_confidence };

    let total = schema.len();
    let extracted = schema.field_names().filter(|name| fields.contains_key(name)).count();
    let coverage = if total == 0 { 0.0 } else { extracted as f64 / total as f64 };

    let key_fields = fields.keys().filter(|name| name.is_key_field()).count();

    let confidence = (backend + coverage) / 2.0 + KEY_FIELD_BONUS * key_fields as f64;
    confidence.clamp(0.0, 1.0)
}

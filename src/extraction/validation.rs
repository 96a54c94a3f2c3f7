//! Field validation against a document schema

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::schema::{DocumentType, FieldName, FieldSchema, SchemaRegistry};

static DATE_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,2}[/\-]\d{1,2}[/\-]\d{2,4}$").expect("valid date pattern"));

/// Outcome of validating a field map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Missing required fields
    pub errors: BTreeMap<FieldName, String>,
    /// Suspicious but acceptable values
    pub warnings: BTreeMap<FieldName, String>,
}

/// Validate fields against the built-in schema for `document_type`
pub fn validate(fields: &BTreeMap<FieldName, String>, document_type: DocumentType) -> ValidationResult {
    let schema = SchemaRegistry::builtin().get(document_type);
    validate_with_schema(fields, &schema)
}

pub fn validate_with_schema(fields: &BTreeMap<FieldName, String>, schema: &FieldSchema) -> ValidationResult {
    let mut result = ValidationResult::default();

    for name in schema.required() {
        let present = fields.get(&name).is_some_and(|v| !v.trim().is_empty());
        if !present {
            result.errors.insert(name, format!("{} is required", name.label()));
        }
    }

    for (name, value) in fields {
        let value = value.trim();
        if name.is_date() && !value.is_empty() && !DATE_FORMAT.is_match(value) {
            result.warnings.insert(
                *name,
                format!("{} `{}` is not in MM/DD/YYYY format", name.label(), value),
            );
        }
    }

    result.is_valid = result.errors.is_empty();
    result
}

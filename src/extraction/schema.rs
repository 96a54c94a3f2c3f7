//! Document types and their field schemas
//!
//! A schema lists the fields of a document type in display order, which of
//! them are required, and the pattern whose first capture group yields each
//! field's value from the recognized text.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// Supported document classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    DriversLicense,
    Passport,
    NationalId,
}

impl DocumentType {
    pub const ALL: [DocumentType; 3] = [
        DocumentType::DriversLicense,
        DocumentType::Passport,
        DocumentType::NationalId,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::DriversLicense => "drivers_license",
            DocumentType::Passport => "passport",
            DocumentType::NationalId => "national_id",
        }
    }

    /// Classify recognized text by keyword. Drivers license is the default.
    pub fn classify(text: &str) -> Self {
        let lower = text.to_lowercase();
        let has_any = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

        if has_any(&["driver", "license", "dmv"]) {
            DocumentType::DriversLicense
        } else if has_any(&["passport", "nationality"]) {
            DocumentType::Passport
        } else if has_any(&["national id", "ssn"]) {
            DocumentType::NationalId
        } else {
            DocumentType::DriversLicense
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConfigError::invalid("document_type", format!("unknown document type `{s}`")))
    }
}

/// Named fields that can be extracted from a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldName {
    FirstName,
    LastName,
    FullName,
    DateOfBirth,
    LicenseNumber,
    PassportNumber,
    IdNumber,
    ExpirationDate,
    IssueDate,
    Address,
    Nationality,
    Sex,
}

impl FieldName {
    pub const ALL: [FieldName; 12] = [
        FieldName::FirstName,
        FieldName::LastName,
        FieldName::FullName,
        FieldName::DateOfBirth,
        FieldName::LicenseNumber,
        FieldName::PassportNumber,
        FieldName::IdNumber,
        FieldName::ExpirationDate,
        FieldName::IssueDate,
        FieldName::Address,
        FieldName::Nationality,
        FieldName::Sex,
    ];

    /// Key used in serialized field maps
    pub fn key(self) -> &'static str {
        match self {
            FieldName::FirstName => "firstName",
            FieldName::LastName => "lastName",
            FieldName::FullName => "fullName",
            FieldName::DateOfBirth => "dateOfBirth",
            FieldName::LicenseNumber => "licenseNumber",
            FieldName::PassportNumber => "passportNumber",
            FieldName::IdNumber => "idNumber",
            FieldName::ExpirationDate => "expirationDate",
            FieldName::IssueDate => "issueDate",
            FieldName::Address => "address",
            FieldName::Nationality => "nationality",
            FieldName::Sex => "sex",
        }
    }

    /// Human readable label
    pub fn label(self) -> &'static str {
        match self {
            FieldName::FirstName => "First name",
            FieldName::LastName => "Last name",
            FieldName::FullName => "Full name",
            FieldName::DateOfBirth => "Date of birth",
            FieldName::LicenseNumber => "License number",
            FieldName::PassportNumber => "Passport number",
            FieldName::IdNumber => "ID number",
            FieldName::ExpirationDate => "Expiration date",
            FieldName::IssueDate => "Issue date",
            FieldName::Address => "Address",
            FieldName::Nationality => "Nationality",
            FieldName::Sex => "Sex",
        }
    }

    /// Fields whose values are expected to look like dates
    pub fn is_date(self) -> bool {
        matches!(
            self,
            FieldName::DateOfBirth | FieldName::ExpirationDate | FieldName::IssueDate
        )
    }

    /// Fields that earn a confidence bonus when found
    pub fn is_key_field(self) -> bool {
        matches!(
            self,
            FieldName::FirstName | FieldName::LastName | FieldName::DateOfBirth
        )
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for FieldName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldName::ALL
            .into_iter()
            .find(|f| f.key() == s)
            .ok_or_else(|| ConfigError::UnknownField(s.to_string()))
    }
}

/// Field definition as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: FieldName,
    /// Regular expression; the first capture group is the field value
    pub pattern: String,
    #[serde(default)]
    pub required: bool,
}

/// Schema definition as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub document_type: DocumentType,
    pub fields: Vec<FieldConfig>,
}

/// One compiled field pattern
#[derive(Debug, Clone)]
pub struct FieldPattern {
    pub name: FieldName,
    pub pattern: Regex,
    pub required: bool,
}

/// Compiled schema for one document type
#[derive(Debug, Clone)]
pub struct FieldSchema {
    document_type: DocumentType,
    fields: Vec<FieldPattern>,
}

impl FieldSchema {
    pub fn compile(config: &SchemaConfig) -> Result<Self, ConfigError> {
        let fields = config
            .fields
            .iter()
            .map(|field| {
                Regex::new(&field.pattern)
                    .map(|pattern| FieldPattern {
                        name: field.name,
                        pattern,
                        required: field.required,
                    })
                    .map_err(|source| ConfigError::Pattern {
                        document_type: config.document_type.to_string(),
                        field: field.name.to_string(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if fields.is_empty() {
            return Err(ConfigError::invalid(
                "schemas.fields",
                format!("schema for {} has no fields", config.document_type),
            ));
        }

        Ok(Self {
            document_type: config.document_type,
            fields,
        })
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    /// Fields in schema order
    pub fn fields(&self) -> &[FieldPattern] {
        &self.fields
    }

    pub fn field_names(&self) -> impl Iterator<Item = FieldName> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    pub fn required(&self) -> impl Iterator<Item = FieldName> + '_ {
        self.fields.iter().filter(|f| f.required).map(|f| f.name)
    }

    pub fn contains(&self, name: FieldName) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Schemas keyed by document type.
///
/// A drivers-license schema is always present; lookups for a type without a
/// schema fall back to it.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<DocumentType, Arc<FieldSchema>>,
}

static BUILTIN: Lazy<SchemaRegistry> = Lazy::new(|| {
    let schemas = builtin_schema_configs()
        .iter()
        .map(|config| {
            let schema = FieldSchema::compile(config).expect("builtin field patterns compile");
            (config.document_type, Arc::new(schema))
        })
        .collect();
    SchemaRegistry { schemas }
});

impl SchemaRegistry {
    /// Built-in schemas for every document type
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// Built-in schemas with the given schemas replacing them per type
    pub fn with_overrides(overrides: &[SchemaConfig]) -> Result<Self, ConfigError> {
        let mut registry = Self::builtin();
        for config in overrides {
            registry.insert(FieldSchema::compile(config)?);
        }
        Ok(registry)
    }

    /// Only the given schemas, plus the built-in drivers-license fallback
    /// when none is supplied for it
    pub fn from_configs(configs: &[SchemaConfig]) -> Result<Self, ConfigError> {
        let mut schemas = HashMap::new();
        for config in configs {
            schemas.insert(config.document_type, Arc::new(FieldSchema::compile(config)?));
        }
        if !schemas.contains_key(&DocumentType::DriversLicense) {
            if let Some(fallback) = BUILTIN.schemas.get(&DocumentType::DriversLicense) {
                schemas.insert(DocumentType::DriversLicense, fallback.clone());
            }
        }
        Ok(Self { schemas })
    }

    pub fn insert(&mut self, schema: FieldSchema) {
        self.schemas.insert(schema.document_type, Arc::new(schema));
    }

    /// Whether a dedicated schema exists for the type
    pub fn has(&self, document_type: DocumentType) -> bool {
        self.schemas.contains_key(&document_type)
    }

    /// Schema for the type, or the drivers-license schema when missing
    pub fn get(&self, document_type: DocumentType) -> Arc<FieldSchema> {
        if let Some(schema) = self.schemas.get(&document_type) {
            return schema.clone();
        }

        warn!(
            "No field schema for {}, falling back to {}",
            document_type,
            DocumentType::DriversLicense
        );
        self.schemas
            .get(&DocumentType::DriversLicense)
            .cloned()
            .unwrap_or_else(|| BUILTIN.get(DocumentType::DriversLicense))
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

const NAME_TOKEN: &str = r"([a-z][a-z'\-]*)";
const DATE_VALUE: &str = r"(\d{1,2}[/\-.]\d{1,2}[/\-.]\d{2,4})";

fn field(name: FieldName, pattern: String, required: bool) -> FieldConfig {
    FieldConfig {
        name,
        pattern,
        required,
    }
}

fn common_name_fields() -> Vec<FieldConfig> {
    vec![
        field(
            FieldName::FirstName,
            format!(r"(?i)\b(?:first\s*name|given\s*names?)\b\s*[:.]?\s*{NAME_TOKEN}"),
            true,
        ),
        field(
            FieldName::LastName,
            format!(r"(?i)\b(?:last\s*name|surname|family\s*name)\b\s*[:.]?\s*{NAME_TOKEN}"),
            true,
        ),
        field(
            FieldName::FullName,
            r"(?im)^\s*(?:full\s+)?name\s*[:.]\s*([a-z][a-z'\-]*(?:[ \t]+[a-z][a-z'\-]*)+)\s*$".to_string(),
            false,
        ),
        field(
            FieldName::DateOfBirth,
            format!(r"(?i)\b(?:dob|date\s*of\s*birth|birth\s*date)\b\s*[:.]?\s*{DATE_VALUE}"),
            true,
        ),
    ]
}

fn expiration_field() -> FieldConfig {
    field(
        FieldName::ExpirationDate,
        format!(r"(?i)\b(?:exp(?:ires|iration)?(?:\s*date)?)\b\s*[:.]?\s*{DATE_VALUE}"),
        false,
    )
}

fn address_field() -> FieldConfig {
    field(
        FieldName::Address,
        r"(?im)\baddr(?:ess)?\b[ \t]*[:.]?[ \t]*([^:.\s][^\n]*)$".to_string(),
        false,
    )
}

fn sex_field() -> FieldConfig {
    field(
        FieldName::Sex,
        r"(?i)\bsex\b\s*[:.]?\s*([mfx])\b".to_string(),
        false,
    )
}

fn builtin_schema_configs() -> Vec<SchemaConfig> {
    let mut license = common_name_fields();
    license.extend([
        field(
            FieldName::LicenseNumber,
            r"(?i)\b(?:dl|lic(?:ense)?)(?:\s*(?:no\.?|number|num|#))?\s*[:#]?\s*([a-z]?\d[a-z0-9\-]{4,})".to_string(),
            true,
        ),
        expiration_field(),
        field(
            FieldName::IssueDate,
            format!(r"(?i)\b(?:iss(?:ued?)?(?:\s*date)?)\b\s*[:.]?\s*{DATE_VALUE}"),
            false,
        ),
        address_field(),
        sex_field(),
    ]);

    let mut passport = common_name_fields();
    passport.extend([
        field(
            FieldName::PassportNumber,
            r"(?i)\bpassport\s*(?:no\.?|number|#)\s*[:.]?\s*([a-z0-9]{6,9})\b".to_string(),
            true,
        ),
        field(
            FieldName::Nationality,
            r"(?i)\bnationality\b\s*[:.]?\s*([a-z]{3,})".to_string(),
            true,
        ),
        expiration_field(),
        sex_field(),
    ]);

    let mut national_id = common_name_fields();
    national_id.extend([
        field(
            FieldName::IdNumber,
            r"(?i)\b(?:id\s*(?:no\.?|number|#)|national\s*id(?:\s*(?:no\.?|number))?|ssn)\s*[:.#]?\s*(\d[0-9a-z\-]{4,})".to_string(),
            true,
        ),
        expiration_field(),
        address_field(),
    ]);

    vec![
        SchemaConfig {
            document_type: DocumentType::DriversLicense,
            fields: license,
        },
        SchemaConfig {
            document_type: DocumentType::Passport,
            fields: passport,
        },
        SchemaConfig {
            document_type: DocumentType::NationalId,
            fields: national_id,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_schemas_compile() {
        let registry = SchemaRegistry::builtin();
        for document_type in DocumentType::ALL {
            assert!(registry.has(document_type));
            let schema = registry.get(document_type);
            assert_eq!(schema.document_type(), document_type);
            assert!(schema.contains(FieldName::FirstName));
            assert!(schema.required().count() >= 3);
        }
        assert_eq!(registry.get(DocumentType::DriversLicense).len(), 9);
    }

    #[test]
    fn test_classify_keywords() {
        assert_eq!(DocumentType::classify("STATE DMV"), DocumentType::DriversLicense);
        assert_eq!(DocumentType::classify("Driver License"), DocumentType::DriversLicense);
        assert_eq!(DocumentType::classify("PASSPORT Nationality: USA"), DocumentType::Passport);
        assert_eq!(DocumentType::classify("NATIONAL ID CARD"), DocumentType::NationalId);
        assert_eq!(DocumentType::classify("SSN 123"), DocumentType::NationalId);
        assert_eq!(DocumentType::classify("nothing useful"), DocumentType::DriversLicense);
    }

    #[test]
    fn test_missing_schema_falls_back_to_license() {
        let registry = SchemaRegistry::from_configs(&[]).unwrap();
        assert!(!registry.has(DocumentType::Passport));
        let schema = registry.get(DocumentType::Passport);
        assert_eq!(schema.document_type(), DocumentType::DriversLicense);
    }

    #[test]
    fn test_override_replaces_schema() {
        let custom = SchemaConfig {
            document_type: DocumentType::Passport,
            fields: vec![FieldConfig {
                name: FieldName::PassportNumber,
                pattern: r"P<(\w+)".to_string(),
                required: true,
            }],
        };
        let registry = SchemaRegistry::with_overrides(&[custom]).unwrap();
        let schema = registry.get(DocumentType::Passport);
        assert_eq!(schema.len(), 1);
        assert_eq!(schema.required().collect::<Vec<_>>(), vec![FieldName::PassportNumber]);
    }

    #[test]
    fn test_invalid_pattern_reported_at_configuration() {
        let broken = SchemaConfig {
            document_type: DocumentType::NationalId,
            fields: vec![FieldConfig {
                name: FieldName::IdNumber,
                pattern: "(unclosed".to_string(),
                required: true,
            }],
        };
        let err = SchemaRegistry::with_overrides(&[broken]).unwrap_err();
        assert!(matches!(err, ConfigError::Pattern { .. }));
    }

    #[test]
    fn test_names_parse() {
        assert_eq!("dateOfBirth".parse::<FieldName>().unwrap(), FieldName::DateOfBirth);
        assert_eq!("passport".parse::<DocumentType>().unwrap(), DocumentType::Passport);
        assert!("height".parse::<FieldName>().is_err());
    }
}

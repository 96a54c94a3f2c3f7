//! Application Configuration
//!
//! Scan settings stored in TOML format. A file only needs the values it
//! changes; everything else comes from the selected detection profile.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::extraction::{SchemaConfig, SchemaRegistry};
use crate::pipeline::PipelineSettings;
use crate::scan::ScanSettings;
use crate::vision::{AnalysisSettings, PreprocessingOptions};

/// Threshold presets. Lenient suits low-end or noisy cameras, strict cuts
/// down on captures of half-visible documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionProfile {
    #[default]
    Lenient,
    Strict,
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Preset the other sections start from
    pub profile: DetectionProfile,
    /// Frame analyzer thresholds
    pub analysis: AnalysisSettings,
    /// Retry policy and acceptance threshold
    pub scan: ScanSettings,
    /// Preprocessing before recognition
    pub preprocessing: PreprocessingOptions,
    /// Sampling settings
    pub pipeline: PipelineSettings,
    /// Custom field schemas, replacing the built-in ones per document type
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub schemas: Vec<SchemaConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::for_profile(DetectionProfile::Lenient)
    }
}

impl AppConfig {
    pub fn for_profile(profile: DetectionProfile) -> Self {
        let (analysis, scan) = match profile {
            DetectionProfile::Lenient => (AnalysisSettings::lenient(), ScanSettings::lenient()),
            DetectionProfile::Strict => (AnalysisSettings::strict(), ScanSettings::strict()),
        };
        Self {
            profile,
            analysis,
            scan,
            preprocessing: PreprocessingOptions::default(),
            pipeline: PipelineSettings::default(),
            schemas: Vec::new(),
        }
    }

    /// Schema registry with the custom schemas applied over the built-in ones
    pub fn schema_registry(&self) -> Result<SchemaRegistry, ConfigError> {
        SchemaRegistry::with_overrides(&self.schemas)
    }

    /// Check for structural errors: out-of-range fractions, inverted
    /// bounds, zero sizes and invalid field patterns
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.analysis.validate()?;
        self.preprocessing.validate()?;
        self.scan.validate()?;
        self.pipeline.validate()?;
        self.schema_registry()?;
        Ok(())
    }
}

/// Reject values outside `[0, 1]`
pub(crate) fn check_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::invalid(field, format!("{value} is outside [0, 1]")));
    }
    Ok(())
}

pub(crate) fn check_positive_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    check_fraction(field, value)?;
    if value == 0.0 {
        return Err(ConfigError::invalid(field, "must be positive"));
    }
    Ok(())
}

/// Path of the user's config file
pub fn default_config_path() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "idscan", "IdScan")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    Ok(proj_dirs.config_dir().join("config.toml"))
}

/// Load configuration from file. Values missing from the file come from the
/// profile the file selects (lenient when it selects none).
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Invalid config {}", path.display()))
}

/// Parse configuration from TOML text
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let file: toml::Value = toml::from_str(content)?;

    let profile = match file.get("profile") {
        Some(value) => value.clone().try_into::<DetectionProfile>()?,
        None => DetectionProfile::default(),
    };

    let mut merged = toml::Value::try_from(AppConfig::for_profile(profile))?;
    merge_values(&mut merged, file);

    let config: AppConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Overlay `overlay` onto `base`, recursing into tables
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

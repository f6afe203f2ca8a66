//! Pre-recorded selector mappings.
//!
//! A human can record, per page, which selector holds which logical field and
//! which control advances the flow. The file looks like
//! `{ "entries": [{ "urlContains": "...", "fieldMapping": {...}, "actions": [...],
//! "criticalFields": [...] }] }`. [`CalibratedClassifier`] layers those entries
//! over any other classifier. Recorded data is advisory exactly like classifier
//! output; every write is still verified.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::classifier::{
    Classification, FallbackDecision, FinalityVerdict, PageClassifier, ValidationResult,
};
use crate::error::{ClassifierError, ConfigError};
use crate::types::{ActionSpec, FieldMapping, PageSnapshot, SourceValues};

const DEFAULT_FILE_NAME: &str = "calibration.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CalibrationEntry {
    /// Entry applies when the page URL contains this text.
    pub url_contains: String,
    pub field_mapping: FieldMapping,
    pub actions: Vec<ActionSpec>,
    pub critical_fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationFile {
    pub entries: Vec<CalibrationEntry>,
}

impl CalibrationFile {
    /// `<config dir>/form-pilot/calibration.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("form-pilot").join(DEFAULT_FILE_NAME))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: CalibrationFile =
            serde_json::from_str(&text).map_err(|err| ConfigError::Parse {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;
        info!(path = %path.display(), entries = file.entries.len(), "calibration loaded");
        Ok(file)
    }

    /// Load `path`, or the default location when `None`. A missing file is
    /// an empty calibration; a malformed one is an error.
    pub fn load_or_empty(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            debug!(path = %path.display(), "no calibration file");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Read {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        std::fs::write(path, json).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })
    }

    /// Most specific (longest `urlContains`) entry matching the URL.
    pub fn entry_for(&self, url: &str) -> Option<&CalibrationEntry> {
        self.entries
            .iter()
            .filter(|e| !e.url_contains.trim().is_empty() && url.contains(e.url_contains.trim()))
            .max_by_key(|e| e.url_contains.trim().len())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Recorded selectors win per key; recorded actions are tried first. The
/// classifier's confidence is kept as it answered.
pub fn overlay(mut base: Classification, entry: &CalibrationEntry) -> Classification {
    let mut mapping = base.field_mapping;
    for (key, selectors) in entry.field_mapping.iter() {
        mapping.insert(key, selectors.to_vec());
    }
    base.field_mapping = mapping;

    let mut actions = entry.actions.clone();
    for action in base.actions {
        if !actions.contains(&action) {
            actions.push(action);
        }
    }
    base.actions = actions;

    if entry.critical_fields.is_some() {
        base.critical_fields = entry.critical_fields.clone();
    }
    base
}

/// Classification built from a recorded entry alone, confident when the
/// entry has anything to act on.
pub fn calibration_only(entry: &CalibrationEntry) -> Classification {
    let base = Classification {
        ok: !entry.field_mapping.is_empty() || !entry.actions.is_empty(),
        ..Default::default()
    };
    overlay(base, entry)
}

pub struct CalibratedClassifier<C> {
    inner: C,
    calibration: CalibrationFile,
}

impl<C: PageClassifier> CalibratedClassifier<C> {
    pub fn new(inner: C, calibration: CalibrationFile) -> Self {
        Self { inner, calibration }
    }

    pub fn calibration(&self) -> &CalibrationFile {
        &self.calibration
    }
}

#[async_trait]
impl<C: PageClassifier> PageClassifier for CalibratedClassifier<C> {
    async fn classify(
        &self,
        snapshot: &PageSnapshot,
        task: &str,
    ) -> Result<Classification, ClassifierError> {
        let entry = self.calibration.entry_for(&snapshot.url);
        match (self.inner.classify(snapshot, task).await, entry) {
            (Ok(classification), Some(entry)) => {
                debug!(url = %snapshot.url, pattern = %entry.url_contains, "applying calibration");
                Ok(overlay(classification, entry))
            }
            (Ok(classification), None) => Ok(classification),
            (Err(err), Some(entry)) => {
                warn!(error = %err, pattern = %entry.url_contains, "classifier failed, using calibration alone");
                Ok(calibration_only(entry))
            }
            (Err(err), None) => Err(err),
        }
    }

    async fn fields_filled(&self, html: &str, min_filled: usize) -> Result<bool, ClassifierError> {
        self.inner.fields_filled(html, min_filled).await
    }

    async fn detect_final(
        &self,
        html: &str,
        current_url: &str,
    ) -> Result<FinalityVerdict, ClassifierError> {
        self.inner.detect_final(html, current_url).await
    }

    async fn validate_critical(
        &self,
        mapping: &FieldMapping,
        source: &SourceValues,
        critical_override: Option<&[String]>,
    ) -> Result<ValidationResult, ClassifierError> {
        self.inner
            .validate_critical(mapping, source, critical_override)
            .await
    }

    async fn should_fallback(
        &self,
        validation: &ValidationResult,
    ) -> Result<FallbackDecision, ClassifierError> {
        self.inner.should_fallback(validation).await
    }

    async fn entry_targets(
        &self,
        snapshot: &PageSnapshot,
        task: &str,
    ) -> Result<Vec<ActionSpec>, ClassifierError> {
        self.inner.entry_targets(snapshot, task).await
    }
}

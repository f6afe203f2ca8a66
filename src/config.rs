//! Engine configuration.
//!
//! Layering, lowest priority first: [`EngineConfig::default`], an optional JSON
//! file ([`EngineConfig::from_file`]), `FORM_PILOT_*` environment variables
//! ([`EngineConfig::apply_env`]). The binary applies CLI flags on top.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::actions::DEFAULT_CONTINUE_LABELS;
use crate::error::ConfigError;
use crate::mutator::WriteOptions;
use crate::types::ActionSpec;

pub const ENV_PREFIX: &str = "FORM_PILOT_";

/// Fields filled before anything else, in this order.
pub const DEFAULT_CRITICAL_FIELDS: &[&str] =
    &["plate_number", "national_id", "birth_date", "license_serial"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Logical flow name sent to the classifier.
    pub task: String,
    pub max_iterations: u32,
    pub max_fast_path_attempts: u32,
    pub max_escalated_attempts: u32,
    /// Extra classifier tries after the first failure within one attempt.
    pub classifier_retries: u32,
    pub field_retry_limit: u32,
    /// Settle delay after a write; multiplied by the attempt number.
    pub field_settle_base_ms: u64,
    pub post_action_settle_ms: u64,
    pub navigation_timeout_ms: u64,
    pub navigation_poll_ms: u64,
    pub artifact_timeout_ms: u64,
    /// Second, shorter artifact wait on strongly terminal pages.
    pub artifact_extended_timeout_ms: u64,
    pub critical_fields: Vec<String>,
    /// Labels tried when a page supplies no actions.
    pub continue_labels: Vec<String>,
    pub write: WriteOptions,
    pub highlight_actions: bool,
    pub download_dir: Option<PathBuf>,
    pub classifier_url: String,
    pub classifier_api_key: Option<String>,
    /// Heavier classifier used for the escalated re-run.
    pub escalated_classifier_url: Option<String>,
    pub classifier_timeout_ms: u64,
    pub calibration_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task: "new-policy".to_string(),
            max_iterations: 12,
            max_fast_path_attempts: 8,
            max_escalated_attempts: 4,
            classifier_retries: 2,
            field_retry_limit: 3,
            field_settle_base_ms: 150,
            post_action_settle_ms: 500,
            navigation_timeout_ms: 8_000,
            navigation_poll_ms: 250,
            artifact_timeout_ms: 15_000,
            artifact_extended_timeout_ms: 6_000,
            critical_fields: DEFAULT_CRITICAL_FIELDS.iter().map(|s| s.to_string()).collect(),
            continue_labels: DEFAULT_CONTINUE_LABELS.iter().map(|s| s.to_string()).collect(),
            write: WriteOptions::default(),
            highlight_actions: true,
            download_dir: None,
            classifier_url: "http://127.0.0.1:8700".to_string(),
            classifier_api_key: None,
            escalated_classifier_url: None,
            classifier_timeout_ms: 30_000,
            calibration_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            message: err.to_string(),
        })
    }

    /// Overlay `FORM_PILOT_*` variables from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Overlay variables from an arbitrary lookup. Unset or blank variables
    /// leave the current value alone.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            lookup(&format!("{ENV_PREFIX}{suffix}")).filter(|v| !v.trim().is_empty())
        };

        if let Some(v) = get("TASK") {
            self.task = v;
        }
        if let Some(v) = get("CLASSIFIER_URL") {
            self.classifier_url = v;
        }
        if let Some(v) = get("CLASSIFIER_API_KEY") {
            self.classifier_api_key = Some(v);
        }
        if let Some(v) = get("ESCALATED_CLASSIFIER_URL") {
            self.escalated_classifier_url = Some(v);
        }
        if let Some(v) = get("DOWNLOAD_DIR") {
            self.download_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CALIBRATION_PATH") {
            self.calibration_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CRITICAL_FIELDS") {
            self.critical_fields = split_list(&v);
        }
        if let Some(v) = get("CONTINUE_LABELS") {
            self.continue_labels = split_list(&v);
        }

        parse_into(&get, "MAX_ITERATIONS", &mut self.max_iterations)?;
        parse_into(&get, "MAX_FAST_PATH_ATTEMPTS", &mut self.max_fast_path_attempts)?;
        parse_into(&get, "MAX_ESCALATED_ATTEMPTS", &mut self.max_escalated_attempts)?;
        parse_into(&get, "CLASSIFIER_RETRIES", &mut self.classifier_retries)?;
        parse_into(&get, "FIELD_RETRY_LIMIT", &mut self.field_retry_limit)?;
        parse_into(&get, "NAVIGATION_TIMEOUT_MS", &mut self.navigation_timeout_ms)?;
        parse_into(&get, "ARTIFACT_TIMEOUT_MS", &mut self.artifact_timeout_ms)?;
        parse_into(&get, "CLASSIFIER_TIMEOUT_MS", &mut self.classifier_timeout_ms)?;
        parse_into(&get, "SIMULATE_TYPING", &mut self.write.simulate_typing)?;
        parse_into(&get, "COMMIT_ENTER", &mut self.write.commit_enter)?;
        parse_into(&get, "HIGHLIGHT_ACTIONS", &mut self.highlight_actions)?;

        Ok(self)
    }

    /// Configured download directory, or `<Downloads>/form-pilot`.
    pub fn resolved_download_dir(&self) -> PathBuf {
        self.download_dir.clone().unwrap_or_else(|| {
            dirs::download_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("form-pilot")
        })
    }

    pub fn continue_actions(&self) -> Vec<ActionSpec> {
        self.continue_labels
            .iter()
            .filter(|l| !l.trim().is_empty())
            .map(|l| ActionSpec::text(l.trim()))
            .collect()
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn navigation_poll(&self) -> Duration {
        Duration::from_millis(self.navigation_poll_ms)
    }

    pub fn artifact_timeout(&self) -> Duration {
        Duration::from_millis(self.artifact_timeout_ms)
    }

    pub fn artifact_extended_timeout(&self) -> Duration {
        Duration::from_millis(self.artifact_extended_timeout_ms)
    }

    pub fn post_action_settle(&self) -> Duration {
        Duration::from_millis(self.post_action_settle_ms)
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_millis(self.classifier_timeout_ms)
    }

    /// Settle delay after the given (zero-based) write attempt.
    pub fn field_settle(&self, attempt_index: u32) -> Duration {
        Duration::from_millis(self.field_settle_base_ms * u64::from(attempt_index + 1))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_into<T, G>(get: &G, suffix: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(suffix) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name: format!("{ENV_PREFIX}{suffix}"),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

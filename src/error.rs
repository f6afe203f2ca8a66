//! Error taxonomy for the fill engine.
//!
//! Boundary errors (`SurfaceError`, `ClassifierError`, `ObserverError`) are
//! what collaborators return. `FailureReason` is what a finished run reports:
//! a closed set of machine-readable codes, each with a fixed human-readable
//! explanation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures crossing the browsing-surface scripting boundary.
#[derive(Debug, Error, Clone)]
pub enum SurfaceError {
    /// The host could not produce markup/location for the current page
    #[error("Snapshot unavailable: {0}")]
    Snapshot(String),

    /// The script channel failed or returned something undecodable
    #[error("Script channel error: {0}")]
    Channel(String),

    /// The page-side dispatcher rejected the request
    #[error("Page bridge error: {0}")]
    Bridge(String),
}

impl SurfaceError {
    /// Channel hiccups are usually transient (page mid-navigation).
    pub fn is_retryable(&self) -> bool {
        matches!(self, SurfaceError::Channel(_) | SurfaceError::Snapshot(_))
    }
}

/// Failures talking to the page classifier.
#[derive(Debug, Error, Clone)]
pub enum ClassifierError {
    #[error("Classifier unreachable: {0}")]
    Unreachable(String),

    #[error("Classifier rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Classifier response could not be decoded: {0}")]
    Decode(String),
}

impl ClassifierError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClassifierError::Unreachable(_) => true,
            ClassifierError::Rejected { status, .. } => *status >= 500 || *status == 429,
            ClassifierError::Decode(_) => false,
        }
    }
}

/// Failures of the finality/download observer.
#[derive(Debug, Error, Clone)]
pub enum ObserverError {
    #[error("Download directory unusable: {0}")]
    Directory(String),

    #[error("Observer not set up")]
    NotReady,
}

/// Failures of a single form write.
#[derive(Debug, Error, Clone)]
pub enum WriteError {
    #[error("Element not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

/// Failures loading engine configuration or calibration data.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: String, value: String },
}

/// Why a run ended without success. `ShouldFallback` is a deliberate
/// escalation signal rather than an error, but it travels the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ClassifierUnreachable,
    NoInitialSnapshot,
    NoNavigationAfterAction,
    ShouldFallback,
    ArtifactTimeout,
    AttemptsExhausted,
    IterationLimit,
}

impl FailureReason {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::ClassifierUnreachable => "classifier_unreachable",
            FailureReason::NoInitialSnapshot => "no_initial_snapshot",
            FailureReason::NoNavigationAfterAction => "no_navigation_after_action",
            FailureReason::ShouldFallback => "should_fallback",
            FailureReason::ArtifactTimeout => "artifact_timeout",
            FailureReason::AttemptsExhausted => "attempts_exhausted",
            FailureReason::IterationLimit => "iteration_limit",
        }
    }

    /// Text for user-facing surfaces.
    pub fn explain(&self) -> &'static str {
        match self {
            FailureReason::ClassifierUnreachable => {
                "The page analysis service could not be reached. Please try again shortly."
            }
            FailureReason::NoInitialSnapshot => {
                "The form page could not be read. Make sure the site is open and loaded."
            }
            FailureReason::NoNavigationAfterAction => {
                "The form did not move to the next step after continuing. Some fields may need manual attention."
            }
            FailureReason::ShouldFallback => {
                "The quick fill was not confident enough; a more thorough analysis is required."
            }
            FailureReason::ArtifactTimeout => {
                "The quote document did not appear in time."
            }
            FailureReason::AttemptsExhausted => {
                "The form could not be completed within the allowed number of attempts."
            }
            FailureReason::IterationLimit => {
                "The form has more steps than the automation is allowed to walk through."
            }
        }
    }

    /// Whether the caller should consider re-running with the escalated strategy.
    pub fn suggests_escalation(&self) -> bool {
        matches!(
            self,
            FailureReason::ShouldFallback
                | FailureReason::ClassifierUnreachable
                | FailureReason::AttemptsExhausted
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Non-fatal per-field problems, recorded and logged only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "issue")]
pub enum FieldIssue {
    FieldUnresolvable { key: String },
    SelectorNotFound { key: String, selector: String },
    NotCommitted { key: String, selector: String },
}

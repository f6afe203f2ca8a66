//! DOM Action Executor: turn [`ActionSpec`]s into clicks on live elements.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SurfaceError;
use crate::surface::{BrowsingSurface, DomRequest, DomResponse};
use crate::types::ActionSpec;

/// Tried in order when no actions are supplied: the target locale first,
/// then English equivalents.
pub const DEFAULT_CONTINUE_LABELS: &[&str] = &[
    "Devam",
    "Devam Et",
    "İleri",
    "Sonraki",
    "Teklif Al",
    "Hesapla",
    "Onayla",
    "Gönder",
    "Continue",
    "Next",
    "Get Quote",
    "Calculate",
    "Confirm",
    "Submit",
];

/// `button:contains("Devam")`, `a:has-text('Next')`, `text=Continue`.
static TEXT_PREDICATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?::contains|:has-text|:text)\(\s*["']?(.+?)["']?\s*\)|^text\s*=\s*["']?(.+?)["']?$"#)
        .expect("text predicate pattern")
});

pub fn default_actions() -> Vec<ActionSpec> {
    DEFAULT_CONTINUE_LABELS
        .iter()
        .map(|label| ActionSpec::text(*label))
        .collect()
}

/// Label inside a selector that really means "match by text", if any.
pub fn text_predicate(selector: &str) -> Option<String> {
    TEXT_PREDICATE_RE.captures(selector).and_then(|c| {
        c.get(1)
            .or_else(|| c.get(2))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Triggered { selector: String },
    NotFound,
    Unreachable { selector: String },
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionLogEntry {
    pub action: ActionSpec,
    #[serde(flatten)]
    pub outcome: ActionOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub triggered_count: usize,
    pub log: Vec<ActionLogEntry>,
}

impl ExecutionReport {
    /// Selector of the last element actually clicked.
    pub fn last_triggered_selector(&self) -> Option<&str> {
        self.log.iter().rev().find_map(|entry| match &entry.outcome {
            ActionOutcome::Triggered { selector } => Some(selector.as_str()),
            _ => None,
        })
    }
}

pub struct ActionExecutor<'a> {
    surface: &'a dyn BrowsingSurface,
    highlight: bool,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(surface: &'a dyn BrowsingSurface) -> Self {
        Self {
            surface,
            highlight: true,
        }
    }

    pub fn with_highlight(mut self, highlight: bool) -> Self {
        self.highlight = highlight;
        self
    }

    /// Try actions in order and stop at the first one that fires. An empty
    /// list falls back to [`default_actions`].
    pub async fn execute(&self, actions: &[ActionSpec]) -> ExecutionReport {
        let defaults;
        let actions = if actions.is_empty() {
            defaults = default_actions();
            &defaults[..]
        } else {
            actions
        };

        let mut report = ExecutionReport::default();
        for action in actions {
            let outcome = match self.run_one(action).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(action = %action.describe(), error = %err, "action failed");
                    ActionOutcome::Failed {
                        message: err.to_string(),
                    }
                }
            };

            let fired = matches!(outcome, ActionOutcome::Triggered { .. });
            if let ActionOutcome::Triggered { selector } = &outcome {
                info!(action = %action.describe(), selector = %selector, "action triggered");
            } else {
                debug!(action = %action.describe(), outcome = ?outcome, "action did not fire");
            }
            report.log.push(ActionLogEntry {
                action: action.clone(),
                outcome,
            });
            if fired {
                report.triggered_count += 1;
                break;
            }
        }
        report
    }

    async fn run_one(&self, action: &ActionSpec) -> Result<ActionOutcome, SurfaceError> {
        let Some(selector) = self.locate(action).await? else {
            return Ok(ActionOutcome::NotFound);
        };

        if !self.surface.is_reachable(&selector).await? {
            return Ok(ActionOutcome::Unreachable { selector });
        }

        match self
            .surface
            .invoke(DomRequest::Click {
                selector: selector.clone(),
                highlight: self.highlight,
            })
            .await?
        {
            DomResponse::Missing => Ok(ActionOutcome::NotFound),
            DomResponse::Error { message } => Ok(ActionOutcome::Failed { message }),
            _ => Ok(ActionOutcome::Triggered { selector }),
        }
    }

    /// Resolve an action to a concrete selector.
    async fn locate(&self, action: &ActionSpec) -> Result<Option<String>, SurfaceError> {
        let request = match action {
            ActionSpec::ClickSelector { selector } => match text_predicate(selector) {
                Some(label) => DomRequest::FindClickable { label },
                None => return Ok(Some(selector.clone())),
            },
            ActionSpec::ClickText { label } => DomRequest::FindClickable {
                label: label.clone(),
            },
            ActionSpec::ClickPath { expr } => DomRequest::EvaluatePath { expr: expr.clone() },
        };

        match self.surface.invoke(request).await? {
            DomResponse::Located { selector } => Ok(Some(selector)),
            DomResponse::Missing => Ok(None),
            DomResponse::Error { message } => Err(SurfaceError::Bridge(message)),
            other => Err(SurfaceError::Channel(format!(
                "unexpected locate response: {other:?}"
            ))),
        }
    }
}

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::FailureReason;

/// What the engine observes of the current page. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub markup: String,
    pub url: String,
}

impl PageSnapshot {
    pub fn new(markup: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            markup: markup.into(),
            url: url.into(),
        }
    }
}

/// Selectors for one logical key. Classifiers send either a bare string or a list.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Vec<String> {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Logical field key -> candidate selectors. Advisory only; every write is verified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, OneOrMany>")]
pub struct FieldMapping(BTreeMap<String, Vec<String>>);

impl From<BTreeMap<String, OneOrMany>> for FieldMapping {
    fn from(raw: BTreeMap<String, OneOrMany>) -> Self {
        let mut mapping = FieldMapping::default();
        for (key, selectors) in raw {
            mapping.insert(key, Vec::<String>::from(selectors));
        }
        mapping
    }
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blank selectors are dropped; a key left with none is not stored.
    pub fn insert(&mut self, key: impl Into<String>, selectors: Vec<String>) {
        let selectors: Vec<String> = selectors
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !selectors.is_empty() {
            self.0.insert(key.into(), selectors);
        }
    }

    pub fn with(mut self, key: impl Into<String>, selector: impl Into<String>) -> Self {
        self.insert(key, vec![selector.into()]);
        self
    }

    pub fn selectors(&self, key: &str) -> &[String] {
        self.0.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Extracted document data: nested values plus an optional raw-text blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceValues {
    #[serde(default)]
    pub values: serde_json::Value,
    #[serde(default)]
    pub raw_text: Option<String>,
}

impl SourceValues {
    pub fn new(values: serde_json::Value) -> Self {
        Self {
            values,
            raw_text: None,
        }
    }

    pub fn with_raw_text(mut self, raw_text: impl Into<String>) -> Self {
        self.raw_text = Some(raw_text.into());
        self
    }
}

/// Which resolution strategy produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    StructuredBlob,
    ExactKey,
    SubstringKey,
    RawTextPattern,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedValue {
    pub key: String,
    pub value: String,
    pub provenance: Provenance,
}

impl ResolvedValue {
    pub fn unresolved(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
            provenance: Provenance::Unresolved,
        }
    }

    /// Empty means "nothing to fill".
    pub fn is_empty(&self) -> bool {
        self.value.trim().is_empty()
    }
}

/// How to find a page-advancing control.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawAction", rename_all = "snake_case", tag = "kind")]
pub enum ActionSpec {
    ClickText { label: String },
    ClickSelector { selector: String },
    ClickPath { expr: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
enum TaggedAction {
    ClickText { label: String },
    ClickSelector { selector: String },
    ClickPath { expr: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAction {
    Encoded(String),
    Tagged(TaggedAction),
}

impl TryFrom<RawAction> for ActionSpec {
    type Error = String;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        match raw {
            RawAction::Encoded(s) => {
                ActionSpec::parse(&s).ok_or_else(|| "empty action encoding".to_string())
            }
            RawAction::Tagged(TaggedAction::ClickText { label }) => Ok(ActionSpec::ClickText { label }),
            RawAction::Tagged(TaggedAction::ClickSelector { selector }) => {
                Ok(ActionSpec::ClickSelector { selector })
            }
            RawAction::Tagged(TaggedAction::ClickPath { expr }) => Ok(ActionSpec::ClickPath { expr }),
        }
    }
}

impl ActionSpec {
    pub fn text(label: impl Into<String>) -> Self {
        ActionSpec::ClickText {
            label: label.into(),
        }
    }

    pub fn selector(selector: impl Into<String>) -> Self {
        ActionSpec::ClickSelector {
            selector: selector.into(),
        }
    }

    pub fn path(expr: impl Into<String>) -> Self {
        ActionSpec::ClickPath { expr: expr.into() }
    }

    /// Parse the prefixed string encodings used by classifiers and calibration
    /// files (`css#...`, `css:...`, `text:...`, `xpath:...`). Unprefixed input
    /// is classified by shape: path-like, selector-like, otherwise a label.
    pub fn parse(encoded: &str) -> Option<Self> {
        let trimmed = encoded.trim();
        if trimmed.is_empty() {
            return None;
        }

        let lower = trimmed.to_lowercase();
        for prefix in ["css#", "css:"] {
            if lower.starts_with(prefix) {
                return non_empty(&trimmed[prefix.len()..]).map(ActionSpec::selector);
            }
        }
        if lower.starts_with("text:") {
            return non_empty(&trimmed[5..]).map(ActionSpec::text);
        }
        if lower.starts_with("xpath:") {
            return non_empty(&trimmed[6..]).map(ActionSpec::path);
        }

        if trimmed.starts_with('/') || trimmed.starts_with("(/") {
            return Some(ActionSpec::path(trimmed));
        }
        if looks_like_selector(trimmed) {
            return Some(ActionSpec::selector(trimmed));
        }
        Some(ActionSpec::text(trimmed))
    }

    /// Short human-readable form for logs.
    pub fn describe(&self) -> String {
        match self {
            ActionSpec::ClickText { label } => format!("text:{label}"),
            ActionSpec::ClickSelector { selector } => format!("css:{selector}"),
            ActionSpec::ClickPath { expr } => format!("xpath:{expr}"),
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

fn looks_like_selector(s: &str) -> bool {
    if s.starts_with('#') || s.starts_with('.') || s.contains('[') || s.contains('>') {
        return true;
    }
    if s.contains(' ') {
        return false;
    }
    s.contains(':') || s.split(['#', '.']).filter(|part| !part.is_empty()).count() > 1
}

/// One write+verify try for one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillAttempt {
    pub key: String,
    pub selector: String,
    pub attempt_index: u32,
    pub committed: bool,
}

/// Fast path or heavy re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    FastPath,
    Escalated,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::FastPath => "fast-path",
            Strategy::Escalated => "escalated",
        }
    }
}

/// Per-run bookkeeping owned by the orchestration loop.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub processed_identities: HashSet<String>,
    pub static_attempts_used: u32,
    pub escalated_attempts_used: u32,
}

impl LoopState {
    pub fn is_processed(&self, url: &str) -> bool {
        self.processed_identities.contains(url)
    }

    pub fn mark_processed(&mut self, url: impl Into<String>) {
        self.processed_identities.insert(url.into());
    }

    pub fn attempts_used(&self, strategy: Strategy) -> u32 {
        match strategy {
            Strategy::FastPath => self.static_attempts_used,
            Strategy::Escalated => self.escalated_attempts_used,
        }
    }

    pub fn record_attempt(&mut self, strategy: Strategy) {
        match strategy {
            Strategy::FastPath => self.static_attempts_used += 1,
            Strategy::Escalated => self.escalated_attempts_used += 1,
        }
    }
}

/// The single outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalResult {
    pub ok: bool,
    pub method: Strategy,
    pub final_selector: Option<String>,
    pub artifact_path: Option<String>,
    pub error: Option<FailureReason>,
    pub should_fallback: bool,
    /// URL the run was stuck on, for `no_navigation_after_action`.
    pub stuck_url: Option<String>,
    pub iterations: u32,
}

impl TerminalResult {
    pub fn success(method: Strategy, final_selector: Option<String>, artifact_path: Option<String>) -> Self {
        Self {
            ok: true,
            method,
            final_selector,
            artifact_path,
            error: None,
            should_fallback: false,
            stuck_url: None,
            iterations: 0,
        }
    }

    pub fn failure(method: Strategy, reason: FailureReason) -> Self {
        Self {
            ok: false,
            method,
            final_selector: None,
            artifact_path: None,
            error: Some(reason),
            should_fallback: reason == FailureReason::ShouldFallback,
            stuck_url: None,
            iterations: 0,
        }
    }

    pub fn fallback(method: Strategy) -> Self {
        Self::failure(method, FailureReason::ShouldFallback)
    }

    pub fn with_stuck_url(mut self, url: impl Into<String>) -> Self {
        self.stuck_url = Some(url.into());
        self
    }

    pub fn with_final_selector(mut self, selector: Option<String>) -> Self {
        self.final_selector = selector;
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    /// Human-readable summary, derived from the reason code only.
    pub fn message(&self) -> String {
        match (self.ok, self.error) {
            (true, _) => match &self.artifact_path {
                Some(path) => format!("Completed; document saved to {path}"),
                None => "Completed".to_string(),
            },
            (false, Some(reason)) => reason.explain().to_string(),
            (false, None) => "Stopped without a result".to_string(),
        }
    }
}

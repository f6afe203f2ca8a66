//! Browsing-surface boundary.
//!
//! The engine needs three things from whatever hosts the page: the current
//! markup and location, a way to run page-side primitives, and a reachability
//! check for click targets. Primitives travel as typed [`DomRequest`]s and come
//! back as typed [`DomResponse`]s; the host decides how to ship them (the
//! bundled Chrome host serializes them to a fixed page-side dispatcher).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SurfaceError;
use crate::types::PageSnapshot;

/// One page-side primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DomRequest {
    /// Read the element's current state.
    Describe { selector: String },
    /// Framework-transparent value injection followed by `input` and `change`.
    SetValue { selector: String, value: String },
    /// Append one character with `keydown`/`input`/`keyup` around it.
    TypeChar { selector: String, ch: String },
    /// Synthesize Enter keydown/keypress/keyup on the element.
    PressEnter { selector: String },
    /// Click the document body, then blur the element.
    Settle { selector: String },
    /// Native `checked` setter plus `change`.
    SetChecked { selector: String, checked: bool },
    /// Choose an option of a `<select>` by index and fire `change`.
    ChooseOption { selector: String, index: usize },
    /// Enumerate the radio group (same `name`) the element belongs to.
    RadioGroup { selector: String },
    /// Find a clickable-role element whose text/id/value equals the label
    /// (case-insensitive). The match is tagged and returned as a selector.
    FindClickable { label: String },
    /// Evaluate a path expression; the first ordered match is tagged.
    EvaluatePath { expr: String },
    /// Scroll into view, optionally outline, dispatch pointer events and call
    /// the element's native activation.
    Click { selector: String, highlight: bool },
}

/// One `<option>` of a select element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: String,
    pub text: String,
    #[serde(default)]
    pub selected: bool,
}

/// One member of a radio group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioOption {
    pub selector: String,
    pub value: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub checked: bool,
}

/// Element state as read from the live DOM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementState {
    pub tag: String,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub options: Vec<SelectOption>,
    #[serde(default)]
    pub selected_index: Option<i64>,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub disabled: bool,
}

/// How the mutator treats an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Text,
    Date,
    Checkbox,
    Radio,
    Select,
}

impl ElementState {
    pub fn kind(&self) -> ElementKind {
        let tag = self.tag.to_ascii_lowercase();
        if tag == "select" {
            return ElementKind::Select;
        }
        if tag == "textarea" {
            return ElementKind::Text;
        }
        match self
            .input_type
            .as_deref()
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("checkbox") => ElementKind::Checkbox,
            Some("radio") => ElementKind::Radio,
            Some("date") => ElementKind::Date,
            _ => ElementKind::Text,
        }
    }

    /// Type-aware "has a value": text non-empty, box checked, or a non-empty
    /// option selected.
    pub fn has_value(&self) -> bool {
        match self.kind() {
            ElementKind::Checkbox | ElementKind::Radio => self.checked,
            ElementKind::Select => self
                .selected_option()
                .map(|opt| !opt.value.trim().is_empty())
                .unwrap_or(false),
            ElementKind::Text | ElementKind::Date => !self.value.trim().is_empty(),
        }
    }

    pub fn selected_option(&self) -> Option<&SelectOption> {
        if let Some(idx) = self.selected_index {
            if idx >= 0 {
                if let Some(opt) = self.options.get(idx as usize) {
                    return Some(opt);
                }
            }
        }
        self.options.iter().find(|opt| opt.selected)
    }
}

/// Result of one primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DomResponse {
    Ok,
    Missing,
    Element(ElementState),
    Located { selector: String },
    Radios { options: Vec<RadioOption> },
    Error { message: String },
}

/// The host capabilities the engine relies on.
#[async_trait]
pub trait BrowsingSurface: Send + Sync {
    /// Current document markup and location.
    async fn snapshot(&self) -> Result<PageSnapshot, SurfaceError>;

    /// Run one primitive in the page.
    async fn invoke(&self, request: DomRequest) -> Result<DomResponse, SurfaceError>;

    /// Whether a click on the element would currently land on it.
    async fn is_reachable(&self, selector: &str) -> Result<bool, SurfaceError>;
}

/// Convenience wrapper: `Describe` mapped to `Option<ElementState>`.
pub async fn describe<S: BrowsingSurface + ?Sized>(
    surface: &S,
    selector: &str,
) -> Result<Option<ElementState>, SurfaceError> {
    match surface
        .invoke(DomRequest::Describe {
            selector: selector.to_string(),
        })
        .await?
    {
        DomResponse::Element(state) => Ok(Some(state)),
        DomResponse::Missing => Ok(None),
        DomResponse::Error { message } => Err(SurfaceError::Bridge(message)),
        other => Err(SurfaceError::Channel(format!(
            "unexpected describe response: {other:?}"
        ))),
    }
}

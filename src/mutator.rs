//! Form Mutator: type-aware writes into live form elements.
//!
//! The write call reports what the page told it, but that is not the
//! authority on whether a value stuck. Callers verify afterwards with
//! [`FormMutator::holds_value`].

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::WriteError;
use crate::surface::{
    BrowsingSurface, DomRequest, DomResponse, ElementKind, ElementState, RadioOption, SelectOption,
    describe,
};

const DATE_INPUT_FORMATS: &[&str] = &["%d.%m.%Y", "%d-%m-%Y", "%d/%m/%Y"];

/// Optional steps around a text write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Re-type character by character with key events (input masks).
    pub simulate_typing: bool,
    /// Synthesize Enter after writing.
    pub commit_enter: bool,
    /// Click the document body and blur before returning.
    pub settle_outside: bool,
    /// Base delay between simulated keystrokes.
    pub key_delay_ms: u64,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            simulate_typing: false,
            commit_enter: false,
            settle_outside: true,
            key_delay_ms: 40,
        }
    }
}

/// Element state around one write.
#[derive(Debug, Clone)]
pub struct WriteReport {
    /// What the page-side primitives reported. Advisory only.
    pub reported_committed: bool,
    /// Whether a click would have landed on the element when writing began.
    pub reachable: bool,
    pub before: ElementState,
    pub after: Option<ElementState>,
}

pub struct FormMutator<'a> {
    surface: &'a dyn BrowsingSurface,
    options: WriteOptions,
}

impl<'a> FormMutator<'a> {
    pub fn new(surface: &'a dyn BrowsingSurface, options: WriteOptions) -> Self {
        Self { surface, options }
    }

    pub async fn read(&self, selector: &str) -> Result<Option<ElementState>, WriteError> {
        Ok(describe(self.surface, selector).await?)
    }

    /// Whether `selector` now holds `value`. A radio is judged by its whole
    /// group, since the option written is rarely the one the mapping names.
    pub async fn holds_value(&self, selector: &str, value: &str) -> Result<bool, WriteError> {
        let Some(state) = describe(self.surface, selector).await? else {
            return Ok(false);
        };
        if state.kind() != ElementKind::Radio {
            return Ok(state.has_value());
        }

        let options = self.radio_group(selector).await?;
        Ok(match pick_radio(&options, value) {
            Some(opt) => opt.checked,
            None => options.iter().any(|opt| opt.checked),
        })
    }

    /// Write `value` into the element behind `selector` using the protocol for
    /// its type, then re-read it.
    pub async fn write(&self, selector: &str, value: &str) -> Result<WriteReport, WriteError> {
        let before = describe(self.surface, selector)
            .await?
            .ok_or_else(|| WriteError::NotFound(selector.to_string()))?;

        let kind = before.kind();
        let reachable = self.surface.is_reachable(selector).await?;
        debug!(selector, kind = ?kind, reachable, "writing form value");

        let reported_committed = match kind {
            ElementKind::Text => self.write_text(selector, value).await?,
            ElementKind::Date => {
                let iso = normalize_date(value);
                self.write_plain(selector, &iso).await?
            }
            ElementKind::Checkbox => self.write_checkbox(selector, parse_checked(value)).await?,
            ElementKind::Radio => self.write_radio(selector, value).await?,
            ElementKind::Select => self.write_select(selector, &before.options, value).await?,
        };

        let after = describe(self.surface, selector).await?;
        Ok(WriteReport {
            reported_committed,
            reachable,
            before,
            after,
        })
    }

    async fn send(&self, request: DomRequest) -> Result<bool, WriteError> {
        let selector = request_selector(&request);
        match self.surface.invoke(request).await? {
            DomResponse::Missing => Err(WriteError::NotFound(selector)),
            DomResponse::Error { message } => {
                warn!(selector = %selector, error = %message, "page rejected write primitive");
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    async fn write_plain(&self, selector: &str, value: &str) -> Result<bool, WriteError> {
        let ok = self
            .send(DomRequest::SetValue {
                selector: selector.to_string(),
                value: value.to_string(),
            })
            .await?;
        self.finish_text(selector).await?;
        Ok(ok)
    }

    async fn write_text(&self, selector: &str, value: &str) -> Result<bool, WriteError> {
        if !self.options.simulate_typing {
            return self.write_plain(selector, value).await;
        }

        let mut ok = self
            .send(DomRequest::SetValue {
                selector: selector.to_string(),
                value: String::new(),
            })
            .await?;
        for ch in value.chars() {
            ok &= self
                .send(DomRequest::TypeChar {
                    selector: selector.to_string(),
                    ch: ch.to_string(),
                })
                .await?;
            tokio::time::sleep(self.key_delay()).await;
        }
        self.finish_text(selector).await?;
        Ok(ok)
    }

    async fn finish_text(&self, selector: &str) -> Result<(), WriteError> {
        if self.options.commit_enter {
            self.send(DomRequest::PressEnter {
                selector: selector.to_string(),
            })
            .await?;
        }
        if self.options.settle_outside {
            self.send(DomRequest::Settle {
                selector: selector.to_string(),
            })
            .await?;
        }
        Ok(())
    }

    fn key_delay(&self) -> Duration {
        let base = self.options.key_delay_ms as f32;
        let jitter = base * 0.5 * rand::random::<f32>();
        Duration::from_millis((base + jitter) as u64)
    }

    async fn write_checkbox(&self, selector: &str, desired: bool) -> Result<bool, WriteError> {
        self.send(DomRequest::SetChecked {
            selector: selector.to_string(),
            checked: desired,
        })
        .await?;

        let state = describe(self.surface, selector)
            .await?
            .ok_or_else(|| WriteError::NotFound(selector.to_string()))?;
        if state.checked == desired {
            return Ok(true);
        }

        debug!(selector, "checked setter did not stick, clicking");
        self.send(DomRequest::Click {
            selector: selector.to_string(),
            highlight: false,
        })
        .await
    }

    async fn radio_group(&self, selector: &str) -> Result<Vec<RadioOption>, WriteError> {
        match self
            .surface
            .invoke(DomRequest::RadioGroup {
                selector: selector.to_string(),
            })
            .await?
        {
            DomResponse::Radios { options } => Ok(options),
            DomResponse::Missing => Err(WriteError::NotFound(selector.to_string())),
            other => {
                warn!(selector, response = ?other, "radio group lookup failed");
                Ok(Vec::new())
            }
        }
    }

    async fn write_radio(&self, selector: &str, value: &str) -> Result<bool, WriteError> {
        let options = self.radio_group(selector).await?;
        match pick_radio(&options, value) {
            Some(opt) => {
                self.send(DomRequest::Click {
                    selector: opt.selector.clone(),
                    highlight: false,
                })
                .await
            }
            None => {
                debug!(selector, value, "no radio option matches");
                Ok(false)
            }
        }
    }

    async fn write_select(
        &self,
        selector: &str,
        options: &[SelectOption],
        value: &str,
    ) -> Result<bool, WriteError> {
        match match_option(options, value) {
            Some(index) => {
                self.send(DomRequest::ChooseOption {
                    selector: selector.to_string(),
                    index,
                })
                .await
            }
            None => {
                debug!(selector, value, "no select option matches");
                Ok(false)
            }
        }
    }
}

fn request_selector(request: &DomRequest) -> String {
    match request {
        DomRequest::Describe { selector }
        | DomRequest::SetValue { selector, .. }
        | DomRequest::TypeChar { selector, .. }
        | DomRequest::PressEnter { selector }
        | DomRequest::Settle { selector }
        | DomRequest::SetChecked { selector, .. }
        | DomRequest::ChooseOption { selector, .. }
        | DomRequest::RadioGroup { selector }
        | DomRequest::Click { selector, .. } => selector.clone(),
        DomRequest::FindClickable { label } => label.clone(),
        DomRequest::EvaluatePath { expr } => expr.clone(),
    }
}

/// Radio option for `value`: exact value first, then label.
pub fn pick_radio<'o>(options: &'o [RadioOption], value: &str) -> Option<&'o RadioOption> {
    let wanted = value.trim().to_lowercase();
    options
        .iter()
        .find(|opt| opt.value.trim().to_lowercase() == wanted)
        .or_else(|| {
            options
                .iter()
                .find(|opt| opt.label.trim().to_lowercase() == wanted)
        })
}

/// Option lookup order: exact value, case-insensitive exact text, substring
/// text, case-insensitive value.
pub fn match_option(options: &[SelectOption], value: &str) -> Option<usize> {
    let wanted = value.trim();
    if wanted.is_empty() {
        return None;
    }
    let wanted_lower = wanted.to_lowercase();

    options
        .iter()
        .position(|opt| opt.value == wanted)
        .or_else(|| {
            options
                .iter()
                .position(|opt| opt.text.trim().to_lowercase() == wanted_lower)
        })
        .or_else(|| {
            options
                .iter()
                .position(|opt| opt.text.to_lowercase().contains(&wanted_lower))
        })
        .or_else(|| {
            options
                .iter()
                .position(|opt| opt.value.trim().to_lowercase() == wanted_lower)
        })
}

/// `dd.mm.yyyy`, `dd-mm-yyyy` and `dd/mm/yyyy` become `yyyy-mm-dd`; anything
/// else is passed through trimmed.
pub fn normalize_date(value: &str) -> String {
    let trimmed = value.trim();
    DATE_INPUT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

/// Desired checkbox state from a source value.
pub fn parse_checked(value: &str) -> bool {
    !matches!(
        value.trim().to_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off" | "hayır" | "hayir" | "unchecked"
    )
}

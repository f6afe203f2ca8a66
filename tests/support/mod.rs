//! In-memory page and classifier doubles for driving the engine in tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use form_pilot::classifier::{
    Classification, FallbackDecision, FinalityVerdict, PageClassifier, ValidationResult,
};
use form_pilot::config::EngineConfig;
use form_pilot::error::{ClassifierError, SurfaceError};
use form_pilot::mutator::WriteOptions;
use form_pilot::surface::{
    BrowsingSurface, DomRequest, DomResponse, ElementState, RadioOption, SelectOption,
};
use form_pilot::types::{ActionSpec, FieldMapping, PageSnapshot, SourceValues};

#[derive(Debug, Clone)]
struct FakeElement {
    state: ElementState,
    /// Writes are acknowledged but the value never sticks.
    stubborn: bool,
    /// The native checked setter is ignored; only clicks toggle.
    setter_ignored: bool,
    /// Not rendered before this instant.
    appears_at: Option<Instant>,
}

impl FakeElement {
    fn new(state: ElementState) -> Self {
        Self {
            state,
            stubborn: false,
            setter_ignored: false,
            appears_at: None,
        }
    }

    fn rendered(&self) -> bool {
        self.appears_at.is_none_or(|at| Instant::now() >= at)
    }
}

/// One page: location, markup, form elements and clickable controls.
#[derive(Debug, Clone, Default)]
pub struct FakePage {
    url: String,
    markup: String,
    elements: BTreeMap<String, FakeElement>,
    clickables: Vec<(String, String)>,
}

impl FakePage {
    pub fn new(url: &str, markup: &str) -> Self {
        Self {
            url: url.to_string(),
            markup: markup.to_string(),
            ..Default::default()
        }
    }

    fn input(mut self, selector: &str, input_type: &str) -> Self {
        self.elements.insert(
            selector.to_string(),
            FakeElement::new(ElementState {
                tag: "INPUT".into(),
                input_type: Some(input_type.into()),
                visible: true,
                ..Default::default()
            }),
        );
        self
    }

    pub fn text_input(self, selector: &str) -> Self {
        self.input(selector, "text")
    }

    pub fn date_input(self, selector: &str) -> Self {
        self.input(selector, "date")
    }

    pub fn stubborn_input(mut self, selector: &str) -> Self {
        self = self.input(selector, "text");
        if let Some(el) = self.elements.get_mut(selector) {
            el.stubborn = true;
        }
        self
    }

    /// Text input that only renders `delay` after the page is built.
    pub fn late_input(mut self, selector: &str, delay: Duration) -> Self {
        self = self.input(selector, "text");
        if let Some(el) = self.elements.get_mut(selector) {
            el.appears_at = Some(Instant::now() + delay);
        }
        self
    }

    pub fn checkbox(mut self, selector: &str, setter_ignored: bool) -> Self {
        self = self.input(selector, "checkbox");
        if let Some(el) = self.elements.get_mut(selector) {
            el.setter_ignored = setter_ignored;
        }
        self
    }

    pub fn radio(mut self, selector: &str, name: &str, value: &str) -> Self {
        self = self.input(selector, "radio");
        if let Some(el) = self.elements.get_mut(selector) {
            el.state.name = Some(name.into());
            el.state.value = value.into();
        }
        self
    }

    pub fn select(mut self, selector: &str, options: &[(&str, &str)]) -> Self {
        self.elements.insert(
            selector.to_string(),
            FakeElement::new(ElementState {
                tag: "SELECT".into(),
                options: options
                    .iter()
                    .enumerate()
                    .map(|(i, (value, text))| SelectOption {
                        value: value.to_string(),
                        text: text.to_string(),
                        selected: i == 0,
                    })
                    .collect(),
                selected_index: Some(0),
                visible: true,
                ..Default::default()
            }),
        );
        self
    }

    pub fn button(mut self, label: &str, selector: &str) -> Self {
        self.clickables.push((label.to_string(), selector.to_string()));
        self
    }
}

#[derive(Default)]
struct Inner {
    page: FakePage,
    transitions: HashMap<String, FakePage>,
    unreachable: HashSet<String>,
    requests: Vec<DomRequest>,
    clicks: Vec<String>,
    snapshot_broken: bool,
    /// Snapshots carry the live form state, as the Chrome host serializes it.
    live_markup: bool,
}

/// Browsing surface backed by [`FakePage`]s. Clicking a control with a
/// registered transition swaps in the next page.
pub struct FakeSurface {
    inner: Mutex<Inner>,
}

impl FakeSurface {
    pub fn new(page: FakePage) -> Self {
        Self {
            inner: Mutex::new(Inner {
                page,
                ..Default::default()
            }),
        }
    }

    pub fn on_click(self, selector: &str, next: FakePage) -> Self {
        self.inner
            .lock()
            .unwrap()
            .transitions
            .insert(selector.to_string(), next);
        self
    }

    pub fn covered(self, selector: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .unreachable
            .insert(selector.to_string());
        self
    }

    pub fn live_markup(self) -> Self {
        self.inner.lock().unwrap().live_markup = true;
        self
    }

    pub fn broken(self) -> Self {
        self.inner.lock().unwrap().snapshot_broken = true;
        self
    }

    pub fn element(&self, selector: &str) -> Option<ElementState> {
        self.inner
            .lock()
            .unwrap()
            .page
            .elements
            .get(selector)
            .map(|el| el.state.clone())
    }

    pub fn value_of(&self, selector: &str) -> Option<String> {
        self.element(selector).map(|state| state.value)
    }

    pub fn clicks(&self) -> Vec<String> {
        self.inner.lock().unwrap().clicks.clone()
    }

    pub fn current_url(&self) -> String {
        self.inner.lock().unwrap().page.url.clone()
    }

    /// Number of primitives that change form state.
    pub fn write_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    DomRequest::SetValue { .. }
                        | DomRequest::TypeChar { .. }
                        | DomRequest::SetChecked { .. }
                        | DomRequest::ChooseOption { .. }
                        | DomRequest::RadioGroup { .. }
                )
            })
            .count()
    }

    pub fn requests(&self) -> Vec<DomRequest> {
        self.inner.lock().unwrap().requests.clone()
    }
}

fn target(request: &DomRequest) -> Option<&str> {
    match request {
        DomRequest::Describe { selector }
        | DomRequest::SetValue { selector, .. }
        | DomRequest::TypeChar { selector, .. }
        | DomRequest::PressEnter { selector }
        | DomRequest::Settle { selector }
        | DomRequest::SetChecked { selector, .. }
        | DomRequest::ChooseOption { selector, .. }
        | DomRequest::RadioGroup { selector }
        | DomRequest::Click { selector, .. } => Some(selector),
        DomRequest::FindClickable { .. } | DomRequest::EvaluatePath { .. } => None,
    }
}

impl Inner {
    fn pending(&self, selector: &str) -> bool {
        self.page
            .elements
            .get(selector)
            .is_some_and(|el| !el.rendered())
    }

    /// Page markup followed by one tag per element, with value, checked and
    /// selected state written out as attributes.
    fn markup(&self) -> String {
        if !self.live_markup {
            return self.page.markup.clone();
        }
        let mut out = self.page.markup.clone();
        for (selector, el) in &self.page.elements {
            let state = &el.state;
            out.push_str(&format!("<input data-sel=\"{selector}\" value=\"{}\"", state.value));
            if state.checked {
                out.push_str(" checked");
            }
            out.push('>');
        }
        out
    }

    fn click(&mut self, selector: &str) -> DomResponse {
        let known = self.page.elements.contains_key(selector)
            || self.page.clickables.iter().any(|(_, s)| s == selector);
        if !known {
            return DomResponse::Missing;
        }
        self.clicks.push(selector.to_string());

        let radio_name = self.page.elements.get(selector).and_then(|el| {
            (el.state.input_type.as_deref() == Some("radio"))
                .then(|| el.state.name.clone())
                .flatten()
        });
        if let Some(name) = radio_name {
            for (sel, el) in self.page.elements.iter_mut() {
                if el.state.name.as_deref() == Some(name.as_str()) {
                    el.state.checked = sel == selector;
                }
            }
        } else if let Some(el) = self.page.elements.get_mut(selector) {
            if el.state.input_type.as_deref() == Some("checkbox") {
                el.state.checked = !el.state.checked;
            }
        }

        if let Some(next) = self.transitions.get(selector).cloned() {
            self.page = next;
        }
        DomResponse::Ok
    }
}

#[async_trait]
impl BrowsingSurface for FakeSurface {
    async fn snapshot(&self) -> Result<PageSnapshot, SurfaceError> {
        let inner = self.inner.lock().unwrap();
        if inner.snapshot_broken {
            return Err(SurfaceError::Snapshot("tab crashed".into()));
        }
        Ok(PageSnapshot::new(inner.markup(), &inner.page.url))
    }

    async fn invoke(&self, request: DomRequest) -> Result<DomResponse, SurfaceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.requests.push(request.clone());
        if target(&request).is_some_and(|sel| inner.pending(sel)) {
            return Ok(DomResponse::Missing);
        }

        let response = match request {
            DomRequest::Describe { selector } => match inner.page.elements.get(&selector) {
                Some(el) => DomResponse::Element(el.state.clone()),
                None => DomResponse::Missing,
            },
            DomRequest::SetValue { selector, value } => match inner.page.elements.get_mut(&selector) {
                Some(el) => {
                    if !el.stubborn {
                        el.state.value = value;
                    }
                    DomResponse::Ok
                }
                None => DomResponse::Missing,
            },
            DomRequest::TypeChar { selector, ch } => match inner.page.elements.get_mut(&selector) {
                Some(el) => {
                    if !el.stubborn {
                        el.state.value.push_str(&ch);
                    }
                    DomResponse::Ok
                }
                None => DomResponse::Missing,
            },
            DomRequest::PressEnter { selector } | DomRequest::Settle { selector } => {
                if inner.page.elements.contains_key(&selector) {
                    DomResponse::Ok
                } else {
                    DomResponse::Missing
                }
            }
            DomRequest::SetChecked { selector, checked } => {
                match inner.page.elements.get_mut(&selector) {
                    Some(el) => {
                        if !el.setter_ignored {
                            el.state.checked = checked;
                        }
                        DomResponse::Ok
                    }
                    None => DomResponse::Missing,
                }
            }
            DomRequest::ChooseOption { selector, index } => {
                match inner.page.elements.get_mut(&selector) {
                    Some(el) if index < el.state.options.len() => {
                        for (i, opt) in el.state.options.iter_mut().enumerate() {
                            opt.selected = i == index;
                        }
                        el.state.selected_index = Some(index as i64);
                        el.state.value = el.state.options[index].value.clone();
                        DomResponse::Ok
                    }
                    Some(_) => DomResponse::Error {
                        message: "option index out of range".into(),
                    },
                    None => DomResponse::Missing,
                }
            }
            DomRequest::RadioGroup { selector } => {
                let name = inner
                    .page
                    .elements
                    .get(&selector)
                    .and_then(|el| el.state.name.clone());
                match name {
                    Some(name) => DomResponse::Radios {
                        options: inner
                            .page
                            .elements
                            .iter()
                            .filter(|(_, el)| el.state.name.as_deref() == Some(name.as_str()))
                            .map(|(sel, el)| RadioOption {
                                selector: sel.clone(),
                                value: el.state.value.clone(),
                                label: String::new(),
                                checked: el.state.checked,
                            })
                            .collect(),
                    },
                    None => DomResponse::Missing,
                }
            }
            DomRequest::FindClickable { label } => {
                let wanted = label.trim().to_lowercase();
                match inner
                    .page
                    .clickables
                    .iter()
                    .find(|(l, _)| l.to_lowercase() == wanted)
                {
                    Some((_, selector)) => DomResponse::Located {
                        selector: selector.clone(),
                    },
                    None => DomResponse::Missing,
                }
            }
            DomRequest::EvaluatePath { .. } => DomResponse::Missing,
            DomRequest::Click { selector, .. } => inner.click(&selector),
        };
        Ok(response)
    }

    async fn is_reachable(&self, selector: &str) -> Result<bool, SurfaceError> {
        Ok(!self.inner.lock().unwrap().unreachable.contains(selector))
    }
}

/// Classifier answering from per-URL scripts.
pub struct ScriptedClassifier {
    pages: HashMap<String, Classification>,
    fields_filled: bool,
    verdict: FinalityVerdict,
    fallback: FallbackDecision,
    entry_targets: Vec<ActionSpec>,
    failure: Option<ClassifierError>,
    /// Classify calls still to fail before answering normally.
    failures_left: AtomicUsize,
    filled_from_markup: bool,
    classify_calls: AtomicUsize,
    validate_calls: AtomicUsize,
}

impl Default for ScriptedClassifier {
    fn default() -> Self {
        Self {
            pages: HashMap::new(),
            fields_filled: true,
            verdict: FinalityVerdict::default(),
            fallback: FallbackDecision::default(),
            entry_targets: Vec::new(),
            failure: None,
            failures_left: AtomicUsize::new(0),
            filled_from_markup: false,
            classify_calls: AtomicUsize::new(0),
            validate_calls: AtomicUsize::new(0),
        }
    }
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, classification: Classification) -> Self {
        self.pages.insert(url.to_string(), classification);
        self
    }

    pub fn filled(mut self, filled: bool) -> Self {
        self.fields_filled = filled;
        self
    }

    pub fn verdict(mut self, verdict: FinalityVerdict) -> Self {
        self.verdict = verdict;
        self
    }

    pub fn wants_fallback(mut self) -> Self {
        self.fallback = FallbackDecision {
            should_fallback: true,
            reason: Some("critical fields unresolved".into()),
            threshold: Some(0.6),
        };
        self
    }

    pub fn entry(mut self, targets: Vec<ActionSpec>) -> Self {
        self.entry_targets = targets;
        self
    }

    pub fn failing(mut self, error: ClassifierError) -> Self {
        self.failure = Some(error);
        self.failures_left = AtomicUsize::new(usize::MAX);
        self
    }

    /// Fail the first `times` classify calls with `error`, then recover.
    pub fn flaky(mut self, times: usize, error: ClassifierError) -> Self {
        self.failure = Some(error);
        self.failures_left = AtomicUsize::new(times);
        self
    }

    /// Decide "enough filled" by counting non-empty `value` attributes and
    /// `checked` flags in the markup it is given.
    pub fn reads_markup(mut self) -> Self {
        self.filled_from_markup = true;
        self
    }

    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageClassifier for ScriptedClassifier {
    async fn classify(
        &self,
        snapshot: &PageSnapshot,
        _task: &str,
    ) -> Result<Classification, ClassifierError> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.failure {
            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(err.clone());
            }
        }
        Ok(self
            .pages
            .get(&snapshot.url)
            .cloned()
            .unwrap_or_else(|| Classification {
                ok: true,
                ..Default::default()
            }))
    }

    async fn fields_filled(&self, html: &str, min_filled: usize) -> Result<bool, ClassifierError> {
        if !self.filled_from_markup {
            return Ok(self.fields_filled);
        }
        let values = html
            .split("value=\"")
            .skip(1)
            .filter(|rest| !rest.starts_with('"'))
            .count();
        let checks = html.matches(" checked").count();
        Ok(values + checks >= min_filled)
    }

    async fn detect_final(
        &self,
        _html: &str,
        _current_url: &str,
    ) -> Result<FinalityVerdict, ClassifierError> {
        Ok(self.verdict.clone())
    }

    async fn validate_critical(
        &self,
        mapping: &FieldMapping,
        _source: &SourceValues,
        _critical_override: Option<&[String]>,
    ) -> Result<ValidationResult, ClassifierError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ValidationResult {
            ok: !self.fallback.should_fallback,
            total: mapping.len(),
            ..Default::default()
        })
    }

    async fn should_fallback(
        &self,
        _validation: &ValidationResult,
    ) -> Result<FallbackDecision, ClassifierError> {
        Ok(self.fallback.clone())
    }

    async fn entry_targets(
        &self,
        _snapshot: &PageSnapshot,
        _task: &str,
    ) -> Result<Vec<ActionSpec>, ClassifierError> {
        Ok(self.entry_targets.clone())
    }
}

pub fn classified(mapping: FieldMapping, actions: Vec<ActionSpec>) -> Classification {
    Classification {
        ok: true,
        field_mapping: mapping,
        actions,
        ..Default::default()
    }
}

/// Short timings so scenarios finish in milliseconds.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        max_iterations: 6,
        classifier_retries: 0,
        field_settle_base_ms: 1,
        post_action_settle_ms: 1,
        navigation_timeout_ms: 60,
        navigation_poll_ms: 10,
        artifact_timeout_ms: 30,
        artifact_extended_timeout_ms: 20,
        write: WriteOptions {
            key_delay_ms: 1,
            ..WriteOptions::default()
        },
        highlight_actions: false,
        ..EngineConfig::default()
    }
}

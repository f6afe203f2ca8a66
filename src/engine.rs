//! Orchestration loop.
//!
//! One run walks `Scanning -> Analyzing -> Filling -> Gating -> Acting ->
//! AwaitingNavigation` per page until a terminal result, bounded by the
//! iteration and per-strategy attempt budgets. Everything that must survive
//! between pages lives in [`RunContext`]; nothing is global.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::actions::ActionExecutor;
use crate::classifier::{Classification, FinalityVerdict, PageClassifier};
use crate::config::EngineConfig;
use crate::error::{FailureReason, FieldIssue, WriteError};
use crate::events::{EventSink, RunEvent};
use crate::finality::{DownloadObserver, passive_artifact_hint};
use crate::monitor::NavigationMonitor;
use crate::mutator::FormMutator;
use crate::resolver::{SelectorResolver, normalize_key};
use crate::surface::BrowsingSurface;
use crate::types::{
    FieldMapping, FillAttempt, LoopState, PageSnapshot, SourceValues, Strategy, TerminalResult,
};

const INITIAL_SNAPSHOT_TRIES: u32 = 3;
const CLASSIFIER_BACKOFF: Duration = Duration::from_millis(400);

/// State scoped to one run. Create a fresh one per run.
#[derive(Debug)]
pub struct RunContext {
    pub strategy: Strategy,
    pub source: SourceValues,
    pub state: LoopState,
    pub iterations: u32,
    /// Set once any page was recognized as terminal. Lets a missed navigation
    /// still end in success when the page shows the produced document.
    pub terminal_signal_seen: bool,
    pub last_triggered: Option<String>,
    observer_ready: bool,
    classifications: HashMap<String, Classification>,
}

impl RunContext {
    pub fn new(strategy: Strategy, source: SourceValues) -> Self {
        Self {
            strategy,
            source,
            state: LoopState::default(),
            iterations: 0,
            terminal_signal_seen: false,
            last_triggered: None,
            observer_ready: false,
            classifications: HashMap::new(),
        }
    }

    fn begin(&mut self) {
        self.iterations = 0;
        self.terminal_signal_seen = false;
        self.last_triggered = None;
    }

    /// Distinct page states classified so far in this run.
    pub fn cached_classifications(&self) -> usize {
        self.classifications.len()
    }
}

#[derive(Debug, Clone)]
pub enum StepOutcome {
    Continue(PageSnapshot),
    Finished(TerminalResult),
}

/// What the Filling phase did on one page.
#[derive(Debug, Clone, Default)]
pub struct FillSummary {
    pub attempts: Vec<FillAttempt>,
    pub issues: Vec<FieldIssue>,
    /// Keys that resolved to a non-empty value and were written.
    pub expected: Vec<String>,
    /// Keys verified to hold a value after writing.
    pub committed: Vec<String>,
    /// Critical keys among `expected`.
    pub critical_expected: Vec<String>,
}

impl FillSummary {
    pub fn critical_committed(&self) -> bool {
        self.critical_expected
            .iter()
            .all(|key| self.committed.contains(key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateInput {
    pub expected: usize,
    pub committed: usize,
    pub critical_committed: bool,
    pub enough_filled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub permitted: bool,
    pub forced: bool,
    pub required: usize,
}

/// Committed fields needed before acting: 1 when one field had data, 2 when
/// several did.
pub fn min_committed(expected: usize) -> usize {
    expected.min(2)
}

/// Whether the page may be advanced.
///
/// When fields were written but none verified, the action runs anyway.
pub fn gate(input: GateInput) -> GateDecision {
    let required = min_committed(input.expected);
    let forced = input.expected > 0 && input.committed == 0;
    let permitted =
        forced || (input.enough_filled && input.critical_committed && input.committed >= required);
    GateDecision {
        permitted,
        forced,
        required,
    }
}

/// Critical keys first in priority order, then the rest in mapping order.
pub fn order_fields(mapping: &FieldMapping, critical: &[String]) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::with_capacity(mapping.len());
    for wanted in critical {
        let wanted = normalize_key(wanted);
        for key in mapping.keys() {
            if normalize_key(key) == wanted && !ordered.iter().any(|k| k == key) {
                ordered.push(key.to_string());
            }
        }
    }
    for key in mapping.keys() {
        if !ordered.iter().any(|k| k == key) {
            ordered.push(key.to_string());
        }
    }
    ordered
}

/// `(terminal, strong)` for a page about to be acted on. A strong signal
/// allows the second, extended artifact wait.
pub fn terminal_strength(classification: &Classification, verdict: &FinalityVerdict) -> (bool, bool) {
    let terminal = classification.is_final || verdict.is_final;
    let strong = terminal
        && (verdict.hits.len() >= 2
            || (classification.is_final && classification.cta_present)
            || (classification.is_final && verdict.is_final));
    (terminal, strong)
}

fn markup_key(markup: &str) -> String {
    let digest = Sha256::digest(markup.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct Engine<'a> {
    surface: &'a dyn BrowsingSurface,
    classifier: &'a dyn PageClassifier,
    observer: Option<&'a dyn DownloadObserver>,
    resolver: SelectorResolver,
    config: EngineConfig,
    events: EventSink,
}

impl<'a> Engine<'a> {
    pub fn new(
        surface: &'a dyn BrowsingSurface,
        classifier: &'a dyn PageClassifier,
        config: EngineConfig,
    ) -> Self {
        Self {
            surface,
            classifier,
            observer: None,
            resolver: SelectorResolver::default(),
            config,
            events: EventSink::disabled(),
        }
    }

    pub fn with_observer(mut self, observer: &'a dyn DownloadObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Replace the default key synonyms, e.g. for an insurer with its own
    /// field naming.
    pub fn with_resolver(mut self, resolver: SelectorResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Same engine, different classifier.
    pub fn with_classifier<'b>(&self, classifier: &'b dyn PageClassifier) -> Engine<'b>
    where
        'a: 'b,
    {
        Engine {
            surface: self.surface,
            classifier,
            observer: self.observer,
            resolver: self.resolver.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
        }
    }

    pub async fn run(&self, source: SourceValues, strategy: Strategy) -> TerminalResult {
        let mut ctx = RunContext::new(strategy, source);
        self.run_in(&mut ctx).await
    }

    /// Fast path first; when it asks for escalation, or stops for a reason
    /// the heavier classifier may get past, one more run with `heavy` in
    /// escalated mode.
    pub async fn run_with_escalation(
        &self,
        heavy: &dyn PageClassifier,
        source: SourceValues,
    ) -> TerminalResult {
        let fast = self.run(source.clone(), Strategy::FastPath).await;
        let escalate =
            fast.should_fallback || fast.error.is_some_and(|reason| reason.suggests_escalation());
        if !escalate {
            return fast;
        }

        let reason = fast
            .error
            .map(|r| r.code().to_string())
            .unwrap_or_else(|| "should_fallback".to_string());
        info!(reason = %reason, "fast path asked for escalation");
        self.events.emit(RunEvent::Escalating { reason });

        self.with_classifier(heavy)
            .run(source, Strategy::Escalated)
            .await
    }

    pub async fn run_in(&self, ctx: &mut RunContext) -> TerminalResult {
        ctx.begin();
        self.arm_observer(ctx).await;

        let result = match self.initial_snapshot().await {
            Some(snapshot) => {
                info!(strategy = ctx.strategy.as_str(), url = %snapshot.url, "run started");
                self.events.emit(RunEvent::RunStarted {
                    strategy: ctx.strategy,
                    url: snapshot.url.clone(),
                });
                self.drive(ctx, snapshot).await
            }
            None => TerminalResult::failure(ctx.strategy, FailureReason::NoInitialSnapshot),
        };

        if ctx.observer_ready {
            if let Some(observer) = self.observer {
                observer.cleanup().await;
            }
            ctx.observer_ready = false;
        }

        let result = result.with_iterations(ctx.iterations);
        match result.error {
            None => info!(
                iterations = ctx.iterations,
                classified_pages = ctx.cached_classifications(),
                artifact = ?result.artifact_path,
                "run finished"
            ),
            Some(reason) => warn!(iterations = ctx.iterations, reason = %reason, stuck_url = ?result.stuck_url, "run stopped"),
        }
        self.events.emit(RunEvent::Finished {
            result: result.clone(),
        });
        result
    }

    async fn drive(&self, ctx: &mut RunContext, first: PageSnapshot) -> TerminalResult {
        let mut current = first;
        loop {
            if ctx.iterations >= self.config.max_iterations {
                return TerminalResult::failure(ctx.strategy, FailureReason::IterationLimit)
                    .with_stuck_url(current.url)
                    .with_final_selector(ctx.last_triggered.clone());
            }
            ctx.iterations += 1;
            match self.step(ctx, current).await {
                StepOutcome::Continue(next) => current = next,
                StepOutcome::Finished(result) => return result,
            }
        }
    }

    async fn arm_observer(&self, ctx: &mut RunContext) {
        let Some(observer) = self.observer else {
            return;
        };
        let dir = self.config.resolved_download_dir();
        match observer.setup(&dir, self.config.artifact_timeout()).await {
            Ok(()) => ctx.observer_ready = true,
            Err(err) => {
                warn!(error = %err, "download observer unavailable, using page inspection");
                ctx.observer_ready = false;
            }
        }
    }

    async fn initial_snapshot(&self) -> Option<PageSnapshot> {
        for attempt in 1..=INITIAL_SNAPSHOT_TRIES {
            match self.surface.snapshot().await {
                Ok(snapshot) if !snapshot.markup.trim().is_empty() => return Some(snapshot),
                Ok(_) => debug!(attempt, "initial snapshot empty"),
                Err(err) => {
                    warn!(attempt, error = %err, "initial snapshot failed");
                    if !err.is_retryable() {
                        return None;
                    }
                }
            }
            tokio::time::sleep(self.config.navigation_poll()).await;
        }
        None
    }

    fn attempt_budget(&self, strategy: Strategy) -> u32 {
        match strategy {
            Strategy::FastPath => self.config.max_fast_path_attempts,
            Strategy::Escalated => self.config.max_escalated_attempts,
        }
    }

    /// One pass over one page.
    pub async fn step(&self, ctx: &mut RunContext, snapshot: PageSnapshot) -> StepOutcome {
        debug!(iteration = ctx.iterations, url = %snapshot.url, "scanning");
        self.events.emit(RunEvent::Iteration {
            number: ctx.iterations,
            url: snapshot.url.clone(),
        });

        if ctx.state.is_processed(&snapshot.url) {
            return self.revisit(ctx, snapshot).await;
        }

        let classification = match self.analyze(ctx, &snapshot).await {
            Ok(classification) => classification,
            Err(result) => return StepOutcome::Finished(result),
        };
        if classification.is_final {
            ctx.terminal_signal_seen = true;
        }

        if ctx.strategy == Strategy::FastPath && !classification.field_mapping.is_empty() {
            if let Some(result) = self.confidence_check(ctx, &classification, &snapshot).await {
                return StepOutcome::Finished(result);
            }
        }

        let fill = self.fill(ctx, &classification).await;

        let post_fill = if fill.expected.is_empty() {
            snapshot.clone()
        } else {
            self.surface.snapshot().await.unwrap_or_else(|err| {
                warn!(error = %err, "post-fill snapshot failed, reusing pre-fill markup");
                snapshot.clone()
            })
        };

        let decision = self.gate_page(&fill, &post_fill).await;
        self.events.emit(RunEvent::Gate {
            permitted: decision.permitted,
            forced: decision.forced,
            committed: fill.committed.len(),
            required: decision.required,
        });

        if !decision.permitted {
            info!(
                url = %snapshot.url,
                committed = fill.committed.len(),
                required = decision.required,
                critical_ok = fill.critical_committed(),
                "gate closed, rescanning"
            );
            tokio::time::sleep(self.config.post_action_settle()).await;
            let next = self.surface.snapshot().await.unwrap_or(post_fill);
            return StepOutcome::Continue(next);
        }
        if decision.forced {
            warn!(url = %snapshot.url, "no field committed, forcing actions");
        }

        self.act(ctx, &snapshot, &classification).await
    }

    /// Cheap path for a page already handled in this run.
    async fn revisit(&self, ctx: &mut RunContext, snapshot: PageSnapshot) -> StepOutcome {
        info!(url = %snapshot.url, "page already processed, checking for completion");
        self.events.emit(RunEvent::Revisit {
            url: snapshot.url.clone(),
        });

        if let Some(path) = self.artifact_check(ctx, &snapshot, Duration::ZERO).await {
            return StepOutcome::Finished(self.success(ctx, path));
        }
        self.await_navigation(ctx, &snapshot, false).await
    }

    async fn analyze(
        &self,
        ctx: &mut RunContext,
        snapshot: &PageSnapshot,
    ) -> Result<Classification, TerminalResult> {
        let key = markup_key(&snapshot.markup);
        if let Some(cached) = ctx.classifications.get(&key) {
            debug!(url = %snapshot.url, "classification cache hit");
            self.emit_classified(true, cached);
            return Ok(cached.clone());
        }

        let budget = self.attempt_budget(ctx.strategy);
        if ctx.state.attempts_used(ctx.strategy) >= budget {
            warn!(strategy = ctx.strategy.as_str(), budget, "attempt budget exhausted");
            return Err(TerminalResult::failure(ctx.strategy, FailureReason::AttemptsExhausted)
                .with_stuck_url(snapshot.url.clone())
                .with_final_selector(ctx.last_triggered.clone()));
        }
        ctx.state.record_attempt(ctx.strategy);

        let mut tries = 0;
        let classification = loop {
            tries += 1;
            match self.classifier.classify(snapshot, &self.config.task).await {
                Ok(classification) => break classification,
                Err(err) if err.is_retryable() && tries <= self.config.classifier_retries => {
                    warn!(try_number = tries, error = %err, "classifier call failed, retrying");
                    tokio::time::sleep(CLASSIFIER_BACKOFF * tries).await;
                }
                Err(err) => {
                    warn!(error = %err, "classifier unavailable");
                    return Err(self.classifier_failure(ctx, snapshot));
                }
            }
        };

        if !classification.ok && ctx.strategy == Strategy::FastPath {
            info!(url = %snapshot.url, "classifier not confident on fast path");
            return Err(TerminalResult::fallback(ctx.strategy).with_stuck_url(snapshot.url.clone()));
        }

        debug!(
            fields = classification.field_mapping.len(),
            actions = classification.actions.len(),
            is_final = classification.is_final,
            "page classified"
        );
        self.emit_classified(false, &classification);
        ctx.classifications.insert(key, classification.clone());
        Ok(classification)
    }

    fn emit_classified(&self, cached: bool, classification: &Classification) {
        self.events.emit(RunEvent::Classified {
            cached,
            fields: classification.field_mapping.len(),
            actions: classification.actions.len(),
            is_final: classification.is_final,
        });
    }

    fn classifier_failure(&self, ctx: &RunContext, snapshot: &PageSnapshot) -> TerminalResult {
        let result = match ctx.strategy {
            Strategy::FastPath => TerminalResult::fallback(ctx.strategy),
            Strategy::Escalated => {
                TerminalResult::failure(ctx.strategy, FailureReason::ClassifierUnreachable)
            }
        };
        result.with_stuck_url(snapshot.url.clone())
    }

    /// Escalation signal from validating the mapping against the source.
    async fn confidence_check(
        &self,
        ctx: &RunContext,
        classification: &Classification,
        snapshot: &PageSnapshot,
    ) -> Option<TerminalResult> {
        let validation = match self
            .classifier
            .validate_critical(
                &classification.field_mapping,
                &ctx.source,
                classification.critical_fields.as_deref(),
            )
            .await
        {
            Ok(validation) => validation,
            Err(err) => {
                warn!(error = %err, "critical field validation failed");
                return Some(self.classifier_failure(ctx, snapshot));
            }
        };

        match self.classifier.should_fallback(&validation).await {
            Ok(decision) if decision.should_fallback => {
                info!(
                    reason = decision.reason.as_deref().unwrap_or("unspecified"),
                    missing = ?validation.missing,
                    "low confidence, escalating"
                );
                Some(TerminalResult::fallback(ctx.strategy).with_stuck_url(snapshot.url.clone()))
            }
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "fallback decision failed");
                Some(self.classifier_failure(ctx, snapshot))
            }
        }
    }

    async fn fill(&self, ctx: &RunContext, classification: &Classification) -> FillSummary {
        let mut summary = FillSummary::default();
        if classification.field_mapping.is_empty() {
            return summary;
        }

        let critical: Vec<String> = classification
            .critical_fields
            .clone()
            .unwrap_or_else(|| self.config.critical_fields.clone());
        let critical_norm: Vec<String> = critical.iter().map(|k| normalize_key(k)).collect();
        let mutator = FormMutator::new(self.surface, self.config.write.clone());

        for key in order_fields(&classification.field_mapping, &critical) {
            let resolved = self.resolver.resolve(&key, &ctx.source);
            if resolved.is_empty() {
                debug!(key = %key, "nothing to fill");
                self.record_issue(&mut summary, FieldIssue::FieldUnresolvable { key });
                continue;
            }

            summary.expected.push(key.clone());
            if critical_norm.contains(&normalize_key(&key)) {
                summary.critical_expected.push(key.clone());
            }

            let selectors = classification.field_mapping.selectors(&key);
            if self
                .fill_field(&mutator, &key, &resolved.value, selectors, &mut summary)
                .await
            {
                summary.committed.push(key);
            }
        }

        info!(
            expected = summary.expected.len(),
            committed = summary.committed.len(),
            "fill pass done"
        );
        summary
    }

    /// Write and verify one field, retrying with growing settle delays.
    /// The re-read decides, not the write call. The delay also runs between
    /// attempts that found nothing, so late-rendered fields get their chance.
    async fn fill_field(
        &self,
        mutator: &FormMutator<'_>,
        key: &str,
        value: &str,
        selectors: &[String],
        summary: &mut FillSummary,
    ) -> bool {
        for attempt_index in 0..self.config.field_retry_limit {
            let mut wrote = false;
            for selector in selectors {
                let report = match mutator.write(selector, value).await {
                    Ok(report) => report,
                    Err(WriteError::NotFound(_)) => {
                        if attempt_index == 0 {
                            self.record_issue(
                                summary,
                                FieldIssue::SelectorNotFound {
                                    key: key.to_string(),
                                    selector: selector.clone(),
                                },
                            );
                        }
                        continue;
                    }
                    Err(err) => {
                        warn!(key, selector = %selector, error = %err, "write failed");
                        continue;
                    }
                };
                if !report.reachable {
                    debug!(key, selector = %selector, "target was covered while writing");
                }

                tokio::time::sleep(self.config.field_settle(attempt_index)).await;
                let committed = match mutator.holds_value(selector, value).await {
                    Ok(held) => held,
                    Err(err) => {
                        warn!(key, selector = %selector, error = %err, "verification read failed");
                        false
                    }
                };

                summary.attempts.push(FillAttempt {
                    key: key.to_string(),
                    selector: selector.clone(),
                    attempt_index,
                    committed,
                });

                if committed {
                    debug!(key, selector = %selector, attempt_index, reported = report.reported_committed, "field committed");
                    self.events.emit(RunEvent::FieldCommitted {
                        key: key.to_string(),
                        selector: selector.clone(),
                        attempt: attempt_index,
                    });
                    return true;
                }
                if report.reported_committed {
                    debug!(key, selector = %selector, "write reported success but element is empty");
                }
                wrote = true;
            }

            if !wrote && attempt_index + 1 < self.config.field_retry_limit {
                debug!(key, attempt_index, "no selector found yet, waiting");
                tokio::time::sleep(self.config.field_settle(attempt_index)).await;
            }
        }

        let last_selector = selectors.last().cloned().unwrap_or_default();
        self.record_issue(
            summary,
            FieldIssue::NotCommitted {
                key: key.to_string(),
                selector: last_selector,
            },
        );
        false
    }

    fn record_issue(&self, summary: &mut FillSummary, issue: FieldIssue) {
        debug!(issue = ?issue, "field issue");
        self.events.emit(RunEvent::FieldSkipped {
            issue: issue.clone(),
        });
        summary.issues.push(issue);
    }

    async fn gate_page(&self, fill: &FillSummary, post_fill: &PageSnapshot) -> GateDecision {
        let expected = fill.expected.len();
        let enough_filled = if expected == 0 {
            true
        } else {
            match self
                .classifier
                .fields_filled(&post_fill.markup, min_committed(expected))
                .await
            {
                Ok(ok) => ok,
                Err(err) => {
                    warn!(error = %err, "filled-fields check failed");
                    false
                }
            }
        };

        gate(GateInput {
            expected,
            committed: fill.committed.len(),
            critical_committed: fill.critical_committed(),
            enough_filled,
        })
    }

    async fn act(
        &self,
        ctx: &mut RunContext,
        snapshot: &PageSnapshot,
        classification: &Classification,
    ) -> StepOutcome {
        let actions = if classification.actions.is_empty() {
            self.config.continue_actions()
        } else {
            classification.actions.clone()
        };

        let report = ActionExecutor::new(self.surface)
            .with_highlight(self.config.highlight_actions)
            .execute(&actions)
            .await;
        match report.last_triggered_selector() {
            Some(selector) => {
                ctx.last_triggered = Some(selector.to_string());
                self.events.emit(RunEvent::ActionTriggered {
                    selector: selector.to_string(),
                });
            }
            None => {
                warn!(url = %snapshot.url, tried = report.log.len(), "no action fired");
                self.events.emit(RunEvent::NoActionFired);
            }
        }
        tokio::time::sleep(self.config.post_action_settle()).await;

        let mut artifact_missed = false;
        if classification.is_final || classification.cta_present {
            let verdict = self
                .classifier
                .detect_final(&snapshot.markup, &snapshot.url)
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, "finality check failed");
                    FinalityVerdict::default()
                });
            let (terminal, strong) = terminal_strength(classification, &verdict);
            if terminal {
                ctx.terminal_signal_seen = true;
                if let Some(path) = self.await_artifact(ctx, strong).await {
                    return StepOutcome::Finished(self.success(ctx, path));
                }
                artifact_missed = strong;
            }
        }

        self.await_navigation(ctx, snapshot, artifact_missed).await
    }

    async fn await_artifact(&self, ctx: &RunContext, strong: bool) -> Option<String> {
        let latest = match self.surface.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!(error = %err, "snapshot for artifact check failed");
                PageSnapshot::new("", "")
            }
        };
        if let Some(path) = self
            .artifact_check(ctx, &latest, self.config.artifact_timeout())
            .await
        {
            return Some(path);
        }
        if strong && ctx.observer_ready {
            debug!("strong terminal signal, extending artifact wait");
            return self
                .artifact_check(ctx, &latest, self.config.artifact_extended_timeout())
                .await;
        }
        None
    }

    /// Observer when armed, otherwise the page itself.
    async fn artifact_check(
        &self,
        ctx: &RunContext,
        snapshot: &PageSnapshot,
        timeout: Duration,
    ) -> Option<String> {
        match self.observer.filter(|_| ctx.observer_ready) {
            Some(observer) => {
                let outcome = observer.wait_for_artifact(timeout).await;
                if !outcome.ok {
                    debug!(error = ?outcome.error, "no artifact");
                }
                outcome.ok.then(|| outcome.path.unwrap_or_default())
            }
            None => passive_artifact_hint(&snapshot.markup),
        }
    }

    /// Wait for the URL to change. `artifact_missed` marks a strongly terminal
    /// page whose document never showed up; staying on it is reported as
    /// `ArtifactTimeout` rather than a stuck form.
    async fn await_navigation(
        &self,
        ctx: &mut RunContext,
        snapshot: &PageSnapshot,
        artifact_missed: bool,
    ) -> StepOutcome {
        let outcome = NavigationMonitor::new(self.surface)
            .with_interval(self.config.navigation_poll())
            .wait_for_change(&snapshot.url, self.config.navigation_timeout())
            .await;

        let latest = match outcome.snapshot {
            Some(next) if outcome.changed => {
                ctx.state.mark_processed(snapshot.url.clone());
                info!(from = %snapshot.url, to = %next.url, "navigated");
                self.events.emit(RunEvent::Navigated {
                    from: snapshot.url.clone(),
                    to: next.url.clone(),
                });
                return StepOutcome::Continue(next);
            }
            Some(latest) => latest,
            None => snapshot.clone(),
        };
        if ctx.terminal_signal_seen {
            if let Some(hint) = passive_artifact_hint(&latest.markup) {
                info!(hint = %hint, "no navigation, but the page shows the document");
                return StepOutcome::Finished(self.success(ctx, hint));
            }
        }

        let reason = if artifact_missed {
            FailureReason::ArtifactTimeout
        } else {
            FailureReason::NoNavigationAfterAction
        };
        StepOutcome::Finished(
            TerminalResult::failure(ctx.strategy, reason)
                .with_stuck_url(snapshot.url.clone())
                .with_final_selector(ctx.last_triggered.clone()),
        )
    }

    fn success(&self, ctx: &RunContext, path: String) -> TerminalResult {
        self.events.emit(RunEvent::ArtifactObserved { path: path.clone() });
        TerminalResult::success(ctx.strategy, ctx.last_triggered.clone(), Some(path))
    }
}

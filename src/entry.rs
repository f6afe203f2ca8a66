//! Entry-page finder.
//!
//! Runs once before the main loop: click through ranked candidates from the
//! classifier until one of them visibly changes the page.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::actions::{ActionExecutor, ActionOutcome};
use crate::classifier::PageClassifier;
use crate::error::SurfaceError;
use crate::monitor::{DEFAULT_POLL_INTERVAL, NavigationMonitor};
use crate::surface::BrowsingSurface;
use crate::types::{ActionSpec, PageSnapshot};

const DEFAULT_CHANGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum EntryOutcome {
    /// A target changed the page; `snapshot` is the page it led to.
    Entered {
        target: ActionSpec,
        snapshot: PageSnapshot,
    },
    /// Every target was tried (or none existed) and the page stayed put.
    NoChange { tried: usize },
}

impl EntryOutcome {
    pub fn entered(&self) -> bool {
        matches!(self, EntryOutcome::Entered { .. })
    }
}

pub struct EntryFinder<'a> {
    surface: &'a dyn BrowsingSurface,
    classifier: &'a dyn PageClassifier,
    timeout: Duration,
    interval: Duration,
    highlight: bool,
}

impl<'a> EntryFinder<'a> {
    pub fn new(surface: &'a dyn BrowsingSurface, classifier: &'a dyn PageClassifier) -> Self {
        Self {
            surface,
            classifier,
            timeout: DEFAULT_CHANGE_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
            highlight: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_highlight(mut self, highlight: bool) -> Self {
        self.highlight = highlight;
        self
    }

    /// Ask the classifier for candidates on the current page and try them.
    pub async fn find(&self, task: &str) -> Result<EntryOutcome, SurfaceError> {
        let start = self.surface.snapshot().await?;
        let targets = match self.classifier.entry_targets(&start, task).await {
            Ok(targets) => targets,
            Err(err) => {
                warn!(error = %err, "no entry targets from classifier");
                Vec::new()
            }
        };
        Ok(self.try_targets(&start, &targets).await)
    }

    /// Try `targets` in order from `start`; first visible change wins.
    pub async fn try_targets(&self, start: &PageSnapshot, targets: &[ActionSpec]) -> EntryOutcome {
        let executor = ActionExecutor::new(self.surface).with_highlight(self.highlight);
        let monitor = NavigationMonitor::new(self.surface).with_interval(self.interval);
        let mut tried = 0;

        for target in targets {
            tried += 1;
            let report = executor.execute(std::slice::from_ref(target)).await;
            if report.triggered_count == 0 {
                let outcome = report.log.last().map(|entry| &entry.outcome);
                debug!(target = %target.describe(), outcome = ?outcome, "entry target did not fire");
                if matches!(outcome, Some(ActionOutcome::Failed { .. })) {
                    warn!(target = %target.describe(), "entry target failed");
                }
                continue;
            }

            let outcome = monitor.wait_for_content_change(start, self.timeout).await;
            if outcome.changed {
                if let Some(snapshot) = outcome.snapshot {
                    info!(target = %target.describe(), url = %snapshot.url, "entry page reached");
                    return EntryOutcome::Entered {
                        target: target.clone(),
                        snapshot,
                    };
                }
            }
            debug!(target = %target.describe(), "click left the page unchanged");
        }

        info!(tried, "no entry target changed the page");
        EntryOutcome::NoChange { tried }
    }
}

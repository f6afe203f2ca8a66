//! Navigation Monitor: poll the surface until the location changes.
//!
//! The page is not ours, so there is no event to wait on. Polling at a fixed
//! interval is the only mechanism.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::surface::BrowsingSurface;
use crate::types::PageSnapshot;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

static VOLATILE_BLOCKS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<noscript\b.*?</noscript>|<!--.*?-->")
        .expect("volatile block pattern")
});
static HIDDEN_INPUT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<input\b[^>]*type\s*=\s*["']?hidden["']?[^>]*>"#).expect("hidden input pattern")
});
static VOLATILE_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\s(?:data-fp-target|nonce|data-reactid|style)\s*=\s*("[^"]*"|'[^']*')"#)
        .expect("volatile attribute pattern")
});
static CLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,2}:\d{2}(?::\d{2})?\b").expect("clock pattern"));
static INTER_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r">\s+<").expect("inter-tag pattern"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

#[derive(Debug, Clone)]
pub struct NavigationOutcome {
    pub changed: bool,
    /// Last snapshot taken; `None` only if every poll failed.
    pub snapshot: Option<PageSnapshot>,
}

pub struct NavigationMonitor<'a> {
    surface: &'a dyn BrowsingSurface,
    interval: Duration,
}

impl<'a> NavigationMonitor<'a> {
    pub fn new(surface: &'a dyn BrowsingSurface) -> Self {
        Self {
            surface,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll until the URL differs from `previous_url` or `timeout` elapses.
    pub async fn wait_for_change(&self, previous_url: &str, timeout: Duration) -> NavigationOutcome {
        self.poll(timeout, |snapshot| snapshot.url != previous_url)
            .await
    }

    /// Like [`wait_for_change`](Self::wait_for_change), but a change of the
    /// volatile-insensitive content fingerprint also counts.
    pub async fn wait_for_content_change(
        &self,
        previous: &PageSnapshot,
        timeout: Duration,
    ) -> NavigationOutcome {
        let baseline = content_fingerprint(&previous.markup);
        self.poll(timeout, |snapshot| {
            snapshot.url != previous.url || content_fingerprint(&snapshot.markup) != baseline
        })
        .await
    }

    async fn poll<F>(&self, timeout: Duration, changed: F) -> NavigationOutcome
    where
        F: Fn(&PageSnapshot) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut last = None;

        loop {
            match self.surface.snapshot().await {
                Ok(snapshot) => {
                    if changed(&snapshot) {
                        debug!(url = %snapshot.url, "page changed");
                        return NavigationOutcome {
                            changed: true,
                            snapshot: Some(snapshot),
                        };
                    }
                    last = Some(snapshot);
                }
                Err(err) => warn!(error = %err, "snapshot failed while waiting for a change"),
            }

            let now = Instant::now();
            if now >= deadline {
                return NavigationOutcome {
                    changed: false,
                    snapshot: last,
                };
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }
}

/// Content hash of the markup that ignores scripts, styles, comments, hidden
/// inputs, inline styles, clocks and whitespace.
pub fn content_fingerprint(markup: &str) -> String {
    let stripped = VOLATILE_BLOCKS_RE.replace_all(markup, "");
    let stripped = HIDDEN_INPUT_RE.replace_all(&stripped, "");
    let stripped = VOLATILE_ATTR_RE.replace_all(&stripped, "");
    let stripped = CLOCK_RE.replace_all(&stripped, "");
    let stripped = INTER_TAG_RE.replace_all(stripped.trim(), "><");
    let collapsed = WHITESPACE_RE.replace_all(&stripped, " ");

    let digest = Sha256::digest(collapsed.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

//! Finality/Download Observer contract and its stand-ins.
//!
//! The observer watches for the produced document. When no observer is
//! wired in, [`passive_artifact_hint`] inspects the current markup for
//! document links or embeds instead.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ObserverError;

const POLL_INTERVAL: Duration = Duration::from_millis(300);
const PARTIAL_SUFFIXES: &[&str] = &["crdownload", "part", "tmp", "download"];

static ARTIFACT_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<(?:a|embed|iframe|object)\b[^>]*(?:href|src|data)\s*=\s*["']([^"']+\.pdf(?:[?#][^"']*)?)["']"#)
        .expect("artifact link pattern")
});
static ARTIFACT_TYPED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<(?:embed|iframe|object|a)\b[^>]*type\s*=\s*["']application/pdf["'][^>]*>"#)
        .expect("artifact type pattern")
});
static SRC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)(?:href|src|data)\s*=\s*["']([^"']+)["']"#).expect("src pattern")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactOutcome {
    pub ok: bool,
    pub path: Option<String>,
    pub error: Option<String>,
}

impl ArtifactOutcome {
    pub fn found(path: impl Into<String>) -> Self {
        Self {
            ok: true,
            path: Some(path.into()),
            error: None,
        }
    }

    pub fn absent(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            path: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait DownloadObserver: Send + Sync {
    async fn setup(&self, target_dir: &Path, timeout: Duration) -> Result<(), ObserverError>;

    /// Wait up to `timeout` for a new finished artifact. A timeout is an
    /// absent artifact, not an error.
    async fn wait_for_artifact(&self, timeout: Duration) -> ArtifactOutcome;

    async fn cleanup(&self);
}

/// Watches a download directory for new, fully written documents.
pub struct DirectoryObserver {
    extensions: Vec<String>,
    state: Mutex<Option<WatchState>>,
}

struct WatchState {
    dir: PathBuf,
    baseline: HashSet<PathBuf>,
}

impl Default for DirectoryObserver {
    fn default() -> Self {
        Self::new(["pdf"])
    }
}

impl DirectoryObserver {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.into().to_lowercase())
                .collect(),
            state: Mutex::new(None),
        }
    }

    fn is_artifact(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let ext = ext.to_lowercase();
        !PARTIAL_SUFFIXES.contains(&ext.as_str()) && self.extensions.contains(&ext)
    }

    async fn new_artifact(&self, dir: &Path, baseline: &HashSet<PathBuf>) -> Option<PathBuf> {
        let mut entries = tokio::fs::read_dir(dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if baseline.contains(&path) || !self.is_artifact(&path) {
                continue;
            }
            match entry.metadata().await {
                Ok(meta) if meta.is_file() && meta.len() > 0 => return Some(path),
                _ => continue,
            }
        }
        None
    }
}

#[async_trait]
impl DownloadObserver for DirectoryObserver {
    async fn setup(&self, target_dir: &Path, _timeout: Duration) -> Result<(), ObserverError> {
        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|err| ObserverError::Directory(format!("{}: {err}", target_dir.display())))?;

        let mut baseline = HashSet::new();
        let mut entries = tokio::fs::read_dir(target_dir)
            .await
            .map_err(|err| ObserverError::Directory(format!("{}: {err}", target_dir.display())))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            baseline.insert(entry.path());
        }

        debug!(dir = %target_dir.display(), existing = baseline.len(), "download observer armed");
        *self.state.lock().await = Some(WatchState {
            dir: target_dir.to_path_buf(),
            baseline,
        });
        Ok(())
    }

    async fn wait_for_artifact(&self, timeout: Duration) -> ArtifactOutcome {
        let guard = self.state.lock().await;
        let Some(state) = guard.as_ref() else {
            return ArtifactOutcome::absent(ObserverError::NotReady.to_string());
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(path) = self.new_artifact(&state.dir, &state.baseline).await {
                info!(path = %path.display(), "artifact observed");
                return ArtifactOutcome::found(path.display().to_string());
            }
            let now = Instant::now();
            if now >= deadline {
                return ArtifactOutcome::absent("artifact_timeout");
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn cleanup(&self) {
        *self.state.lock().await = None;
    }
}

/// Degraded finality check: a document link or embed on the current page.
pub fn passive_artifact_hint(markup: &str) -> Option<String> {
    if let Some(c) = ARTIFACT_LINK_RE.captures(markup) {
        return Some(c[1].to_string());
    }
    ARTIFACT_TYPED_RE.find(markup).map(|m| {
        SRC_RE
            .captures(m.as_str())
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "embedded-document".to_string())
    })
}

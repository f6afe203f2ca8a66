use anyhow::{Context, Result};
use async_trait::async_trait;
use form_pilot::error::SurfaceError;
use form_pilot::surface::{BrowsingSurface, DomRequest, DomResponse};
use form_pilot::types::PageSnapshot;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use serde_json::json;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Page-side dispatcher for every [`DomRequest`].
const DOM_BRIDGE: &str = include_str!("../../../scripts/dom_bridge.js");

/// Serializes the page with live values, checks and selections as attributes.
const SNAPSHOT_JS: &str = include_str!("../../../scripts/snapshot.js");

/// How to get hold of a Chrome instance.
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    /// DevTools endpoint of an already running Chrome.
    pub attach_url: Option<String>,
    pub headless: bool,
    /// Persistent profile used when launching our own Chrome.
    pub profile_dir: PathBuf,
    /// Written into a fresh profile as the default download directory.
    pub download_dir: PathBuf,
}

impl BrowserSettings {
    pub fn default_profile_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("form-pilot")
            .join("profile")
    }
}

/// A Chrome tab driven over DevTools. Created once, reused for all runs.
pub struct ChromeSurface {
    _browser: Browser,
    tab: Arc<Tab>,
}

#[derive(Deserialize)]
struct Reach {
    #[serde(default)]
    reachable: bool,
}

impl ChromeSurface {
    pub fn launch(settings: &BrowserSettings) -> Result<Self> {
        if let Some(url) = &settings.attach_url {
            info!(url = %url, "attaching to running Chrome");
            match Browser::connect(url.clone()) {
                Ok(browser) => {
                    let tab = first_tab(&browser)?;
                    warn!(
                        "attached Chrome keeps its own download directory; point it at {}",
                        settings.download_dir.display()
                    );
                    return Ok(Self {
                        _browser: browser,
                        tab,
                    });
                }
                Err(err) => warn!(error = %err, "could not attach, launching a profile instead"),
            }
        }

        prepare_profile(&settings.profile_dir, &settings.download_dir)?;

        let options = LaunchOptions {
            headless: settings.headless,
            path: find_chrome(),
            user_data_dir: Some(settings.profile_dir.clone()),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        info!(profile = %settings.profile_dir.display(), headless = settings.headless, "starting Chrome");
        let browser = Browser::new(options).map_err(|e| anyhow::anyhow!("Browser launch failed: {e}"))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        info!("Chrome ready");

        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    /// Load `url` and wait for a body to exist.
    pub async fn open(&self, url: &str) -> Result<()> {
        let tab = self.tab.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            tab.wait_for_element("body")?;
            Ok(())
        })
        .await
        .context("navigation task panicked")?
    }

    async fn evaluate(&self, expression: String) -> Result<serde_json::Value, SurfaceError> {
        let tab = self.tab.clone();
        let remote = tokio::task::spawn_blocking(move || tab.evaluate(&expression, false))
            .await
            .map_err(|e| SurfaceError::Channel(format!("script task panicked: {e}")))?
            .map_err(|e| SurfaceError::Channel(e.to_string()))?;
        Ok(remote.value.unwrap_or(serde_json::Value::Null))
    }

    /// Run the dispatcher with `payload` and return its raw JSON reply.
    async fn dispatch(&self, payload: &serde_json::Value) -> Result<String, SurfaceError> {
        let expression = format!("{DOM_BRIDGE}({payload})");
        match self.evaluate(expression).await? {
            serde_json::Value::String(raw) => Ok(raw),
            other => Err(SurfaceError::Channel(format!(
                "dispatcher returned a non-string: {other}"
            ))),
        }
    }
}

#[async_trait]
impl BrowsingSurface for ChromeSurface {
    async fn snapshot(&self) -> Result<PageSnapshot, SurfaceError> {
        let markup = match self.evaluate(SNAPSHOT_JS.to_string()).await {
            Ok(serde_json::Value::String(markup)) => markup,
            Ok(other) => {
                return Err(SurfaceError::Snapshot(format!("unexpected markup value: {other}")));
            }
            Err(err) => return Err(SurfaceError::Snapshot(err.to_string())),
        };
        Ok(PageSnapshot::new(markup, self.tab.get_url()))
    }

    async fn invoke(&self, request: DomRequest) -> Result<DomResponse, SurfaceError> {
        let payload = serde_json::to_value(&request)
            .map_err(|e| SurfaceError::Channel(format!("request encode failed: {e}")))?;
        let raw = self.dispatch(&payload).await?;
        debug!(request = ?request, reply = %raw, "dom primitive");
        serde_json::from_str(&raw)
            .map_err(|e| SurfaceError::Channel(format!("undecodable reply {raw}: {e}")))
    }

    async fn is_reachable(&self, selector: &str) -> Result<bool, SurfaceError> {
        let raw = self
            .dispatch(&json!({ "op": "reachable", "selector": selector }))
            .await?;
        if let Ok(DomResponse::Missing) = serde_json::from_str::<DomResponse>(&raw) {
            return Ok(false);
        }
        let reach: Reach = serde_json::from_str(&raw)
            .map_err(|e| SurfaceError::Channel(format!("undecodable reply {raw}: {e}")))?;
        Ok(reach.reachable)
    }
}

fn first_tab(browser: &Browser) -> Result<Arc<Tab>> {
    let existing = {
        let tabs = browser.get_tabs();
        let tabs = tabs
            .lock()
            .map_err(|_| anyhow::anyhow!("tab list lock poisoned"))?;
        tabs.first().cloned()
    };
    match existing {
        Some(tab) => Ok(tab),
        None => browser.new_tab(),
    }
}

/// Create the profile on first use and point its downloads at `download_dir`
/// without a prompt. An existing profile is left as is so logins persist.
fn prepare_profile(profile_dir: &Path, download_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(download_dir)
        .with_context(|| format!("creating {}", download_dir.display()))?;

    let default_dir = profile_dir.join("Default");
    let preferences = default_dir.join("Preferences");
    if preferences.exists() {
        debug!(profile = %profile_dir.display(), "using existing profile");
        return Ok(());
    }

    std::fs::create_dir_all(&default_dir)
        .with_context(|| format!("creating {}", default_dir.display()))?;
    let prefs = json!({
        "download": {
            "default_directory": download_dir.to_string_lossy(),
            "prompt_for_download": false,
            "directory_upgrade": true,
        },
        "plugins": { "always_open_pdf_externally": true },
    });
    std::fs::write(&preferences, serde_json::to_vec_pretty(&prefs)?)
        .with_context(|| format!("writing {}", preferences.display()))?;
    info!(profile = %profile_dir.display(), downloads = %download_dir.display(), "created profile");
    Ok(())
}

/// Explicit `FORM_PILOT_CHROME`, then the usual install locations. `None`
/// lets headless_chrome look it up itself.
fn find_chrome() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("FORM_PILOT_CHROME") {
        return Some(PathBuf::from(path));
    }

    let mut candidates = vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/chromium"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(
            local
                .join("Google")
                .join("Chrome")
                .join("Application")
                .join("chrome.exe"),
        );
    }

    candidates.into_iter().find(|p| p.exists())
}

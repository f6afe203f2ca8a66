mod face;
mod hands;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use form_pilot::calibration::{CalibratedClassifier, CalibrationFile};
use form_pilot::classifier::{HttpClassifier, PageClassifier};
use form_pilot::config::EngineConfig;
use form_pilot::engine::Engine;
use form_pilot::entry::{EntryFinder, EntryOutcome};
use form_pilot::events::{EventSink, RunEvent};
use form_pilot::finality::DirectoryObserver;
use form_pilot::types::{SourceValues, TerminalResult};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hands::{BrowserSettings, ChromeSurface};

const UI_PORTS: std::ops::Range<u16> = 3000..3010;

#[derive(Parser)]
#[command(name = "form-pilot")]
#[command(about = "Walk multi-page quote forms using values extracted from documents")]
#[command(version)]
struct Cli {
    /// JSON config file. FORM_PILOT_* variables and flags override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    browser: BrowserArgs,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct BrowserArgs {
    /// DevTools endpoint of a running Chrome, e.g. http://127.0.0.1:9222
    #[arg(long, global = true)]
    attach: Option<String>,

    #[arg(long, global = true)]
    headless: bool,

    #[arg(long, global = true)]
    profile_dir: Option<PathBuf>,
}

#[derive(Args)]
struct Overrides {
    #[arg(long, global = true)]
    task: Option<String>,

    #[arg(long, global = true)]
    max_iterations: Option<u32>,

    #[arg(long, global = true)]
    classifier_url: Option<String>,

    #[arg(long, global = true)]
    escalated_classifier_url: Option<String>,

    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    calibration: Option<PathBuf>,

    /// Type character by character instead of injecting the value.
    #[arg(long, global = true)]
    simulate_typing: bool,

    #[arg(long, global = true)]
    no_highlight: bool,
}

impl Overrides {
    fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(task) = &self.task {
            config.task = task.clone();
        }
        if let Some(max) = self.max_iterations {
            config.max_iterations = max;
        }
        if let Some(url) = &self.classifier_url {
            config.classifier_url = url.clone();
        }
        if let Some(url) = &self.escalated_classifier_url {
            config.escalated_classifier_url = Some(url.clone());
        }
        if let Some(dir) = &self.download_dir {
            config.download_dir = Some(dir.clone());
        }
        if let Some(path) = &self.calibration {
            config.calibration_path = Some(path.clone());
        }
        if self.simulate_typing {
            config.write.simulate_typing = true;
        }
        if self.no_highlight {
            config.highlight_actions = false;
        }
        config
    }
}

#[derive(Subcommand)]
enum Command {
    /// Fill one form and print the result as JSON.
    Run(RunArgs),
    /// Serve the web UI and run forms posted to it.
    Serve,
}

#[derive(Args)]
struct RunArgs {
    /// Page to start on.
    url: String,

    /// Source values: a JSON object, or `{"values": ..., "rawText": ...}`.
    #[arg(long)]
    source: PathBuf,

    /// Plain-text dump of the source document, used as a last resort.
    #[arg(long)]
    raw_text: Option<PathBuf>,

    /// Look for the link into the quote flow before filling.
    #[arg(long)]
    find_entry: bool,
}

/// Classifiers and observer shared by every run.
struct Pilot {
    config: EngineConfig,
    classifier: CalibratedClassifier<HttpClassifier>,
    escalated: Option<HttpClassifier>,
    observer: DirectoryObserver,
}

impl Pilot {
    fn new(config: EngineConfig) -> Result<Self> {
        let classifier = HttpClassifier::with_timeout(&config.classifier_url, config.classifier_timeout())?
            .with_api_key(config.classifier_api_key.clone());
        let calibration = CalibrationFile::load_or_empty(config.calibration_path.as_deref())?;
        if !calibration.is_empty() {
            info!(entries = calibration.entries.len(), "using recorded calibration");
        }

        let escalated = match &config.escalated_classifier_url {
            Some(url) => Some(
                HttpClassifier::with_timeout(url, config.classifier_timeout())?
                    .with_api_key(config.classifier_api_key.clone()),
            ),
            None => None,
        };

        Ok(Self {
            classifier: CalibratedClassifier::new(classifier, calibration),
            escalated,
            observer: DirectoryObserver::default(),
            config,
        })
    }

    async fn run(
        &self,
        surface: &ChromeSurface,
        url: &str,
        source: SourceValues,
        find_entry: bool,
        events: EventSink,
    ) -> Result<TerminalResult> {
        surface
            .open(url)
            .await
            .with_context(|| format!("opening {url}"))?;

        if find_entry {
            let finder = EntryFinder::new(surface, &self.classifier)
                .with_timeout(self.config.navigation_timeout())
                .with_interval(self.config.navigation_poll())
                .with_highlight(self.config.highlight_actions);
            let outcome = finder
                .find(&self.config.task)
                .await
                .context("finding the way into the quote form")?;
            match outcome {
                EntryOutcome::Entered { target, snapshot } => {
                    info!(target = %target.describe(), url = %snapshot.url, "entered the form");
                }
                EntryOutcome::NoChange { tried } => {
                    warn!(tried, "no entry target changed the page, starting where we are");
                }
            }
        }

        let heavy: &dyn PageClassifier = match &self.escalated {
            Some(heavy) => heavy,
            None => &self.classifier,
        };
        let engine = Engine::new(surface, &self.classifier, self.config.clone())
            .with_observer(&self.observer)
            .with_events(events);
        Ok(engine.run_with_escalation(heavy, source).await)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("form_pilot=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), &cli.overrides)?;

    let settings = BrowserSettings {
        attach_url: cli.browser.attach.clone(),
        headless: cli.browser.headless,
        profile_dir: cli
            .browser
            .profile_dir
            .clone()
            .unwrap_or_else(BrowserSettings::default_profile_dir),
        download_dir: config.resolved_download_dir(),
    };
    let pilot = Pilot::new(config)?;

    match cli.command {
        Command::Run(args) => run_once(&pilot, &settings, args).await,
        Command::Serve => serve(&pilot, &settings).await,
    }
}

fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<EngineConfig> {
    let base = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    Ok(overrides.apply(base.apply_env()?))
}

fn read_source(path: &Path, raw_text: Option<&Path>) -> Result<SourceValues> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let mut source = if value.get("values").is_some() {
        serde_json::from_value::<SourceValues>(value)?
    } else {
        SourceValues::new(value)
    };
    if let Some(raw) = raw_text {
        let raw = std::fs::read_to_string(raw).with_context(|| format!("reading {}", raw.display()))?;
        source = source.with_raw_text(raw);
    }
    Ok(source)
}

async fn launch(settings: &BrowserSettings) -> Result<ChromeSurface> {
    let settings = settings.clone();
    tokio::task::spawn_blocking(move || ChromeSurface::launch(&settings))
        .await
        .map_err(|e| anyhow::anyhow!("Browser launch panicked: {e}"))?
}

async fn run_once(pilot: &Pilot, settings: &BrowserSettings, args: RunArgs) -> Result<()> {
    let source = read_source(&args.source, args.raw_text.as_deref())?;
    let surface = launch(settings).await?;

    let result = pilot
        .run(&surface, &args.url, source, args.find_entry, EventSink::disabled())
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.ok {
        info!("{}", result.message());
    } else {
        warn!("{}", result.message());
    }
    Ok(())
}

/// Event for a run that ended in an error instead of a result.
fn aborted(url: &str, err: &anyhow::Error) -> RunEvent {
    RunEvent::Aborted {
        url: url.to_string(),
        message: format!("{err:#}"),
    }
}

async fn serve(pilot: &Pilot, settings: &BrowserSettings) -> Result<()> {
    let (event_tx, _) = broadcast::channel::<RunEvent>(128);
    let mut runs = face::start_server(UI_PORTS, event_tx.clone()).await?;

    let surface = launch(settings).await?;
    info!("waiting for runs");

    while let Some(request) = runs.recv().await {
        let events = EventSink::from_sender(event_tx.clone());
        match pilot
            .run(&surface, &request.url, request.source, request.find_entry, events.clone())
            .await
        {
            Ok(result) => info!(ok = result.ok, "{}", result.message()),
            Err(err) => {
                error!(error = %format!("{err:#}"), url = %request.url, "run aborted");
                events.emit(aborted(&request.url, &err));
            }
        }
    }

    Ok(())
}

use anyhow::Result;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use form_pilot::events::RunEvent;
use form_pilot::types::SourceValues;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, warn};

/// One queued run, as posted by the web UI.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub url: String,
    #[serde(default)]
    pub source: SourceValues,
    #[serde(default)]
    pub find_entry: bool,
}

#[derive(Clone)]
struct AppState {
    run_tx: mpsc::Sender<RunRequest>,
    event_tx: broadcast::Sender<RunEvent>,
}

fn to_sse_event(event: &RunEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(data) => Some(Event::default().event(event.name()).data(data)),
        Err(err) => {
            warn!(error = %err, "dropping unserializable event");
            None
        }
    }
}

/// Bind the first free port in `ports`, serve the UI and return the run queue.
pub async fn start_server(
    ports: std::ops::Range<u16>,
    event_tx: broadcast::Sender<RunEvent>,
) -> Result<mpsc::Receiver<RunRequest>> {
    let (run_tx, run_rx) = mpsc::channel::<RunRequest>(4);

    let state = Arc::new(AppState { run_tx, event_tx });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/run", post(run_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state);

    let mut bound = None;
    for port in ports.clone() {
        if let Ok(listener) = tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            bound = Some((listener, port));
            break;
        }
    }
    let Some((listener, port)) = bound else {
        anyhow::bail!(
            "Could not bind to any port {}-{}. Stop the other instance first.",
            ports.start,
            ports.end.saturating_sub(1)
        );
    };

    info!(url = %format!("http://localhost:{port}"), "web UI running");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(error = %err, "web UI stopped");
        }
    });

    Ok(run_rx)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RunRequest>,
) -> StatusCode {
    info!(url = %payload.url, "run requested");
    match state.run_tx.try_send(payload) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(mpsc::error::TrySendError::Full(_)) => StatusCode::TOO_MANY_REQUESTS,
        Err(mpsc::error::TrySendError::Closed(_)) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => to_sse_event(&event).map(Ok::<_, Infallible>),
        Err(_) => None,
    });
    Sse::new(stream)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>form-pilot</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    height: 100vh;
    display: flex;
    flex-direction: column;
  }
  header {
    padding: 20px 32px;
    border-bottom: 1px solid #1a1a2e;
    display: flex;
    align-items: center;
    gap: 12px;
  }
  header h1 { font-size: 18px; font-weight: 600; color: #fff; }
  header .dot { width: 8px; height: 8px; border-radius: 50%; background: #22c55e; }
  header .dot.busy { background: #f59e0b; }
  .main {
    flex: 1;
    display: flex;
    flex-direction: column;
    max-width: 860px;
    width: 100%;
    margin: 0 auto;
    padding: 20px 32px;
    gap: 12px;
    overflow: hidden;
  }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 6px; }
  .entry {
    padding: 8px 12px;
    border-radius: 6px;
    font-family: 'Cascadia Code', 'Fira Code', monospace;
    font-size: 13px;
    background: #111118;
    border-left: 3px solid #3b82f6;
  }
  .entry.skip { border-left-color: #f59e0b; color: #fcd34d; }
  .entry.error { border-left-color: #ef4444; color: #fca5a5; background: #1a0a0a; }
  .entry.done { border-left-color: #22c55e; color: #86efac; background: #0a1a0a; }
  input, textarea {
    background: #111118;
    border: 1px solid #222;
    border-radius: 6px;
    padding: 10px 12px;
    color: #fff;
    font-size: 14px;
    outline: none;
  }
  textarea { height: 120px; font-family: monospace; resize: vertical; }
  .row { display: flex; gap: 8px; align-items: center; }
  #url { flex: 1; }
  button {
    background: #6366f1;
    color: #fff;
    border: none;
    border-radius: 6px;
    padding: 10px 20px;
    font-weight: 600;
    cursor: pointer;
  }
  button:disabled { background: #333; cursor: not-allowed; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="status-dot"></div>
    <h1>form-pilot</h1>
  </header>
  <div class="main">
    <div id="log"></div>
    <div class="row">
      <input type="text" id="url" placeholder="Quote form URL" />
      <label><input type="checkbox" id="entry" /> find entry</label>
      <button id="send" onclick="send()">Run</button>
    </div>
    <textarea id="source" placeholder='{"values": {"plate_number": "34 ABC 123"}}'></textarea>
  </div>
<script>
  const log = document.getElementById('log');
  const sendBtn = document.getElementById('send');
  const dot = document.getElementById('status-dot');
  const esc = s => String(s).replace(/</g, '&lt;');

  function addEntry(cls, text) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = esc(text);
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
  }

  function setBusy(b) {
    sendBtn.disabled = b;
    dot.className = b ? 'dot busy' : 'dot';
  }

  async function send() {
    let source;
    try {
      source = JSON.parse(document.getElementById('source').value || '{}');
    } catch (e) {
      addEntry('error', 'source values are not JSON: ' + e.message);
      return;
    }
    const url = document.getElementById('url').value.trim();
    if (!url) return;
    setBusy(true);
    const res = await fetch('/run', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({url, source, findEntry: document.getElementById('entry').checked}),
    });
    if (!res.ok) {
      addEntry('error', 'run rejected: HTTP ' + res.status);
      setBusy(false);
    }
  }

  const es = new EventSource('/events');
  const on = (name, fn) => es.addEventListener(name, e => fn(JSON.parse(e.data)));

  on('run_started', d => addEntry('', 'run started (' + d.strategy + ') at ' + d.url));
  on('iteration', d => addEntry('', '#' + d.number + ' ' + d.url));
  on('revisit', d => addEntry('skip', 'revisiting ' + d.url));
  on('classified', d => addEntry('', (d.cached ? 'cached: ' : 'classified: ') + d.fields + ' fields, ' + d.actions + ' actions' + (d.is_final ? ', final' : '')));
  on('field_committed', d => addEntry('', 'filled ' + d.key + ' -> ' + d.selector));
  on('field_skipped', d => addEntry('skip', 'skipped ' + JSON.stringify(d.issue)));
  on('gate', d => addEntry(d.permitted ? '' : 'skip', 'gate ' + (d.permitted ? 'open' : 'closed') + ' ' + d.committed + '/' + d.required + (d.forced ? ' (forced)' : '')));
  on('action_triggered', d => addEntry('', 'clicked ' + d.selector));
  on('no_action_fired', () => addEntry('skip', 'no action fired'));
  on('navigated', d => addEntry('', d.from + ' -> ' + d.to));
  on('artifact_observed', d => addEntry('done', 'document: ' + d.path));
  on('escalating', d => addEntry('skip', 'escalating: ' + d.reason));
  on('finished', d => {
    const r = d.result;
    addEntry(r.ok ? 'done' : 'error', r.ok ? 'finished' : 'failed: ' + JSON.stringify(r.error));
    setBusy(false);
  });
  on('aborted', d => {
    addEntry('error', 'aborted: ' + d.message);
    setBusy(false);
  });
</script>
</body>
</html>
"##;

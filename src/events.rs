//! Run progress events.
//!
//! The engine publishes what it is doing on a broadcast channel so a UI can
//! follow along. Nobody listening is fine; sends never block the run.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::FieldIssue;
use crate::types::{Strategy, TerminalResult};

const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted { strategy: Strategy, url: String },
    Iteration { number: u32, url: String },
    Revisit { url: String },
    Classified { cached: bool, fields: usize, actions: usize, is_final: bool },
    FieldCommitted { key: String, selector: String, attempt: u32 },
    FieldSkipped { issue: FieldIssue },
    Gate { permitted: bool, forced: bool, committed: usize, required: usize },
    ActionTriggered { selector: String },
    NoActionFired,
    Navigated { from: String, to: String },
    ArtifactObserved { path: String },
    Escalating { reason: String },
    Finished { result: TerminalResult },
    /// The run never produced a result: the page could not be opened or the
    /// way into the form failed.
    Aborted { url: String, message: String },
}

impl RunEvent {
    /// Short event name, used as the SSE event type.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::Iteration { .. } => "iteration",
            RunEvent::Revisit { .. } => "revisit",
            RunEvent::Classified { .. } => "classified",
            RunEvent::FieldCommitted { .. } => "field_committed",
            RunEvent::FieldSkipped { .. } => "field_skipped",
            RunEvent::Gate { .. } => "gate",
            RunEvent::ActionTriggered { .. } => "action_triggered",
            RunEvent::NoActionFired => "no_action_fired",
            RunEvent::Navigated { .. } => "navigated",
            RunEvent::ArtifactObserved { .. } => "artifact_observed",
            RunEvent::Escalating { .. } => "escalating",
            RunEvent::Finished { .. } => "finished",
            RunEvent::Aborted { .. } => "aborted",
        }
    }
}

/// Cloneable publishing end. A sink without a channel drops everything.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<broadcast::Sender<RunEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, broadcast::Receiver<RunEvent>) {
        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        (Self { tx: Some(tx) }, rx)
    }

    pub fn from_sender(tx: broadcast::Sender<RunEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<RunEvent>> {
        self.tx.as_ref().map(broadcast::Sender::subscribe)
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            // No receivers is not an error.
            let _ = tx.send(event);
        }
    }
}

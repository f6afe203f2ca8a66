//! Navigation and fill engine for multi-page quotation forms.
//!
//! The engine drives a page it does not own: it snapshots the page, asks a
//! [`PageClassifier`] what the fields and controls are, writes source values
//! into the live form through a [`BrowsingSurface`], verifies them, advances
//! the page and watches for the produced document.

pub mod actions;
pub mod calibration;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod events;
pub mod finality;
pub mod monitor;
pub mod mutator;
pub mod resolver;
pub mod surface;
pub mod types;

pub use calibration::{CalibratedClassifier, CalibrationFile};
pub use classifier::{Classification, HttpClassifier, PageClassifier};
pub use config::EngineConfig;
pub use engine::{Engine, RunContext, StepOutcome};
pub use entry::{EntryFinder, EntryOutcome};
pub use error::{FailureReason, FieldIssue};
pub use events::{EventSink, RunEvent};
pub use finality::{DirectoryObserver, DownloadObserver};
pub use surface::{BrowsingSurface, DomRequest, DomResponse, ElementState};
pub use types::{ActionSpec, FieldMapping, PageSnapshot, SourceValues, Strategy, TerminalResult};

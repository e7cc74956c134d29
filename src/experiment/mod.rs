//! Experiment Orchestration
//!
//! Bluesky-style execution layer:
//!
//! - [`document`] - Start/Descriptor/Event/Stop documents describing a run
//! - [`plans`] - declarative plans yielding [`plans::PlanCommand`]s
//! - [`run_engine`] - executes moves, reads and waits against the device
//!   registry, groups concurrent moves and emits documents
//! - [`scans`] - step and fly scans of one motor against one detector

pub mod document;
pub mod plans;
pub mod run_engine;
pub mod scans;

pub use document::{Document, EventDoc, ExitStatus, StartDoc, StopDoc};
pub use plans::{Count, LineScan, Plan, PlanCommand};
pub use run_engine::{
    DocumentCollector, DocumentSubscriber, EngineMessage, MoveOptions, RunEngine, ScanContext,
    ScanHandle,
};
pub use scans::{FastScan, Scan, ScanTarget, StepScan};

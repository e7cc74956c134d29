//! Run documents
//!
//! Bluesky-style document model that decouples scans from whatever consumes
//! their data (peak statistics, logging, export):
//!
//! - **StartDoc**: plan identity and arguments
//! - **DescriptorDoc**: schema of the primary stream
//! - **EventDoc**: one set of detector readings and motor positions
//! - **StopDoc**: exit status and event count
//!
//! # Document Flow
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── DescriptorDoc (1, "primary")
//!    │       │
//!    │       └── EventDoc (N)
//!    │
//! StopDoc (1)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch (0 if the clock is before it)
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Document types emitted by a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Run start - intent and arguments
    Start(StartDoc),
    /// Data stream descriptor - schema definition
    Descriptor(DescriptorDoc),
    /// Event document - actual measurement data
    Event(EventDoc),
    /// Run stop - completion status
    Stop(StopDoc),
}

impl Document {
    /// Get the run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.run_uid,
            Document::Event(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }

    /// Short name of the document kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Event(_) => "event",
            Document::Stop(_) => "stop",
        }
    }

    /// Serialize to a JSON line
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Start document - emitted at the beginning of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    /// Plan type that generated this run
    pub plan_type: String,
    /// User-friendly plan name
    pub plan_name: String,
    /// Plan arguments
    pub plan_args: HashMap<String, String>,
    /// Motors the plan moves
    pub motors: Vec<String>,
    /// Detectors the plan reads
    pub detectors: Vec<String>,
    /// Timestamp when run started
    pub time_ns: u64,
}

impl StartDoc {
    /// Start document with a fresh run uid.
    pub fn new(plan_type: &str, plan_name: &str) -> Self {
        Self {
            uid: new_uid(),
            plan_type: plan_type.to_string(),
            plan_name: plan_name.to_string(),
            plan_args: HashMap::new(),
            motors: Vec::new(),
            detectors: Vec::new(),
            time_ns: now_ns(),
        }
    }

    /// Record a plan argument
    pub fn with_arg(mut self, key: &str, value: &str) -> Self {
        self.plan_args.insert(key.to_string(), value.to_string());
        self
    }
}

/// Descriptor document - defines schema for event data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Stream name, always "primary" for scans in this crate
    pub name: String,
    /// Schema for data fields
    pub data_keys: HashMap<String, DataKey>,
    /// Timestamp
    pub time_ns: u64,
}

impl DescriptorDoc {
    /// Descriptor for a named stream of a run.
    pub fn new(run_uid: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            name: name.to_string(),
            data_keys: HashMap::new(),
            time_ns: now_ns(),
        }
    }

    /// Add a field to the schema
    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type, "number" for every scalar here
    pub dtype: String,
    /// Source device name
    pub source: String,
    /// True when the field is a motor position
    pub is_position: bool,
}

impl DataKey {
    /// Scalar detector field
    pub fn detector(source: &str) -> Self {
        Self {
            dtype: "number".to_string(),
            source: source.to_string(),
            is_position: false,
        }
    }

    /// Scalar motor position
    pub fn motor(source: &str) -> Self {
        Self {
            dtype: "number".to_string(),
            source: source.to_string(),
            is_position: true,
        }
    }
}

/// Event document - one row of a scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event ID
    pub uid: String,
    /// Links to StartDoc (for quick run lookup)
    pub run_uid: String,
    /// Links to DescriptorDoc that defines schema
    pub descriptor_uid: String,
    /// Event sequence number, starting at 1
    pub seq_num: u32,
    /// Timestamp
    pub time_ns: u64,
    /// Detector readings, keyed `"<device>-<field>"`
    pub data: HashMap<String, f64>,
    /// Motor readbacks, keyed by motor name
    pub positions: HashMap<String, f64>,
}

impl EventDoc {
    /// Empty event for a descriptor.
    pub fn new(run_uid: &str, descriptor_uid: &str, seq_num: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num,
            time_ns: now_ns(),
            data: HashMap::new(),
            positions: HashMap::new(),
        }
    }

    /// Add a detector reading
    pub fn with_datum(mut self, field: &str, value: f64) -> Self {
        self.data.insert(field.to_string(), value);
        self
    }

    /// Add a motor position
    pub fn with_position(mut self, axis: &str, position: f64) -> Self {
        self.positions.insert(axis.to_string(), position);
        self
    }

    /// Look a key up in positions first, then in data.
    pub fn value(&self, key: &str) -> Option<f64> {
        self.positions
            .get(key)
            .or_else(|| self.data.get(key))
            .copied()
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Plan ran to completion
    Success,
    /// Run engine abort flag observed
    Abort,
    /// A device or plan error ended the run
    Fail,
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitStatus::Success => "success",
            ExitStatus::Abort => "abort",
            ExitStatus::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop doc ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Exit status
    pub exit_status: ExitStatus,
    /// Reason for abort/failure
    pub reason: String,
    /// Timestamp when run ended
    pub time_ns: u64,
    /// Total events emitted
    pub num_events: u32,
}

impl StopDoc {
    /// Stop document for a run that ended with `exit_status`.
    pub fn new(run_uid: &str, exit_status: ExitStatus, reason: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status,
            reason: reason.to_string(),
            time_ns: now_ns(),
            num_events,
        }
    }

    /// Successful completion
    pub fn success(run_uid: &str, num_events: u32) -> Self {
        Self::new(run_uid, ExitStatus::Success, "", num_events)
    }
}

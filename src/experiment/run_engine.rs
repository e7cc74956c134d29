//! RunEngine - cooperative executor for alignment procedures
//!
//! The RunEngine is the only thing in this crate that talks to devices. Procedures
//! call its plan stubs (`move_to`, `wait`, `read`, `checkpoint`, `delay`), and scans
//! execute [`Plan`]s through a [`ScanContext`] that turns plan commands into
//! Start/Descriptor/Event/Stop documents.
//!
//! # Suspension points
//!
//! Every `.await` on the engine is a device boundary. Aborting sets a flag that
//! [`RunEngine::checkpoint`] and [`RunEngine::delay`] observe; both then fail with
//! [`AlignError::Aborted`] so the procedure unwinds through its cleanup.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = RunEngine::new(Arc::new(registry));
//!
//! // Start both slit gaps together, then join them
//! engine.move_to("slit_x", 0.5, MoveOptions::in_group("slits")).await?;
//! engine.move_to("slit_y", 0.5, MoveOptions::in_group("slits")).await?;
//! engine.wait("slits").await?;
//!
//! // Execute a plan with a subscriber attached
//! let mut collector = DocumentCollector::default();
//! let mut ctx = ScanContext::new(&engine);
//! ctx.subscribe(&mut collector);
//! let handle = ctx.execute_plan(&mut LineScan::new("slit_x", 0.0, 1.0, 11).with_detector("det")).await?;
//! ```

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, instrument, warn};

use super::document::{
    DataKey, DescriptorDoc, Document, EventDoc, ExitStatus, StartDoc, StopDoc,
};
use super::plans::{Plan, PlanCommand};
use crate::error::{AlignError, AlignResult};
use crate::hardware::capabilities::{MotionLimits, Movable, Readable};
use crate::hardware::registry::DeviceRegistry;

/// Group used for un-waited moves issued without a group name.
pub const UNGROUPED: &str = "";

/// Delays are slept in chunks of this size so an abort is noticed promptly.
const DELAY_CHUNK: Duration = Duration::from_millis(100);

/// How a move is issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOptions {
    /// Resolve only after the device reports completion
    pub wait: bool,
    /// Group the move is tracked under
    pub group: Option<String>,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self::wait()
    }
}

impl MoveOptions {
    /// Wait for the move to complete
    pub fn wait() -> Self {
        Self {
            wait: true,
            group: None,
        }
    }

    /// Start the move and return immediately
    pub fn no_wait() -> Self {
        Self {
            wait: false,
            group: None,
        }
    }

    /// Start the move under `group` without waiting; join it later with
    /// [`RunEngine::wait`].
    pub fn in_group(group: impl Into<String>) -> Self {
        Self {
            wait: false,
            group: Some(group.into()),
        }
    }

    /// Same options with a group attached
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Message recorded by the engine when journaling is enabled.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    /// A setpoint was issued
    Set {
        /// Device name
        device: String,
        /// Target value
        value: f64,
        /// Whether the call waited for completion
        wait: bool,
        /// Group the move was tracked under
        group: Option<String>,
    },
    /// A group was joined
    Wait {
        /// Group name
        group: String,
    },
    /// A device was read
    Read {
        /// Device name
        device: String,
    },
    /// A checkpoint was passed
    Checkpoint,
    /// A delay was slept
    Sleep {
        /// Seconds requested
        seconds: f64,
    },
}

/// Receives every document of the runs it is attached to.
pub trait DocumentSubscriber: Send {
    /// Handle one document
    fn on_document(&mut self, doc: &Document);
}

/// Subscriber that keeps every document it sees.
#[derive(Debug, Default)]
pub struct DocumentCollector {
    /// Documents in emission order
    pub documents: Vec<Document>,
}

impl DocumentCollector {
    /// Event documents only
    pub fn events(&self) -> Vec<&EventDoc> {
        self.documents
            .iter()
            .filter_map(|d| match d {
                Document::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }
}

impl DocumentSubscriber for DocumentCollector {
    fn on_document(&mut self, doc: &Document) {
        self.documents.push(doc.clone());
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct ScanHandle {
    /// Run uid (the Start document's uid)
    pub run_uid: String,
    /// Events emitted
    pub num_events: u32,
    /// How the run ended
    pub exit_status: ExitStatus,
}

/// An un-waited move and the device it drives.
struct MoveTask {
    movable: Arc<dyn Movable>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl MoveTask {
    async fn join(self) -> AlignResult<()> {
        match self.handle.await {
            Ok(inner) => inner.map_err(AlignError::from),
            Err(e) => Err(AlignError::Device(anyhow::anyhow!("move task failed: {e}"))),
        }
    }
}

/// Cooperative executor for plans and plan stubs
pub struct RunEngine {
    registry: Arc<DeviceRegistry>,
    doc_sender: broadcast::Sender<Document>,
    abort_reason: RwLock<Option<String>>,
    groups: Mutex<HashMap<String, Vec<MoveTask>>>,
    last_checkpoint: RwLock<Option<String>>,
    journal_enabled: AtomicBool,
    journal: Mutex<Vec<EngineMessage>>,
}

impl RunEngine {
    /// Create a new RunEngine over a device registry
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        let (doc_sender, _) = broadcast::channel(1024);
        Self {
            registry,
            doc_sender,
            abort_reason: RwLock::new(None),
            groups: Mutex::new(HashMap::new()),
            last_checkpoint: RwLock::new(None),
            journal_enabled: AtomicBool::new(false),
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Record every engine message for later inspection.
    pub fn with_journal(self) -> Self {
        self.journal_enabled.store(true, Ordering::SeqCst);
        self
    }

    /// Messages recorded since journaling was enabled
    pub async fn messages(&self) -> Vec<EngineMessage> {
        self.journal.lock().await.clone()
    }

    async fn record(&self, msg: EngineMessage) {
        if self.journal_enabled.load(Ordering::SeqCst) {
            self.journal.lock().await.push(msg);
        }
    }

    /// Device registry the engine drives
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Subscribe to every document the engine emits
    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.doc_sender.subscribe()
    }

    fn movable(&self, device: &str) -> AlignResult<Arc<dyn Movable>> {
        self.registry
            .get_movable(device)
            .ok_or_else(|| AlignError::DeviceNotFound {
                device: device.to_string(),
                capability: "movable",
            })
    }

    fn readable(&self, device: &str) -> AlignResult<Arc<dyn Readable>> {
        self.registry
            .get_readable(device)
            .ok_or_else(|| AlignError::DeviceNotFound {
                device: device.to_string(),
                capability: "readable",
            })
    }

    /// Limits and velocity of a motor
    pub fn limits(&self, device: &str) -> AlignResult<Arc<dyn MotionLimits>> {
        self.registry
            .get_limits(device)
            .ok_or_else(|| AlignError::DeviceNotFound {
                device: device.to_string(),
                capability: "limited",
            })
    }

    // =========================================================================
    // Plan stubs
    // =========================================================================

    /// Command a device to `value`.
    ///
    /// With `wait` the call resolves when the move completes (joining the
    /// whole group if one is named). Without it the move runs as a task
    /// tracked under the group, or [`UNGROUPED`].
    #[instrument(skip(self), err)]
    pub async fn move_to(&self, device: &str, value: f64, opts: MoveOptions) -> AlignResult<()> {
        let movable = self.movable(device)?;
        self.record(EngineMessage::Set {
            device: device.to_string(),
            value,
            wait: opts.wait,
            group: opts.group.clone(),
        })
        .await;

        match (opts.wait, opts.group) {
            (true, None) => {
                movable.move_abs(value).await?;
                Ok(())
            }
            (true, Some(group)) => {
                self.spawn_move(movable, value, &group).await;
                self.wait(&group).await
            }
            (false, group) => {
                let group = group.unwrap_or_else(|| UNGROUPED.to_string());
                self.spawn_move(movable, value, &group).await;
                Ok(())
            }
        }
    }

    async fn spawn_move(&self, movable: Arc<dyn Movable>, value: f64, group: &str) {
        let device = movable.clone();
        let task = MoveTask {
            movable,
            handle: tokio::spawn(async move { device.move_abs(value).await }),
        };
        self.groups
            .lock()
            .await
            .entry(group.to_string())
            .or_default()
            .push(task);
        // Let the move be issued before the caller reads anything back
        tokio::task::yield_now().await;
    }

    /// Move by `delta` relative to the current position
    pub async fn move_rel(&self, device: &str, delta: f64, opts: MoveOptions) -> AlignResult<()> {
        let current = self.movable(device)?.position().await?;
        debug!(device, current, delta, "Relative move");
        self.move_to(device, current + delta, opts).await
    }

    /// Join every move tracked under `group`, returning the first failure.
    #[instrument(skip(self), err)]
    pub async fn wait(&self, group: &str) -> AlignResult<()> {
        self.record(EngineMessage::Wait {
            group: group.to_string(),
        })
        .await;
        let tasks = self.groups.lock().await.remove(group).unwrap_or_default();
        if tasks.is_empty() {
            debug!(group, "Wait on empty group");
        }

        let mut first_error = None;
        for result in join_all(tasks.into_iter().map(MoveTask::join)).await {
            if let Err(e) = result {
                warn!(group, error = %e, "Move in group failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// True once every move in `group` has finished (or none was issued).
    pub async fn group_done(&self, group: &str) -> bool {
        self.groups
            .lock()
            .await
            .get(group)
            .map_or(true, |tasks| tasks.iter().all(|t| t.handle.is_finished()))
    }

    /// Collect the moves in `group` that have already finished and return the
    /// first failure among them. Moves still running stay tracked.
    pub async fn check_group(&self, group: &str) -> AlignResult<()> {
        let finished = {
            let mut groups = self.groups.lock().await;
            let Some(tasks) = groups.get_mut(group) else {
                return Ok(());
            };
            let (finished, running): (Vec<_>, Vec<_>) =
                std::mem::take(tasks).into_iter().partition(|t| t.handle.is_finished());
            if running.is_empty() {
                groups.remove(group);
            } else {
                *tasks = running;
            }
            finished
        };

        let mut first_error = None;
        for result in join_all(finished.into_iter().map(MoveTask::join)).await {
            if let Err(e) = result {
                warn!(group, error = %e, "Move in group failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stop every move still running in `group` and stop tracking the group.
    ///
    /// Each device is told to stop before its task is aborted. Failures of
    /// moves that had already finished are discarded.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, group: &str) -> AlignResult<()> {
        let tasks = self.groups.lock().await.remove(group).unwrap_or_default();
        let mut first_error = None;
        for task in tasks {
            if task.handle.is_finished() {
                continue;
            }
            debug!(group, "Stopping move in progress");
            if let Err(e) = task.movable.stop().await {
                warn!(group, error = %e, "Stop request failed");
                first_error.get_or_insert(AlignError::from(e));
            }
            task.handle.abort();
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Join every tracked move in every group
    pub async fn wait_all(&self) -> AlignResult<()> {
        let groups: Vec<String> = self.groups.lock().await.keys().cloned().collect();
        let mut first_error = None;
        for group in groups {
            if let Err(e) = self.wait(&group).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Read the primary value of a device
    pub async fn read(&self, device: &str) -> AlignResult<f64> {
        let readable = self.readable(device)?;
        self.record(EngineMessage::Read {
            device: device.to_string(),
        })
        .await;
        Ok(readable.read().await?)
    }

    /// Read every field of a device
    pub async fn read_fields(&self, device: &str) -> AlignResult<HashMap<String, f64>> {
        let readable = self.readable(device)?;
        self.record(EngineMessage::Read {
            device: device.to_string(),
        })
        .await;
        Ok(readable.read_fields().await?)
    }

    /// Current position of a movable device
    pub async fn position(&self, device: &str) -> AlignResult<f64> {
        Ok(self.movable(device)?.position().await?)
    }

    /// Safe point. Fails with [`AlignError::Aborted`] once an abort is requested.
    pub async fn checkpoint(&self) -> AlignResult<()> {
        self.record(EngineMessage::Checkpoint).await;
        self.check_abort().await
    }

    async fn check_abort(&self) -> AlignResult<()> {
        match self.abort_reason.read().await.as_ref() {
            Some(reason) => Err(AlignError::Aborted(reason.clone())),
            None => Ok(()),
        }
    }

    /// Sleep for `seconds`, interruptible by abort.
    pub async fn delay(&self, seconds: f64) -> AlignResult<()> {
        self.record(EngineMessage::Sleep { seconds }).await;
        let total = Duration::from_secs_f64(seconds.max(0.0));
        let mut elapsed = Duration::ZERO;

        while elapsed < total {
            if let Err(e) = self.check_abort().await {
                info!(
                    elapsed_ms = %elapsed.as_millis(),
                    total_ms = %total.as_millis(),
                    "Delay interrupted by abort request"
                );
                return Err(e);
            }
            let step = DELAY_CHUNK.min(total - elapsed);
            sleep(step).await;
            elapsed += step;
        }
        self.check_abort().await
    }

    /// Request an abort; the next checkpoint or delay fails.
    pub async fn abort(&self, reason: &str) {
        warn!(reason, "Abort requested");
        *self.abort_reason.write().await = Some(reason.to_string());
    }

    /// Clear a previous abort so the engine can be reused
    pub async fn clear_abort(&self) {
        *self.abort_reason.write().await = None;
    }

    /// Whether an abort is pending
    pub async fn is_aborted(&self) -> bool {
        self.abort_reason.read().await.is_some()
    }

    /// Label of the last checkpoint passed inside a plan
    pub async fn last_checkpoint(&self) -> Option<String> {
        self.last_checkpoint.read().await.clone()
    }
}

// =============================================================================
// ScanContext
// =============================================================================

struct OpenRun {
    run_uid: String,
    descriptor_uid: String,
    seq_num: u32,
    movers: Vec<String>,
    pending: HashMap<String, f64>,
}

/// A run in progress: routes documents to attached subscribers and the
/// engine's broadcast channel.
pub struct ScanContext<'a> {
    engine: &'a RunEngine,
    subscribers: Vec<&'a mut dyn DocumentSubscriber>,
    run: Option<OpenRun>,
}

impl<'a> ScanContext<'a> {
    /// Context with no subscribers
    pub fn new(engine: &'a RunEngine) -> Self {
        Self {
            engine,
            subscribers: Vec::new(),
            run: None,
        }
    }

    /// Attach a subscriber for the lifetime of the context
    pub fn subscribe(&mut self, subscriber: &'a mut dyn DocumentSubscriber) {
        self.subscribers.push(subscriber);
    }

    /// Engine the context runs on
    pub fn engine(&self) -> &'a RunEngine {
        self.engine
    }

    fn emit(&mut self, doc: Document) {
        debug!(kind = doc.kind(), run_uid = %doc.run_uid(), "Emitting document");
        for subscriber in self.subscribers.iter_mut() {
            subscriber.on_document(&doc);
        }
        // No receivers is fine
        let _ = self.engine.doc_sender.send(doc);
    }

    /// Emit Start and Descriptor documents for a run over `movers` and `detector_fields`.
    pub fn open_run(
        &mut self,
        start: StartDoc,
        movers: &[String],
        detector_fields: &[String],
    ) -> AlignResult<String> {
        if self.run.is_some() {
            return Err(AlignError::Configuration(
                "a run is already open in this context".to_string(),
            ));
        }
        let mut start = start;
        start.motors = movers.to_vec();
        let run_uid = start.uid.clone();
        info!(run_uid = %run_uid, plan = %start.plan_type, "Opening run");
        self.emit(Document::Start(start));

        let mut descriptor = DescriptorDoc::new(&run_uid, "primary");
        for mover in movers {
            descriptor = descriptor.with_data_key(mover, DataKey::motor(mover));
        }
        for field in detector_fields {
            let source = field.split('-').next().unwrap_or(field);
            descriptor = descriptor.with_data_key(field, DataKey::detector(source));
        }
        let descriptor_uid = descriptor.uid.clone();
        self.emit(Document::Descriptor(descriptor));

        self.run = Some(OpenRun {
            run_uid: run_uid.clone(),
            descriptor_uid,
            seq_num: 0,
            movers: movers.to_vec(),
            pending: HashMap::new(),
        });
        Ok(run_uid)
    }

    /// Emit one event with explicit data and positions.
    pub fn emit_event(
        &mut self,
        data: HashMap<String, f64>,
        positions: HashMap<String, f64>,
    ) -> AlignResult<()> {
        let run = self.run.as_mut().ok_or_else(|| {
            AlignError::Configuration("emit_event called with no open run".to_string())
        })?;
        run.seq_num += 1;
        let mut event = EventDoc::new(&run.run_uid, &run.descriptor_uid, run.seq_num);
        event.data = data;
        event.positions = positions;
        self.emit(Document::Event(event));
        Ok(())
    }

    /// Emit the Stop document and return the run summary.
    pub fn close_run(&mut self, exit_status: ExitStatus, reason: &str) -> AlignResult<ScanHandle> {
        let run = self.run.take().ok_or_else(|| {
            AlignError::Configuration("close_run called with no open run".to_string())
        })?;
        info!(run_uid = %run.run_uid, %exit_status, num_events = run.seq_num, "Closing run");
        self.emit(Document::Stop(StopDoc::new(
            &run.run_uid,
            exit_status,
            reason,
            run.seq_num,
        )));
        Ok(ScanHandle {
            run_uid: run.run_uid,
            num_events: run.seq_num,
            exit_status,
        })
    }

    /// Close the open run according to how `result` ended and pass `result` on.
    pub fn finish_run<T>(&mut self, result: AlignResult<T>) -> AlignResult<(T, ScanHandle)> {
        match result {
            Ok(value) => {
                let handle = self.close_run(ExitStatus::Success, "")?;
                Ok((value, handle))
            }
            Err(e) => {
                let status = if e.is_abort() {
                    ExitStatus::Abort
                } else {
                    ExitStatus::Fail
                };
                if self.run.is_some() {
                    self.close_run(status, &e.to_string())?;
                }
                Err(e)
            }
        }
    }

    /// Execute a plan as one run.
    #[instrument(skip(self, plan), fields(plan_type = %plan.plan_type(), num_points = plan.num_points()), err)]
    pub async fn execute_plan(&mut self, plan: &mut dyn Plan) -> AlignResult<ScanHandle> {
        let mut start = StartDoc::new(plan.plan_type(), plan.plan_name());
        start.plan_args = plan.plan_args();
        start.detectors = plan.detectors();
        self.open_run(start, &plan.movers(), &[])?;

        let result = self.run_commands(plan).await;
        self.finish_run(result).map(|(_, handle)| handle)
    }

    async fn run_commands(&mut self, plan: &mut dyn Plan) -> AlignResult<()> {
        while let Some(cmd) = plan.next_command() {
            self.process_command(cmd).await?;
        }
        Ok(())
    }

    async fn process_command(&mut self, cmd: PlanCommand) -> AlignResult<()> {
        let engine = self.engine;
        match cmd {
            PlanCommand::MoveTo {
                device_id,
                position,
            } => engine.move_to(&device_id, position, MoveOptions::wait()).await,
            PlanCommand::Read { device_id } => {
                let fields = engine.read_fields(&device_id).await?;
                if let Some(run) = self.run.as_mut() {
                    for (field, value) in fields {
                        run.pending.insert(format!("{device_id}-{field}"), value);
                    }
                }
                Ok(())
            }
            PlanCommand::Wait { seconds } => engine.delay(seconds).await,
            PlanCommand::Checkpoint { label } => {
                *engine.last_checkpoint.write().await = Some(label);
                engine.checkpoint().await
            }
            PlanCommand::EmitEvent { .. } => {
                let (movers, data) = match self.run.as_mut() {
                    Some(run) => (run.movers.clone(), std::mem::take(&mut run.pending)),
                    None => {
                        return Err(AlignError::Configuration(
                            "event emitted outside a run".to_string(),
                        ))
                    }
                };
                let mut positions = HashMap::with_capacity(movers.len());
                for mover in movers {
                    let value = engine.read(&mover).await?;
                    positions.insert(mover, value);
                }
                self.emit_event(data, positions)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::plans::{Count, LineScan};
    use crate::hardware::mock::{SimDetector, SimMotor};
    use tracing_test::traced_test;

    fn engine_with_stage() -> (RunEngine, Arc<SimMotor>) {
        let mut registry = DeviceRegistry::new();
        let motor = Arc::new(SimMotor::new("stage"));
        registry.register_motor("stage", motor.clone()).unwrap();
        registry
            .register_readable(
                "det",
                Arc::new(SimDetector::following(motor.clone(), |x| x * x)),
            )
            .unwrap();
        (RunEngine::new(Arc::new(registry)).with_journal(), motor)
    }

    #[tokio::test]
    async fn test_line_scan_emits_documents() {
        let (engine, motor) = engine_with_stage();
        let mut collector = DocumentCollector::default();
        let mut ctx = ScanContext::new(&engine);
        ctx.subscribe(&mut collector);

        let mut plan = LineScan::new("stage", 0.0, 2.0, 3).with_detector("det");
        let handle = ctx.execute_plan(&mut plan).await.unwrap();
        drop(ctx);

        assert_eq!(handle.num_events, 3);
        assert_eq!(handle.exit_status, ExitStatus::Success);
        assert_eq!(collector.documents.len(), 6);
        assert!(matches!(collector.documents[0], Document::Start(_)));
        assert!(matches!(collector.documents[5], Document::Stop(_)));

        let events = collector.events();
        assert_eq!(events[2].positions["stage"], 2.0);
        assert_eq!(events[2].data["det-value"], 4.0);
        assert_eq!(events[2].seq_num, 3);
        assert_eq!(motor.position().await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_broadcast_receives_documents() {
        let (engine, _) = engine_with_stage();
        let mut rx = engine.subscribe();
        let mut ctx = ScanContext::new(&engine);
        ctx.execute_plan(&mut Count::new(2).with_detector("det"))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(doc) = rx.try_recv() {
            kinds.push(doc.kind());
        }
        assert_eq!(kinds, vec!["start", "descriptor", "event", "event", "stop"]);
    }

    #[tokio::test]
    async fn test_grouped_moves_join_on_wait() {
        let (engine, motor) = engine_with_stage();
        engine
            .move_to("stage", 1.5, MoveOptions::in_group("g"))
            .await
            .unwrap();
        engine.wait("g").await.unwrap();
        assert_eq!(motor.position().await.unwrap(), 1.5);
        assert!(engine.group_done("g").await);

        let msgs = engine.messages().await;
        assert_eq!(
            msgs,
            vec![
                EngineMessage::Set {
                    device: "stage".to_string(),
                    value: 1.5,
                    wait: false,
                    group: Some("g".to_string()),
                },
                EngineMessage::Wait {
                    group: "g".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_grouped_move_surfaces_on_wait() {
        let mut registry = DeviceRegistry::new();
        registry
            .register_motor("m", Arc::new(SimMotor::new("m").with_limits(-1.0, 1.0)))
            .unwrap();
        let engine = RunEngine::new(Arc::new(registry));

        engine
            .move_to("m", 5.0, MoveOptions::in_group("g"))
            .await
            .unwrap();
        let err = engine.wait("g").await.unwrap_err();
        assert!(matches!(err, AlignError::Device(_)));
    }

    #[tokio::test]
    async fn test_check_group_reports_finished_failure() {
        let mut registry = DeviceRegistry::new();
        registry
            .register_motor("m", Arc::new(SimMotor::new("m").with_limits(-1.0, 1.0)))
            .unwrap();
        let engine = RunEngine::new(Arc::new(registry));

        engine
            .move_to("m", 5.0, MoveOptions::in_group("g"))
            .await
            .unwrap();
        assert!(matches!(engine.check_group("g").await, Err(AlignError::Device(_))));
        // The failed move is no longer tracked
        assert!(engine.check_group("g").await.is_ok());
        assert!(engine.wait("g").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_move_in_progress() {
        let motor = Arc::new(SimMotor::new("m").with_velocity(1.0, 1.0).with_timed_motion());
        let mut registry = DeviceRegistry::new();
        registry.register_motor("m", motor.clone()).unwrap();
        let engine = RunEngine::new(Arc::new(registry));

        engine
            .move_to("m", 2.0, MoveOptions::in_group("g"))
            .await
            .unwrap();
        sleep(Duration::from_millis(505)).await;
        assert!(engine.check_group("g").await.is_ok());
        assert!(!engine.group_done("g").await);

        engine.cancel("g").await.unwrap();
        assert!(engine.group_done("g").await);
        let stopped = motor.position().await.unwrap();
        sleep(Duration::from_secs(3)).await;
        assert_eq!(motor.position().await.unwrap(), stopped);
        assert!(stopped < 1.0);
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let (engine, _) = engine_with_stage();
        let err = engine.read("nope").await.unwrap_err();
        assert!(matches!(
            err,
            AlignError::DeviceNotFound {
                capability: "readable",
                ..
            }
        ));
        assert!(engine.move_to("det", 1.0, MoveOptions::wait()).await.is_err());
    }

    #[tokio::test]
    async fn test_move_rel() {
        let (engine, motor) = engine_with_stage();
        motor.move_abs(1.0).await.unwrap();
        engine.move_rel("stage", -0.25, MoveOptions::wait()).await.unwrap();
        assert_eq!(motor.position().await.unwrap(), 0.75);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_interrupted_by_abort() {
        let (engine, _) = engine_with_stage();
        let engine = Arc::new(engine);
        let aborter = engine.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            aborter.abort("operator").await;
        });

        let started = tokio::time::Instant::now();
        let err = engine.delay(10.0).await.unwrap_err();
        assert!(err.is_abort());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_abort_ends_run_with_abort_status() {
        let (engine, _) = engine_with_stage();
        engine.abort("stop now").await;

        let mut collector = DocumentCollector::default();
        let mut ctx = ScanContext::new(&engine);
        ctx.subscribe(&mut collector);
        let err = ctx
            .execute_plan(&mut LineScan::new("stage", 0.0, 1.0, 5).with_detector("det"))
            .await
            .unwrap_err();
        drop(ctx);

        assert!(err.is_abort());
        match collector.documents.last() {
            Some(Document::Stop(stop)) => {
                assert_eq!(stop.exit_status, ExitStatus::Abort);
                assert_eq!(stop.num_events, 0);
            }
            other => panic!("expected stop document, got {other:?}"),
        }

        assert!(logs_contain("Abort requested"));
        engine.clear_abort().await;
        assert!(engine.checkpoint().await.is_ok());
    }
}

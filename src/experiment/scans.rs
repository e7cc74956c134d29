//! Scans consumed by fit-and-move.
//!
//! A [`Scan`] drives one motor and reads one detector inside a
//! [`ScanContext`], emitting a single run. Two flavours:
//!
//! - [`StepScan`]: discrete points, move-then-read at each
//! - [`FastScan`]: continuous sweep from start to end, sampling the detector
//!   and motor readback while the motor is moving (software fly scan)

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

use super::document::StartDoc;
use super::plans::LineScan;
use super::run_engine::{MoveOptions, ScanContext, ScanHandle};
use crate::error::{AlignError, AlignResult};
use crate::hardware::capabilities::MotionLimits;

/// Detector and motor a scan works on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    /// Detector device name
    pub detector: String,
    /// Motor device name
    pub motor: String,
}

impl ScanTarget {
    /// Target pairing `detector` with `motor`
    pub fn new(detector: impl Into<String>, motor: impl Into<String>) -> Self {
        Self {
            detector: detector.into(),
            motor: motor.into(),
        }
    }
}

/// Anything that can sweep a motor while reading a detector.
#[async_trait]
pub trait Scan: Send + Sync {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Execute the scan as one run in `ctx`.
    async fn run(&self, ctx: &mut ScanContext<'_>, target: &ScanTarget) -> AlignResult<ScanHandle>;
}

/// Step scan over `num` evenly spaced points from `start` to `end`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepScan {
    /// First position
    pub start: f64,
    /// Last position
    pub end: f64,
    /// Number of points, both ends included
    pub num: usize,
}

impl StepScan {
    /// New step scan
    pub fn new(start: f64, end: f64, num: usize) -> Self {
        Self { start, end, num }
    }
}

#[async_trait]
impl Scan for StepScan {
    fn describe(&self) -> String {
        format!("step scan {} -> {} ({} points)", self.start, self.end, self.num)
    }

    async fn run(&self, ctx: &mut ScanContext<'_>, target: &ScanTarget) -> AlignResult<ScanHandle> {
        if self.num == 0 {
            return Err(AlignError::Configuration(
                "step scan needs at least one point".to_string(),
            ));
        }
        let mut plan = LineScan::new(&target.motor, self.start, self.end, self.num)
            .with_detector(&target.detector);
        ctx.execute_plan(&mut plan).await
    }
}

/// Software fly scan: the motor sweeps from `start` to `end` at
/// `motor_speed` while the detector is sampled every `sample_interval`.
///
/// The motor's velocity is cached before the sweep and always restored
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FastScan {
    /// Sweep start
    pub start: f64,
    /// Sweep end
    pub end: f64,
    /// Sweep velocity; `None` keeps the motor's current velocity
    pub motor_speed: Option<f64>,
    /// Seconds between samples
    pub sample_interval: f64,
}

impl FastScan {
    /// Default seconds between samples
    pub const DEFAULT_SAMPLE_INTERVAL: f64 = 0.02;

    /// New fast scan with the default sample interval
    pub fn new(start: f64, end: f64, motor_speed: Option<f64>) -> Self {
        Self {
            start,
            end,
            motor_speed,
            sample_interval: Self::DEFAULT_SAMPLE_INTERVAL,
        }
    }

    /// Override the sample interval
    pub fn with_sample_interval(mut self, seconds: f64) -> Self {
        self.sample_interval = seconds;
        self
    }

    async fn sample(ctx: &mut ScanContext<'_>, target: &ScanTarget) -> AlignResult<()> {
        let engine = ctx.engine();
        let data: HashMap<String, f64> = engine
            .read_fields(&target.detector)
            .await?
            .into_iter()
            .map(|(field, value)| (format!("{}-{}", target.detector, field), value))
            .collect();
        let position = engine.read(&target.motor).await?;
        ctx.emit_event(data, HashMap::from([(target.motor.clone(), position)]))
    }

    async fn sweep(&self, ctx: &mut ScanContext<'_>, target: &ScanTarget) -> AlignResult<()> {
        let engine = ctx.engine();
        let group = format!("fast_scan_{}", target.motor);
        engine
            .move_to(&target.motor, self.end, MoveOptions::in_group(group.as_str()))
            .await?;

        match self.sample_while_moving(ctx, target, &group).await {
            Ok(()) => engine.wait(&group).await,
            Err(e) => {
                if let Err(stop_err) = engine.cancel(&group).await {
                    warn!(motor = %target.motor, error = %stop_err, "Could not stop sweep");
                }
                Err(e)
            }
        }
    }

    async fn sample_while_moving(
        &self,
        ctx: &mut ScanContext<'_>,
        target: &ScanTarget,
        group: &str,
    ) -> AlignResult<()> {
        let engine = ctx.engine();
        loop {
            let finished = engine.group_done(group).await;
            Self::sample(ctx, target).await?;
            if finished {
                return Ok(());
            }
            engine.checkpoint().await?;
            engine.delay(self.sample_interval).await?;
        }
    }

    async fn timed_run(
        &self,
        ctx: &mut ScanContext<'_>,
        target: &ScanTarget,
        limits: &dyn MotionLimits,
    ) -> AlignResult<ScanHandle> {
        if let Some(speed) = self.motor_speed {
            debug!(motor = %target.motor, speed, "Setting sweep velocity");
            limits.set_velocity(speed).await?;
        }
        let mut start = StartDoc::new("fast_scan", "Fast Scan")
            .with_arg("start", &self.start.to_string())
            .with_arg("end", &self.end.to_string());
        start.detectors = vec![target.detector.clone()];
        ctx.open_run(start, &[target.motor.clone()], &[])?;
        let swept = self.sweep(ctx, target).await;
        ctx.finish_run(swept).map(|(_, handle)| handle)
    }
}

#[async_trait]
impl Scan for FastScan {
    fn describe(&self) -> String {
        match self.motor_speed {
            Some(speed) => format!("fast scan {} -> {} at {}", self.start, self.end, speed),
            None => format!("fast scan {} -> {}", self.start, self.end),
        }
    }

    #[instrument(skip(self, ctx), fields(scan = %self.describe()), err)]
    async fn run(&self, ctx: &mut ScanContext<'_>, target: &ScanTarget) -> AlignResult<ScanHandle> {
        if self.sample_interval <= 0.0 {
            return Err(AlignError::Configuration(format!(
                "sample interval must be positive, got {}",
                self.sample_interval
            )));
        }
        let engine = ctx.engine();
        let limits = engine.limits(&target.motor)?;
        let cached_velocity = limits.velocity().await?;

        if let Some(speed) = self.motor_speed {
            let max_velocity = limits.max_velocity().await?;
            if speed <= 0.0 || speed > max_velocity {
                return Err(AlignError::Configuration(format!(
                    "{} speed {} outside (0, {}]",
                    target.motor, speed, max_velocity
                )));
            }
        }

        // Reach the start at the normal velocity before anything is recorded
        engine
            .move_to(&target.motor, self.start, MoveOptions::wait())
            .await?;

        let result = self.timed_run(ctx, target, limits.as_ref()).await;

        let restored = limits.set_velocity(cached_velocity).await;
        match (result, restored) {
            (Ok(handle), Ok(())) => {
                info!(motor = %target.motor, events = handle.num_events, "Fast scan complete");
                Ok(handle)
            }
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), restored) => {
                if let Err(restore_err) = restored {
                    warn!(motor = %target.motor, error = %restore_err, "Velocity restore failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::run_engine::{DocumentCollector, RunEngine};
    use crate::hardware::capabilities::Movable;
    use crate::hardware::mock::{SimDetector, SimMotor};
    use crate::hardware::registry::DeviceRegistry;
    use std::sync::Arc;

    fn setup(motor: SimMotor) -> (RunEngine, Arc<SimMotor>) {
        let motor = Arc::new(motor);
        let mut registry = DeviceRegistry::new();
        registry.register_motor("m", motor.clone()).unwrap();
        registry
            .register_readable("det", Arc::new(SimDetector::following(motor.clone(), |x| x + 1.0)))
            .unwrap();
        (RunEngine::new(Arc::new(registry)), motor)
    }

    #[tokio::test]
    async fn test_step_scan_runs_line_scan() {
        let (engine, motor) = setup(SimMotor::new("m"));
        let mut collector = DocumentCollector::default();
        let mut ctx = ScanContext::new(&engine);
        ctx.subscribe(&mut collector);

        let handle = StepScan::new(1.0, 2.0, 5)
            .run(&mut ctx, &ScanTarget::new("det", "m"))
            .await
            .unwrap();
        drop(ctx);

        assert_eq!(handle.num_events, 5);
        assert_eq!(collector.events()[4].data["det-value"], 3.0);
        assert_eq!(motor.position().await.unwrap(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_scan_samples_while_moving_and_restores_velocity() {
        let (engine, motor) = setup(
            SimMotor::new("m")
                .with_velocity(1.0, 5.0)
                .with_timed_motion(),
        );
        let mut collector = DocumentCollector::default();
        let mut ctx = ScanContext::new(&engine);
        ctx.subscribe(&mut collector);

        let handle = FastScan::new(0.0, 1.0, Some(2.0))
            .run(&mut ctx, &ScanTarget::new("det", "m"))
            .await
            .unwrap();
        drop(ctx);

        // 0.5 s sweep sampled every 20 ms
        assert!(handle.num_events > 5, "only {} events", handle.num_events);
        let events = collector.events();
        let last = events.last().unwrap();
        assert!((last.positions["m"] - 1.0).abs() < 1e-9);
        assert!(events
            .iter()
            .any(|e| e.positions["m"] > 0.0 && e.positions["m"] < 1.0));
        assert_eq!(motor.velocity().await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_fast_scan_rejects_speed_above_max() {
        let (engine, motor) = setup(SimMotor::new("m").with_velocity(1.0, 2.0));
        let mut ctx = ScanContext::new(&engine);
        let err = FastScan::new(0.5, 1.0, Some(3.0))
            .run(&mut ctx, &ScanTarget::new("det", "m"))
            .await
            .unwrap_err();
        assert!(matches!(err, AlignError::Configuration(_)));
        assert_eq!(motor.move_count().await, 0);
    }

    #[tokio::test]
    async fn test_fast_scan_restores_velocity_on_failure() {
        let (engine, motor) = setup(
            SimMotor::new("m")
                .with_limits(-1.0, 1.0)
                .with_velocity(1.0, 5.0),
        );
        let mut ctx = ScanContext::new(&engine);
        let err = FastScan::new(0.0, 3.0, Some(4.0))
            .run(&mut ctx, &ScanTarget::new("det", "m"))
            .await
            .unwrap_err();
        assert!(matches!(err, AlignError::Device(_)));
        assert_eq!(motor.velocity().await.unwrap(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_scan_abort_stops_sweep() {
        let (engine, motor) = setup(
            SimMotor::new("m")
                .with_velocity(1.0, 5.0)
                .with_timed_motion(),
        );
        let engine = Arc::new(engine);
        let aborter = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tokio::time::Duration::from_millis(250)).await;
            aborter.abort("operator").await;
        });

        let mut ctx = ScanContext::new(&engine);
        let err = FastScan::new(0.0, 2.0, None)
            .run(&mut ctx, &ScanTarget::new("det", "m"))
            .await
            .unwrap_err();
        drop(ctx);
        assert!(err.is_abort());
        assert!(engine.group_done("fast_scan_m").await);

        let stopped = motor.position().await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
        assert_eq!(motor.position().await.unwrap(), stopped);
        assert!(stopped < 1.0, "stopped at {stopped}");
    }
}

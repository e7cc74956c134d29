//! Simulated Beamline Devices
//!
//! Devices for tests and the `simulate-centring` command, no hardware needed.
//! All simulated devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Simulations
//!
//! - `SimMotor` - motor record with limits, velocity and optional timed motion
//! - `SimDetector` - scalar channel computed from the positions of other motors
//! - `SimLaggingController` / `SimLaggingReadback` - setpoint whose readback trails behind
//! - `SimulatedDiffractometer` - a full sample stage, detector arm and focusing mirror
//!
//! The curve helpers [`gaussian`] and [`step_function`] build detector responses.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};

use crate::hardware::capabilities::{MotionLimits, Movable, Readable, DEFAULT_FIELD};
use crate::hardware::registry::DeviceRegistry;
use crate::procedures::centring::CentringDevices;

/// Tick between position updates of a timed move.
const MOTION_TICK: Duration = Duration::from_millis(10);

/// Gaussian with unit peak height.
pub fn gaussian(x: f64, centre: f64, sigma: f64) -> f64 {
    (-(x - centre).powi(2) / (2.0 * sigma * sigma)).exp()
}

/// Returns `low` below `centre`, `high` at or above it.
pub fn step_function(x: f64, centre: f64, low: f64, high: f64) -> f64 {
    if x < centre {
        low
    } else {
        high
    }
}

// =============================================================================
// SimMotor
// =============================================================================

/// Simulated motor record.
///
/// Moves complete instantly unless timed motion is enabled, in which case the
/// position ramps at the configured velocity and can be sampled mid-move.
/// A new target or a stop request ends any ramp in progress.
///
/// # Example
///
/// ```rust,ignore
/// let motor = SimMotor::new("sample_stage_y").with_limits(-5.0, 5.0);
/// motor.move_abs(1.0).await?;
/// assert_eq!(motor.position().await?, 1.0);
/// ```
pub struct SimMotor {
    name: String,
    position: RwLock<f64>,
    velocity: RwLock<f64>,
    max_velocity: f64,
    low_limit: f64,
    high_limit: f64,
    timed_motion: bool,
    /// Bumped by every move and stop; a ramp only runs while it owns the latest value
    generation: AtomicU64,
    history: Mutex<Vec<f64>>,
}

impl SimMotor {
    /// Motor at 0.0 with velocity 1.0, max velocity 10.0 and limits of ±1000.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: RwLock::new(0.0),
            velocity: RwLock::new(1.0),
            max_velocity: 10.0,
            low_limit: -1000.0,
            high_limit: 1000.0,
            timed_motion: false,
            generation: AtomicU64::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Start at the given position
    pub fn with_position(mut self, position: f64) -> Self {
        self.position = RwLock::new(position);
        self
    }

    /// Set soft limits
    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.low_limit = low;
        self.high_limit = high;
        self
    }

    /// Set current and maximum velocity
    pub fn with_velocity(mut self, velocity: f64, max_velocity: f64) -> Self {
        self.velocity = RwLock::new(velocity);
        self.max_velocity = max_velocity;
        self
    }

    /// Ramp position over time at the current velocity instead of jumping.
    pub fn with_timed_motion(mut self) -> Self {
        self.timed_motion = true;
        self
    }

    /// Motor name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every target passed to `move_abs`, in order.
    pub async fn move_history(&self) -> Vec<f64> {
        self.history.lock().await.clone()
    }

    /// Number of moves commanded so far
    pub async fn move_count(&self) -> usize {
        self.history.lock().await.len()
    }

    async fn ramp_to(&self, target: f64, generation: u64) -> Result<()> {
        let start = *self.position.read().await;
        let velocity = *self.velocity.read().await;
        if velocity <= 0.0 {
            bail!("{}: velocity must be positive, got {}", self.name, velocity);
        }
        let total = (target - start).abs() / velocity;
        let ticks = (total / MOTION_TICK.as_secs_f64()).ceil().max(1.0) as usize;

        for tick in 1..=ticks {
            sleep(MOTION_TICK).await;
            if self.generation.load(Ordering::SeqCst) != generation {
                tracing::debug!(motor = %self.name, target, "Motion superseded");
                return Ok(());
            }
            let fraction = tick as f64 / ticks as f64;
            *self.position.write().await = start + (target - start) * fraction;
        }
        Ok(())
    }
}

#[async_trait]
impl Movable for SimMotor {
    async fn move_abs(&self, target: f64) -> Result<()> {
        if !target.is_finite() {
            bail!("{}: cannot move to non-finite position {}", self.name, target);
        }
        if target < self.low_limit || target > self.high_limit {
            bail!(
                "{}: target {} outside limits [{}, {}]",
                self.name,
                target,
                self.low_limit,
                self.high_limit
            );
        }
        self.history.lock().await.push(target);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if self.timed_motion {
            self.ramp_to(target, generation).await
        } else {
            *self.position.write().await = target;
            Ok(())
        }
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.read().await)
    }

    async fn stop(&self) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Readable for SimMotor {
    async fn read(&self) -> Result<f64> {
        self.position().await
    }
}

#[async_trait]
impl MotionLimits for SimMotor {
    async fn low_limit(&self) -> Result<f64> {
        Ok(self.low_limit)
    }

    async fn high_limit(&self) -> Result<f64> {
        Ok(self.high_limit)
    }

    async fn velocity(&self) -> Result<f64> {
        Ok(*self.velocity.read().await)
    }

    async fn max_velocity(&self) -> Result<f64> {
        Ok(self.max_velocity)
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        if velocity <= 0.0 || velocity > self.max_velocity {
            bail!(
                "{}: velocity {} outside (0, {}]",
                self.name,
                velocity,
                self.max_velocity
            );
        }
        *self.velocity.write().await = velocity;
        Ok(())
    }
}

// =============================================================================
// SimDetector
// =============================================================================

type Response = Box<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// Scalar detector whose reading is a function of motor positions.
///
/// The response receives the positions of `inputs` in the order given.
pub struct SimDetector {
    inputs: Vec<Arc<SimMotor>>,
    response: Response,
    reads: AtomicUsize,
}

impl SimDetector {
    /// Detector computed from the positions of `inputs`.
    pub fn new<F>(inputs: Vec<Arc<SimMotor>>, response: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Self {
            inputs,
            response: Box::new(response),
            reads: AtomicUsize::new(0),
        }
    }

    /// Detector that always reads `value`.
    pub fn constant(value: f64) -> Self {
        Self::new(Vec::new(), move |_| value)
    }

    /// Detector following a single motor.
    pub fn following<F>(motor: Arc<SimMotor>, response: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        Self::new(vec![motor], move |p| response(p[0]))
    }

    /// Number of reads served
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Readable for SimDetector {
    async fn read(&self) -> Result<f64> {
        let mut positions = Vec::with_capacity(self.inputs.len());
        for motor in &self.inputs {
            positions.push(motor.position().await?);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok((self.response)(&positions))
    }
}

// =============================================================================
// SimLaggingController
// =============================================================================

#[derive(Debug)]
struct LagState {
    setpoint: f64,
    readback: f64,
    reads: usize,
    set_calls: Vec<f64>,
}

/// Setpoint half of a controller whose readback lags behind.
///
/// Setting is instant. Every readback read returns the current value and
/// then steps it towards the setpoint by at most `step`, so a readback
/// starting at 0.0 with step 1.0 reads 0, 1, 2, ... until it reaches the
/// setpoint.
#[derive(Clone)]
pub struct SimLaggingController {
    state: Arc<Mutex<LagState>>,
    step: f64,
}

/// Readback half of a [`SimLaggingController`].
pub struct SimLaggingReadback {
    state: Arc<Mutex<LagState>>,
    step: f64,
}

impl SimLaggingController {
    /// Controller with readback and setpoint at `initial`.
    pub fn new(initial: f64, step: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(LagState {
                setpoint: initial,
                readback: initial,
                reads: 0,
                set_calls: Vec::new(),
            })),
            step: step.abs(),
        }
    }

    /// Readback channel sharing this controller's state.
    pub fn readback(&self) -> SimLaggingReadback {
        SimLaggingReadback {
            state: self.state.clone(),
            step: self.step,
        }
    }

    /// Number of readback reads so far
    pub async fn read_count(&self) -> usize {
        self.state.lock().await.reads
    }

    /// Every setpoint written, in order
    pub async fn set_calls(&self) -> Vec<f64> {
        self.state.lock().await.set_calls.clone()
    }
}

#[async_trait]
impl Movable for SimLaggingController {
    async fn move_abs(&self, position: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.setpoint = position;
        state.set_calls.push(position);
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.state.lock().await.setpoint)
    }

    /// Setting is instant, so there is never motion to stop.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Readable for SimLaggingController {
    async fn read(&self) -> Result<f64> {
        self.position().await
    }
}

#[async_trait]
impl Readable for SimLaggingReadback {
    async fn read(&self) -> Result<f64> {
        let mut state = self.state.lock().await;
        state.reads += 1;
        let current = state.readback;
        let diff = state.setpoint - current;
        state.readback = if diff.abs() <= self.step {
            state.setpoint
        } else {
            current + self.step * diff.signum()
        };
        Ok(current)
    }
}

// =============================================================================
// SimulatedDiffractometer
// =============================================================================

/// Geometry of the simulated pin/beam scene.
#[derive(Debug, Clone, Copy)]
pub struct DiffractometerScene {
    /// Pin edge height seen at rotation 0°
    pub edge_at_0: f64,
    /// Pin edge height seen at rotation 180°
    pub edge_at_180: f64,
    /// Pin edge shift per unit of mirror height
    pub mirror_height_gain: f64,
    /// Mirror pitch giving the deepest dip
    pub pitch_centre: f64,
    /// Two-theta of the direct beam
    pub tth_centre: f64,
    /// Alpha of the direct beam
    pub alpha_centre: f64,
}

impl Default for DiffractometerScene {
    fn default() -> Self {
        Self {
            edge_at_0: 0.95,
            edge_at_180: 1.08,
            mirror_height_gain: -60.0,
            pitch_centre: 1.7,
            tth_centre: 0.1,
            alpha_centre: -0.05,
        }
    }
}

/// Simulated diffractometer with its focusing mirror, registered under
/// caller-supplied device names.
pub struct SimulatedDiffractometer {
    /// Sample stage x
    pub sample_x: Arc<SimMotor>,
    /// Sample stage y (vertical)
    pub sample_y: Arc<SimMotor>,
    /// Sample stage z
    pub sample_z: Arc<SimMotor>,
    /// Sample rotation (theta)
    pub rotation: Arc<SimMotor>,
    /// Detector arm two-theta
    pub two_theta: Arc<SimMotor>,
    /// Detector arm alpha
    pub alpha: Arc<SimMotor>,
    /// Mirror fine pitch
    pub mirror_pitch: Arc<SimMotor>,
    /// Mirror height
    pub mirror_height: Arc<SimMotor>,
    /// Direct-beam detector
    pub detector: Arc<SimDetector>,
}

impl SimulatedDiffractometer {
    /// Build the scene and register every device under the names in `devices`.
    ///
    /// The detector only publishes [`DEFAULT_FIELD`], so any other
    /// `detector_field` is rejected.
    pub fn build(
        scene: DiffractometerScene,
        devices: &CentringDevices,
        registry: &mut DeviceRegistry,
    ) -> Result<Self> {
        if devices.detector_field != DEFAULT_FIELD {
            bail!(
                "simulated detector {} has no field {:?}, only {:?}",
                devices.detector,
                devices.detector_field,
                DEFAULT_FIELD
            );
        }
        let motor = |name: &str| Arc::new(SimMotor::new(name));
        let sample_x = motor(&devices.sample_x);
        let sample_y = motor(&devices.sample_y);
        let sample_z = motor(&devices.sample_z);
        let rotation = Arc::new(SimMotor::new(&devices.rotation).with_limits(-360.0, 360.0));
        let two_theta = motor(&devices.two_theta);
        let alpha = motor(&devices.alpha);
        let mirror_pitch = Arc::new(SimMotor::new(&devices.mirror_pitch).with_position(1.6));
        let mirror_height = motor(&devices.mirror_height);

        let detector = Arc::new(SimDetector::new(
            vec![
                sample_y.clone(),
                rotation.clone(),
                two_theta.clone(),
                alpha.clone(),
                mirror_pitch.clone(),
                mirror_height.clone(),
            ],
            move |p| {
                let (y, th, tth, alpha, pitch, height) = (p[0], p[1], p[2], p[3], p[4], p[5]);
                let base = if (th - 180.0).abs() < 90.0 {
                    scene.edge_at_180
                } else {
                    scene.edge_at_0
                };
                let edge = base + scene.mirror_height_gain * height;
                step_function(y, edge, 0.1, 1.0)
                    + 10.0 * gaussian(tth, scene.tth_centre, 0.2)
                    + 10.0 * gaussian(alpha, scene.alpha_centre, 0.2)
                    - 0.5 * gaussian(pitch, scene.pitch_centre, 0.05)
            },
        ));

        for m in [
            &sample_x,
            &sample_y,
            &sample_z,
            &rotation,
            &two_theta,
            &alpha,
            &mirror_pitch,
            &mirror_height,
        ] {
            registry.register_motor(m.name().to_string(), m.clone())?;
        }
        registry
            .register_readable(devices.detector.clone(), detector.clone())
            .map_err(|e| anyhow!("registering detector: {e}"))?;

        Ok(Self {
            sample_x,
            sample_y,
            sample_z,
            rotation,
            two_theta,
            alpha,
            mirror_pitch,
            mirror_height,
            detector,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_motor_rejects_out_of_limits() {
        let motor = SimMotor::new("m").with_limits(-1.0, 1.0);
        assert!(motor.move_abs(2.0).await.is_err());
        motor.move_abs(0.5).await.unwrap();
        assert_eq!(motor.position().await.unwrap(), 0.5);
        assert_eq!(motor.move_history().await, vec![0.5]);
    }

    #[tokio::test]
    async fn test_velocity_capped_by_max() {
        let motor = SimMotor::new("m").with_velocity(1.0, 2.0);
        assert!(motor.set_velocity(3.0).await.is_err());
        motor.set_velocity(2.0).await.unwrap();
        assert_eq!(motor.velocity().await.unwrap(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_motion_ramps() {
        let motor = Arc::new(SimMotor::new("m").with_velocity(1.0, 1.0).with_timed_motion());
        let mover = motor.clone();
        let task = tokio::spawn(async move { mover.move_abs(1.0).await });

        sleep(Duration::from_millis(505)).await;
        let mid = motor.position().await.unwrap();
        assert!(mid > 0.0 && mid < 1.0, "mid-move position {mid}");

        task.await.unwrap().unwrap();
        assert!((motor.position().await.unwrap() - 1.0).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_target_replaces_ramp_in_progress() {
        let motor = Arc::new(SimMotor::new("m").with_velocity(1.0, 1.0).with_timed_motion());
        let mover = motor.clone();
        let first = tokio::spawn(async move { mover.move_abs(2.0).await });

        sleep(Duration::from_millis(505)).await;
        let mid = motor.position().await.unwrap();
        motor.move_abs(mid).await.unwrap();
        first.await.unwrap().unwrap();

        sleep(Duration::from_secs(3)).await;
        assert_eq!(motor.position().await.unwrap(), mid);
        assert_eq!(motor.move_history().await, vec![2.0, mid]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_ramp() {
        let motor = Arc::new(SimMotor::new("m").with_velocity(1.0, 1.0).with_timed_motion());
        let mover = motor.clone();
        let task = tokio::spawn(async move { mover.move_abs(2.0).await });

        sleep(Duration::from_millis(305)).await;
        motor.stop().await.unwrap();
        task.await.unwrap().unwrap();

        let stopped = motor.position().await.unwrap();
        assert!(stopped > 0.2 && stopped < 0.4, "stopped at {stopped}");
        sleep(Duration::from_secs(3)).await;
        assert_eq!(motor.position().await.unwrap(), stopped);
    }

    #[tokio::test]
    async fn test_lagging_readback_steps_towards_setpoint() {
        let controller = SimLaggingController::new(0.0, 1.0);
        let readback = controller.readback();
        controller.move_abs(2.5).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(readback.read().await.unwrap());
        }
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 2.5, 2.5]);
        assert_eq!(controller.read_count().await, 5);
    }

    #[tokio::test]
    async fn test_detector_follows_motor() {
        let motor = Arc::new(SimMotor::new("m"));
        let det = SimDetector::following(motor.clone(), |x| 2.0 * x);
        motor.move_abs(3.0).await.unwrap();
        assert_eq!(det.read().await.unwrap(), 6.0);
        assert_eq!(det.read_count(), 1);
    }

    #[test]
    fn test_curve_helpers() {
        assert_eq!(gaussian(1.7, 1.7, 0.1), 1.0);
        assert!(gaussian(2.7, 1.7, 0.1) < 1e-10);
        assert_eq!(step_function(-2.2, -2.1, 0.1, 1.0), 0.1);
        assert_eq!(step_function(-2.1, -2.1, 0.1, 1.0), 1.0);
    }
}

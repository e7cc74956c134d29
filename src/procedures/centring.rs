//! Beam-on-rotation-centre alignment for a diffractometer.
//!
//! The procedure puts the pin at the rotation centre, centres the detector
//! arm on the direct beam, then finds the pin edge at 0° and 180° of sample
//! rotation. If the two edge heights disagree, the focusing mirror height is
//! nudged proportionally to the disagreement and the 180° measurement is
//! repeated until they agree within tolerance or the iteration cap is hit.
//!
//! ```text
//! Home ─▶ Angle-Setup ─▶ Capture@0° ─▶ Capture@180° ─▶ Converge ─▶ Done
//!                                            ▲              │
//!                                            └──correct─────┤
//!                                                           └─▶ Failed (cap)
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::alignment::{step_scan_and_move_fit, FitTarget, StatPosition};
use super::settle::ConvergenceState;
use crate::error::{AlignError, AlignResult};
use crate::experiment::run_engine::{MoveOptions, RunEngine};
use crate::hardware::capabilities::DEFAULT_FIELD;

/// Group used by [`move_pin_origin`] when waiting without a caller group.
pub const PIN_ORIGIN_GROUP: &str = "move_pin_origin";

/// Registry names of every device the procedure touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentringDevices {
    /// Direct-beam detector
    pub detector: String,
    /// Detector field fitted on
    pub detector_field: String,
    /// Sample stage x
    pub sample_x: String,
    /// Sample stage y (vertical, moves the pin through the beam)
    pub sample_y: String,
    /// Sample stage z
    pub sample_z: String,
    /// Sample rotation (theta)
    pub rotation: String,
    /// Detector arm two-theta
    pub two_theta: String,
    /// Detector arm alpha
    pub alpha: String,
    /// Focusing mirror fine pitch
    pub mirror_pitch: String,
    /// Focusing mirror height
    pub mirror_height: String,
}

impl Default for CentringDevices {
    fn default() -> Self {
        Self {
            detector: "direct_beam_det".to_string(),
            detector_field: DEFAULT_FIELD.to_string(),
            sample_x: "sample_stage_x".to_string(),
            sample_y: "sample_stage_y".to_string(),
            sample_z: "sample_stage_z".to_string(),
            rotation: "diffractometer_th".to_string(),
            two_theta: "diffractometer_tth".to_string(),
            alpha: "diffractometer_alpha".to_string(),
            mirror_pitch: "mirror_fine_pitch".to_string(),
            mirror_height: "mirror_y".to_string(),
        }
    }
}

impl CentringDevices {
    fn fit(&self, motor: &str, loc: StatPosition) -> FitTarget {
        FitTarget::new(self.detector.as_str(), motor, loc).with_suffix(self.detector_field.as_str())
    }

    /// Every device name, detector first
    pub fn names(&self) -> [&str; 9] {
        [
            &self.detector,
            &self.sample_x,
            &self.sample_y,
            &self.sample_z,
            &self.rotation,
            &self.two_theta,
            &self.alpha,
            &self.mirror_pitch,
            &self.mirror_height,
        ]
    }
}

/// Sweep widths and point counts of the pin-locate scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinScanConfig {
    /// Full fine-pitch range swept around the current pitch
    pub mirror_coverage: f64,
    /// Points in the mirror sweep
    pub mirror_num: usize,
    /// Full stage-y range swept around the half cut, in mm
    pub sy_coverage: f64,
    /// Points in the stage-y sweep
    pub sy_num: usize,
}

impl Default for PinScanConfig {
    fn default() -> Self {
        Self {
            mirror_coverage: 0.668,
            mirror_num: 51,
            sy_coverage: 0.3,
            sy_num: 51,
        }
    }
}

/// A plain step scan range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngleScan {
    /// First position
    pub start: f64,
    /// Last position
    pub end: f64,
    /// Number of points
    pub num: usize,
}

fn default_tth_scan() -> AngleScan {
    AngleScan {
        start: -1.0,
        end: 1.0,
        num: 21,
    }
}

fn default_alpha_scan() -> AngleScan {
    AngleScan {
        start: -0.8,
        end: 0.8,
        num: 21,
    }
}

/// Tuning of [`beam_on_centre_diffractometer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentringConfig {
    /// Mirror height correction per mm of 0°/180° disagreement
    pub mirror_height_adjust: f64,
    /// Accepted `|middle - y180|`, in mm
    pub mirror_diff_acceptance: f64,
    /// Stage y at which the pin is clear of the beam
    pub pin_clear_beam_position: f64,
    /// Stage y giving a half cut of the beam at 0°
    pub pin_half_cut: f64,
    /// Corrections allowed before giving up
    pub max_iterations: u32,
    /// Rotation used for the first capture and restored at the end
    pub rotation_home: f64,
    /// Rotation used for the opposite capture
    pub rotation_flipped: f64,
    /// Pin-locate scan settings
    pub pin_scan: PinScanConfig,
    /// Two-theta centring range
    pub tth_scan: AngleScan,
    /// Alpha centring range
    pub alpha_scan: AngleScan,
}

impl Default for CentringConfig {
    fn default() -> Self {
        Self {
            mirror_height_adjust: 0.01,
            mirror_diff_acceptance: 0.08,
            pin_clear_beam_position: -2.0,
            pin_half_cut: 1.0,
            max_iterations: 5,
            rotation_home: 0.0,
            rotation_flipped: 180.0,
            pin_scan: PinScanConfig::default(),
            tth_scan: default_tth_scan(),
            alpha_scan: default_alpha_scan(),
        }
    }
}

impl CentringConfig {
    /// Reject values the procedure cannot run with.
    pub fn validate(&self) -> AlignResult<()> {
        let finite = [
            ("mirror_height_adjust", self.mirror_height_adjust),
            ("mirror_diff_acceptance", self.mirror_diff_acceptance),
            ("pin_clear_beam_position", self.pin_clear_beam_position),
            ("pin_half_cut", self.pin_half_cut),
            ("rotation_home", self.rotation_home),
            ("rotation_flipped", self.rotation_flipped),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(AlignError::Configuration(format!("{name} must be finite")));
            }
        }
        if self.mirror_diff_acceptance < 0.0 {
            return Err(AlignError::Configuration(
                "mirror_diff_acceptance must not be negative".to_string(),
            ));
        }
        if self.pin_scan.mirror_coverage <= 0.0 || self.pin_scan.sy_coverage <= 0.0 {
            return Err(AlignError::Configuration(
                "pin scan coverage must be positive".to_string(),
            ));
        }
        let nums = [
            ("pin_scan.mirror_num", self.pin_scan.mirror_num),
            ("pin_scan.sy_num", self.pin_scan.sy_num),
            ("tth_scan.num", self.tth_scan.num),
            ("alpha_scan.num", self.alpha_scan.num),
        ];
        for (name, num) in nums {
            if num < 2 {
                return Err(AlignError::Configuration(format!(
                    "{name} must be at least 2, got {num}"
                )));
            }
        }
        Ok(())
    }
}

/// Move the sample stage x, y and z to 0.
///
/// The three moves start together. With `wait` they are joined in `group`,
/// defaulting to [`PIN_ORIGIN_GROUP`].
pub async fn move_pin_origin(
    engine: &RunEngine,
    devices: &CentringDevices,
    wait: bool,
    group: Option<String>,
) -> AlignResult<()> {
    let group = match group {
        Some(g) => Some(g),
        None if wait => Some(PIN_ORIGIN_GROUP.to_string()),
        None => None,
    };
    let opts = MoveOptions {
        wait: false,
        group: group.clone(),
    };
    for axis in [&devices.sample_x, &devices.sample_y, &devices.sample_z] {
        engine.move_to(axis, 0.0, opts.clone()).await?;
    }
    if let (true, Some(group)) = (wait, group) {
        engine.wait(&group).await?;
    }
    Ok(())
}

/// Centre two-theta on the direct beam (peak centre).
pub async fn centre_tth(engine: &RunEngine, devices: &CentringDevices, scan: &AngleScan) -> AlignResult<f64> {
    let target = devices.fit(&devices.two_theta, StatPosition::Cen);
    step_scan_and_move_fit(engine, &target, scan.start, scan.end, scan.num).await
}

/// Centre alpha on the direct beam (peak centre).
pub async fn centre_alpha(engine: &RunEngine, devices: &CentringDevices, scan: &AngleScan) -> AlignResult<f64> {
    let target = devices.fit(&devices.alpha, StatPosition::Cen);
    step_scan_and_move_fit(engine, &target, scan.start, scan.end, scan.num).await
}

/// Centre two-theta, then alpha.
pub async fn centre_det_angles(
    engine: &RunEngine,
    devices: &CentringDevices,
    config: &CentringConfig,
) -> AlignResult<()> {
    let tth = centre_tth(engine, devices, &config.tth_scan).await?;
    let alpha = centre_alpha(engine, devices, &config.alpha_scan).await?;
    info!(tth, alpha, "Detector angles centred");
    Ok(())
}

/// Positions found by one pin-locate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinFit {
    /// Mirror fine pitch at the intensity minimum
    pub mirror_pitch: f64,
    /// Stage y at the pin edge
    pub stage_y: f64,
}

/// Bring the beam onto the pin edge around `half_cut`.
///
/// Sweeps the mirror fine pitch over `current ± mirror_coverage/2` to the
/// intensity minimum, then the stage y over `half_cut ± sy_coverage/2` to
/// the derivative centre.
#[instrument(skip(engine, devices, scan), err)]
pub async fn beam_on_pin(
    engine: &RunEngine,
    devices: &CentringDevices,
    scan: &PinScanConfig,
    half_cut: f64,
) -> AlignResult<PinFit> {
    let mirror_current = engine.read(&devices.mirror_pitch).await?;
    let mirror_start = mirror_current - scan.mirror_coverage / 2.0;
    let mirror_end = mirror_current + scan.mirror_coverage / 2.0;
    engine
        .move_to(&devices.sample_y, half_cut, MoveOptions::wait())
        .await?;

    let mirror_pitch = step_scan_and_move_fit(
        engine,
        &devices.fit(&devices.mirror_pitch, StatPosition::Min),
        mirror_start,
        mirror_end,
        scan.mirror_num,
    )
    .await?;

    let stage_y = step_scan_and_move_fit(
        engine,
        &devices.fit(&devices.sample_y, StatPosition::DCen),
        half_cut - scan.sy_coverage / 2.0,
        half_cut + scan.sy_coverage / 2.0,
        scan.sy_num,
    )
    .await?;

    Ok(PinFit {
        mirror_pitch,
        stage_y,
    })
}

/// Locates the pin edge near a given stage height, leaving the stage there.
#[async_trait]
pub trait PinLocator: Send + Sync {
    /// Position the beam on the pin edge around `half_cut`
    async fn locate(&self, engine: &RunEngine, devices: &CentringDevices, half_cut: f64) -> AlignResult<()>;
}

/// Pin locator running [`beam_on_pin`] scans.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPinLocator {
    /// Scan settings
    pub scan: PinScanConfig,
}

#[async_trait]
impl PinLocator for ScanPinLocator {
    async fn locate(&self, engine: &RunEngine, devices: &CentringDevices, half_cut: f64) -> AlignResult<()> {
        beam_on_pin(engine, devices, &self.scan, half_cut).await.map(|_| ())
    }
}

/// Outcome of a converged centring.
#[derive(Debug, Clone, PartialEq)]
pub struct CentringReport {
    /// Pin edge height at 0°
    pub y_0: f64,
    /// Final pin edge height at 180°
    pub y_180: f64,
    /// Mean of the initial 0° and 180° heights
    pub middle: f64,
    /// Mirror height corrections applied
    pub iterations: u32,
}

/// Centre the beam on the diffractometer rotation axis using scan-based pin
/// location.
pub async fn beam_on_centre_diffractometer(
    engine: &RunEngine,
    devices: &CentringDevices,
    config: &CentringConfig,
) -> AlignResult<CentringReport> {
    let locator = ScanPinLocator {
        scan: config.pin_scan.clone(),
    };
    beam_on_centre_diffractometer_with(engine, devices, config, &locator).await
}

/// Centre the beam on the diffractometer rotation axis.
///
/// `middle` is fixed from the first 0°/180° pair. Each correction moves the
/// mirror height by `mirror_height_adjust * (y_180 - middle)` and re-locates
/// the pin at 180° starting from the last edge height. Rotation returns to
/// `rotation_home` only on success.
///
/// # Errors
/// [`AlignError::ConvergenceExceeded`] after `max_iterations` corrections
/// without agreement; fit and device errors pass through.
#[instrument(skip_all, err)]
pub async fn beam_on_centre_diffractometer_with(
    engine: &RunEngine,
    devices: &CentringDevices,
    config: &CentringConfig,
    locator: &dyn PinLocator,
) -> AlignResult<CentringReport> {
    config.validate()?;

    move_pin_origin(engine, devices, true, None).await?;
    engine
        .move_to(&devices.sample_y, config.pin_clear_beam_position, MoveOptions::wait())
        .await?;
    centre_det_angles(engine, devices, config).await?;

    locator.locate(engine, devices, config.pin_half_cut).await?;
    let y_0 = engine.read(&devices.sample_y).await?;

    engine
        .move_to(&devices.rotation, config.rotation_flipped, MoveOptions::wait())
        .await?;
    locator.locate(engine, devices, y_0).await?;
    let y_180 = engine.read(&devices.sample_y).await?;

    let middle = (y_180 + y_0) / 2.0;
    info!(y_0, y_180, middle, "Initial pin edge heights");

    let mut state = ConvergenceState::new(middle, config.mirror_diff_acceptance)
        .with_max_iterations(config.max_iterations);
    let mut current = y_180;
    state.update(current);

    while !state.is_converged() {
        if let Err(e) = state.check_budget() {
            warn!(
                iterations = state.iterations,
                deviation = ?state.deviation(),
                "Pin centring did not converge"
            );
            return Err(e);
        }
        let correction = config.mirror_height_adjust * (current - middle);
        engine
            .move_rel(&devices.mirror_height, correction, MoveOptions::wait())
            .await?;
        locator.locate(engine, devices, current).await?;
        current = engine.read(&devices.sample_y).await?;
        state.update(current);
        state.advance();
        info!(
            iteration = state.iterations,
            correction,
            y_180 = current,
            "Mirror height corrected"
        );
    }

    engine
        .move_to(&devices.rotation, config.rotation_home, MoveOptions::wait())
        .await?;

    Ok(CentringReport {
        y_0,
        y_180: current,
        middle,
        iterations: state.iterations,
    })
}

//! Scan, fit, and move to the fitted position.
//!
//! [`scan_and_move_to_fit_pos`] attaches a [`PeakStats`] to any [`Scan`], runs
//! it, checks the fit found a peak and then drives the motor to the requested
//! [`StatPosition`]. When the fit fails the motor is left where the scan
//! finished.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, instrument};

use super::math::cal_range_num;
use super::motions::MotorTable;
use super::peak_stats::{CurveFamily, PeakStats, StatField};
use crate::error::{AlignError, AlignResult};
use crate::experiment::run_engine::{MoveOptions, RunEngine, ScanContext};
use crate::experiment::scans::{FastScan, Scan, ScanTarget, StepScan};
use crate::hardware::capabilities::DEFAULT_FIELD;

/// Which fitted statistic to move to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatPosition {
    /// Centre of mass
    Com,
    /// Peak position
    Cen,
    /// Minimum value
    Min,
    /// Maximum value
    Max,
    /// Centre of mass of the derivative
    DCom,
    /// Peak position of the derivative (edge centre)
    DCen,
    /// Minimum of the derivative
    DMin,
    /// Maximum of the derivative
    DMax,
}

impl StatPosition {
    /// Every statistic
    pub const ALL: [StatPosition; 8] = [
        StatPosition::Com,
        StatPosition::Cen,
        StatPosition::Min,
        StatPosition::Max,
        StatPosition::DCom,
        StatPosition::DCen,
        StatPosition::DMin,
        StatPosition::DMax,
    ];

    /// Curve family and field this statistic is read from
    pub fn location(self) -> (CurveFamily, StatField) {
        use CurveFamily::{Derivative, Raw};
        match self {
            StatPosition::Com => (Raw, StatField::Com),
            StatPosition::Cen => (Raw, StatField::Cen),
            StatPosition::Min => (Raw, StatField::Min),
            StatPosition::Max => (Raw, StatField::Max),
            StatPosition::DCom => (Derivative, StatField::Com),
            StatPosition::DCen => (Derivative, StatField::Cen),
            StatPosition::DMin => (Derivative, StatField::Min),
            StatPosition::DMax => (Derivative, StatField::Max),
        }
    }
}

impl fmt::Display for StatPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (family, field) = self.location();
        write!(f, "{}.{}", family.as_str(), field.as_str())
    }
}

/// What a fit-and-move aligns: detector, motor and the statistic to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitTarget {
    /// Detector device name
    pub detector: String,
    /// Motor device name
    pub motor: String,
    /// Statistic the motor is moved to
    pub fitted_loc: StatPosition,
    /// Detector field the fit is taken on (`"<detector>-<suffix>"`)
    pub detname_suffix: String,
}

impl FitTarget {
    /// Target fitting the detector's `"value"` field
    pub fn new(detector: impl Into<String>, motor: impl Into<String>, fitted_loc: StatPosition) -> Self {
        Self {
            detector: detector.into(),
            motor: motor.into(),
            fitted_loc,
            detname_suffix: DEFAULT_FIELD.to_string(),
        }
    }

    /// Fit on a different detector field
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.detname_suffix = suffix.into();
        self
    }

    fn detector_field(&self) -> String {
        format!("{}-{}", self.detector, self.detname_suffix)
    }
}

/// Position of `loc` from a completed extractor.
///
/// # Errors
/// - [`AlignError::FittingUnavailable`] if the scan has not completed
/// - [`AlignError::FitFailed`] if the record is missing, or its FWHM is
///   zero or undefined
pub fn get_stat_loc(ps: &PeakStats, loc: StatPosition) -> AlignResult<f64> {
    let (family, field) = loc.location();
    let record = ps.result()?.record(family).ok_or_else(|| {
        AlignError::FitFailed("check devices name are correct.".to_string())
    })?;
    if !record.has_peak() {
        return Err(AlignError::FitFailed(
            "no peak within scan range.".to_string(),
        ));
    }
    record.field(field).ok_or_else(|| {
        AlignError::FitFailed(format!("{loc} is undefined for this scan."))
    })
}

/// Run `scan` with peak statistics attached and move the motor to the fit.
///
/// Returns the position moved to.
#[instrument(skip(engine, scan), fields(scan = %scan.describe()), err)]
pub async fn scan_and_move_to_fit_pos(
    engine: &RunEngine,
    scan: &dyn Scan,
    target: &FitTarget,
) -> AlignResult<f64> {
    let mut ps = PeakStats::new(target.motor.as_str(), target.detector_field());
    {
        let mut ctx = ScanContext::new(engine);
        ctx.subscribe(&mut ps);
        scan.run(&mut ctx, &ScanTarget::new(target.detector.as_str(), target.motor.as_str()))
            .await?;
    }

    let position = get_stat_loc(&ps, target.fitted_loc)?;
    if let Ok(record) = ps.record(target.fitted_loc.location().0) {
        info!("Fit info {}", record);
    }
    engine
        .move_to(&target.motor, position, MoveOptions::wait())
        .await?;
    Ok(position)
}

/// Step scan `start..=end` over `num` points, then move to the fit.
pub async fn step_scan_and_move_fit(
    engine: &RunEngine,
    target: &FitTarget,
    start: f64,
    end: f64,
    num: usize,
) -> AlignResult<f64> {
    info!(
        "Step scanning {} with {} pro-scan move to {}",
        target.motor,
        target.detector_field(),
        target.fitted_loc
    );
    scan_and_move_to_fit_pos(engine, &StepScan::new(start, end, num), target).await
}

/// Continuous sweep `start -> end`, then move to the fit.
pub async fn fast_scan_and_move_fit(
    engine: &RunEngine,
    target: &FitTarget,
    start: f64,
    end: f64,
    motor_speed: Option<f64>,
) -> AlignResult<f64> {
    info!(
        "Fast scanning {} with {} pro-scan move to {}",
        target.motor,
        target.detector_field(),
        target.fitted_loc
    );
    scan_and_move_to_fit_pos(engine, &FastScan::new(start, end, motor_speed), target).await
}

/// Re-centre a slit motor around its table position and store the result.
///
/// The scan spans `table[size] ± size/1000*3` at a step of `size/5000`
/// (sizes in µm, positions in mm). After moving to the fit, the motor's
/// readback replaces the table entry. Returns the new entry.
#[instrument(skip(engine, table), err)]
pub async fn align_slit_with_look_up(
    engine: &RunEngine,
    motor: &str,
    size: f64,
    table: &mut MotorTable,
    detector: &str,
    centre_type: StatPosition,
) -> AlignResult<f64> {
    table.validate()?;
    let cen = table.lookup(size)?;
    let (start, end, num) = cal_range_num(cen, size / 1000.0 * 3.0, size / 5000.0)?;

    let target = FitTarget::new(detector, motor, centre_type);
    step_scan_and_move_fit(engine, &target, start, end, num).await?;

    let readback = engine.read(motor).await?;
    table.set(size, readback);
    info!(motor, size, readback, "Updated lookup table");
    Ok(readback)
}

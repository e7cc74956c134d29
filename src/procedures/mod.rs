//! Beamline Alignment Procedures
//!
//! Reusable alignment routines composed from the run engine's primitives
//! (move, read, wait, checkpoint) and the scans in [`crate::experiment::scans`].
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  centring      beam_on_centre_diffractometer, beam_on_pin, ...    │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  alignment     scan_and_move_to_fit_pos, align_slit_with_look_up  │
//! │  settle        set_and_wait_within_tolerance                      │
//! │  motions       MotorTable, set_slit_size, check_within_limit      │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  peak_stats    PeakStats (document subscriber), PeakRecord        │
//! │  math          cal_range_num, step_size_to_step_num               │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  RunEngine + DeviceRegistry (Movable | Readable | MotionLimits)   │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use beamline_align::procedures::{step_scan_and_move_fit, FitTarget, StatPosition};
//!
//! let target = FitTarget::new("direct_beam_det", "diffractometer_tth", StatPosition::Cen);
//! let tth = step_scan_and_move_fit(&engine, &target, -1.0, 1.0, 21).await?;
//! ```

pub mod alignment;
pub mod centring;
pub mod math;
pub mod motions;
pub mod peak_stats;
pub mod settle;

// Re-exports
pub use alignment::{
    align_slit_with_look_up, fast_scan_and_move_fit, get_stat_loc, scan_and_move_to_fit_pos,
    step_scan_and_move_fit, FitTarget, StatPosition,
};
pub use centring::{
    beam_on_centre_diffractometer, beam_on_centre_diffractometer_with, beam_on_pin,
    centre_alpha, centre_det_angles, centre_tth, move_pin_origin, AngleScan, CentringConfig,
    CentringDevices, CentringReport, PinFit, PinLocator, PinScanConfig, ScanPinLocator,
};
pub use math::{cal_range_num, step_size_to_step_num};
pub use motions::{check_within_limit, move_motor_with_look_up, set_slit_size, MotorTable, Slit};
pub use peak_stats::{CurveFamily, FitResult, PeakRecord, PeakStats, StatField};
pub use settle::{
    set_and_wait_within_tolerance, set_setpoint_to_readback, ConvergenceState, DelayAction,
    PlanAction, SetpointToReadback, SettleAction, SettleConfig, SettleOptions, SettleReport,
};

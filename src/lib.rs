//! # Beamline Alignment Library
//!
//! Closed-loop alignment procedures for synchrotron beamline optics and
//! diffractometers, built on a small Bluesky-style run engine.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: Capability traits (`Movable`, `Readable`, `MotionLimits`), the
//!   `DeviceRegistry`, and simulated devices for tests and demos.
//! - **`experiment`**: Run documents, declarative plans, the `RunEngine` and
//!   the step/fly scans procedures are built from.
//! - **`procedures`**: Peak statistics, fit-and-move, lookup-table positioning,
//!   the setpoint settle loop and diffractometer beam centring.
//! - **`config`**: Figment-based configuration (TOML + `BEAMLINE_ALIGN_` environment).
//! - **`tracing_setup`**: `tracing-subscriber` initialisation.
//! - **`error`**: The `AlignError` enum shared by every module.
//!
//! ## Example
//!
//! ```rust,ignore
//! use beamline_align::prelude::*;
//! use std::sync::Arc;
//!
//! let engine = RunEngine::new(Arc::new(registry));
//! let target = FitTarget::new("d11", "s5_ycentre", StatPosition::Cen);
//! step_scan_and_move_fit(&engine, &target, -1.0, 1.0, 41).await?;
//! ```

pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod procedures;
pub mod tracing_setup;

/// Commonly used types
pub mod prelude {
    pub use crate::config::AlignConfig;
    pub use crate::error::{AlignError, AlignResult};
    pub use crate::experiment::run_engine::{MoveOptions, RunEngine, ScanContext};
    pub use crate::hardware::registry::DeviceRegistry;
    pub use crate::procedures::alignment::{
        fast_scan_and_move_fit, scan_and_move_to_fit_pos, step_scan_and_move_fit, FitTarget,
        StatPosition,
    };
    pub use crate::procedures::centring::{
        beam_on_centre_diffractometer, CentringConfig, CentringDevices,
    };
    pub use crate::procedures::motions::{move_motor_with_look_up, MotorTable};
    pub use crate::procedures::settle::{set_and_wait_within_tolerance, SettleOptions};
}

//! Hardware Abstraction
//!
//! Devices are exposed to procedures through capability traits rather than
//! concrete driver types:
//!
//! - [`capabilities::Movable`] - absolute/relative moves and position readback
//! - [`capabilities::Readable`] - scalar readings (and named fields)
//! - [`capabilities::MotionLimits`] - soft limits and velocity control
//!
//! A [`registry::DeviceRegistry`] maps device names to the capabilities they
//! provide. [`mock`] holds simulated devices for tests and the
//! `simulate-centring` command.

pub mod capabilities;
pub mod mock;
pub mod registry;

pub use capabilities::{MotionLimits, Movable, Readable, DEFAULT_FIELD};
pub use registry::{DeviceComponents, DeviceInfo, DeviceRegistry};

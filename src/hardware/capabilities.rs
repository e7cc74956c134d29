//! Atomic Hardware Capabilities
//!
//! Fine-grained capability traits that beamline devices implement. Procedures
//! never see a concrete motor or detector type, only the capabilities they need:
//!
//! - A motor implements: `Movable + Readable + MotionLimits`
//! - A scaler channel or photodiode implements: `Readable`
//! - A temperature controller implements: `Movable` (setpoint) + `Readable` (readback)
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors, so driver faults pass through unmodified
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn centre<M>(motor: &M, start: f64, end: f64) -> Result<f64>
//! where
//!     M: Movable + Readable,
//! {
//!     motor.move_abs(start).await?;
//!     motor.move_abs(end).await?;
//!     motor.read().await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Field name used when a readable exposes a single value.
pub const DEFAULT_FIELD: &str = "value";

/// Capability: Motion Control
///
/// Devices that can be commanded to a position (motors, piezo mirrors,
/// goniometer circles) or to a setpoint (temperature, energy).
///
/// # Contract
/// - Positions are in device-native units (mm, degrees, mrad, ...)
/// - `move_abs` resolves when the device reports completion
/// - `position` returns the current readback (approximate while moving)
///
/// # Thread Safety
/// - All methods are async and require `&self`
/// - Interior mutability (Mutex/RwLock) should be used for state
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position and resolve when the move completes.
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Move relative to current position
    async fn move_rel(&self, distance: f64) -> Result<()> {
        let current = self.position().await?;
        self.move_abs(current + distance).await
    }

    /// Get current position
    async fn position(&self) -> Result<f64>;

    /// Stop motion immediately
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: Scalar Readout
///
/// Devices that produce one or more named scalar values per reading
/// (scaler channels, diodes, current amplifiers, motor readbacks).
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read the primary value
    async fn read(&self) -> Result<f64>;

    /// Read every field this device reports.
    ///
    /// Keys are field suffixes; run engines publish them as `"<device>-<field>"`.
    ///
    /// # Default Implementation
    /// A single [`DEFAULT_FIELD`] entry holding [`Readable::read`].
    async fn read_fields(&self) -> Result<HashMap<String, f64>> {
        let value = self.read().await?;
        Ok(HashMap::from([(DEFAULT_FIELD.to_string(), value)]))
    }
}

/// Capability: Soft Limits and Velocity
///
/// Sub-signals of a motor record used for bounds checks and fly scans.
#[async_trait]
pub trait MotionLimits: Send + Sync {
    /// Low soft limit
    async fn low_limit(&self) -> Result<f64>;

    /// High soft limit
    async fn high_limit(&self) -> Result<f64>;

    /// Current velocity in units/sec
    async fn velocity(&self) -> Result<f64>;

    /// Highest velocity the axis accepts
    async fn max_velocity(&self) -> Result<f64>;

    /// Set velocity in units/sec
    async fn set_velocity(&self, velocity: f64) -> Result<()>;
}

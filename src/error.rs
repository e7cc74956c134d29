//! Custom error types for the alignment library.
//!
//! This module defines the primary error type, `AlignError`. Using the `thiserror`
//! crate, it gives every procedure in the crate one consistent failure vocabulary,
//! from fitting problems to convergence failures and pass-through device faults.
//!
//! ## Error Hierarchy
//!
//! - **`FittingUnavailable`**: the feature extractor was queried before a scan finished,
//!   or for a curve family it never produced. A usage error, never retried.
//! - **`FitFailed`**: the scan completed but no usable peak was found (FWHM absent or
//!   zero). Surfaced to the caller of fit-and-move.
//! - **`NoSuchCategory`**: a motor position table has no entry for the requested size.
//! - **`ConvergenceExceeded`**: the centring procedure ran out of correction iterations.
//!   Fatal: an unconverged alignment is unsafe to use downstream.
//! - **`Device`**: hardware faults from capability calls, passed through unmodified.
//!
//! Nothing in this crate retries on its own. All failures are returned to the caller.

use thiserror::Error;

/// Convenience alias for results using the alignment error type.
pub type AlignResult<T> = std::result::Result<T, AlignError>;

/// Primary error type for alignment procedures.
#[derive(Error, Debug)]
pub enum AlignError {
    /// Peak statistics were requested before they exist.
    ///
    /// Occurs when a `PeakStats` is queried before the scan it observes has
    /// stopped, or for a curve family that was never computed.
    #[error("Fitting unavailable: {0}")]
    FittingUnavailable(String),

    /// The scan finished but the fit is unusable.
    ///
    /// Either the fit record is missing (usually a wrong detector or motor name)
    /// or there is no peak inside the scan range.
    #[error("Fitting failed: {0}")]
    FitFailed(String),

    /// Lookup-table miss.
    #[error("No entry for size={size}. Available sizes: {available:?}")]
    NoSuchCategory {
        /// Requested size
        size: f64,
        /// Keys present in the table
        available: Vec<String>,
    },

    /// The centring procedure did not converge within its iteration budget.
    #[error("Failed to centre the pin on the beam after {iterations} iterations.")]
    ConvergenceExceeded {
        /// Number of correction iterations performed
        iterations: u32,
    },

    /// Motor position table failed shape validation.
    #[error("Invalid motor table: {0}")]
    InvalidTable(String),

    /// Requested position outside the motor's soft limits.
    #[error("{device} move request of {value} is beyond limits: {low} < {high}")]
    OutOfLimits {
        /// Motor name
        device: String,
        /// Offending position
        value: f64,
        /// Low soft limit
        low: f64,
        /// High soft limit
        high: f64,
    },

    /// The device is not registered or lacks the needed capability.
    #[error("Device '{device}' not found or not {capability}")]
    DeviceNotFound {
        /// Device name
        device: String,
        /// Missing capability ("movable", "readable", ...)
        capability: &'static str,
    },

    /// The run engine was asked to abort and a suspension point observed it.
    #[error("Run aborted: {0}")]
    Aborted(String),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration values parsed but are not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hardware fault from a capability call.
    #[error("Device error: {0}")]
    Device(#[from] anyhow::Error),
}

impl AlignError {
    /// True for errors raised because the run was aborted.
    pub fn is_abort(&self) -> bool {
        matches!(self, AlignError::Aborted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convergence_message_names_iterations() {
        let err = AlignError::ConvergenceExceeded { iterations: 5 };
        assert_eq!(
            err.to_string(),
            "Failed to centre the pin on the beam after 5 iterations."
        );
    }

    #[test]
    fn test_device_error_passes_message_through() {
        let err: AlignError = anyhow::anyhow!("axis fault").into();
        assert!(matches!(err, AlignError::Device(_)));
        assert_eq!(err.to_string(), "Device error: axis fault");
        assert!(!err.is_abort());
    }
}

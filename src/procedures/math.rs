//! Scan range helpers.

use crate::error::{AlignError, AlignResult};

/// Start, end and point count of a scan spanning `cen ± range` at a
/// resolution of a quarter of `size`.
///
/// `num = ceil(|range * 4 / size|)`.
pub fn cal_range_num(cen: f64, range: f64, size: f64) -> AlignResult<(f64, f64, usize)> {
    if size == 0.0 || !size.is_finite() || !range.is_finite() || !cen.is_finite() {
        return Err(AlignError::Configuration(format!(
            "cannot derive scan range from cen={cen}, range={range}, size={size}"
        )));
    }
    let num = (range * 4.0 / size).abs().ceil() as usize;
    Ok((cen - range, cen + range, num))
}

/// Number of whole steps of `step_size` between `start` and `end`.
pub fn step_size_to_step_num(start: f64, end: f64, step_size: f64) -> AlignResult<usize> {
    if step_size <= 0.0 || !step_size.is_finite() {
        return Err(AlignError::Configuration(format!(
            "step size must be positive, got {step_size}"
        )));
    }
    Ok(((start - end).abs() / step_size).floor() as usize)
}

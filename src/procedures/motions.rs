//! Lookup-table positioning and simple motion helpers.
//!
//! Slits and other discretely sized optics are positioned from a
//! [`MotorTable`]: a map from an integer size category (e.g. slit opening in
//! µm, written as a string key) to a motor position.
//!
//! ```toml
//! # s5_table.toml
//! 50 = 0.182
//! 100 = 0.405
//! 500 = 1.23
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, instrument};

use crate::error::{AlignError, AlignResult};
use crate::experiment::run_engine::{MoveOptions, RunEngine};

/// Size category → motor position table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MotorTable(BTreeMap<String, f64>);

impl MotorTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table from `(category, position)` pairs
    pub fn from_entries<K: Into<String>>(entries: impl IntoIterator<Item = (K, f64)>) -> Self {
        Self(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Load and validate a table from a TOML file of `category = position` pairs.
    pub fn from_toml_file(path: impl AsRef<Path>) -> AlignResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let table: Self = toml::from_str(&text).map_err(|e| {
            AlignError::InvalidTable(format!("{}: {}", path.as_ref().display(), e))
        })?;
        table.validate()?;
        Ok(table)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> AlignResult<String> {
        toml::to_string(self).map_err(|e| AlignError::InvalidTable(e.to_string()))
    }

    /// Every key must parse as an integer and every position must be finite.
    pub fn validate(&self) -> AlignResult<()> {
        for (key, value) in &self.0 {
            if key.trim().parse::<i64>().is_err() {
                return Err(AlignError::InvalidTable(format!(
                    "key '{key}' is not an integer size"
                )));
            }
            if !value.is_finite() {
                return Err(AlignError::InvalidTable(format!(
                    "position for '{key}' is not finite: {value}"
                )));
            }
        }
        Ok(())
    }

    /// Category key for a size: its integer part.
    pub fn key_for(size: f64) -> String {
        (size.trunc() as i64).to_string()
    }

    /// Position for a size, if the category exists
    pub fn get(&self, size: f64) -> Option<f64> {
        self.0.get(&Self::key_for(size)).copied()
    }

    /// Position for a size.
    ///
    /// # Errors
    /// [`AlignError::NoSuchCategory`] listing the available keys.
    pub fn lookup(&self, size: f64) -> AlignResult<f64> {
        self.get(size).ok_or_else(|| AlignError::NoSuchCategory {
            size,
            available: self.0.keys().cloned().collect(),
        })
    }

    /// Store the position for a size's category
    pub fn set(&mut self, size: f64, position: f64) {
        self.0.insert(Self::key_for(size), position);
    }

    /// Number of categories
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the table has no categories
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Move `motor` to the position for `size`.
///
/// The table is validated first. With `use_motor_position` the motor goes to
/// `size` itself; otherwise to the table entry for `size`'s category.
/// Returns the commanded position.
#[instrument(skip(engine, table), err)]
pub async fn move_motor_with_look_up(
    engine: &RunEngine,
    motor: &str,
    size: f64,
    table: &MotorTable,
    use_motor_position: bool,
    opts: MoveOptions,
) -> AlignResult<f64> {
    table.validate()?;
    let target = if use_motor_position {
        size
    } else {
        table.lookup(size)?
    };
    info!(motor, size, target, "Moving to lookup position");
    engine.move_to(motor, target, opts).await?;
    Ok(target)
}

/// An x/y slit pair, addressed by its gap motors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slit {
    /// Slit name, used for the default wait group
    pub name: String,
    /// Horizontal gap motor
    pub x_gap: String,
    /// Vertical gap motor
    pub y_gap: String,
}

/// Set the opening of an x/y slit.
///
/// Both gaps start together in one group; `y_size` defaults to `x_size`.
/// With `wait` and no group, the group is `"<slit>_wait"` and is joined
/// before returning.
#[instrument(skip(engine), fields(slit = %slit.name), err)]
pub async fn set_slit_size(
    engine: &RunEngine,
    slit: &Slit,
    x_size: f64,
    y_size: Option<f64>,
    wait: bool,
    group: Option<String>,
) -> AlignResult<()> {
    let group = match group {
        Some(g) => Some(g),
        None if wait => Some(format!("{}_wait", slit.name)),
        None => None,
    };
    let y_size = y_size.unwrap_or(x_size);
    info!("Setting {} to x = {}, y = {}.", slit.name, x_size, y_size);

    let opts = MoveOptions {
        wait: false,
        group: group.clone(),
    };
    engine.move_to(&slit.x_gap, x_size, opts.clone()).await?;
    engine.move_to(&slit.y_gap, y_size, opts).await?;

    if let (true, Some(group)) = (wait, group) {
        info!("Waiting for {} to finish move.", slit.name);
        engine.wait(&group).await?;
    }
    Ok(())
}

/// Check every value lies strictly inside `motor`'s soft limits.
pub async fn check_within_limit(engine: &RunEngine, values: &[f64], motor: &str) -> AlignResult<()> {
    info!("Check {} limits.", motor);
    let limits = engine.limits(motor)?;
    let low = limits.low_limit().await?;
    let high = limits.high_limit().await?;
    for &value in values {
        if !(low < value && value < high) {
            return Err(AlignError::OutOfLimits {
                device: motor.to_string(),
                value,
                low,
                high,
            });
        }
    }
    Ok(())
}

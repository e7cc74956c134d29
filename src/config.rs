//! Configuration using Figment
//!
//! Configuration is loaded from, in increasing precedence:
//! 1. built-in defaults
//! 2. a TOML file (`config/beamline_align.toml` by default)
//! 3. environment variables prefixed with `BEAMLINE_ALIGN_`, nested with `__`
//!
//! ```text
//! BEAMLINE_ALIGN_APPLICATION__LOG_LEVEL=debug
//! BEAMLINE_ALIGN_CENTRING__MAX_ITERATIONS=8
//! BEAMLINE_ALIGN_DEVICES__DETECTOR=d11
//! ```
//!
//! # Example
//! ```no_run
//! use beamline_align::config::AlignConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AlignConfig::load_from("config/beamline_align.toml")?;
//! config.validate()?;
//! println!("Acceptance: {} mm", config.centring.mirror_diff_acceptance);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{AlignError, AlignResult};
use crate::procedures::centring::{CentringConfig, CentringDevices};
use crate::procedures::settle::SettleConfig;
use crate::tracing_setup::{parse_log_level, OutputFormat};

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/beamline_align.toml";

/// Prefix of overriding environment variables
pub const ENV_PREFIX: &str = "BEAMLINE_ALIGN_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Device names used by the centring procedure
    pub devices: CentringDevices,
    /// Centring tuning
    pub centring: CentringConfig,
    /// Settle loop defaults
    pub settle: SettleConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "beamline-align".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::default(),
        }
    }
}

impl AlignConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment
    pub fn load() -> AlignResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    ///
    /// A missing file leaves the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AlignResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// Provider stack used by [`AlignConfig::load_from`]
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AlignResult<()> {
        parse_log_level(&self.application.log_level)?;

        if !(self.settle.poll_delay.is_finite() && self.settle.poll_delay >= 0.0) {
            return Err(AlignError::Configuration(format!(
                "settle.poll_delay must be a non-negative number, got {}",
                self.settle.poll_delay
            )));
        }

        let mut names = HashSet::new();
        for name in self.devices.names() {
            if name.trim().is_empty() {
                return Err(AlignError::Configuration(
                    "device names must not be empty".to_string(),
                ));
            }
            if !names.insert(name) {
                return Err(AlignError::Configuration(format!(
                    "Duplicate device name: {name}"
                )));
            }
        }

        self.centring.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AlignConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.devices.sample_y, "sample_stage_y");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AlignConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(config.validate(), Err(AlignError::Configuration(_))));
    }

    #[test]
    fn test_duplicate_device_names() {
        let mut config = AlignConfig::default();
        config.devices.sample_z = config.devices.sample_x.clone();
        match config.validate() {
            Err(AlignError::Configuration(msg)) => assert!(msg.contains("sample_stage_x")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_negative_poll_delay() {
        let mut config = AlignConfig::default();
        config.settle.poll_delay = -1.0;
        assert!(config.validate().is_err());
    }
}

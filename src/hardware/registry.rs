//! Device Registry
//!
//! Central name → capability lookup used by the run engine. Procedures refer to
//! devices by name (`"sample_stage_y"`, `"rasor_det"`); the registry resolves a
//! name to whichever capability handles the device registered.
//!
//! ```rust,ignore
//! let mut registry = DeviceRegistry::new();
//! registry.register_motor("sample_stage_y", Arc::new(SimMotor::new("sample_stage_y")))?;
//!
//! if let Some(motor) = registry.get_movable("sample_stage_y") {
//!     motor.move_abs(1.0).await?;
//! }
//! ```

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;

use crate::hardware::capabilities::{MotionLimits, Movable, Readable};

/// Capability handles a device contributes to the registry.
#[derive(Clone, Default)]
pub struct DeviceComponents {
    /// Motion / setpoint capability
    pub movable: Option<Arc<dyn Movable>>,
    /// Readout capability
    pub readable: Option<Arc<dyn Readable>>,
    /// Soft limits and velocity
    pub limits: Option<Arc<dyn MotionLimits>>,
}

impl DeviceComponents {
    fn capabilities(&self) -> Vec<&'static str> {
        let mut caps = Vec::new();
        if self.movable.is_some() {
            caps.push("movable");
        }
        if self.readable.is_some() {
            caps.push("readable");
        }
        if self.limits.is_some() {
            caps.push("limits");
        }
        caps
    }
}

/// Summary of a registered device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device name
    pub id: String,
    /// Capabilities the device registered
    pub capabilities: Vec<&'static str>,
}

/// Central registry for beamline devices
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceComponents>,
}

impl DeviceRegistry {
    /// Create a new empty device registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device by its capability handles.
    ///
    /// # Errors
    /// Returns error if the name is already taken or no capability is given.
    pub fn register(&mut self, id: impl Into<String>, components: DeviceComponents) -> Result<()> {
        let id = id.into();
        if self.devices.contains_key(&id) {
            return Err(anyhow!("Device '{}' is already registered", id));
        }
        if components.capabilities().is_empty() {
            return Err(anyhow!("Device '{}' registered without capabilities", id));
        }
        self.devices.insert(id, components);
        Ok(())
    }

    /// Register a full motor record (setpoint, readback, limits).
    pub fn register_motor<T>(&mut self, id: impl Into<String>, motor: Arc<T>) -> Result<()>
    where
        T: Movable + Readable + MotionLimits + 'static,
    {
        self.register(
            id,
            DeviceComponents {
                movable: Some(motor.clone()),
                readable: Some(motor.clone()),
                limits: Some(motor),
            },
        )
    }

    /// Register a device that is both commanded and read back.
    pub fn register_movable_readable<T>(&mut self, id: impl Into<String>, device: Arc<T>) -> Result<()>
    where
        T: Movable + Readable + 'static,
    {
        self.register(
            id,
            DeviceComponents {
                movable: Some(device.clone()),
                readable: Some(device),
                limits: None,
            },
        )
    }

    /// Register a read-only device (detector channel, readback signal).
    pub fn register_readable<T>(&mut self, id: impl Into<String>, device: Arc<T>) -> Result<()>
    where
        T: Readable + 'static,
    {
        self.register(
            id,
            DeviceComponents {
                readable: Some(device),
                ..Default::default()
            },
        )
    }

    /// Unregister a device, returning true if it existed
    pub fn unregister(&mut self, id: &str) -> bool {
        self.devices.remove(id).is_some()
    }

    /// List all registered devices, sorted by name
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut infos: Vec<DeviceInfo> = self
            .devices
            .iter()
            .map(|(id, components)| DeviceInfo {
                id: id.clone(),
                capabilities: components.capabilities(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Check if a device is registered
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Get count of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Get a device as Movable (if it supports this capability)
    pub fn get_movable(&self, id: &str) -> Option<Arc<dyn Movable>> {
        self.devices.get(id).and_then(|d| d.movable.clone())
    }

    /// Get a device as Readable (if it supports this capability)
    pub fn get_readable(&self, id: &str) -> Option<Arc<dyn Readable>> {
        self.devices.get(id).and_then(|d| d.readable.clone())
    }

    /// Get a device's limits and velocity (if it exposes them)
    pub fn get_limits(&self, id: &str) -> Option<Arc<dyn MotionLimits>> {
        self.devices.get(id).and_then(|d| d.limits.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimDetector, SimMotor};

    #[test]
    fn test_register_and_lookup() {
        let mut registry = DeviceRegistry::new();
        let motor = Arc::new(SimMotor::new("stage_y"));
        registry.register_motor("stage_y", motor.clone()).unwrap();
        registry
            .register_readable("det", Arc::new(SimDetector::constant(1.0)))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get_movable("stage_y").is_some());
        assert!(registry.get_limits("stage_y").is_some());
        assert!(registry.get_movable("det").is_none());
        assert!(registry.get_readable("det").is_some());

        let infos = registry.list_devices();
        assert_eq!(infos[0].id, "det");
        assert_eq!(infos[1].capabilities, vec!["movable", "readable", "limits"]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = DeviceRegistry::new();
        registry
            .register_motor("th", Arc::new(SimMotor::new("th")))
            .unwrap();
        assert!(registry
            .register_motor("th", Arc::new(SimMotor::new("th")))
            .is_err());
        assert!(registry.register("empty", DeviceComponents::default()).is_err());
        assert!(registry.unregister("th"));
        assert!(registry.is_empty());
    }
}

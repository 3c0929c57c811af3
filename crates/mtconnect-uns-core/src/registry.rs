//! Registry of known devices.

use crate::observation::Device;
use std::sync::{Arc, PoisonError, RwLock};

/// Set of devices discovered during a run.
///
/// Devices are kept in registration order and never removed.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<Arc<Vec<Device>>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device.
    ///
    /// Returns `true` if the device was newly added, `false` if a device
    /// with the same UUID is already known.
    pub fn register(&self, device: Device) -> bool {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        if devices.iter().any(|known| known.uuid == device.uuid) {
            return false;
        }

        tracing::debug!(uuid = %device.uuid, "Registered device");
        Arc::make_mut(&mut *devices).push(device);
        true
    }

    /// Snapshot of all registered devices.
    #[must_use]
    pub fn list_all(&self) -> DeviceSnapshot {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        DeviceSnapshot {
            devices: Arc::clone(&devices),
        }
    }

    /// Whether a device with this UUID is registered.
    #[must_use]
    pub fn contains(&self, uuid: &str) -> bool {
        self.list_all().iter().any(|device| device.uuid == uuid)
    }

    /// Number of registered devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list_all().len()
    }

    /// Whether no device is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable view of the registry at one point in time.
///
/// Can be iterated any number of times; later registrations are not visible.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    devices: Arc<Vec<Device>>,
}

impl DeviceSnapshot {
    /// Iterate over the devices in registration order.
    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.devices.iter()
    }

    /// Number of devices in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl<'a> IntoIterator for &'a DeviceSnapshot {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let registry = DeviceRegistry::new();

        assert!(registry.register(Device::new("D1")));
        assert!(!registry.register(Device::new("D1").with_name("renamed")));

        let snapshot = registry.list_all();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.iter().next().unwrap().name, None);
    }

    #[test]
    fn snapshot_is_restartable_and_stable() {
        let registry = DeviceRegistry::new();
        registry.register(Device::new("D1"));
        registry.register(Device::new("D2"));

        let snapshot = registry.list_all();
        registry.register(Device::new("D3"));

        let first: Vec<_> = snapshot.iter().map(|d| d.uuid.clone()).collect();
        let second: Vec<_> = (&snapshot).into_iter().map(|d| d.uuid.clone()).collect();

        assert_eq!(first, vec!["D1", "D2"]);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("D3"));
    }
}

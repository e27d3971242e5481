//! Discovery sources.
//!
//! A [`Discovery`] feeds the registry with devices reachable through one
//! backend. Devices are keyed by `(name, type)` within a source: adding the
//! same pair twice returns the existing handle, and removal only needs the
//! pair.
//!
//! Stopping a source, or dropping it, removes every device it added.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::device::{DeviceApi, DeviceInfo, DeviceType};
use crate::error::{Error, Result};
use crate::identifiers::{BackendId, DeviceHandle, DiscoveryId};
use crate::registry::{Registry, WeakRegistry};

use super::BackendKind;

// ============================================================================
// DiscoveryDevice
// ============================================================================

/// Descriptor of a discovered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryDevice {
    /// Human readable name.
    pub name: String,
    /// Device type.
    pub device_type: DeviceType,
    /// Transport address.
    pub address: String,
    /// Transport port.
    pub port: u16,
    /// Unique device id (serial).
    pub id: String,
}

// ============================================================================
// Discovery
// ============================================================================

type DeviceKey = (String, DeviceType);

/// A discovery source bound to one backend.
pub struct Discovery {
    id: DiscoveryId,
    name: String,
    backend: BackendId,
    backend_kind: BackendKind,
    registry: WeakRegistry,
    state: Mutex<DiscoveryState>,
}

#[derive(Default)]
struct DiscoveryState {
    running: bool,
    device_types: Option<Vec<DeviceType>>,
    devices: FxHashMap<DeviceKey, DeviceHandle>,
}

impl Discovery {
    /// Creates a stopped discovery source for `backend`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the registry is destroyed or the backend is
    /// not registered.
    pub fn new(registry: &Registry, name: impl Into<String>, backend: BackendId) -> Result<Self> {
        let backend_kind = registry
            .backend_kind(backend)
            .ok_or_else(|| Error::not_found(format!("backend {backend}")))?;

        let id = DiscoveryId::next();
        registry.register_discovery(id)?;

        let name = name.into();
        debug!(discovery = %id, %name, backend = %backend, "Discovery created");

        Ok(Self {
            id,
            name,
            backend,
            backend_kind,
            registry: registry.downgrade(),
            state: Mutex::new(DiscoveryState::default()),
        })
    }

    /// Returns the discovery id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> DiscoveryId {
        self.id
    }

    /// Returns the source name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` while started.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Restricts accepted device types. `None` accepts every type.
    pub fn set_device_types(&self, types: Option<Vec<DeviceType>>) {
        self.state.lock().device_types = types;
    }

    /// Starts the source. Idempotent.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if !state.running {
            state.running = true;
            debug!(discovery = %self.id, "Discovery started");
        }
    }

    /// Stops the source and removes its devices. Idempotent.
    pub fn stop(&self) {
        let devices = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            std::mem::take(&mut state.devices)
        };

        self.remove_all(devices);
        debug!(discovery = %self.id, "Discovery stopped");
    }

    /// Adds a discovered device to the registry.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if the source is not started
    /// - [`Error::InvalidArgument`] if the device type is filtered out
    /// - The registry error
    pub fn add_device(&self, device: DiscoveryDevice) -> Result<DeviceHandle> {
        let registry = self.registry()?;
        let key = (device.name.clone(), device.device_type);

        {
            let state = self.state.lock();
            if !state.running {
                return Err(Error::protocol(format!("discovery {} not started", self.id)));
            }
            if let Some(types) = &state.device_types
                && !types.contains(&device.device_type)
            {
                return Err(Error::invalid_argument(format!(
                    "device type {} filtered by discovery {}",
                    device.device_type, self.id
                )));
            }
            if let Some(&handle) = state.devices.get(&key) {
                debug!(discovery = %self.id, name = %device.name, handle = %handle, "Device already known");
                return Ok(handle);
            }
        }

        let info = DeviceInfo {
            id: device.id,
            name: device.name,
            device_type: device.device_type,
            backend_kind: self.backend_kind,
            address: device.address,
            port: device.port,
            api: DeviceApi::Unknown,
        };

        let handle = registry.add_device(info, self.backend).inspect_err(|e| {
            warn!(discovery = %self.id, error = %e, "Failed to add discovered device");
        })?;
        self.state.lock().devices.insert(key, handle);
        Ok(handle)
    }

    /// Removes the device added under `(name, device_type)`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no such device was added by this source, or
    /// the registry error.
    pub fn remove_device(&self, name: &str, device_type: DeviceType) -> Result<()> {
        let registry = self.registry()?;
        let key = (name.to_string(), device_type);
        let handle = self
            .state
            .lock()
            .devices
            .get(&key)
            .copied()
            .ok_or_else(|| Error::not_found(format!("device {name} ({device_type})")))?;

        let result = registry.remove_device(handle);
        match &result {
            Ok(()) | Err(Error::DeviceNotFound { .. }) => {
                let mut state = self.state.lock();
                if state.devices.get(&key) == Some(&handle) {
                    state.devices.remove(&key);
                }
            }
            Err(_) => {}
        }
        result.inspect_err(|e| {
            warn!(discovery = %self.id, handle = %handle, error = %e, "Failed to remove discovered device");
        })
    }

    /// Returns the number of devices currently added by this source.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.state.lock().devices.len()
    }

    fn registry(&self) -> Result<Registry> {
        self.registry
            .upgrade()
            .ok_or_else(|| Error::not_found("registry"))
    }

    fn remove_all(&self, devices: FxHashMap<DeviceKey, DeviceHandle>) {
        let Some(registry) = self.registry.upgrade().filter(|r| !r.is_closed()) else {
            return;
        };
        for ((name, _), handle) in devices {
            if let Err(e) = registry.remove_device(handle) {
                warn!(discovery = %self.id, %name, handle = %handle, error = %e, "Failed to remove device");
            }
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        let devices = std::mem::take(&mut self.state.get_mut().devices);
        self.remove_all(devices);
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister_discovery(self.id);
        }
        debug!(discovery = %self.id, "Discovery destroyed");
    }
}

impl fmt::Debug for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

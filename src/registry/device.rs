//! Registry-side device entries.
//!
//! Each discovered device owns one [`Device`] slot in the registry table.
//! The slot records the live connection, its frame pipe and command
//! interface, and the [`DeviceEvents`] sink of whoever asked to connect.
//!
//! [`DeviceConnEvents`] adapts connection transitions into slot updates
//! and device-level notifications.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::{CancelReason, DeviceApi, DeviceInfo, DeviceState, LinkStatus};
use crate::identifiers::{BackendId, DeviceHandle};
use crate::transport::{CommandInterface, ConnectionEvents, DeviceConnection, FramePipe};

use super::core::WeakRegistry;

// ============================================================================
// DeviceEvents
// ============================================================================

/// Device-level connection notifications.
pub(crate) trait DeviceEvents: Send + Sync {
    fn connecting(&self);

    /// The command interface can be created from here on.
    fn connected(&self, api: DeviceApi);

    fn disconnected(&self, removing: bool);

    fn canceled(&self, reason: CancelReason, removing: bool);

    fn link_status(&self, status: LinkStatus);
}

// ============================================================================
// Device
// ============================================================================

/// One entry of the registry device table.
pub(crate) struct Device {
    pub(crate) info: DeviceInfo,
    pub(crate) backend: BackendId,
    pub(crate) state: DeviceState,
    pub(crate) connection: Option<DeviceConnection>,
    pub(crate) pipe: Option<FramePipe>,
    pub(crate) cmd_itf: Option<CommandInterface>,
    pub(crate) events: Option<Arc<dyn DeviceEvents>>,
}

impl Device {
    pub(crate) fn new(info: DeviceInfo, backend: BackendId) -> Self {
        Self {
            info,
            backend,
            state: DeviceState::Idle,
            connection: None,
            pipe: None,
            cmd_itf: None,
            events: None,
        }
    }

    /// Returns `true` if `conn` is this device's connection, claiming it
    /// if none is recorded yet.
    fn claim(&mut self, conn: &DeviceConnection) -> bool {
        match &self.connection {
            Some(current) => current.ptr_eq(conn),
            None => {
                self.connection = Some(conn.clone());
                true
            }
        }
    }
}

// ============================================================================
// DeviceConnEvents
// ============================================================================

/// Connection sink bound to one device slot.
pub(crate) struct DeviceConnEvents {
    registry: WeakRegistry,
    handle: DeviceHandle,
}

impl DeviceConnEvents {
    pub(crate) fn new(registry: WeakRegistry, handle: DeviceHandle) -> Self {
        Self { registry, handle }
    }

    /// Clears the slot after the connection closed and forwards with the
    /// removal flag.
    fn closed(&self, conn: &DeviceConnection, forward: impl FnOnce(&dyn DeviceEvents, bool)) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        let (removing, cmd_itf, events) = {
            let mut state = registry.inner.state.lock();
            let Some(device) = state.devices.get_mut(&self.handle) else {
                debug!(device = %self.handle, "Connection closed for a removed device");
                return;
            };
            if !device.claim(conn) {
                warn!(device = %self.handle, conn = %conn.id(), "Close of a stale connection ignored");
                return;
            }
            let removing = device.state == DeviceState::Removing;
            if !removing {
                device.state = DeviceState::Idle;
            }
            device.connection = None;
            device.pipe = None;
            (removing, device.cmd_itf.take(), device.events.take())
        };

        if let Some(cmd_itf) = cmd_itf {
            cmd_itf.close();
        }
        if let Some(events) = events {
            forward(events.as_ref(), removing);
        }
        if removing {
            registry.finish_removal(self.handle);
        }
    }

    fn events(&self, conn: &DeviceConnection) -> Option<Arc<dyn DeviceEvents>> {
        let registry = self.registry.upgrade()?;
        let mut state = registry.inner.state.lock();
        let device = state.devices.get_mut(&self.handle)?;
        if !device.claim(conn) {
            warn!(device = %self.handle, conn = %conn.id(), "Event from a stale connection ignored");
            return None;
        }
        device.events.clone()
    }
}

impl ConnectionEvents for DeviceConnEvents {
    fn connecting(&self, conn: &DeviceConnection) {
        if let Some(events) = self.events(conn) {
            events.connecting();
        }
    }

    fn connected(&self, conn: &DeviceConnection, pipe: &FramePipe, api: DeviceApi) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        let events = {
            let mut state = registry.inner.state.lock();
            let Some(device) = state.devices.get_mut(&self.handle) else {
                return;
            };
            if !device.claim(conn) {
                warn!(device = %self.handle, conn = %conn.id(), "Connected from a stale connection ignored");
                return;
            }
            if device.state != DeviceState::Removing {
                device.state = DeviceState::Connected;
            }
            device.info.api = api;
            device.pipe = Some(pipe.clone());
            device.events.clone()
        };

        debug!(device = %self.handle, ?api, "Device connected");
        if let Some(events) = events {
            events.connected(api);
        }
    }

    fn disconnected(&self, conn: &DeviceConnection) {
        debug!(device = %self.handle, "Device disconnected");
        self.closed(conn, |events, removing| events.disconnected(removing));
    }

    fn canceled(&self, conn: &DeviceConnection, reason: CancelReason) {
        debug!(device = %self.handle, ?reason, "Device connection canceled");
        self.closed(conn, |events, removing| events.canceled(reason, removing));
    }

    fn link_status(&self, conn: &DeviceConnection, status: LinkStatus) {
        if let Some(events) = self.events(conn) {
            events.link_status(status);
        }
    }
}

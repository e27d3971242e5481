//! Device controller.
//!
//! A [`DeviceController`] is the upper layer's handle on one registered
//! device: it connects and disconnects it, sends commands once connected,
//! and drives the non-ack command timer.
//!
//! # Notifications
//!
//! | Event | Listener call |
//! |-------|---------------|
//! | attempt started | [`DeviceListener::connecting`] |
//! | connected | command interface created, then [`DeviceListener::connected`] |
//! | disconnected | timer stopped, then [`DeviceListener::disconnected`] |
//! | attempt canceled | timer stopped, then [`DeviceListener::connection_canceled`] |
//! | link down | timer stopped, then [`DeviceListener::link_status_changed`] |
//! | inbound command | [`DeviceListener::command_received`] |
//! | timer tick | [`DeviceListener::no_ack_cmd_timer_tick`] |
//!
//! The listener is expected to send its best-effort commands from the
//! tick callback. The controller does not buffer them.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::device::{CancelReason, DeviceApi, DeviceInfo, DeviceState, LinkStatus};
use crate::error::{Error, Result};
use crate::identifiers::{DeviceHandle, OsData};
use crate::protocol::Command;
use crate::registry::{DeviceEvents, Registry};
use crate::transport::{CommandListener, PeriodicTimer};

// ============================================================================
// DeviceListener
// ============================================================================

/// Upper-layer receiver of device notifications.
pub trait DeviceListener: Send + Sync {
    /// Connection attempt started.
    fn connecting(&self) {}

    /// Device connected; commands can be sent.
    fn connected(&self, api: DeviceApi);

    /// Device disconnected. `removing` is set when the device is being
    /// removed from the registry.
    fn disconnected(&self, removing: bool);

    /// Connection attempt canceled.
    fn connection_canceled(&self, reason: CancelReason, removing: bool);

    /// Link status changed.
    fn link_status_changed(&self, _status: LinkStatus) {}

    /// Command received from the device.
    fn command_received(&self, command: &Command);

    /// Time to send the pending non-ack commands.
    fn no_ack_cmd_timer_tick(&self) {}
}

// ============================================================================
// DeviceController
// ============================================================================

/// Upper-layer handle on one device.
pub struct DeviceController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    handle: DeviceHandle,
    registry: Registry,
    listener: Arc<dyn DeviceListener>,
    userdata: Mutex<Option<OsData>>,
    timer: Mutex<Option<PeriodicTimer>>,
}

// ============================================================================
// DeviceController - Public API
// ============================================================================

impl DeviceController {
    /// Creates a controller for a registered device.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceNotFound`] if the handle is unknown.
    pub fn create(
        registry: &Registry,
        handle: DeviceHandle,
        listener: Arc<dyn DeviceListener>,
        userdata: Option<OsData>,
    ) -> Result<Self> {
        registry.get_device(handle)?;
        debug!(device = %handle, "Device controller created");

        Ok(Self {
            inner: Arc::new(ControllerInner {
                handle,
                registry: registry.clone(),
                listener,
                userdata: Mutex::new(userdata),
                timer: Mutex::new(None),
            }),
        })
    }

    /// Returns the device handle.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> DeviceHandle {
        self.inner.handle
    }

    /// Returns the device info.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceNotFound`] if the device was removed.
    pub fn info(&self) -> Result<DeviceInfo> {
        self.inner.registry.get_device(self.inner.handle)
    }

    /// Starts connecting the device.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if the device was removed
    /// - [`Error::Busy`] if a connection already exists
    /// - The backend error
    pub fn connect(&self) -> Result<()> {
        let events = Arc::new(ControllerEvents(Arc::downgrade(&self.inner)));
        self.inner
            .registry
            .connect_device(self.inner.handle, events)
            .inspect_err(|e| {
                warn!(device = %self.inner.handle, error = %e, "Connect failed");
            })
    }

    /// Sends a command to the connected device.
    ///
    /// # Errors
    ///
    /// - [`Error::NoCommandInterface`] if the device is not connected
    /// - The transport error
    pub fn send_command(&self, command: &Command) -> Result<()> {
        self.inner
            .registry
            .command_interface(self.inner.handle)?
            .send(command)
    }

    /// Starts the non-ack command timer.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `period_ms` is zero
    /// - [`Error::Busy`] if the timer is already running; the running timer
    ///   is left untouched
    pub fn start_no_ack_cmd_timer(&self, period_ms: u32) -> Result<()> {
        if period_ms == 0 {
            return Err(Error::invalid_argument("non-ack timer period must be non-zero"));
        }

        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            warn!(device = %self.inner.handle, "Non-ack timer already running");
            return Err(Error::busy("non-ack timer already running"));
        }

        let weak: Weak<ControllerInner> = Arc::downgrade(&self.inner);
        let periodic = self.inner.registry.event_loop().periodic(
            Duration::from_millis(u64::from(period_ms)),
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.listener.no_ack_cmd_timer_tick();
                }
            },
        )?;
        *timer = Some(periodic);

        debug!(device = %self.inner.handle, period_ms, "Non-ack timer started");
        Ok(())
    }

    /// Stops the non-ack command timer.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no timer is running.
    pub fn stop_no_ack_cmd_timer(&self) -> Result<()> {
        if self.inner.stop_timer() {
            Ok(())
        } else {
            Err(Error::not_found("non-ack timer"))
        }
    }

    /// Returns `true` while the non-ack timer runs.
    #[must_use]
    pub fn no_ack_cmd_timer_running(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    /// Requests disconnection. Stops the non-ack timer first.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if the device was removed
    /// - [`Error::ConnectionNotFound`] if the device is not connected
    /// - The backend error
    pub fn disconnect(&self) -> Result<()> {
        self.inner.stop_timer();
        self.inner.registry.disconnect_device(self.inner.handle)
    }

    /// Returns the upper-layer handle of the device's backend.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceNotFound`] if the device was removed.
    pub fn backend_osdata(&self) -> Result<Option<OsData>> {
        self.inner.registry.backend_osdata(self.inner.handle)
    }

    /// Destroys the controller and returns its userdata.
    ///
    /// Stops the non-ack timer. A device still connected or connecting is
    /// disconnected first.
    ///
    /// # Errors
    ///
    /// The backend error if the connection could not be closed.
    pub fn destroy(self) -> Result<Option<OsData>> {
        self.inner.stop_timer();

        let handle = self.inner.handle;
        if let Ok(state) = self.inner.registry.device_state(handle)
            && matches!(state, DeviceState::Connecting | DeviceState::Connected)
        {
            warn!(device = %handle, ?state, "Device controller destroyed while connected");
            self.inner.registry.disconnect_device(handle)?;
        }

        debug!(device = %handle, "Device controller destroyed");
        Ok(self.inner.userdata.lock().take())
    }
}

impl fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceController")
            .field("handle", &self.inner.handle)
            .field("timer_running", &self.no_ack_cmd_timer_running())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ControllerInner
// ============================================================================

impl ControllerInner {
    /// Returns `true` if a timer was running.
    fn stop_timer(&self) -> bool {
        let timer = self.timer.lock().take();
        match timer {
            Some(mut timer) => {
                timer.clear();
                debug!(device = %self.handle, "Non-ack timer stopped");
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Event Adapters
// ============================================================================

struct ControllerEvents(Weak<ControllerInner>);

impl DeviceEvents for ControllerEvents {
    fn connecting(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.listener.connecting();
        }
    }

    fn connected(&self, api: DeviceApi) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };

        let commands = Arc::new(ControllerCommands(Arc::downgrade(&inner)));
        if let Err(e) = inner.registry.create_command_interface(inner.handle, commands) {
            error!(device = %inner.handle, error = %e, "Failed to create command interface");
        }
        inner.listener.connected(api);
    }

    fn disconnected(&self, removing: bool) {
        if let Some(inner) = self.0.upgrade() {
            inner.stop_timer();
            inner.listener.disconnected(removing);
        }
    }

    fn canceled(&self, reason: CancelReason, removing: bool) {
        if let Some(inner) = self.0.upgrade() {
            inner.stop_timer();
            inner.listener.connection_canceled(reason, removing);
        }
    }

    fn link_status(&self, status: LinkStatus) {
        if let Some(inner) = self.0.upgrade() {
            if status == LinkStatus::Down {
                inner.stop_timer();
            }
            inner.listener.link_status_changed(status);
        }
    }
}

struct ControllerCommands(Weak<ControllerInner>);

impl CommandListener for ControllerCommands {
    fn command_received(&self, command: &Command) {
        if let Some(inner) = self.0.upgrade() {
            inner.listener.command_received(command);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Device registry.
//!
//! The [`Registry`] is the root object of the control plane. It owns the
//! event loop handle, the registered backends and discovery sources, and
//! the table of discovered devices keyed by [`DeviceHandle`].
//!
//! Backends, discoveries and connections only hold weak references back to
//! the registry.
//!
//! # Lifecycle
//!
//! | Step | Operation |
//! |------|-----------|
//! | 1 | [`Registry::builder`] / [`Registry::create`] |
//! | 2 | Backends and discoveries register themselves |
//! | 3 | Discoveries add and remove devices |
//! | 4 | [`Registry::destroy`] once no device is connected |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendKind, ConnectConfig, MuxChannel};
use crate::device::{DeviceInfo, DeviceState, DeviceType};
use crate::error::{Error, Result};
use crate::identifiers::{BackendId, DeviceHandle, DiscoveryId, OsData};
use crate::protocol::CommandLogConfig;
use crate::transport::{
    CommandInterface, CommandListener, ConnectionState, EventLoop, ProxyListener, TcpProxy,
};

use super::builder::RegistryBuilder;
use super::device::{Device, DeviceConnEvents, DeviceEvents};
use super::options::{RegistryOptions, UserAgent};

// ============================================================================
// RegistryListener
// ============================================================================

/// Receiver of device table changes.
pub trait RegistryListener: Send + Sync {
    /// A device was discovered.
    fn device_added(&self, handle: DeviceHandle, info: &DeviceInfo);

    /// A device was removed.
    fn device_removed(&self, handle: DeviceHandle);
}

// ============================================================================
// Types
// ============================================================================

/// Shared registry state.
pub(crate) struct RegistryInner {
    event_loop: EventLoop,
    listener: Arc<dyn RegistryListener>,
    command_log: Arc<CommandLogConfig>,
    pub(crate) state: Mutex<RegistryState>,
}

pub(crate) struct RegistryState {
    closed: bool,
    userdata: Option<OsData>,
    user_agent: UserAgent,
    video_decoding: bool,
    next_handle: u16,
    pub(crate) devices: FxHashMap<DeviceHandle, Device>,
    backends: FxHashMap<BackendId, Arc<dyn Backend>>,
    discoveries: FxHashSet<DiscoveryId>,
}

impl RegistryState {
    /// Allocates the next free handle, from 1 upward, wrapping.
    fn allocate_handle(&mut self) -> Result<DeviceHandle> {
        let start = self.next_handle;
        let mut candidate = start;
        loop {
            let next = match candidate.wrapping_add(1) {
                0 => 1,
                n => n,
            };
            if let Some(handle) = DeviceHandle::new(candidate)
                && !self.devices.contains_key(&handle)
            {
                self.next_handle = next;
                return Ok(handle);
            }
            candidate = next;
            if candidate == start {
                return Err(Error::resource_exhausted("no free device handle"));
            }
        }
    }

    fn device(&self, handle: DeviceHandle) -> Result<&Device> {
        self.devices
            .get(&handle)
            .ok_or(Error::DeviceNotFound { handle })
    }

    fn backend_of(&self, device: &Device) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(&device.backend)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("backend {}", device.backend)))
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Root object owning backends, discoveries and discovered devices.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Registry {
    pub(crate) inner: Arc<RegistryInner>,
}

/// Non-owning registry reference held by backends and connections.
#[derive(Clone)]
pub struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    /// Returns the registry if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Registry> {
        self.0.upgrade().map(|inner| Registry { inner })
    }
}

impl fmt::Debug for WeakRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRegistry")
            .field("alive", &(self.0.strong_count() > 0))
            .finish()
    }
}

// ============================================================================
// Registry - Construction
// ============================================================================

impl Registry {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Creates a registry with default options on the current event loop.
    ///
    /// # Errors
    ///
    /// [`Error::EventLoopUnavailable`] outside a tokio runtime.
    pub fn create(listener: Arc<dyn RegistryListener>, userdata: Option<OsData>) -> Result<Self> {
        let builder = Self::builder().listener(listener);
        match userdata {
            Some(userdata) => builder.userdata(userdata).build(),
            None => builder.build(),
        }
    }

    pub(crate) fn new(
        options: RegistryOptions,
        event_loop: EventLoop,
        listener: Arc<dyn RegistryListener>,
        userdata: Option<OsData>,
    ) -> Self {
        info!(
            controller_type = %options.user_agent.controller_type,
            controller_name = %options.user_agent.controller_name,
            "Registry created"
        );

        Self {
            inner: Arc::new(RegistryInner {
                event_loop,
                listener,
                command_log: Arc::new(CommandLogConfig::new(options.command_log_level)),
                state: Mutex::new(RegistryState {
                    closed: false,
                    userdata,
                    user_agent: options.user_agent,
                    video_decoding: options.video_decoding,
                    next_handle: 1,
                    devices: FxHashMap::default(),
                    backends: FxHashMap::default(),
                    discoveries: FxHashSet::default(),
                }),
            }),
        }
    }

    /// Returns a non-owning reference.
    #[inline]
    #[must_use]
    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }

    /// Destroys the registry and returns the creation-time userdata.
    ///
    /// Backends, discoveries and devices are released. The registry rejects
    /// every later registration.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] while any device has a connection.
    pub fn destroy(&self) -> Result<Option<OsData>> {
        let (userdata, backends, devices) = {
            let mut state = self.inner.state.lock();
            if let Some((handle, _)) = state.devices.iter().find(|(_, d)| d.connection.is_some()) {
                warn!(device = %handle, "Registry destroyed while a device is connected");
                return Err(Error::busy(format!("device {handle} still connected")));
            }
            state.closed = true;
            state.discoveries.clear();
            (
                state.userdata.take(),
                mem::take(&mut state.backends),
                mem::take(&mut state.devices),
            )
        };

        drop(devices);
        drop(backends);
        info!("Registry destroyed");
        Ok(userdata)
    }
}

// ============================================================================
// Registry - Configuration
// ============================================================================

impl Registry {
    /// Returns the event loop.
    #[inline]
    #[must_use]
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// Returns the command tracing configuration.
    #[inline]
    #[must_use]
    pub fn command_log(&self) -> &Arc<CommandLogConfig> {
        &self.inner.command_log
    }

    /// Returns the controller identity.
    #[must_use]
    pub fn user_agent(&self) -> UserAgent {
        self.inner.state.lock().user_agent.clone()
    }

    /// Sets the controller identity used by later connections.
    pub fn set_user_agent(&self, user_agent: UserAgent) {
        debug!(
            controller_type = %user_agent.controller_type,
            controller_name = %user_agent.controller_name,
            "User agent set"
        );
        self.inner.state.lock().user_agent = user_agent;
    }

    /// Returns `true` if video decoding is enabled.
    #[must_use]
    pub fn video_decoding_enabled(&self) -> bool {
        self.inner.state.lock().video_decoding
    }

    /// Enables or disables video decoding.
    pub fn enable_video_decoding(&self, enabled: bool) {
        self.inner.state.lock().video_decoding = enabled;
    }
}

// ============================================================================
// Registry - Devices
// ============================================================================

impl Registry {
    /// Returns the info of a device.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceNotFound`] if the handle is unknown. Devices can
    /// vanish at any time, so this is an expected outcome.
    pub fn get_device(&self, handle: DeviceHandle) -> Result<DeviceInfo> {
        Ok(self.inner.state.lock().device(handle)?.info.clone())
    }

    /// Returns the connection state of a device.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceNotFound`] if the handle is unknown.
    pub fn device_state(&self, handle: DeviceHandle) -> Result<DeviceState> {
        Ok(self.inner.state.lock().device(handle)?.state)
    }

    /// Returns the handles of all devices, sorted.
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceHandle> {
        let mut handles: Vec<_> = self.inner.state.lock().devices.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Adds a device reachable through `backend` and notifies the listener.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the registry is destroyed or the backend
    ///   unknown
    /// - [`Error::ResourceExhausted`] if no handle is free
    pub fn add_device(&self, info: DeviceInfo, backend: BackendId) -> Result<DeviceHandle> {
        let handle = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::not_found("registry"));
            }
            if !state.backends.contains_key(&backend) {
                return Err(Error::not_found(format!("backend {backend}")));
            }
            let handle = state.allocate_handle()?;
            state.devices.insert(handle, Device::new(info.clone(), backend));
            handle
        };

        info!(device = %handle, id = %info.id, name = %info.name, device_type = %info.device_type, "Device added");
        self.inner.listener.device_added(handle, &info);
        Ok(handle)
    }

    /// Removes a device and notifies the listener.
    ///
    /// A connected device is marked [`DeviceState::Removing`] and its
    /// connection closed first; the listener is notified once the
    /// connection is closed.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceNotFound`] if the handle is unknown.
    pub fn remove_device(&self, handle: DeviceHandle) -> Result<()> {
        let closing = {
            let mut state = self.inner.state.lock();
            let device = state.device(handle)?;

            match (&device.connection, device.state) {
                (_, DeviceState::Removing) => {
                    debug!(device = %handle, "Device removal already in progress");
                    return Ok(());
                }
                (Some(conn), _) => {
                    let conn = conn.clone();
                    let backend = state.backend_of(device)?;
                    if let Some(device) = state.devices.get_mut(&handle) {
                        device.state = DeviceState::Removing;
                    }
                    Some((backend, conn))
                }
                (None, _) => None,
            }
        };

        match closing {
            Some((backend, conn)) => {
                debug!(device = %handle, conn = %conn.id(), "Closing connection of removed device");
                if let Err(e) = backend.stop_device_conn(handle, &conn) {
                    warn!(device = %handle, error = %e, "Failed to close connection of removed device");
                    self.finish_removal(handle);
                }
            }
            None => self.finish_removal(handle),
        }
        Ok(())
    }

    /// Drops a device entry and notifies the listener, once.
    pub(crate) fn finish_removal(&self, handle: DeviceHandle) {
        let removed = self.inner.state.lock().devices.remove(&handle);
        let Some(device) = removed else {
            return;
        };

        info!(device = %handle, id = %device.info.id, "Device removed");
        drop(device);
        self.inner.listener.device_removed(handle);
    }

    /// Starts connecting a device; notifications go to `events`.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if the handle is unknown
    /// - [`Error::Busy`] if the device is not idle
    /// - The backend error
    pub(crate) fn connect_device(
        &self,
        handle: DeviceHandle,
        events: Arc<dyn DeviceEvents>,
    ) -> Result<()> {
        let (backend, info, config) = {
            let mut state = self.inner.state.lock();
            let config = ConnectConfig::from(&state.user_agent);
            let device = state.device(handle)?;
            if device.state != DeviceState::Idle {
                return Err(Error::busy(format!(
                    "device {handle} is {:?}",
                    device.state
                )));
            }
            let backend = state.backend_of(device)?;
            let info = device.info.clone();
            if let Some(device) = state.devices.get_mut(&handle) {
                device.state = DeviceState::Connecting;
                device.events = Some(events);
            }
            (backend, info, config)
        };

        debug!(device = %handle, backend = %backend.id(), kind = %backend.kind(), "Connecting device");
        let sink = Arc::new(DeviceConnEvents::new(self.downgrade(), handle));
        let result =
            backend.start_device_conn(handle, &info, &config, sink, &self.inner.event_loop);

        let mut state = self.inner.state.lock();
        let Some(device) = state.devices.get_mut(&handle) else {
            return result.map(drop);
        };
        match result {
            Ok(conn) => {
                if device.connection.is_none()
                    && device.state != DeviceState::Idle
                    && conn.state() != ConnectionState::Closed
                {
                    device.connection = Some(conn);
                }
                Ok(())
            }
            Err(e) => {
                warn!(device = %handle, error = %e, "Failed to start connection");
                if device.connection.is_none() {
                    device.state = DeviceState::Idle;
                    device.events = None;
                }
                Err(e)
            }
        }
    }

    /// Requests closing of a device connection.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if the handle is unknown
    /// - [`Error::ConnectionNotFound`] if the device has no connection
    /// - The backend error
    pub fn disconnect_device(&self, handle: DeviceHandle) -> Result<()> {
        let (backend, conn) = {
            let state = self.inner.state.lock();
            let device = state.device(handle)?;
            let conn = device
                .connection
                .clone()
                .ok_or(Error::ConnectionNotFound { handle })?;
            (state.backend_of(device)?, conn)
        };

        debug!(device = %handle, conn = %conn.id(), "Disconnecting device");
        backend.stop_device_conn(handle, &conn)
    }

    /// Creates the command interface of a connected device.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if the handle is unknown
    /// - [`Error::Protocol`] if the device is not connected
    /// - [`Error::Busy`] if an interface already exists
    pub fn create_command_interface(
        &self,
        handle: DeviceHandle,
        listener: Arc<dyn CommandListener>,
    ) -> Result<CommandInterface> {
        let mut state = self.inner.state.lock();
        let device = state
            .devices
            .get_mut(&handle)
            .ok_or(Error::DeviceNotFound { handle })?;
        if device.cmd_itf.is_some() {
            return Err(Error::busy(format!("device {handle} already has a command interface")));
        }
        let pipe = device
            .pipe
            .clone()
            .ok_or_else(|| Error::protocol(format!("device {handle} is not connected")))?;

        let itf = CommandInterface::new(
            handle,
            pipe,
            self.inner.event_loop.clone(),
            listener,
            Arc::clone(&self.inner.command_log),
        );
        device.cmd_itf = Some(itf.clone());
        Ok(itf)
    }

    /// Returns the command interface of a device.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if the handle is unknown
    /// - [`Error::NoCommandInterface`] if the device has none
    pub fn command_interface(&self, handle: DeviceHandle) -> Result<CommandInterface> {
        self.inner
            .state
            .lock()
            .device(handle)?
            .cmd_itf
            .clone()
            .ok_or(Error::NoCommandInterface { handle })
    }

    /// Opens a TCP proxy through a connected device.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if the handle is unknown
    /// - [`Error::Protocol`] if the device is not connected
    /// - [`Error::NotImplemented`] if the backend cannot proxy
    pub fn create_tcp_proxy(
        &self,
        handle: DeviceHandle,
        device_type: DeviceType,
        remote_port: u16,
        listener: Arc<dyn ProxyListener>,
    ) -> Result<TcpProxy> {
        let backend = {
            let state = self.inner.state.lock();
            let device = state.device(handle)?;
            if device.state != DeviceState::Connected {
                return Err(Error::protocol(format!("device {handle} is not connected")));
            }
            state.backend_of(device)?
        };
        backend.create_tcp_proxy(handle, device_type, remote_port, listener)
    }

    /// Returns the multiplexed channel of a device's backend.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if the handle is unknown
    /// - [`Error::NotImplemented`] if the backend is not multiplexed
    pub fn mux_channel(&self, handle: DeviceHandle) -> Result<Arc<dyn MuxChannel>> {
        let backend = {
            let state = self.inner.state.lock();
            let device = state.device(handle)?;
            state.backend_of(device)?
        };
        backend.mux_channel().ok_or_else(|| {
            Error::not_implemented(format!("{} backend has no MUX channel", backend.kind()))
        })
    }

    /// Returns the upper-layer handle of a device's backend.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceNotFound`] if the handle is unknown.
    pub fn backend_osdata(&self, handle: DeviceHandle) -> Result<Option<OsData>> {
        let state = self.inner.state.lock();
        let device = state.device(handle)?;
        Ok(state.backend_of(device)?.osdata())
    }
}

// ============================================================================
// Registry - Backends & Discoveries
// ============================================================================

impl Registry {
    /// Registers a backend.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the registry is destroyed
    /// - [`Error::Busy`] if the backend id is already registered
    pub fn register_backend(&self, backend: Arc<dyn Backend>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Error::not_found("registry"));
        }
        let id = backend.id();
        if state.backends.contains_key(&id) {
            return Err(Error::busy(format!("backend {id} already registered")));
        }
        debug!(backend = %id, kind = %backend.kind(), "Backend registered");
        state.backends.insert(id, backend);
        Ok(())
    }

    /// Unregisters a backend.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the backend is unknown
    /// - [`Error::Busy`] while it has live connections
    pub fn unregister_backend(&self, id: BackendId) -> Result<()> {
        let removed = {
            let mut state = self.inner.state.lock();
            let backend = state
                .backends
                .get(&id)
                .ok_or_else(|| Error::not_found(format!("backend {id}")))?;
            let live = backend.live_connections();
            if live > 0 {
                warn!(backend = %id, live, "Backend unregistered with live connections");
                return Err(Error::busy(format!("backend {id} has {live} live connections")));
            }
            state.backends.remove(&id)
        };

        drop(removed);
        debug!(backend = %id, "Backend unregistered");
        Ok(())
    }

    /// Returns the kind of a registered backend.
    #[must_use]
    pub fn backend_kind(&self, id: BackendId) -> Option<BackendKind> {
        self.inner.state.lock().backends.get(&id).map(|b| b.kind())
    }

    /// Returns the number of registered backends.
    #[must_use]
    pub fn backend_count(&self) -> usize {
        self.inner.state.lock().backends.len()
    }

    /// Registers a discovery source.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the registry is destroyed
    /// - [`Error::Busy`] if the id is already registered
    pub fn register_discovery(&self, id: DiscoveryId) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Error::not_found("registry"));
        }
        if !state.discoveries.insert(id) {
            return Err(Error::busy(format!("discovery {id} already registered")));
        }
        Ok(())
    }

    /// Unregisters a discovery source. Unknown ids are ignored.
    pub fn unregister_discovery(&self, id: DiscoveryId) {
        self.inner.state.lock().discoveries.remove(&id);
    }

    /// Returns the number of registered discovery sources.
    #[must_use]
    pub fn discovery_count(&self) -> usize {
        self.inner.state.lock().discoveries.len()
    }

    /// Returns `true` once destroyed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Registry")
            .field("devices", &state.devices.len())
            .field("backends", &state.backends.len())
            .field("discoveries", &state.discoveries.len())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::backend::NetBackend;
    use crate::device::DeviceApi;
    use crate::protocol::CommandLogLevel;
    use crate::testing::{self, MockNetConnector, RecordingDeviceEvents, RecordingLink};

    fn net_backend(registry: &Registry) -> (Arc<NetBackend>, Arc<MockNetConnector>) {
        let connector = MockNetConnector::new();
        let backend = NetBackend::create(registry, connector.clone(), 43210, Some(Arc::new(5_u8)))
            .expect("net backend");
        (backend, connector)
    }

    fn add(registry: &Registry, backend: &NetBackend, id: &str) -> DeviceHandle {
        registry
            .add_device(testing::net_info(id, DeviceType::ANAFI_4K), backend.id())
            .expect("add device")
    }

    #[tokio::test]
    async fn test_handles_allocated_from_one() {
        let (registry, listener) = testing::registry();
        let (backend, _) = net_backend(&registry);

        let first = add(&registry, &backend, "A");
        let second = add(&registry, &backend, "B");

        assert_eq!(first.raw(), 1);
        assert_eq!(second.raw(), 2);
        assert_eq!(listener.added(), vec![first, second]);
        assert_eq!(registry.devices(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_handle_allocation_skips_in_use_and_invalid() {
        let (registry, _) = testing::registry();
        let (backend, _) = net_backend(&registry);
        let first = add(&registry, &backend, "A");

        registry.inner.state.lock().next_handle = 0xFFFE;
        let last = add(&registry, &backend, "B");
        let wrapped = add(&registry, &backend, "C");

        assert_eq!(last.raw(), 0xFFFE);
        assert_ne!(wrapped, first);
        assert_eq!(wrapped.raw(), 2);
    }

    #[tokio::test]
    async fn test_get_unknown_device() {
        let (registry, _) = testing::registry();
        let err = registry.get_device(testing::handle(42)).unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound { .. }));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_unknown_device_rejected() {
        let (registry, listener) = testing::registry();
        assert!(registry.remove_device(testing::handle(9)).is_err());
        assert!(listener.removed().is_empty());
    }

    #[tokio::test]
    async fn test_add_to_unknown_backend_rejected() {
        let (registry, listener) = testing::registry();
        let result = registry.add_device(
            testing::net_info("A", DeviceType::ANAFI_4K),
            BackendId::next(),
        );
        assert!(result.unwrap_err().is_not_found());
        assert!(listener.added().is_empty());
    }

    #[tokio::test]
    async fn test_remove_connected_device_closes_first() {
        let (registry, listener) = testing::registry();
        let (backend, connector) = net_backend(&registry);
        let handle = add(&registry, &backend, "ABC123");
        let events = RecordingDeviceEvents::new();

        registry.connect_device(handle, events.clone()).expect("connect");
        let (conn, _, _) = connector.last_open().expect("open requested");
        backend
            .complete_handshake(&conn, br#"{"status":0}"#, RecordingLink::new())
            .expect("handshake");

        registry.remove_device(handle).expect("remove");

        assert_eq!(events.take(), ["connecting", "connected:Full", "disconnected:true"]);
        assert_eq!(listener.removed(), vec![handle]);
        assert!(registry.get_device(handle).is_err());
    }

    #[tokio::test]
    async fn test_connect_busy_when_not_idle() {
        let (registry, _) = testing::registry();
        let (backend, _) = net_backend(&registry);
        let handle = add(&registry, &backend, "A");

        registry
            .connect_device(handle, RecordingDeviceEvents::new())
            .expect("connect");
        let err = registry
            .connect_device(handle, RecordingDeviceEvents::new())
            .unwrap_err();
        assert!(err.is_busy());
        assert_eq!(registry.device_state(handle).expect("state"), DeviceState::Connecting);
    }

    #[tokio::test]
    async fn test_connect_failure_resets_device() {
        let (registry, _) = testing::registry();
        let (backend, connector) = net_backend(&registry);
        let handle = add(&registry, &backend, "A");
        connector.fail_next_open();

        assert!(
            registry
                .connect_device(handle, RecordingDeviceEvents::new())
                .is_err()
        );
        assert_eq!(registry.device_state(handle).expect("state"), DeviceState::Idle);
        assert_eq!(backend.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let (registry, _) = testing::registry();
        let (backend, _) = net_backend(&registry);
        let handle = add(&registry, &backend, "A");

        let err = registry.disconnect_device(handle).unwrap_err();
        assert!(matches!(err, Error::ConnectionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_command_interface_lifecycle() {
        let (registry, _) = testing::registry();
        let (backend, connector) = net_backend(&registry);
        let handle = add(&registry, &backend, "A");

        assert!(matches!(
            registry.command_interface(handle),
            Err(Error::NoCommandInterface { .. })
        ));

        registry
            .connect_device(handle, RecordingDeviceEvents::new())
            .expect("connect");
        let (conn, _, _) = connector.last_open().expect("open requested");
        backend
            .complete_handshake(&conn, br#"{"status":0}"#, RecordingLink::new())
            .expect("handshake");

        let commands = testing::RecordingCommands::new();
        let itf = registry
            .create_command_interface(handle, commands.clone())
            .expect("interface");
        assert!(
            registry
                .create_command_interface(handle, commands)
                .unwrap_err()
                .is_busy()
        );

        registry.disconnect_device(handle).expect("disconnect");
        assert!(itf.is_closed());
        assert!(registry.command_interface(handle).is_err());
        assert_eq!(registry.device_state(handle).expect("state"), DeviceState::Idle);
        assert_eq!(registry.get_device(handle).expect("info").api, DeviceApi::Full);
    }

    #[tokio::test]
    async fn test_unregister_backend_with_live_connection() {
        let (registry, _) = testing::registry();
        let (backend, _) = net_backend(&registry);
        let handle = add(&registry, &backend, "A");
        registry
            .connect_device(handle, RecordingDeviceEvents::new())
            .expect("connect");

        assert!(registry.unregister_backend(backend.id()).unwrap_err().is_busy());

        registry.disconnect_device(handle).expect("disconnect");
        registry.unregister_backend(backend.id()).expect("unregister");
        assert_eq!(registry.backend_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_osdata_lookup() {
        let (registry, _) = testing::registry();
        let (backend, _) = net_backend(&registry);
        let handle = add(&registry, &backend, "A");

        let osdata = registry.backend_osdata(handle).expect("lookup").expect("osdata");
        assert_eq!(osdata.downcast_ref::<u8>(), Some(&5));
    }

    #[tokio::test]
    async fn test_net_backend_has_no_mux_channel() {
        let (registry, _) = testing::registry();
        let (backend, _) = net_backend(&registry);
        let handle = add(&registry, &backend, "A");

        assert!(matches!(
            registry.mux_channel(handle),
            Err(Error::NotImplemented { .. })
        ));
    }

    #[tokio::test]
    async fn test_destroy_busy_while_connected() {
        let (registry, _) = testing::registry();
        let (backend, _) = net_backend(&registry);
        let handle = add(&registry, &backend, "A");
        registry
            .connect_device(handle, RecordingDeviceEvents::new())
            .expect("connect");

        assert!(registry.destroy().unwrap_err().is_busy());

        registry.disconnect_device(handle).expect("disconnect");
        registry.destroy().expect("destroy");
        assert!(registry.is_closed());
    }

    #[tokio::test]
    async fn test_destroy_returns_userdata() {
        let registry = Registry::create(
            testing::RecordingRegistryListener::new(),
            Some(Arc::new("ui-registry")),
        )
        .expect("create");

        let userdata = registry.destroy().expect("destroy").expect("userdata");
        assert_eq!(userdata.downcast_ref::<&str>(), Some(&"ui-registry"));
        assert!(registry.register_discovery(DiscoveryId::next()).is_err());
    }

    #[tokio::test]
    async fn test_runtime_configuration() {
        let (registry, _) = testing::registry();

        registry.set_user_agent(UserAgent::new("ios", "FreeFlight"));
        registry.enable_video_decoding(true);
        registry.command_log().set_level(CommandLogLevel::Ack);

        assert_eq!(registry.user_agent().controller_name, "FreeFlight");
        assert!(registry.video_decoding_enabled());
        assert_eq!(registry.command_log().level(), CommandLogLevel::Ack);
    }
}

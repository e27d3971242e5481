//! MUX backend.
//!
//! The MUX transport tunnels several logical channels (device control,
//! proxied TCP) over a single file descriptor, typically a USB link to a
//! remote controller relaying a drone.
//!
//! Creating a [`MuxBackend`] opens the multiplexed channel, registers the
//! backend and creates its discovery source. Any failing step rolls back
//! the previous ones: nothing stays registered and the channel is released.
//!
//! # Channel Callbacks
//!
//! | Callback | Effect |
//! |----------|--------|
//! | `on_eof` | Live connections are torn down, then the EOF handler runs |
//! | `on_release` | The upper-layer handle is dropped |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::device::{CancelReason, DeviceInfo, DeviceType, LinkStatus};
use crate::error::{Error, Result};
use crate::identifiers::{BackendId, DeviceHandle, OsData};
use crate::protocol::FrameHeader;
use crate::registry::{Registry, WeakRegistry};
use crate::transport::{
    ConnectionEvents, ConnectionState, DeviceConnection, EventLoop, FrameLink, ProxyListener,
    TcpProxy,
};

use super::discovery::Discovery;
use super::{Backend, BackendKind, ConnectConfig, LiveConnections, effective_api};

// ============================================================================
// Types
// ============================================================================

/// Handler run after an end-of-file has torn down the connections.
type EofHandler = Box<dyn Fn(&MuxBackend) + Send + Sync>;

/// Callbacks handed to the MUX layer when the channel is opened.
pub struct MuxOps {
    /// The peer closed the link.
    pub on_eof: Box<dyn Fn() + Send + Sync>,
    /// The channel released its resources.
    pub on_release: Box<dyn FnOnce() + Send>,
}

impl fmt::Debug for MuxOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxOps").finish_non_exhaustive()
    }
}

/// An open multiplexed channel.
pub trait MuxChannel: Send + Sync {
    /// Sends one control frame to the device.
    fn send_frame(&self, header: &FrameHeader, payload: &[u8], extra_header: Option<&[u8]>)
    -> Result<()>;

    /// Starts opening `proxy`; the outcome is reported on the proxy.
    fn open_tcp_proxy(&self, proxy: &TcpProxy) -> Result<()>;

    /// Stops the channel.
    fn shutdown(&self);
}

/// Opens multiplexed channels over file descriptors.
pub trait MuxOpener: Send + Sync {
    /// Opens a channel over `fd`.
    fn open(&self, fd: i32, event_loop: &EventLoop, ops: MuxOps) -> Result<Arc<dyn MuxChannel>>;
}

/// Frame link of the control channel.
struct MuxLink(Arc<dyn MuxChannel>);

impl FrameLink for MuxLink {
    fn send_data(
        &self,
        header: &FrameHeader,
        payload: &[u8],
        extra_header: Option<&[u8]>,
    ) -> Result<()> {
        self.0.send_frame(header, payload, extra_header)
    }
}

// ============================================================================
// MuxBackend
// ============================================================================

/// MUX backend.
pub struct MuxBackend {
    id: BackendId,
    registry: WeakRegistry,
    channel: Arc<dyn MuxChannel>,
    osdata: Arc<Mutex<Option<OsData>>>,
    discovery: Mutex<Option<Discovery>>,
    connections: LiveConnections,
    eof_handler: Mutex<Option<Arc<EofHandler>>>,
}

// ============================================================================
// MuxBackend - Construction
// ============================================================================

impl MuxBackend {
    /// Opens a channel over `fd` and creates the backend and its discovery.
    ///
    /// # Errors
    ///
    /// The error of the first failing step. Earlier steps are rolled back.
    pub fn create(
        registry: &Registry,
        opener: &dyn MuxOpener,
        fd: i32,
        osdata: Option<OsData>,
    ) -> Result<Arc<Self>> {
        let backend_cell: Arc<Mutex<Weak<MuxBackend>>> = Arc::new(Mutex::new(Weak::new()));
        let osdata = Arc::new(Mutex::new(osdata));

        let eof_cell = Arc::clone(&backend_cell);
        let release_osdata = Arc::downgrade(&osdata);
        let ops = MuxOps {
            on_eof: Box::new(move || {
                let backend = eof_cell.lock().upgrade();
                if let Some(backend) = backend {
                    backend.handle_eof();
                }
            }),
            on_release: Box::new(move || {
                if let Some(osdata) = release_osdata.upgrade() {
                    osdata.lock().take();
                }
            }),
        };

        let channel = opener.open(fd, registry.event_loop(), ops).inspect_err(|e| {
            warn!(fd, error = %e, "Failed to open MUX channel");
        })?;

        let backend = Arc::new(Self {
            id: BackendId::next(),
            registry: registry.downgrade(),
            channel,
            osdata,
            discovery: Mutex::new(None),
            connections: LiveConnections::default(),
            eof_handler: Mutex::new(None),
        });
        *backend_cell.lock() = Arc::downgrade(&backend);

        if let Err(e) = registry.register_backend(backend.clone()) {
            warn!(error = %e, "Failed to register MUX backend");
            backend.channel.shutdown();
            return Err(e);
        }

        let discovery = match Discovery::new(registry, "mux", backend.id) {
            Ok(discovery) => discovery,
            Err(e) => {
                warn!(error = %e, "Failed to create MUX discovery");
                if let Err(unregister_err) = registry.unregister_backend(backend.id) {
                    warn!(error = %unregister_err, "Failed to unregister MUX backend");
                }
                backend.channel.shutdown();
                return Err(e);
            }
        };
        *backend.discovery.lock() = Some(discovery);

        debug!(backend = %backend.id, fd, "MUX backend created");
        Ok(backend)
    }
}

// ============================================================================
// MuxBackend - Public API
// ============================================================================

impl MuxBackend {
    /// Starts the discovery source. Idempotent.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the backend was destroyed.
    pub fn start_discovery(&self) -> Result<()> {
        self.with_discovery(Discovery::start)
    }

    /// Stops the discovery source, removing its devices. Idempotent.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the backend was destroyed.
    pub fn stop_discovery(&self) -> Result<()> {
        self.with_discovery(Discovery::stop)
    }

    /// Runs `f` with the discovery source.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the backend was destroyed.
    pub fn with_discovery<R>(&self, f: impl FnOnce(&Discovery) -> R) -> Result<R> {
        let discovery = self.discovery.lock();
        let discovery = discovery
            .as_ref()
            .ok_or_else(|| Error::not_found("MUX discovery"))?;
        Ok(f(discovery))
    }

    /// Sets the handler run after an end-of-file.
    pub fn set_eof_handler(&self, handler: impl Fn(&MuxBackend) + Send + Sync + 'static) {
        *self.eof_handler.lock() = Some(Arc::new(Box::new(handler)));
    }

    /// Routes one control frame received from the channel.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] without an established connection, or the
    /// routing error.
    pub fn receive_frame(&self, header: &FrameHeader, payload: Bytes) -> Result<()> {
        let conn = self
            .connections
            .snapshot()
            .into_iter()
            .find(|c| c.state() == ConnectionState::Connected)
            .ok_or_else(|| Error::not_found("connected MUX device"))?;
        conn.receive_data(header, payload)
    }

    /// Handles end-of-file on the channel.
    pub fn handle_eof(&self) {
        warn!(backend = %self.id, "MUX end of file");

        for conn in self.connections.snapshot() {
            let result = match conn.state() {
                ConnectionState::Connected | ConnectionState::Disconnecting => conn
                    .link_status_changed(LinkStatus::Down)
                    .and_then(|()| conn.disconnected()),
                ConnectionState::Connecting | ConnectionState::Canceling => {
                    conn.cancel(CancelReason::LinkLost)
                }
                ConnectionState::Closed => Ok(()),
            };
            if let Err(e) = result {
                warn!(conn = %conn.id(), error = %e, "Failed to close connection on EOF");
            }
        }

        let handler = self.eof_handler.lock().clone();
        if let Some(handler) = handler {
            handler(self);
        }
    }

    /// Destroys the backend: drops discovery, unregisters, stops the channel.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] while connections are live.
    pub fn destroy(&self) -> Result<()> {
        if self.connections.len() > 0 {
            return Err(Error::busy("MUX backend has live connections"));
        }

        let discovery = self.discovery.lock().take();
        drop(discovery);

        if let Some(registry) = self.registry.upgrade()
            && let Err(e) = registry.unregister_backend(self.id)
        {
            warn!(backend = %self.id, error = %e, "Failed to unregister MUX backend");
        }
        self.channel.shutdown();

        debug!(backend = %self.id, "MUX backend destroyed");
        Ok(())
    }
}

// ============================================================================
// Backend Implementation
// ============================================================================

impl Backend for MuxBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Mux
    }

    fn osdata(&self) -> Option<OsData> {
        self.osdata.lock().clone()
    }

    fn start_device_conn(
        &self,
        device: DeviceHandle,
        info: &DeviceInfo,
        _config: &ConnectConfig,
        events: Arc<dyn ConnectionEvents>,
        event_loop: &EventLoop,
    ) -> Result<DeviceConnection> {
        if self.connections.len() > 0 {
            return Err(Error::busy("MUX backend already has a connection"));
        }

        let conn = DeviceConnection::new(device, self.id, &info.address, events, event_loop.clone());
        self.connections.track(&conn);

        let pending = conn.clone();
        let link: Arc<dyn FrameLink> = Arc::new(MuxLink(Arc::clone(&self.channel)));
        let api = effective_api(info.api);
        event_loop.defer(move || {
            if pending.connecting().is_err() {
                debug!(conn = %pending.id(), "MUX connection closed before start");
                return;
            }
            if let Err(e) = pending.connected(link, api) {
                warn!(conn = %pending.id(), error = %e, "MUX connection failed");
            }
        });

        Ok(conn)
    }

    fn stop_device_conn(&self, device: DeviceHandle, conn: &DeviceConnection) -> Result<()> {
        debug!(device = %device, conn = %conn.id(), "Closing MUX connection");
        match conn.begin_close() {
            ConnectionState::Connected | ConnectionState::Disconnecting => conn.disconnected(),
            ConnectionState::Connecting | ConnectionState::Canceling => {
                conn.cancel(CancelReason::Local)
            }
            ConnectionState::Closed => Ok(()),
        }
    }

    fn live_connections(&self) -> usize {
        self.connections.len()
    }

    fn create_tcp_proxy(
        &self,
        device: DeviceHandle,
        device_type: DeviceType,
        remote_port: u16,
        listener: Arc<dyn ProxyListener>,
    ) -> Result<TcpProxy> {
        let proxy = TcpProxy::new(device, device_type, remote_port, listener);
        self.channel.open_tcp_proxy(&proxy)?;
        debug!(proxy = %proxy.id(), %device_type, remote_port, "MUX proxy opening");
        Ok(proxy)
    }

    fn mux_channel(&self) -> Option<Arc<dyn MuxChannel>> {
        Some(Arc::clone(&self.channel))
    }
}

impl fmt::Debug for MuxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxBackend")
            .field("id", &self.id)
            .field("live_connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

//! BLE backend.
//!
//! BLE sessions are owned by the embedding environment, represented by a
//! [`BleSessionHost`]. Starting a connection asks the host to open an
//! address-keyed session for a fresh [`BleConnection`]; the host must claim
//! it by attaching its own handle before `open_connection` returns.
//!
//! From then on the host drives the connection (`connected`,
//! `disconnected`, `failed`, inbound packets) and owns its destruction:
//! it detaches and then calls [`BleConnection::destroy`]. Stopping a
//! connection only relays a close request to the host.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::device::{DeviceApi, DeviceInfo};
use crate::error::{Error, Result};
use crate::identifiers::{BackendId, DeviceHandle, OsData};
use crate::protocol::FrameHeader;
use crate::registry::Registry;
use crate::transport::{ConnectionEvents, DeviceConnection, EventLoop, FrameLink};

use super::{Backend, BackendKind, ConnectConfig, LiveConnections};

// ============================================================================
// Constants
// ============================================================================

/// Size of the `[type, seq]` prefix of BLE packets.
const BLE_PREFIX_LEN: usize = 2;

// ============================================================================
// BleSessionHost
// ============================================================================

/// Embedding environment owning BLE sessions.
pub trait BleSessionHost: Send + Sync {
    /// Opens a session to `address` for `connection`.
    ///
    /// Returns `false` if the session could not be opened. On success the
    /// host must have attached its handle to `connection`.
    fn open_connection(&self, address: &str, connection: BleConnection) -> bool;

    /// Requests closing of the session to `address`.
    fn close_connection(&self, address: &str);
}

// ============================================================================
// BleConnection
// ============================================================================

/// Host-facing view of a BLE device connection.
#[derive(Clone)]
pub struct BleConnection {
    conn: DeviceConnection,
}

impl BleConnection {
    fn new(conn: DeviceConnection) -> Self {
        debug!(conn = %conn.id(), address = conn.address(), "BLE connection created");
        Self { conn }
    }

    /// Returns the underlying device connection.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &DeviceConnection {
        &self.conn
    }

    /// Attaches the host handle.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] if already attached.
    pub fn attach(&self, osdata: OsData) -> Result<()> {
        self.conn.attach(osdata)
    }

    /// Detaches the host handle.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if nothing is attached.
    pub fn detach(&self) -> Result<OsData> {
        self.conn.detach()
    }

    /// Reports the session established over `link`.
    ///
    /// # Errors
    ///
    /// The connection state error.
    pub fn connected(&self, link: Arc<dyn FrameLink>) -> Result<()> {
        self.conn.connected(link, DeviceApi::Full)
    }

    /// Reports the session closed.
    ///
    /// # Errors
    ///
    /// The connection state error.
    pub fn disconnected(&self) -> Result<()> {
        self.conn.disconnected()
    }

    /// Reports that the session could not be established.
    ///
    /// # Errors
    ///
    /// The connection state error.
    pub fn failed(&self) -> Result<()> {
        self.conn.failed()
    }

    /// Handles one packet read from characteristic `id`.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the packet is malformed, or the routing error.
    pub fn receive_packet(&self, id: u8, packet: Bytes) -> Result<()> {
        let header = FrameHeader::from_ble_prefix(id, &packet).inspect_err(|e| {
            warn!(conn = %self.conn.id(), id, error = %e, "Malformed BLE packet");
        })?;
        self.conn.receive_data(&header, packet.slice(BLE_PREFIX_LEN..))
    }

    /// Destroys the connection. The host handle must be detached first.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] if still attached; the violation is logged.
    pub fn destroy(self) -> Result<()> {
        self.conn.dispose()
    }
}

impl fmt::Debug for BleConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

// ============================================================================
// BleBackend
// ============================================================================

/// BLE backend.
pub struct BleBackend {
    id: BackendId,
    osdata: Option<OsData>,
    host: Arc<dyn BleSessionHost>,
    connections: LiveConnections,
}

impl BleBackend {
    /// Creates a BLE backend and registers it with `registry`.
    ///
    /// # Errors
    ///
    /// The registration error.
    pub fn create(
        registry: &Registry,
        host: Arc<dyn BleSessionHost>,
        osdata: Option<OsData>,
    ) -> Result<Arc<Self>> {
        let backend = Arc::new(Self {
            id: BackendId::next(),
            osdata,
            host,
            connections: LiveConnections::default(),
        });
        registry.register_backend(backend.clone())?;

        debug!(backend = %backend.id, "BLE backend created");
        Ok(backend)
    }

    fn discard(&self, conn: DeviceConnection) {
        self.connections.untrack(conn.id());
        if conn.is_attached() {
            warn!(conn = %conn.id(), "Dropping host handle of rejected BLE connection");
        }
        conn.discard();
    }
}

impl Backend for BleBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Ble
    }

    fn osdata(&self) -> Option<OsData> {
        self.osdata.clone()
    }

    fn start_device_conn(
        &self,
        device: DeviceHandle,
        info: &DeviceInfo,
        _config: &ConnectConfig,
        events: Arc<dyn ConnectionEvents>,
        event_loop: &EventLoop,
    ) -> Result<DeviceConnection> {
        let conn = DeviceConnection::new(device, self.id, &info.address, events, event_loop.clone());
        self.connections.track(&conn);

        if !self
            .host
            .open_connection(&info.address, BleConnection::new(conn.clone()))
        {
            warn!(device = %device, address = %info.address, "BLE session open failed");
            self.discard(conn);
            return Err(Error::transport(format!(
                "failed to open BLE session to {}",
                info.address
            )));
        }

        if !conn.is_attached() {
            error!(device = %device, address = %info.address, "BLE connection not claimed by host");
            self.discard(conn);
            return Err(Error::protocol("BLE connection not attached by host"));
        }

        Ok(conn)
    }

    fn stop_device_conn(&self, device: DeviceHandle, conn: &DeviceConnection) -> Result<()> {
        debug!(device = %device, conn = %conn.id(), "Requesting BLE session close");
        conn.begin_close();
        self.host.close_connection(conn.address());
        Ok(())
    }

    fn live_connections(&self) -> usize {
        self.connections.len()
    }
}

impl fmt::Debug for BleBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleBackend")
            .field("id", &self.id)
            .field("live_connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Network backend.
//!
//! Connection negotiation is a JSON handshake. The backend builds and
//! serializes the request; a [`NetConnector`] carries it to the device and
//! hands the reply back through [`NetBackend::complete_handshake`].
//!
//! # Handshake
//!
//! Request:
//!
//! ```json
//! {
//!   "controller_type": "android",
//!   "controller_name": "groundsdk",
//!   "d2c_port": 43210,
//!   "proto_v": 1,
//!   "device_id": "ABC123",
//!   "stream_supported": true
//! }
//! ```
//!
//! Reply: `{"status": 0, "c2d_port": 2233, "proto_v": 1}`. A non-zero
//! status cancels the attempt with [`CancelReason::Rejected`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::{CancelReason, DeviceApi, DeviceInfo};
use crate::error::{Error, Result};
use crate::identifiers::{BackendId, ConnectionId, DeviceHandle, OsData};
use crate::registry::Registry;
use crate::transport::{
    ConnectionEvents, ConnectionState, DeviceConnection, EventLoop, FrameLink,
};

use super::{Backend, BackendKind, ConnectConfig, LiveConnections, effective_api};

// ============================================================================
// Constants
// ============================================================================

/// Highest protocol version offered in the handshake.
pub const NET_PROTO_V_MAX: u32 = 1;

/// Default device-to-controller port.
pub const DEFAULT_D2C_PORT: u16 = 43210;

// ============================================================================
// Handshake
// ============================================================================

/// Connection request sent to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Controller type.
    pub controller_type: String,
    /// Controller name.
    pub controller_name: String,
    /// Port the controller listens on.
    pub d2c_port: u16,
    /// Highest supported protocol version.
    pub proto_v: u32,
    /// Target device id.
    pub device_id: String,
    /// Whether the controller handles video streaming.
    pub stream_supported: bool,
}

/// Connection reply from the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    /// `0` on success.
    pub status: i32,
    /// Port the device listens on.
    #[serde(default)]
    pub c2d_port: u16,
    /// Protocol version chosen by the device.
    #[serde(default = "default_proto_v")]
    pub proto_v: u32,
}

fn default_proto_v() -> u32 {
    NET_PROTO_V_MAX
}

// ============================================================================
// NetConnector
// ============================================================================

/// Carries the handshake to the device.
pub trait NetConnector: Send + Sync {
    /// Starts negotiating `conn` on `port` with the serialized `request`.
    ///
    /// The reply is handed back through [`NetBackend::complete_handshake`].
    fn open(&self, conn: &DeviceConnection, port: u16, request: &[u8]) -> Result<()>;

    /// Aborts negotiation or tears down the sockets of `conn`.
    fn close(&self, conn: &DeviceConnection);
}

// ============================================================================
// NetBackend
// ============================================================================

/// Network backend.
pub struct NetBackend {
    id: BackendId,
    osdata: Option<OsData>,
    connector: Arc<dyn NetConnector>,
    d2c_port: u16,
    connections: LiveConnections,
    apis: Arc<Mutex<FxHashMap<ConnectionId, DeviceApi>>>,
}

// ============================================================================
// NetBackend - Public API
// ============================================================================

impl NetBackend {
    /// Creates a network backend and registers it with `registry`.
    ///
    /// # Errors
    ///
    /// The registration error.
    pub fn create(
        registry: &Registry,
        connector: Arc<dyn NetConnector>,
        d2c_port: u16,
        osdata: Option<OsData>,
    ) -> Result<Arc<Self>> {
        let backend = Arc::new(Self {
            id: BackendId::next(),
            osdata,
            connector,
            d2c_port,
            connections: LiveConnections::default(),
            apis: Arc::default(),
        });
        registry.register_backend(backend.clone())?;

        debug!(backend = %backend.id, d2c_port, "Network backend created");
        Ok(backend)
    }

    /// Returns the device-to-controller port advertised in handshakes.
    #[inline]
    #[must_use]
    pub fn d2c_port(&self) -> u16 {
        self.d2c_port
    }

    /// Builds the handshake request for `info`.
    #[must_use]
    pub fn handshake_request(&self, info: &DeviceInfo, config: &ConnectConfig) -> HandshakeRequest {
        HandshakeRequest {
            controller_type: config.controller_type.clone(),
            controller_name: config.controller_name.clone(),
            d2c_port: self.d2c_port,
            proto_v: NET_PROTO_V_MAX,
            device_id: info.id.clone(),
            stream_supported: true,
        }
    }

    /// Completes negotiation of `conn` with the device `reply`.
    ///
    /// On success the connection becomes connected over `link`.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the reply is malformed; the attempt is canceled
    /// - [`Error::Protocol`] if the device rejected the connection or picked
    ///   an unsupported protocol version; the attempt is canceled
    /// - The connection state error if the attempt was closed meanwhile
    pub fn complete_handshake(
        &self,
        conn: &DeviceConnection,
        reply: &[u8],
        link: Arc<dyn FrameLink>,
    ) -> Result<HandshakeReply> {
        let reply: HandshakeReply = match serde_json::from_slice(reply) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(conn = %conn.id(), error = %e, "Malformed handshake reply");
                self.reject(conn);
                return Err(e.into());
            }
        };

        if reply.status != 0 {
            warn!(conn = %conn.id(), status = reply.status, "Connection rejected by device");
            self.reject(conn);
            return Err(Error::protocol(format!(
                "connection rejected with status {}",
                reply.status
            )));
        }

        if reply.proto_v > NET_PROTO_V_MAX {
            warn!(conn = %conn.id(), proto_v = reply.proto_v, "Unsupported protocol version");
            self.reject(conn);
            return Err(Error::protocol(format!(
                "unsupported protocol version {}",
                reply.proto_v
            )));
        }

        let api = self
            .apis
            .lock()
            .get(&conn.id())
            .copied()
            .unwrap_or(DeviceApi::Full);
        conn.connected(link, api)?;

        debug!(conn = %conn.id(), c2d_port = reply.c2d_port, "Handshake complete");
        Ok(reply)
    }
}

// ============================================================================
// NetBackend - Internal
// ============================================================================

impl NetBackend {
    fn reject(&self, conn: &DeviceConnection) {
        if conn.state() != ConnectionState::Closed
            && let Err(e) = conn.cancel(CancelReason::Rejected)
        {
            warn!(conn = %conn.id(), error = %e, "Failed to cancel rejected connection");
        }
    }

    fn track(&self, conn: &DeviceConnection, api: DeviceApi) {
        self.connections.track(conn);
        self.apis.lock().insert(conn.id(), api);

        let apis = Arc::downgrade(&self.apis);
        conn.on_closed(move |closed| {
            if let Some(apis) = apis.upgrade() {
                apis.lock().remove(&closed.id());
            }
        });
    }

    fn untrack(&self, conn: &DeviceConnection) {
        self.connections.untrack(conn.id());
        self.apis.lock().remove(&conn.id());
    }
}

// ============================================================================
// Backend Implementation
// ============================================================================

impl Backend for NetBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Net
    }

    fn osdata(&self) -> Option<OsData> {
        self.osdata.clone()
    }

    fn start_device_conn(
        &self,
        device: DeviceHandle,
        info: &DeviceInfo,
        config: &ConnectConfig,
        events: Arc<dyn ConnectionEvents>,
        event_loop: &EventLoop,
    ) -> Result<DeviceConnection> {
        let request = serde_json::to_vec(&self.handshake_request(info, config))?;
        let conn = DeviceConnection::new(device, self.id, &info.address, events, event_loop.clone());
        self.track(&conn, effective_api(info.api));

        if let Err(e) = self.connector.open(&conn, info.port, &request) {
            warn!(device = %device, error = %e, "Failed to open network connection");
            self.untrack(&conn);
            conn.discard();
            return Err(e);
        }

        debug!(device = %device, conn = %conn.id(), "Network connection started");
        Ok(conn)
    }

    fn stop_device_conn(&self, device: DeviceHandle, conn: &DeviceConnection) -> Result<()> {
        let previous = conn.begin_close();
        self.connector.close(conn);

        if conn.state() == ConnectionState::Closed {
            return Ok(());
        }

        debug!(device = %device, conn = %conn.id(), ?previous, "Closing network connection");
        match previous {
            ConnectionState::Connected | ConnectionState::Disconnecting => conn.disconnected(),
            ConnectionState::Connecting | ConnectionState::Canceling => {
                conn.cancel(CancelReason::Local)
            }
            ConnectionState::Closed => Err(Error::protocol("connection already closed")),
        }
    }

    fn live_connections(&self) -> usize {
        self.connections.len()
    }
}

impl fmt::Debug for NetBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetBackend")
            .field("id", &self.id)
            .field("d2c_port", &self.d2c_port)
            .field("live_connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

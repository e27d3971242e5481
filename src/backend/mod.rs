//! Transport backends.
//!
//! A backend knows how to start and stop a [`DeviceConnection`] for a
//! discovered device and how its frames physically move. Three variants
//! share the [`Backend`] contract:
//!
//! | Variant | Kind | Connection setup |
//! |---------|------|------------------|
//! | [`NetBackend`] | `Net` | JSON handshake through a [`NetConnector`] |
//! | [`BleBackend`] | `Ble` | Address-keyed session opened by a [`BleSessionHost`] |
//! | [`MuxBackend`] | `Mux` | Logical channel over one [`MuxChannel`] |
//!
//! Backends are registered with the [`Registry`](crate::Registry), which
//! owns them. A backend must outlive the connections it started: the
//! registry refuses to unregister a backend that still has live ones.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::device::{DeviceApi, DeviceInfo, DeviceType};
use crate::error::{Error, Result};
use crate::identifiers::{BackendId, ConnectionId, DeviceHandle, OsData};
use crate::registry::UserAgent;
use crate::transport::{
    ConnectionEvents, DeviceConnection, EventLoop, ProxyListener, TcpProxy,
};

// ============================================================================
// Submodules
// ============================================================================

/// BLE backend.
pub mod ble;

/// Discovery sources.
pub mod discovery;

/// MUX backend.
pub mod mux;

/// Network backend.
pub mod net;

// ============================================================================
// Re-exports
// ============================================================================

pub use ble::{BleBackend, BleConnection, BleSessionHost};
pub use discovery::{Discovery, DiscoveryDevice};
pub use mux::{MuxBackend, MuxChannel, MuxOpener, MuxOps};
pub use net::{
    DEFAULT_D2C_PORT, HandshakeReply, HandshakeRequest, NET_PROTO_V_MAX, NetBackend, NetConnector,
};

// ============================================================================
// BackendKind
// ============================================================================

/// Backend kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Network (Wi-Fi).
    Net,
    /// Bluetooth Low Energy.
    Ble,
    /// Multiplexed tunnel over USB or serial.
    Mux,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Net => f.write_str("net"),
            Self::Ble => f.write_str("ble"),
            Self::Mux => f.write_str("mux"),
        }
    }
}

// ============================================================================
// ConnectConfig
// ============================================================================

/// Controller identity sent during connection negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    /// Controller name.
    pub controller_name: String,
    /// Controller type.
    pub controller_type: String,
}

impl From<&UserAgent> for ConnectConfig {
    fn from(agent: &UserAgent) -> Self {
        Self {
            controller_name: agent.controller_name.clone(),
            controller_type: agent.controller_type.clone(),
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self::from(&UserAgent::default())
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Contract shared by all transport backends.
pub trait Backend: Send + Sync {
    /// Returns the backend id.
    fn id(&self) -> BackendId;

    /// Returns the backend kind.
    fn kind(&self) -> BackendKind;

    /// Returns the upper-layer handle attached at creation.
    fn osdata(&self) -> Option<OsData>;

    /// Starts a connection to `device`.
    ///
    /// Completion is reported later through `events`. On error no
    /// connection object survives.
    fn start_device_conn(
        &self,
        device: DeviceHandle,
        info: &DeviceInfo,
        config: &ConnectConfig,
        events: Arc<dyn ConnectionEvents>,
        event_loop: &EventLoop,
    ) -> Result<DeviceConnection>;

    /// Requests closing of an established or in-flight connection.
    fn stop_device_conn(&self, device: DeviceHandle, conn: &DeviceConnection) -> Result<()>;

    /// Returns the number of connections not yet closed.
    fn live_connections(&self) -> usize;

    /// Opens a TCP proxy through the device link.
    fn create_tcp_proxy(
        &self,
        _device: DeviceHandle,
        device_type: DeviceType,
        _remote_port: u16,
        _listener: Arc<dyn ProxyListener>,
    ) -> Result<TcpProxy> {
        Err(Error::not_implemented(format!(
            "{} backend cannot proxy to {device_type}",
            self.kind()
        )))
    }

    /// Returns the multiplexed channel, for backends that have one.
    fn mux_channel(&self) -> Option<Arc<dyn MuxChannel>> {
        None
    }
}

// ============================================================================
// LiveConnections
// ============================================================================

/// Connections of one backend that have not reached `Closed` yet.
///
/// Entries remove themselves when their connection closes.
#[derive(Clone, Default)]
pub(crate) struct LiveConnections {
    map: Arc<Mutex<FxHashMap<ConnectionId, DeviceConnection>>>,
}

impl LiveConnections {
    pub(crate) fn track(&self, conn: &DeviceConnection) {
        self.map.lock().insert(conn.id(), conn.clone());

        let map: Weak<Mutex<_>> = Arc::downgrade(&self.map);
        conn.on_closed(move |closed| {
            if let Some(map) = map.upgrade() {
                map.lock().remove(&closed.id());
            }
        });
    }

    pub(crate) fn untrack(&self, id: ConnectionId) {
        self.map.lock().remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<DeviceConnection> {
        self.map.lock().values().cloned().collect()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// API reported on connection when discovery did not tell.
pub(crate) fn effective_api(api: DeviceApi) -> DeviceApi {
    match api {
        DeviceApi::Unknown => DeviceApi::Full,
        other => other,
    }
}

// ============================================================================
// Tests
// ============================================================================

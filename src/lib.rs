//! ARSDK core - Drone device connection and command control plane.
//!
//! This library tracks discovered drones and remote controllers, opens
//! connections to them over network, BLE or MUX transports, and exchanges
//! commands through a sequenced, acknowledged frame channel.
//!
//! # Architecture
//!
//! Everything runs on one reactor ([`EventLoop`](transport::EventLoop)):
//!
//! - **Registry**: owns backends, discovery sources and devices
//! - **Backends**: start and stop device connections for one transport
//! - **Device connection**: state machine driving the frame pipe
//! - **Command interface**: ack/non-ack queues, retries, ping echo
//! - **Device controller**: public handle with the non-ack timer
//!
//! Notifications for one device are always delivered in order:
//! `connecting`, then `connected` or `canceled`, then `disconnected`.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use arsdk_core::backend::{Backend, BackendKind, NetBackend, NetConnector};
//! use arsdk_core::device::{CancelReason, DeviceApi, DeviceInfo, DeviceType};
//! use arsdk_core::protocol::Command;
//! use arsdk_core::transport::DeviceConnection;
//! use arsdk_core::{
//!     DeviceController, DeviceHandle, DeviceListener, Registry, RegistryListener, Result,
//! };
//!
//! struct Devices;
//!
//! impl RegistryListener for Devices {
//!     fn device_added(&self, handle: DeviceHandle, info: &DeviceInfo) {
//!         println!("added {handle}: {}", info.name);
//!     }
//!
//!     fn device_removed(&self, handle: DeviceHandle) {
//!         println!("removed {handle}");
//!     }
//! }
//!
//! struct Drone;
//!
//! impl DeviceListener for Drone {
//!     fn connected(&self, api: DeviceApi) {
//!         println!("connected ({api:?})");
//!     }
//!
//!     fn disconnected(&self, removing: bool) {
//!         println!("disconnected (removing: {removing})");
//!     }
//!
//!     fn connection_canceled(&self, reason: CancelReason, removing: bool) {
//!         println!("canceled: {reason:?} (removing: {removing})");
//!     }
//!
//!     fn command_received(&self, command: &Command) {
//!         println!("received {command:?}");
//!     }
//! }
//!
//! struct Socket;
//!
//! impl NetConnector for Socket {
//!     fn open(&self, _conn: &DeviceConnection, _port: u16, _request: &[u8]) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     fn close(&self, _conn: &DeviceConnection) {}
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     let registry = Registry::builder()
//!         .user_agent("linux", "groundsdk")
//!         .listener(Arc::new(Devices))
//!         .build()?;
//!
//!     let backend = NetBackend::create(&registry, Arc::new(Socket), 43210, None)?;
//!     let info = DeviceInfo {
//!         id: "PI040416AA8C000000".to_string(),
//!         name: "ANAFI-000000".to_string(),
//!         device_type: DeviceType::ANAFI_4K,
//!         backend_kind: BackendKind::Net,
//!         address: "192.168.42.1".to_string(),
//!         port: 44444,
//!         api: DeviceApi::Unknown,
//!     };
//!     let handle = registry.add_device(info, backend.id())?;
//!
//!     let controller = DeviceController::create(&registry, handle, Arc::new(Drone), None)?;
//!     controller.connect()?;
//!     controller.start_no_ack_cmd_timer(25)?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`backend`] | Net, BLE and MUX backends, discovery sources |
//! | [`device`] | Device descriptors, controller, firmware versions, streams |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Device handles and internal ids |
//! | [`protocol`] | Commands, frames, multisets and command logging |
//! | [`registry`] | Device registry and its builder |
//! | [`transport`] | Reactor, connection state machine, command interface |

// ============================================================================
// Modules
// ============================================================================

/// Transport backends and discovery.
///
/// Each backend implements [`Backend`](backend::Backend) for one link type.
pub mod backend;

/// Device-level API.
///
/// Use [`DeviceController::create()`] to drive a registered device.
pub mod device;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Device handles and internal identifiers.
pub mod identifiers;

/// Command and frame formats.
pub mod protocol;

/// Device registry.
///
/// Use [`Registry::builder()`] to create a configured registry.
pub mod registry;

/// Reactor, connections and command transport.
pub mod transport;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Device types
pub use device::{
    CancelReason, DeviceApi, DeviceController, DeviceInfo, DeviceListener, DeviceState,
    DeviceType, FirmwareType, FirmwareVersion, LinkStatus, StreamSession, StreamSource,
};

// Registry types
pub use registry::{Registry, RegistryBuilder, RegistryListener, RegistryOptions, UserAgent};

// Protocol types
pub use protocol::{BufferType, Command, CommandLogLevel, FeatureId, Multiset};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{BackendId, ConnectionId, DeviceHandle, DiscoveryId, OsData, ProxyId};

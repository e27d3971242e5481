//! Devices.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`DeviceInfo`] | Descriptor of a discovered device |
//! | [`DeviceController`] | Connect, send commands, non-ack timer, disconnect |
//! | [`FirmwareVersion`] | Totally ordered firmware version |
//! | [`StreamSource`] | RTSP stream access selection |

// ============================================================================
// Submodules
// ============================================================================

/// Device controller and listener.
pub mod controller;

/// Firmware versions.
pub mod firmware;

/// Device descriptors and status enums.
pub mod info;

/// Stream source selection.
pub mod stream;

// ============================================================================
// Re-exports
// ============================================================================

pub use controller::{DeviceController, DeviceListener};
pub use firmware::{FirmwareType, FirmwareVersion};
pub use info::{CancelReason, DeviceApi, DeviceInfo, DeviceState, DeviceType, LinkStatus};
pub use stream::{RTSP_PORT, StreamSession, StreamSource};

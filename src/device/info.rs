//! Device descriptors and status enums.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;

// ============================================================================
// DeviceType
// ============================================================================

/// Numeric device type.
///
/// Kept open so that device types unknown to this crate still round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceType(pub u32);

impl DeviceType {
    /// Anafi 4K drone.
    pub const ANAFI_4K: Self = Self(0x0914);
    /// SkyController 3 remote.
    pub const SKYCTRL_3: Self = Self(0x0918);
    /// Anafi Thermal drone.
    pub const ANAFI_THERMAL: Self = Self(0x0919);
    /// Anafi 2 drone.
    pub const ANAFI_2: Self = Self(0x091A);
    /// Anafi UA drone.
    pub const ANAFI_UA: Self = Self(0x091B);
    /// SkyController UA remote.
    pub const SKYCTRL_UA: Self = Self(0x091C);
    /// Anafi USA drone.
    pub const ANAFI_USA: Self = Self(0x091E);
    /// SkyController 4 remote.
    pub const SKYCTRL_4: Self = Self(0x091F);

    /// Returns the product name, if known.
    #[must_use]
    pub fn name(&self) -> Option<&'static str> {
        match *self {
            Self::ANAFI_4K => Some("ANAFI_4K"),
            Self::SKYCTRL_3 => Some("SKYCTRL_3"),
            Self::ANAFI_THERMAL => Some("ANAFI_THERMAL"),
            Self::ANAFI_2 => Some("ANAFI_2"),
            Self::ANAFI_UA => Some("ANAFI_UA"),
            Self::SKYCTRL_UA => Some("SKYCTRL_UA"),
            Self::ANAFI_USA => Some("ANAFI_USA"),
            Self::SKYCTRL_4 => Some("SKYCTRL_4"),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:#06x}", self.0),
        }
    }
}

// ============================================================================
// Status Enums
// ============================================================================

/// API capability of a connected device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceApi {
    /// Not known yet.
    #[default]
    Unknown,
    /// Full piloting API.
    Full,
    /// Only firmware update is possible.
    UpdateOnly,
}

/// Why a connection attempt was canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Canceled by the controller.
    Local,
    /// Canceled by the device.
    Remote,
    /// Rejected by the device during negotiation.
    Rejected,
    /// The underlying link went away.
    LinkLost,
}

/// Link status of a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// Link is healthy.
    Up,
    /// Link is lost.
    Down,
}

/// Connection state of a registered device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Discovered, not connected.
    #[default]
    Idle,
    /// Connection in progress.
    Connecting,
    /// Connected.
    Connected,
    /// Being removed; the connection is closing.
    Removing,
}

// ============================================================================
// DeviceInfo
// ============================================================================

/// Descriptor of a discovered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Unique id (serial).
    pub id: String,
    /// Human readable name.
    pub name: String,
    /// Device type.
    pub device_type: DeviceType,
    /// Backend the device was discovered on.
    pub backend_kind: BackendKind,
    /// Network address, or BLE address.
    pub address: String,
    /// Port, when relevant.
    pub port: u16,
    /// API capability.
    #[serde(default)]
    pub api: DeviceApi,
}

// ============================================================================
// Tests
// ============================================================================

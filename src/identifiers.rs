//! Type-safe identifiers for control-plane entities.
//!
//! Newtype wrappers prevent mixing a device handle with a backend or
//! connection id at compile time.
//!
//! # Identifier Types
//!
//! | Type | Origin | Description |
//! |------|--------|-------------|
//! | [`DeviceHandle`] | Registry | Small numeric handle of a discovered device |
//! | [`BackendId`] | Process counter | Registered transport backend |
//! | [`ConnectionId`] | Process counter | One connection attempt |
//! | [`DiscoveryId`] | Process counter | One discovery source |
//! | [`ProxyId`] | Process counter | One TCP proxy |
//!
//! [`OsData`] is the opaque upper-layer handle attached to native objects.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// ============================================================================
// OsData
// ============================================================================

/// Opaque upper-layer handle stored on backends, devices and connections.
///
/// The core never looks inside; it only hands it back on request.
pub type OsData = Arc<dyn Any + Send + Sync>;

// ============================================================================
// DeviceHandle
// ============================================================================

/// Handle of a discovered device.
///
/// Stable for the device's discovered lifetime. `0xFFFF` is reserved as the
/// invalid handle and can never be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceHandle(u16);

impl DeviceHandle {
    /// Raw value reserved for "no device".
    pub const INVALID: u16 = 0xFFFF;

    /// Creates a handle, returning `None` for the reserved invalid value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u16) -> Option<Self> {
        if raw == Self::INVALID {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Returns the raw numeric value.
    #[inline]
    #[must_use]
    pub const fn raw(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Counter-backed Identifiers
// ============================================================================

macro_rules! counter_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        static $counter: AtomicU64 = AtomicU64::new(1);

        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Allocates the next process-unique identifier.
            #[inline]
            #[must_use]
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Returns the raw numeric value.
            #[inline]
            #[must_use]
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

counter_id!(
    /// Identifier of a registered transport backend.
    BackendId,
    NEXT_BACKEND_ID,
    "backend"
);

counter_id!(
    /// Identifier of one device connection attempt.
    ConnectionId,
    NEXT_CONNECTION_ID,
    "conn"
);

counter_id!(
    /// Identifier of a discovery source.
    DiscoveryId,
    NEXT_DISCOVERY_ID,
    "discovery"
);

counter_id!(
    /// Identifier of a TCP proxy.
    ProxyId,
    NEXT_PROXY_ID,
    "proxy"
);

// ============================================================================
// Tests
// ============================================================================

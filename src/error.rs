//! Error types for the device control plane.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use arsdk_core::{Command, Result};
//!
//! fn pilot(device: &DeviceController, pcmd: &Command) -> Result<()> {
//!     device.send_command(pcmd)?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Argument | [`Error::InvalidArgument`] |
//! | Lookup | [`Error::DeviceNotFound`], [`Error::ConnectionNotFound`], [`Error::NoCommandInterface`], [`Error::NotFound`] |
//! | Resources | [`Error::ResourceExhausted`], [`Error::Busy`], [`Error::EventLoopUnavailable`] |
//! | State | [`Error::Protocol`], [`Error::Canceled`] |
//! | Capability | [`Error::NotImplemented`] |
//! | Transport | [`Error::Transport`], [`Error::Io`], [`Error::Json`] |
//!
//! Every variant maps onto a negative POSIX errno through [`Error::errno`],
//! which is what embedders talking the native error domain expect.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::DeviceHandle;

// ============================================================================
// Errno Constants
// ============================================================================

const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const ENOSYS: i32 = 38;
const EPROTO: i32 = 71;
const ECANCELED: i32 = 125;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Argument Errors
    // ========================================================================
    /// Invalid argument.
    ///
    /// Returned when a parameter is out of range or malformed.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    // ========================================================================
    // Lookup Errors
    // ========================================================================
    /// No device is registered under the handle.
    #[error("Device not found: {handle}")]
    DeviceNotFound {
        /// The missing device handle.
        handle: DeviceHandle,
    },

    /// The device has no active connection.
    #[error("No connection for device {handle}")]
    ConnectionNotFound {
        /// Device that has no connection.
        handle: DeviceHandle,
    },

    /// The device has no command interface (not connected yet, or gone).
    #[error("No command interface for device {handle}")]
    NoCommandInterface {
        /// Device that has no command interface.
        handle: DeviceHandle,
    },

    /// Generic lookup failure (timer, backend, proxy, registry).
    #[error("Not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    // ========================================================================
    // Resource Errors
    // ========================================================================
    /// Resource exhausted.
    ///
    /// Returned when no handle or buffer can be allocated.
    #[error("Resource exhausted: {message}")]
    ResourceExhausted {
        /// Description of the exhausted resource.
        message: String,
    },

    /// Operation already in progress.
    #[error("Busy: {message}")]
    Busy {
        /// Description of the conflicting operation.
        message: String,
    },

    /// No event loop could be obtained.
    #[error("Event loop unavailable")]
    EventLoopUnavailable,

    // ========================================================================
    // State Errors
    // ========================================================================
    /// Operation attempted in the wrong state.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the state violation.
        message: String,
    },

    /// Operation was canceled.
    #[error("Canceled")]
    Canceled,

    // ========================================================================
    // Capability Errors
    // ========================================================================
    /// Unsupported device, backend or media combination.
    #[error("Not implemented: {message}")]
    NotImplemented {
        /// Description of the unsupported combination.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Underlying transport failure.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a device not found error.
    #[inline]
    pub fn device_not_found(handle: DeviceHandle) -> Self {
        Self::DeviceNotFound { handle }
    }

    /// Creates a connection not found error.
    #[inline]
    pub fn connection_not_found(handle: DeviceHandle) -> Self {
        Self::ConnectionNotFound { handle }
    }

    /// Creates a missing command interface error.
    #[inline]
    pub fn no_command_interface(handle: DeviceHandle) -> Self {
        Self::NoCommandInterface { handle }
    }

    /// Creates a generic not found error.
    #[inline]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a resource exhausted error.
    #[inline]
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Creates a busy error.
    #[inline]
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    /// Creates a protocol (wrong state) error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a not implemented error.
    #[inline]
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a lookup failure.
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound { .. }
                | Self::ConnectionNotFound { .. }
                | Self::NoCommandInterface { .. }
                | Self::NotFound { .. }
        )
    }

    /// Returns `true` if another operation is already in progress.
    #[inline]
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Returns `true` if this is a transport error.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Io(_))
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry, e.g. once a device
    /// (re)connects or a pending operation completes.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Busy { .. }
                | Self::NoCommandInterface { .. }
                | Self::ConnectionNotFound { .. }
                | Self::Transport { .. }
        )
    }

    /// Returns the negative POSIX errno matching this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::InvalidArgument { .. } => EINVAL,
            Self::DeviceNotFound { .. }
            | Self::ConnectionNotFound { .. }
            | Self::NoCommandInterface { .. }
            | Self::NotFound { .. }
            | Self::EventLoopUnavailable => ENODEV,
            Self::ResourceExhausted { .. } => ENOMEM,
            Self::Busy { .. } => EBUSY,
            Self::Protocol { .. } | Self::Json(_) => EPROTO,
            Self::Canceled => ECANCELED,
            Self::NotImplemented { .. } => ENOSYS,
            Self::Transport { .. } => EIO,
            Self::Io(err) => err.raw_os_error().unwrap_or(EIO),
        };
        -code
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Command and frame value types.
//!
//! This module defines what travels over a device connection once it is
//! established.
//!
//! # Layers
//!
//! | Layer | Type | Purpose |
//! |-------|------|---------|
//! | Frame | [`FrameHeader`] | `{type, id, seq}` header of every transport frame |
//! | Command | [`Command`] | Feature id + command id + encoded arguments |
//! | State bundle | [`Multiset`] | Fixed-size opaque blob |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `command` | Command value and description table |
//! | `frame` | Frame header and buffer ids |
//! | `logging` | Command tracing filter and config cell |
//! | `multiset` | Multiset blob |

// ============================================================================
// Submodules
// ============================================================================

/// Command value and description table.
pub mod command;

/// Frame header and buffer ids.
pub mod frame;

/// Command tracing.
pub mod logging;

/// Multiset blob.
pub mod multiset;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::{BufferType, Command, CommandDesc, FeatureId, command_name, describe};
pub use frame::{DataType, FrameHeader, buffer_id};
pub use logging::{
    COMMAND_LOG_TARGET, CommandDirection, CommandLogConfig, CommandLogLevel, log_command,
    should_log,
};
pub use multiset::Multiset;

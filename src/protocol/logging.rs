//! Command tracing.
//!
//! Tracing verbosity lives in a [`CommandLogConfig`] cell owned by the
//! registry and passed by reference to [`log_command`]. Nothing here reads
//! process-global state.
//!
//! | Level | Logged commands |
//! |-------|-----------------|
//! | `None` | nothing |
//! | `AckNoFrequent` | acknowledged commands except high-frequency telemetry |
//! | `Ack` | acknowledged commands |
//! | `All` | every command |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::identifiers::DeviceHandle;

use super::command::{BufferType, Command};

// ============================================================================
// Constants
// ============================================================================

/// Tracing target for command logs.
pub const COMMAND_LOG_TARGET: &str = "arsdk::command";

// ============================================================================
// CommandLogLevel
// ============================================================================

/// Command tracing verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CommandLogLevel {
    /// No command is logged.
    None = 0,
    /// Acknowledged commands, minus frequent telemetry.
    #[default]
    AckNoFrequent = 1,
    /// Acknowledged commands.
    Ack = 2,
    /// All commands.
    All = 3,
}

impl TryFrom<u8> for CommandLogLevel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::AckNoFrequent),
            2 => Ok(Self::Ack),
            3 => Ok(Self::All),
            other => Err(Error::invalid_argument(format!(
                "unknown command log level: {other}"
            ))),
        }
    }
}

// ============================================================================
// CommandLogConfig
// ============================================================================

/// Shared configuration cell for command tracing.
#[derive(Debug)]
pub struct CommandLogConfig {
    level: AtomicU8,
}

impl CommandLogConfig {
    /// Creates a cell with the given initial level.
    #[inline]
    #[must_use]
    pub const fn new(level: CommandLogLevel) -> Self {
        Self {
            level: AtomicU8::new(level as u8),
        }
    }

    /// Returns the current level.
    #[must_use]
    pub fn level(&self) -> CommandLogLevel {
        CommandLogLevel::try_from(self.level.load(Ordering::Relaxed)).unwrap_or_default()
    }

    /// Sets the level.
    pub fn set_level(&self, level: CommandLogLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }
}

impl Default for CommandLogConfig {
    fn default() -> Self {
        Self::new(CommandLogLevel::default())
    }
}

// ============================================================================
// CommandDirection
// ============================================================================

/// Direction of a traced command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDirection {
    /// Controller to device.
    Tx,
    /// Device to controller.
    Rx,
}

impl fmt::Display for CommandDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tx => f.write_str("tx"),
            Self::Rx => f.write_str("rx"),
        }
    }
}

// ============================================================================
// Filtering
// ============================================================================

/// Returns `true` if `command` passes the `level` filter.
#[must_use]
pub fn should_log(level: CommandLogLevel, command: &Command) -> bool {
    match level {
        CommandLogLevel::None => false,
        CommandLogLevel::All => true,
        CommandLogLevel::Ack => command.buffer_type() == BufferType::Ack,
        CommandLogLevel::AckNoFrequent => {
            command.buffer_type() == BufferType::Ack && !command.is_frequent()
        }
    }
}

/// Traces a command if the configured level lets it through.
pub fn log_command(
    config: &CommandLogConfig,
    direction: CommandDirection,
    device: DeviceHandle,
    command: &Command,
) {
    if !should_log(config.level(), command) {
        return;
    }

    info!(
        target: COMMAND_LOG_TARGET,
        dir = %direction,
        device = %device,
        feature = %command.feature(),
        cmd = command.command_id(),
        name = command.name().unwrap_or("unknown"),
        len = command.data().len(),
        "command"
    );
}

// ============================================================================
// Tests
// ============================================================================

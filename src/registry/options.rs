//! Registry configuration.
//!
//! # Example
//!
//! ```ignore
//! use arsdk_core::{CommandLogLevel, RegistryOptions, UserAgent};
//!
//! let options = RegistryOptions::new()
//!     .with_user_agent(UserAgent::new("android", "FreeFlight"))
//!     .with_video_decoding(true)
//!     .with_command_log_level(CommandLogLevel::All);
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::protocol::CommandLogLevel;

// ============================================================================
// Constants
// ============================================================================

/// Controller name used when the embedding application sets none.
pub const DEFAULT_CONTROLLER_NAME: &str = "groundsdk";

// ============================================================================
// UserAgent
// ============================================================================

/// Controller identity sent to devices during connection negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgent {
    /// Controller type, typically the platform name.
    pub controller_type: String,
    /// Controller name.
    pub controller_name: String,
}

impl UserAgent {
    /// Creates a user agent.
    #[inline]
    #[must_use]
    pub fn new(controller_type: impl Into<String>, controller_name: impl Into<String>) -> Self {
        Self {
            controller_type: controller_type.into(),
            controller_name: controller_name.into(),
        }
    }
}

impl Default for UserAgent {
    fn default() -> Self {
        Self::new(std::env::consts::OS, DEFAULT_CONTROLLER_NAME)
    }
}

// ============================================================================
// RegistryOptions
// ============================================================================

/// Registry configuration values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryOptions {
    /// Controller identity.
    pub user_agent: UserAgent,

    /// Whether video decoding is enabled.
    pub video_decoding: bool,

    /// Initial command tracing verbosity.
    pub command_log_level: CommandLogLevel,
}

impl RegistryOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the controller identity.
    #[inline]
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: UserAgent) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Enables or disables video decoding.
    #[inline]
    #[must_use]
    pub fn with_video_decoding(mut self, enabled: bool) -> Self {
        self.video_decoding = enabled;
        self
    }

    /// Sets the initial command tracing verbosity.
    #[inline]
    #[must_use]
    pub fn with_command_log_level(mut self, level: CommandLogLevel) -> Self {
        self.command_log_level = level;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

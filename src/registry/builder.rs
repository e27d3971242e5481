//! Builder pattern for registry configuration.
//!
//! # Example
//!
//! ```ignore
//! use arsdk_core::Registry;
//!
//! let registry = Registry::builder()
//!     .listener(listener)
//!     .user_agent("android", "FreeFlight")
//!     .video_decoding(true)
//!     .build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::identifiers::OsData;
use crate::protocol::CommandLogLevel;
use crate::transport::EventLoop;

use super::core::{Registry, RegistryListener};
use super::options::{RegistryOptions, UserAgent};

// ============================================================================
// RegistryBuilder
// ============================================================================

/// Builder for configuring a [`Registry`].
///
/// Use [`Registry::builder()`] to create a new builder.
#[derive(Default)]
pub struct RegistryBuilder {
    /// Configuration values.
    options: RegistryOptions,
    /// Explicit event loop; the current runtime is used otherwise.
    event_loop: Option<EventLoop>,
    /// Device added/removed listener.
    listener: Option<Arc<dyn RegistryListener>>,
    /// Opaque handle returned by [`Registry::destroy`].
    userdata: Option<OsData>,
}

// ============================================================================
// RegistryBuilder Implementation
// ============================================================================

impl RegistryBuilder {
    /// Creates a builder with default options.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all configuration values.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: RegistryOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the controller identity.
    #[inline]
    #[must_use]
    pub fn user_agent(
        mut self,
        controller_type: impl Into<String>,
        controller_name: impl Into<String>,
    ) -> Self {
        self.options.user_agent = UserAgent::new(controller_type, controller_name);
        self
    }

    /// Enables or disables video decoding.
    #[inline]
    #[must_use]
    pub fn video_decoding(mut self, enabled: bool) -> Self {
        self.options.video_decoding = enabled;
        self
    }

    /// Sets the initial command tracing verbosity.
    #[inline]
    #[must_use]
    pub fn command_log_level(mut self, level: CommandLogLevel) -> Self {
        self.options.command_log_level = level;
        self
    }

    /// Sets the event loop explicitly.
    #[inline]
    #[must_use]
    pub fn event_loop(mut self, event_loop: EventLoop) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    /// Sets the device listener. Required.
    #[inline]
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn RegistryListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the opaque handle returned on destruction.
    #[inline]
    #[must_use]
    pub fn userdata(mut self, userdata: OsData) -> Self {
        self.userdata = Some(userdata);
        self
    }

    /// Builds the registry.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if no listener is set
    /// - [`Error::EventLoopUnavailable`] if no event loop is set and none
    ///   is running
    pub fn build(self) -> Result<Registry> {
        let listener = self.listener.ok_or_else(|| {
            Error::invalid_argument(
                "Registry listener is required. Use .listener() to set it.",
            )
        })?;

        let event_loop = match self.event_loop {
            Some(event_loop) => event_loop,
            None => EventLoop::current()?,
        };

        Ok(Registry::new(self.options, event_loop, listener, self.userdata))
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("options", &self.options)
            .field("event_loop", &self.event_loop)
            .field("has_listener", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::RecordingRegistryListener;

    #[test]
    fn test_new_creates_default_builder() {
        let builder = RegistryBuilder::new();
        assert_eq!(builder.options, RegistryOptions::default());
        assert!(builder.listener.is_none());
        assert!(builder.event_loop.is_none());
    }

    #[test]
    fn test_setters() {
        let builder = RegistryBuilder::new()
            .user_agent("ios", "FreeFlight")
            .video_decoding(true)
            .command_log_level(CommandLogLevel::None);

        assert_eq!(builder.options.user_agent, UserAgent::new("ios", "FreeFlight"));
        assert!(builder.options.video_decoding);
        assert_eq!(builder.options.command_log_level, CommandLogLevel::None);
    }

    #[tokio::test]
    async fn test_build_requires_listener() {
        let err = RegistryBuilder::new().build().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_build_without_event_loop_fails() {
        let err = RegistryBuilder::new()
            .listener(RecordingRegistryListener::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::EventLoopUnavailable));
    }

    #[tokio::test]
    async fn test_build_applies_options() {
        let registry = RegistryBuilder::new()
            .listener(RecordingRegistryListener::new())
            .user_agent("ios", "FreeFlight")
            .video_decoding(true)
            .command_log_level(CommandLogLevel::All)
            .build()
            .expect("build");

        assert_eq!(registry.user_agent(), UserAgent::new("ios", "FreeFlight"));
        assert!(registry.video_decoding_enabled());
        assert_eq!(registry.command_log().level(), CommandLogLevel::All);
    }
}

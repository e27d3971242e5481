//! Device registry.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Registry`] | Device table, backends, discoveries, configuration |
//! | [`RegistryBuilder`] | Fluent configuration builder |
//! | [`RegistryOptions`] | Configuration values |
//! | [`UserAgent`] | Controller identity sent to devices |
//! | [`RegistryListener`] | Device added/removed notifications |

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for registry configuration.
pub mod builder;

/// Core registry implementation.
pub mod core;

/// Registry-side device entries.
pub(crate) mod device;

/// Registry options and controller identity.
pub mod options;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::RegistryBuilder;
pub use core::{Registry, RegistryListener, WeakRegistry};
pub(crate) use device::DeviceEvents;
pub use options::{DEFAULT_CONTROLLER_NAME, RegistryOptions, UserAgent};

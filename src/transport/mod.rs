//! Connection and command transport layer.
//!
//! This module holds everything between a backend and the device listener:
//! the reactor handle, the per-attempt connection state machine, the frame
//! pipe it creates once connected, and the command interface built on that
//! pipe.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  connected(link)  ┌──────────────────┐
//! │   Backend    │──────────────────►│ DeviceConnection │
//! │ (Net/BLE/MUX)│                   │   state machine  │
//! └──────┬───────┘                   └────────┬─────────┘
//!        │ FrameLink                          │ FramePipe
//!        ▼                                    ▼
//!   device link   ◄───── frames ─────  CommandInterface
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. Backend creates a `DeviceConnection` (`Connecting`)
//! 2. `connected()` creates and starts the `FramePipe`
//! 3. The device wrapper builds a `CommandInterface` on the pipe
//! 4. `disconnected()` / `cancel()` stops and disposes the pipe
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `event_loop` | Reactor handle and timers |
//! | `pipe` | Frame pipe and link traits |
//! | `connection` | Connection state machine |
//! | `command_itf` | Command multiplexer |
//! | `proxy` | TCP proxy state |

// ============================================================================
// Submodules
// ============================================================================

/// Reactor handle and timers.
pub mod event_loop;

/// Frame pipe and link traits.
pub mod pipe;

/// Device connection state machine.
pub mod connection;

/// Command multiplexer.
pub mod command_itf;

/// TCP proxy.
pub mod proxy;

// ============================================================================
// Re-exports
// ============================================================================

pub use command_itf::{ACK_RETRY_DELAY, CommandInterface, CommandListener, MAX_ACK_RETRIES};
pub use connection::{ConnectionEvents, ConnectionState, DeviceConnection};
pub use event_loop::{EventLoop, OneShotTimer, PeriodicTimer};
pub use pipe::{FrameLink, FramePipe, FrameReceiver, PipeState};
pub use proxy::{ProxyEndpoint, ProxyListener, ProxyState, TcpProxy};

//! Transport frame pipe.
//!
//! A [`FramePipe`] is created by a connection when it reaches the connected
//! state. It wraps the backend-provided [`FrameLink`] (how frames physically
//! move) and routes inbound frames to a single [`FrameReceiver`], normally
//! the command interface.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──start──► Started ──stop──► Stopped ──dispose──► Disposed
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::FrameHeader;

// ============================================================================
// Traits
// ============================================================================

/// Backend side of a pipe: moves frames to the device.
pub trait FrameLink: Send + Sync {
    /// Starts the link.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stops the link.
    fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Sends one frame.
    fn send_data(
        &self,
        header: &FrameHeader,
        payload: &[u8],
        extra_header: Option<&[u8]>,
    ) -> Result<()>;
}

/// Consumer of inbound frames.
pub trait FrameReceiver: Send + Sync {
    /// Handles one inbound frame.
    fn recv_data(&self, header: &FrameHeader, payload: Bytes);
}

// ============================================================================
// PipeState
// ============================================================================

/// Pipe lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    /// Created, not started.
    Created,
    /// Relaying frames.
    Started,
    /// Stopped, may not be restarted.
    Stopped,
    /// Disposed.
    Disposed,
}

// ============================================================================
// FramePipe
// ============================================================================

/// Frame pipe scoped to one connection.
#[derive(Clone)]
pub struct FramePipe {
    inner: Arc<FramePipeInner>,
}

struct FramePipeInner {
    link: Arc<dyn FrameLink>,
    state: Mutex<PipeState>,
    receiver: RwLock<Option<Arc<dyn FrameReceiver>>>,
}

// ============================================================================
// FramePipe - Public API
// ============================================================================

impl FramePipe {
    /// Creates a pipe over a backend link.
    #[must_use]
    pub fn new(link: Arc<dyn FrameLink>) -> Self {
        Self {
            inner: Arc::new(FramePipeInner {
                link,
                state: Mutex::new(PipeState::Created),
                receiver: RwLock::new(None),
            }),
        }
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> PipeState {
        *self.inner.state.lock()
    }

    /// Starts relaying frames.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the pipe is not freshly created, or the link
    /// error.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if *state != PipeState::Created {
            return Err(Error::protocol(format!("cannot start pipe in state {:?}", *state)));
        }
        self.inner.link.start()?;
        *state = PipeState::Started;
        debug!("Frame pipe started");
        Ok(())
    }

    /// Stops relaying frames.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the pipe is not started, or the link error.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if *state != PipeState::Started {
            return Err(Error::protocol(format!("cannot stop pipe in state {:?}", *state)));
        }
        *state = PipeState::Stopped;
        drop(state);

        self.clear_receiver();
        self.inner.link.stop()?;
        debug!("Frame pipe stopped");
        Ok(())
    }

    /// Releases the pipe. Stops it first if still started.
    pub fn dispose(&self) {
        let was_started = {
            let mut state = self.inner.state.lock();
            let was_started = *state == PipeState::Started;
            *state = PipeState::Disposed;
            was_started
        };

        self.clear_receiver();
        if was_started && let Err(e) = self.inner.link.stop() {
            debug!(error = %e, "Link stop failed during dispose");
        }
    }

    /// Sends one frame.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the pipe is not started, or the link error.
    pub fn send_data(
        &self,
        header: &FrameHeader,
        payload: &[u8],
        extra_header: Option<&[u8]>,
    ) -> Result<()> {
        let state = self.state();
        if state != PipeState::Started {
            return Err(Error::protocol(format!("cannot send on pipe in state {state:?}")));
        }
        trace!(id = header.id, seq = header.seq, len = payload.len(), "Frame out");
        self.inner.link.send_data(header, payload, extra_header)
    }

    /// Routes one inbound frame to the receiver.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if the pipe is not started
    /// - [`Error::NotFound`] if no receiver is set
    pub fn recv_data(&self, header: &FrameHeader, payload: Bytes) -> Result<()> {
        let state = self.state();
        if state != PipeState::Started {
            return Err(Error::protocol(format!("cannot receive on pipe in state {state:?}")));
        }

        let receiver = self
            .inner
            .receiver
            .read()
            .clone()
            .ok_or_else(|| Error::not_found("frame receiver"))?;

        trace!(id = header.id, seq = header.seq, len = payload.len(), "Frame in");
        receiver.recv_data(header, payload);
        Ok(())
    }

    /// Sets the inbound frame receiver.
    pub fn set_receiver(&self, receiver: Arc<dyn FrameReceiver>) {
        *self.inner.receiver.write() = Some(receiver);
    }

    /// Clears the inbound frame receiver.
    pub fn clear_receiver(&self) {
        *self.inner.receiver.write() = None;
    }
}

impl fmt::Debug for FramePipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePipe")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

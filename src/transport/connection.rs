//! Device connection state machine.
//!
//! One [`DeviceConnection`] exists per connect attempt. Backends drive it
//! through its transitions; it reports every transition to a
//! [`ConnectionEvents`] sink, which is how the registry learns about it.
//!
//! # States
//!
//! ```text
//!              connected()             begin_close()
//! Connecting ─────────────► Connected ─────────────► Disconnecting
//!     │                         │                          │
//!     │ begin_close()           │ disconnected()           │ disconnected()
//!     ▼                         ▼                          ▼
//! Canceling ──cancel()──────► Closed ◄─────────────────────┘
//! ```
//!
//! # Notification Order
//!
//! For every attempt the sink sees exactly one of:
//!
//! - `connecting, connected, disconnected`
//! - `connecting, connected, canceled`
//! - `connecting, canceled`
//!
//! `connecting` is announced lazily by whichever transition comes first, so
//! a backend that jumps straight to `connected()` still honors the order.
//!
//! # Attach / Detach
//!
//! An upper-layer handle may be attached to a connection. A connection must
//! be detached before [`DeviceConnection::dispose`]; disposing while attached
//! is reported as an error and refused.
//!
//! Callbacks are never invoked while an internal lock is held, so sinks may
//! call back into the connection.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::device::{CancelReason, DeviceApi, LinkStatus};
use crate::error::{Error, Result};
use crate::identifiers::{BackendId, ConnectionId, DeviceHandle, OsData};
use crate::protocol::FrameHeader;

use super::event_loop::EventLoop;
use super::pipe::{FrameLink, FramePipe};

// ============================================================================
// Types
// ============================================================================

/// Hook run once when the connection reaches [`ConnectionState::Closed`].
type ClosedHook = Box<dyn FnOnce(&DeviceConnection) + Send>;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Negotiation in progress.
    Connecting,
    /// Connected, frame pipe running.
    Connected,
    /// Close requested on a connected link.
    Disconnecting,
    /// Close requested during negotiation.
    Canceling,
    /// Terminal state.
    Closed,
}

/// Sink for connection transitions.
pub trait ConnectionEvents: Send + Sync {
    /// Connection attempt started.
    fn connecting(&self, conn: &DeviceConnection);

    /// Connection established; `pipe` is ready to relay frames.
    fn connected(&self, conn: &DeviceConnection, pipe: &FramePipe, api: DeviceApi);

    /// Established connection closed.
    fn disconnected(&self, conn: &DeviceConnection);

    /// Connection attempt canceled.
    fn canceled(&self, conn: &DeviceConnection, reason: CancelReason);

    /// Link status changed on an established connection.
    fn link_status(&self, conn: &DeviceConnection, status: LinkStatus);
}

// ============================================================================
// DeviceConnection
// ============================================================================

/// Per-attempt device connection.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct DeviceConnection {
    pub(crate) inner: Arc<ConnectionInner>,
}

/// Shared connection state.
pub(crate) struct ConnectionInner {
    id: ConnectionId,
    device: DeviceHandle,
    backend: BackendId,
    address: String,
    event_loop: EventLoop,
    events: Arc<dyn ConnectionEvents>,
    slot: Mutex<ConnectionSlot>,
    closed_hooks: Mutex<Vec<ClosedHook>>,
}

struct ConnectionSlot {
    state: ConnectionState,
    announced: bool,
    pipe: Option<FramePipe>,
    attached: Option<OsData>,
}

// ============================================================================
// DeviceConnection - Constructor
// ============================================================================

impl DeviceConnection {
    /// Creates a connection in [`ConnectionState::Connecting`].
    #[must_use]
    pub fn new(
        device: DeviceHandle,
        backend: BackendId,
        address: impl Into<String>,
        events: Arc<dyn ConnectionEvents>,
        event_loop: EventLoop,
    ) -> Self {
        let id = ConnectionId::next();
        let address = address.into();
        debug!(conn = %id, device = %device, backend = %backend, %address, "Connection created");

        Self {
            inner: Arc::new(ConnectionInner {
                id,
                device,
                backend,
                address,
                event_loop,
                events,
                slot: Mutex::new(ConnectionSlot {
                    state: ConnectionState::Connecting,
                    announced: false,
                    pipe: None,
                    attached: None,
                }),
                closed_hooks: Mutex::new(Vec::new()),
            }),
        }
    }
}

// ============================================================================
// DeviceConnection - Accessors
// ============================================================================

impl DeviceConnection {
    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Returns the device handle.
    #[inline]
    #[must_use]
    pub fn device(&self) -> DeviceHandle {
        self.inner.device
    }

    /// Returns the owning backend.
    #[inline]
    #[must_use]
    pub fn backend(&self) -> BackendId {
        self.inner.backend
    }

    /// Returns the device address.
    #[inline]
    #[must_use]
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Returns the event loop.
    #[inline]
    #[must_use]
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.slot.lock().state
    }

    /// Returns the frame pipe, present only while connected.
    #[inline]
    #[must_use]
    pub fn pipe(&self) -> Option<FramePipe> {
        self.inner.slot.lock().pipe.clone()
    }

    /// Returns `true` if both handles refer to the same connection.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ============================================================================
// DeviceConnection - Transitions
// ============================================================================

impl DeviceConnection {
    /// Announces that the connection attempt started.
    ///
    /// Repeated announcements are ignored.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the connection is no longer connecting.
    pub fn connecting(&self) -> Result<()> {
        self.check_state("connecting", &[ConnectionState::Connecting])?;
        if !self.announce_connecting() {
            debug!(conn = %self.inner.id, "Connecting already announced");
        }
        Ok(())
    }

    /// Marks the connection established over `link`.
    ///
    /// Creates and starts the frame pipe, then notifies the sink with it.
    /// If the attempt was canceled meanwhile this is a logged no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if the connection is not connecting
    /// - The pipe start error; the attempt is then canceled
    pub fn connected(&self, link: Arc<dyn FrameLink>, api: DeviceApi) -> Result<()> {
        self.check_state("connected", &[ConnectionState::Connecting])?;
        self.announce_connecting();

        let pipe = {
            let mut slot = self.inner.slot.lock();
            if slot.state != ConnectionState::Connecting {
                warn!(conn = %self.inner.id, state = ?slot.state, "Connected after close request, ignoring");
                return Err(Error::protocol(format!(
                    "connected() in state {:?}",
                    slot.state
                )));
            }
            let pipe = FramePipe::new(link);
            slot.state = ConnectionState::Connected;
            slot.pipe = Some(pipe.clone());
            pipe
        };

        if let Err(e) = pipe.start() {
            error!(conn = %self.inner.id, error = %e, "Failed to start frame pipe");
            self.cancel(CancelReason::Local)?;
            return Err(e);
        }

        debug!(conn = %self.inner.id, device = %self.inner.device, ?api, "Connected");
        self.inner.events.connected(self, &pipe, api);
        Ok(())
    }

    /// Marks an established connection closed.
    ///
    /// Notifies the sink, then stops and disposes the frame pipe. On a
    /// connection that never got established this cancels the attempt
    /// with [`CancelReason::Local`] instead.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the connection is already closed; calling
    /// this twice is an error.
    pub fn disconnected(&self) -> Result<()> {
        let pipe = {
            let mut slot = self.inner.slot.lock();
            if matches!(
                slot.state,
                ConnectionState::Connecting | ConnectionState::Canceling
            ) {
                drop(slot);
                debug!(conn = %self.inner.id, "Disconnected before connected, canceling");
                return self.cancel(CancelReason::Local);
            }
            if !matches!(
                slot.state,
                ConnectionState::Connected | ConnectionState::Disconnecting
            ) {
                error!(conn = %self.inner.id, state = ?slot.state, "disconnected() on a connection that is not connected");
                return Err(Error::protocol(format!(
                    "disconnected() in state {:?}",
                    slot.state
                )));
            }
            slot.state = ConnectionState::Closed;
            slot.pipe.take()
        };

        debug!(conn = %self.inner.id, device = %self.inner.device, "Disconnected");
        self.inner.events.disconnected(self);

        if let Some(pipe) = pipe {
            if let Err(e) = pipe.stop() {
                warn!(conn = %self.inner.id, error = %e, "Failed to stop frame pipe");
            }
            pipe.dispose();
        }

        self.run_closed_hooks();
        Ok(())
    }

    /// Cancels an attempt that could not be started or was asked to stop.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the connection is not connecting or canceling.
    pub fn failed(&self) -> Result<()> {
        self.check_state(
            "failed",
            &[ConnectionState::Connecting, ConnectionState::Canceling],
        )?;
        self.cancel(CancelReason::Local)
    }

    /// Cancels the connection with `reason`.
    ///
    /// Tears down the frame pipe if the connection was established.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the connection is already closed.
    pub fn cancel(&self, reason: CancelReason) -> Result<()> {
        let (announce, pipe) = {
            let mut slot = self.inner.slot.lock();
            if slot.state == ConnectionState::Closed {
                warn!(conn = %self.inner.id, ?reason, "cancel() on a closed connection");
                return Err(Error::protocol("cancel() in state Closed"));
            }
            slot.state = ConnectionState::Closed;
            (!mem::replace(&mut slot.announced, true), slot.pipe.take())
        };

        if announce {
            self.inner.events.connecting(self);
        }

        debug!(conn = %self.inner.id, device = %self.inner.device, ?reason, "Canceled");
        self.inner.events.canceled(self, reason);

        if let Some(pipe) = pipe {
            if let Err(e) = pipe.stop() {
                warn!(conn = %self.inner.id, error = %e, "Failed to stop frame pipe");
            }
            pipe.dispose();
        }

        self.run_closed_hooks();
        Ok(())
    }

    /// Records a close request and returns the state it was made in.
    ///
    /// `Connecting` becomes `Canceling` and `Connected` becomes
    /// `Disconnecting`; other states are left alone.
    pub fn begin_close(&self) -> ConnectionState {
        let mut slot = self.inner.slot.lock();
        let previous = slot.state;
        slot.state = match previous {
            ConnectionState::Connecting => ConnectionState::Canceling,
            ConnectionState::Connected => ConnectionState::Disconnecting,
            other => other,
        };
        previous
    }

    /// Reports a link status change on an established connection.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the connection is not established.
    pub fn link_status_changed(&self, status: LinkStatus) -> Result<()> {
        self.check_state(
            "link_status_changed",
            &[ConnectionState::Connected, ConnectionState::Disconnecting],
        )?;
        debug!(conn = %self.inner.id, ?status, "Link status changed");
        self.inner.events.link_status(self, status);
        Ok(())
    }

    /// Forwards one inbound frame to the frame pipe.
    ///
    /// Errors are logged before being returned; they never affect the
    /// connection state.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if the connection is not established
    /// - The pipe error
    pub fn receive_data(&self, header: &FrameHeader, payload: Bytes) -> Result<()> {
        let pipe = {
            let slot = self.inner.slot.lock();
            match (&slot.pipe, slot.state) {
                (Some(pipe), ConnectionState::Connected) => pipe.clone(),
                (_, state) => {
                    warn!(conn = %self.inner.id, ?state, "Frame received on a connection that is not connected");
                    return Err(Error::protocol(format!("receive_data() in state {state:?}")));
                }
            }
        };

        pipe.recv_data(header, payload).inspect_err(|e| {
            warn!(conn = %self.inner.id, error = %e, "Failed to route inbound frame");
        })
    }
}

// ============================================================================
// DeviceConnection - Attach / Detach
// ============================================================================

impl DeviceConnection {
    /// Attaches the upper-layer handle.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] if a handle is already attached.
    pub fn attach(&self, osdata: OsData) -> Result<()> {
        let mut slot = self.inner.slot.lock();
        if slot.attached.is_some() {
            return Err(Error::busy("connection already attached"));
        }
        slot.attached = Some(osdata);
        Ok(())
    }

    /// Detaches and returns the upper-layer handle.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if nothing is attached.
    pub fn detach(&self) -> Result<OsData> {
        self.inner
            .slot
            .lock()
            .attached
            .take()
            .ok_or_else(|| Error::not_found("attached connection handle"))
    }

    /// Returns `true` while an upper-layer handle is attached.
    #[inline]
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.inner.slot.lock().attached.is_some()
    }

    /// Destroys the connection.
    ///
    /// A connection that is not closed yet is canceled with
    /// [`CancelReason::Local`] first, so the sink and the close hooks
    /// still see it end.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] if an upper-layer handle is still attached. The
    /// violation is logged and the connection left intact.
    pub fn dispose(self) -> Result<()> {
        let state = {
            let slot = self.inner.slot.lock();
            if slot.attached.is_some() {
                error!(
                    conn = %self.inner.id,
                    device = %self.inner.device,
                    "Destroying connection while upper-layer handle is still attached"
                );
                return Err(Error::busy("connection still attached"));
            }
            slot.state
        };

        if state != ConnectionState::Closed {
            debug!(conn = %self.inner.id, ?state, "Disposing connection that is not closed");
            self.cancel(CancelReason::Local)?;
        }

        let pipe = self.inner.slot.lock().pipe.take();
        if let Some(pipe) = pipe {
            pipe.dispose();
        }
        debug!(conn = %self.inner.id, "Connection disposed");
        Ok(())
    }
}

// ============================================================================
// DeviceConnection - Internal
// ============================================================================

impl DeviceConnection {
    /// Drops a connection that never left the backend's start path.
    ///
    /// Nothing is reported to the sink and the close hooks are discarded;
    /// the caller owns any bookkeeping.
    pub(crate) fn discard(self) {
        let pipe = {
            let mut slot = self.inner.slot.lock();
            slot.state = ConnectionState::Closed;
            slot.attached = None;
            slot.pipe.take()
        };
        if let Some(pipe) = pipe {
            pipe.dispose();
        }
        self.inner.closed_hooks.lock().clear();
        debug!(conn = %self.inner.id, "Connection discarded");
    }

    /// Registers a hook run when the connection closes.
    ///
    /// Runs immediately if it is already closed.
    pub(crate) fn on_closed(&self, hook: impl FnOnce(&DeviceConnection) + Send + 'static) {
        if self.state() == ConnectionState::Closed {
            hook(self);
            return;
        }
        self.inner.closed_hooks.lock().push(Box::new(hook));
    }

    fn run_closed_hooks(&self) {
        let hooks = mem::take(&mut *self.inner.closed_hooks.lock());
        for hook in hooks {
            hook(self);
        }
    }

    /// Returns `true` if this call performed the announcement.
    fn announce_connecting(&self) -> bool {
        let first = !mem::replace(&mut self.inner.slot.lock().announced, true);
        if first {
            debug!(conn = %self.inner.id, device = %self.inner.device, "Connecting");
            self.inner.events.connecting(self);
        }
        first
    }

    fn check_state(&self, op: &str, allowed: &[ConnectionState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            return Ok(());
        }
        warn!(conn = %self.inner.id, op, ?state, "Operation not allowed in current state");
        Err(Error::protocol(format!("{op}() in state {state:?}")))
    }
}

// ============================================================================
// Trait Implementations
// ============================================================================

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::DataType;
    use crate::testing::{self, FailingLink, RecordingConnEvents, RecordingLink};

    fn new_conn(events: &Arc<RecordingConnEvents>) -> DeviceConnection {
        DeviceConnection::new(
            testing::handle(1),
            BackendId::next(),
            "192.168.42.1",
            events.clone(),
            EventLoop::current().expect("event loop"),
        )
    }

    #[tokio::test]
    async fn test_connect_then_disconnect_order() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);

        conn.connecting().expect("connecting");
        conn.connected(RecordingLink::new(), DeviceApi::Full)
            .expect("connected");
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.pipe().is_some());

        conn.disconnected().expect("disconnected");
        assert_eq!(events.take(), ["connecting", "connected:Full", "disconnected"]);
        assert!(conn.pipe().is_none());
    }

    #[tokio::test]
    async fn test_connected_announces_connecting() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);

        conn.connected(RecordingLink::new(), DeviceApi::Full)
            .expect("connected");
        assert_eq!(events.take(), ["connecting", "connected:Full"]);
    }

    #[tokio::test]
    async fn test_cancel_announces_connecting() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);

        conn.failed().expect("failed");
        assert_eq!(events.take(), ["connecting", "canceled:Local"]);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_cancel_after_connected() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);
        let link = RecordingLink::new();

        conn.connected(link.clone(), DeviceApi::Full).expect("connected");
        conn.cancel(CancelReason::Remote).expect("cancel");

        assert_eq!(events.take(), ["connecting", "connected:Full", "canceled:Remote"]);
        assert_eq!(link.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_connected_after_close_request_is_noop() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);

        conn.connecting().expect("connecting");
        assert_eq!(conn.begin_close(), ConnectionState::Connecting);

        assert!(conn.connected(RecordingLink::new(), DeviceApi::Full).is_err());
        conn.cancel(CancelReason::Local).expect("cancel");
        assert_eq!(events.take(), ["connecting", "canceled:Local"]);
    }

    #[tokio::test]
    async fn test_failed_after_close_request_cancels() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);

        assert_eq!(conn.begin_close(), ConnectionState::Connecting);
        conn.failed().expect("failed");

        assert_eq!(events.take(), ["connecting", "canceled:Local"]);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_disconnected_before_connected_cancels() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);
        conn.begin_close();

        conn.disconnected().expect("disconnected");
        assert_eq!(events.take(), ["connecting", "canceled:Local"]);
        assert!(conn.disconnected().is_err());
    }

    #[tokio::test]
    async fn test_dispose_before_close_runs_hooks() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);
        let hits = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&hits);
        conn.on_closed(move |_| *counter.lock() += 1);
        conn.clone().dispose().expect("dispose");

        assert_eq!(*hits.lock(), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(events.take(), ["connecting", "canceled:Local"]);
    }

    #[tokio::test]
    async fn test_failed_requires_connecting() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);
        conn.connected(RecordingLink::new(), DeviceApi::Full)
            .expect("connected");

        assert!(conn.failed().is_err());
    }

    #[tokio::test]
    async fn test_disconnected_twice_is_error() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);
        conn.connected(RecordingLink::new(), DeviceApi::Full)
            .expect("connected");

        conn.disconnected().expect("first disconnect");
        let err = conn.disconnected().unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        assert_eq!(events.take().iter().filter(|e| *e == "disconnected").count(), 1);
    }

    #[tokio::test]
    async fn test_pipe_start_failure_cancels() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);

        assert!(conn.connected(Arc::new(FailingLink), DeviceApi::Full).is_err());
        assert_eq!(events.take(), ["connecting", "canceled:Local"]);
    }

    #[tokio::test]
    async fn test_receive_data_requires_connected() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);
        let header = FrameHeader::new(DataType::Data, 127, 0);

        assert!(conn.receive_data(&header, Bytes::from_static(&[1])).is_err());
    }

    #[tokio::test]
    async fn test_link_status_forwarded_when_connected() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);
        assert!(conn.link_status_changed(LinkStatus::Down).is_err());

        conn.connected(RecordingLink::new(), DeviceApi::Full)
            .expect("connected");
        conn.link_status_changed(LinkStatus::Down)
            .expect("link status");
        assert_eq!(events.take().last().map(String::as_str), Some("link:Down"));
    }

    #[tokio::test]
    async fn test_closed_hook_runs_once() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);
        let hits = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&hits);
        conn.on_closed(move |_| *counter.lock() += 1);
        conn.failed().expect("failed");
        assert!(conn.cancel(CancelReason::Local).is_err());

        assert_eq!(*hits.lock(), 1);
    }

    #[tokio::test]
    async fn test_attach_detach() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);

        conn.attach(Arc::new("upper")).expect("attach");
        assert!(conn.attach(Arc::new("again")).is_err());
        assert!(conn.is_attached());

        let osdata = conn.detach().expect("detach");
        assert_eq!(osdata.downcast_ref::<&str>(), Some(&"upper"));
        assert!(conn.detach().is_err());
    }

    #[tokio::test]
    async fn test_dispose_while_attached_is_logged() {
        let events = RecordingConnEvents::new();
        let conn = new_conn(&events);
        conn.attach(Arc::new(7_u32)).expect("attach");

        let (result, logs) = testing::capture_logs(|| conn.clone().dispose());

        assert!(matches!(result, Err(Error::Busy { .. })));
        assert!(logs.contains("still attached"));
        assert!(conn.is_attached());

        conn.detach().expect("detach");
        conn.dispose().expect("dispose");
    }
}

//! TCP proxy through a device transport.
//!
//! A proxy binds a local TCP endpoint relaying to a service only reachable
//! through the device link (RTSP over MUX). The transport reports the
//! outcome through [`TcpProxy::notify_open`] and [`TcpProxy::notify_closed`];
//! the listener sees exactly one [`ProxyListener::opened`] callback.
//!
//! A close reported after a successful open is logged and swallowed: the
//! listener is not told about it.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::device::DeviceType;
use crate::error::{Error, Result};
use crate::identifiers::{DeviceHandle, ProxyId};

// ============================================================================
// Types
// ============================================================================

/// Local endpoint of an open proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// Local bind address, if the transport reports one.
    pub address: Option<String>,
    /// Local port.
    pub port: u16,
}

/// Proxy lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyState {
    /// Waiting for the transport.
    Opening,
    /// Open on the given endpoint.
    Open(ProxyEndpoint),
    /// Open failed.
    Failed,
    /// Closed by the owner.
    Closed,
}

/// Receiver of the open result.
pub trait ProxyListener: Send + Sync {
    /// Called exactly once with the open outcome.
    fn opened(&self, proxy: &TcpProxy, result: Result<ProxyEndpoint>);
}

// ============================================================================
// TcpProxy
// ============================================================================

/// A TCP proxy to a remote port behind a device.
#[derive(Clone)]
pub struct TcpProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    id: ProxyId,
    device: DeviceHandle,
    device_type: DeviceType,
    remote_port: u16,
    listener: Arc<dyn ProxyListener>,
    state: Mutex<ProxyState>,
}

// ============================================================================
// TcpProxy - Public API
// ============================================================================

impl TcpProxy {
    /// Creates a proxy in [`ProxyState::Opening`].
    #[must_use]
    pub fn new(
        device: DeviceHandle,
        device_type: DeviceType,
        remote_port: u16,
        listener: Arc<dyn ProxyListener>,
    ) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                id: ProxyId::next(),
                device,
                device_type,
                remote_port,
                listener,
                state: Mutex::new(ProxyState::Opening),
            }),
        }
    }

    /// Returns the proxy id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ProxyId {
        self.inner.id
    }

    /// Returns the device the proxy goes through.
    #[inline]
    #[must_use]
    pub fn device(&self) -> DeviceHandle {
        self.inner.device
    }

    /// Returns the type of the device serving the remote port.
    #[inline]
    #[must_use]
    pub fn device_type(&self) -> DeviceType {
        self.inner.device_type
    }

    /// Returns the remote port.
    #[inline]
    #[must_use]
    pub fn remote_port(&self) -> u16 {
        self.inner.remote_port
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ProxyState {
        self.inner.state.lock().clone()
    }

    /// Returns the local endpoint once open.
    #[must_use]
    pub fn endpoint(&self) -> Option<ProxyEndpoint> {
        match &*self.inner.state.lock() {
            ProxyState::Open(endpoint) => Some(endpoint.clone()),
            _ => None,
        }
    }

    /// Reports the open outcome. Only the first report reaches the listener.
    pub fn notify_open(&self, result: Result<ProxyEndpoint>) {
        {
            let mut state = self.inner.state.lock();
            if *state != ProxyState::Opening {
                warn!(proxy = %self.inner.id, state = ?*state, "Late proxy open report ignored");
                return;
            }
            *state = match &result {
                Ok(endpoint) => ProxyState::Open(endpoint.clone()),
                Err(_) => ProxyState::Failed,
            };
        }

        match &result {
            Ok(endpoint) => debug!(proxy = %self.inner.id, port = endpoint.port, "Proxy open"),
            Err(e) => warn!(proxy = %self.inner.id, error = %e, "Proxy open failed"),
        }
        self.inner.listener.opened(self, result);
    }

    /// Reports that the transport closed the proxy.
    ///
    /// Before a successful open this is reported to the listener as an open
    /// failure; afterwards it is only logged.
    pub fn notify_closed(&self) {
        let state = self.state();
        match state {
            ProxyState::Opening => {
                self.notify_open(Err(Error::transport("proxy closed before open")));
            }
            ProxyState::Open(_) => {
                warn!(proxy = %self.inner.id, "Unexpected proxy close after open");
                *self.inner.state.lock() = ProxyState::Closed;
            }
            ProxyState::Failed | ProxyState::Closed => {}
        }
    }

    /// Closes the proxy without notifying the listener.
    pub fn close(&self) {
        *self.inner.state.lock() = ProxyState::Closed;
        debug!(proxy = %self.inner.id, "Proxy closed");
    }
}

impl fmt::Debug for TcpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpProxy")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .field("remote_port", &self.inner.remote_port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Stream source selection.
//!
//! Decides how a device's RTSP stream is reached; decoding stays with the
//! [`StreamSession`] supplied by the embedding layer.
//!
//! | Backend | Device types | Access |
//! |---------|--------------|--------|
//! | Net | Anafi 4K, Thermal, UA, USA | `rtsp://{address}/{url}` |
//! | MUX | SkyController 3, SkyController UA | TCP proxy to port 554, then `rtsp://127.0.0.1:{port}/{url}` over MUX |
//!
//! Every other combination is not implemented.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{BackendKind, MuxChannel};
use crate::device::{DeviceInfo, DeviceType};
use crate::error::{Error, Result};
use crate::identifiers::DeviceHandle;
use crate::registry::Registry;
use crate::transport::{ProxyEndpoint, ProxyListener, TcpProxy};

// ============================================================================
// Constants
// ============================================================================

/// Remote RTSP port behind a remote controller.
pub const RTSP_PORT: u16 = 554;

// ============================================================================
// StreamSession
// ============================================================================

/// Media session opened on a resolved URL.
pub trait StreamSession: Send + Sync {
    /// Opens `url` directly.
    fn open_url(&self, url: &str) -> Result<()>;

    /// Opens `url` through the multiplexed `channel`.
    fn open_url_mux(&self, url: &str, channel: Arc<dyn MuxChannel>) -> Result<()>;

    /// The stream could not be reached.
    fn open_failed(&self, _error: &Error) {}
}

// ============================================================================
// StreamSource
// ============================================================================

/// RTSP stream source of one device.
pub struct StreamSource {
    registry: Registry,
    handle: DeviceHandle,
    url: String,
    proxy: Mutex<Option<TcpProxy>>,
}

impl StreamSource {
    /// Creates a source for `url` on a registered device.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceNotFound`] if the handle is unknown.
    pub fn new(registry: &Registry, handle: DeviceHandle, url: impl Into<String>) -> Result<Self> {
        registry.get_device(handle)?;
        Ok(Self {
            registry: registry.clone(),
            handle,
            url: url.into(),
            proxy: Mutex::new(None),
        })
    }

    /// Returns the stream path.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Opens the stream on `session`.
    ///
    /// Network devices open synchronously. MUX devices open once the TCP
    /// proxy is up; proxy failures reach [`StreamSession::open_failed`].
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if the device was removed
    /// - [`Error::NotImplemented`] for unsupported backend and device types
    /// - [`Error::Busy`] if a proxy is already open
    /// - The session or proxy error
    pub fn open(&self, session: Arc<dyn StreamSession>) -> Result<()> {
        let info = self.registry.get_device(self.handle)?;
        let path = self.url.trim_start_matches('/');

        match info.backend_kind {
            BackendKind::Net if is_net_streamable(info.device_type) => {
                let url = format!("rtsp://{}/{path}", info.address);
                debug!(device = %self.handle, %url, "Opening direct stream");
                session.open_url(&url)
            }
            BackendKind::Mux => {
                let target = mux_target(info.device_type).ok_or_else(|| unsupported(&info))?;
                self.open_proxied(session, target, path)
            }
            _ => Err(unsupported(&info)),
        }
    }

    /// Closes the proxy, if any.
    pub fn close(&self) {
        if let Some(proxy) = self.proxy.lock().take() {
            debug!(device = %self.handle, proxy = %proxy.id(), "Closing stream proxy");
            proxy.close();
        }
    }

    fn open_proxied(
        &self,
        session: Arc<dyn StreamSession>,
        target: DeviceType,
        path: &str,
    ) -> Result<()> {
        let mut slot = self.proxy.lock();
        if slot.is_some() {
            return Err(Error::busy("stream proxy already open"));
        }

        let channel = self.registry.mux_channel(self.handle)?;
        let listener = Arc::new(StreamProxyListener {
            session,
            channel,
            path: path.to_string(),
        });
        let proxy = self
            .registry
            .create_tcp_proxy(self.handle, target, RTSP_PORT, listener)?;

        debug!(device = %self.handle, proxy = %proxy.id(), %target, "Stream proxy opening");
        *slot = Some(proxy);
        Ok(())
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSource")
            .field("handle", &self.handle)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct StreamProxyListener {
    session: Arc<dyn StreamSession>,
    channel: Arc<dyn MuxChannel>,
    path: String,
}

impl ProxyListener for StreamProxyListener {
    fn opened(&self, proxy: &TcpProxy, result: Result<ProxyEndpoint>) {
        let outcome = result.and_then(|endpoint| {
            let url = format!("rtsp://127.0.0.1:{}/{}", endpoint.port, self.path);
            debug!(proxy = %proxy.id(), %url, "Opening stream through proxy");
            self.session.open_url_mux(&url, Arc::clone(&self.channel))
        });

        if let Err(e) = outcome {
            warn!(proxy = %proxy.id(), error = %e, "Failed to open proxied stream");
            self.session.open_failed(&e);
        }
    }
}

fn is_net_streamable(device_type: DeviceType) -> bool {
    matches!(
        device_type,
        DeviceType::ANAFI_4K
            | DeviceType::ANAFI_THERMAL
            | DeviceType::ANAFI_UA
            | DeviceType::ANAFI_USA
    )
}

/// Drone type reached through a remote controller.
fn mux_target(remote: DeviceType) -> Option<DeviceType> {
    match remote {
        DeviceType::SKYCTRL_3 => Some(DeviceType::ANAFI_4K),
        DeviceType::SKYCTRL_UA => Some(DeviceType::ANAFI_UA),
        _ => None,
    }
}

fn unsupported(info: &DeviceInfo) -> Error {
    Error::not_implemented(format!(
        "no stream for {} device {}",
        info.backend_kind, info.device_type
    ))
}

// ============================================================================
// Tests
// ============================================================================

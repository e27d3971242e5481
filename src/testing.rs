//! Shared fixtures for unit tests.
//!
//! Recording listeners keep what they observe behind a mutex and expose it
//! as plain values, so assertions read as `assert_eq!(x.events(), [...])`.

// ============================================================================
// Imports
// ============================================================================

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

use crate::backend::{
    BackendKind, BleConnection, BleSessionHost, MuxChannel, MuxOpener, MuxOps, NetConnector,
};
use crate::device::{
    CancelReason, DeviceApi, DeviceInfo, DeviceListener, DeviceType, LinkStatus, StreamSession,
};
use crate::error::{Error, Result};
use crate::identifiers::DeviceHandle;
use crate::protocol::{Command, FrameHeader};
use crate::registry::{DeviceEvents, Registry, RegistryListener};
use crate::transport::{
    CommandListener, ConnectionEvents, DeviceConnection, EventLoop, FrameLink, FramePipe,
    FrameReceiver, ProxyEndpoint, ProxyListener, TcpProxy,
};

// ============================================================================
// Helpers
// ============================================================================

/// Returns a valid device handle.
pub fn handle(raw: u16) -> DeviceHandle {
    DeviceHandle::new(raw).expect("valid handle")
}

/// Lets deferred event-loop work run.
pub async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

/// Runs `f` and returns what it logged.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .finish();

    let result = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.0.lock()).into_owned();
    (result, logs)
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Builds a registry on the current runtime with a recording listener.
pub fn registry() -> (Registry, Arc<RecordingRegistryListener>) {
    let listener = RecordingRegistryListener::new();
    let registry = Registry::builder()
        .listener(listener.clone())
        .event_loop(EventLoop::current().expect("event loop"))
        .build()
        .expect("registry");
    (registry, listener)
}

fn info(
    id: &str,
    device_type: DeviceType,
    backend_kind: BackendKind,
    address: &str,
    port: u16,
) -> DeviceInfo {
    DeviceInfo {
        id: id.to_string(),
        name: id.to_string(),
        device_type,
        backend_kind,
        address: address.to_string(),
        port,
        api: DeviceApi::Unknown,
    }
}

/// Descriptor of a network device.
pub fn net_info(id: &str, device_type: DeviceType) -> DeviceInfo {
    info(id, device_type, BackendKind::Net, "192.168.42.1", 44444)
}

/// Descriptor of a BLE device.
pub fn ble_info(address: &str, device_type: DeviceType) -> DeviceInfo {
    info(address, device_type, BackendKind::Ble, address, 0)
}

/// Descriptor of a device behind a MUX link.
pub fn mux_info(name: &str, device_type: DeviceType) -> DeviceInfo {
    info(name, device_type, BackendKind::Mux, "mux", 0)
}

// ============================================================================
// Links
// ============================================================================

/// Frame link recording what is sent.
#[derive(Default)]
pub struct RecordingLink {
    sent: Mutex<Vec<(FrameHeader, Vec<u8>)>>,
    stops: AtomicUsize,
    rejects: AtomicUsize,
}

impl RecordingLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(FrameHeader, Vec<u8>)> {
        self.sent.lock().clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Makes the next `count` sends fail without recording them.
    pub fn reject_sends(&self, count: usize) {
        self.rejects.store(count, Ordering::SeqCst);
    }
}

impl FrameLink for RecordingLink {
    fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send_data(
        &self,
        header: &FrameHeader,
        payload: &[u8],
        _extra_header: Option<&[u8]>,
    ) -> Result<()> {
        let rejected = self
            .rejects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(Error::transport("link busy"));
        }
        self.sent.lock().push((*header, payload.to_vec()));
        Ok(())
    }
}

/// Frame link that cannot start.
pub struct FailingLink;

impl FrameLink for FailingLink {
    fn start(&self) -> Result<()> {
        Err(Error::transport("link refused to start"))
    }

    fn send_data(
        &self,
        _header: &FrameHeader,
        _payload: &[u8],
        _extra_header: Option<&[u8]>,
    ) -> Result<()> {
        Err(Error::transport("link down"))
    }
}

/// Frame receiver recording inbound frames.
#[derive(Default)]
pub struct RecordingReceiver {
    frames: Mutex<Vec<(FrameHeader, Vec<u8>)>>,
}

impl RecordingReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<(FrameHeader, Vec<u8>)> {
        self.frames.lock().clone()
    }
}

impl FrameReceiver for RecordingReceiver {
    fn recv_data(&self, header: &FrameHeader, payload: Bytes) {
        self.frames.lock().push((*header, payload.to_vec()));
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Connection events as strings.
#[derive(Default)]
pub struct RecordingConnEvents {
    events: Mutex<Vec<String>>,
}

impl RecordingConnEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drains recorded events.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock())
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl ConnectionEvents for RecordingConnEvents {
    fn connecting(&self, _conn: &DeviceConnection) {
        self.push("connecting".to_string());
    }

    fn connected(&self, _conn: &DeviceConnection, _pipe: &FramePipe, api: DeviceApi) {
        self.push(format!("connected:{api:?}"));
    }

    fn disconnected(&self, _conn: &DeviceConnection) {
        self.push("disconnected".to_string());
    }

    fn canceled(&self, _conn: &DeviceConnection, reason: CancelReason) {
        self.push(format!("canceled:{reason:?}"));
    }

    fn link_status(&self, _conn: &DeviceConnection, status: LinkStatus) {
        self.push(format!("link:{status:?}"));
    }
}

/// Commands and link quality delivered by a command interface.
#[derive(Default)]
pub struct RecordingCommands {
    received: Mutex<Vec<Command>>,
    quality: Mutex<Vec<(i32, i32, i32)>>,
}

impl RecordingCommands {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<Command> {
        self.received.lock().clone()
    }

    pub fn link_quality(&self) -> Vec<(i32, i32, i32)> {
        self.quality.lock().clone()
    }
}

impl CommandListener for RecordingCommands {
    fn command_received(&self, command: &Command) {
        self.received.lock().push(command.clone());
    }

    fn link_quality(&self, tx: i32, rx: i32, rx_useful: i32) {
        self.quality.lock().push((tx, rx, rx_useful));
    }
}

/// Proxy outcomes: the local port, or the errno.
#[derive(Default)]
pub struct RecordingProxyListener {
    results: Mutex<Vec<std::result::Result<u16, i32>>>,
}

impl RecordingProxyListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn results(&self) -> Vec<std::result::Result<u16, i32>> {
        self.results.lock().clone()
    }
}

impl ProxyListener for RecordingProxyListener {
    fn opened(&self, _proxy: &TcpProxy, result: Result<ProxyEndpoint>) {
        self.results
            .lock()
            .push(result.map(|endpoint| endpoint.port).map_err(|e| e.errno()));
    }
}

/// Devices added to and removed from a registry.
#[derive(Default)]
pub struct RecordingRegistryListener {
    added: Mutex<Vec<DeviceHandle>>,
    removed: Mutex<Vec<DeviceHandle>>,
}

impl RecordingRegistryListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn added(&self) -> Vec<DeviceHandle> {
        self.added.lock().clone()
    }

    pub fn removed(&self) -> Vec<DeviceHandle> {
        self.removed.lock().clone()
    }
}

impl RegistryListener for RecordingRegistryListener {
    fn device_added(&self, handle: DeviceHandle, _info: &DeviceInfo) {
        self.added.lock().push(handle);
    }

    fn device_removed(&self, handle: DeviceHandle) {
        self.removed.lock().push(handle);
    }
}

/// Registry-level device events as strings.
#[derive(Default)]
pub struct RecordingDeviceEvents {
    events: Mutex<Vec<String>>,
}

impl RecordingDeviceEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drains recorded events.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock())
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl DeviceEvents for RecordingDeviceEvents {
    fn connecting(&self) {
        self.push("connecting".to_string());
    }

    fn connected(&self, api: DeviceApi) {
        self.push(format!("connected:{api:?}"));
    }

    fn disconnected(&self, removing: bool) {
        self.push(format!("disconnected:{removing}"));
    }

    fn canceled(&self, reason: CancelReason, removing: bool) {
        self.push(format!("canceled:{reason:?}:{removing}"));
    }

    fn link_status(&self, status: LinkStatus) {
        self.push(format!("link:{status:?}"));
    }
}

/// Controller notifications, timer ticks and received commands.
#[derive(Default)]
pub struct RecordingDeviceListener {
    events: Mutex<Vec<String>>,
    ticks: AtomicUsize,
    commands: Mutex<Vec<Vec<u8>>>,
}

impl RecordingDeviceListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn ticks(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.commands.lock().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl DeviceListener for RecordingDeviceListener {
    fn connecting(&self) {
        self.push("connecting".to_string());
    }

    fn connected(&self, api: DeviceApi) {
        self.push(format!("connected:{api:?}"));
    }

    fn disconnected(&self, removing: bool) {
        self.push(format!("disconnected:{removing}"));
    }

    fn connection_canceled(&self, reason: CancelReason, removing: bool) {
        self.push(format!("canceled:{reason:?}:{removing}"));
    }

    fn link_status_changed(&self, status: LinkStatus) {
        self.push(format!("link:{status:?}"));
    }

    fn command_received(&self, command: &Command) {
        self.commands.lock().push(command.data().to_vec());
    }

    fn no_ack_cmd_timer_tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }
}

/// Stream session recording opened URLs.
#[derive(Default)]
pub struct RecordingStreamSession {
    urls: Mutex<Vec<String>>,
    mux_urls: Mutex<Vec<String>>,
    failures: AtomicUsize,
}

impl RecordingStreamSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }

    pub fn mux_urls(&self) -> Vec<String> {
        self.mux_urls.lock().clone()
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl StreamSession for RecordingStreamSession {
    fn open_url(&self, url: &str) -> Result<()> {
        self.urls.lock().push(url.to_string());
        Ok(())
    }

    fn open_url_mux(&self, url: &str, _channel: Arc<dyn MuxChannel>) -> Result<()> {
        self.mux_urls.lock().push(url.to_string());
        Ok(())
    }

    fn open_failed(&self, _error: &Error) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Network Mock
// ============================================================================

/// Network connector recording handshake requests.
#[derive(Default)]
pub struct MockNetConnector {
    opens: Mutex<Vec<(DeviceConnection, u16, Vec<u8>)>>,
    fail_next: Mutex<bool>,
    closes: AtomicUsize,
}

impl MockNetConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_open(&self) -> Option<(DeviceConnection, u16, Vec<u8>)> {
        self.opens.lock().last().cloned()
    }

    /// Makes the next `open` fail.
    pub fn fail_next_open(&self) {
        *self.fail_next.lock() = true;
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl NetConnector for MockNetConnector {
    fn open(&self, conn: &DeviceConnection, port: u16, request: &[u8]) -> Result<()> {
        if std::mem::take(&mut *self.fail_next.lock()) {
            return Err(Error::transport("connection refused"));
        }
        self.opens.lock().push((conn.clone(), port, request.to_vec()));
        Ok(())
    }

    fn close(&self, _conn: &DeviceConnection) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// BLE Mock
// ============================================================================

/// How [`MockBleHost`] answers session requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMode {
    /// Opens the session and attaches a handle.
    Attach,
    /// Fails to open the session.
    Refuse,
    /// Opens the session without attaching.
    AcceptWithoutAttach,
}

/// BLE host keeping opened sessions by address.
pub struct MockBleHost {
    mode: HostMode,
    connections: Mutex<Vec<(String, BleConnection)>>,
    closed: Mutex<Vec<String>>,
}

impl MockBleHost {
    pub fn new(mode: HostMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            connections: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        })
    }

    pub fn connection(&self, address: &str) -> Option<BleConnection> {
        self.connections
            .lock()
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, c)| c.clone())
    }

    /// Addresses whose session closing was requested.
    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().clone()
    }
}

impl BleSessionHost for MockBleHost {
    fn open_connection(&self, address: &str, connection: BleConnection) -> bool {
        match self.mode {
            HostMode::Refuse => return false,
            HostMode::Attach => {
                if connection.attach(Arc::new(address.to_string())).is_err() {
                    return false;
                }
            }
            HostMode::AcceptWithoutAttach => {}
        }
        self.connections.lock().push((address.to_string(), connection));
        true
    }

    fn close_connection(&self, address: &str) {
        self.closed.lock().push(address.to_string());
    }
}

// ============================================================================
// MUX Mock
// ============================================================================

/// MUX opener handing out [`MockMuxChannel`]s.
#[derive(Default)]
pub struct MockMuxOpener {
    failing: bool,
    channel: Mutex<Weak<MockMuxChannel>>,
    live: Arc<AtomicUsize>,
    on_eof: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    on_release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MockMuxOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// An opener whose `open` always fails.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            failing: true,
            ..Self::default()
        })
    }

    /// Channels opened and neither shut down nor dropped.
    pub fn live_channels(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> Option<Arc<MockMuxChannel>> {
        self.channel.lock().upgrade()
    }

    /// Simulates the peer closing the link.
    pub fn fire_eof(&self) {
        let on_eof = self.on_eof.lock().clone();
        if let Some(on_eof) = on_eof {
            on_eof();
        }
    }

    /// Simulates the channel releasing its resources.
    pub fn fire_release(&self) {
        let on_release = self.on_release.lock().take();
        if let Some(on_release) = on_release {
            on_release();
        }
    }
}

impl MuxOpener for MockMuxOpener {
    fn open(&self, fd: i32, _event_loop: &EventLoop, ops: MuxOps) -> Result<Arc<dyn MuxChannel>> {
        if self.failing {
            return Err(Error::transport(format!("cannot open MUX on fd {fd}")));
        }

        let MuxOps { on_eof, on_release } = ops;
        *self.on_eof.lock() = Some(Arc::from(on_eof));
        *self.on_release.lock() = Some(on_release);

        self.live.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(MockMuxChannel {
            live: Arc::clone(&self.live),
            sent: AtomicUsize::new(0),
            shut_down: Mutex::new(false),
            proxies: Mutex::new(Vec::new()),
        });
        *self.channel.lock() = Arc::downgrade(&channel);
        Ok(channel)
    }
}

/// Channel counting frames and recording proxy requests.
pub struct MockMuxChannel {
    live: Arc<AtomicUsize>,
    sent: AtomicUsize,
    shut_down: Mutex<bool>,
    proxies: Mutex<Vec<TcpProxy>>,
}

impl MockMuxChannel {
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shut_down.lock()
    }

    /// Remote ports of the requested proxies.
    pub fn proxies(&self) -> Vec<u16> {
        self.proxies.lock().iter().map(TcpProxy::remote_port).collect()
    }

    pub fn last_proxy(&self) -> Option<TcpProxy> {
        self.proxies.lock().last().cloned()
    }
}

impl MuxChannel for MockMuxChannel {
    fn send_frame(
        &self,
        _header: &FrameHeader,
        _payload: &[u8],
        _extra_header: Option<&[u8]>,
    ) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::transport("MUX channel shut down"));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn open_tcp_proxy(&self, proxy: &TcpProxy) -> Result<()> {
        self.proxies.lock().push(proxy.clone());
        Ok(())
    }

    fn shutdown(&self) {
        let mut shut_down = self.shut_down.lock();
        if !*shut_down {
            *shut_down = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockMuxChannel {
    fn drop(&mut self) {
        if !*self.shut_down.get_mut() {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

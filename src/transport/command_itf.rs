//! Command interface.
//!
//! Created once per established connection, on top of its frame pipe.
//!
//! # Outbound
//!
//! | Buffer class | Frame | Buffer id | Delivery |
//! |--------------|-------|-----------|----------|
//! | Non-ack | `Data` | 10 | Sent once |
//! | Ack | `DataWithAck` | 11 | FIFO, one in flight, retried every 150 ms |
//!
//! An ack command is retried at most [`MAX_ACK_RETRIES`] times, then
//! dropped with a warning and the next queued command goes out.
//!
//! # Inbound
//!
//! - `DataWithAck` frames are acknowledged on `id + 128`; a frame repeating
//!   the last sequence number of its buffer is acknowledged again but not
//!   delivered twice.
//! - Pings are echoed as pongs.
//! - Every decoded command is handed unmodified to the
//!   [`CommandListener`].

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identifiers::DeviceHandle;
use crate::protocol::{
    BufferType, Command, CommandDirection, CommandLogConfig, DataType, FrameHeader, buffer_id,
    log_command,
};

use super::event_loop::{EventLoop, OneShotTimer};
use super::pipe::{FramePipe, FrameReceiver};

// ============================================================================
// Constants
// ============================================================================

/// Delay before an unacknowledged command is sent again.
pub const ACK_RETRY_DELAY: Duration = Duration::from_millis(150);

/// Retransmissions attempted before an ack command is dropped.
pub const MAX_ACK_RETRIES: u32 = 5;

// ============================================================================
// CommandListener
// ============================================================================

/// Receiver of decoded inbound commands.
pub trait CommandListener: Send + Sync {
    /// A command was received from the device.
    fn command_received(&self, command: &Command);

    /// Link quality report, percentages in `0..=100`.
    fn link_quality(&self, _tx: i32, _rx: i32, _rx_useful: i32) {}
}

// ============================================================================
// State
// ============================================================================

struct InFlight {
    seq: u8,
    data: Bytes,
    retries: u32,
}

#[derive(Default)]
struct ItfState {
    closed: bool,
    tx_seq: FxHashMap<u8, u8>,
    rx_seq: FxHashMap<u8, u8>,
    ack_queue: VecDeque<Bytes>,
    in_flight: Option<InFlight>,
    retry_timer: Option<OneShotTimer>,
}

impl ItfState {
    fn next_seq(&mut self, id: u8) -> u8 {
        let seq = self.tx_seq.entry(id).or_insert(u8::MAX);
        *seq = seq.wrapping_add(1);
        *seq
    }
}

// ============================================================================
// CommandInterface
// ============================================================================

/// Command multiplexer of one connection.
#[derive(Clone)]
pub struct CommandInterface {
    inner: Arc<ItfInner>,
}

struct ItfInner {
    device: DeviceHandle,
    pipe: FramePipe,
    event_loop: EventLoop,
    listener: Arc<dyn CommandListener>,
    log: Arc<CommandLogConfig>,
    state: Mutex<ItfState>,
}

/// Pipe receiver holding the interface weakly.
struct ItfReceiver(Weak<ItfInner>);

impl FrameReceiver for ItfReceiver {
    fn recv_data(&self, header: &FrameHeader, payload: Bytes) {
        if let Some(inner) = self.0.upgrade() {
            inner.recv_frame(header, payload);
        }
    }
}

// ============================================================================
// CommandInterface - Public API
// ============================================================================

impl CommandInterface {
    /// Creates the interface and registers it as the pipe receiver.
    #[must_use]
    pub fn new(
        device: DeviceHandle,
        pipe: FramePipe,
        event_loop: EventLoop,
        listener: Arc<dyn CommandListener>,
        log: Arc<CommandLogConfig>,
    ) -> Self {
        let inner = Arc::new(ItfInner {
            device,
            pipe,
            event_loop,
            listener,
            log,
            state: Mutex::new(ItfState::default()),
        });
        inner
            .pipe
            .set_receiver(Arc::new(ItfReceiver(Arc::downgrade(&inner))));

        debug!(device = %device, "Command interface created");
        Self { inner }
    }

    /// Returns the device handle.
    #[inline]
    #[must_use]
    pub fn device(&self) -> DeviceHandle {
        self.inner.device
    }

    /// Sends a command.
    ///
    /// Non-ack commands go out immediately. Ack commands are queued and go
    /// out as soon as no other ack command is in flight.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if the interface is closed
    /// - [`Error::InvalidArgument`] if the command has no valid buffer class
    /// - The transport error when the frame is sent immediately
    pub fn send(&self, command: &Command) -> Result<()> {
        let inner = &self.inner;

        match command.buffer_type() {
            BufferType::NonAck => {
                let seq = {
                    let mut state = inner.state.lock();
                    if state.closed {
                        return Err(Error::protocol("command interface closed"));
                    }
                    state.next_seq(buffer_id::C2D_NON_ACK)
                };
                log_command(&inner.log, CommandDirection::Tx, inner.device, command);
                let header = FrameHeader::new(DataType::Data, buffer_id::C2D_NON_ACK, seq);
                inner.pipe.send_data(&header, command.data(), None)
            }
            BufferType::Ack => {
                let idle = {
                    let mut state = inner.state.lock();
                    if state.closed {
                        return Err(Error::protocol("command interface closed"));
                    }
                    state.ack_queue.push_back(command.data().clone());
                    state.in_flight.is_none()
                };
                log_command(&inner.log, CommandDirection::Tx, inner.device, command);
                if idle {
                    inner.pump_ack_queue()
                } else {
                    Ok(())
                }
            }
            BufferType::Invalid => Err(Error::invalid_argument(format!(
                "command {}/{} has no buffer class",
                command.feature(),
                command.command_id()
            ))),
        }
    }

    /// Returns the number of ack commands queued or in flight.
    #[must_use]
    pub fn pending_ack_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.ack_queue.len() + usize::from(state.in_flight.is_some())
    }

    /// Reports link quality for diagnostics.
    pub fn report_link_quality(&self, tx: i32, rx: i32, rx_useful: i32) {
        debug!(device = %self.inner.device, tx, rx, rx_useful, "Link quality");
        self.inner.listener.link_quality(tx, rx, rx_useful);
    }

    /// Closes the interface: drops queued commands and stops retries.
    pub fn close(&self) {
        let timer = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.ack_queue.clear();
            state.in_flight = None;
            state.retry_timer.take()
        };
        drop(timer);
        self.inner.pipe.clear_receiver();
        debug!(device = %self.inner.device, "Command interface closed");
    }

    /// Returns `true` once closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

// ============================================================================
// Outbound
// ============================================================================

impl ItfInner {
    /// Sends the head of the ack queue if nothing is in flight.
    fn pump_ack_queue(self: &Arc<Self>) -> Result<()> {
        let (header, data) = {
            let mut state = self.state.lock();
            if state.closed || state.in_flight.is_some() {
                return Ok(());
            }
            let Some(data) = state.ack_queue.pop_front() else {
                return Ok(());
            };
            let seq = state.next_seq(buffer_id::C2D_ACK);
            state.in_flight = Some(InFlight {
                seq,
                data: data.clone(),
                retries: 0,
            });
            state.retry_timer = Some(self.schedule_retry());
            (FrameHeader::new(DataType::DataWithAck, buffer_id::C2D_ACK, seq), data)
        };

        self.pipe.send_data(&header, &data, None).inspect_err(|e| {
            let timer = {
                let mut state = self.state.lock();
                if !state.in_flight.as_ref().is_some_and(|f| f.seq == header.seq) {
                    return;
                }
                state.in_flight = None;
                state.retry_timer.take()
            };
            drop(timer);
            warn!(device = %self.device, seq = header.seq, error = %e, "Ack command rejected by transport, dropping");
        })
    }

    fn schedule_retry(self: &Arc<Self>) -> OneShotTimer {
        let weak = Arc::downgrade(self);
        self.event_loop.after(ACK_RETRY_DELAY, move || {
            if let Some(inner) = weak.upgrade() {
                inner.retry_in_flight();
            }
        })
    }

    fn retry_in_flight(self: &Arc<Self>) {
        let resend = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            let Some(in_flight) = state.in_flight.as_mut() else {
                return;
            };

            if in_flight.retries < MAX_ACK_RETRIES {
                in_flight.retries += 1;
                let header =
                    FrameHeader::new(DataType::DataWithAck, buffer_id::C2D_ACK, in_flight.seq);
                let data = in_flight.data.clone();
                state.retry_timer = Some(self.schedule_retry());
                Some((header, data))
            } else {
                warn!(
                    device = %self.device,
                    seq = in_flight.seq,
                    retries = in_flight.retries,
                    "Ack command not acknowledged, dropping"
                );
                state.in_flight = None;
                state.retry_timer = None;
                None
            }
        };

        let result = match resend {
            Some((header, data)) => self.pipe.send_data(&header, &data, None),
            None => self.pump_ack_queue(),
        };
        if let Err(e) = result {
            warn!(device = %self.device, error = %e, "Failed to send ack command");
        }
    }

    fn ack_received(self: &Arc<Self>, seq: u8) {
        let released = {
            let mut state = self.state.lock();
            let matches = state.in_flight.as_ref().is_some_and(|f| f.seq == seq);
            if matches {
                state.in_flight = None;
                state.retry_timer = None;
            }
            matches
        };

        if !released {
            debug!(device = %self.device, seq, "Stale acknowledgement ignored");
            return;
        }
        if let Err(e) = self.pump_ack_queue() {
            warn!(device = %self.device, error = %e, "Failed to send ack command");
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

impl ItfInner {
    fn recv_frame(self: &Arc<Self>, header: &FrameHeader, payload: Bytes) {
        if self.state.lock().closed {
            return;
        }

        match header.data_type {
            DataType::Ack => {
                if header.acknowledges(buffer_id::C2D_ACK)
                    && let Some(&seq) = payload.first()
                {
                    self.ack_received(seq);
                }
            }
            DataType::DataWithAck => {
                let ack = FrameHeader::new(
                    DataType::Ack,
                    buffer_id::ack_id(header.id),
                    self.state.lock().next_seq(buffer_id::ack_id(header.id)),
                );
                if let Err(e) = self.pipe.send_data(&ack, &[header.seq], None) {
                    warn!(device = %self.device, error = %e, "Failed to acknowledge frame");
                }

                let duplicate = {
                    let mut state = self.state.lock();
                    state.rx_seq.insert(header.id, header.seq) == Some(header.seq)
                };
                if duplicate {
                    debug!(device = %self.device, id = header.id, seq = header.seq, "Duplicate frame");
                    return;
                }
                self.deliver(payload);
            }
            DataType::Data | DataType::LowLatency => {
                if header.id == buffer_id::PING {
                    let pong = FrameHeader::new(DataType::Data, buffer_id::PONG, header.seq);
                    if let Err(e) = self.pipe.send_data(&pong, &payload, None) {
                        warn!(device = %self.device, error = %e, "Failed to answer ping");
                    }
                    return;
                }
                if header.id == buffer_id::PONG {
                    return;
                }
                self.deliver(payload);
            }
        }
    }

    fn deliver(&self, payload: Bytes) {
        match Command::from_bytes(payload) {
            Ok(command) => {
                log_command(&self.log, CommandDirection::Rx, self.device, &command);
                self.listener.command_received(&command);
            }
            Err(e) => warn!(device = %self.device, error = %e, "Undecodable command"),
        }
    }
}

// ============================================================================
// Trait Implementations
// ============================================================================

impl fmt::Debug for CommandInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandInterface")
            .field("device", &self.inner.device)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::advance;

    use crate::protocol::{CommandLogLevel, FeatureId};
    use crate::testing::{self, RecordingCommands, RecordingLink};

    struct Fixture {
        link: Arc<RecordingLink>,
        pipe: FramePipe,
        commands: Arc<RecordingCommands>,
        itf: CommandInterface,
    }

    fn fixture() -> Fixture {
        let link = RecordingLink::new();
        let pipe = FramePipe::new(link.clone());
        pipe.start().expect("start pipe");
        let commands = RecordingCommands::new();
        let itf = CommandInterface::new(
            testing::handle(1),
            pipe.clone(),
            EventLoop::current().expect("event loop"),
            commands.clone(),
            Arc::new(CommandLogConfig::new(CommandLogLevel::All)),
        );
        Fixture {
            link,
            pipe,
            commands,
            itf,
        }
    }

    fn takeoff() -> Command {
        Command::new(FeatureId::new(1, 0), 1, &[])
    }

    fn landing() -> Command {
        Command::new(FeatureId::new(1, 0), 3, &[])
    }

    fn pcmd() -> Command {
        Command::new(FeatureId::new(1, 0), 2, &[1, 0, 0, 0, 0, 0])
    }

    #[tokio::test]
    async fn test_non_ack_sent_immediately() {
        let f = fixture();

        f.itf.send(&pcmd()).expect("send");
        f.itf.send(&pcmd()).expect("send");

        let sent = f.link.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, FrameHeader::new(DataType::Data, 10, 0));
        assert_eq!(sent[1].0.seq, 1);
        assert_eq!(sent[0].1, pcmd().data().to_vec());
    }

    #[tokio::test]
    async fn test_invalid_command_rejected() {
        let f = fixture();
        let unknown = Command::new(FeatureId::new(0xEE, 0xEE), 1, &[]);
        assert!(matches!(
            f.itf.send(&unknown),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_ack_commands_one_in_flight() {
        let f = fixture();

        f.itf.send(&takeoff()).expect("send");
        f.itf.send(&landing()).expect("send");
        assert_eq!(f.link.sent().len(), 1);
        assert_eq!(f.itf.pending_ack_count(), 2);

        let ack = FrameHeader::new(DataType::Ack, buffer_id::ack_id(11), 0);
        f.pipe.recv_data(&ack, Bytes::from_static(&[0])).expect("ack");

        let sent = f.link.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, FrameHeader::new(DataType::DataWithAck, 11, 1));
        assert_eq!(sent[1].1, landing().data().to_vec());
        assert_eq!(f.itf.pending_ack_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_ack_ignored() {
        let f = fixture();
        f.itf.send(&takeoff()).expect("send");

        let ack = FrameHeader::new(DataType::Ack, buffer_id::ack_id(11), 0);
        f.pipe.recv_data(&ack, Bytes::from_static(&[9])).expect("ack");
        assert_eq!(f.itf.pending_ack_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_retry_then_drop() {
        let f = fixture();
        f.itf.send(&takeoff()).expect("send");
        testing::settle().await;

        for _ in 0..MAX_ACK_RETRIES + 1 {
            advance(ACK_RETRY_DELAY).await;
            testing::settle().await;
        }

        assert_eq!(f.link.sent().len(), 1 + MAX_ACK_RETRIES as usize);
        assert_eq!(f.itf.pending_ack_count(), 0);

        advance(ACK_RETRY_DELAY * 4).await;
        testing::settle().await;
        assert_eq!(f.link.sent().len(), 1 + MAX_ACK_RETRIES as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_ack_send_not_retried() {
        let f = fixture();
        f.link.reject_sends(1);

        let err = f.itf.send(&takeoff()).unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert_eq!(f.itf.pending_ack_count(), 0);

        advance(ACK_RETRY_DELAY * 2).await;
        testing::settle().await;
        assert!(f.link.sent().is_empty());

        f.itf.send(&landing()).expect("send");
        assert_eq!(f.link.sent().len(), 1);
        assert_eq!(f.link.sent()[0].1, landing().data().to_vec());
    }

    #[tokio::test]
    async fn test_inbound_data_delivered() {
        let f = fixture();
        let header = FrameHeader::new(DataType::Data, buffer_id::D2C_NON_ACK, 0);
        let position = Command::new(FeatureId::new(1, 4), 4, &[0; 8]);

        f.pipe.recv_data(&header, position.data().clone())
            .expect("recv");
        assert_eq!(f.commands.received(), vec![position]);
    }

    #[tokio::test]
    async fn test_inbound_ack_data_acknowledged_once() {
        let f = fixture();
        let header = FrameHeader::new(DataType::DataWithAck, buffer_id::D2C_ACK, 5);
        let battery = Command::new(FeatureId::new(0, 5), 1, &[80]);

        f.pipe.recv_data(&header, battery.data().clone())
            .expect("recv");
        f.pipe.recv_data(&header, battery.data().clone())
            .expect("recv duplicate");

        assert_eq!(f.commands.received().len(), 1);
        let sent = f.link.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(h, p)| h.data_type == DataType::Ack
            && h.id == buffer_id::ack_id(buffer_id::D2C_ACK)
            && p == &vec![5]));
    }

    #[tokio::test]
    async fn test_ping_echoed() {
        let f = fixture();
        let ping = FrameHeader::new(DataType::Data, buffer_id::PING, 3);

        f.pipe.recv_data(&ping, Bytes::from_static(&[1, 2, 3, 4]))
            .expect("recv");

        let sent = f.link.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, FrameHeader::new(DataType::Data, buffer_id::PONG, 3));
        assert!(f.commands.received().is_empty());
    }

    #[tokio::test]
    async fn test_close_drops_queue_and_rejects_send() {
        let f = fixture();
        f.itf.send(&takeoff()).expect("send");
        f.itf.send(&landing()).expect("send");

        f.itf.close();
        assert!(f.itf.is_closed());
        assert_eq!(f.itf.pending_ack_count(), 0);
        assert!(f.itf.send(&pcmd()).is_err());
    }

    #[tokio::test]
    async fn test_link_quality_forwarded() {
        let f = fixture();
        f.itf.report_link_quality(90, 80, 70);
        assert_eq!(f.commands.link_quality(), vec![(90, 80, 70)]);
    }
}

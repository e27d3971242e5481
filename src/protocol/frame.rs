//! Transport frame header and buffer identifiers.
//!
//! Every frame exchanged through a [`FramePipe`](crate::transport::FramePipe)
//! carries a small header:
//!
//! | Field | Size | Description |
//! |-------|------|-------------|
//! | `data_type` | 1 | [`DataType`] |
//! | `id` | 1 | Buffer id (see [`buffer_id`]) |
//! | `seq` | 1 | Per-buffer sequence number |

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};

// ============================================================================
// Buffer Identifiers
// ============================================================================

/// Well-known buffer ids.
pub mod buffer_id {
    /// Ping, controller to device or device to controller.
    pub const PING: u8 = 0;
    /// Pong, answer to [`PING`].
    pub const PONG: u8 = 1;
    /// Controller to device, non-acknowledged commands.
    pub const C2D_NON_ACK: u8 = 10;
    /// Controller to device, acknowledged commands.
    pub const C2D_ACK: u8 = 11;
    /// Device to controller, acknowledged commands.
    pub const D2C_ACK: u8 = 126;
    /// Device to controller, non-acknowledged commands.
    pub const D2C_NON_ACK: u8 = 127;
    /// Offset added to a buffer id to form its acknowledgement id.
    pub const ACK_OFFSET: u8 = 128;

    /// Returns the id on which acknowledgements of `id` travel.
    #[inline]
    #[must_use]
    pub const fn ack_id(id: u8) -> u8 {
        id.wrapping_add(ACK_OFFSET)
    }
}

// ============================================================================
// DataType
// ============================================================================

/// Kind of frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    /// Acknowledgement of a [`DataType::DataWithAck`] frame.
    Ack = 1,
    /// Best-effort data.
    Data = 2,
    /// Best-effort low-latency data.
    LowLatency = 3,
    /// Data the peer must acknowledge.
    DataWithAck = 4,
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Ack),
            2 => Ok(Self::Data),
            3 => Ok(Self::LowLatency),
            4 => Ok(Self::DataWithAck),
            other => Err(Error::protocol(format!("unknown frame data type: {other}"))),
        }
    }
}

// ============================================================================
// FrameHeader
// ============================================================================

/// Header of one transport frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload kind.
    pub data_type: DataType,
    /// Buffer id.
    pub id: u8,
    /// Sequence number.
    pub seq: u8,
}

impl FrameHeader {
    /// Creates a header.
    #[inline]
    #[must_use]
    pub const fn new(data_type: DataType, id: u8, seq: u8) -> Self {
        Self { data_type, id, seq }
    }

    /// Parses the 2-byte `[type, seq]` prefix used by BLE characteristics,
    /// where the buffer id is carried out of band.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the packet is too short or the type unknown.
    pub fn from_ble_prefix(id: u8, packet: &[u8]) -> Result<Self> {
        match packet {
            [data_type, seq, ..] => Ok(Self::new(DataType::try_from(*data_type)?, id, *seq)),
            _ => Err(Error::protocol(format!(
                "BLE packet too short: {} bytes",
                packet.len()
            ))),
        }
    }

    /// Returns `true` if this header acknowledges a frame sent on `id`.
    #[inline]
    #[must_use]
    pub fn acknowledges(&self, id: u8) -> bool {
        self.data_type == DataType::Ack && self.id == buffer_id::ack_id(id)
    }
}

// ============================================================================
// Tests
// ============================================================================

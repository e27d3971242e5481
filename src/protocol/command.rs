//! Command value type and command description table.
//!
//! A command is identified by a feature id (project + class) and a command
//! id. The encoded buffer starts with a fixed 4-byte header:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 1 | Project id |
//! | 1 | 1 | Class id |
//! | 2 | 2 | Command id (little endian) |
//! | 4 | n | Encoded arguments |
//!
//! Argument encoding of individual commands is opaque here; the table only
//! knows names, buffer classes and which commands are high-frequency
//! telemetry.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Size of the encoded command header.
pub const COMMAND_HEADER_LEN: usize = 4;

// ============================================================================
// FeatureId
// ============================================================================

/// Feature identifier: project id in the high byte, class id in the low byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureId(u16);

impl FeatureId {
    /// Packs a project id and a class id.
    #[inline]
    #[must_use]
    pub const fn new(project: u8, class: u8) -> Self {
        Self(((project as u16) << 8) | class as u16)
    }

    /// Wraps an already packed feature id.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the project id.
    #[inline]
    #[must_use]
    pub const fn project(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Returns the class id.
    #[inline]
    #[must_use]
    pub const fn class(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Returns the packed 16-bit value.
    #[inline]
    #[must_use]
    pub const fn raw(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

// ============================================================================
// BufferType
// ============================================================================

/// Delivery class of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    /// Acknowledged, retransmitted until the peer confirms.
    Ack,
    /// Best effort, sent once.
    NonAck,
    /// Unknown command or undecodable buffer.
    Invalid,
}

// ============================================================================
// Command Description Table
// ============================================================================

/// Static description of a known command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDesc {
    /// Project id.
    pub project: u8,
    /// Class id.
    pub class: u8,
    /// Command id.
    pub command: u8,
    /// Fully qualified name (`project.Class.Command`).
    pub name: &'static str,
    /// Delivery class.
    pub buffer_type: BufferType,
    /// High-frequency telemetry, skipped by the `AckNoFrequent` log level.
    pub frequent: bool,
}

const fn desc(
    project: u8,
    class: u8,
    command: u8,
    name: &'static str,
    buffer_type: BufferType,
    frequent: bool,
) -> CommandDesc {
    CommandDesc {
        project,
        class,
        command,
        name,
        buffer_type,
        frequent,
    }
}

/// Known commands, sorted by (project, class, command).
static COMMAND_TABLE: &[CommandDesc] = &[
    desc(0, 2, 0, "common.Settings.AllSettings", BufferType::Ack, false),
    desc(0, 2, 2, "common.Settings.ProductName", BufferType::Ack, false),
    desc(0, 3, 0, "common.SettingsState.AllSettingsChanged", BufferType::Ack, false),
    desc(0, 4, 0, "common.Common.AllStates", BufferType::Ack, false),
    desc(0, 4, 1, "common.Common.CurrentDate", BufferType::Ack, false),
    desc(0, 4, 2, "common.Common.CurrentTime", BufferType::Ack, false),
    desc(0, 5, 0, "common.CommonState.AllStatesChanged", BufferType::Ack, false),
    desc(0, 5, 1, "common.CommonState.BatteryStateChanged", BufferType::Ack, false),
    desc(0, 5, 4, "common.CommonState.MassStorageInfoRemainingListChanged", BufferType::Ack, true),
    desc(0, 5, 7, "common.CommonState.WifiSignalChanged", BufferType::Ack, true),
    desc(0, 5, 8, "common.CommonState.SensorsStatesListChanged", BufferType::Ack, false),
    desc(0, 24, 0, "common.HeadlightsState.intensityChanged", BufferType::Ack, false),
    desc(1, 0, 0, "ardrone3.Piloting.FlatTrim", BufferType::Ack, false),
    desc(1, 0, 1, "ardrone3.Piloting.TakeOff", BufferType::Ack, false),
    desc(1, 0, 2, "ardrone3.Piloting.PCMD", BufferType::NonAck, false),
    desc(1, 0, 3, "ardrone3.Piloting.Landing", BufferType::Ack, false),
    desc(1, 0, 4, "ardrone3.Piloting.Emergency", BufferType::Ack, false),
    desc(1, 4, 1, "ardrone3.PilotingState.FlyingStateChanged", BufferType::Ack, false),
    desc(1, 4, 4, "ardrone3.PilotingState.PositionChanged", BufferType::NonAck, true),
    desc(1, 4, 5, "ardrone3.PilotingState.SpeedChanged", BufferType::NonAck, true),
    desc(1, 4, 6, "ardrone3.PilotingState.AttitudeChanged", BufferType::NonAck, true),
    desc(1, 4, 8, "ardrone3.PilotingState.AltitudeChanged", BufferType::NonAck, true),
    desc(1, 31, 2, "ardrone3.GPSSettingsState.NumberOfSatelliteChanged", BufferType::Ack, true),
];

/// Looks up the description of a command.
///
/// Pure function of the numeric ids; no command value is needed.
#[must_use]
pub fn describe(feature: FeatureId, command_id: u16) -> Option<&'static CommandDesc> {
    let command = u8::try_from(command_id).ok()?;
    let key = (feature.project(), feature.class(), command);

    COMMAND_TABLE
        .binary_search_by(|d| (d.project, d.class, d.command).cmp(&key))
        .ok()
        .map(|idx| &COMMAND_TABLE[idx])
}

/// Returns the name of a command, or `None` if it is unknown.
#[inline]
#[must_use]
pub fn command_name(feature: FeatureId, command_id: u16) -> Option<&'static str> {
    describe(feature, command_id).map(|d| d.name)
}

// ============================================================================
// Command
// ============================================================================

/// An encoded command.
///
/// Commands are values: cloning shares the underlying buffer and equality
/// compares raw bytes only.
#[derive(Clone)]
pub struct Command {
    feature: FeatureId,
    command_id: u8,
    buffer_type: BufferType,
    data: Bytes,
}

// ============================================================================
// Command - Constructors
// ============================================================================

impl Command {
    /// Encodes a command from its ids and already encoded arguments.
    ///
    /// The buffer class comes from the description table; unknown commands
    /// are [`BufferType::Invalid`] until overridden with
    /// [`with_buffer_type`](Self::with_buffer_type).
    #[must_use]
    pub fn new(feature: FeatureId, command_id: u8, args: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(COMMAND_HEADER_LEN + args.len());
        buf.put_u8(feature.project());
        buf.put_u8(feature.class());
        buf.put_u16_le(u16::from(command_id));
        buf.put_slice(args);

        Self {
            feature,
            command_id,
            buffer_type: lookup_buffer_type(feature, command_id),
            data: buf.freeze(),
        }
    }

    /// Decodes a command from a raw buffer.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the buffer is shorter than the header
    /// or the command id does not fit in 8 bits.
    pub fn from_bytes(data: Bytes) -> Result<Self> {
        let (feature, command_id) = decode_header(&data)?;

        Ok(Self {
            feature,
            command_id,
            buffer_type: lookup_buffer_type(feature, command_id),
            data,
        })
    }

    /// Overrides the buffer class.
    #[inline]
    #[must_use]
    pub fn with_buffer_type(mut self, buffer_type: BufferType) -> Self {
        self.buffer_type = buffer_type;
        self
    }
}

// ============================================================================
// Command - Public API
// ============================================================================

impl Command {
    /// Returns the feature id.
    #[inline]
    #[must_use]
    pub fn feature(&self) -> FeatureId {
        self.feature
    }

    /// Returns the command id.
    #[inline]
    #[must_use]
    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    /// Returns the buffer class.
    #[inline]
    #[must_use]
    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    /// Returns the full encoded buffer.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Returns the encoded arguments following the header.
    #[inline]
    #[must_use]
    pub fn args(&self) -> &[u8] {
        &self.data[COMMAND_HEADER_LEN..]
    }

    /// Returns the command name, if known.
    #[inline]
    #[must_use]
    pub fn name(&self) -> Option<&'static str> {
        command_name(self.feature, u16::from(self.command_id))
    }

    /// Returns `true` if this command is high-frequency telemetry.
    #[inline]
    #[must_use]
    pub fn is_frequent(&self) -> bool {
        describe(self.feature, u16::from(self.command_id)).is_some_and(|d| d.frequent)
    }

    /// Replaces the encoded buffer and rebuilds the decoded header.
    ///
    /// On error the command is left unchanged.
    ///
    /// # Errors
    ///
    /// Same as [`from_bytes`](Self::from_bytes).
    pub fn set_data(&mut self, data: Bytes) -> Result<()> {
        let (feature, command_id) = decode_header(&data)?;

        self.feature = feature;
        self.command_id = command_id;
        self.buffer_type = lookup_buffer_type(feature, command_id);
        self.data = data;
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn decode_header(data: &[u8]) -> Result<(FeatureId, u8)> {
    if data.len() < COMMAND_HEADER_LEN {
        return Err(Error::invalid_argument(format!(
            "command buffer too short: {} bytes",
            data.len()
        )));
    }

    let feature = FeatureId::new(data[0], data[1]);
    let raw_cmd = u16::from_le_bytes([data[2], data[3]]);
    let command_id = u8::try_from(raw_cmd)
        .map_err(|_| Error::invalid_argument(format!("command id out of range: {raw_cmd}")))?;

    Ok((feature, command_id))
}

fn lookup_buffer_type(feature: FeatureId, command_id: u8) -> BufferType {
    describe(feature, u16::from(command_id)).map_or(BufferType::Invalid, |d| d.buffer_type)
}

// ============================================================================
// Trait Implementations
// ============================================================================

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Command {}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("feature", &self.feature)
            .field("command_id", &self.command_id)
            .field("name", &self.name())
            .field("buffer_type", &self.buffer_type)
            .field("len", &self.data.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

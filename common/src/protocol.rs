//! Binary protocol spoken between the ToF daemon and the robot process.
//!
//! Two channels share this module:
//!
//! - the publish channel carries one [`PublishMessage`] per processed frame,
//! - the command channel carries a [`CommandRequest`] / [`CommandResponse`] pair.
//!
//! Encoding is bincode with fixed-width little-endian integers. Vectors are
//! prefixed with a `u64` length, which doubles as the wire point count.
//!
//! ```text
//! CommandRequest  (10 bytes): header u32 | version u16 | command u32
//! CommandResponse (14 bytes): header u32 | version u16 | command u32 | status u32
//! PublishMessage            : header u32 | version u16 | status u32 | timestamp f64
//!                             | len u64 | len * {x i32, y i32}
//!                             | len u64 | len * {class_id u8, last_index u32}
//! ```

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ObjectId, Point2D};

pub const STREAMING_DATA_HEADER: u32 = 0x0001;
pub const COMMAND_HEADER: u32 = 0x0002;
pub const PROTOCOL_VERSION: u16 = 1;

/// Points carried by one publish message before truncation kicks in.
pub const MAX_POINTS_PER_MESSAGE: usize = 500;
pub const MAX_OBJECTS_PER_MESSAGE: usize = 32;

/// Upper bound for any single encoded message.
pub const MAX_MESSAGE_BYTES: u64 = 8192;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Wrong message size: expected {expected} bytes, got {actual}")]
    WrongSize { expected: usize, actual: usize },

    #[error("Bad message header: expected {expected:#06x}, got {actual:#06x}")]
    BadHeader { expected: u32, actual: u32 },

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("Too many {field}: {len} exceeds capacity {capacity}")]
    CapacityExceeded {
        field: &'static str,
        len: usize,
        capacity: usize,
    },

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_MESSAGE_BYTES)
        .reject_trailing_bytes()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(wire_options().serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(wire_options().deserialize(bytes)?)
}

fn check_header(expected: u32, actual: u32, version: u16) -> Result<()> {
    if actual != expected {
        return Err(ProtocolError::BadHeader { expected, actual });
    }
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    RawCommand = 0,
    StreamStop = 1,
    StreamStart = 2,
    PowerOff = 3,
    PowerOn = 4,
}

impl Command {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::RawCommand),
            1 => Some(Self::StreamStop),
            2 => Some(Self::StreamStart),
            3 => Some(Self::PowerOff),
            4 => Some(Self::PowerOn),
            _ => None,
        }
    }
}

/// Status codes shared by both channels. `Ok` doubles as the command ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    Nak = 1,
    StreamError = 2,
    Unknown = 3,
    ObjectOverflow = 4,
}

impl Status {
    pub const ACK: Status = Status::Ok;

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Codes outside the table map to `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Nak,
            2 => Self::StreamError,
            4 => Self::ObjectOverflow,
            _ => Self::Unknown,
        }
    }
}

/// One frame's worth of obstacle points in the robot frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishMessage {
    pub header: u32,
    pub version: u16,
    pub status: u32,
    pub timestamp: f64,
    pub points: Vec<Point2D>,
    pub objects: Vec<ObjectId>,
}

impl PublishMessage {
    /// Builds a message, truncating to capacity instead of failing.
    ///
    /// Only dropped points force the status to `ObjectOverflow`; objects past
    /// their capacity are cut silently since the points stay complete.
    /// An object survives truncation only if its first point still fits, and
    /// its `last_index` is clamped to the last retained point.
    pub fn new(status: Status, timestamp: f64, points: &[Point2D], objects: &[ObjectId]) -> Self {
        let overflow = points.len() > MAX_POINTS_PER_MESSAGE;
        let kept_points = &points[..points.len().min(MAX_POINTS_PER_MESSAGE)];

        let last_kept = kept_points.len() as u32;
        let mut kept_objects = Vec::with_capacity(objects.len().min(MAX_OBJECTS_PER_MESSAGE));
        let mut first_index = 0u32;
        for object in objects.iter().take(MAX_OBJECTS_PER_MESSAGE) {
            if first_index >= last_kept {
                break;
            }
            kept_objects.push(ObjectId::new(
                object.class_id,
                object.last_index.min(last_kept - 1),
            ));
            first_index = object.last_index.saturating_add(1);
        }

        let status = if overflow {
            Status::ObjectOverflow
        } else {
            status
        };

        Self {
            header: STREAMING_DATA_HEADER,
            version: PROTOCOL_VERSION,
            status: status.code(),
            timestamp,
            points: kept_points.to_vec(),
            objects: kept_objects,
        }
    }

    pub fn status(&self) -> Status {
        Status::from_code(self.status)
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.check_capacity()?;
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let message: Self = decode(bytes)?;
        check_header(STREAMING_DATA_HEADER, message.header, message.version)?;
        message.check_capacity()?;
        Ok(message)
    }

    fn check_capacity(&self) -> Result<()> {
        if self.points.len() > MAX_POINTS_PER_MESSAGE {
            return Err(ProtocolError::CapacityExceeded {
                field: "points",
                len: self.points.len(),
                capacity: MAX_POINTS_PER_MESSAGE,
            });
        }
        if self.objects.len() > MAX_OBJECTS_PER_MESSAGE {
            return Err(ProtocolError::CapacityExceeded {
                field: "objects",
                len: self.objects.len(),
                capacity: MAX_OBJECTS_PER_MESSAGE,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub header: u32,
    pub version: u16,
    pub command: u32,
}

impl CommandRequest {
    pub const WIRE_SIZE: usize = 10;

    pub fn new(command: Command) -> Self {
        Self {
            header: COMMAND_HEADER,
            version: PROTOCOL_VERSION,
            command: command.code(),
        }
    }

    /// `None` for codes this protocol version does not define.
    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.command)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::WIRE_SIZE {
            return Err(ProtocolError::WrongSize {
                expected: Self::WIRE_SIZE,
                actual: bytes.len(),
            });
        }
        let request: Self = decode(bytes)?;
        check_header(COMMAND_HEADER, request.header, request.version)?;
        Ok(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub header: u32,
    pub version: u16,
    pub command: u32,
    pub status: u32,
}

impl CommandResponse {
    pub const WIRE_SIZE: usize = 14;

    fn with_status(command: u32, status: Status) -> Self {
        Self {
            header: COMMAND_HEADER,
            version: PROTOCOL_VERSION,
            command,
            status: status.code(),
        }
    }

    pub fn ack(command: u32) -> Self {
        Self::with_status(command, Status::ACK)
    }

    pub fn nak(command: u32) -> Self {
        Self::with_status(command, Status::Nak)
    }

    pub fn status(&self) -> Status {
        Status::from_code(self.status)
    }

    pub fn is_ack(&self) -> bool {
        self.status == Status::ACK.code()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::WIRE_SIZE {
            return Err(ProtocolError::WrongSize {
                expected: Self::WIRE_SIZE,
                actual: bytes.len(),
            });
        }
        let response: Self = decode(bytes)?;
        check_header(COMMAND_HEADER, response.header, response.version)?;
        Ok(response)
    }
}

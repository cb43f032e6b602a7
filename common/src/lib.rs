//! Wire types shared by the ToF perception daemon and the robot process.
//!
//! Both ends of the local IPC link depend on this crate so that the publish
//! message and the command transaction are encoded from a single definition.

pub mod protocol;
pub mod types;

pub use protocol::{
    Command, CommandRequest, CommandResponse, ProtocolError, PublishMessage, Status,
    COMMAND_HEADER, MAX_OBJECTS_PER_MESSAGE, MAX_POINTS_PER_MESSAGE, PROTOCOL_VERSION,
    STREAMING_DATA_HEADER,
};
pub use types::{ObjectId, Point2D};

//! Local IPC with the robot process: a PUB socket for detection results and
//! a REP socket for stream start/stop transactions.

pub mod zmq_pub;
pub mod zmq_rep;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use zmq_pub::ZmqPublisher;
pub use zmq_rep::{handle_request, CommandServer};

/// Whether the robot wants frames. Written by the command thread, read by
/// the processing loop once per iteration. Starts out false.
#[derive(Debug, Clone, Default)]
pub struct StreamingState(Arc<AtomicBool>);

impl StreamingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_streaming(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set(&self, streaming: bool) -> bool {
        self.0.swap(streaming, Ordering::SeqCst)
    }
}

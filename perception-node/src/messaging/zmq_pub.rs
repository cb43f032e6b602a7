use tof_common::{ObjectId, Point2D, PublishMessage, Status};
use tracing::{debug, info, instrument, warn};
use zmq::{Context, Socket, PUB};

use crate::config::MessagingConfig;
use crate::error::Result;

/// Fire-and-forget publisher for per-frame obstacle points.
pub struct ZmqPublisher {
    socket: Socket,
    endpoint: String,
    sequence_number: u64,
}

impl ZmqPublisher {
    pub fn new(context: &Context, config: &MessagingConfig) -> Result<Self> {
        info!("Initializing ZeroMQ publisher on {}", config.publish_endpoint);

        let socket = context.socket(PUB)?;
        socket.set_sndhwm(config.send_high_water_mark)?;
        socket.set_linger(0)?;
        socket.bind(&config.publish_endpoint)?;

        Ok(Self {
            socket,
            endpoint: config.publish_endpoint.clone(),
            sequence_number: 0,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends one message; more than the wire capacity of points is truncated
    /// and flagged with `ObjectOverflow`. Returns the status actually sent.
    #[instrument(skip(self, points, objects), level = "debug")]
    pub fn publish(
        &mut self,
        status: Status,
        timestamp: f64,
        points: &[Point2D],
        objects: &[ObjectId],
    ) -> Result<Status> {
        let message = PublishMessage::new(status, timestamp, points, objects);
        let sent_status = message.status();
        if sent_status == Status::ObjectOverflow {
            warn!(
                "More object points than fit in one message, sending {}/{}",
                message.point_count(),
                points.len()
            );
        } else if !points.is_empty() {
            debug!("Publishing {} points", points.len());
        }

        let bytes = message.encode()?;
        self.socket.send(bytes, 0)?;
        self.sequence_number += 1;
        Ok(sent_status)
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}

impl Drop for ZmqPublisher {
    fn drop(&mut self) {
        info!("Shutting down ZeroMQ publisher");
    }
}

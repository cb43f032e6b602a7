use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::Frame;

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    /// Frames pushed since creation.
    sequence: u64,
    /// Time of the first push; rate accounting starts here.
    first_push: Option<Instant>,
    last_push: Option<Instant>,
    /// Frames overwritten before the consumer took them.
    dropped: u64,
}

/// Single-slot hand-off between the sensor callback and the processing thread.
///
/// A push replaces whatever is buffered, so the consumer always sees the
/// freshest frame and never works through a backlog.
#[derive(Default)]
pub struct FrameBuffer {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores `frame`, discarding any frame not yet taken. Never waits on the consumer.
    pub fn push(&self, frame: Frame) {
        let now = Instant::now();
        {
            let mut slot = self.lock();
            if slot.frame.replace(frame).is_some() {
                slot.dropped += 1;
            }
            slot.sequence += 1;
            if slot.first_push.is_none() {
                slot.first_push = Some(now);
            }
            slot.last_push = Some(now);
        }
        self.ready.notify_one();
    }

    /// Waits up to `timeout` for a frame, takes it and leaves the buffer empty.
    pub fn take_latest_and_clear(&self, timeout: Duration) -> Option<Frame> {
        let slot = self.lock();
        let (mut slot, _) = self
            .ready
            .wait_timeout_while(slot, timeout, |slot| slot.frame.is_none())
            .unwrap_or_else(|e| e.into_inner());
        slot.frame.take()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frame.is_none()
    }

    /// 0 or 1.
    pub fn len(&self) -> usize {
        usize::from(self.lock().frame.is_some())
    }

    pub fn clear(&self) {
        self.lock().frame = None;
    }

    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Push rate measured from the first frame onward, so warm-up is excluded.
    pub fn fps(&self) -> Option<f64> {
        let slot = self.lock();
        let (first, last) = (slot.first_push?, slot.last_push?);
        let elapsed = last.duration_since(first).as_secs_f64();
        if slot.sequence < 2 || elapsed <= 0.0 {
            return None;
        }
        Some((slot.sequence - 1) as f64 / elapsed)
    }
}

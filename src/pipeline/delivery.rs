//! Pull-based delivery to the media scheduler

use std::sync::Arc;

use tracing::debug;

use crate::capture::{copy_into, KeyframeTrigger, Timestamp};
use crate::pipeline::ringbuf::FrameQueue;
use crate::pipeline::stats::RateMeter;
use crate::pipeline::wake::WakeSignal;

type WallClock = Box<dyn Fn() -> Timestamp + Send>;

/// Presentation timestamps that follow capture cadence.
///
/// The first frame is stamped with the wall clock; every later frame advances
/// the previous presentation time by the gap between its capture time and the
/// previous frame's capture time. Out-of-order capture times advance by zero.
pub struct PresentationClock {
    wall_clock: WallClock,
    last: Option<(Timestamp, Timestamp)>,
}

impl PresentationClock {
    pub fn new() -> Self {
        Self::with_wall_clock(Box::new(Timestamp::now))
    }

    pub fn with_wall_clock(wall_clock: WallClock) -> Self {
        Self {
            wall_clock,
            last: None,
        }
    }

    /// Presentation time for a frame captured at `captured_at`
    pub fn stamp(&mut self, captured_at: Timestamp) -> Timestamp {
        let pts = match self.last {
            None => (self.wall_clock)(),
            Some((prev_capture, prev_pts)) => prev_pts + captured_at.saturating_since(prev_capture),
        };
        self.last = Some((captured_at, pts));
        pts
    }

    /// Forget the baseline; the next frame is stamped from the wall clock again
    pub fn reset(&mut self) {
        self.last = None;
    }
}

impl Default for PresentationClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Bytes written into the output buffer
    pub size: usize,
    /// Bytes of the access unit that did not fit
    pub truncated: usize,
    pub pts: Timestamp,
    pub keyframe: bool,
}

/// Consumer side of one logical stream.
///
/// Not reentrant: the scheduler calls [`deliver`](Self::deliver) only when
/// its output buffer is free, from one thread at a time.
pub struct DeliveryAdapter {
    name: String,
    queue: Arc<FrameQueue>,
    wake: Arc<dyn WakeSignal>,
    clock: PresentationClock,
    meter: RateMeter,
    trigger: Option<Arc<dyn KeyframeTrigger>>,
}

impl DeliveryAdapter {
    pub fn new(name: impl Into<String>, queue: Arc<FrameQueue>, wake: Arc<dyn WakeSignal>) -> Self {
        let name = name.into();
        Self {
            meter: RateMeter::new(format!("{} out", name)),
            name,
            queue,
            wake,
            clock: PresentationClock::new(),
            trigger: None,
        }
    }

    pub fn with_clock(mut self, clock: PresentationClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_keyframe_trigger(mut self, trigger: Option<Arc<dyn KeyframeTrigger>>) -> Self {
        self.trigger = trigger;
        self
    }

    /// Copy the oldest queued access unit into `out`.
    ///
    /// Returns `None` when the queue is empty. Frames larger than `out` are
    /// truncated; the lost byte count is reported, not retried.
    pub fn deliver(&mut self, out: &mut [u8]) -> Option<Delivery> {
        let (frame, remaining) = self.queue.pop_with_remaining()?;

        let size = copy_into(&frame.data, out, &self.name);
        let truncated = frame.len() - size;

        let pts = self.clock.stamp(frame.captured_at);
        self.meter.record(Timestamp::now().secs(), size);
        metrics::counter!("camrelay_frames_delivered", "stream" => self.name.clone()).increment(1);
        debug!(
            "deliverFrame\ttimestamp:{}.{:06}\tsize:{}\tdiff:{}ms\tqueue:{}",
            pts.secs(),
            pts.subsec_micros(),
            size,
            latency_ms(frame.captured_at),
            remaining
        );

        if remaining > 0 {
            self.wake.wake();
        }

        Some(Delivery {
            size,
            truncated,
            pts,
            keyframe: frame.meta.keyframe,
        })
    }

    /// Ask the source for a keyframe. Best effort, never blocks.
    pub fn request_keyframe(&self) -> bool {
        self.trigger
            .as_ref()
            .is_some_and(|trigger| trigger.request_keyframe())
    }
}

fn latency_ms(captured_at: Timestamp) -> u128 {
    Timestamp::now().saturating_since(captured_at).as_millis()
}

//! Capture-and-delivery pipeline for one logical stream
//!
//! A [`CaptureWorker`] thread reads the device and fills a [`FrameQueue`];
//! the media scheduler drains it through a [`DeliveryAdapter`] whenever the
//! [`WakeSignal`] fires.

pub mod delivery;
pub mod ringbuf;
pub mod stats;
pub mod wake;
pub mod worker;

use std::fs::File;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::info;

pub use delivery::{Delivery, DeliveryAdapter, PresentationClock};
pub use self::ringbuf::{FrameQueue, QueueStats};
pub use stats::{RateMeter, RateReport};
pub use wake::{ChannelWake, NoWake, WakeSignal};
pub use worker::{CaptureLoop, CaptureWorker, WorkerExit, WorkerOptions};

use crate::capture::{DeviceSource, Frame, PixelFormat};
use crate::error::{Error, Result};
use crate::PipelineConfig;

/// Queue, capture thread and delivery adapter wired together
pub struct StreamPipeline {
    name: String,
    format: PixelFormat,
    dimensions: (u32, u32),
    queue: Arc<FrameQueue>,
    worker: Option<CaptureWorker>,
    adapter: DeliveryAdapter,
    last_frame: Arc<ArcSwapOption<Frame>>,
}

impl StreamPipeline {
    /// Spawn the capture thread for `device`
    pub fn start<D: DeviceSource + 'static>(
        name: &str,
        device: D,
        wake: Arc<dyn WakeSignal>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let queue = Arc::new(FrameQueue::new(config.queue_size));
        let last_frame = Arc::new(ArcSwapOption::empty());
        let format = device.format();
        let dimensions = device.dimensions();
        let trigger = device.keyframe_trigger();

        let mut capture = CaptureLoop::new(
            device,
            queue.clone(),
            wake.clone(),
            WorkerOptions::from_config(name, config),
        )
        .with_snapshot(last_frame.clone());

        if let Some(path) = &config.output_path {
            let file = File::create(path)
                .map_err(|e| Error::device(path.display().to_string(), e))?;
            info!("{}: writing raw stream to {}", name, path.display());
            capture = capture.with_output(Box::new(file));
        }

        let worker = CaptureWorker::spawn(capture)?;
        let adapter =
            DeliveryAdapter::new(name, queue.clone(), wake).with_keyframe_trigger(trigger);

        info!(
            "{}: pipeline started ({:?} {}x{}, queue {})",
            name, format, dimensions.0, dimensions.1, config.queue_size
        );

        Ok(Self {
            name: name.to_owned(),
            format,
            dimensions,
            queue,
            worker: Some(worker),
            adapter,
            last_frame,
        })
    }

    /// Hand the next queued access unit to the scheduler
    pub fn deliver(&mut self, out: &mut [u8]) -> Option<Delivery> {
        self.adapter.deliver(out)
    }

    pub fn request_keyframe(&self) -> bool {
        self.adapter.request_keyframe()
    }

    /// Most recent access unit seen by the capture thread
    pub fn snapshot(&self) -> Option<Arc<Frame>> {
        self.last_frame.load_full()
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Whether the capture thread is still running
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Stop the capture thread and wait for it. Idempotent.
    pub fn stop(&mut self) -> Option<WorkerExit> {
        let exit = self.worker.take()?.stop();
        info!("{}: pipeline stopped ({:?})", self.name, exit);
        exit
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Capture worker thread
//!
//! Blocks on device readiness, reads access units and pushes them into the
//! frame queue, signalling the scheduler after every push. Shutdown is
//! cooperative: the stop flag is checked at the top of every iteration and
//! before every read, and readiness waits are bounded so the flag is seen
//! within one wait interval.

use std::io::{self, Write};
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, info, trace, warn};

use crate::bitstream;
use crate::capture::{DeviceSource, Frame, FrameMetadata, FrameSplitter, Timestamp, WholeFrame};
use crate::pipeline::ringbuf::FrameQueue;
use crate::pipeline::stats::RateMeter;
use crate::pipeline::wake::WakeSignal;
use crate::PipelineConfig;

/// Capture loop tuning
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Stream name used for the thread name, logs and metrics
    pub name: String,
    /// Upper bound on one readiness wait
    pub wait_timeout: Duration,
    /// Sleep between reads when the device has no pollable descriptor
    pub poll_interval: Duration,
    /// Consecutive read errors tolerated before the worker gives up
    pub max_read_errors: u32,
    /// Pin the capture thread to this core
    pub pin_core: Option<usize>,
}

impl WorkerOptions {
    pub fn from_config(name: impl Into<String>, config: &PipelineConfig) -> Self {
        Self {
            name: name.into(),
            wait_timeout: Duration::from_millis(config.wait_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_read_errors: config.max_read_errors,
            pin_core: config.pin_core,
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: "stream".into(),
            wait_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            max_read_errors: 10,
            pin_core: None,
        }
    }
}

/// Why the worker thread returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stop flag observed
    Stopped,
    /// Device kept failing
    ReadErrors,
}

enum Step {
    Idle,
    Posted,
    Failed,
}

/// State owned by the capture thread
pub struct CaptureLoop<D> {
    device: D,
    queue: Arc<FrameQueue>,
    wake: Arc<dyn WakeSignal>,
    splitter: Box<dyn FrameSplitter>,
    output: Option<Box<dyn Write + Send>>,
    last_frame: Option<Arc<ArcSwapOption<Frame>>>,
    options: WorkerOptions,
    stop: Arc<AtomicBool>,
    sequence: u64,
    consecutive_errors: u32,
    meter: RateMeter,
}

impl<D: DeviceSource> CaptureLoop<D> {
    pub fn new(
        device: D,
        queue: Arc<FrameQueue>,
        wake: Arc<dyn WakeSignal>,
        options: WorkerOptions,
    ) -> Self {
        let meter = RateMeter::new(format!("{} in", options.name));
        Self {
            device,
            queue,
            wake,
            splitter: Box::new(WholeFrame),
            output: None,
            last_frame: None,
            options,
            stop: Arc::new(AtomicBool::new(false)),
            sequence: 0,
            consecutive_errors: 0,
            meter,
        }
    }

    /// Split raw reads with a custom splitter
    pub fn with_splitter(mut self, splitter: Box<dyn FrameSplitter>) -> Self {
        self.splitter = splitter;
        self
    }

    /// Tee every raw read into `output`
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = Some(output);
        self
    }

    /// Publish the latest access unit into `slot`
    pub fn with_snapshot(mut self, slot: Arc<ArcSwapOption<Frame>>) -> Self {
        self.last_frame = Some(slot);
        self
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn run(mut self) -> WorkerExit {
        info!("begin capture thread {}", self.options.name);
        if let Some(core) = self.options.pin_core {
            if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
                warn!("Failed to pin capture thread to core {}", core);
            }
        }

        let mut buf = vec![0u8; self.device.buffer_size().max(1)];
        let exit = loop {
            if self.stopping() {
                break WorkerExit::Stopped;
            }

            let readiness = self
                .device
                .ready_fd()
                .map(|fd| wait_readable(fd, self.options.wait_timeout));

            let step = match readiness {
                Some(Ok(true)) => self.read_once(&mut buf),
                Some(Ok(false)) => Step::Idle,
                Some(Err(e)) => {
                    warn!("{}: readiness wait failed: {}", self.options.name, e);
                    thread::sleep(self.options.poll_interval);
                    Step::Idle
                }
                None => {
                    // No waitable handle: poll directly, sleeping between empty reads
                    let step = self.read_once(&mut buf);
                    if !matches!(step, Step::Posted) {
                        thread::sleep(self.options.poll_interval);
                    }
                    step
                }
            };

            if matches!(step, Step::Failed)
                && self.consecutive_errors >= self.options.max_read_errors
                && !self.stopping()
            {
                error!(
                    "{}: {} consecutive read errors, stopping capture",
                    self.options.name, self.consecutive_errors
                );
                break WorkerExit::ReadErrors;
            }
        };
        info!("end capture thread {}", self.options.name);
        exit
    }

    fn read_once(&mut self, buf: &mut [u8]) -> Step {
        if self.stopping() {
            return Step::Idle;
        }

        let result = self.device.read(buf);
        // Timestamp after the read: blocking reads may be rate-limited by the driver.
        let captured_at = Timestamp::now();

        match result {
            Ok(0) => {
                self.consecutive_errors = 0;
                trace!("{}: no data", self.options.name);
                Step::Idle
            }
            Ok(n) => {
                self.consecutive_errors = 0;
                self.post(&buf[..n], captured_at);
                Step::Posted
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                debug!("{}: retrying read ({})", self.options.name, e);
                Step::Idle
            }
            Err(e) => {
                self.consecutive_errors += 1;
                if !self.stopping() {
                    warn!("{}: read failed: {}", self.options.name, e);
                }
                Step::Failed
            }
        }
    }

    fn post(&mut self, raw: &[u8], captured_at: Timestamp) {
        self.meter.record(captured_at.secs(), raw.len());
        debug!(
            "postFrame\ttimestamp:{}.{:06}\tsize:{}",
            captured_at.secs(),
            captured_at.subsec_micros(),
            raw.len()
        );

        if let Some(out) = self.output.as_mut() {
            if let Err(e) = out.write_all(raw) {
                warn!("{}: error writing output: {}", self.options.name, e);
            }
        }

        let annexb = self.device.format().is_annexb();
        for data in self.splitter.split(Bytes::copy_from_slice(raw)) {
            self.sequence += 1;
            let keyframe = !annexb || bitstream::is_keyframe(&data);
            let frame = Frame {
                data,
                meta: FrameMetadata {
                    sequence: self.sequence,
                    keyframe,
                },
                captured_at,
            };

            if let Some(slot) = &self.last_frame {
                slot.store(Some(Arc::new(frame.clone())));
            }
            if self.queue.push(frame).is_some() {
                metrics::counter!("camrelay_frames_dropped", "stream" => self.options.name.clone())
                    .increment(1);
            }
            metrics::counter!("camrelay_frames_captured", "stream" => self.options.name.clone())
                .increment(1);
            self.wake.wake();
        }
    }
}

/// Wait until `fd` is readable or `timeout` elapses
fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> nix::Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
    match poll(&mut fds, PollTimeout::from(ms)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Handle to a running capture thread.
///
/// Stopping sets the shared flag first and then joins; the device is owned by
/// the thread and released only after the loop has exited.
pub struct CaptureWorker {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<WorkerExit>>,
}

impl CaptureWorker {
    pub fn spawn<D: DeviceSource + 'static>(capture: CaptureLoop<D>) -> io::Result<Self> {
        let name = capture.options.name.clone();
        let stop = capture.stop.clone();
        let handle = thread::Builder::new()
            .name(format!("capture-{}", name))
            .spawn(move || capture.run())?;
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    /// Whether the thread has returned on its own or after a stop
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Set the stop flag, then join. Idempotent.
    pub fn stop(&mut self) -> Option<WorkerExit> {
        self.stop.store(true, Ordering::Release);
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(exit) => {
                debug!("capture thread {} joined ({:?})", self.name, exit);
                Some(exit)
            }
            Err(_) => {
                error!("capture thread {} panicked", self.name);
                None
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

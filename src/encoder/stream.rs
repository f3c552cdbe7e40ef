//! Per-session frame path
//!
//! Each active session publishes a [`StreamChannel`] that owns the session's
//! [`SessionReader`] and rate controller behind its own lock. Capture threads
//! read through the channel without touching the orchestrator, so the two
//! streams never wait on each other. Keyframe requests set a flag that the
//! next read consumes; they never block and are never dropped.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::hal::{HalError, SessionReader};
use super::params::StreamKind;
use super::rate_control::RateController;
use crate::capture::Timestamp;
use crate::error::{Error, Result};

/// One access unit copied out of a device buffer
#[derive(Debug, Clone)]
pub struct EncodedAccessUnit {
    pub data: Bytes,
    pub keyframe: bool,
    /// Driver timestamp
    pub timestamp: Timestamp,
}

struct Inner<R> {
    reader: Option<R>,
    rc: Option<Box<dyn RateController>>,
}

pub struct StreamChannel<R> {
    kind: StreamKind,
    gop: u32,
    read_timeout: Duration,
    closed: AtomicBool,
    keyframe_pending: AtomicBool,
    qp: AtomicU32,
    inner: Mutex<Inner<R>>,
}

/// Shared handle to a session's frame path
pub type StreamHandle<R> = Arc<StreamChannel<R>>;

impl<R: SessionReader> StreamChannel<R> {
    pub(crate) fn open(
        kind: StreamKind,
        reader: R,
        rc: Option<Box<dyn RateController>>,
        qp: u32,
        gop: u32,
        read_timeout: Duration,
    ) -> StreamHandle<R> {
        Arc::new(Self {
            kind,
            gop,
            read_timeout,
            closed: AtomicBool::new(false),
            keyframe_pending: AtomicBool::new(false),
            qp: AtomicU32::new(qp),
            inner: Mutex::new(Inner {
                reader: Some(reader),
                rc,
            }),
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Current quantizer
    pub fn qp(&self) -> u32 {
        self.qp.load(Ordering::Relaxed)
    }

    /// Whether any adaptive rate-control feature is left enabled, `None`
    /// without rate control
    pub fn adaptive_rate_control(&self) -> Option<bool> {
        self.inner.lock().rc.as_ref().map(|rc| rc.adaptive().any())
    }

    /// Queue a keyframe request for the next read. Returns false once the
    /// session is closed.
    pub fn request_keyframe(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        self.keyframe_pending.store(true, Ordering::Release);
        true
    }

    /// Dequeue one encoded frame, feed its size to the rate controller and
    /// hand the buffer back to the device. `Ok(None)` means try again.
    ///
    /// Blocks for at most the read timeout while holding only this session's
    /// lock.
    pub fn read_frame(&self) -> Result<Option<EncodedAccessUnit>> {
        if !self.is_open() {
            return Err(Error::NotRunning);
        }
        let mut inner = self.inner.lock();
        let Inner { reader, rc } = &mut *inner;
        let reader = reader.as_mut().ok_or(Error::NotRunning)?;

        if self.keyframe_pending.swap(false, Ordering::AcqRel) {
            self.apply_keyframe(reader);
        }

        let frame = match reader.read_frame(self.read_timeout) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("{} stream: {}", self.kind, e);
                return Err(e.into());
            }
        };

        let data = reader
            .frame_data(frame.index)
            .map(|buf| Bytes::copy_from_slice(&buf[..frame.bytes_used.min(buf.len())]));
        let Some(data) = data else {
            warn!("{} stream: invalid buffer index {}", self.kind, frame.index);
            self.release(reader);
            return Ok(None);
        };

        if frame.bytes_used > 0 {
            if let Some(rc) = rc.as_mut() {
                let qp = rc.update(frame.bytes_used);
                self.qp.store(qp, Ordering::Relaxed);
                if let Err(e) = reader.set_qp(qp) {
                    debug!("{} stream: {}", self.kind, e);
                }
            }
        }
        self.release(reader);

        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(EncodedAccessUnit {
            data,
            keyframe: frame.keyframe,
            timestamp: frame.timestamp,
        }))
    }

    fn release(&self, reader: &mut R) {
        if let Err(e) = reader.release_frame() {
            warn!("{} stream: {}", self.kind, e);
        }
    }

    /// Force-keyframe control first, then the GOP nudge
    fn apply_keyframe(&self, reader: &mut R) {
        let forced = reader.force_keyframe().or_else(|e: HalError| {
            debug!("{} stream: {}, falling back to gop", self.kind, e);
            if self.gop == 0 {
                return Err(e);
            }
            reader.set_gop(self.gop)
        });
        match forced {
            Ok(()) => debug!("{} stream: keyframe requested", self.kind),
            Err(e) => warn!("{} stream: keyframe request failed: {}", self.kind, e),
        }
    }

    /// Mark the channel closed and take the reader back, waiting for an
    /// in-flight read to return first
    pub(crate) fn close(&self) -> Option<R> {
        self.closed.store(true, Ordering::Release);
        let mut inner = self.inner.lock();
        inner.rc = None;
        inner.reader.take()
    }
}

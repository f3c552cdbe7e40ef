//! Device read capability consumed by the capture worker

use std::io;
use std::os::fd::BorrowedFd;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use super::frame::PixelFormat;

/// A readable source of encoded access units.
///
/// `read` returns `Ok(0)` when no data is available yet; that is not an error
/// and the caller retries. A source may expose a pollable descriptor through
/// `ready_fd`, but callers never assume one exists.
pub trait DeviceSource: Send {
    /// Read one access unit into `buf`, returning the number of bytes written
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Size of the buffer the caller should hand to `read`
    fn buffer_size(&self) -> usize;

    /// Descriptor that becomes readable when `read` would not block
    fn ready_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    fn format(&self) -> PixelFormat;

    /// Output dimensions of the stream
    fn dimensions(&self) -> (u32, u32);

    /// Handle that can ask the source for a keyframe from another thread
    fn keyframe_trigger(&self) -> Option<Arc<dyn KeyframeTrigger>> {
        None
    }
}

/// Best-effort, non-blocking keyframe request
pub trait KeyframeTrigger: Send + Sync {
    /// Returns true if the request was issued
    fn request_keyframe(&self) -> bool;
}

/// Copy as much of `payload` as fits into `buf`, returning the bytes copied.
///
/// Lost bytes are logged and counted under `camrelay_truncated_bytes`.
pub fn copy_into(payload: &[u8], buf: &mut [u8], stream: &str) -> usize {
    let n = payload.len().min(buf.len());
    buf[..n].copy_from_slice(&payload[..n]);
    let truncated = payload.len() - n;
    if truncated > 0 {
        warn!(
            "{}: frame truncated by {} bytes (max {})",
            stream,
            truncated,
            buf.len()
        );
        metrics::counter!("camrelay_truncated_bytes", "stream" => stream.to_owned())
            .increment(truncated as u64);
    }
    n
}

/// Splits one raw device read into access units.
///
/// Extension point for multiplexed formats; plain elementary streams use
/// [`WholeFrame`].
pub trait FrameSplitter: Send {
    fn split(&mut self, raw: Bytes) -> Vec<Bytes>;
}

/// Treats every read as exactly one access unit
#[derive(Debug, Default, Clone, Copy)]
pub struct WholeFrame;

impl FrameSplitter for WholeFrame {
    fn split(&mut self, raw: Bytes) -> Vec<Bytes> {
        if raw.is_empty() {
            Vec::new()
        } else {
            vec![raw]
        }
    }
}

//! Hardware encoder capability
//!
//! The vendor encoder is driven through a process-wide configuration context
//! per session. [`EncoderHal`] is the narrow surface the orchestrator needs
//! from it; a board support crate implements it over the vendor SDK.

use std::fmt;
use std::os::fd::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;

use super::rate_control::{CbrController, RateController};
use crate::capture::Timestamp;

/// Buffer count the vendor stages need at minimum
pub const DEFAULT_BUFFER_COUNT: u32 = 2;

pub type HalResult<T> = std::result::Result<T, HalError>;

/// Hardware operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HalOp {
    Open,
    IspInit,
    IspStart,
    IspStop,
    IspUninit,
    CodecInit,
    CodecStart,
    CodecStop,
    CodecUninit,
    Read,
    Release,
    SetGop,
    SetQp,
    ForceKeyframe,
    PowerLine,
}

impl fmt::Display for HalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HalOp::Open => "device open",
            HalOp::IspInit => "isp init",
            HalOp::IspStart => "isp start",
            HalOp::IspStop => "isp stop",
            HalOp::IspUninit => "isp uninit",
            HalOp::CodecInit => "codec init",
            HalOp::CodecStart => "codec start",
            HalOp::CodecStop => "codec stop",
            HalOp::CodecUninit => "codec uninit",
            HalOp::Read => "codec read",
            HalOp::Release => "buffer release",
            HalOp::SetGop => "set gop",
            HalOp::SetQp => "set qp",
            HalOp::ForceKeyframe => "force keyframe",
            HalOp::PowerLine => "power line frequency",
        };
        f.write_str(name)
    }
}

/// A failed hardware call and the OS error it reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{op} failed: {errno}")]
pub struct HalError {
    pub op: HalOp,
    pub errno: Errno,
}

impl HalError {
    pub fn new(op: HalOp, errno: Errno) -> Self {
        Self { op, errno }
    }
}

/// Open device node. Returned to [`EncoderHal::close_device`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceHandle(RawFd);

impl DeviceHandle {
    pub fn new(fd: RawFd) -> Self {
        Self(fd)
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Memory-to-memory session that owns the ISP stage
    Primary,
    /// Attaches to the primary session's output plane
    Derived,
}

/// V4L2-style buffer memory type
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    Mmap,
    UserPtr,
}

impl MemoryMode {
    pub fn toggled(self) -> Self {
        match self {
            MemoryMode::Mmap => MemoryMode::UserPtr,
            MemoryMode::UserPtr => MemoryMode::Mmap,
        }
    }
}

/// Configuration context of one encode session.
///
/// Each session owns its context exclusively; the derived session copies
/// what it needs from the primary's at configure time and never writes back.
#[derive(Debug)]
pub struct SessionContext {
    pub role: SessionRole,
    pub codec_device: String,
    pub isp_device: Option<String>,
    pub scale: u32,
    pub width: u32,
    pub height: u32,
    pub isp_fps: u32,
    pub codec_fps: u32,
    pub bitrate: u32,
    pub qp: u32,
    pub gop: u32,
    pub buffer_count: u32,
    pub capture_memory: MemoryMode,
    pub output_memory: MemoryMode,
    pub codec: Option<DeviceHandle>,
    pub isp: Option<DeviceHandle>,
}

impl SessionContext {
    pub fn is_primary(&self) -> bool {
        self.role == SessionRole::Primary
    }
}

/// An encoded frame sitting in a device buffer until released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedFrame {
    pub index: usize,
    pub bytes_used: usize,
    pub keyframe: bool,
    pub timestamp: Timestamp,
}

/// Frame path of one started session.
///
/// Handed out by [`EncoderHal::session_reader`] once the codec stage runs and
/// dropped before the session is stopped. A reader only touches its own
/// session, so the two streams read in parallel without sharing the HAL.
pub trait SessionReader: Send + 'static {
    /// Dequeue one encoded frame, waiting at most `timeout`. `Ok(None)` when
    /// nothing arrived in time or the call was interrupted.
    fn read_frame(&mut self, timeout: Duration) -> HalResult<Option<EncodedFrame>>;

    /// Contents of the device buffer at `index`
    fn frame_data(&self, index: usize) -> Option<&[u8]>;

    /// Give the last dequeued buffer back to the device
    fn release_frame(&mut self) -> HalResult<()>;

    /// Apply `gop` as the keyframe interval
    fn set_gop(&mut self, gop: u32) -> HalResult<()>;

    /// Apply `qp` for the next frame
    fn set_qp(&mut self, _qp: u32) -> HalResult<()> {
        Ok(())
    }

    fn force_keyframe(&mut self) -> HalResult<()> {
        Err(HalError::new(HalOp::ForceKeyframe, Errno::ENOTSUP))
    }
}

/// Stateful vendor encoder.
///
/// Lifecycle calls for one session are always made with that session's
/// context. The orchestrator guarantees reverse-order undo and never calls an
/// undo step whose matching do step did not succeed.
pub trait EncoderHal: Send {
    type Reader: SessionReader;

    fn open_device(&mut self, path: &str) -> HalResult<DeviceHandle>;
    fn close_device(&mut self, handle: DeviceHandle);

    fn isp_init(&mut self, ctx: &SessionContext) -> HalResult<()>;
    fn isp_start(&mut self, ctx: &SessionContext) -> HalResult<()>;
    fn isp_stop(&mut self, ctx: &SessionContext) -> HalResult<()>;
    fn isp_uninit(&mut self, ctx: &SessionContext) -> HalResult<()>;

    fn codec_init(&mut self, ctx: &SessionContext) -> HalResult<()>;
    fn codec_start(&mut self, ctx: &SessionContext) -> HalResult<()>;
    fn codec_stop(&mut self, ctx: &SessionContext) -> HalResult<()>;
    fn codec_uninit(&mut self, ctx: &SessionContext) -> HalResult<()>;

    /// Frame path of a session whose codec stage has just started
    fn session_reader(&mut self, ctx: &SessionContext) -> HalResult<Self::Reader>;

    /// Anti-flicker setting, valid while the ISP stage runs
    fn set_power_line_frequency(&mut self, _hz: u32) -> HalResult<()> {
        Err(HalError::new(HalOp::PowerLine, Errno::ENOTSUP))
    }

    /// Coded size the driver bound the session to, if it reports one
    fn coded_size(&self, _ctx: &SessionContext) -> Option<(u32, u32)> {
        None
    }

    fn rate_controller(&self) -> Box<dyn RateController> {
        Box::new(CbrController::default())
    }
}

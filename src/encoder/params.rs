//! Stream parameters and the rules that derive encoder settings from them

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Floor for the per-frame size budget
pub const DEFAULT_FRAME_BUDGET: usize = 512 * 1024;

/// Largest width or height a stream may request
pub const MAX_DIMENSION: u32 = 8192;

/// Highest frame rate a stream may request
pub const MAX_FPS: u32 = 240;

/// Which of the two logical streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Primary, full resolution
    High,
    /// Derived, scaled down from the primary
    Low,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::High => f.write_str("high"),
            StreamKind::Low => f.write_str("low"),
        }
    }
}

/// Per-stream encode settings. A `gop` of zero means "derive from fps".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target bitrate in bit/s, zero disables rate control
    pub bitrate: u32,
    pub gop: u32,
    pub scale: u32,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            fps: 0,
            bitrate: 0,
            gop: 0,
            scale: 1,
        }
    }
}

impl StreamParams {
    pub fn new(width: u32, height: u32, fps: u32, bitrate: u32) -> Self {
        Self {
            width,
            height,
            fps,
            bitrate,
            ..Self::default()
        }
    }

    pub fn with_gop(mut self, gop: u32) -> Self {
        self.gop = gop;
        self
    }

    pub fn with_scale(mut self, scale: u32) -> Self {
        self.scale = scale;
        self
    }
}

/// Encoder device nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Image-signal-processing node
    pub isp_device: String,
    /// Primary (memory-to-memory) codec node
    pub m2m_device: String,
    /// Dedicated node for the derived stream; the primary node when unset
    pub derived_device: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            isp_device: "/dev/video0".into(),
            m2m_device: "/dev/video1".into(),
            derived_device: None,
        }
    }
}

impl DeviceConfig {
    /// Same mapping with the ISP and codec roles exchanged
    pub fn swapped(&self) -> Self {
        Self {
            isp_device: self.m2m_device.clone(),
            m2m_device: self.isp_device.clone(),
            derived_device: self.derived_device.clone(),
        }
    }
}

/// Initial quantization seed from bits per pixel
pub fn suggested_qp(params: &StreamParams) -> u32 {
    if params.bitrate == 0 || params.fps == 0 || params.width == 0 || params.height == 0 {
        return 30;
    }
    let pixels = f64::from(params.width) * f64::from(params.height);
    let bits_per_frame = f64::from(params.bitrate) / f64::from(params.fps);
    let bpp = bits_per_frame / pixels;

    if bpp >= 0.10 {
        24
    } else if bpp >= 0.05 {
        27
    } else if bpp >= 0.025 {
        30
    } else {
        33
    }
}

/// Largest access unit callers should expect, in bytes
pub fn frame_budget(params: &StreamParams) -> usize {
    if params.fps == 0 || params.bitrate == 0 {
        return DEFAULT_FRAME_BUDGET;
    }
    let bytes_per_frame = (params.bitrate / 8 / params.fps) as usize;
    DEFAULT_FRAME_BUDGET.max(bytes_per_frame.saturating_mul(2))
}

/// Round up to the next multiple of 16, or down to the largest one near
/// `u32::MAX`
pub fn align16(v: u32) -> u32 {
    v.checked_next_multiple_of(16).unwrap_or(u32::MAX & !15)
}

/// Validated settings for the primary and optional derived stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLayout {
    pub high: StreamParams,
    pub low: Option<StreamParams>,
}

impl StreamLayout {
    /// Validate caller settings and fill in derived values.
    ///
    /// Rejects zero geometry or frame rate on the primary stream, geometry
    /// above [`MAX_DIMENSION`] or a frame rate above [`MAX_FPS`], a derived
    /// scale outside {1, 2, 4} and a derived frame rate above the primary's.
    /// The derived geometry is the primary's divided by the scale, rounded up
    /// to a multiple of 16. Unset GOPs become 2 x fps (primary) and fps
    /// (derived).
    pub fn resolve(high: StreamParams, low: StreamParams, single_stream: bool) -> Result<Self> {
        if high.width == 0 || high.height == 0 || high.fps == 0 {
            return Err(Error::config(format!(
                "high stream needs non-zero geometry and fps (got {}x{}@{})",
                high.width, high.height, high.fps
            )));
        }
        if high.width > MAX_DIMENSION || high.height > MAX_DIMENSION || high.fps > MAX_FPS {
            return Err(Error::config(format!(
                "high stream {}x{}@{} exceeds {}x{}@{}",
                high.width, high.height, high.fps, MAX_DIMENSION, MAX_DIMENSION, MAX_FPS
            )));
        }

        let mut high = high;
        if high.gop == 0 {
            high.gop = high.fps.saturating_mul(2);
        }

        if single_stream {
            info!("single-stream mode, derived stream disabled");
            return Ok(Self { high, low: None });
        }

        if !matches!(low.scale, 1 | 2 | 4) {
            return Err(Error::config(format!(
                "low stream scale must be 1, 2 or 4 (got {})",
                low.scale
            )));
        }

        let mut low = low;
        low.width = align16(high.width / low.scale);
        low.height = align16(high.height / low.scale);
        if low.width == 0 || low.height == 0 {
            return Err(Error::config(format!(
                "low stream geometry collapses to {}x{}",
                low.width, low.height
            )));
        }

        if low.fps == 0 {
            low.fps = high.fps;
        }
        if low.fps > high.fps {
            return Err(Error::config(format!(
                "low stream fps {} exceeds high stream fps {}",
                low.fps, high.fps
            )));
        }
        if low.gop == 0 {
            low.gop = low.fps;
        }

        Ok(Self {
            high,
            low: Some(low),
        })
    }

    pub fn params(&self, kind: StreamKind) -> Option<&StreamParams> {
        match kind {
            StreamKind::High => Some(&self.high),
            StreamKind::Low => self.low.as_ref(),
        }
    }

    /// Scale the primary session encodes at
    pub fn primary_scale(&self) -> u32 {
        match self.low {
            Some(_) => 1,
            None if matches!(self.high.scale, 2 | 4) => self.high.scale,
            None => 1,
        }
    }
}

//! Closed-loop constant-bitrate control
//!
//! The controller is seeded when a session starts and then fed the size of
//! every encoded frame; it answers with the quantization target for the next
//! frame.

use tracing::{debug, info};

/// Lowest and highest H.264 quantizer the controller will emit
pub const MIN_QP: u32 = 10;
pub const MAX_QP: u32 = 51;

/// Inputs used to seed a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSeed {
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub fps: u32,
    pub gop: u32,
    /// Starting quantizer before any feedback
    pub initial_qp: u32,
}

/// Vendor-style adaptive features that alter frame rate or bitrate on motion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveFeatures {
    pub motion_rate_control: bool,
    pub motion_low_bitrate: bool,
    pub dynamic_update: bool,
}

impl AdaptiveFeatures {
    pub fn any(&self) -> bool {
        self.motion_rate_control || self.motion_low_bitrate || self.dynamic_update
    }
}

impl Default for AdaptiveFeatures {
    /// Seeding restores these vendor defaults
    fn default() -> Self {
        Self {
            motion_rate_control: true,
            motion_low_bitrate: true,
            dynamic_update: true,
        }
    }
}

pub trait RateController: Send {
    /// Reset state for a new session and return the first quantizer.
    /// Re-enables the adaptive features.
    fn seed(&mut self, seed: &RateSeed) -> u32;

    /// Turn off every adaptive feature. Must run after [`seed`](Self::seed).
    fn disable_adaptive(&mut self);

    fn adaptive(&self) -> AdaptiveFeatures;

    /// Feed the size of the frame just produced, returning the next quantizer
    fn update(&mut self, frame_bytes: usize) -> u32;
}

/// Virtual-buffer CBR controller.
///
/// Tracks the running surplus of produced bits over the per-frame target and
/// nudges the quantizer up or down when the surplus leaves a dead band around
/// zero. The buffer is one second of bitrate deep.
#[derive(Debug, Clone)]
pub struct CbrController {
    qp: u32,
    target_bits: i64,
    buffer_bits: i64,
    fullness: i64,
    frames: u64,
    gop: u32,
    adaptive: AdaptiveFeatures,
}

impl Default for CbrController {
    fn default() -> Self {
        Self {
            qp: 30,
            target_bits: 0,
            buffer_bits: 0,
            fullness: 0,
            frames: 0,
            gop: 0,
            adaptive: AdaptiveFeatures::default(),
        }
    }
}

impl CbrController {
    pub fn qp(&self) -> u32 {
        self.qp
    }

    /// Surplus bits currently held in the virtual buffer
    pub fn fullness(&self) -> i64 {
        self.fullness
    }
}

impl RateController for CbrController {
    fn seed(&mut self, seed: &RateSeed) -> u32 {
        let fps = i64::from(seed.fps.max(1));
        *self = Self {
            qp: seed.initial_qp.clamp(MIN_QP, MAX_QP),
            target_bits: i64::from(seed.bitrate) / fps,
            buffer_bits: i64::from(seed.bitrate).max(1),
            gop: seed.gop,
            ..Self::default()
        };
        info!(
            "RC: {}x{} target {} bit/s @ {} fps gop {} -> qp {}",
            seed.width, seed.height, seed.bitrate, seed.fps, seed.gop, self.qp
        );
        self.qp
    }

    fn disable_adaptive(&mut self) {
        self.adaptive = AdaptiveFeatures {
            motion_rate_control: false,
            motion_low_bitrate: false,
            dynamic_update: false,
        };
        debug!("RC: adaptive motion features disabled");
    }

    fn adaptive(&self) -> AdaptiveFeatures {
        self.adaptive
    }

    fn update(&mut self, frame_bytes: usize) -> u32 {
        if self.target_bits == 0 {
            return self.qp;
        }
        self.frames += 1;

        let produced = frame_bytes as i64 * 8;
        self.fullness =
            (self.fullness + produced - self.target_bits).clamp(-self.buffer_bits, self.buffer_bits);

        // Keyframes are expected to overshoot; only steer on the buffer level.
        let level = self.fullness * 100 / self.buffer_bits;
        let step: i64 = match level {
            l if l > 50 => 2,
            l if l > 10 => 1,
            l if l < -50 => -2,
            l if l < -10 => -1,
            _ => 0,
        };

        let next = (i64::from(self.qp) + step).clamp(i64::from(MIN_QP), i64::from(MAX_QP)) as u32;
        if next != self.qp {
            debug!(
                "RC: frame {} size {} fullness {}% qp {} -> {} (gop {})",
                self.frames, frame_bytes, level, self.qp, next, self.gop
            );
        }
        self.qp = next;
        self.qp
    }
}

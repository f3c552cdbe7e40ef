//! Per-second frame rate and bandwidth meter

use tracing::info;

/// Counts frames and bytes within the current wall-clock second and reports
/// the totals when the second rolls over.
#[derive(Debug)]
pub struct RateMeter {
    label: String,
    second: u64,
    frames: u32,
    bytes: usize,
}

/// Totals for one completed second
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateReport {
    pub second: u64,
    pub fps: u32,
    pub kbps: usize,
}

impl RateMeter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            second: 0,
            frames: 0,
            bytes: 0,
        }
    }

    /// Record one frame seen at wall-clock second `now_sec`.
    ///
    /// Returns the report for the previous second when `now_sec` starts a new one.
    pub fn record(&mut self, now_sec: u64, frame_size: usize) -> Option<RateReport> {
        let report = if now_sec != self.second {
            let report = (self.frames > 0).then(|| RateReport {
                second: self.second,
                fps: self.frames,
                kbps: self.bytes / 128,
            });
            self.second = now_sec;
            self.frames = 0;
            self.bytes = 0;
            report
        } else {
            None
        };

        self.frames += 1;
        self.bytes += frame_size;

        if let Some(r) = report {
            info!(
                "{} tv_sec:{} fps:{} bandwidth:{}kbps",
                self.label, r.second, r.fps, r.kbps
            );
            metrics::gauge!("camrelay_fps", "side" => self.label.clone()).set(f64::from(r.fps));
            metrics::gauge!("camrelay_kbps", "side" => self.label.clone()).set(r.kbps as f64);
        }
        report
    }
}

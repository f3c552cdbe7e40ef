use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::frame::PixelFormat;
use crate::capture::v4l2::fourcc_for;
use crate::error::{Error, Result};

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

impl FoundDevice {
    pub fn new(path: String, format: PixelFormat) -> Self {
        Self { path, format }
    }
}

/// Auto-detect a capture node producing an encoded stream.
///
/// Scans `/dev/video0..9`, preferring `preferred` and accepting any other
/// format we carry when no node offers it.
pub fn auto_detect_device(preferred: PixelFormat) -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    let mut fallback = None;
    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Some((card, formats)) = query_device(&path) else {
            continue;
        };
        if formats.contains(&preferred) {
            info!("Found {:?} device: {} - {}", preferred, path, card);
            return Ok(FoundDevice::new(path, preferred));
        }
        if fallback.is_none() {
            if let Some(&format) = formats.first() {
                debug!("{} offers {:?}, keeping as fallback", path, format);
                fallback = Some(FoundDevice::new(path, format));
            }
        }
    }

    fallback.ok_or_else(|| Error::config("No suitable capture device found"))
}

/// Card name and the carried formats a capture node offers
fn query_device(path: &str) -> Option<(String, Vec<PixelFormat>)> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return None;
    }
    let offered = dev.enum_formats().ok()?;
    let formats = [PixelFormat::H264, PixelFormat::Mjpeg]
        .into_iter()
        .filter(|f| offered.iter().any(|d| d.fourcc == fourcc_for(*f)))
        .collect();
    Some((caps.card, formats))
}

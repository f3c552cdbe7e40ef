//! One orchestrator stream as a capture device source

use std::io;
use std::sync::Arc;

use tracing::{debug, trace};

use super::hal::{EncoderHal, SessionReader};
use super::orchestrator::EncoderOrchestrator;
use super::params::StreamKind;
use super::stream::StreamHandle;
use crate::bitstream::{self, ParameterSetCache};
use crate::capture::{copy_into, DeviceSource, KeyframeTrigger, PixelFormat};
use crate::error::{Error, Result};

/// Read buffer floor, large enough for a high-bitrate IDR
pub const DEFAULT_READ_BUFFER: usize = 2 * 1024 * 1024;

/// Reads one stream of a running orchestrator and repairs keyframes that
/// arrive without parameter sets.
///
/// Holds only the stream's channel, so a blocked read never holds up the
/// other stream or the orchestrator. The codec descriptor is not exposed
/// for readiness polling: the vendor read call does its own waiting, so the
/// capture worker falls back to direct reads.
pub struct EncoderStreamSource<R> {
    channel: StreamHandle<R>,
    label: String,
    dimensions: (u32, u32),
    buffer_size: usize,
    param_sets: ParameterSetCache,
}

impl<R: SessionReader> EncoderStreamSource<R> {
    /// Attach to `kind`; the stream must already be running
    pub fn open<H>(orchestrator: &EncoderOrchestrator<H>, kind: StreamKind) -> Result<Self>
    where
        H: EncoderHal<Reader = R>,
    {
        let channel = orchestrator.stream(kind)?;
        let params = orchestrator
            .stream_params(kind)
            .ok_or(Error::NotRunning)?;
        let dimensions = (params.width, params.height);
        let buffer_size = orchestrator.max_frame_size(kind).max(DEFAULT_READ_BUFFER);

        debug!(
            "{} stream source {}x{} buffer {}",
            kind, dimensions.0, dimensions.1, buffer_size
        );
        Ok(Self {
            channel,
            label: kind.to_string(),
            dimensions,
            buffer_size,
            param_sets: ParameterSetCache::new(),
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.channel.kind()
    }
}

impl<R: SessionReader> DeviceSource for EncoderStreamSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let unit = match self.channel.read_frame() {
            Ok(Some(unit)) => unit,
            Ok(None) => return Ok(0),
            Err(Error::NotRunning) => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("{} stream is not running", self.label),
                ))
            }
            Err(Error::Hal(e)) => return Err(io::Error::from_raw_os_error(e.errno as i32)),
            Err(e) => return Err(io::Error::other(e)),
        };

        self.param_sets.observe(&unit.data);
        let keyframe = unit.keyframe || bitstream::is_keyframe(&unit.data);
        let payload = self.param_sets.repair(unit.data, keyframe);

        let n = copy_into(&payload, buf, &self.label);
        trace!("{} stream: read {} bytes", self.label, n);
        Ok(n)
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn format(&self) -> PixelFormat {
        PixelFormat::H264
    }

    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn keyframe_trigger(&self) -> Option<Arc<dyn KeyframeTrigger>> {
        Some(Arc::new(EncoderKeyframeTrigger {
            channel: self.channel.clone(),
        }))
    }
}

/// Keyframe requests queued on the stream's channel.
///
/// Never waits on a read in progress; the request is applied by the next one.
pub struct EncoderKeyframeTrigger<R> {
    channel: StreamHandle<R>,
}

impl<R: SessionReader> KeyframeTrigger for EncoderKeyframeTrigger<R> {
    fn request_keyframe(&self) -> bool {
        self.channel.request_keyframe()
    }
}

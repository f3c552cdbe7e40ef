//! V4L2 capture node exposed as a device source

use std::io;
use std::os::fd::BorrowedFd;

use bytes::Bytes;
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::bitstream::{self, ParameterSetCache};
use crate::capture::device::{copy_into, DeviceSource};
use crate::capture::frame::PixelFormat;
use crate::error::{Error, Result};
use crate::CaptureConfig;

/// Memory-mapped V4L2 capture of an encoded stream
pub struct V4l2Source {
    device: Device,
    stream: MmapStream<'static>,
    config: CaptureConfig,
    /// Present for Annex-B formats when parameter-set repetition is enabled
    param_sets: Option<ParameterSetCache>,
}

impl V4l2Source {
    /// Open the device, negotiate format and frame rate, and start streaming
    pub fn open(config: CaptureConfig) -> Result<Self> {
        let path = config.device.path.clone();
        info!("Initializing V4L2 capture: {:?}", config.device);

        let device = Device::with_path(&path).map_err(|e| Error::device(&path, e))?;

        let caps = device.query_caps().map_err(|e| Error::device(&path, e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::config(format!(
                "{} doesn't support video capture",
                path
            )));
        }

        let fourcc = fourcc_for(config.format);
        let mut fmt = device.format().map_err(|e| Error::device(&path, e))?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = fourcc;
        let applied = device
            .set_format(&fmt)
            .map_err(|e| Error::device(&path, e))?;
        if applied.fourcc != fourcc {
            return Err(Error::config(format!(
                "{} rejected format {:?} (driver chose {})",
                path, config.format, applied.fourcc
            )));
        }
        if applied.width != config.width || applied.height != config.height {
            warn!(
                "Driver adjusted capture size {}x{} -> {}x{}",
                config.width, config.height, applied.width, applied.height
            );
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            warn!("Failed to set {} fps on {}: {}", config.fps, path, e);
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)
            .map_err(|e| Error::device(&path, e))?;
        info!(
            "Capture stream started with {} buffers",
            config.buffer_count
        );

        let param_sets = (config.format.is_annexb() && config.repeat_parameter_sets)
            .then(ParameterSetCache::new);

        Ok(Self {
            device,
            stream,
            config,
            param_sets,
        })
    }
}

impl DeviceSource for V4l2Source {
    #[instrument(level = "trace", skip_all)]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (data, meta) = CaptureStream::next(&mut self.stream)?;
        let used = match meta.bytesused as usize {
            0 => data.len(),
            n => n.min(data.len()),
        };
        let data = &data[..used];

        let payload = match self.param_sets.as_mut() {
            Some(cache) => {
                cache.observe(data);
                let keyframe = bitstream::is_keyframe(data);
                cache.repair(Bytes::copy_from_slice(data), keyframe)
            }
            None => Bytes::copy_from_slice(data),
        };

        Ok(copy_into(&payload, buf, &self.config.device.path))
    }

    fn buffer_size(&self) -> usize {
        self.config.read_buffer_size
    }

    fn ready_fd(&self) -> Option<BorrowedFd<'_>> {
        let fd = self.device.handle().fd();
        // SAFETY: `fd` is the descriptor `self.device` opened and owns. It is
        // closed only when the `Device` drops, and the returned borrow is tied
        // to `&self`, so it cannot outlive the device. A negative value means
        // no open descriptor and is never borrowed.
        (fd >= 0).then(|| unsafe { BorrowedFd::borrow_raw(fd) })
    }

    fn format(&self) -> PixelFormat {
        self.config.format
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }
}

/// V4L2 fourcc for a stream format
pub fn fourcc_for(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::H264 => FourCC::new(b"H264"),
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
    }
}

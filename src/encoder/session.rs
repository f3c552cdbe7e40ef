//! One encode session and its lifecycle flags

use tracing::{debug, warn};

use super::hal::{EncoderHal, SessionContext, SessionReader};
use super::params::StreamKind;
use super::rate_control::RateController;
use super::stream::StreamHandle;

/// Which bring-up steps have succeeded
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionFlags {
    pub isp_initialized: bool,
    pub isp_started: bool,
    pub codec_initialized: bool,
    pub codec_started: bool,
    pub active: bool,
}

impl SessionFlags {
    pub fn any(&self) -> bool {
        self.isp_initialized
            || self.isp_started
            || self.codec_initialized
            || self.codec_started
            || self.active
    }
}

pub struct EncoderSession<R> {
    pub kind: StreamKind,
    pub ctx: SessionContext,
    pub flags: SessionFlags,
    /// Seeded during bring-up, moved into the channel once the codec runs
    pub rc: Option<Box<dyn RateController>>,
    pub channel: Option<StreamHandle<R>>,
}

impl<R: SessionReader> EncoderSession<R> {
    pub fn new(kind: StreamKind, ctx: SessionContext) -> Self {
        Self {
            kind,
            ctx,
            flags: SessionFlags::default(),
            rc: None,
            channel: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.flags.active
    }

    /// Undo every step that succeeded, newest first, then close handles.
    ///
    /// Safe on a session that never started or only partly started, and safe
    /// to call twice.
    pub fn teardown<H: EncoderHal<Reader = R> + ?Sized>(&mut self, hal: &mut H) {
        let kind = self.kind;
        self.flags.active = false;

        // Readers must be gone before the codec stops under them
        if let Some(channel) = self.channel.take() {
            drop(channel.close());
        }

        if self.flags.codec_started {
            if let Err(e) = hal.codec_stop(&self.ctx) {
                warn!("{} stream: {}", kind, e);
            }
            self.flags.codec_started = false;
        }
        if self.flags.codec_initialized {
            if let Err(e) = hal.codec_uninit(&self.ctx) {
                warn!("{} stream: {}", kind, e);
            }
            self.flags.codec_initialized = false;
        }
        if self.ctx.is_primary() {
            if self.flags.isp_started {
                if let Err(e) = hal.isp_stop(&self.ctx) {
                    warn!("{} stream: {}", kind, e);
                }
                self.flags.isp_started = false;
            }
            if self.flags.isp_initialized {
                if let Err(e) = hal.isp_uninit(&self.ctx) {
                    warn!("{} stream: {}", kind, e);
                }
                self.flags.isp_initialized = false;
            }
        }

        if let Some(handle) = self.ctx.codec.take() {
            hal.close_device(handle);
        }
        if let Some(handle) = self.ctx.isp.take() {
            hal.close_device(handle);
        }
        self.rc = None;
        debug!("{} stream session torn down", kind);
    }
}

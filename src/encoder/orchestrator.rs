//! Encoder session orchestrator
//!
//! Brings up the primary session (ISP + codec) and the optional derived
//! session that attaches to the primary's output plane at its own scale.
//! Every bring-up step that has a known alternate configuration runs through
//! a [`Ladder`]; when a step's ladder is exhausted the session is torn down
//! completely and the failure is reported.
//!
//! Lifecycle calls take `&mut self`. The frame path does not: each active
//! session publishes a [`StreamChannel`] with its own lock, and capture
//! threads read through that.

use std::os::fd::RawFd;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use tracing::{error, info, warn};

use super::hal::{
    DeviceHandle, EncoderHal, HalError, HalOp, HalResult, MemoryMode, SessionContext,
    SessionReader, SessionRole, DEFAULT_BUFFER_COUNT,
};
use super::ladder::{Ladder, Rung};
use super::params::{
    align16, frame_budget, suggested_qp, DeviceConfig, StreamKind, StreamLayout, StreamParams,
    DEFAULT_FRAME_BUDGET,
};
use super::rate_control::RateSeed;
use super::session::{EncoderSession, SessionFlags};
use super::stream::{EncodedAccessUnit, StreamChannel, StreamHandle};
use crate::error::{Error, Result};
use crate::EncoderConfig;

/// Bring-up tuning that is not part of the stream parameters
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub buffer_count: u32,
    /// Memory type of the primary codec's raw input plane
    pub output_memory: MemoryMode,
    /// Anti-flicker frequency applied after ISP start, 0 to leave unset
    pub power_line_hz: u32,
    /// Pause after ISP start before the codec stage requests buffers
    pub isp_settle: Duration,
    /// Pause between primary and derived bring-up
    pub derived_settle: Duration,
    /// Bound on one encoded-frame wait
    pub read_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            output_memory: MemoryMode::UserPtr,
            power_line_hz: 0,
            isp_settle: Duration::from_millis(50),
            derived_settle: Duration::from_millis(300),
            read_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&EncoderConfig> for OrchestratorOptions {
    fn from(config: &EncoderConfig) -> Self {
        Self {
            buffer_count: config.buffer_count,
            output_memory: config.output_memory,
            power_line_hz: config.power_line_hz,
            isp_settle: Duration::from_millis(config.isp_settle_ms),
            derived_settle: Duration::from_millis(config.derived_settle_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
        }
    }
}

pub struct EncoderOrchestrator<H: EncoderHal> {
    hal: H,
    options: OrchestratorOptions,
    layout: Option<StreamLayout>,
    devices: Option<DeviceConfig>,
    high: Option<EncoderSession<H::Reader>>,
    low: Option<EncoderSession<H::Reader>>,
    running: bool,
}

impl<H: EncoderHal> EncoderOrchestrator<H> {
    pub fn new(hal: H, options: OrchestratorOptions) -> Self {
        Self {
            hal,
            options,
            layout: None,
            devices: None,
            high: None,
            low: None,
            running: false,
        }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Device mapping that worked, after any role swap
    pub fn devices(&self) -> Option<&DeviceConfig> {
        self.devices.as_ref()
    }

    /// Bring up the primary session and, if the layout has one, the derived
    /// session. Any earlier run is stopped first. On failure nothing is left
    /// configured.
    pub fn start(&mut self, layout: &StreamLayout, devices: &DeviceConfig) -> Result<()> {
        self.stop();

        let hal = &mut self.hal;
        let options = &self.options;
        let primary_scale = layout.primary_scale();
        let mut devices = devices.clone();

        let high = Ladder::new("high stream start")
            .rung(Rung::new(
                "swapped device roles",
                |d: &mut DeviceConfig, e: &HalError| {
                    if e.op != HalOp::Open {
                        return Ok(false);
                    }
                    *d = d.swapped();
                    Ok(true)
                },
            ))
            .run(&mut devices, |d| {
                info!(
                    "Starting high stream with m2m='{}' isp='{}'",
                    d.m2m_device, d.isp_device
                );
                let ctx = plan_context(
                    SessionRole::Primary,
                    &layout.high,
                    &d.m2m_device,
                    &d.isp_device,
                    primary_scale,
                    None,
                    options,
                );
                configure(hal, options, StreamKind::High, ctx, &d.m2m_device)
            })
            .map_err(|source| {
                error!("Failed to start high stream: {}", source);
                Error::SessionStart {
                    stream: StreamKind::High,
                    source,
                }
            })?;
        self.high = Some(high);

        match &layout.low {
            None => info!("low stream disabled (single-stream mode)"),
            Some(low) => {
                if !self.options.derived_settle.is_zero() {
                    thread::sleep(self.options.derived_settle);
                }

                let scale = if matches!(low.scale, 2 | 4) {
                    low.scale
                } else {
                    warn!("low stream scale {} not supported by the scaler, using 2", low.scale);
                    2
                };
                let node = devices
                    .derived_device
                    .clone()
                    .unwrap_or_else(|| devices.m2m_device.clone());
                let ctx = plan_context(
                    SessionRole::Derived,
                    low,
                    &node,
                    &devices.isp_device,
                    scale,
                    self.high.as_ref().map(|s| &s.ctx),
                    &self.options,
                );

                match configure(
                    &mut self.hal,
                    &self.options,
                    StreamKind::Low,
                    ctx,
                    &devices.m2m_device,
                ) {
                    Ok(session) => self.low = Some(session),
                    Err(source) => {
                        error!("Failed to start low stream: {}", source);
                        if let Some(mut high) = self.high.take() {
                            high.teardown(&mut self.hal);
                        }
                        return Err(Error::SessionStart {
                            stream: StreamKind::Low,
                            source,
                        });
                    }
                }
            }
        }

        self.layout = Some(layout.clone());
        self.devices = Some(devices);
        self.running = true;

        // Prime first clients
        self.request_keyframe(StreamKind::High);
        self.request_keyframe(StreamKind::Low);
        Ok(())
    }

    /// Tear down both sessions, derived first. Idempotent.
    pub fn stop(&mut self) {
        if self.running {
            info!("Stopping encoder sessions");
        }
        self.running = false;
        if let Some(mut low) = self.low.take() {
            low.teardown(&mut self.hal);
        }
        if let Some(mut high) = self.high.take() {
            high.teardown(&mut self.hal);
        }
    }

    fn session(&self, kind: StreamKind) -> Option<&EncoderSession<H::Reader>> {
        match kind {
            StreamKind::High => self.high.as_ref(),
            StreamKind::Low => self.low.as_ref(),
        }
    }

    /// Frame path of an active session. The handle stays valid across
    /// `stop`; reads through it then fail with [`Error::NotRunning`].
    pub fn stream(&self, kind: StreamKind) -> Result<StreamHandle<H::Reader>> {
        if !self.running {
            return Err(Error::NotRunning);
        }
        self.session(kind)
            .filter(|s| s.is_active())
            .and_then(|s| s.channel.clone())
            .ok_or(Error::NotRunning)
    }

    /// Dequeue one encoded frame, feed its size to the rate controller and
    /// hand the buffer back to the device. `Ok(None)` means try again.
    pub fn read_frame(&self, kind: StreamKind) -> Result<Option<EncodedAccessUnit>> {
        self.stream(kind)?.read_frame()
    }

    /// Codec descriptor of an active session
    pub fn ready_fd(&self, kind: StreamKind) -> Option<RawFd> {
        self.session(kind)
            .filter(|s| s.is_active())
            .and_then(|s| s.ctx.codec.as_ref())
            .map(DeviceHandle::raw)
    }

    pub fn stream_params(&self, kind: StreamKind) -> Option<StreamParams> {
        self.layout.as_ref()?.params(kind).copied()
    }

    /// Largest access unit the stream is expected to produce
    pub fn max_frame_size(&self, kind: StreamKind) -> usize {
        self.stream_params(kind)
            .map_or(DEFAULT_FRAME_BUDGET, |params| frame_budget(&params))
    }

    /// Ask for an IDR picture on the stream's next read. The force-keyframe
    /// control is tried first, then the GOP is re-applied as a nudge.
    /// Returns false if the stream is not active.
    pub fn request_keyframe(&self, kind: StreamKind) -> bool {
        self.session(kind)
            .filter(|s| s.is_active())
            .and_then(|s| s.channel.as_ref())
            .is_some_and(|channel| channel.request_keyframe())
    }

    pub fn session_flags(&self, kind: StreamKind) -> SessionFlags {
        self.session(kind).map(|s| s.flags).unwrap_or_default()
    }

    /// Current quantizer of a session
    pub fn qp(&self, kind: StreamKind) -> Option<u32> {
        let session = self.session(kind)?;
        Some(session.channel.as_ref().map_or(session.ctx.qp, |c| c.qp()))
    }

    /// Whether any adaptive rate-control feature is left enabled
    pub fn adaptive_rate_control(&self, kind: StreamKind) -> Option<bool> {
        self.session(kind)?.channel.as_ref()?.adaptive_rate_control()
    }
}

impl<H: EncoderHal> Drop for EncoderOrchestrator<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fill a session context from stream parameters.
///
/// The derived session takes the primary's geometry and ISP rate; its codec
/// rate is clamped to the ISP rate.
fn plan_context(
    role: SessionRole,
    params: &StreamParams,
    codec_device: &str,
    isp_device: &str,
    scale: u32,
    primary: Option<&SessionContext>,
    options: &OrchestratorOptions,
) -> SessionContext {
    let (width, height, isp_fps) = match (role, primary) {
        (SessionRole::Derived, Some(p)) if p.width > 0 && p.height > 0 => {
            (p.width, p.height, p.isp_fps)
        }
        (SessionRole::Derived, Some(p)) => (params.width, params.height, p.isp_fps),
        _ => (params.width, params.height, params.fps),
    };
    let isp_fps = isp_fps.max(1);
    let mut codec_fps = params.fps.max(1);
    if codec_fps > isp_fps {
        warn!(
            "Clamping codec fps {} to isp fps {}",
            codec_fps, isp_fps
        );
        codec_fps = isp_fps;
    }

    let ctx = SessionContext {
        role,
        codec_device: codec_device.to_owned(),
        isp_device: (!isp_device.is_empty()).then(|| isp_device.to_owned()),
        scale,
        width,
        height,
        isp_fps,
        codec_fps,
        bitrate: params.bitrate,
        qp: suggested_qp(params),
        gop: params.gop,
        buffer_count: options.buffer_count,
        capture_memory: MemoryMode::Mmap,
        output_memory: options.output_memory,
        codec: None,
        isp: None,
    };
    info!(
        "cfg {:?} scale={} {}x{} isp_fps={} codec_fps={} gop={} buf={} mem{{c,o}}={:?},{:?}",
        ctx.role,
        ctx.scale,
        ctx.width,
        ctx.height,
        ctx.isp_fps,
        ctx.codec_fps,
        ctx.gop,
        ctx.buffer_count,
        ctx.capture_memory,
        ctx.output_memory
    );
    ctx
}

/// Bring up one session, tearing it down if any step fails
fn configure<H: EncoderHal>(
    hal: &mut H,
    options: &OrchestratorOptions,
    kind: StreamKind,
    ctx: SessionContext,
    primary_node: &str,
) -> HalResult<EncoderSession<H::Reader>> {
    let mut session = EncoderSession::new(kind, ctx);
    if let Err(e) = bring_up(hal, &mut session, options, primary_node) {
        error!("{} stream bring-up failed: {}", kind, e);
        session.teardown(hal);
        return Err(e);
    }
    info!("{} stream active", kind);
    Ok(session)
}

/// HAL plus the context a ladder rung may adjust
struct Bind<'a, H> {
    hal: &'a mut H,
    ctx: &'a mut SessionContext,
}

fn raise_buffer_count<'r, H: 'r>() -> Rung<'r, Bind<'r, H>> {
    Rung::new("default buffer count", |b: &mut Bind<'r, H>, _: &HalError| {
        if b.ctx.buffer_count >= DEFAULT_BUFFER_COUNT {
            return Ok(false);
        }
        b.ctx.buffer_count = DEFAULT_BUFFER_COUNT;
        Ok(true)
    })
}

fn user_pointer_output<'r, H: 'r>() -> Rung<'r, Bind<'r, H>> {
    Rung::new("user pointer output", |b: &mut Bind<'r, H>, _: &HalError| {
        if b.ctx.output_memory != MemoryMode::Mmap {
            return Ok(false);
        }
        b.ctx.output_memory = MemoryMode::UserPtr;
        Ok(true)
    })
}

fn toggled_output_memory<'r, H: 'r>() -> Rung<'r, Bind<'r, H>> {
    Rung::new("toggled output memory", |b: &mut Bind<'r, H>, _: &HalError| {
        b.ctx.output_memory = b.ctx.output_memory.toggled();
        Ok(true)
    })
    .with_revert(|b: &mut Bind<'r, H>| {
        b.ctx.output_memory = b.ctx.output_memory.toggled();
    })
}

/// Some drivers require the capture height to be a multiple of 16
fn height_aligned_to_16<'r, H: 'r>() -> Rung<'r, Bind<'r, H>> {
    Rung::new("height aligned to 16", |b: &mut Bind<'r, H>, e: &HalError| {
        let aligned = align16(b.ctx.height);
        if !matches!(e.errno, Errno::EINVAL | Errno::ENOEXEC) || aligned == b.ctx.height {
            return Ok(false);
        }
        b.ctx.height = aligned;
        Ok(true)
    })
}

fn reuse_primary_node<'r, H: EncoderHal + 'r>(
    primary_node: &'r str,
    reopen: bool,
) -> Rung<'r, Bind<'r, H>> {
    Rung::new("primary codec node", move |b: &mut Bind<'r, H>, _: &HalError| {
        if primary_node.is_empty() || b.ctx.codec_device == primary_node {
            return Ok(false);
        }
        b.ctx.codec_device = primary_node.to_owned();
        if reopen {
            if let Some(handle) = b.ctx.codec.take() {
                b.hal.close_device(handle);
            }
            b.ctx.codec = Some(b.hal.open_device(primary_node)?);
        }
        Ok(true)
    })
}

fn bring_up<H: EncoderHal>(
    hal: &mut H,
    session: &mut EncoderSession<H::Reader>,
    options: &OrchestratorOptions,
    primary_node: &str,
) -> HalResult<()> {
    let kind = session.kind;
    let primary = session.ctx.is_primary();

    if primary {
        let Some(isp_path) = session.ctx.isp_device.clone() else {
            error!("{} stream: ISP device path is empty", kind);
            return Err(HalError::new(HalOp::Open, Errno::ENODEV));
        };
        session.ctx.isp = Some(hal.open_device(&isp_path)?);

        info!("{} stream: isp init", kind);
        Ladder::new("isp init")
            .rung(raise_buffer_count())
            .run(
                &mut Bind {
                    hal: &mut *hal,
                    ctx: &mut session.ctx,
                },
                |b| b.hal.isp_init(b.ctx),
            )?;
        session.flags.isp_initialized = true;
    }

    info!("{} stream: open codec device '{}'", kind, session.ctx.codec_device);
    let mut open = Ladder::new("codec open");
    if !primary {
        open = open.rung(reuse_primary_node(primary_node, false));
    }
    open.run(
        &mut Bind {
            hal: &mut *hal,
            ctx: &mut session.ctx,
        },
        |b| {
            let handle = b.hal.open_device(&b.ctx.codec_device)?;
            b.ctx.codec = Some(handle);
            Ok(())
        },
    )?;

    info!("{} stream: codec init", kind);
    let init = if primary {
        Ladder::new("codec init").rung(user_pointer_output())
    } else {
        Ladder::new("codec init")
            .rung(toggled_output_memory())
            .rung(height_aligned_to_16())
            .rung(reuse_primary_node(primary_node, true))
    };
    init.run(
        &mut Bind {
            hal: &mut *hal,
            ctx: &mut session.ctx,
        },
        |b| b.hal.codec_init(b.ctx),
    )?;
    session.flags.codec_initialized = true;

    if session.ctx.bitrate > 0 {
        let scale = session.ctx.scale.max(1);
        let mut rc = hal.rate_controller();
        session.ctx.qp = rc.seed(&RateSeed {
            width: session.ctx.width / scale,
            height: session.ctx.height / scale,
            bitrate: session.ctx.bitrate,
            fps: session.ctx.codec_fps,
            gop: session.ctx.gop,
            initial_qp: session.ctx.qp,
        });
        // Seeding loads vendor defaults; the motion features cause visible stutter.
        rc.disable_adaptive();
        session.rc = Some(rc);
    }

    if primary {
        info!("{} stream: isp start", kind);
        hal.isp_start(&session.ctx)?;
        session.flags.isp_started = true;

        if options.power_line_hz > 0 {
            match hal.set_power_line_frequency(options.power_line_hz) {
                Ok(()) => info!("ISP anti-flicker set to {}Hz", options.power_line_hz),
                Err(e) => warn!("Failed to set power line frequency: {}", e),
            }
        }
        if !options.isp_settle.is_zero() {
            thread::sleep(options.isp_settle);
        }
    }

    info!("{} stream: codec start", kind);
    Ladder::new("codec start")
        .rung(raise_buffer_count())
        .run(
            &mut Bind {
                hal: &mut *hal,
                ctx: &mut session.ctx,
            },
            |b| b.hal.codec_start(b.ctx),
        )?;
    session.flags.codec_started = true;

    if !primary {
        if let Some((w, h)) = hal.coded_size(&session.ctx) {
            info!("{} stream bound coded size {}x{}", kind, w, h);
        }
    }

    let mut reader = hal.session_reader(&session.ctx)?;
    if session.ctx.gop > 0 {
        if let Err(e) = reader.set_gop(session.ctx.gop) {
            warn!("{} stream: {}", kind, e);
        }
    }
    session.channel = Some(StreamChannel::open(
        kind,
        reader,
        session.rc.take(),
        session.ctx.qp,
        session.ctx.gop,
        options.read_timeout,
    ));

    session.flags.active = true;
    Ok(())
}

//! Mock infrastructure for testing
//!
//! A scripted encoder HAL with per-operation failure injection and open
//! handle accounting, its session readers, a scripted capture device and a
//! counting wake signal.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camrelay::capture::{DeviceSource, PixelFormat, Timestamp};
use camrelay::encoder::{
    DeviceHandle, EncodedFrame, EncoderHal, HalError, HalOp, HalResult, MemoryMode,
    SessionContext, SessionReader, SessionRole,
};
use camrelay::pipeline::WakeSignal;
use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};

pub const START: [u8; 4] = [0, 0, 0, 1];

pub fn sps() -> Vec<u8> {
    vec![0x67, 0x42, 0x00, 0x1f, 0xab]
}

pub fn pps() -> Vec<u8> {
    vec![0x68, 0xce, 0x3c, 0x80]
}

/// Annex-B access unit from NAL payloads
pub fn annexb(nals: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        out.extend_from_slice(&START);
        out.extend_from_slice(nal);
    }
    out
}

pub fn idr_with_headers() -> Vec<u8> {
    annexb(&[&sps(), &pps(), &[0x65, 0x88, 0x84, 0x00]])
}

pub fn bare_idr() -> Vec<u8> {
    annexb(&[&[0x65, 0x88, 0x80, 0x11]])
}

pub fn p_slice(tag: u8) -> Vec<u8> {
    annexb(&[&[0x41, 0x9a, tag]])
}

type Predicate = Box<dyn Fn(&SessionContext) -> bool + Send>;

struct Failure {
    op: HalOp,
    errno: Errno,
    remaining: Option<u32>,
    /// Matching calls to let through before failing
    skip: u32,
    path: Option<String>,
    when: Option<Predicate>,
}

impl Failure {
    fn new(op: HalOp, errno: Errno) -> Self {
        Self {
            op,
            errno,
            remaining: None,
            skip: 0,
            path: None,
            when: None,
        }
    }
}

/// Snapshot of a context as seen by an init/start call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub op: HalOp,
    pub role: SessionRole,
    pub codec_device: String,
    pub width: u32,
    pub height: u32,
    pub scale: u32,
    pub codec_fps: u32,
    pub gop: u32,
    pub buffer_count: u32,
    pub output_memory: MemoryMode,
}

impl CallRecord {
    fn of(op: HalOp, ctx: &SessionContext) -> Self {
        Self {
            op,
            role: ctx.role,
            codec_device: ctx.codec_device.clone(),
            width: ctx.width,
            height: ctx.height,
            scale: ctx.scale,
            codec_fps: ctx.codec_fps,
            gop: ctx.gop,
            buffer_count: ctx.buffer_count,
            output_memory: ctx.output_memory,
        }
    }
}

type ScriptedRead = HalResult<Option<(Vec<u8>, bool)>>;

/// Lets reads on different streams prove they overlapped.
///
/// Each read waits, up to `wait`, for `parties` reads to have arrived.
pub struct Rendezvous {
    arrived: Mutex<usize>,
    cond: Condvar,
    parties: usize,
    wait: Duration,
}

impl Rendezvous {
    fn arrive(&self) -> bool {
        let deadline = Instant::now() + self.wait;
        let mut arrived = self.arrived.lock();
        *arrived += 1;
        self.cond.notify_all();
        while *arrived < self.parties {
            if self.cond.wait_until(&mut arrived, deadline).timed_out() {
                break;
            }
        }
        *arrived >= self.parties
    }
}

/// Frame-path state shared by the HAL and the readers it hands out
#[derive(Default)]
struct ReaderLog {
    high_frames: VecDeque<ScriptedRead>,
    low_frames: VecDeque<ScriptedRead>,
    failures: Vec<(HalOp, Errno)>,
    force_keyframe_supported: bool,
    read_delay: Duration,
    rendezvous: Option<Arc<Rendezvous>>,
    met: Vec<(SessionRole, bool)>,
    live_readers: Vec<SessionRole>,
    reads: usize,
    released: usize,
    applied_qp: Vec<u32>,
    forced_keyframes: usize,
    gops: Vec<(SessionRole, u32)>,
}

impl ReaderLog {
    fn queue(&mut self, role: SessionRole) -> &mut VecDeque<ScriptedRead> {
        match role {
            SessionRole::Primary => &mut self.high_frames,
            SessionRole::Derived => &mut self.low_frames,
        }
    }

    fn check(&self, op: HalOp) -> HalResult<()> {
        match self.failures.iter().find(|(o, _)| *o == op) {
            Some((_, errno)) => Err(HalError::new(op, *errno)),
            None => Ok(()),
        }
    }
}

/// Operations that run on a session reader rather than the HAL
fn is_reader_op(op: HalOp) -> bool {
    matches!(
        op,
        HalOp::Read | HalOp::Release | HalOp::SetGop | HalOp::SetQp | HalOp::ForceKeyframe
    )
}

/// Encoder HAL driven by a script instead of hardware
#[derive(Default)]
pub struct ScriptedHal {
    next_fd: RawFd,
    open_fds: HashSet<RawFd>,
    failures: Vec<Failure>,
    live_stages: Vec<(SessionRole, &'static str)>,
    io: Arc<Mutex<ReaderLog>>,
    pub opened_paths: Vec<String>,
    pub calls: Vec<CallRecord>,
    pub power_line: Option<u32>,
}

impl ScriptedHal {
    pub fn new() -> Self {
        Self {
            next_fd: 100,
            ..Self::default()
        }
    }

    /// Fail every call of `op`
    pub fn fail_always(&mut self, op: HalOp, errno: Errno) {
        if is_reader_op(op) {
            self.io.lock().failures.push((op, errno));
            return;
        }
        self.failures.push(Failure::new(op, errno));
    }

    /// Fail the next `times` calls of `op`
    pub fn fail_times(&mut self, op: HalOp, errno: Errno, times: u32) {
        self.failures.push(Failure {
            remaining: Some(times),
            ..Failure::new(op, errno)
        });
    }

    /// Fail opens of one device node
    pub fn fail_open_path(&mut self, path: &str, errno: Errno) {
        self.fail_open_path_after(path, errno, 0);
    }

    /// Let the first `skip` opens of a node through, then fail every one
    pub fn fail_open_path_after(&mut self, path: &str, errno: Errno, skip: u32) {
        self.failures.push(Failure {
            skip,
            path: Some(path.to_owned()),
            ..Failure::new(HalOp::Open, errno)
        });
    }

    /// Fail `op` whenever `when` holds for the call's context
    pub fn fail_when(
        &mut self,
        op: HalOp,
        errno: Errno,
        when: impl Fn(&SessionContext) -> bool + Send + 'static,
    ) {
        self.failures.push(Failure {
            when: Some(Box::new(when)),
            ..Failure::new(op, errno)
        });
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
        self.io.lock().failures.clear();
    }

    pub fn support_force_keyframe(&self) {
        self.io.lock().force_keyframe_supported = true;
    }

    /// Every read sleeps this long (capped at its timeout) before dequeuing
    pub fn delay_reads(&self, delay: Duration) {
        self.io.lock().read_delay = delay;
    }

    /// Every read first waits for `parties` reads to be in flight at once
    pub fn rendezvous_reads(&self, parties: usize, wait: Duration) {
        self.io.lock().rendezvous = Some(Arc::new(Rendezvous {
            arrived: Mutex::new(0),
            cond: Condvar::new(),
            parties,
            wait,
        }));
    }

    /// Per read, whether the rendezvous was met
    pub fn rendezvous_results(&self) -> Vec<(SessionRole, bool)> {
        self.io.lock().met.clone()
    }

    pub fn push_frame(&self, role: SessionRole, data: Vec<u8>, keyframe: bool) {
        self.io.lock().queue(role).push_back(Ok(Some((data, keyframe))));
    }

    pub fn push_would_block(&self, role: SessionRole) {
        self.io.lock().queue(role).push_back(Ok(None));
    }

    pub fn push_read_error(&self, role: SessionRole, errno: Errno) {
        self.io
            .lock()
            .queue(role)
            .push_back(Err(HalError::new(HalOp::Read, errno)));
    }

    pub fn open_handles(&self) -> usize {
        self.open_fds.len()
    }

    /// Stages initialized or started and not yet undone
    pub fn live_stages(&self) -> usize {
        self.live_stages.len()
    }

    /// Session readers not yet dropped
    pub fn live_readers(&self) -> usize {
        self.io.lock().live_readers.len()
    }

    pub fn reads(&self) -> usize {
        self.io.lock().reads
    }

    pub fn released(&self) -> usize {
        self.io.lock().released
    }

    pub fn applied_qp(&self) -> Vec<u32> {
        self.io.lock().applied_qp.clone()
    }

    pub fn forced_keyframes(&self) -> usize {
        self.io.lock().forced_keyframes
    }

    /// GOP values accepted on one stream, oldest first
    pub fn gops(&self, role: SessionRole) -> Vec<u32> {
        self.io
            .lock()
            .gops
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, gop)| *gop)
            .collect()
    }

    pub fn calls_of(&self, op: HalOp) -> Vec<&CallRecord> {
        self.calls.iter().filter(|c| c.op == op).collect()
    }

    pub fn calls_for(&self, op: HalOp, role: SessionRole) -> Vec<&CallRecord> {
        self.calls
            .iter()
            .filter(|c| c.op == op && c.role == role)
            .collect()
    }

    fn check(&mut self, op: HalOp, ctx: Option<&SessionContext>, path: Option<&str>) -> HalResult<()> {
        for failure in self.failures.iter_mut() {
            if failure.op != op {
                continue;
            }
            if let Some(p) = &failure.path {
                if path != Some(p.as_str()) {
                    continue;
                }
            }
            if let (Some(when), Some(ctx)) = (&failure.when, ctx) {
                if !when(ctx) {
                    continue;
                }
            }
            if failure.skip > 0 {
                failure.skip -= 1;
                continue;
            }
            match failure.remaining.as_mut() {
                Some(0) => continue,
                Some(n) => *n -= 1,
                None => {}
            }
            return Err(HalError::new(op, failure.errno));
        }
        Ok(())
    }

    fn stage(&mut self, op: HalOp, ctx: &SessionContext, name: &'static str) -> HalResult<()> {
        self.calls.push(CallRecord::of(op, ctx));
        self.check(op, Some(ctx), None)?;
        self.live_stages.push((ctx.role, name));
        Ok(())
    }

    fn unstage(&mut self, op: HalOp, ctx: &SessionContext, name: &'static str) -> HalResult<()> {
        self.calls.push(CallRecord::of(op, ctx));
        let pos = self
            .live_stages
            .iter()
            .position(|s| *s == (ctx.role, name))
            .ok_or(HalError::new(op, Errno::EBADF))?;
        self.live_stages.remove(pos);
        Ok(())
    }
}

impl EncoderHal for ScriptedHal {
    type Reader = ScriptedReader;

    fn open_device(&mut self, path: &str) -> HalResult<DeviceHandle> {
        self.opened_paths.push(path.to_owned());
        self.check(HalOp::Open, None, Some(path))?;
        self.next_fd += 1;
        self.open_fds.insert(self.next_fd);
        Ok(DeviceHandle::new(self.next_fd))
    }

    fn close_device(&mut self, handle: DeviceHandle) {
        assert!(self.open_fds.remove(&handle.raw()), "double close");
    }

    fn isp_init(&mut self, ctx: &SessionContext) -> HalResult<()> {
        self.stage(HalOp::IspInit, ctx, "isp init")
    }

    fn isp_start(&mut self, ctx: &SessionContext) -> HalResult<()> {
        self.stage(HalOp::IspStart, ctx, "isp start")
    }

    fn isp_stop(&mut self, ctx: &SessionContext) -> HalResult<()> {
        self.unstage(HalOp::IspStop, ctx, "isp start")
    }

    fn isp_uninit(&mut self, ctx: &SessionContext) -> HalResult<()> {
        self.unstage(HalOp::IspUninit, ctx, "isp init")
    }

    fn codec_init(&mut self, ctx: &SessionContext) -> HalResult<()> {
        self.stage(HalOp::CodecInit, ctx, "codec init")
    }

    fn codec_start(&mut self, ctx: &SessionContext) -> HalResult<()> {
        self.stage(HalOp::CodecStart, ctx, "codec start")
    }

    fn codec_stop(&mut self, ctx: &SessionContext) -> HalResult<()> {
        assert!(
            !self.io.lock().live_readers.contains(&ctx.role),
            "codec stopped under a live reader"
        );
        self.unstage(HalOp::CodecStop, ctx, "codec start")
    }

    fn codec_uninit(&mut self, ctx: &SessionContext) -> HalResult<()> {
        self.unstage(HalOp::CodecUninit, ctx, "codec init")
    }

    fn session_reader(&mut self, ctx: &SessionContext) -> HalResult<ScriptedReader> {
        self.io.lock().live_readers.push(ctx.role);
        Ok(ScriptedReader {
            role: ctx.role,
            io: self.io.clone(),
            buffer: Vec::new(),
        })
    }

    fn set_power_line_frequency(&mut self, hz: u32) -> HalResult<()> {
        self.power_line = Some(hz);
        Ok(())
    }
}

/// Frame path of one scripted session
pub struct ScriptedReader {
    role: SessionRole,
    io: Arc<Mutex<ReaderLog>>,
    buffer: Vec<u8>,
}

impl SessionReader for ScriptedReader {
    fn read_frame(&mut self, timeout: Duration) -> HalResult<Option<EncodedFrame>> {
        // Waits happen without the log locked, like a device wait
        let (delay, rendezvous) = {
            let io = self.io.lock();
            io.check(HalOp::Read)?;
            (io.read_delay, io.rendezvous.clone())
        };
        if let Some(rendezvous) = rendezvous {
            let met = rendezvous.arrive();
            self.io.lock().met.push((self.role, met));
        }
        if !delay.is_zero() {
            thread::sleep(delay.min(timeout));
        }

        let mut io = self.io.lock();
        io.reads += 1;
        match io.queue(self.role).pop_front() {
            None | Some(Ok(None)) => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok(Some((data, keyframe)))) => {
                let bytes_used = data.len();
                self.buffer = data;
                Ok(Some(EncodedFrame {
                    index: 0,
                    bytes_used,
                    keyframe,
                    timestamp: Timestamp::now(),
                }))
            }
        }
    }

    fn frame_data(&self, index: usize) -> Option<&[u8]> {
        (index == 0).then_some(self.buffer.as_slice())
    }

    fn release_frame(&mut self) -> HalResult<()> {
        let mut io = self.io.lock();
        io.check(HalOp::Release)?;
        io.released += 1;
        Ok(())
    }

    fn set_gop(&mut self, gop: u32) -> HalResult<()> {
        let mut io = self.io.lock();
        io.check(HalOp::SetGop)?;
        io.gops.push((self.role, gop));
        Ok(())
    }

    fn set_qp(&mut self, qp: u32) -> HalResult<()> {
        let mut io = self.io.lock();
        io.check(HalOp::SetQp)?;
        io.applied_qp.push(qp);
        Ok(())
    }

    fn force_keyframe(&mut self) -> HalResult<()> {
        let mut io = self.io.lock();
        io.check(HalOp::ForceKeyframe)?;
        if !io.force_keyframe_supported {
            return Err(HalError::new(HalOp::ForceKeyframe, Errno::ENOTSUP));
        }
        io.forced_keyframes += 1;
        Ok(())
    }
}

impl Drop for ScriptedReader {
    fn drop(&mut self) {
        let mut io = self.io.lock();
        if let Some(pos) = io.live_readers.iter().position(|r| *r == self.role) {
            io.live_readers.remove(pos);
        }
    }
}

/// Scripted read result for [`ScriptedDevice`]
pub enum Read {
    Data(Vec<u8>),
    NoData,
    Error(io::ErrorKind),
}

/// Capture device that replays a script, then reports no data forever
pub struct ScriptedDevice {
    script: VecDeque<Read>,
    format: PixelFormat,
    pub reads: Arc<AtomicUsize>,
    pub released: Arc<AtomicBool>,
}

impl ScriptedDevice {
    pub fn new(script: Vec<Read>) -> Self {
        Self {
            script: script.into(),
            format: PixelFormat::H264,
            reads: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn frames(frames: Vec<Vec<u8>>) -> Self {
        Self::new(frames.into_iter().map(Read::Data).collect())
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }
}

impl DeviceSource for ScriptedDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.script.pop_front() {
            None | Some(Read::NoData) => Ok(0),
            Some(Read::Error(kind)) => Err(io::Error::from(kind)),
            Some(Read::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
        }
    }

    fn buffer_size(&self) -> usize {
        4096
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn dimensions(&self) -> (u32, u32) {
        (640, 480)
    }
}

impl Drop for ScriptedDevice {
    fn drop(&mut self) {
        self.released.store(true, Ordering::Release);
    }
}

/// Wake signal that counts how often it fired
#[derive(Default)]
pub struct CountingWake {
    count: AtomicUsize,
}

impl CountingWake {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl WakeSignal for CountingWake {
    fn wake(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

//! camrelay: hardware video capture, encoder orchestration and frame
//! delivery for a real-time streaming server

pub mod bitstream;
pub mod capture;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::encoder::{DeviceConfig, MemoryMode, StreamLayout, StreamParams, DEFAULT_BUFFER_COUNT};
use crate::error::{Error, Result};
use crate::utils::FoundDevice;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub encoder: EncoderConfig,
}

/// Plain V4L2 capture node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Empty path means auto-detect
    pub device: FoundDevice,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Prepend cached SPS/PPS to IDR frames that lack them
    pub repeat_parameter_sets: bool,
    pub read_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Frame queue capacity
    pub queue_size: usize,
    /// Bound on one device readiness wait
    pub wait_timeout_ms: u64,
    /// Sleep between reads on devices without a pollable descriptor
    pub poll_interval_ms: u64,
    /// Consecutive read errors before the capture thread gives up
    pub max_read_errors: u32,
    /// Tee every raw read into this file
    pub output_path: Option<PathBuf>,
    /// Pin capture threads to this core
    pub pin_core: Option<usize>,
    /// Scheduler output buffer size
    pub max_output_size: usize,
}

/// Hardware encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub enabled: bool,
    pub single_stream: bool,
    pub high: StreamParams,
    pub low: StreamParams,
    pub devices: DeviceConfig,
    pub buffer_count: u32,
    pub output_memory: MemoryMode,
    /// 50 or 60 to enable anti-flicker, 0 to leave the sensor default
    pub power_line_hz: u32,
    pub isp_settle_ms: u64,
    pub derived_settle_ms: u64,
    /// Bound on one encoded-frame wait
    pub read_timeout_ms: u64,
}

impl EncoderConfig {
    /// Validated stream layout for the orchestrator
    pub fn layout(&self) -> Result<StreamLayout> {
        StreamLayout::resolve(self.high, self.low, self.single_stream)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                device: FoundDevice::new(String::new(), PixelFormat::H264),
                width: 1920,
                height: 1080,
                fps: 10,
                format: PixelFormat::H264,
                buffer_count: 4,
                repeat_parameter_sets: true,
                read_buffer_size: 2 * 1024 * 1024,
            },
            pipeline: PipelineConfig {
                queue_size: 5,
                wait_timeout_ms: 1000,
                poll_interval_ms: 10,
                max_read_errors: 10,
                output_path: None,
                pin_core: None,
                max_output_size: 2 * 1024 * 1024,
            },
            encoder: EncoderConfig {
                enabled: false,
                single_stream: false,
                high: StreamParams::new(1920, 1080, 10, 1_048_576).with_gop(20),
                low: StreamParams::new(0, 0, 5, 524_288).with_scale(2),
                devices: DeviceConfig::default(),
                buffer_count: DEFAULT_BUFFER_COUNT,
                output_memory: MemoryMode::UserPtr,
                power_line_hz: 0,
                isp_settle_ms: 50,
                derived_settle_ms: 300,
                read_timeout_ms: 1000,
            },
        }
    }
}

impl Config {
    /// Defaults, overlaid with `path` (TOML) if given, overlaid with
    /// `CAMRELAY_*` environment variables (`__` separates sections).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CAMRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Publish as the process-wide configuration
    pub fn install(self) -> Arc<Config> {
        let config = Arc::new(self);
        CONFIG.store(config.clone());
        config
    }

    /// Configuration last installed, defaults before that
    pub fn current() -> Arc<Config> {
        CONFIG.load_full()
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.queue_size == 0 {
            return Err(Error::config("pipeline.queue_size must be at least 1"));
        }
        if self.pipeline.wait_timeout_ms == 0 {
            return Err(Error::config("pipeline.wait_timeout_ms must be non-zero"));
        }
        if self.pipeline.max_output_size == 0 {
            return Err(Error::config("pipeline.max_output_size must be non-zero"));
        }
        if self.encoder.enabled {
            if self.encoder.read_timeout_ms == 0 {
                return Err(Error::config("encoder.read_timeout_ms must be non-zero"));
            }
            self.encoder.layout()?;
        }
        Ok(())
    }
}

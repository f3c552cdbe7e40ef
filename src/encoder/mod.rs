//! Hardware encoder session orchestration

pub mod hal;
pub mod ladder;
pub mod orchestrator;
pub mod params;
pub mod rate_control;
pub mod session;
pub mod source;
pub mod stream;

pub use hal::{
    DeviceHandle, EncodedFrame, EncoderHal, HalError, HalOp, HalResult, MemoryMode,
    SessionContext, SessionReader, SessionRole, DEFAULT_BUFFER_COUNT,
};
pub use ladder::{Ladder, Rung};
pub use orchestrator::{EncoderOrchestrator, OrchestratorOptions};
pub use params::{
    align16, frame_budget, suggested_qp, DeviceConfig, StreamKind, StreamLayout, StreamParams,
    DEFAULT_FRAME_BUDGET, MAX_DIMENSION, MAX_FPS,
};
pub use rate_control::{AdaptiveFeatures, CbrController, RateController, RateSeed};
pub use session::{EncoderSession, SessionFlags};
pub use source::{EncoderKeyframeTrigger, EncoderStreamSource};
pub use stream::{EncodedAccessUnit, StreamChannel, StreamHandle};

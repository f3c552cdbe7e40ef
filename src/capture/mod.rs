pub mod device;
pub mod frame;
pub mod v4l2;

pub use device::{copy_into, DeviceSource, FrameSplitter, KeyframeTrigger, WholeFrame};
pub use frame::{Frame, FrameMetadata, PixelFormat, Timestamp};
pub use v4l2::V4l2Source;

pub mod annexb;
pub mod param_sets;

pub use annexb::{is_keyframe, nal_units, NalType, NalUnit};
pub use param_sets::ParameterSetCache;

//! Parameter-set cache and keyframe repair
//!
//! Some capture paths emit IDR access units without repeating SPS/PPS. Decoders
//! that only read the parameter sets once then fail to join mid-stream. The
//! cache remembers the latest SPS and PPS seen on a stream and prepends them
//! to keyframes that do not lead with their own.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use super::annexb::{nal_units, NalType, START_CODE};

/// Latest SPS/PPS observed on one logical stream
#[derive(Debug, Default, Clone)]
pub struct ParameterSetCache {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl ParameterSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached SPS, NAL header included, start code excluded
    pub fn sps(&self) -> Option<&Bytes> {
        self.sps.as_ref()
    }

    /// Cached PPS, NAL header included, start code excluded
    pub fn pps(&self) -> Option<&Bytes> {
        self.pps.as_ref()
    }

    /// Cache any SPS/PPS units carried by `au`, replacing earlier ones
    pub fn observe(&mut self, au: &[u8]) {
        for nal in nal_units(au) {
            match nal.nal_type() {
                NalType::SPS => self.sps = Some(Bytes::copy_from_slice(nal.data)),
                NalType::PPS => self.pps = Some(Bytes::copy_from_slice(nal.data)),
                _ => {}
            }
        }
    }

    /// Whether a keyframe lacks leading parameter sets.
    ///
    /// Units without any start code are never repaired. An access unit that
    /// leads with an SPS counts as carrying its own headers even when the
    /// second unit is not a PPS.
    pub fn needs_repair(au: &[u8]) -> bool {
        match nal_units(au).next() {
            None => false,
            Some(first) => first.nal_type() != NalType::SPS,
        }
    }

    /// Prepend the cached SPS and PPS to a keyframe that needs it.
    ///
    /// Returns the input untouched when the frame is not a keyframe, already
    /// leads with an SPS, has no start code, or either set is not cached yet.
    pub fn repair(&self, au: Bytes, keyframe: bool) -> Bytes {
        if !keyframe || !Self::needs_repair(&au) {
            return au;
        }
        let (Some(sps), Some(pps)) = (&self.sps, &self.pps) else {
            return au;
        };

        let mut fused =
            BytesMut::with_capacity(2 * START_CODE.len() + sps.len() + pps.len() + au.len());
        fused.put_slice(&START_CODE);
        fused.put_slice(sps);
        fused.put_slice(&START_CODE);
        fused.put_slice(pps);
        fused.put_slice(&au);

        debug!(
            "injected cached SPS({})/PPS({}) before IDR (total {})",
            sps.len(),
            pps.len(),
            fused.len()
        );
        fused.freeze()
    }
}

//! Annex-B byte-stream scanning
//!
//! Splits an access unit into NAL units on 3-byte (`00 00 01`) or 4-byte
//! (`00 00 00 01`) start codes. Yielded units exclude the start code but keep
//! the NAL header byte.

/// 4-byte start code used when synthesizing units
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// H.264 NAL unit type (low five bits of the header byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NalType(pub u8);

impl NalType {
    pub const SLICE: NalType = NalType(1);
    pub const IDR: NalType = NalType(5);
    pub const SEI: NalType = NalType(6);
    pub const SPS: NalType = NalType(7);
    pub const PPS: NalType = NalType(8);
    pub const AUD: NalType = NalType(9);

    /// Classify a unit from its header byte
    pub fn from_header(header: u8) -> Self {
        NalType(header & 0x1F)
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            1 => "slice",
            5 => "IDR",
            6 => "SEI",
            7 => "SPS",
            8 => "PPS",
            9 => "AUD",
            12 => "filler",
            _ => "other",
        }
    }
}

/// A start code located in a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartCode {
    /// Offset of the first start-code byte
    pub pos: usize,
    /// 3 or 4
    pub len: usize,
}

impl StartCode {
    /// Offset of the first byte after the start code
    pub fn end(&self) -> usize {
        self.pos + self.len
    }
}

/// Find the next start code at or after `from`
pub fn find_start_code(data: &[u8], from: usize) -> Option<StartCode> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            // A zero right before a 3-byte code makes it a 4-byte code.
            if i > from && data[i - 1] == 0 {
                return Some(StartCode { pos: i - 1, len: 4 });
            }
            return Some(StartCode { pos: i, len: 3 });
        }
        i += 1;
    }
    None
}

/// One NAL unit borrowed from an access unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit<'a> {
    /// Unit bytes, header included, start code excluded
    pub data: &'a [u8],
    /// Offset of `data` within the access unit
    pub offset: usize,
}

impl<'a> NalUnit<'a> {
    pub fn nal_type(&self) -> NalType {
        NalType::from_header(self.data[0])
    }
}

/// Iterator over the NAL units of an access unit
pub struct NalUnits<'a> {
    data: &'a [u8],
    next: Option<StartCode>,
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = NalUnit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let current = self.next?;
            let start = current.end();
            self.next = find_start_code(self.data, start);
            let end = self.next.map(|sc| sc.pos).unwrap_or(self.data.len());
            if end > start {
                return Some(NalUnit {
                    data: &self.data[start..end],
                    offset: start,
                });
            }
            // Empty unit (back-to-back start codes or trailing marker)
            if self.next.is_none() {
                return None;
            }
        }
    }
}

/// Iterate the NAL units of an Annex-B access unit
pub fn nal_units(data: &[u8]) -> NalUnits<'_> {
    NalUnits {
        data,
        next: find_start_code(data, 0),
    }
}

/// True if the access unit carries an IDR slice
pub fn is_keyframe(data: &[u8]) -> bool {
    nal_units(data).any(|nal| nal.nal_type() == NalType::IDR)
}

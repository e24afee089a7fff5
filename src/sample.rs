//! Access-unit samples and their properties.
use serde::Serialize;

/// Random-access flags of a sample (bit field).
pub const RA_FLAG_NONE: u8 = 0x00;
/// The sample is a sync sample.
pub const RA_FLAG_SYNC: u8 = 0x01;
/// The sample is an open or otherwise non-sync random access point.
pub const RA_FLAG_RAP: u8 = 0x02;
/// The sample is a closed random access point.
pub const RA_FLAG_CLOSED_RAP: u8 = 0x04;
/// The sample allows random access with partial presentation.
pub const RA_FLAG_PARTIAL_SYNC: u8 = 0x08;
/// Random access is complete after the post-roll period.
pub const RA_FLAG_POST_ROLL_START: u8 = 0x10;

/// Leading classification of a sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Leading {
    NotLeading,
    DecodableLeading,
    UndecodableLeading,
}

impl Default for Leading {
    fn default() -> Leading {
        Leading::NotLeading
    }
}

/// Post-roll recovery of a random access point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PostRoll {
    /// Identifier of this sample (frame_num / POC of the starting point).
    pub identifier: u32,
    /// Identifier of the sample at which recovery completes.
    pub complete:   u32,
}

/// Pre-roll requirement of a sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PreRoll {
    /// Number of samples that must be decoded before this one is correct.
    pub distance: u16,
}

/// Per-sample property flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SampleProperty {
    pub ra_flags:      u8,
    pub independent:   bool,
    pub disposable:    bool,
    pub redundant:     bool,
    pub leading:       Leading,
    /// An earlier presentation timestamp is allowed (reordered streams).
    pub allow_earlier: bool,
    pub pre_roll:      PreRoll,
    pub post_roll:     PostRoll,
}

/// One access unit delivered by an importer.
///
/// The caller allocates `data` with at least `max_au_length` bytes from the
/// active summary; the importer fills `[0, length)` and the timing fields.
pub struct Sample {
    pub data:   Vec<u8>,
    pub length: usize,
    pub dts:    u64,
    pub cts:    u64,
    pub prop:   SampleProperty,
}

impl Sample {
    /// A sample whose buffer can hold `size` bytes.
    pub fn with_capacity(size: usize) -> Sample {
        Sample {
            data:   vec![0u8; size],
            length: 0,
            dts:    0,
            cts:    0,
            prop:   SampleProperty::default(),
        }
    }

    /// The valid payload of this sample.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length]
    }
}

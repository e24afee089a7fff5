//! Track summaries built by the importers.
//!
//! A summary describes the active sample description of a track: codec,
//! timing base, dimensions or channel layout, and the serialized codec
//! configuration payloads (`dac3`, `esds`, `avcC`, ...) a container writer
//! embeds verbatim.
use std::fmt::{self, Debug, Display};

use serde::Serialize;

/// Four-character code of a sample description.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(b: &[u8; 4]) -> FourCc {
        FourCc(*b)
    }
}

impl Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &b in &self.0 {
            let c = if (0x20..0x7f).contains(&b) { b as char } else { '.' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

impl Serialize for FourCc {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What a codec-specific blob is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CodecSpecificKind {
    /// MPEG-4 Systems decoder configuration (`esds`).
    Mp4sysDecoderConfig,
    /// AC-3 specific box (`dac3`).
    Ac3,
    /// Enhanced AC-3 specific box (`dec3`).
    Eac3,
    /// DTS specific box (`ddts`).
    Dts,
    /// AMR specific box (`damr`).
    Amr,
    /// AVC decoder configuration (`avcC`).
    H264,
    /// HEVC decoder configuration (`hvcC`).
    Hevc,
    /// VC-1 specific box (`dvc1`).
    Vc1,
}

/// A serialized codec configuration payload, box header included.
#[derive(Clone, Debug, Serialize)]
pub struct CodecSpecific {
    pub kind: CodecSpecificKind,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl CodecSpecific {
    pub fn new(kind: CodecSpecificKind, data: Vec<u8>) -> CodecSpecific {
        CodecSpecific { kind, data }
    }
}

/// Audio track details.
#[derive(Clone, Debug, Serialize)]
pub struct AudioSummary {
    pub sample_type:      FourCc,
    pub frequency:        u32,
    pub channels:         u32,
    pub sample_size:      u32,
    pub samples_in_frame: u32,
    pub max_au_length:    usize,
    /// MPEG-4 audio object type, when meaningful.
    pub aot:              u8,
    #[serde(skip)]
    pub codec_specific:   Vec<CodecSpecific>,
}

/// Color description signalled by a video stream.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ColorInfo {
    pub primaries_index: u16,
    pub transfer_index:  u16,
    pub matrix_index:    u16,
    pub full_range:      bool,
}

/// Video track details.
#[derive(Clone, Debug, Serialize)]
pub struct VideoSummary {
    pub sample_type:      FourCc,
    pub timescale:        u32,
    pub timebase:         u32,
    /// Variable frame rate.
    pub vfr:              bool,
    pub width:            u32,
    pub height:           u32,
    pub par_h:            u16,
    pub par_v:            u16,
    pub color:            ColorInfo,
    pub max_au_length:    usize,
    /// Picture timing is denominated in fields, not frames.
    pub sample_per_field: bool,
    #[serde(skip)]
    pub codec_specific:   Vec<CodecSpecific>,
}

/// The active sample description of one track.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum Summary {
    Audio(AudioSummary),
    Video(VideoSummary),
}

impl Summary {
    pub fn audio(&self) -> Option<&AudioSummary> {
        match self {
            Summary::Audio(a) => Some(a),
            _ => None,
        }
    }

    pub fn video(&self) -> Option<&VideoSummary> {
        match self {
            Summary::Video(v) => Some(v),
            _ => None,
        }
    }

    pub fn max_au_length(&self) -> usize {
        match self {
            Summary::Audio(a) => a.max_au_length,
            Summary::Video(v) => v.max_au_length,
        }
    }

    pub fn codec_specific(&self) -> &[CodecSpecific] {
        match self {
            Summary::Audio(a) => &a.codec_specific,
            Summary::Video(v) => &v.codec_specific,
        }
    }

    pub fn codec_specific_mut(&mut self) -> &mut Vec<CodecSpecific> {
        match self {
            Summary::Audio(a) => &mut a.codec_specific,
            Summary::Video(v) => &mut v.codec_specific,
        }
    }

    /// The first blob of the given kind, if present.
    pub fn find_codec_specific(&self, kind: crate::summary::CodecSpecificKind) -> Option<&CodecSpecific> {
        self.codec_specific().iter().find(|cs| cs.kind == kind)
    }
}

impl Default for AudioSummary {
    fn default() -> AudioSummary {
        AudioSummary {
            sample_type:      FourCc::new(b"mp4a"),
            frequency:        0,
            channels:         0,
            sample_size:      0,
            samples_in_frame: 0,
            max_au_length:    0,
            aot:              0,
            codec_specific:   Vec::new(),
        }
    }
}

impl Default for VideoSummary {
    fn default() -> VideoSummary {
        VideoSummary {
            sample_type:      FourCc::new(b"avc1"),
            timescale:        0,
            timebase:         0,
            vfr:              false,
            width:            0,
            height:           0,
            par_h:            0,
            par_v:            0,
            color:            ColorInfo::default(),
            max_au_length:    0,
            sample_per_field: false,
            codec_specific:   Vec::new(),
        }
    }
}

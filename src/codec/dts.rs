//! DTS Coherent Acoustics (ETSI TS 102 114).
//!
//! A DTS stream interleaves a core substream with up to eight extension
//! substreams; inside those, coding components (XCH, XXCH, X96, XBR, XLL,
//! LBR) are located by their own syncwords. One access unit collects every
//! substream frame up to the next core frame, or up to an extension frame
//! whose substream index wraps back.
use std::io;

use crate::bits::Bits;
use crate::bs::Bs;
use crate::importer::{CodecImporter, ImportStatus};
use crate::sample::{Sample, RA_FLAG_SYNC};
use crate::sbuf::Sb;
use crate::summary::{AudioSummary, CodecSpecific, CodecSpecificKind, FourCc, Summary};

pub const DTS_MIN_CORE_SIZE: usize = 96;
pub const DTS_MAX_CORE_SIZE: usize = 16384;
pub const DTS_MAX_EXSS_SIZE: usize = 32768;
pub const DTS_MAX_NUM_EXSS: usize = 4;
const DTS_MAX_STREAM_CONSTRUCTION: usize = 21;

const SYNCWORD_CORE: u32 = 0x7ffe_8001;
const SYNCWORD_XCH: u32 = 0x5a5a_5a5a;
const SYNCWORD_XXCH: u32 = 0x4700_4a03;
const SYNCWORD_X96K: u32 = 0x1d95_f262;
const SYNCWORD_XBR: u32 = 0x655e_315e;
const SYNCWORD_LBR: u32 = 0x0a80_1921;
const SYNCWORD_XLL: u32 = 0x41a2_9547;
const SYNCWORD_SUBSTREAM: u32 = 0x6458_2025;

/// Which coding components were observed, as a bit set.
pub const DTS_CORE_SUBSTREAM_CORE_FLAG: u32 = 0x0000_0001;
pub const DTS_CORE_SUBSTREAM_XCH_FLAG: u32 = 0x0000_0002;
pub const DTS_CORE_SUBSTREAM_X96_FLAG: u32 = 0x0000_0004;
pub const DTS_CORE_SUBSTREAM_XXCH_FLAG: u32 = 0x0000_0008;
pub const DTS_EXT_SUBSTREAM_CORE_FLAG: u32 = 0x0000_0010;
pub const DTS_EXT_SUBSTREAM_XBR_FLAG: u32 = 0x0000_0020;
pub const DTS_EXT_SUBSTREAM_XXCH_FLAG: u32 = 0x0000_0040;
pub const DTS_EXT_SUBSTREAM_X96_FLAG: u32 = 0x0000_0080;
pub const DTS_EXT_SUBSTREAM_LBR_FLAG: u32 = 0x0000_0100;
pub const DTS_EXT_SUBSTREAM_XLL_FLAG: u32 = 0x0000_0200;

// Loudspeaker activity mask bits (XXCH form).
const XXCH_MASK_C: u32 = 0x0000_0001;
const XXCH_MASK_L: u32 = 0x0000_0002;
const XXCH_MASK_R: u32 = 0x0000_0004;
const XXCH_MASK_LS: u32 = 0x0000_0008;
const XXCH_MASK_RS: u32 = 0x0000_0010;
const XXCH_MASK_LFE1: u32 = 0x0000_0020;
const XXCH_MASK_CS: u32 = 0x0000_0040;
const XXCH_MASK_LSR: u32 = 0x0000_0080;
const XXCH_MASK_RSR: u32 = 0x0000_0100;
const XXCH_MASK_LSS: u32 = 0x0000_0200;
const XXCH_MASK_RSS: u32 = 0x0000_0400;
const XXCH_MASK_LC: u32 = 0x0000_0800;
const XXCH_MASK_RC: u32 = 0x0000_1000;
const XXCH_MASK_LH: u32 = 0x0000_2000;
const XXCH_MASK_CH: u32 = 0x0000_4000;
const XXCH_MASK_RH: u32 = 0x0000_8000;
const XXCH_MASK_LFE2: u32 = 0x0001_0000;
const XXCH_MASK_LW: u32 = 0x0002_0000;
const XXCH_MASK_RW: u32 = 0x0004_0000;
const XXCH_MASK_OH: u32 = 0x0008_0000;
const XXCH_MASK_LHS: u32 = 0x0010_0000;
const XXCH_MASK_RHS: u32 = 0x0020_0000;
const XXCH_MASK_CHR: u32 = 0x0040_0000;
const XXCH_MASK_LHR: u32 = 0x0080_0000;
const XXCH_MASK_RHR: u32 = 0x0100_0000;

/// ChannelLayout bits of the ddts box.
pub const DTS_CHANNEL_LAYOUT_C: u16 = 0x0001;
pub const DTS_CHANNEL_LAYOUT_L_R: u16 = 0x0002;
pub const DTS_CHANNEL_LAYOUT_LS_RS: u16 = 0x0004;
pub const DTS_CHANNEL_LAYOUT_LFE1: u16 = 0x0008;
pub const DTS_CHANNEL_LAYOUT_CS: u16 = 0x0010;
pub const DTS_CHANNEL_LAYOUT_LH_RH: u16 = 0x0020;
pub const DTS_CHANNEL_LAYOUT_LSR_RSR: u16 = 0x0040;
pub const DTS_CHANNEL_LAYOUT_CH: u16 = 0x0080;
pub const DTS_CHANNEL_LAYOUT_OH: u16 = 0x0100;
pub const DTS_CHANNEL_LAYOUT_LC_RC: u16 = 0x0200;
pub const DTS_CHANNEL_LAYOUT_LW_RW: u16 = 0x0400;
pub const DTS_CHANNEL_LAYOUT_LSS_RSS: u16 = 0x0800;
pub const DTS_CHANNEL_LAYOUT_LFE2: u16 = 0x1000;
pub const DTS_CHANNEL_LAYOUT_LHS_RHS: u16 = 0x2000;
pub const DTS_CHANNEL_LAYOUT_CHR: u16 = 0x4000;
pub const DTS_CHANNEL_LAYOUT_LHR_RHR: u16 = 0x8000;

/// Parameters of the `ddts` box.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DtsParams {
    pub dts_sampling_frequency: u32,
    pub max_bitrate:            u32,
    pub avg_bitrate:            u32,
    pub pcm_sample_depth:       u8,
    pub frame_duration:         u8,
    pub stream_construction:    u8,
    pub core_lfe_present:       u8,
    pub core_layout:            u8,
    pub core_size:              u16,
    pub stereo_downmix:         u8,
    pub representation_type:    u8,
    pub channel_layout:         u16,
    pub multi_asset_flag:       u8,
    pub lbr_duration_mod:       u8,
}

/// Derive the StreamConstruction code from the observed component set.
pub fn stream_construction(flags: u32) -> u8 {
    const CONSTRUCTION_INFO: [u32; DTS_MAX_STREAM_CONSTRUCTION + 1] = [
        0,
        DTS_CORE_SUBSTREAM_CORE_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_CORE_SUBSTREAM_XCH_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_CORE_SUBSTREAM_XXCH_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_CORE_SUBSTREAM_X96_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_EXT_SUBSTREAM_XXCH_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_EXT_SUBSTREAM_XBR_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_CORE_SUBSTREAM_XCH_FLAG | DTS_EXT_SUBSTREAM_XBR_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_CORE_SUBSTREAM_XXCH_FLAG | DTS_EXT_SUBSTREAM_XBR_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_EXT_SUBSTREAM_XXCH_FLAG | DTS_EXT_SUBSTREAM_XBR_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_EXT_SUBSTREAM_X96_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_CORE_SUBSTREAM_XCH_FLAG | DTS_EXT_SUBSTREAM_X96_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_CORE_SUBSTREAM_XXCH_FLAG | DTS_EXT_SUBSTREAM_X96_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_EXT_SUBSTREAM_XXCH_FLAG | DTS_EXT_SUBSTREAM_X96_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_EXT_SUBSTREAM_XLL_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_CORE_SUBSTREAM_XCH_FLAG | DTS_EXT_SUBSTREAM_XLL_FLAG,
        DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_CORE_SUBSTREAM_X96_FLAG | DTS_EXT_SUBSTREAM_XLL_FLAG,
        DTS_EXT_SUBSTREAM_XLL_FLAG,
        DTS_EXT_SUBSTREAM_LBR_FLAG,
        DTS_EXT_SUBSTREAM_CORE_FLAG,
        DTS_EXT_SUBSTREAM_CORE_FLAG | DTS_EXT_SUBSTREAM_XXCH_FLAG,
        DTS_EXT_SUBSTREAM_CORE_FLAG | DTS_EXT_SUBSTREAM_XLL_FLAG,
    ];
    // Any unlisted combination maps to 0 and uses the 'dtsh' codingname.
    for (construction, &flags_of) in CONSTRUCTION_INFO.iter().enumerate().skip(1) {
        if flags == flags_of {
            return construction as u8;
        }
    }
    0
}

/// The ISO codingname of a parameter set.
pub fn codingname(param: &DtsParams) -> FourCc {
    if param.multi_asset_flag != 0 {
        // Multiple asset streams always use 'dtsh'.
        return FourCc::new(b"dtsh");
    }
    const CODINGNAME_TABLE: [&[u8; 4]; DTS_MAX_STREAM_CONSTRUCTION + 1] = [
        b"dtsh", b"dtsc", b"dtsc", b"dtsh", b"dtsc", b"dtsh", b"dtsh", b"dtsh", b"dtsh", b"dtsh",
        b"dtsh", b"dtsh", b"dtsh", b"dtsh", b"dtsl", b"dtsl", b"dtsl", b"dtsl", b"dtse", b"dtsh",
        b"dtsh", b"dtsl",
    ];
    FourCc::new(CODINGNAME_TABLE[param.stream_construction as usize])
}

/// Serialize a `ddts` box.
pub fn create_dts_specific_info(param: &DtsParams) -> Vec<u8> {
    let mut bits = Bits::new(Bs::new());
    bits.put(32, 28); // box size
    bits.put(32, u32::from_be_bytes(*b"ddts") as u64);
    bits.put(32, param.dts_sampling_frequency as u64);
    bits.put(32, param.max_bitrate as u64);
    bits.put(32, param.avg_bitrate as u64);
    bits.put(8, param.pcm_sample_depth as u64);
    bits.put(2, param.frame_duration as u64);
    bits.put(5, param.stream_construction as u64);
    bits.put(1, param.core_lfe_present as u64);
    bits.put(6, param.core_layout as u64);
    bits.put(14, param.core_size as u64);
    bits.put(1, param.stereo_downmix as u64);
    bits.put(3, param.representation_type as u64);
    bits.put(16, param.channel_layout as u64);
    bits.put(1, param.multi_asset_flag as u64);
    bits.put(1, param.lbr_duration_mod as u64);
    bits.put(6, 0); // reserved
    bits.export_data().unwrap_or_default()
}

/// Recover `DtsParams` from a serialized `ddts` box.
pub fn parse_dts_specific_info(data: &[u8]) -> io::Result<DtsParams> {
    if data.len() < 28 || &data[4..8] != b"ddts" {
        return Err(ioerr!(InvalidData, "not a ddts box"));
    }
    let mut bits = Bits::new(Bs::new());
    bits.import_data(&data[8..28])?;
    let mut param = DtsParams::default();
    param.dts_sampling_frequency = bits.get(32) as u32;
    param.max_bitrate = bits.get(32) as u32;
    param.avg_bitrate = bits.get(32) as u32;
    param.pcm_sample_depth = bits.get(8) as u8;
    param.frame_duration = bits.get(2) as u8;
    param.stream_construction = bits.get(5) as u8;
    param.core_lfe_present = bits.get(1) as u8;
    param.core_layout = bits.get(6) as u8;
    param.core_size = bits.get(14) as u16;
    param.stereo_downmix = bits.get(1) as u8;
    param.representation_type = bits.get(3) as u8;
    param.channel_layout = bits.get(16) as u16;
    param.multi_asset_flag = bits.get(1) as u8;
    param.lbr_duration_mod = bits.get(1) as u8;
    bits.bs.status()?;
    Ok(param)
}

/// Channel count a layout stands for; paired positions count twice.
pub fn channel_count_from_layout(channel_layout: u16) -> u32 {
    const PAIR_MASK: u16 = DTS_CHANNEL_LAYOUT_L_R
        | DTS_CHANNEL_LAYOUT_LS_RS
        | DTS_CHANNEL_LAYOUT_LH_RH
        | DTS_CHANNEL_LAYOUT_LSR_RSR
        | DTS_CHANNEL_LAYOUT_LC_RC
        | DTS_CHANNEL_LAYOUT_LW_RW
        | DTS_CHANNEL_LAYOUT_LSS_RSS
        | DTS_CHANNEL_LAYOUT_LHS_RHS
        | DTS_CHANNEL_LAYOUT_LHR_RHR;
    channel_layout.count_ones() + (channel_layout & PAIR_MASK).count_ones()
}

fn channel_layout_from_xxch_mask(mask: u32) -> u16 {
    let mut layout = 0;
    if mask & XXCH_MASK_C != 0 {
        layout |= DTS_CHANNEL_LAYOUT_C;
    }
    if mask & (XXCH_MASK_L | XXCH_MASK_R) != 0 {
        layout |= DTS_CHANNEL_LAYOUT_L_R;
    }
    if mask & (XXCH_MASK_LS | XXCH_MASK_RS) != 0 {
        layout |= DTS_CHANNEL_LAYOUT_LS_RS;
    }
    if mask & XXCH_MASK_LFE1 != 0 {
        layout |= DTS_CHANNEL_LAYOUT_LFE1;
    }
    if mask & XXCH_MASK_CS != 0 {
        layout |= DTS_CHANNEL_LAYOUT_CS;
    }
    if mask & (XXCH_MASK_LH | XXCH_MASK_RH) != 0 {
        layout |= DTS_CHANNEL_LAYOUT_LH_RH;
    }
    if mask & (XXCH_MASK_LSR | XXCH_MASK_RSR) != 0 {
        layout |= DTS_CHANNEL_LAYOUT_LSR_RSR;
    }
    if mask & XXCH_MASK_CH != 0 {
        layout |= DTS_CHANNEL_LAYOUT_CH;
    }
    if mask & XXCH_MASK_OH != 0 {
        layout |= DTS_CHANNEL_LAYOUT_OH;
    }
    if mask & (XXCH_MASK_LC | XXCH_MASK_RC) != 0 {
        layout |= DTS_CHANNEL_LAYOUT_LC_RC;
    }
    if mask & (XXCH_MASK_LW | XXCH_MASK_RW) != 0 {
        layout |= DTS_CHANNEL_LAYOUT_LW_RW;
    }
    if mask & (XXCH_MASK_LSS | XXCH_MASK_RSS) != 0 {
        layout |= DTS_CHANNEL_LAYOUT_LSS_RSS;
    }
    if mask & XXCH_MASK_LFE2 != 0 {
        layout |= DTS_CHANNEL_LAYOUT_LFE2;
    }
    if mask & (XXCH_MASK_LHS | XXCH_MASK_RHS) != 0 {
        layout |= DTS_CHANNEL_LAYOUT_LHS_RHS;
    }
    if mask & XXCH_MASK_CHR != 0 {
        layout |= DTS_CHANNEL_LAYOUT_CHR;
    }
    if mask & (XXCH_MASK_LHR | XXCH_MASK_RHR) != 0 {
        layout |= DTS_CHANNEL_LAYOUT_LHR_RHR;
    }
    layout
}

// A bit reader that keeps a running bit position the same way the
// component headers measure their own sizes.
struct DtsBits {
    bits: Bits,
    pos:  u64,
}

impl DtsBits {
    fn new(data: &[u8]) -> io::Result<DtsBits> {
        let mut bits = Bits::new(Bs::new());
        bits.import_data(data)?;
        Ok(DtsBits { bits, pos: 0 })
    }

    fn get(&mut self, width: u32) -> u64 {
        self.pos += width as u64;
        if width > 64 {
            // Pure skip wider than one value.
            let mut left = width;
            while left > 64 {
                self.bits.get(64);
                left -= 64;
            }
            self.bits.get(left);
            return 0;
        }
        self.bits.get(width)
    }

    /// Peek an upcoming byte; only valid at byte-aligned positions.
    fn show_byte(&mut self, offset: usize) -> u8 {
        self.bits.show_byte(offset)
    }

    fn error(&self) -> bool {
        self.bits.bs.error()
    }

    fn status(&self) -> io::Result<()> {
        self.bits.bs.status()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubstreamType {
    None,
    Core,
    Extension,
}

impl Default for SubstreamType {
    fn default() -> SubstreamType {
        SubstreamType::None
    }
}

#[derive(Default)]
struct DtsCoreInfo {
    sampling_frequency:          u32,
    frame_duration:              u32,
    frame_size:                  u32,
    channel_arrangement:         u8,
    channel_layout:              u16,
    xxch_lower_planes:           u8,
    extension_audio_descriptor:  u8,
    pcm_resolution:              u8,
}

#[derive(Default)]
struct DtsExtensionInfo {
    sampling_frequency: u32,
    frame_duration:     u32,
    bit_resolution:     u32,
    channel_layout:     u16,
    xxch_lower_planes:  u8,
    number_of_assets:   u8,
    static_fields:      bool,
    one_to_one_mapping: bool,
    representation_type: u8,
    stereo_downmix:     u8,
    mix_metadata:       bool,
    num_mix_out_configs: usize,
    num_mix_out_ch:     [u32; 4],
}

#[derive(Default)]
struct DtsLbrInfo {
    sampling_frequency: u32,
    frame_duration:     u32,
    channel_layout:     u16,
    sample_size:        u8,
    stereo_downmix:     u8,
    lfe_present:        u8,
    duration_modifier:  u8,
}

#[derive(Default)]
struct DtsLosslessInfo {
    sampling_frequency: u32,
    frame_duration:     u32,
    channel_layout:     u16,
    bit_width:          u32,
}

#[derive(Default)]
struct DtsInfo {
    params:             DtsParams,
    params_initialized: bool,
    flags:              u32,
    substream_type:     SubstreamType,
    exss_index:         u8,
    frame_size:         usize,
    frame_duration:     u32,
    core:               DtsCoreInfo,
    extension:          DtsExtensionInfo,
    lbr:                DtsLbrInfo,
    lossless:           DtsLosslessInfo,
}

impl DtsInfo {
    fn parse_asset_descriptor(&mut self, b: &mut DtsBits) -> io::Result<()> {
        let asset_descriptor_pos = b.pos;
        let asset_descriptor_size = b.get(9) + 1; /* nuAssetDescriptFsize */
        b.get(3); /* nuAssetIndex */
        let mut embedded_stereo = false;
        let mut embedded_six_ch = false;
        let mut total_channels = 0u64;
        if self.extension.static_fields {
            if b.get(1) != 0 {
                b.get(4); /* nuAssetTypeDescriptor */
            }
            if b.get(1) != 0 {
                b.get(24); /* LanguageDescriptor */
            }
            if b.get(1) != 0 {
                let text_size = b.get(10) + 1;
                b.get(text_size as u32 * 8); /* InfoTextString */
            }
            let bit_resolution = b.get(5) as u32 + 1;
            self.extension.bit_resolution = self.extension.bit_resolution.max(bit_resolution);
            const SOURCE_SAMPLE_RATE_TABLE: [u32; 16] = [
                8000, 16000, 32000, 64000, 128000, 22050, 44100, 88200, 176400, 352800, 12000,
                24000, 48000, 96000, 192000, 384000,
            ];
            let max_sample_rate = SOURCE_SAMPLE_RATE_TABLE[b.get(4) as usize];
            self.extension.sampling_frequency =
                self.extension.sampling_frequency.max(max_sample_rate);
            total_channels = b.get(8) + 1;
            self.extension.one_to_one_mapping = b.get(1) != 0;
            if self.extension.one_to_one_mapping {
                if total_channels > 2 {
                    embedded_stereo = b.get(1) != 0;
                    self.extension.stereo_downmix |= embedded_stereo as u8;
                }
                if total_channels > 6 {
                    embedded_six_ch = b.get(1) != 0;
                }
                let num_bits_for_sa_mask;
                if b.get(1) != 0 {
                    num_bits_for_sa_mask = ((b.get(2) + 1) << 2) as u32;
                    self.extension.channel_layout |= b.get(num_bits_for_sa_mask) as u16;
                } else {
                    // The spec leaves the mask width undefined here.
                    num_bits_for_sa_mask = 0;
                }
                let num_spkr_remap_sets = b.get(3) as usize;
                let mut layout_masks = [0u64; 8];
                for mask in layout_masks.iter_mut().take(num_spkr_remap_sets) {
                    *mask = b.get(num_bits_for_sa_mask);
                }
                for &mask in layout_masks.iter().take(num_spkr_remap_sets) {
                    let num_speakers = channel_count_from_layout(mask as u16);
                    let num_dec_ch_for_remap = b.get(5) as u32 + 1;
                    for _ in 0..num_speakers {
                        let remap_mask = b.get(num_dec_ch_for_remap);
                        for _ in 0..remap_mask.count_ones() {
                            b.get(5); /* nuSpkrRemapCodes */
                        }
                    }
                }
            } else {
                self.extension.representation_type = b.get(3) as u8;
                if self.extension.representation_type == 2
                    || self.extension.representation_type == 3
                {
                    total_channels = 2;
                }
            }
        }
        // Dynamic metadata
        let drc_coef_present = b.get(1) != 0;
        if drc_coef_present {
            b.get(8); /* nuDRCCode */
        }
        if b.get(1) != 0 {
            b.get(5); /* nuDialNormCode */
        }
        if drc_coef_present && embedded_stereo {
            b.get(8); /* nuDRC2ChDmixCode */
        }
        let mix_metadata_present = self.extension.mix_metadata && b.get(1) != 0;
        if mix_metadata_present {
            b.get(7); /* bExternalMixFlag, nuPostMixGainAdjCode */
            if b.get(2) < 3 {
                b.get(3); /* nuLimit4EmbeddedDRC */
            } else {
                b.get(8); /* nuCustomDRCCode */
            }
            let per_channel_scale = b.get(1) != 0;
            for ns in 0..self.extension.num_mix_out_configs {
                if per_channel_scale {
                    for _ in 0..self.extension.num_mix_out_ch[ns] {
                        b.get(6); /* nuMainAudioScaleCode */
                    }
                } else {
                    b.get(6);
                }
            }
            let mut dec_ch = [total_channels as u32, 0, 0];
            let mut n_em = 1;
            if embedded_six_ch {
                dec_ch[n_em] = 6;
                n_em += 1;
            }
            if embedded_stereo {
                dec_ch[n_em] = 2;
                n_em += 1;
            }
            for ns in 0..self.extension.num_mix_out_configs {
                for &ch in dec_ch.iter().take(n_em) {
                    for _ in 0..ch {
                        let mix_map_mask = b.get(self.extension.num_mix_out_ch[ns]);
                        for _ in 0..mix_map_mask.count_ones() {
                            b.get(6); /* nuMixCoeffs */
                        }
                    }
                }
            }
        }
        // Decoder navigation data
        if b.get(2) == 0 {
            /* nuCodingMode == DTS-HD coding in components */
            let core_extension_mask = b.get(12) as u32;
            if core_extension_mask & DTS_EXT_SUBSTREAM_CORE_FLAG != 0 {
                self.flags |= DTS_EXT_SUBSTREAM_CORE_FLAG;
            }
        }
        let consumed = b.pos - asset_descriptor_pos;
        let descriptor_bits = asset_descriptor_size * 8;
        if consumed > descriptor_bits {
            return Err(ioerr!(InvalidData, "asset descriptor overrun"));
        }
        b.get((descriptor_bits - consumed) as u32);
        b.status()
    }

    fn parse_xxch(&mut self, b: &mut DtsBits, extension: bool) -> io::Result<()> {
        // XXCH frame header; the syncword was already consumed.
        let xxch_pos = b.pos - 32;
        if !extension
            && (self.core.extension_audio_descriptor == 0
                || self.core.extension_audio_descriptor == 3)
        {
            return Err(ioerr!(InvalidData, "XXCH without matching EXT_AUDIO_ID"));
        }
        let header_size = b.get(6) + 1;
        b.get(1); /* bCRCPresent4ChSetHeaderXXCh */
        let num_bits_for_spkr_mask = b.get(5) as u32 + 1;
        let num_ch_sets = b.get(2) as usize + 1;
        for _ in 0..num_ch_sets {
            b.get(14); /* pnuChSetFsizeXXCh */
        }
        let xxch_mask = b.get(num_bits_for_spkr_mask) as u32;
        {
            let (layout, lower_planes) = if extension {
                (&mut self.extension.channel_layout, &mut self.extension.xxch_lower_planes)
            } else {
                (&mut self.core.channel_layout, &mut self.core.xxch_lower_planes)
            };
            *layout |= channel_layout_from_xxch_mask(xxch_mask);
            *lower_planes = ((xxch_mask >> 25) & 0x7) as u8;
        }
        b.get((header_size * 8 - (b.pos - xxch_pos)) as u32);
        for _ in 0..num_ch_sets {
            // XXCH channel set header
            let chset_pos = b.pos;
            let chset_header_size = b.get(7) + 1;
            b.get(3); /* nuChInChSetXXCh */
            if num_bits_for_spkr_mask > 6 {
                let mask = (b.get(num_bits_for_spkr_mask - 6) as u32) << 6;
                let (layout, lower_planes) = if extension {
                    (&mut self.extension.channel_layout, &mut self.extension.xxch_lower_planes)
                } else {
                    (&mut self.core.channel_layout, &mut self.core.xxch_lower_planes)
                };
                *layout |= channel_layout_from_xxch_mask(mask);
                *lower_planes |= ((mask >> 25) & 0x7) as u8;
            }
            b.get((chset_header_size * 8 - (b.pos - chset_pos)) as u32);
        }
        self.flags |= if extension {
            DTS_EXT_SUBSTREAM_XXCH_FLAG
        } else {
            DTS_CORE_SUBSTREAM_XXCH_FLAG
        };
        b.status()
    }

    fn parse_core_x96(&mut self, b: &mut DtsBits) -> io::Result<()> {
        if self.core.extension_audio_descriptor != 2 && self.core.extension_audio_descriptor != 3 {
            // Probably four emulation bytes forming a pseudo syncword.
            return Ok(());
        }
        b.get(16); /* FSIZE96, REVNO */
        self.core.sampling_frequency *= 2;
        self.core.frame_duration *= 2;
        self.flags |= DTS_CORE_SUBSTREAM_X96_FLAG;
        b.status()
    }

    fn parse_core_xch(&mut self, b: &mut DtsBits) -> io::Result<()> {
        // Verify XChFSIZE closes exactly at the end of the core frame;
        // otherwise treat the syncword as emulated data.
        let xch_fsize =
            ((b.show_byte(0) as u64) << 2) | ((b.show_byte(1) as u64 >> 6) & 0x03);
        if b.pos - 32 + (xch_fsize + 1) * 8 != self.frame_size as u64 * 8 {
            return Ok(());
        }
        if self.core.extension_audio_descriptor != 0 && self.core.extension_audio_descriptor != 3 {
            return Err(ioerr!(InvalidData, "XCH without matching EXT_AUDIO_ID"));
        }
        b.get(10);
        if b.get(4) != 1 {
            // Only the centre-surround channel extension is defined.
            return Err(ioerr!(InvalidData, "bad XCH AMODE"));
        }
        b.get(2); // byte alignment
        self.core.channel_layout |= DTS_CHANNEL_LAYOUT_CS;
        self.flags |= DTS_CORE_SUBSTREAM_XCH_FLAG;
        b.status()
    }

    fn parse_exsub_xbr(&mut self, b: &mut DtsBits) -> io::Result<()> {
        let xbr_pos = b.pos - 32;
        let header_size = b.get(6) + 1;
        b.get((header_size * 8 - (b.pos - xbr_pos)) as u32);
        self.flags |= DTS_EXT_SUBSTREAM_XBR_FLAG;
        b.status()
    }

    fn parse_exsub_x96(&mut self, b: &mut DtsBits) -> io::Result<()> {
        let x96_pos = b.pos - 32;
        let header_size = b.get(6) + 1;
        b.get((header_size * 8 - (b.pos - x96_pos)) as u32);
        // The specification drops the condition here; assume the same
        // doubling as for the core substream.
        self.core.sampling_frequency *= 2;
        self.core.frame_duration *= 2;
        self.flags |= DTS_EXT_SUBSTREAM_X96_FLAG;
        b.status()
    }

    fn parse_exsub_lbr(&mut self, b: &mut DtsBits) -> io::Result<()> {
        let format_info_code = b.get(8);
        if format_info_code == 2 {
            // LBR decoder initialization data
            let sample_rate_code = b.get(8) as usize;
            let spkr_mask = b.get(16) as u16;
            b.get(16); /* nLBRversion */
            let compressed_flags = b.get(8) as u8;
            b.get(40); /* bitrate fields */
            const SOURCE_SAMPLE_RATE_TABLE: [u32; 16] = [
                8000, 16000, 32000, 0, 0, 11025, 22050, 44100, 0, 0, 12000, 24000, 48000, 0, 0, 0,
            ];
            self.lbr.sampling_frequency = SOURCE_SAMPLE_RATE_TABLE[sample_rate_code & 0xf];
            self.lbr.frame_duration = if self.lbr.sampling_frequency < 16000 {
                1024
            } else if self.lbr.sampling_frequency < 32000 {
                2048
            } else {
                4096
            };
            // usLBRSpkrMask is little-endian.
            self.lbr.channel_layout = spkr_mask.swap_bytes();
            self.lbr.stereo_downmix |= ((compressed_flags & 0x20) != 0) as u8;
            self.lbr.lfe_present |= ((compressed_flags & 0x02) != 0) as u8;
            self.lbr.duration_modifier |=
                ((compressed_flags & 0x04) != 0 || (compressed_flags & 0x0c) != 0) as u8;
            self.lbr.sample_size = if compressed_flags & 0x01 != 0 { 24 } else { 16 };
        } else if format_info_code != 1 {
            return Err(ioerr!(InvalidData, "unknown LBR format info code"));
        }
        self.flags |= DTS_EXT_SUBSTREAM_LBR_FLAG;
        b.status()
    }

    fn parse_exsub_xll(&mut self, b: &mut DtsBits) -> io::Result<()> {
        // Common header
        let xll_pos = b.pos - 32;
        b.get(4); /* nVersion */
        let header_size = b.get(8) + 1;
        let bits_for_frame_fsize = b.get(5) as u32 + 1;
        b.get(bits_for_frame_fsize); /* nLLFrameSize */
        let num_ch_sets_in_frame = b.get(4) as usize + 1;
        let segments_in_frame = 1u32 << b.get(4);
        let samples_in_segment = 1u32 << b.get(4);
        b.get(5); /* nBits4SSize */
        b.get(3); /* nBandDataCRCEn, bScalableLSBs */
        let bits_for_ch_mask = b.get(5) as u32 + 1;
        b.get((header_size * 8 - (b.pos - xll_pos)) as u32);
        let mut sum_ch_set_channels = 0u64;
        let mut fs1 = 0u32;
        let mut num_freq_bands1 = 0u32;
        for ch_set in 0..num_ch_sets_in_frame {
            // Channel set sub-header
            let chset_pos = b.pos;
            let chset_header_size = b.get(10) + 1;
            let ch_set_channels = b.get(4) + 1;
            b.get(ch_set_channels as u32 + 5); /* nResidualChEncode, nBitResolution */
            let bit_width = if b.get(5) < 16 { 16 } else { 24 };
            self.lossless.bit_width = self.lossless.bit_width.max(bit_width);
            const SOURCE_SAMPLE_RATE_TABLE: [u32; 16] = [
                8000, 16000, 32000, 64000, 128000, 22050, 44100, 88200, 176400, 352800, 12000,
                24000, 48000, 96000, 192000, 384000,
            ];
            let fs = SOURCE_SAMPLE_RATE_TABLE[b.get(4) as usize];
            b.get(2); /* nFsInterpolate */
            let replacement_set = b.get(2);
            if replacement_set > 0 {
                b.get(1); /* bActiveReplaceSet */
            }
            self.lossless.channel_layout = 0;
            if self.extension.one_to_one_mapping {
                let primary_ch_set = b.get(1) != 0;
                let downmix_coeffs_embedded = b.get(1) != 0;
                let mut downmix_type = 0x7u64;
                if downmix_coeffs_embedded {
                    b.get(1); /* bDownmixEmbedded */
                    if primary_ch_set {
                        downmix_type = b.get(3);
                    }
                }
                b.get(1); /* bHierChSet */
                if downmix_coeffs_embedded {
                    const DOWNMIX_CHANNEL_COUNT_TABLE: [u64; 8] = [1, 2, 2, 3, 3, 4, 4, 0];
                    let n = ch_set_channels + 1;
                    let m = if primary_ch_set {
                        DOWNMIX_CHANNEL_COUNT_TABLE[downmix_type as usize]
                    } else {
                        sum_ch_set_channels
                    };
                    b.get((n * m) as u32); /* DownmixCoeffs */
                }
                sum_ch_set_channels += ch_set_channels;
                if b.get(1) != 0 {
                    /* bChMaskEnabled */
                    self.lossless.channel_layout |= b.get(bits_for_ch_mask) as u16;
                }
            } else if b.get(1) != 0 {
                /* bMappingCoeffsPresent */
                let bits_ch_to_spkr_coef = (6 + 2 * b.get(3)) as u32;
                let num_speaker_configs = b.get(2) as usize + 1;
                for _ in 0..num_speaker_configs {
                    let active_channel_mask = b.get(ch_set_channels as u32);
                    let num_speakers = b.get(6) + 1;
                    let spkr_mask_enabled = b.get(1) != 0;
                    if spkr_mask_enabled {
                        self.lossless.channel_layout |= b.get(bits_for_ch_mask) as u16;
                    }
                    for _ in 0..num_speakers {
                        if !spkr_mask_enabled {
                            b.get(25); /* ChSetSpeakerConfiguration */
                        }
                        for ch in 0..ch_set_channels {
                            if active_channel_mask & (1 << ch) != 0 {
                                b.get(bits_ch_to_spkr_coef);
                            }
                        }
                    }
                }
            }
            let num_freq_bands = if fs > 96000 {
                if b.get(1) != 0 {
                    if fs > 192000 { 4 } else { 2 }
                } else {
                    if fs > 192000 { 2 } else { 1 }
                }
            } else {
                1
            };
            let samples_in_segment_ch_set = if ch_set == 0 {
                fs1 = fs;
                num_freq_bands1 = num_freq_bands;
                samples_in_segment
            } else {
                (samples_in_segment as u64 * (fs as u64 * num_freq_bands1 as u64)
                    / (fs1 as u64 * num_freq_bands as u64)) as u32
            };
            if self.lossless.sampling_frequency < fs {
                self.lossless.sampling_frequency = fs;
                let samples_per_band_in_frame = segments_in_frame * samples_in_segment_ch_set;
                self.lossless.frame_duration = samples_per_band_in_frame * num_freq_bands;
            }
            b.get((chset_header_size * 8 - (b.pos - chset_pos)) as u32);
        }
        self.flags |= DTS_EXT_SUBSTREAM_XLL_FLAG;
        b.status()
    }

    fn update_specific_params(&mut self) {
        let param = &mut self.params;
        // DTSSamplingFrequency and FrameDuration
        if self.flags & DTS_CORE_SUBSTREAM_CORE_FLAG != 0 {
            param.dts_sampling_frequency = self.core.sampling_frequency;
            self.frame_duration = self.core.frame_duration;
        } else {
            param.dts_sampling_frequency = self.extension.sampling_frequency;
            self.frame_duration = self.extension.frame_duration;
        }
        if param.dts_sampling_frequency <= self.lbr.sampling_frequency {
            param.dts_sampling_frequency = self.lbr.sampling_frequency;
            self.frame_duration = self.lbr.frame_duration;
        }
        if param.dts_sampling_frequency <= self.lossless.sampling_frequency {
            param.dts_sampling_frequency = self.lossless.sampling_frequency;
            self.frame_duration = self.lossless.frame_duration;
        }
        param.frame_duration = 0;
        let mut frame_duration = self.frame_duration >> 10;
        while frame_duration != 0 {
            param.frame_duration += 1;
            frame_duration >>= 1;
        }
        // pcmSampleDepth
        let mut depth = self.core.pcm_resolution as u32;
        depth = depth.max(self.extension.bit_resolution);
        depth = depth.max(self.lbr.sample_size as u32);
        depth = depth.max(self.lossless.bit_width);
        param.pcm_sample_depth = if depth > 16 { 24 } else { 16 };
        // StreamConstruction
        param.stream_construction = stream_construction(self.flags);
        // CoreLFEPresent
        param.core_lfe_present =
            ((self.core.channel_layout & DTS_CHANNEL_LAYOUT_LFE1) != 0) as u8;
        // CoreLayout
        if param.stream_construction == 0 || param.stream_construction >= 19 {
            param.core_layout = 31; // deduced from ChannelLayout instead
        } else if self.core.channel_arrangement != 1
            && self.core.channel_arrangement != 3
            && self.core.channel_arrangement <= 9
        {
            param.core_layout = self.core.channel_arrangement;
        } else {
            param.core_layout = 31;
        }
        // CoreSize is a copy of FSIZE; it saturates rather than overflow.
        param.core_size = self.core.frame_size.min(0x3fff) as u16;
        // StereoDownmix
        param.stereo_downmix = self.extension.stereo_downmix | self.lbr.stereo_downmix;
        // RepresentationType
        param.representation_type = self.extension.representation_type;
        // ChannelLayout
        param.channel_layout = self.core.channel_layout
            | self.extension.channel_layout
            | self.lbr.channel_layout
            | self.lossless.channel_layout;
        // With multiple assets, the remaining fields reflect only the
        // coding parameters of the first asset.
        param.multi_asset_flag = (self.extension.number_of_assets > 1) as u8;
        param.lbr_duration_mod = if param.multi_asset_flag != 0 {
            (self.lbr.duration_modifier != 0 && self.flags & DTS_CORE_SUBSTREAM_CORE_FLAG == 0)
                as u8
        } else {
            self.lbr.duration_modifier
        };
        self.params_initialized = true;
    }

    fn max_channel_count(&self) -> u32 {
        let mut count = 0;
        for &(layout, lower_planes) in &[
            (self.core.channel_layout, self.core.xxch_lower_planes),
            (self.extension.channel_layout, self.extension.xxch_lower_planes),
            (self.lbr.channel_layout, 0),
            (self.lossless.channel_layout, 0),
        ] {
            let n = channel_count_from_layout(layout) + (lower_planes as u32).count_ones();
            count = count.max(n);
        }
        count
    }

    fn parse_core_substream(&mut self, data: &[u8]) -> io::Result<()> {
        let mut b = DtsBits::new(data)?;
        b.get(32); /* SYNC */
        let frame_type = b.get(1);
        let deficit_sample_count = b.get(5);
        if frame_type == 1 && deficit_sample_count != 31 {
            return Err(ioerr!(InvalidData, "normal DTS frame with a deficit sample count"));
        }
        let crc_present = b.get(1);
        let num_pcm_sample_blocks = b.get(7) + 1;
        if num_pcm_sample_blocks <= 5 {
            return Err(ioerr!(InvalidData, "too few PCM sample blocks"));
        }
        self.core.frame_duration = 32 * num_pcm_sample_blocks as u32;
        self.core.frame_size = b.get(14) as u32;
        self.frame_size = self.core.frame_size as usize + 1;
        if self.frame_size < DTS_MIN_CORE_SIZE {
            return Err(ioerr!(InvalidData, "core substream frame too small"));
        }
        self.core.channel_arrangement = b.get(6) as u8; /* AMODE */
        self.core.channel_layout = channel_layout_from_core(self.core.channel_arrangement);
        const SAMPLING_FREQUENCY_TABLE: [u32; 16] = [
            0, 8000, 16000, 32000, 0, 0, 11025, 22050, 44100, 0, 0, 12000, 24000, 48000, 0, 0,
        ];
        self.core.sampling_frequency = SAMPLING_FREQUENCY_TABLE[b.get(4) as usize];
        if self.core.sampling_frequency == 0 {
            return Err(ioerr!(InvalidData, "invalid core sampling frequency"));
        }
        b.get(10); /* RATE, MIX, DYNF, TIMEF, AUXF, HDCD */
        // EXT_AUDIO_ID == 3 is defined in V1.2.1 but reserved in V1.3.1.
        self.core.extension_audio_descriptor = b.get(3) as u8;
        let extended_coding = b.get(1) != 0;
        b.get(1); /* ASPF */
        let lfe = b.get(2);
        if lfe == 0x3 {
            return Err(ioerr!(InvalidData, "invalid LFF"));
        }
        if lfe != 0 {
            self.core.channel_layout |= DTS_CHANNEL_LAYOUT_LFE1;
        }
        b.get(8 + crc_present as u32 * 16); /* HFLAG, HCRC, FILTS, VERNUM, CHIST */
        const SOURCE_RESOLUTION_TABLE: [u8; 8] = [16, 16, 20, 20, 0, 24, 24, 0];
        self.core.pcm_resolution = SOURCE_RESOLUTION_TABLE[b.get(3) as usize];
        if self.core.pcm_resolution == 0 {
            return Err(ioerr!(InvalidData, "invalid PCMR"));
        }
        b.get(6); /* SUMF, SUMS, DIALNORM/UNSPEC */
        if extended_coding {
            let mut syncword = b.get(24);
            let frame_size_bits = self.frame_size as u64 * 8;
            while b.pos + 24 < frame_size_bits {
                syncword = ((syncword << 8) & 0xffff_ff00) | b.get(8);
                match syncword as u32 {
                    SYNCWORD_XXCH => {
                        self.parse_xxch(&mut b, false)?;
                        syncword = b.get(24);
                    },
                    SYNCWORD_X96K => {
                        self.parse_core_x96(&mut b)?;
                        syncword = b.get(24);
                    },
                    SYNCWORD_XCH => {
                        self.parse_core_xch(&mut b)?;
                    },
                    _ => continue,
                }
                if b.error() {
                    break;
                }
            }
        }
        self.flags |= DTS_CORE_SUBSTREAM_CORE_FLAG;
        b.status()
    }

    fn parse_extension_substream(&mut self, data: &[u8]) -> io::Result<()> {
        let mut b = DtsBits::new(data)?;
        b.get(40); /* SYNCEXTSSH, UserDefinedBits */
        let exss_index = b.get(2) as u8;
        self.exss_index = exss_index;
        let header_size_type = b.get(1);
        let bits_for_header = 8 + header_size_type as u32 * 4;
        let bits_for_fsize = 16 + header_size_type as u32 * 4;
        let header_size = b.get(bits_for_header) + 1;
        self.frame_size = b.get(bits_for_fsize) as usize + 1;
        if self.frame_size < 10 {
            return Err(ioerr!(InvalidData, "extension substream frame too small"));
        }
        let num_assets;
        self.extension.static_fields = b.get(1) != 0;
        if self.extension.static_fields {
            b.get(2); /* nuRefClockCode */
            self.extension.frame_duration = 512 * (b.get(3) as u32 + 1);
            if b.get(1) != 0 {
                b.get(36); /* nuTimeStamp, nLSB */
            }
            let num_audio_present = b.get(3) as usize + 1;
            num_assets = b.get(3) as usize + 1;
            let mut active_exss_masks = [0u64; 8];
            for mask in active_exss_masks.iter_mut().take(num_audio_present) {
                *mask = b.get(exss_index as u32 + 1);
            }
            for &mask in active_exss_masks.iter().take(num_audio_present) {
                for ss in 0..=exss_index as u64 {
                    if (mask >> ss) & 0x1 == 1 {
                        b.get(8); /* nuActiveAssetMask */
                    }
                }
            }
            self.extension.mix_metadata = b.get(1) != 0;
            if self.extension.mix_metadata {
                b.get(2); /* nuMixMetadataAdjLevel */
                let bits_for_mix_out_mask = ((b.get(2) + 1) << 2) as u32;
                self.extension.num_mix_out_configs = b.get(2) as usize + 1;
                for ns in 0..self.extension.num_mix_out_configs {
                    let mix_out_ch_mask = b.get(bits_for_mix_out_mask) as u16;
                    self.extension.num_mix_out_ch[ns] =
                        channel_count_from_layout(mix_out_ch_mask);
                }
            }
        } else {
            num_assets = 1;
            self.extension.mix_metadata = false;
            self.extension.num_mix_out_configs = 0;
        }
        self.extension.number_of_assets = num_assets as u8;
        for _ in 0..num_assets {
            b.get(bits_for_fsize); /* nuAssetFsize */
        }
        for _ in 0..num_assets {
            self.parse_asset_descriptor(&mut b)?;
        }
        b.get((header_size * 8 - b.pos) as u32);
        let mut syncword = b.get(24);
        let frame_size_bits = self.frame_size as u64 * 8;
        while b.pos + 24 < frame_size_bits {
            syncword = ((syncword << 8) & 0xffff_ff00) | b.get(8);
            match syncword as u32 {
                SYNCWORD_XBR => self.parse_exsub_xbr(&mut b)?,
                SYNCWORD_XXCH => self.parse_xxch(&mut b, true)?,
                SYNCWORD_X96K => self.parse_exsub_x96(&mut b)?,
                SYNCWORD_LBR => self.parse_exsub_lbr(&mut b)?,
                SYNCWORD_XLL => self.parse_exsub_xll(&mut b)?,
                _ => continue,
            }
            if b.error() {
                break;
            }
            syncword = b.get(24);
        }
        b.status()
    }
}

fn channel_layout_from_core(channel_arrangement: u8) -> u16 {
    const CHANNEL_LAYOUT_MAP_TABLE: [u16; 16] = [
        DTS_CHANNEL_LAYOUT_C,
        DTS_CHANNEL_LAYOUT_L_R, /* dual mono */
        DTS_CHANNEL_LAYOUT_L_R, /* stereo */
        DTS_CHANNEL_LAYOUT_L_R, /* sum-difference */
        DTS_CHANNEL_LAYOUT_L_R, /* Lt/Rt */
        DTS_CHANNEL_LAYOUT_C | DTS_CHANNEL_LAYOUT_L_R,
        DTS_CHANNEL_LAYOUT_L_R | DTS_CHANNEL_LAYOUT_CS,
        DTS_CHANNEL_LAYOUT_C | DTS_CHANNEL_LAYOUT_L_R | DTS_CHANNEL_LAYOUT_CS,
        DTS_CHANNEL_LAYOUT_L_R | DTS_CHANNEL_LAYOUT_LS_RS,
        DTS_CHANNEL_LAYOUT_C | DTS_CHANNEL_LAYOUT_L_R | DTS_CHANNEL_LAYOUT_LS_RS,
        DTS_CHANNEL_LAYOUT_LC_RC | DTS_CHANNEL_LAYOUT_L_R | DTS_CHANNEL_LAYOUT_LS_RS,
        DTS_CHANNEL_LAYOUT_C
            | DTS_CHANNEL_LAYOUT_L_R
            | DTS_CHANNEL_LAYOUT_LSR_RSR
            | DTS_CHANNEL_LAYOUT_OH,
        DTS_CHANNEL_LAYOUT_C
            | DTS_CHANNEL_LAYOUT_CS
            | DTS_CHANNEL_LAYOUT_L_R
            | DTS_CHANNEL_LAYOUT_LSR_RSR,
        DTS_CHANNEL_LAYOUT_C
            | DTS_CHANNEL_LAYOUT_L_R
            | DTS_CHANNEL_LAYOUT_LC_RC
            | DTS_CHANNEL_LAYOUT_LS_RS,
        DTS_CHANNEL_LAYOUT_L_R
            | DTS_CHANNEL_LAYOUT_LC_RC
            | DTS_CHANNEL_LAYOUT_LS_RS
            | DTS_CHANNEL_LAYOUT_LSR_RSR,
        DTS_CHANNEL_LAYOUT_C
            | DTS_CHANNEL_LAYOUT_CS
            | DTS_CHANNEL_LAYOUT_L_R
            | DTS_CHANNEL_LAYOUT_LC_RC
            | DTS_CHANNEL_LAYOUT_LS_RS,
    ];
    if (channel_arrangement as usize) < 16 {
        CHANNEL_LAYOUT_MAP_TABLE[channel_arrangement as usize]
    } else {
        0
    }
}

fn substream_type_of(buffer: &[u8]) -> SubstreamType {
    if buffer.len() < 4 {
        return SubstreamType::None;
    }
    let syncword = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    match syncword {
        SYNCWORD_CORE => SubstreamType::Core,
        SYNCWORD_SUBSTREAM => SubstreamType::Extension,
        _ => SubstreamType::None,
    }
}

fn exss_index_of(buffer: &[u8]) -> io::Result<u8> {
    if buffer.len() < 6 {
        return Err(ioerr!(UnexpectedEof, "truncated extension substream"));
    }
    Ok(buffer[5] >> 6)
}

struct DtsImporter {
    status:               ImportStatus,
    info:                 DtsInfo,
    buffer:               Vec<u8>,
    buffer_pos:           usize,
    buffer_end:           usize,
    no_more_read:         bool,
    au:                   Vec<u8>,
    incomplete_au:        Vec<u8>,
    au_length:            usize,
    incomplete_au_length: usize,
    au_number:            u32,
}

impl DtsImporter {
    fn new() -> DtsImporter {
        DtsImporter {
            status: ImportStatus::Ok,
            info: DtsInfo::default(),
            buffer: vec![0u8; 2 * DTS_MAX_EXSS_SIZE],
            buffer_pos: 0,
            buffer_end: 0,
            no_more_read: false,
            au: vec![0u8; DTS_MAX_EXSS_SIZE],
            incomplete_au: vec![0u8; DTS_MAX_EXSS_SIZE],
            au_length: 0,
            incomplete_au_length: 0,
            au_number: 0,
        }
    }

    fn next_access_unit_internal(&mut self, sb: &mut Sb) -> io::Result<()> {
        let mut complete_au = false;
        while !complete_au {
            // Read data from the stream if needed.
            let mut remainder = self.buffer_end - self.buffer_pos;
            if !self.no_more_read && remainder < DTS_MAX_EXSS_SIZE {
                self.buffer.copy_within(self.buffer_pos..self.buffer_end, 0);
                let read_size =
                    sb.read_bytes(&mut self.buffer[remainder..remainder + DTS_MAX_EXSS_SIZE])?;
                remainder += read_size;
                self.buffer_pos = 0;
                self.buffer_end = remainder;
                self.no_more_read = read_size == 0 && sb.is_eos();
            }
            // The length 10 is required to get the frame size.
            if remainder < 10 {
                self.status = ImportStatus::Eof;
                complete_au = self.incomplete_au_length > 0;
                if !complete_au {
                    if remainder > 0 {
                        return Err(ioerr!(UnexpectedEof, "trailing garbage in DTS stream"));
                    }
                    return Ok(());
                }
                if !self.info.params_initialized {
                    self.info.update_specific_params();
                }
            } else {
                // Decide the substream parser and whether this frame and
                // the previous one belong to the same access unit.
                let prev_substream_type = self.info.substream_type;
                let window = &self.buffer[self.buffer_pos..self.buffer_end];
                self.info.substream_type = substream_type_of(window);
                let mut parse_core = false;
                match self.info.substream_type {
                    SubstreamType::Core => {
                        if prev_substream_type != SubstreamType::None {
                            complete_au = true;
                        }
                        parse_core = true;
                    },
                    SubstreamType::Extension => {
                        let prev_exss_index = self.info.exss_index;
                        let exss_index = exss_index_of(window)?;
                        if prev_substream_type == SubstreamType::Extension
                            && exss_index <= prev_exss_index
                        {
                            complete_au = true;
                        }
                    },
                    SubstreamType::None => {
                        return Err(ioerr!(InvalidData, "lost DTS synchronization"));
                    },
                }
                if !self.info.params_initialized && complete_au {
                    self.info.update_specific_params();
                }
                self.info.frame_size = 0;
                let end = (self.buffer_pos + DTS_MAX_EXSS_SIZE).min(self.buffer_end);
                let frame = &self.buffer[self.buffer_pos..end];
                if parse_core {
                    self.info.parse_core_substream(frame)?;
                } else {
                    self.info.parse_extension_substream(frame)?;
                }
            }
            if complete_au {
                self.au[..self.incomplete_au_length]
                    .copy_from_slice(&self.incomplete_au[..self.incomplete_au_length]);
                self.au_length = self.incomplete_au_length;
                self.incomplete_au_length = 0;
                if self.status == ImportStatus::Eof {
                    break;
                }
            }
            // Grow the AU buffers if this frame would overflow them.
            let needed = self.incomplete_au_length + self.info.frame_size;
            if needed > self.au.len() {
                let new_size = self.au.len() + DTS_MAX_EXSS_SIZE;
                self.au.resize(new_size, 0);
                self.incomplete_au.resize(new_size, 0);
            }
            // Append the substream frame.
            self.incomplete_au
                [self.incomplete_au_length..self.incomplete_au_length + self.info.frame_size]
                .copy_from_slice(
                    &self.buffer[self.buffer_pos..self.buffer_pos + self.info.frame_size],
                );
            self.incomplete_au_length += self.info.frame_size;
            self.buffer_pos += self.info.frame_size;
        }
        Ok(())
    }
}

fn dts_summary(info: &DtsInfo) -> AudioSummary {
    let param = &info.params;
    let mut summary = AudioSummary::default();
    summary.sample_type = codingname(param);
    // Fold the coding sampling frequency onto its base family.
    summary.frequency = match param.dts_sampling_frequency {
        12000 | 24000 | 48000 | 96000 | 192000 | 384000 => 48000,
        22050 | 44100 | 88200 | 176400 | 352800 => 44100,
        8000 | 16000 | 32000 | 64000 | 128000 => 32000,
        _ => 0,
    };
    summary.samples_in_frame = if param.dts_sampling_frequency != 0 {
        ((summary.frequency as u64 * info.frame_duration as u64)
            / param.dts_sampling_frequency as u64) as u32
    } else {
        0
    };
    summary.max_au_length = DTS_MAX_CORE_SIZE + DTS_MAX_NUM_EXSS * DTS_MAX_EXSS_SIZE;
    summary.sample_size = param.pcm_sample_depth as u32;
    summary.channels = info.max_channel_count();
    summary
        .codec_specific
        .push(CodecSpecific::new(CodecSpecificKind::Dts, create_dts_specific_info(param)));
    summary
}

pub(crate) fn probe(sb: &mut Sb) -> io::Result<(Box<dyn CodecImporter>, Summary)> {
    let mut importer = DtsImporter::new();
    importer.next_access_unit_internal(sb)?;
    if importer.au_length == 0 && importer.incomplete_au_length == 0 && importer.info.flags == 0 {
        return Err(ioerr!(InvalidData, "not a DTS stream"));
    }
    if !importer.info.params_initialized {
        importer.info.update_specific_params();
    }
    let summary = dts_summary(&importer.info);
    importer.au_number = 0;
    Ok((Box::new(importer), Summary::Audio(summary)))
}

impl CodecImporter for DtsImporter {
    fn get_access_unit(
        &mut self,
        sb: &mut Sb,
        summary: &mut Summary,
        sample: &mut Sample,
    ) -> io::Result<ImportStatus> {
        let current_status = self.status;
        if sample.data.len() < self.au_length {
            return Err(ioerr!(InvalidInput, "sample buffer smaller than the access unit"));
        }
        if current_status == ImportStatus::Eof && self.au_length == 0 {
            sample.length = 0;
            return Ok(ImportStatus::Eof);
        }
        let samples_in_frame = match summary {
            Summary::Audio(a) => a.samples_in_frame,
            _ => return Err(ioerr!(InvalidData, "summary type mismatch")),
        };
        sample.data[..self.au_length].copy_from_slice(&self.au[..self.au_length]);
        sample.length = self.au_length;
        sample.dts = self.au_number as u64 * samples_in_frame as u64;
        sample.cts = sample.dts;
        sample.prop = Default::default();
        sample.prop.ra_flags = RA_FLAG_SYNC;
        sample.prop.pre_roll.distance =
            ((self.info.flags & DTS_EXT_SUBSTREAM_LBR_FLAG) != 0) as u16; /* MDCT */
        self.au_number += 1;
        if self.status == ImportStatus::Eof {
            // The final flushed access unit still counts as a delivery.
            self.au_length = 0;
            return Ok(ImportStatus::Ok);
        }
        self.next_access_unit_internal(sb)?;
        Ok(current_status)
    }

    fn last_delta(&self, summary: &Summary) -> u32 {
        if self.status != ImportStatus::Eof || self.au_length != 0 {
            return 0;
        }
        let frequency = match summary {
            Summary::Audio(a) => a.frequency,
            _ => return 0,
        };
        if self.info.params.dts_sampling_frequency == 0 {
            return 0;
        }
        ((frequency as u64 * self.info.frame_duration as u64)
            / self.info.params.dts_sampling_frequency as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbuf::SbStream;

    // 48 kHz stereo core frame: 8 PCM blocks, 96 bytes, 16-bit.
    fn core_frame() -> Vec<u8> {
        let mut bits = Bits::new(Bs::new());
        bits.put(32, 0x7ffe_8001);
        bits.put(1, 1); // FTYPE: normal
        bits.put(5, 31); // SHORT
        bits.put(1, 0); // CPF
        bits.put(7, 7); // NBLKS: 8 blocks
        bits.put(14, 95); // FSIZE: 96 bytes
        bits.put(6, 2); // AMODE: stereo
        bits.put(4, 13); // SFREQ: 48 kHz
        bits.put(10, 0); // RATE .. HDCD
        bits.put(3, 0); // EXT_AUDIO_ID
        bits.put(1, 0); // EXT_AUDIO
        bits.put(1, 0); // ASPF
        bits.put(2, 0); // LFF
        bits.put(8, 0); // HFLAG, FILTS, VERNUM, CHIST
        bits.put(3, 0); // PCMR: 16-bit
        bits.put(6, 0); // SUMF, SUMS, DIALNORM
        let mut frame = bits.export_data().unwrap();
        frame.resize(96, 0);
        frame
    }

    // Extension substream carrying one XLL component: 96 kHz, 24-bit,
    // 1024 samples per frame.
    fn xll_extension_frame() -> Vec<u8> {
        const FRAME_SIZE: usize = 64;
        let mut bits = Bits::new(Bs::new());
        bits.put(32, 0x6458_2025);
        bits.put(8, 0); // UserDefinedBits
        bits.put(2, 0); // nExtSSIndex
        bits.put(1, 0); // bHeaderSizeType
        bits.put(8, 12); // nuExtSSHeaderSize: 13 bytes
        bits.put(16, FRAME_SIZE as u64 - 1); // nuExtSSFsize
        bits.put(1, 0); // bStaticFieldsPresent
        bits.put(16, 0x40); // nuAssetFsize[0]
        // Asset descriptor, 2 bytes.
        bits.put(9, 1); // nuAssetDescriptFsize
        bits.put(3, 0); // nuAssetIndex
        bits.put(1, 0); // bDRCCoefPresent
        bits.put(1, 0); // bDialNormPresent
        bits.put(2, 1); // nuCodingMode
        bits.put(4, 0); // padding up to the header size
        // XLL common header, 12 bytes from its syncword.
        bits.put(32, 0x41a2_9547);
        bits.put(4, 0); // nVersion
        bits.put(8, 11); // nHeaderSize
        bits.put(5, 13); // nBits4FrameFsize: 14
        bits.put(14, 600); // nLLFrameSize
        bits.put(4, 0); // nNumChSetsInFrame: 1
        bits.put(4, 0); // nSegmentsInFrame: 1
        bits.put(4, 10); // nSmplInSeg: 1024
        bits.put(5, 0); // nBits4SSize
        bits.put(3, 0); // nBandDataCRCEn, bScalableLSBs
        bits.put(5, 15); // nBits4ChMask: 16
        bits.put(8, 0); // padding
        // Channel set sub-header, 5 bytes.
        bits.put(10, 4); // nChSetHeaderSize
        bits.put(4, 1); // nChSetLLChannel: 2
        bits.put(2, 0); // nResidualChEncode
        bits.put(5, 23); // nBitResolution
        bits.put(5, 20); // nBitWidth: 24
        bits.put(4, 13); // sFreqIndex: 96 kHz
        bits.put(2, 0); // nFsInterpolate
        bits.put(2, 0); // nReplacementSet
        bits.put(1, 0); // bMappingCoeffsPresent
        bits.put(5, 0); // padding
        let mut frame = bits.export_data().unwrap();
        frame.resize(FRAME_SIZE, 0);
        frame
    }

    fn sb_of(data: Vec<u8>) -> Sb {
        Sb::new(SbStream::Memory { data, consumed: 0 }, 1 << 16)
    }

    #[test]
    fn core_substream_fields() {
        let mut info = DtsInfo::default();
        info.parse_core_substream(&core_frame()).unwrap();
        assert_eq!(info.frame_size, 96);
        assert_eq!(info.core.sampling_frequency, 48000);
        assert_eq!(info.core.frame_duration, 256);
        assert_eq!(info.core.channel_layout, DTS_CHANNEL_LAYOUT_L_R);
        assert_eq!(info.core.pcm_resolution, 16);
        assert_eq!(info.flags, DTS_CORE_SUBSTREAM_CORE_FLAG);
    }

    #[test]
    fn stream_construction_mapping() {
        assert_eq!(stream_construction(DTS_CORE_SUBSTREAM_CORE_FLAG), 1);
        assert_eq!(
            stream_construction(DTS_CORE_SUBSTREAM_CORE_FLAG | DTS_EXT_SUBSTREAM_XLL_FLAG),
            14
        );
        assert_eq!(stream_construction(DTS_EXT_SUBSTREAM_LBR_FLAG), 18);
        // Unlisted combinations fall back to 0 / 'dtsh'.
        assert_eq!(
            stream_construction(DTS_CORE_SUBSTREAM_XCH_FLAG | DTS_EXT_SUBSTREAM_LBR_FLAG),
            0
        );
    }

    #[test]
    fn ddts_roundtrip() {
        let param = DtsParams {
            dts_sampling_frequency: 96000,
            max_bitrate: 1536000,
            avg_bitrate: 1536000,
            pcm_sample_depth: 24,
            frame_duration: 1,
            stream_construction: 14,
            core_lfe_present: 0,
            core_layout: 2,
            core_size: 95,
            stereo_downmix: 0,
            representation_type: 0,
            channel_layout: DTS_CHANNEL_LAYOUT_L_R,
            multi_asset_flag: 0,
            lbr_duration_mod: 0,
        };
        let ddts = create_dts_specific_info(&param);
        assert_eq!(ddts.len(), 28);
        assert_eq!(&ddts[..8], &[0, 0, 0, 28, b'd', b'd', b't', b's']);
        let back = parse_dts_specific_info(&ddts).unwrap();
        assert_eq!(back, param);
    }

    #[test]
    fn core_plus_xll_access_unit() {
        let core = core_frame();
        let ext = xll_extension_frame();
        let mut stream = core.clone();
        stream.extend_from_slice(&ext);
        let mut sb = sb_of(stream);
        let (mut imp, mut summary) = probe(&mut sb).unwrap();
        {
            let audio = summary.audio().unwrap();
            assert_eq!(audio.sample_type, FourCc::new(b"dtsl"));
            assert_eq!(audio.frequency, 48000);
            assert_eq!(audio.sample_size, 24);
            assert_eq!(audio.samples_in_frame, 512); // 48000 * 1024 / 96000
            assert_eq!(audio.channels, 2);
            let ddts = parse_dts_specific_info(&audio.codec_specific[0].data).unwrap();
            assert_eq!(ddts.dts_sampling_frequency, 96000);
            assert_eq!(ddts.pcm_sample_depth, 24);
            assert_eq!(ddts.stream_construction, 14);
            assert_eq!(ddts.core_size, 95);
            assert_eq!(ddts.frame_duration, 1); // log2(1024 / 512)
        }
        let mut sample = Sample::with_capacity(summary.max_au_length());
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        // The AU is the concatenation of the core and extension frames.
        assert_eq!(sample.length, core.len() + ext.len());
        assert_eq!(&sample.payload()[..core.len()], &core[..]);
        assert_eq!(&sample.payload()[core.len()..], &ext[..]);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Eof);
        assert_eq!(imp.last_delta(&summary), 512);
    }

    #[test]
    fn channel_count_counts_pairs_twice() {
        assert_eq!(channel_count_from_layout(DTS_CHANNEL_LAYOUT_C), 1);
        assert_eq!(channel_count_from_layout(DTS_CHANNEL_LAYOUT_L_R), 2);
        assert_eq!(
            channel_count_from_layout(
                DTS_CHANNEL_LAYOUT_C | DTS_CHANNEL_LAYOUT_L_R | DTS_CHANNEL_LAYOUT_LS_RS
                    | DTS_CHANNEL_LAYOUT_LFE1
            ),
            6
        );
    }
}

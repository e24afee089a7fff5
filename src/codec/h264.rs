//! H.264/AVC byte streams (ITU-T H.264, ISO/IEC 14496-15).
//!
//! The importer walks start codes, parses just enough of the SPS/PPS/SEI
//! and slice headers to find access-unit boundaries and picture order
//! counts, and accumulates parameter sets into an `avcC` configuration.
//! Timestamps come from a probe pass over the whole stream: POCs are
//! deduplicated across coded video sequences, then CTSs and DTSs are
//! synthesized with the derived composition delay.
use std::io;

use crate::bits::Bits;
use crate::bs::Bs;
use crate::codec::nalu::{self, DcrPsEntry, MediaTs, NalPicTiming};
use crate::importer::{CodecImporter, ImportStatus};
use crate::sample::{
    Leading, Sample, RA_FLAG_PARTIAL_SYNC, RA_FLAG_POST_ROLL_START, RA_FLAG_RAP, RA_FLAG_SYNC,
};
use crate::sbuf::Sb;
use crate::summary::{CodecSpecific, CodecSpecificKind, FourCc, Summary, VideoSummary};

const H264_DEFAULT_BUFFER_SIZE: usize = 1 << 16;
const H264_DEFAULT_NALU_LENGTH_SIZE: usize = 4;

pub const NALU_TYPE_SLICE_N_IDR: u8 = 1;
pub const NALU_TYPE_SLICE_DP_A: u8 = 2;
pub const NALU_TYPE_SLICE_DP_B: u8 = 3;
pub const NALU_TYPE_SLICE_DP_C: u8 = 4;
pub const NALU_TYPE_SLICE_IDR: u8 = 5;
pub const NALU_TYPE_SEI: u8 = 6;
pub const NALU_TYPE_SPS: u8 = 7;
pub const NALU_TYPE_PPS: u8 = 8;
pub const NALU_TYPE_AUD: u8 = 9;
pub const NALU_TYPE_EOS: u8 = 10;
pub const NALU_TYPE_EOB: u8 = 11;
pub const NALU_TYPE_FD: u8 = 12;
pub const NALU_TYPE_SPS_EXT: u8 = 13;
pub const NALU_TYPE_PREFIX: u8 = 14;
pub const NALU_TYPE_RSV_NVCL18: u8 = 18;
pub const NALU_TYPE_SLICE_AUX: u8 = 19;
pub const NALU_TYPE_SLICE_EXT: u8 = 20;

const SLICE_TYPE_P: u8 = 0;
const SLICE_TYPE_B: u8 = 1;
const SLICE_TYPE_I: u8 = 2;
const SLICE_TYPE_SP: u8 = 3;
const SLICE_TYPE_SI: u8 = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    pub nal_ref_idc:   u8,
    pub nal_unit_type: u8,
    pub length:        u8,
}

#[derive(Clone, Copy, Debug, Default)]
struct Hrd {
    present:                  bool,
    cpb_dpb_delays_present:   bool,
    cpb_removal_delay_length: u32,
    dpb_output_delay_length:  u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct Vui {
    sar_width:                u16,
    sar_height:               u16,
    video_full_range_flag:    bool,
    colour_primaries:         u16,
    transfer_characteristics: u16,
    matrix_coefficients:      u16,
    num_units_in_tick:        u32,
    time_scale:               u32,
    fixed_frame_rate_flag:    bool,
    pic_struct_present_flag:  bool,
    hrd:                      Hrd,
}

#[derive(Clone, Debug, Default)]
struct Sps {
    present:                   bool,
    profile_idc:               u8,
    constraint_set_flags:      u8,
    level_idc:                 u8,
    seq_parameter_set_id:      u8,
    chroma_format_idc:         u8,
    separate_colour_plane_flag: bool,
    chroma_array_type:         u8,
    bit_depth_luma_minus8:     u8,
    bit_depth_chroma_minus8:   u8,
    log2_max_frame_num:        u32,
    max_frame_num:             u32,
    pic_order_cnt_type:        u8,
    log2_max_pic_order_cnt_lsb: u32,
    max_pic_order_cnt_lsb:     u32,
    delta_pic_order_always_zero_flag: bool,
    offset_for_non_ref_pic:    i32,
    offset_for_top_to_bottom_field: i32,
    num_ref_frames_in_pic_order_cnt_cycle: u8,
    offset_for_ref_frame:      Vec<i32>,
    expected_delta_per_pic_order_cnt_cycle: i64,
    max_num_ref_frames:        u32,
    frame_mbs_only_flag:       bool,
    pic_size_in_map_units:     u64,
    cropped_width:             u32,
    cropped_height:            u32,
    vui:                       Vui,
}

#[derive(Clone, Copy, Debug, Default)]
struct Pps {
    present:                  bool,
    pic_parameter_set_id:     u8,
    seq_parameter_set_id:     u8,
    entropy_coding_mode_flag: bool,
    bottom_field_pic_order_in_frame_present_flag: bool,
    num_slice_groups_minus1:  u8,
    slice_group_map_type:     u8,
    slice_group_change_rate:  u64,
    num_ref_idx_l0_default_active_minus1: u64,
    num_ref_idx_l1_default_active_minus1: u64,
    weighted_pred_flag:       bool,
    weighted_bipred_idc:      u8,
    deblocking_filter_control_present_flag: bool,
    redundant_pic_cnt_present_flag: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct SeiPicTiming {
    present:    bool,
    pic_struct: u8,
}

#[derive(Clone, Copy, Debug, Default)]
struct SeiRecoveryPoint {
    present:            bool,
    random_accessible:  bool,
    broken_link_flag:   bool,
    recovery_frame_cnt: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct Sei {
    pic_timing:     SeiPicTiming,
    recovery_point: SeiRecoveryPoint,
}

#[derive(Clone, Copy, Debug, Default)]
struct SliceInfo {
    present:                    bool,
    slice_id:                   u64,
    r#type:                     u8,
    pic_order_cnt_type:         u8,
    nal_ref_idc:                u8,
    idr_pic_flag:               bool,
    seq_parameter_set_id:       u8,
    pic_parameter_set_id:       u8,
    frame_num:                  u32,
    field_pic_flag:             bool,
    bottom_field_flag:          bool,
    idr_pic_id:                 u32,
    pic_order_cnt_lsb:          u32,
    delta_pic_order_cnt_bottom: i32,
    delta_pic_order_cnt:        [i32; 2],
    has_mmco5:                  bool,
    has_redundancy:             bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PictureType {
    I,
    IP,
    IPB,
    Si,
    SiSp,
    ISi,
    ISiPSp,
    ISiPSpB,
    None,
}

impl Default for PictureType {
    fn default() -> PictureType {
        PictureType::None
    }
}

#[derive(Clone, Debug, Default)]
struct PictureInfo {
    r#type:                     PictureType,
    idr:                        bool,
    random_accessible:          bool,
    independent:                bool,
    disposable:                 bool,
    has_mmco5:                  bool,
    has_redundancy:             bool,
    broken_link_flag:           bool,
    incomplete_au_has_primary:  bool,
    pic_parameter_set_id:       u8,
    frame_num:                  u32,
    pic_order_cnt_lsb:          u32,
    delta_pic_order_cnt_bottom: i32,
    delta_pic_order_cnt:        [i32; 2],
    field_pic_flag:             bool,
    bottom_field_flag:          bool,
    delta:                      u32,
    poc:                        i32,
    recovery_frame_cnt:         u32,
    frame_num_offset:           i64,
    // State of the previous reference picture, for POC type 0.
    ref_pic_has_mmco5:          bool,
    ref_pic_bottom_field_flag:  bool,
    ref_pic_top_field_order_cnt: i32,
    ref_pic_pic_order_cnt_msb:  i32,
    ref_pic_pic_order_cnt_lsb:  i32,
    au:                         Vec<u8>,
    au_length:                  usize,
    incomplete_au:              Vec<u8>,
    incomplete_au_length:       usize,
    au_number:                  u32,
}

/// Parameters and parameter sets of an `avcC` box.
#[derive(Clone, Debug, Default)]
pub struct H264Params {
    pub profile_indication:      u8,
    pub profile_compatibility:   u8,
    pub level_indication:        u8,
    pub length_size_minus_one:   u8,
    pub chroma_format:           u8,
    pub bit_depth_luma_minus8:   u8,
    pub bit_depth_chroma_minus8: u8,
    pub sps_list:                Vec<DcrPsEntry>,
    pub pps_list:                Vec<DcrPsEntry>,
    pub spsext_list:             Vec<DcrPsEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PsType {
    Sps,
    Pps,
    SpsExt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Appendable {
    Possible,
    Duplicated,
    NewDcrRequired,
    NewSampleEntryRequired,
}

#[inline]
fn requires_avcc_extension(profile_indication: u8) -> bool {
    matches!(profile_indication, 100 | 110 | 122 | 144)
}

impl H264Params {
    fn ps_list(&self, ps_type: PsType) -> &Vec<DcrPsEntry> {
        match ps_type {
            PsType::Sps => &self.sps_list,
            PsType::Pps => &self.pps_list,
            PsType::SpsExt => &self.spsext_list,
        }
    }

    fn ps_list_mut(&mut self, ps_type: PsType) -> &mut Vec<DcrPsEntry> {
        match ps_type {
            PsType::Sps => &mut self.sps_list,
            PsType::Pps => &mut self.pps_list,
            PsType::SpsExt => &mut self.spsext_list,
        }
    }

    fn find_ps(&self, ps_type: PsType, ps_id: u8) -> Option<usize> {
        let list = self.ps_list(ps_type);
        for (index, ps) in list.iter().enumerate() {
            let id = match ps_type {
                PsType::Sps => sps_id_of(&ps.nal_unit),
                PsType::Pps => pps_id_of(&ps.nal_unit),
                PsType::SpsExt => continue,
            };
            if let Ok(id) = id {
                if id == ps_id {
                    return Some(index);
                }
            }
        }
        None
    }

    fn check_appendable(&self, ps_type: PsType, ps_data: &[u8]) -> io::Result<Appendable> {
        if ps_data.len() < 2 {
            return Err(ioerr!(InvalidData, "parameter set too short"));
        }
        let nalu_type = ps_data[0] & 0x1f;
        let matches_type = match ps_type {
            PsType::Sps => nalu_type == NALU_TYPE_SPS,
            PsType::Pps => nalu_type == NALU_TYPE_PPS,
            PsType::SpsExt => nalu_type == NALU_TYPE_SPS_EXT,
        };
        if !matches_type {
            return Err(ioerr!(InvalidData, "parameter set type mismatch"));
        }
        if ps_type == PsType::SpsExt && !requires_avcc_extension(self.profile_indication) {
            return Err(ioerr!(InvalidData, "SPS extension without High profile"));
        }
        let ps_list = self.ps_list(ps_type);
        if ps_list.is_empty() {
            return Ok(Appendable::Possible);
        }
        if nalu::same_ps_exists(ps_list, ps_data) {
            return Ok(Appendable::Duplicated);
        }
        let count = nalu::ps_count(ps_list);
        let limit = match ps_type {
            PsType::Sps => 31,
            PsType::Pps | PsType::SpsExt => 255,
        };
        if count >= limit {
            return Ok(Appendable::NewDcrRequired);
        }
        if ps_type == PsType::SpsExt {
            return Ok(Appendable::Possible);
        }
        if ps_type == PsType::Pps {
            let pps_id = pps_id_of(ps_data)?;
            for ps in ps_list {
                if ps.unused {
                    continue;
                }
                if pps_id_of(&ps.nal_unit)? == pps_id {
                    // Same id, different payload.
                    return Ok(Appendable::NewDcrRequired);
                }
            }
            return Ok(Appendable::Possible);
        }
        // SPS
        let mut rbsp = Vec::new();
        let sps = parse_sps_minimally(&mut rbsp, &ps_data[1..])?;
        if sps.profile_idc != self.profile_indication {
            return Ok(Appendable::NewDcrRequired);
        }
        // chroma_format_idc, bit_depth_luma_minus8 and bit_depth_chroma_minus8
        // must be identical in all SPSs of one configuration record.
        if requires_avcc_extension(self.profile_indication)
            && (sps.chroma_format_idc != self.chroma_format
                || sps.bit_depth_luma_minus8 != self.bit_depth_luma_minus8
                || sps.bit_depth_chroma_minus8 != self.bit_depth_chroma_minus8)
        {
            return Ok(Appendable::NewDcrRequired);
        }
        for (index, ps) in ps_list.iter().enumerate() {
            if ps.unused {
                continue;
            }
            if sps_id_of(&ps.nal_unit)? == sps.seq_parameter_set_id {
                // Same id, different payload.
                return Ok(Appendable::NewDcrRequired);
            }
            if index == 0 {
                let first_sps = parse_sps_minimally(&mut rbsp, &ps.nal_unit[1..])?;
                if sps.cropped_width != first_sps.cropped_width
                    || sps.cropped_height != first_sps.cropped_height
                {
                    return Ok(Appendable::NewSampleEntryRequired);
                }
            }
        }
        Ok(Appendable::Possible)
    }

    /// Insert a parameter set, keeping the list in ascending id order.
    /// An `unused` entry with the same id is replaced and re-activated.
    pub fn append_parameter_set(&mut self, ps_type: PsType, ps_data: &[u8]) -> io::Result<()> {
        if ps_data.len() < 2 {
            return Err(ioerr!(InvalidData, "parameter set too short"));
        }
        if ps_type == PsType::SpsExt {
            if !requires_avcc_extension(self.profile_indication) {
                return Ok(());
            }
            self.spsext_list.push(DcrPsEntry::new(ps_data));
            return Ok(());
        }
        let ps_id = match ps_type {
            PsType::Sps => sps_id_of(ps_data)?,
            PsType::Pps => pps_id_of(ps_data)?,
            PsType::SpsExt => unreachable!(),
        };
        match self.find_ps(ps_type, ps_id) {
            Some(index) => {
                let ps = &mut self.ps_list_mut(ps_type)[index];
                if !ps.unused {
                    return Err(ioerr!(InvalidData, "duplicate active parameter set"));
                }
                // Reuse the slot: replacement re-activates the entry.
                ps.unused = false;
                ps.nal_unit = ps_data.to_vec();
            },
            None => {
                let entry = DcrPsEntry::new(ps_data);
                let list = self.ps_list_mut(ps_type);
                // Ascending id order; ids are unique within the list.
                let id_of = |nal_unit: &[u8]| match ps_type {
                    PsType::Sps => sps_id_of(nal_unit).unwrap_or(u8::max_value()),
                    _ => pps_id_of(nal_unit).unwrap_or(u8::max_value()),
                };
                let at = list
                    .iter()
                    .position(|ps| id_of(&ps.nal_unit) > ps_id)
                    .unwrap_or(list.len());
                list.insert(at, entry);
            },
        }
        if ps_type == PsType::Sps {
            // Update the configuration fields from this SPS.
            let mut rbsp = Vec::new();
            let sps = parse_sps_minimally(&mut rbsp, &ps_data[1..])?;
            if nalu::ps_count(&self.sps_list) == 1 {
                self.profile_compatibility = 0xff;
            }
            self.profile_indication = sps.profile_idc;
            self.profile_compatibility &= sps.constraint_set_flags;
            self.level_indication = self.level_indication.max(sps.level_idc);
            self.chroma_format = sps.chroma_format_idc;
            self.bit_depth_luma_minus8 = sps.bit_depth_luma_minus8;
            self.bit_depth_chroma_minus8 = sps.bit_depth_chroma_minus8;
        }
        Ok(())
    }
}

/// Serialize an `avcC` box from accumulated parameters.
pub fn create_h264_specific_info(param: &H264Params) -> io::Result<Vec<u8>> {
    if !matches!(param.length_size_minus_one, 0 | 1 | 3) {
        return Err(ioerr!(InvalidInput, "invalid NALU length size"));
    }
    // SPS and PPS are mandatory.
    if nalu::ps_count(&param.sps_list) == 0 || nalu::ps_count(&param.pps_list) == 0 {
        return Err(ioerr!(InvalidInput, "no active SPS or PPS"));
    }
    let mut bs = Bs::new();
    bs.put_be32(0); // box size, patched below
    bs.put_bytes(b"avcC");
    bs.put_byte(1); // configurationVersion
    bs.put_byte(param.profile_indication);
    bs.put_byte(param.profile_compatibility);
    bs.put_byte(param.level_indication);
    bs.put_byte(param.length_size_minus_one | 0xfc);
    let put_ps_list = |bs: &mut Bs, list: &[DcrPsEntry], max_count: usize| {
        for ps in list.iter().filter(|ps| !ps.unused).take(max_count) {
            bs.put_be16(ps.nal_unit.len() as u16);
            bs.put_bytes(&ps.nal_unit);
        }
    };
    let sps_count = nalu::ps_count(&param.sps_list).min(31);
    bs.put_byte(sps_count as u8 | 0xe0);
    put_ps_list(&mut bs, &param.sps_list, 31);
    let pps_count = nalu::ps_count(&param.pps_list).min(255);
    bs.put_byte(pps_count as u8);
    put_ps_list(&mut bs, &param.pps_list, 255);
    if requires_avcc_extension(param.profile_indication) {
        bs.put_byte(param.chroma_format | 0xfc);
        bs.put_byte(param.bit_depth_luma_minus8 | 0xf8);
        bs.put_byte(param.bit_depth_chroma_minus8 | 0xf8);
        let spsext_count = nalu::ps_count(&param.spsext_list).min(255);
        bs.put_byte(spsext_count as u8);
        put_ps_list(&mut bs, &param.spsext_list, 255);
    }
    bs.status()?;
    let mut data = bs
        .export_data()
        .ok_or_else(|| ioerr!(Other, "empty avcC payload"))?;
    let size = data.len() as u32;
    data[..4].copy_from_slice(&size.to_be_bytes());
    Ok(data)
}

/// Recover `H264Params` from a serialized `avcC` box.
pub fn parse_h264_specific_info(data: &[u8]) -> io::Result<H264Params> {
    if data.len() < 8 + 7 || &data[4..8] != b"avcC" {
        return Err(ioerr!(InvalidData, "not an avcC box"));
    }
    let mut bs = Bs::new();
    bs.import_data(&data[8..])?;
    if bs.get_byte() != 1 {
        return Err(ioerr!(InvalidData, "unsupported avcC configurationVersion"));
    }
    let mut param = H264Params::default();
    param.profile_indication = bs.get_byte();
    param.profile_compatibility = bs.get_byte();
    param.level_indication = bs.get_byte();
    param.length_size_minus_one = bs.get_byte() & 0x03;
    let num_sps = bs.get_byte() & 0x1f;
    for _ in 0..num_sps {
        let length = bs.get_be16() as usize;
        param.sps_list.push(DcrPsEntry {
            nal_unit: bs.get_bytes(length),
            unused:   false,
        });
    }
    let num_pps = bs.get_byte();
    for _ in 0..num_pps {
        let length = bs.get_be16() as usize;
        param.pps_list.push(DcrPsEntry {
            nal_unit: bs.get_bytes(length),
            unused:   false,
        });
    }
    if requires_avcc_extension(param.profile_indication) && bs.pos() < data.len() - 8 {
        param.chroma_format = bs.get_byte() & 0x03;
        param.bit_depth_luma_minus8 = bs.get_byte() & 0x07;
        param.bit_depth_chroma_minus8 = bs.get_byte() & 0x07;
        let num_spsext = bs.get_byte();
        for _ in 0..num_spsext {
            let length = bs.get_be16() as usize;
            param.spsext_list.push(DcrPsEntry {
                nal_unit: bs.get_bytes(length),
                unused:   false,
            });
        }
    }
    bs.status()?;
    Ok(param)
}

// seq_parameter_set_id lives a fixed 24 bits into the RBSP.
fn sps_id_of(ps_ebsp: &[u8]) -> io::Result<u8> {
    let mut rbsp = Vec::new();
    let take = ps_ebsp.len().min(7);
    let mut bits = nalu::import_rbsp_from_ebsp(&mut rbsp, &ps_ebsp[1..take])?;
    bits.get(24); // profile_idc, constraint_set_flags, level_idc
    let id = bits.get_ue();
    if id > 31 || bits.bs.error() {
        return Err(ioerr!(InvalidData, "bad seq_parameter_set_id"));
    }
    Ok(id as u8)
}

fn pps_id_of(ps_ebsp: &[u8]) -> io::Result<u8> {
    let mut rbsp = Vec::new();
    let take = ps_ebsp.len().min(5);
    let mut bits = nalu::import_rbsp_from_ebsp(&mut rbsp, &ps_ebsp[1..take])?;
    let id = bits.get_ue();
    if id > 255 || bits.bs.error() {
        return Err(ioerr!(InvalidData, "bad pic_parameter_set_id"));
    }
    Ok(id as u8)
}

fn parse_scaling_list(bits: &mut Bits, size_of_scaling_list: usize) -> io::Result<()> {
    let mut next_scale = 8i64;
    for _ in 0..size_of_scaling_list {
        let delta_scale = bits.get_se();
        if delta_scale < -128 || delta_scale > 127 {
            return Err(ioerr!(InvalidData, "bad delta_scale"));
        }
        next_scale = (next_scale + delta_scale + 256) % 256;
        if next_scale == 0 {
            break;
        }
    }
    Ok(())
}

fn parse_hrd_parameters(bits: &mut Bits, hrd: &mut Hrd) -> io::Result<()> {
    let cpb_cnt_minus1 = bits.get_ue();
    if cpb_cnt_minus1 > 31 {
        return Err(ioerr!(InvalidData, "bad cpb_cnt_minus1"));
    }
    bits.get(4); // bit_rate_scale
    bits.get(4); // cpb_size_scale
    for _ in 0..=cpb_cnt_minus1 {
        bits.get_ue(); // bit_rate_value_minus1
        bits.get_ue(); // cpb_size_value_minus1
        bits.get(1); // cbr_flag
    }
    bits.get(5); // initial_cpb_removal_delay_length_minus1
    hrd.cpb_removal_delay_length = bits.get(5) as u32 + 1;
    hrd.dpb_output_delay_length = bits.get(5) as u32 + 1;
    bits.get(5); // time_offset_length
    Ok(())
}

// The prefix of seq_parameter_set_data() shared with the appendability
// checks: up to the bit depths, without the frame structure fields.
fn parse_sps_minimally(rbsp: &mut Vec<u8>, ebsp: &[u8]) -> io::Result<Sps> {
    let mut bits = nalu::import_rbsp_from_ebsp(rbsp, ebsp)?;
    let sps = parse_sps_prefix(&mut bits)?;
    Ok(sps)
}

fn parse_sps_prefix(bits: &mut Bits) -> io::Result<Sps> {
    let mut sps = Sps::default();
    sps.profile_idc = bits.get(8) as u8;
    sps.constraint_set_flags = bits.get(8) as u8;
    sps.level_idc = bits.get(8) as u8;
    let seq_parameter_set_id = bits.get_ue();
    if seq_parameter_set_id > 31 {
        return Err(ioerr!(InvalidData, "bad seq_parameter_set_id"));
    }
    sps.seq_parameter_set_id = seq_parameter_set_id as u8;
    if matches!(sps.profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138) {
        sps.chroma_format_idc = bits.get_ue() as u8;
        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = bits.get(1) != 0;
        }
        let bit_depth_luma_minus8 = bits.get_ue();
        if bit_depth_luma_minus8 > 6 {
            return Err(ioerr!(InvalidData, "bad bit_depth_luma_minus8"));
        }
        let bit_depth_chroma_minus8 = bits.get_ue();
        if bit_depth_chroma_minus8 > 6 {
            return Err(ioerr!(InvalidData, "bad bit_depth_chroma_minus8"));
        }
        sps.bit_depth_luma_minus8 = bit_depth_luma_minus8 as u8;
        sps.bit_depth_chroma_minus8 = bit_depth_chroma_minus8 as u8;
        bits.get(1); // qpprime_y_zero_transform_bypass_flag
        if bits.get(1) != 0 {
            // seq_scaling_matrix_present_flag
            let num_loops = if sps.chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..num_loops {
                if bits.get(1) != 0 {
                    parse_scaling_list(bits, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    } else {
        sps.chroma_format_idc = 1;
        sps.separate_colour_plane_flag = false;
        sps.bit_depth_luma_minus8 = 0;
        sps.bit_depth_chroma_minus8 = 0;
    }
    sps.chroma_array_type = if sps.separate_colour_plane_flag {
        0
    } else {
        sps.chroma_format_idc
    };
    let log2_max_frame_num_minus4 = bits.get_ue();
    if log2_max_frame_num_minus4 > 12 {
        return Err(ioerr!(InvalidData, "bad log2_max_frame_num_minus4"));
    }
    sps.log2_max_frame_num = log2_max_frame_num_minus4 as u32 + 4;
    sps.max_frame_num = 1 << sps.log2_max_frame_num;
    let pic_order_cnt_type = bits.get_ue();
    if pic_order_cnt_type > 2 {
        return Err(ioerr!(InvalidData, "bad pic_order_cnt_type"));
    }
    sps.pic_order_cnt_type = pic_order_cnt_type as u8;
    match sps.pic_order_cnt_type {
        0 => {
            let log2_max_pic_order_cnt_lsb_minus4 = bits.get_ue();
            if log2_max_pic_order_cnt_lsb_minus4 > 12 {
                return Err(ioerr!(InvalidData, "bad log2_max_pic_order_cnt_lsb_minus4"));
            }
            sps.log2_max_pic_order_cnt_lsb = log2_max_pic_order_cnt_lsb_minus4 as u32 + 4;
            sps.max_pic_order_cnt_lsb = 1 << sps.log2_max_pic_order_cnt_lsb;
        },
        1 => {
            sps.delta_pic_order_always_zero_flag = bits.get(1) != 0;
            let max_value = (1i64 << 31) - 1;
            let min_value = -(1i64 << 31) + 1;
            let offset_for_non_ref_pic = bits.get_se();
            if offset_for_non_ref_pic < min_value || offset_for_non_ref_pic > max_value {
                return Err(ioerr!(InvalidData, "bad offset_for_non_ref_pic"));
            }
            sps.offset_for_non_ref_pic = offset_for_non_ref_pic as i32;
            let offset_for_top_to_bottom_field = bits.get_se();
            if offset_for_top_to_bottom_field < min_value
                || offset_for_top_to_bottom_field > max_value
            {
                return Err(ioerr!(InvalidData, "bad offset_for_top_to_bottom_field"));
            }
            sps.offset_for_top_to_bottom_field = offset_for_top_to_bottom_field as i32;
            let num_ref_frames_in_pic_order_cnt_cycle = bits.get_ue();
            if num_ref_frames_in_pic_order_cnt_cycle > 255 {
                return Err(ioerr!(InvalidData, "bad num_ref_frames_in_pic_order_cnt_cycle"));
            }
            sps.num_ref_frames_in_pic_order_cnt_cycle =
                num_ref_frames_in_pic_order_cnt_cycle as u8;
            sps.expected_delta_per_pic_order_cnt_cycle = 0;
            sps.offset_for_ref_frame = Vec::with_capacity(num_ref_frames_in_pic_order_cnt_cycle as usize);
            for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
                let offset_for_ref_frame = bits.get_se();
                if offset_for_ref_frame < min_value || offset_for_ref_frame > max_value {
                    return Err(ioerr!(InvalidData, "bad offset_for_ref_frame"));
                }
                sps.offset_for_ref_frame.push(offset_for_ref_frame as i32);
                sps.expected_delta_per_pic_order_cnt_cycle += offset_for_ref_frame;
            }
        },
        _ => {},
    }
    sps.max_num_ref_frames = bits.get_ue() as u32;
    bits.get(1); // gaps_in_frame_num_value_allowed_flag
    let pic_width_in_mbs_minus1 = bits.get_ue();
    let pic_height_in_map_units_minus1 = bits.get_ue();
    sps.frame_mbs_only_flag = bits.get(1) != 0;
    if !sps.frame_mbs_only_flag {
        bits.get(1); // mb_adaptive_frame_field_flag
    }
    bits.get(1); // direct_8x8_inference_flag
    let pic_width_in_mbs = pic_width_in_mbs_minus1 + 1;
    let pic_height_in_map_units = pic_height_in_map_units_minus1 + 1;
    sps.pic_size_in_map_units = pic_width_in_mbs * pic_height_in_map_units;
    sps.cropped_width = (pic_width_in_mbs * 16) as u32;
    sps.cropped_height =
        ((2 - sps.frame_mbs_only_flag as u64) * pic_height_in_map_units * 16) as u32;
    if bits.get(1) != 0 {
        // frame_cropping_flag
        let (crop_unit_x, crop_unit_y) = if sps.chroma_array_type == 0 {
            (1u64, 2 - sps.frame_mbs_only_flag as u64)
        } else {
            const SUB_WIDTH_C: [u64; 4] = [0, 2, 2, 1];
            const SUB_HEIGHT_C: [u64; 4] = [0, 2, 1, 1];
            (
                SUB_WIDTH_C[sps.chroma_format_idc as usize],
                SUB_HEIGHT_C[sps.chroma_format_idc as usize]
                    * (2 - sps.frame_mbs_only_flag as u64),
            )
        };
        let frame_crop_left_offset = bits.get_ue();
        let frame_crop_right_offset = bits.get_ue();
        let frame_crop_top_offset = bits.get_ue();
        let frame_crop_bottom_offset = bits.get_ue();
        sps.cropped_width -=
            ((frame_crop_left_offset + frame_crop_right_offset) * crop_unit_x) as u32;
        sps.cropped_height -=
            ((frame_crop_top_offset + frame_crop_bottom_offset) * crop_unit_y) as u32;
    }
    Ok(sps)
}

fn parse_sps_vui(bits: &mut Bits, sps: &mut Sps) -> io::Result<()> {
    if bits.get(1) != 0 {
        // vui_parameters()
        if bits.get(1) != 0 {
            // aspect_ratio_info_present_flag
            let aspect_ratio_idc = bits.get(8);
            if aspect_ratio_idc == 255 {
                // Extended_SAR
                sps.vui.sar_width = bits.get(16) as u16;
                sps.vui.sar_height = bits.get(16) as u16;
            } else {
                const PRE_DEFINED_SAR: [(u16, u16); 17] = [
                    (0, 0),
                    (1, 1),
                    (12, 11),
                    (10, 11),
                    (16, 11),
                    (40, 33),
                    (24, 11),
                    (20, 11),
                    (32, 11),
                    (80, 33),
                    (18, 11),
                    (15, 11),
                    (64, 33),
                    (160, 99),
                    (4, 3),
                    (3, 2),
                    (2, 1),
                ];
                if let Some(&(w, h)) = PRE_DEFINED_SAR.get(aspect_ratio_idc as usize) {
                    sps.vui.sar_width = w;
                    sps.vui.sar_height = h;
                } else {
                    // Unknown aspect_ratio_idc; unspecified behavior.
                    sps.vui.sar_width = 0;
                    sps.vui.sar_height = 0;
                }
            }
        }
        if bits.get(1) != 0 {
            bits.get(1); // overscan_appropriate_flag
        }
        if bits.get(1) != 0 {
            // video_signal_type_present_flag
            bits.get(3); // video_format
            sps.vui.video_full_range_flag = bits.get(1) != 0;
            if bits.get(1) != 0 {
                sps.vui.colour_primaries = bits.get(8) as u16;
                sps.vui.transfer_characteristics = bits.get(8) as u16;
                sps.vui.matrix_coefficients = bits.get(8) as u16;
            }
        }
        if bits.get(1) != 0 {
            // chroma_loc_info_present_flag
            bits.get_ue();
            bits.get_ue();
        }
        if bits.get(1) != 0 {
            // timing_info_present_flag
            sps.vui.num_units_in_tick = bits.get(32) as u32;
            sps.vui.time_scale = bits.get(32) as u32;
            sps.vui.fixed_frame_rate_flag = bits.get(1) != 0;
        }
        let nal_hrd_parameters_present = bits.get(1) != 0;
        if nal_hrd_parameters_present {
            parse_hrd_parameters(bits, &mut sps.vui.hrd)?;
        }
        let vcl_hrd_parameters_present = bits.get(1) != 0;
        if vcl_hrd_parameters_present {
            parse_hrd_parameters(bits, &mut sps.vui.hrd)?;
        }
        if nal_hrd_parameters_present || vcl_hrd_parameters_present {
            sps.vui.hrd.present = true;
            sps.vui.hrd.cpb_dpb_delays_present = true;
            bits.get(1); // low_delay_hrd_flag
        }
        sps.vui.pic_struct_present_flag = bits.get(1) != 0;
        if bits.get(1) != 0 {
            // bitstream_restriction_flag
            bits.get(1); // motion_vectors_over_pic_boundaries_flag
            bits.get_ue(); // max_bytes_per_pic_denom
            bits.get_ue(); // max_bits_per_mb_denom
            bits.get_ue(); // log2_max_mv_length_horizontal
            bits.get_ue(); // log2_max_mv_length_vertical
            bits.get_ue(); // max_num_reorder_frames
            bits.get_ue(); // max_dec_frame_buffering
        }
    } else {
        sps.vui.video_full_range_flag = false;
        sps.vui.num_units_in_tick = 1;
        sps.vui.time_scale = 50;
        sps.vui.fixed_frame_rate_flag = false;
    }
    // rbsp_trailing_bits()
    if bits.get(1) == 0 {
        return Err(ioerr!(InvalidData, "missing rbsp_stop_one_bit"));
    }
    bits.bs.status()
}

struct H264Info {
    nalu_header:     NaluHeader,
    prev_nalu_type:  u8,
    ebsp_head_pos:   u64,
    sps_list:        Vec<Sps>,
    pps_list:        Vec<Pps>,
    slice_list:      Vec<SliceInfo>,
    sps:             Sps,
    pps:             Pps,
    sei:             Sei,
    slice:           SliceInfo,
    picture:         PictureInfo,
    avcc_param:      H264Params,
    avcc_param_next: H264Params,
    avcc_pending:    bool,
    rbsp:            Vec<u8>,
}

impl H264Info {
    fn new() -> H264Info {
        let mut info = H264Info {
            nalu_header: NaluHeader::default(),
            prev_nalu_type: 0,
            ebsp_head_pos: 0,
            sps_list: Vec::new(),
            pps_list: Vec::new(),
            slice_list: Vec::new(),
            sps: Sps::default(),
            pps: Pps::default(),
            sei: Sei::default(),
            slice: SliceInfo::default(),
            picture: PictureInfo::default(),
            avcc_param: H264Params::default(),
            avcc_param_next: H264Params::default(),
            avcc_pending: false,
            rbsp: Vec::new(),
        };
        info.avcc_param.length_size_minus_one = (H264_DEFAULT_NALU_LENGTH_SIZE - 1) as u8;
        info.avcc_param_next.length_size_minus_one = (H264_DEFAULT_NALU_LENGTH_SIZE - 1) as u8;
        info.picture.au = vec![0u8; H264_DEFAULT_BUFFER_SIZE];
        info.picture.incomplete_au = vec![0u8; H264_DEFAULT_BUFFER_SIZE];
        info
    }

    fn stored_sps(&mut self, sps_id: u8) -> &mut Sps {
        if let Some(index) = self
            .sps_list
            .iter()
            .position(|sps| sps.seq_parameter_set_id == sps_id)
        {
            return &mut self.sps_list[index];
        }
        let mut sps = Sps::default();
        sps.seq_parameter_set_id = sps_id;
        self.sps_list.push(sps);
        self.sps_list.last_mut().expect("just pushed")
    }

    fn stored_pps(&mut self, pps_id: u8) -> &mut Pps {
        if let Some(index) = self
            .pps_list
            .iter()
            .position(|pps| pps.pic_parameter_set_id == pps_id)
        {
            return &mut self.pps_list[index];
        }
        let mut pps = Pps::default();
        pps.pic_parameter_set_id = pps_id;
        self.pps_list.push(pps);
        self.pps_list.last_mut().expect("just pushed")
    }

    fn stored_slice(&mut self, slice_id: u64) -> &mut SliceInfo {
        if let Some(index) = self
            .slice_list
            .iter()
            .position(|slice| slice.slice_id == slice_id)
        {
            return &mut self.slice_list[index];
        }
        let mut slice = SliceInfo::default();
        slice.slice_id = slice_id;
        self.slice_list.push(slice);
        self.slice_list.last_mut().expect("just pushed")
    }

    fn parse_sps(&mut self, ebsp: &[u8]) -> io::Result<()> {
        let mut rbsp = std::mem::replace(&mut self.rbsp, Vec::new());
        let result = (|| {
            let mut bits = nalu::import_rbsp_from_ebsp(&mut rbsp, ebsp)?;
            let mut sps = parse_sps_prefix(&mut bits)?;
            parse_sps_vui(&mut bits, &mut sps)?;
            sps.present = true;
            *self.stored_sps(sps.seq_parameter_set_id) = sps.clone();
            self.sps = sps;
            Ok(())
        })();
        self.rbsp = rbsp;
        result
    }

    fn parse_pps(&mut self, ebsp: &[u8]) -> io::Result<()> {
        let mut rbsp = std::mem::replace(&mut self.rbsp, Vec::new());
        let result = (|| {
            let mut bits = nalu::import_rbsp_from_ebsp(&mut rbsp, ebsp)?;
            let mut pps = Pps::default();
            let pic_parameter_set_id = bits.get_ue();
            if pic_parameter_set_id > 255 {
                return Err(ioerr!(InvalidData, "bad pic_parameter_set_id"));
            }
            pps.pic_parameter_set_id = pic_parameter_set_id as u8;
            let seq_parameter_set_id = bits.get_ue();
            if seq_parameter_set_id > 31 {
                return Err(ioerr!(InvalidData, "bad seq_parameter_set_id"));
            }
            pps.seq_parameter_set_id = seq_parameter_set_id as u8;
            let sps = self.stored_sps(pps.seq_parameter_set_id).clone();
            pps.entropy_coding_mode_flag = bits.get(1) != 0;
            pps.bottom_field_pic_order_in_frame_present_flag = bits.get(1) != 0;
            let num_slice_groups_minus1 = bits.get_ue();
            if num_slice_groups_minus1 > 7 {
                return Err(ioerr!(InvalidData, "bad num_slice_groups_minus1"));
            }
            pps.num_slice_groups_minus1 = num_slice_groups_minus1 as u8;
            if num_slice_groups_minus1 != 0 {
                let slice_group_map_type = bits.get_ue();
                if slice_group_map_type > 6 {
                    return Err(ioerr!(InvalidData, "bad slice_group_map_type"));
                }
                pps.slice_group_map_type = slice_group_map_type as u8;
                match slice_group_map_type {
                    0 => {
                        for _ in 0..=num_slice_groups_minus1 {
                            bits.get_ue(); // run_length_minus1
                        }
                    },
                    2 => {
                        for _ in 0..num_slice_groups_minus1 {
                            bits.get_ue(); // top_left
                            bits.get_ue(); // bottom_right
                        }
                    },
                    3 | 4 | 5 => {
                        bits.get(1); // slice_group_change_direction_flag
                        let slice_group_change_rate_minus1 = bits.get_ue();
                        if slice_group_change_rate_minus1 > sps.pic_size_in_map_units.saturating_sub(1)
                        {
                            return Err(ioerr!(InvalidData, "bad slice_group_change_rate_minus1"));
                        }
                        pps.slice_group_change_rate = slice_group_change_rate_minus1 + 1;
                    },
                    6 => {
                        let pic_size_in_map_units_minus1 = bits.get_ue();
                        let length = ceil_log2(num_slice_groups_minus1 + 1);
                        for _ in 0..=pic_size_in_map_units_minus1 {
                            if bits.get(length) > num_slice_groups_minus1 {
                                return Err(ioerr!(InvalidData, "bad slice_group_id"));
                            }
                        }
                    },
                    _ => {},
                }
            }
            pps.num_ref_idx_l0_default_active_minus1 = bits.get_ue();
            pps.num_ref_idx_l1_default_active_minus1 = bits.get_ue();
            pps.weighted_pred_flag = bits.get(1) != 0;
            pps.weighted_bipred_idc = bits.get(2) as u8;
            bits.get_se(); // pic_init_qp_minus26
            bits.get_se(); // pic_init_qs_minus26
            bits.get_se(); // chroma_qp_index_offset
            pps.deblocking_filter_control_present_flag = bits.get(1) != 0;
            bits.get(1); // constrained_intra_pred_flag
            pps.redundant_pic_cnt_present_flag = bits.get(1) != 0;
            if bits.more_rbsp_data() {
                let transform_8x8_mode_flag = bits.get(1) != 0;
                if bits.get(1) != 0 {
                    // pic_scaling_matrix_present_flag
                    let num_loops = 6
                        + (if sps.chroma_format_idc != 3 { 2 } else { 6 })
                            * transform_8x8_mode_flag as usize;
                    for i in 0..num_loops {
                        if bits.get(1) != 0 {
                            parse_scaling_list(&mut bits, if i < 6 { 16 } else { 64 })?;
                        }
                    }
                }
                bits.get_se(); // second_chroma_qp_index_offset
            }
            if bits.get(1) == 0 {
                return Err(ioerr!(InvalidData, "missing rbsp_stop_one_bit"));
            }
            bits.bs.status()?;
            pps.present = true;
            *self.stored_pps(pps.pic_parameter_set_id) = pps;
            self.sps = sps;
            self.pps = pps;
            Ok(())
        })();
        self.rbsp = rbsp;
        result
    }

    fn parse_sei(&mut self, ebsp: &[u8]) -> io::Result<()> {
        let mut rbsp = std::mem::replace(&mut self.rbsp, Vec::new());
        let result = (|| {
            let mut bits = nalu::import_rbsp_from_ebsp(&mut rbsp, ebsp)?;
            let mut rbsp_pos: usize = 0;
            loop {
                // sei_message()
                let mut payload_type: u32 = 0;
                loop {
                    let temp = bits.get(8) as u32;
                    payload_type += temp;
                    rbsp_pos += 1;
                    if temp != 0xff {
                        break;
                    }
                }
                let mut payload_size: u32 = 0;
                loop {
                    let temp = bits.get(8) as u32;
                    payload_size += temp;
                    rbsp_pos += 1;
                    if temp != 0xff {
                        break;
                    }
                }
                let payload_start = bits.bit_position();
                match payload_type {
                    1 => {
                        // pic_timing
                        self.sei.pic_timing.present = true;
                        if self.sps.vui.hrd.cpb_dpb_delays_present {
                            bits.get(self.sps.vui.hrd.cpb_removal_delay_length);
                            bits.get(self.sps.vui.hrd.dpb_output_delay_length);
                        }
                        if self.sps.vui.pic_struct_present_flag {
                            self.sei.pic_timing.pic_struct = bits.get(4) as u8;
                        }
                    },
                    3 => {
                        // filler_payload is forbidden in the AVC file format.
                        return Err(ioerr!(InvalidData, "filler SEI in elementary stream"));
                    },
                    6 => {
                        // recovery_point
                        self.sei.recovery_point.present = true;
                        self.sei.recovery_point.random_accessible = true;
                        self.sei.recovery_point.recovery_frame_cnt = bits.get_ue() as u32;
                        bits.get(1); // exact_match_flag
                        self.sei.recovery_point.broken_link_flag = bits.get(1) != 0;
                        bits.get(2); // changing_slice_group_idc
                    },
                    _ => {},
                }
                // Skip to the end of the payload whatever was consumed.
                let payload_end = payload_start + payload_size as u64 * 8;
                let at = bits.bit_position();
                if payload_end > at {
                    skip_bits(&mut bits, (payload_end - at) as u32);
                }
                bits.get_align();
                rbsp_pos += payload_size as usize;
                // All SEI messages are byte-aligned at their end, so the
                // next byte is either another message or trailing bits.
                if rbsp_pos >= rbsp.len() || rbsp[rbsp_pos] == 0x80 || bits.bs.error() {
                    break;
                }
            }
            bits.bs.status()
        })();
        self.rbsp = rbsp;
        result
    }

    fn parse_slice_header(&mut self, nalu_header: &NaluHeader, bits: &mut Bits) -> io::Result<()> {
        let mut slice = SliceInfo::default();
        // slice_header()
        bits.get_ue(); // first_mb_in_slice
        let mut slice_type = bits.get_ue();
        if slice_type > 9 {
            return Err(ioerr!(InvalidData, "bad slice_type"));
        }
        if slice_type > 4 {
            slice_type -= 5;
        }
        let slice_type = slice_type as u8;
        slice.r#type = slice_type;
        let pic_parameter_set_id = bits.get_ue();
        if pic_parameter_set_id > 255 {
            return Err(ioerr!(InvalidData, "bad pic_parameter_set_id"));
        }
        slice.pic_parameter_set_id = pic_parameter_set_id as u8;
        let pps = *self.stored_pps(slice.pic_parameter_set_id);
        if !pps.present {
            return Err(ioerr!(InvalidData, "slice refers to an unknown PPS"));
        }
        let sps = self.stored_sps(pps.seq_parameter_set_id).clone();
        if !sps.present {
            return Err(ioerr!(InvalidData, "slice refers to an unknown SPS"));
        }
        slice.seq_parameter_set_id = pps.seq_parameter_set_id;
        slice.nal_ref_idc = nalu_header.nal_ref_idc;
        slice.idr_pic_flag = nalu_header.nal_unit_type == NALU_TYPE_SLICE_IDR;
        slice.pic_order_cnt_type = sps.pic_order_cnt_type;
        if (slice.idr_pic_flag || sps.max_num_ref_frames == 0)
            && slice_type != 2
            && slice_type != 4
        {
            return Err(ioerr!(InvalidData, "IDR picture with a non-intra slice"));
        }
        if sps.separate_colour_plane_flag {
            bits.get(2); // colour_plane_id
        }
        let frame_num = bits.get(sps.log2_max_frame_num) as u32;
        if frame_num >= (1 << sps.log2_max_frame_num) || (slice.idr_pic_flag && frame_num != 0) {
            return Err(ioerr!(InvalidData, "bad frame_num"));
        }
        slice.frame_num = frame_num;
        if !sps.frame_mbs_only_flag {
            slice.field_pic_flag = bits.get(1) != 0;
            if slice.field_pic_flag {
                slice.bottom_field_flag = bits.get(1) != 0;
            }
        }
        if slice.idr_pic_flag {
            let idr_pic_id = bits.get_ue();
            if idr_pic_id > 65535 {
                return Err(ioerr!(InvalidData, "bad idr_pic_id"));
            }
            slice.idr_pic_id = idr_pic_id as u32;
        }
        if sps.pic_order_cnt_type == 0 {
            let pic_order_cnt_lsb = bits.get(sps.log2_max_pic_order_cnt_lsb);
            if pic_order_cnt_lsb >= sps.max_pic_order_cnt_lsb as u64 {
                return Err(ioerr!(InvalidData, "bad pic_order_cnt_lsb"));
            }
            slice.pic_order_cnt_lsb = pic_order_cnt_lsb as u32;
            if pps.bottom_field_pic_order_in_frame_present_flag && !slice.field_pic_flag {
                slice.delta_pic_order_cnt_bottom = bits.get_se() as i32;
            }
        } else if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            slice.delta_pic_order_cnt[0] = bits.get_se() as i32;
            if pps.bottom_field_pic_order_in_frame_present_flag && !slice.field_pic_flag {
                slice.delta_pic_order_cnt[1] = bits.get_se() as i32;
            }
        }
        if pps.redundant_pic_cnt_present_flag {
            let redundant_pic_cnt = bits.get_ue();
            if redundant_pic_cnt > 127 {
                return Err(ioerr!(InvalidData, "bad redundant_pic_cnt"));
            }
            slice.has_redundancy = redundant_pic_cnt != 0;
        }
        if slice_type == SLICE_TYPE_B {
            bits.get(1); // direct_spatial_mv_pred_flag
        }
        let mut num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
        let mut num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
        if matches!(slice_type, SLICE_TYPE_P | SLICE_TYPE_SP | SLICE_TYPE_B) {
            if bits.get(1) != 0 {
                // num_ref_idx_active_override_flag
                num_ref_idx_l0_active_minus1 = bits.get_ue();
                if num_ref_idx_l0_active_minus1 > 31 {
                    return Err(ioerr!(InvalidData, "bad num_ref_idx_l0_active_minus1"));
                }
                if slice_type == SLICE_TYPE_B {
                    num_ref_idx_l1_active_minus1 = bits.get_ue();
                    if num_ref_idx_l1_active_minus1 > 31 {
                        return Err(ioerr!(InvalidData, "bad num_ref_idx_l1_active_minus1"));
                    }
                }
            }
        }
        // ref_pic_list_modification(); MVC is unsupported, so the MVC
        // form never appears here.
        if matches!(slice_type, SLICE_TYPE_P | SLICE_TYPE_B | SLICE_TYPE_SP) {
            let lists = 1 + (slice_type == SLICE_TYPE_B) as usize;
            for _ in 0..lists {
                if bits.get(1) != 0 {
                    loop {
                        let modification_of_pic_nums_idc = bits.get_ue();
                        if modification_of_pic_nums_idc == 3 {
                            break;
                        }
                        bits.get_ue(); // abs_diff_pic_num_minus1 or long_term_pic_num
                        if bits.bs.error() {
                            return Err(ioerr!(InvalidData, "broken ref_pic_list_modification"));
                        }
                    }
                }
            }
        }
        if (pps.weighted_pred_flag && matches!(slice_type, SLICE_TYPE_P | SLICE_TYPE_SP))
            || (pps.weighted_bipred_idc == 1 && slice_type == SLICE_TYPE_B)
        {
            // pred_weight_table()
            bits.get_ue(); // luma_log2_weight_denom
            if sps.chroma_array_type != 0 {
                bits.get_ue(); // chroma_log2_weight_denom
            }
            for _ in 0..=num_ref_idx_l0_active_minus1 {
                if bits.get(1) != 0 {
                    bits.get_se();
                    bits.get_se();
                }
                if sps.chroma_array_type != 0 && bits.get(1) != 0 {
                    for _ in 0..2 {
                        bits.get_se();
                        bits.get_se();
                    }
                }
            }
            if slice_type == SLICE_TYPE_B {
                for _ in 0..=num_ref_idx_l1_active_minus1 {
                    if bits.get(1) != 0 {
                        bits.get_se();
                        bits.get_se();
                    }
                    if sps.chroma_array_type != 0 && bits.get(1) != 0 {
                        for _ in 0..2 {
                            bits.get_se();
                            bits.get_se();
                        }
                    }
                }
            }
        }
        if nalu_header.nal_ref_idc != 0 {
            // dec_ref_pic_marking()
            if slice.idr_pic_flag {
                bits.get(1); // no_output_of_prior_pics_flag
                bits.get(1); // long_term_reference_flag
            } else if bits.get(1) != 0 {
                // adaptive_ref_pic_marking_mode_flag
                loop {
                    let memory_management_control_operation = bits.get_ue();
                    if memory_management_control_operation == 0 {
                        break;
                    }
                    if memory_management_control_operation == 5 {
                        slice.has_mmco5 = true;
                    } else {
                        bits.get_ue();
                        if memory_management_control_operation == 3 {
                            bits.get_ue();
                        }
                    }
                    if bits.bs.error() {
                        return Err(ioerr!(InvalidData, "broken dec_ref_pic_marking"));
                    }
                }
            }
        }
        // For slice data partition A the slice_id terminates the header;
        // B and C partitions look their slice up by it.
        if nalu_header.nal_unit_type == NALU_TYPE_SLICE_DP_A {
            if pps.entropy_coding_mode_flag
                && slice_type != SLICE_TYPE_I
                && slice_type != SLICE_TYPE_SI
            {
                bits.get_ue(); // cabac_init_idc
            }
            bits.get_se(); // slice_qp_delta
            if slice_type == SLICE_TYPE_SP || slice_type == SLICE_TYPE_SI {
                if slice_type == SLICE_TYPE_SP {
                    bits.get(1); // sp_for_switch_flag
                }
                bits.get_se(); // slice_qs_delta
            }
            if pps.deblocking_filter_control_present_flag && bits.get_ue() != 1 {
                let slice_alpha_c0_offset_div2 = bits.get_se();
                if slice_alpha_c0_offset_div2 < -6 || slice_alpha_c0_offset_div2 > 6 {
                    return Err(ioerr!(InvalidData, "bad slice_alpha_c0_offset_div2"));
                }
                let slice_beta_offset_div2 = bits.get_se();
                if slice_beta_offset_div2 < -6 || slice_beta_offset_div2 > 6 {
                    return Err(ioerr!(InvalidData, "bad slice_beta_offset_div2"));
                }
            }
            if pps.num_slice_groups_minus1 != 0
                && matches!(pps.slice_group_map_type, 3 | 4 | 5)
            {
                let temp =
                    (sps.pic_size_in_map_units - 1) / pps.slice_group_change_rate + 1;
                let slice_group_change_cycle = bits.get(ceil_log2(temp + 1));
                if slice_group_change_cycle > temp {
                    return Err(ioerr!(InvalidData, "bad slice_group_change_cycle"));
                }
            }
            slice.slice_id = bits.get_ue();
            *self.stored_slice(slice.slice_id) = slice;
        }
        bits.bs.status()?;
        self.sps = sps;
        self.pps = pps;
        self.slice = slice;
        Ok(())
    }

    fn parse_slice(&mut self, nalu_header: &NaluHeader, ebsp: &[u8]) -> io::Result<()> {
        let mut rbsp = std::mem::replace(&mut self.rbsp, Vec::new());
        let result = (|| {
            let mut bits = nalu::import_rbsp_from_ebsp(&mut rbsp, ebsp)?;
            if nalu_header.nal_unit_type != NALU_TYPE_SLICE_DP_B
                && nalu_header.nal_unit_type != NALU_TYPE_SLICE_DP_C
            {
                return self.parse_slice_header(nalu_header, &mut bits);
            }
            // slice_data_partition_b/c_layer_rbsp()
            let slice_id = bits.get_ue();
            let mut slice = *self.stored_slice(slice_id);
            let pps = *self.stored_pps(slice.pic_parameter_set_id);
            if !pps.present {
                return Err(ioerr!(InvalidData, "slice partition refers to an unknown PPS"));
            }
            let sps = self.stored_sps(pps.seq_parameter_set_id).clone();
            slice.seq_parameter_set_id = pps.seq_parameter_set_id;
            if sps.separate_colour_plane_flag {
                bits.get(2); // colour_plane_id
            }
            if pps.redundant_pic_cnt_present_flag {
                let redundant_pic_cnt = bits.get_ue();
                if redundant_pic_cnt > 127 {
                    return Err(ioerr!(InvalidData, "bad redundant_pic_cnt"));
                }
                slice.has_redundancy = redundant_pic_cnt != 0;
            }
            bits.bs.status()?;
            *self.stored_slice(slice_id) = slice;
            self.sps = sps;
            self.pps = pps;
            self.slice = slice;
            Ok(())
        })();
        self.rbsp = rbsp;
        result
    }

    fn try_to_append_parameter_set(&mut self, ps_type: PsType, ps_data: &[u8]) -> io::Result<()> {
        let appendable = self.avcc_param.check_appendable(ps_type, ps_data)?;
        let use_next = match appendable {
            Appendable::Duplicated => return Ok(()),
            Appendable::NewDcrRequired | Appendable::NewSampleEntryRequired => {
                self.avcc_pending = true;
                true
            },
            Appendable::Possible => self.avcc_pending,
        };
        match ps_type {
            PsType::Sps => self.parse_sps(&ps_data[1..])?,
            PsType::Pps => self.parse_pps(&ps_data[1..])?,
            PsType::SpsExt => {},
        }
        let param = if use_next {
            &mut self.avcc_param_next
        } else {
            &mut self.avcc_param
        };
        param.append_parameter_set(ps_type, ps_data)
    }

    /// Promote the pending configuration at the first slice after a
    /// change: active entries are retired, new ones take their ids.
    fn move_pending_avcc_param(&mut self) -> io::Result<()> {
        if !self.avcc_pending {
            return Ok(());
        }
        for ps in self
            .avcc_param
            .sps_list
            .iter_mut()
            .chain(self.avcc_param.pps_list.iter_mut())
            .chain(self.avcc_param.spsext_list.iter_mut())
        {
            ps.unused = true;
        }
        for &ps_type in &[PsType::Sps, PsType::Pps] {
            let src: Vec<DcrPsEntry> =
                std::mem::replace(self.avcc_param_next.ps_list_mut(ps_type), Vec::new());
            for src_ps in src {
                let src_id = match ps_type {
                    PsType::Sps => sps_id_of(&src_ps.nal_unit)?,
                    _ => pps_id_of(&src_ps.nal_unit)?,
                };
                match self.avcc_param.find_ps(ps_type, src_id) {
                    Some(index) => {
                        let entry = &mut self.avcc_param.ps_list_mut(ps_type)[index];
                        entry.nal_unit = src_ps.nal_unit;
                        entry.unused = false;
                    },
                    None => self.avcc_param.ps_list_mut(ps_type).push(src_ps),
                }
            }
        }
        self.avcc_param.profile_indication = self.avcc_param_next.profile_indication;
        self.avcc_param.profile_compatibility = self.avcc_param_next.profile_compatibility;
        self.avcc_param.level_indication = self.avcc_param_next.level_indication;
        self.avcc_param.chroma_format = self.avcc_param_next.chroma_format;
        self.avcc_param.bit_depth_luma_minus8 = self.avcc_param_next.bit_depth_luma_minus8;
        self.avcc_param.bit_depth_chroma_minus8 = self.avcc_param_next.bit_depth_chroma_minus8;
        self.avcc_param_next = H264Params::default();
        self.avcc_param_next.length_size_minus_one = (H264_DEFAULT_NALU_LENGTH_SIZE - 1) as u8;
        self.avcc_pending = false;
        Ok(())
    }

    /// Mark the parameter sets a slice refers to as active again.
    fn reactivate_parameter_sets(&mut self, slice: &SliceInfo) {
        for &(ps_type, ps_id) in &[
            (PsType::Sps, slice.seq_parameter_set_id),
            (PsType::Pps, slice.pic_parameter_set_id),
        ] {
            if let Some(index) = self.avcc_param.find_ps(ps_type, ps_id) {
                let ps = &mut self.avcc_param.ps_list_mut(ps_type)[index];
                if ps.unused {
                    ps.unused = false;
                }
            }
        }
    }

    /// Merge one slice into the picture; called at least once per picture.
    fn update_picture_info_for_slice(&mut self, slice: SliceInfo) {
        let picture = &mut self.picture;
        picture.has_mmco5 |= slice.has_mmco5;
        picture.has_redundancy |= slice.has_redundancy;
        picture.incomplete_au_has_primary |= !slice.has_redundancy;
        update_picture_type(&mut picture.r#type, &slice);
        self.reactivate_parameter_sets(&slice);
        self.slice.present = false;
    }

    /// Finalize the picture from its last slice; called exactly once.
    fn update_picture_info(&mut self, slice: SliceInfo) {
        {
            let picture = &mut self.picture;
            picture.frame_num = slice.frame_num;
            picture.pic_order_cnt_lsb = slice.pic_order_cnt_lsb;
            picture.delta_pic_order_cnt_bottom = slice.delta_pic_order_cnt_bottom;
            picture.delta_pic_order_cnt = slice.delta_pic_order_cnt;
            picture.field_pic_flag = slice.field_pic_flag;
            picture.bottom_field_flag = slice.bottom_field_flag;
            picture.idr = slice.idr_pic_flag;
            picture.pic_parameter_set_id = slice.pic_parameter_set_id;
            picture.disposable = slice.nal_ref_idc == 0;
            picture.random_accessible = slice.idr_pic_flag;
        }
        self.update_picture_info_for_slice(slice);
        let picture = &mut self.picture;
        picture.independent =
            picture.r#type == PictureType::I || picture.r#type == PictureType::ISi;
        if self.sei.pic_timing.present {
            if self.sei.pic_timing.pic_struct < 9 {
                const DELTA_TFI_DIVISOR: [u32; 9] = [2, 1, 1, 2, 2, 3, 3, 4, 6];
                picture.delta = DELTA_TFI_DIVISOR[self.sei.pic_timing.pic_struct as usize];
            } else {
                // Reserved values.
                picture.delta = if picture.field_pic_flag { 1 } else { 2 };
            }
            self.sei.pic_timing.present = false;
        } else {
            picture.delta = if picture.field_pic_flag { 1 } else { 2 };
        }
        if self.sei.recovery_point.present {
            picture.random_accessible |= self.sei.recovery_point.random_accessible;
            picture.recovery_frame_cnt = self.sei.recovery_point.recovery_frame_cnt;
            picture.broken_link_flag = self.sei.recovery_point.broken_link_flag;
            self.sei.recovery_point.present = false;
        }
    }

    fn calculate_poc(&mut self, prev_picture: &PrevPicture) -> io::Result<()> {
        let pps = *self.stored_pps(self.picture.pic_parameter_set_id);
        let sps = self.stored_sps(pps.seq_parameter_set_id).clone();
        let picture = &mut self.picture;
        let mut top_field_order_cnt: i64 = 0;
        let mut bottom_field_order_cnt: i64 = 0;
        match sps.pic_order_cnt_type {
            0 => {
                let (prev_pic_order_cnt_msb, prev_pic_order_cnt_lsb) = if picture.idr {
                    (0, 0)
                } else if prev_picture.ref_pic_has_mmco5 {
                    if prev_picture.ref_pic_bottom_field_flag {
                        (0, 0)
                    } else {
                        (0, prev_picture.ref_pic_top_field_order_cnt)
                    }
                } else {
                    (
                        prev_picture.ref_pic_pic_order_cnt_msb,
                        prev_picture.ref_pic_pic_order_cnt_lsb,
                    )
                };
                let pic_order_cnt_lsb = picture.pic_order_cnt_lsb as i32;
                let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb as i64;
                let pic_order_cnt_msb: i64 = if pic_order_cnt_lsb < prev_pic_order_cnt_lsb
                    && (prev_pic_order_cnt_lsb - pic_order_cnt_lsb) as i64
                        >= max_pic_order_cnt_lsb / 2
                {
                    prev_pic_order_cnt_msb as i64 + max_pic_order_cnt_lsb
                } else if pic_order_cnt_lsb > prev_pic_order_cnt_lsb
                    && (pic_order_cnt_lsb - prev_pic_order_cnt_lsb) as i64
                        > max_pic_order_cnt_lsb / 2
                {
                    prev_pic_order_cnt_msb as i64 - max_pic_order_cnt_lsb
                } else {
                    prev_pic_order_cnt_msb as i64
                };
                check_i32(pic_order_cnt_msb)?;
                top_field_order_cnt = pic_order_cnt_msb + pic_order_cnt_lsb as i64;
                bottom_field_order_cnt = top_field_order_cnt;
                if !picture.field_pic_flag {
                    bottom_field_order_cnt += picture.delta_pic_order_cnt_bottom as i64;
                }
                check_i32(top_field_order_cnt)?;
                check_i32(bottom_field_order_cnt)?;
                if !picture.disposable {
                    picture.ref_pic_has_mmco5 = picture.has_mmco5;
                    picture.ref_pic_bottom_field_flag = picture.bottom_field_flag;
                    picture.ref_pic_top_field_order_cnt = top_field_order_cnt as i32;
                    picture.ref_pic_pic_order_cnt_msb = pic_order_cnt_msb as i32;
                    picture.ref_pic_pic_order_cnt_lsb = pic_order_cnt_lsb;
                } else {
                    picture.ref_pic_has_mmco5 = prev_picture.ref_pic_has_mmco5;
                    picture.ref_pic_bottom_field_flag = prev_picture.ref_pic_bottom_field_flag;
                    picture.ref_pic_top_field_order_cnt = prev_picture.ref_pic_top_field_order_cnt;
                    picture.ref_pic_pic_order_cnt_msb = prev_picture.ref_pic_pic_order_cnt_msb;
                    picture.ref_pic_pic_order_cnt_lsb = prev_picture.ref_pic_pic_order_cnt_lsb;
                }
            },
            1 => {
                let frame_num = picture.frame_num as i64;
                let prev_frame_num = if prev_picture.has_mmco5 {
                    0
                } else {
                    prev_picture.frame_num as i64
                };
                let prev_frame_num_offset = if prev_picture.has_mmco5 {
                    0
                } else {
                    prev_picture.frame_num_offset
                };
                let frame_num_offset = if picture.idr {
                    0
                } else {
                    prev_frame_num_offset
                        + if prev_frame_num > frame_num {
                            sps.max_frame_num as i64
                        } else {
                            0
                        }
                };
                check_i32(frame_num_offset)?;
                let mut expected_pic_order_cnt: i64 = 0;
                if sps.num_ref_frames_in_pic_order_cnt_cycle != 0 {
                    let mut abs_frame_num = (frame_num_offset + frame_num) as u64;
                    if picture.disposable && abs_frame_num > 0 {
                        abs_frame_num -= 1;
                    }
                    if abs_frame_num != 0 {
                        let cycle = sps.num_ref_frames_in_pic_order_cnt_cycle as u64;
                        let pic_order_cnt_cycle_cnt = (abs_frame_num - 1) / cycle;
                        let frame_num_in_pic_order_cnt_cycle = (abs_frame_num - 1) % cycle;
                        expected_pic_order_cnt = pic_order_cnt_cycle_cnt as i64
                            * sps.expected_delta_per_pic_order_cnt_cycle;
                        for i in 0..=frame_num_in_pic_order_cnt_cycle as usize {
                            expected_pic_order_cnt += sps.offset_for_ref_frame[i] as i64;
                        }
                    }
                }
                if picture.disposable {
                    expected_pic_order_cnt += sps.offset_for_non_ref_pic as i64;
                }
                top_field_order_cnt = expected_pic_order_cnt + picture.delta_pic_order_cnt[0] as i64;
                bottom_field_order_cnt =
                    top_field_order_cnt + sps.offset_for_top_to_bottom_field as i64;
                if !picture.field_pic_flag {
                    bottom_field_order_cnt += picture.delta_pic_order_cnt[1] as i64;
                }
                check_i32(top_field_order_cnt)?;
                check_i32(bottom_field_order_cnt)?;
                picture.frame_num_offset = frame_num_offset;
            },
            2 => {
                let frame_num = picture.frame_num as i64;
                let prev_frame_num = if prev_picture.has_mmco5 {
                    0
                } else {
                    prev_picture.frame_num as i64
                };
                let prev_frame_num_offset = if prev_picture.has_mmco5 {
                    0
                } else {
                    prev_picture.frame_num_offset
                };
                let (frame_num_offset, temp_pic_order_cnt) = if picture.idr {
                    (0i64, 0i64)
                } else {
                    let offset = prev_frame_num_offset
                        + if prev_frame_num > frame_num {
                            sps.max_frame_num as i64
                        } else {
                            0
                        };
                    let temp = 2 * (offset + frame_num) - picture.disposable as i64;
                    check_i32(offset)?;
                    check_i32(temp)?;
                    (offset, temp)
                };
                top_field_order_cnt = temp_pic_order_cnt;
                bottom_field_order_cnt = temp_pic_order_cnt;
                picture.frame_num_offset = frame_num_offset;
            },
            _ => {},
        }
        picture.poc = if !picture.field_pic_flag {
            top_field_order_cnt.min(bottom_field_order_cnt) as i32
        } else if picture.bottom_field_flag {
            bottom_field_order_cnt as i32
        } else {
            top_field_order_cnt as i32
        };
        Ok(())
    }
}

/// The slice of picture state the POC computation looks back at.
#[derive(Clone, Copy, Debug, Default)]
struct PrevPicture {
    has_mmco5:                   bool,
    frame_num:                   u32,
    frame_num_offset:            i64,
    ref_pic_has_mmco5:           bool,
    ref_pic_bottom_field_flag:   bool,
    ref_pic_top_field_order_cnt: i32,
    ref_pic_pic_order_cnt_msb:   i32,
    ref_pic_pic_order_cnt_lsb:   i32,
}

impl PrevPicture {
    fn of(picture: &PictureInfo) -> PrevPicture {
        PrevPicture {
            has_mmco5:                   picture.has_mmco5,
            frame_num:                   picture.frame_num,
            frame_num_offset:            picture.frame_num_offset,
            ref_pic_has_mmco5:           picture.ref_pic_has_mmco5,
            ref_pic_bottom_field_flag:   picture.ref_pic_bottom_field_flag,
            ref_pic_top_field_order_cnt: picture.ref_pic_top_field_order_cnt,
            ref_pic_pic_order_cnt_msb:   picture.ref_pic_pic_order_cnt_msb,
            ref_pic_pic_order_cnt_lsb:   picture.ref_pic_pic_order_cnt_lsb,
        }
    }
}

#[inline]
fn check_i32(value: i64) -> io::Result<()> {
    if value < i32::min_value() as i64 || value > i32::max_value() as i64 {
        return Err(ioerr!(InvalidData, "POC arithmetic overflows 32 bits"));
    }
    Ok(())
}

fn skip_bits(bits: &mut Bits, mut count: u32) {
    while count > 64 {
        bits.get(64);
        count -= 64;
    }
    if count > 0 {
        bits.get(count);
    }
}

fn ceil_log2(mut value: u64) -> u32 {
    let mut length = 0;
    value = value.saturating_sub(1);
    while value != 0 {
        value >>= 1;
        length += 1;
    }
    length
}

fn update_picture_type(picture_type: &mut PictureType, slice: &SliceInfo) {
    use PictureType::*;
    let slice_type = slice.r#type;
    *picture_type = match *picture_type {
        IP => match slice_type {
            SLICE_TYPE_B => IPB,
            SLICE_TYPE_SI | SLICE_TYPE_SP => ISiPSp,
            _ => IP,
        },
        IPB => {
            if !matches!(slice_type, SLICE_TYPE_P | SLICE_TYPE_B | SLICE_TYPE_I) {
                ISiPSpB
            } else {
                IPB
            }
        },
        I => match slice_type {
            SLICE_TYPE_P => IP,
            SLICE_TYPE_B => IPB,
            SLICE_TYPE_SI => ISi,
            SLICE_TYPE_SP => ISiPSp,
            _ => I,
        },
        SiSp => match slice_type {
            SLICE_TYPE_P | SLICE_TYPE_I => ISiPSp,
            SLICE_TYPE_B => ISiPSpB,
            _ => SiSp,
        },
        Si => match slice_type {
            SLICE_TYPE_P => ISiPSp,
            SLICE_TYPE_B => ISiPSpB,
            SLICE_TYPE_I => ISi,
            SLICE_TYPE_SP => SiSp,
            _ => Si,
        },
        ISi => match slice_type {
            SLICE_TYPE_P | SLICE_TYPE_SP => ISiPSp,
            SLICE_TYPE_B => ISiPSpB,
            _ => ISi,
        },
        ISiPSp => {
            if slice_type == SLICE_TYPE_B {
                ISiPSpB
            } else {
                ISiPSp
            }
        },
        None => match slice_type {
            SLICE_TYPE_P => IP,
            SLICE_TYPE_B => IPB,
            SLICE_TYPE_I => I,
            SLICE_TYPE_SI => Si,
            SLICE_TYPE_SP => SiSp,
            _ => None,
        },
        other => other,
    };
}

fn find_au_delimit_by_slice_info(slice: &SliceInfo, prev_slice: &SliceInfo) -> bool {
    slice.frame_num != prev_slice.frame_num
        || ((slice.pic_order_cnt_type == 0 && prev_slice.pic_order_cnt_type == 0)
            && (slice.pic_order_cnt_lsb != prev_slice.pic_order_cnt_lsb
                || slice.delta_pic_order_cnt_bottom != prev_slice.delta_pic_order_cnt_bottom))
        || ((slice.pic_order_cnt_type == 1 && prev_slice.pic_order_cnt_type == 1)
            && (slice.delta_pic_order_cnt[0] != prev_slice.delta_pic_order_cnt[0]
                || slice.delta_pic_order_cnt[1] != prev_slice.delta_pic_order_cnt[1]))
        || slice.field_pic_flag != prev_slice.field_pic_flag
        || slice.bottom_field_flag != prev_slice.bottom_field_flag
        || slice.idr_pic_flag != prev_slice.idr_pic_flag
        || slice.pic_parameter_set_id != prev_slice.pic_parameter_set_id
        || ((slice.nal_ref_idc == 0 || prev_slice.nal_ref_idc == 0)
            && slice.nal_ref_idc != prev_slice.nal_ref_idc)
        || (slice.idr_pic_flag
            && prev_slice.idr_pic_flag
            && slice.idr_pic_id != prev_slice.idr_pic_id)
}

fn find_au_delimit_by_nalu_type(nalu_type: u8, prev_nalu_type: u8) -> bool {
    ((NALU_TYPE_SEI..=NALU_TYPE_AUD).contains(&nalu_type)
        || (NALU_TYPE_SPS_EXT..=NALU_TYPE_RSV_NVCL18).contains(&nalu_type))
        && ((NALU_TYPE_SLICE_N_IDR..=NALU_TYPE_SLICE_IDR).contains(&prev_nalu_type)
            || prev_nalu_type == NALU_TYPE_FD
            || prev_nalu_type == NALU_TYPE_SLICE_AUX)
}

fn check_nalu_header(sb: &mut Sb, use_long_start_code: bool) -> io::Result<NaluHeader> {
    if sb.remainder() < 1 {
        return Err(ioerr!(UnexpectedEof, "truncated NAL unit header"));
    }
    let byte = sb.get_byte();
    let header = NaluHeader {
        nal_ref_idc:   (byte >> 5) & 0x03,
        nal_unit_type: byte & 0x1f,
        length:        1,
    };
    if (byte >> 7) & 0x01 != 0 {
        return Err(ioerr!(InvalidData, "forbidden_zero_bit is set"));
    }
    if header.nal_unit_type == NALU_TYPE_PREFIX || header.nal_unit_type >= NALU_TYPE_SLICE_EXT {
        return Err(ioerr!(InvalidData, "SVC/MVC NAL units are not supported"));
    }
    // SPS, PPS and AU delimiters shall start with a long start code.
    if !use_long_start_code
        && matches!(
            header.nal_unit_type,
            NALU_TYPE_SPS | NALU_TYPE_PPS | NALU_TYPE_AUD
        )
    {
        return Err(ioerr!(InvalidData, "parameter set with a short start code"));
    }
    if header.nal_ref_idc != 0 {
        // nal_ref_idc shall be zero for SEI, AUD, EOS, EOB and filler.
        if matches!(
            header.nal_unit_type,
            NALU_TYPE_SEI | NALU_TYPE_AUD | NALU_TYPE_EOS | NALU_TYPE_EOB | NALU_TYPE_FD
        ) {
            return Err(ioerr!(InvalidData, "nal_ref_idc must be zero for this NAL type"));
        }
    } else if header.nal_unit_type == NALU_TYPE_SLICE_IDR {
        // IDR slices shall be reference pictures.
        return Err(ioerr!(InvalidData, "IDR slice with nal_ref_idc zero"));
    }
    Ok(header)
}

fn append_nalu_to_au(picture: &mut PictureInfo, src_nalu: &[u8], probe: bool) {
    if !probe {
        let needed = picture.incomplete_au_length + H264_DEFAULT_NALU_LENGTH_SIZE + src_nalu.len();
        if picture.incomplete_au.len() < needed {
            picture.incomplete_au.resize(needed, 0);
        }
        let start = picture.incomplete_au_length;
        picture.incomplete_au[start..start + 4]
            .copy_from_slice(&(src_nalu.len() as u32).to_be_bytes());
        picture.incomplete_au[start + 4..start + 4 + src_nalu.len()].copy_from_slice(src_nalu);
    }
    // incomplete_au_length is reset right after AU completion, so the AU
    // length does not grow monotonically over the stream.
    picture.incomplete_au_length += H264_DEFAULT_NALU_LENGTH_SIZE + src_nalu.len();
}

fn complete_au(picture: &mut PictureInfo, probe: bool) -> bool {
    if !picture.incomplete_au_has_primary || picture.incomplete_au_length == 0 {
        return false;
    }
    if !probe {
        if picture.au.len() < picture.incomplete_au_length {
            picture.au.resize(picture.incomplete_au_length, 0);
        }
        picture.au[..picture.incomplete_au_length]
            .copy_from_slice(&picture.incomplete_au[..picture.incomplete_au_length]);
    }
    picture.au_length = picture.incomplete_au_length;
    picture.incomplete_au_length = 0;
    picture.incomplete_au_has_primary = false;
    true
}

pub(crate) struct H264Importer {
    status:                         ImportStatus,
    info:                           H264Info,
    avcc_list:                      Vec<H264Params>,
    avcc_number:                    usize,
    ts_list:                        Vec<MediaTs>,
    max_au_length:                  usize,
    num_undecodable:                u32,
    last_delta:                     u32,
    last_intra_cts:                 u64,
    composition_reordering_present: bool,
    field_pic_present:              bool,
}

impl H264Importer {
    fn new() -> H264Importer {
        H264Importer {
            status: ImportStatus::Ok,
            info: H264Info::new(),
            avcc_list: Vec::new(),
            avcc_number: 0,
            ts_list: Vec::new(),
            max_au_length: 0,
            num_undecodable: 0,
            last_delta: 0,
            last_intra_cts: 0,
            composition_reordering_present: false,
            field_pic_present: false,
        }
    }

    /// Scan NAL units until one access unit completes. With `probe` set,
    /// only headers are parsed and no AU bytes are copied.
    fn get_access_unit_internal(&mut self, sb: &mut Sb, probe: bool) -> io::Result<()> {
        let info = &mut self.info;
        let mut nalu_header = info.nalu_header;
        let mut consecutive_zero_byte_count: u64 = 0;
        let mut ebsp_length: u64 = 0;
        let mut complete = false;
        info.picture.au_length = 0;
        info.picture.r#type = PictureType::None;
        info.picture.random_accessible = false;
        info.picture.recovery_frame_cnt = 0;
        info.picture.has_mmco5 = false;
        info.picture.has_redundancy = false;
        info.picture.broken_link_flag = false;
        loop {
            sb.update(2)?;
            let no_more_buf = sb.remainder() == 0;
            let no_more = sb.is_eos() && no_more_buf;
            if !nalu::check_next_short_start_code(sb.window()) && !no_more {
                if sb.get_byte() != 0 {
                    consecutive_zero_byte_count = 0;
                } else {
                    consecutive_zero_byte_count += 1;
                }
                ebsp_length += 1;
                continue;
            }
            if no_more && ebsp_length == 0 {
                // The last NALU was already appended and parsed.
                let slice = info.slice;
                info.update_picture_info(slice);
                complete_au(&mut info.picture, probe);
                info.nalu_header = nalu_header;
                if info.picture.incomplete_au_length == 0 {
                    self.status = ImportStatus::Eof;
                } else if self.status != ImportStatus::Change {
                    self.status = ImportStatus::Ok;
                }
                info.picture.au_number += 1;
                return Ok(());
            }
            let next_nalu_head_pos = info.ebsp_head_pos
                + ebsp_length
                + if !no_more { nalu::SHORT_START_CODE_LENGTH as u64 } else { 0 };
            // Remember where the next short start code sits in the window
            // for the common case where no backward read is needed.
            let mut next_short_start_code_pos = sb.pos();
            let nalu_type = nalu_header.nal_unit_type;
            let mut read_back = false;
            if nalu_type == NALU_TYPE_FD {
                // Filler plus HRD timing cannot be represented; plain
                // filler is forbidden in 14496-15 elementary streams.
                if info.sps.vui.hrd.present {
                    return Err(ioerr!(InvalidData, "filler data with HRD timing"));
                }
            } else if (NALU_TYPE_SLICE_N_IDR..=NALU_TYPE_SPS_EXT).contains(&nalu_type)
                || nalu_type == NALU_TYPE_SLICE_AUX
            {
                // Collect the EBSP of the current NALU. Types 0..13 and
                // 19 are recognized; SVC/MVC never reach here.
                ebsp_length -= consecutive_zero_byte_count;
                let nalu_length = (nalu_header.length as u64 + ebsp_length) as usize;
                let possible_au_length = info.picture.incomplete_au_length
                    + H264_DEFAULT_NALU_LENGTH_SIZE
                    + nalu_length;
                if sb.buffer_size() < possible_au_length {
                    sb.resize(2 * possible_au_length);
                    next_short_start_code_pos = sb.pos();
                }
                // Move to the first byte of the current NALU.
                read_back = sb.pos() < nalu_length + consecutive_zero_byte_count as usize;
                if read_back {
                    sb.stream_seek(info.ebsp_head_pos - nalu_header.length as u64)?;
                    sb.set_pos(0);
                    sb.read(nalu_length)?;
                    if sb.valid_size() != nalu_length {
                        return Err(ioerr!(UnexpectedEof, "could not re-read a NAL unit"));
                    }
                } else {
                    sb.seek_cur(-((nalu_length + consecutive_zero_byte_count as usize) as i64));
                }
                if (NALU_TYPE_SLICE_N_IDR..=NALU_TYPE_SLICE_IDR).contains(&nalu_type) {
                    // VCL NALU (slice)
                    let prev_slice = info.slice;
                    {
                        let window = sb.window();
                        let ebsp = &window[nalu_header.length as usize..nalu_length];
                        info.parse_slice(&nalu_header, ebsp)?;
                    }
                    if probe && info.avcc_pending {
                        self.avcc_list.push(info.avcc_param.clone());
                    }
                    info.move_pending_avcc_param()?;
                    if prev_slice.present {
                        if find_au_delimit_by_slice_info(&info.slice, &prev_slice) {
                            // The current NALU opens a new AU; the
                            // previous slice finishes the one wanted now.
                            info.update_picture_info(prev_slice);
                            complete = complete_au(&mut info.picture, probe);
                        } else {
                            info.update_picture_info_for_slice(prev_slice);
                        }
                    }
                    {
                        let window = sb.window();
                        append_nalu_to_au(&mut info.picture, &window[..nalu_length], probe);
                    }
                    info.slice.present = true;
                } else {
                    if find_au_delimit_by_nalu_type(nalu_type, info.prev_nalu_type) {
                        // The last slice closes the AU wanted now.
                        let slice = info.slice;
                        info.update_picture_info(slice);
                        complete = complete_au(&mut info.picture, probe);
                    } else if no_more {
                        complete = complete_au(&mut info.picture, probe);
                    }
                    match nalu_type {
                        NALU_TYPE_SEI => {
                            {
                                let window = sb.window();
                                let ebsp = &window[nalu_header.length as usize..nalu_length];
                                info.parse_sei(ebsp)?;
                            }
                            let window = sb.window();
                            append_nalu_to_au(&mut info.picture, &window[..nalu_length], probe);
                        },
                        NALU_TYPE_SPS => {
                            let ps = sb.window()[..nalu_length].to_vec();
                            info.try_to_append_parameter_set(PsType::Sps, &ps)?;
                        },
                        NALU_TYPE_PPS => {
                            let ps = sb.window()[..nalu_length].to_vec();
                            info.try_to_append_parameter_set(PsType::Pps, &ps)?;
                        },
                        NALU_TYPE_AUD => {
                            // Access unit delimiters are dropped.
                        },
                        NALU_TYPE_SPS_EXT => {
                            let ps = sb.window()[..nalu_length].to_vec();
                            info.try_to_append_parameter_set(PsType::SpsExt, &ps)?;
                        },
                        _ => {
                            let window = sb.window();
                            append_nalu_to_au(&mut info.picture, &window[..nalu_length], probe);
                        },
                    }
                    if info.avcc_pending {
                        self.status = ImportStatus::Change;
                    }
                }
            }
            // Move to the first byte of the next NALU.
            if read_back {
                sb.stream_seek(next_nalu_head_pos)?;
                sb.set_pos(0);
                sb.read(0)?;
            } else {
                sb.set_pos(next_short_start_code_pos + nalu::SHORT_START_CODE_LENGTH);
            }
            info.prev_nalu_type = nalu_type;
            sb.update(0)?;
            let no_more_buf = sb.remainder() == 0;
            ebsp_length = 0;
            let no_more = sb.is_eos() && no_more_buf;
            if !no_more {
                // Check the next NALU header.
                nalu_header = check_nalu_header(sb, consecutive_zero_byte_count != 0)?;
                info.ebsp_head_pos = next_nalu_head_pos + nalu_header.length as u64;
            } else if info.picture.incomplete_au_length != 0 && info.picture.au_length == 0 {
                // Flush the remaining NALUs as one complete AU.
                let slice = info.slice;
                info.update_picture_info(slice);
                complete_au(&mut info.picture, probe);
                info.nalu_header = nalu_header;
                self.status = ImportStatus::Eof;
                info.picture.au_number += 1;
                return Ok(());
            }
            if complete {
                info.nalu_header = nalu_header;
                if sb.is_eos() && sb.remainder() == 0 && info.picture.incomplete_au_length == 0 {
                    self.status = ImportStatus::Eof;
                } else if self.status != ImportStatus::Change {
                    self.status = ImportStatus::Ok;
                }
                info.picture.au_number += 1;
                return Ok(());
            }
            consecutive_zero_byte_count = 0;
        }
    }

    fn create_summary(&self, param: &H264Params) -> io::Result<VideoSummary> {
        let sps = &self.info.sps;
        let mut summary = VideoSummary::default();
        summary.sample_type = FourCc::new(b"avc1");
        summary.max_au_length = self.max_au_length;
        summary.timescale = sps.vui.time_scale;
        summary.timebase = sps.vui.num_units_in_tick;
        summary.vfr = !sps.vui.fixed_frame_rate_flag;
        summary.sample_per_field = self.field_pic_present;
        summary.width = sps.cropped_width;
        summary.height = sps.cropped_height;
        summary.par_h = sps.vui.sar_width;
        summary.par_v = sps.vui.sar_height;
        summary.color.primaries_index = sps.vui.colour_primaries;
        summary.color.transfer_index = sps.vui.transfer_characteristics;
        summary.color.matrix_index = sps.vui.matrix_coefficients;
        summary.color.full_range = sps.vui.video_full_range_flag;
        summary
            .codec_specific
            .push(CodecSpecific::new(CodecSpecificKind::H264, create_h264_specific_info(param)?));
        Ok(summary)
    }
}

pub(crate) fn probe(sb: &mut Sb) -> io::Result<(Box<dyn CodecImporter>, Summary)> {
    let mut importer = H264Importer::new();
    // The first NALU of an AU in decoding order must carry a long start
    // code; anything before it must be zero bytes.
    sb.set_pos(0);
    sb.read(0)?;
    loop {
        if nalu::check_next_long_start_code(sb.window()) {
            break;
        }
        if sb.remainder() <= nalu::LONG_START_CODE_LENGTH {
            return Err(ioerr!(InvalidData, "not an H.264 byte stream"));
        }
        if sb.get_byte() != 0 {
            return Err(ioerr!(InvalidData, "not an H.264 byte stream"));
        }
    }
    sb.seek_cur(nalu::LONG_START_CODE_LENGTH as i64);
    let mut first_ebsp_head_pos = sb.pos() as u64;
    sb.update(0)?;
    let first_nalu_header = check_nalu_header(sb, true)?;
    if sb.remainder() == 0 {
        return Err(ioerr!(UnexpectedEof, "stream ends at the first access unit"));
    }
    first_ebsp_head_pos += first_nalu_header.length as u64;
    importer.info.nalu_header = first_nalu_header;
    importer.info.ebsp_head_pos = first_ebsp_head_pos;
    // Parse every NALU up front to prepare the timestamps.
    let mut npt: Vec<NalPicTiming> = Vec::with_capacity(1 << 12);
    let mut picture_stats = [0u32; 4];
    log::debug!("analyzing stream as H.264");
    while importer.status != ImportStatus::Eof {
        let prev_picture = PrevPicture::of(&importer.info.picture);
        importer.get_access_unit_internal(sb, true)?;
        importer.info.calculate_poc(&prev_picture)?;
        let picture = &importer.info.picture;
        importer.field_pic_present |= picture.field_pic_flag;
        npt.push(NalPicTiming {
            poc:       picture.poc as i64,
            delta:     picture.delta,
            poc_delta: if picture.field_pic_flag { 1 } else { 2 },
            reset:     picture.has_mmco5,
        });
        // The AU bytes stay uncopied during the probe; the length field
        // still tracks them.
        importer.max_au_length = importer.max_au_length.max(picture.au_length);
        if picture.idr {
            picture_stats[0] += 1;
        } else if picture.r#type == PictureType::I {
            picture_stats[1] += 1;
        } else if picture.r#type == PictureType::IP {
            picture_stats[2] += 1;
        } else {
            picture_stats[3] += 1;
        }
    }
    log::debug!(
        "H.264 pictures: IDR {}, I {}, P {}, other {}",
        picture_stats[0],
        picture_stats[1],
        picture_stats[2],
        picture_stats[3]
    );
    let num_access_units = npt.len();
    if num_access_units == 0 {
        return Err(ioerr!(InvalidData, "no access units in the stream"));
    }
    // Keep the final codec specific configuration.
    importer.avcc_list.push(importer.info.avcc_param.clone());
    let first_param = importer.avcc_list[0].clone();
    importer.avcc_number = 1;
    // Count the undecodable leading pictures (POC-0 prefix).
    for timing in &npt {
        if timing.poc == 0 {
            break;
        }
        importer.num_undecodable += 1;
    }
    let mut max_composition_delay = 0;
    nalu::deduplicate_poc(&mut npt, &mut max_composition_delay, num_access_units, 32);
    let mut timestamp = Vec::new();
    nalu::generate_timestamps_from_poc(
        &mut timestamp,
        &npt,
        &mut importer.composition_reordering_present,
        &mut importer.last_delta,
        max_composition_delay,
        num_access_units,
    );
    let mut summary = importer.create_summary(&first_param)?;
    let mut timescale = summary.timescale;
    nalu::reduce_timescale(&mut timestamp, &npt, &mut importer.last_delta, &mut timescale, num_access_units);
    summary.timescale = timescale;
    importer.ts_list = timestamp;
    // Go back to the EBSP of the first NALU for the delivery pass.
    sb.stream_seek(first_ebsp_head_pos)?;
    sb.set_pos(0);
    sb.read(0)?;
    importer.status = ImportStatus::Ok;
    importer.info.nalu_header = first_nalu_header;
    importer.info.prev_nalu_type = 0;
    importer.info.ebsp_head_pos = first_ebsp_head_pos;
    let picture = &mut importer.info.picture;
    let au = std::mem::replace(&mut picture.au, Vec::new());
    let incomplete_au = std::mem::replace(&mut picture.incomplete_au, Vec::new());
    *picture = PictureInfo::default();
    picture.au = au;
    picture.incomplete_au = incomplete_au;
    importer.info.slice = SliceInfo::default();
    importer.info.sps = Sps::default();
    importer.info.pps = Pps::default();
    importer.info.sei = Sei::default();
    importer.info.avcc_param.sps_list.clear();
    importer.info.avcc_param.pps_list.clear();
    importer.info.avcc_param.spsext_list.clear();
    importer.info.avcc_param_next = H264Params::default();
    importer.info.avcc_param_next.length_size_minus_one = (H264_DEFAULT_NALU_LENGTH_SIZE - 1) as u8;
    importer.info.avcc_pending = false;
    Ok((Box::new(importer), Summary::Video(summary)))
}

impl CodecImporter for H264Importer {
    fn get_access_unit(
        &mut self,
        sb: &mut Sb,
        summary: &mut Summary,
        sample: &mut Sample,
    ) -> io::Result<ImportStatus> {
        if sample.data.len() < self.max_au_length {
            return Err(ioerr!(InvalidInput, "sample buffer smaller than max_au_length"));
        }
        if self.status == ImportStatus::Eof {
            sample.length = 0;
            return Ok(ImportStatus::Eof);
        }
        let mut current_status = self.status;
        self.get_access_unit_internal(sb, false)?;
        if self.status == ImportStatus::Change && !self.info.avcc_pending {
            current_status = ImportStatus::Change;
        }
        if self.info.picture.au_length == 0 {
            // Nothing was flushed; the stream ended exactly at an AU edge.
            sample.length = 0;
            return Ok(ImportStatus::Eof);
        }
        if current_status == ImportStatus::Change {
            // Update the active summary from the stored configurations.
            let param = self
                .avcc_list
                .get(self.avcc_number)
                .cloned()
                .ok_or_else(|| ioerr!(InvalidData, "no pending decoder configuration"))?;
            self.avcc_number += 1;
            *summary = Summary::Video(self.create_summary(&param)?);
            self.status = ImportStatus::Ok;
        }
        let picture = &self.info.picture;
        let ts = self
            .ts_list
            .get(picture.au_number as usize - 1)
            .copied()
            .ok_or_else(|| ioerr!(InvalidData, "more access units than the probe pass saw"))?;
        sample.dts = ts.dts;
        sample.cts = ts.cts;
        sample.prop = Default::default();
        if (picture.au_number as u32) < self.num_undecodable {
            sample.prop.leading = Leading::UndecodableLeading;
        } else if picture.independent || sample.cts >= self.last_intra_cts {
            sample.prop.leading = Leading::NotLeading;
        } else {
            sample.prop.leading = Leading::UndecodableLeading;
        }
        if picture.independent {
            self.last_intra_cts = sample.cts;
        }
        if self.composition_reordering_present && !picture.disposable && !picture.idr {
            sample.prop.allow_earlier = true;
        }
        sample.prop.independent = picture.independent;
        sample.prop.disposable = picture.disposable;
        sample.prop.redundant = picture.has_redundancy;
        sample.prop.post_roll.identifier = picture.frame_num;
        if picture.random_accessible {
            if picture.idr {
                sample.prop.ra_flags = RA_FLAG_SYNC;
            } else if picture.recovery_frame_cnt != 0 {
                sample.prop.ra_flags = RA_FLAG_POST_ROLL_START;
                sample.prop.post_roll.complete =
                    (picture.frame_num + picture.recovery_frame_cnt) % self.info.sps.max_frame_num;
            } else {
                sample.prop.ra_flags = RA_FLAG_RAP;
                if !picture.broken_link_flag {
                    sample.prop.ra_flags |= RA_FLAG_PARTIAL_SYNC;
                }
            }
        }
        sample.length = picture.au_length;
        sample.data[..picture.au_length].copy_from_slice(&picture.au[..picture.au_length]);
        Ok(current_status)
    }

    fn last_delta(&self, _summary: &Summary) -> u32 {
        if self.status != ImportStatus::Eof {
            return 0;
        }
        if self.ts_list.is_empty() {
            u32::max_value() // arbitrary
        } else {
            self.last_delta
        }
    }
}

#[cfg(test)]
mod tests;

//! HEVC/H.265 byte streams (ITU-T H.265, ISO/IEC 14496-15).
//!
//! Structured like the H.264 importer, with the HEVC differences: two-byte
//! NAL headers carrying a layer id and a temporal id, three parameter set
//! kinds collected into `hvcC` arrays, IRAP classes (IDR/BLA/CRA) instead
//! of plain IDR, and RADL/RASL leading picture signalling.
use std::io;

use crate::bits::Bits;
use crate::bs::Bs;
use crate::codec::nalu::{self, DcrPsEntry, MediaTs, NalPicTiming};
use crate::importer::{CodecImporter, ImportStatus};
use crate::sample::{
    Leading, Sample, RA_FLAG_CLOSED_RAP, RA_FLAG_POST_ROLL_START, RA_FLAG_RAP, RA_FLAG_SYNC,
};
use crate::sbuf::Sb;
use crate::summary::{CodecSpecific, CodecSpecificKind, FourCc, Summary, VideoSummary};

const HEVC_DEFAULT_BUFFER_SIZE: usize = 1 << 16;
const HEVC_DEFAULT_NALU_LENGTH_SIZE: usize = 4;

pub const NALU_TYPE_TRAIL_N: u8 = 0;
pub const NALU_TYPE_RADL_N: u8 = 6;
pub const NALU_TYPE_RADL_R: u8 = 7;
pub const NALU_TYPE_RASL_N: u8 = 8;
pub const NALU_TYPE_RASL_R: u8 = 9;
pub const NALU_TYPE_RSV_VCL_N14: u8 = 14;
pub const NALU_TYPE_BLA_W_LP: u8 = 16;
pub const NALU_TYPE_BLA_W_RADL: u8 = 17;
pub const NALU_TYPE_BLA_N_LP: u8 = 18;
pub const NALU_TYPE_IDR_W_RADL: u8 = 19;
pub const NALU_TYPE_IDR_N_LP: u8 = 20;
pub const NALU_TYPE_CRA: u8 = 21;
pub const NALU_TYPE_RSV_IRAP_VCL23: u8 = 23;
pub const NALU_TYPE_RSV_VCL31: u8 = 31;
pub const NALU_TYPE_VPS: u8 = 32;
pub const NALU_TYPE_SPS: u8 = 33;
pub const NALU_TYPE_PPS: u8 = 34;
pub const NALU_TYPE_AUD: u8 = 35;
pub const NALU_TYPE_EOS: u8 = 36;
pub const NALU_TYPE_EOB: u8 = 37;
pub const NALU_TYPE_FD: u8 = 38;
pub const NALU_TYPE_PREFIX_SEI: u8 = 39;
pub const NALU_TYPE_SUFFIX_SEI: u8 = 40;
const NALU_TYPE_UNKNOWN: u8 = 0xff;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    pub nal_unit_type: u8,
    pub nuh_layer_id:  u8,
    pub temporal_id:   u8,
    pub length:        u8,
}

#[inline]
fn is_vcl(nalu_type: u8) -> bool {
    nalu_type <= NALU_TYPE_RSV_VCL31
}

#[inline]
fn is_irap(nalu_type: u8) -> bool {
    (NALU_TYPE_BLA_W_LP..=NALU_TYPE_RSV_IRAP_VCL23).contains(&nalu_type)
}

#[inline]
fn is_idr(nalu_type: u8) -> bool {
    nalu_type == NALU_TYPE_IDR_W_RADL || nalu_type == NALU_TYPE_IDR_N_LP
}

#[inline]
fn is_bla(nalu_type: u8) -> bool {
    (NALU_TYPE_BLA_W_LP..=NALU_TYPE_BLA_N_LP).contains(&nalu_type)
}

// Sub-layer non-reference pictures have the even VCL types up to 14.
#[inline]
fn is_sublayer_nonref(nalu_type: u8) -> bool {
    nalu_type <= NALU_TYPE_RSV_VCL_N14 && nalu_type % 2 == 0
}

/// general_profile_tier_level() fields carried into the hvcC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub profile_space:              u8,
    pub tier_flag:                  bool,
    pub profile_idc:                u8,
    pub profile_compatibility:      u32,
    pub constraint_indicator_flags: u64, // 48 bits
    pub level_idc:                  u8,
}

#[derive(Clone, Copy, Debug, Default)]
struct Hrd {
    present: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct Vui {
    sar_width:                u16,
    sar_height:               u16,
    video_full_range_flag:    bool,
    colour_primaries:         u16,
    transfer_characteristics: u16,
    matrix_coeffs:            u16,
    field_seq_flag:           bool,
    num_units_in_tick:        u32,
    time_scale:               u32,
    hrd:                      Hrd,
}

#[derive(Clone, Debug, Default)]
struct Sps {
    present:                    bool,
    video_parameter_set_id:     u8,
    max_sub_layers_minus1:      u8,
    temporal_id_nesting_flag:   bool,
    ptl:                        ProfileTierLevel,
    seq_parameter_set_id:       u8,
    chroma_format_idc:          u8,
    separate_colour_plane_flag: bool,
    bit_depth_luma_minus8:      u8,
    bit_depth_chroma_minus8:    u8,
    log2_max_pic_order_cnt_lsb: u32,
    max_pic_order_cnt_lsb:      u32,
    pic_size_in_ctbs_y:         u64,
    cropped_width:              u32,
    cropped_height:             u32,
    vui:                        Vui,
}

#[derive(Clone, Copy, Debug, Default)]
struct Pps {
    present:                                bool,
    pic_parameter_set_id:                   u8,
    seq_parameter_set_id:                   u8,
    dependent_slice_segments_enabled_flag:  bool,
    output_flag_present_flag:               bool,
    num_extra_slice_header_bits:            u8,
}

#[derive(Clone, Copy, Debug, Default)]
struct SeiRecoveryPoint {
    present:          bool,
    broken_link_flag: bool,
    recovery_poc_cnt: i32,
}

#[derive(Clone, Copy, Debug, Default)]
struct Sei {
    recovery_point: SeiRecoveryPoint,
}

#[derive(Clone, Copy, Debug, Default)]
struct SliceInfo {
    present:                    bool,
    nalu_type:                  u8,
    temporal_id:                u8,
    first_slice_segment_in_pic_flag: bool,
    dependent_slice_segment_flag: bool,
    r#type:                     u8,
    pic_parameter_set_id:       u8,
    pic_order_cnt_lsb:          u32,
}

#[derive(Clone, Debug, Default)]
struct PictureInfo {
    first:              bool,
    nalu_type:          u8,
    temporal_id:        u8,
    irap:               bool,
    idr:                bool,
    broken_link:        bool, // BLA
    radl:               bool,
    rasl:               bool,
    sublayer_nonref:    bool,
    independent:        bool,
    closed_rap:         bool,
    random_accessible:  bool,
    has_primary:        bool,
    recovery_poc_cnt:   i32,
    pic_order_cnt_lsb:  u32,
    poc:                i32,
    delta:              u32,
    field_coded:        bool,
    // State of the previous picture with TemporalId 0 that is neither
    // RADL, RASL nor sub-layer non-reference.
    prev_poc_msb:       i32,
    prev_poc_lsb:       u32,
}

#[derive(Clone, Debug, Default)]
struct AccessUnit {
    picture:              PictureInfo,
    temporal_id:          u8,
    data:                 Vec<u8>,
    length:               usize,
    incomplete_data:      Vec<u8>,
    incomplete_length:    usize,
    number:               u32,
}

/// Parameters and parameter set arrays of an `hvcC` box.
#[derive(Clone, Debug, Default)]
pub struct HevcParams {
    pub ptl:                     ProfileTierLevel,
    pub min_spatial_segmentation_idc: u16,
    pub chroma_format:           u8,
    pub bit_depth_luma_minus8:   u8,
    pub bit_depth_chroma_minus8: u8,
    pub num_temporal_layers:     u8,
    pub temporal_id_nested:      bool,
    pub length_size_minus_one:   u8,
    pub vps_list:                Vec<DcrPsEntry>,
    pub sps_list:                Vec<DcrPsEntry>,
    pub pps_list:                Vec<DcrPsEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PsType {
    Vps,
    Sps,
    Pps,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Appendable {
    Possible,
    Duplicated,
    NewDcrRequired,
    NewSampleEntryRequired,
}

fn vps_id_of(nal_unit: &[u8]) -> io::Result<u8> {
    if nal_unit.len() < 3 {
        return Err(ioerr!(InvalidData, "VPS too short"));
    }
    Ok(nal_unit[2] >> 4)
}

fn sps_id_of(nal_unit: &[u8]) -> io::Result<u8> {
    // The id sits after the PTL, so a structural parse is needed.
    let mut rbsp = Vec::new();
    let sps = parse_sps_internal(&mut rbsp, &nal_unit[2..])?;
    Ok(sps.seq_parameter_set_id)
}

fn pps_id_of(nal_unit: &[u8]) -> io::Result<u8> {
    let mut rbsp = Vec::new();
    let mut bits = nalu::import_rbsp_from_ebsp(&mut rbsp, &nal_unit[2..nal_unit.len().min(6)])?;
    let id = bits.get_ue();
    if id > 63 || bits.bs.error() {
        return Err(ioerr!(InvalidData, "bad pps_pic_parameter_set_id"));
    }
    Ok(id as u8)
}

impl HevcParams {
    fn ps_list(&self, ps_type: PsType) -> &Vec<DcrPsEntry> {
        match ps_type {
            PsType::Vps => &self.vps_list,
            PsType::Sps => &self.sps_list,
            PsType::Pps => &self.pps_list,
        }
    }

    fn ps_list_mut(&mut self, ps_type: PsType) -> &mut Vec<DcrPsEntry> {
        match ps_type {
            PsType::Vps => &mut self.vps_list,
            PsType::Sps => &mut self.sps_list,
            PsType::Pps => &mut self.pps_list,
        }
    }

    fn ps_id_of(ps_type: PsType, nal_unit: &[u8]) -> io::Result<u8> {
        match ps_type {
            PsType::Vps => vps_id_of(nal_unit),
            PsType::Sps => sps_id_of(nal_unit),
            PsType::Pps => pps_id_of(nal_unit),
        }
    }

    fn find_ps(&self, ps_type: PsType, ps_id: u8) -> Option<usize> {
        self.ps_list(ps_type)
            .iter()
            .position(|ps| HevcParams::ps_id_of(ps_type, &ps.nal_unit).ok() == Some(ps_id))
    }

    fn check_appendable(&self, ps_type: PsType, ps_data: &[u8]) -> io::Result<Appendable> {
        if ps_data.len() < 3 {
            return Err(ioerr!(InvalidData, "parameter set too short"));
        }
        let ps_list = self.ps_list(ps_type);
        if ps_list.is_empty() {
            return Ok(Appendable::Possible);
        }
        if nalu::same_ps_exists(ps_list, ps_data) {
            return Ok(Appendable::Duplicated);
        }
        let ps_id = HevcParams::ps_id_of(ps_type, ps_data)?;
        if ps_type == PsType::Sps {
            let mut rbsp = Vec::new();
            let sps = parse_sps_internal(&mut rbsp, &ps_data[2..])?;
            if sps.ptl.profile_idc != self.ptl.profile_idc
                || sps.chroma_format_idc != self.chroma_format
                || sps.bit_depth_luma_minus8 != self.bit_depth_luma_minus8
                || sps.bit_depth_chroma_minus8 != self.bit_depth_chroma_minus8
            {
                return Ok(Appendable::NewDcrRequired);
            }
            if let Some(first) = ps_list.iter().find(|ps| !ps.unused) {
                let first_sps = parse_sps_internal(&mut rbsp, &first.nal_unit[2..])?;
                if sps.cropped_width != first_sps.cropped_width
                    || sps.cropped_height != first_sps.cropped_height
                {
                    return Ok(Appendable::NewSampleEntryRequired);
                }
            }
        }
        for ps in ps_list {
            if ps.unused {
                continue;
            }
            if HevcParams::ps_id_of(ps_type, &ps.nal_unit)? == ps_id {
                // Same id with a different payload.
                return Ok(Appendable::NewDcrRequired);
            }
        }
        Ok(Appendable::Possible)
    }

    pub fn append_parameter_set(&mut self, ps_type: PsType, ps_data: &[u8]) -> io::Result<()> {
        let ps_id = HevcParams::ps_id_of(ps_type, ps_data)?;
        match self.find_ps(ps_type, ps_id) {
            Some(index) => {
                let ps = &mut self.ps_list_mut(ps_type)[index];
                if !ps.unused {
                    return Err(ioerr!(InvalidData, "duplicate active parameter set"));
                }
                ps.unused = false;
                ps.nal_unit = ps_data.to_vec();
            },
            None => {
                let entry = DcrPsEntry::new(ps_data);
                let list = self.ps_list_mut(ps_type);
                let at = list
                    .iter()
                    .position(|ps| {
                        HevcParams::ps_id_of(ps_type, &ps.nal_unit).unwrap_or(u8::max_value())
                            > ps_id
                    })
                    .unwrap_or(list.len());
                list.insert(at, entry);
            },
        }
        if ps_type == PsType::Sps {
            let mut rbsp = Vec::new();
            let sps = parse_sps_internal(&mut rbsp, &ps_data[2..])?;
            self.ptl = sps.ptl;
            self.chroma_format = sps.chroma_format_idc;
            self.bit_depth_luma_minus8 = sps.bit_depth_luma_minus8;
            self.bit_depth_chroma_minus8 = sps.bit_depth_chroma_minus8;
            self.num_temporal_layers = self
                .num_temporal_layers
                .max(sps.max_sub_layers_minus1 + 1);
            self.temporal_id_nested = sps.temporal_id_nesting_flag;
        }
        Ok(())
    }
}

/// Serialize an `hvcC` box from the accumulated arrays.
pub fn create_hevc_specific_info(param: &HevcParams) -> io::Result<Vec<u8>> {
    if nalu::ps_count(&param.sps_list) == 0 || nalu::ps_count(&param.pps_list) == 0 {
        return Err(ioerr!(InvalidInput, "no active SPS or PPS"));
    }
    let mut bits = Bits::new(Bs::new());
    bits.put(32, 0); // box size, patched below
    bits.put(32, u32::from_be_bytes(*b"hvcC") as u64);
    bits.put(8, 1); // configurationVersion
    bits.put(2, param.ptl.profile_space as u64);
    bits.put(1, param.ptl.tier_flag as u64);
    bits.put(5, param.ptl.profile_idc as u64);
    bits.put(32, param.ptl.profile_compatibility as u64);
    bits.put(48, param.ptl.constraint_indicator_flags);
    bits.put(8, param.ptl.level_idc as u64);
    bits.put(4, 0xf);
    bits.put(12, param.min_spatial_segmentation_idc as u64);
    bits.put(6, 0x3f);
    bits.put(2, 0); // parallelismType: unknown
    bits.put(6, 0x3f);
    bits.put(2, param.chroma_format as u64);
    bits.put(5, 0x1f);
    bits.put(3, param.bit_depth_luma_minus8 as u64);
    bits.put(5, 0x1f);
    bits.put(3, param.bit_depth_chroma_minus8 as u64);
    bits.put(16, 0); // avgFrameRate: unspecified
    bits.put(2, 0); // constantFrameRate: unknown
    bits.put(3, param.num_temporal_layers as u64);
    bits.put(1, param.temporal_id_nested as u64);
    bits.put(2, param.length_size_minus_one as u64);
    let arrays: [(&Vec<DcrPsEntry>, u8); 3] = [
        (&param.vps_list, NALU_TYPE_VPS),
        (&param.sps_list, NALU_TYPE_SPS),
        (&param.pps_list, NALU_TYPE_PPS),
    ];
    let num_arrays = arrays.iter().filter(|(list, _)| nalu::ps_count(list) > 0).count();
    bits.put(8, num_arrays as u64);
    for (list, nalu_type) in arrays.iter() {
        let count = nalu::ps_count(list);
        if count == 0 {
            continue;
        }
        bits.put(1, 1); // array_completeness
        bits.put(1, 0); // reserved
        bits.put(6, *nalu_type as u64);
        bits.put(16, count as u64);
        for ps in list.iter().filter(|ps| !ps.unused) {
            bits.put(16, ps.nal_unit.len() as u64);
            bits.put_align();
            bits.bs.put_bytes(&ps.nal_unit);
        }
    }
    bits.bs.status()?;
    let mut data = bits
        .export_data()
        .ok_or_else(|| ioerr!(Other, "empty hvcC payload"))?;
    let size = data.len() as u32;
    data[..4].copy_from_slice(&size.to_be_bytes());
    Ok(data)
}

/// Recover `HevcParams` from a serialized `hvcC` box.
pub fn parse_hevc_specific_info(data: &[u8]) -> io::Result<HevcParams> {
    if data.len() < 8 + 23 || &data[4..8] != b"hvcC" {
        return Err(ioerr!(InvalidData, "not an hvcC box"));
    }
    let mut bits = Bits::new(Bs::new());
    bits.import_data(&data[8..])?;
    if bits.get(8) != 1 {
        return Err(ioerr!(InvalidData, "unsupported hvcC configurationVersion"));
    }
    let mut param = HevcParams::default();
    param.ptl.profile_space = bits.get(2) as u8;
    param.ptl.tier_flag = bits.get(1) != 0;
    param.ptl.profile_idc = bits.get(5) as u8;
    param.ptl.profile_compatibility = bits.get(32) as u32;
    param.ptl.constraint_indicator_flags = bits.get(48);
    param.ptl.level_idc = bits.get(8) as u8;
    bits.get(4);
    param.min_spatial_segmentation_idc = bits.get(12) as u16;
    bits.get(6);
    bits.get(2); // parallelismType
    bits.get(6);
    param.chroma_format = bits.get(2) as u8;
    bits.get(5);
    param.bit_depth_luma_minus8 = bits.get(3) as u8;
    bits.get(5);
    param.bit_depth_chroma_minus8 = bits.get(3) as u8;
    bits.get(16); // avgFrameRate
    bits.get(2); // constantFrameRate
    param.num_temporal_layers = bits.get(3) as u8;
    param.temporal_id_nested = bits.get(1) != 0;
    param.length_size_minus_one = bits.get(2) as u8;
    let num_arrays = bits.get(8);
    for _ in 0..num_arrays {
        bits.get(2);
        let nalu_type = bits.get(6) as u8;
        let num_nalus = bits.get(16);
        for _ in 0..num_nalus {
            let length = bits.get(16) as usize;
            let nal_unit = bits.bs.get_bytes(length);
            let entry = DcrPsEntry { nal_unit, unused: false };
            match nalu_type {
                NALU_TYPE_VPS => param.vps_list.push(entry),
                NALU_TYPE_SPS => param.sps_list.push(entry),
                NALU_TYPE_PPS => param.pps_list.push(entry),
                _ => {},
            }
        }
    }
    bits.bs.status()?;
    Ok(param)
}

fn parse_ptl(bits: &mut Bits, max_sub_layers_minus1: u8) -> io::Result<ProfileTierLevel> {
    let mut ptl = ProfileTierLevel::default();
    ptl.profile_space = bits.get(2) as u8;
    ptl.tier_flag = bits.get(1) != 0;
    ptl.profile_idc = bits.get(5) as u8;
    ptl.profile_compatibility = bits.get(32) as u32;
    ptl.constraint_indicator_flags = bits.get(48);
    ptl.level_idc = bits.get(8) as u8;
    let mut profile_present = [false; 8];
    let mut level_present = [false; 8];
    if max_sub_layers_minus1 > 0 {
        for i in 0..max_sub_layers_minus1 as usize {
            profile_present[i] = bits.get(1) != 0;
            level_present[i] = bits.get(1) != 0;
        }
        for _ in max_sub_layers_minus1..8 {
            bits.get(2); // reserved_zero_2bits
        }
        for i in 0..max_sub_layers_minus1 as usize {
            if profile_present[i] {
                bits.get(32);
                bits.get(32);
                bits.get(24); // sub-layer profile syntax, 88 bits
            }
            if level_present[i] {
                bits.get(8);
            }
        }
    }
    bits.bs.status()?;
    Ok(ptl)
}

fn parse_short_term_ref_pic_set(
    bits: &mut Bits,
    num_delta_pocs: &mut [u32; 65],
    idx: usize,
) -> io::Result<()> {
    let inter_ref_pic_set_prediction_flag = if idx != 0 { bits.get(1) != 0 } else { false };
    if inter_ref_pic_set_prediction_flag {
        // delta_idx is only present in slice headers; in the SPS the
        // reference is always the previous set.
        bits.get(1); // delta_rps_sign
        bits.get_ue(); // abs_delta_rps_minus1
        let ref_idx = idx - 1;
        let mut count: u32 = 0;
        for _ in 0..=num_delta_pocs[ref_idx] {
            let used_by_curr_pic_flag = bits.get(1) != 0;
            let use_delta_flag = if !used_by_curr_pic_flag { bits.get(1) != 0 } else { true };
            if used_by_curr_pic_flag || use_delta_flag {
                count += 1;
            }
        }
        num_delta_pocs[idx] = count;
    } else {
        let num_negative_pics = bits.get_ue();
        let num_positive_pics = bits.get_ue();
        if num_negative_pics > 16 || num_positive_pics > 16 {
            return Err(ioerr!(InvalidData, "bad st_ref_pic_set sizes"));
        }
        num_delta_pocs[idx] = (num_negative_pics + num_positive_pics) as u32;
        for _ in 0..num_negative_pics + num_positive_pics {
            bits.get_ue(); // delta_poc_sX_minus1
            bits.get(1); // used_by_curr_pic_sX_flag
        }
    }
    bits.bs.status()
}

fn parse_sps_internal(rbsp: &mut Vec<u8>, ebsp: &[u8]) -> io::Result<Sps> {
    let mut bits = nalu::import_rbsp_from_ebsp(rbsp, ebsp)?;
    let mut sps = Sps::default();
    sps.video_parameter_set_id = bits.get(4) as u8;
    sps.max_sub_layers_minus1 = bits.get(3) as u8;
    sps.temporal_id_nesting_flag = bits.get(1) != 0;
    sps.ptl = parse_ptl(&mut bits, sps.max_sub_layers_minus1)?;
    let seq_parameter_set_id = bits.get_ue();
    if seq_parameter_set_id > 15 {
        return Err(ioerr!(InvalidData, "bad sps_seq_parameter_set_id"));
    }
    sps.seq_parameter_set_id = seq_parameter_set_id as u8;
    let chroma_format_idc = bits.get_ue();
    if chroma_format_idc > 3 {
        return Err(ioerr!(InvalidData, "bad chroma_format_idc"));
    }
    sps.chroma_format_idc = chroma_format_idc as u8;
    if sps.chroma_format_idc == 3 {
        sps.separate_colour_plane_flag = bits.get(1) != 0;
    }
    let pic_width_in_luma_samples = bits.get_ue();
    let pic_height_in_luma_samples = bits.get_ue();
    sps.cropped_width = pic_width_in_luma_samples as u32;
    sps.cropped_height = pic_height_in_luma_samples as u32;
    if bits.get(1) != 0 {
        // conformance_window_flag
        let sub_width_c: u64 = if matches!(sps.chroma_format_idc, 1 | 2) { 2 } else { 1 };
        let sub_height_c: u64 = if sps.chroma_format_idc == 1 { 2 } else { 1 };
        let left = bits.get_ue();
        let right = bits.get_ue();
        let top = bits.get_ue();
        let bottom = bits.get_ue();
        sps.cropped_width -= (sub_width_c * (left + right)) as u32;
        sps.cropped_height -= (sub_height_c * (top + bottom)) as u32;
    }
    let bit_depth_luma_minus8 = bits.get_ue();
    let bit_depth_chroma_minus8 = bits.get_ue();
    if bit_depth_luma_minus8 > 8 || bit_depth_chroma_minus8 > 8 {
        return Err(ioerr!(InvalidData, "bad bit depth"));
    }
    sps.bit_depth_luma_minus8 = bit_depth_luma_minus8 as u8;
    sps.bit_depth_chroma_minus8 = bit_depth_chroma_minus8 as u8;
    let log2_max_pic_order_cnt_lsb_minus4 = bits.get_ue();
    if log2_max_pic_order_cnt_lsb_minus4 > 12 {
        return Err(ioerr!(InvalidData, "bad log2_max_pic_order_cnt_lsb_minus4"));
    }
    sps.log2_max_pic_order_cnt_lsb = log2_max_pic_order_cnt_lsb_minus4 as u32 + 4;
    sps.max_pic_order_cnt_lsb = 1 << sps.log2_max_pic_order_cnt_lsb;
    let sub_layer_ordering_info_present = bits.get(1) != 0;
    let start = if sub_layer_ordering_info_present { 0 } else { sps.max_sub_layers_minus1 };
    for _ in start..=sps.max_sub_layers_minus1 {
        bits.get_ue(); // sps_max_dec_pic_buffering_minus1
        bits.get_ue(); // sps_max_num_reorder_pics
        bits.get_ue(); // sps_max_latency_increase_plus1
    }
    let log2_min_luma_coding_block_size_minus3 = bits.get_ue();
    let log2_diff_max_min_luma_coding_block_size = bits.get_ue();
    bits.get_ue(); // log2_min_luma_transform_block_size_minus2
    bits.get_ue(); // log2_diff_max_min_luma_transform_block_size
    bits.get_ue(); // max_transform_hierarchy_depth_inter
    bits.get_ue(); // max_transform_hierarchy_depth_intra
    // PicSizeInCtbsY drives the slice_segment_address length.
    let min_cb_log2 = log2_min_luma_coding_block_size_minus3 + 3;
    let ctb_log2 = min_cb_log2 + log2_diff_max_min_luma_coding_block_size;
    let ctb_size = 1u64 << ctb_log2;
    let width_in_ctbs = (pic_width_in_luma_samples + ctb_size - 1) / ctb_size;
    let height_in_ctbs = (pic_height_in_luma_samples + ctb_size - 1) / ctb_size;
    sps.pic_size_in_ctbs_y = width_in_ctbs * height_in_ctbs;
    if bits.get(1) != 0 {
        // scaling_list_enabled_flag
        if bits.get(1) != 0 {
            // sps_scaling_list_data_present_flag
            for size_id in 0..4 {
                let mut matrix_id = 0;
                while matrix_id < if size_id == 3 { 2 } else { 6 } {
                    if bits.get(1) == 0 {
                        bits.get_ue(); // scaling_list_pred_matrix_id_delta
                    } else {
                        let coef_num = 64.min(1 << (4 + (size_id << 1)));
                        if size_id > 1 {
                            bits.get_se(); // scaling_list_dc_coef_minus8
                        }
                        for _ in 0..coef_num {
                            bits.get_se(); // scaling_list_delta_coef
                        }
                    }
                    matrix_id += 1;
                }
            }
        }
    }
    bits.get(1); // amp_enabled_flag
    bits.get(1); // sample_adaptive_offset_enabled_flag
    if bits.get(1) != 0 {
        // pcm_enabled_flag
        bits.get(4); // pcm_sample_bit_depth_luma_minus1
        bits.get(4); // pcm_sample_bit_depth_chroma_minus1
        bits.get_ue(); // log2_min_pcm_luma_coding_block_size_minus3
        bits.get_ue(); // log2_diff_max_min_pcm_luma_coding_block_size
        bits.get(1); // pcm_loop_filter_disabled_flag
    }
    let num_short_term_ref_pic_sets = bits.get_ue();
    if num_short_term_ref_pic_sets > 64 {
        return Err(ioerr!(InvalidData, "bad num_short_term_ref_pic_sets"));
    }
    let mut num_delta_pocs = [0u32; 65];
    for i in 0..num_short_term_ref_pic_sets as usize {
        parse_short_term_ref_pic_set(&mut bits, &mut num_delta_pocs, i)?;
    }
    if bits.get(1) != 0 {
        // long_term_ref_pics_present_flag
        let num_long_term_ref_pics_sps = bits.get_ue();
        for _ in 0..num_long_term_ref_pics_sps {
            bits.get(sps.log2_max_pic_order_cnt_lsb); // lt_ref_pic_poc_lsb_sps
            bits.get(1); // used_by_curr_pic_lt_sps_flag
        }
    }
    bits.get(1); // sps_temporal_mvp_enabled_flag
    bits.get(1); // strong_intra_smoothing_enabled_flag
    if bits.get(1) != 0 {
        // vui_parameters()
        if bits.get(1) != 0 {
            // aspect_ratio_info_present_flag
            let aspect_ratio_idc = bits.get(8);
            if aspect_ratio_idc == 255 {
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
                sps.vui.matrix_coeffs = bits.get(8) as u16;
            }
        }
        if bits.get(1) != 0 {
            // chroma_loc_info_present_flag
            bits.get_ue();
            bits.get_ue();
        }
        bits.get(1); // neutral_chroma_indication_flag
        sps.vui.field_seq_flag = bits.get(1) != 0;
        bits.get(1); // frame_field_info_present_flag
        if bits.get(1) != 0 {
            // default_display_window_flag
            bits.get_ue();
            bits.get_ue();
            bits.get_ue();
            bits.get_ue();
        }
        if bits.get(1) != 0 {
            // vui_timing_info_present_flag
            sps.vui.num_units_in_tick = bits.get(32) as u32;
            sps.vui.time_scale = bits.get(32) as u32;
            if bits.get(1) != 0 {
                bits.get_ue(); // vui_num_ticks_poc_diff_one_minus1
            }
            if bits.get(1) != 0 {
                // vui_hrd_parameters_present_flag; don't walk into it.
                sps.vui.hrd.present = true;
            }
        }
    } else {
        sps.vui.num_units_in_tick = 1;
        sps.vui.time_scale = 50;
    }
    bits.bs.status()?;
    sps.present = true;
    Ok(sps)
}

struct HevcInfo {
    nalu_header:     NaluHeader,
    prev_nalu_type:  u8,
    ebsp_head_pos:   u64,
    sps_list:        Vec<Sps>,
    pps_list:        Vec<Pps>,
    sps:             Sps,
    pps:             Pps,
    sei:             Sei,
    slice:           SliceInfo,
    au:              AccessUnit,
    hvcc_param:      HevcParams,
    hvcc_param_next: HevcParams,
    hvcc_pending:    bool,
    rbsp:            Vec<u8>,
}

impl HevcInfo {
    fn new() -> HevcInfo {
        let mut info = HevcInfo {
            nalu_header: NaluHeader::default(),
            prev_nalu_type: NALU_TYPE_UNKNOWN,
            ebsp_head_pos: 0,
            sps_list: Vec::new(),
            pps_list: Vec::new(),
            sps: Sps::default(),
            pps: Pps::default(),
            sei: Sei::default(),
            slice: SliceInfo::default(),
            au: AccessUnit::default(),
            hvcc_param: HevcParams::default(),
            hvcc_param_next: HevcParams::default(),
            hvcc_pending: false,
            rbsp: Vec::new(),
        };
        info.hvcc_param.length_size_minus_one = (HEVC_DEFAULT_NALU_LENGTH_SIZE - 1) as u8;
        info.hvcc_param_next.length_size_minus_one = (HEVC_DEFAULT_NALU_LENGTH_SIZE - 1) as u8;
        info.au.data = vec![0u8; HEVC_DEFAULT_BUFFER_SIZE];
        info.au.incomplete_data = vec![0u8; HEVC_DEFAULT_BUFFER_SIZE];
        info
    }

    fn stored_sps(&self, sps_id: u8) -> Option<&Sps> {
        self.sps_list.iter().find(|sps| sps.seq_parameter_set_id == sps_id)
    }

    fn stored_pps(&self, pps_id: u8) -> Option<&Pps> {
        self.pps_list.iter().find(|pps| pps.pic_parameter_set_id == pps_id)
    }

    fn parse_sps(&mut self, ebsp: &[u8]) -> io::Result<()> {
        let mut rbsp = std::mem::replace(&mut self.rbsp, Vec::new());
        let result = parse_sps_internal(&mut rbsp, ebsp);
        self.rbsp = rbsp;
        let sps = result?;
        if let Some(stored) = self
            .sps_list
            .iter_mut()
            .find(|s| s.seq_parameter_set_id == sps.seq_parameter_set_id)
        {
            *stored = sps.clone();
        } else {
            self.sps_list.push(sps.clone());
        }
        self.sps = sps;
        Ok(())
    }

    fn parse_pps(&mut self, ebsp: &[u8]) -> io::Result<()> {
        let mut rbsp = std::mem::replace(&mut self.rbsp, Vec::new());
        let result = (|| {
            let mut bits = nalu::import_rbsp_from_ebsp(&mut rbsp, ebsp)?;
            let mut pps = Pps::default();
            let pic_parameter_set_id = bits.get_ue();
            if pic_parameter_set_id > 63 {
                return Err(ioerr!(InvalidData, "bad pps_pic_parameter_set_id"));
            }
            pps.pic_parameter_set_id = pic_parameter_set_id as u8;
            let seq_parameter_set_id = bits.get_ue();
            if seq_parameter_set_id > 15 {
                return Err(ioerr!(InvalidData, "bad pps_seq_parameter_set_id"));
            }
            pps.seq_parameter_set_id = seq_parameter_set_id as u8;
            pps.dependent_slice_segments_enabled_flag = bits.get(1) != 0;
            pps.output_flag_present_flag = bits.get(1) != 0;
            pps.num_extra_slice_header_bits = bits.get(3) as u8;
            bits.bs.status()?;
            pps.present = true;
            Ok(pps)
        })();
        self.rbsp = rbsp;
        let pps = result?;
        if let Some(stored) = self
            .pps_list
            .iter_mut()
            .find(|p| p.pic_parameter_set_id == pps.pic_parameter_set_id)
        {
            *stored = pps;
        } else {
            self.pps_list.push(pps);
        }
        self.pps = pps;
        Ok(())
    }

    fn parse_sei(&mut self, nalu_type: u8, ebsp: &[u8]) -> io::Result<()> {
        let mut rbsp = std::mem::replace(&mut self.rbsp, Vec::new());
        let result = (|| {
            let mut bits = nalu::import_rbsp_from_ebsp(&mut rbsp, ebsp)?;
            let mut rbsp_pos: usize = 0;
            loop {
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
                if nalu_type == NALU_TYPE_PREFIX_SEI && payload_type == 6 {
                    // recovery_point
                    self.sei.recovery_point.present = true;
                    self.sei.recovery_point.recovery_poc_cnt = bits.get_se() as i32;
                    bits.get(1); // exact_match_flag
                    self.sei.recovery_point.broken_link_flag = bits.get(1) != 0;
                } else if payload_type == 3 {
                    // filler_payload is forbidden in elementary streams.
                    return Err(ioerr!(InvalidData, "filler SEI in elementary stream"));
                }
                let payload_end = payload_start + payload_size as u64 * 8;
                let at = bits.bit_position();
                if payload_end > at {
                    let mut left = payload_end - at;
                    while left > 64 {
                        bits.get(64);
                        left -= 64;
                    }
                    bits.get(left as u32);
                }
                bits.get_align();
                rbsp_pos += payload_size as usize;
                if rbsp_pos >= rbsp.len() || rbsp[rbsp_pos] == 0x80 || bits.bs.error() {
                    break;
                }
            }
            bits.bs.status()
        })();
        self.rbsp = rbsp;
        result
    }

    fn parse_slice_segment_header(
        &mut self,
        nalu_header: &NaluHeader,
        ebsp: &[u8],
    ) -> io::Result<()> {
        let mut rbsp = std::mem::replace(&mut self.rbsp, Vec::new());
        let result = (|| {
            let mut bits = nalu::import_rbsp_from_ebsp(&mut rbsp, ebsp)?;
            let mut slice = SliceInfo::default();
            slice.nalu_type = nalu_header.nal_unit_type;
            slice.temporal_id = nalu_header.temporal_id;
            slice.first_slice_segment_in_pic_flag = bits.get(1) != 0;
            if is_irap(nalu_header.nal_unit_type) {
                bits.get(1); // no_output_of_prior_pics_flag
            }
            let pic_parameter_set_id = bits.get_ue();
            if pic_parameter_set_id > 63 {
                return Err(ioerr!(InvalidData, "bad slice_pic_parameter_set_id"));
            }
            slice.pic_parameter_set_id = pic_parameter_set_id as u8;
            let pps = *self
                .stored_pps(slice.pic_parameter_set_id)
                .ok_or_else(|| ioerr!(InvalidData, "slice refers to an unknown PPS"))?;
            let sps = self
                .stored_sps(pps.seq_parameter_set_id)
                .ok_or_else(|| ioerr!(InvalidData, "slice refers to an unknown SPS"))?
                .clone();
            if !slice.first_slice_segment_in_pic_flag {
                if pps.dependent_slice_segments_enabled_flag {
                    slice.dependent_slice_segment_flag = bits.get(1) != 0;
                }
                let address_length = ceil_log2(sps.pic_size_in_ctbs_y);
                bits.get(address_length); // slice_segment_address
            }
            if !slice.dependent_slice_segment_flag {
                for _ in 0..pps.num_extra_slice_header_bits {
                    bits.get(1);
                }
                let slice_type = bits.get_ue();
                if slice_type > 2 {
                    return Err(ioerr!(InvalidData, "bad slice_type"));
                }
                slice.r#type = slice_type as u8;
                if pps.output_flag_present_flag {
                    bits.get(1); // pic_output_flag
                }
                if sps.separate_colour_plane_flag {
                    bits.get(2); // colour_plane_id
                }
                if !is_idr(nalu_header.nal_unit_type) {
                    slice.pic_order_cnt_lsb =
                        bits.get(sps.log2_max_pic_order_cnt_lsb) as u32;
                }
            } else {
                // Dependent slice segments inherit everything relevant
                // from the preceding independent one.
                slice.r#type = self.slice.r#type;
                slice.pic_order_cnt_lsb = self.slice.pic_order_cnt_lsb;
            }
            bits.bs.status()?;
            self.sps = sps;
            self.pps = pps;
            self.slice = slice;
            Ok(())
        })();
        self.rbsp = rbsp;
        result
    }

    fn try_to_append_parameter_set(&mut self, ps_type: PsType, ps_data: &[u8]) -> io::Result<()> {
        let appendable = self.hvcc_param.check_appendable(ps_type, ps_data)?;
        let use_next = match appendable {
            Appendable::Duplicated => return Ok(()),
            Appendable::NewDcrRequired | Appendable::NewSampleEntryRequired => {
                self.hvcc_pending = true;
                true
            },
            Appendable::Possible => self.hvcc_pending,
        };
        match ps_type {
            PsType::Sps => self.parse_sps(&ps_data[2..])?,
            PsType::Pps => self.parse_pps(&ps_data[2..])?,
            PsType::Vps => {},
        }
        let param = if use_next {
            &mut self.hvcc_param_next
        } else {
            &mut self.hvcc_param
        };
        param.append_parameter_set(ps_type, ps_data)
    }

    fn move_pending_hvcc_param(&mut self) -> io::Result<()> {
        if !self.hvcc_pending {
            return Ok(());
        }
        for ps in self
            .hvcc_param
            .vps_list
            .iter_mut()
            .chain(self.hvcc_param.sps_list.iter_mut())
            .chain(self.hvcc_param.pps_list.iter_mut())
        {
            ps.unused = true;
        }
        for &ps_type in &[PsType::Vps, PsType::Sps, PsType::Pps] {
            let src: Vec<DcrPsEntry> =
                std::mem::replace(self.hvcc_param_next.ps_list_mut(ps_type), Vec::new());
            for src_ps in src {
                let src_id = HevcParams::ps_id_of(ps_type, &src_ps.nal_unit)?;
                match self.hvcc_param.find_ps(ps_type, src_id) {
                    Some(index) => {
                        let entry = &mut self.hvcc_param.ps_list_mut(ps_type)[index];
                        entry.nal_unit = src_ps.nal_unit;
                        entry.unused = false;
                    },
                    None => self.hvcc_param.ps_list_mut(ps_type).push(src_ps),
                }
            }
        }
        let length_size = self.hvcc_param.length_size_minus_one;
        let lists_kept = (
            std::mem::replace(&mut self.hvcc_param.vps_list, Vec::new()),
            std::mem::replace(&mut self.hvcc_param.sps_list, Vec::new()),
            std::mem::replace(&mut self.hvcc_param.pps_list, Vec::new()),
        );
        self.hvcc_param = self.hvcc_param_next.clone();
        self.hvcc_param.vps_list = lists_kept.0;
        self.hvcc_param.sps_list = lists_kept.1;
        self.hvcc_param.pps_list = lists_kept.2;
        self.hvcc_param.length_size_minus_one = length_size;
        self.hvcc_param_next = HevcParams::default();
        self.hvcc_param_next.length_size_minus_one = (HEVC_DEFAULT_NALU_LENGTH_SIZE - 1) as u8;
        self.hvcc_pending = false;
        Ok(())
    }

    /// Merge one slice into the picture of the current access unit.
    fn update_picture_info_for_slice(&mut self, slice: SliceInfo) {
        let picture = &mut self.au.picture;
        if !picture.has_primary {
            picture.temporal_id = slice.temporal_id;
            picture.independent = slice.r#type == 2;
        } else {
            // The AU's TemporalId is the minimum over its VCL NAL units,
            // and it is only intra when every slice is.
            picture.temporal_id = picture.temporal_id.min(slice.temporal_id);
            picture.independent &= slice.r#type == 2;
        }
        picture.has_primary = true;
        self.slice.present = false;
    }

    /// Finalize the picture from its last slice.
    fn update_picture_info(&mut self, slice: SliceInfo) {
        {
            let picture = &mut self.au.picture;
            picture.nalu_type = slice.nalu_type;
            picture.irap = is_irap(slice.nalu_type);
            picture.idr = is_idr(slice.nalu_type);
            picture.broken_link = is_bla(slice.nalu_type);
            picture.radl =
                slice.nalu_type == NALU_TYPE_RADL_N || slice.nalu_type == NALU_TYPE_RADL_R;
            picture.rasl =
                slice.nalu_type == NALU_TYPE_RASL_N || slice.nalu_type == NALU_TYPE_RASL_R;
            picture.sublayer_nonref = is_sublayer_nonref(slice.nalu_type);
            picture.pic_order_cnt_lsb = slice.pic_order_cnt_lsb;
            picture.random_accessible = picture.irap;
            // Closed random access: no leading pictures may follow.
            picture.closed_rap = slice.nalu_type == NALU_TYPE_IDR_N_LP
                || slice.nalu_type == NALU_TYPE_BLA_N_LP;
            picture.field_coded = self.sps.vui.field_seq_flag;
            picture.delta = if picture.field_coded { 1 } else { 2 };
        }
        self.update_picture_info_for_slice(slice);
        if self.sei.recovery_point.present {
            let picture = &mut self.au.picture;
            picture.random_accessible = true;
            picture.recovery_poc_cnt = self.sei.recovery_point.recovery_poc_cnt;
            picture.broken_link |= self.sei.recovery_point.broken_link_flag;
            self.sei.recovery_point.present = false;
        }
    }

    fn calculate_poc(&mut self, prev: &PrevPicture) -> io::Result<()> {
        let sps = &self.sps;
        let picture = &mut self.au.picture;
        // NoRaslOutputFlag: the first picture, every IDR and every BLA.
        let no_rasl_output = picture.first || picture.idr || picture.broken_link;
        let poc_lsb = picture.pic_order_cnt_lsb as i64;
        let max_poc_lsb = sps.max_pic_order_cnt_lsb as i64;
        let poc_msb: i64 = if picture.irap && no_rasl_output {
            0
        } else {
            let prev_poc_lsb = prev.poc_lsb as i64;
            let prev_poc_msb = prev.poc_msb as i64;
            if poc_lsb < prev_poc_lsb && prev_poc_lsb - poc_lsb >= max_poc_lsb / 2 {
                prev_poc_msb + max_poc_lsb
            } else if poc_lsb > prev_poc_lsb && poc_lsb - prev_poc_lsb > max_poc_lsb / 2 {
                prev_poc_msb - max_poc_lsb
            } else {
                prev_poc_msb
            }
        };
        let poc = poc_msb + poc_lsb;
        if poc < i32::min_value() as i64 || poc > i32::max_value() as i64 {
            return Err(ioerr!(InvalidData, "POC arithmetic overflows 32 bits"));
        }
        picture.poc = poc as i32;
        // Remember the previous tid0 reference picture.
        if picture.temporal_id == 0
            && !picture.radl
            && !picture.rasl
            && !picture.sublayer_nonref
        {
            picture.prev_poc_msb = poc_msb as i32;
            picture.prev_poc_lsb = picture.pic_order_cnt_lsb;
        } else {
            picture.prev_poc_msb = prev.poc_msb;
            picture.prev_poc_lsb = prev.poc_lsb;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct PrevPicture {
    poc_msb: i32,
    poc_lsb: u32,
}

impl PrevPicture {
    fn of(picture: &PictureInfo) -> PrevPicture {
        PrevPicture {
            poc_msb: picture.prev_poc_msb,
            poc_lsb: picture.prev_poc_lsb,
        }
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

fn find_au_delimit_by_nalu_type(nalu_type: u8, prev_nalu_type: u8) -> bool {
    matches!(
        nalu_type,
        NALU_TYPE_VPS | NALU_TYPE_SPS | NALU_TYPE_PPS | NALU_TYPE_AUD | NALU_TYPE_PREFIX_SEI
    ) && is_vcl(prev_nalu_type)
}

fn check_nalu_header(sb: &mut Sb, use_long_start_code: bool) -> io::Result<NaluHeader> {
    if sb.remainder() < 2 {
        return Err(ioerr!(UnexpectedEof, "truncated NAL unit header"));
    }
    let byte0 = sb.get_byte();
    let byte1 = sb.get_byte();
    if byte0 & 0x80 != 0 {
        return Err(ioerr!(InvalidData, "forbidden_zero_bit is set"));
    }
    let header = NaluHeader {
        nal_unit_type: (byte0 >> 1) & 0x3f,
        nuh_layer_id:  ((byte0 & 0x01) << 5) | (byte1 >> 3),
        temporal_id:   (byte1 & 0x07).wrapping_sub(1),
        length:        2,
    };
    if byte1 & 0x07 == 0 {
        return Err(ioerr!(InvalidData, "nuh_temporal_id_plus1 is zero"));
    }
    if header.nal_unit_type > NALU_TYPE_SUFFIX_SEI {
        return Err(ioerr!(InvalidData, "unsupported NAL unit type {}", header.nal_unit_type));
    }
    if !use_long_start_code
        && matches!(
            header.nal_unit_type,
            NALU_TYPE_VPS | NALU_TYPE_SPS | NALU_TYPE_PPS | NALU_TYPE_AUD
        )
    {
        return Err(ioerr!(InvalidData, "parameter set with a short start code"));
    }
    Ok(header)
}

fn append_nalu_to_au(au: &mut AccessUnit, src_nalu: &[u8], probe: bool) {
    if !probe {
        let needed = au.incomplete_length + HEVC_DEFAULT_NALU_LENGTH_SIZE + src_nalu.len();
        if au.incomplete_data.len() < needed {
            au.incomplete_data.resize(needed, 0);
        }
        let start = au.incomplete_length;
        au.incomplete_data[start..start + 4].copy_from_slice(&(src_nalu.len() as u32).to_be_bytes());
        au.incomplete_data[start + 4..start + 4 + src_nalu.len()].copy_from_slice(src_nalu);
    }
    au.incomplete_length += HEVC_DEFAULT_NALU_LENGTH_SIZE + src_nalu.len();
}

fn complete_au(au: &mut AccessUnit, probe: bool) -> bool {
    if !au.picture.has_primary || au.incomplete_length == 0 {
        return false;
    }
    if !probe {
        if au.data.len() < au.incomplete_length {
            au.data.resize(au.incomplete_length, 0);
        }
        au.data[..au.incomplete_length].copy_from_slice(&au.incomplete_data[..au.incomplete_length]);
    }
    au.temporal_id = au.picture.temporal_id;
    au.length = au.incomplete_length;
    au.incomplete_length = 0;
    au.picture.has_primary = false;
    true
}

pub(crate) struct HevcImporter {
    status:                         ImportStatus,
    info:                           HevcInfo,
    hvcc_list:                      Vec<HevcParams>,
    hvcc_number:                    usize,
    ts_list:                        Vec<MediaTs>,
    max_au_length:                  usize,
    num_undecodable:                u32,
    last_delta:                     u32,
    last_intra_cts:                 u64,
    composition_reordering_present: bool,
    field_pic_present:              bool,
    max_temporal_id:                u8,
}

impl HevcImporter {
    fn new() -> HevcImporter {
        HevcImporter {
            status: ImportStatus::Ok,
            info: HevcInfo::new(),
            hvcc_list: Vec::new(),
            hvcc_number: 0,
            ts_list: Vec::new(),
            max_au_length: 0,
            num_undecodable: 0,
            last_delta: 0,
            last_intra_cts: 0,
            composition_reordering_present: false,
            field_pic_present: false,
            max_temporal_id: 0,
        }
    }

    fn get_access_unit_internal(&mut self, sb: &mut Sb, probe: bool) -> io::Result<()> {
        let info = &mut self.info;
        let mut nalu_header = info.nalu_header;
        let mut consecutive_zero_byte_count: u64 = 0;
        let mut ebsp_length: u64 = 0;
        let mut complete = false;
        info.au.length = 0;
        info.au.picture.random_accessible = false;
        info.au.picture.recovery_poc_cnt = 0;
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
                complete_au(&mut info.au, probe);
                info.nalu_header = nalu_header;
                if info.au.incomplete_length == 0 {
                    self.status = ImportStatus::Eof;
                } else if self.status != ImportStatus::Change {
                    self.status = ImportStatus::Ok;
                }
                info.au.number += 1;
                return Ok(());
            }
            let next_nalu_head_pos = info.ebsp_head_pos
                + ebsp_length
                + if !no_more { nalu::SHORT_START_CODE_LENGTH as u64 } else { 0 };
            let mut next_short_start_code_pos = sb.pos();
            let nalu_type = nalu_header.nal_unit_type;
            let mut read_back = false;
            if nalu_type == NALU_TYPE_FD {
                if info.sps.vui.hrd.present {
                    return Err(ioerr!(InvalidData, "filler data with HRD timing"));
                }
            } else if nalu_type <= NALU_TYPE_RASL_R
                || (NALU_TYPE_BLA_W_LP..=NALU_TYPE_CRA).contains(&nalu_type)
                || (NALU_TYPE_VPS..=NALU_TYPE_SUFFIX_SEI).contains(&nalu_type)
            {
                ebsp_length -= consecutive_zero_byte_count;
                let nalu_length = (nalu_header.length as u64 + ebsp_length) as usize;
                let possible_au_length =
                    info.au.incomplete_length + HEVC_DEFAULT_NALU_LENGTH_SIZE + nalu_length;
                if sb.buffer_size() < possible_au_length {
                    sb.resize(2 * possible_au_length);
                    next_short_start_code_pos = sb.pos();
                }
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
                if is_vcl(nalu_type) {
                    // VCL NALU (slice segment)
                    let prev_slice = info.slice;
                    {
                        let window = sb.window();
                        let ebsp = &window[nalu_header.length as usize..nalu_length];
                        info.parse_slice_segment_header(&nalu_header, ebsp)?;
                    }
                    if probe && info.hvcc_pending {
                        self.hvcc_list.push(info.hvcc_param.clone());
                    }
                    info.move_pending_hvcc_param()?;
                    if prev_slice.present {
                        if info.slice.first_slice_segment_in_pic_flag {
                            info.update_picture_info(prev_slice);
                            complete = complete_au(&mut info.au, probe);
                        } else {
                            info.update_picture_info_for_slice(prev_slice);
                        }
                    }
                    {
                        let window = sb.window();
                        append_nalu_to_au(&mut info.au, &window[..nalu_length], probe);
                    }
                    info.slice.present = true;
                } else {
                    if find_au_delimit_by_nalu_type(nalu_type, info.prev_nalu_type) {
                        let slice = info.slice;
                        if slice.present {
                            info.update_picture_info(slice);
                            complete = complete_au(&mut info.au, probe);
                        }
                    } else if no_more {
                        complete = complete_au(&mut info.au, probe);
                    }
                    match nalu_type {
                        NALU_TYPE_PREFIX_SEI | NALU_TYPE_SUFFIX_SEI => {
                            {
                                let window = sb.window();
                                let ebsp = &window[nalu_header.length as usize..nalu_length];
                                info.parse_sei(nalu_type, ebsp)?;
                            }
                            let window = sb.window();
                            append_nalu_to_au(&mut info.au, &window[..nalu_length], probe);
                        },
                        NALU_TYPE_VPS => {
                            let ps = sb.window()[..nalu_length].to_vec();
                            info.try_to_append_parameter_set(PsType::Vps, &ps)?;
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
                        _ => {
                            let window = sb.window();
                            append_nalu_to_au(&mut info.au, &window[..nalu_length], probe);
                        },
                    }
                    if info.hvcc_pending {
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
            sb.update(1)?;
            let no_more_buf = sb.remainder() == 0;
            ebsp_length = 0;
            let no_more = sb.is_eos() && no_more_buf;
            if !no_more {
                nalu_header = check_nalu_header(sb, consecutive_zero_byte_count != 0)?;
                info.ebsp_head_pos = next_nalu_head_pos + nalu_header.length as u64;
            } else if info.au.incomplete_length != 0 && info.au.length == 0 {
                let slice = info.slice;
                info.update_picture_info(slice);
                complete_au(&mut info.au, probe);
                info.nalu_header = nalu_header;
                self.status = ImportStatus::Eof;
                info.au.number += 1;
                return Ok(());
            }
            if complete {
                info.nalu_header = nalu_header;
                if sb.is_eos() && sb.remainder() == 0 && info.au.incomplete_length == 0 {
                    self.status = ImportStatus::Eof;
                } else if self.status != ImportStatus::Change {
                    self.status = ImportStatus::Ok;
                }
                info.au.number += 1;
                return Ok(());
            }
            consecutive_zero_byte_count = 0;
        }
    }

    fn create_summary(&self, param: &HevcParams) -> io::Result<VideoSummary> {
        let sps = &self.info.sps;
        let mut summary = VideoSummary::default();
        summary.sample_type = FourCc::new(b"hvc1");
        summary.max_au_length = self.max_au_length;
        summary.timescale = sps.vui.time_scale;
        summary.timebase = sps.vui.num_units_in_tick;
        summary.vfr = true; // constantFrameRate is never asserted
        summary.sample_per_field = self.field_pic_present;
        summary.width = sps.cropped_width;
        summary.height = sps.cropped_height;
        summary.par_h = sps.vui.sar_width;
        summary.par_v = sps.vui.sar_height;
        // Value 2 stands for unspecified.
        summary.color.primaries_index =
            if sps.vui.colour_primaries != 2 { sps.vui.colour_primaries } else { 0 };
        summary.color.transfer_index =
            if sps.vui.transfer_characteristics != 2 { sps.vui.transfer_characteristics } else { 0 };
        summary.color.matrix_index =
            if sps.vui.matrix_coeffs != 2 { sps.vui.matrix_coeffs } else { 0 };
        summary.color.full_range = sps.vui.video_full_range_flag;
        summary
            .codec_specific
            .push(CodecSpecific::new(CodecSpecificKind::Hevc, create_hevc_specific_info(param)?));
        Ok(summary)
    }
}

pub(crate) fn probe(sb: &mut Sb) -> io::Result<(Box<dyn CodecImporter>, Summary)> {
    let mut importer = HevcImporter::new();
    sb.set_pos(0);
    sb.read(0)?;
    loop {
        if nalu::check_next_long_start_code(sb.window()) {
            break;
        }
        if sb.remainder() <= nalu::LONG_START_CODE_LENGTH {
            return Err(ioerr!(InvalidData, "not an HEVC byte stream"));
        }
        if sb.get_byte() != 0 {
            return Err(ioerr!(InvalidData, "not an HEVC byte stream"));
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
    importer.info.prev_nalu_type = NALU_TYPE_UNKNOWN;
    let mut npt: Vec<NalPicTiming> = Vec::with_capacity(1 << 12);
    log::debug!("analyzing stream as HEVC");
    while importer.status != ImportStatus::Eof {
        let prev_picture = PrevPicture::of(&importer.info.au.picture);
        importer.info.au.picture.first = npt.is_empty();
        importer.get_access_unit_internal(sb, true)?;
        importer.info.calculate_poc(&prev_picture)?;
        let picture = &importer.info.au.picture;
        importer.field_pic_present |= picture.field_coded;
        npt.push(NalPicTiming {
            poc:       picture.poc as i64,
            delta:     picture.delta,
            poc_delta: 1,
            reset:     false,
        });
        importer.max_au_length = importer.max_au_length.max(importer.info.au.length);
        importer.max_temporal_id = importer.max_temporal_id.max(importer.info.au.temporal_id);
    }
    let num_access_units = npt.len();
    if num_access_units == 0 {
        return Err(ioerr!(InvalidData, "no access units in the stream"));
    }
    importer.hvcc_list.push(importer.info.hvcc_param.clone());
    let first_param = importer.hvcc_list[0].clone();
    importer.hvcc_number = 1;
    for timing in &npt {
        if timing.poc == 0 {
            break;
        }
        importer.num_undecodable += 1;
    }
    let mut max_composition_delay = 0;
    nalu::deduplicate_poc(&mut npt, &mut max_composition_delay, num_access_units, 15);
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
    // Picture timing is held in fields; time_scale is frame-level, so
    // double it before reducing.
    let mut timescale = summary.timescale * 2;
    nalu::reduce_timescale(&mut timestamp, &npt, &mut importer.last_delta, &mut timescale, num_access_units);
    summary.timescale = timescale;
    importer.ts_list = timestamp;
    // Back to the first NALU for the delivery pass.
    sb.stream_seek(first_ebsp_head_pos)?;
    sb.set_pos(0);
    sb.read(0)?;
    importer.status = ImportStatus::Ok;
    importer.info.nalu_header = first_nalu_header;
    importer.info.ebsp_head_pos = first_ebsp_head_pos;
    importer.info.prev_nalu_type = NALU_TYPE_UNKNOWN;
    let au = &mut importer.info.au;
    let data = std::mem::replace(&mut au.data, Vec::new());
    let incomplete_data = std::mem::replace(&mut au.incomplete_data, Vec::new());
    *au = AccessUnit::default();
    au.data = data;
    au.incomplete_data = incomplete_data;
    importer.info.slice = SliceInfo::default();
    importer.info.sps = Sps::default();
    importer.info.pps = Pps::default();
    importer.info.sei = Sei::default();
    importer.info.hvcc_param.vps_list.clear();
    importer.info.hvcc_param.sps_list.clear();
    importer.info.hvcc_param.pps_list.clear();
    importer.info.hvcc_param_next = HevcParams::default();
    importer.info.hvcc_param_next.length_size_minus_one = (HEVC_DEFAULT_NALU_LENGTH_SIZE - 1) as u8;
    importer.info.hvcc_pending = false;
    Ok((Box::new(importer), Summary::Video(summary)))
}

impl CodecImporter for HevcImporter {
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
        if self.status == ImportStatus::Change && !self.info.hvcc_pending {
            current_status = ImportStatus::Change;
        }
        if self.info.au.length == 0 {
            sample.length = 0;
            return Ok(ImportStatus::Eof);
        }
        if current_status == ImportStatus::Change {
            let param = self
                .hvcc_list
                .get(self.hvcc_number)
                .cloned()
                .ok_or_else(|| ioerr!(InvalidData, "no pending decoder configuration"))?;
            self.hvcc_number += 1;
            *summary = Summary::Video(self.create_summary(&param)?);
            self.status = ImportStatus::Ok;
        }
        let au = &self.info.au;
        let picture = &au.picture;
        let ts = self
            .ts_list
            .get(au.number as usize - 1)
            .copied()
            .ok_or_else(|| ioerr!(InvalidData, "more access units than the probe pass saw"))?;
        sample.dts = ts.dts;
        sample.cts = ts.cts;
        sample.prop = Default::default();
        // Sub-layer non-reference pictures of the highest sub-layer are
        // never referenced by later pictures in decoding order.
        sample.prop.disposable =
            picture.sublayer_nonref && au.temporal_id == self.max_temporal_id;
        if picture.radl || picture.rasl {
            sample.prop.leading = if picture.radl {
                Leading::DecodableLeading
            } else {
                Leading::UndecodableLeading
            };
        } else if (au.number as u32) < self.num_undecodable {
            sample.prop.leading = Leading::UndecodableLeading;
        } else if picture.independent || sample.cts >= self.last_intra_cts {
            sample.prop.leading = Leading::NotLeading;
        } else {
            sample.prop.leading = Leading::UndecodableLeading;
        }
        if picture.independent {
            self.last_intra_cts = sample.cts;
        }
        sample.prop.independent = picture.independent;
        sample.prop.redundant = false;
        sample.prop.post_roll.identifier = picture.poc as u32;
        if picture.random_accessible {
            if picture.irap {
                sample.prop.ra_flags = RA_FLAG_SYNC;
                if picture.closed_rap {
                    sample.prop.ra_flags |= RA_FLAG_CLOSED_RAP;
                } else {
                    sample.prop.ra_flags |= RA_FLAG_RAP;
                }
            } else if picture.recovery_poc_cnt != 0 {
                sample.prop.ra_flags = RA_FLAG_POST_ROLL_START;
                sample.prop.post_roll.complete =
                    (picture.poc + picture.recovery_poc_cnt) as u32;
            } else {
                sample.prop.ra_flags = RA_FLAG_RAP;
            }
        }
        sample.length = au.length;
        sample.data[..au.length].copy_from_slice(&au.data[..au.length]);
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

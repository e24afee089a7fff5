//! SMPTE VC-1 advanced-profile byte streams (SMPTE 421M).
//!
//! The stream is a train of EBDUs, each prefixed with 0x000001 and a BDU
//! type in [0x0A, 0x0F]. Sequence and entry-point headers steer the random
//! access properties of the frames that follow; B pictures are recognized
//! from the picture layer to rebuild composition timestamps.
use std::io;

use crate::bits::Bits;
use crate::bs::Bs;
use crate::codec::nalu::{self, MediaTs};
use crate::importer::{CodecImporter, ImportStatus};
use crate::sample::{Leading, Sample, RA_FLAG_SYNC};
use crate::sbuf::Sb;
use crate::summary::{CodecSpecific, CodecSpecificKind, FourCc, Summary, VideoSummary};

const VC1_DEFAULT_BUFFER_SIZE: usize = 1 << 16;
const START_CODE_PREFIX_LENGTH: usize = 3;
const START_CODE_LENGTH: usize = 4;

pub const BDU_TYPE_EOS: u8 = 0x0a;
pub const BDU_TYPE_SLICE: u8 = 0x0b;
pub const BDU_TYPE_FIELD: u8 = 0x0c;
pub const BDU_TYPE_FRAME: u8 = 0x0d;
pub const BDU_TYPE_ENTRY_POINT: u8 = 0x0e;
pub const BDU_TYPE_SEQUENCE: u8 = 0x0f;

#[derive(Clone, Debug, Default, PartialEq)]
struct SequenceHeader {
    present:               bool,
    level:                 u8,
    colordiff_format:      u8,
    interlace:             bool,
    tfcntrflag:            bool,
    finterpflag:           bool,
    psf:                   bool,
    pulldown:              bool,
    max_coded_width:       u32,
    max_coded_height:      u32,
    disp_horiz_size:       u32,
    disp_vert_size:        u32,
    aspect_width:          u16,
    aspect_height:         u16,
    framerate_flag:        bool,
    framerate_numerator:   u32,
    framerate_denominator: u32,
    color_prim:            u16,
    transfer_char:         u16,
    matrix_coef:           u16,
    hrd_param_flag:        bool,
    hrd_num_leaky_buckets: u8,
    ebdu:                  Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct EntryPointHeader {
    present:            bool,
    broken_link:        bool,
    closed_entry_point: bool,
    ebdu:               Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default)]
struct PictureInfo {
    present:           bool,
    independent:       bool,
    disposable:        bool,
    non_bipredictive:  bool,
    random_accessible: bool,
    closed_gop:        bool,
    start_of_sequence: bool,
}

#[derive(Clone, Debug, Default)]
struct AccessUnit {
    data:                   Vec<u8>,
    data_length:            usize,
    incomplete_data:        Vec<u8>,
    incomplete_data_length: usize,
    number:                 u32,
    independent:            bool,
    disposable:             bool,
    non_bipredictive:       bool,
    random_accessible:      bool,
    closed_gop:             bool,
}

/// Fields serialized into the `dvc1` box.
#[derive(Clone, Debug, Default)]
pub struct Vc1Params {
    pub level:             u8,
    pub cbr:               bool,
    pub interlaced:        bool,
    pub multiple_sequence: bool,
    pub multiple_entry:    bool,
    pub slice_present:     bool,
    pub bframe_present:    bool,
    pub framerate:         u32,
    pub seqhdr_data:       Vec<u8>,
    pub ephdr_data:        Vec<u8>,
}

/// Serialize a `dvc1` box.
pub fn create_vc1_specific_info(param: &Vc1Params) -> io::Result<Vec<u8>> {
    if param.seqhdr_data.is_empty() || param.ephdr_data.is_empty() {
        return Err(ioerr!(InvalidInput, "sequence or entry-point header missing"));
    }
    let mut bits = Bits::new(Bs::new());
    bits.put(32, 0); // box size, patched below
    bits.put(32, u32::from_be_bytes(*b"dvc1") as u64);
    bits.put(4, 12); // profile: advanced
    bits.put(3, param.level as u64);
    bits.put(1, 0); // reserved
    // VC1AdvDecSpecStruc
    bits.put(3, param.level as u64);
    bits.put(1, param.cbr as u64);
    bits.put(6, 0); // reserved
    bits.put(1, !param.interlaced as u64); // no_interlace
    bits.put(1, !param.multiple_sequence as u64); // no_multiple_seq
    bits.put(1, !param.multiple_entry as u64); // no_multiple_entry
    bits.put(1, !param.slice_present as u64); // no_slice_code
    bits.put(1, !param.bframe_present as u64); // no_bframe
    bits.put(1, 0); // reserved
    bits.put(24, param.framerate as u64);
    bits.put_align();
    bits.bs.put_bytes(&param.seqhdr_data);
    bits.bs.put_bytes(&param.ephdr_data);
    bits.bs.status()?;
    let mut data = bits
        .export_data()
        .ok_or_else(|| ioerr!(Other, "empty dvc1 payload"))?;
    let size = data.len() as u32;
    data[..4].copy_from_slice(&size.to_be_bytes());
    Ok(data)
}

/// Recover the scalar `dvc1` fields (headers stay serialized).
pub fn parse_vc1_specific_info(data: &[u8]) -> io::Result<Vc1Params> {
    if data.len() < 8 + 7 || &data[4..8] != b"dvc1" {
        return Err(ioerr!(InvalidData, "not a dvc1 box"));
    }
    let mut bits = Bits::new(Bs::new());
    bits.import_data(&data[8..])?;
    if bits.get(4) != 12 {
        return Err(ioerr!(InvalidData, "not an advanced-profile dvc1"));
    }
    let mut param = Vc1Params::default();
    param.level = bits.get(3) as u8;
    bits.get(1);
    bits.get(3); // level, again
    param.cbr = bits.get(1) != 0;
    bits.get(6);
    param.interlaced = bits.get(1) == 0;
    param.multiple_sequence = bits.get(1) == 0;
    param.multiple_entry = bits.get(1) == 0;
    param.slice_present = bits.get(1) == 0;
    param.bframe_present = bits.get(1) == 0;
    bits.get(1);
    param.framerate = bits.get(24) as u32;
    bits.bs.status()?;
    Ok(param)
}

// VC-1 shares the 0x03 emulation prevention scheme.
fn import_rbdu(rbdu: &mut Vec<u8>, ebdu_payload: &[u8]) -> io::Result<Bits> {
    nalu::import_rbsp_from_ebsp(rbdu, ebdu_payload)
}

fn parse_sequence_header(ebdu: &[u8], rbdu: &mut Vec<u8>) -> io::Result<SequenceHeader> {
    let mut bits = import_rbdu(rbdu, &ebdu[START_CODE_LENGTH..])?;
    let mut sequence = SequenceHeader::default();
    if bits.get(2) != 3 {
        return Err(ioerr!(InvalidData, "only the advanced profile is supported"));
    }
    sequence.level = bits.get(3) as u8;
    sequence.colordiff_format = bits.get(2) as u8;
    bits.get(3); // frmrtq_postproc
    bits.get(5); // bitrtq_postproc
    bits.get(1); // postprocflag
    sequence.max_coded_width = 2 * (bits.get(12) as u32 + 1);
    sequence.max_coded_height = 2 * (bits.get(12) as u32 + 1);
    sequence.pulldown = bits.get(1) != 0;
    sequence.interlace = bits.get(1) != 0;
    sequence.tfcntrflag = bits.get(1) != 0;
    sequence.finterpflag = bits.get(1) != 0;
    bits.get(1); // reserved
    sequence.psf = bits.get(1) != 0;
    sequence.disp_horiz_size = sequence.max_coded_width;
    sequence.disp_vert_size = sequence.max_coded_height;
    if bits.get(1) != 0 {
        // display_ext
        sequence.disp_horiz_size = bits.get(14) as u32 + 1;
        sequence.disp_vert_size = bits.get(14) as u32 + 1;
        if bits.get(1) != 0 {
            // aspect_ratio_flag
            let aspect_ratio = bits.get(4);
            if aspect_ratio == 15 {
                sequence.aspect_width = bits.get(8) as u16 + 1;
                sequence.aspect_height = bits.get(8) as u16 + 1;
            } else {
                const ASPECT_RATIO_TABLE: [(u16, u16); 14] = [
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
                ];
                if let Some(&(w, h)) = ASPECT_RATIO_TABLE.get(aspect_ratio as usize) {
                    sequence.aspect_width = w;
                    sequence.aspect_height = h;
                }
            }
        }
        sequence.framerate_flag = bits.get(1) != 0;
        if sequence.framerate_flag {
            if bits.get(1) == 0 {
                // frame rate from the nr/dr code pair
                const FRAMERATE_NR_TABLE: [u32; 8] = [0, 24, 25, 30, 50, 60, 48, 72];
                const FRAMERATE_DR_TABLE: [u32; 3] = [0, 1000, 1001];
                let nr = bits.get(8) as usize;
                let dr = bits.get(4) as usize;
                if nr == 0 || nr > 7 || dr == 0 || dr > 2 {
                    return Err(ioerr!(InvalidData, "bad frame rate code"));
                }
                sequence.framerate_numerator = FRAMERATE_NR_TABLE[nr] * 1000;
                sequence.framerate_denominator = FRAMERATE_DR_TABLE[dr];
            } else {
                // framerateexp: (value + 1) / 32 frames per second
                sequence.framerate_numerator = bits.get(16) as u32 + 1;
                sequence.framerate_denominator = 32;
            }
        }
        if bits.get(1) != 0 {
            // color_format_flag
            sequence.color_prim = bits.get(8) as u16;
            sequence.transfer_char = bits.get(8) as u16;
            sequence.matrix_coef = bits.get(8) as u16;
        }
    }
    sequence.hrd_param_flag = bits.get(1) != 0;
    if sequence.hrd_param_flag {
        sequence.hrd_num_leaky_buckets = bits.get(5) as u8;
        bits.get(4); // bitrate_exponent
        bits.get(4); // buffer_size_exponent
        for _ in 0..sequence.hrd_num_leaky_buckets {
            bits.get(16); // hrd_rate
            bits.get(16); // hrd_buffer
        }
    }
    bits.bs.status()?;
    sequence.present = true;
    sequence.ebdu = ebdu.to_vec();
    Ok(sequence)
}

fn parse_entry_point_header(
    ebdu: &[u8],
    sequence: &SequenceHeader,
    rbdu: &mut Vec<u8>,
) -> io::Result<EntryPointHeader> {
    let mut bits = import_rbdu(rbdu, &ebdu[START_CODE_LENGTH..])?;
    let mut entry_point = EntryPointHeader::default();
    entry_point.broken_link = bits.get(1) != 0;
    entry_point.closed_entry_point = bits.get(1) != 0;
    bits.get(1); // panscan_flag
    bits.get(1); // refdist_flag
    bits.get(1); // loopfilter
    bits.get(1); // fastuvmc
    let extended_mv = bits.get(1);
    bits.get(2); // dquant
    bits.get(1); // vstransform
    bits.get(1); // overlap
    bits.get(2); // quantizer
    if sequence.hrd_param_flag {
        for _ in 0..sequence.hrd_num_leaky_buckets {
            bits.get(8); // hrd_full
        }
    }
    if bits.get(1) != 0 {
        // coded_size_flag
        bits.get(12); // coded_width
        bits.get(12); // coded_height
    }
    if extended_mv != 0 {
        bits.get(1); // extended_dmv
    }
    if bits.get(1) != 0 {
        bits.get(3); // range_mapy
    }
    if bits.get(1) != 0 {
        bits.get(3); // range_mapuv
    }
    bits.bs.status()?;
    entry_point.present = true;
    entry_point.ebdu = ebdu.to_vec();
    Ok(entry_point)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameCodingMode {
    Progressive,
    FrameInterlace,
    FieldInterlace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PictureType {
    P,
    B,
    I,
    Bi,
    Skipped,
}

fn parse_advanced_picture(
    ebdu: &[u8],
    sequence: &SequenceHeader,
    picture: &mut PictureInfo,
    rbdu: &mut Vec<u8>,
) -> io::Result<()> {
    let mut bits = import_rbdu(rbdu, &ebdu[START_CODE_LENGTH..])?;
    let fcm = if sequence.interlace {
        if bits.get(1) == 0 {
            FrameCodingMode::Progressive
        } else if bits.get(1) == 0 {
            FrameCodingMode::FrameInterlace
        } else {
            FrameCodingMode::FieldInterlace
        }
    } else {
        FrameCodingMode::Progressive
    };
    if fcm == FrameCodingMode::FieldInterlace {
        // FPTYPE encodes the types of both fields.
        let fptype = bits.get(3);
        picture.independent = fptype == 0; // I/I
        picture.non_bipredictive = fptype < 4; // no B/BI fields
        picture.disposable = fptype >= 4;
    } else {
        // PTYPE: 0 -> P, 10 -> B, 110 -> I, 1110 -> BI, 1111 -> skipped.
        let ptype = if bits.get(1) == 0 {
            PictureType::P
        } else if bits.get(1) == 0 {
            PictureType::B
        } else if bits.get(1) == 0 {
            PictureType::I
        } else if bits.get(1) == 0 {
            PictureType::Bi
        } else {
            PictureType::Skipped
        };
        picture.independent = matches!(ptype, PictureType::I | PictureType::Bi);
        picture.disposable = matches!(ptype, PictureType::B | PictureType::Bi);
        picture.non_bipredictive =
            matches!(ptype, PictureType::P | PictureType::I | PictureType::Skipped);
    }
    bits.bs.status()?;
    picture.present = true;
    Ok(())
}

// An EBDU of these types closes the access unit the previous picture
// data belongs to.
fn find_au_delimit_by_bdu_type(bdu_type: u8, prev_bdu_type: u8) -> bool {
    matches!(bdu_type, BDU_TYPE_FRAME | BDU_TYPE_ENTRY_POINT | BDU_TYPE_SEQUENCE)
        && matches!(
            prev_bdu_type,
            BDU_TYPE_EOS | BDU_TYPE_SLICE | BDU_TYPE_FIELD | BDU_TYPE_FRAME
        )
}

#[inline]
fn check_next_start_code_prefix(window: &[u8]) -> bool {
    window.len() >= START_CODE_PREFIX_LENGTH
        && window[0] == 0x00
        && window[1] == 0x00
        && window[2] == 0x01
}

struct Vc1Info {
    bdu_type:      u8,
    prev_bdu_type: u8,
    ebdu_head_pos: u64,
    sequence:      SequenceHeader,
    entry_point:   EntryPointHeader,
    picture:       PictureInfo,
    access_unit:   AccessUnit,
    dvc1_param:    Vc1Params,
    rbdu:          Vec<u8>,
}

fn update_au_property(access_unit: &mut AccessUnit, picture: &mut PictureInfo) {
    access_unit.independent = picture.independent;
    access_unit.disposable = picture.disposable;
    access_unit.non_bipredictive = picture.non_bipredictive;
    access_unit.random_accessible = picture.random_accessible;
    access_unit.closed_gop = picture.closed_gop;
    *picture = PictureInfo::default();
}

fn complete_au(access_unit: &mut AccessUnit, picture: &mut PictureInfo, probe: bool) -> bool {
    if !picture.present {
        return false;
    }
    if !probe {
        if access_unit.data.len() < access_unit.incomplete_data_length {
            access_unit.data.resize(access_unit.incomplete_data_length, 0);
        }
        access_unit.data[..access_unit.incomplete_data_length]
            .copy_from_slice(&access_unit.incomplete_data[..access_unit.incomplete_data_length]);
    }
    access_unit.data_length = access_unit.incomplete_data_length;
    access_unit.incomplete_data_length = 0;
    update_au_property(access_unit, picture);
    true
}

fn append_ebdu_to_au(access_unit: &mut AccessUnit, ebdu: &[u8], probe: bool) {
    if !probe {
        let needed = access_unit.incomplete_data_length + ebdu.len();
        if access_unit.incomplete_data.len() < needed {
            access_unit.incomplete_data.resize(needed, 0);
        }
        let start = access_unit.incomplete_data_length;
        access_unit.incomplete_data[start..start + ebdu.len()].copy_from_slice(ebdu);
    }
    access_unit.incomplete_data_length += ebdu.len();
}

pub(crate) struct Vc1Importer {
    status:                         ImportStatus,
    info:                           Vc1Info,
    first_sequence:                 SequenceHeader,
    ts_list:                        Vec<MediaTs>,
    composition_reordering_present: bool,
    max_au_length:                  usize,
    last_ref_intra_cts:             u64,
}

impl Vc1Importer {
    fn new() -> Vc1Importer {
        Vc1Importer {
            status: ImportStatus::Ok,
            info: Vc1Info {
                bdu_type: 0,
                prev_bdu_type: 0,
                ebdu_head_pos: 0,
                sequence: SequenceHeader::default(),
                entry_point: EntryPointHeader::default(),
                picture: PictureInfo::default(),
                access_unit: AccessUnit {
                    data: vec![0u8; VC1_DEFAULT_BUFFER_SIZE],
                    incomplete_data: vec![0u8; VC1_DEFAULT_BUFFER_SIZE],
                    ..AccessUnit::default()
                },
                dvc1_param: Vc1Params::default(),
                rbdu: Vec::new(),
            },
            first_sequence: SequenceHeader::default(),
            ts_list: Vec::new(),
            composition_reordering_present: false,
            max_au_length: 0,
            last_ref_intra_cts: 0,
        }
    }

    fn get_access_unit_internal(&mut self, sb: &mut Sb, probe: bool) -> io::Result<()> {
        let info = &mut self.info;
        let mut bdu_type = info.bdu_type;
        let mut consecutive_zero_byte_count: u64 = 0;
        let mut ebdu_length: u64 = 0;
        let mut complete = false;
        info.access_unit.data_length = 0;
        loop {
            sb.update(2)?;
            let no_more_buf = sb.remainder() == 0;
            let no_more = sb.is_eos() && no_more_buf;
            if !check_next_start_code_prefix(sb.window()) && !no_more {
                if sb.get_byte() != 0 {
                    consecutive_zero_byte_count = 0;
                } else {
                    consecutive_zero_byte_count += 1;
                }
                ebdu_length += 1;
                continue;
            }
            if no_more && ebdu_length == 0 {
                // The last EBDU was already appended and parsed.
                complete_au(&mut info.access_unit, &mut info.picture, probe);
                info.bdu_type = bdu_type;
                self.status = if info.access_unit.incomplete_data_length == 0 {
                    ImportStatus::Eof
                } else {
                    ImportStatus::Ok
                };
                info.access_unit.number += 1;
                return Ok(());
            }
            ebdu_length += START_CODE_LENGTH as u64;
            let next_scs_file_offset = info.ebdu_head_pos
                + ebdu_length
                + if !no_more { START_CODE_PREFIX_LENGTH as u64 } else { 0 };
            let mut next_ebdu_pos = sb.pos();
            let mut read_back = false;
            if (BDU_TYPE_EOS..=BDU_TYPE_SEQUENCE).contains(&bdu_type) {
                ebdu_length -= consecutive_zero_byte_count;
                let ebdu_len = ebdu_length as usize;
                let possible_au_length = info.access_unit.incomplete_data_length + ebdu_len;
                if sb.buffer_size() < possible_au_length {
                    sb.resize(2 * possible_au_length);
                    next_ebdu_pos = sb.pos();
                }
                // Move to the first byte of the current EBDU.
                read_back = sb.pos() < ebdu_len + consecutive_zero_byte_count as usize;
                if read_back {
                    sb.stream_seek(info.ebdu_head_pos)?;
                    sb.set_pos(0);
                    sb.read(ebdu_len)?;
                    if sb.valid_size() != ebdu_len {
                        return Err(ioerr!(UnexpectedEof, "could not re-read an EBDU"));
                    }
                } else {
                    sb.seek_cur(-((ebdu_len + consecutive_zero_byte_count as usize) as i64));
                }
                if find_au_delimit_by_bdu_type(bdu_type, info.prev_bdu_type) {
                    // The previous picture's EBDUs close the wanted AU.
                    complete = complete_au(&mut info.access_unit, &mut info.picture, probe);
                }
                match bdu_type {
                    BDU_TYPE_FRAME => {
                        // [FRM_SC][PIC_L] possibly followed by fields and
                        // slices of the same frame.
                        let mut rbdu = std::mem::replace(&mut info.rbdu, Vec::new());
                        let result = {
                            let window = sb.window();
                            parse_advanced_picture(
                                &window[..ebdu_len],
                                &info.sequence,
                                &mut info.picture,
                                &mut rbdu,
                            )
                        };
                        info.rbdu = rbdu;
                        result?;
                    },
                    BDU_TYPE_FIELD => {
                        // The second field of a field-interlaced frame;
                        // its type was already signalled by FPTYPE.
                    },
                    BDU_TYPE_SLICE => {
                        // Slice layers may repeat the frame header; only
                        // their presence matters for the dvc1.
                        info.dvc1_param.slice_present = true;
                    },
                    BDU_TYPE_ENTRY_POINT => {
                        let mut rbdu = std::mem::replace(&mut info.rbdu, Vec::new());
                        let result = {
                            let window = sb.window();
                            parse_entry_point_header(&window[..ebdu_len], &info.sequence, &mut rbdu)
                        };
                        info.rbdu = rbdu;
                        let entry_point = result?;
                        if info.entry_point.present
                            && probe
                            && entry_point.ebdu != info.entry_point.ebdu
                        {
                            info.dvc1_param.multiple_entry = true;
                        }
                        if !info.entry_point.present && probe {
                            info.dvc1_param.ephdr_data = entry_point.ebdu.clone();
                        }
                        // The frame after an entry point is a random
                        // access point, unless multiple sequence headers
                        // make that conditional on a fresh sequence.
                        info.picture.closed_gop = entry_point.closed_entry_point;
                        info.picture.random_accessible = if info.dvc1_param.multiple_sequence {
                            info.picture.start_of_sequence
                        } else {
                            true
                        };
                        info.entry_point = entry_point;
                    },
                    BDU_TYPE_SEQUENCE => {
                        let mut rbdu = std::mem::replace(&mut info.rbdu, Vec::new());
                        let result = {
                            let window = sb.window();
                            parse_sequence_header(&window[..ebdu_len], &mut rbdu)
                        };
                        info.rbdu = rbdu;
                        let sequence = result?;
                        if info.sequence.present && probe && sequence.ebdu != info.sequence.ebdu {
                            info.dvc1_param.multiple_sequence = true;
                        }
                        if !info.sequence.present && probe {
                            info.dvc1_param.level = sequence.level;
                            info.dvc1_param.interlaced = sequence.interlace;
                            info.dvc1_param.framerate = framerate_of(&sequence);
                            info.dvc1_param.seqhdr_data = sequence.ebdu.clone();
                        }
                        info.picture.start_of_sequence = true;
                        if probe && !self.first_sequence.present {
                            self.first_sequence = sequence.clone();
                        }
                        info.sequence = sequence;
                    },
                    _ => {
                        // End-of-sequence (0x0A): a plain terminator.
                    },
                }
                {
                    let window = sb.window();
                    append_ebdu_to_au(&mut info.access_unit, &window[..ebdu_len], probe);
                }
            } else {
                // User data and other BDU types are not supported.
                return Err(ioerr!(InvalidData, "unsupported BDU type {:#04x}", bdu_type));
            }
            // Move to the first byte of the next start code suffix.
            if read_back {
                sb.stream_seek(next_scs_file_offset)?;
                sb.set_pos(0);
                sb.read(0)?;
            } else {
                sb.set_pos(next_ebdu_pos + START_CODE_PREFIX_LENGTH);
            }
            info.prev_bdu_type = bdu_type;
            sb.update(0)?;
            let no_more_buf = sb.remainder() == 0;
            ebdu_length = 0;
            let no_more = sb.is_eos() && no_more_buf;
            if !no_more {
                // Check the next BDU type.
                if sb.remainder() < 1 {
                    return Err(ioerr!(UnexpectedEof, "truncated start code"));
                }
                bdu_type = sb.get_byte();
                if !(BDU_TYPE_EOS..=BDU_TYPE_SEQUENCE).contains(&bdu_type) {
                    return Err(ioerr!(InvalidData, "unsupported BDU type {:#04x}", bdu_type));
                }
                info.ebdu_head_pos = next_scs_file_offset - START_CODE_PREFIX_LENGTH as u64;
            } else if info.access_unit.incomplete_data_length != 0
                && info.access_unit.data_length == 0
            {
                // Flush the remaining EBDUs as one complete AU.
                complete_au(&mut info.access_unit, &mut info.picture, probe);
                info.bdu_type = bdu_type;
                self.status = ImportStatus::Eof;
                info.access_unit.number += 1;
                return Ok(());
            }
            if complete {
                info.bdu_type = bdu_type;
                self.status =
                    if sb.is_eos() && sb.remainder() == 0 && info.access_unit.incomplete_data_length == 0 {
                        ImportStatus::Eof
                    } else {
                        ImportStatus::Ok
                    };
                info.access_unit.number += 1;
                return Ok(());
            }
            consecutive_zero_byte_count = 0;
        }
    }

    fn create_summary(&self) -> io::Result<VideoSummary> {
        if !self.info.sequence.present || !self.info.entry_point.present {
            return Err(ioerr!(InvalidData, "sequence or entry-point header missing"));
        }
        let sequence = &self.first_sequence;
        let mut summary = VideoSummary::default();
        summary.sample_type = FourCc::new(b"vc-1");
        summary.max_au_length = self.max_au_length;
        summary.timescale = sequence.framerate_numerator;
        summary.timebase = sequence.framerate_denominator;
        summary.vfr = !sequence.framerate_flag;
        summary.width = sequence.disp_horiz_size;
        summary.height = sequence.disp_vert_size;
        summary.par_h = sequence.aspect_width;
        summary.par_v = sequence.aspect_height;
        summary.color.primaries_index = sequence.color_prim;
        summary.color.transfer_index = sequence.transfer_char;
        summary.color.matrix_index = sequence.matrix_coef;
        summary
            .codec_specific
            .push(CodecSpecific::new(CodecSpecificKind::Vc1, create_vc1_specific_info(&self.info.dvc1_param)?));
        Ok(summary)
    }
}

fn framerate_of(sequence: &SequenceHeader) -> u32 {
    if !sequence.framerate_flag || sequence.framerate_denominator == 0 {
        return 0xffffff; // unknown or variable
    }
    (sequence.framerate_numerator + sequence.framerate_denominator / 2)
        / sequence.framerate_denominator
}

pub(crate) fn probe(sb: &mut Sb) -> io::Result<(Box<dyn CodecImporter>, Summary)> {
    let mut importer = Vc1Importer::new();
    // The stream must open with a start code; nonzero garbage fails.
    sb.set_pos(0);
    sb.read(0)?;
    loop {
        if check_next_start_code_prefix(sb.window()) {
            break;
        }
        if sb.remainder() <= START_CODE_LENGTH {
            return Err(ioerr!(InvalidData, "not a VC-1 byte stream"));
        }
        if sb.get_byte() != 0 {
            return Err(ioerr!(InvalidData, "not a VC-1 byte stream"));
        }
    }
    let first_ebdu_head_pos = sb.pos() as u64;
    sb.seek_cur(START_CODE_PREFIX_LENGTH as i64);
    sb.update(0)?;
    if sb.remainder() == 0 {
        return Err(ioerr!(UnexpectedEof, "stream ends at the first access unit"));
    }
    let first_bdu_type = sb.get_byte();
    if first_bdu_type != BDU_TYPE_SEQUENCE {
        return Err(ioerr!(InvalidData, "VC-1 stream does not open with a sequence header"));
    }
    importer.info.bdu_type = first_bdu_type;
    importer.info.ebdu_head_pos = first_ebdu_head_pos;
    // Probe pass: find AU boundaries and picture kinds.
    let mut cts: Vec<u64> = Vec::with_capacity(1 << 12);
    let mut num_consecutive_b: usize = 0;
    log::debug!("analyzing stream as VC-1");
    while importer.status != ImportStatus::Eof {
        importer.get_access_unit_internal(sb, true)?;
        // B and BI pictures are displayed in coded order; a non-B picture
        // is presented only after the run of B pictures that follows it,
        // so its CTS is assigned when the next non-B one arrives.
        let num_access_units = cts.len();
        if !importer.info.access_unit.disposable {
            if num_access_units > num_consecutive_b {
                cts[num_access_units - num_consecutive_b - 1] = num_access_units as u64;
            }
            num_consecutive_b = 0;
            cts.push(0);
        } else {
            // B or BI picture
            cts.push(num_access_units as u64);
            num_consecutive_b += 1;
            importer.info.dvc1_param.bframe_present = true;
        }
        importer.max_au_length =
            importer.max_au_length.max(importer.info.access_unit.data_length);
    }
    let num_access_units = cts.len();
    if num_access_units == 0 || num_access_units <= num_consecutive_b {
        return Err(ioerr!(InvalidData, "no decodable VC-1 access units"));
    }
    cts[num_access_units - num_consecutive_b - 1] = num_access_units as u64;
    for i in 1..num_access_units {
        if cts[i] < cts[i - 1] {
            importer.composition_reordering_present = true;
            break;
        }
    }
    let mut timestamp = Vec::with_capacity(num_access_units);
    if importer.composition_reordering_present {
        for (i, &c) in cts.iter().enumerate() {
            timestamp.push(MediaTs { dts: i as u64, cts: c });
        }
    } else {
        for i in 0..num_access_units {
            timestamp.push(MediaTs { dts: i as u64, cts: i as u64 });
        }
    }
    importer.ts_list = timestamp;
    let summary = importer.create_summary()?;
    // Back to the first EBDU for the delivery pass.
    sb.stream_seek(first_ebdu_head_pos)?;
    sb.set_pos(0);
    sb.read(0)?;
    importer.status = ImportStatus::Ok;
    importer.info.bdu_type = first_bdu_type;
    importer.info.prev_bdu_type = 0;
    sb.set_pos(START_CODE_LENGTH);
    importer.info.ebdu_head_pos = first_ebdu_head_pos;
    let access_unit = &mut importer.info.access_unit;
    let data = std::mem::replace(&mut access_unit.data, Vec::new());
    let incomplete_data = std::mem::replace(&mut access_unit.incomplete_data, Vec::new());
    *access_unit = AccessUnit::default();
    access_unit.data = data;
    access_unit.incomplete_data = incomplete_data;
    importer.info.picture = PictureInfo::default();
    Ok((Box::new(importer), Summary::Video(summary)))
}

impl CodecImporter for Vc1Importer {
    fn get_access_unit(
        &mut self,
        sb: &mut Sb,
        _summary: &mut Summary,
        sample: &mut Sample,
    ) -> io::Result<ImportStatus> {
        if sample.data.len() < self.max_au_length {
            return Err(ioerr!(InvalidInput, "sample buffer smaller than max_au_length"));
        }
        if self.status == ImportStatus::Eof {
            sample.length = 0;
            return Ok(ImportStatus::Eof);
        }
        self.get_access_unit_internal(sb, false)?;
        let access_unit = &self.info.access_unit;
        if access_unit.data_length == 0 {
            sample.length = 0;
            return Ok(ImportStatus::Eof);
        }
        let ts = self
            .ts_list
            .get(access_unit.number as usize - 1)
            .copied()
            .ok_or_else(|| ioerr!(InvalidData, "more access units than the probe pass saw"))?;
        sample.dts = ts.dts;
        sample.cts = ts.cts;
        sample.prop = Default::default();
        sample.prop.leading = if access_unit.independent
            || access_unit.non_bipredictive
            || sample.cts >= self.last_ref_intra_cts
        {
            Leading::NotLeading
        } else {
            Leading::UndecodableLeading
        };
        if access_unit.independent && !access_unit.disposable {
            self.last_ref_intra_cts = sample.cts;
        }
        if self.composition_reordering_present
            && !access_unit.disposable
            && !access_unit.closed_gop
        {
            sample.prop.allow_earlier = true;
        }
        sample.prop.independent = access_unit.independent;
        sample.prop.disposable = access_unit.disposable;
        sample.prop.redundant = false;
        if access_unit.random_accessible {
            // Every random access point maps to a sync sample, open GOPs
            // included.
            sample.prop.ra_flags = RA_FLAG_SYNC;
        }
        sample.length = access_unit.data_length;
        sample.data[..access_unit.data_length]
            .copy_from_slice(&access_unit.data[..access_unit.data_length]);
        Ok(ImportStatus::Ok)
    }

    fn last_delta(&self, _summary: &Summary) -> u32 {
        if self.status != ImportStatus::Eof {
            return 0;
        }
        if self.ts_list.is_empty() {
            u32::max_value() // arbitrary
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests;

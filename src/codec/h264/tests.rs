use super::*;
use crate::sbuf::SbStream;

// Insert emulation prevention bytes, byte-stream encoder style.
fn escape_ebsp(rbsp: &[u8]) -> Vec<u8> {
    let mut ebsp = Vec::with_capacity(rbsp.len());
    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 0x03 {
            ebsp.push(0x03);
            zeros = 0;
        }
        if byte == 0x00 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        ebsp.push(byte);
    }
    ebsp
}

fn nal(stream: &mut Vec<u8>, long_start_code: bool, header_byte: u8, rbsp: &[u8]) {
    if long_start_code {
        stream.extend_from_slice(&[0, 0, 0, 1]);
    } else {
        stream.extend_from_slice(&[0, 0, 1]);
    }
    stream.push(header_byte);
    stream.extend_from_slice(&escape_ebsp(rbsp));
}

fn put_ue(bits: &mut Bits, value: u64) {
    let mut leading = 0;
    let v = value + 1;
    let mut t = v;
    while t > 1 {
        t >>= 1;
        leading += 1;
    }
    bits.put(leading, 0);
    bits.put(leading + 1, v);
}

// QCIF SPS: 176x144, frame-coded, no VUI.
fn sps_rbsp(pic_order_cnt_type: u64) -> Vec<u8> {
    let mut bits = Bits::new(Bs::new());
    bits.put(8, 66); // profile_idc: Baseline
    bits.put(8, 0xc0); // constraint_set_flags
    bits.put(8, 30); // level_idc
    put_ue(&mut bits, 0); // seq_parameter_set_id
    put_ue(&mut bits, 0); // log2_max_frame_num_minus4
    put_ue(&mut bits, pic_order_cnt_type);
    if pic_order_cnt_type == 0 {
        put_ue(&mut bits, 0); // log2_max_pic_order_cnt_lsb_minus4
    }
    put_ue(&mut bits, 2); // max_num_ref_frames
    bits.put(1, 0); // gaps_in_frame_num_value_allowed_flag
    put_ue(&mut bits, 10); // pic_width_in_mbs_minus1
    put_ue(&mut bits, 8); // pic_height_in_map_units_minus1
    bits.put(1, 1); // frame_mbs_only_flag
    bits.put(1, 1); // direct_8x8_inference_flag
    bits.put(1, 0); // frame_cropping_flag
    bits.put(1, 0); // vui_parameters_present_flag
    bits.put(1, 1); // rbsp_stop_one_bit
    bits.export_data().unwrap()
}

fn pps_rbsp() -> Vec<u8> {
    let mut bits = Bits::new(Bs::new());
    put_ue(&mut bits, 0); // pic_parameter_set_id
    put_ue(&mut bits, 0); // seq_parameter_set_id
    bits.put(1, 0); // entropy_coding_mode_flag
    bits.put(1, 0); // bottom_field_pic_order_in_frame_present_flag
    put_ue(&mut bits, 0); // num_slice_groups_minus1
    put_ue(&mut bits, 0); // num_ref_idx_l0_default_active_minus1
    put_ue(&mut bits, 0); // num_ref_idx_l1_default_active_minus1
    bits.put(1, 0); // weighted_pred_flag
    bits.put(2, 0); // weighted_bipred_idc
    bits.put(1, 1); // pic_init_qp_minus26: se(0)
    bits.put(1, 1); // pic_init_qs_minus26: se(0)
    bits.put(1, 1); // chroma_qp_index_offset: se(0)
    bits.put(1, 0); // deblocking_filter_control_present_flag
    bits.put(1, 0); // constrained_intra_pred_flag
    bits.put(1, 0); // redundant_pic_cnt_present_flag
    bits.put(1, 1); // rbsp_stop_one_bit
    bits.export_data().unwrap()
}

struct SliceSpec {
    idr:               bool,
    slice_type:        u64, // 5 = P, 6 = B, 7 = I
    nal_ref_idc:       u8,
    frame_num:         u64,
    pic_order_cnt_lsb: Option<u64>,
}

fn slice_rbsp(spec: &SliceSpec) -> Vec<u8> {
    let mut bits = Bits::new(Bs::new());
    put_ue(&mut bits, 0); // first_mb_in_slice
    put_ue(&mut bits, spec.slice_type);
    put_ue(&mut bits, 0); // pic_parameter_set_id
    bits.put(4, spec.frame_num); // log2_max_frame_num == 4
    if spec.idr {
        put_ue(&mut bits, 0); // idr_pic_id
    }
    if let Some(lsb) = spec.pic_order_cnt_lsb {
        bits.put(4, lsb); // log2_max_pic_order_cnt_lsb == 4
    }
    let base_type = spec.slice_type % 5;
    if base_type == 1 {
        bits.put(1, 0); // direct_spatial_mv_pred_flag
    }
    if matches!(base_type, 0 | 1 | 3) {
        bits.put(1, 0); // num_ref_idx_active_override_flag
        // ref_pic_list_modification flags
        bits.put(1, 0);
        if base_type == 1 {
            bits.put(1, 0);
        }
    }
    if spec.nal_ref_idc != 0 {
        if spec.idr {
            bits.put(1, 0); // no_output_of_prior_pics_flag
            bits.put(1, 0); // long_term_reference_flag
        } else {
            bits.put(1, 0); // adaptive_ref_pic_marking_mode_flag
        }
    }
    // A stub of slice data so the NAL unit is not empty.
    bits.put(1, 1);
    bits.put_align();
    bits.bs.put_bytes(&[0x5a, 0xa5]);
    bits.export_data().unwrap()
}

fn slice_nal_header(spec: &SliceSpec) -> u8 {
    let nal_unit_type = if spec.idr { NALU_TYPE_SLICE_IDR } else { NALU_TYPE_SLICE_N_IDR };
    (spec.nal_ref_idc << 5) | nal_unit_type
}

fn sb_of(data: Vec<u8>) -> Sb {
    Sb::new(SbStream::Memory { data, consumed: 0 }, 1 << 16)
}

#[test]
fn idr_and_two_p_pictures() {
    let mut stream = Vec::new();
    nal(&mut stream, true, 0x67, &sps_rbsp(2));
    nal(&mut stream, true, 0x68, &pps_rbsp());
    let pictures = [
        SliceSpec { idr: true, slice_type: 7, nal_ref_idc: 3, frame_num: 0, pic_order_cnt_lsb: None },
        SliceSpec { idr: false, slice_type: 5, nal_ref_idc: 2, frame_num: 1, pic_order_cnt_lsb: None },
        SliceSpec { idr: false, slice_type: 5, nal_ref_idc: 2, frame_num: 2, pic_order_cnt_lsb: None },
    ];
    nal(&mut stream, true, slice_nal_header(&pictures[0]), &slice_rbsp(&pictures[0]));
    for picture in &pictures[1..] {
        nal(&mut stream, false, slice_nal_header(picture), &slice_rbsp(picture));
    }
    let mut sb = sb_of(stream);
    let (mut imp, mut summary) = probe(&mut sb).unwrap();
    {
        let video = summary.video().unwrap();
        assert_eq!(video.width, 176);
        assert_eq!(video.height, 144);
        // 50/1 default timing reduced by the GCD with the frame delta.
        assert_eq!(video.timescale, 25);
        assert_eq!(video.timebase, 1);
        let avcc = parse_h264_specific_info(&video.codec_specific[0].data).unwrap();
        assert_eq!(avcc.profile_indication, 66);
        assert_eq!(avcc.sps_list.len(), 1);
        assert_eq!(avcc.pps_list.len(), 1);
        assert_eq!(avcc.length_size_minus_one, 3);
    }
    let mut sample = Sample::with_capacity(summary.max_au_length());
    let mut timestamps = Vec::new();
    // IDR
    assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
    assert_eq!(sample.prop.ra_flags, RA_FLAG_SYNC);
    assert!(sample.prop.independent);
    assert!(!sample.prop.disposable);
    timestamps.push((sample.dts, sample.cts));
    // The AU carries the slice NALU with a 4-byte length prefix; the
    // parameter sets live in the avcC, not in the AU.
    let idr_nal_len = u32::from_be_bytes([
        sample.payload()[0],
        sample.payload()[1],
        sample.payload()[2],
        sample.payload()[3],
    ]) as usize;
    assert_eq!(sample.length, 4 + idr_nal_len);
    assert_eq!(sample.payload()[4], 0x65);
    // Two P pictures
    for _ in 0..2 {
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        assert!(!sample.prop.independent);
        assert_eq!(sample.prop.leading, Leading::NotLeading);
        timestamps.push((sample.dts, sample.cts));
    }
    assert_eq!(timestamps, vec![(0, 0), (1, 1), (2, 2)]);
    assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Eof);
    assert_eq!(sample.length, 0);
    assert_eq!(imp.last_delta(&summary), 1);
}

#[test]
fn b_picture_reordering() {
    // Decoding order IDR(lsb 0), P(4), B(2), P(6) with POC type 0.
    let mut stream = Vec::new();
    nal(&mut stream, true, 0x67, &sps_rbsp(0));
    nal(&mut stream, true, 0x68, &pps_rbsp());
    let pictures = [
        SliceSpec { idr: true, slice_type: 7, nal_ref_idc: 3, frame_num: 0, pic_order_cnt_lsb: Some(0) },
        SliceSpec { idr: false, slice_type: 5, nal_ref_idc: 2, frame_num: 1, pic_order_cnt_lsb: Some(4) },
        SliceSpec { idr: false, slice_type: 6, nal_ref_idc: 0, frame_num: 2, pic_order_cnt_lsb: Some(2) },
        SliceSpec { idr: false, slice_type: 5, nal_ref_idc: 2, frame_num: 2, pic_order_cnt_lsb: Some(6) },
    ];
    nal(&mut stream, true, slice_nal_header(&pictures[0]), &slice_rbsp(&pictures[0]));
    for picture in &pictures[1..] {
        nal(&mut stream, false, slice_nal_header(picture), &slice_rbsp(picture));
    }
    let mut sb = sb_of(stream);
    let (mut imp, mut summary) = probe(&mut sb).unwrap();
    let mut sample = Sample::with_capacity(summary.max_au_length());
    let mut seen = Vec::new();
    loop {
        let status = imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap();
        if status == ImportStatus::Eof {
            break;
        }
        seen.push((sample.dts, sample.cts, sample.prop.disposable, sample.prop.allow_earlier));
    }
    // CTS {0,2,1,3} + one-frame composition delay, DTS {0,1,2,3}.
    assert_eq!(
        seen.iter().map(|s| (s.0, s.1)).collect::<Vec<_>>(),
        vec![(0, 1), (1, 3), (2, 2), (3, 4)]
    );
    // The B picture is disposable; the others may carry earlier PTS.
    assert!(seen[2].2);
    assert!(!seen[2].3);
    assert!(seen[1].3);
    for w in seen.windows(2) {
        assert!(w[1].0 > w[0].0, "DTS must increase");
    }
}

#[test]
fn sps_parsing_extracts_dimensions() {
    let rbsp_data = sps_rbsp(2);
    let mut info = H264Info::new();
    info.parse_sps(&escape_ebsp(&rbsp_data)).unwrap();
    assert_eq!(info.sps.profile_idc, 66);
    assert_eq!(info.sps.cropped_width, 176);
    assert_eq!(info.sps.cropped_height, 144);
    assert_eq!(info.sps.pic_order_cnt_type, 2);
    assert_eq!(info.sps.max_frame_num, 16);
    // Default timing when no VUI is present.
    assert_eq!(info.sps.vui.time_scale, 50);
    assert_eq!(info.sps.vui.num_units_in_tick, 1);
}

#[test]
fn parameter_set_list_stays_ordered() {
    let mut param = H264Params::default();
    param.length_size_minus_one = 3;
    let mut sps1 = vec![0x67];
    sps1.extend_from_slice(&sps_rbsp(2));
    param.append_parameter_set(PsType::Sps, &sps1).unwrap();
    let mut pps0 = vec![0x68];
    pps0.extend_from_slice(&pps_rbsp());
    param.append_parameter_set(PsType::Pps, &pps0).unwrap();
    assert_eq!(param.profile_indication, 66);
    assert_eq!(nalu::ps_count(&param.sps_list), 1);
    // Re-appending the same SPS id while active is rejected.
    assert!(param.append_parameter_set(PsType::Sps, &sps1).is_err());
    // Marked unused, it is replaced and re-activated.
    param.sps_list[0].unused = true;
    param.append_parameter_set(PsType::Sps, &sps1).unwrap();
    assert!(!param.sps_list[0].unused);
    let avcc = create_h264_specific_info(&param).unwrap();
    let back = parse_h264_specific_info(&avcc).unwrap();
    assert_eq!(back.profile_indication, 66);
    assert_eq!(back.sps_list.len(), 1);
    assert_eq!(back.pps_list.len(), 1);
}

#[test]
fn forbidden_zero_bit_fails() {
    let mut sb = sb_of(vec![0, 0, 0, 1, 0x80 | 0x67, 0xff, 0xff]);
    assert!(probe(&mut sb).is_err());
}

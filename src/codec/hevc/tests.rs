use super::*;
use crate::sbuf::SbStream;

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

fn nal(stream: &mut Vec<u8>, long_start_code: bool, nalu_type: u8, rbsp: &[u8]) {
    if long_start_code {
        stream.extend_from_slice(&[0, 0, 0, 1]);
    } else {
        stream.extend_from_slice(&[0, 0, 1]);
    }
    stream.push(nalu_type << 1);
    stream.push(0x01); // nuh_layer_id 0, nuh_temporal_id_plus1 1
    stream.extend_from_slice(rbsp);
}

fn vps_rbsp() -> Vec<u8> {
    // Only the id nibble is inspected; the rest travels verbatim.
    vec![0x0c, 0x01, 0xff, 0xff, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x00]
}

fn sps_rbsp() -> Vec<u8> {
    let mut bits = Bits::new(Bs::new());
    bits.put(4, 0); // sps_video_parameter_set_id
    bits.put(3, 0); // sps_max_sub_layers_minus1
    bits.put(1, 1); // sps_temporal_id_nesting_flag
    // profile_tier_level()
    bits.put(2, 0); // general_profile_space
    bits.put(1, 0); // general_tier_flag
    bits.put(5, 1); // general_profile_idc: Main
    bits.put(32, 0x6000_0000); // general_profile_compatibility_flags
    bits.put(48, 0x9000_0000_0000u64); // general constraint flags
    bits.put(8, 93); // general_level_idc: 3.1
    put_ue(&mut bits, 0); // sps_seq_parameter_set_id
    put_ue(&mut bits, 1); // chroma_format_idc: 4:2:0
    put_ue(&mut bits, 176); // pic_width_in_luma_samples
    put_ue(&mut bits, 144); // pic_height_in_luma_samples
    bits.put(1, 0); // conformance_window_flag
    put_ue(&mut bits, 0); // bit_depth_luma_minus8
    put_ue(&mut bits, 0); // bit_depth_chroma_minus8
    put_ue(&mut bits, 0); // log2_max_pic_order_cnt_lsb_minus4
    bits.put(1, 1); // sps_sub_layer_ordering_info_present_flag
    put_ue(&mut bits, 4); // sps_max_dec_pic_buffering_minus1
    put_ue(&mut bits, 2); // sps_max_num_reorder_pics
    put_ue(&mut bits, 0); // sps_max_latency_increase_plus1
    put_ue(&mut bits, 0); // log2_min_luma_coding_block_size_minus3
    put_ue(&mut bits, 3); // log2_diff_max_min_luma_coding_block_size
    put_ue(&mut bits, 0); // log2_min_luma_transform_block_size_minus2
    put_ue(&mut bits, 0); // log2_diff_max_min_luma_transform_block_size
    put_ue(&mut bits, 0); // max_transform_hierarchy_depth_inter
    put_ue(&mut bits, 0); // max_transform_hierarchy_depth_intra
    bits.put(1, 0); // scaling_list_enabled_flag
    bits.put(1, 0); // amp_enabled_flag
    bits.put(1, 0); // sample_adaptive_offset_enabled_flag
    bits.put(1, 0); // pcm_enabled_flag
    put_ue(&mut bits, 0); // num_short_term_ref_pic_sets
    bits.put(1, 0); // long_term_ref_pics_present_flag
    bits.put(1, 0); // sps_temporal_mvp_enabled_flag
    bits.put(1, 0); // strong_intra_smoothing_enabled_flag
    bits.put(1, 0); // vui_parameters_present_flag
    bits.put(1, 0); // sps_extension_present_flag
    bits.put(1, 1); // rbsp_stop_one_bit
    bits.export_data().unwrap()
}

fn pps_rbsp() -> Vec<u8> {
    let mut bits = Bits::new(Bs::new());
    put_ue(&mut bits, 0); // pps_pic_parameter_set_id
    put_ue(&mut bits, 0); // pps_seq_parameter_set_id
    bits.put(1, 0); // dependent_slice_segments_enabled_flag
    bits.put(1, 0); // output_flag_present_flag
    bits.put(3, 0); // num_extra_slice_header_bits
    bits.put(1, 1); // stub tail so the NAL unit is not empty
    bits.put_align();
    bits.export_data().unwrap()
}

fn slice_rbsp(nalu_type: u8, slice_type: u64, poc_lsb: Option<u64>) -> Vec<u8> {
    let mut bits = Bits::new(Bs::new());
    bits.put(1, 1); // first_slice_segment_in_pic_flag
    if is_irap(nalu_type) {
        bits.put(1, 0); // no_output_of_prior_pics_flag
    }
    put_ue(&mut bits, 0); // slice_pic_parameter_set_id
    put_ue(&mut bits, slice_type);
    if let Some(lsb) = poc_lsb {
        bits.put(4, lsb); // log2_max_pic_order_cnt_lsb == 4
    }
    bits.put(1, 1); // stub slice data
    bits.put_align();
    bits.bs.put_bytes(&[0x3c, 0xc3]);
    bits.export_data().unwrap()
}

fn sb_of(data: Vec<u8>) -> Sb {
    Sb::new(SbStream::Memory { data, consumed: 0 }, 1 << 16)
}

#[test]
fn sps_fields() {
    let mut rbsp = Vec::new();
    let sps = parse_sps_internal(&mut rbsp, &sps_rbsp()).unwrap();
    assert_eq!(sps.ptl.profile_idc, 1);
    assert_eq!(sps.ptl.level_idc, 93);
    assert_eq!(sps.chroma_format_idc, 1);
    assert_eq!(sps.cropped_width, 176);
    assert_eq!(sps.cropped_height, 144);
    assert_eq!(sps.max_pic_order_cnt_lsb, 16);
    // 176x144 with 64-pixel CTBs: 3x3.
    assert_eq!(sps.pic_size_in_ctbs_y, 9);
    // Default timing with no VUI.
    assert_eq!(sps.vui.time_scale, 50);
    assert_eq!(sps.vui.num_units_in_tick, 1);
}

#[test]
fn idr_and_trailing_pictures() {
    let mut stream = Vec::new();
    nal(&mut stream, true, NALU_TYPE_VPS, &vps_rbsp());
    nal(&mut stream, true, NALU_TYPE_SPS, &sps_rbsp());
    nal(&mut stream, true, NALU_TYPE_PPS, &pps_rbsp());
    nal(&mut stream, true, NALU_TYPE_IDR_N_LP, &slice_rbsp(NALU_TYPE_IDR_N_LP, 2, None));
    nal(&mut stream, false, 1, &slice_rbsp(1, 1, Some(1))); // TRAIL_R, P
    nal(&mut stream, false, NALU_TYPE_TRAIL_N, &slice_rbsp(NALU_TYPE_TRAIL_N, 1, Some(2)));
    let mut sb = sb_of(stream);
    let (mut imp, mut summary) = probe(&mut sb).unwrap();
    {
        let video = summary.video().unwrap();
        assert_eq!(video.width, 176);
        assert_eq!(video.height, 144);
        // Doubled to field denomination, then reduced by the GCD.
        assert_eq!(video.timescale, 50);
        assert_eq!(video.timebase, 1);
        let hvcc = parse_hevc_specific_info(&video.codec_specific[0].data).unwrap();
        assert_eq!(hvcc.ptl.profile_idc, 1);
        assert_eq!(hvcc.ptl.level_idc, 93);
        assert_eq!(hvcc.vps_list.len(), 1);
        assert_eq!(hvcc.sps_list.len(), 1);
        assert_eq!(hvcc.pps_list.len(), 1);
        assert_eq!(hvcc.length_size_minus_one, 3);
        assert_eq!(hvcc.num_temporal_layers, 1);
        assert_eq!(hvcc.chroma_format, 1);
    }
    let mut sample = Sample::with_capacity(summary.max_au_length());
    // IDR_N_LP: a closed random access point.
    assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
    assert_eq!(sample.prop.ra_flags, RA_FLAG_SYNC | RA_FLAG_CLOSED_RAP);
    assert!(sample.prop.independent);
    assert_eq!((sample.dts, sample.cts), (0, 0));
    assert_eq!(&sample.payload()[4..6], &[NALU_TYPE_IDR_N_LP << 1, 0x01]);
    // TRAIL_R
    assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
    assert!(!sample.prop.independent);
    assert!(!sample.prop.disposable);
    assert_eq!((sample.dts, sample.cts), (1, 1));
    // TRAIL_N at the highest sub-layer is disposable.
    assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
    assert!(sample.prop.disposable);
    assert_eq!((sample.dts, sample.cts), (2, 2));
    assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Eof);
    assert_eq!(imp.last_delta(&summary), 1);
}

#[test]
fn hvcc_roundtrip() {
    let mut param = HevcParams::default();
    param.length_size_minus_one = 3;
    param.num_temporal_layers = 1;
    param.temporal_id_nested = true;
    param.ptl.profile_idc = 2;
    param.ptl.level_idc = 120;
    param.ptl.profile_compatibility = 0x4000_0000;
    param.chroma_format = 1;
    let mut vps = vec![NALU_TYPE_VPS << 1, 0x01];
    vps.extend_from_slice(&vps_rbsp());
    param.vps_list.push(DcrPsEntry::new(&vps));
    let mut sps = vec![NALU_TYPE_SPS << 1, 0x01];
    sps.extend_from_slice(&sps_rbsp());
    param.sps_list.push(DcrPsEntry::new(&sps));
    let mut pps = vec![NALU_TYPE_PPS << 1, 0x01];
    pps.extend_from_slice(&pps_rbsp());
    param.pps_list.push(DcrPsEntry::new(&pps));
    let hvcc = create_hevc_specific_info(&param).unwrap();
    assert_eq!(&hvcc[4..8], b"hvcC");
    assert_eq!(u32::from_be_bytes([hvcc[0], hvcc[1], hvcc[2], hvcc[3]]) as usize, hvcc.len());
    let back = parse_hevc_specific_info(&hvcc).unwrap();
    assert_eq!(back.ptl, param.ptl);
    assert_eq!(back.vps_list[0].nal_unit, vps);
    assert_eq!(back.sps_list[0].nal_unit, sps);
    assert_eq!(back.pps_list[0].nal_unit, pps);
}

#[test]
fn radl_rasl_leading_flags() {
    assert!(is_irap(NALU_TYPE_CRA));
    assert!(is_irap(NALU_TYPE_BLA_W_LP));
    assert!(!is_irap(NALU_TYPE_RASL_R));
    assert!(is_sublayer_nonref(NALU_TYPE_TRAIL_N));
    assert!(is_sublayer_nonref(NALU_TYPE_RASL_N));
    assert!(!is_sublayer_nonref(1));
}

use super::*;
use crate::sbuf::SbStream;

fn ebdu(bdu_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut v = vec![0x00, 0x00, 0x01, bdu_type];
    v.extend_from_slice(payload);
    v
}

// 320x240 progressive advanced profile, 29.97 fps, 1:1 PAR.
fn sequence_payload() -> Vec<u8> {
    let mut bits = Bits::new(Bs::new());
    bits.put(2, 3); // profile: advanced
    bits.put(3, 2); // level
    bits.put(2, 1); // colordiff_format: 4:2:0
    bits.put(3, 0); // frmrtq_postproc
    bits.put(5, 0); // bitrtq_postproc
    bits.put(1, 0); // postprocflag
    bits.put(12, 159); // max_coded_width: (159 + 1) * 2
    bits.put(12, 119); // max_coded_height
    bits.put(1, 0); // pulldown
    bits.put(1, 0); // interlace
    bits.put(1, 0); // tfcntrflag
    bits.put(1, 0); // finterpflag
    bits.put(1, 1); // reserved
    bits.put(1, 0); // psf
    bits.put(1, 1); // display_ext
    bits.put(14, 319); // disp_horiz_size - 1
    bits.put(14, 239); // disp_vert_size - 1
    bits.put(1, 1); // aspect_ratio_flag
    bits.put(4, 1); // aspect_ratio: 1:1
    bits.put(1, 1); // framerate_flag
    bits.put(1, 0); // framerateind: nr/dr coded
    bits.put(8, 3); // frameratenr: 30 * 1000
    bits.put(4, 1); // frameratedr: 1000
    bits.put(1, 1); // color_format_flag
    bits.put(8, 1); // color_prim
    bits.put(8, 1); // transfer_char
    bits.put(8, 1); // matrix_coef
    bits.put(1, 0); // hrd_param_flag
    bits.put(1, 1); // stuffing so the tail is nonzero
    bits.put_align();
    bits.export_data().unwrap()
}

fn entry_point_payload(closed: bool) -> Vec<u8> {
    let mut bits = Bits::new(Bs::new());
    bits.put(1, 0); // broken_link
    bits.put(1, closed as u64); // closed_entry
    bits.put(1, 0); // panscan_flag
    bits.put(1, 0); // refdist_flag
    bits.put(1, 0); // loopfilter
    bits.put(1, 1); // fastuvmc
    bits.put(1, 0); // extended_mv
    bits.put(2, 0); // dquant
    bits.put(1, 1); // vstransform
    bits.put(1, 1); // overlap
    bits.put(2, 0); // quantizer
    bits.put(1, 0); // coded_size_flag
    bits.put(1, 0); // range_mapy_flag
    bits.put(1, 0); // range_mapuv_flag
    bits.put(1, 1); // stuffing
    bits.put_align();
    bits.export_data().unwrap()
}

enum Ptype {
    I,
    P,
    B,
}

fn frame_payload(ptype: Ptype) -> Vec<u8> {
    let mut bits = Bits::new(Bs::new());
    match ptype {
        Ptype::P => bits.put(1, 0),
        Ptype::B => bits.put(2, 0b10),
        Ptype::I => bits.put(3, 0b110),
    }
    bits.put(1, 1); // stub picture data
    bits.put_align();
    bits.bs.put_bytes(&[0x42, 0x24]);
    bits.export_data().unwrap()
}

fn sb_of(data: Vec<u8>) -> Sb {
    Sb::new(SbStream::Memory { data, consumed: 0 }, 1 << 16)
}

fn test_stream() -> Vec<u8> {
    let mut stream = Vec::new();
    stream.extend_from_slice(&ebdu(BDU_TYPE_SEQUENCE, &sequence_payload()));
    stream.extend_from_slice(&ebdu(BDU_TYPE_ENTRY_POINT, &entry_point_payload(true)));
    stream.extend_from_slice(&ebdu(BDU_TYPE_FRAME, &frame_payload(Ptype::I)));
    stream.extend_from_slice(&ebdu(BDU_TYPE_FRAME, &frame_payload(Ptype::P)));
    stream.extend_from_slice(&ebdu(BDU_TYPE_FRAME, &frame_payload(Ptype::B)));
    stream.extend_from_slice(&ebdu(BDU_TYPE_FRAME, &frame_payload(Ptype::P)));
    stream
}

#[test]
fn sequence_header_fields() {
    let seq = ebdu(BDU_TYPE_SEQUENCE, &sequence_payload());
    let mut rbdu = Vec::new();
    let sequence = parse_sequence_header(&seq, &mut rbdu).unwrap();
    assert_eq!(sequence.level, 2);
    assert!(!sequence.interlace);
    assert_eq!(sequence.max_coded_width, 320);
    assert_eq!(sequence.disp_horiz_size, 320);
    assert_eq!(sequence.disp_vert_size, 240);
    assert_eq!(sequence.aspect_width, 1);
    assert_eq!(sequence.framerate_numerator, 30000);
    assert_eq!(sequence.framerate_denominator, 1000);
    assert_eq!(sequence.color_prim, 1);
}

#[test]
fn b_pictures_shift_composition_times() {
    let mut sb = sb_of(test_stream());
    let (mut imp, mut summary) = probe(&mut sb).unwrap();
    {
        let video = summary.video().unwrap();
        assert_eq!(video.width, 320);
        assert_eq!(video.height, 240);
        assert_eq!(video.timescale, 30000);
        assert_eq!(video.timebase, 1000);
        let dvc1 = parse_vc1_specific_info(&video.codec_specific[0].data).unwrap();
        assert_eq!(dvc1.level, 2);
        assert!(!dvc1.interlaced);
        assert!(dvc1.bframe_present);
        assert!(!dvc1.slice_present);
        assert!(!dvc1.multiple_sequence);
        assert_eq!(dvc1.framerate, 30);
        // The raw sequence and entry-point EBDUs ride along verbatim.
        let raw = &video.codec_specific[0].data;
        let seq = ebdu(BDU_TYPE_SEQUENCE, &sequence_payload());
        assert_eq!(&raw[14..14 + seq.len()], &seq[..]);
    }
    let mut sample = Sample::with_capacity(summary.max_au_length());
    // I: the AU also carries the sequence and entry-point headers.
    assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
    assert_eq!(sample.prop.ra_flags, RA_FLAG_SYNC);
    assert!(sample.prop.independent);
    assert!(!sample.prop.disposable);
    assert_eq!((sample.dts, sample.cts), (0, 1));
    assert_eq!(&sample.payload()[..4], &[0, 0, 1, BDU_TYPE_SEQUENCE]);
    // P
    assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
    assert_eq!((sample.dts, sample.cts), (1, 3));
    assert!(sample.prop.allow_earlier);
    assert_eq!(sample.prop.ra_flags, 0);
    // B: displayed in coded order, disposable.
    assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
    assert_eq!((sample.dts, sample.cts), (2, 2));
    assert!(sample.prop.disposable);
    assert!(!sample.prop.allow_earlier);
    assert_eq!(sample.prop.leading, Leading::NotLeading);
    // P
    assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
    assert_eq!((sample.dts, sample.cts), (3, 4));
    assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Eof);
    assert_eq!(sample.length, 0);
    assert_eq!(imp.last_delta(&summary), 1);
}

#[test]
fn au_conservation() {
    // Concatenating the delivered AUs reproduces the input stream.
    let stream = test_stream();
    let mut sb = sb_of(stream.clone());
    let (mut imp, mut summary) = probe(&mut sb).unwrap();
    let mut sample = Sample::with_capacity(summary.max_au_length());
    let mut reassembled = Vec::new();
    while imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap() != ImportStatus::Eof {
        reassembled.extend_from_slice(sample.payload());
    }
    assert_eq!(reassembled, stream);
}

#[test]
fn simple_profile_is_rejected() {
    let mut payload = sequence_payload();
    payload[0] &= 0x3f; // profile 0
    let mut stream = ebdu(BDU_TYPE_SEQUENCE, &payload);
    stream.extend_from_slice(&ebdu(BDU_TYPE_FRAME, &frame_payload(Ptype::I)));
    let mut sb = sb_of(stream);
    assert!(probe(&mut sb).is_err());
}

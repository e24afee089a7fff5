//! End-to-end importer scenarios over the public API.
use esimport::{ImportStatus, Importer, Sample};

const RA_FLAG_SYNC: u8 = 0x01;

// 48 kHz, 128 kbps, 2/0 AC-3 syncframe (header bits only).
fn ac3_frame() -> Vec<u8> {
    let mut frame = vec![0u8; 256];
    frame[0] = 0x0b;
    frame[1] = 0x77;
    frame[4] = 0x08; // fscod 0, frmsizecod 8
    frame[5] = 0x40; // bsid 8, bsmod 0
    frame[6] = 0x40; // acmod 2, dsurmod 0, lfeon 0
    frame
}

// One ADTS frame, AAC-LC at 48 kHz.
fn adts_frame(channel_configuration: u8, payload: &[u8]) -> Vec<u8> {
    let frame_length = (7 + payload.len()) as u16;
    let mut frame = Vec::new();
    frame.push(0xff);
    frame.push(0xf1);
    frame.push(0x40 | (3 << 2) | (channel_configuration >> 2));
    frame.push((channel_configuration << 6) | ((frame_length >> 11) as u8 & 0x3));
    frame.push((frame_length >> 3) as u8);
    frame.push(((frame_length as u8) << 5) | 0x1f);
    frame.push(0xfc);
    frame.extend_from_slice(payload);
    frame
}

#[test]
fn ac3_sync_scenario() {
    let mut stream = ac3_frame();
    stream.extend_from_slice(&ac3_frame());
    let mut importer = Importer::from_memory(stream, None).unwrap();
    assert_eq!(importer.format(), "ac3");
    assert_eq!(importer.get_track_count(), 1);
    let summary = importer.duplicate_summary(1).unwrap();
    let audio = summary.audio().unwrap();
    assert_eq!(audio.frequency, 48000);
    assert_eq!(audio.channels, 2);
    assert_eq!(audio.samples_in_frame, 1536);
    let dac3 = &audio.codec_specific[0].data;
    assert_eq!(
        &dac3[..],
        &[0x00, 0x00, 0x00, 0x0b, b'd', b'a', b'c', b'3', 0x10, 0x10, 0x80]
    );
    let mut sample = Sample::with_capacity(summary.max_au_length());
    assert_eq!(importer.get_access_unit(1, &mut sample).unwrap(), ImportStatus::Ok);
    assert_eq!(sample.length, 256);
    assert_eq!(sample.dts, 0);
    assert_eq!(sample.cts, 0);
    assert_eq!(sample.prop.ra_flags, RA_FLAG_SYNC);
    assert_eq!(importer.get_access_unit(1, &mut sample).unwrap(), ImportStatus::Ok);
    assert_eq!(sample.dts, 1536);
    assert_eq!(importer.get_access_unit(1, &mut sample).unwrap(), ImportStatus::Eof);
    assert_eq!(sample.length, 0);
    assert_eq!(importer.get_last_delta(1), 1536);
}

#[test]
fn adts_channel_change_scenario() {
    let mut stream = Vec::new();
    for _ in 0..5 {
        stream.extend_from_slice(&adts_frame(2, &[0x21, 0x42]));
    }
    for _ in 0..5 {
        stream.extend_from_slice(&adts_frame(1, &[0x21, 0x42]));
    }
    let mut importer = Importer::from_memory(stream, None).unwrap();
    assert_eq!(importer.format(), "adts");
    let mut sample = Sample::with_capacity(8192);
    let mut statuses = Vec::new();
    loop {
        let status = importer.get_access_unit(1, &mut sample).unwrap();
        statuses.push(status);
        if status == ImportStatus::Eof {
            break;
        }
    }
    use ImportStatus::*;
    assert_eq!(statuses, vec![Ok, Ok, Ok, Ok, Ok, Change, Ok, Ok, Ok, Ok, Eof]);
    let summary = importer.duplicate_summary(1).unwrap();
    assert_eq!(summary.audio().unwrap().channels, 1);
}

#[test]
fn amr_auto_detection() {
    let mut stream = b"#!AMR\n".to_vec();
    stream.push(0);
    stream.extend_from_slice(&[0u8; 12]);
    let mut importer = Importer::from_memory(stream, None).unwrap();
    assert_eq!(importer.format(), "amr");
    let mut sample = Sample::with_capacity(32);
    assert_eq!(importer.get_access_unit(1, &mut sample).unwrap(), ImportStatus::Ok);
    assert_eq!(sample.length, 13);
    assert_eq!(importer.get_last_delta(1), 160);
}

#[test]
fn mp3_is_not_mistaken_for_adts() {
    // MPEG-1 Layer III has layer bits the ADTS probe must reject.
    let header = [0xffu8, 0xfb, 0x90, 0x00];
    let mut stream = header.to_vec();
    stream.resize(144 * 128000 / 44100, 0);
    let mut importer = Importer::from_memory(stream, None).unwrap();
    assert_eq!(importer.format(), "mp3");
}

#[test]
fn explicit_format_skips_detection() {
    let stream = ac3_frame();
    let importer = Importer::from_memory(stream, Some("ac3")).unwrap();
    assert_eq!(importer.format(), "ac3");
}

#[test]
fn unknown_format_name_fails() {
    assert!(Importer::from_memory(ac3_frame(), Some("wavpack")).is_err());
}

#[test]
fn stdin_requires_explicit_format() {
    assert!(Importer::open("-").is_err());
}

#[test]
fn garbage_is_not_recognized() {
    let stream: Vec<u8> = (0..2048u32).map(|i| (i * 7 + 13) as u8).collect();
    assert!(Importer::from_memory(stream, None).is_err());
}

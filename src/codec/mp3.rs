//! MPEG-1/2 audio (MP1/MP2/MP3) through the legacy MP4 interface.
//!
//! Legacy means the `esds` carries only the ISO 11172-3 / 13818-3
//! objectTypeIndication and no AudioSpecificConfig; players dislike the
//! MPEG-4 Audio signalling of these layers.
use std::io;

use crate::codec::mp4a;
use crate::descriptor::{
    self, Mp4sysDecoderParameters, OTI_AUDIO_ISO_11172_3, OTI_AUDIO_ISO_13818_3, STREAM_TYPE_AUDIO,
};
use crate::importer::{CodecImporter, ImportStatus};
use crate::sample::{Sample, RA_FLAG_SYNC};
use crate::sbuf::Sb;
use crate::summary::{AudioSummary, CodecSpecific, CodecSpecificKind, FourCc, Summary};

const MP3_HEADER_LENGTH: usize = 4;
const MP3_MAX_FRAME_LENGTH: usize = 1152 * (16 / 8) * 2;

const LAYER_III: u8 = 0x1;
const LAYER_II: u8 = 0x2;
const LAYER_I: u8 = 0x3;

#[inline]
fn mode_is_2ch(mode: u8) -> bool {
    mode != 3
}

const FREQUENCY_TABLE: [[u32; 3]; 2] = [
    [22050, 24000, 16000], /* MPEG-2 BC audio */
    [44100, 48000, 32000], /* MPEG-1 audio */
];

const BITRATE_TABLE: [[[u32; 16]; 3]; 2] = [
    [
        /* MPEG-2 BC audio */
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0], /* Layer III */
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0], /* Layer II  */
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256, 0], /* Layer I */
    ],
    [
        /* MPEG-1 audio */
        [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0], /* Layer III */
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 0], /* Layer II  */
        [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448, 0], /* Layer I */
    ],
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Mp3Header {
    id:                 u8,
    layer:              u8,
    protection_bit:     u8,
    bitrate_index:      u8,
    sampling_frequency: u8,
    padding_bit:        u8,
    mode:               u8,
}

impl Mp3Header {
    fn parse(buf: &[u8; MP3_HEADER_LENGTH]) -> io::Result<Mp3Header> {
        let data = u32::from_be_bytes(*buf);
        // What is called MPEG-2.5, with the top syncword bit reused, is
        // deliberately not recognized.
        let syncword = (data >> 20) & 0xfff;
        let header = Mp3Header {
            id:                 ((data >> 19) & 0x1) as u8,
            layer:              ((data >> 17) & 0x3) as u8,
            protection_bit:     ((data >> 16) & 0x1) as u8,
            bitrate_index:      ((data >> 12) & 0xf) as u8,
            sampling_frequency: ((data >> 10) & 0x3) as u8,
            padding_bit:        ((data >> 9) & 0x1) as u8,
            mode:               ((data >> 6) & 0x3) as u8,
        };
        let emphasis = (data & 0x3) as u8;
        if syncword != 0xfff {
            return Err(ioerr!(InvalidData, "no MPEG audio syncword"));
        }
        if header.layer == 0x0 {
            return Err(ioerr!(InvalidData, "bad MPEG audio layer"));
        }
        if header.bitrate_index == 0x0 || header.bitrate_index == 0xf {
            // "free" bitrate is unsupported.
            return Err(ioerr!(InvalidData, "bad MPEG audio bitrate_index"));
        }
        if header.sampling_frequency == 0x3 {
            return Err(ioerr!(InvalidData, "bad MPEG audio sampling_frequency"));
        }
        if emphasis == 0x2 {
            return Err(ioerr!(InvalidData, "bad MPEG audio emphasis"));
        }
        Ok(header)
    }

    fn samples_in_frame(&self) -> u32 {
        if self.layer == LAYER_I {
            384
        } else if self.id == 1 || self.layer == LAYER_II {
            1152
        } else {
            576
        }
    }

    fn frequency(&self) -> u32 {
        FREQUENCY_TABLE[self.id as usize][self.sampling_frequency as usize]
    }

    fn frame_size(&self) -> usize {
        let bitrate = BITRATE_TABLE[self.id as usize][self.layer as usize - 1]
            [self.bitrate_index as usize];
        let frequency = self.frequency();
        if self.layer == LAYER_I {
            // Layer I slots are 4-byte units (11172-3, Audio Sequence General).
            ((12 * 1000 * bitrate / frequency + self.padding_bit as u32) * 4) as usize
        } else {
            let mut div = frequency;
            if self.layer == LAYER_III && self.id == 0 {
                div <<= 1;
            }
            (144 * 1000 * bitrate / div + self.padding_bit as u32) as usize
        }
    }

    fn side_info_size(&self) -> usize {
        if self.id == 1 {
            if mode_is_2ch(self.mode) { 32 } else { 17 }
        } else {
            if mode_is_2ch(self.mode) { 17 } else { 9 }
        }
    }
}

fn mp3_summary(header: &Mp3Header) -> io::Result<AudioSummary> {
    let mut summary = AudioSummary::default();
    summary.sample_type = FourCc::new(b"mp4a");
    summary.max_au_length = MP3_MAX_FRAME_LENGTH;
    summary.frequency = header.frequency();
    summary.channels = mode_is_2ch(header.mode) as u32 + 1;
    summary.sample_size = 16;
    summary.samples_in_frame = header.samples_in_frame();
    summary.aot = mp4a::AOT_LAYER_1 + (LAYER_I - header.layer); // no effect with the legacy interface
    // Legacy interface: no AudioSpecificConfig at all.
    let esds = descriptor::create_mp4sys_decoder_config(&Mp4sysDecoderParameters {
        object_type_indication: if header.id != 0 {
            OTI_AUDIO_ISO_11172_3
        } else {
            OTI_AUDIO_ISO_13818_3
        },
        stream_type: STREAM_TYPE_AUDIO,
        ..Mp4sysDecoderParameters::default()
    })?;
    summary
        .codec_specific
        .push(CodecSpecific::new(CodecSpecificKind::Mp4sysDecoderConfig, esds));
    Ok(summary)
}

struct Mp3Importer {
    status:             ImportStatus,
    header:             Mp3Header,
    raw_header:         [u8; MP3_HEADER_LENGTH],
    samples_in_frame:   u32,
    au_number:          u32,
    /// main_data sizes of the last 32 frames, most recent first.
    main_data_size:     [u16; 32],
    /// Number of frames the *previous* frame depended on.
    prev_preroll_count: u16,
    enc_delay:          u16,
    padding:            u16,
    valid_samples:      u64,
}

impl Mp3Importer {
    /// Recognize a Xing/Info VBR header in the first frame; fills encoder
    /// delay and frame count from the LAME extension when present.
    fn parse_xing_info_header(&mut self, header: &Mp3Header, frame: &[u8]) -> bool {
        let sip = if header.protection_bit != 0 { 4 } else { 6 };
        let mdp = sip + header.side_info_size();
        if frame.len() < mdp + 8 {
            return false;
        }
        if &frame[mdp..mdp + 4] != b"Info" && &frame[mdp..mdp + 4] != b"Xing" {
            return false;
        }
        let flags = u32::from_be_bytes([frame[mdp + 4], frame[mdp + 5], frame[mdp + 6], frame[mdp + 7]]);
        let mut off = mdp + 8;
        let mut frame_count = 0u32;
        if flags & 1 != 0 {
            frame_count =
                u32::from_be_bytes([frame[off], frame[off + 1], frame[off + 2], frame[off + 3]]);
            self.valid_samples = frame_count as u64 * header.samples_in_frame() as u64;
            off += 4;
        }
        if flags & 2 != 0 {
            off += 4; /* file size   */
        }
        if flags & 4 != 0 {
            off += 100; /* TOC         */
        }
        if flags & 8 != 0 {
            off += 4; /* VBR quality */
        }
        if frame.len() > off + 23 && frame[off] == b'L' {
            // LAME header present.
            let v = ((frame[off + 21] as u32) << 16)
                | ((frame[off + 22] as u32) << 8)
                | frame[off + 23] as u32;
            self.enc_delay = (v >> 12) as u16;
            self.padding = (v & 0xfff) as u16;
            if frame_count != 0 {
                self.valid_samples -= (self.enc_delay + self.padding) as u64;
            }
        }
        true
    }

    fn parse_vbri_header(&mut self, frame: &[u8]) -> bool {
        frame.len() >= 40 && &frame[36..40] == b"VBRI"
    }
}

pub(crate) fn probe(sb: &mut Sb) -> io::Result<(Box<dyn CodecImporter>, Summary)> {
    // Skip a leading ID3v2 tag.
    sb.update(9)?;
    if sb.remainder() >= 10 && sb.window().starts_with(b"ID3") {
        let w = sb.window();
        let mut size = 0usize;
        for i in 6..10 {
            size = (size << 7) | (w[i] & 0x7f) as usize;
        }
        sb.skip_bytes(10 + size)?;
    }
    let mut buf = [0u8; MP3_HEADER_LENGTH];
    if sb.read_bytes(&mut buf)? != MP3_HEADER_LENGTH {
        return Err(ioerr!(UnexpectedEof, "not an MPEG audio stream"));
    }
    let header = Mp3Header::parse(&buf)?;
    let summary = mp3_summary(&header)?;
    let importer = Mp3Importer {
        status: ImportStatus::Ok,
        header,
        raw_header: buf,
        samples_in_frame: summary.samples_in_frame,
        au_number: 0,
        main_data_size: [0; 32],
        prev_preroll_count: 0,
        enc_delay: 0,
        padding: 0,
        valid_samples: 0,
    };
    Ok((Box::new(importer), Summary::Audio(summary)))
}

impl CodecImporter for Mp3Importer {
    fn get_access_unit(
        &mut self,
        sb: &mut Sb,
        summary: &mut Summary,
        sample: &mut Sample,
    ) -> io::Result<ImportStatus> {
        let current_status = self.status;
        if current_status == ImportStatus::Eof {
            sample.length = 0;
            return Ok(ImportStatus::Eof);
        }
        let header = self.header;
        let frame_size = header.frame_size();
        if frame_size <= 4 {
            return Err(ioerr!(InvalidData, "degenerate MPEG audio frame"));
        }
        if sample.data.len() < frame_size {
            return Err(ioerr!(InvalidInput, "sample buffer smaller than one frame"));
        }
        if current_status == ImportStatus::Change {
            let new_summary = mp3_summary(&header)?;
            self.samples_in_frame = new_summary.samples_in_frame;
            *summary = Summary::Audio(new_summary);
        }
        // Read one frame.
        sample.data[..MP3_HEADER_LENGTH].copy_from_slice(&self.raw_header);
        let body = frame_size - MP3_HEADER_LENGTH;
        if sb.read_bytes(&mut sample.data[MP3_HEADER_LENGTH..frame_size])? != body {
            return Err(ioerr!(UnexpectedEof, "truncated MPEG audio frame"));
        }
        sample.length = frame_size;
        sample.dts = self.au_number as u64 * self.samples_in_frame as u64;
        sample.cts = sample.dts;
        sample.prop = Default::default();
        sample.prop.ra_flags = RA_FLAG_SYNC;
        sample.prop.pre_roll.distance = if header.layer == LAYER_III { 1 } else { 0 }; /* MDCT */
        self.au_number += 1;

        let mut vbr_header_present = false;
        if self.au_number == 1 {
            let frame = &sample.data[..frame_size];
            if self.parse_xing_info_header(&header, frame) || self.parse_vbri_header(frame) {
                vbr_header_present = true;
                self.au_number -= 1;
            }
        }

        // Additional inter-frame dependency due to the bit reservoir.
        if !vbr_header_present && header.layer == LAYER_III {
            let sip = if header.protection_bit != 0 { 4 } else { 6 };
            let mut main_data_begin = sample.data[sip] as u32;
            if header.id == 1 {
                main_data_begin <<= 1;
                main_data_begin |= (sample.data[sip + 1] >> 7) as u32;
            }
            if main_data_begin > 0 {
                // main_data_begin is a back pointer into the bit reservoir:
                // the total byte count required from preceding frames. Add
                // up main_data sizes from history until it is covered.
                let mut reservoir_data = 0u32;
                let mut i = 0;
                while i < 32 && reservoir_data < main_data_begin {
                    reservoir_data += self.main_data_size[i] as u32;
                    if self.main_data_size[i] == 0 {
                        break;
                    }
                    i += 1;
                }
                sample.prop.pre_roll.distance += self.prev_preroll_count;
                self.prev_preroll_count = i as u16;
            }
            let side_info_size = header.side_info_size();
            // Push this frame's main_data size onto the history.
            self.main_data_size.copy_within(0..31, 1);
            self.main_data_size[0] = (frame_size - sip - side_info_size) as u16;
        }

        // Prepare the next frame.
        let mut buf = [0u8; MP3_HEADER_LENGTH];
        let ret = sb.read_bytes(&mut buf)?;
        if ret == 0 {
            self.status = ImportStatus::Eof;
            return Ok(current_status);
        }
        if ret >= 2 && (&buf[..2] == b"TA" || &buf[..2] == b"AP") {
            // ID3v1 or APE tag.
            self.status = ImportStatus::Eof;
            return Ok(current_status);
        }
        if ret == 1 && buf[0] == 0x00 {
            // Ugly quirk of MP1 streams created with SCMPX.
            self.status = ImportStatus::Eof;
            return Ok(current_status);
        }
        if ret != MP3_HEADER_LENGTH {
            return Err(ioerr!(UnexpectedEof, "truncated MPEG audio header"));
        }
        let new_header = Mp3Header::parse(&buf)?;
        self.raw_header = buf;
        if header.layer != new_header.layer
            || header.sampling_frequency != new_header.sampling_frequency
        {
            // Layer changes the objectTypeIndication, frequency the timebase.
            return Err(ioerr!(InvalidData, "unsupported MPEG audio header change"));
        }
        if mode_is_2ch(header.mode) != mode_is_2ch(new_header.mode) {
            self.status = ImportStatus::Change;
        } else {
            self.status = ImportStatus::Ok;
        }
        self.header = new_header;

        if vbr_header_present {
            return self.get_access_unit(sb, summary, sample);
        }
        Ok(current_status)
    }

    fn last_delta(&self, _summary: &Summary) -> u32 {
        if self.status == ImportStatus::Eof {
            self.samples_in_frame
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbuf::SbStream;

    // MPEG-1 Layer III, 44.1 kHz, 128 kbps, stereo, no padding.
    fn l3_header(padding: u8) -> [u8; 4] {
        [0xff, 0xfb, 0x90 | (padding << 1), 0x00]
    }

    fn frame(padding: u8) -> Vec<u8> {
        let header = l3_header(padding);
        let parsed = Mp3Header::parse(&header).unwrap();
        let mut v = header.to_vec();
        v.resize(parsed.frame_size(), 0);
        v
    }

    fn sb_of(data: Vec<u8>) -> Sb {
        Sb::new(SbStream::Memory { data, consumed: 0 }, 1 << 16)
    }

    #[test]
    fn header_fields() {
        let h = Mp3Header::parse(&l3_header(0)).unwrap();
        assert_eq!(h.id, 1);
        assert_eq!(h.layer, LAYER_III);
        assert_eq!(h.frequency(), 44100);
        assert_eq!(h.samples_in_frame(), 1152);
        assert_eq!(h.frame_size(), 144 * 128000 / 44100);
    }

    #[test]
    fn delivers_frames_and_eof() {
        let mut stream = frame(0);
        stream.extend_from_slice(&frame(0));
        let n = frame(0).len();
        let mut sb = sb_of(stream);
        let (mut imp, mut summary) = probe(&mut sb).unwrap();
        assert_eq!(summary.audio().unwrap().frequency, 44100);
        let mut sample = Sample::with_capacity(MP3_MAX_FRAME_LENGTH);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        assert_eq!(sample.length, n);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        assert_eq!(sample.dts, 1152);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Eof);
        assert_eq!(imp.last_delta(&summary), 1152);
    }

    #[test]
    fn id3v2_is_skipped() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"ID3\x04\x00\x00\x00\x00\x00\x0a");
        stream.extend_from_slice(&[0u8; 10]); // tag body
        stream.extend_from_slice(&frame(0));
        let mut sb = sb_of(stream);
        let (_imp, summary) = probe(&mut sb).unwrap();
        assert_eq!(summary.audio().unwrap().samples_in_frame, 1152);
    }

    #[test]
    fn xing_frame_is_consumed_silently() {
        // First frame carries an Info tag at 4 + 32 bytes in.
        let mut first = frame(0);
        let mdp = 4 + 32;
        first[mdp..mdp + 4].copy_from_slice(b"Info");
        first[mdp + 4..mdp + 8].copy_from_slice(&1u32.to_be_bytes()); // flags: frames
        first[mdp + 8..mdp + 12].copy_from_slice(&2u32.to_be_bytes()); // frame count
        let mut stream = first;
        stream.extend_from_slice(&frame(0));
        stream.extend_from_slice(&frame(0));
        let mut sb = sb_of(stream);
        let (mut imp, mut summary) = probe(&mut sb).unwrap();
        let mut sample = Sample::with_capacity(MP3_MAX_FRAME_LENGTH);
        // The Xing frame itself is not emitted; dts still starts at 0.
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        assert_eq!(sample.dts, 0);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        assert_eq!(sample.dts, 1152);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Eof);
    }

    #[test]
    fn id3v1_tag_terminates_stream() {
        let mut stream = frame(0);
        stream.extend_from_slice(b"TAG");
        stream.extend_from_slice(&[0u8; 125]);
        let mut sb = sb_of(stream);
        let (mut imp, mut summary) = probe(&mut sb).unwrap();
        let mut sample = Sample::with_capacity(MP3_MAX_FRAME_LENGTH);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Eof);
    }
}

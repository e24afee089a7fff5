//! AMR-NB/WB storage format (RFC 4867).
use std::io;

use crate::bs::Bs;
use crate::importer::{CodecImporter, ImportStatus};
use crate::sample::{Sample, RA_FLAG_SYNC};
use crate::sbuf::Sb;
use crate::summary::{AudioSummary, CodecSpecific, CodecSpecificKind, FourCc, Summary};

const AMR_STORAGE_MAGIC: &[u8] = b"#!AMR";
const AMRWB_EX_MAGIC: &[u8] = b"WB\n";

// Frame payload sizes per frame type, table-of-contents byte excluded.
const FRAME_SIZE: [[usize; 16]; 2] = [
    [13, 14, 16, 18, 20, 21, 27, 32, 5, 5, 5, 5, 0, 0, 0, 1],
    [18, 24, 33, 37, 41, 47, 51, 59, 61, 6, 6, 0, 0, 0, 1, 1],
];

const DAMR_LENGTH: u32 = 17;

/// Serialize a `damr` box.
///
/// The vendor fields are codec-vendor specific; we are not a vendor, so
/// dummy/safe values are used: all frame types possible, mode changes at
/// every frame, one frame per sample.
pub fn create_damr() -> Vec<u8> {
    let mut bs = Bs::new();
    bs.put_be32(DAMR_LENGTH);
    bs.put_bytes(b"damr");
    bs.put_be32(0x2020_2020); /* vendor */
    bs.put_byte(0); /* decoder_version */
    bs.put_be16(0x83ff); /* mode_set */
    bs.put_byte(1); /* mode_change_period */
    bs.put_byte(1); /* frames_per_sample */
    bs.export_data().unwrap_or_default()
}

struct AmrImporter {
    wb:               bool,
    samples_in_frame: u32,
    au_number:        u32,
    eof:              bool,
}

pub(crate) fn probe(sb: &mut Sb) -> io::Result<(Box<dyn CodecImporter>, Summary)> {
    let mut buf = [0u8; 6];
    if sb.read_bytes(&mut buf)? != 6 {
        return Err(ioerr!(UnexpectedEof, "not an AMR stream"));
    }
    if &buf[..5] != AMR_STORAGE_MAGIC {
        return Err(ioerr!(InvalidData, "no AMR storage magic"));
    }
    let wb = if buf[5] == b'\n' {
        false
    } else if buf[5] == b'-' {
        let mut ext = [0u8; 3];
        if sb.read_bytes(&mut ext)? != 3 || ext != *AMRWB_EX_MAGIC {
            return Err(ioerr!(InvalidData, "unsupported AMR variant"));
        }
        true
    } else {
        return Err(ioerr!(InvalidData, "unsupported AMR variant"));
    };
    let mut summary = AudioSummary::default();
    summary.sample_type = FourCc::new(if wb { b"sawb" } else { b"samr" });
    summary.max_au_length = if wb { 61 } else { 32 };
    summary.frequency = 8000 << wb as u32;
    summary.channels = 1;
    summary.sample_size = 16;
    summary.samples_in_frame = 160 << wb as u32;
    summary
        .codec_specific
        .push(CodecSpecific::new(CodecSpecificKind::Amr, create_damr()));
    let importer = AmrImporter {
        wb,
        samples_in_frame: summary.samples_in_frame,
        au_number: 0,
        eof: false,
    };
    Ok((Box::new(importer), Summary::Audio(summary)))
}

impl CodecImporter for AmrImporter {
    fn get_access_unit(
        &mut self,
        sb: &mut Sb,
        _summary: &mut Summary,
        sample: &mut Sample,
    ) -> io::Result<ImportStatus> {
        if self.eof {
            sample.length = 0;
            return Ok(ImportStatus::Eof);
        }
        if sb.read_bytes(&mut sample.data[..1])? == 0 {
            self.eof = true;
            sample.length = 0;
            return Ok(ImportStatus::Eof);
        }
        let ft = (sample.data[0] >> 3) & 0x0f;
        let read_size = FRAME_SIZE[self.wb as usize][ft as usize];
        if read_size == 0 {
            return Err(ioerr!(InvalidData, "invalid AMR frame type {}", ft));
        }
        if sample.data.len() < read_size {
            return Err(ioerr!(InvalidInput, "sample buffer smaller than one frame"));
        }
        let body = read_size - 1;
        if body > 0 && sb.read_bytes(&mut sample.data[1..read_size])? != body {
            return Err(ioerr!(UnexpectedEof, "truncated AMR frame"));
        }
        sample.length = read_size;
        sample.dts = self.au_number as u64 * self.samples_in_frame as u64;
        sample.cts = sample.dts;
        sample.prop = Default::default();
        sample.prop.ra_flags = RA_FLAG_SYNC;
        self.au_number += 1;
        Ok(ImportStatus::Ok)
    }

    fn last_delta(&self, _summary: &Summary) -> u32 {
        self.samples_in_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbuf::SbStream;

    fn sb_of(data: Vec<u8>) -> Sb {
        Sb::new(SbStream::Memory { data, consumed: 0 }, 1 << 16)
    }

    #[test]
    fn damr_blob() {
        let damr = create_damr();
        assert_eq!(damr.len(), 17);
        assert_eq!(&damr[..8], &[0, 0, 0, 17, b'd', b'a', b'm', b'r']);
        assert_eq!(&damr[8..12], b"    ");
        assert_eq!(&damr[13..15], &[0x83, 0xff]);
    }

    #[test]
    fn narrowband_frames() {
        let mut stream = b"#!AMR\n".to_vec();
        // FT 0: 13 bytes total.
        stream.push(0 << 3);
        stream.extend_from_slice(&[0x11; 12]);
        // FT 7: 32 bytes total.
        stream.push(7 << 3);
        stream.extend_from_slice(&[0x22; 31]);
        let mut sb = sb_of(stream);
        let (mut imp, mut summary) = probe(&mut sb).unwrap();
        assert_eq!(summary.audio().unwrap().frequency, 8000);
        let mut sample = Sample::with_capacity(32);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        assert_eq!(sample.length, 13);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        assert_eq!(sample.length, 32);
        assert_eq!(sample.dts, 160);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Eof);
    }

    #[test]
    fn wideband_magic() {
        let mut stream = b"#!AMR-WB\n".to_vec();
        stream.push(9 << 3); // FT 9: 6 bytes
        stream.extend_from_slice(&[0x33; 5]);
        let mut sb = sb_of(stream);
        let (mut imp, mut summary) = probe(&mut sb).unwrap();
        assert_eq!(summary.audio().unwrap().frequency, 16000);
        assert_eq!(summary.audio().unwrap().samples_in_frame, 320);
        let mut sample = Sample::with_capacity(61);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        assert_eq!(sample.length, 6);
    }

    #[test]
    fn amrwb_plus_is_rejected() {
        let mut sb = sb_of(b"#!AMR-WB+\n".to_vec());
        assert!(probe(&mut sb).is_err());
    }
}

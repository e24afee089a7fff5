//! AAC in ADTS transport (ISO/IEC 14496-3).
//!
//! Only Low Complexity objects are accepted. One ADTS frame usually holds
//! one raw_data_block; the multi-block form is supported when the header
//! CRC is present, since the CRC section is the only way to find the block
//! boundaries without decoding.
use std::io;

use crate::codec::mp4a;
use crate::descriptor::{self, Mp4sysDecoderParameters, OTI_AUDIO_ISO_14496_3, STREAM_TYPE_AUDIO};
use crate::importer::{CodecImporter, ImportStatus};
use crate::sample::{Sample, RA_FLAG_SYNC};
use crate::sbuf::Sb;
use crate::summary::{AudioSummary, CodecSpecific, CodecSpecificKind, FourCc, Summary};

const ADTS_BASIC_HEADER_LENGTH: usize = 7;
const ADTS_MAX_FRAME_LENGTH: usize = (1 << 13) - 1;
const ADTS_MAX_RAW_DATA_BLOCKS: usize = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct AdtsFixedHeader {
    id:                       u8,
    layer:                    u8,
    protection_absent:        u8,
    profile_object_type:      u8,
    sampling_frequency_index: u8,
    channel_configuration:    u8,
}

impl AdtsFixedHeader {
    fn parse(buf: &[u8; ADTS_BASIC_HEADER_LENGTH]) -> AdtsFixedHeader {
        AdtsFixedHeader {
            id:                       (buf[1] >> 3) & 0x1,
            layer:                    (buf[1] >> 1) & 0x3,
            protection_absent:        buf[1] & 0x1,
            profile_object_type:      buf[2] >> 6,
            sampling_frequency_index: (buf[2] >> 2) & 0xf,
            channel_configuration:    ((buf[2] << 2) | (buf[3] >> 6)) & 0x07,
        }
    }

    fn check(&self, buf: &[u8; ADTS_BASIC_HEADER_LENGTH]) -> io::Result<()> {
        let syncword = ((buf[0] as u16) << 4) | (buf[1] >> 4) as u16;
        if syncword != 0xfff {
            return Err(ioerr!(InvalidData, "no ADTS syncword"));
        }
        if self.layer != 0x0 {
            // Must be 0b00 for any form of AAC.
            return Err(ioerr!(InvalidData, "ADTS layer is nonzero"));
        }
        if self.profile_object_type != 0x1 {
            // 0b00=Main, 0b01=LC, 0b10=SSR, 0b11=LTP.
            return Err(ioerr!(InvalidData, "only AAC-LC is supported"));
        }
        if self.sampling_frequency_index > 0xb {
            return Err(ioerr!(InvalidData, "bad ADTS sampling_frequency_index"));
        }
        if self.channel_configuration == 0x0 {
            return Err(ioerr!(InvalidData, "channel_configuration 0 is not supported"));
        }
        if self.profile_object_type == 0x3 && self.id != 0x0 {
            // LTP is only valid for MPEG-4 ADTS.
            return Err(ioerr!(InvalidData, "LTP requires MPEG-4 ADTS"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct AdtsVariableHeader {
    frame_length:                       u16,
    number_of_raw_data_blocks_in_frame: u8,
    raw_data_block_size:                [u16; ADTS_MAX_RAW_DATA_BLOCKS],
}

impl AdtsVariableHeader {
    /// Parse the variable header and, when a CRC section is present,
    /// consume it from the stream to derive the block sizes.
    fn parse(
        sb: &mut Sb,
        buf: &[u8; ADTS_BASIC_HEADER_LENGTH],
        protection_absent: u8,
    ) -> io::Result<AdtsVariableHeader> {
        let mut header = AdtsVariableHeader::default();
        header.frame_length =
            (((buf[3] as u32) << 11) | ((buf[4] as u32) << 3) | (buf[5] >> 5) as u32) as u16 & 0x1fff;
        header.number_of_raw_data_blocks_in_frame = buf[6] & 0x3;
        if header.frame_length as usize
            <= ADTS_BASIC_HEADER_LENGTH + 2 * (protection_absent == 0) as usize
        {
            return Err(ioerr!(InvalidData, "ADTS frame_length too small"));
        }
        let number_of_blocks = header.number_of_raw_data_blocks_in_frame as usize;
        if number_of_blocks == 0 {
            header.raw_data_block_size[0] =
                header.frame_length - ADTS_BASIC_HEADER_LENGTH as u16;
            // Skip adts_error_check() and subtract it from the block size.
            if protection_absent == 0 {
                header.raw_data_block_size[0] -= 2;
                let mut crc = [0u8; 2];
                if sb.read_bytes(&mut crc)? != 2 {
                    return Err(ioerr!(UnexpectedEof, "truncated ADTS frame"));
                }
            }
            return Ok(header);
        }
        if protection_absent != 0 {
            // Without the header CRC section the raw_data_block boundaries
            // can only be found by decoding; give up on this combination.
            return Err(ioerr!(
                InvalidData,
                "multiple raw_data_blocks without a CRC section"
            ));
        }
        // adts_header_error_check(): block positions, then crc_check.
        let mut raw_data_block_position = [0u16; ADTS_MAX_RAW_DATA_BLOCKS + 1];
        let mut buf2 = [0u8; 2];
        for i in 0..number_of_blocks {
            if sb.read_bytes(&mut buf2)? != 2 {
                return Err(ioerr!(UnexpectedEof, "truncated ADTS header error check"));
            }
            raw_data_block_position[i] = u16::from_be_bytes(buf2);
        }
        if sb.read_bytes(&mut buf2)? != 2 {
            return Err(ioerr!(UnexpectedEof, "truncated ADTS header error check"));
        }
        let first_offset = ADTS_BASIC_HEADER_LENGTH as u16 + 2 * number_of_blocks as u16 + 2;
        // Convert raw_data_block_position to sizes; a dummy tail position
        // closes the last block.
        header.raw_data_block_size[0] = raw_data_block_position[0] - first_offset;
        raw_data_block_position[number_of_blocks] = header.frame_length;
        for i in 1..=number_of_blocks {
            header.raw_data_block_size[i] =
                raw_data_block_position[i] - raw_data_block_position[i - 1];
        }
        // Each block carries its own adts_raw_data_block_error_check().
        for i in 0..=number_of_blocks {
            header.raw_data_block_size[i] -= 2;
        }
        Ok(header)
    }
}

fn parse_headers(
    sb: &mut Sb,
    buf: &[u8; ADTS_BASIC_HEADER_LENGTH],
) -> io::Result<(AdtsFixedHeader, AdtsVariableHeader)> {
    let fixed = AdtsFixedHeader::parse(buf);
    fixed.check(buf)?;
    let variable = AdtsVariableHeader::parse(sb, buf, fixed.protection_absent)?;
    Ok((fixed, variable))
}

fn adts_summary(header: &AdtsFixedHeader) -> io::Result<AudioSummary> {
    let mut summary = AudioSummary::default();
    summary.sample_type = FourCc::new(b"mp4a");
    summary.max_au_length = ADTS_MAX_FRAME_LENGTH;
    summary.frequency = mp4a::frequency_of_index(header.sampling_frequency_index);
    summary.channels = header.channel_configuration as u32
        + (header.channel_configuration == 0x07) as u32; // 0x07 means 7.1ch
    summary.sample_size = 16;
    summary.samples_in_frame = 1024;
    summary.aot = mp4a::AOT_AAC_MAIN + header.profile_object_type;
    let asc = mp4a::export_audio_specific_config(summary.aot, summary.frequency, summary.channels, None)?;
    let esds = descriptor::create_mp4sys_decoder_config(&Mp4sysDecoderParameters {
        object_type_indication: OTI_AUDIO_ISO_14496_3,
        stream_type:            STREAM_TYPE_AUDIO,
        dsi_payload:            Some(asc),
        ..Mp4sysDecoderParameters::default()
    })?;
    summary
        .codec_specific
        .push(CodecSpecific::new(CodecSpecificKind::Mp4sysDecoderConfig, esds));
    Ok(summary)
}

struct AdtsImporter {
    status:             ImportStatus,
    raw_data_block_idx: usize,
    header:             AdtsFixedHeader,
    variable_header:    AdtsVariableHeader,
    samples_in_frame:   u32,
    au_number:          u32,
}

pub(crate) fn probe(sb: &mut Sb) -> io::Result<(Box<dyn CodecImporter>, Summary)> {
    let mut buf = [0u8; ADTS_BASIC_HEADER_LENGTH];
    if sb.read_bytes(&mut buf)? != ADTS_BASIC_HEADER_LENGTH {
        return Err(ioerr!(UnexpectedEof, "not an ADTS stream"));
    }
    let (header, variable_header) = parse_headers(sb, &buf)?;
    let summary = adts_summary(&header)?;
    let importer = AdtsImporter {
        status: ImportStatus::Ok,
        raw_data_block_idx: 0,
        header,
        variable_header,
        samples_in_frame: summary.samples_in_frame,
        au_number: 0,
    };
    Ok((Box::new(importer), Summary::Audio(summary)))
}

impl CodecImporter for AdtsImporter {
    fn get_access_unit(
        &mut self,
        sb: &mut Sb,
        summary: &mut Summary,
        sample: &mut Sample,
    ) -> io::Result<ImportStatus> {
        let current_status = self.status;
        let raw_data_block_size =
            self.variable_header.raw_data_block_size[self.raw_data_block_idx] as usize;
        if current_status == ImportStatus::Eof {
            sample.length = 0;
            return Ok(ImportStatus::Eof);
        }
        if sample.data.len() < raw_data_block_size {
            return Err(ioerr!(InvalidInput, "sample buffer smaller than one raw_data_block"));
        }
        if current_status == ImportStatus::Change {
            let new_summary = adts_summary(&self.header)?;
            self.samples_in_frame = new_summary.samples_in_frame;
            *summary = Summary::Audio(new_summary);
        }
        // One raw_data_block(), typically the whole ADTS frame payload.
        if sb.read_bytes(&mut sample.data[..raw_data_block_size])? != raw_data_block_size {
            return Err(ioerr!(UnexpectedEof, "truncated ADTS frame"));
        }
        sample.length = raw_data_block_size;
        sample.dts = self.au_number as u64 * self.samples_in_frame as u64;
        sample.cts = sample.dts;
        sample.prop = Default::default();
        sample.prop.ra_flags = RA_FLAG_SYNC;
        sample.prop.pre_roll.distance = 1; // MDCT
        self.au_number += 1;
        // Skip adts_raw_data_block_error_check().
        if self.header.protection_absent == 0
            && self.variable_header.number_of_raw_data_blocks_in_frame != 0
        {
            let mut crc = [0u8; 2];
            if sb.read_bytes(&mut crc)? != 2 {
                return Err(ioerr!(UnexpectedEof, "truncated ADTS block error check"));
            }
        }
        // More raw_data_block()s in the current adts_frame()?
        if self.raw_data_block_idx
            < self.variable_header.number_of_raw_data_blocks_in_frame as usize
        {
            self.raw_data_block_idx += 1;
            self.status = ImportStatus::Ok;
            return Ok(current_status);
        }
        self.raw_data_block_idx = 0;
        // Prepare the next frame.
        let mut buf = [0u8; ADTS_BASIC_HEADER_LENGTH];
        let ret = sb.read_bytes(&mut buf)?;
        if ret == 0 {
            self.status = ImportStatus::Eof;
            return Ok(current_status);
        }
        if ret != ADTS_BASIC_HEADER_LENGTH {
            return Err(ioerr!(UnexpectedEof, "truncated ADTS header"));
        }
        // The ADTS fixed header cannot change mid-stream by its spec, but
        // an MP4 track may change its description, so some changes pass.
        let (header, variable_header) = parse_headers(sb, &buf)?;
        self.variable_header = variable_header;
        if self.header.profile_object_type != header.profile_object_type
            || self.header.id != header.id
            || self.header.sampling_frequency_index != header.sampling_frequency_index
        {
            // Changes of object type or timebase cannot be represented.
            return Err(ioerr!(InvalidData, "unsupported ADTS header change"));
        }
        if self.header.channel_configuration != header.channel_configuration {
            // The summary update happens on the next call so the current
            // sample still belongs to the old description.
            self.header = header;
            self.status = ImportStatus::Change;
        } else {
            self.status = ImportStatus::Ok;
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

    pub(crate) fn adts_frame(channel_configuration: u8, payload: &[u8]) -> Vec<u8> {
        let frame_length = (ADTS_BASIC_HEADER_LENGTH + payload.len()) as u16;
        let mut frame = Vec::new();
        frame.push(0xff);
        // syncword tail (4) + ID 0 + layer 00 + protection_absent 1
        frame.push(0xf1);
        // profile LC (01) + sampling_frequency_index 3 (48 kHz) + private 0
        // + channel_configuration high bit
        frame.push(0x40 | (3 << 2) | (channel_configuration >> 2));
        frame.push((channel_configuration << 6) | ((frame_length >> 11) as u8 & 0x3));
        frame.push((frame_length >> 3) as u8);
        frame.push(((frame_length as u8) << 5) | 0x1f);
        frame.push(0xfc);
        frame.extend_from_slice(payload);
        frame
    }

    fn sb_of(data: Vec<u8>) -> Sb {
        Sb::new(SbStream::Memory { data, consumed: 0 }, 1 << 16)
    }

    #[test]
    fn probe_and_deliver() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&adts_frame(2, &[0xde, 0xad]));
        stream.extend_from_slice(&adts_frame(2, &[0xbe, 0xef, 0x01]));
        let mut sb = sb_of(stream);
        let (mut imp, mut summary) = probe(&mut sb).unwrap();
        let audio = summary.audio().unwrap();
        assert_eq!(audio.frequency, 48000);
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.samples_in_frame, 1024);
        let mut sample = Sample::with_capacity(ADTS_MAX_FRAME_LENGTH);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        assert_eq!(sample.payload(), &[0xde, 0xad]);
        assert_eq!(sample.dts, 0);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        assert_eq!(sample.payload(), &[0xbe, 0xef, 0x01]);
        assert_eq!(sample.dts, 1024);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Eof);
        assert_eq!(sample.length, 0);
        assert_eq!(imp.last_delta(&summary), 1024);
    }

    #[test]
    fn channel_change_is_signalled() {
        let mut stream = Vec::new();
        for _ in 0..5 {
            stream.extend_from_slice(&adts_frame(2, &[0xaa]));
        }
        for _ in 0..5 {
            stream.extend_from_slice(&adts_frame(1, &[0xbb]));
        }
        let mut sb = sb_of(stream);
        let (mut imp, mut summary) = probe(&mut sb).unwrap();
        let mut sample = Sample::with_capacity(ADTS_MAX_FRAME_LENGTH);
        let mut statuses = Vec::new();
        loop {
            let status = imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap();
            statuses.push(status);
            if status == ImportStatus::Eof {
                break;
            }
        }
        use ImportStatus::*;
        assert_eq!(statuses, vec![Ok, Ok, Ok, Ok, Ok, Change, Ok, Ok, Ok, Ok, Eof]);
        assert_eq!(summary.audio().unwrap().channels, 1);
    }

    #[test]
    fn non_lc_profile_is_rejected() {
        let mut frame = adts_frame(2, &[0x00]);
        frame[2] = (frame[2] & 0x3f) | 0x80; // SSR
        let mut sb = sb_of(frame);
        assert!(probe(&mut sb).is_err());
    }
}

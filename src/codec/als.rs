//! MPEG-4 ALS (ISO/IEC 14496-3 2009, subpart 11).
//!
//! The whole ALSSpecificConfig is captured verbatim into the summary; the
//! stored copy gets its ra_flag cleared because the per-AU ra_unit_size
//! prefixes are stripped from the delivered access units.
use std::io;

use crate::codec::mp4a;
use crate::descriptor::{self, Mp4sysDecoderParameters, OTI_AUDIO_ISO_14496_3, STREAM_TYPE_AUDIO};
use crate::importer::{CodecImporter, ImportStatus};
use crate::sample::{Sample, RA_FLAG_SYNC};
use crate::sbuf::Sb;
use crate::summary::{AudioSummary, CodecSpecific, CodecSpecificKind, FourCc, Summary};

const ALSSC_TWELVE_LENGTH: usize = 22;

#[derive(Default)]
struct AlsSpecificConfig {
    samp_freq:          u32,
    samples:            u32,
    channels:           u32,
    frame_length:       u16,
    resolution:         u8,
    random_access:      u8,
    ra_flag:            u8,
    access_unit_size:   usize,
    number_of_ra_units: u32,
    ra_unit_size:       Option<Vec<u32>>,
    sc_data:            Vec<u8>,
}

fn check_update(sb: &mut Sb, size: usize) -> io::Result<()> {
    if sb.update(size - 1)? < size {
        return Err(ioerr!(UnexpectedEof, "truncated ALS specific config"));
    }
    Ok(())
}

fn copy_from_window(alssc: &mut AlsSpecificConfig, sb: &mut Sb, size: usize) {
    let start = alssc.sc_data.len();
    alssc.sc_data.resize(start + size, 0);
    let dst_range = start..start + size;
    sb.memcpy_out(&mut alssc.sc_data[dst_range]);
}

fn be32_at(sb: &Sb, offset: usize) -> u32 {
    u32::from_be_bytes([
        sb.byte_at(offset),
        sb.byte_at(offset + 1),
        sb.byte_at(offset + 2),
        sb.byte_at(offset + 3),
    ])
}

fn parse_specific_config(sb: &mut Sb) -> io::Result<AlsSpecificConfig> {
    sb.set_pos(0);
    sb.read(0)?;
    if sb.remainder() < ALSSC_TWELVE_LENGTH {
        return Err(ioerr!(UnexpectedEof, "not an ALS stream"));
    }
    let w = sb.window();
    if &w[..4] != b"ALS\0" {
        return Err(ioerr!(InvalidData, "no ALS identifier"));
    }
    let mut alssc = AlsSpecificConfig::default();
    alssc.samp_freq = u32::from_be_bytes([w[4], w[5], w[6], w[7]]);
    alssc.samples = u32::from_be_bytes([w[8], w[9], w[10], w[11]]);
    if alssc.samples == 0xffff_ffff {
        return Err(ioerr!(InvalidData, "streamed ALS (unknown sample count) is not supported"));
    }
    alssc.channels = ((w[12] as u32) << 8) | w[13] as u32;
    alssc.resolution = (w[14] & 0x1c) >> 2;
    if alssc.resolution > 3 {
        return Err(ioerr!(InvalidData, "reserved ALS resolution"));
    }
    alssc.frame_length = ((w[15] as u16) << 8) | w[16] as u16;
    alssc.random_access = w[17];
    alssc.ra_flag = (w[18] & 0xc0) >> 6;
    if alssc.ra_flag == 0 {
        return Err(ioerr!(InvalidData, "ALS without random access info is not supported"));
    }
    let chan_sort = w[20] & 0x1 != 0;
    if alssc.channels == 0 {
        if w[20] & 0x8 != 0 {
            return Err(ioerr!(InvalidData, "mono ALS with joint_stereo"));
        } else if w[20] & 0x4 != 0 {
            return Err(ioerr!(InvalidData, "mono ALS with mc_coding"));
        } else if chan_sort {
            return Err(ioerr!(InvalidData, "mono ALS with chan_sort"));
        }
    }
    let chan_config = w[20] & 0x2 != 0;
    let crc_enabled = w[21] & 0x80 != 0;
    let aux_data_enabled = w[21] & 0x1 != 0;
    // Capture the fixed prefix, with ra_flag forced to 0 in the stored
    // copy: the per-AU ra_unit_size words are stripped on delivery.
    let mut head = [0u8; ALSSC_TWELVE_LENGTH];
    sb.memcpy_out(&mut head);
    head[18] &= 0x3f;
    alssc.sc_data.extend_from_slice(&head);
    if chan_config {
        // chan_config_info
        check_update(sb, 2)?;
        copy_from_window(&mut alssc, sb, 2);
    }
    if chan_sort {
        // ceil(log2(channels + 1)), 1..=16 bits per entry.
        let mut ch_bits = 1u32;
        while alssc.channels >> ch_bits != 0 {
            ch_bits += 1;
        }
        let chan_pos_length = (alssc.channels + 1) * ch_bits;
        let chan_pos_length = (chan_pos_length / 8 + (chan_pos_length % 8 != 0) as u32) as usize;
        sb.resize(chan_pos_length + 1);
        check_update(sb, chan_pos_length)?;
        copy_from_window(&mut alssc, sb, chan_pos_length);
    }
    // header_size and trailer_size
    check_update(sb, 8)?;
    let header_size = be32_at(sb, 0);
    let trailer_size = be32_at(sb, 4);
    copy_from_window(&mut alssc, sb, 8);
    // orig_header, orig_trailer and crc
    let read_size = header_size as usize * (header_size != 0xffff_ffff) as usize
        + trailer_size as usize * (trailer_size != 0xffff_ffff) as usize
        + 4 * crc_enabled as usize;
    if read_size > 0 {
        sb.resize(read_size + 1);
        check_update(sb, read_size)?;
        copy_from_window(&mut alssc, sb, read_size);
    }
    // Random access units
    let number_of_frames = alssc.samples / (alssc.frame_length as u32 + 1)
        + (alssc.samples % (alssc.frame_length as u32 + 1) != 0) as u32;
    if alssc.random_access != 0 {
        alssc.number_of_ra_units = number_of_frames / alssc.random_access as u32
            + (number_of_frames % alssc.random_access as u32 != 0) as u32;
    }
    if alssc.ra_flag == 2 && alssc.random_access != 0 {
        // The ra_unit_size table is consumed here but not stored.
        let read_size = alssc.number_of_ra_units as usize * 4;
        sb.resize(read_size + 1);
        check_update(sb, read_size)?;
        let mut sizes = Vec::with_capacity(alssc.number_of_ra_units as usize);
        let mut max_ra_unit_size = 0usize;
        for _ in 0..alssc.number_of_ra_units {
            if sb.remainder() < 4 {
                return Err(ioerr!(UnexpectedEof, "truncated ra_unit_size table"));
            }
            let size = be32_at(sb, 0);
            sb.seek_cur(4);
            max_ra_unit_size = max_ra_unit_size.max(size as usize);
            sizes.push(size);
        }
        alssc.ra_unit_size = Some(sizes);
        if max_ra_unit_size > sb.buffer_size() {
            sb.resize(max_ra_unit_size);
        }
    }
    // auxiliary data
    if aux_data_enabled {
        check_update(sb, 4)?;
        let aux_size = be32_at(sb, 0);
        copy_from_window(&mut alssc, sb, 4);
        if aux_size != 0 && aux_size != 0xffff_ffff {
            sb.resize(aux_size as usize + 1);
            check_update(sb, aux_size as usize)?;
            copy_from_window(&mut alssc, sb, aux_size as usize);
        }
    }
    Ok(alssc)
}

fn als_summary(sb: &mut Sb, alssc: &mut AlsSpecificConfig) -> io::Result<AudioSummary> {
    let mut summary = AudioSummary::default();
    summary.sample_type = FourCc::new(b"mp4a");
    summary.aot = mp4a::AOT_ALS;
    summary.frequency = alssc.samp_freq;
    summary.channels = alssc.channels + 1;
    summary.sample_size = (alssc.resolution as u32 + 1) * 8;
    if alssc.random_access != 0 {
        summary.samples_in_frame = (alssc.frame_length as u32 + 1) * alssc.random_access as u32;
        summary.max_au_length =
            (summary.channels * (summary.sample_size / 8) * summary.samples_in_frame) as usize;
    } else {
        // The remainder of the whole stream forms one access unit; pull
        // it all into the window, growing it as needed.
        alssc.access_unit_size = sb.remainder();
        let mut buffer_size = sb.buffer_size();
        while !sb.is_eos() {
            sb.resize(buffer_size);
            alssc.access_unit_size = sb.update(buffer_size - 1)?;
            buffer_size <<= 1;
        }
        summary.max_au_length = alssc.access_unit_size;
        summary.samples_in_frame = 0; // the delta comes from the sample count
    }
    let asc = mp4a::export_audio_specific_config(
        mp4a::AOT_ALS,
        summary.frequency,
        summary.channels,
        Some(&alssc.sc_data),
    )?;
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

struct AlsImporter {
    status:           ImportStatus,
    alssc:            AlsSpecificConfig,
    samples_in_frame: u32,
    au_number:        u32,
}

pub(crate) fn probe(sb: &mut Sb) -> io::Result<(Box<dyn CodecImporter>, Summary)> {
    let mut alssc = parse_specific_config(sb)?;
    let summary = als_summary(sb, &mut alssc)?;
    let importer = AlsImporter {
        status: ImportStatus::Ok,
        samples_in_frame: summary.samples_in_frame,
        alssc,
        au_number: 0,
    };
    Ok((Box::new(importer), Summary::Audio(summary)))
}

impl CodecImporter for AlsImporter {
    fn get_access_unit(
        &mut self,
        sb: &mut Sb,
        _summary: &mut Summary,
        sample: &mut Sample,
    ) -> io::Result<ImportStatus> {
        if self.status == ImportStatus::Eof {
            sample.length = 0;
            return Ok(ImportStatus::Eof);
        }
        let alssc = &self.alssc;
        if alssc.number_of_ra_units == 0 {
            // The whole remaining stream is one access unit.
            let size = alssc.access_unit_size;
            if sample.data.len() < size {
                return Err(ioerr!(InvalidInput, "sample buffer smaller than the access unit"));
            }
            sb.memcpy_out(&mut sample.data[..size]);
            sample.length = size;
            sample.dts = 0;
            sample.cts = 0;
            sample.prop = Default::default();
            sample.prop.ra_flags = RA_FLAG_SYNC;
            self.status = ImportStatus::Eof;
            return Ok(ImportStatus::Ok);
        }
        let au_length = if alssc.ra_flag == 2 {
            let sizes = alssc
                .ra_unit_size
                .as_ref()
                .ok_or_else(|| ioerr!(InvalidData, "missing ra_unit_size table"))?;
            sizes[self.au_number as usize] as usize
        } else {
            // ra_flag == 1: the unit is prefixed by its size; strip it.
            check_update(sb, 4)?;
            let len = be32_at(sb, 0) as usize;
            sb.seek_cur(4);
            len
        };
        if au_length == 0 {
            return Err(ioerr!(InvalidData, "empty RA unit"));
        }
        if sample.data.len() < au_length {
            return Err(ioerr!(InvalidInput, "sample buffer smaller than the RA unit"));
        }
        if au_length + 1 > sb.buffer_size() {
            sb.resize(au_length + 1);
        }
        check_update(sb, au_length)?;
        sb.memcpy_out(&mut sample.data[..au_length]);
        sample.length = au_length;
        sample.dts = self.au_number as u64 * self.samples_in_frame as u64;
        sample.cts = sample.dts;
        sample.prop = Default::default();
        sample.prop.ra_flags = RA_FLAG_SYNC;
        self.au_number += 1;
        if self.au_number == alssc.number_of_ra_units {
            self.status = ImportStatus::Eof;
        }
        Ok(ImportStatus::Ok)
    }

    fn last_delta(&self, _summary: &Summary) -> u32 {
        if self.status != ImportStatus::Eof {
            return 0;
        }
        // With number_of_ra_units == 0 samples_in_frame is zero, so this
        // degenerates to the overall sample count.
        self.alssc.samples
            - self.alssc.number_of_ra_units.saturating_sub(1) * self.samples_in_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbuf::SbStream;

    // 48 kHz, 8192 samples, mono, 16-bit, frame_length 4095, one frame
    // per RA unit, ra_flag 1 (sizes precede each RA unit in the stream).
    fn als_config() -> Vec<u8> {
        let mut c = Vec::new();
        c.extend_from_slice(b"ALS\0");
        c.extend_from_slice(&48000u32.to_be_bytes());
        c.extend_from_slice(&8192u32.to_be_bytes());
        c.extend_from_slice(&0u16.to_be_bytes()); // channels - 1
        c.push(0x04); // resolution 1 (16-bit)
        c.extend_from_slice(&4095u16.to_be_bytes()); // frame_length
        c.push(1); // random_access
        c.push(0x40); // ra_flag 1
        c.push(0); // reserved
        c.push(0); // no chan_config / chan_sort / joint stereo
        c.push(0); // no crc, no aux data
        c.extend_from_slice(&0u32.to_be_bytes()); // header_size
        c.extend_from_slice(&0u32.to_be_bytes()); // trailer_size
        c
    }

    fn sb_of(data: Vec<u8>) -> Sb {
        Sb::new(SbStream::Memory { data, consumed: 0 }, 1 << 16)
    }

    #[test]
    fn ra_units_become_access_units() {
        let mut stream = als_config();
        stream.extend_from_slice(&3u32.to_be_bytes());
        stream.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
        stream.extend_from_slice(&5u32.to_be_bytes());
        stream.extend_from_slice(&[1, 2, 3, 4, 5]);
        let mut sb = sb_of(stream);
        let (mut imp, mut summary) = probe(&mut sb).unwrap();
        {
            let audio = summary.audio().unwrap();
            assert_eq!(audio.frequency, 48000);
            assert_eq!(audio.channels, 1);
            assert_eq!(audio.samples_in_frame, 4096);
            assert_eq!(audio.aot, mp4a::AOT_ALS);
        }
        let mut sample = Sample::with_capacity(summary.max_au_length().max(8));
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        assert_eq!(sample.payload(), &[0xaa, 0xbb, 0xcc]);
        assert_eq!(sample.dts, 0);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Ok);
        assert_eq!(sample.payload(), &[1, 2, 3, 4, 5]);
        assert_eq!(sample.dts, 4096);
        assert_eq!(imp.get_access_unit(&mut sb, &mut summary, &mut sample).unwrap(), ImportStatus::Eof);
        assert_eq!(imp.last_delta(&summary), 8192 - 4096);
    }

    #[test]
    fn stored_config_clears_ra_flag() {
        let mut stream = als_config();
        stream.extend_from_slice(&1u32.to_be_bytes());
        stream.push(0x77);
        let mut sb = sb_of(stream);
        let (_imp, summary) = probe(&mut sb).unwrap();
        let esds = &summary.codec_specific()[0].data;
        // The ALSSpecificConfig is embedded in the esds; its magic must
        // appear with ra_flag zeroed right after it.
        let pos = esds.windows(4).position(|w| w == b"ALS\0").unwrap();
        assert_eq!(esds[pos + 18] & 0xc0, 0);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut sb = sb_of(b"ALX\0aaaaaaaaaaaaaaaaaaaaaaaa".to_vec());
        assert!(probe(&mut sb).is_err());
    }
}

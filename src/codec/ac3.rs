//! AC-3 and Enhanced AC-3 (ETSI TS 102 366).
//!
//! Both codecs share the 0x0B77 syncword. Plain AC-3 carries six audio
//! blocks per syncframe; Enhanced AC-3 spreads an access unit over an
//! independent substream 0 plus its dependent substreams until six audio
//! blocks have accumulated.
use std::io;

use crate::bits::Bits;
use crate::bs::Bs;
use crate::importer::{CodecImporter, ImportStatus};
use crate::sample::{Sample, RA_FLAG_SYNC};
use crate::sbuf::Sb;
use crate::summary::{AudioSummary, CodecSpecific, CodecSpecificKind, FourCc, Summary};

pub const AC3_MIN_SYNCFRAME_LENGTH: usize = 128;
pub const AC3_MAX_SYNCFRAME_LENGTH: usize = 3840;
pub const EAC3_MAX_SYNCFRAME_LENGTH: usize = 4096;

// 256 samples per audio block, 6 audio blocks.
const AC3_SAMPLE_DURATION: u32 = 1536;
const EAC3_MIN_SAMPLE_DURATION: u32 = 256;

const AC3_SAMPLE_RATE_TABLE: [u32; 4] = [48000, 44100, 32000, 0];
const EAC3_REDUCED_SAMPLE_RATE_TABLE: [u32; 4] = [24000, 22050, 16000, 0];
const AC3_CHANNEL_COUNT_TABLE: [u32; 8] = [2, 1, 2, 3, 3, 4, 4, 5];
const EAC3_AUDIO_BLOCK_TABLE: [u8; 4] = [1, 2, 3, 6];

// Syncframe sizes in bytes, indexed by frmsizecod >> 1 and fscod.
const AC3_FRAME_SIZE_TABLE: [[u32; 3]; 19] = [
    /*  48,  44.1,    32 */
    [128, 138, 192],
    [160, 174, 240],
    [192, 208, 288],
    [224, 242, 336],
    [256, 278, 384],
    [320, 348, 480],
    [384, 416, 576],
    [448, 486, 672],
    [512, 556, 768],
    [640, 696, 960],
    [768, 834, 1152],
    [896, 974, 1344],
    [1024, 1114, 1536],
    [1280, 1392, 1920],
    [1536, 1670, 2304],
    [1792, 1950, 2688],
    [2048, 2228, 3072],
    [2304, 2506, 3456],
    [2560, 2786, 3840],
];

#[inline]
fn has_syncword(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x0b && data[1] == 0x77
}

/// Parameters of the `dac3` box.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ac3Params {
    pub fscod:      u8,
    pub bsid:       u8,
    pub bsmod:      u8,
    pub acmod:      u8,
    pub lfeon:      u8,
    pub frmsizecod: u8,
}

impl Ac3Params {
    fn check(&self) -> io::Result<()> {
        if self.fscod == 0x3 {
            return Err(ioerr!(InvalidData, "unknown AC-3 sample rate code"));
        }
        if self.frmsizecod > 0x25 {
            return Err(ioerr!(InvalidData, "unknown AC-3 frame size code"));
        }
        if self.bsid >= 10 {
            return Err(ioerr!(InvalidData, "not plain AC-3 (bsid {})", self.bsid));
        }
        Ok(())
    }

    /// Parse the head of one syncframe.
    pub fn from_syncframe(data: &[u8]) -> io::Result<Ac3Params> {
        if data.len() < AC3_MIN_SYNCFRAME_LENGTH {
            return Err(ioerr!(UnexpectedEof, "short AC-3 syncframe"));
        }
        if !has_syncword(data) {
            return Err(ioerr!(InvalidData, "no AC-3 syncword"));
        }
        let mut bits = Bits::new(Bs::new());
        bits.import_data(&data[..AC3_MIN_SYNCFRAME_LENGTH])?;
        let mut param = Ac3Params::default();
        bits.get(32); // syncword + crc1
        param.fscod = bits.get(2) as u8;
        param.frmsizecod = bits.get(6) as u8;
        param.bsid = bits.get(5) as u8;
        param.bsmod = bits.get(3) as u8;
        param.acmod = bits.get(3) as u8;
        if (param.acmod & 0x01) != 0 && param.acmod != 0x01 {
            bits.get(2); // cmixlev
        }
        if param.acmod & 0x04 != 0 {
            bits.get(2); // surmixlev
        }
        if param.acmod == 0x02 {
            bits.get(2); // dsurmod
        }
        param.lfeon = bits.get(1) as u8;
        bits.bs.status()?;
        param.check()?;
        Ok(param)
    }

    /// Syncframe size in bytes.
    pub fn frame_size(&self) -> usize {
        let mut size = AC3_FRAME_SIZE_TABLE[(self.frmsizecod >> 1) as usize][self.fscod as usize];
        if self.fscod == 0x1 && self.frmsizecod & 0x1 != 0 {
            size += 2;
        }
        size as usize
    }

    // The dac3 box ignores the low bit of frmsizecod.
    fn differs_from(&self, other: &Ac3Params) -> bool {
        self.fscod != other.fscod
            || self.bsid != other.bsid
            || self.bsmod != other.bsmod
            || self.acmod != other.acmod
            || self.lfeon != other.lfeon
            || (self.frmsizecod >> 1) != (other.frmsizecod >> 1)
    }
}

/// Serialize a `dac3` box.
pub fn create_ac3_specific_info(param: &Ac3Params) -> Vec<u8> {
    const AC3_SPECIFIC_BOX_LENGTH: u32 = 11;
    let mut bits = Bits::new(Bs::new());
    bits.put(32, AC3_SPECIFIC_BOX_LENGTH as u64);
    bits.put(32, u32::from_be_bytes(*b"dac3") as u64);
    bits.put(2, param.fscod as u64);
    bits.put(5, param.bsid as u64);
    bits.put(3, param.bsmod as u64);
    bits.put(3, param.acmod as u64);
    bits.put(1, param.lfeon as u64);
    bits.put(5, (param.frmsizecod >> 1) as u64);
    bits.put(5, 0);
    bits.export_data().unwrap_or_default()
}

/// Recover `Ac3Params` from a serialized `dac3` box.
pub fn parse_ac3_specific_info(data: &[u8]) -> io::Result<Ac3Params> {
    if data.len() < 11 || &data[4..8] != b"dac3" {
        return Err(ioerr!(InvalidData, "not a dac3 box"));
    }
    let mut bits = Bits::new(Bs::new());
    bits.import_data(&data[8..11])?;
    let mut param = Ac3Params::default();
    param.fscod = bits.get(2) as u8;
    param.bsid = bits.get(5) as u8;
    param.bsmod = bits.get(3) as u8;
    param.acmod = bits.get(3) as u8;
    param.lfeon = bits.get(1) as u8;
    param.frmsizecod = (bits.get(5) as u8) << 1;
    Ok(param)
}

fn ac3_summary(param: &Ac3Params) -> AudioSummary {
    let mut summary = AudioSummary::default();
    summary.sample_type = FourCc::new(b"ac-3");
    summary.max_au_length = AC3_MAX_SYNCFRAME_LENGTH;
    summary.frequency = AC3_SAMPLE_RATE_TABLE[param.fscod as usize];
    summary.channels = AC3_CHANNEL_COUNT_TABLE[param.acmod as usize] + param.lfeon as u32;
    summary.sample_size = 16;
    summary.samples_in_frame = AC3_SAMPLE_DURATION;
    summary
        .codec_specific
        .push(CodecSpecific::new(CodecSpecificKind::Ac3, create_ac3_specific_info(param)));
    summary
}

struct Ac3Importer {
    status:    ImportStatus,
    params:    Ac3Params,
    next_dac3: Option<Vec<u8>>,
    buffer:    [u8; AC3_MAX_SYNCFRAME_LENGTH],
    au_number: u32,
}

pub(crate) fn probe_ac3(sb: &mut Sb) -> io::Result<(Box<dyn CodecImporter>, Summary)> {
    let mut buf = [0u8; AC3_MAX_SYNCFRAME_LENGTH];
    let n = sb.read_bytes(&mut buf[..AC3_MIN_SYNCFRAME_LENGTH])?;
    if n != AC3_MIN_SYNCFRAME_LENGTH {
        return Err(ioerr!(UnexpectedEof, "not an AC-3 stream"));
    }
    let params = Ac3Params::from_syncframe(&buf[..AC3_MIN_SYNCFRAME_LENGTH])?;
    let summary = ac3_summary(&params);
    let importer = Ac3Importer {
        status: ImportStatus::Ok,
        params,
        next_dac3: None,
        buffer: buf,
        au_number: 0,
    };
    Ok((Box::new(importer), Summary::Audio(summary)))
}

impl CodecImporter for Ac3Importer {
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
        let frame_size = self.params.frame_size();
        if sample.data.len() < frame_size {
            return Err(ioerr!(InvalidInput, "sample buffer smaller than one syncframe"));
        }
        if current_status == ImportStatus::Change {
            let audio = match summary {
                Summary::Audio(a) => a,
                _ => return Err(ioerr!(InvalidData, "summary type mismatch")),
            };
            if let Some(dac3) = self.next_dac3.take() {
                audio.codec_specific.clear();
                audio.codec_specific.push(CodecSpecific::new(CodecSpecificKind::Ac3, dac3));
            }
            audio.frequency = AC3_SAMPLE_RATE_TABLE[self.params.fscod as usize];
            audio.channels =
                AC3_CHANNEL_COUNT_TABLE[self.params.acmod as usize] + self.params.lfeon as u32;
        }
        if frame_size > AC3_MIN_SYNCFRAME_LENGTH {
            let read_size = frame_size - AC3_MIN_SYNCFRAME_LENGTH;
            if sb.read_bytes(&mut self.buffer[AC3_MIN_SYNCFRAME_LENGTH..frame_size])? != read_size {
                return Err(ioerr!(UnexpectedEof, "truncated AC-3 syncframe"));
            }
        }
        sample.data[..frame_size].copy_from_slice(&self.buffer[..frame_size]);
        sample.length = frame_size;
        sample.dts = self.au_number as u64 * AC3_SAMPLE_DURATION as u64;
        sample.cts = sample.dts;
        sample.prop = Default::default();
        sample.prop.ra_flags = RA_FLAG_SYNC;
        sample.prop.pre_roll.distance = 1; // MDCT
        self.au_number += 1;
        // Parse the next syncframe header.
        if sb.read_bytes(&mut self.buffer[..AC3_MIN_SYNCFRAME_LENGTH])? != AC3_MIN_SYNCFRAME_LENGTH {
            self.status = ImportStatus::Eof;
        } else {
            let params = Ac3Params::from_syncframe(&self.buffer[..AC3_MIN_SYNCFRAME_LENGTH])?;
            if params.differs_from(&self.params) {
                self.next_dac3 = Some(create_ac3_specific_info(&params));
                self.status = ImportStatus::Change;
            } else {
                self.status = ImportStatus::Ok;
            }
            self.params = params;
        }
        Ok(current_status)
    }

    fn last_delta(&self, _summary: &Summary) -> u32 {
        if self.status == ImportStatus::Eof {
            AC3_SAMPLE_DURATION
        } else {
            0
        }
    }
}

/*---- Enhanced AC-3 ----*/

/// Per-substream fields recorded into the `dec3` box.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Eac3SubstreamInfo {
    pub fscod:       u8,
    pub fscod2:      u8,
    pub bsid:        u8,
    pub bsmod:       u8,
    pub acmod:       u8,
    pub lfeon:       u8,
    pub num_dep_sub: u8,
    pub chan_loc:    u16,
}

/// Parameters of the `dec3` box.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Eac3Params {
    pub data_rate:        u16,
    pub num_ind_sub:      u8,
    pub independent_info: [Eac3SubstreamInfo; 8],
}

/// Map the chanmap field onto the dec3 chan_loc field.
pub fn chan_loc_from_chanmap(chanmap: u16) -> u16 {
    ((chanmap & 0x7f8) >> 2) | ((chanmap & 0x2) >> 1)
}

/// Serialize a `dec3` box.
pub fn create_eac3_specific_info(param: &Eac3Params) -> io::Result<Vec<u8>> {
    if param.num_ind_sub > 7 {
        return Err(ioerr!(InvalidInput, "too many independent substreams"));
    }
    let mut bits = Bits::new(Bs::new());
    bits.put(32, 0); // box size, patched below
    bits.put(32, u32::from_be_bytes(*b"dec3") as u64);
    bits.put(13, param.data_rate as u64);
    bits.put(3, param.num_ind_sub as u64);
    // The loop bound in ETSI TS 102 366 is off by one; substream counts
    // are stored as num_ind_sub + 1.
    for i in 0..=param.num_ind_sub as usize {
        let info = &param.independent_info[i];
        bits.put(2, info.fscod as u64);
        bits.put(5, info.bsid as u64);
        bits.put(5, info.bsmod as u64);
        bits.put(3, info.acmod as u64);
        bits.put(1, info.lfeon as u64);
        bits.put(3, 0); // reserved
        bits.put(4, info.num_dep_sub as u64);
        if info.num_dep_sub > 0 {
            bits.put(9, info.chan_loc as u64);
        } else {
            bits.put(1, 0); // reserved
        }
    }
    let mut data = bits
        .export_data()
        .ok_or_else(|| ioerr!(Other, "empty dec3 payload"))?;
    let size = data.len() as u32;
    data[..4].copy_from_slice(&size.to_be_bytes());
    Ok(data)
}

/// Recover `Eac3Params` from a serialized `dec3` box.
pub fn parse_eac3_specific_info(data: &[u8]) -> io::Result<Eac3Params> {
    if data.len() < 10 || &data[4..8] != b"dec3" {
        return Err(ioerr!(InvalidData, "not a dec3 box"));
    }
    let mut bits = Bits::new(Bs::new());
    bits.import_data(&data[8..])?;
    let mut param = Eac3Params::default();
    param.data_rate = bits.get(13) as u16;
    param.num_ind_sub = bits.get(3) as u8;
    for i in 0..=param.num_ind_sub as usize {
        let info = &mut param.independent_info[i];
        info.fscod = bits.get(2) as u8;
        info.bsid = bits.get(5) as u8;
        info.bsmod = bits.get(5) as u8;
        info.acmod = bits.get(3) as u8;
        info.lfeon = bits.get(1) as u8;
        bits.get(3);
        info.num_dep_sub = bits.get(4) as u8;
        if info.num_dep_sub > 0 {
            info.chan_loc = bits.get(9) as u16;
        } else {
            bits.get(1);
        }
    }
    bits.bs.status()?;
    Ok(param)
}

#[derive(Default)]
struct Eac3Info {
    params:             Eac3Params,
    params_initialized: bool,
    independent_info:   [Eac3SubstreamInfo; 8],
    dependent_info:     Eac3SubstreamInfo,
    strmtyp:            u8,
    substreamid:        u8,
    current_independent_substream_id: u8,
    numblkscod:         u8,
    number_of_audio_blocks: u8,
    number_of_independent_substreams: u8,
    frame_size:         usize,
    syncframe_count:    u32,
    syncframe_count_in_au: u32,
}

impl Eac3Info {
    fn check_syncframe_header(&self) -> io::Result<()> {
        if self.strmtyp == 0x3 {
            return Err(ioerr!(InvalidData, "unknown E-AC-3 stream type"));
        }
        let info = if self.strmtyp != 0x1 {
            &self.independent_info[self.current_independent_substream_id as usize]
        } else {
            &self.dependent_info
        };
        if info.fscod == 0x3 && info.fscod2 == 0x3 {
            return Err(ioerr!(InvalidData, "unknown E-AC-3 sample rate code"));
        }
        if info.bsid < 10 || info.bsid > 16 {
            return Err(ioerr!(InvalidData, "not E-AC-3 (bsid {})", info.bsid));
        }
        Ok(())
    }

    fn update_specific_params(&mut self) {
        self.params.data_rate = 0;
        self.params.num_ind_sub = self.number_of_independent_substreams.saturating_sub(1);
        for i in 0..=self.params.num_ind_sub as usize {
            self.params.independent_info[i] = self.independent_info[i];
        }
        self.params_initialized = true;
    }

    /// Parse one syncframe header; `data` holds at least the fixed head.
    fn parse_syncframe(&mut self, data: &[u8]) -> io::Result<()> {
        let mut bits = Bits::new(Bs::new());
        bits.import_data(data)?;
        bits.get(16); // syncword
        self.strmtyp = bits.get(2) as u8;
        self.substreamid = bits.get(3) as u8;
        if self.strmtyp != 0x1 {
            if self.substreamid == 0x0 && self.number_of_independent_substreams > 0 {
                self.update_specific_params();
            }
            self.current_independent_substream_id = self.substreamid;
            self.independent_info[self.substreamid as usize].chan_loc = 0;
        }
        let acmod;
        let lfeon;
        let fscod;
        {
            let info = if self.strmtyp != 0x1 {
                &mut self.independent_info[self.current_independent_substream_id as usize]
            } else {
                &mut self.dependent_info
            };
            self.frame_size = 2 * (bits.get(11) as usize + 1);
            info.fscod = bits.get(2) as u8;
            if info.fscod == 0x3 {
                info.fscod2 = bits.get(2) as u8;
                self.numblkscod = 0x3;
            } else {
                self.numblkscod = bits.get(2) as u8;
            }
            info.acmod = bits.get(3) as u8;
            info.lfeon = bits.get(1) as u8;
            info.bsid = bits.get(5) as u8;
            acmod = info.acmod;
            lfeon = info.lfeon;
            fscod = info.fscod;
        }
        bits.get(5); // dialnorm
        if bits.get(1) != 0 {
            bits.get(8); // compr
        }
        if acmod == 0x0 {
            bits.get(5); // dialnorm2
            if bits.get(1) != 0 {
                bits.get(8); // compr2
            }
        }
        if self.strmtyp == 0x1 && bits.get(1) != 0 {
            let chanmap = bits.get(16) as u16;
            self.independent_info[self.current_independent_substream_id as usize].chan_loc |=
                chan_loc_from_chanmap(chanmap);
        }
        if bits.get(1) != 0 {
            // mixmdate
            if acmod > 0x2 {
                bits.get(2); // dmixmod
            }
            if ((acmod & 0x1) != 0 && acmod > 0x2) || (acmod & 0x4) != 0 {
                bits.get(6); // ltrt/loro mix levels
            }
            if lfeon != 0 && bits.get(1) != 0 {
                bits.get(5); // lfemixlevcod
            }
            if self.strmtyp == 0x0 {
                if bits.get(1) != 0 {
                    bits.get(6); // pgmscl
                }
                if acmod == 0x0 && bits.get(1) != 0 {
                    bits.get(6); // pgmscl2
                }
                if bits.get(1) != 0 {
                    bits.get(6); // extpgmscl
                }
                match bits.get(2) {
                    0x1 => {
                        bits.get(5); // premixcmpsel, drcsrc, premixcmpscl
                    },
                    0x2 => {
                        bits.get(12); // mixdata
                    },
                    0x3 => {
                        let mixdeflen = bits.get(5);
                        bits.get(8 * (mixdeflen as u32 + 2)); // mixdata + fill
                    },
                    _ => {},
                }
                if acmod < 0x2 {
                    if bits.get(1) != 0 {
                        bits.get(14); // panmean, paninfo
                    }
                    if acmod == 0x0 && bits.get(1) != 0 {
                        bits.get(14); // panmean2, paninfo2
                    }
                }
                if bits.get(1) != 0 {
                    // frmmixcfginfoe
                    if self.numblkscod == 0x0 {
                        bits.get(5);
                    } else {
                        let nblocks = EAC3_AUDIO_BLOCK_TABLE[self.numblkscod as usize];
                        for _ in 0..nblocks {
                            if bits.get(1) != 0 {
                                bits.get(5); // blkmixcfginfo[blk]
                            }
                        }
                    }
                }
            }
        }
        if bits.get(1) != 0 {
            // infomdate
            let bsmod = bits.get(3) as u8;
            {
                let info = if self.strmtyp != 0x1 {
                    &mut self.independent_info[self.current_independent_substream_id as usize]
                } else {
                    &mut self.dependent_info
                };
                info.bsmod = bsmod;
            }
            bits.get(2); // copyrightb, origbs
            if acmod == 0x2 {
                bits.get(4); // dsurmod, dheadphonmod
            } else if acmod >= 0x6 {
                bits.get(2); // dsurexmod
            }
            if bits.get(1) != 0 {
                bits.get(8); // mixlevel, roomtyp, adconvtyp
            }
            if acmod == 0x0 && bits.get(1) != 0 {
                bits.get(8);
            }
            if fscod < 0x3 {
                bits.get(1); // sourcefscod
            }
        } else {
            let info = if self.strmtyp != 0x1 {
                &mut self.independent_info[self.current_independent_substream_id as usize]
            } else {
                &mut self.dependent_info
            };
            info.bsmod = 0;
        }
        if self.strmtyp == 0x0 && self.numblkscod != 0x3 {
            bits.get(1); // convsync
        }
        if self.strmtyp == 0x2 {
            let blkid = if self.numblkscod == 0x3 { 1 } else { bits.get(1) };
            if blkid != 0 {
                bits.get(6); // frmsizecod
            }
        }
        if bits.get(1) != 0 {
            let addbsil = bits.get(6);
            bits.get((addbsil as u32 + 1) * 8);
        }
        bits.bs.status()?;
        self.check_syncframe_header()
    }
}

struct Eac3Importer {
    status:        ImportStatus,
    info:          Eac3Info,
    // Raw-stream scan window and assembled access units.
    buffer:        Vec<u8>,
    buffer_pos:    usize,
    buffer_end:    usize,
    no_more_read:  bool,
    au:            Vec<u8>,
    incomplete_au: Vec<u8>,
    au_length:     usize,
    incomplete_au_length: usize,
    next_dec3:     Option<Vec<u8>>,
    au_number:     u32,
}

impl Eac3Importer {
    fn new() -> Eac3Importer {
        Eac3Importer {
            status: ImportStatus::Ok,
            info: Eac3Info::default(),
            buffer: vec![0u8; 2 * EAC3_MAX_SYNCFRAME_LENGTH],
            buffer_pos: 0,
            buffer_end: 0,
            no_more_read: false,
            au: vec![0u8; EAC3_MAX_SYNCFRAME_LENGTH],
            incomplete_au: vec![0u8; EAC3_MAX_SYNCFRAME_LENGTH],
            au_length: 0,
            incomplete_au_length: 0,
            next_dec3: None,
            au_number: 0,
        }
    }

    fn next_access_unit_internal(&mut self, sb: &mut Sb) -> io::Result<()> {
        let mut complete_au = false;
        while !complete_au {
            // Read data from the stream if needed.
            let mut remainder = self.buffer_end - self.buffer_pos;
            if !self.no_more_read && remainder < EAC3_MAX_SYNCFRAME_LENGTH {
                self.buffer.copy_within(self.buffer_pos..self.buffer_end, 0);
                let read_size =
                    sb.read_bytes(&mut self.buffer[remainder..remainder + EAC3_MAX_SYNCFRAME_LENGTH])?;
                remainder += read_size;
                self.buffer_pos = 0;
                self.buffer_end = remainder;
                self.no_more_read = read_size == 0 && sb.is_eos();
            }
            // The length 5 is required to get the frame size.
            if remainder < 5 {
                // One access unit is supposed to consist of six audio
                // blocks, but a stream may end at a non-mod-6 boundary;
                // flush whatever has accumulated.
                self.status = ImportStatus::Eof;
                complete_au = self.incomplete_au_length > 0;
                if !complete_au {
                    if remainder > 0 {
                        return Err(ioerr!(UnexpectedEof, "trailing garbage in E-AC-3 stream"));
                    }
                    return Ok(());
                }
                if !self.info.params_initialized {
                    self.info.update_specific_params();
                }
            } else {
                if !has_syncword(&self.buffer[self.buffer_pos..]) {
                    return Err(ioerr!(InvalidData, "lost E-AC-3 synchronization"));
                }
                self.info.frame_size = 0;
                let head_end = (self.buffer_pos + EAC3_MAX_SYNCFRAME_LENGTH).min(self.buffer_end);
                let head = &self.buffer[self.buffer_pos..head_end];
                self.info.parse_syncframe(head)?;
                if remainder < self.info.frame_size {
                    return Err(ioerr!(UnexpectedEof, "truncated E-AC-3 syncframe"));
                }
                let independent = self.info.strmtyp != 0x1;
                if independent && self.info.substreamid == 0x0 {
                    if self.info.number_of_audio_blocks == 6 {
                        // First syncframe of the next access unit.
                        self.info.number_of_audio_blocks = 0;
                        complete_au = true;
                    } else if self.info.number_of_audio_blocks > 6 {
                        return Err(ioerr!(InvalidData, "more than six audio blocks in an AU"));
                    }
                    self.info.number_of_audio_blocks +=
                        EAC3_AUDIO_BLOCK_TABLE[self.info.numblkscod as usize];
                    self.info.number_of_independent_substreams = 0;
                } else if self.info.syncframe_count == 0 {
                    // The first syncframe of an AU must be independent
                    // substream 0.
                    return Err(ioerr!(InvalidData, "E-AC-3 stream starts with a dependent substream"));
                }
                if independent {
                    let n = self.info.number_of_independent_substreams as usize;
                    self.info.independent_info[n.min(7)].num_dep_sub = 0;
                    self.info.number_of_independent_substreams += 1;
                } else {
                    let n = self.info.number_of_independent_substreams as usize;
                    self.info.independent_info[n.saturating_sub(1).min(7)].num_dep_sub += 1;
                }
            }
            if complete_au {
                self.au[..self.incomplete_au_length]
                    .copy_from_slice(&self.incomplete_au[..self.incomplete_au_length]);
                self.au_length = self.incomplete_au_length;
                self.incomplete_au_length = 0;
                self.info.syncframe_count_in_au = self.info.syncframe_count;
                self.info.syncframe_count = 0;
                if self.status == ImportStatus::Eof {
                    break;
                }
            }
            // Grow the AU buffers if this frame would overflow them.
            let needed = self.incomplete_au_length + self.info.frame_size;
            if needed > self.au.len() {
                let new_size = self.au.len() + EAC3_MAX_SYNCFRAME_LENGTH;
                self.au.resize(new_size, 0);
                self.incomplete_au.resize(new_size, 0);
            }
            // Append the syncframe.
            self.incomplete_au[self.incomplete_au_length..self.incomplete_au_length + self.info.frame_size]
                .copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + self.info.frame_size]);
            self.incomplete_au_length += self.info.frame_size;
            self.buffer_pos += self.info.frame_size;
            self.info.syncframe_count += 1;
        }
        Ok(())
    }
}

fn eac3_update_sample_rate(summary: &mut AudioSummary, params: &Eac3Params) {
    // Additional independent substreams must be coded at the rate of
    // independent substream 0.
    summary.frequency = AC3_SAMPLE_RATE_TABLE[params.independent_info[0].fscod as usize];
    if summary.frequency == 0 {
        summary.frequency =
            EAC3_REDUCED_SAMPLE_RATE_TABLE[params.independent_info[0].fscod2 as usize];
    }
}

fn eac3_update_channel_info(summary: &mut AudioSummary, params: &Eac3Params) {
    summary.channels = 0;
    for i in 0..=params.num_ind_sub as usize {
        let info = &params.independent_info[i];
        let chan_loc = info.chan_loc;
        let channel_count = AC3_CHANNEL_COUNT_TABLE[info.acmod as usize] /* L/C/R/Ls/Rs */
            + 2 * ((chan_loc >> 8) & 1) as u32     /* Lc/Rc pair */
            + 2 * ((chan_loc >> 7) & 1) as u32     /* Lrs/Rrs pair */
            + ((chan_loc >> 6) & 1) as u32         /* Cs */
            + ((chan_loc >> 5) & 1) as u32         /* Ts */
            + 2 * ((chan_loc >> 4) & 1) as u32     /* Lsd/Rsd pair */
            + 2 * ((chan_loc >> 3) & 1) as u32     /* Lw/Rw pair */
            + 2 * ((chan_loc >> 2) & 1) as u32     /* Lvh/Rvh pair */
            + ((chan_loc >> 1) & 1) as u32         /* Cvh */
            + (chan_loc & 1) as u32                /* LFE2 */
            + info.lfeon as u32;                   /* LFE */
        if channel_count > summary.channels {
            summary.channels = channel_count;
        }
    }
}

fn eac3_summary(importer: &Eac3Importer) -> io::Result<AudioSummary> {
    let mut summary = AudioSummary::default();
    summary.sample_type = FourCc::new(b"ec-3");
    summary.max_au_length =
        importer.info.syncframe_count_in_au as usize * EAC3_MAX_SYNCFRAME_LENGTH;
    summary.sample_size = 16;
    summary.samples_in_frame = EAC3_MIN_SAMPLE_DURATION * 6;
    summary
        .codec_specific
        .push(CodecSpecific::new(CodecSpecificKind::Eac3, create_eac3_specific_info(&importer.info.params)?));
    eac3_update_sample_rate(&mut summary, &importer.info.params);
    eac3_update_channel_info(&mut summary, &importer.info.params);
    Ok(summary)
}

pub(crate) fn probe_eac3(sb: &mut Sb) -> io::Result<(Box<dyn CodecImporter>, Summary)> {
    let mut importer = Eac3Importer::new();
    importer.next_access_unit_internal(sb)?;
    if importer.info.number_of_independent_substreams == 0
        || importer.info.number_of_independent_substreams > 8
    {
        return Err(ioerr!(InvalidData, "not an E-AC-3 stream"));
    }
    let summary = eac3_summary(&importer)?;
    importer.au_number = 0;
    Ok((Box::new(importer), Summary::Audio(summary)))
}

impl CodecImporter for Eac3Importer {
    fn get_access_unit(
        &mut self,
        sb: &mut Sb,
        summary: &mut Summary,
        sample: &mut Sample,
    ) -> io::Result<ImportStatus> {
        let current_status = self.status;
        if sample.data.len() < self.au_length {
            return Err(ioerr!(InvalidInput, "sample buffer smaller than the access unit"));
        }
        if current_status == ImportStatus::Eof && self.au_length == 0 {
            sample.length = 0;
            return Ok(ImportStatus::Eof);
        }
        if current_status == ImportStatus::Change {
            let audio = match summary {
                Summary::Audio(a) => a,
                _ => return Err(ioerr!(InvalidData, "summary type mismatch")),
            };
            if let Some(dec3) = self.next_dec3.take() {
                audio.codec_specific.clear();
                audio.codec_specific.push(CodecSpecific::new(CodecSpecificKind::Eac3, dec3));
            }
            audio.max_au_length =
                self.info.syncframe_count_in_au as usize * EAC3_MAX_SYNCFRAME_LENGTH;
            eac3_update_sample_rate(audio, &self.info.params);
            eac3_update_channel_info(audio, &self.info.params);
        }
        sample.data[..self.au_length].copy_from_slice(&self.au[..self.au_length]);
        sample.length = self.au_length;
        sample.dts = self.au_number as u64 * (EAC3_MIN_SAMPLE_DURATION * 6) as u64;
        sample.cts = sample.dts;
        sample.prop = Default::default();
        sample.prop.ra_flags = RA_FLAG_SYNC;
        sample.prop.pre_roll.distance = 1; // MDCT
        self.au_number += 1;
        if self.status == ImportStatus::Eof {
            // The final flushed access unit still counts as a delivery.
            self.au_length = 0;
            return Ok(if current_status == ImportStatus::Change {
                ImportStatus::Change
            } else {
                ImportStatus::Ok
            });
        }
        let old_syncframe_count_in_au = self.info.syncframe_count_in_au;
        self.next_access_unit_internal(sb)?;
        if self.info.syncframe_count_in_au > 0 {
            // Check for a sample description change.
            let dec3 = create_eac3_specific_info(&self.info.params)?;
            let active = summary
                .find_codec_specific(CodecSpecificKind::Eac3)
                .map(|cs| cs.data.as_slice());
            if self.info.syncframe_count_in_au > old_syncframe_count_in_au
                || active.map_or(true, |d| d != dec3.as_slice())
            {
                self.next_dec3 = Some(dec3);
                self.status = ImportStatus::Change;
            } else if self.status != ImportStatus::Eof {
                self.status = ImportStatus::Ok;
            }
        }
        Ok(current_status)
    }

    fn last_delta(&self, _summary: &Summary) -> u32 {
        if self.status != ImportStatus::Eof || self.au_length != 0 {
            return 0;
        }
        EAC3_MIN_SAMPLE_DURATION * self.info.number_of_audio_blocks as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 48 kHz, 128 kbps, 2/0, no LFE: fscod 0, frmsizecod 8, bsid 8.
    fn test_syncframe() -> Vec<u8> {
        let mut frame = vec![0u8; 256];
        frame[0] = 0x0b;
        frame[1] = 0x77;
        // crc1 (16 bits), then fscod(2)=0 frmsizecod(6)=8 -> 0x08
        frame[4] = 0x08;
        // bsid(5)=8 bsmod(3)=0 -> 0x40; acmod(3)=2 ... -> 0x40
        frame[5] = 0x40;
        frame[6] = 0x40;
        frame
    }

    #[test]
    fn parse_syncframe_header() {
        let frame = test_syncframe();
        let params = Ac3Params::from_syncframe(&frame).unwrap();
        assert_eq!(params.fscod, 0);
        assert_eq!(params.frmsizecod, 8);
        assert_eq!(params.bsid, 8);
        assert_eq!(params.acmod, 2);
        assert_eq!(params.lfeon, 0);
        assert_eq!(params.frame_size(), 256);
    }

    #[test]
    fn dac3_blob() {
        let frame = test_syncframe();
        let params = Ac3Params::from_syncframe(&frame).unwrap();
        let dac3 = create_ac3_specific_info(&params);
        assert_eq!(
            &dac3,
            &[0x00, 0x00, 0x00, 0x0b, b'd', b'a', b'c', b'3', 0x10, 0x10, 0x80]
        );
        let back = parse_ac3_specific_info(&dac3).unwrap();
        assert_eq!(back.fscod, params.fscod);
        assert_eq!(back.bsid, params.bsid);
        assert_eq!(back.acmod, params.acmod);
        assert_eq!(back.frmsizecod >> 1, params.frmsizecod >> 1);
    }

    #[test]
    fn frame_size_441_parity() {
        let p = Ac3Params {
            fscod: 1,
            frmsizecod: 9,
            bsid: 8,
            ..Default::default()
        };
        // 44.1 kHz with an odd frame size code pads by one word.
        assert_eq!(p.frame_size(), 278 + 2);
    }

    #[test]
    fn reject_eac3_bsid() {
        let mut frame = test_syncframe();
        frame[5] = 0x80; // bsid 16
        assert!(Ac3Params::from_syncframe(&frame).is_err());
    }

    #[test]
    fn chan_loc_mapping() {
        assert_eq!(chan_loc_from_chanmap(0x0002), 0x0001);
        assert_eq!(chan_loc_from_chanmap(0x07f8), 0x01fe);
        assert_eq!(chan_loc_from_chanmap(0x07fa), 0x01ff);
    }

    #[test]
    fn dec3_roundtrip() {
        let mut param = Eac3Params::default();
        param.data_rate = 640;
        param.num_ind_sub = 1;
        param.independent_info[0] = Eac3SubstreamInfo {
            fscod: 0,
            bsid: 16,
            acmod: 7,
            lfeon: 1,
            num_dep_sub: 1,
            chan_loc: 0x80,
            ..Default::default()
        };
        param.independent_info[1] = Eac3SubstreamInfo {
            fscod: 0,
            bsid: 16,
            acmod: 2,
            ..Default::default()
        };
        let dec3 = create_eac3_specific_info(&param).unwrap();
        assert_eq!(&dec3[4..8], b"dec3");
        assert_eq!(u32::from_be_bytes([dec3[0], dec3[1], dec3[2], dec3[3]]) as usize, dec3.len());
        let back = parse_eac3_specific_info(&dec3).unwrap();
        assert_eq!(back, param);
    }
}

//! MPEG-4 Systems descriptors.
//!
//! The descriptor tree serialized into an `esds` box:
//! `ES_Descriptor { DecoderConfigDescriptor { DecoderSpecificInfo? },
//! SLConfigDescriptor }`. Each descriptor carries a `(tag, size)` header
//! where `size` excludes the tag and length bytes themselves. Sizes are
//! written in the fixed 4-byte 28-bit continuation form (some shipping
//! demuxers choke on the minimal form); both forms are accepted on read.
use std::io;

use crate::bs::Bs;

/// Class tags for descriptors.
pub const TAG_OBJECT_DESCR: u8 = 0x01;
pub const TAG_INITIAL_OBJECT_DESCR: u8 = 0x02;
pub const TAG_ES_DESCR: u8 = 0x03;
pub const TAG_DECODER_CONFIG_DESCR: u8 = 0x04;
pub const TAG_DEC_SPECIFIC_INFO: u8 = 0x05;
pub const TAG_SL_CONFIG_DESCR: u8 = 0x06;
pub const TAG_ES_ID_INC: u8 = 0x0e;
pub const TAG_MP4_IOD: u8 = 0x10;
pub const TAG_MP4_OD: u8 = 0x11;

/// objectTypeIndication values used by the importers.
pub const OTI_AUDIO_ISO_14496_3: u8 = 0x40; /* MPEG-4 Audio */
pub const OTI_AUDIO_ISO_13818_3: u8 = 0x69; /* MPEG-2 BC Audio */
pub const OTI_AUDIO_ISO_11172_3: u8 = 0x6b; /* MPEG-1 Audio */
pub const OTI_NONE: u8 = 0xff;

/// streamType values.
pub const STREAM_TYPE_AUDIO: u8 = 0x05;
pub const STREAM_TYPE_VISUAL: u8 = 0x04;

// Tag + 4-byte 28-bit length coding.
fn descriptor_size(payload_size: u32) -> u32 {
    payload_size + 4 + 1
}

fn put_descriptor_header(bs: &mut Bs, tag: u8, size: u32) {
    bs.put_byte(tag);
    // 28 bits split over four bytes, MSB flags continuation.
    bs.put_byte(((size >> 21) as u8) | 0x80);
    bs.put_byte(((size >> 14) as u8) | 0x80);
    bs.put_byte(((size >> 7) as u8) | 0x80);
    bs.put_byte((size & 0x7f) as u8);
}

fn get_descriptor_header(bs: &mut Bs) -> (u8, u32) {
    let tag = bs.get_byte();
    let mut size: u32 = 0;
    loop {
        let b = bs.get_byte();
        size = (size << 7) | (b & 0x7f) as u32;
        if b & 0x80 == 0 || bs.error() {
            break;
        }
    }
    (tag, size)
}

/// DecoderSpecificInfo; contents vary with objectTypeIndication.
#[derive(Clone, Debug, Default)]
pub struct DecoderSpecificInfo {
    pub data: Vec<u8>,
}

impl DecoderSpecificInfo {
    fn update_size(&self) -> u32 {
        descriptor_size(self.data.len() as u32)
    }

    fn put(&self, bs: &mut Bs) {
        put_descriptor_header(bs, TAG_DEC_SPECIFIC_INFO, self.data.len() as u32);
        bs.put_bytes(&self.data);
    }

    fn get(bs: &mut Bs, size: u32) -> DecoderSpecificInfo {
        DecoderSpecificInfo {
            data: bs.get_bytes(size as usize),
        }
    }
}

/// DecoderConfigDescriptor.
#[derive(Clone, Debug, Default)]
pub struct DecoderConfigDescriptor {
    pub object_type_indication: u8,
    pub stream_type:            u8,
    /// CPB size in bytes, not bits.
    pub buffer_size_db:         u32,
    pub max_bitrate:            u32,
    /// 0 if variable bitrate.
    pub avg_bitrate:            u32,
    pub dec_specific_info:      Option<Box<DecoderSpecificInfo>>,
}

impl DecoderConfigDescriptor {
    fn payload_size(&self) -> u32 {
        13 + self.dec_specific_info.as_ref().map_or(0, |dsi| dsi.update_size())
    }

    fn put(&self, bs: &mut Bs) {
        put_descriptor_header(bs, TAG_DECODER_CONFIG_DESCR, self.payload_size());
        bs.put_byte(self.object_type_indication);
        // streamType (6), upStream (1), reserved (1) = 1
        bs.put_byte((self.stream_type << 2) | 0x01);
        bs.put_be24(self.buffer_size_db);
        bs.put_be32(self.max_bitrate);
        bs.put_be32(self.avg_bitrate);
        if let Some(dsi) = self.dec_specific_info.as_ref() {
            dsi.put(bs);
        }
    }

    fn get(bs: &mut Bs, size: u32) -> DecoderConfigDescriptor {
        let mut dcd = DecoderConfigDescriptor::default();
        dcd.object_type_indication = bs.get_byte();
        dcd.stream_type = bs.get_byte() >> 2;
        dcd.buffer_size_db = bs.get_be24();
        dcd.max_bitrate = bs.get_be32();
        dcd.avg_bitrate = bs.get_be32();
        if size > 13 {
            let (tag, dsi_size) = get_descriptor_header(bs);
            if tag == TAG_DEC_SPECIFIC_INFO {
                dcd.dec_specific_info = Some(Box::new(DecoderSpecificInfo::get(bs, dsi_size)));
            } else {
                bs.skip_bytes(dsi_size as usize);
            }
        }
        dcd
    }
}

/// SLConfigDescriptor.
///
/// MP4 files that do not use URL referencing carry the constant
/// predefined value 0x02; the custom form is still parsed.
#[derive(Clone, Debug, Default)]
pub struct SlConfigDescriptor {
    pub predefined:             u8,
    pub use_timestamps_flag:    bool,
    pub timestamp_resolution:   u32,
    pub ocr_resolution:         u32,
    pub timestamp_length:       u8,
    pub ocr_length:             u8,
    pub au_length:              u8,
    pub instant_bitrate_length: u8,
    pub duration_flag:          bool,
    pub timescale:              u32,
    pub access_unit_duration:   u16,
    pub composition_duration:   u16,
    pub start_dts:              u64,
    pub start_cts:              u64,
    custom_flags:               u8,
    custom_lengths:             u16,
}

impl SlConfigDescriptor {
    pub fn mp4_predefined() -> SlConfigDescriptor {
        SlConfigDescriptor {
            predefined: 0x02,
            use_timestamps_flag: true,
            ..SlConfigDescriptor::default()
        }
    }

    fn payload_size(&self) -> u32 {
        let mut size = 1;
        if self.predefined == 0x00 {
            size += 15;
        }
        if self.duration_flag {
            size += 8;
        }
        if !self.use_timestamps_flag {
            size += (2 * self.timestamp_length as u32 + 7) / 8;
        }
        size
    }

    fn put(&self, bs: &mut Bs) {
        put_descriptor_header(bs, TAG_SL_CONFIG_DESCR, self.payload_size());
        bs.put_byte(self.predefined);
        if self.predefined == 0x00 {
            bs.put_byte(self.custom_flags);
            bs.put_be32(self.timestamp_resolution);
            bs.put_be32(self.ocr_resolution);
            bs.put_byte(self.timestamp_length);
            bs.put_byte(self.ocr_length);
            bs.put_byte(self.au_length);
            bs.put_byte(self.instant_bitrate_length);
            bs.put_be16(self.custom_lengths);
        }
        if self.duration_flag {
            bs.put_be32(self.timescale);
            bs.put_be16(self.access_unit_duration);
            bs.put_be16(self.composition_duration);
        }
        if !self.use_timestamps_flag {
            let mut bits = crate::bits::Bits::new(Bs::new());
            bits.put(self.timestamp_length as u32, self.start_dts);
            bits.put(self.timestamp_length as u32, self.start_cts);
            if let Some(data) = bits.export_data() {
                bs.put_bytes(&data);
            }
        }
    }

    fn get(bs: &mut Bs) -> SlConfigDescriptor {
        let mut slcd = SlConfigDescriptor::default();
        slcd.predefined = bs.get_byte();
        match slcd.predefined {
            0x00 => {
                slcd.custom_flags = bs.get_byte();
                slcd.use_timestamps_flag = (slcd.custom_flags >> 2) & 0x01 != 0;
                slcd.duration_flag = slcd.custom_flags & 0x01 != 0;
                slcd.timestamp_resolution = bs.get_be32();
                slcd.ocr_resolution = bs.get_be32();
                slcd.timestamp_length = bs.get_byte();
                slcd.ocr_length = bs.get_byte();
                slcd.au_length = bs.get_byte();
                slcd.instant_bitrate_length = bs.get_byte();
                slcd.custom_lengths = bs.get_be16();
            },
            0x01 => {
                slcd.timestamp_resolution = 1000;
                slcd.timestamp_length = 32;
            },
            _ => slcd.use_timestamps_flag = true,
        }
        if slcd.duration_flag {
            slcd.timescale = bs.get_be32();
            slcd.access_unit_duration = bs.get_be16();
            slcd.composition_duration = bs.get_be16();
        }
        if !slcd.use_timestamps_flag {
            let data = bs.get_bytes(((2 * slcd.timestamp_length as usize) + 7) / 8);
            let mut bits = crate::bits::Bits::new(Bs::new());
            let _ = bits.import_data(&data);
            slcd.start_dts = bits.get(slcd.timestamp_length as u32);
            slcd.start_cts = bits.get(slcd.timestamp_length as u32);
        }
        slcd
    }
}

/// ES_Descriptor.
///
/// Within a sample description the ES_ID is stored as 0; the track ID
/// identifies the stream instead.
#[derive(Clone, Debug, Default)]
pub struct EsDescriptor {
    pub es_id:           u16,
    pub dec_config:      Option<Box<DecoderConfigDescriptor>>,
    pub sl_config:       Option<Box<SlConfigDescriptor>>,
    pub depends_on_es_id: Option<u16>,
    pub ocr_es_id:       Option<u16>,
}

impl EsDescriptor {
    pub fn new(es_id: u16) -> EsDescriptor {
        EsDescriptor {
            es_id,
            ..EsDescriptor::default()
        }
    }

    fn payload_size(&self) -> u32 {
        let mut size = 3;
        if self.depends_on_es_id.is_some() {
            size += 2;
        }
        if self.ocr_es_id.is_some() {
            size += 2;
        }
        size += self.dec_config.as_ref().map_or(0, |d| descriptor_size(d.payload_size()));
        size += self.sl_config.as_ref().map_or(0, |d| descriptor_size(d.payload_size()));
        size
    }

    /// Total serialized size, header included.
    pub fn update_size(&self) -> u32 {
        descriptor_size(self.payload_size())
    }

    pub fn put(&self, bs: &mut Bs) -> io::Result<()> {
        let dcd = self
            .dec_config
            .as_ref()
            .ok_or_else(|| ioerr!(InvalidInput, "ES_Descriptor without DecoderConfigDescriptor"))?;
        put_descriptor_header(bs, TAG_ES_DESCR, self.payload_size());
        bs.put_be16(self.es_id);
        let mut flags = 0u8;
        if self.depends_on_es_id.is_some() {
            flags |= 0x80;
        }
        if self.ocr_es_id.is_some() {
            flags |= 0x20;
        }
        bs.put_byte(flags);
        if let Some(id) = self.depends_on_es_id {
            bs.put_be16(id);
        }
        if let Some(id) = self.ocr_es_id {
            bs.put_be16(id);
        }
        dcd.put(bs);
        if let Some(slcd) = self.sl_config.as_ref() {
            slcd.put(bs);
        }
        bs.status()
    }

    pub fn get(bs: &mut Bs) -> io::Result<EsDescriptor> {
        let (tag, _size) = get_descriptor_header(bs);
        if tag != TAG_ES_DESCR {
            return Err(ioerr!(InvalidData, "not an ES_Descriptor (tag {:#04x})", tag));
        }
        let mut esd = EsDescriptor::default();
        esd.es_id = bs.get_be16();
        let flags = bs.get_byte();
        if flags & 0x80 != 0 {
            esd.depends_on_es_id = Some(bs.get_be16());
        }
        if flags & 0x40 != 0 {
            // URL_Flag; skip URLstring.
            let len = bs.get_byte();
            bs.skip_bytes(len as usize);
        }
        if flags & 0x20 != 0 {
            esd.ocr_es_id = Some(bs.get_be16());
        }
        let (tag, size) = get_descriptor_header(bs);
        if tag != TAG_DECODER_CONFIG_DESCR {
            return Err(ioerr!(InvalidData, "DecoderConfigDescriptor missing"));
        }
        esd.dec_config = Some(Box::new(DecoderConfigDescriptor::get(bs, size)));
        let (tag, _size) = get_descriptor_header(bs);
        if tag == TAG_SL_CONFIG_DESCR {
            esd.sl_config = Some(Box::new(SlConfigDescriptor::get(bs)));
        }
        bs.status()?;
        Ok(esd)
    }
}

/// ObjectDescriptor (MP4_OD / MP4_IOD form) holding ES_ID_Inc entries.
#[derive(Clone, Debug, Default)]
pub struct ObjectDescriptor {
    pub object_descriptor_id: u16,
    pub initial:              bool,
    pub es_id_incs:           Vec<u32>,
}

impl ObjectDescriptor {
    pub fn new(object_descriptor_id: u16) -> ObjectDescriptor {
        ObjectDescriptor {
            object_descriptor_id,
            initial: false,
            es_id_incs: Vec::new(),
        }
    }

    pub fn add_es_id_inc(&mut self, track_id: u32) {
        self.es_id_incs.push(track_id);
    }

    fn payload_size(&self) -> u32 {
        let mut size = if self.initial { 7 } else { 2 };
        size += self.es_id_incs.len() as u32 * descriptor_size(4);
        size
    }

    pub fn put(&self, bs: &mut Bs) -> io::Result<()> {
        let tag = if self.initial { TAG_MP4_IOD } else { TAG_MP4_OD };
        put_descriptor_header(bs, tag, self.payload_size());
        // ObjectDescriptorID (10), URL_Flag (1) = 0,
        // includeInlineProfileLevelFlag (1), reserved (4) = 0b1111
        let head = (self.object_descriptor_id << 6) | 0x10 | 0x0f;
        bs.put_be16(head);
        if self.initial {
            // No required profile-level indications.
            for _ in 0..5 {
                bs.put_byte(0xff);
            }
        }
        for &track_id in &self.es_id_incs {
            put_descriptor_header(bs, TAG_ES_ID_INC, 4);
            bs.put_be32(track_id);
        }
        bs.status()
    }
}

/// Parameters an importer feeds into an `esds` payload.
#[derive(Clone, Debug, Default)]
pub struct Mp4sysDecoderParameters {
    pub object_type_indication: u8,
    pub stream_type:            u8,
    pub buffer_size_db:         u32,
    pub max_bitrate:            u32,
    pub avg_bitrate:            u32,
    pub dsi_payload:            Option<Vec<u8>>,
}

/// Serialize a complete `esds` box from decoder parameters.
pub fn create_mp4sys_decoder_config(param: &Mp4sysDecoderParameters) -> io::Result<Vec<u8>> {
    let mut esd = EsDescriptor::new(0);
    esd.sl_config = Some(Box::new(SlConfigDescriptor::mp4_predefined()));
    let mut dcd = DecoderConfigDescriptor::default();
    dcd.object_type_indication = param.object_type_indication;
    dcd.stream_type = param.stream_type;
    dcd.buffer_size_db = param.buffer_size_db;
    dcd.max_bitrate = param.max_bitrate;
    dcd.avg_bitrate = param.avg_bitrate;
    if let Some(dsi) = param.dsi_payload.as_ref() {
        if !dsi.is_empty() {
            dcd.dec_specific_info = Some(Box::new(DecoderSpecificInfo { data: dsi.clone() }));
        }
    }
    esd.dec_config = Some(Box::new(dcd));
    let mut bs = Bs::new();
    bs.put_be32(12 + esd.update_size());
    bs.put_bytes(b"esds");
    bs.put_be32(0); // version and flags
    esd.put(&mut bs)?;
    bs.status()?;
    bs.export_data()
        .ok_or_else(|| ioerr!(Other, "empty esds payload"))
}

/// Recover decoder parameters from a serialized `esds` box.
pub fn parse_mp4sys_decoder_config(data: &[u8]) -> io::Result<Mp4sysDecoderParameters> {
    if data.len() < 12 + 23 {
        return Err(ioerr!(InvalidData, "esds box too short"));
    }
    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if size != data.len() || &data[4..8] != b"esds" {
        return Err(ioerr!(InvalidData, "not an esds box"));
    }
    let mut bs = Bs::new();
    bs.import_data(&data[12..])?; // skip size, type, version and flags
    let esd = EsDescriptor::get(&mut bs)?;
    let dcd = esd
        .dec_config
        .ok_or_else(|| ioerr!(InvalidData, "DecoderConfigDescriptor missing"))?;
    Ok(Mp4sysDecoderParameters {
        object_type_indication: dcd.object_type_indication,
        stream_type:            dcd.stream_type,
        buffer_size_db:         dcd.buffer_size_db,
        max_bitrate:            dcd.max_bitrate,
        avg_bitrate:            dcd.avg_bitrate,
        dsi_payload:            dcd.dec_specific_info.map(|dsi| dsi.data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esds_roundtrip() {
        let param = Mp4sysDecoderParameters {
            object_type_indication: OTI_AUDIO_ISO_14496_3,
            stream_type:            STREAM_TYPE_AUDIO,
            buffer_size_db:         6144,
            max_bitrate:            128000,
            avg_bitrate:            128000,
            dsi_payload:            Some(vec![0x12, 0x10]),
        };
        let esds = create_mp4sys_decoder_config(&param).unwrap();
        assert_eq!(&esds[4..8], b"esds");
        assert_eq!(u32::from_be_bytes([esds[0], esds[1], esds[2], esds[3]]) as usize, esds.len());
        let back = parse_mp4sys_decoder_config(&esds).unwrap();
        assert_eq!(back.object_type_indication, OTI_AUDIO_ISO_14496_3);
        assert_eq!(back.stream_type, STREAM_TYPE_AUDIO);
        assert_eq!(back.buffer_size_db, 6144);
        assert_eq!(back.dsi_payload.as_deref(), Some(&[0x12, 0x10][..]));
    }

    #[test]
    fn descriptor_sizes_are_consistent() {
        // Each header is 5 bytes (28-bit length coding).
        let param = Mp4sysDecoderParameters {
            object_type_indication: OTI_AUDIO_ISO_11172_3,
            stream_type:            STREAM_TYPE_AUDIO,
            ..Mp4sysDecoderParameters::default()
        };
        let esds = create_mp4sys_decoder_config(&param).unwrap();
        // size(4) + 'esds'(4) + verflags(4)
        //  + ES hdr(5) + ES_ID(2)+flags(1)
        //  + DCD hdr(5) + 13
        //  + SL hdr(5) + 1
        assert_eq!(esds.len(), 12 + 5 + 3 + 5 + 13 + 5 + 1);
    }

    #[test]
    fn minimal_length_form_is_accepted() {
        // Hand-written esds with 1-byte length fields.
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0x03, 3 + 2 + 13 + 2 + 1]); // ES_Descriptor
        payload.extend_from_slice(&[0x00, 0x00, 0x00]); // ES_ID, flags
        payload.extend_from_slice(&[0x04, 13]); // DecoderConfigDescriptor
        payload.extend_from_slice(&[0x6b, 0x15, 0x00, 0x00, 0x00]);
        payload.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        payload.extend_from_slice(&[0x06, 0x01, 0x02]); // SLConfigDescriptor
        let mut esds = Vec::new();
        esds.extend_from_slice(&(12 + payload.len() as u32).to_be_bytes());
        esds.extend_from_slice(b"esds");
        esds.extend_from_slice(&[0, 0, 0, 0]);
        esds.extend_from_slice(&payload);
        let back = parse_mp4sys_decoder_config(&esds).unwrap();
        assert_eq!(back.object_type_indication, OTI_AUDIO_ISO_11172_3);
        assert_eq!(back.stream_type, STREAM_TYPE_AUDIO);
        assert!(back.dsi_payload.is_none());
    }
}

//! MPEG-4 Audio common pieces: object types and AudioSpecificConfig.
use std::io;

use crate::bits::Bits;
use crate::bs::Bs;

/// Audio object types this crate emits.
pub const AOT_AAC_MAIN: u8 = 1;
pub const AOT_AAC_LC: u8 = 2;
pub const AOT_AAC_SSR: u8 = 3;
pub const AOT_AAC_LTP: u8 = 4;
pub const AOT_LAYER_1: u8 = 32;
pub const AOT_LAYER_2: u8 = 33;
pub const AOT_LAYER_3: u8 = 34;
pub const AOT_ALS: u8 = 36;

// samplingFrequencyIndex 0x0 .. 0xc.
const SAMPLING_FREQUENCY_TABLE: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// The frequency a samplingFrequencyIndex stands for; 0 when reserved.
pub fn frequency_of_index(index: u8) -> u32 {
    SAMPLING_FREQUENCY_TABLE
        .get(index as usize)
        .copied()
        .unwrap_or(0)
}

fn sampling_frequency_index(frequency: u32) -> Option<u8> {
    SAMPLING_FREQUENCY_TABLE
        .iter()
        .position(|&f| f == frequency)
        .map(|i| i as u8)
}

fn channel_configuration(channels: u32) -> u8 {
    match channels {
        1..=6 => channels as u8,
        8 => 7,
        _ => 0,
    }
}

/// Serialize an AudioSpecificConfig.
///
/// For AAC object types a bare GASpecificConfig is appended; for ALS the
/// caller passes the serialized ALSSpecificConfig as `specific`.
pub fn export_audio_specific_config(
    aot: u8,
    frequency: u32,
    channels: u32,
    specific: Option<&[u8]>,
) -> io::Result<Vec<u8>> {
    let mut bits = Bits::new(Bs::new());
    if aot < 31 {
        bits.put(5, aot as u64);
    } else {
        bits.put(5, 31);
        bits.put(6, (aot - 32) as u64);
    }
    match sampling_frequency_index(frequency) {
        Some(index) => bits.put(4, index as u64),
        None => {
            bits.put(4, 0xf);
            bits.put(24, frequency as u64);
        },
    }
    match aot {
        AOT_AAC_MAIN | AOT_AAC_LC | AOT_AAC_SSR | AOT_AAC_LTP => {
            bits.put(4, channel_configuration(channels) as u64);
            // GASpecificConfig: frameLengthFlag, dependsOnCoreCoder,
            // extensionFlag.
            bits.put(1, 0);
            bits.put(1, 0);
            bits.put(1, 0);
        },
        AOT_ALS => {
            bits.put(4, 0);
            bits.put(5, 0); // fillBits; the config below is byte-aligned
            if let Some(alssc) = specific {
                bits.put_align();
                bits.bs.put_bytes(alssc);
            }
        },
        _ => return Err(ioerr!(InvalidInput, "unsupported audio object type {}", aot)),
    }
    bits.bs.status()?;
    bits.export_data()
        .ok_or_else(|| ioerr!(Other, "empty AudioSpecificConfig"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aac_lc_asc() {
        // AAC-LC, 48 kHz (index 3), 2 channels: 00010 0011 0010 000 -> 0x11 0x90
        let asc = export_audio_specific_config(AOT_AAC_LC, 48000, 2, None).unwrap();
        assert_eq!(&asc, &[0x11, 0x90]);
    }

    #[test]
    fn aac_lc_asc_44100_mono() {
        // 00010 0100 0001 000 -> 0x12 0x08
        let asc = export_audio_specific_config(AOT_AAC_LC, 44100, 1, None).unwrap();
        assert_eq!(&asc, &[0x12, 0x08]);
    }

    #[test]
    fn escaped_frequency() {
        let asc = export_audio_specific_config(AOT_AAC_LC, 12345, 2, None).unwrap();
        // 5 + 4 + 24 + 4 + 3 bits = 40 bits
        assert_eq!(asc.len(), 5);
        assert_eq!(asc[0] >> 3, AOT_AAC_LC);
        assert_eq!(asc[0] & 0x7, 0x7); // first 3 bits of 0xf
    }

    #[test]
    fn als_asc_appends_config() {
        let alssc = [0x41, 0x4c, 0x53, 0x00, 1, 2, 3];
        let asc = export_audio_specific_config(AOT_ALS, 192000, 2, Some(&alssc)).unwrap();
        // aot escape(11) + escaped frequency(28) + chan(4) + fill(5) = 48 bits
        assert_eq!(asc.len(), 6 + alssc.len());
        assert_eq!(&asc[6..], &alssc);
        assert_eq!(asc[0] >> 3, 31);
    }
}

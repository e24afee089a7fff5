//! Helpers shared by the NAL-unit based codecs (H.264, HEVC).
//!
//! Start-code scanning, EBSP-to-RBSP conversion, decoder-configuration
//! parameter-set lists, and the probe-pass machinery that turns picture
//! order counts into CTS/DTS pairs.
use std::io;

use crate::bits::Bits;
use crate::bs::Bs;

pub const SHORT_START_CODE_LENGTH: usize = 3;
pub const LONG_START_CODE_LENGTH: usize = 4;

/// Does a short start code (0x000001) begin at `pos` of the window?
#[inline]
pub fn check_next_short_start_code(window: &[u8]) -> bool {
    window.len() >= SHORT_START_CODE_LENGTH
        && window[0] == 0x00
        && window[1] == 0x00
        && window[2] == 0x01
}

/// Does a long start code (0x00000001) begin the window?
#[inline]
pub fn check_next_long_start_code(window: &[u8]) -> bool {
    window.len() >= LONG_START_CODE_LENGTH
        && window[0] == 0x00
        && window[1] == 0x00
        && window[2] == 0x00
        && window[3] == 0x01
}

/// Strip emulation-prevention bytes from an EBSP and load the result
/// into a fresh bit reader, reusing `rbsp` as scratch.
pub fn import_rbsp_from_ebsp(rbsp: &mut Vec<u8>, ebsp: &[u8]) -> io::Result<Bits> {
    rbsp.clear();
    rbsp.reserve(ebsp.len());
    for &byte in ebsp {
        if byte == 0x03 && rbsp.len() >= 2 && rbsp[rbsp.len() - 1] == 0x00 && rbsp[rbsp.len() - 2] == 0x00
        {
            // emulation_prevention_three_byte
            continue;
        }
        rbsp.push(byte);
    }
    let mut bits = Bits::new(Bs::new());
    bits.import_data(rbsp)?;
    Ok(bits)
}

/// One parameter set of a decoder configuration record.
#[derive(Clone, Debug)]
pub struct DcrPsEntry {
    pub nal_unit: Vec<u8>,
    pub unused:   bool,
}

impl DcrPsEntry {
    pub fn new(nal_unit: &[u8]) -> DcrPsEntry {
        DcrPsEntry {
            nal_unit: nal_unit.to_vec(),
            unused:   false,
        }
    }
}

/// Is a byte-identical parameter set already in the list?
pub fn same_ps_exists(ps_list: &[DcrPsEntry], ps_data: &[u8]) -> bool {
    ps_list
        .iter()
        .any(|ps| !ps.unused && ps.nal_unit == ps_data)
}

/// Number of parameter sets in use.
pub fn ps_count(ps_list: &[DcrPsEntry]) -> usize {
    ps_list.iter().filter(|ps| !ps.unused).count()
}

/// Picture timing collected per access unit during the probe pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct NalPicTiming {
    pub poc:       i64,
    pub delta:     u32,
    pub poc_delta: u16,
    pub reset:     bool,
}

/// One decoding/composition timestamp pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MediaTs {
    pub dts: u64,
    pub cts: u64,
}

/// Fold per-sequence POCs into one monotonic composition order.
///
/// POC restarts at every coded video sequence; a running offset maps each
/// sequence after the previous one's maximum. Pictures with negative POC
/// too far past a reset ("invalid negative POC") are shifted forward into
/// the next sequence.
pub fn deduplicate_poc(
    npt: &mut [NalPicTiming],
    max_composition_delay: &mut u32,
    num_access_units: usize,
    max_num_reorder_pics: u32,
) {
    let mut poc_offset: i64 = 0;
    let mut poc_min: i64 = 0;
    let mut invalid_poc_min: i64 = 0;
    let mut last_poc_reset: usize = usize::MAX;
    let mut invalid_poc_start: usize = 0;
    let mut invalid_poc_present = false;
    let mut i = 0;
    loop {
        if i < num_access_units && npt[i].poc != 0 && !npt[i].reset {
            // The offset is added when we reach the next sequence.
            if npt[i].poc < 0 {
                // Pictures with negative POC precede the IDR picture in
                // composition order.
                if last_poc_reset == usize::MAX
                    || i > last_poc_reset + max_num_reorder_pics as usize
                {
                    if !invalid_poc_present {
                        invalid_poc_present = true;
                        invalid_poc_start = i;
                    }
                    if invalid_poc_min > npt[i].poc {
                        invalid_poc_min = npt[i].poc;
                    }
                } else if poc_min > npt[i].poc {
                    poc_min = npt[i].poc;
                    *max_composition_delay =
                        (*max_composition_delay).max((i - last_poc_reset) as u32);
                }
            }
            i += 1;
            continue;
        }
        // Encountered a new coded video sequence or ran out of POCs.
        poc_offset -= poc_min;
        let mut poc_max: i64 = 0;
        let seq_start = if last_poc_reset == usize::MAX { 0 } else { last_poc_reset };
        let seq_end = i + (i < num_access_units && npt[i].reset) as usize;
        if last_poc_reset != usize::MAX {
            for j in seq_start..seq_end {
                if npt[j].poc >= 0 || j <= seq_start + max_num_reorder_pics as usize {
                    npt[j].poc += poc_offset;
                    if poc_max < npt[j].poc {
                        poc_max = npt[j].poc;
                    }
                }
            }
        }
        poc_offset = poc_max + 1;
        if invalid_poc_present {
            // Such pictures sit between the current sequence and the next.
            poc_offset -= invalid_poc_min;
            for j in invalid_poc_start..seq_end {
                if npt[j].poc < 0 {
                    npt[j].poc += poc_offset;
                    if poc_max < npt[j].poc {
                        poc_max = npt[j].poc;
                    }
                }
            }
            invalid_poc_present = false;
            invalid_poc_start = 0;
            invalid_poc_min = 0;
            poc_offset = poc_max + 1;
        }
        if i < num_access_units {
            if npt[i].reset {
                npt[i].poc = 0;
            }
            poc_min = 0;
            last_poc_reset = i;
        } else {
            break;
        }
        i += 1;
    }
}

/// Produce CTS/DTS pairs from deduplicated POCs.
pub fn generate_timestamps_from_poc(
    timestamp: &mut Vec<MediaTs>,
    npt: &[NalPicTiming],
    composition_reordering_present: &mut bool,
    last_delta: &mut u32,
    mut max_composition_delay: u32,
    num_access_units: usize,
) {
    timestamp.clear();
    timestamp.resize(num_access_units, MediaTs::default());
    if num_access_units == 0 {
        return;
    }
    // Composition delay can also come purely from reordered POCs.
    if max_composition_delay == 0 {
        for i in 1..num_access_units {
            if npt[i].poc < npt[i - 1].poc {
                *composition_reordering_present = true;
                break;
            }
        }
    } else {
        *composition_reordering_present = true;
    }
    if *composition_reordering_present {
        // Temporary values: cts is the POC, dts the decoding order.
        for i in 0..num_access_units {
            timestamp[i].cts = npt[i].poc as u64;
            timestamp[i].dts = i as u64;
        }
        timestamp.sort_by_key(|ts| ts.cts);
        for i in 1..num_access_units {
            if timestamp[i].cts > timestamp[i - 1].cts + npt[i - 1].poc_delta as u64 {
                log::warn!(
                    "POC gap at picture {}; maybe some pictures are lost",
                    timestamp[i].dts
                );
            }
        }
        // The real composition delay derived from the reordering.
        for (i, ts) in timestamp.iter().enumerate() {
            if (i as u64) < ts.dts {
                max_composition_delay = max_composition_delay.max((ts.dts - i as u64) as u32);
            }
        }
        *last_delta = npt[num_access_units - 1].delta;
        // Generate CTSs.
        timestamp[0].cts = 0;
        for i in 1..num_access_units {
            timestamp[i].cts = timestamp[i - 1].cts + npt[i - 1].delta as u64;
        }
        let composition_delay_time = timestamp[max_composition_delay as usize].cts;
        let mut reorder_cts = vec![0u64; num_access_units];
        for i in 0..num_access_units {
            timestamp[i].cts += composition_delay_time;
            reorder_cts[i] = timestamp[i].cts;
        }
        // Generate DTSs through a ring of prior reordered CTSs.
        timestamp.sort_by_key(|ts| ts.dts);
        let mut prev_reorder_cts = vec![0u64; max_composition_delay.max(1) as usize];
        for i in 0..num_access_units {
            timestamp[i].dts = if i <= max_composition_delay as usize {
                reorder_cts[i] - composition_delay_time
            } else {
                prev_reorder_cts[(i - max_composition_delay as usize)
                    % max_composition_delay as usize]
            };
            prev_reorder_cts[i % max_composition_delay.max(1) as usize] = reorder_cts[i];
        }
    } else {
        timestamp[0] = MediaTs { dts: 0, cts: 0 };
        for i in 1..num_access_units {
            let t = timestamp[i - 1].dts + npt[i - 1].delta as u64;
            timestamp[i] = MediaTs { dts: t, cts: t };
        }
        *last_delta = npt[num_access_units - 1].delta;
    }
}

/// Divide timestamps, the final delta and the timescale by their GCD.
pub fn reduce_timescale(
    timestamp: &mut [MediaTs],
    npt: &[NalPicTiming],
    last_delta: &mut u32,
    timescale: &mut u32,
    num_access_units: usize,
) {
    let mut gcd_delta = *timescale as u64;
    for i in 0..num_access_units {
        if gcd_delta <= 1 {
            break;
        }
        gcd_delta = gcd(gcd_delta, npt[i].delta as u64);
    }
    if gcd_delta > 1 {
        for ts in timestamp.iter_mut() {
            ts.dts /= gcd_delta;
            ts.cts /= gcd_delta;
        }
        *last_delta /= gcd_delta as u32;
        *timescale /= gcd_delta as u32;
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rbsp_unescape() {
        let ebsp = [0x00, 0x00, 0x03, 0x01, 0xab, 0x00, 0x00, 0x03, 0x03];
        let mut rbsp = Vec::new();
        let _bits = import_rbsp_from_ebsp(&mut rbsp, &ebsp).unwrap();
        assert_eq!(&rbsp, &[0x00, 0x00, 0x01, 0xab, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn start_code_checks() {
        assert!(check_next_short_start_code(&[0, 0, 1, 9]));
        assert!(!check_next_short_start_code(&[0, 0, 2]));
        assert!(!check_next_short_start_code(&[0, 0]));
        assert!(check_next_long_start_code(&[0, 0, 0, 1]));
        assert!(!check_next_long_start_code(&[0, 0, 1, 1]));
    }

    #[test]
    fn monotonic_stream_passes_through() {
        // IDR(0), P(1), P(2) with delta 1: no reordering.
        let mut npt = vec![
            NalPicTiming { poc: 0, delta: 1, poc_delta: 2, reset: false },
            NalPicTiming { poc: 1, delta: 1, poc_delta: 2, reset: false },
            NalPicTiming { poc: 2, delta: 1, poc_delta: 2, reset: false },
        ];
        let mut max_delay = 0;
        deduplicate_poc(&mut npt, &mut max_delay, 3, 32);
        let mut ts = Vec::new();
        let mut reordering = false;
        let mut last_delta = 0;
        generate_timestamps_from_poc(&mut ts, &npt, &mut reordering, &mut last_delta, max_delay, 3);
        assert!(!reordering);
        assert_eq!(ts, vec![
            MediaTs { dts: 0, cts: 0 },
            MediaTs { dts: 1, cts: 1 },
            MediaTs { dts: 2, cts: 2 },
        ]);
        assert_eq!(last_delta, 1);
    }

    #[test]
    fn reordered_stream_gets_composition_delay() {
        // Decoding order IDR(poc 0), P(4), B(2), B(6): one B reorder.
        let mut npt = vec![
            NalPicTiming { poc: 0, delta: 2, poc_delta: 2, reset: false },
            NalPicTiming { poc: 4, delta: 2, poc_delta: 2, reset: false },
            NalPicTiming { poc: 2, delta: 2, poc_delta: 2, reset: false },
            NalPicTiming { poc: 6, delta: 2, poc_delta: 2, reset: false },
        ];
        let mut max_delay = 0;
        deduplicate_poc(&mut npt, &mut max_delay, 4, 32);
        let mut ts = Vec::new();
        let mut reordering = false;
        let mut last_delta = 0;
        generate_timestamps_from_poc(&mut ts, &npt, &mut reordering, &mut last_delta, max_delay, 4);
        assert!(reordering);
        // In decoding order: CTS 0,2,1,3 scaled by delta 2, shifted by
        // the composition delay (one frame); DTS strictly increasing.
        assert_eq!(ts.iter().map(|t| t.cts).collect::<Vec<_>>(), vec![2, 6, 4, 8]);
        assert_eq!(ts.iter().map(|t| t.dts).collect::<Vec<_>>(), vec![0, 2, 4, 6]);
        for w in ts.windows(2) {
            assert!(w[1].dts > w[0].dts);
            assert!(w[0].cts >= w[0].dts);
        }
    }

    #[test]
    fn poc_reset_offsets_second_sequence() {
        // Two IDR-led sequences: 0,2,4 then 0,2.
        let mut npt = vec![
            NalPicTiming { poc: 0, delta: 1, poc_delta: 2, reset: false },
            NalPicTiming { poc: 2, delta: 1, poc_delta: 2, reset: false },
            NalPicTiming { poc: 4, delta: 1, poc_delta: 2, reset: false },
            NalPicTiming { poc: 0, delta: 1, poc_delta: 2, reset: false },
            NalPicTiming { poc: 2, delta: 1, poc_delta: 2, reset: false },
        ];
        let mut max_delay = 0;
        deduplicate_poc(&mut npt, &mut max_delay, 5, 32);
        // The second sequence maps past the first one's maximum.
        let pocs: Vec<i64> = npt.iter().map(|n| n.poc).collect();
        assert!(pocs[3] > pocs[2]);
        assert!(pocs[4] > pocs[3]);
        let mut seen = pocs.clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5, "no two pictures share a POC after dedup");
    }

    #[test]
    fn timescale_reduction() {
        let npt = vec![
            NalPicTiming { poc: 0, delta: 2, poc_delta: 2, reset: false },
            NalPicTiming { poc: 2, delta: 2, poc_delta: 2, reset: false },
        ];
        let mut ts = vec![MediaTs { dts: 0, cts: 0 }, MediaTs { dts: 2, cts: 2 }];
        let mut last_delta = 2;
        let mut timescale = 50;
        reduce_timescale(&mut ts, &npt, &mut last_delta, &mut timescale, 2);
        assert_eq!(timescale, 25);
        assert_eq!(last_delta, 1);
        assert_eq!(ts[1].dts, 1);
    }
}

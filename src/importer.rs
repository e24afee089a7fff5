//! Elementary-stream importer framework.
//!
//! [`Importer::open`] recognizes the format of a raw elementary stream by
//! trying the registered probes in a fixed order, builds the track summary,
//! and then hands out access units one at a time:
//!
//! ```no_run
//! use esimport::{Importer, ImportStatus, Sample};
//!
//! fn main() -> std::io::Result<()> {
//!     let mut importer = Importer::open("audio.ac3")?;
//!     let summary = importer.duplicate_summary(1).unwrap();
//!     let mut sample = Sample::with_capacity(summary.max_au_length());
//!     loop {
//!         match importer.get_access_unit(1, &mut sample)? {
//!             ImportStatus::Eof => break,
//!             _ => println!("AU: {} bytes, dts {}", sample.length, sample.dts),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
use std::fs;
use std::io;

use once_cell::sync::Lazy;

use crate::codec;
use crate::sample::Sample;
use crate::sbuf::{Sb, SbStream};
use crate::summary::Summary;

const DEFAULT_BUFFER_SIZE: usize = 1 << 16;

/// Result of one `get_access_unit` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportStatus {
    /// One access unit was delivered.
    Ok,
    /// One access unit was delivered and the sample description changed;
    /// the caller shall pick up the new summary.
    Change,
    /// End of stream; the sample length is zero.
    Eof,
}

/// One registered per-codec importer.
pub(crate) trait CodecImporter {
    /// Deliver the next access unit into `sample`.
    fn get_access_unit(
        &mut self,
        sb: &mut Sb,
        summary: &mut Summary,
        sample: &mut Sample,
    ) -> io::Result<ImportStatus>;

    /// Duration of the final access unit in the media timebase.
    /// Zero unless the stream has been fully delivered.
    fn last_delta(&self, summary: &Summary) -> u32;
}

pub(crate) type ProbeFn = fn(&mut Sb) -> io::Result<(Box<dyn CodecImporter>, Summary)>;

struct ProbeEntry {
    name:  &'static str,
    probe: ProbeFn,
}

// Probe order matters: the laxer sync patterns come after the strict ones.
static IMPORTERS: Lazy<Vec<ProbeEntry>> = Lazy::new(|| {
    vec![
        ProbeEntry { name: "adts", probe: codec::aac::probe },
        ProbeEntry { name: "mp3", probe: codec::mp3::probe },
        ProbeEntry { name: "amr", probe: codec::amr::probe },
        ProbeEntry { name: "ac3", probe: codec::ac3::probe_ac3 },
        ProbeEntry { name: "eac3", probe: codec::ac3::probe_eac3 },
        ProbeEntry { name: "als", probe: codec::als::probe },
        ProbeEntry { name: "dts", probe: codec::dts::probe },
        ProbeEntry { name: "h264", probe: codec::h264::probe },
        ProbeEntry { name: "hevc", probe: codec::hevc::probe },
        ProbeEntry { name: "vc1", probe: codec::vc1::probe },
    ]
});

/// An opened elementary-stream importer.
pub struct Importer {
    sb:        Sb,
    codec:     Box<dyn CodecImporter>,
    summaries: Vec<Summary>,
    format:    &'static str,
    failed:    bool,
}

impl Importer {
    /// Open `identifier` with format auto-detection.
    ///
    /// `"-"` selects standard input, which requires an explicit format;
    /// use [`Importer::open_with_format`] for it.
    pub fn open(identifier: &str) -> io::Result<Importer> {
        Importer::open_internal(identifier, None)
    }

    /// Open `identifier` as the named format ("adts", "mp3", "amr", "ac3",
    /// "eac3", "als", "dts", "h264", "hevc" or "vc1").
    pub fn open_with_format(identifier: &str, format: &str) -> io::Result<Importer> {
        Importer::open_internal(identifier, Some(format))
    }

    /// Import from an in-memory elementary stream.
    pub fn from_memory(data: Vec<u8>, format: Option<&str>) -> io::Result<Importer> {
        let sb = Sb::new(SbStream::Memory { data, consumed: 0 }, DEFAULT_BUFFER_SIZE);
        Importer::dispatch(sb, format)
    }

    fn open_internal(identifier: &str, format: Option<&str>) -> io::Result<Importer> {
        let stream = if identifier == "-" {
            if format.is_none() {
                return Err(ioerr!(InvalidInput, "standard input requires an explicit format"));
            }
            SbStream::Stdin(io::stdin())
        } else {
            SbStream::File(fs::File::open(identifier)?)
        };
        let sb = Sb::new(stream, DEFAULT_BUFFER_SIZE);
        Importer::dispatch(sb, format)
    }

    fn dispatch(mut sb: Sb, format: Option<&str>) -> io::Result<Importer> {
        match format {
            None => {
                for entry in IMPORTERS.iter() {
                    match (entry.probe)(&mut sb) {
                        Ok((codec, summary)) => {
                            log::debug!("importer: detected {}", entry.name);
                            return Ok(Importer {
                                sb,
                                codec,
                                summaries: vec![summary],
                                format: entry.name,
                                failed: false,
                            });
                        },
                        Err(e) => {
                            log::trace!("importer: {} probe failed: {}", entry.name, e);
                            sb.rewind()?;
                        },
                    }
                }
                Err(ioerr!(InvalidData, "no importer recognized the stream"))
            },
            Some(format) => {
                let entry = IMPORTERS
                    .iter()
                    .find(|e| e.name == format)
                    .ok_or_else(|| ioerr!(InvalidInput, "unknown format {:?}", format))?;
                let (codec, summary) = (entry.probe)(&mut sb)?;
                Ok(Importer {
                    sb,
                    codec,
                    summaries: vec![summary],
                    format: entry.name,
                    failed: false,
                })
            },
        }
    }

    /// Name of the detected format.
    pub fn format(&self) -> &'static str {
        self.format
    }

    /// Number of tracks this importer exposes; currently always 1.
    pub fn get_track_count(&self) -> u32 {
        self.summaries.len() as u32
    }

    /// Deliver one access unit of `track_number` (1-based) into `sample`.
    ///
    /// The sample buffer must hold at least `max_au_length` bytes of the
    /// active summary. An `Err` is sticky: the importer stays unusable,
    /// though it can still be dropped safely.
    pub fn get_access_unit(
        &mut self,
        track_number: u32,
        sample: &mut Sample,
    ) -> io::Result<ImportStatus> {
        if track_number < 1 || track_number as usize > self.summaries.len() {
            return Err(ioerr!(InvalidInput, "no such track: {}", track_number));
        }
        if self.failed {
            return Err(ioerr!(Other, "importer is in error state"));
        }
        let summary = &mut self.summaries[track_number as usize - 1];
        match self.codec.get_access_unit(&mut self.sb, summary, sample) {
            Ok(status) => Ok(status),
            Err(e) => {
                self.failed = true;
                Err(e)
            },
        }
    }

    /// Duration of the final access unit in the media timebase, or zero
    /// if the stream has not been fully delivered yet.
    pub fn get_last_delta(&self, track_number: u32) -> u32 {
        if track_number < 1 || track_number as usize > self.summaries.len() || self.failed {
            return 0;
        }
        self.codec.last_delta(&self.summaries[track_number as usize - 1])
    }

    /// Deep copy of the active summary of `track_number` (1-based).
    pub fn duplicate_summary(&self, track_number: u32) -> Option<Summary> {
        self.summaries.get(track_number as usize - 1).cloned()
    }
}

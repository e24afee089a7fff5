//! Import raw elementary audio/video bitstreams.
//!
//! This crate recognizes the format of an elementary stream, parses the
//! per-codec frame headers, derives per-sample timing, and hands out
//! access units together with the serialized codec configuration payloads
//! (`dac3`, `dec3`, `ddts`, `damr`, `esds`, `avcC`, `hvcC`, `dvc1`) an
//! ISO base-media container writer embeds.
//!
//! Supported formats: AAC-ADTS, MPEG-1/2 audio, AMR-NB/WB, AC-3,
//! Enhanced AC-3, MPEG-4 ALS, DTS (core and extension substreams),
//! H.264, HEVC and SMPTE VC-1 (advanced profile).
//!
//! ```no_run
//! use esimport::{Importer, ImportStatus, Sample};
//!
//! fn main() -> std::io::Result<()> {
//!     let mut importer = Importer::open("stream.264")?;
//!     let summary = importer.duplicate_summary(1).expect("one track");
//!     let mut sample = Sample::with_capacity(summary.max_au_length());
//!     loop {
//!         match importer.get_access_unit(1, &mut sample)? {
//!             ImportStatus::Eof => break,
//!             _ => println!("{} bytes, dts {}, cts {}", sample.length, sample.dts, sample.cts),
//!         }
//!     }
//!     println!("last delta: {}", importer.get_last_delta(1));
//!     Ok(())
//! }
//! ```
#[macro_use]
mod ioerr;
pub mod bits;
pub mod bs;
pub mod codec;
pub mod descriptor;
pub mod importer;
pub mod sample;
pub mod sbuf;
pub mod summary;

pub use crate::importer::{ImportStatus, Importer};
pub use crate::sample::{Sample, SampleProperty};
pub use crate::summary::{AudioSummary, Summary, VideoSummary};

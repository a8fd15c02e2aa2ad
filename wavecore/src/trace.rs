//! What the format parsers hand to the store.
//!
//! Both parsers work in two passes: the header pass builds the netlist so it
//! can be shown straight away, and the waveform pass decodes the bulk value
//! changes.

use anyhow::{Context, Result};
use log::info;
use typed_index_collections::TiVec;

use crate::{
    error::Diagnostic,
    fst::FstReader,
    netlist::{Netlist, SignalEncoding, SignalRef},
    options::{detect_format, FileFormat, LoadOptions},
    source::FileSource,
    store::{Metadata, TransitionSequence, WaveformStore},
    vcd,
};

/// A physical signal: the thing a transition sequence belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalDecl {
    pub signal_id: String,
    pub width: u32,
    pub encoding: SignalEncoding,
}

#[derive(Debug, Default)]
pub struct TraceHeader {
    pub netlist: Netlist,
    pub metadata: Metadata,
    pub signals: TiVec<SignalRef, SignalDecl>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Default)]
pub struct TraceWaves {
    /// One per entry in [`TraceHeader::signals`], each closed at `time_end`.
    pub sequences: TiVec<SignalRef, TransitionSequence>,
    pub time_end: u64,
    /// `(time, dumping)` markers found among the value changes.
    pub dump_activity: Vec<(u64, bool)>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Either parser, between its header and waveform passes.
pub enum TraceReader<'a> {
    Vcd {
        source: &'a mut dyn FileSource,
        options: LoadOptions,
    },
    Fst(FstReader<'a>),
}

impl<'a> TraceReader<'a> {
    /// Detect the format and run the header pass. Errors here are fatal to
    /// the load.
    pub fn open(
        source: &'a mut dyn FileSource,
        hint: Option<&std::path::Path>,
        options: &LoadOptions,
    ) -> Result<(Self, TraceHeader)> {
        let format = match options.format {
            Some(format) => format,
            None => detect_format(hint, &mut *source),
        };
        info!("Opening {:?} trace ({} bytes)", format, source.size());
        match format {
            FileFormat::Vcd => {
                let header =
                    vcd::parse_header(source, options).context("Reading VCD header")?;
                Ok((
                    TraceReader::Vcd {
                        source,
                        options: options.clone(),
                    },
                    header,
                ))
            }
            FileFormat::Fst => {
                let (reader, header) = FstReader::open(source).context("Reading FST file")?;
                Ok((TraceReader::Fst(reader), header))
            }
        }
    }

    /// Decode the value changes. Per-block and per-line problems end up in
    /// the diagnostics rather than failing the load.
    pub fn read_waves(&mut self, header: &TraceHeader) -> Result<TraceWaves> {
        match self {
            TraceReader::Vcd { source, options } => {
                vcd::parse_values(&mut **source, header, options).context("Reading VCD values")
            }
            TraceReader::Fst(reader) => reader.read_waves(header).context("Reading FST values"),
        }
    }
}

/// A fully parsed document ready for viewing.
pub struct Document {
    pub store: WaveformStore,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parse a whole trace synchronously and derive its chunking.
pub fn load_document(
    source: &mut dyn FileSource,
    hint: Option<&std::path::Path>,
    options: &LoadOptions,
) -> Result<Document> {
    let (mut reader, mut header) = TraceReader::open(source, hint, options)?;
    let waves = reader.read_waves(&header)?;

    let mut diagnostics = std::mem::take(&mut header.diagnostics);
    diagnostics.extend(waves.diagnostics);

    let mut metadata = header.metadata;
    metadata.time_end = waves.time_end;
    if !waves.dump_activity.is_empty() {
        metadata.dump_activity = waves.dump_activity;
    }
    let mut store = WaveformStore::new(header.netlist, metadata);
    for (signal, sequence) in waves.sequences.into_iter_enumerated() {
        store.insert_sequence(signal, sequence);
    }
    store.derive_chunking();
    Ok(Document { store, diagnostics })
}

//! Waveform data engine: VCD and FST parsers, the waveform store with its
//! time chunk index, and a background loader.
//!
//! # Formats
//!
//! VCD is the IEEE 1364 text format. FST is GtkWave's block structured
//! binary format; a description reverse engineered from the GtkWave source
//! is here: https://blog.timhutt.co.uk/fst_spec/

pub mod codec;
pub mod error;
pub mod fst;
pub mod loader;
pub mod netlist;
pub mod options;
pub mod source;
pub mod store;
pub mod trace;
pub mod transfer;
pub mod value;
pub mod vcd;

pub use error::{Diagnostic, Location, WaveError, WaveResult};
pub use loader::{DocumentState, LoadEvent, Loader, Update};
pub use netlist::{Netlist, NetlistNode, NodeId, SignalRef};
pub use options::{FileFormat, LoadOptions};
pub use source::{DiskSource, FileSource, MemorySource};
pub use store::{ChunkMetadata, Metadata, Transition, TransitionSequence, WaveformStore};
pub use trace::{load_document, Document};
pub use value::{NumericFormat, Value};

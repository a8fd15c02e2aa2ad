//! Reader for GTKWave's FST format.
//!
//! An FST file is a chain of blocks, each a type byte and a big-endian
//! length. The header comes first; the value change blocks follow in time
//! order and the geometry, hierarchy and blackout blocks are usually written
//! last. Opening a file walks the whole chain, decoding the small blocks and
//! remembering where the value change blocks are so they can be decoded
//! once the netlist has been handed over.
//!
//! A block that fails to decode is reported as a [`Diagnostic`] and skipped;
//! only a missing or broken header block fails the open.

use std::{
    borrow::Cow,
    collections::HashMap,
    io::{Cursor, Read},
    ops::Range,
};

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use flate2::read::{GzDecoder, ZlibDecoder};
use log::{debug, info};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use typed_index_collections::TiVec;

use crate::{
    codec::{read_block_header, read_cstring, read_var_int, read_var_uint, BLOCK_HEADER_LEN},
    error::{Diagnostic, Location, WaveError, WaveResult},
    netlist::{Attribute, Netlist, NetlistBuilder, SignalEncoding, SignalInfo, SignalRef},
    options::FileFormat,
    source::{FileSource, MemorySource, SourceReader},
    store::{Metadata, Push, TransitionSequence},
    trace::{SignalDecl, TraceHeader, TraceWaves},
    value::{NumericFormat, Value},
};

#[allow(non_camel_case_types)]
#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum BlockType {
    FST_BL_HDR = 0,
    FST_BL_VCDATA = 1,
    FST_BL_BLACKOUT = 2,
    FST_BL_GEOM = 3,
    FST_BL_HIER = 4,
    FST_BL_VCDATA_DYN_ALIAS = 5,
    FST_BL_HIER_LZ4 = 6,
    FST_BL_HIER_LZ4DUO = 7,
    FST_BL_VCDATA_DYN_ALIAS2 = 8,
    FST_BL_ZWRAPPER = 254,
    FST_BL_SKIP = 255,
}

/// Length field of the header block (it counts itself).
const HEADER_LENGTH: u64 = 329;

/// `e` as a double, used to detect the byte order of reals.
const REAL_ENDIANNESS_LITTLE: u64 = 0x4005BF0A8B145769;
const REAL_ENDIANNESS_BIG: u64 = 0x6957148B0ABF0540;

const FST_ST_GEN_ATTRBEGIN: u8 = 252;
const FST_ST_GEN_ATTREND: u8 = 253;
const FST_ST_VCD_SCOPE: u8 = 254;
const FST_ST_VCD_UPSCOPE: u8 = 255;

/// Highest variable type tag.
const FST_VT_MAX: u8 = 29;
const FST_VT_GEN_STRING: u8 = 21;

/// Geometry value for a variable with no bits.
const GEOM_ZERO_LENGTH: u64 = 0xFFFF_FFFF;

/// Most a compressor can expand its input by: deflate tops out just under
/// 1032:1, LZ4 at 255:1 and FastLZ well below that.
const DEFLATE_EXPANSION: u64 = 1032;
const LZ4_EXPANSION: u64 = 255;

/// Single bit states other than 0 and 1, indexed by the 3 bits stored in
/// the wave data.
const NINE_STATE: &[u8; 8] = b"xzhuwl-?";

const VAR_TYPE_NAMES: [&str; 30] = [
    "event",
    "integer",
    "parameter",
    "real",
    "real_parameter",
    "reg",
    "supply0",
    "supply1",
    "time",
    "tri",
    "triand",
    "trior",
    "trireg",
    "tri0",
    "tri1",
    "wand",
    "wire",
    "wor",
    "port",
    "sparray",
    "realtime",
    "string",
    "bit",
    "logic",
    "int",
    "shortint",
    "longint",
    "byte",
    "enum",
    "shortreal",
];

const SCOPE_TYPE_NAMES: [&str; 22] = [
    "module",
    "task",
    "function",
    "begin",
    "fork",
    "generate",
    "struct",
    "union",
    "class",
    "interface",
    "package",
    "program",
    "vhdl_architecture",
    "vhdl_procedure",
    "vhdl_function",
    "vhdl_record",
    "vhdl_process",
    "vhdl_block",
    "vhdl_for_generate",
    "vhdl_if_generate",
    "vhdl_generate",
    "vhdl_package",
];

fn is_real_type(var_type: u8) -> bool {
    matches!(var_type, 3 | 4 | 20 | 29)
}

#[derive(Clone, Debug)]
pub struct Header {
    pub start_time: u64,
    pub end_time: u64,
    // Note this is actually f64 but we only use it to compare bit patterns
    // which is easier as u64.
    pub real_endianness: u64,
    pub writer_memory_use: u64,
    pub num_scopes: u64,
    pub num_hierarchy_vars: u64,
    pub num_vars: u64,
    pub num_vc_blocks: u64,
    pub timescale: i8,
    pub writer: [u8; 128],
    pub date: [u8; 26],
    pub filetype: u8,
    pub timezero: i64,
}

fn array_to_string<const T: usize>(x: &[u8; T]) -> String {
    String::from_utf8_lossy(&x[0..x.iter().position(|b| *b == 0).unwrap_or(x.len())])
        .trim()
        .to_string()
}

trait ReadArray {
    fn read_array<const T: usize>(&mut self) -> std::io::Result<[u8; T]>;
}

impl<R> ReadArray for R
where
    R: Read,
{
    fn read_array<const T: usize>(&mut self) -> std::io::Result<[u8; T]> {
        let mut buf = [0; T];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl Header {
    fn read(reader: &mut impl Read) -> std::io::Result<Self> {
        let start_time = reader.read_u64::<BigEndian>()?;
        let end_time = reader.read_u64::<BigEndian>()?;
        let real_endianness = reader.read_u64::<LittleEndian>()?;
        let writer_memory_use = reader.read_u64::<BigEndian>()?;
        let num_scopes = reader.read_u64::<BigEndian>()?;
        let num_hierarchy_vars = reader.read_u64::<BigEndian>()?;
        let num_vars = reader.read_u64::<BigEndian>()?;
        let num_vc_blocks = reader.read_u64::<BigEndian>()?;
        let timescale = reader.read_i8()?;
        let writer = reader.read_array()?;
        let date = reader.read_array()?;
        let _reserved: [u8; 93] = reader.read_array()?;
        Ok(Header {
            start_time,
            end_time,
            real_endianness,
            writer_memory_use,
            num_scopes,
            num_hierarchy_vars,
            num_vars,
            num_vc_blocks,
            timescale,
            writer,
            date,
            filetype: reader.read_u8()?,
            timezero: reader.read_i64::<BigEndian>()?,
        })
    }

    pub fn writer_string(&self) -> String {
        array_to_string(&self.writer)
    }

    pub fn date_string(&self) -> String {
        array_to_string(&self.date)
    }

    fn endianness(&self) -> Option<RealEndianness> {
        match self.real_endianness {
            REAL_ENDIANNESS_LITTLE => Some(RealEndianness::Little),
            REAL_ENDIANNESS_BIG => Some(RealEndianness::Big),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RealEndianness {
    Little,
    Big,
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum VarLength {
    Bits(u32),
    Real,
}

/// Where a block's contents are in the file.
#[derive(Debug, Copy, Clone)]
struct BlockLocation {
    /// Offset of the type byte.
    offset: u64,
    /// Length of the contents after the block header.
    length: u64,
}

impl BlockLocation {
    fn read(&self, source: &mut dyn FileSource) -> WaveResult<Vec<u8>> {
        source.read_exact_at(self.offset + BLOCK_HEADER_LEN as u64, self.length as usize)
    }
}

#[derive(Debug, Clone)]
enum HierarchyEntry {
    Scope {
        scope_type: u8,
        name: String,
        component: String,
    },
    UpScope,
    Attribute(Attribute),
    Var {
        var_type: u8,
        name: String,
        length: u64,
        /// 1-based signal handle.
        handle: u64,
    },
}

/// What walking the block chain found.
#[derive(Default)]
struct BlockChain {
    value_changes: Vec<(BlockType, BlockLocation)>,
    lengths: Option<Vec<VarLength>>,
    hierarchy: Option<Vec<HierarchyEntry>>,
    blackouts: Vec<(u64, bool)>,
}

/// The decoded contents of one value change block, indexed by signal.
struct BlockChanges {
    start_time: u64,
    initial: Vec<Option<Value>>,
    waves: Vec<Vec<(u64, Value)>>,
}

pub struct FstReader<'a> {
    source: Box<dyn FileSource + 'a>,
    header: Header,
    endianness: RealEndianness,
    value_changes: Vec<(BlockType, BlockLocation)>,
}

impl<'a> FstReader<'a> {
    /// Read the header and every block except the value changes.
    pub fn open(source: &'a mut dyn FileSource) -> Result<(Self, TraceHeader)> {
        Self::open_boxed(Box::new(source), false)
    }

    fn open_boxed(
        mut source: Box<dyn FileSource + 'a>,
        unwrapped: bool,
    ) -> Result<(Self, TraceHeader)> {
        let prefix = source
            .read_exact_at(0, BLOCK_HEADER_LEN)
            .context("File too short for an FST header")?;
        let (block_type, length) = read_block_header(&prefix)?;
        match BlockType::from_u8(block_type) {
            Some(BlockType::FST_BL_HDR) => {}
            Some(BlockType::FST_BL_ZWRAPPER) if !unwrapped => {
                let inner = unwrap_gzip(&mut *source, length).context("Unpacking gzip wrapper")?;
                info!("Unwrapped gzip FST: {} bytes", inner.len());
                return Self::open_boxed(Box::new(MemorySource::new(inner)), true);
            }
            _ => bail!("Not an FST file: first block has type {block_type}"),
        }
        if length != HEADER_LENGTH {
            bail!("Invalid header block length {length} (should be {HEADER_LENGTH})");
        }

        let data = source
            .read_exact_at(BLOCK_HEADER_LEN as u64, (HEADER_LENGTH - 8) as usize)
            .context("Reading header block")?;
        let header = Header::read(&mut Cursor::new(data))?;
        // One byte is not much of a magic number so we use `e` too.
        let Some(endianness) = header.endianness() else {
            bail!("Not an FST file: {:x?}", header.real_endianness);
        };

        let size = source.size();
        let mut chain = BlockChain::default();
        let mut diagnostics = Vec::new();
        let mut offset = 1 + HEADER_LENGTH;
        while offset < size {
            let location = Location::Block { offset };
            let prefix = match source.read_exact_at(offset, BLOCK_HEADER_LEN) {
                Ok(p) => p,
                Err(e) => {
                    diagnostics.push(Diagnostic::new(location, e));
                    break;
                }
            };
            let (block_type, length) = read_block_header(&prefix)?;
            let available = size - offset;
            if length < 8 || length >= available {
                diagnostics.push(Diagnostic::new(
                    location,
                    WaveError::TruncatedFile {
                        offset,
                        needed: length.saturating_add(1),
                        available,
                    },
                ));
                break;
            }
            let block = BlockLocation {
                offset,
                length: length - 8,
            };
            let result = match BlockType::from_u8(block_type) {
                Some(kind) => {
                    debug!("{kind:?} block at {offset}, {} bytes", block.length);
                    read_block(&mut *source, kind, block, &mut chain)
                }
                None => Err(WaveError::UnrecognizedBlockType { block_type }),
            };
            if let Err(e) = result {
                diagnostics.push(Diagnostic::new(location, e));
            }
            offset += 1 + length;
        }

        let entries = chain.hierarchy.take().unwrap_or_else(|| {
            diagnostics.push(Diagnostic::new(
                Location::Block { offset: size },
                WaveError::Invalid("no hierarchy block".into()),
            ));
            Vec::new()
        });
        let signals = signal_decls(chain.lengths.as_deref(), &entries);
        if signals.len() as u64 != header.num_vars {
            debug!(
                "Header declares {} signals, found {}",
                header.num_vars,
                signals.len()
            );
        }
        let netlist = build_netlist(&entries, &signals, &mut diagnostics);

        let (time_scale, time_unit) = timescale_from_exponent(header.timescale);
        let metadata = Metadata {
            format: FileFormat::Fst,
            file_size: size,
            time_scale,
            time_unit,
            waveforms_start_offset: chain
                .value_changes
                .first()
                .map_or(size, |(_, b)| b.offset),
            module_count: netlist.scope_count(),
            signal_count: netlist.signal_count(),
            time_end: header.end_time,
            date: header.date_string(),
            version: header.writer_string(),
            dump_activity: chain.blackouts,
            chunking: None,
        };

        info!(
            "FST header: {} scopes, {} signals ({} physical), {} value change blocks, timescale {}{}",
            metadata.module_count,
            metadata.signal_count,
            signals.len(),
            chain.value_changes.len(),
            metadata.time_scale,
            metadata.time_unit,
        );

        Ok((
            FstReader {
                source,
                header,
                endianness,
                value_changes: chain.value_changes,
            },
            TraceHeader {
                netlist,
                metadata,
                signals,
                diagnostics,
            },
        ))
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Decode every value change block. A block that fails is skipped whole
    /// so no signal ends up with half a block of changes.
    pub fn read_waves(&mut self, header: &TraceHeader) -> Result<TraceWaves> {
        let mut sequences: TiVec<SignalRef, TransitionSequence> = header
            .signals
            .iter()
            .map(|s| TransitionSequence::new(s.width))
            .collect();
        let mut diagnostics = Vec::new();
        let mut latest_change: Option<u64> = None;

        for (kind, block) in self.value_changes.clone() {
            let location = Location::Block {
                offset: block.offset,
            };
            let changes = match self.decode_block(kind, block, &header.signals, &mut diagnostics)
            {
                Ok(c) => c,
                Err(e) => {
                    diagnostics.push(Diagnostic::new(location, e));
                    continue;
                }
            };

            let mut out_of_order = 0usize;
            for (signal, sequence) in sequences.iter_mut_enumerated() {
                let index: usize = signal.into();
                if let Some(Some(value)) = changes.initial.get(index) {
                    sequence.push(changes.start_time, value.clone());
                }
                for (time, value) in changes.waves.get(index).into_iter().flatten() {
                    match sequence.push(*time, value.clone()) {
                        Push::OutOfOrder => out_of_order += 1,
                        _ => latest_change = latest_change.max(Some(*time)),
                    }
                }
            }
            if out_of_order > 0 {
                diagnostics.push(Diagnostic::new(
                    location,
                    WaveError::Invalid(format!("{out_of_order} changes out of time order")),
                ));
            }
        }

        // The timeline has to extend past the final change for it to be visible.
        let time_end = match latest_change {
            Some(t) if t >= self.header.end_time => t.saturating_add(1),
            _ => self.header.end_time,
        };
        for sequence in sequences.iter_mut() {
            sequence.close(time_end);
        }

        info!(
            "FST values: {} transitions up to time {time_end}",
            sequences.iter().map(|s| s.len()).sum::<usize>()
        );

        Ok(TraceWaves {
            sequences,
            time_end,
            dump_activity: Vec::new(),
            diagnostics,
        })
    }

    fn decode_block(
        &mut self,
        kind: BlockType,
        block: BlockLocation,
        signals: &TiVec<SignalRef, SignalDecl>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> WaveResult<BlockChanges> {
        let data = block.read(&mut *self.source)?;

        let start_time = read_u64_at(&data, 0)?;
        let (bits_uncompressed_length, pos) = read_var_uint(&data, 24)?;
        let (bits_compressed_length, pos) = read_var_uint(&data, pos)?;
        let (bits_count, pos) = read_var_uint(&data, pos)?;
        let bits = slice_at(&data, pos, bits_compressed_length)?;
        let bits = inflate(bits, bits_uncompressed_length)?;
        let initial = decode_initial_values(&bits, bits_count, signals, self.endianness)?;

        let (_waves_count, pos) = read_var_uint(&data, pos + bits_compressed_length as usize)?;
        let packtype = *slice_at(&data, pos, 1)?.first().unwrap_or(&0);
        let waves_start = pos + 1;

        // The remaining sections are found from the end of the block.
        let tail = checked_back(data.len(), 24)?;
        let time_uncompressed_length = read_u64_at(&data, tail)?;
        let time_compressed_length = read_u64_at(&data, tail + 8)?;
        let time_count = read_u64_at(&data, tail + 16)?;
        let time_start = checked_back(tail, time_compressed_length)?;
        let position_length_at = checked_back(time_start, 8)?;
        let position_length = read_u64_at(&data, position_length_at)?;
        let position_start = checked_back(position_length_at, position_length)?;
        if position_start < waves_start {
            return Err(WaveError::Invalid(format!(
                "position table at {position_start} overlaps the wave data at {waves_start}"
            )));
        }

        let times = decode_times(
            &data[time_start..tail],
            time_uncompressed_length,
            time_count,
        )?;
        let waves = &data[waves_start..position_start];

        let slots = match kind {
            BlockType::FST_BL_VCDATA_DYN_ALIAS2 => decode_position_table(
                &data[position_start..position_length_at],
                signals.len(),
                waves.len(),
            )?,
            _ => {
                diagnostics.push(Diagnostic::new(
                    Location::Block {
                        offset: block.offset,
                    },
                    WaveError::UnsupportedEncoding(format!(
                        "{kind:?} position table; only initial values were read"
                    )),
                ));
                Vec::new()
            }
        };

        let mut decoded = vec![Vec::new(); signals.len()];
        for (index, range) in slots.into_iter().enumerate() {
            if range.is_empty() {
                continue;
            }
            decoded[index] = decode_wave(
                &waves[range],
                &signals[SignalRef(index)],
                packtype,
                &times,
                self.endianness,
            )?;
        }

        Ok(BlockChanges {
            start_time,
            initial,
            waves: decoded,
        })
    }
}

fn read_block(
    source: &mut dyn FileSource,
    kind: BlockType,
    block: BlockLocation,
    chain: &mut BlockChain,
) -> WaveResult<()> {
    match kind {
        BlockType::FST_BL_VCDATA
        | BlockType::FST_BL_VCDATA_DYN_ALIAS
        | BlockType::FST_BL_VCDATA_DYN_ALIAS2 => {
            chain.value_changes.push((kind, block));
        }
        BlockType::FST_BL_GEOM => {
            if chain.lengths.is_some() {
                return Err(WaveError::Invalid("duplicate geometry block".into()));
            }
            chain.lengths = Some(decode_geometry(&block.read(source)?)?);
        }
        BlockType::FST_BL_BLACKOUT => {
            chain.blackouts = decode_blackouts(&block.read(source)?)?;
        }
        BlockType::FST_BL_HIER | BlockType::FST_BL_HIER_LZ4 | BlockType::FST_BL_HIER_LZ4DUO => {
            if chain.hierarchy.is_some() {
                return Err(WaveError::Invalid("duplicate hierarchy block".into()));
            }
            let data = unpack_hierarchy(kind, &block.read(source)?)?;
            // Keep whatever decoded before an error so the rest of the
            // netlist can still be shown.
            let mut entries = Vec::new();
            let result = decode_hierarchy(&data, &mut entries);
            chain.hierarchy = Some(entries);
            result?;
        }
        BlockType::FST_BL_HDR => {
            return Err(WaveError::Invalid("second header block".into()));
        }
        BlockType::FST_BL_ZWRAPPER => {
            return Err(WaveError::Invalid("gzip wrapper block after the header".into()));
        }
        BlockType::FST_BL_SKIP => {
            return Err(WaveError::UnsupportedEncoding(
                "skip block from an unfinished write".into(),
            ));
        }
    }
    Ok(())
}

fn unwrap_gzip(source: &mut dyn FileSource, length: u64) -> WaveResult<Vec<u8>> {
    let compressed_length = length
        .checked_sub(16)
        .ok_or_else(|| WaveError::Invalid("gzip wrapper block too short".into()))?;
    let mut reader = SourceReader::new(source, BLOCK_HEADER_LEN as u64);
    let uncompressed_length = reader.read_u64::<BigEndian>()?;
    let capacity = expanded_length(
        "gzip",
        DEFLATE_EXPANSION,
        compressed_length,
        uncompressed_length,
    )?;
    let mut out = Vec::with_capacity(capacity);
    GzDecoder::new(reader.take(compressed_length))
        .read_to_end(&mut out)
        .map_err(|e| WaveError::Decompression(format!("gzip: {e}")))?;
    Ok(out)
}

fn read_u64_at(data: &[u8], at: usize) -> WaveResult<u64> {
    Ok(BigEndian::read_u64(slice_at(data, at, 8)?))
}

fn slice_at(data: &[u8], at: usize, length: u64) -> WaveResult<&[u8]> {
    let end = (at as u64).saturating_add(length);
    if end > data.len() as u64 {
        return Err(WaveError::TruncatedFile {
            offset: at as u64,
            needed: length,
            available: data.len().saturating_sub(at) as u64,
        });
    }
    Ok(&data[at..end as usize])
}

fn checked_back(from: usize, amount: u64) -> WaveResult<usize> {
    (from as u64)
        .checked_sub(amount)
        .map(|x| x as usize)
        .ok_or_else(|| WaveError::Invalid(format!("section of {amount} bytes before offset {from}")))
}

/// Check a declared uncompressed length before allocating for it.
fn expanded_length(
    method: &str,
    expansion: u64,
    compressed: u64,
    uncompressed_length: u64,
) -> WaveResult<usize> {
    let limit = compressed.saturating_mul(expansion).saturating_add(64);
    if uncompressed_length > limit {
        return Err(WaveError::Decompression(format!(
            "{method}: {uncompressed_length} bytes declared for {compressed} compressed"
        )));
    }
    usize::try_from(uncompressed_length)
        .map_err(|_| WaveError::Decompression(format!("{method}: {uncompressed_length} bytes")))
}

/// Sections are stored raw when compression would not have helped.
fn inflate(data: &[u8], uncompressed_length: u64) -> WaveResult<Cow<'_, [u8]>> {
    if data.len() as u64 == uncompressed_length {
        return Ok(Cow::Borrowed(data));
    }
    let capacity = expanded_length(
        "zlib",
        DEFLATE_EXPANSION,
        data.len() as u64,
        uncompressed_length,
    )?;
    let mut out = Vec::with_capacity(capacity);
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| WaveError::Decompression(format!("zlib: {e}")))?;
    if out.len() as u64 != uncompressed_length {
        return Err(WaveError::Decompression(format!(
            "zlib: expected {uncompressed_length} bytes, got {}",
            out.len()
        )));
    }
    Ok(Cow::Owned(out))
}

fn lz4(data: &[u8], uncompressed_length: u64) -> WaveResult<Vec<u8>> {
    let length = expanded_length("lz4", LZ4_EXPANSION, data.len() as u64, uncompressed_length)?;
    lz4_flex::block::decompress(data, length)
        .map_err(|e| WaveError::Decompression(format!("lz4: {e}")))
}

fn decode_geometry(data: &[u8]) -> WaveResult<Vec<VarLength>> {
    let uncompressed_length = read_u64_at(data, 0)?;
    let count = read_u64_at(data, 8)?;
    let lengths = inflate(&data[16..], uncompressed_length)?;

    let mut out = Vec::with_capacity(count.min(lengths.len() as u64) as usize);
    let mut pos = 0;
    for _ in 0..count {
        let (length, p) = read_var_uint(&lengths, pos)?;
        pos = p;
        out.push(match length {
            0 => VarLength::Real,
            GEOM_ZERO_LENGTH => VarLength::Bits(0),
            n => VarLength::Bits(
                u32::try_from(n)
                    .map_err(|_| WaveError::Invalid(format!("variable with {n} bits")))?,
            ),
        });
    }
    Ok(out)
}

fn add_delta(time: u64, delta: u64, what: &str) -> WaveResult<u64> {
    time.checked_add(delta)
        .ok_or_else(|| WaveError::Invalid(format!("{what} delta {delta} overflows time {time}")))
}

fn decode_blackouts(data: &[u8]) -> WaveResult<Vec<(u64, bool)>> {
    let (count, mut pos) = read_var_uint(data, 0)?;
    let mut out = Vec::new();
    let mut time = 0;
    for _ in 0..count {
        let activity = *slice_at(data, pos, 1)?.first().unwrap_or(&0);
        let (delta, p) = read_var_uint(data, pos + 1)?;
        pos = p;
        time = add_delta(time, delta, "blackout")?;
        out.push((time, activity != 0));
    }
    Ok(out)
}

fn unpack_hierarchy(kind: BlockType, data: &[u8]) -> WaveResult<Vec<u8>> {
    let uncompressed_length = read_u64_at(data, 0)?;
    match kind {
        BlockType::FST_BL_HIER => {
            let compressed = data.len() as u64 - 8;
            let capacity =
                expanded_length("gzip", DEFLATE_EXPANSION, compressed, uncompressed_length)?;
            let mut out = Vec::with_capacity(capacity);
            GzDecoder::new(&data[8..])
                .read_to_end(&mut out)
                .map_err(|e| WaveError::Decompression(format!("gzip: {e}")))?;
            Ok(out)
        }
        BlockType::FST_BL_HIER_LZ4 => lz4(&data[8..], uncompressed_length),
        BlockType::FST_BL_HIER_LZ4DUO => {
            let compressed_once_length = read_u64_at(data, 8)?;
            let once = lz4(&data[16..], compressed_once_length)?;
            lz4(&once, uncompressed_length)
        }
        _ => Err(WaveError::Invalid(format!("{kind:?} is not a hierarchy block"))),
    }
}

fn byte_at(data: &[u8], pos: usize) -> WaveResult<u8> {
    data.get(pos).copied().ok_or(WaveError::TruncatedFile {
        offset: pos as u64,
        needed: 1,
        available: 0,
    })
}

fn decode_hierarchy(data: &[u8], entries: &mut Vec<HierarchyEntry>) -> WaveResult<()> {
    let mut pos = 0;
    let mut depth = 0usize;
    let mut next_handle = 0u64;
    while pos < data.len() {
        let tag_offset = pos;
        let tag = data[pos];
        pos += 1;
        match tag {
            FST_ST_GEN_ATTRBEGIN => {
                let attr_type = byte_at(data, pos)?;
                let subtype = byte_at(data, pos + 1)?;
                let (name, p) = read_cstring(data, pos + 2)?;
                let (arg, p) = read_var_uint(data, p)?;
                pos = p;
                entries.push(HierarchyEntry::Attribute(Attribute {
                    attr_type,
                    subtype,
                    name,
                    arg,
                }));
            }
            FST_ST_GEN_ATTREND => {}
            FST_ST_VCD_SCOPE => {
                let scope_type = byte_at(data, pos)?;
                let (name, p) = read_cstring(data, pos + 1)?;
                let (component, p) = read_cstring(data, p)?;
                pos = p;
                depth += 1;
                entries.push(HierarchyEntry::Scope {
                    scope_type,
                    name,
                    component,
                });
            }
            FST_ST_VCD_UPSCOPE => {
                if depth == 0 {
                    return Err(WaveError::Invalid(format!(
                        "upscope without an open scope at offset {tag_offset}"
                    )));
                }
                depth -= 1;
                entries.push(HierarchyEntry::UpScope);
            }
            var_type if var_type <= FST_VT_MAX => {
                let _direction = byte_at(data, pos)?;
                let (name, p) = read_cstring(data, pos + 1)?;
                let (length, p) = read_var_uint(data, p)?;
                let (alias, p) = read_var_uint(data, p)?;
                pos = p;
                let handle = match alias {
                    0 => {
                        next_handle += 1;
                        next_handle
                    }
                    alias if alias > next_handle => {
                        return Err(WaveError::Invalid(format!(
                            "{name} aliases signal {alias} before it is declared"
                        )));
                    }
                    alias => alias,
                };
                entries.push(HierarchyEntry::Var {
                    var_type,
                    name,
                    length,
                    handle,
                });
            }
            tag => {
                return Err(WaveError::UnrecognizedTag {
                    tag,
                    offset: tag_offset,
                })
            }
        }
    }
    Ok(())
}

/// One declaration per physical signal. Geometry widths win over the
/// lengths given in the hierarchy.
fn signal_decls(
    lengths: Option<&[VarLength]>,
    entries: &[HierarchyEntry],
) -> TiVec<SignalRef, SignalDecl> {
    let mut declared: HashMap<u64, (u8, u64)> = HashMap::new();
    let mut max_handle = 0;
    for entry in entries {
        if let HierarchyEntry::Var {
            var_type,
            length,
            handle,
            ..
        } = entry
        {
            declared.entry(*handle).or_insert((*var_type, *length));
            max_handle = max_handle.max(*handle);
        }
    }

    let count = lengths.map_or(max_handle as usize, |l| l.len());
    (0..count)
        .map(|index| {
            let handle = index as u64 + 1;
            let var_type = declared.get(&handle).map(|d| d.0);
            let (width, encoding) = match lengths.map(|l| l[index]) {
                Some(VarLength::Real) => (64, SignalEncoding::Real),
                Some(VarLength::Bits(0)) if var_type == Some(FST_VT_GEN_STRING) => {
                    (0, SignalEncoding::String)
                }
                Some(VarLength::Bits(n)) => (n, SignalEncoding::Bits),
                None => match declared.get(&handle) {
                    Some((t, _)) if is_real_type(*t) => (64, SignalEncoding::Real),
                    Some((FST_VT_GEN_STRING, _)) => (0, SignalEncoding::String),
                    Some((_, length)) => (*length as u32, SignalEncoding::Bits),
                    None => (1, SignalEncoding::Bits),
                },
            };
            SignalDecl {
                signal_id: handle.to_string(),
                width,
                encoding,
            }
        })
        .collect()
}

fn build_netlist(
    entries: &[HierarchyEntry],
    signals: &TiVec<SignalRef, SignalDecl>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Netlist {
    let mut builder = NetlistBuilder::new();
    for entry in entries {
        match entry {
            HierarchyEntry::Scope {
                scope_type,
                name,
                component,
            } => {
                let scope_type = SCOPE_TYPE_NAMES
                    .get(*scope_type as usize)
                    .copied()
                    .unwrap_or("scope");
                builder.push_scope(name.clone(), scope_type.to_owned(), component.clone());
            }
            HierarchyEntry::UpScope => {
                builder.pop_scope();
            }
            HierarchyEntry::Attribute(attr) => builder.add_attribute(attr.clone()),
            HierarchyEntry::Var {
                var_type,
                name,
                handle,
                ..
            } => {
                let signal = SignalRef(handle.saturating_sub(1) as usize);
                let Some(decl) = signals.get(signal).filter(|_| *handle > 0) else {
                    diagnostics.push(Diagnostic::new(
                        Location::Signal { id: handle.to_string() },
                        WaveError::Invalid(format!("{name} refers to an undeclared signal")),
                    ));
                    continue;
                };
                builder.add_signal(
                    name.clone(),
                    SignalInfo {
                        width: decl.width,
                        signal_id: decl.signal_id.clone(),
                        signal,
                        var_type: VAR_TYPE_NAMES[*var_type as usize].to_owned(),
                        encoding: decl.encoding,
                        numeric_format: NumericFormat::default(),
                    },
                );
            }
        }
    }
    builder.finish()
}

/// The header stores the timescale as a power of ten.
fn timescale_from_exponent(exponent: i8) -> (u32, String) {
    const UNITS: [&str; 6] = ["s", "ms", "us", "ns", "ps", "fs"];
    let exponent = exponent as i32;
    let unit = (2 - exponent).div_euclid(3).clamp(0, UNITS.len() as i32 - 1);
    let power = exponent + 3 * unit;
    if !(0..=9).contains(&power) {
        log::warn!("Timescale 1e{exponent} s out of range; using 1 fs");
        return (1, "fs".to_owned());
    }
    (10u32.pow(power as u32), UNITS[unit as usize].to_owned())
}

fn real_value(bytes: &[u8], endianness: RealEndianness) -> Value {
    let value = match endianness {
        RealEndianness::Little => LittleEndian::read_f64(bytes),
        RealEndianness::Big => BigEndian::read_f64(bytes),
    };
    Value::from_text(&value.to_string())
}

/// The value of every signal at the start of the block.
fn decode_initial_values(
    bits: &[u8],
    count: u64,
    signals: &TiVec<SignalRef, SignalDecl>,
    endianness: RealEndianness,
) -> WaveResult<Vec<Option<Value>>> {
    let count = (count as usize).min(signals.len());
    let mut out = Vec::with_capacity(count);
    let mut pos = 0;
    for decl in signals.iter().take(count) {
        let value = match decl.encoding {
            SignalEncoding::Real => {
                let bytes = slice_at(bits, pos, 8)?;
                pos += 8;
                Some(real_value(bytes, endianness))
            }
            // Variable length values have nothing in the bits array.
            _ if decl.width == 0 => None,
            _ => {
                let bytes = slice_at(bits, pos, decl.width as u64)?;
                pos += bytes.len();
                Some(Value::from_bytes(bytes))
            }
        };
        out.push(value);
    }
    Ok(out)
}

fn decode_times(data: &[u8], uncompressed_length: u64, count: u64) -> WaveResult<Vec<u64>> {
    let data = inflate(data, uncompressed_length)?;
    let mut times = Vec::with_capacity(count.min(data.len() as u64) as usize);
    let mut time = 0u64;
    let mut pos = 0;
    for _ in 0..count {
        let (delta, p) = read_var_uint(&data, pos)?;
        pos = p;
        time = add_delta(time, delta, "time table")?;
        times.push(time);
    }
    Ok(times)
}

#[derive(Clone, Copy, Debug)]
enum Slot {
    Empty,
    /// Start of the signal's data, relative to the start of the waves.
    Offset(usize),
    Alias(usize),
}

/// Decode the table giving where each signal's data is in the waves
/// section. Returns one byte range per signal; empty means no changes.
fn decode_position_table(
    data: &[u8],
    num_signals: usize,
    waves_length: usize,
) -> WaveResult<Vec<Range<usize>>> {
    let mut slots: Vec<Slot> = Vec::with_capacity(num_signals);
    let mut pos = 0;
    let mut prev_offset: u64 = 0;
    let mut prev_alias = None;

    while slots.len() < num_signals {
        // The lowest bit says whether this is a run of signals with no
        // changes (an unsigned varint) or a value (a signed one).
        if byte_at(data, pos)? & 1 == 0 {
            let (v, p) = read_var_uint(data, pos)?;
            pos = p;
            let run = (v >> 1) as usize;
            if run > num_signals - slots.len() {
                return Err(WaveError::Invalid(format!(
                    "position table run of {run} passes the last signal"
                )));
            }
            slots.resize(slots.len() + run, Slot::Empty);
            continue;
        }

        let (v, p) = read_var_int(data, pos)?;
        pos = p;
        // >0: delta from the previous offset. <0: alias to an earlier
        // signal. 0: the same alias as last time.
        let slot = match v >> 1 {
            x if x > 0 => {
                prev_offset = prev_offset.checked_add(x as u64).ok_or_else(|| {
                    WaveError::Invalid(format!("position table offset overflows at {pos}"))
                })?;
                // Offsets count from the pack type byte.
                Slot::Offset((prev_offset - 1) as usize)
            }
            x if x < 0 => {
                let target = (-(x + 1)) as usize;
                if target >= slots.len() {
                    return Err(WaveError::Invalid(format!(
                        "signal {} aliased to later signal {target}",
                        slots.len()
                    )));
                }
                prev_alias = Some(target);
                Slot::Alias(target)
            }
            _ => Slot::Alias(prev_alias.ok_or_else(|| {
                WaveError::Invalid("repeated alias with no previous alias".into())
            })?),
        };
        slots.push(slot);
    }

    // Each signal's data runs up to the next signal's.
    let mut starts: Vec<usize> = slots
        .iter()
        .filter_map(|s| match s {
            Slot::Offset(o) => Some(*o),
            _ => None,
        })
        .collect();
    starts.sort_unstable();
    starts.dedup();

    let mut ranges: Vec<Range<usize>> = Vec::with_capacity(slots.len());
    for slot in slots {
        let range = match slot {
            Slot::Empty => 0..0,
            Slot::Offset(start) => {
                let next = starts.partition_point(|s| *s <= start);
                let end = starts.get(next).copied().unwrap_or(waves_length);
                if start > waves_length || end > waves_length {
                    return Err(WaveError::Invalid(format!(
                        "wave data {start}..{end} outside the {waves_length} byte section"
                    )));
                }
                start..end
            }
            Slot::Alias(target) => ranges[target].clone(),
        };
        ranges.push(range);
    }
    Ok(ranges)
}

fn unpack_wave(data: &[u8], uncompressed_length: u64, packtype: u8) -> WaveResult<Cow<'_, [u8]>> {
    Ok(match (uncompressed_length, packtype) {
        (0, _) => Cow::Borrowed(data),
        (length, b'F') => {
            let length = expanded_length("fastlz", LZ4_EXPANSION, data.len() as u64, length)?;
            let mut out = vec![0; length];
            let written = fastlz::decompress(data, &mut out)
                .map_err(|_| WaveError::Decompression("fastlz".into()))?
                .len();
            if written != out.len() {
                return Err(WaveError::Decompression(format!(
                    "fastlz: expected {length} bytes, got {written}"
                )));
            }
            Cow::Owned(out)
        }
        (length, b'4') => Cow::Owned(lz4(data, length)?),
        (length, _) => {
            let capacity = expanded_length("zlib", DEFLATE_EXPANSION, data.len() as u64, length)?;
            let mut out = Vec::with_capacity(capacity);
            ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| WaveError::Decompression(format!("zlib: {e}")))?;
            Cow::Owned(out)
        }
    })
}

/// Expand packed bits, most significant first.
fn value_from_packed_bits(bytes: &[u8], width: u32) -> Value {
    Value(
        (0..width as usize)
            .map(|i| {
                if bytes[i / 8] & (0x80 >> (i % 8)) != 0 {
                    b'1'
                } else {
                    b'0'
                }
            })
            .collect(),
    )
}

/// Decode one signal's changes in a block.
fn decode_wave(
    data: &[u8],
    decl: &SignalDecl,
    packtype: u8,
    times: &[u64],
    endianness: RealEndianness,
) -> WaveResult<Vec<(u64, Value)>> {
    // 0 means the data is stored uncompressed.
    let (uncompressed_length, start) = read_var_uint(data, 0)?;
    let data = unpack_wave(&data[start..], uncompressed_length, packtype)?;

    let mut out = Vec::new();
    let mut pos = 0;
    let mut time_index = 0u64;
    while pos < data.len() {
        let (v, p) = read_var_uint(&data, pos)?;
        pos = p;
        let (delta, value) = match decl.encoding {
            SignalEncoding::Bits if decl.width == 1 => {
                if v & 1 == 0 {
                    let bit = if v & 2 == 0 { b"0" } else { b"1" };
                    (v >> 2, Value::from_bytes(bit))
                } else {
                    let state = NINE_STATE[((v >> 1) & 7) as usize];
                    (v >> 4, Value::from_bytes(&[state]))
                }
            }
            SignalEncoding::Bits => {
                let width = decl.width as u64;
                if v & 1 == 0 {
                    let bytes = slice_at(&data, pos, (width + 7) / 8)?;
                    pos += bytes.len();
                    (v >> 1, value_from_packed_bits(bytes, decl.width))
                } else {
                    let bytes = slice_at(&data, pos, width)?;
                    pos += bytes.len();
                    (v >> 1, Value::from_bytes(bytes))
                }
            }
            SignalEncoding::Real => {
                if v & 1 != 0 {
                    return Err(WaveError::UnsupportedEncoding(format!(
                        "real signal {} stored as text",
                        decl.signal_id
                    )));
                }
                let bytes = slice_at(&data, pos, 8)?;
                pos += 8;
                (v >> 1, real_value(bytes, endianness))
            }
            SignalEncoding::String => {
                let (length, p) = read_var_uint(&data, pos)?;
                let bytes = slice_at(&data, p, length)?;
                pos = p + bytes.len();
                (v >> 1, Value::from_text(&String::from_utf8_lossy(bytes)))
            }
        };
        time_index = add_delta(time_index, delta, "time index")?;
        let time = *times.get(time_index as usize).ok_or_else(|| {
            WaveError::Invalid(format!(
                "time index {time_index} past the {} entry time table",
                times.len()
            ))
        })?;
        out.push((time, value));
    }
    Ok(out)
}


#[cfg(test)]
mod test {
    use super::{
        test_writer::{push_block, wrap, Block, Hier, TestFst, Wave},
        *,
    };
    use crate::{
        codec::{push_svarint, push_varint},
        options::LoadOptions,
        trace::load_document,
    };

    fn clock_file() -> TestFst {
        TestFst {
            end_time: 30,
            lengths: vec![1, 8],
            hierarchy: vec![
                Hier::Scope("top"),
                Hier::Attr("source", 7),
                Hier::Var("clk", 16, 1, 0),
                Hier::Var("data", 16, 8, 0),
                Hier::Var("clk_alias", 16, 1, 1),
                Hier::Up,
            ],
            blocks: vec![Block {
                block_type: BlockType::FST_BL_VCDATA_DYN_ALIAS2,
                start: 0,
                end: 30,
                initial: vec!["0", "00000000"],
                times: vec![0, 10, 20, 30],
                waves: vec![
                    Wave::Changes(vec![(1, "1"), (2, "0"), (3, "x")]),
                    Wave::Changes(vec![(2, "10100101")]),
                ],
                packtype: b'Z',
            }],
            ..Default::default()
        }
    }

    fn load(bytes: Vec<u8>) -> crate::trace::Document {
        let mut source = MemorySource::new(bytes);
        let options = LoadOptions {
            format: Some(FileFormat::Fst),
            ..Default::default()
        };
        load_document(&mut source, None, &options).unwrap()
    }

    fn changes(doc: &crate::trace::Document, path: &str) -> Vec<(u64, String)> {
        let netlist = doc.store.netlist();
        let node = netlist.get(netlist.find(path).unwrap()).unwrap();
        let signal = node.signal().unwrap().signal;
        doc.store
            .sequence(signal)
            .unwrap()
            .transitions()
            .iter()
            .map(|t| (t.time, t.value.as_str().to_owned()))
            .collect()
    }

    #[test]
    fn test_alias_sharing() {
        let doc = load(clock_file().encode());
        assert!(doc.diagnostics.is_empty(), "{:?}", doc.diagnostics);

        let netlist = doc.store.netlist();
        assert_eq!(netlist.signal_count(), 3);
        let clk = netlist.get(netlist.find("top.clk").unwrap()).unwrap();
        let alias = netlist.get(netlist.find("top.clk_alias").unwrap()).unwrap();
        let clk = clk.signal().unwrap();
        let alias = alias.signal().unwrap();
        assert_eq!(clk.signal, alias.signal);
        assert_eq!(clk.signal_id, "1");
        assert!(std::ptr::eq(
            doc.store.sequence(clk.signal).unwrap(),
            doc.store.sequence(alias.signal).unwrap()
        ));

        let top = netlist.get(netlist.roots()[0]).unwrap().scope().unwrap();
        assert_eq!(top.scope_type, "module");
        assert_eq!(top.attrs[0].name, "source");
        assert_eq!(top.attrs[0].arg, 7);

        // The last change is at the end time so the timeline is extended.
        assert_eq!(
            changes(&doc, "top.clk"),
            vec![
                (0, "0".into()),
                (10, "1".into()),
                (20, "0".into()),
                (30, "x".into()),
                (31, "x".into())
            ]
        );
        assert_eq!(
            changes(&doc, "top.data"),
            vec![
                (0, "00000000".into()),
                (20, "10100101".into()),
                (31, "10100101".into())
            ]
        );

        let metadata = doc.store.metadata();
        assert_eq!(metadata.format, FileFormat::Fst);
        assert_eq!(metadata.time_scale, 1);
        assert_eq!(metadata.time_unit, "ns");
        assert_eq!(metadata.time_end, 31);
        assert_eq!(metadata.version, "testgen");
        assert_eq!(metadata.date, "2024-01-01");
    }

    #[test]
    fn test_compressed_blocks_and_dynamic_alias() {
        let file = TestFst {
            end_time: 100,
            lengths: vec![1, 4, 1],
            compress_geometry: true,
            hierarchy_type: BlockType::FST_BL_HIER_LZ4DUO,
            hierarchy: vec![
                Hier::Scope("tb"),
                Hier::Scope("dut"),
                Hier::Var("clk", 16, 1, 0),
                Hier::Var("state", 5, 4, 0),
                Hier::Up,
                Hier::Var("en", 16, 1, 0),
                Hier::Up,
            ],
            blocks: vec![
                Block {
                    block_type: BlockType::FST_BL_VCDATA_DYN_ALIAS2,
                    start: 0,
                    end: 40,
                    initial: vec!["0", "0000", "0"],
                    times: vec![0, 10, 40],
                    waves: vec![
                        Wave::Changes(vec![(1, "1")]),
                        Wave::Changes(vec![(1, "01x1"), (2, "0011")]),
                        Wave::None,
                    ],
                    packtype: b'Z',
                },
                Block {
                    block_type: BlockType::FST_BL_VCDATA_DYN_ALIAS2,
                    start: 50,
                    end: 100,
                    initial: vec!["1", "0011", "0"],
                    times: vec![50, 60, 70],
                    waves: vec![
                        Wave::Changes(vec![(1, "0"), (2, "1")]),
                        Wave::None,
                        Wave::AliasOf(0),
                    ],
                    packtype: b'4',
                },
            ],
            blackouts: vec![(5, false), (15, true)],
            ..Default::default()
        };
        let doc = load(file.encode());
        assert!(doc.diagnostics.is_empty(), "{:?}", doc.diagnostics);

        assert_eq!(
            changes(&doc, "tb.dut.state"),
            vec![
                (0, "0000".into()),
                (10, "01x1".into()),
                (40, "0011".into()),
                (100, "0011".into())
            ]
        );
        assert_eq!(
            changes(&doc, "tb.dut.clk"),
            vec![
                (0, "0".into()),
                (10, "1".into()),
                (60, "0".into()),
                (70, "1".into()),
                (100, "1".into())
            ]
        );
        assert_eq!(
            changes(&doc, "tb.en"),
            vec![(0, "0".into()), (70, "1".into()), (100, "1".into())]
        );
        assert_eq!(
            doc.store.metadata().dump_activity,
            vec![(5, false), (15, true)]
        );
    }

    #[test]
    fn test_real_values() {
        let file = TestFst {
            timescale: -12,
            end_time: 20,
            lengths: vec![0],
            hierarchy_type: BlockType::FST_BL_HIER,
            hierarchy: vec![Hier::Scope("top"), Hier::Var("v", 3, 8, 0), Hier::Up],
            blocks: vec![Block {
                block_type: BlockType::FST_BL_VCDATA_DYN_ALIAS2,
                start: 0,
                end: 20,
                initial: vec!["1.5"],
                times: vec![0, 5],
                waves: vec![Wave::Changes(vec![(1, "-0.25")])],
                packtype: b'Z',
            }],
            ..Default::default()
        };
        let doc = load(file.encode());
        assert!(doc.diagnostics.is_empty(), "{:?}", doc.diagnostics);
        assert_eq!(
            changes(&doc, "top.v"),
            vec![(0, "1.5".into()), (5, "-0.25".into()), (20, "-0.25".into())]
        );
        let netlist = doc.store.netlist();
        let v = netlist.get(netlist.find("top.v").unwrap()).unwrap();
        assert_eq!(v.signal().unwrap().encoding, SignalEncoding::Real);
        assert_eq!(v.signal().unwrap().var_type, "real");
        assert_eq!(doc.store.metadata().time_unit, "ps");
    }

    #[test]
    fn test_bad_blocks_are_isolated() {
        let mut file = clock_file();
        file.extra.push((77, vec![1, 2, 3]));
        // A value change block with an empty position table.
        file.extra.push((
            BlockType::FST_BL_VCDATA_DYN_ALIAS2 as u8,
            vec![0u8; 24]
                .into_iter()
                .chain([0, 0, 0, 0, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0])
                .chain([0u8; 24])
                .collect(),
        ));
        let doc = load(file.encode());

        assert_eq!(doc.diagnostics.len(), 2, "{:?}", doc.diagnostics);
        assert!(matches!(
            doc.diagnostics[0].error,
            WaveError::UnrecognizedBlockType { block_type: 77 }
        ));
        assert!(matches!(doc.diagnostics[1].location, Location::Block { .. }));
        assert_eq!(changes(&doc, "top.clk").len(), 5);
    }

    #[test]
    fn test_huge_hierarchy_length() {
        let mut file = clock_file();
        // Read before the real hierarchy, which still decodes afterwards.
        let mut content = (1u64 << 62).to_be_bytes().to_vec();
        content.extend(lz4_flex::block::compress(b"\xFE\0top\0\0"));
        file.extra.push((BlockType::FST_BL_HIER_LZ4 as u8, content));
        let doc = load(file.encode());

        assert_eq!(doc.diagnostics.len(), 1, "{:?}", doc.diagnostics);
        assert!(matches!(
            doc.diagnostics[0].error,
            WaveError::Decompression(_)
        ));
        assert_eq!(doc.store.netlist().signal_count(), 3);
        assert_eq!(changes(&doc, "top.clk").len(), 5);
    }

    #[test]
    fn test_huge_wave_lengths() {
        let data = [0x1F, 0x41, 0x42, 0x43];
        for packtype in [b'F', b'4', b'Z'] {
            assert!(matches!(
                unpack_wave(&data, 1 << 62, packtype),
                Err(WaveError::Decompression(_))
            ));
        }
        assert!(matches!(
            inflate(&data, u64::MAX),
            Err(WaveError::Decompression(_))
        ));
    }

    #[test]
    fn test_alias_to_undeclared_handle() {
        let mut file = clock_file();
        file.hierarchy.push(Hier::Var("ghost", 16, 1, 1 << 40));
        let doc = load(file.encode());

        assert_eq!(doc.diagnostics.len(), 1, "{:?}", doc.diagnostics);
        assert!(matches!(doc.diagnostics[0].error, WaveError::Invalid(_)));
        // Everything before the bad alias is kept.
        assert_eq!(doc.store.netlist().signal_count(), 3);
        assert_eq!(changes(&doc, "top.data").len(), 3);

        let mut raw = vec![16, 0];
        raw.extend(b"ghost\0");
        push_varint(&mut raw, 1);
        push_varint(&mut raw, 1 << 40);
        let mut entries = Vec::new();
        assert!(decode_hierarchy(&raw, &mut entries).is_err());
        assert!(entries.is_empty());
    }

    #[test]
    fn test_blackout_overflow() {
        let mut file = clock_file();
        let mut content = Vec::new();
        push_varint(&mut content, 2);
        content.push(1);
        push_varint(&mut content, u64::MAX);
        content.push(0);
        push_varint(&mut content, u64::MAX);
        file.extra.push((BlockType::FST_BL_BLACKOUT as u8, content));
        let doc = load(file.encode());

        assert_eq!(doc.diagnostics.len(), 1, "{:?}", doc.diagnostics);
        assert!(matches!(doc.diagnostics[0].error, WaveError::Invalid(_)));
        assert!(doc.store.metadata().dump_activity.is_empty());
        assert_eq!(changes(&doc, "top.clk").len(), 5);
    }

    #[test]
    fn test_time_and_offset_overflow() {
        let mut times = Vec::new();
        push_varint(&mut times, u64::MAX);
        push_varint(&mut times, 1);
        assert!(matches!(
            decode_times(&times, times.len() as u64, 2),
            Err(WaveError::Invalid(_))
        ));
        // One change at the very last time is fine.
        assert_eq!(
            decode_times(&times[..10], 10, 1).unwrap(),
            vec![u64::MAX]
        );

        // Each offset delta is just under 2^62, so the fifth overflows.
        let mut table = Vec::new();
        for _ in 0..5 {
            push_svarint(&mut table, i64::MAX);
        }
        assert!(matches!(
            decode_position_table(&table, 5, 100),
            Err(WaveError::Invalid(_))
        ));
    }

    #[test]
    fn test_old_position_table() {
        let mut file = clock_file();
        file.blocks[0].block_type = BlockType::FST_BL_VCDATA_DYN_ALIAS;
        let doc = load(file.encode());
        assert_eq!(doc.diagnostics.len(), 1);
        assert!(matches!(
            doc.diagnostics[0].error,
            WaveError::UnsupportedEncoding(_)
        ));
        // The initial values are still there.
        assert_eq!(
            changes(&doc, "top.data"),
            vec![(0, "00000000".into()), (30, "00000000".into())]
        );
    }

    #[test]
    fn test_truncated_file() {
        let mut bytes = clock_file().encode();
        bytes.truncate(bytes.len() - 10);
        let doc = load(bytes);
        // The hierarchy was the last block so the netlist is lost too, but
        // the load itself succeeds.
        assert!(doc
            .diagnostics
            .iter()
            .any(|d| matches!(d.error, WaveError::TruncatedFile { .. })));
        assert!(doc.store.netlist().is_empty());
    }

    #[test]
    fn test_not_fst() {
        let mut source = MemorySource::new(b"$date today $end".to_vec());
        assert!(FstReader::open(&mut source).is_err());

        let mut bytes = clock_file().encode();
        // Break the endianness marker.
        bytes[BLOCK_HEADER_LEN + 16] ^= 0xFF;
        let mut source = MemorySource::new(bytes);
        assert!(FstReader::open(&mut source).is_err());

        let mut source = MemorySource::new(vec![0u8; 4]);
        assert!(FstReader::open(&mut source).is_err());
    }

    #[test]
    fn test_gzip_wrapper() {
        let plain = load(clock_file().encode());
        let wrapped = load(wrap(&clock_file().encode()));
        assert_eq!(changes(&plain, "top.clk"), changes(&wrapped, "top.clk"));
        assert_eq!(wrapped.store.netlist().len(), plain.store.netlist().len());
    }

    #[test]
    fn test_skip_block_reported() {
        let mut bytes = clock_file().encode();
        push_block(&mut bytes, BlockType::FST_BL_SKIP as u8, &[0; 4]);
        let doc = load(bytes);
        assert_eq!(doc.diagnostics.len(), 1);
        assert_eq!(changes(&doc, "top.clk").len(), 5);
    }

    #[test]
    fn test_position_table() {
        let mut table = Vec::new();
        // Signal 0 at offset 0, 1 aliases 0, 2 and 3 have no data, 4 at
        // offset 6, 5 repeats the previous alias.
        push_svarint(&mut table, (1 << 1) | 1);
        push_svarint(&mut table, (-1 << 1) | 1);
        push_varint(&mut table, 2 << 1);
        push_svarint(&mut table, (6 << 1) | 1);
        push_svarint(&mut table, 1);
        let ranges = decode_position_table(&table, 6, 10).unwrap();
        assert_eq!(ranges, vec![0..6, 0..6, 0..0, 0..0, 6..10, 0..6]);

        // Aliasing forwards is an error.
        let mut table = Vec::new();
        push_svarint(&mut table, (-3 << 1) | 1);
        assert!(decode_position_table(&table, 1, 10).is_err());

        // Running out of table.
        assert!(decode_position_table(&[], 1, 10).is_err());
    }

    #[test]
    fn test_timescale_from_exponent() {
        assert_eq!(timescale_from_exponent(0), (1, "s".to_owned()));
        assert_eq!(timescale_from_exponent(-9), (1, "ns".to_owned()));
        assert_eq!(timescale_from_exponent(-8), (10, "ns".to_owned()));
        assert_eq!(timescale_from_exponent(-10), (100, "ps".to_owned()));
        assert_eq!(timescale_from_exponent(-15), (1, "fs".to_owned()));
        assert_eq!(timescale_from_exponent(2), (100, "s".to_owned()));
    }

    #[test]
    fn test_packed_bits() {
        assert_eq!(value_from_packed_bits(&[0b1010_0000], 3).as_str(), "101");
        assert_eq!(
            value_from_packed_bits(&[0xFF, 0x80], 9).as_str(),
            "111111111"
        );
    }
}

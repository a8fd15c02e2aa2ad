//! Value Change Dump reader.
//!
//! The file is streamed in fixed size chunks and split into lines; nothing
//! needs the whole file in memory. The header pass stops at the first
//! timestamp or `$dumpvars` and records its byte offset so the value pass
//! can start reading exactly there.

use std::{
    collections::{HashMap, HashSet},
    ops::ControlFlow,
};

use anyhow::{bail, Result};
use log::{debug, info, trace};
use typed_index_collections::TiVec;

use crate::{
    error::{check_offset, Diagnostic, Location, WaveError, WaveResult},
    netlist::{NetlistBuilder, NodeId, SignalEncoding, SignalInfo, SignalRef},
    options::{FileFormat, LoadOptions},
    source::FileSource,
    store::{Metadata, Push, TransitionSequence},
    trace::{SignalDecl, TraceHeader, TraceWaves},
    value::{NumericFormat, Value},
};

/// Call `f` with the byte offset and contents of every line from `start`,
/// reading `chunk_size` bytes at a time. Line endings are stripped. A line
/// split between two reads is carried over and completed by the next one.
pub fn for_each_line(
    source: &mut dyn FileSource,
    start: u64,
    chunk_size: usize,
    mut f: impl FnMut(u64, &[u8]) -> ControlFlow<()>,
) -> WaveResult<()> {
    let chunk_size = chunk_size.max(1);
    let mut read_offset = start;
    let mut carry: Vec<u8> = Vec::new();
    let mut carry_offset = start;
    // Offset just past the last line handed to `f`.
    let mut cursor = start;

    loop {
        let chunk = source.read(read_offset, chunk_size)?;
        if chunk.is_empty() {
            break;
        }
        let chunk_offset = read_offset;
        read_offset += chunk.len() as u64;

        let mut line_start = 0;
        while let Some(len) = chunk[line_start..].iter().position(|b| *b == b'\n') {
            let end = line_start + len;
            let flow = if carry.is_empty() {
                f(chunk_offset + line_start as u64, trim_cr(&chunk[line_start..end]))
            } else {
                carry.extend_from_slice(&chunk[line_start..end]);
                let flow = f(carry_offset, trim_cr(&carry));
                carry.clear();
                flow
            };
            line_start = end + 1;
            cursor = chunk_offset + line_start as u64;
            if flow.is_break() {
                return Ok(());
            }
        }
        if line_start < chunk.len() {
            if carry.is_empty() {
                carry_offset = chunk_offset + line_start as u64;
            }
            carry.extend_from_slice(&chunk[line_start..]);
        }
    }

    if !carry.is_empty() {
        cursor = carry_offset + carry.len() as u64;
        let _ = f(carry_offset, trim_cr(&carry));
    }
    check_offset(cursor, read_offset)
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    None,
    InScope,
    InTimescale,
}

struct HeaderParser {
    mode: Mode,
    builder: NetlistBuilder,
    signals: TiVec<SignalRef, SignalDecl>,
    ids: HashMap<String, SignalRef>,
    /// The `$command` being collected and its arguments so far. Commands
    /// can span lines.
    command: Option<(String, Vec<String>)>,
    /// Scope and name of the last `$var`, to fold per-bit redeclarations.
    last_var: Option<(Option<NodeId>, String)>,
    metadata: Metadata,
    header_end: Option<u64>,
    diagnostics: Vec<Diagnostic>,
}

impl HeaderParser {
    fn new(file_size: u64) -> Self {
        Self {
            mode: Mode::None,
            builder: NetlistBuilder::new(),
            signals: TiVec::new(),
            ids: HashMap::new(),
            command: None,
            last_var: None,
            metadata: Metadata {
                format: FileFormat::Vcd,
                file_size,
                time_scale: 1,
                time_unit: "s".to_owned(),
                ..Default::default()
            },
            header_end: None,
            diagnostics: Vec::new(),
        }
    }

    fn line(&mut self, offset: u64, line: &[u8]) -> ControlFlow<()> {
        let text = String::from_utf8_lossy(line);
        if self.command.is_none() {
            let start = text.trim_start();
            if start.starts_with('#') || start.starts_with("$dumpvars") {
                self.header_end = Some(offset);
                return ControlFlow::Break(());
            }
        }

        for token in text.split_ascii_whitespace() {
            if token == "$end" {
                if let Some((command, args)) = self.command.take() {
                    self.dispatch(&command, args, offset);
                }
                continue;
            }
            if let Some((_, args)) = &mut self.command {
                args.push(token.to_owned());
                continue;
            }
            if token.starts_with('$') {
                if token == "$timescale" {
                    self.mode = Mode::InTimescale;
                }
                self.command = Some((token.to_owned(), Vec::new()));
            } else {
                trace!("Ignoring stray header token {token:?}");
            }
        }
        ControlFlow::Continue(())
    }

    fn report(&mut self, offset: u64, error: WaveError) {
        self.diagnostics
            .push(Diagnostic::new(Location::Line { offset }, error));
    }

    fn dispatch(&mut self, command: &str, args: Vec<String>, offset: u64) {
        match command {
            "$scope" => {
                let (scope_type, name) = match args.as_slice() {
                    [scope_type, name, ..] => (scope_type.clone(), name.clone()),
                    [name] => ("module".to_owned(), name.clone()),
                    [] => {
                        self.report(offset, WaveError::Invalid("$scope without a name".into()));
                        return;
                    }
                };
                self.builder.push_scope(name, scope_type, String::new());
            }
            "$upscope" => {
                if self.builder.pop_scope().is_none() {
                    self.report(
                        offset,
                        WaveError::Invalid("$upscope without a matching $scope".into()),
                    );
                }
            }
            "$var" => self.declare_var(&args, offset),
            "$timescale" => match parse_timescale(&args.concat()) {
                Some((scale, unit)) => {
                    self.metadata.time_scale = scale;
                    self.metadata.time_unit = unit;
                }
                None => self.report(
                    offset,
                    WaveError::Invalid(format!("bad timescale {:?}", args.join(" "))),
                ),
            },
            "$date" => self.metadata.date = args.join(" "),
            "$version" => self.metadata.version = args.join(" "),
            "$comment" | "$enddefinitions" => {}
            other => trace!("Skipping header command {other}"),
        }
        self.mode = if self.builder.depth() > 0 {
            Mode::InScope
        } else {
            Mode::None
        };
    }

    fn declare_var(&mut self, args: &[String], offset: u64) {
        if self.mode != Mode::InScope {
            self.report(offset, WaveError::Invalid("$var outside of a scope".into()));
            return;
        }
        let [var_type, width, id, name, bit_select @ ..] = args else {
            self.report(
                offset,
                WaveError::Invalid(format!("malformed $var {:?}", args.join(" "))),
            );
            return;
        };
        let width = match width.parse::<u32>() {
            Ok(w) if w > 0 => w,
            _ => {
                self.report(offset, WaveError::Invalid(format!("bad $var width {width:?}")));
                1
            }
        };
        let encoding = match var_type.as_str() {
            "real" | "realtime" | "shortreal" => SignalEncoding::Real,
            "string" => SignalEncoding::String,
            _ => SignalEncoding::Bits,
        };

        let signal = match self.ids.get(id) {
            Some(signal) => *signal,
            None => {
                let signal = self.signals.push_and_get_key(SignalDecl {
                    signal_id: id.clone(),
                    width,
                    encoding,
                });
                self.ids.insert(id.clone(), signal);
                signal
            }
        };

        // Some writers declare a vector once per bit under the same name.
        let scope = self.builder.current_scope();
        let repeated = matches!(&self.last_var, Some((s, n)) if *s == scope && n == name);
        self.last_var = Some((scope, name.clone()));
        if repeated {
            debug!("Folding repeated declaration of {name} ({id})");
            return;
        }

        self.builder.add_signal(
            format!("{name}{}", bit_select.concat()),
            SignalInfo {
                width,
                signal_id: id.clone(),
                signal,
                var_type: var_type.clone(),
                encoding,
                numeric_format: NumericFormat::default(),
            },
        );
    }
}

/// Parse `1ns`, `10 ps` etc.
fn parse_timescale(text: &str) -> Option<(u32, String)> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let scale = text[..split].parse().ok()?;
    let unit = text[split..].trim();
    matches!(unit, "s" | "ms" | "us" | "ns" | "ps" | "fs").then(|| (scale, unit.to_owned()))
}

/// Read the declarations up to the first value change.
pub fn parse_header(source: &mut dyn FileSource, options: &LoadOptions) -> Result<TraceHeader> {
    let mut parser = HeaderParser::new(source.size());
    for_each_line(source, 0, options.chunk_size, |offset, line| {
        parser.line(offset, line)
    })?;

    if let Some((command, _)) = parser.command.take() {
        parser.report(
            parser.header_end.unwrap_or(0),
            WaveError::Invalid(format!("{command} not terminated by $end")),
        );
    }

    let netlist = parser.builder.finish();
    if netlist.is_empty() && parser.header_end.is_none() {
        bail!("No VCD declarations found");
    }

    let mut metadata = parser.metadata;
    metadata.waveforms_start_offset = parser.header_end.unwrap_or(metadata.file_size);
    metadata.module_count = netlist.scope_count();
    metadata.signal_count = netlist.signal_count();

    info!(
        "VCD header: {} scopes, {} signals, {} distinct ids, values from byte {}",
        metadata.module_count,
        metadata.signal_count,
        parser.signals.len(),
        metadata.waveforms_start_offset
    );

    Ok(TraceHeader {
        netlist,
        metadata,
        signals: parser.signals,
        diagnostics: parser.diagnostics,
    })
}

#[derive(Copy, Clone)]
enum ValueKind {
    Scalar,
    Vector,
    Text,
}

struct ValueParser<'h> {
    ids: HashMap<&'h str, SignalRef>,
    signals: &'h TiVec<SignalRef, SignalDecl>,
    sequences: TiVec<SignalRef, TransitionSequence>,
    current: u64,
    latest_change: Option<u64>,
    in_comment: bool,
    unknown_ids: HashSet<String>,
    dump_activity: Vec<(u64, bool)>,
    diagnostics: Vec<Diagnostic>,
}

impl<'h> ValueParser<'h> {
    fn new(header: &'h TraceHeader) -> Self {
        Self {
            ids: header
                .signals
                .iter_enumerated()
                .map(|(signal, decl)| (decl.signal_id.as_str(), signal))
                .collect(),
            signals: &header.signals,
            sequences: header
                .signals
                .iter()
                .map(|decl| TransitionSequence::new(decl.width))
                .collect(),
            current: 0,
            latest_change: None,
            in_comment: false,
            unknown_ids: HashSet::new(),
            dump_activity: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn report(&mut self, offset: u64, error: WaveError) {
        self.diagnostics
            .push(Diagnostic::new(Location::Line { offset }, error));
    }

    fn line(&mut self, offset: u64, line: &[u8]) -> ControlFlow<()> {
        let text = String::from_utf8_lossy(line);
        let mut tokens = text.split_ascii_whitespace();
        while let Some(token) = tokens.next() {
            if self.in_comment {
                self.in_comment = token != "$end";
                continue;
            }
            match token.as_bytes()[0] {
                b'#' => match token[1..].parse::<u64>() {
                    Ok(time) => {
                        if time < self.current {
                            self.report(
                                offset,
                                WaveError::Invalid(format!(
                                    "timestamp #{time} goes back from #{}",
                                    self.current
                                )),
                            );
                        }
                        self.current = time;
                    }
                    Err(_) => self.report(
                        offset,
                        WaveError::Invalid(format!("bad timestamp {token:?}")),
                    ),
                },
                b'$' => match token {
                    "$comment" => self.in_comment = true,
                    "$dumpoff" => self.dump_activity.push((self.current, false)),
                    "$dumpon" => self.dump_activity.push((self.current, true)),
                    _ => {}
                },
                b'b' | b'B' | b'r' | b'R' | b's' | b'S' => {
                    let kind = if matches!(token.as_bytes()[0], b'b' | b'B') {
                        ValueKind::Vector
                    } else {
                        ValueKind::Text
                    };
                    match tokens.next() {
                        Some(id) => self.record(offset, id, &token[1..], kind),
                        None => self.report(
                            offset,
                            WaveError::Invalid(format!("value {token:?} has no identifier")),
                        ),
                    }
                }
                c if is_scalar(c) => self.record(offset, &token[1..], &token[..1], ValueKind::Scalar),
                _ => self.report(
                    offset,
                    WaveError::Invalid(format!("unexpected token {token:?}")),
                ),
            }
        }
        ControlFlow::Continue(())
    }

    fn record(&mut self, offset: u64, id: &str, text: &str, kind: ValueKind) {
        let Some(&signal) = self.ids.get(id) else {
            if self.unknown_ids.insert(id.to_owned()) {
                self.report(
                    offset,
                    WaveError::Invalid(format!("value change for undeclared id {id:?}")),
                );
            }
            return;
        };
        let value = match kind {
            ValueKind::Scalar => Value::from(text),
            ValueKind::Vector => extend_bits(text, self.signals[signal].width),
            ValueKind::Text => Value::from_text(text),
        };
        match self.sequences[signal].push(self.current, value) {
            Push::Appended | Push::Replaced => {
                self.latest_change = Some(self.current);
            }
            Push::Unchanged => {}
            Push::OutOfOrder => self.report(
                offset,
                WaveError::Invalid(format!("change for {id:?} is earlier than its last change")),
            ),
        }
    }
}

fn is_scalar(c: u8) -> bool {
    matches!(
        c.to_ascii_lowercase(),
        b'0' | b'1' | b'x' | b'z' | b'u' | b'w' | b'l' | b'h' | b'-'
    )
}

/// Vectors may be written with fewer bits than declared. They are extended
/// to the left with 0, unless the leftmost bit is x or z in which case that
/// is repeated.
fn extend_bits(bits: &str, width: u32) -> Value {
    let bits = bits.as_bytes();
    let width = width as usize;
    if bits.is_empty() || bits.len() >= width {
        return Value::from_bytes(bits);
    }
    let pad = match bits[0].to_ascii_lowercase() {
        b'x' => b'x',
        b'z' => b'z',
        _ => b'0',
    };
    let extended: Vec<u8> = std::iter::repeat(pad)
        .take(width - bits.len())
        .chain(bits.iter().copied())
        .collect();
    Value::from_bytes(&extended)
}

/// Read the value changes, starting where the header pass stopped.
pub fn parse_values(
    source: &mut dyn FileSource,
    header: &TraceHeader,
    options: &LoadOptions,
) -> Result<TraceWaves> {
    let mut parser = ValueParser::new(header);
    for_each_line(
        source,
        header.metadata.waveforms_start_offset,
        options.chunk_size,
        |offset, line| parser.line(offset, line),
    )?;

    // The timeline has to extend past the final change for it to be visible.
    let time_end = match parser.latest_change {
        Some(t) if t == parser.current => t + 1,
        _ => parser.current,
    };
    let mut sequences = parser.sequences;
    for sequence in sequences.iter_mut() {
        sequence.close(time_end);
    }

    info!(
        "VCD values: {} transitions up to time {time_end}",
        sequences.iter().map(|s| s.len()).sum::<usize>()
    );

    Ok(TraceWaves {
        sequences,
        time_end,
        dump_activity: parser.dump_activity,
        diagnostics: parser.diagnostics,
    })
}

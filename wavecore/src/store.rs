//! The waveform store: netlist, per-signal transition sequences and the
//! chunk index that makes time range lookups O(1).
//!
//! The timeline is split into chunks of `chunk_time` simulation time units.
//! For every sequence, `chunk_start[i]` is the index of the first transition
//! at or after the start of chunk `i`, so all the transitions in a range of
//! chunks are a single slice.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, VecDeque},
    ops::Range,
};

use log::{debug, info, warn};
use typed_index_collections::TiVec;

use crate::{
    netlist::{Netlist, SignalRef},
    options::FileFormat,
    value::Value,
};

/// Number of consecutive events in the rolling window used to pick the
/// chunk size.
pub const CHUNK_WINDOW: usize = 128;

/// Width in pixels that one chunk gets at the default zoom level.
pub const DEFAULT_CHUNK_PIXELS: f64 = 512.0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub time: u64,
    pub value: Value,
}

impl Transition {
    pub fn new(time: u64, value: Value) -> Self {
        Self { time, value }
    }
}

/// All the value changes of one physical signal.
///
/// Index 0 is always the value at time 0 (all `x` if the signal was not
/// driven then). After [`close`](Self::close) the last entry is at the end
/// of simulation time.
#[derive(Clone, Debug, Default)]
pub struct TransitionSequence {
    width: u32,
    transitions: Vec<Transition>,
    chunk_start: Vec<usize>,
    synthetic_end: bool,
}

/// The outcome of [`TransitionSequence::push`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Push {
    Appended,
    /// Same timestamp as the previous change; its value was replaced.
    Replaced,
    /// Value was the same as the one already held.
    Unchanged,
    /// Earlier than the previous change. Nothing was recorded.
    OutOfOrder,
}

impl TransitionSequence {
    pub fn new(width: u32) -> Self {
        Self {
            width: width.max(1),
            ..Default::default()
        }
    }

    /// Rebuild a sequence that was closed elsewhere, e.g. after a chunked
    /// transfer. The chunk index is built when it is added to a store.
    pub fn from_closed(width: u32, transitions: Vec<Transition>, synthetic_end: bool) -> Self {
        Self {
            width: width.max(1),
            transitions,
            chunk_start: Vec::new(),
            synthetic_end,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// True if the last entry only holds the final value to the end time.
    pub fn has_synthetic_end(&self) -> bool {
        self.synthetic_end
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn chunk_start(&self) -> &[usize] {
        &self.chunk_start
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Record `value` from `time` onwards.
    pub fn push(&mut self, time: u64, value: Value) -> Push {
        let Some(last) = self.transitions.last_mut() else {
            if time > 0 {
                self.transitions
                    .push(Transition::new(0, Value::undefined(self.width)));
                self.transitions.push(Transition::new(time, value));
            } else {
                self.transitions.push(Transition::new(0, value));
            }
            return Push::Appended;
        };
        if time < last.time {
            return Push::OutOfOrder;
        }
        if time == last.time {
            last.value = value;
            // A replaced value may now repeat the one before it.
            let n = self.transitions.len();
            if n >= 2 && self.transitions[n - 2].value == self.transitions[n - 1].value {
                self.transitions.pop();
            }
            return Push::Replaced;
        }
        if last.value == value {
            return Push::Unchanged;
        }
        self.transitions.push(Transition::new(time, value));
        Push::Appended
    }

    /// Make the sequence span `[0, time_end]` by holding the last value until
    /// `time_end`.
    pub fn close(&mut self, time_end: u64) {
        match self.transitions.last() {
            None => {
                self.transitions
                    .push(Transition::new(0, Value::undefined(self.width)));
                if time_end > 0 {
                    self.transitions
                        .push(Transition::new(time_end, Value::undefined(self.width)));
                    self.synthetic_end = true;
                }
            }
            Some(last) if last.time < time_end => {
                let held = last.value.clone();
                self.transitions.push(Transition::new(time_end, held));
                self.synthetic_end = true;
            }
            Some(_) => {}
        }
    }

    /// Transitions that really happened: excludes the initial value and a
    /// synthesized end entry.
    pub fn events(&self) -> &[Transition] {
        let end = if self.synthetic_end {
            self.transitions.len() - 1
        } else {
            self.transitions.len()
        };
        self.transitions.get(1..end).unwrap_or(&[])
    }

    pub fn build_chunk_index(&mut self, chunking: &ChunkMetadata) {
        self.chunk_start = build_chunk_index(&self.transitions, chunking);
    }
}

/// Single forward scan producing the index of the first transition in each
/// chunk, plus a final sentinel equal to the sequence length. Index 0 is the
/// initial value so chunk 0 always starts at 1.
pub fn build_chunk_index(transitions: &[Transition], chunking: &ChunkMetadata) -> Vec<usize> {
    let len = transitions.len();
    let mut starts = Vec::with_capacity(chunking.chunk_count + 1);
    let mut index = len.min(1);
    for chunk in 0..chunking.chunk_count {
        let boundary = chunking.chunk_boundary(chunk);
        while index < len && (transitions[index].time as f64) < boundary {
            index += 1;
        }
        starts.push(index);
    }
    starts.push(len);
    starts
}

/// The derived values a viewer needs to set up a viewport.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkMetadata {
    /// Duration of one chunk in simulation time units.
    pub chunk_time: f64,
    pub chunk_count: usize,
    pub time_end: u64,
    /// Pixels per time unit.
    pub default_zoom: f64,
    pub time_scale: u32,
    pub time_unit: String,
}

impl ChunkMetadata {
    /// Time at which chunk `chunk` starts.
    pub fn chunk_boundary(&self, chunk: usize) -> f64 {
        chunk as f64 * self.chunk_time
    }

    /// The chunk containing `time`, clamped to the last chunk.
    pub fn chunk_of(&self, time: u64) -> usize {
        let last = self.chunk_count.saturating_sub(1);
        let t = time as f64;
        let mut chunk = ((t / self.chunk_time).floor() as usize).min(last);
        // Guard against the division rounding across a boundary.
        while chunk > 0 && self.chunk_boundary(chunk) > t {
            chunk -= 1;
        }
        while chunk < last && self.chunk_boundary(chunk + 1) <= t {
            chunk += 1;
        }
        chunk
    }
}

/// Pick the chunk duration from the densest burst of activity.
///
/// The changes of all signals are merged into one time-ordered stream and
/// the shortest time spanned by any `CHUNK_WINDOW` consecutive events is
/// found. The average step in that window is rounded to a power of ten so
/// zoom steps stay regular, and a chunk holds `CHUNK_WINDOW` such steps.
pub fn derive_chunk_time<'a>(
    sequences: impl IntoIterator<Item = &'a TransitionSequence>,
    time_end: u64,
    time_scale: u32,
    time_unit: &str,
) -> ChunkMetadata {
    let mut window: VecDeque<u64> = VecDeque::with_capacity(CHUNK_WINDOW);
    let mut min_elapsed: Option<u64> = None;
    let mut first = None;
    let mut last = None;
    let mut total = 0usize;

    for time in MergedTimes::new(sequences.into_iter().map(|s| s.events())) {
        total += 1;
        first.get_or_insert(time);
        last = Some(time);
        window.push_back(time);
        if window.len() == CHUNK_WINDOW {
            let elapsed = time - window[0];
            min_elapsed = Some(min_elapsed.map_or(elapsed, |m| m.min(elapsed)));
            window.pop_front();
        }
    }

    let span = if total <= CHUNK_WINDOW {
        match (first, last) {
            (Some(f), Some(l)) if l > f => l - f,
            _ => time_end,
        }
    } else {
        min_elapsed.unwrap_or(time_end)
    };
    // A burst of simultaneous events has no duration; treat it as one time
    // unit so the logarithm stays finite.
    let span = span.max(1) as f64;

    let step = 10f64.powf((span / CHUNK_WINDOW as f64).log10().round());
    let chunk_time = step * CHUNK_WINDOW as f64;
    let chunk_count = ((time_end as f64 / chunk_time).ceil() as usize).max(1);

    debug!("{total} events, minimum {CHUNK_WINDOW}-event span {span}, chunk time {chunk_time}");

    ChunkMetadata {
        chunk_time,
        chunk_count,
        time_end,
        default_zoom: DEFAULT_CHUNK_PIXELS / chunk_time,
        time_scale,
        time_unit: time_unit.to_owned(),
    }
}

/// K-way merge of the event times of many sequences, so the whole timeline
/// never has to be materialized and sorted.
struct MergedTimes<'a> {
    sequences: Vec<&'a [Transition]>,
    heap: BinaryHeap<Reverse<(u64, usize, usize)>>,
}

impl<'a> MergedTimes<'a> {
    fn new(sequences: impl Iterator<Item = &'a [Transition]>) -> Self {
        let sequences: Vec<_> = sequences.collect();
        let heap = sequences
            .iter()
            .enumerate()
            .filter_map(|(s, seq)| seq.first().map(|t| Reverse((t.time, s, 0))))
            .collect();
        Self { sequences, heap }
    }
}

impl Iterator for MergedTimes<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let Reverse((time, s, i)) = self.heap.pop()?;
        if let Some(next) = self.sequences[s].get(i + 1) {
            self.heap.push(Reverse((next.time, s, i + 1)));
        }
        Some(time)
    }
}

/// Per-document metadata.
#[derive(Clone, Debug, Default)]
pub struct Metadata {
    pub format: FileFormat,
    pub file_size: u64,
    pub time_scale: u32,
    pub time_unit: String,
    /// Byte offset of the first value change section.
    pub waveforms_start_offset: u64,
    pub module_count: usize,
    pub signal_count: usize,
    pub time_end: u64,
    pub date: String,
    pub version: String,
    /// Time ranges where dumping was switched off, as `(time, dumping)`.
    pub dump_activity: Vec<(u64, bool)>,
    /// Set once both bulk parses are done; frozen afterwards.
    pub chunking: Option<ChunkMetadata>,
}

/// Transitions in a range of chunks plus the context either side of it.
#[derive(Debug)]
pub struct RangeQuery<'a> {
    /// The transition in effect when the range starts.
    pub entry: &'a Transition,
    pub transitions: &'a [Transition],
    /// The first transition at or after the end of the range.
    pub exit: Option<&'a Transition>,
    /// Index of `transitions[0]` in the whole sequence.
    pub first_index: usize,
}

/// Result of [`WaveformStore::value_at_time`].
#[derive(Debug, PartialEq, Eq)]
pub struct ValueAt<'a> {
    pub value: &'a Value,
    /// When the value was set.
    pub since: u64,
    /// The value changed exactly at the requested time.
    pub changed: bool,
}

#[derive(Debug, Default)]
pub struct WaveformStore {
    metadata: Metadata,
    netlist: Netlist,
    sequences: TiVec<SignalRef, Option<TransitionSequence>>,
    ids: HashMap<String, SignalRef>,
}

impl WaveformStore {
    pub fn new(netlist: Netlist, metadata: Metadata) -> Self {
        let ids = netlist
            .signals()
            .map(|(_, _, s)| (s.signal_id.clone(), s.signal))
            .collect();
        Self {
            metadata,
            netlist,
            sequences: TiVec::new(),
            ids,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn netlist(&self) -> &Netlist {
        &self.netlist
    }

    pub fn chunking(&self) -> Option<&ChunkMetadata> {
        self.metadata.chunking.as_ref()
    }

    pub fn signal_ref(&self, signal_id: &str) -> Option<SignalRef> {
        self.ids.get(signal_id).copied()
    }

    pub fn sequence(&self, signal: SignalRef) -> Option<&TransitionSequence> {
        self.sequences.get(signal).and_then(Option::as_ref)
    }

    pub fn has_data(&self, signal: SignalRef) -> bool {
        self.sequence(signal).is_some()
    }

    pub fn loaded_signals(&self) -> impl Iterator<Item = SignalRef> + '_ {
        self.sequences
            .iter_enumerated()
            .filter(|(_, s)| s.is_some())
            .map(|(r, _)| r)
    }

    /// Add (or replace) the transitions for one signal.
    pub fn insert_sequence(&mut self, signal: SignalRef, mut sequence: TransitionSequence) {
        if let Some(chunking) = &self.metadata.chunking {
            sequence.build_chunk_index(chunking);
        }
        let index: usize = signal.into();
        if self.sequences.len() <= index {
            self.sequences.resize_with(index + 1, Default::default);
        }
        self.sequences[signal] = Some(sequence);
    }

    pub fn set_dump_activity(&mut self, dump_activity: Vec<(u64, bool)>) {
        self.metadata.dump_activity = dump_activity;
    }

    /// Freeze the chunking and index every sequence loaded so far. Returns
    /// false if the chunking was already set; changing it would invalidate
    /// every chunk index already handed out.
    pub fn set_chunking(&mut self, chunking: ChunkMetadata) -> bool {
        if self.metadata.chunking.is_some() {
            warn!("Chunking already derived; ignoring new chunk metadata");
            return false;
        }
        info!(
            "Chunk time {} ({} chunks up to {})",
            chunking.chunk_time, chunking.chunk_count, chunking.time_end
        );
        for sequence in self.sequences.iter_mut().flatten() {
            sequence.build_chunk_index(&chunking);
        }
        self.metadata.time_end = chunking.time_end;
        self.metadata.chunking = Some(chunking);
        true
    }

    /// Derive the chunking from the sequences currently loaded and freeze it.
    pub fn derive_chunking(&mut self) -> ChunkMetadata {
        if let Some(chunking) = &self.metadata.chunking {
            return chunking.clone();
        }
        let chunking = derive_chunk_time(
            self.sequences.iter().flatten(),
            self.metadata.time_end,
            self.metadata.time_scale,
            &self.metadata.time_unit,
        );
        self.set_chunking(chunking.clone());
        chunking
    }

    /// The transitions of `signal` in chunks `chunks`, with the held value
    /// entering the range and the first change after it.
    pub fn query_range(&self, signal: SignalRef, chunks: Range<usize>) -> Option<RangeQuery<'_>> {
        let sequence = self.sequence(signal)?;
        let starts = sequence.chunk_start();
        if starts.is_empty() || sequence.is_empty() {
            return None;
        }
        let last = starts.len() - 1;
        let begin = starts[chunks.start.min(last)];
        let end = starts[chunks.end.min(last)].max(begin);
        let transitions = sequence.transitions();
        Some(RangeQuery {
            entry: &transitions[begin.saturating_sub(1)],
            transitions: &transitions[begin..end],
            exit: transitions.get(end),
            first_index: begin,
        })
    }

    /// The value held by `signal` at `time`.
    pub fn value_at_time(&self, signal: SignalRef, time: u64) -> Option<ValueAt<'_>> {
        let sequence = self.sequence(signal)?;
        let transitions = sequence.transitions();
        let index = match self.chunking() {
            Some(chunking) if !sequence.chunk_start().is_empty() => {
                let chunk = chunking.chunk_of(time);
                let starts = sequence.chunk_start();
                let begin = starts[chunk];
                let end = starts[chunk + 1];
                // Everything in the chunk is at or after its start, so the
                // value in effect is either in the chunk or the one before it.
                transitions[begin..end]
                    .iter()
                    .rposition(|t| t.time <= time)
                    .map_or(begin.checked_sub(1)?, |i| begin + i)
            }
            _ => transitions.partition_point(|t| t.time <= time).checked_sub(1)?,
        };
        let transition = &transitions[index];
        Some(ValueAt {
            value: &transition.value,
            since: transition.time,
            changed: transition.time == time,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sequence(width: u32, changes: &[(u64, &str)], time_end: u64) -> TransitionSequence {
        let mut s = TransitionSequence::new(width);
        for (t, v) in changes {
            s.push(*t, Value::from(*v));
        }
        s.close(time_end);
        s
    }

    fn chunking(chunk_time: f64, time_end: u64) -> ChunkMetadata {
        ChunkMetadata {
            chunk_time,
            chunk_count: ((time_end as f64 / chunk_time).ceil() as usize).max(1),
            time_end,
            default_zoom: DEFAULT_CHUNK_PIXELS / chunk_time,
            time_scale: 1,
            time_unit: "ns".to_owned(),
        }
    }

    #[test]
    fn test_push_rules() {
        let mut s = TransitionSequence::new(2);
        assert_eq!(s.push(5, Value::from("01")), Push::Appended);
        assert_eq!(s.transitions()[0], Transition::new(0, Value::from("xx")));
        assert_eq!(s.push(5, Value::from("10")), Push::Replaced);
        assert_eq!(s.push(7, Value::from("10")), Push::Unchanged);
        assert_eq!(s.push(3, Value::from("11")), Push::OutOfOrder);
        assert_eq!(s.push(9, Value::from("11")), Push::Appended);
        s.close(20);
        let times: Vec<u64> = s.transitions().iter().map(|t| t.time).collect();
        assert_eq!(times, [0, 5, 9, 20]);
        assert_eq!(s.transitions()[3].value.as_str(), "11");
        assert_eq!(s.events().len(), 2);
    }

    #[test]
    fn test_close_undriven() {
        let mut s = TransitionSequence::new(4);
        s.close(100);
        assert_eq!(s.len(), 2);
        assert_eq!(s.transitions()[1], Transition::new(100, Value::from("xxxx")));
        assert!(s.events().is_empty());
    }

    #[test]
    fn test_chunk_index_properties() {
        let s = sequence(
            1,
            &[(0, "0"), (3, "1"), (10, "0"), (11, "1"), (25, "0"), (39, "1")],
            47,
        );
        let c = chunking(10.0, 47);
        let starts = build_chunk_index(s.transitions(), &c);
        assert_eq!(starts.len(), c.chunk_count + 1);
        assert_eq!(starts[0], 1);
        assert_eq!(*starts.last().unwrap(), s.len());
        for w in starts.windows(2) {
            assert!(w[0] <= w[1]);
        }
        for (i, &start) in starts.iter().enumerate().take(c.chunk_count).skip(1) {
            let boundary = c.chunk_boundary(i);
            if let Some(t) = s.transitions().get(start) {
                assert!(t.time as f64 >= boundary);
            }
            assert!((s.transitions()[start - 1].time as f64) < boundary);
        }
        assert_eq!(starts, vec![1, 2, 4, 5, 6, 7]);
    }

    #[test]
    fn test_chunk_time_small_trace() {
        // Fewer than 128 events: the whole span is used.
        let s = sequence(1, &[(0, "0"), (100, "1"), (1380, "0")], 2000);
        let c = derive_chunk_time([&s], 2000, 1, "ns");
        // 1280 / 128 = 10 => step 10.
        assert_eq!(c.chunk_time, 1280.0);
        assert_eq!(c.chunk_count, 2);
        assert_eq!(c.default_zoom, 512.0 / 1280.0);
    }

    #[test]
    fn test_chunk_time_from_densest_window() {
        // 16 signals each toggling at 1..=8 puts 128 events within 7 time
        // units; a 17th signal adds 72 sparse events.
        let mut sequences = Vec::new();
        for _ in 0..16 {
            let changes: Vec<(u64, String)> = (1..=8)
                .map(|t| (t, if t % 2 == 0 { "0" } else { "1" }.to_owned()))
                .collect();
            let refs: Vec<(u64, &str)> = changes.iter().map(|(t, v)| (*t, v.as_str())).collect();
            sequences.push(sequence(1, &refs, 7300));
        }
        let sparse: Vec<(u64, String)> = (1..=72)
            .map(|i| (i * 100, if i % 2 == 0 { "0" } else { "1" }.to_owned()))
            .collect();
        let refs: Vec<(u64, &str)> = sparse.iter().map(|(t, v)| (*t, v.as_str())).collect();
        sequences.push(sequence(1, &refs, 7300));

        let total: usize = sequences.iter().map(|s| s.events().len()).sum();
        assert_eq!(total, 200);

        let c = derive_chunk_time(&sequences, 7300, 1, "ns");
        let expected = 10f64.powf((7.0f64 / 128.0).log10().round()) * 128.0;
        assert_eq!(c.chunk_time, expected);
        assert!((c.chunk_time - 12.8).abs() < 1e-9);
        assert_eq!(c.chunk_count, (7300.0 / expected).ceil() as usize);
        assert_eq!(c.chunk_count, 571);
    }

    #[test]
    fn test_query_range_context() {
        let s = sequence(1, &[(0, "0"), (5, "1"), (15, "0"), (32, "1")], 40);
        let mut store = WaveformStore::default();
        store.insert_sequence(SignalRef(0), s);
        assert!(store.set_chunking(chunking(10.0, 40)));
        assert!(!store.set_chunking(chunking(20.0, 40)));

        let q = store.query_range(SignalRef(0), 2..3).unwrap();
        assert_eq!(q.entry, &Transition::new(15, Value::from("0")));
        assert!(q.transitions.is_empty());
        assert_eq!(q.exit, Some(&Transition::new(32, Value::from("1"))));

        let q = store.query_range(SignalRef(0), 0..2).unwrap();
        assert_eq!(q.entry.time, 0);
        assert_eq!(q.transitions.len(), 2);
        assert_eq!(q.first_index, 1);

        let q = store.query_range(SignalRef(0), 3..4).unwrap();
        assert_eq!(q.transitions.len(), 2);
        assert!(q.exit.is_none());
        assert!(store.query_range(SignalRef(1), 0..1).is_none());
    }

    #[test]
    fn test_value_at_time() {
        let s = sequence(1, &[(0, "0"), (5, "1"), (15, "0"), (32, "1")], 40);
        let mut store = WaveformStore::default();
        store.insert_sequence(SignalRef(0), s);
        // Works before chunking too.
        assert_eq!(store.value_at_time(SignalRef(0), 6).unwrap().value.as_str(), "1");
        store.set_chunking(chunking(10.0, 40));

        let v = store.value_at_time(SignalRef(0), 15).unwrap();
        assert_eq!((v.value.as_str(), v.since, v.changed), ("0", 15, true));
        let v = store.value_at_time(SignalRef(0), 20).unwrap();
        assert_eq!((v.value.as_str(), v.since, v.changed), ("0", 15, false));
        let v = store.value_at_time(SignalRef(0), 31).unwrap();
        assert_eq!(v.since, 15);
        let v = store.value_at_time(SignalRef(0), 1000).unwrap();
        assert_eq!((v.value.as_str(), v.since), ("1", 40));
        for t in 0..45 {
            let by_index = store.value_at_time(SignalRef(0), t).unwrap();
            let s = store.sequence(SignalRef(0)).unwrap().transitions();
            let i = s.partition_point(|x| x.time <= t) - 1;
            assert_eq!(by_index.since, s[i].time, "time {t}");
        }
    }
}

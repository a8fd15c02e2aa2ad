//! The set of rendered columns covering the viewport.
//!
//! Time is split into chunks by the store; the cache groups
//! `chunks_in_column` of them into a column, the unit that is rendered and
//! evicted. Only the columns in the window (the visible ones plus a
//! prefetch margin) are kept.
//!
//! A column appears with just its ruler (`ShallowPending`), its rows are
//! drawn by a cooperative render task (`Rendering`), and it is `Ready` once
//! that finishes. A column that leaves the window mid render is marked
//! `AbortRequested` and dropped when the task next yields. Nothing is freed
//! while any render is in flight; the `Discarded` entries are collected
//! once the last one finishes.

use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Range,
};

use log::{debug, trace};
use wavecore::{ChunkMetadata, SignalRef, Value, WaveformStore};

use crate::{
    config::ViewportConfig,
    render::{ChunkRenderer, ColumnSpan, Shape, WaveRenderer},
    scheduler::{render_ruler_now, CancellationToken, Completion, Outcome, Scheduler, TaskId},
    session::{DisplayedSignal, ViewSession},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryState {
    /// The ruler is drawn but the waves are not.
    ShallowPending,
    Rendering,
    Ready,
    /// Left the window while rendering.
    AbortRequested,
    Discarded,
}

#[derive(Debug, Clone, PartialEq)]
struct Row {
    signal: DisplayedSignal,
    shapes: Vec<Shape>,
}

#[derive(Debug)]
struct CacheEntry {
    span: ColumnSpan,
    state: EntryState,
    ruler: Vec<Shape>,
    rows: Vec<Row>,
    task: Option<(TaskId, CancellationToken)>,
    /// Rows the current task is drawing.
    pending: BTreeSet<usize>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Render tasks started.
    pub renders: usize,
    /// Signal rows drawn by completed tasks.
    pub rows_rendered: usize,
    pub aborted: usize,
    pub discarded: usize,
}

pub struct ViewportCache<R: ChunkRenderer = WaveRenderer> {
    config: ViewportConfig,
    chunking: ChunkMetadata,
    renderer: R,
    zoom: f64,
    chunks_in_column: usize,
    /// Column range currently materialized.
    window: Range<usize>,
    entries: BTreeMap<usize, CacheEntry>,
    /// Entries that left the window or belong to an old column grouping,
    /// waiting for their render to stop.
    retired: Vec<CacheEntry>,
    scheduler: Scheduler,
    in_flight: usize,
    stats: CacheStats,
}

/// Smallest power of 4 number of chunks that makes a column at least
/// `min_width_px` wide.
pub fn chunks_in_column(chunk_px: f64, min_width_px: f64) -> usize {
    let mut chunks = 1usize;
    if !(chunk_px > 0.0) {
        return chunks;
    }
    while chunk_px * (chunks as f64) < min_width_px && chunks < 1 << 40 {
        chunks *= 4;
    }
    chunks
}

impl ViewportCache<WaveRenderer> {
    pub fn new(config: ViewportConfig, chunking: ChunkMetadata) -> Self {
        Self::with_renderer(config, chunking, WaveRenderer)
    }
}

impl<R: ChunkRenderer> ViewportCache<R> {
    pub fn with_renderer(config: ViewportConfig, chunking: ChunkMetadata, renderer: R) -> Self {
        let zoom = chunking.default_zoom;
        let chunks_in_column =
            chunks_in_column(chunking.chunk_time * zoom, config.min_column_width_px);
        Self {
            config,
            chunking,
            renderer,
            zoom,
            chunks_in_column,
            window: 0..0,
            entries: BTreeMap::new(),
            retired: Vec::new(),
            scheduler: Scheduler::new(),
            in_flight: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn chunking(&self) -> &ChunkMetadata {
        &self.chunking
    }

    pub fn chunks_in_column(&self) -> usize {
        self.chunks_in_column
    }

    pub fn column_count(&self) -> usize {
        (self.chunking.chunk_count + self.chunks_in_column - 1) / self.chunks_in_column
    }

    pub fn window(&self) -> Range<usize> {
        self.window.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn span(&self, column: usize) -> ColumnSpan {
        let first = column * self.chunks_in_column;
        let last = (first + self.chunks_in_column).min(self.chunking.chunk_count);
        ColumnSpan {
            index: column,
            chunks: first..last,
            start: self.chunking.chunk_boundary(first),
            end: self.chunking.chunk_boundary(last),
        }
    }

    /// The column containing `time`.
    pub fn column_of(&self, time: u64) -> usize {
        self.chunking.chunk_of(time) / self.chunks_in_column
    }

    pub fn state(&self, column: usize) -> Option<EntryState> {
        self.entries.get(&column).map(|e| e.state)
    }

    /// Columns that left the window and their states.
    pub fn retired(&self) -> Vec<(usize, EntryState)> {
        self.retired.iter().map(|e| (e.span.index, e.state)).collect()
    }

    pub fn span_of_entry(&self, column: usize) -> Option<&ColumnSpan> {
        self.entries.get(&column).map(|e| &e.span)
    }

    /// The ruler and then every row of a cached column.
    pub fn shapes(&self, column: usize) -> Option<impl Iterator<Item = &Shape>> {
        let entry = self.entries.get(&column)?;
        Some(
            entry
                .ruler
                .iter()
                .chain(entry.rows.iter().flat_map(|r| r.shapes.iter())),
        )
    }

    /// Bring the cache in line with the session: regroup columns if the
    /// zoom needs it, pick up display changes and materialize the columns
    /// the viewport now covers.
    pub fn set_window(&mut self, session: &ViewSession, store: &WaveformStore) {
        if session.zoom != self.zoom {
            self.on_zoom_change(session.zoom);
        }

        let visible = session.visible(self.config.viewport_width_px);
        let column_time = self.chunking.chunk_time * self.chunks_in_column as f64;
        let count = self.column_count();
        // Whole columns only, so the window edges always fall on chunk
        // boundaries.
        let first = ((visible.start.max(0.0) / column_time).floor() as usize).min(count - 1);
        let end = ((visible.end / column_time).ceil() as usize).clamp(first + 1, count);
        let window = first.saturating_sub(self.config.prefetch_columns)
            ..(end + self.config.prefetch_columns).min(count);

        if window != self.window {
            debug!("Window {:?} -> {:?}", self.window, window);
            let leaving: Vec<usize> = self
                .entries
                .keys()
                .copied()
                .filter(|c| !window.contains(c))
                .collect();
            for column in leaving {
                if let Some(entry) = self.entries.remove(&column) {
                    self.retire(entry);
                }
            }
            self.window = window.clone();
        }

        self.sync_display(session, store);

        for column in window {
            if self.entries.contains_key(&column) {
                continue;
            }
            let span = self.span(column);
            let ruler = render_ruler_now(&self.renderer, &span, &self.chunking);
            self.entries.insert(
                column,
                CacheEntry {
                    span,
                    state: EntryState::ShallowPending,
                    ruler,
                    rows: session
                        .displayed
                        .iter()
                        .map(|signal| Row {
                            signal: *signal,
                            shapes: Vec::new(),
                        })
                        .collect(),
                    task: None,
                    pending: BTreeSet::new(),
                },
            );
            self.request_full_render(column, store);
        }

        self.collect_garbage();
    }

    fn retire(&mut self, mut entry: CacheEntry) {
        entry.state = match entry.state {
            EntryState::Rendering => {
                if let Some((_, token)) = &entry.task {
                    token.cancel();
                }
                EntryState::AbortRequested
            }
            EntryState::AbortRequested => EntryState::AbortRequested,
            _ => {
                self.stats.discarded += 1;
                EntryState::Discarded
            }
        };
        trace!("Retiring column {} as {:?}", entry.span.index, entry.state);
        self.retired.push(entry);
    }

    /// Start drawing every row of a column that has so far only got its
    /// ruler. Stays `ShallowPending` while none of its signals has data.
    pub fn request_full_render(&mut self, column: usize, store: &WaveformStore) -> bool {
        let Some(entry) = self.entries.get(&column) else {
            return false;
        };
        if entry.state != EntryState::ShallowPending {
            return false;
        }
        if !entry.rows.iter().any(|r| store.has_data(r.signal.signal)) {
            trace!("Column {column} waiting for data");
            return false;
        }
        let rows = (0..entry.rows.len()).collect();
        self.start_render(column, rows);
        true
    }

    /// Queue a render of `rows` in `column`, folding in any rows a render
    /// already in flight was going to draw.
    fn start_render(&mut self, column: usize, rows: BTreeSet<usize>) {
        let Some(entry) = self.entries.get_mut(&column) else {
            return;
        };
        let mut rows = rows;
        if let Some((_, token)) = entry.task.take() {
            token.cancel();
            rows.extend(std::mem::take(&mut entry.pending));
        }
        rows.retain(|r| *r < entry.rows.len());
        let task_rows = rows.iter().map(|r| (*r, entry.rows[*r].signal)).collect();
        let (id, token) = self.scheduler.spawn(entry.span.clone(), task_rows);
        entry.task = Some((id, token));
        entry.pending = rows;
        entry.state = EntryState::Rendering;
        self.in_flight += 1;
        self.stats.renders += 1;
    }

    /// Re-render the rows of `column` that show `signal`.
    fn invalidate_rows(&mut self, column: usize, rows: BTreeSet<usize>, store: &WaveformStore) {
        let Some(state) = self.state(column) else {
            return;
        };
        match state {
            EntryState::ShallowPending => {
                self.request_full_render(column, store);
            }
            EntryState::Rendering | EntryState::Ready if !rows.is_empty() => {
                self.start_render(column, rows);
            }
            _ => {}
        }
    }

    /// Align each entry's rows with what the session displays, re-rendering
    /// only the rows that changed.
    fn sync_display(&mut self, session: &ViewSession, store: &WaveformStore) {
        let columns: Vec<usize> = self.entries.keys().copied().collect();
        for column in columns {
            let Some(entry) = self.entries.get_mut(&column) else {
                continue;
            };
            let mut changed = BTreeSet::new();
            entry.rows.truncate(session.displayed.len());
            for (i, signal) in session.displayed.iter().enumerate() {
                match entry.rows.get_mut(i) {
                    Some(row) if row.signal == *signal => {}
                    Some(row) => {
                        row.signal = *signal;
                        row.shapes.clear();
                        changed.insert(i);
                    }
                    None => {
                        entry.rows.push(Row {
                            signal: *signal,
                            shapes: Vec::new(),
                        });
                        changed.insert(i);
                    }
                }
            }
            if !changed.is_empty() {
                trace!("Column {column}: rows {changed:?} changed");
                self.invalidate_rows(column, changed, store);
            }
        }
    }

    /// Regroup the columns if the chunk width at `zoom` calls for a
    /// different number of chunks per column. Shapes are laid out in time so
    /// nothing needs redrawing otherwise.
    pub fn on_zoom_change(&mut self, zoom: f64) {
        self.zoom = zoom;
        let chunks = chunks_in_column(
            self.chunking.chunk_time * zoom,
            self.config.min_column_width_px,
        );
        if chunks == self.chunks_in_column {
            return;
        }
        debug!(
            "Zoom {zoom}: {} -> {chunks} chunks per column",
            self.chunks_in_column
        );
        self.chunks_in_column = chunks;
        let entries = std::mem::take(&mut self.entries);
        for entry in entries.into_values() {
            self.retire(entry);
        }
        self.window = 0..0;
    }

    /// New transitions for `signal` arrived: redraw just its rows in the
    /// window.
    pub fn on_new_transition_data(&mut self, signal: SignalRef, store: &WaveformStore) {
        let columns: Vec<(usize, BTreeSet<usize>)> = self
            .entries
            .iter()
            .map(|(column, entry)| {
                let rows = entry
                    .rows
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.signal.signal == signal)
                    .map(|(i, _)| i)
                    .collect();
                (*column, rows)
            })
            .filter(|(_, rows): &(usize, BTreeSet<usize>)| !rows.is_empty())
            .collect();
        for (column, rows) in columns {
            self.invalidate_rows(column, rows, store);
        }
    }

    /// Redraw every row of every column in the window.
    pub fn invalidate_all(&mut self, store: &WaveformStore) {
        let columns: Vec<(usize, usize)> = self
            .entries
            .iter()
            .map(|(c, e)| (*c, e.rows.len()))
            .collect();
        for (column, rows) in columns {
            self.invalidate_rows(column, (0..rows).collect(), store);
        }
    }

    /// Give one render task one turn. Returns false when there is nothing
    /// left to do.
    pub fn run_slice(&mut self, store: &WaveformStore) -> bool {
        if let Some(completion) =
            self.scheduler
                .run_slice(&self.renderer, store, self.config.signals_per_slice)
        {
            self.on_render_complete(completion);
        }
        !self.scheduler.is_empty()
    }

    pub fn run_until_idle(&mut self, store: &WaveformStore) {
        while self.run_slice(store) {}
    }

    pub fn on_render_complete(&mut self, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let Completion {
            task,
            column,
            outcome,
        } = completion;
        let is_task = |e: &CacheEntry| matches!(&e.task, Some((id, _)) if *id == task);

        if let Some(entry) = self.retired.iter_mut().find(|e| is_task(&**e)) {
            entry.task = None;
            entry.state = EntryState::Discarded;
            self.stats.aborted += 1;
            self.stats.discarded += 1;
        } else if let Some(entry) = self.entries.get_mut(&column).filter(|e| is_task(&**e)) {
            match outcome {
                Outcome::Completed(rows) => {
                    self.stats.rows_rendered += rows.len();
                    for rendered in rows {
                        // The row may have been given to another signal
                        // since the task started.
                        if let Some(row) = entry.rows.get_mut(rendered.row) {
                            if row.signal == rendered.signal {
                                row.shapes = rendered.shapes;
                            }
                        }
                    }
                    entry.task = None;
                    entry.pending.clear();
                    entry.state = EntryState::Ready;
                }
                Outcome::Cancelled => {
                    // Cancelled without a replacement; keep whatever was
                    // drawn before.
                    entry.task = None;
                    entry.pending.clear();
                    entry.state = EntryState::Ready;
                }
            }
        } else {
            trace!("Dropping output of superseded render {task:?}");
        }

        self.collect_garbage();
    }

    /// Drop retired entries, but only once no render is running.
    fn collect_garbage(&mut self) {
        if self.in_flight > 0 {
            return;
        }
        let before = self.retired.len();
        self.retired.retain(|e| e.state != EntryState::Discarded);
        if before > 0 {
            debug!("Collected {} retired columns", before - self.retired.len());
        }
    }

    /// The value of `signal` at `time`, worked out from the transitions of
    /// the column containing it.
    pub fn value_at<'a>(&self, store: &'a WaveformStore, signal: SignalRef, time: u64) -> Option<&'a Value> {
        let span = self.span(self.column_of(time));
        let data = store.query_range(signal, span.chunks)?;
        let mut value = &data.entry.value;
        for transition in data.transitions {
            if transition.time > time {
                break;
            }
            value = &transition.value;
        }
        Some(value)
    }
}

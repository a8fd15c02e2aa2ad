//! Cooperative render tasks.
//!
//! A task renders some rows of one column, a few rows per turn, so the
//! thread driving the view is never blocked for long. Between turns a task
//! can be cancelled through its token; it then finishes without handing
//! back anything it drew.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::trace;
use wavecore::{ChunkMetadata, WaveformStore};

use crate::{
    render::{ChunkRenderer, ColumnSpan, Shape},
    session::DisplayedSignal,
};

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

/// One rendered row: where it goes, what it showed and the shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedRow {
    pub row: usize,
    pub signal: DisplayedSignal,
    pub shapes: Vec<Shape>,
}

#[derive(Debug)]
pub enum Outcome {
    Completed(Vec<RenderedRow>),
    Cancelled,
}

#[derive(Debug)]
pub struct Completion {
    pub task: TaskId,
    pub column: usize,
    pub outcome: Outcome,
}

struct RenderTask {
    id: TaskId,
    column: ColumnSpan,
    rows: Vec<(usize, DisplayedSignal)>,
    next: usize,
    token: CancellationToken,
    output: Vec<RenderedRow>,
}

#[derive(Default)]
pub struct Scheduler {
    queue: VecDeque<RenderTask>,
    next_id: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a render of `rows` in `column`.
    pub fn spawn(
        &mut self,
        column: ColumnSpan,
        rows: Vec<(usize, DisplayedSignal)>,
    ) -> (TaskId, CancellationToken) {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let token = CancellationToken::new();
        self.queue.push_back(RenderTask {
            id,
            column,
            rows,
            next: 0,
            token: token.clone(),
            output: Vec::new(),
        });
        (id, token)
    }

    /// Number of queued tasks, including cancelled ones not yet reaped.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Give the task at the front of the queue one turn of at most
    /// `budget` rows. Returns the completion if it finished; otherwise it
    /// goes to the back of the queue.
    pub fn run_slice(
        &mut self,
        renderer: &dyn ChunkRenderer,
        store: &WaveformStore,
        budget: usize,
    ) -> Option<Completion> {
        let mut task = self.queue.pop_front()?;
        let end = (task.next + budget.max(1)).min(task.rows.len());
        while task.next < end {
            if task.token.is_cancelled() {
                trace!("Render {:?} of column {} cancelled", task.id, task.column.index);
                return Some(Completion {
                    task: task.id,
                    column: task.column.index,
                    outcome: Outcome::Cancelled,
                });
            }
            let (row, signal) = task.rows[task.next];
            let mut shapes = Vec::new();
            if let Some(data) = store.query_range(signal.signal, task.column.chunks.clone()) {
                renderer.render_signal(&task.column, row, &signal, &data, &mut shapes);
            }
            task.output.push(RenderedRow { row, signal, shapes });
            task.next += 1;
        }

        if task.token.is_cancelled() {
            return Some(Completion {
                task: task.id,
                column: task.column.index,
                outcome: Outcome::Cancelled,
            });
        }
        if task.next < task.rows.len() {
            self.queue.push_back(task);
            return None;
        }
        Some(Completion {
            task: task.id,
            column: task.column.index,
            outcome: Outcome::Completed(task.output),
        })
    }
}

/// Draw the ruler of a column straight away.
pub fn render_ruler_now(
    renderer: &dyn ChunkRenderer,
    column: &ColumnSpan,
    chunking: &ChunkMetadata,
) -> Vec<Shape> {
    let mut out = Vec::new();
    renderer.render_ruler(column, chunking, &mut out);
    out
}

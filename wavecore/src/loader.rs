//! Loading a document on a background thread.
//!
//! The worker parses the file and sends ordered [`LoadEvent`]s: the netlist
//! as soon as the header is read, then the chunk metadata once every value
//! change is known, then each signal's transitions as transfer chunks. The
//! receiving side feeds them to a [`DocumentState`], which owns the store.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{info, warn};

use crate::{
    error::Diagnostic,
    netlist::{Netlist, SignalRef},
    options::LoadOptions,
    source::{DiskSource, FileSource},
    store::{derive_chunk_time, ChunkMetadata, Metadata, WaveformStore},
    trace::TraceReader,
    transfer::{split, Reassembler, TransferChunk},
};

#[derive(Debug)]
pub enum LoadEvent {
    NetlistReady {
        netlist: Netlist,
        metadata: Metadata,
    },
    ChunkMetadataReady {
        chunking: ChunkMetadata,
        dump_activity: Vec<(u64, bool)>,
    },
    TransitionData(TransferChunk),
    Diagnostic(Diagnostic),
    /// The load was abandoned. The reason is the whole error chain.
    Failed(String),
    Finished,
}

/// A document being loaded in another thread.
pub struct Loader {
    events: Receiver<LoadEvent>,
    // Percent done.
    progress: Arc<AtomicI32>,
    // Set to true to cancel loading.
    cancelled: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Loader {
    /// Start loading a file from disk.
    pub fn spawn(path: &Path, options: LoadOptions) -> Self {
        let path = path.to_owned();
        Self::start(move |worker| {
            let source = DiskSource::open(&path)
                .with_context(|| format!("Opening {}", path.display()))?;
            worker.load(Box::new(source), Some(path), &options)
        })
    }

    /// Start loading from any source, e.g. one already in memory.
    pub fn spawn_source(
        source: Box<dyn FileSource + Send>,
        hint: Option<PathBuf>,
        options: LoadOptions,
    ) -> Self {
        Self::start(move |worker| worker.load(source, hint, &options))
    }

    fn start(job: impl FnOnce(&Worker) -> Result<()> + Send + 'static) -> Self {
        let (sender, events) = unbounded();
        let progress = Arc::new(AtomicI32::new(0));
        let cancelled = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            sender,
            progress: progress.clone(),
            cancelled: cancelled.clone(),
        };

        // Start a new thread.
        let thread = thread::spawn(move || {
            if let Err(e) = job(&worker) {
                warn!("Load failed: {e:#}");
                // Nobody to tell if the receiver has gone.
                let _ = worker.sender.send(LoadEvent::Failed(format!("{e:#}")));
            }
            worker.progress.store(100, Ordering::SeqCst);
        });

        Self {
            events,
            progress,
            cancelled,
            thread: Some(thread),
        }
    }

    pub fn progress(&self) -> i32 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Ask the worker to stop at its next check. It reports `Failed`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> &Receiver<LoadEvent> {
        &self.events
    }

    /// Block until the worker is done and apply every event to `state`.
    pub fn finish_into(mut self, state: &mut DocumentState) {
        for event in self.events.iter() {
            state.apply(event);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                state.failure = Some("Loader thread panicked".to_owned());
            }
        }
    }
}

struct Worker {
    sender: Sender<LoadEvent>,
    progress: Arc<AtomicI32>,
    cancelled: Arc<AtomicBool>,
}

impl Worker {
    fn send(&self, event: LoadEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| anyhow!("Load abandoned: receiver dropped"))
    }

    fn checkpoint(&self, progress: i32) -> Result<()> {
        self.progress.store(progress, Ordering::SeqCst);
        if self.cancelled.load(Ordering::SeqCst) {
            bail!("Load cancelled");
        }
        Ok(())
    }

    fn load(
        &self,
        mut source: Box<dyn FileSource + Send>,
        hint: Option<PathBuf>,
        options: &LoadOptions,
    ) -> Result<()> {
        let source: &mut dyn FileSource = &mut *source;
        let (mut reader, mut header) = TraceReader::open(source, hint.as_deref(), options)?;

        for diagnostic in std::mem::take(&mut header.diagnostics) {
            self.send(LoadEvent::Diagnostic(diagnostic))?;
        }
        self.send(LoadEvent::NetlistReady {
            netlist: header.netlist.clone(),
            metadata: header.metadata.clone(),
        })?;
        self.checkpoint(10)?;

        let waves = reader.read_waves(&header)?;
        for diagnostic in waves.diagnostics {
            self.send(LoadEvent::Diagnostic(diagnostic))?;
        }
        self.checkpoint(60)?;

        let chunking = derive_chunk_time(
            waves.sequences.iter(),
            waves.time_end,
            header.metadata.time_scale,
            &header.metadata.time_unit,
        );
        let dump_activity = if waves.dump_activity.is_empty() {
            header.metadata.dump_activity.clone()
        } else {
            waves.dump_activity
        };
        self.send(LoadEvent::ChunkMetadataReady {
            chunking,
            dump_activity,
        })?;

        let count = waves.sequences.len().max(1);
        for (signal, sequence) in waves.sequences.iter_enumerated() {
            let index: usize = signal.into();
            self.checkpoint(60 + (40 * index / count) as i32)?;
            for chunk in split(signal, sequence, options.transfer_chunk_len) {
                self.send(LoadEvent::TransitionData(chunk))?;
            }
        }

        info!("Loaded {} signals", waves.sequences.len());
        self.send(LoadEvent::Finished)
    }
}

/// What an applied event changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    NetlistReady,
    ChunkingReady,
    SignalReady(SignalRef),
    Failed(String),
    Finished,
}

/// The receiving end of a load: builds the store from events.
#[derive(Default)]
pub struct DocumentState {
    store: Option<WaveformStore>,
    reassembler: Reassembler,
    pub diagnostics: Vec<Diagnostic>,
    failure: Option<String>,
    finished: bool,
}

impl DocumentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store, once the netlist has arrived.
    pub fn store(&self) -> Option<&WaveformStore> {
        self.store.as_ref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn apply(&mut self, event: LoadEvent) -> Option<Update> {
        match event {
            LoadEvent::NetlistReady { netlist, metadata } => {
                self.store = Some(WaveformStore::new(netlist, metadata));
                Some(Update::NetlistReady)
            }
            LoadEvent::ChunkMetadataReady {
                chunking,
                dump_activity,
            } => {
                let store = self.store.as_mut()?;
                store.set_dump_activity(dump_activity);
                store.set_chunking(chunking).then_some(Update::ChunkingReady)
            }
            LoadEvent::TransitionData(chunk) => {
                let Some(store) = self.store.as_mut() else {
                    warn!("Transition data for {:?} before the netlist", chunk.signal);
                    return None;
                };
                match self.reassembler.accept(chunk) {
                    Ok(Some((signal, sequence))) => {
                        store.insert_sequence(signal, sequence);
                        Some(Update::SignalReady(signal))
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!("Dropping transfer: {e}");
                        None
                    }
                }
            }
            LoadEvent::Diagnostic(diagnostic) => {
                self.diagnostics.push(diagnostic);
                None
            }
            LoadEvent::Failed(reason) => {
                self.failure = Some(reason.clone());
                Some(Update::Failed(reason))
            }
            LoadEvent::Finished => {
                self.finished = true;
                Some(Update::Finished)
            }
        }
    }
}

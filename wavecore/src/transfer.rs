//! Moving transition sequences across a message boundary in pieces.
//!
//! A sequence is split into chunks tagged with their index and the total
//! count. Chunks may arrive in any order; the receiver buffers them until
//! the set is complete.

use std::collections::HashMap;

use log::debug;

use crate::{
    error::{WaveError, WaveResult},
    netlist::SignalRef,
    store::{Transition, TransitionSequence},
};

#[derive(Clone, Debug, PartialEq)]
pub struct TransferChunk {
    pub signal: SignalRef,
    pub index: usize,
    pub total: usize,
    pub width: u32,
    pub synthetic_end: bool,
    pub transitions: Vec<Transition>,
}

/// Split a sequence into chunks of at most `chunk_len` transitions. There
/// is always at least one chunk.
pub fn split(signal: SignalRef, sequence: &TransitionSequence, chunk_len: usize) -> Vec<TransferChunk> {
    let chunk_len = chunk_len.max(1);
    let transitions = sequence.transitions();
    let total = ((transitions.len() + chunk_len - 1) / chunk_len).max(1);
    let make = |index: usize, transitions: &[Transition]| TransferChunk {
        signal,
        index,
        total,
        width: sequence.width(),
        synthetic_end: sequence.has_synthetic_end(),
        transitions: transitions.to_vec(),
    };
    if transitions.is_empty() {
        return vec![make(0, &[])];
    }
    transitions
        .chunks(chunk_len)
        .enumerate()
        .map(|(index, part)| make(index, part))
        .collect()
}

struct Pending {
    total: usize,
    width: u32,
    synthetic_end: bool,
    parts: Vec<Option<Vec<Transition>>>,
    received: usize,
}

/// Collects chunks until every chunk of a signal has arrived.
#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<SignalRef, Pending>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of signals with some but not all chunks received.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Add a chunk. Returns the whole sequence once its last missing chunk
    /// arrives.
    pub fn accept(
        &mut self,
        chunk: TransferChunk,
    ) -> WaveResult<Option<(SignalRef, TransitionSequence)>> {
        if chunk.total == 0 || chunk.index >= chunk.total {
            return Err(WaveError::Invalid(format!(
                "transfer chunk {} of {} for signal {:?}",
                chunk.index, chunk.total, chunk.signal
            )));
        }
        let pending = self.pending.entry(chunk.signal).or_insert_with(|| Pending {
            total: chunk.total,
            width: chunk.width,
            synthetic_end: chunk.synthetic_end,
            parts: vec![None; chunk.total],
            received: 0,
        });
        if pending.total != chunk.total {
            let expected = pending.total;
            self.pending.remove(&chunk.signal);
            return Err(WaveError::Invalid(format!(
                "signal {:?} sent as {} chunks and as {expected}",
                chunk.signal, chunk.total
            )));
        }
        let slot = &mut pending.parts[chunk.index];
        if slot.is_some() {
            debug!("Duplicate transfer chunk {} for {:?}", chunk.index, chunk.signal);
            return Ok(None);
        }
        *slot = Some(chunk.transitions);
        pending.received += 1;
        if pending.received < pending.total {
            return Ok(None);
        }

        let Some(pending) = self.pending.remove(&chunk.signal) else {
            return Ok(None);
        };
        let transitions: Vec<Transition> = pending.parts.into_iter().flatten().flatten().collect();
        if transitions.windows(2).any(|w| w[0].time >= w[1].time) {
            return Err(WaveError::Invalid(format!(
                "reassembled signal {:?} is not in time order",
                chunk.signal
            )));
        }
        Ok(Some((
            chunk.signal,
            TransitionSequence::from_closed(pending.width, transitions, pending.synthetic_end),
        )))
    }
}

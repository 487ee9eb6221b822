//! The in-memory ordered work set the producer drains.

use data_types::{Morsel, MorselIdentity};
use std::collections::{HashSet, VecDeque};

/// A FIFO queue of morsels with set semantics on morsel identity.
///
/// Insertion order is preserved so that morsels are consumed fairly and no
/// tenant starves behind a busy one. A morsel polled out of the queue gives
/// its identity back, so it may be re-inserted later (the reload path).
#[derive(Debug, Default)]
pub struct MorselQueue {
    queue: VecDeque<Morsel>,
    identities: HashSet<MorselIdentity>,
}

impl MorselQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a morsel unless one with the same identity is already queued.
    /// Returns whether the morsel was inserted.
    pub fn push(&mut self, morsel: Morsel) -> bool {
        if !self.identities.insert(morsel.identity()) {
            return false;
        }
        self.queue.push_back(morsel);
        true
    }

    /// Append many morsels, keeping first-wins identity semantics.
    pub fn add_all(&mut self, morsels: impl IntoIterator<Item = Morsel>) {
        for morsel in morsels {
            self.push(morsel);
        }
    }

    /// Remove and return the oldest morsel.
    pub fn poll(&mut self) -> Option<Morsel> {
        let morsel = self.queue.pop_front()?;
        self.identities.remove(&morsel.identity());
        Some(morsel)
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued morsels.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Iterate queued morsels oldest first, without consuming them.
    pub fn iter(&self) -> impl Iterator<Item = &Morsel> {
        self.queue.iter()
    }
}

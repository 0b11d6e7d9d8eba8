use std::collections::HashMap;
use std::sync::Mutex;

/// Stable position of an interned response within a run.
pub type ResponseId = usize;

/// Which output stream a response was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseChannel {
    Stdout,
    Stderr,
}

#[derive(Default)]
struct StoreState {
    entries: Vec<(String, ResponseChannel)>,
    index: HashMap<(String, ResponseChannel), ResponseId>,
}

/// Append-only, deduplicating store of captured command output, shared by
/// every session in a run.
///
/// Interning is serialized by one coarse lock; it happens at most once per
/// non-empty command output, far less often than the network I/O around it,
/// so the lock is effectively uncontended.
#[derive(Default)]
pub struct ResponseStore {
    state: Mutex<StoreState>,
}

impl ResponseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of an existing entry with identical text and channel,
    /// or appends a new entry and returns its position. Ids are dense,
    /// zero-based, and assigned in first-seen order regardless of which
    /// concurrent session got here first.
    pub fn intern(&self, text: String, channel: ResponseChannel) -> ResponseId {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(&id) = state.index.get(&(text.clone(), channel)) {
            return id;
        }

        let id = state.entries.len();
        state.entries.push((text.clone(), channel));
        state.index.insert((text, channel), id);
        id
    }

    /// Returns and clears every entry, dedup index included, in insertion
    /// order. Intended to be called once, after the run has fully
    /// completed; a later call observes an empty store.
    pub fn drain(&self) -> Vec<(String, ResponseChannel)> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.index.clear();
        std::mem::take(&mut state.entries)
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

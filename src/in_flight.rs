//! Tracks which videos are being downloaded right now.

use std::collections::HashSet;

use parking_lot::Mutex;

/// Set of identifiers with a download in progress.
///
/// Insertion is an atomic insert-if-absent, so when several callers race for
/// the same identifier exactly one of them wins and the rest are rejected
/// until the winner releases it.
#[derive(Debug, Default)]
pub struct InFlightSet {
    ids: Mutex<HashSet<String>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `id` as in flight. Returns `false` when it already was.
    pub fn try_acquire(&self, id: &str) -> bool {
        self.ids.lock().insert(id.to_string())
    }

    /// Forgets `id`, whether or not it was present.
    pub fn release(&self, id: &str) {
        self.ids.lock().remove(id);
    }

    /// Like [`try_acquire`](Self::try_acquire), but hands back a guard that
    /// releases the identifier when dropped.
    pub fn claim(&self, id: &str) -> Option<InFlightGuard<'_>> {
        self.try_acquire(id).then(|| InFlightGuard {
            set: self,
            id: id.to_string(),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

/// Holds one identifier in an [`InFlightSet`] for as long as it lives.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    set: &'a InFlightSet,
    id: String,
}

impl InFlightGuard<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.release(&self.id);
    }
}

//! Single-flight registry of active leaders.
//!
//! At most one [`Leader`] exists per final store path at any instant. Keys
//! that differ only in what the store layout drops (the scheme) map to the
//! same path, so they share one leader and one staging file. A request
//! installs its candidate atomically or learns about the leader that got
//! there first. Leaders remove themselves during wind-down; removal is by
//! pointer identity so a stale leader can never evict its successor.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::leader::Leader;

/// Map from final file path to its active leader.
#[derive(Default)]
pub struct LeaderPool {
    leaders: Mutex<HashMap<PathBuf, Arc<Leader>>>,
}

impl LeaderPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `candidate` unless a leader for its file already exists.
    ///
    /// Returns `None` when the candidate became leader, otherwise the
    /// existing leader.
    pub fn acquire(&self, candidate: &Arc<Leader>) -> Option<Arc<Leader>> {
        let mut leaders = self.leaders.lock();
        match leaders.entry(candidate.paths().file.clone()) {
            Entry::Occupied(existing) => Some(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(candidate));
                None
            }
        }
    }

    /// Remove `leader` if it is still the registered leader for its key.
    pub fn release(&self, leader: &Arc<Leader>) -> bool {
        let mut leaders = self.leaders.lock();
        let file = &leader.paths().file;
        match leaders.get(file) {
            Some(current) if Arc::ptr_eq(current, leader) => {
                leaders.remove(file);
                true
            }
            _ => false,
        }
    }

    /// Active leader writing the final file `file`.
    pub fn get(&self, file: &Path) -> Option<Arc<Leader>> {
        self.leaders.lock().get(file).cloned()
    }

    /// All active leaders.
    pub fn leaders(&self) -> Vec<Arc<Leader>> {
        self.leaders.lock().values().cloned().collect()
    }

    /// Number of active leaders.
    pub fn len(&self) -> usize {
        self.leaders.lock().len()
    }

    /// Whether no download is running.
    pub fn is_empty(&self) -> bool {
        self.leaders.lock().is_empty()
    }
}

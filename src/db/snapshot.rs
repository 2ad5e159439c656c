//! Snapshots — pinned read views identified by a sequence number.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::keys::SequenceNumber;

type Registry = Arc<Mutex<BTreeMap<SequenceNumber, usize>>>;

/// The set of live snapshots of one database.
///
/// Compaction consults [`SnapshotList::live`] to decide which old
/// entry versions must be retained.
#[derive(Debug, Default)]
pub(crate) struct SnapshotList {
    registry: Registry,
}

impl SnapshotList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `sequence` and returns the owning handle.
    pub fn acquire(&self, sequence: SequenceNumber) -> Snapshot {
        if let Ok(mut map) = self.registry.lock() {
            *map.entry(sequence).or_insert(0) += 1;
        }
        Snapshot {
            sequence,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Live snapshot sequences, ascending.
    pub fn live(&self) -> Vec<SequenceNumber> {
        self.registry
            .lock()
            .map(|map| map.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Smallest live snapshot, if any.
    pub fn oldest(&self) -> Option<SequenceNumber> {
        self.registry
            .lock()
            .ok()
            .and_then(|map| map.keys().next().copied())
    }
}

/// An opaque handle pinning one read view.
///
/// The only observable property is the sequence number.  Dropping the
/// handle releases the snapshot, making its sequence eligible for
/// reclamation during compaction.
#[derive(Debug)]
pub struct Snapshot {
    sequence: SequenceNumber,
    registry: Registry,
}

impl Snapshot {
    /// The pinned sequence.
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if let Ok(mut map) = self.registry.lock()
            && let Some(count) = map.get_mut(&self.sequence)
        {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.sequence);
            }
        }
    }
}

use crate::errors::{Result, StorageError};
use crate::raftpb::{ConfState, Entry, HardState, Snapshot};

/// Holds the last `(HardState, ConfState)` a storage collaborator has
/// persisted and hands back at node construction time.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RaftState {
    pub hard_state: HardState,
    pub conf_state: ConfState,
}

/// The durable-log collaborator the core depends on. The core never touches
/// bytes on disk itself: everything below the unstable suffix goes through
/// this trait.
///
/// Implementations may return `StorageError::Compacted` for any index at or
/// below the snapshot boundary, and `StorageError::Unavailable` for any index
/// beyond `last_index()`.
pub trait Storage {
    /// Returns the `(HardState, ConfState)` persisted for this node, or the
    /// zero value of both if this is a brand new node.
    fn initial_state(&self) -> Result<RaftState>;

    /// Returns a slice `[lo, hi)` of entries whose combined approximate size
    /// does not exceed `max_size`, except that at least one entry is always
    /// returned when `lo < hi`.
    fn entries(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>>;

    /// Returns the term of the entry at `i`.
    fn term(&self, i: u64) -> Result<u64>;

    /// Returns the index of the first entry still available (i.e. one past
    /// the snapshot boundary).
    fn first_index(&self) -> Result<u64>;

    /// Returns the index of the last entry in the log.
    fn last_index(&self) -> Result<u64>;

    /// Returns the most recent snapshot, or
    /// `StorageError::SnapshotTemporarilyUnavailable` if one is being
    /// generated.
    fn snapshot(&self) -> Result<Snapshot>;
}

/// In-memory reference implementation of [`Storage`].
///
/// `MemStorage` keeps the whole log in a `Vec`, indexed with a dummy entry at
/// position 0 standing in for the snapshot boundary (the same "dummy index"
/// convention `RaftLog` uses one below `first_index`). It is not durable:
/// restarting a process loses everything. It exists for tests and for
/// embedders that do not need real persistence.
#[derive(Debug, Clone)]
pub struct MemStorage {
    hard_state: HardState,
    snapshot: Snapshot,
    // entries[0] is a dummy entry whose (index, term) equal the snapshot
    // boundary; entries[1..] are the real, index-ascending log entries.
    entries: Vec<Entry>,
}

impl Default for MemStorage {
    fn default() -> MemStorage {
        MemStorage {
            hard_state: HardState::default(),
            snapshot: Snapshot::default(),
            entries: vec![Entry::default()],
        }
    }
}

impl MemStorage {
    pub fn new() -> MemStorage {
        MemStorage::default()
    }

    pub fn new_with_conf_state(conf_state: ConfState) -> MemStorage {
        let mut store = MemStorage::new();
        store.snapshot.conf_state = conf_state;
        store
    }

    pub fn set_hard_state(&mut self, hs: HardState) {
        self.hard_state = hs;
    }

    pub fn hard_state(&self) -> HardState {
        self.hard_state
    }

    fn dummy_index(&self) -> u64 {
        self.entries[0].index
    }

    /// Appends entries, truncating any existing overlapping suffix first.
    /// `ents` must be contiguous and must not regress before the already
    /// compacted prefix.
    pub fn append(&mut self, ents: &[Entry]) -> Result<()> {
        if ents.is_empty() {
            return Ok(());
        }

        let first = self.dummy_index() + 1;
        let last = ents[0].index + ents.len() as u64 - 1;
        if last < first {
            return Ok(());
        }

        let mut ents = ents.to_vec();
        if first > ents[0].index {
            let truncate = (first - ents[0].index) as usize;
            ents.drain(..truncate);
        }

        let offset = ents[0].index - self.dummy_index();
        if (self.entries.len() as u64) > offset {
            let keep = offset as usize;
            self.entries.truncate(keep);
            self.entries.extend(ents);
        } else if (self.entries.len() as u64) == offset {
            self.entries.extend(ents);
        } else {
            panic!(
                "missing log entry [last: {}, append at: {}]",
                self.last_index().unwrap(),
                ents[0].index
            );
        }
        Ok(())
    }

    /// Applies a snapshot, discarding any log entries it supersedes.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let my_index = self.snapshot.metadata.index;
        let snap_index = snapshot.metadata.index;
        if my_index >= snap_index {
            return Err(crate::errors::Error::Store(StorageError::Compacted));
        }

        self.entries = vec![Entry {
            term: snapshot.metadata.term,
            index: snapshot.metadata.index,
            ..Default::default()
        }];
        self.snapshot = snapshot;
        Ok(())
    }

    /// Discards log entries up to (but not including) `compact_index`,
    /// keeping the dummy entry in sync with the new boundary.
    pub fn compact(&mut self, compact_index: u64) -> Result<()> {
        let offset = compact_index - self.dummy_index();
        if offset == 0 || offset as usize >= self.entries.len() {
            return Ok(());
        }
        let mut new_entries = Vec::with_capacity(self.entries.len() - offset as usize);
        new_entries.push(self.entries[offset as usize].clone());
        new_entries.extend_from_slice(&self.entries[offset as usize + 1..]);
        self.entries = new_entries;
        Ok(())
    }

    /// Records that the application-level state machine has produced a new
    /// snapshot at `index`/`term`, with the given membership and opaque data.
    pub fn create_snapshot(
        &mut self,
        index: u64,
        conf_state: Option<ConfState>,
        data: Vec<u8>,
    ) -> Result<Snapshot> {
        if index <= self.snapshot.metadata.index {
            return Err(crate::errors::Error::Store(StorageError::Unavailable));
        }

        let offset = self.dummy_index();
        if index > self.last_index()? {
            panic!(
                "snapshot {} is out of bound last_index({})",
                index,
                self.last_index()?
            );
        }

        self.snapshot.metadata.index = index;
        self.snapshot.metadata.term = self.entries[(index - offset) as usize].term;
        if let Some(cs) = conf_state {
            self.snapshot.conf_state = cs;
        }
        self.snapshot.data = data;
        Ok(self.snapshot.clone())
    }
}

impl Storage for MemStorage {
    fn initial_state(&self) -> Result<RaftState> {
        Ok(RaftState {
            hard_state: self.hard_state,
            conf_state: self.snapshot.conf_state.clone(),
        })
    }

    fn entries(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>> {
        let offset = self.dummy_index();
        if lo <= offset {
            return Err(crate::errors::Error::Store(StorageError::Compacted));
        }
        if hi > self.last_index()? + 1 {
            panic!("index out of bound (hi: {}, last: {})", hi, self.last_index()?);
        }
        if self.entries.len() == 1 {
            return Err(crate::errors::Error::Store(StorageError::Unavailable));
        }

        let lo = (lo - offset) as usize;
        let hi = (hi - offset) as usize;
        let mut ents = self.entries[lo..hi].to_vec();
        limit_size(&mut ents, max_size);
        Ok(ents)
    }

    fn term(&self, i: u64) -> Result<u64> {
        let offset = self.dummy_index();
        if i < offset {
            return Err(crate::errors::Error::Store(StorageError::Compacted));
        }
        let idx = (i - offset) as usize;
        if idx >= self.entries.len() {
            return Err(crate::errors::Error::Store(StorageError::Unavailable));
        }
        Ok(self.entries[idx].term)
    }

    fn first_index(&self) -> Result<u64> {
        Ok(self.dummy_index() + 1)
    }

    fn last_index(&self) -> Result<u64> {
        Ok(self.dummy_index() + self.entries.len() as u64 - 1)
    }

    fn snapshot(&self) -> Result<Snapshot> {
        Ok(self.snapshot.clone())
    }
}

/// Trims `ents` so the cumulative approximate size stays within `max_size`,
/// but always keeps at least one entry.
pub(crate) fn limit_size(ents: &mut Vec<Entry>, max_size: u64) {
    if ents.len() <= 1 {
        return;
    }
    let mut size = 0u64;
    let mut limit = ents.len();
    for (i, e) in ents.iter().enumerate() {
        size += e.approx_size();
        if i > 0 && size > max_size {
            limit = i;
            break;
        }
    }
    ents.truncate(limit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raftpb::EntryType;

    fn new_entry(index: u64, term: u64) -> Entry {
        Entry::new(EntryType::Normal, term, index, vec![])
    }

    #[test]
    fn append_extends_log() {
        let mut store = MemStorage::new();
        store.append(&[new_entry(1, 1), new_entry(2, 1)]).unwrap();
        assert_eq!(store.last_index().unwrap(), 2);
        assert_eq!(store.term(1).unwrap(), 1);
    }

    #[test]
    fn append_truncates_conflicting_suffix() {
        let mut store = MemStorage::new();
        store
            .append(&[new_entry(1, 1), new_entry(2, 1), new_entry(3, 1)])
            .unwrap();
        store.append(&[new_entry(2, 2)]).unwrap();
        assert_eq!(store.last_index().unwrap(), 2);
        assert_eq!(store.term(2).unwrap(), 2);
    }

    #[test]
    fn term_before_snapshot_is_compacted() {
        let mut store = MemStorage::new();
        store
            .append(&[new_entry(1, 1), new_entry(2, 1), new_entry(3, 2)])
            .unwrap();
        store.compact(2).unwrap();
        assert_eq!(
            store.term(1),
            Err(crate::errors::Error::Store(StorageError::Compacted))
        );
        assert_eq!(store.term(2).unwrap(), 1);
    }

    #[test]
    fn apply_snapshot_resets_log() {
        let mut store = MemStorage::new();
        let mut snap = crate::raftpb::Snapshot::default();
        snap.metadata.index = 5;
        snap.metadata.term = 3;
        store.apply_snapshot(snap).unwrap();
        assert_eq!(store.first_index().unwrap(), 6);
        assert_eq!(store.last_index().unwrap(), 5);
        assert_eq!(store.term(5).unwrap(), 3);
    }

    #[test]
    fn entries_respect_max_size() {
        let mut store = MemStorage::new();
        store
            .append(&[
                Entry::new(EntryType::Normal, 1, 1, vec![0u8; 50]),
                Entry::new(EntryType::Normal, 1, 2, vec![0u8; 50]),
                Entry::new(EntryType::Normal, 1, 3, vec![0u8; 50]),
            ])
            .unwrap();
        let ents = store.entries(1, 4, 1).unwrap();
        assert_eq!(ents.len(), 1);
        let ents = store.entries(1, 4, u64::max_value()).unwrap();
        assert_eq!(ents.len(), 3);
    }
}

use crate::errors::{Error, Result, StorageError};
use crate::log_unstable::Unstable;
use crate::raftpb::{Entry, Snapshot};
use crate::storage::Storage;

/// The unified view of a node's log: a durable prefix held by the storage
/// collaborator, and an unstable suffix held in memory until it is
/// acknowledged as persisted.
pub struct RaftLog<T: Storage> {
    /// Contains all stable entries since the last snapshot.
    pub store: T,

    /// Contains all unstable entries and any pending snapshot; they will be
    /// pushed into storage once the driver reports them persisted.
    pub unstable: Unstable,

    /// The highest log position known to be stored on a quorum of nodes.
    pub committed: u64,

    /// The highest log position the application has been instructed to
    /// apply. Invariant: `applied <= committed`.
    pub applied: u64,

    tag: String,
}

impl<T: Storage> RaftLog<T> {
    pub fn new(store: T, tag: String) -> RaftLog<T> {
        let first_index = store.first_index().unwrap();
        let last_index = store.last_index().unwrap();
        RaftLog {
            committed: first_index - 1,
            applied: first_index - 1,
            unstable: Unstable::new(last_index + 1, tag.clone()),
            store,
            tag,
        }
    }

    pub fn last_index(&self) -> u64 {
        if let Some(last_index) = self.unstable.maybe_last_index() {
            return last_index;
        }
        self.store.last_index().expect("storage unavailable")
    }

    pub fn first_index(&self) -> u64 {
        if let Some(fi) = self.unstable.maybe_first_index() {
            return fi;
        }
        self.store.first_index().expect("storage unavailable")
    }

    pub fn last_term(&self) -> u64 {
        let last_index = self.last_index();
        self.term(last_index).unwrap_or(0)
    }

    pub fn applied_to(&mut self, i: u64) {
        if i == 0 {
            return;
        }
        if i > self.committed || i < self.applied {
            panic!(
                "applied({}) is out of range [prev applied({}), committed({})]",
                i, self.applied, self.committed
            );
        }
        self.applied = i;
    }

    /// Advances `committed` to `i`. `i` must not regress and must not exceed
    /// `last_index`.
    pub fn commit_to(&mut self, i: u64) {
        if i > self.committed {
            if self.last_index() < i {
                panic!(
                    "to_commit({}) is out of range [last_index({})]. Was the raft log corrupted, truncated, or lost?",
                    i,
                    self.last_index()
                );
            }
            self.committed = i;
        }
    }

    /// Advances `committed` to `index` only if the term stored there matches
    /// `term`, guarding against the Raft "Figure 8" anomaly. Returns whether
    /// the commit index changed.
    pub fn maybe_commit(&mut self, index: u64, term: u64) -> bool {
        if index > self.committed && self.zero_term_on_err_compacted(index) == term {
            self.commit_to(index);
            return true;
        }
        false
    }

    pub fn term(&self, i: u64) -> Result<u64> {
        let dummy_index = self.first_index().wrapping_sub(1);
        if i < dummy_index || i > self.last_index() {
            return Ok(0);
        }

        if let Some(t) = self.unstable.maybe_term(i) {
            return Ok(t);
        }

        match self.store.term(i) {
            Ok(t) => Ok(t),
            Err(e) => match &e {
                Error::Store(StorageError::Compacted) | Error::Store(StorageError::Unavailable) => {
                    Err(e)
                }
                _ => panic!("unexpected error: {:?}", e),
            },
        }
    }

    fn zero_term_on_err_compacted(&self, i: u64) -> u64 {
        match self.term(i) {
            Ok(t) => t,
            Err(Error::Store(StorageError::Compacted)) => 0,
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }

    pub fn get_applied(&self) -> u64 {
        self.applied
    }

    pub fn get_storage(&self) -> &T {
        &self.store
    }

    /// Returns up to `max_size` worth of entries in `[lo, hi)`.
    pub fn entries(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>> {
        if lo == hi {
            return Ok(Vec::new());
        }
        self.slice(lo, hi, max_size)
    }

    /// Returns the unstable entries not yet persisted to storage.
    pub fn unstable_entries(&self) -> Option<&[Entry]> {
        if self.unstable.entries.is_empty() {
            None
        } else {
            Some(&self.unstable.entries)
        }
    }

    /// Returns `true` if there exists at least one committed entry not yet
    /// applied.
    pub fn has_next_entries(&self) -> bool {
        self.committed > self.applied
    }

    /// Returns the committed entries not yet applied.
    pub fn next_entries(&self, max_size: u64) -> Option<Vec<Entry>> {
        let offset = std::cmp::max(self.applied + 1, self.first_index());
        if self.committed + 1 > offset {
            match self.slice(offset, self.committed + 1, max_size) {
                Ok(ents) => {
                    if ents.is_empty() {
                        None
                    } else {
                        Some(ents)
                    }
                }
                Err(e) => panic!("unexpected error when getting unapplied entries ({:?})", e),
            }
        } else {
            None
        }
    }

    pub fn is_up_to_date(&self, last_index: u64, term: u64) -> bool {
        term > self.last_term() || (term == self.last_term() && last_index >= self.last_index())
    }

    /// Tries to append `ents` after `(prev_index, prev_term)`. Returns the
    /// new last index on success, `None` if `prev_index`/`prev_term` do not
    /// match what we have.
    pub fn maybe_append(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        committed: u64,
        ents: &[Entry],
    ) -> Option<u64> {
        if !self.match_term(prev_index, prev_term) {
            return None;
        }

        let last_new_index = prev_index + ents.len() as u64;
        match self.find_conflict(ents) {
            0 => {}
            ci if ci <= self.committed => {
                panic!(
                    "entry {} conflict with committed entry [committed({})]",
                    ci, self.committed
                );
            }
            ci => {
                let offset = prev_index + 1;
                self.append(&ents[(ci - offset) as usize..]);
            }
        }

        self.commit_to(std::cmp::min(committed, last_new_index));
        Some(last_new_index)
    }

    pub fn append(&mut self, ents: &[Entry]) -> u64 {
        if ents.is_empty() {
            return self.last_index();
        }
        let after = ents[0].index - 1;
        if after < self.committed {
            panic!(
                "after({}) is out of range [committed({})]",
                after, self.committed
            );
        }
        self.unstable.truncate_and_append(ents);
        self.last_index()
    }

    /// Returns the index of the first entry in `ents` whose term conflicts
    /// with what we already have stored at that index, or 0 if there is no
    /// conflict and every entry in `ents` is already present.
    fn find_conflict(&self, ents: &[Entry]) -> u64 {
        for e in ents {
            if !self.match_term(e.index, e.term) {
                if e.index <= self.last_index() {
                    log::info!(
                        "{} found conflict at index {} [existing term: {}, conflicting term: {}]",
                        self.tag,
                        e.index,
                        self.zero_term_on_err_compacted(e.index),
                        e.term,
                    );
                }
                return e.index;
            }
        }
        0
    }

    fn match_term(&self, i: u64, term: u64) -> bool {
        match self.term(i) {
            Ok(t) => t == term,
            Err(_) => false,
        }
    }

    /// Resets the log to a snapshot boundary.
    pub fn restore(&mut self, snap: Snapshot) {
        log::info!(
            "{} log [{}] starts to restore snapshot [index: {}, term: {}]",
            self.tag,
            self.to_string(),
            snap.metadata.index,
            snap.metadata.term
        );
        self.committed = snap.metadata.index;
        self.unstable.restore(snap);
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        if let Some(snap) = &self.unstable.snapshot {
            return Ok(snap.clone());
        }
        self.store.snapshot()
    }

    pub fn must_check_out_of_bounds(&self, low: u64, high: u64) -> Result<()> {
        if low > high {
            panic!("invalid slice {} > {}", low, high);
        }

        let fi = self.first_index();
        if low < fi {
            return Err(Error::Store(StorageError::Compacted));
        }

        let hi = self.last_index() + 1;
        if high > hi {
            panic!("slice[{},{}) out of bound [{},{}]", low, high, fi, hi);
        }
        Ok(())
    }

    fn slice(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>> {
        self.must_check_out_of_bounds(lo, hi)?;
        if lo == hi {
            return Ok(Vec::new());
        }

        let mut ents = Vec::new();
        if lo < self.unstable.offset {
            let stored = self
                .store
                .entries(lo, std::cmp::min(hi, self.unstable.offset), max_size)?;
            if (stored.len() as u64) < std::cmp::min(hi, self.unstable.offset) - lo {
                // Storage already truncated what we asked for via max_size;
                // nothing more to add from the unstable suffix.
                return Ok(stored);
            }
            ents = stored;
        }

        if hi > self.unstable.offset {
            let unstable_lo = std::cmp::max(lo, self.unstable.offset);
            ents.extend_from_slice(self.unstable.slice(unstable_lo, hi));
        }

        crate::storage::limit_size(&mut ents, max_size);
        Ok(ents)
    }

    pub fn to_string(&self) -> String {
        format!(
            "committed={}, applied={}, unstable.offset={}, unstable.entries.len()={}",
            self.committed,
            self.applied,
            self.unstable.offset,
            self.unstable.entries.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raftpb::EntryType;
    use crate::storage::MemStorage;

    fn new_entry(index: u64, term: u64) -> Entry {
        Entry::new(EntryType::Normal, term, index, vec![])
    }

    fn new_log() -> RaftLog<MemStorage> {
        RaftLog::new(MemStorage::new(), "test".to_string())
    }

    #[test]
    fn append_advances_last_index() {
        let mut log = new_log();
        log.append(&[new_entry(1, 1), new_entry(2, 1)]);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn maybe_append_rejects_term_mismatch() {
        let mut log = new_log();
        log.append(&[new_entry(1, 1)]);
        assert!(log.maybe_append(1, 2, 0, &[new_entry(2, 1)]).is_none());
    }

    #[test]
    fn maybe_append_truncates_conflicting_suffix() {
        let mut log = new_log();
        log.append(&[new_entry(1, 1), new_entry(2, 1), new_entry(3, 1)]);
        let last = log.maybe_append(1, 1, 2, &[new_entry(2, 2)]).unwrap();
        assert_eq!(last, 2);
        assert_eq!(log.term(2).unwrap(), 2);
        assert_eq!(log.committed, 2);
    }

    #[test]
    fn maybe_commit_requires_matching_term() {
        let mut log = new_log();
        log.append(&[new_entry(1, 1), new_entry(2, 2)]);
        assert!(!log.maybe_commit(2, 1));
        assert!(log.maybe_commit(2, 2));
        assert_eq!(log.committed, 2);
    }

    #[test]
    fn is_up_to_date_compares_term_then_index() {
        let mut log = new_log();
        log.append(&[new_entry(1, 1), new_entry(2, 1)]);
        assert!(log.is_up_to_date(2, 1));
        assert!(!log.is_up_to_date(1, 1));
        assert!(log.is_up_to_date(1, 2));
    }

    #[test]
    fn maybe_append_empty_is_noop_except_commit() {
        let mut log = new_log();
        log.append(&[new_entry(1, 1), new_entry(2, 1)]);
        let last = log.maybe_append(2, 1, 2, &[]).unwrap();
        assert_eq!(last, 2);
        assert_eq!(log.committed, 2);
    }
}

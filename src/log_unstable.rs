use crate::raftpb::{Entry, Snapshot};

/// The in-memory suffix of the log not yet acknowledged as persisted by the
/// storage collaborator.
///
/// `entries[i]` has raft log position `offset + i`. `entries` is empty
/// whenever there is a pending snapshot but no entries have been appended on
/// top of it yet.
#[derive(Debug, Default)]
pub struct Unstable {
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<Entry>,
    pub offset: u64,
    tag: String,
}

impl Unstable {
    pub fn new(offset: u64, tag: String) -> Unstable {
        Unstable {
            snapshot: None,
            entries: Vec::new(),
            offset,
            tag,
        }
    }

    pub fn maybe_first_index(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|s| s.metadata.index + 1)
    }

    pub fn maybe_last_index(&self) -> Option<u64> {
        if !self.entries.is_empty() {
            return Some(self.offset + self.entries.len() as u64 - 1);
        }
        self.snapshot.as_ref().map(|s| s.metadata.index)
    }

    pub fn maybe_term(&self, i: u64) -> Option<u64> {
        if i < self.offset {
            if let Some(snap) = &self.snapshot {
                if i == snap.metadata.index {
                    return Some(snap.metadata.term);
                }
            }
            return None;
        }

        match self.maybe_last_index() {
            Some(last) if i <= last => Some(self.entries[(i - self.offset) as usize].term),
            _ => None,
        }
    }

    /// Marks entries up to `index` as stabilized into storage, dropping them
    /// from the unstable buffer.
    pub fn stable_to(&mut self, index: u64, term: u64) {
        match self.maybe_term(index) {
            Some(t) if t == term && index >= self.offset => {
                let n = (index + 1 - self.offset) as usize;
                self.entries.drain(..n);
                self.offset = index + 1;
            }
            _ => {}
        }
    }

    /// Marks a pending snapshot as stabilized, dropping it.
    pub fn stable_snap_to(&mut self, index: u64) {
        if let Some(snap) = &self.snapshot {
            if snap.metadata.index == index {
                self.snapshot = None;
            }
        }
    }

    pub fn restore(&mut self, snap: Snapshot) {
        self.offset = snap.metadata.index + 1;
        self.entries.clear();
        self.snapshot = Some(snap);
    }

    /// Appends `ents`, truncating any unstable suffix that conflicts with
    /// the new entries' starting index.
    pub fn truncate_and_append(&mut self, ents: &[Entry]) {
        if ents.is_empty() {
            return;
        }

        let after = ents[0].index;
        if after == self.offset + self.entries.len() as u64 {
            self.entries.extend_from_slice(ents);
        } else if after <= self.offset {
            log::info!("{} replace the unstable entries from index {}", self.tag, after);
            self.offset = after;
            self.entries = ents.to_vec();
        } else {
            let keep = (after - self.offset) as usize;
            self.entries.truncate(keep);
            self.entries.extend_from_slice(ents);
        }
    }

    /// Returns the subrange `[lo, hi)` of unstable entries, assuming it lies
    /// entirely within the unstable buffer.
    pub fn slice(&self, lo: u64, hi: u64) -> &[Entry] {
        &self.entries[(lo - self.offset) as usize..(hi - self.offset) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raftpb::EntryType;

    fn new_entry(index: u64, term: u64) -> Entry {
        Entry::new(EntryType::Normal, term, index, vec![])
    }

    #[test]
    fn append_extends_contiguous_suffix() {
        let mut u = Unstable::new(1, "t".into());
        u.truncate_and_append(&[new_entry(1, 1)]);
        u.truncate_and_append(&[new_entry(2, 1)]);
        assert_eq!(u.maybe_last_index(), Some(2));
    }

    #[test]
    fn append_truncates_conflict() {
        let mut u = Unstable::new(1, "t".into());
        u.truncate_and_append(&[new_entry(1, 1), new_entry(2, 1), new_entry(3, 1)]);
        u.truncate_and_append(&[new_entry(2, 2)]);
        assert_eq!(u.maybe_last_index(), Some(2));
        assert_eq!(u.maybe_term(2), Some(2));
    }

    #[test]
    fn stable_to_drops_prefix() {
        let mut u = Unstable::new(1, "t".into());
        u.truncate_and_append(&[new_entry(1, 1), new_entry(2, 1)]);
        u.stable_to(1, 1);
        assert_eq!(u.offset, 2);
        assert_eq!(u.entries.len(), 1);
    }
}

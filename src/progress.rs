/// ## Progress
///
/// Progress represents a follower's progress in the view of the leader. Leader maintains
/// progresses of all followers, and sends `replication message` to the follower based on
/// its progress. `replication message` is a `msgApp` with log entries.
///
/// A progress has two attributes: `match` and `next`. `match` is the index of the highest
/// known matched entry. If leader knows nothing about follower's replication status, `match`
/// is set to zero. `next` is the index of the first entry that will be replicated to the
/// follower. Leader puts entries from `next` to its latest one in the next `replication message`.
///
/// A progress is in one of three states: `probe`, `replicate`, `snapshot`.
///
/// ```text
///                             +--------------------------------------------------------+
///                             |                  send snapshot                         |
///                             |                                                        |
///                   +---------+----------+                                  +----------v---------+
///               +--->       probe        |                                  |      snapshot      |
///               |   |  max inflight = 1  <----------------------------------+  max inflight = 0  |
///               |   +---------+----------+                                  +--------------------+
///               |             |            1. snapshot success
///               |             |               (next=snapshot.index + 1)
///               |             |            2. snapshot failure
///               |             |               (no change)
///               |             |            3. receives msgAppResp(rej=false&&index>lastsnap.index)
///               |             |               (match=m.index,next=match+1)
/// receives msgAppResp(rej=true)
/// (next=max(match+1, min(rejected, hint+1)))
///               |             |
///               |             |
///               |             |   receives msgAppResp(rej=false&&index>match)
///               |             |   (match=m.index,next=match+1)
///               |             |
///               |             |
///               |             |
///               |   +---------v----------+
///               |   |     replicate      |
///               +---+  max inflight = n  |
///                   +--------------------+
/// ```
///
/// When the progress of a follower is in `probe` state, leader sends at most one `replication
/// message` per heartbeat interval. The leader sends `replication message` slowly and probes
/// the actual progress of the follower. A `msgHeartbeatResp` or a `msgAppResp` with reject might
/// trigger the sending of the next `replication message`.
///
/// When the progress of a follower is in `replicate` state, leader sends `replication message`,
/// then optimistically increases `next` to the latest entry sent. This is an optimized state for
/// fast replicating log entries to the follower.
///
/// When the progress of a follower is in `snapshot` state, leader stops sending any
/// `replication message`.
///
/// A newly elected leader sets the progresses of all the followers to `probe` state with
/// `match` = 0 and `next` = last index. The leader slowly (at most once per heartbeat) sends
/// `replication message` to the follower and probes its progress.
///
/// A progress changes to `replicate` when the follower replies with a non-rejection
/// `msgAppResp`, which implies that it has matched the index sent. At this point, leader starts
/// to stream log entries to the follower fast. The progress will fall back to `probe` when the
/// follower replies a rejection `msgAppResp` or the link layer reports the follower is
/// unreachable.
///
/// A progress changes from `probe` to `snapshot` when the follower falls very far behind and
/// requires a snapshot. After sending `msgSnap`, the leader waits until the success, failure or
/// abortion of the previous snapshot sent. The progress will go back to `probe` after the sending
/// result is applied.
///
/// ### Flow control
///
/// 1. Limit the max size of a message sent per message. Lower the cost at probing state as we
///    limit the size per message; lower the penalty when aggressively decreased to a too low
///    `next`.
/// 2. Limit the number of in-flight messages when in `replicate` state, so a leader does not
///    overflow the transport's own sending buffer and trigger a storm of unnecessary resends.
use std::cmp;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ProgressState {
    Probe,
    Replicate,
    Snapshot,
}

impl Default for ProgressState {
    fn default() -> ProgressState {
        ProgressState::Probe
    }
}

#[derive(Debug, Default, Clone)]
pub struct Progress {
    pub matched: u64,
    pub next: u64,
    pub state: ProgressState,
    pub paused: bool,
    pub pending_snapshot: u64,
    pub recent_active: bool,
    pub ins: Inflights,
}

impl Progress {
    pub fn new(next: u64, max_inflight: usize) -> Progress {
        Progress {
            matched: 0,
            next,
            state: ProgressState::Probe,
            paused: false,
            pending_snapshot: 0,
            recent_active: false,
            ins: Inflights::new(max_inflight),
        }
    }

    fn reset_state(&mut self, state: ProgressState) {
        self.paused = false;
        self.pending_snapshot = 0;
        self.state = state;
        self.ins.reset();
    }

    pub fn become_probe(&mut self) {
        // If the original state was ProgressState::Snapshot, the pending snapshot has
        // been sent to this peer successfully, so probe from pending_snapshot + 1.
        // Otherwise the original state is ProgressState::Replicate and the follower
        // rejected the leader's append.
        if self.state == ProgressState::Snapshot {
            let pending_snapshot = self.pending_snapshot;
            self.reset_state(ProgressState::Probe);
            self.next = cmp::max(self.matched + 1, pending_snapshot + 1);
        } else {
            self.reset_state(ProgressState::Probe);
            self.next = self.matched + 1;
        }
    }

    pub fn become_replicate(&mut self) {
        self.reset_state(ProgressState::Replicate);
        self.next = self.matched + 1;
    }

    pub fn become_snapshot(&mut self, index: u64) {
        self.reset_state(ProgressState::Snapshot);
        self.pending_snapshot = index;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Returns true and advances `match`/`next` if `n` is newer than what we
    /// already knew was replicated.
    pub fn maybe_update(&mut self, n: u64) -> bool {
        let mut updated = false;
        if self.matched < n {
            self.matched = n;
            updated = true;
            self.resume();
        }

        if self.next < n + 1 {
            self.next = n + 1;
        }

        updated
    }

    /// Handles a rejected append. `hint` is the rejecting follower's own
    /// last index, echoed back in the rejection. Returns true if `next` was
    /// decremented.
    pub fn maybe_decr_to(&mut self, rejected: u64, hint: u64) -> bool {
        if self.state == ProgressState::Replicate {
            if rejected <= self.matched {
                return false;
            }
            self.next = cmp::max(self.matched + 1, cmp::min(rejected, hint + 1));
            self.resume();
            return true;
        }

        // Probe state: only believe the first rejection for the current `next`.
        if self.next == 0 || self.next - 1 != rejected {
            return false;
        }

        self.next = cmp::max(self.matched + 1, cmp::min(rejected, hint + 1));
        self.resume();
        true
    }

    // When the progress of a follower is in `replicate` state, leader sends
    // `replication message`, then optimistically increases `next` to the latest entry sent.
    pub fn optimistic_update(&mut self, n: u64) {
        self.next = n + 1;
    }

    /// Returns whether sending log entries to this node has been paused. A
    /// node may be paused because it recently rejected an append, is
    /// currently waiting for a snapshot, or has reached max_inflight_msgs.
    pub fn is_paused(&self) -> bool {
        match self.state {
            ProgressState::Probe => self.paused,
            ProgressState::Replicate => self.ins.full(),
            ProgressState::Snapshot => true,
        }
    }

    pub fn snapshot_failure(&mut self) {
        self.pending_snapshot = 0;
    }

    /// Returns true if normal replication has caught up to the pending
    /// snapshot, so the snapshot can be abandoned.
    pub fn need_snapshot_abort(&self) -> bool {
        self.state == ProgressState::Snapshot && self.matched >= self.pending_snapshot
    }
}

/// Fixed-capacity FIFO of ascending indices, tracking the tail index of each
/// outstanding append batch sent to a peer in `Replicate` mode.
#[derive(Debug, Default, Clone)]
pub struct Inflights {
    start: usize,
    count: usize,
    size: usize,
    buffer: Vec<u64>,
}

impl Inflights {
    pub fn new(size: usize) -> Inflights {
        Inflights {
            start: 0,
            count: 0,
            size,
            buffer: Vec::with_capacity(size),
        }
    }

    /// Records an in-flight append batch whose last entry is `index`. `index`
    /// must be strictly greater than every index currently stored; adding
    /// while `full()` is a programming error.
    pub fn add(&mut self, index: u64) {
        if self.full() {
            panic!("cannot add into a full inflights");
        }

        let mut next = self.start + self.count;
        if next >= self.size {
            next -= self.size;
        }

        if self.buffer.len() <= next {
            self.buffer.resize(next + 1, 0);
        }
        self.buffer[next] = index;
        self.count += 1;
    }

    /// Frees the longest prefix of in-flight batches whose index is `<= to`.
    pub fn free_to(&mut self, to: u64) {
        if self.count == 0 || to < self.buffer[self.start] {
            return;
        }

        let mut i = 0;
        let mut idx = self.start;
        while i < self.count {
            if to < self.buffer[idx] {
                break;
            }
            idx += 1;
            if idx >= self.size {
                idx -= self.size;
            }
            i += 1;
        }

        self.count -= i;
        self.start = idx;
        if self.count == 0 {
            self.start = 0;
        }
    }

    /// Frees the single oldest in-flight batch.
    pub fn free_first(&mut self) {
        if self.count > 0 {
            let to = self.buffer[self.start];
            self.free_to(to);
        }
    }

    pub fn full(&self) -> bool {
        self.count == self.size
    }

    pub fn reset(&mut self) {
        self.start = 0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maybe_update_advances_match_and_next() {
        let mut p = Progress::new(5, 4);
        assert!(p.maybe_update(4));
        assert_eq!(p.matched, 4);
        assert_eq!(p.next, 5);
        assert!(!p.maybe_update(4));
    }

    #[test]
    fn maybe_decr_to_probe_only_trusts_matching_next() {
        let mut p = Progress::new(5, 4);
        assert!(!p.maybe_decr_to(3, 10));
        p.next = 4;
        assert!(p.maybe_decr_to(3, 10));
        assert_eq!(p.next, 4);
    }

    #[test]
    fn maybe_decr_to_replicate_clamps_to_hint() {
        let mut p = Progress::new(5, 4);
        p.become_replicate();
        p.matched = 2;
        assert!(p.maybe_decr_to(4, 3));
        assert_eq!(p.next, 4);
    }

    #[test]
    fn inflights_gate_fullness_and_free_to() {
        let mut ins = Inflights::new(3);
        ins.add(1);
        ins.add(2);
        ins.add(3);
        assert!(ins.full());
        ins.free_to(2);
        assert!(!ins.full());
        ins.add(4);
        assert!(ins.full());
    }

    #[test]
    fn is_paused_matches_mode() {
        let mut p = Progress::new(1, 1);
        assert!(!p.is_paused());
        p.pause();
        assert!(p.is_paused());
        p.become_replicate();
        assert!(!p.is_paused());
        p.ins.add(1);
        assert!(p.is_paused());
        p.become_snapshot(5);
        assert!(p.is_paused());
    }
}

use crate::config::Config;
use crate::errors::Result;
use crate::raft::{Raft, SoftState, StateRole};
use crate::raftpb::{ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState, Message, MessageType, NodeId, Snapshot};
use crate::read_only::ReadState;
use crate::storage::Storage;

/// A bundle of everything a driver must persist, send, and apply before the
/// core may be stepped again: unstable entries to write to storage,
/// committed entries to hand to the application, messages to push to the
/// transport, and soft/hard state if either changed since the last `Ready`.
#[derive(Debug, Default, Clone)]
pub struct Ready {
    pub soft_state: Option<SoftState>,
    pub hard_state: Option<HardState>,
    pub entries: Vec<Entry>,
    pub committed_entries: Vec<Entry>,
    pub messages: Vec<Message>,
    pub snapshot: Snapshot,
    pub read_states: Vec<ReadState>,
}

/// A snapshot of a node's current status, for observability / debugging.
#[derive(Debug, Clone)]
pub struct Status {
    pub id: NodeId,
    pub term: u64,
    pub vote: NodeId,
    pub leader_id: NodeId,
    pub state: StateRole,
    pub applied: u64,
    pub commit: u64,
}

/// Wraps [`Raft`] with the `Ready`/`Advance` driving protocol, the shape an
/// embedder actually pumps: pull a `Ready`, persist/send it, call `advance`.
pub struct RawNode<T: Storage> {
    pub raft: Raft<T>,
    prev_ss: SoftState,
    prev_hs: HardState,
}

impl<T: Storage> RawNode<T> {
    pub fn new(config: &Config, store: T) -> Result<RawNode<T>> {
        let raft = Raft::new(config, store)?;
        let prev_ss = raft.soft_state();
        let prev_hs = raft.hard_state();
        Ok(RawNode {
            raft,
            prev_ss,
            prev_hs,
        })
    }

    pub fn tick(&mut self) {
        self.raft.tick();
    }

    pub fn step(&mut self, m: Message) -> Result<()> {
        self.raft.step(m)
    }

    /// Proposes an opaque payload to be appended to the replicated log.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<()> {
        let mut m = Message::new(MessageType::Prop);
        m.from = self.raft.id;
        m.entries = vec![Entry::new(EntryType::Normal, 0, 0, data)];
        self.raft.step(m)
    }

    /// Proposes a single-node membership change. `data` is the caller's own
    /// encoding of `cc` (encoding is a transport concern, not the core's).
    pub fn propose_conf_change(&mut self, cc: &ConfChange, data: Vec<u8>) -> Result<()> {
        let _ = cc;
        let mut m = Message::new(MessageType::Prop);
        m.from = self.raft.id;
        m.entries = vec![Entry::new(EntryType::ConfChange, 0, 0, data)];
        self.raft.step(m)
    }

    /// Applies a committed conf change to the in-memory peer set, returning
    /// the resulting configuration. Call this once the caller has decoded a
    /// committed `ConfChange` entry.
    pub fn apply_conf_change(&mut self, cc: &ConfChange) -> ConfState {
        match cc.change_type {
            ConfChangeType::AddNode => self.raft.add_node(cc.node_id),
            ConfChangeType::RemoveNode => self.raft.remove_node(cc.node_id),
        }
        ConfState {
            nodes: self.raft.nodes(),
        }
    }

    /// Asks the leader (forwarding if necessary) to confirm a read at the
    /// current commit index, tagging the request with `ctx` so the caller
    /// can match the eventual `ReadState` back to its request.
    pub fn read_index(&mut self, ctx: Vec<u8>) {
        let mut m = Message::new(MessageType::ReadIndex);
        m.from = self.raft.id;
        m.entries = vec![Entry::new(EntryType::Normal, 0, 0, ctx)];
        let _ = self.raft.step(m);
    }

    /// Asks the current leader to hand leadership to `transferee`.
    pub fn transfer_leader(&mut self, transferee: NodeId) {
        let mut m = Message::new(MessageType::TransferLeader);
        m.from = transferee;
        let _ = self.raft.step(m);
    }

    pub fn status(&self) -> Status {
        Status {
            id: self.raft.id,
            term: self.raft.term,
            vote: self.raft.vote,
            leader_id: self.raft.leader_id,
            state: self.raft.state,
            applied: self.raft.raft_log.get_applied(),
            commit: self.raft.raft_log.committed,
        }
    }

    /// Cheap check for whether `ready()` would return anything worth acting
    /// on, so a driver can poll without paying for a full `Ready` build.
    pub fn has_ready(&self) -> bool {
        let ss = self.raft.soft_state();
        if ss != self.prev_ss {
            return true;
        }
        let hs = self.raft.hard_state();
        if hs != self.prev_hs {
            return true;
        }
        if let Some(snap) = &self.raft.raft_log.unstable.snapshot {
            if !snap.is_empty() {
                return true;
            }
        }
        if !self.raft.msgs.is_empty() {
            return true;
        }
        if self.raft.raft_log.unstable_entries().is_some() {
            return true;
        }
        if self.raft.raft_log.has_next_entries() {
            return true;
        }
        if !self.raft.read_states.is_empty() {
            return true;
        }
        false
    }

    /// Collects everything produced since the last `advance` into a `Ready`
    /// bundle. The core must not be stepped again until it is acknowledged
    /// via `advance`.
    pub fn ready(&mut self) -> Ready {
        let mut rd = Ready::default();

        let ss = self.raft.soft_state();
        if ss != self.prev_ss {
            rd.soft_state = Some(ss);
        }

        let hs = self.raft.hard_state();
        if hs != self.prev_hs {
            rd.hard_state = Some(hs);
        }

        rd.entries = self
            .raft
            .raft_log
            .unstable_entries()
            .map(|e| e.to_vec())
            .unwrap_or_default();

        rd.committed_entries = self
            .raft
            .raft_log
            .next_entries(u64::max_value())
            .unwrap_or_default();

        rd.messages = std::mem::take(&mut self.raft.msgs);

        if let Some(snap) = &self.raft.raft_log.unstable.snapshot {
            rd.snapshot = snap.clone();
        }

        rd.read_states = std::mem::take(&mut self.raft.read_states);

        self.prev_ss = ss;
        self.prev_hs = hs;

        rd
    }

    /// Acknowledges a previously returned `Ready`: releases the entries it
    /// carried from the unstable buffer and advances `applied`.
    pub fn advance(&mut self, rd: Ready) {
        if let Some(e) = rd.entries.last() {
            self.raft.raft_log.unstable.stable_to(e.index, e.term);
        }
        if !rd.snapshot.is_empty() {
            self.raft.raft_log.unstable.stable_snap_to(rd.snapshot.metadata.index);
        }
        if let Some(e) = rd.committed_entries.last() {
            self.raft.raft_log.applied_to(e.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn new_config(id: NodeId, peers: Vec<NodeId>) -> Config {
        let mut cfg = Config::new(id);
        cfg.peers = peers;
        cfg.election_tick = 10;
        cfg.heartbeat_tick = 1;
        cfg
    }

    #[test]
    fn single_node_becomes_leader_and_commits_noop() {
        let cfg = new_config(1, vec![1]);
        let mut node = RawNode::new(&cfg, MemStorage::new()).unwrap();

        for _ in 0..11 {
            node.tick();
        }

        assert_eq!(node.status().state, StateRole::Leader);
        assert!(node.has_ready());

        let rd = node.ready();
        assert!(!rd.committed_entries.is_empty());
        node.advance(rd);
    }

    #[test]
    fn propose_is_committed_on_single_node_cluster() {
        let cfg = new_config(1, vec![1]);
        let mut node = RawNode::new(&cfg, MemStorage::new()).unwrap();
        for _ in 0..11 {
            node.tick();
        }
        let rd = node.ready();
        node.advance(rd);

        node.propose(b"hello".to_vec()).unwrap();
        let rd = node.ready();
        let payloads: Vec<&[u8]> = rd.committed_entries.iter().map(|e| e.data.as_slice()).collect();
        assert!(payloads.contains(&&b"hello"[..]));
    }
}

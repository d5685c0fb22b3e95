//! Plain in-memory value types shared across the core.
//!
//! The wire format is explicitly the transport's concern (see the crate's
//! non-goals), so these are not generated protobuf messages: they are the
//! value types the state machine itself reasons about, and a transport is
//! free to encode/decode them however it likes.

/// A node identifier. `0` is reserved as "no node".
pub type NodeId = u64;

/// A Raft term.
pub type Term = u64;

/// A log index.
pub type Index = u64;

#[derive(Debug, PartialEq, Clone, Copy, Eq, Hash)]
pub enum EntryType {
    Normal,
    ConfChange,
}

impl Default for EntryType {
    fn default() -> EntryType {
        EntryType::Normal
    }
}

#[derive(Debug, Default, PartialEq, Clone)]
pub struct Entry {
    pub entry_type: EntryType,
    pub term: Term,
    pub index: Index,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(entry_type: EntryType, term: Term, index: Index, data: Vec<u8>) -> Entry {
        Entry {
            entry_type,
            term,
            index,
            data,
        }
    }

    /// Rough size used for batching append messages. The transport decides
    /// the real encoded size; this is only used to bound the number of
    /// entries packed into one `App` message.
    pub fn approx_size(&self) -> u64 {
        (self.data.len() + 24) as u64
    }
}

#[derive(Debug, Default, PartialEq, Clone)]
pub struct ConfState {
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, PartialEq, Clone, Copy, Eq, Hash)]
pub enum ConfChangeType {
    AddNode,
    RemoveNode,
}

#[derive(Debug, PartialEq, Clone)]
pub struct ConfChange {
    pub change_type: ConfChangeType,
    pub node_id: NodeId,
    pub context: Vec<u8>,
}

#[derive(Debug, Default, PartialEq, Clone, Copy)]
pub struct SnapshotMetadata {
    pub index: Index,
    pub term: Term,
}

#[derive(Debug, Default, PartialEq, Clone)]
pub struct Snapshot {
    pub data: Vec<u8>,
    pub metadata: SnapshotMetadata,
    pub conf_state: ConfState,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.metadata.index == 0
    }
}

#[derive(Debug, Default, PartialEq, Clone, Copy)]
pub struct HardState {
    pub term: Term,
    pub vote: NodeId,
    pub commit: Index,
}

#[derive(Debug, PartialEq, Clone, Copy, Eq, Hash)]
pub enum MessageType {
    /// Local: ask self to start a campaign.
    Hup,
    /// Local: leader should broadcast a heartbeat.
    Beat,
    /// Local: leader should verify it still holds a quorum.
    CheckQuorum,
    /// Client proposal.
    Prop,
    /// Replication append.
    App,
    /// Reply to an append.
    AppResp,
    /// Leader liveness ping.
    Heartbeat,
    /// Reply to a heartbeat.
    HeartbeatResp,
    /// Election request.
    Vote,
    /// Reply to an election request.
    VoteResp,
    /// Snapshot install.
    Snap,
    /// Local: report of a snapshot send outcome.
    SnapStatus,
    /// Local: report that a peer is unreachable.
    Unreachable,
    /// Ask the leader to transfer leadership to `from`.
    TransferLeader,
    /// Local: ask self to immediately campaign (sent by the outgoing leader).
    TimeoutNow,
    /// Read-index linearizability request.
    ReadIndex,
    /// Reply to a read-index request.
    ReadIndexResp,
}

/// A single message exchanged between nodes, or a local event routed through
/// the same dispatch entry point (`term == 0` marks a local message).
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub msg_type: MessageType,
    pub to: NodeId,
    pub from: NodeId,
    pub term: Term,
    pub log_term: Term,
    pub index: Index,
    pub entries: Vec<Entry>,
    pub commit: Index,
    pub snapshot: Snapshot,
    pub reject: bool,
    pub reject_hint: Index,
    pub context: Vec<u8>,
}

impl Default for Message {
    fn default() -> Message {
        Message {
            msg_type: MessageType::Hup,
            to: 0,
            from: 0,
            term: 0,
            log_term: 0,
            index: 0,
            entries: Vec::new(),
            commit: 0,
            snapshot: Snapshot::default(),
            reject: false,
            reject_hint: 0,
            context: Vec::new(),
        }
    }
}

impl Message {
    pub fn new(msg_type: MessageType) -> Message {
        Message {
            msg_type,
            ..Default::default()
        }
    }

    /// A message with `term == 0` is a local event, not a real wire message.
    pub fn is_local(&self) -> bool {
        self.term == 0
    }
}

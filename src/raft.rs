use std::cmp;
use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::errors::{Error, Result, StorageError};
use crate::progress::{Progress, ProgressState};
use crate::raft_log::RaftLog;
use crate::raftpb::{Entry, EntryType, HardState, Message, MessageType, NodeId, Snapshot};
use crate::read_only::ReadState;
use crate::storage::Storage;

/// The reserved node id meaning "no node" / "no leader".
pub const INVALID_ID: NodeId = 0;

/// A node's role in the current term.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum StateRole {
    Follower,
    Candidate,
    Leader,
}

impl Default for StateRole {
    fn default() -> StateRole {
        StateRole::Follower
    }
}

/// The volatile, non-persisted half of a node's state.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SoftState {
    pub leader_id: NodeId,
    pub raft_state: StateRole,
}

/// The core Raft state machine. All mutation happens through [`Raft::step`]
/// or [`Raft::tick`]; there is no internal concurrency.
pub struct Raft<T: Storage> {
    pub id: NodeId,
    pub term: u64,
    pub vote: NodeId,
    pub state: StateRole,
    pub leader_id: NodeId,

    pub raft_log: RaftLog<T>,
    pub prs: HashMap<NodeId, Progress>,
    votes: HashMap<NodeId, bool>,

    /// Outgoing messages produced since the last drain. A driver is expected
    /// to send these, in order, and then clear the buffer.
    pub msgs: Vec<Message>,

    pub election_elapsed: usize,
    heartbeat_elapsed: usize,

    election_timeout: usize,
    heartbeat_timeout: usize,
    randomized_election_timeout: usize,

    pub check_quorum: bool,
    max_msg_size: u64,
    max_inflight: usize,

    pub lead_transferee: Option<NodeId>,
    pub pending_conf: bool,

    pub read_states: Vec<ReadState>,

    rng: StdRng,
    tag: String,
}

impl<T: Storage> Raft<T> {
    pub fn new(config: &Config, store: T) -> Result<Raft<T>> {
        config.validate()?;

        let raft_state = store.initial_state()?;
        let raft_log = RaftLog::new(store, format!("{:x}", config.id));

        let mut peers = config.peers.clone();
        if !raft_state.conf_state.nodes.is_empty() {
            if !peers.is_empty() {
                log::warn!(
                    "[id: {:x}] peers in config are ignored since storage already has a configuration",
                    config.id
                );
            }
            peers = raft_state.conf_state.nodes.clone();
        }

        let mut r = Raft {
            id: config.id,
            term: raft_state.hard_state.term,
            vote: raft_state.hard_state.vote,
            state: StateRole::Follower,
            leader_id: INVALID_ID,
            raft_log,
            prs: HashMap::new(),
            votes: HashMap::new(),
            msgs: Vec::new(),
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            election_timeout: config.election_tick,
            heartbeat_timeout: config.heartbeat_tick,
            randomized_election_timeout: config.election_tick,
            check_quorum: config.check_quorum,
            max_msg_size: config.max_size_per_msg,
            max_inflight: config.max_inflight_msgs,
            lead_transferee: None,
            pending_conf: false,
            read_states: Vec::new(),
            rng: StdRng::seed_from_u64(config.id),
            tag: format!("[id: {:x}]", config.id),
        };

        for id in peers {
            r.prs.insert(id, Progress::new(1, r.max_inflight));
        }

        r.raft_log.applied_to(config.applied);
        let term = r.term;
        r.become_follower(term, INVALID_ID);

        log::info!(
            "{} new raft [peers: {:?}, term: {}, commit: {}, applied: {}, last index: {}, last term: {}]",
            r.tag,
            r.nodes(),
            r.term,
            r.raft_log.committed,
            r.raft_log.applied,
            r.raft_log.last_index(),
            r.raft_log.last_term(),
        );

        Ok(r)
    }

    pub fn quorum(&self) -> usize {
        self.prs.len() / 2 + 1
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.prs.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn promotable(&self) -> bool {
        self.prs.contains_key(&self.id)
    }

    pub fn soft_state(&self) -> SoftState {
        SoftState {
            leader_id: self.leader_id,
            raft_state: self.state,
        }
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.raft_log.committed,
        }
    }

    fn new_message(&self, to: NodeId, msg_type: MessageType) -> Message {
        Message {
            msg_type,
            to,
            ..Default::default()
        }
    }

    /// Pushes a message onto the outbound buffer, stamping `from`/`term`.
    /// Only ever used for genuine wire messages; local events are fed
    /// straight into `step` and never touch this buffer.
    fn send(&mut self, mut m: Message) {
        m.from = self.id;
        m.term = self.term;
        self.msgs.push(m);
    }

    fn reset_randomized_election_timeout(&mut self) {
        let lo = self.election_timeout;
        let hi = 2 * self.election_timeout;
        self.randomized_election_timeout = self.rng.gen_range(lo..hi);
    }

    fn reset(&mut self, term: u64) {
        if self.term != term {
            self.term = term;
            self.vote = INVALID_ID;
        }
        self.leader_id = INVALID_ID;
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.reset_randomized_election_timeout();
        self.votes.clear();
        self.lead_transferee = None;
    }

    pub fn become_follower(&mut self, term: u64, leader_id: NodeId) {
        self.reset(term);
        self.leader_id = leader_id;
        self.state = StateRole::Follower;
        log::info!("{} became follower at term {}", self.tag, self.term);
    }

    fn become_candidate(&mut self) {
        assert_ne!(
            self.state,
            StateRole::Leader,
            "invalid transition [leader -> candidate]"
        );
        let term = self.term + 1;
        self.reset(term);
        self.vote = self.id;
        self.state = StateRole::Candidate;
        log::info!("{} became candidate at term {}", self.tag, self.term);
    }

    fn become_leader(&mut self) {
        assert_ne!(
            self.state,
            StateRole::Follower,
            "invalid transition [follower -> leader]"
        );
        let term = self.term;
        self.reset(term);
        self.leader_id = self.id;
        self.state = StateRole::Leader;

        let begin = self.raft_log.committed + 1;
        let end = self.raft_log.last_index() + 1;
        let ents = self
            .raft_log
            .entries(begin, end, u64::max_value())
            .unwrap_or_default();
        let conf_changes = ents
            .iter()
            .filter(|e| e.entry_type == EntryType::ConfChange)
            .count();
        if conf_changes > 1 {
            panic!("{} unexpected double uncommitted config change", self.tag);
        }
        self.pending_conf = conf_changes == 1;

        let last_index = self.raft_log.last_index();
        let max_inflight = self.max_inflight;
        let self_id = self.id;
        for (&id, pr) in self.prs.iter_mut() {
            *pr = Progress::new(last_index + 1, max_inflight);
            if id == self_id {
                pr.matched = last_index;
            }
        }

        let mut noop = vec![Entry::new(EntryType::Normal, 0, 0, Vec::new())];
        self.append_entry(&mut noop);
        log::info!("{} became leader at term {}", self.tag, self.term);
        self.bcast_append();
    }

    fn campaign(&mut self) {
        self.become_candidate();
        let self_id = self.id;
        let term = self.term;
        let granted = self.poll(self_id, true);
        if self.quorum() == granted {
            self.become_leader();
            return;
        }

        for id in self.nodes() {
            if id == self.id {
                continue;
            }
            log::info!(
                "{} [log_term: {}, index: {}] sent vote request to {} at term {}",
                self.tag,
                self.raft_log.last_term(),
                self.raft_log.last_index(),
                id,
                term
            );
            let mut m = self.new_message(id, MessageType::Vote);
            m.index = self.raft_log.last_index();
            m.log_term = self.raft_log.last_term();
            self.send(m);
        }
    }

    /// Records a vote and returns the number of grants tallied so far.
    fn poll(&mut self, id: NodeId, vote: bool) -> usize {
        self.votes.entry(id).or_insert(vote);
        log::info!(
            "{} received vote from {} at term {} (vote: {})",
            self.tag, id, self.term, vote
        );
        self.votes.values().filter(|v| **v).count()
    }

    fn rejections(&self) -> usize {
        self.votes.values().filter(|v| !**v).count()
    }

    pub fn tick(&mut self) {
        match self.state {
            StateRole::Leader => self.tick_heartbeat(),
            _ => self.tick_election(),
        }
    }

    fn tick_election(&mut self) {
        self.election_elapsed += 1;
        if self.promotable() && self.election_elapsed >= self.randomized_election_timeout {
            self.election_elapsed = 0;
            let _ = self.step(Message::new(MessageType::Hup));
        }
    }

    fn tick_heartbeat(&mut self) {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        if self.election_elapsed >= self.election_timeout {
            self.election_elapsed = 0;
            if self.check_quorum {
                let _ = self.step(Message::new(MessageType::CheckQuorum));
            }
            if self.lead_transferee.is_some() {
                self.abort_leader_transfer();
            }
        }

        if self.heartbeat_elapsed >= self.heartbeat_timeout {
            self.heartbeat_elapsed = 0;
            let _ = self.step(Message::new(MessageType::Beat));
        }
    }

    /// The single mutation entry point for non-tick events.
    pub fn step(&mut self, mut m: Message) -> Result<()> {
        // Hup/Beat/CheckQuorum only ever originate from this node's own
        // tick() loop, which never stamps a `from`; a caller handing one in
        // with a real sender has routed a local-only event through the
        // remote-message path.
        if matches!(
            m.msg_type,
            MessageType::Hup | MessageType::Beat | MessageType::CheckQuorum
        ) && m.from != INVALID_ID
        {
            return Err(Error::StepLocalMsg);
        }

        if !m.is_local() {
            if m.term > self.term {
                if m.msg_type == MessageType::Vote {
                    let in_lease = self.check_quorum
                        && self.state != StateRole::Candidate
                        && self.election_elapsed < self.election_timeout;
                    if in_lease {
                        log::info!(
                            "{} [log_term: {}, index: {}, vote: {}] ignored vote from {} [log_term: {}, index: {}] at term {}: lease is not expired",
                            self.tag, self.raft_log.last_term(), self.raft_log.last_index(), self.vote,
                            m.from, m.log_term, m.index, self.term
                        );
                        return Ok(());
                    }
                    self.become_follower(m.term, INVALID_ID);
                } else {
                    log::info!(
                        "{} received a message with higher term from {} [term: {}]",
                        self.tag, m.from, m.term
                    );
                    self.become_follower(m.term, m.from);
                }
            } else if m.term < self.term {
                if self.check_quorum
                    && (m.msg_type == MessageType::App || m.msg_type == MessageType::Heartbeat)
                {
                    let resp = self.new_message(m.from, MessageType::AppResp);
                    self.send(resp);
                } else {
                    log::info!(
                        "{} ignored a message with lower term from {} [term: {}]",
                        self.tag, m.from, m.term
                    );
                }
                return Ok(());
            }
        }

        if m.msg_type == MessageType::Vote {
            self.handle_vote(&m);
            return Ok(());
        }

        match self.state {
            StateRole::Follower => self.step_follower(m),
            StateRole::Candidate => self.step_candidate(m),
            StateRole::Leader => self.step_leader(&mut m),
        }
    }

    fn handle_vote(&mut self, m: &Message) {
        let can_vote = (self.vote == INVALID_ID || self.vote == m.from)
            && self.raft_log.is_up_to_date(m.index, m.log_term);

        if can_vote {
            log::info!(
                "{} [log_term: {}, index: {}, vote: {}] cast vote for {} [log_term: {}, index: {}] at term {}",
                self.tag, self.raft_log.last_term(), self.raft_log.last_index(), self.vote,
                m.from, m.log_term, m.index, self.term
            );
            self.vote = m.from;
            self.election_elapsed = 0;
            let resp = self.new_message(m.from, MessageType::VoteResp);
            self.send(resp);
        } else {
            log::info!(
                "{} [log_term: {}, index: {}, vote: {}] rejected vote from {} [log_term: {}, index: {}] at term {}",
                self.tag, self.raft_log.last_term(), self.raft_log.last_index(), self.vote,
                m.from, m.log_term, m.index, self.term
            );
            let mut resp = self.new_message(m.from, MessageType::VoteResp);
            resp.reject = true;
            self.send(resp);
        }
    }

    fn step_follower(&mut self, mut m: Message) -> Result<()> {
        match m.msg_type {
            MessageType::Hup => {
                if self.promotable() {
                    self.campaign();
                } else {
                    log::warn!("{} is unpromotable and can not campaign", self.tag);
                }
            }
            MessageType::Prop => {
                if self.leader_id == INVALID_ID {
                    log::info!(
                        "{} no leader at term {}; dropping proposal",
                        self.tag, self.term
                    );
                    return Err(Error::ProposalDropped);
                }
                m.to = self.leader_id;
                self.send(m);
            }
            MessageType::App => self.handle_append_entries(m),
            MessageType::Heartbeat => self.handle_heartbeat(m),
            MessageType::Snap => self.handle_snapshot(m),
            MessageType::TransferLeader => {
                if self.leader_id == INVALID_ID {
                    log::debug!(
                        "{} no leader at term {}; dropping leadership transfer",
                        self.tag, self.term
                    );
                    return Ok(());
                }
                m.to = self.leader_id;
                self.send(m);
            }
            MessageType::TimeoutNow => {
                log::info!("{} [term: {}] received TimeoutNow, campaigning immediately", self.tag, self.term);
                if self.promotable() {
                    self.campaign();
                }
            }
            MessageType::ReadIndex => {
                if self.leader_id == INVALID_ID {
                    log::info!(
                        "{} no leader at term {}; dropping index reading msg",
                        self.tag, self.term
                    );
                    return Ok(());
                }
                m.to = self.leader_id;
                self.send(m);
            }
            MessageType::ReadIndexResp => {
                if m.entries.len() != 1 {
                    log::error!(
                        "{} invalid format of ReadIndexResp from {}, entries count: {}",
                        self.tag, m.from, m.entries.len()
                    );
                    return Ok(());
                }
                self.read_states.push(ReadState {
                    index: m.index,
                    request_ctx: m.entries[0].data.clone(),
                });
            }
            _ => {
                log::debug!(
                    "{} no-op step (follower) for {:?} from {}",
                    self.tag, m.msg_type, m.from
                );
            }
        }
        Ok(())
    }

    fn step_candidate(&mut self, m: Message) -> Result<()> {
        match m.msg_type {
            MessageType::Hup => {
                if self.promotable() {
                    self.campaign();
                } else {
                    log::warn!("{} is unpromotable and can not campaign", self.tag);
                }
            }
            MessageType::Prop => {
                log::info!(
                    "{} no leader at term {}; dropping proposal",
                    self.tag, self.term
                );
                return Err(Error::ProposalDropped);
            }
            MessageType::App => {
                self.become_follower(m.term, m.from);
                self.handle_append_entries(m);
            }
            MessageType::Heartbeat => {
                self.become_follower(m.term, m.from);
                self.handle_heartbeat(m);
            }
            MessageType::Snap => {
                self.become_follower(m.term, m.from);
                self.handle_snapshot(m);
            }
            MessageType::VoteResp => {
                let granted = self.poll(m.from, !m.reject);
                let quorum = self.quorum();
                if quorum == granted {
                    self.become_leader();
                } else if quorum == self.rejections() {
                    let term = self.term;
                    self.become_follower(term, INVALID_ID);
                }
            }
            _ => {
                log::debug!(
                    "{} no-op step (candidate) for {:?} from {}",
                    self.tag, m.msg_type, m.from
                );
            }
        }
        Ok(())
    }

    fn step_leader(&mut self, m: &mut Message) -> Result<()> {
        match m.msg_type {
            MessageType::Beat => self.bcast_heartbeat(),
            MessageType::CheckQuorum => {
                if !self.check_quorum_active() {
                    log::warn!(
                        "{} stepped down to follower since quorum is not active",
                        self.tag
                    );
                    let term = self.term;
                    self.become_follower(term, INVALID_ID);
                }
            }
            MessageType::Prop => {
                if m.entries.is_empty() {
                    panic!("{} stepped empty MsgProp", self.tag);
                }
                if !self.prs.contains_key(&self.id) {
                    return Err(Error::ProposalDropped);
                }
                if let Some(transferee) = self.lead_transferee {
                    log::debug!(
                        "{} [term {}] transfer leadership to {} is in progress; dropping proposal",
                        self.tag, self.term, transferee
                    );
                    return Err(Error::ProposalDropped);
                }

                for e in m.entries.iter_mut() {
                    if e.entry_type == EntryType::ConfChange {
                        if self.pending_conf {
                            log::info!(
                                "{} propose conflicting configuration change; dropping",
                                self.tag
                            );
                            *e = Entry::new(EntryType::Normal, e.term, e.index, Vec::new());
                        } else {
                            self.pending_conf = true;
                        }
                    }
                }
                self.append_entry(&mut m.entries);
                self.bcast_append();
            }
            MessageType::ReadIndex => {
                if self.check_quorum {
                    let index = self.raft_log.committed;
                    let mut resp = self.new_message(m.from, MessageType::ReadIndexResp);
                    resp.index = index;
                    resp.entries = m.entries.clone();
                    self.send(resp);
                } else {
                    log::debug!(
                        "{} cannot confirm read index without check_quorum enabled",
                        self.tag
                    );
                }
            }
            MessageType::AppResp => self.handle_append_response(m.clone())?,
            MessageType::HeartbeatResp => self.handle_heartbeat_response(m.clone())?,
            MessageType::SnapStatus => self.handle_snapshot_status(m.clone())?,
            MessageType::Unreachable => self.handle_unreachable(m.clone())?,
            MessageType::TransferLeader => self.handle_transfer_leader(m.clone()),
            _ => {
                log::debug!(
                    "{} no-op step (leader) for {:?} from {}",
                    self.tag, m.msg_type, m.from
                );
            }
        }
        Ok(())
    }

    fn append_entry(&mut self, ents: &mut [Entry]) {
        let last_index = self.raft_log.last_index();
        for (i, e) in ents.iter_mut().enumerate() {
            e.term = self.term;
            e.index = last_index + 1 + i as u64;
        }
        let new_last = self.raft_log.append(ents);
        if let Some(pr) = self.prs.get_mut(&self.id) {
            pr.maybe_update(new_last);
        }
        self.maybe_commit();
    }

    fn handle_append_entries(&mut self, m: Message) {
        self.election_elapsed = 0;
        self.leader_id = m.from;
        match self.raft_log.maybe_append(m.index, m.log_term, m.commit, &m.entries) {
            Some(last_index) => {
                let mut resp = self.new_message(m.from, MessageType::AppResp);
                resp.index = last_index;
                self.send(resp);
            }
            None => {
                log::debug!(
                    "{} rejected MsgApp [log_term: {}, index: {}] from {}",
                    self.tag, m.log_term, m.index, m.from
                );
                let mut resp = self.new_message(m.from, MessageType::AppResp);
                resp.index = m.index;
                resp.reject = true;
                resp.reject_hint = self.raft_log.last_index();
                self.send(resp);
            }
        }
    }

    fn handle_heartbeat(&mut self, m: Message) {
        self.raft_log.commit_to(m.commit);
        self.election_elapsed = 0;
        self.leader_id = m.from;
        let mut resp = self.new_message(m.from, MessageType::HeartbeatResp);
        resp.context = m.context;
        self.send(resp);
    }

    fn handle_snapshot(&mut self, m: Message) {
        let (sindex, sterm) = (m.snapshot.metadata.index, m.snapshot.metadata.term);
        if self.restore(m.snapshot) {
            log::info!(
                "{} [commit: {}] restored snapshot [index: {}, term: {}]",
                self.tag, self.raft_log.committed, sindex, sterm
            );
            let mut resp = self.new_message(m.from, MessageType::AppResp);
            resp.index = self.raft_log.last_index();
            self.send(resp);
        } else {
            log::info!(
                "{} [commit: {}] ignored snapshot [index: {}, term: {}]",
                self.tag, self.raft_log.committed, sindex, sterm
            );
            let mut resp = self.new_message(m.from, MessageType::AppResp);
            resp.index = self.raft_log.committed;
            self.send(resp);
        }
    }

    fn restore(&mut self, snap: Snapshot) -> bool {
        if snap.metadata.index <= self.raft_log.committed {
            return false;
        }

        if let Ok(t) = self.raft_log.term(snap.metadata.index) {
            if t == snap.metadata.term {
                log::info!(
                    "{} [commit: {}, last index: {}, last term: {}] fast-forwarded commit to snapshot [index: {}, term: {}]",
                    self.tag, self.raft_log.committed, self.raft_log.last_index(), self.raft_log.last_term(),
                    snap.metadata.index, snap.metadata.term
                );
                self.raft_log.commit_to(snap.metadata.index);
                return true;
            }
        }

        log::info!(
            "{} [commit: {}, last index: {}, last term: {}] starts to restore snapshot [index: {}, term: {}]",
            self.tag, self.raft_log.committed, self.raft_log.last_index(), self.raft_log.last_term(),
            snap.metadata.index, snap.metadata.term
        );

        let conf_state = snap.conf_state.clone();
        self.raft_log.restore(snap);
        self.prs.clear();
        let last_index = self.raft_log.last_index();
        let max_inflight = self.max_inflight;
        let self_id = self.id;
        for id in conf_state.nodes {
            let mut pr = Progress::new(last_index + 1, max_inflight);
            if id == self_id {
                pr.matched = last_index;
            }
            self.prs.insert(id, pr);
        }
        true
    }

    fn maybe_commit(&mut self) -> bool {
        let mut matched: Vec<u64> = self.prs.values().map(|pr| pr.matched).collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = self.quorum();
        let mci = matched[quorum - 1];
        self.raft_log.maybe_commit(mci, self.term)
    }

    fn bcast_append(&mut self) {
        let ids: Vec<NodeId> = self.prs.keys().cloned().filter(|&id| id != self.id).collect();
        for id in ids {
            self.send_append(id);
        }
    }

    fn bcast_heartbeat(&mut self) {
        let ids: Vec<NodeId> = self.prs.keys().cloned().filter(|&id| id != self.id).collect();
        let commit = self.raft_log.committed;
        for id in ids {
            let to_commit = {
                let pr = self.prs.get_mut(&id).unwrap();
                pr.resume();
                cmp::min(pr.matched, commit)
            };
            let mut m = self.new_message(id, MessageType::Heartbeat);
            m.commit = to_commit;
            self.send(m);
        }
    }

    fn send_append(&mut self, to: NodeId) {
        let (next, paused) = match self.prs.get(&to) {
            Some(pr) => (pr.next, pr.is_paused()),
            None => return,
        };
        if paused {
            return;
        }

        let last_index = self.raft_log.last_index();
        let term_result = self.raft_log.term(next - 1);
        let ents_result = self.raft_log.entries(next, last_index + 1, self.max_msg_size);

        if let (Ok(prev_term), Ok(ents)) = (term_result, ents_result) {
            let prev_index = next - 1;
            let commit = self.raft_log.committed;
            let mut m = self.new_message(to, MessageType::App);
            m.index = prev_index;
            m.log_term = prev_term;
            m.commit = commit;
            m.entries = ents.clone();

            if !ents.is_empty() {
                let pr = self.prs.get_mut(&to).unwrap();
                match pr.state {
                    ProgressState::Replicate => {
                        let last = ents.last().unwrap().index;
                        pr.optimistic_update(last);
                        pr.ins.add(last);
                    }
                    ProgressState::Probe => pr.pause(),
                    ProgressState::Snapshot => {
                        panic!("{} is in ProgressState::Snapshot unexpectedly", self.tag)
                    }
                }
            }
            self.send(m);
            return;
        }

        let recent_active = self.prs.get(&to).map_or(false, |pr| pr.recent_active);
        if !recent_active {
            log::debug!(
                "{} ignore sending snapshot to {} since it is not recently active",
                self.tag, to
            );
            return;
        }

        match self.raft_log.snapshot() {
            Ok(snapshot) => {
                if snapshot.is_empty() {
                    panic!("{} need non-empty snapshot", self.tag);
                }
                let sindex = snapshot.metadata.index;
                let sterm = snapshot.metadata.term;
                log::debug!(
                    "{} [first index: {}, commit: {}] sent snapshot [index: {}, term: {}] to {}",
                    self.tag, self.raft_log.first_index(), self.raft_log.committed, sindex, sterm, to
                );
                if let Some(pr) = self.prs.get_mut(&to) {
                    pr.become_snapshot(sindex);
                }
                let mut m = self.new_message(to, MessageType::Snap);
                m.snapshot = snapshot;
                self.send(m);
            }
            Err(Error::Store(StorageError::SnapshotTemporarilyUnavailable)) => {
                log::debug!(
                    "{} failed to send snapshot to {} because it is temporarily unavailable",
                    self.tag, to
                );
            }
            Err(e) => panic!("{} unexpected error: {:?}", self.tag, e),
        }
    }

    fn handle_append_response(&mut self, m: Message) -> Result<()> {
        if !self.prs.contains_key(&m.from) {
            log::debug!("{} no progress available for {}", self.tag, m.from);
            return Err(Error::StepPeerNotFound);
        }
        self.prs.get_mut(&m.from).unwrap().recent_active = true;

        if m.reject {
            log::debug!(
                "{} received MsgAppResp(rejected, hint: {}) from {} for index {}",
                self.tag, m.reject_hint, m.from, m.index
            );
            let decreased = {
                let pr = self.prs.get_mut(&m.from).unwrap();
                pr.maybe_decr_to(m.index, m.reject_hint)
            };
            if decreased {
                let pr = self.prs.get_mut(&m.from).unwrap();
                if pr.state == ProgressState::Replicate {
                    pr.become_probe();
                }
                self.send_append(m.from);
            }
            return Ok(());
        }

        let old_paused = self.prs.get(&m.from).unwrap().is_paused();
        let updated = self.prs.get_mut(&m.from).unwrap().maybe_update(m.index);
        if updated {
            {
                let pr = self.prs.get_mut(&m.from).unwrap();
                match pr.state {
                    ProgressState::Probe => pr.become_replicate(),
                    ProgressState::Snapshot => {
                        if pr.need_snapshot_abort() {
                            log::debug!(
                                "{} snapshot aborted, resumed sending replication messages to {}",
                                self.tag, m.from
                            );
                            pr.become_probe();
                        }
                    }
                    ProgressState::Replicate => {
                        let index = m.index;
                        pr.ins.free_to(index);
                    }
                }
            }

            if self.maybe_commit() {
                self.bcast_append();
            } else if old_paused {
                self.send_append(m.from);
            }

            if self.lead_transferee == Some(m.from) {
                let last_index = self.raft_log.last_index();
                let matched = self.prs.get(&m.from).unwrap().matched;
                if matched == last_index {
                    log::info!(
                        "{} sent MsgTimeoutNow to {} after received MsgAppResp",
                        self.tag, m.from
                    );
                    self.send_timeout_now(m.from);
                }
            }
        }
        Ok(())
    }

    fn handle_heartbeat_response(&mut self, m: Message) -> Result<()> {
        if !self.prs.contains_key(&m.from) {
            log::debug!("{} no progress available for {}", self.tag, m.from);
            return Err(Error::StepPeerNotFound);
        }
        {
            let pr = self.prs.get_mut(&m.from).unwrap();
            pr.recent_active = true;
            pr.resume();
            if pr.state == ProgressState::Replicate && pr.ins.full() {
                pr.ins.free_first();
            }
        }

        let matched = self.prs.get(&m.from).unwrap().matched;
        if matched < self.raft_log.last_index() {
            self.send_append(m.from);
        }
        Ok(())
    }

    fn handle_snapshot_status(&mut self, m: Message) -> Result<()> {
        if !self.prs.contains_key(&m.from) {
            log::debug!("{} no progress available for {}", self.tag, m.from);
            return Err(Error::StepPeerNotFound);
        }
        let pr = self.prs.get_mut(&m.from).unwrap();
        if pr.state != ProgressState::Snapshot {
            return Ok(());
        }
        if m.reject {
            pr.snapshot_failure();
            log::debug!(
                "{} snapshot failed, resumed sending replication messages to {}",
                self.tag, m.from
            );
        } else {
            log::debug!(
                "{} snapshot succeeded, resumed sending replication messages to {}",
                self.tag, m.from
            );
        }
        pr.become_probe();
        pr.pause();
        Ok(())
    }

    fn handle_unreachable(&mut self, m: Message) -> Result<()> {
        if !self.prs.contains_key(&m.from) {
            log::debug!("{} no progress available for {}", self.tag, m.from);
            return Err(Error::StepPeerNotFound);
        }
        let pr = self.prs.get_mut(&m.from).unwrap();
        if pr.state == ProgressState::Replicate {
            pr.become_probe();
        }
        log::debug!(
            "{} failed to send message to {} because it is unreachable",
            self.tag, m.from
        );
        Ok(())
    }

    fn handle_transfer_leader(&mut self, m: Message) {
        let from = m.from;
        if from == self.id {
            log::debug!("{} ignored transfer leadership to self", self.tag);
            return;
        }

        if let Some(existing) = self.lead_transferee {
            if existing == from {
                log::debug!(
                    "{} already transferring leadership to {}",
                    self.tag, from
                );
                return;
            }
            self.abort_leader_transfer();
        }

        if !self.prs.contains_key(&from) {
            log::warn!("{} transfer leadership to unknown peer {}", self.tag, from);
            return;
        }

        log::info!("{} starts to transfer leadership to {}", self.tag, from);
        self.lead_transferee = Some(from);
        self.election_elapsed = 0;

        let matched = self.prs.get(&from).unwrap().matched;
        if matched == self.raft_log.last_index() {
            self.send_timeout_now(from);
            log::info!(
                "{} sends MsgTimeoutNow to {} immediately since it already has an up-to-date log",
                self.tag, from
            );
        } else {
            self.send_append(from);
        }
    }

    fn send_timeout_now(&mut self, to: NodeId) {
        let m = self.new_message(to, MessageType::TimeoutNow);
        self.send(m);
    }

    pub fn abort_leader_transfer(&mut self) {
        self.lead_transferee = None;
    }

    fn check_quorum_active(&mut self) -> bool {
        let quorum = self.quorum();
        let self_id = self.id;
        let mut active = 1;
        for (&id, pr) in self.prs.iter_mut() {
            if id == self_id {
                continue;
            }
            if pr.recent_active {
                active += 1;
            }
            pr.recent_active = false;
        }
        active >= quorum
    }

    pub fn add_node(&mut self, id: NodeId) {
        self.pending_conf = false;
        if self.prs.contains_key(&id) {
            return;
        }
        let last_index = self.raft_log.last_index();
        self.prs.insert(id, Progress::new(last_index + 1, self.max_inflight));
        log::info!("{} added node {}", self.tag, id);
    }

    pub fn remove_node(&mut self, id: NodeId) {
        self.prs.remove(&id);
        self.pending_conf = false;
        log::info!("{} removed node {}", self.tag, id);

        if self.prs.is_empty() {
            return;
        }

        if self.state == StateRole::Leader && self.maybe_commit() {
            self.bcast_append();
        }

        if self.state == StateRole::Leader && self.lead_transferee == Some(id) {
            self.abort_leader_transfer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raftpb::{ConfState, SnapshotMetadata};
    use crate::storage::MemStorage;

    fn cfg(id: NodeId, peers: Vec<NodeId>) -> Config {
        let mut c = Config::new(id);
        c.peers = peers;
        c.election_tick = 10;
        c.heartbeat_tick = 1;
        c.max_size_per_msg = u64::max_value();
        c
    }

    fn entry(index: u64, term: u64) -> Entry {
        Entry::new(EntryType::Normal, term, index, Vec::new())
    }

    fn new_raft(id: NodeId, peers: Vec<NodeId>) -> Raft<MemStorage> {
        Raft::new(&cfg(id, peers), MemStorage::new()).unwrap()
    }

    fn tick_until_candidate(n: &mut Raft<MemStorage>) {
        for _ in 0..30 {
            if n.state == StateRole::Candidate {
                return;
            }
            n.tick();
        }
        panic!("node never became a candidate");
    }

    #[test]
    fn election_under_partition() {
        let mut n1 = new_raft(1, vec![1, 2, 3]);
        tick_until_candidate(&mut n1);

        assert_eq!(n1.term, 2);
        assert_eq!(n1.msgs.len(), 2);
        assert!(n1.msgs.iter().all(|m| m.msg_type == MessageType::Vote));

        let mut grant = Message::new(MessageType::VoteResp);
        grant.from = 2;
        grant.term = n1.term;
        n1.step(grant).unwrap();

        assert_eq!(n1.state, StateRole::Leader);
        assert!(n1.msgs.iter().any(|m| m.msg_type == MessageType::App));
    }

    #[test]
    fn log_replication_with_lagging_follower() {
        let mut leader = new_raft(1, vec![1, 2]);
        leader.raft_log.append(&[
            entry(1, 4),
            entry(2, 4),
            entry(3, 4),
            entry(4, 5),
            entry(5, 5),
        ]);
        leader.raft_log.commit_to(3);
        leader.term = 5;
        leader.state = StateRole::Leader;
        leader.leader_id = 1;
        leader.prs.get_mut(&1).unwrap().matched = 5;
        leader.prs.get_mut(&1).unwrap().next = 6;
        leader.prs.get_mut(&2).unwrap().next = 6;

        leader.send_append(2);
        let sent = leader.msgs.pop().unwrap();
        assert_eq!(sent.index, 5);
        assert_eq!(sent.log_term, 5);

        let mut reject = Message::new(MessageType::AppResp);
        reject.from = 2;
        reject.term = 5;
        reject.reject = true;
        reject.index = 5;
        reject.reject_hint = 3;
        leader.step(reject).unwrap();

        assert_eq!(leader.prs[&2].next, 4);
        let resend = leader.msgs.pop().unwrap();
        assert_eq!(resend.index, 3);
        assert_eq!(resend.log_term, 4);
        assert_eq!(resend.entries.len(), 2);

        let mut accept = Message::new(MessageType::AppResp);
        accept.from = 2;
        accept.term = 5;
        accept.index = 5;
        leader.step(accept).unwrap();

        assert_eq!(leader.prs[&2].matched, 5);
        assert_eq!(leader.raft_log.committed, 5);
    }

    #[test]
    fn figure_eight_requires_current_term_entry() {
        let mut leader = new_raft(1, vec![1, 2, 3]);
        leader.raft_log.append(&[entry(1, 2), entry(2, 2), entry(3, 2)]);
        leader.term = 4;
        leader.state = StateRole::Leader;

        // A minority (index 3, term 2) is replicated, but we must not commit
        // it on replica count alone: it predates our own term.
        leader.prs.get_mut(&1).unwrap().matched = 3;
        leader.prs.get_mut(&2).unwrap().matched = 3;
        leader.prs.get_mut(&3).unwrap().matched = 0;
        assert!(!leader.maybe_commit());
        assert_eq!(leader.raft_log.committed, 0);

        // Once an entry from the current term is also on a quorum, both
        // become committed together.
        leader.raft_log.append(&[entry(4, 4)]);
        leader.prs.get_mut(&1).unwrap().matched = 4;
        leader.prs.get_mut(&2).unwrap().matched = 4;
        assert!(leader.maybe_commit());
        assert_eq!(leader.raft_log.committed, 4);
    }

    #[test]
    fn leadership_transfer_sends_timeout_now_when_caught_up() {
        let mut leader = new_raft(1, vec![1, 2]);
        leader.raft_log.append(&[entry(1, 1)]);
        leader.term = 1;
        leader.state = StateRole::Leader;
        leader.leader_id = 1;
        leader.prs.get_mut(&2).unwrap().matched = 1;

        let mut transfer = Message::new(MessageType::TransferLeader);
        transfer.from = 2;
        leader.step(transfer).unwrap();

        assert_eq!(leader.lead_transferee, Some(2));
        let sent = leader.msgs.pop().unwrap();
        assert_eq!(sent.msg_type, MessageType::TimeoutNow);
        assert_eq!(sent.to, 2);
    }

    #[test]
    fn snapshot_install_rebuilds_peers_and_progress() {
        let mut follower = new_raft(2, vec![1, 2, 3]);
        follower.raft_log.commit_to(0);

        let mut snap = Snapshot::default();
        snap.metadata = SnapshotMetadata { index: 100, term: 7 };
        snap.conf_state = ConfState {
            nodes: vec![1, 2, 3],
        };

        let mut m = Message::new(MessageType::Snap);
        m.from = 1;
        m.term = follower.term;
        m.snapshot = snap;
        follower.step(m).unwrap();

        assert_eq!(follower.raft_log.committed, 100);
        assert_eq!(follower.raft_log.last_index(), 100);
        let resp = follower.msgs.pop().unwrap();
        assert_eq!(resp.msg_type, MessageType::AppResp);
        assert_eq!(resp.index, 100);
    }

    #[test]
    fn check_quorum_steps_down_leader_without_acks() {
        let mut leader = new_raft(1, vec![1, 2, 3]);
        leader.check_quorum = true;
        leader.term = 3;
        leader.state = StateRole::Leader;
        leader.leader_id = 1;
        for pr in leader.prs.values_mut() {
            pr.recent_active = false;
        }

        leader.step(Message::new(MessageType::CheckQuorum)).unwrap();

        assert_eq!(leader.state, StateRole::Follower);
        assert_eq!(leader.leader_id, INVALID_ID);
    }

    #[test]
    fn higher_term_vote_dropped_within_lease() {
        let mut leader = new_raft(1, vec![1, 2, 3]);
        leader.check_quorum = true;
        leader.term = 3;
        leader.state = StateRole::Leader;
        leader.election_elapsed = 0;

        let mut vote = Message::new(MessageType::Vote);
        vote.from = 2;
        vote.term = 4;
        leader.step(vote).unwrap();

        assert_eq!(leader.term, 3);
        assert_eq!(leader.state, StateRole::Leader);
    }

    #[test]
    fn add_node_is_idempotent_remove_resets_progress() {
        let mut n = new_raft(1, vec![1, 2]);
        n.add_node(2);
        assert_eq!(n.prs.len(), 2);

        n.remove_node(2);
        assert!(!n.prs.contains_key(&2));

        n.add_node(2);
        assert_eq!(n.prs[&2].matched, 0);
        assert_eq!(n.prs[&2].next, n.raft_log.last_index() + 1);
    }

    #[test]
    fn randomized_election_timeout_within_bounds() {
        let n = new_raft(5, vec![1, 2, 3, 4, 5]);
        assert!(n.randomized_election_timeout >= n.election_timeout);
        assert!(n.randomized_election_timeout < 2 * n.election_timeout);
    }

    #[test]
    fn transfer_leader_on_follower_forwards_without_acting() {
        let mut follower = new_raft(2, vec![1, 2, 3]);
        follower.term = 3;
        follower.leader_id = 1;

        let mut transfer = Message::new(MessageType::TransferLeader);
        transfer.from = 3;
        transfer.term = follower.term;
        follower.step(transfer).unwrap();

        assert_eq!(follower.state, StateRole::Follower);
        assert_eq!(follower.msgs.len(), 1);
        let forwarded = follower.msgs.pop().unwrap();
        assert_eq!(forwarded.msg_type, MessageType::TransferLeader);
        assert_eq!(forwarded.to, 1);

        // With no leader known, the message is dropped instead of acted on.
        follower.leader_id = INVALID_ID;
        let mut transfer = Message::new(MessageType::TransferLeader);
        transfer.from = 3;
        transfer.term = follower.term;
        follower.step(transfer).unwrap();

        assert_eq!(follower.state, StateRole::Follower);
        assert!(follower.msgs.is_empty());
    }

    #[test]
    fn check_quorum_accepts_higher_term_append_unlike_vote() {
        let mut leader = new_raft(1, vec![1, 2, 3]);
        leader.check_quorum = true;
        leader.term = 3;
        leader.state = StateRole::Leader;
        leader.leader_id = 1;
        leader.election_elapsed = 0;

        let mut append = Message::new(MessageType::App);
        append.from = 2;
        append.term = 4;
        leader.step(append).unwrap();

        // Unlike a Vote arriving within the same lease window, a higher-term
        // App is never dropped: it steps the node down and is processed.
        assert_eq!(leader.state, StateRole::Follower);
        assert_eq!(leader.term, 4);
        assert_eq!(leader.leader_id, 2);
        let resp = leader.msgs.pop().unwrap();
        assert_eq!(resp.msg_type, MessageType::AppResp);
    }
}

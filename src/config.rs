use crate::errors::{Error, Result};
use crate::raftpb::NodeId;

/// Construction-time configuration for a [`crate::raft::Raft`] node.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node's identifier; must be nonzero.
    pub id: NodeId,

    /// The peers this node starts out knowing about, including itself. Only
    /// consulted when the storage collaborator reports an empty `ConfState`;
    /// once the log has a recorded configuration, that takes precedence.
    pub peers: Vec<NodeId>,

    /// Number of ticks of no activity before a follower or candidate starts
    /// a new election. Must be strictly greater than `heartbeat_tick`.
    pub election_tick: usize,

    /// Number of ticks between heartbeats sent by a leader. Must be nonzero.
    pub heartbeat_tick: usize,

    /// The index the application has already applied through, e.g. when
    /// resuming after a restart.
    pub applied: u64,

    /// Cap, in approximate bytes, on the entries packed into a single append
    /// message. `0` limits a message to at most one entry; `u64::MAX`
    /// effectively removes the cap.
    pub max_size_per_msg: u64,

    /// Cap on the number of in-flight (unacknowledged) append batches per
    /// peer while in `Replicate` mode.
    pub max_inflight_msgs: usize,

    /// Enables the leader-lease disruption protection: a leader steps down
    /// if it cannot confirm a quorum within one election timeout, and
    /// followers refuse a disruptive higher-term vote within their own
    /// lease window.
    pub check_quorum: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            id: 0,
            peers: Vec::new(),
            election_tick: 10,
            heartbeat_tick: 1,
            applied: 0,
            max_size_per_msg: 0,
            max_inflight_msgs: 256,
            check_quorum: false,
        }
    }
}

impl Config {
    pub fn new(id: NodeId) -> Config {
        Config {
            id,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(Error::ConfigInvalid("id must not be zero".to_owned()));
        }

        if self.heartbeat_tick == 0 {
            return Err(Error::ConfigInvalid(
                "heartbeat tick must be greater than 0".to_owned(),
            ));
        }

        if self.election_tick <= self.heartbeat_tick {
            return Err(Error::ConfigInvalid(
                "election tick must be greater than heartbeat tick".to_owned(),
            ));
        }

        if self.max_inflight_msgs == 0 {
            return Err(Error::ConfigInvalid(
                "max inflight messages must be greater than 0".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_id() {
        let mut cfg = Config::new(1);
        cfg.id = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_election_not_greater_than_heartbeat() {
        let mut cfg = Config::new(1);
        cfg.election_tick = 1;
        cfg.heartbeat_tick = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_sane_defaults() {
        let cfg = Config::new(1);
        assert!(cfg.validate().is_ok());
    }
}

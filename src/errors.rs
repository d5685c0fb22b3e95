use quick_error::quick_error;

quick_error! {
    /// Errors coming back from the storage collaborator.
    #[derive(Debug, PartialEq, Clone, Copy)]
    pub enum StorageError {
        /// The requested index is older than the snapshot boundary.
        Compacted {}
        /// The requested index is newer than anything stored.
        Unavailable {}
        /// A snapshot was requested but is not ready yet; retry later.
        SnapshotTemporarilyUnavailable {}
    }
}

quick_error! {
    /// Top level error type for the core state machine.
    #[derive(Debug, PartialEq, Clone)]
    pub enum Error {
        /// Wraps a storage error.
        Store(err: StorageError) {
            from()
            display("storage error: {:?}", err)
        }
        /// Config failed validation at construction time.
        ConfigInvalid(msg: String) {
            display("invalid config: {}", msg)
        }
        /// A local message (term == 0) was routed to code that expects a remote message.
        StepLocalMsg {
            display("raft: cannot step raft local message")
        }
        /// step was called with a message for a peer that is not in the current configuration.
        StepPeerNotFound {
            display("raft: cannot step as peer not found")
        }
        /// The node was asked to propose while it has no log (should never happen).
        ProposalDropped {
            display("raft: proposal dropped")
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use crate::raftpb::Index;

/// A read-index confirmation delivered back to the embedder: `index` is the
/// commit index the read may safely observe, and `request_ctx` echoes the
/// opaque token the caller attached to its `ReadIndex` request.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReadState {
    pub index: Index,
    pub request_ctx: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_state_echoes_context() {
        let rs = ReadState {
            index: 7,
            request_ctx: vec![1, 2, 3],
        };
        assert_eq!(rs.index, 7);
        assert_eq!(rs.request_ctx, vec![1, 2, 3]);
    }
}

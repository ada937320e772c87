//! # event
//!
//! why: tell the embedding application what the node did without coupling it to internals
//! relations: queued by node.rs, vote.rs, replication.rs and gossip/, drained by the runtime
//! what: NodeEvent

use crate::keys::PublicKey;
use crate::log::EntryRef;
use crate::node::NodeState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// No leader traffic arrived in time; an election follows.
    HeartbeatTimeout,
    TermChange { from: u64, to: u64 },
    LeaderChange {
        from: Option<PublicKey>,
        to: Option<PublicKey>,
    },
    StateChange { from: NodeState, to: NodeState },
    /// This node won the election for `term`.
    LeaderElected { term: u64 },
    PeerAlive(PublicKey),
    PeerFailed(PublicKey),
    /// A peer answered with an error message.
    Error { from: PublicKey, reason: String },
    /// The leader accepted a forwarded proposal.
    ProposalAccepted { request_id: u64, entry: EntryRef },
    ProposalRejected { request_id: u64 },
    /// The commit index moved forward.
    Committed { index: u64, term: u64 },
}

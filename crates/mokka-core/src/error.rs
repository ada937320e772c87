//! # error
//!
//! why: give every failure a typed, matchable shape instead of strings
//! relations: TaskError is returned by the task api in node.rs and log.rs, GossipError by gossip/,
//!            ConfigError by config.rs and node construction
//! what: TaskError, ReplicationError, GossipError, ConfigError

use thiserror::Error;

use crate::keys::PublicKey;

/// Failures of the task api. Returned to the caller, never broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("not the leader and no leader is known")]
    NotLeader,
    #[error("no log entry at index {0}")]
    UnknownIndex(u64),
    #[error("task {0} is already reserved")]
    AlreadyReserved(u64),
    #[error("task {0} is not reserved")]
    NotReserved(u64),
    #[error("task {0} is not committed yet")]
    NotCommitted(u64),
}

/// Why a follower refused a replicated entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    #[error("entry {index} would leave a gap after index {last_index}")]
    Gap { index: u64, last_index: u64 },
    #[error("entry {index} declares term {term}, behind recorded term {recorded}")]
    StaleTerm { index: u64, term: u64, recorded: u64 },
    #[error("entry {index} conflicts with committed history")]
    ConflictsWithCommitted { index: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GossipError {
    #[error("signature for {key:?} version {version} does not verify against {owner}")]
    InvalidSignature {
        owner: PublicKey,
        key: String,
        version: u64,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),
    #[error("invalid timing: {0}")]
    InvalidTiming(String),
    #[error("invalid settings: {0}")]
    Json(#[from] serde_json::Error),
}

//! # mokka-core
//!
//! why: implement the mokka consensus engine as a pure, clock-free state machine
//! relations: persisted by mokka-storage, driven over the network by mokka-runtime
//! what: node state machine, signed elections with leader proofs, log replication with task
//!       lifecycle, gossip membership with phi accrual failure detection

pub mod config;
pub mod error;
pub mod event;
pub mod gossip;
pub mod heartbeat;
pub mod keys;
pub mod log;
pub mod message;
pub mod node;
pub mod proof;
pub mod replication;
pub mod vote;

mod processor;

/// Unix time in milliseconds.
pub type Millis = u64;

pub use config::{MokkaConfig, NodeSettings};
pub use error::{ConfigError, GossipError, ReplicationError, TaskError};
pub use event::NodeEvent;
pub use gossip::{GossipValue, PeerAddress};
pub use keys::{PublicKey, SignatureBytes};
pub use log::{EntryRef, LastInfo, Lifecycle, LogEntry};
pub use message::{Message, Outbound, Packet};
pub use node::{HardState, Node, NodeState, Proposal};
pub use proof::Proof;

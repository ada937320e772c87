//! # mokka-runtime
//!
//! why: drive mokka-core nodes with a real clock, real channels and durable storage
//! relations: owns a mokka_core::Node per task, persists through mokka-storage
//! what: Transport trait with the in-process LocalNetwork, NodeRuntime loop, NodeHandle api

pub mod runtime;
pub mod transport;

pub use runtime::{
    restore_node, spawn, unix_millis, NodeHandle, NodeStatus, RuntimeError, FORWARD_TIMEOUT,
};
pub use transport::{LocalNetwork, Transport, TransportError};

//! # transport
//!
//! why: keep the node loop independent of how bytes move between nodes
//! relations: used by runtime.rs to send packets; LocalNetwork backs the tests
//! what: Transport trait, TransportError, LocalNetwork (channels keyed by public key)

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use mokka_core::{Packet, PublicKey};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown peer {0}")]
    UnknownPeer(PublicKey),
    #[error("peer {0} is unreachable")]
    Unreachable(PublicKey),
    #[error("encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Delivers encoded packets to other nodes. Delivery is best effort:
/// the protocol tolerates loss, duplication and reordering.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, from: &PublicKey, to: &PublicKey, packet: &Packet) -> Result<(), TransportError>;
}

#[derive(Default)]
struct Registry {
    inboxes: HashMap<PublicKey, mpsc::UnboundedSender<Vec<u8>>>,
    disconnected: HashSet<PublicKey>,
}

/// In-process network. Packets are encoded with the wire codec and pushed
/// into the receiver's inbox, so decoding runs exactly as it would off a socket.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<RwLock<Registry>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the inbox for `key`. Registering again replaces the old inbox.
    pub fn register(&self, key: PublicKey) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.write().inboxes.insert(key, tx);
        rx
    }

    /// Cut `key` off: nothing it sends or is sent arrives.
    pub fn disconnect(&self, key: &PublicKey) {
        self.registry.write().disconnected.insert(*key);
    }

    pub fn reconnect(&self, key: &PublicKey) {
        self.registry.write().disconnected.remove(key);
    }
}

impl Transport for LocalNetwork {
    fn send(&self, from: &PublicKey, to: &PublicKey, packet: &Packet) -> Result<(), TransportError> {
        let registry = self.registry.read();
        if registry.disconnected.contains(from) || registry.disconnected.contains(to) {
            return Err(TransportError::Unreachable(*to));
        }
        let inbox = registry
            .inboxes
            .get(to)
            .ok_or(TransportError::UnknownPeer(*to))?;
        let bytes = packet.encode()?;
        inbox
            .send(bytes)
            .map_err(|_| TransportError::Unreachable(*to))?;
        debug!(from = %from.short(), to = %to.short(), kind = packet.message.kind(), "packet sent");
        Ok(())
    }
}

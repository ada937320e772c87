//! # runtime
//!
//! why: give each node one task that owns it, so every mutation is serialized
//! relations: drives mokka_core::Node, sends through transport.rs, persists via mokka_storage
//! what: spawn, NodeHandle (async task api), the handling loop, forwarded proposal bookkeeping

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ed25519_dalek::SigningKey;
use mokka_core::{
    ConfigError, EntryRef, GossipValue, HardState, LastInfo, Message, Millis, MokkaConfig, Node,
    NodeEvent, NodeState, Packet, Proposal, PublicKey, TaskError,
};
use mokka_storage::Storage;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::transport::{Transport, TransportError};

const EVENT_CAPACITY: usize = 1024;
const IDLE_WAIT: Duration = Duration::from_secs(60);
/// how long a forwarded proposal may wait for the leader's answer
pub const FORWARD_TIMEOUT: Millis = 3_000;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("storage failed: {0}")]
    Storage(#[from] io::Error),
    #[error("leader rejected forwarded proposal {0}")]
    Rejected(u64),
    #[error("no answer to forwarded proposal {0}")]
    TimedOut(u64),
    #[error("forwarding failed: {0}")]
    Transport(#[from] TransportError),
    #[error("node runtime stopped")]
    Stopped,
}

/// Point-in-time view of a running node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub term: u64,
    pub state: NodeState,
    pub leader: Option<PublicKey>,
    pub last_index: u64,
    pub commit_index: u64,
}

enum Command {
    Propose {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<EntryRef, RuntimeError>>,
    },
    Reserve {
        index: u64,
        reply: oneshot::Sender<Result<(), TaskError>>,
    },
    Execute {
        index: u64,
        reply: oneshot::Sender<Result<Vec<u8>, TaskError>>,
    },
    LastInfo {
        reply: oneshot::Sender<LastInfo>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Join {
        address: String,
        reply: oneshot::Sender<Result<PublicKey, ConfigError>>,
    },
    SetLocal {
        key: String,
        value: GossipValue,
        reply: oneshot::Sender<u64>,
    },
    Shutdown,
}

/// Wall clock in unix milliseconds.
pub fn unix_millis() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as Millis)
        .unwrap_or(0)
}

/// Cheap, cloneable access to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    public_key: PublicKey,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeHandle {
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Events emitted from now on. Slow subscribers miss events rather than block the node.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, RuntimeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| RuntimeError::Stopped)?;
        response.await.map_err(|_| RuntimeError::Stopped)
    }

    /// Append a task. Followers forward it and resolve once the leader answers.
    pub async fn propose(&self, payload: Vec<u8>) -> Result<EntryRef, RuntimeError> {
        self.request(|reply| Command::Propose { payload, reply })
            .await?
    }

    pub async fn reserve(&self, index: u64) -> Result<(), RuntimeError> {
        Ok(self.request(|reply| Command::Reserve { index, reply }).await??)
    }

    pub async fn execute(&self, index: u64) -> Result<Vec<u8>, RuntimeError> {
        Ok(self.request(|reply| Command::Execute { index, reply }).await??)
    }

    pub async fn last_info(&self) -> Result<LastInfo, RuntimeError> {
        self.request(|reply| Command::LastInfo { reply }).await
    }

    pub async fn status(&self) -> Result<NodeStatus, RuntimeError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Start gossiping with `address` (`endpoint/public_key_hex`).
    pub async fn join(&self, address: &str) -> Result<PublicKey, RuntimeError> {
        let address = address.to_string();
        Ok(self.request(|reply| Command::Join { address, reply }).await??)
    }

    pub async fn set_local(&self, key: &str, value: GossipValue) -> Result<u64, RuntimeError> {
        let key = key.to_string();
        self.request(|reply| Command::SetLocal { key, value, reply })
            .await
    }

    /// Ask the loop to stop after the command it is handling.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Rebuild a node from whatever `storage` holds; a fresh directory gives a fresh node.
pub fn restore_node<S: Storage>(
    storage: &S,
    signing_key: SigningKey,
    peers: &[PublicKey],
    config: MokkaConfig,
) -> Result<Node, RuntimeError> {
    let hard_state = storage.load_hard_state()?;
    let entries = storage.load_log()?;
    Ok(Node::restore(signing_key, peers, config, hard_state, entries)?)
}

/// Start `node` on the current tokio runtime. Packets for it arrive on `inbox`.
pub fn spawn<S, T>(
    node: Node,
    storage: S,
    transport: Arc<T>,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
) -> (NodeHandle, JoinHandle<()>)
where
    S: Storage + Send + 'static,
    T: Transport,
{
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let handle = NodeHandle {
        public_key: *node.public_key(),
        commands: commands_tx,
        events: events.clone(),
    };
    let runtime = NodeRuntime {
        saved: node.hard_state(),
        node,
        storage,
        transport,
        commands,
        inbox,
        events,
        pending: HashMap::new(),
    };
    (handle, tokio::spawn(runtime.run()))
}

struct PendingProposal {
    reply: oneshot::Sender<Result<EntryRef, RuntimeError>>,
    expires_at: Millis,
}

struct NodeRuntime<S, T> {
    node: Node,
    storage: S,
    transport: Arc<T>,
    commands: mpsc::UnboundedReceiver<Command>,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    events: broadcast::Sender<NodeEvent>,
    /// forwarded proposals waiting for the leader's answer
    pending: HashMap<u64, PendingProposal>,
    saved: HardState,
}

impl<S: Storage, T: Transport> NodeRuntime<S, T> {
    async fn run(mut self) {
        let key = self.node.public_key().short();
        self.node.start(unix_millis());
        self.after_step();
        info!(node = %key, "node runtime started");

        loop {
            let deadline = self
                .node
                .next_deadline()
                .into_iter()
                .chain(self.pending.values().map(|pending| pending.expires_at))
                .min();
            let wait = deadline.map_or(IDLE_WAIT, |deadline| {
                Duration::from_millis(deadline.saturating_sub(unix_millis()))
            });
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(bytes) = self.inbox.recv() => self.handle_bytes(&bytes),
                _ = tokio::time::sleep(wait) => self.node.tick(unix_millis()),
            }
            self.after_step();
        }

        self.reject_pending(|_| RuntimeError::Stopped);
        info!(node = %key, "node runtime stopped");
    }

    fn handle_bytes(&mut self, bytes: &[u8]) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(%error, "dropping undecodable packet");
                return;
            }
        };
        let replies = self.node.process(&packet, unix_millis());
        // a granted vote must be on disk before the candidate hears about it
        if let Err(error) = self.try_persist() {
            error!(
                node = %self.node.public_key().short(),
                %error,
                "persisting node state failed, replies dropped"
            );
            return;
        }
        for reply in replies {
            let _ = self.deliver(&packet.public_key, &reply);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Propose { payload, reply } => match self.node.propose_task(payload) {
                Ok(Proposal::Appended(entry)) => {
                    let _ = reply.send(Ok(entry));
                }
                Ok(Proposal::Forwarded { request_id, leader }) => {
                    debug!(request_id, leader = %leader.short(), "proposal forwarded");
                    let expires_at = unix_millis() + FORWARD_TIMEOUT;
                    self.pending
                        .insert(request_id, PendingProposal { reply, expires_at });
                }
                Err(error) => {
                    let _ = reply.send(Err(error.into()));
                }
            },
            Command::Reserve { index, reply } => {
                let _ = reply.send(self.node.reserve_task(index));
            }
            Command::Execute { index, reply } => {
                let _ = reply.send(self.node.execute_task(index));
            }
            Command::LastInfo { reply } => {
                let _ = reply.send(self.node.last_info());
            }
            Command::Status { reply } => {
                let _ = reply.send(NodeStatus {
                    term: self.node.term(),
                    state: self.node.state(),
                    leader: self.node.leader().copied(),
                    last_index: self.node.log().last_index(),
                    commit_index: self.node.log().commit_index(),
                });
            }
            Command::Join { address, reply } => {
                let _ = reply.send(self.node.join(&address));
            }
            Command::SetLocal { key, value, reply } => {
                let _ = reply.send(self.node.set_local(&key, value));
            }
            Command::Shutdown => {}
        }
    }

    /// Persist, send what the node queued, then publish its events.
    /// Nothing is sent when persisting fails.
    fn after_step(&mut self) {
        let persisted = self.try_persist();
        let outbox = self.node.drain_outbox();
        match persisted {
            Ok(()) => {
                for outbound in outbox {
                    if let Err(error) = self.deliver(&outbound.to, &outbound.packet) {
                        if let Message::Propose(request) = &outbound.packet.message {
                            self.answer_pending(request.request_id, Err(error.into()));
                        }
                    }
                }
            }
            Err(error) => error!(
                node = %self.node.public_key().short(),
                %error,
                dropped = outbox.len(),
                "persisting node state failed, outbox dropped"
            ),
        }
        for event in self.node.drain_events() {
            self.resolve_pending(&event);
            let _ = self.events.send(event);
        }
        self.expire_pending(unix_millis());
    }

    fn deliver(&self, to: &PublicKey, packet: &Packet) -> Result<(), TransportError> {
        let from = self.node.public_key();
        self.transport.send(from, to, packet).map_err(|error| {
            debug!(to = %to.short(), %error, "packet not delivered");
            error
        })
    }

    fn answer_pending(&mut self, request_id: u64, result: Result<EntryRef, RuntimeError>) {
        if let Some(pending) = self.pending.remove(&request_id) {
            let _ = pending.reply.send(result);
        }
    }

    fn expire_pending(&mut self, now: Millis) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.expires_at <= now)
            .map(|(request_id, _)| *request_id)
            .collect();
        for request_id in expired {
            warn!(request_id, "forwarded proposal timed out");
            self.answer_pending(request_id, Err(RuntimeError::TimedOut(request_id)));
        }
    }

    fn resolve_pending(&mut self, event: &NodeEvent) {
        match event {
            NodeEvent::ProposalAccepted { request_id, entry } => {
                self.answer_pending(*request_id, Ok(*entry));
            }
            NodeEvent::ProposalRejected { request_id } => {
                self.answer_pending(*request_id, Err(RuntimeError::Rejected(*request_id)));
            }
            NodeEvent::LeaderChange { .. } => {
                self.reject_pending(|_| RuntimeError::Task(TaskError::NotLeader));
            }
            _ => {}
        }
    }

    fn reject_pending(&mut self, error: impl Fn(u64) -> RuntimeError) {
        for (request_id, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(error(request_id)));
        }
    }

    fn try_persist(&mut self) -> io::Result<()> {
        if let Some((from, tail)) = self.node.take_unpersisted() {
            self.storage.persist_tail(from, &tail)?;
        }
        let hard_state = self.node.hard_state();
        if hard_state != self.saved {
            self.storage.save_hard_state(&hard_state)?;
            self.saved = hard_state;
        }
        Ok(())
    }
}

//! # node
//!
//! why: define the mokka node state machine and its single mutation point
//! relations: uses message.rs for packets, log.rs for entries, heartbeat.rs for timers,
//!            vote.rs / replication.rs / processor.rs add the protocol handlers
//! what: NodeState, HardState, Node (construction, timers, task api, outbox and events)

use std::collections::{BTreeMap, VecDeque};

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{MokkaConfig, NodeSettings};
use crate::error::{ConfigError, TaskError};
use crate::event::NodeEvent;
use crate::gossip::{Gossip, GossipValue, PeerAddress};
use crate::heartbeat::HeartbeatController;
use crate::keys::{KnownKeys, PublicKey};
use crate::log::{EntryRef, LastInfo, Log, LogEntry};
use crate::message::{GossipDigest, Message, Outbound, Packet, ProposeRequest};
use crate::proof::{quorum, Proof};
use crate::replication::Progress;
use crate::vote::{VoteRecord, VoteTally};
use crate::Millis;

/// The three possible states a node can be in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// The part of a node that must survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted: Option<VoteRecord>,
    pub commit_index: u64,
}

/// Where a proposed task went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proposal {
    /// Appended to our own log, we are the leader
    Appended(EntryRef),
    /// Sent to the leader; resolved by a ProposalAccepted/Rejected event with this id
    Forwarded { request_id: u64, leader: PublicKey },
}

/// A single mokka node.
///
/// The node never reads a clock or touches the network. Callers feed it
/// packets and the current time, then drain [`Node::drain_outbox`] and
/// [`Node::drain_events`].
#[derive(Debug)]
pub struct Node {
    pub(crate) signing_key: SigningKey,
    pub(crate) public_key: PublicKey,
    pub(crate) config: MokkaConfig,
    pub(crate) known_keys: KnownKeys,
    pub(crate) term: u64,
    pub(crate) state: NodeState,
    pub(crate) leader: Option<PublicKey>,
    pub(crate) proof: Option<Proof>,
    pub(crate) proof_minted_at: Millis,
    pub(crate) voted: Option<VoteRecord>,
    pub(crate) tally: VoteTally,
    pub(crate) election_started_at: Millis,
    pub(crate) heartbeat: HeartbeatController,
    pub(crate) log: Log,
    pub(crate) progress: BTreeMap<PublicKey, Progress>,
    pub(crate) gossip: Gossip,
    pub(crate) next_request_id: u64,
    pub(crate) outbox: Vec<Outbound>,
    pub(crate) events: VecDeque<NodeEvent>,
}

impl Node {
    /// Create a follower at term 0. `peers` are the other cluster members;
    /// together with this node they form the voting set.
    pub fn new(
        signing_key: SigningKey,
        peers: &[PublicKey],
        config: MokkaConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let public_key = PublicKey::from_signing_key(&signing_key);

        let mut known_keys = KnownKeys::new();
        known_keys.insert(public_key, signing_key.verifying_key());
        for peer in peers {
            known_keys.insert(*peer, peer.verifying_key()?);
        }

        let mut gossip = Gossip::new(signing_key.clone(), &config)?;
        for peer in peers {
            gossip.register(*peer)?;
        }

        Ok(Self {
            heartbeat: HeartbeatController::new(&config),
            signing_key,
            public_key,
            config,
            known_keys,
            term: 0,
            state: NodeState::Follower,
            leader: None,
            proof: None,
            proof_minted_at: 0,
            voted: None,
            tally: VoteTally::new(0),
            election_started_at: 0,
            log: Log::new(),
            progress: BTreeMap::new(),
            gossip,
            next_request_id: 1,
            outbox: Vec::new(),
            events: VecDeque::new(),
        })
    }

    pub fn from_settings(settings: &NodeSettings) -> Result<Self, ConfigError> {
        Self::new(settings.signing_key()?, &settings.peers, settings.config.clone())
    }

    /// Rebuild a node from what storage kept. It comes back as a follower
    /// with no known leader.
    pub fn restore(
        signing_key: SigningKey,
        peers: &[PublicKey],
        config: MokkaConfig,
        hard_state: HardState,
        entries: Vec<LogEntry>,
    ) -> Result<Self, ConfigError> {
        let mut node = Self::new(signing_key, peers, config)?;
        node.term = hard_state.term;
        node.voted = hard_state.voted;
        node.tally = VoteTally::new(hard_state.term);
        node.log = Log::restore(entries, hard_state.commit_index);
        info!(
            term = node.term,
            last_index = node.log.last_index(),
            commit_index = node.log.commit_index(),
            "node restored"
        );
        Ok(node)
    }

    /// Seed the random sources so runs are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.heartbeat.reseed(seed);
        self.gossip.reseed(seed.rotate_left(32) ^ 0x5eed);
        self
    }

    /// Arm the election and gossip timers.
    pub fn start(&mut self, now: Millis) {
        let timeout = self.heartbeat.timeout();
        self.heartbeat.set_next_beat(timeout, now);
        self.gossip.start(now);
        self.gossip.beat_heart();
        debug!(node = %self.public_key.short(), timeout, "node started");
    }

    // -- accessors --

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn leader(&self) -> Option<&PublicKey> {
        self.leader.as_ref()
    }

    pub fn proof(&self) -> Option<&Proof> {
        self.proof.as_ref()
    }

    pub fn proof_minted_at(&self) -> Millis {
        self.proof_minted_at
    }

    pub fn voted(&self) -> Option<&VoteRecord> {
        self.voted.as_ref()
    }

    pub fn config(&self) -> &MokkaConfig {
        &self.config
    }

    pub fn known_keys(&self) -> &KnownKeys {
        &self.known_keys
    }

    /// Voting members, self included.
    pub fn cluster_size(&self) -> usize {
        self.known_keys.len()
    }

    pub fn quorum_size(&self) -> usize {
        quorum(self.cluster_size())
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Replication progress of `follower`, tracked while leading.
    pub fn progress(&self, follower: &PublicKey) -> Option<&Progress> {
        self.progress.get(follower)
    }

    pub fn gossip(&self) -> &Gossip {
        &self.gossip
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            voted: self.voted.clone(),
            commit_index: self.log.commit_index(),
        }
    }

    pub fn take_unpersisted(&mut self) -> Option<(u64, Vec<LogEntry>)> {
        self.log.take_unpersisted()
    }

    /// Earliest instant at which [`Node::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<Millis> {
        match (self.heartbeat.deadline(), self.gossip.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_events(&mut self) -> Vec<NodeEvent> {
        self.events.drain(..).collect()
    }

    pub(crate) fn emit(&mut self, event: NodeEvent) {
        self.events.push_back(event);
    }

    /// Wrap `message` in a packet stamped with our current view.
    pub fn packet(&self, message: Message) -> Packet {
        Packet {
            message,
            term: self.term,
            state: self.state,
            public_key: self.public_key,
            proof: self.proof.clone(),
        }
    }

    pub(crate) fn send(&mut self, to: PublicKey, message: Message) {
        let packet = self.packet(message);
        self.outbox.push(Outbound { to, packet });
    }

    pub(crate) fn proof_expired(&self, now: Millis) -> bool {
        self.proof
            .as_ref()
            .is_some_and(|proof| proof.is_expired(self.config.proof_expiration, now))
    }

    /// Replace term, state, leader and proof together. Refuses to move the
    /// term backwards. Emits one event per field that changed.
    pub(crate) fn set_state(
        &mut self,
        state: NodeState,
        term: u64,
        leader: Option<PublicKey>,
        proof: Option<Proof>,
        minted_at: Millis,
    ) -> bool {
        if term < self.term {
            debug!(current = self.term, requested = term, "refusing to lower term");
            return false;
        }

        if term != self.term {
            self.emit(NodeEvent::TermChange {
                from: self.term,
                to: term,
            });
            self.tally = VoteTally::new(term);
        }
        if leader != self.leader {
            info!(
                term,
                leader = %leader.map(|key| key.short()).unwrap_or_default(),
                "leader changed"
            );
            self.emit(NodeEvent::LeaderChange {
                from: self.leader,
                to: leader,
            });
        }
        if state != self.state {
            info!(term, from = ?self.state, to = ?state, "state changed");
            self.emit(NodeEvent::StateChange {
                from: self.state,
                to: state,
            });
        }

        self.term = term;
        self.state = state;
        self.leader = leader;
        self.proof = proof;
        self.proof_minted_at = minted_at;
        if state != NodeState::Leader {
            self.progress.clear();
        }
        true
    }

    /// Fire whatever timers are due at `now`.
    pub fn tick(&mut self, now: Millis) {
        if self.heartbeat.is_due(now) {
            match self.state {
                NodeState::Leader => self.leader_beat(now),
                NodeState::Follower | NodeState::Candidate => self.election_timeout(now),
            }
        }
        if self.gossip.is_due(now) {
            self.gossip_tick(now);
        }
    }

    fn leader_beat(&mut self, now: Millis) {
        if self.proof_expired(now) {
            info!(term = self.term, "leader proof expired, stepping down");
            self.set_state(NodeState::Follower, self.term, None, None, 0);
            let timeout = self.heartbeat.timeout();
            self.heartbeat.set_next_beat(timeout, now);
            return;
        }
        self.broadcast_append();
        let cadence = self.heartbeat.heartbeat();
        self.heartbeat.set_next_beat(cadence, now);
    }

    fn election_timeout(&mut self, now: Millis) {
        debug!(term = self.term, state = ?self.state, "heartbeat timeout");
        self.emit(NodeEvent::HeartbeatTimeout);
        if self.state == NodeState::Candidate {
            self.set_state(NodeState::Follower, self.term, None, None, 0);
        }
        self.start_election(now);
    }

    fn gossip_tick(&mut self, now: Millis) {
        self.gossip.rearm(now);
        self.gossip.beat_heart();
        for event in self.gossip.check_liveness(now) {
            self.emit(event);
        }
        if let Some(peer) = self.gossip.pick_peer() {
            let digest = self.gossip.digest();
            self.send(peer, Message::GossipRequest(GossipDigest { digest }));
        }
    }

    // -- task api --

    /// Append a task on the leader, or forward it to the known leader.
    pub fn propose_task(&mut self, payload: Vec<u8>) -> Result<Proposal, TaskError> {
        if self.is_leader() {
            let entry = self.log.propose(self.term, payload);
            debug!(index = entry.index, term = entry.term, "task proposed");
            self.advance_commit();
            return Ok(Proposal::Appended(entry));
        }

        let leader = self.leader.ok_or(TaskError::NotLeader)?;
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.send(
            leader,
            Message::Propose(ProposeRequest {
                request_id,
                payload,
            }),
        );
        debug!(request_id, leader = %leader.short(), "task forwarded");
        Ok(Proposal::Forwarded { request_id, leader })
    }

    pub fn reserve_task(&mut self, index: u64) -> Result<(), TaskError> {
        self.log.reserve(index)
    }

    pub fn execute_task(&mut self, index: u64) -> Result<Vec<u8>, TaskError> {
        self.log.execute(index)
    }

    pub fn last_info(&self) -> LastInfo {
        self.log.last_info()
    }

    // -- gossip api --

    /// Register a peer from `<endpoint>/<hex public key>`.
    pub fn join(&mut self, address: &str) -> Result<PublicKey, ConfigError> {
        let address: PeerAddress = address.parse()?;
        self.gossip.join(&address)
    }

    /// Publish one of our own attributes. Returns its version.
    pub fn set_local(&mut self, key: &str, value: GossipValue) -> u64 {
        self.gossip.set_local(key, value)
    }
}

//! # processor
//!
//! why: one entry point for every inbound packet so leader checks happen before any handler runs
//! relations: extends Node (node.rs); validates with proof.rs, dispatches to vote.rs,
//!            replication.rs and gossip/
//! what: Node::process

use tracing::{debug, info, trace, warn};

use crate::event::NodeEvent;
use crate::message::{GossipDeltas, Message, Packet};
use crate::node::{Node, NodeState};
use crate::proof::{self, ProofContext};
use crate::Millis;

const VALIDATION_FAILED: &str = "validation failed";

impl Node {
    /// Handle one inbound packet and return the replies for its sender.
    /// Messages for other destinations land in the outbox.
    pub fn process(&mut self, packet: &Packet, now: Millis) -> Vec<Packet> {
        let claims_leader = packet.state == NodeState::Leader;
        trace!(
            kind = packet.message.kind(),
            from = %packet.public_key.short(),
            term = packet.term,
            "packet received"
        );

        if claims_leader && packet.proof.is_some() && packet.proof == self.proof && self.proof_expired(now) {
            debug!(from = %packet.public_key.short(), "dropping packet carrying our expired proof");
            return Vec::new();
        }

        let armed = self.heartbeat.deadline();
        if self.state != NodeState::Leader && claims_leader {
            let grace = self.heartbeat.election_max();
            self.heartbeat.set_next_beat(grace, now);
        }

        let new_claim = packet.proof.is_none() || packet.proof != self.proof;
        if claims_leader && new_claim && !self.accept_leader(packet, now) {
            // a rejected claim must not hold off our own election
            self.heartbeat.restore(armed);
            warn!(from = %packet.public_key.short(), term = packet.term, "leader claim rejected");
            return vec![self.packet(Message::Error(VALIDATION_FAILED.to_string()))];
        }

        let replies = self.dispatch(packet, now);

        if self.state != NodeState::Leader && claims_leader {
            let timeout = self.heartbeat.timeout();
            self.heartbeat.set_next_beat(timeout, now);
        }
        replies
    }

    /// Validate the proof a leader claim carries and follow it if it holds.
    fn accept_leader(&mut self, packet: &Packet, now: Millis) -> bool {
        let Some(claimed) = &packet.proof else {
            return false;
        };
        let ctx = ProofContext {
            current_term: self.term,
            current_leader: self.leader.as_ref(),
            now,
            expiration: self.config.proof_expiration,
        };
        let validation = proof::validate(
            packet.term,
            claimed,
            &self.known_keys,
            &packet.public_key,
            &ctx,
        );
        if !validation.validated {
            return false;
        }
        self.set_state(
            NodeState::Follower,
            packet.term,
            Some(packet.public_key),
            Some(claimed.clone()),
            validation.minted,
        )
    }

    fn dispatch(&mut self, packet: &Packet, now: Millis) -> Vec<Packet> {
        match &packet.message {
            Message::Vote(request) => self.handle_vote(packet, request, now),
            Message::Voted(response) => {
                self.handle_voted(packet, response, now);
                Vec::new()
            }
            Message::Append(request) => self.handle_append(packet, request),
            Message::Appended(response) => self.handle_appended(packet, response),
            Message::Error(reason) => {
                debug!(from = %packet.public_key.short(), reason, "peer reported error");
                self.emit(NodeEvent::Error {
                    from: packet.public_key,
                    reason: reason.clone(),
                });
                if self.state == NodeState::Leader
                    && packet.term > self.term
                    && self.known_keys.contains_key(&packet.public_key)
                {
                    info!(
                        term = self.term,
                        seen = packet.term,
                        "peer is ahead of our term, re-electing above it"
                    );
                    self.set_state(NodeState::Follower, packet.term, None, None, 0);
                    self.start_election(now);
                }
                Vec::new()
            }
            Message::Propose(request) => self.handle_propose(packet, request),
            Message::Proposed(response) => {
                self.handle_proposed(response);
                Vec::new()
            }
            Message::GossipRequest(request) => {
                let reply = self.gossip.reply_to(&request.digest);
                vec![self.packet(Message::GossipFirstResponse(reply))]
            }
            Message::GossipFirstResponse(reply) => {
                self.gossip.apply(reply.deltas.clone(), now);
                let deltas = self.gossip.deltas_for(&reply.digest);
                if deltas.is_empty() {
                    return Vec::new();
                }
                vec![self.packet(Message::GossipSecondResponse(GossipDeltas { deltas }))]
            }
            Message::GossipSecondResponse(second) => {
                self.gossip.apply(second.deltas.clone(), now);
                Vec::new()
            }
            Message::Unknown(kind) => {
                debug!(kind, from = %packet.public_key.short(), "unknown message type");
                vec![self.packet(Message::Error(format!("Unknown message type: {kind}")))]
            }
        }
    }
}

//! # vote
//!
//! why: elect at most one leader per term and hand it a proof anyone can check
//! relations: extends Node (node.rs); called from processor.rs and the election timer;
//!            mints proofs checked by proof.rs
//! what: VoteRecord, VoteTally, election start, vote granting, tallying, leader takeover

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::event::NodeEvent;
use crate::keys::{PublicKey, SignatureBytes};
use crate::message::{Message, Packet, VoteRequest, VoteResponse};
use crate::node::{Node, NodeState};
use crate::proof::{quorum, vote_message, Proof};
use crate::replication::Progress;
use crate::Millis;

/// The vote this node granted most recently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub term: u64,
    pub candidate: PublicKey,
}

/// Signed votes collected by a candidate for one term.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteTally {
    term: u64,
    votes: BTreeMap<PublicKey, SignatureBytes>,
}

impl VoteTally {
    pub fn new(term: u64) -> Self {
        Self {
            term,
            votes: BTreeMap::new(),
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Count a vote. Votes for other terms and repeat voters are ignored.
    pub fn record(&mut self, term: u64, voter: PublicKey, signature: SignatureBytes) -> bool {
        if term != self.term || self.votes.contains_key(&voter) {
            return false;
        }
        self.votes.insert(voter, signature);
        true
    }

    pub fn count(&self) -> usize {
        self.votes.len()
    }

    pub fn has_quorum(&self, cluster_size: usize) -> bool {
        self.count() >= quorum(cluster_size)
    }

    pub fn votes(&self) -> &BTreeMap<PublicKey, SignatureBytes> {
        &self.votes
    }
}

impl Node {
    /// Become a candidate for the next unused term and ask everyone for votes.
    pub(crate) fn start_election(&mut self, now: Millis) {
        let voted_term = self.voted.as_ref().map_or(0, |record| record.term);
        let term = self.term.max(voted_term) + 1;

        self.set_state(NodeState::Candidate, term, None, None, 0);
        self.election_started_at = now;
        self.tally = VoteTally::new(term);

        let own_vote = SignatureBytes::sign(
            &self.signing_key,
            &vote_message(term, &self.public_key, now),
        );
        self.voted = Some(VoteRecord {
            term,
            candidate: self.public_key,
        });
        self.tally.record(term, self.public_key, own_vote);

        let timeout = self.heartbeat.timeout();
        self.heartbeat.set_next_beat(timeout, now);
        info!(term, node = %self.public_key.short(), "election started");

        if self.tally.has_quorum(self.cluster_size()) {
            self.become_leader(now);
            return;
        }

        let request = VoteRequest {
            minted_at: now,
            last_index: self.log.last_index(),
            last_term: self.log.last_term(),
        };
        let voters: Vec<PublicKey> = self.other_members().collect();
        for voter in voters {
            self.send(voter, Message::Vote(request.clone()));
        }
    }

    pub(crate) fn other_members(&self) -> impl Iterator<Item = PublicKey> + '_ {
        self.known_keys
            .keys()
            .copied()
            .filter(move |key| *key != self.public_key)
    }

    fn candidate_log_is_behind(&self, request: &VoteRequest) -> bool {
        (request.last_term, request.last_index) < (self.log.last_term(), self.log.last_index())
    }

    fn vote_refusal(&self, candidate: &PublicKey, term: u64, request: &VoteRequest) -> Option<&'static str> {
        if !self.known_keys.contains_key(candidate) {
            return Some("unknown candidate");
        }
        if self.state == NodeState::Leader {
            return Some("already leading");
        }
        if term <= self.term {
            return Some("term is not ahead of ours");
        }
        if let Some(record) = &self.voted {
            if term < record.term {
                return Some("already voted in a later term");
            }
            if term == record.term && record.candidate != *candidate {
                return Some("already voted for someone else this term");
            }
        }
        if self.candidate_log_is_behind(request) {
            return Some("candidate log is behind");
        }
        None
    }

    /// Answer a vote request. Returns the `Voted` reply.
    pub(crate) fn handle_vote(
        &mut self,
        packet: &Packet,
        request: &VoteRequest,
        now: Millis,
    ) -> Vec<Packet> {
        let candidate = packet.public_key;
        let term = packet.term;

        if let Some(reason) = self.vote_refusal(&candidate, term, request) {
            debug!(term, candidate = %candidate.short(), reason, "vote refused");
            let reply = self.packet(Message::Voted(VoteResponse {
                term,
                granted: false,
                signature: None,
            }));

            // a lagging node stuck at a higher term can only rejoin once a
            // leader exists above that term
            if self.state == NodeState::Leader
                && term > self.term
                && self.candidate_log_is_behind(request)
            {
                info!(term = self.term, seen = term, "re-electing above a lagging candidate");
                self.set_state(NodeState::Follower, term, None, None, 0);
                self.start_election(now);
            }
            return vec![reply];
        }

        self.voted = Some(VoteRecord { term, candidate });
        let signature = SignatureBytes::sign(
            &self.signing_key,
            &vote_message(term, &candidate, request.minted_at),
        );
        if self.state == NodeState::Candidate {
            self.set_state(NodeState::Follower, self.term, None, None, 0);
        }
        let timeout = self.heartbeat.timeout();
        self.heartbeat.set_next_beat(timeout, now);
        info!(term, candidate = %candidate.short(), "vote granted");

        vec![self.packet(Message::Voted(VoteResponse {
            term,
            granted: true,
            signature: Some(signature),
        }))]
    }

    /// Count a vote for our candidacy.
    pub(crate) fn handle_voted(&mut self, packet: &Packet, response: &VoteResponse, now: Millis) {
        if self.state != NodeState::Candidate || response.term != self.term {
            debug!(term = response.term, "stale vote response ignored");
            return;
        }
        if !response.granted {
            return;
        }
        let Some(signature) = response.signature else {
            debug!(voter = %packet.public_key.short(), "granted vote without signature");
            return;
        };
        let Some(key) = self.known_keys.get(&packet.public_key) else {
            debug!(voter = %packet.public_key.short(), "vote from unknown key");
            return;
        };
        let message = vote_message(self.term, &self.public_key, self.election_started_at);
        if !signature.verify(key, &message) {
            debug!(voter = %packet.public_key.short(), "vote signature does not verify");
            return;
        }

        self.tally.record(self.term, packet.public_key, signature);
        debug!(
            term = self.term,
            votes = self.tally.count(),
            needed = self.quorum_size(),
            "vote counted"
        );
        if self.tally.has_quorum(self.cluster_size()) {
            self.become_leader(now);
        }
    }

    fn become_leader(&mut self, now: Millis) {
        let minted_at = self.election_started_at;
        let proof = Proof {
            term: self.term,
            leader: self.public_key,
            minted_at,
            votes: self.tally.votes().clone(),
        };
        self.set_state(
            NodeState::Leader,
            self.term,
            Some(self.public_key),
            Some(proof),
            minted_at,
        );

        let next_index = self.log.last_index() + 1;
        let members: Vec<PublicKey> = self.other_members().collect();
        self.progress = members
            .into_iter()
            .map(|key| {
                (
                    key,
                    Progress {
                        next_index,
                        match_index: 0,
                    },
                )
            })
            .collect();

        info!(term = self.term, votes = self.tally.count(), "became leader");
        self.emit(NodeEvent::LeaderElected { term: self.term });

        self.broadcast_append();
        let cadence = self.heartbeat.heartbeat();
        self.heartbeat.set_next_beat(cadence, now);
        self.advance_commit();
    }
}

//! # replication
//!
//! why: move the leader's log to followers and decide when entries are committed
//! relations: extends Node (node.rs); called from processor.rs, the leader beat and vote.rs
//! what: per-follower Progress, append building, append/appended handlers, commit rule,
//!       proposal forwarding handlers

use tracing::{debug, warn};

use crate::event::NodeEvent;
use crate::message::{
    AppendRequest, AppendResponse, Message, Packet, ProposeRequest, ProposeResponse,
};
use crate::node::{Node, NodeState};
use crate::proof::quorum;

/// What the leader knows about one follower's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Next index to send
    pub next_index: u64,
    /// Highest index known to be replicated
    pub match_index: u64,
}

impl Node {
    pub(crate) fn append_request(&self, next_index: u64) -> AppendRequest {
        let next_index = next_index.clamp(1, self.log.last_index() + 1);
        let prev_index = next_index - 1;
        AppendRequest {
            prev_index,
            prev_term: self.log.term_at(prev_index).unwrap_or(0),
            entries: self
                .log
                .entries_from(next_index, self.config.append_batch_size),
            commit_index: self.log.commit_index(),
        }
    }

    /// Send every follower what it is missing, or an empty heartbeat.
    pub(crate) fn broadcast_append(&mut self) {
        let targets: Vec<_> = self
            .progress
            .iter()
            .map(|(key, progress)| (*key, progress.next_index))
            .collect();
        for (key, next_index) in targets {
            let request = self.append_request(next_index);
            self.send(key, Message::Append(request));
        }
    }

    pub(crate) fn handle_append(&mut self, packet: &Packet, request: &AppendRequest) -> Vec<Packet> {
        if self.leader != Some(packet.public_key) || packet.term != self.term {
            debug!(from = %packet.public_key.short(), term = packet.term, "append from non-leader ignored");
            return Vec::new();
        }

        let last_index = self.log.last_index();
        if request.prev_index > last_index {
            return vec![self.appended(false, last_index)];
        }
        if self.log.term_at(request.prev_index) != Some(request.prev_term) {
            let commit_index = self.log.commit_index();
            if request.prev_index > commit_index {
                self.log.truncate_from(request.prev_index);
            }
            let hint = self
                .log
                .last_index()
                .min(request.prev_index.saturating_sub(1))
                .max(commit_index);
            debug!(prev_index = request.prev_index, hint, "append prev mismatch");
            return vec![self.appended(false, hint)];
        }

        let mut matched = request.prev_index;
        for entry in &request.entries {
            let index = entry.index;
            match self.log.append_replicated(entry.clone()) {
                Ok(_) => matched = index,
                Err(error) => {
                    warn!(%error, "replicated entry refused");
                    break;
                }
            }
        }

        let target = request.commit_index.min(matched);
        if self.log.commit_to(target) {
            self.emit_committed();
        }
        vec![self.appended(true, matched)]
    }

    fn appended(&self, success: bool, last_index: u64) -> Packet {
        self.packet(Message::Appended(AppendResponse {
            success,
            last_index,
        }))
    }

    pub(crate) fn handle_appended(&mut self, packet: &Packet, response: &AppendResponse) -> Vec<Packet> {
        if self.state != NodeState::Leader || packet.term != self.term {
            debug!(term = packet.term, "stale append response ignored");
            return Vec::new();
        }
        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&packet.public_key) else {
            return Vec::new();
        };

        if response.success {
            let advanced = response.last_index > progress.match_index;
            progress.match_index = progress.match_index.max(response.last_index.min(last_index));
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            let next_index = progress.next_index;

            self.advance_commit();
            if advanced && next_index <= last_index {
                return vec![self.packet(Message::Append(self.append_request(next_index)))];
            }
            return Vec::new();
        }

        let retry_from = response
            .last_index
            .saturating_add(1)
            .max(progress.match_index + 1)
            .min(last_index + 1);
        if retry_from >= progress.next_index {
            return Vec::new();
        }
        progress.next_index = retry_from;
        debug!(follower = %packet.public_key.short(), retry_from, "follower behind, resending");
        vec![self.packet(Message::Append(self.append_request(retry_from)))]
    }

    /// Commit the highest index held by a majority, if it is from our term.
    pub(crate) fn advance_commit(&mut self) {
        if self.state != NodeState::Leader {
            return;
        }
        let mut matches: Vec<u64> = self
            .progress
            .values()
            .map(|progress| progress.match_index)
            .chain(std::iter::once(self.log.last_index()))
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));

        let Some(&candidate) = matches.get(quorum(self.cluster_size()) - 1) else {
            return;
        };
        if candidate <= self.log.commit_index() || self.log.term_at(candidate) != Some(self.term) {
            return;
        }
        if self.log.commit_to(candidate) {
            self.emit_committed();
        }
    }

    fn emit_committed(&mut self) {
        let index = self.log.commit_index();
        let term = self.log.term_at(index).unwrap_or(0);
        debug!(index, term, "committed");
        self.emit(NodeEvent::Committed { index, term });
    }

    pub(crate) fn handle_propose(&mut self, packet: &Packet, request: &ProposeRequest) -> Vec<Packet> {
        let accepted = self.is_leader() && self.known_keys.contains_key(&packet.public_key);
        let entry = if accepted {
            let entry = self.log.propose(self.term, request.payload.clone());
            debug!(
                index = entry.index,
                from = %packet.public_key.short(),
                "forwarded task proposed"
            );
            self.advance_commit();
            Some(entry)
        } else {
            None
        };
        vec![self.packet(Message::Proposed(ProposeResponse {
            request_id: request.request_id,
            entry,
        }))]
    }

    pub(crate) fn handle_proposed(&mut self, response: &ProposeResponse) {
        let event = match response.entry {
            Some(entry) => NodeEvent::ProposalAccepted {
                request_id: response.request_id,
                entry,
            },
            None => NodeEvent::ProposalRejected {
                request_id: response.request_id,
            },
        };
        self.emit(event);
    }
}

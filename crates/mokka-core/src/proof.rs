//! # proof
//!
//! why: let any node check, without asking anyone, that a leader really won its election
//! relations: minted in vote.rs, attached to packets by node.rs, validated by processor.rs
//! what: Proof (majority vote certificate), vote signing message, quorum, validation and expiry

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::keys::{KnownKeys, PublicKey, SignatureBytes};
use crate::Millis;

const VOTE_DOMAIN: &[u8] = b"mokka/vote";

/// Signed votes of a majority for one leader in one term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub term: u64,
    pub leader: PublicKey,
    /// When the election that produced this proof started
    pub minted_at: Millis,
    pub votes: BTreeMap<PublicKey, SignatureBytes>,
}

impl Proof {
    pub fn is_expired(&self, expiration: Option<Millis>, now: Millis) -> bool {
        expired(self.minted_at, expiration, now)
    }
}

/// Bytes a voter signs when granting `candidate` its vote in `term`.
pub fn vote_message(term: u64, candidate: &PublicKey, minted_at: Millis) -> Vec<u8> {
    let mut message = Vec::with_capacity(VOTE_DOMAIN.len() + 8 + 32 + 8);
    message.extend_from_slice(VOTE_DOMAIN);
    message.extend_from_slice(&term.to_le_bytes());
    message.extend_from_slice(candidate.as_bytes());
    message.extend_from_slice(&minted_at.to_le_bytes());
    message
}

pub fn expired(minted_at: Millis, expiration: Option<Millis>, now: Millis) -> bool {
    match expiration {
        Some(lifetime) => minted_at.saturating_add(lifetime) <= now,
        None => false,
    }
}

/// Votes needed out of `cluster_size` members.
pub fn quorum(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// What the receiving node currently believes.
#[derive(Debug, Clone, Copy)]
pub struct ProofContext<'a> {
    pub current_term: u64,
    pub current_leader: Option<&'a PublicKey>,
    pub now: Millis,
    pub expiration: Option<Millis>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validation {
    pub validated: bool,
    pub minted: Millis,
}

impl Validation {
    pub fn rejected() -> Self {
        Self {
            validated: false,
            minted: 0,
        }
    }
}

/// Check that `proof` makes `claimed` the legitimate leader of `term`.
pub fn validate(
    term: u64,
    proof: &Proof,
    known_keys: &KnownKeys,
    claimed: &PublicKey,
    ctx: &ProofContext<'_>,
) -> Validation {
    match check(term, proof, known_keys, claimed, ctx) {
        Ok(()) => Validation {
            validated: true,
            minted: proof.minted_at,
        },
        Err(reason) => {
            debug!(
                term,
                claimed = %claimed.short(),
                reason,
                "proof rejected"
            );
            Validation::rejected()
        }
    }
}

fn check(
    term: u64,
    proof: &Proof,
    known_keys: &KnownKeys,
    claimed: &PublicKey,
    ctx: &ProofContext<'_>,
) -> Result<(), &'static str> {
    if !known_keys.contains_key(claimed) {
        return Err("unknown leader key");
    }
    if proof.term != term {
        return Err("proof is for another term");
    }
    if &proof.leader != claimed {
        return Err("proof names another leader");
    }
    if term < ctx.current_term {
        return Err("term is behind ours");
    }
    if term == ctx.current_term {
        if let Some(current) = ctx.current_leader {
            if current != claimed {
                return Err("term already has another leader");
            }
        }
    }
    if proof.is_expired(ctx.expiration, ctx.now) {
        return Err("proof expired");
    }

    let message = vote_message(proof.term, &proof.leader, proof.minted_at);
    for (voter, signature) in &proof.votes {
        let key = known_keys.get(voter).ok_or("vote from unknown key")?;
        if !signature.verify(key, &message) {
            return Err("invalid vote signature");
        }
    }
    if proof.votes.len() < quorum(known_keys.len()) {
        return Err("not enough votes");
    }
    Ok(())
}

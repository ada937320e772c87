//! # peer
//!
//! why: hold everything one node knows about one cluster member's gossip state
//! relations: owned by gossip/mod.rs (local handle plus one per remote), uses detector.rs
//! what: GossipValue, signed deltas, PeerHandle with versioned attributes and liveness

use std::collections::BTreeMap;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::detector::AccrualFailureDetector;
use crate::error::{ConfigError, GossipError};
use crate::keys::{PublicKey, SignatureBytes};
use crate::Millis;

const GOSSIP_DOMAIN: &[u8] = b"mokka/gossip";

/// Value a node publishes about itself under some key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GossipValue {
    /// Monotonic liveness counter, bumped every gossip tick
    Heartbeat { counter: u64 },
    /// Where the node can be reached
    Announcement { address: String },
    Capability { name: String, detail: String },
    Raw { bytes: Vec<u8> },
}

impl GossipValue {
    /// Stable byte form covered by signatures.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            GossipValue::Heartbeat { counter } => {
                out.push(0);
                out.extend_from_slice(&counter.to_le_bytes());
            }
            GossipValue::Announcement { address } => {
                out.push(1);
                put_field(&mut out, address.as_bytes());
            }
            GossipValue::Capability { name, detail } => {
                out.push(2);
                put_field(&mut out, name.as_bytes());
                put_field(&mut out, detail.as_bytes());
            }
            GossipValue::Raw { bytes } => {
                out.push(3);
                put_field(&mut out, bytes);
            }
        }
        out
    }
}

fn put_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u64).to_le_bytes());
    out.extend_from_slice(field);
}

/// Bytes the owner signs for `key` at `version`.
pub fn signing_message(key: &str, version: u64, value: &GossipValue) -> Vec<u8> {
    let mut message = GOSSIP_DOMAIN.to_vec();
    put_field(&mut message, key.as_bytes());
    message.extend_from_slice(&version.to_le_bytes());
    message.extend_from_slice(&value.canonical_bytes());
    message
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedValue {
    pub value: GossipValue,
    pub signature: SignatureBytes,
}

/// One attribute update, as exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub owner: PublicKey,
    pub key: String,
    pub value: SignedValue,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: SignedValue,
    pub version: u64,
}

#[derive(Debug, Clone)]
pub struct PeerHandle {
    public_key: PublicKey,
    verifying_key: VerifyingKey,
    address: Option<String>,
    attrs: BTreeMap<String, VersionedValue>,
    detector: AccrualFailureDetector,
    alive: bool,
    max_version_seen: u64,
    phi_threshold: f64,
}

impl PeerHandle {
    pub fn new(
        public_key: PublicKey,
        address: Option<String>,
        first_estimate: Millis,
        phi_threshold: f64,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            verifying_key: public_key.verifying_key()?,
            public_key,
            address,
            attrs: BTreeMap::new(),
            detector: AccrualFailureDetector::new(first_estimate),
            alive: true,
            max_version_seen: 0,
            phi_threshold,
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn set_address(&mut self, address: String) {
        self.address = Some(address);
    }

    pub fn max_version_seen(&self) -> u64 {
        self.max_version_seen
    }

    pub fn get(&self, key: &str) -> Option<&GossipValue> {
        self.attrs.get(key).map(|versioned| &versioned.value.value)
    }

    pub fn version_of(&self, key: &str) -> Option<u64> {
        self.attrs.get(key).map(|versioned| versioned.version)
    }

    /// Apply a remote update. Versions at or below the highest one seen from this
    /// peer, for any key, are ignored and return `Ok(false)`. A signature that
    /// does not verify against the owner's key is an error.
    pub fn update_with_delta(
        &mut self,
        key: &str,
        value: SignedValue,
        version: u64,
        now: Millis,
    ) -> Result<bool, GossipError> {
        if version <= self.max_version_seen {
            return Ok(false);
        }
        let message = signing_message(key, version, &value.value);
        if !value.signature.verify(&self.verifying_key, &message) {
            return Err(GossipError::InvalidSignature {
                owner: self.public_key,
                key: key.to_string(),
                version,
            });
        }

        self.detector.add(now);
        if let GossipValue::Announcement { address } = &value.value {
            self.address = Some(address.clone());
        }
        self.attrs
            .insert(key.to_string(), VersionedValue { value, version });
        self.max_version_seen = self.max_version_seen.max(version);
        Ok(true)
    }

    /// Publish a new value for one of our own keys. Returns the version used.
    pub fn set_local(&mut self, key: &str, value: GossipValue, signing_key: &SigningKey) -> u64 {
        let version = self.max_version_seen + 1;
        let signature = SignatureBytes::sign(signing_key, &signing_message(key, version, &value));
        self.attrs.insert(
            key.to_string(),
            VersionedValue {
                value: SignedValue { value, signature },
                version,
            },
        );
        self.max_version_seen = version;
        version
    }

    /// Attributes newer than `version`, oldest first.
    pub fn deltas_after_version(&self, version: u64) -> Vec<Delta> {
        let mut deltas: Vec<Delta> = self
            .attrs
            .iter()
            .filter(|(_, versioned)| versioned.version > version)
            .map(|(key, versioned)| Delta {
                owner: self.public_key,
                key: key.clone(),
                value: versioned.value.clone(),
                version: versioned.version,
            })
            .collect();
        deltas.sort_by_key(|delta| delta.version);
        deltas
    }

    pub fn phi(&self, now: Millis) -> f64 {
        self.detector.phi(now)
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Re-evaluate liveness at `now`. Returns the new state when it changed.
    pub fn check_liveness(&mut self, now: Millis) -> Option<bool> {
        if self.detector.last_arrival().is_none() {
            return None;
        }
        let suspect = self.is_suspect(now);
        let changed = if suspect {
            self.mark_dead()
        } else {
            self.mark_alive()
        };
        changed.then_some(!suspect)
    }

    pub fn is_suspect(&self, now: Millis) -> bool {
        self.phi(now) > self.phi_threshold
    }

    /// Returns whether the state changed.
    pub fn mark_alive(&mut self) -> bool {
        if self.alive {
            return false;
        }
        self.alive = true;
        info!(peer = %self.public_key.short(), "peer is alive");
        true
    }

    /// Returns whether the state changed.
    pub fn mark_dead(&mut self) -> bool {
        if !self.alive {
            return false;
        }
        self.alive = false;
        info!(peer = %self.public_key.short(), "peer failed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> (SigningKey, PeerHandle) {
        let key = SigningKey::from_bytes(&[5; 32]);
        let handle = PeerHandle::new(PublicKey::from_signing_key(&key), None, 100, 8.0).unwrap();
        (key, handle)
    }

    fn signed(key: &SigningKey, name: &str, version: u64, value: GossipValue) -> SignedValue {
        let signature = SignatureBytes::sign(key, &signing_message(name, version, &value));
        SignedValue { value, signature }
    }

    #[test]
    fn newer_versions_replace_older_ones() {
        let (key, mut peer) = owner();
        let v1 = signed(&key, "hb", 1, GossipValue::Heartbeat { counter: 1 });
        let v2 = signed(&key, "hb", 2, GossipValue::Heartbeat { counter: 2 });
        assert_eq!(peer.update_with_delta("hb", v2, 2, 10), Ok(true));
        assert_eq!(peer.update_with_delta("hb", v1, 1, 20), Ok(false));
        assert_eq!(peer.get("hb"), Some(&GossipValue::Heartbeat { counter: 2 }));
        assert_eq!(peer.max_version_seen(), 2);
    }

    #[test]
    fn versions_are_ordered_across_keys() {
        let (key, mut peer) = owner();
        let a = signed(&key, "a", 3, GossipValue::Heartbeat { counter: 3 });
        let b = signed(&key, "b", 2, GossipValue::Heartbeat { counter: 2 });
        assert_eq!(peer.update_with_delta("a", a, 3, 10), Ok(true));
        assert_eq!(peer.update_with_delta("b", b, 2, 20), Ok(false));
        assert!(peer.get("b").is_none());
        assert_eq!(peer.max_version_seen(), 3);
    }

    #[test]
    fn same_delta_twice_changes_state_once() {
        let (key, mut peer) = owner();
        let value = signed(&key, "role", 1, GossipValue::Raw { bytes: vec![7] });
        assert_eq!(peer.update_with_delta("role", value.clone(), 1, 10), Ok(true));
        let after_first = peer.deltas_after_version(0);

        assert_eq!(peer.update_with_delta("role", value, 1, 20), Ok(false));
        assert_eq!(peer.deltas_after_version(0), after_first);
        assert_eq!(peer.max_version_seen(), 1);
    }

    #[test]
    fn forged_delta_is_rejected() {
        let (_, mut peer) = owner();
        let intruder = SigningKey::from_bytes(&[6; 32]);
        let forged = signed(&intruder, "hb", 1, GossipValue::Heartbeat { counter: 9 });
        let error = peer.update_with_delta("hb", forged, 1, 0).unwrap_err();
        assert!(matches!(error, GossipError::InvalidSignature { version: 1, .. }));
        assert!(peer.get("hb").is_none());
    }

    #[test]
    fn signature_binds_the_version() {
        let (key, mut peer) = owner();
        let value = signed(&key, "hb", 1, GossipValue::Heartbeat { counter: 1 });
        assert!(peer.update_with_delta("hb", value, 7, 0).is_err());
    }

    #[test]
    fn deltas_come_back_sorted_by_version() {
        let (key, mut peer) = owner();
        peer.set_local("b", GossipValue::Heartbeat { counter: 1 }, &key);
        peer.set_local("a", GossipValue::Raw { bytes: vec![1] }, &key);
        peer.set_local("b", GossipValue::Heartbeat { counter: 2 }, &key);

        let versions: Vec<_> = peer.deltas_after_version(0).iter().map(|d| d.version).collect();
        assert_eq!(versions, vec![2, 3]);
        assert_eq!(peer.deltas_after_version(2).len(), 1);
        assert!(peer.deltas_after_version(3).is_empty());
    }

    #[test]
    fn deltas_after_version_shrink_as_version_grows() {
        let (key, mut peer) = owner();
        for counter in 0..6u64 {
            let name = if counter % 2 == 0 { "even" } else { "odd" };
            peer.set_local(name, GossipValue::Heartbeat { counter }, &key);
        }

        let mut previous = peer.deltas_after_version(0);
        for version in 1..=peer.max_version_seen() {
            let current = peer.deltas_after_version(version);
            assert!(current.len() <= previous.len());
            assert!(current.iter().all(|delta| delta.version > version));
            assert!(current.iter().all(|delta| previous.contains(delta)));
            previous = current;
        }
        assert!(previous.is_empty());
    }

    #[test]
    fn announcement_updates_address() {
        let (key, mut peer) = owner();
        let address = "tcp://10.0.0.1:2000".to_string();
        let value = signed(&key, "address", 1, GossipValue::Announcement { address: address.clone() });
        peer.update_with_delta("address", value, 1, 0).unwrap();
        assert_eq!(peer.address(), Some(address.as_str()));
    }

    #[test]
    fn mark_transitions_report_changes_only() {
        let (_, mut peer) = owner();
        assert!(!peer.mark_alive());
        assert!(peer.mark_dead());
        assert!(!peer.mark_dead());
        assert!(peer.mark_alive());
    }
}

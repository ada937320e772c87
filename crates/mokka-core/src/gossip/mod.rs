//! # gossip
//!
//! why: spread signed per-node attributes and notice silent members, independent of raft traffic
//! relations: owned by node.rs, driven by node tick and the gossip handlers in processor.rs
//! what: PeerAddress parsing, Gossip (scuttlebutt style digest/delta exchange + liveness)
//!
//! One exchange takes three messages:
//! 1. initiator sends its digest (owner -> highest version it holds)
//! 2. receiver answers with its own digest and the deltas the initiator lacks
//! 3. initiator sends the deltas the receiver lacks

pub mod detector;
pub mod peer;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::SigningKey;
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::config::MokkaConfig;
use crate::error::ConfigError;
use crate::event::NodeEvent;
use crate::heartbeat::Alarm;
use crate::keys::PublicKey;
use crate::message::GossipReply;
use crate::Millis;

pub use peer::{Delta, GossipValue, PeerHandle, SignedValue};

/// Attribute key bumped on every gossip tick.
pub const HEARTBEAT_KEY: &str = "heartbeat";

pub type Digest = BTreeMap<PublicKey, u64>;

/// `<endpoint>/<hex public key>`, e.g. `tcp://127.0.0.1:2000/ab12...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub endpoint: String,
    pub public_key: PublicKey,
}

impl FromStr for PeerAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (endpoint, key) = s
            .trim()
            .rsplit_once('/')
            .ok_or_else(|| ConfigError::InvalidAddress(s.to_string()))?;
        if endpoint.is_empty() || endpoint.ends_with(':') {
            return Err(ConfigError::InvalidAddress(s.to_string()));
        }
        Ok(Self {
            endpoint: endpoint.to_string(),
            public_key: key.parse()?,
        })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.public_key)
    }
}

#[derive(Debug, Clone)]
pub struct Gossip {
    signing_key: SigningKey,
    local: PeerHandle,
    peers: BTreeMap<PublicKey, PeerHandle>,
    heartbeats: u64,
    interval: Millis,
    phi_threshold: f64,
    alarm: Alarm,
    rng: StdRng,
}

impl Gossip {
    pub fn new(signing_key: SigningKey, config: &MokkaConfig) -> Result<Self, ConfigError> {
        let public_key = PublicKey::from_signing_key(&signing_key);
        let local = PeerHandle::new(public_key, None, config.gossip_heartbeat, config.phi_threshold)?;
        Ok(Self {
            signing_key,
            local,
            peers: BTreeMap::new(),
            heartbeats: 0,
            interval: config.gossip_heartbeat,
            phi_threshold: config.phi_threshold,
            alarm: Alarm::due_never(),
            rng: StdRng::from_entropy(),
        })
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn local(&self) -> &PeerHandle {
        &self.local
    }

    pub fn peer(&self, key: &PublicKey) -> Option<&PeerHandle> {
        self.peers.get(key)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerHandle> {
        self.peers.values()
    }

    /// Start tracking `key`. Registering ourselves or a known peer is a no-op.
    pub fn register(&mut self, key: PublicKey) -> Result<(), ConfigError> {
        if key == *self.local.public_key() || self.peers.contains_key(&key) {
            return Ok(());
        }
        let handle = PeerHandle::new(key, None, self.interval, self.phi_threshold)?;
        self.peers.insert(key, handle);
        Ok(())
    }

    pub fn join(&mut self, address: &PeerAddress) -> Result<PublicKey, ConfigError> {
        self.register(address.public_key)?;
        if let Some(peer) = self.peers.get_mut(&address.public_key) {
            peer.set_address(address.endpoint.clone());
        }
        debug!(peer = %address.public_key.short(), endpoint = %address.endpoint, "joined peer");
        Ok(address.public_key)
    }

    pub fn set_local(&mut self, key: &str, value: GossipValue) -> u64 {
        self.local.set_local(key, value, &self.signing_key)
    }

    pub fn beat_heart(&mut self) -> u64 {
        self.heartbeats += 1;
        let counter = self.heartbeats;
        self.set_local(HEARTBEAT_KEY, GossipValue::Heartbeat { counter })
    }

    pub fn digest(&self) -> Digest {
        std::iter::once(&self.local)
            .chain(self.peers.values())
            .map(|handle| (*handle.public_key(), handle.max_version_seen()))
            .collect()
    }

    /// Everything we hold that is newer than what `digest` reports.
    pub fn deltas_for(&self, digest: &Digest) -> Vec<Delta> {
        std::iter::once(&self.local)
            .chain(self.peers.values())
            .flat_map(|handle| {
                let known = digest.get(handle.public_key()).copied().unwrap_or(0);
                handle.deltas_after_version(known)
            })
            .collect()
    }

    pub fn reply_to(&self, digest: &Digest) -> GossipReply {
        GossipReply {
            digest: self.digest(),
            deltas: self.deltas_for(digest),
        }
    }

    /// Apply received deltas. Returns how many were accepted.
    pub fn apply(&mut self, deltas: Vec<Delta>, now: Millis) -> usize {
        let mut accepted = 0;
        for delta in deltas {
            if delta.owner == *self.local.public_key() {
                continue;
            }
            if let Err(error) = self.register(delta.owner) {
                warn!(owner = %delta.owner.short(), %error, "ignoring delta from invalid key");
                continue;
            }
            let Some(peer) = self.peers.get_mut(&delta.owner) else {
                continue;
            };
            match peer.update_with_delta(&delta.key, delta.value, delta.version, now) {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(error) => warn!(%error, "rejected gossip delta"),
            }
        }
        accepted
    }

    pub fn check_liveness(&mut self, now: Millis) -> Vec<NodeEvent> {
        self.peers
            .values_mut()
            .filter_map(|peer| {
                let key = *peer.public_key();
                peer.check_liveness(now).map(|alive| {
                    if alive {
                        NodeEvent::PeerAlive(key)
                    } else {
                        NodeEvent::PeerFailed(key)
                    }
                })
            })
            .collect()
    }

    pub fn pick_peer(&mut self) -> Option<PublicKey> {
        self.peers.keys().copied().choose(&mut self.rng)
    }

    pub fn start(&mut self, now: Millis) {
        self.rearm(now);
    }

    pub fn rearm(&mut self, now: Millis) {
        self.alarm = Alarm::at(now.saturating_add(self.interval));
    }

    pub fn is_due(&self, now: Millis) -> bool {
        self.alarm.is_due(now)
    }

    pub fn deadline(&self) -> Option<Millis> {
        self.alarm.due()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gossip(seed: u8) -> Gossip {
        Gossip::new(SigningKey::from_bytes(&[seed; 32]), &MokkaConfig::default()).unwrap()
    }

    fn exchange(a: &mut Gossip, b: &mut Gossip, now: Millis) {
        let reply = b.reply_to(&a.digest());
        a.apply(reply.deltas, now);
        let second = a.deltas_for(&reply.digest);
        b.apply(second, now);
    }

    #[test]
    fn parses_peer_address() {
        let key = *gossip(1).local().public_key();
        let address: PeerAddress = format!("tcp://127.0.0.1:2000/{key}").parse().unwrap();
        assert_eq!(address.endpoint, "tcp://127.0.0.1:2000");
        assert_eq!(address.public_key, key);
        assert_eq!(address.to_string().parse::<PeerAddress>().unwrap(), address);
    }

    #[test]
    fn rejects_malformed_address() {
        assert!("no-slash".parse::<PeerAddress>().is_err());
        assert!("tcp://host:1/nothex".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn exchange_converges_both_sides() {
        let mut a = gossip(1);
        let mut b = gossip(2);
        a.beat_heart();
        a.set_local("role", GossipValue::Capability { name: "worker".into(), detail: "gpu".into() });
        b.beat_heart();

        exchange(&mut a, &mut b, 10);

        let a_key = *a.local().public_key();
        let b_key = *b.local().public_key();
        assert_eq!(b.peer(&a_key).unwrap().max_version_seen(), 2);
        assert_eq!(
            a.peer(&b_key).unwrap().get(HEARTBEAT_KEY),
            Some(&GossipValue::Heartbeat { counter: 1 })
        );
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn third_party_state_travels_transitively() {
        let mut a = gossip(1);
        let mut b = gossip(2);
        let mut c = gossip(3);
        a.beat_heart();
        exchange(&mut b, &mut a, 0);
        exchange(&mut c, &mut b, 0);
        assert!(c.peer(a.local().public_key()).is_some());
    }

    #[test]
    fn own_state_is_never_overwritten_by_peers() {
        let mut a = gossip(1);
        a.beat_heart();
        let own = a.local().deltas_after_version(0);
        assert_eq!(a.apply(own, 0), 0);
        assert!(a.peers().next().is_none());
    }

    #[test]
    fn silent_peer_fails_then_recovers() {
        let mut a = gossip(1);
        let mut b = gossip(2);
        let b_key = *b.local().public_key();
        for tick in 0..10 {
            b.beat_heart();
            exchange(&mut a, &mut b, tick * 200);
        }
        assert!(a.check_liveness(1_900).is_empty());

        let events = a.check_liveness(10_000);
        assert_eq!(events, vec![NodeEvent::PeerFailed(b_key)]);
        assert!(a.check_liveness(10_001).is_empty());

        b.beat_heart();
        exchange(&mut a, &mut b, 10_100);
        assert_eq!(a.check_liveness(10_100), vec![NodeEvent::PeerAlive(b_key)]);
    }
}

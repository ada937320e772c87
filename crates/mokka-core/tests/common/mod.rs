//! # common
//!
//! why: drive several nodes against a virtual clock without threads or sockets
//! relations: shared by comprehensive_tests.rs and cluster_simulation.rs
//! what: key helpers, Sim (in-memory delivery queue, isolation, leader bookkeeping)

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use ed25519_dalek::SigningKey;
use mokka_core::{Millis, MokkaConfig, Node, NodeEvent, NodeState, Packet, PublicKey};

pub fn signing_keys(n: usize) -> Vec<SigningKey> {
    (0..n)
        .map(|i| SigningKey::from_bytes(&[i as u8 + 1; 32]))
        .collect()
}

pub fn public_keys(keys: &[SigningKey]) -> Vec<PublicKey> {
    keys.iter().map(PublicKey::from_signing_key).collect()
}

/// Build node `index` of a cluster made of `keys`.
pub fn node_with(keys: &[SigningKey], index: usize, config: MokkaConfig) -> Node {
    let peers: Vec<PublicKey> = public_keys(keys)
        .into_iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(_, key)| key)
        .collect();
    Node::new(keys[index].clone(), &peers, config)
        .expect("valid test config")
        .with_seed(index as u64 + 1)
}

pub fn cluster(n: usize, config: MokkaConfig) -> Vec<Node> {
    let keys = signing_keys(n);
    (0..n).map(|i| node_with(&keys, i, config.clone())).collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Zero-latency network of nodes driven by a virtual clock.
pub struct Sim {
    pub now: Millis,
    pub nodes: Vec<Node>,
    index: HashMap<PublicKey, usize>,
    queue: VecDeque<(usize, usize, Packet)>,
    isolated: HashSet<usize>,
    /// term -> every node that announced itself leader of it
    pub elected: BTreeMap<u64, BTreeSet<PublicKey>>,
    pub events: Vec<Vec<NodeEvent>>,
    pub delivered: usize,
}

impl Sim {
    pub fn new(n: usize, config: MokkaConfig) -> Self {
        init_tracing();
        let nodes = cluster(n, config);
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (*node.public_key(), i))
            .collect();
        let mut sim = Self {
            now: 1_000,
            events: vec![Vec::new(); n],
            nodes,
            index,
            queue: VecDeque::new(),
            isolated: HashSet::new(),
            elected: BTreeMap::new(),
            delivered: 0,
        };
        let now = sim.now;
        for node in &mut sim.nodes {
            node.start(now);
        }
        sim
    }

    pub fn key(&self, i: usize) -> PublicKey {
        *self.nodes[i].public_key()
    }

    pub fn isolate(&mut self, i: usize) {
        self.isolated.insert(i);
    }

    pub fn heal(&mut self, i: usize) {
        self.isolated.remove(&i);
    }

    fn cut(&self, a: usize, b: usize) -> bool {
        self.isolated.contains(&a) || self.isolated.contains(&b)
    }

    /// Move outbox and events of node `i` into the sim.
    fn collect(&mut self, i: usize) {
        for outbound in self.nodes[i].drain_outbox() {
            if let Some(&to) = self.index.get(&outbound.to) {
                self.queue.push_back((i, to, outbound.packet));
            }
        }
        for event in self.nodes[i].drain_events() {
            if let NodeEvent::LeaderElected { term } = event {
                let key = self.key(i);
                self.elected.entry(term).or_default().insert(key);
            }
            self.events[i].push(event);
        }
    }

    /// Deliver everything in flight, including the replies it causes.
    pub fn flush(&mut self) {
        for i in 0..self.nodes.len() {
            self.collect(i);
        }
        while let Some((from, to, packet)) = self.queue.pop_front() {
            if self.cut(from, to) {
                continue;
            }
            self.delivered += 1;
            let now = self.now;
            let replies = self.nodes[to].process(&packet, now);
            for reply in replies {
                self.queue.push_back((to, from, reply));
            }
            self.collect(to);
        }
    }

    /// Advance the clock by `duration`, firing every timer on the way.
    pub fn run_for(&mut self, duration: Millis) {
        let end = self.now + duration;
        self.flush();
        loop {
            let next = self
                .nodes
                .iter()
                .filter_map(Node::next_deadline)
                .min()
                .unwrap_or(end);
            if next > end {
                break;
            }
            self.now = self.now.max(next);
            for i in 0..self.nodes.len() {
                let now = self.now;
                self.nodes[i].tick(now);
                self.collect(i);
            }
            self.flush();
        }
        self.now = end;
    }

    /// Run until some node leads, or `limit` ms pass.
    pub fn run_until_leader(&mut self, limit: Millis) -> Option<usize> {
        let end = self.now + limit;
        while self.now < end {
            self.run_for(10);
            if let Some(i) = self.leader_index() {
                // one heartbeat so followers learn about it
                self.run_for(60);
                return Some(i);
            }
        }
        None
    }

    pub fn leader_index(&self) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(i, node)| node.state() == NodeState::Leader && !self.isolated.contains(i))
            .max_by_key(|(_, node)| node.term())
            .map(|(i, _)| i)
    }

    pub fn assert_single_leader_per_term(&self) {
        for (term, leaders) in &self.elected {
            assert_eq!(leaders.len(), 1, "term {term} had leaders {leaders:?}");
        }
    }

    pub fn liveness_of(&self, observer: usize, peer: usize) -> Option<bool> {
        let key = self.key(peer);
        self.events[observer].iter().rev().find_map(|event| match event {
            NodeEvent::PeerAlive(k) if *k == key => Some(true),
            NodeEvent::PeerFailed(k) if *k == key => Some(false),
            _ => None,
        })
    }
}

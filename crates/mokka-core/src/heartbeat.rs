//! # heartbeat
//!
//! why: decide when a node must act on its own: send a beat, or start an election
//! relations: owned by node.rs, rearmed by processor.rs, vote.rs and replication.rs
//! what: Alarm (a single deadline), HeartbeatController (randomized election timeouts)

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::MokkaConfig;
use crate::Millis;

/// One pending deadline. Replacing it is how a timer gets cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alarm {
    due: Option<Millis>,
}

impl Alarm {
    pub fn due_never() -> Self {
        Self { due: None }
    }

    pub fn at(due: Millis) -> Self {
        Self { due: Some(due) }
    }

    pub fn is_due(&self, now: Millis) -> bool {
        self.due.is_some_and(|due| due <= now)
    }

    pub fn due(&self) -> Option<Millis> {
        self.due
    }
}

/// Owns the single heartbeat timer of a node.
///
/// Followers and candidates arm it with a randomized election timeout, the
/// leader with its fixed beat cadence.
#[derive(Debug, Clone)]
pub struct HeartbeatController {
    election_min: Millis,
    election_max: Millis,
    heartbeat: Millis,
    alarm: Alarm,
    rng: StdRng,
}

impl HeartbeatController {
    pub fn new(config: &MokkaConfig) -> Self {
        Self {
            election_min: config.election_min,
            election_max: config.election_max,
            heartbeat: config.heartbeat,
            alarm: Alarm::due_never(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Make timeout draws reproducible.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Cancel whatever is pending and fire `interval` after `now`.
    pub fn set_next_beat(&mut self, interval: Millis, now: Millis) {
        self.alarm = Alarm::at(now.saturating_add(interval));
    }

    /// A fresh election timeout drawn uniformly from the configured bounds.
    pub fn timeout(&mut self) -> Millis {
        self.rng.gen_range(self.election_min..=self.election_max)
    }

    pub fn election_max(&self) -> Millis {
        self.election_max
    }

    pub fn heartbeat(&self) -> Millis {
        self.heartbeat
    }

    pub fn is_due(&self, now: Millis) -> bool {
        self.alarm.is_due(now)
    }

    pub fn deadline(&self) -> Option<Millis> {
        self.alarm.due()
    }

    /// Put back a deadline read earlier through [`HeartbeatController::deadline`].
    pub fn restore(&mut self, deadline: Option<Millis>) {
        self.alarm = Alarm { due: deadline };
    }
}

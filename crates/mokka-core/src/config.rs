//! # config
//!
//! why: collect every tunable of a node in one serde-friendly place
//! relations: read by node.rs, heartbeat.rs and gossip/ at construction
//! what: MokkaConfig timing/tuning values, NodeSettings (key material + peers) loadable from json

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::gossip::detector::DEFAULT_PHI_THRESHOLD;
use crate::keys::{parse_signing_key, PublicKey};
use crate::Millis;

/// Timing and tuning of a node. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MokkaConfig {
    /// Lower bound of the randomized election timeout.
    pub election_min: Millis,
    /// Upper bound of the randomized election timeout, also the grace period
    /// armed when a leader packet arrives.
    pub election_max: Millis,
    /// Leader heartbeat cadence.
    pub heartbeat: Millis,
    /// Gossip tick cadence.
    pub gossip_heartbeat: Millis,
    /// Lifetime of a leader proof. `None` means proofs never expire.
    pub proof_expiration: Option<Millis>,
    /// Max entries shipped in one append.
    pub append_batch_size: usize,
    /// Phi above which a gossip peer is considered failed.
    pub phi_threshold: f64,
}

impl Default for MokkaConfig {
    fn default() -> Self {
        Self {
            election_min: 150,
            election_max: 300,
            heartbeat: 50,
            gossip_heartbeat: 200,
            proof_expiration: None,
            append_batch_size: 64,
            phi_threshold: DEFAULT_PHI_THRESHOLD,
        }
    }
}

impl MokkaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_min == 0 || self.election_min > self.election_max {
            return Err(ConfigError::InvalidTiming(format!(
                "election bounds [{}, {}] are empty",
                self.election_min, self.election_max
            )));
        }
        if self.heartbeat == 0 || self.gossip_heartbeat == 0 {
            return Err(ConfigError::InvalidTiming(
                "heartbeat cadences must be positive".to_string(),
            ));
        }
        if self.heartbeat >= self.election_min {
            return Err(ConfigError::InvalidTiming(format!(
                "heartbeat {} must be shorter than election_min {}",
                self.heartbeat, self.election_min
            )));
        }
        if self.append_batch_size == 0 {
            return Err(ConfigError::InvalidTiming(
                "append_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything needed to build a node, as it appears in a settings file.
///
/// ```json
/// { "private_key": "<hex>", "peers": ["<hex>", "<hex>"], "election_min": 300, "heartbeat": 100 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub private_key: String,
    #[serde(default)]
    pub peers: Vec<PublicKey>,
    #[serde(flatten)]
    pub config: MokkaConfig,
}

impl NodeSettings {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(text)?;
        settings.config.validate()?;
        Ok(settings)
    }

    pub fn signing_key(&self) -> Result<SigningKey, ConfigError> {
        parse_signing_key(&self.private_key)
    }
}

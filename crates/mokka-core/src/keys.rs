//! # keys
//!
//! why: give every node a value-typed identity that can key maps and travel on the wire
//! relations: used by proof.rs and vote.rs for election signatures, gossip/ for delta signatures
//! what: PublicKey, SignatureBytes, KnownKeys, signing key parsing

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// Verifying keys of every configured cluster member, self included.
pub type KnownKeys = BTreeMap<PublicKey, VerifyingKey>;

/// Raw ed25519 public key of a node. Hex encoded in text form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_signing_key(key: &SigningKey) -> Self {
        Self(key.verifying_key().to_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse the key as a curve point. Fails for bytes that are not a valid key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, ConfigError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| ConfigError::InvalidKey(self.to_string()))
    }

    /// First four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl FromStr for PublicKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| ConfigError::InvalidKey(s.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConfigError::InvalidKey(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// Detached ed25519 signature bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub fn sign(key: &SigningKey, message: &[u8]) -> Self {
        Self(key.sign(message).to_bytes())
    }

    pub fn verify(&self, key: &VerifyingKey, message: &[u8]) -> bool {
        key.verify(message, &Signature::from_bytes(&self.0)).is_ok()
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({}..)", hex::encode(&self.0[..6]))
    }
}

impl Serialize for SignatureBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for SignatureBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(de::Error::custom)?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| de::Error::custom("signature must be 64 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Parse a hex private key. Accepts a 32 byte seed or a 64 byte
/// seed-then-public-key secret as produced by nacl style tooling.
pub fn parse_signing_key(text: &str) -> Result<SigningKey, ConfigError> {
    let invalid = || ConfigError::InvalidKey("private key".to_string());
    let bytes = hex::decode(text.trim()).map_err(|_| invalid())?;
    let seed: [u8; 32] = match bytes.len() {
        32 | 64 => bytes[..32].try_into().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };
    Ok(SigningKey::from_bytes(&seed))
}

//! # message
//!
//! why: define everything that travels between nodes
//! relations: built by node.rs, vote.rs, replication.rs and gossip/, dispatched by processor.rs
//! what: Packet envelope, Message kinds and their payloads, json wire codec

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::gossip::{Delta, Digest};
use crate::keys::{PublicKey, SignatureBytes};
use crate::log::{EntryRef, ReplicatedEntry};
use crate::node::NodeState;
use crate::proof::Proof;
use crate::Millis;

/// Envelope around every message: the sender's view of itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub message: Message,
    pub term: u64,
    pub state: NodeState,
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A packet waiting to be delivered to `to`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: PublicKey,
    pub packet: Packet,
}

/// Every message kind, on the wire as `{"type": kind, "data": payload}`.
/// Kinds this build does not know decode to `Unknown` and encode back under their own type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawMessage")]
pub enum Message {
    Vote(VoteRequest),
    Voted(VoteResponse),
    Append(AppendRequest),
    Appended(AppendResponse),
    Error(String),
    Propose(ProposeRequest),
    Proposed(ProposeResponse),
    GossipRequest(GossipDigest),
    GossipFirstResponse(GossipReply),
    GossipSecondResponse(GossipDeltas),
    Unknown(String),
}

impl Message {
    pub fn kind(&self) -> &str {
        match self {
            Message::Vote(_) => "vote",
            Message::Voted(_) => "voted",
            Message::Append(_) => "append",
            Message::Appended(_) => "appended",
            Message::Error(_) => "error",
            Message::Propose(_) => "propose",
            Message::Proposed(_) => "proposed",
            Message::GossipRequest(_) => "gossip_request",
            Message::GossipFirstResponse(_) => "gossip_first_response",
            Message::GossipSecondResponse(_) => "gossip_second_response",
            Message::Unknown(kind) => kind,
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Message", 2)?;
        state.serialize_field("type", self.kind())?;
        match self {
            Message::Vote(data) => state.serialize_field("data", data)?,
            Message::Voted(data) => state.serialize_field("data", data)?,
            Message::Append(data) => state.serialize_field("data", data)?,
            Message::Appended(data) => state.serialize_field("data", data)?,
            Message::Error(reason) => state.serialize_field("data", reason)?,
            Message::Propose(data) => state.serialize_field("data", data)?,
            Message::Proposed(data) => state.serialize_field("data", data)?,
            Message::GossipRequest(data) => state.serialize_field("data", data)?,
            Message::GossipFirstResponse(data) => state.serialize_field("data", data)?,
            Message::GossipSecondResponse(data) => state.serialize_field("data", data)?,
            Message::Unknown(_) => state.serialize_field("data", &serde_json::Value::Null)?,
        }
        state.end()
    }
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl TryFrom<RawMessage> for Message {
    type Error = serde_json::Error;

    fn try_from(raw: RawMessage) -> Result<Self, serde_json::Error> {
        use serde_json::from_value;

        let data = raw.data;
        let message = match raw.kind.as_str() {
            "vote" => Message::Vote(from_value(data)?),
            "voted" => Message::Voted(from_value(data)?),
            "append" => Message::Append(from_value(data)?),
            "appended" => Message::Appended(from_value(data)?),
            "error" => Message::Error(from_value(data)?),
            "propose" => Message::Propose(from_value(data)?),
            "proposed" => Message::Proposed(from_value(data)?),
            "gossip_request" => Message::GossipRequest(from_value(data)?),
            "gossip_first_response" => Message::GossipFirstResponse(from_value(data)?),
            "gossip_second_response" => Message::GossipSecondResponse(from_value(data)?),
            _ => Message::Unknown(raw.kind),
        };
        Ok(message)
    }
}

/// Candidate asking for a vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Start of the election, bound into every vote signature
    pub minted_at: Millis,
    pub last_index: u64,
    pub last_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureBytes>,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub prev_index: u64,
    pub prev_term: u64,
    pub entries: Vec<ReplicatedEntry>,
    pub commit_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub success: bool,
    /// On success the highest index known to match, otherwise where the leader should retry from
    pub last_index: u64,
}

/// Task forwarded from a follower to the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub request_id: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeResponse {
    pub request_id: u64,
    /// `None` when the receiver was not the leader
    pub entry: Option<EntryRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigest {
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipReply {
    pub digest: Digest,
    pub deltas: Vec<Delta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDeltas {
    pub deltas: Vec<Delta>,
}

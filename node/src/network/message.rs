//! Wire envelope and typed message payloads.
//!
//! Every exchange is one JSON object per line:
//!
//! ```text
//! {"type": "...", "sender_id": "...", "data": {...}, "timestamp": 1.0, "protocol": "aria/0.1"}
//! ```
//!
//! The `type` tag is kept as a string in [`Envelope`] so that unknown tags
//! survive decoding and can be answered with an explicit error; handlers
//! dispatch on the closed [`MessageKind`] enum.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{ConsentDescriptor, InferenceResult, PipelineState, unix_now};

pub const PROTOCOL_VERSION: &str = "aria/0.1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    PeerAnnounce,
    ShardAnnounce,
    GetPeers,
    InferenceRequest,
    PipelineForward,
    Response,
    Error,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::PeerAnnounce => "peer_announce",
            MessageKind::ShardAnnounce => "shard_announce",
            MessageKind::GetPeers => "get_peers",
            MessageKind::InferenceRequest => "inference_request",
            MessageKind::PipelineForward => "pipeline_forward",
            MessageKind::Response => "response",
            MessageKind::Error => "error",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            "peer_announce" => MessageKind::PeerAnnounce,
            "shard_announce" => MessageKind::ShardAnnounce,
            "get_peers" => MessageKind::GetPeers,
            "inference_request" => MessageKind::InferenceRequest,
            "pipeline_forward" => MessageKind::PipelineForward,
            "response" => MessageKind::Response,
            "error" => MessageKind::Error,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_protocol() -> String {
    PROTOCOL_VERSION.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub sender_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: f64,
    #[serde(rename = "protocol", default = "default_protocol")]
    pub protocol_version: String,
}

impl Envelope {
    pub fn new<T: Serialize + ?Sized>(
        kind: MessageKind,
        sender_id: &str,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.as_str().to_string(),
            sender_id: sender_id.to_string(),
            data: serde_json::to_value(data)?,
            timestamp: unix_now(),
            protocol_version: default_protocol(),
        })
    }

    /// Builds an `error` envelope carrying `{"error": message}`.
    pub fn error(sender_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error.as_str().to_string(),
            sender_id: sender_id.to_string(),
            data: serde_json::json!({ "error": message.into() }),
            timestamp: unix_now(),
            protocol_version: default_protocol(),
        }
    }

    /// Whether the sender speaks this node's protocol version.
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }

    /// `None` for tags outside the protocol.
    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.kind)
    }

    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    /// Message carried by an `error` envelope, if this is one.
    pub fn error_message(&self) -> Option<&str> {
        if self.kind() != Some(MessageKind::Error) {
            return None;
        }
        Some(self.data.get("error").and_then(|e| e.as_str()).unwrap_or("unknown error"))
    }

    /// Serializes to one newline-terminated frame.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

/// Self-description a node sends on connect, and the unit of `get_peers`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerAdvert {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub consent: Option<ConsentDescriptor>,
    #[serde(default)]
    pub shards: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

/// Reply to `peer_announce`. Carries the responder's own advert so the
/// connecting side can register it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnnounceAck {
    pub status: AckStatus,
    pub peer_id: String,
    pub peer_count: usize,
    #[serde(default)]
    pub consent: Option<ConsentDescriptor>,
    #[serde(default)]
    pub shards: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardAnnounce {
    pub shard_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardAck {
    pub status: String,
    pub shards: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub node_id: String,
    pub timestamp: f64,
    pub peer_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<PeerAdvert>,
}

/// Payload of `inference_request`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceQuery {
    pub request_id: String,
    pub query: String,
    pub model_id: String,
    pub max_tokens: u32,
}

/// Payload of `pipeline_forward`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineForward {
    pub state: PipelineState,
    #[serde(default)]
    pub replicas: Vec<String>,
    /// Time the receiver has, counted from receipt, to return the completed
    /// inference, its own downstream forwards included. Absent means each
    /// downstream target gets the receiver's own `forward_timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_ms: Option<u64>,
}

/// Reply to `pipeline_forward` and `inference_request`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageReply {
    Completed { result: InferenceResult },
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_protocol_field_names() {
        let env = Envelope::new(MessageKind::Ping, "a", &serde_json::json!({})).unwrap();
        let json: serde_json::Value = serde_json::from_str(&env.to_line().unwrap()).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["sender_id"], "a");
        assert_eq!(json["protocol"], "aria/0.1");
        assert!(json["timestamp"].as_f64().is_some());
    }

    #[test]
    fn unknown_tag_decodes_but_has_no_kind() {
        let line = r#"{"type":"gossip_v9","sender_id":"x","data":{},"timestamp":1.0}"#;
        let env = Envelope::from_line(line).unwrap();
        assert_eq!(env.kind(), None);
        assert_eq!(env.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn every_kind_round_trips_through_its_tag() {
        use MessageKind::*;
        for kind in [
            Ping,
            Pong,
            PeerAnnounce,
            ShardAnnounce,
            GetPeers,
            InferenceRequest,
            PipelineForward,
            Response,
            Error,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn error_envelope_exposes_message() {
        let env = Envelope::error("n", "bad thing");
        assert_eq!(env.error_message(), Some("bad thing"));
        let ping = Envelope::new(MessageKind::Ping, "n", &()).unwrap();
        assert_eq!(ping.error_message(), None);
    }

    #[test]
    fn unsized_payloads_build_envelopes() {
        let shards: &[String] = &["m_L0-7".to_string()];
        let env = Envelope::new(MessageKind::ShardAnnounce, "a", shards).unwrap();
        assert_eq!(env.data, serde_json::json!(["m_L0-7"]));
        let text: &str = "hello";
        assert_eq!(Envelope::new(MessageKind::Ping, "a", text).unwrap().data, "hello");
    }

    #[test]
    fn foreign_protocol_version_is_incompatible() {
        let line = r#"{"type":"ping","sender_id":"x","data":{},"timestamp":1.0,"protocol":"aria/9.9"}"#;
        let env = Envelope::from_line(line).unwrap();
        assert!(!env.is_compatible());
        assert!(Envelope::new(MessageKind::Ping, "x", &()).unwrap().is_compatible());
    }

    #[test]
    fn forward_budget_is_optional_on_the_wire() {
        let json = serde_json::json!({
            "state": serde_json::to_value(PipelineState {
                request_id: "r".to_string(),
                model_id: "m".to_string(),
                query: "q".to_string(),
                max_tokens: 1,
                activations: vec![],
                current_layer: 0,
                total_layers: 1,
                nodes_used: vec![],
                total_energy_mj: 0.0,
                start_time: 0.0,
                originator_id: "o".to_string(),
            })
            .unwrap(),
        });
        let forward: PipelineForward = serde_json::from_value(json).unwrap();
        assert_eq!(forward.budget_ms, None);
        assert!(forward.replicas.is_empty());
    }

    #[test]
    fn stage_reply_is_tagged_by_status() {
        let reply = StageReply::Error {
            error: "no node for layer 8".to_string(),
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "no node for layer 8");
    }

    #[test]
    fn ack_status_is_lowercase() {
        let ack = AnnounceAck {
            status: AckStatus::Accepted,
            peer_id: "b".to_string(),
            peer_count: 3,
            consent: None,
            shards: vec![],
            reason: None,
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["status"], "accepted");
        assert!(json.get("reason").is_none());
    }
}

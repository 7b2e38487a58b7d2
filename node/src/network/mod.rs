//! Peer-to-peer layer: wire protocol, peer directory and TCP transport.

pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod message;
pub mod peer;
pub mod transport;

pub use config::NetworkConfig;
pub use connection::PeerConnection;
pub use directory::{NetworkStats, NextStage, PeerDirectory};
pub use error::NetworkError;
pub use message::{
    AckStatus, AnnounceAck, Envelope, InferenceQuery, MessageKind, PROTOCOL_VERSION, PeerAdvert,
    PeerList, PipelineForward, StageReply,
};
pub use peer::{PEER_TTL_SECS, PeerRecord};
pub use transport::{HandlerError, HeartbeatReport, RequestHandler, Transport};

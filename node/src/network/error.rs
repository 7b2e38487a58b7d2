use std::fmt;

/// Errors raised by the peer transport.
#[derive(Debug)]
pub enum NetworkError {
    Io(std::io::Error),
    /// Frame was not valid JSON for the expected shape.
    Codec(serde_json::Error),
    /// Frame exceeded the configured size limit.
    FrameTooLarge(usize),
    /// The remote side closed the connection mid-exchange.
    ConnectionClosed(String),
    /// An earlier exchange on this connection failed; the request was not
    /// sent.
    ConnectionReset(String),
    /// Envelope carries a protocol version this node does not speak.
    ProtocolMismatch(String),
    /// A bounded operation did not finish in time.
    Timeout { peer: String, op: &'static str },
    /// No route (address) is known for this node id.
    UnknownPeer(String),
    /// A dial target that is not `host:port`.
    InvalidAddress(String),
    /// Envelope type this node does not serve.
    UnsupportedMessage(String),
    /// Peer answered `peer_announce` with something other than `accepted`.
    HandshakeRejected { peer: String, reason: String },
    /// Peer answered with an `error` envelope.
    Remote { peer: String, message: String },
    /// Peer answered with an unexpected envelope type.
    UnexpectedReply { peer: String, kind: String },
    /// A completed result came back for a different request.
    MismatchedReply {
        peer: String,
        expected: String,
        got: String,
    },
    /// Forwarding failed on the primary target and every replica.
    AllTargetsFailed { targets: Vec<String> },
    /// Transport has been stopped.
    Stopped,
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        NetworkError::Io(e)
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        NetworkError::Codec(e)
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Io(e) => write!(f, "i/o error: {e}"),
            NetworkError::Codec(e) => write!(f, "malformed message: {e}"),
            NetworkError::FrameTooLarge(n) => write!(f, "frame of {n} bytes exceeds limit"),
            NetworkError::ConnectionClosed(peer) => write!(f, "connection to {peer} closed"),
            NetworkError::ConnectionReset(peer) => {
                write!(f, "connection to {peer} was reset by an earlier failure")
            }
            NetworkError::ProtocolMismatch(version) => {
                write!(f, "unsupported protocol version {version:?}")
            }
            NetworkError::Timeout { peer, op } => write!(f, "{op} to {peer} timed out"),
            NetworkError::UnknownPeer(id) => write!(f, "unknown peer {id}"),
            NetworkError::InvalidAddress(addr) => write!(f, "invalid peer address {addr:?}"),
            NetworkError::UnsupportedMessage(kind) => write!(f, "unsupported message type {kind:?}"),
            NetworkError::HandshakeRejected { peer, reason } => {
                write!(f, "peer {peer} rejected handshake: {reason}")
            }
            NetworkError::Remote { peer, message } => write!(f, "peer {peer} replied error: {message}"),
            NetworkError::UnexpectedReply { peer, kind } => {
                write!(f, "unexpected {kind:?} reply from {peer}")
            }
            NetworkError::MismatchedReply { peer, expected, got } => {
                write!(f, "peer {peer} returned result for {got} instead of {expected}")
            }
            NetworkError::AllTargetsFailed { targets } => {
                write!(f, "all forwarding targets failed: {}", targets.join(", "))
            }
            NetworkError::Stopped => write!(f, "transport stopped"),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Io(e) => Some(e),
            NetworkError::Codec(e) => Some(e),
            _ => None,
        }
    }
}

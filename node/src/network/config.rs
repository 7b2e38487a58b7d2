use std::net::SocketAddr;
use std::time::Duration;

/// Transport configuration.
///
/// Every cross-node call is bounded by one of these timeouts.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Address the listener binds to. Port 0 picks an ephemeral port.
    pub listen_addr: SocketAddr,
    /// Host advertised to peers in `peer_announce`.
    pub advertise_host: String,
    /// Outbound connect plus `peer_announce` acknowledgment.
    pub handshake_timeout: Duration,
    /// Generic request/response exchange (`get_peers`, `inference_request`).
    pub request_timeout: Duration,
    /// Heartbeat ping per peer.
    pub ping_timeout: Duration,
    /// Per-stage share of a pipeline's end-to-end budget: the originator
    /// allows `forward_timeout × stages`. Also the per-target wait for a
    /// forward that carries no budget.
    pub forward_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Upper bound on a single line-delimited frame.
    pub max_frame_bytes: usize,
    /// `host:port` strings dialled at startup.
    pub bootstrap_peers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        // Safe to unwrap: this is a fixed, valid address literal.
        let addr: SocketAddr = "0.0.0.0:8765"
            .parse()
            .expect("hard-coded listen address should parse");
        Self {
            listen_addr: addr,
            advertise_host: "127.0.0.1".to_string(),
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            forward_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            max_frame_bytes: 16 * 1024 * 1024,
            bootstrap_peers: Vec::new(),
        }
    }
}

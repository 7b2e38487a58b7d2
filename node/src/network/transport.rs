//! TCP transport: listener, handshake, heartbeat and pipeline forwarding.
//!
//! Inbound connections are served one frame at a time: read a request,
//! dispatch it on its [`MessageKind`], write exactly one reply. Outbound
//! traffic goes through one [`PeerConnection`] per peer, opened on demand and
//! discarded after any transport failure so the next call reconnects.
//!
//! The peer table lives in a shared [`PeerDirectory`]; the lock on it is
//! only ever held for a lookup or an update, never across socket I/O.

use std::collections::HashMap;
use std::future::Future;
use std::iter;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::metrics::NodeMetrics;
use crate::types::{ConsentDescriptor, InferenceResult, PipelineState, unix_now};

use super::config::NetworkConfig;
use super::connection::{PeerConnection, read_frame, write_frame};
use super::directory::PeerDirectory;
use super::error::NetworkError;
use super::message::{
    AckStatus, AnnounceAck, Envelope, InferenceQuery, MessageKind, PeerAdvert, PeerList, Pong,
    PipelineForward, ShardAck, ShardAnnounce, StageReply,
};
use super::peer::PeerRecord;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Application-level handling of the two work-carrying message types.
///
/// Everything else (`ping`, `peer_announce`, `get_peers`, ...) is answered
/// by the transport itself.
pub trait RequestHandler: Send + Sync + 'static {
    /// Runs a whole inference locally on behalf of `sender`.
    fn handle_inference(
        &self,
        sender: &str,
        query: InferenceQuery,
    ) -> impl Future<Output = Result<InferenceResult, HandlerError>> + Send;

    /// Processes one pipeline stage and returns the final result once the
    /// rest of the chain has completed.
    fn handle_pipeline(
        &self,
        sender: &str,
        forward: PipelineForward,
    ) -> impl Future<Output = Result<InferenceResult, HandlerError>> + Send;
}

/// Outcome of one heartbeat round.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub responded: usize,
    pub pruned: Vec<String>,
}

async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *rx.borrow_and_update();
        if stopped || rx.changed().await.is_err() {
            return;
        }
    }
}

/// Share of a forward's wait handed down as the receiver's own budget; the
/// rest covers the reply's way back.
fn downstream_budget(wait: Duration) -> Duration {
    wait - wait / 10
}

fn split_host_port(addr: &str) -> Result<(String, u16), NetworkError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| NetworkError::InvalidAddress(addr.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| NetworkError::InvalidAddress(addr.to_string()))?;
    if host.is_empty() {
        return Err(NetworkError::InvalidAddress(addr.to_string()));
    }
    Ok((host.to_string(), port))
}

pub struct Transport {
    config: NetworkConfig,
    local_id: String,
    directory: Arc<RwLock<PeerDirectory>>,
    connections: Mutex<HashMap<String, Arc<PeerConnection>>>,
    metrics: NodeMetrics,
    shutdown: watch::Sender<bool>,
}

impl Transport {
    pub fn new(
        node_id: impl Into<String>,
        consent: ConsentDescriptor,
        config: NetworkConfig,
        metrics: NodeMetrics,
    ) -> Self {
        let local_id = node_id.into();
        let directory = PeerDirectory::new(
            local_id.clone(),
            config.advertise_host.clone(),
            config.listen_addr.port(),
            consent,
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            local_id,
            directory: Arc::new(RwLock::new(directory)),
            connections: Mutex::new(HashMap::new()),
            metrics,
            shutdown,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<RwLock<PeerDirectory>> {
        &self.directory
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    // ---- server side ----

    /// Binds the listener and records the actual port in the directory, so
    /// a `:0` listen address advertises the ephemeral port it got.
    pub async fn bind(&self) -> Result<TcpListener, NetworkError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local = listener.local_addr()?;
        self.directory.write().await.set_local_port(local.port());
        info!(node_id = %self.local_id, addr = %local, "listening");
        Ok(listener)
    }

    /// Spawns the accept loop. It runs until [`Transport::stop`].
    pub fn spawn_server<H: RequestHandler>(
        self: &Arc<Self>,
        listener: TcpListener,
        handler: Arc<H>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = this.shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = wait_for_stop(&mut shutdown) => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            debug!(%remote, "accepted connection");
                            let conn_this = Arc::clone(&this);
                            let conn_handler = Arc::clone(&handler);
                            tokio::spawn(async move {
                                if let Err(e) = conn_this.serve_connection(stream, conn_handler).await {
                                    debug!(%remote, error = %e, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    },
                }
            }
            debug!(node_id = %this.local_id, "listener stopped");
        })
    }

    async fn serve_connection<H: RequestHandler>(
        self: Arc<Self>,
        stream: TcpStream,
        handler: Arc<H>,
    ) -> Result<(), NetworkError> {
        stream.set_nodelay(true)?;
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let frame = tokio::select! {
                _ = wait_for_stop(&mut shutdown) => return Ok(()),
                frame = read_frame(&mut reader, self.config.max_frame_bytes) => frame?,
            };
            let Some(line) = frame else {
                return Ok(());
            };
            let reply = self.dispatch(&line, handler.as_ref()).await;
            write_frame(&mut write, &reply).await?;
            self.metrics.messages_sent.inc();
            self.directory.write().await.note_sent();
        }
    }

    /// Turns one inbound frame into exactly one reply envelope. Failures
    /// become `error` envelopes; nothing is dropped silently.
    async fn dispatch<H: RequestHandler>(&self, line: &str, handler: &H) -> Envelope {
        self.metrics.messages_received.inc();
        let envelope = match Envelope::from_line(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "malformed message");
                return Envelope::error(&self.local_id, format!("malformed message: {e}"));
            }
        };
        if !envelope.is_compatible() {
            let err = NetworkError::ProtocolMismatch(envelope.protocol_version.clone());
            debug!(sender = %envelope.sender_id, error = %err, "rejecting message");
            return Envelope::error(&self.local_id, err.to_string());
        }
        {
            let mut directory = self.directory.write().await;
            directory.note_received();
            directory.touch(&envelope.sender_id, unix_now());
        }

        let reply = match envelope.kind() {
            Some(MessageKind::Ping) => self.on_ping().await,
            Some(MessageKind::PeerAnnounce) => self.on_peer_announce(&envelope).await,
            Some(MessageKind::ShardAnnounce) => self.on_shard_announce(&envelope).await,
            Some(MessageKind::GetPeers) => self.on_get_peers().await,
            Some(MessageKind::InferenceRequest) => match envelope.parse_data::<InferenceQuery>() {
                Ok(query) => {
                    let outcome = handler.handle_inference(&envelope.sender_id, query).await;
                    self.stage_reply(outcome)
                }
                Err(e) => Err(e.into()),
            },
            Some(MessageKind::PipelineForward) => match envelope.parse_data::<PipelineForward>() {
                Ok(forward) => {
                    let outcome = handler.handle_pipeline(&envelope.sender_id, forward).await;
                    self.stage_reply(outcome)
                }
                Err(e) => Err(e.into()),
            },
            Some(MessageKind::Pong | MessageKind::Response | MessageKind::Error) | None => {
                Err(NetworkError::UnsupportedMessage(envelope.kind.clone()))
            }
        };

        reply.unwrap_or_else(|e| {
            debug!(sender = %envelope.sender_id, kind = %envelope.kind, error = %e, "rejecting message");
            Envelope::error(&self.local_id, e.to_string())
        })
    }

    async fn on_ping(&self) -> Result<Envelope, NetworkError> {
        let peer_count = self.directory.read().await.len();
        let pong = Pong {
            node_id: self.local_id.clone(),
            timestamp: unix_now(),
            peer_count,
        };
        Ok(Envelope::new(MessageKind::Pong, &self.local_id, &pong)?)
    }

    async fn on_peer_announce(&self, envelope: &Envelope) -> Result<Envelope, NetworkError> {
        let advert: PeerAdvert = envelope.parse_data()?;
        let mut directory = self.directory.write().await;

        let reason = if advert.node_id.is_empty() {
            Some("empty node id".to_string())
        } else if advert.node_id == self.local_id {
            Some("node id collides with responder".to_string())
        } else {
            None
        };
        if reason.is_none() {
            let peer_id = advert.node_id.clone();
            let mut peer = PeerRecord::from_advert(advert);
            peer.last_seen = unix_now();
            directory.add_peer(peer);
            info!(peer_id = %peer_id, "peer announced");
        }

        let ack = AnnounceAck {
            status: if reason.is_none() {
                AckStatus::Accepted
            } else {
                AckStatus::Rejected
            },
            peer_id: self.local_id.clone(),
            peer_count: directory.len(),
            consent: Some(directory.local_consent().clone()),
            shards: directory.local_shard_ids(),
            reason,
        };
        Ok(Envelope::new(MessageKind::Response, &self.local_id, &ack)?)
    }

    async fn on_shard_announce(&self, envelope: &Envelope) -> Result<Envelope, NetworkError> {
        let announce: ShardAnnounce = envelope.parse_data()?;
        let count = announce.shard_ids.len();
        let known = self
            .directory
            .write()
            .await
            .set_peer_shards(&envelope.sender_id, announce.shard_ids);
        if !known {
            return Err(NetworkError::UnknownPeer(envelope.sender_id.clone()));
        }
        debug!(peer_id = %envelope.sender_id, shards = count, "shards announced");
        let ack = ShardAck {
            status: "ok".to_string(),
            shards: count,
        };
        Ok(Envelope::new(MessageKind::Response, &self.local_id, &ack)?)
    }

    async fn on_get_peers(&self) -> Result<Envelope, NetworkError> {
        let peers = self
            .directory
            .read()
            .await
            .get_alive_peers()
            .into_iter()
            .map(PeerRecord::to_advert)
            .collect();
        Ok(Envelope::new(MessageKind::Response, &self.local_id, &PeerList { peers })?)
    }

    fn stage_reply(
        &self,
        outcome: Result<InferenceResult, HandlerError>,
    ) -> Result<Envelope, NetworkError> {
        let reply = match outcome {
            Ok(result) => StageReply::Completed { result },
            Err(e) => StageReply::Error { error: e.to_string() },
        };
        Ok(Envelope::new(MessageKind::Response, &self.local_id, &reply)?)
    }

    // ---- client side ----

    async fn connection_for(&self, node_id: &str) -> Result<Arc<PeerConnection>, NetworkError> {
        if let Some(conn) = self.connections.lock().await.get(node_id) {
            return Ok(Arc::clone(conn));
        }
        let addr = self
            .directory
            .read()
            .await
            .peer(node_id)
            .map(PeerRecord::addr)
            .ok_or_else(|| NetworkError::UnknownPeer(node_id.to_string()))?;

        let connect = PeerConnection::connect(&addr, self.config.max_frame_bytes);
        let conn = match tokio::time::timeout(self.config.handshake_timeout, connect).await {
            Ok(conn) => Arc::new(conn?),
            Err(_) => {
                return Err(NetworkError::Timeout {
                    peer: node_id.to_string(),
                    op: "connect",
                });
            }
        };
        debug!(peer_id = %node_id, %addr, "opened connection");

        let mut connections = self.connections.lock().await;
        Ok(Arc::clone(
            connections.entry(node_id.to_string()).or_insert(conn),
        ))
    }

    async fn drop_connection(&self, node_id: &str, conn: &Arc<PeerConnection>) {
        let mut connections = self.connections.lock().await;
        if connections
            .get(node_id)
            .is_some_and(|current| Arc::ptr_eq(current, conn))
        {
            connections.remove(node_id);
        }
    }

    /// One request/reply exchange with a known peer, bounded by `timeout`.
    ///
    /// An `error` reply is returned as [`NetworkError::Remote`]. Transport
    /// failures discard the connection. A request that found its connection
    /// already discarded is sent once more on a fresh one, within what is
    /// left of `timeout`.
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        node_id: &str,
        kind: MessageKind,
        data: &T,
        timeout: Duration,
        op: &'static str,
    ) -> Result<Envelope, NetworkError> {
        if self.is_stopped() {
            return Err(NetworkError::Stopped);
        }
        let started = Instant::now();
        let envelope = Envelope::new(kind, &self.local_id, data)?;
        let mut conn = self.connection_for(node_id).await?;

        self.metrics.messages_sent.inc();
        self.directory.write().await.note_sent();

        let mut outcome = conn.exchange(&envelope, timeout, op).await;
        if matches!(outcome, Err(NetworkError::ConnectionReset(_))) {
            self.drop_connection(node_id, &conn).await;
            conn = self.connection_for(node_id).await?;
            let remaining = timeout.saturating_sub(started.elapsed());
            outcome = conn.exchange(&envelope, remaining, op).await;
        }
        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                self.drop_connection(node_id, &conn).await;
                return Err(e);
            }
        };

        self.metrics.messages_received.inc();
        {
            let mut directory = self.directory.write().await;
            directory.note_received();
            directory.touch(node_id, unix_now());
        }
        if !reply.is_compatible() {
            return Err(NetworkError::ProtocolMismatch(reply.protocol_version));
        }
        if let Some(message) = reply.error_message() {
            return Err(NetworkError::Remote {
                peer: node_id.to_string(),
                message: message.to_string(),
            });
        }
        Ok(reply)
    }

    /// [`Transport::request`] with the generic request timeout.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        node_id: &str,
        kind: MessageKind,
        data: &T,
    ) -> Result<Envelope, NetworkError> {
        self.request(node_id, kind, data, self.config.request_timeout, kind.as_str())
            .await
    }

    /// Sends to every known peer in turn. Returns the ids that replied
    /// without error.
    pub async fn broadcast<T: Serialize + ?Sized>(&self, kind: MessageKind, data: &T) -> Vec<String> {
        let peer_ids = self.directory.read().await.peer_ids();
        let mut delivered = Vec::new();
        for peer_id in peer_ids {
            match self.send(&peer_id, kind, data).await {
                Ok(_) => delivered.push(peer_id),
                Err(e) => warn!(peer_id = %peer_id, %kind, error = %e, "broadcast failed"),
            }
        }
        delivered
    }

    /// Dials `addr`, announces this node and waits for an `accepted`
    /// acknowledgment. Only then is the peer added to the directory.
    ///
    /// Returns the remote node id.
    pub async fn connect_to_peer(&self, addr: &str) -> Result<String, NetworkError> {
        if self.is_stopped() {
            return Err(NetworkError::Stopped);
        }
        let (host, port) = split_host_port(addr)?;
        let advert = self.directory.read().await.local_advert();
        let hello = Envelope::new(MessageKind::PeerAnnounce, &self.local_id, &advert)?;

        let timeout = self.config.handshake_timeout;
        let handshake = async {
            let conn = PeerConnection::connect(addr, self.config.max_frame_bytes).await?;
            let reply = conn.exchange(&hello, timeout, "handshake").await?;
            Ok::<_, NetworkError>((conn, reply))
        };
        let (conn, reply) = match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(NetworkError::Timeout {
                    peer: addr.to_string(),
                    op: "handshake",
                });
            }
        };

        let rejected = |reason: String| NetworkError::HandshakeRejected {
            peer: addr.to_string(),
            reason,
        };
        if let Some(message) = reply.error_message() {
            return Err(rejected(message.to_string()));
        }
        let ack: AnnounceAck = reply.parse_data()?;
        if ack.status != AckStatus::Accepted {
            return Err(rejected(ack.reason.unwrap_or_else(|| "rejected".to_string())));
        }
        if ack.peer_id.is_empty() || ack.peer_id == self.local_id {
            conn.close().await;
            return Err(rejected(format!("unusable peer id {:?}", ack.peer_id)));
        }

        let peer_id = ack.peer_id.clone();
        let mut peer = PeerRecord::new(peer_id.clone(), host, port);
        peer.consent = ack.consent;
        peer.available_shards = ack.shards;
        peer.last_seen = unix_now();
        {
            let mut directory = self.directory.write().await;
            directory.add_peer(peer);
            directory.note_sent();
            directory.note_received();
        }
        self.metrics.messages_sent.inc();
        self.metrics.messages_received.inc();

        let replaced = self
            .connections
            .lock()
            .await
            .insert(peer_id.clone(), Arc::new(conn));
        if let Some(old) = replaced {
            old.close().await;
        }
        info!(peer_id = %peer_id, %addr, peers = ack.peer_count, "connected to peer");
        Ok(peer_id)
    }

    /// Connects to each address, logging failures. Returns the peer ids
    /// reached.
    pub async fn bootstrap(&self, addrs: &[String]) -> Vec<String> {
        let mut connected = Vec::new();
        for addr in addrs {
            match self.connect_to_peer(addr).await {
                Ok(peer_id) => connected.push(peer_id),
                Err(e) => warn!(%addr, error = %e, "bootstrap peer unreachable"),
            }
        }
        connected
    }

    /// Asks every live peer for its peer list and connects to the ones not
    /// yet known. Returns the number of new peers.
    pub async fn discover_peers(&self) -> usize {
        let peer_ids: Vec<String> = self
            .directory
            .read()
            .await
            .get_alive_peers()
            .iter()
            .map(|p| p.node_id.clone())
            .collect();

        let mut discovered = 0;
        for peer_id in peer_ids {
            let list = match self
                .send(&peer_id, MessageKind::GetPeers, &serde_json::json!({}))
                .await
                .and_then(|reply| Ok(reply.parse_data::<PeerList>()?))
            {
                Ok(list) => list,
                Err(e) => {
                    warn!(peer_id = %peer_id, error = %e, "peer list request failed");
                    continue;
                }
            };
            for advert in list.peers {
                let known = advert.node_id == self.local_id
                    || self.directory.read().await.peer(&advert.node_id).is_some();
                if known {
                    continue;
                }
                let addr = format!("{}:{}", advert.host, advert.port);
                match self.connect_to_peer(&addr).await {
                    Ok(_) => discovered += 1,
                    Err(e) => debug!(peer_id = %advert.node_id, %addr, error = %e, "gossiped peer unreachable"),
                }
            }
        }
        discovered
    }

    /// Tells every peer which shards this node holds.
    pub async fn announce_shards(&self) -> Vec<String> {
        let shard_ids = self.directory.read().await.local_shard_ids();
        self.broadcast(MessageKind::ShardAnnounce, &ShardAnnounce { shard_ids })
            .await
    }

    /// Pings every known peer concurrently, then prunes the ones past the
    /// liveness TTL and closes their connections.
    pub async fn heartbeat_once(self: &Arc<Self>) -> HeartbeatReport {
        let peer_ids = self.directory.read().await.peer_ids();
        let mut report = HeartbeatReport {
            pinged: peer_ids.len(),
            ..HeartbeatReport::default()
        };

        let mut pings = JoinSet::new();
        for peer_id in peer_ids {
            let this = Arc::clone(self);
            pings.spawn(async move {
                let started = Instant::now();
                let outcome = this
                    .request(
                        &peer_id,
                        MessageKind::Ping,
                        &serde_json::json!({}),
                        this.config.ping_timeout,
                        "ping",
                    )
                    .await;
                (peer_id, started.elapsed(), outcome)
            });
        }
        while let Some(joined) = pings.join_next().await {
            let Ok((peer_id, elapsed, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(reply) if reply.kind() == Some(MessageKind::Pong) => {
                    let latency_ms = elapsed.as_secs_f64() * 1000.0;
                    self.directory.write().await.record_ping(&peer_id, latency_ms);
                    report.responded += 1;
                }
                Ok(reply) => debug!(peer_id = %peer_id, kind = %reply.kind, "unexpected ping reply"),
                Err(e) => debug!(peer_id = %peer_id, error = %e, "heartbeat missed"),
            }
        }

        let (pruned, alive) = {
            let mut directory = self.directory.write().await;
            let now = unix_now();
            let pruned = directory.prune_dead_peers_at(now);
            (pruned, directory.get_alive_peers_at(now).len())
        };
        for peer_id in &pruned {
            let conn = self.connections.lock().await.remove(peer_id);
            if let Some(conn) = conn {
                conn.close().await;
            }
            info!(peer_id = %peer_id, "pruned dead peer");
        }
        self.metrics.alive_peers.set(alive as i64);
        report.pruned = pruned;
        report
    }

    /// Spawns the periodic heartbeat. It runs until [`Transport::stop`].
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = this.shutdown.subscribe();
            let mut ticker = tokio::time::interval(this.config.heartbeat_interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = wait_for_stop(&mut shutdown) => break,
                    _ = ticker.tick() => {
                        let report = this.heartbeat_once().await;
                        debug!(
                            pinged = report.pinged,
                            responded = report.responded,
                            pruned = report.pruned.len(),
                            "heartbeat"
                        );
                    }
                }
            }
        })
    }

    /// Sends `state` to `next_node_id`, falling back to each replica in
    /// order.
    ///
    /// With a `budget`, the time left is split evenly over the targets not
    /// yet tried, and each target is told how much of its share it may
    /// spend downstream. Without one, each target gets `forward_timeout`.
    ///
    /// Returns the node that answered and the completed result. Every
    /// target failing is [`NetworkError::AllTargetsFailed`].
    pub async fn forward_pipeline_state(
        &self,
        next_node_id: &str,
        state: &PipelineState,
        replica_ids: &[String],
        budget: Option<Duration>,
    ) -> Result<(String, InferenceResult), NetworkError> {
        let mut targets: Vec<&str> = Vec::new();
        for target in iter::once(next_node_id).chain(replica_ids.iter().map(String::as_str)) {
            if target != self.local_id && !targets.contains(&target) {
                targets.push(target);
            }
        }
        let deadline = budget.map(|b| Instant::now() + b);

        let mut tried: Vec<String> = Vec::new();
        for (i, &target) in targets.iter().enumerate() {
            tried.push(target.to_string());

            let wait = match deadline {
                Some(deadline) => {
                    let untried = (targets.len() - i) as u32;
                    deadline.saturating_duration_since(Instant::now()) / untried
                }
                None => self.config.forward_timeout,
            };
            let forward = PipelineForward {
                state: state.clone(),
                replicas: replica_ids.to_vec(),
                budget_ms: deadline.map(|_| downstream_budget(wait).as_millis() as u64),
            };

            let started = Instant::now();
            let outcome = self
                .request(
                    target,
                    MessageKind::PipelineForward,
                    &forward,
                    wait,
                    "pipeline_forward",
                )
                .await
                .and_then(|reply| match reply.parse_data::<StageReply>()? {
                    StageReply::Completed { result } if result.request_id != state.request_id => {
                        Err(NetworkError::MismatchedReply {
                            peer: target.to_string(),
                            expected: state.request_id.clone(),
                            got: result.request_id,
                        })
                    }
                    StageReply::Completed { result } => Ok(result),
                    StageReply::Error { error } => Err(NetworkError::Remote {
                        peer: target.to_string(),
                        message: error,
                    }),
                });

            match outcome {
                Ok(result) => {
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    self.directory.write().await.record_forward_success(
                        target,
                        latency_ms,
                        result.energy_mj as f64,
                    );
                    debug!(
                        request_id = %state.request_id,
                        layer = state.current_layer,
                        peer_id = %target,
                        "pipeline forward completed"
                    );
                    return Ok((target.to_string(), result));
                }
                Err(e) => {
                    warn!(
                        request_id = %state.request_id,
                        layer = state.current_layer,
                        peer_id = %target,
                        error = %e,
                        "pipeline forward failed"
                    );
                    self.metrics.forward_failures.inc();
                    self.directory.write().await.record_forward_failure(target);
                }
            }
        }
        Err(NetworkError::AllTargetsFailed { targets: tried })
    }

    /// Stops the listener, every inbound connection loop and the heartbeat,
    /// and closes all outbound connections.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let connections: Vec<Arc<PeerConnection>> =
            self.connections.lock().await.drain().map(|(_, c)| c).collect();
        for conn in connections {
            conn.close().await;
        }
        info!(node_id = %self.local_id, "transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::types::ModelShard;
    use tokio::io::AsyncWriteExt;

    struct FixedHandler {
        node_id: String,
    }

    impl RequestHandler for FixedHandler {
        async fn handle_inference(
            &self,
            _sender: &str,
            query: InferenceQuery,
        ) -> Result<InferenceResult, HandlerError> {
            Ok(InferenceResult {
                request_id: query.request_id,
                output_tokens: vec![1],
                output_text: "local".to_string(),
                latency_ms: 1,
                energy_mj: 1,
                nodes_used: vec![self.node_id.clone()],
                model_id: query.model_id,
                tokens_generated: 1,
            })
        }

        async fn handle_pipeline(
            &self,
            _sender: &str,
            forward: PipelineForward,
        ) -> Result<InferenceResult, HandlerError> {
            match forward.state.query.as_str() {
                "fail" => return Err("no node for layer 8".into()),
                "slow" => tokio::time::sleep(Duration::from_millis(1500)).await,
                _ => {}
            }
            let request_id = if forward.state.query == "impostor" {
                "someone_else".to_string()
            } else {
                forward.state.request_id
            };
            let mut nodes_used = forward.state.nodes_used.clone();
            nodes_used.push(self.node_id.clone());
            Ok(InferenceResult {
                request_id,
                output_tokens: vec![],
                output_text: format!("answer for {}", forward.state.query),
                latency_ms: 2,
                energy_mj: 7,
                nodes_used,
                model_id: forward.state.model_id,
                tokens_generated: 0,
            })
        }
    }

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            handshake_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
            ping_timeout: Duration::from_millis(500),
            forward_timeout: Duration::from_secs(2),
            ..NetworkConfig::default()
        }
    }

    async fn start(id: &str) -> (Arc<Transport>, String) {
        start_with(id, test_config()).await
    }

    async fn start_with(id: &str, config: NetworkConfig) -> (Arc<Transport>, String) {
        let metrics = MetricsRegistry::new().unwrap().node;
        let transport = Arc::new(Transport::new(
            id,
            ConsentDescriptor::default(),
            config,
            metrics,
        ));
        let listener = transport.bind().await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        transport.spawn_server(
            listener,
            Arc::new(FixedHandler {
                node_id: id.to_string(),
            }),
        );
        (transport, addr)
    }

    fn state(query: &str) -> PipelineState {
        state_for("r1", query)
    }

    fn state_for(request_id: &str, query: &str) -> PipelineState {
        PipelineState {
            request_id: request_id.to_string(),
            model_id: "m".to_string(),
            query: query.to_string(),
            max_tokens: 4,
            activations: vec![0.5, -0.5],
            current_layer: 8,
            total_layers: 24,
            nodes_used: vec!["a".to_string()],
            total_energy_mj: 1.0,
            start_time: unix_now(),
            originator_id: "a".to_string(),
        }
    }

    #[tokio::test]
    async fn handshake_registers_both_sides() {
        let (a, _) = start("a").await;
        let (b, b_addr) = start("b").await;
        a.directory()
            .write()
            .await
            .register_local_shard(ModelShard::new("m", 0, 7, 8));
        b.directory()
            .write()
            .await
            .register_local_shard(ModelShard::new("m", 8, 15, 8));

        let peer_id = a.connect_to_peer(&b_addr).await.unwrap();
        assert_eq!(peer_id, "b");

        let a_dir = a.directory().read().await;
        let b_record = a_dir.peer("b").unwrap();
        assert_eq!(b_record.addr(), b_addr);
        assert_eq!(b_record.available_shards, vec!["m_L8-15".to_string()]);
        assert!(b_record.consent.is_some());
        drop(a_dir);

        let b_dir = b.directory().read().await;
        let a_record = b_dir.peer("a").unwrap();
        assert_eq!(a_record.available_shards, vec!["m_L0-7".to_string()]);
    }

    #[tokio::test]
    async fn handshake_with_silent_listener_times_out() {
        let (a, _) = start("a").await;
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = silent.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = a.connect_to_peer(&addr).await.unwrap_err();
        assert!(matches!(err, NetworkError::Timeout { op: "handshake", .. }));
        assert!(a.directory().read().await.is_empty());
    }

    #[tokio::test]
    async fn handshake_rejects_duplicate_id() {
        let (a, _) = start("same").await;
        let (_b, b_addr) = start("same").await;
        let err = a.connect_to_peer(&b_addr).await.unwrap_err();
        assert!(matches!(err, NetworkError::HandshakeRejected { .. }));
    }

    #[tokio::test]
    async fn unknown_and_malformed_messages_get_error_replies() {
        let (_b, b_addr) = start("b").await;

        let conn = PeerConnection::connect(&b_addr, 1024).await.unwrap();
        let mut gossip = Envelope::new(MessageKind::Ping, "x", &()).unwrap();
        gossip.kind = "gossip_v9".to_string();
        let reply = conn
            .exchange(&gossip, Duration::from_secs(1), "test")
            .await
            .unwrap();
        assert!(reply.error_message().unwrap().contains("gossip_v9"));

        let mut raw = TcpStream::connect(&b_addr).await.unwrap();
        raw.write_all(b"not json\n").await.unwrap();
        let mut reader = BufReader::new(raw);
        let line = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        let reply = Envelope::from_line(&line).unwrap();
        assert!(reply.error_message().unwrap().starts_with("malformed message"));
    }

    #[tokio::test]
    async fn heartbeat_records_latency_and_keeps_live_peers() {
        let (a, _) = start("a").await;
        let (_b, b_addr) = start("b").await;
        a.connect_to_peer(&b_addr).await.unwrap();

        let report = a.heartbeat_once().await;
        assert_eq!(report.pinged, 1);
        assert_eq!(report.responded, 1);
        assert!(report.pruned.is_empty());
        assert!(a.directory().read().await.peer("b").unwrap().avg_latency_ms > 0.0);
    }

    #[tokio::test]
    async fn heartbeat_prunes_stale_peers() {
        let (a, _) = start("a").await;
        let mut ghost = PeerRecord::new("ghost", "127.0.0.1", 1);
        ghost.last_seen = unix_now() - 301.0;
        a.directory().write().await.add_peer(ghost);

        let report = a.heartbeat_once().await;
        assert_eq!(report.responded, 0);
        assert_eq!(report.pruned, vec!["ghost".to_string()]);
        assert!(a.directory().read().await.is_empty());
    }

    #[tokio::test]
    async fn discover_peers_follows_gossip() {
        let (a, _) = start("a").await;
        let (b, b_addr) = start("b").await;
        let (_c, c_addr) = start("c").await;
        b.connect_to_peer(&c_addr).await.unwrap();
        a.connect_to_peer(&b_addr).await.unwrap();

        assert_eq!(a.discover_peers().await, 1);
        assert!(a.directory().read().await.peer("c").is_some());
    }

    #[tokio::test]
    async fn announce_shards_updates_remote_registry() {
        let (a, _) = start("a").await;
        let (b, b_addr) = start("b").await;
        a.connect_to_peer(&b_addr).await.unwrap();
        a.directory()
            .write()
            .await
            .register_local_shard(ModelShard::new("m", 0, 7, 8));

        assert_eq!(a.announce_shards().await, vec!["b".to_string()]);
        let holders = b
            .directory()
            .read()
            .await
            .find_shard_holders_at("m_L0-7", unix_now())
            .len();
        assert_eq!(holders, 1);
    }

    #[tokio::test]
    async fn forward_falls_back_to_replica() {
        let (a, _) = start("a").await;
        let (_b, b_addr) = start("b").await;
        a.connect_to_peer(&b_addr).await.unwrap();

        // A peer whose port nobody listens on.
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = closed.local_addr().unwrap().port();
        drop(closed);
        a.directory()
            .write()
            .await
            .add_peer(PeerRecord::new("dead", "127.0.0.1", dead_port));

        let (served_by, result) = a
            .forward_pipeline_state("dead", &state("hi"), &["b".to_string()], None)
            .await
            .unwrap();
        assert_eq!(served_by, "b");
        assert_eq!(result.nodes_used, vec!["a".to_string(), "b".to_string()]);

        let dir = a.directory().read().await;
        assert!(dir.peer("dead").unwrap().reputation < 1.0);
        assert_eq!(dir.peer("b").unwrap().total_inferences, 1);
    }

    #[tokio::test]
    async fn forward_reports_when_every_target_fails() {
        let (a, _) = start("a").await;
        let (_b, b_addr) = start("b").await;
        a.connect_to_peer(&b_addr).await.unwrap();

        let err = a
            .forward_pipeline_state("b", &state("fail"), &["missing".to_string()], None)
            .await
            .unwrap_err();
        match err {
            NetworkError::AllTargetsFailed { targets } => {
                assert_eq!(targets, vec!["b".to_string(), "missing".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn overlapping_forwards_keep_their_own_results() {
        let config = NetworkConfig {
            forward_timeout: Duration::from_millis(1000),
            ..test_config()
        };
        let (a, _) = start_with("a", config).await;
        let (_b, b_addr) = start("b").await;
        a.connect_to_peer(&b_addr).await.unwrap();

        let slow = {
            let a = Arc::clone(&a);
            tokio::spawn(async move {
                a.forward_pipeline_state("b", &state_for("slow", "slow"), &[], None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fast = a
            .forward_pipeline_state("b", &state_for("fast", "hi"), &[], Some(Duration::from_secs(3)))
            .await;

        assert!(slow.await.unwrap().is_err());
        let (served_by, result) = fast.unwrap();
        assert_eq!(served_by, "b");
        assert_eq!(result.request_id, "fast");
        assert_eq!(result.output_text, "answer for hi");
    }

    #[tokio::test]
    async fn result_for_another_request_is_rejected() {
        let (a, _) = start("a").await;
        let (_b, b_addr) = start("b").await;
        a.connect_to_peer(&b_addr).await.unwrap();

        let err = a
            .forward_pipeline_state("b", &state("impostor"), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::AllTargetsFailed { .. }));
        assert!(a.directory().read().await.peer("b").unwrap().reputation < 1.0);
    }

    #[tokio::test]
    async fn budget_is_split_across_untried_targets() {
        let (a, _) = start("a").await;
        let (_b, b_addr) = start("b").await;
        a.connect_to_peer(&b_addr).await.unwrap();

        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_port = silent.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = silent.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        a.directory()
            .write()
            .await
            .add_peer(PeerRecord::new("silent", "127.0.0.1", silent_port));

        // forward_timeout alone (2 s) would spend the whole budget on the
        // silent primary.
        let started = Instant::now();
        let (served_by, result) = a
            .forward_pipeline_state(
                "silent",
                &state("hi"),
                &["b".to_string()],
                Some(Duration::from_millis(1600)),
            )
            .await
            .unwrap();
        assert_eq!(served_by, "b");
        assert_eq!(result.request_id, "r1");
        assert!(started.elapsed() < Duration::from_millis(1600));
    }

    #[test]
    fn downstream_budget_keeps_a_margin_for_the_reply() {
        assert_eq!(downstream_budget(Duration::from_secs(10)), Duration::from_secs(9));
        assert_eq!(downstream_budget(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn foreign_protocol_gets_an_error_reply() {
        let (b, b_addr) = start("b").await;
        let conn = PeerConnection::connect(&b_addr, 1024).await.unwrap();
        let mut ping = Envelope::new(MessageKind::Ping, "x", &()).unwrap();
        ping.protocol_version = "aria/9.9".to_string();
        let reply = conn
            .exchange(&ping, Duration::from_secs(1), "test")
            .await
            .unwrap();
        assert!(reply.error_message().unwrap().contains("aria/9.9"));
        assert!(b.directory().read().await.peer("x").is_none());
    }

    #[tokio::test]
    async fn inference_request_is_delegated_to_handler() {
        let (a, _) = start("a").await;
        let (_b, b_addr) = start("b").await;
        a.connect_to_peer(&b_addr).await.unwrap();

        let query = InferenceQuery {
            request_id: "r9".to_string(),
            query: "q".to_string(),
            model_id: "m".to_string(),
            max_tokens: 4,
        };
        let reply = a
            .send("b", MessageKind::InferenceRequest, &query)
            .await
            .unwrap();
        match reply.parse_data::<StageReply>().unwrap() {
            StageReply::Completed { result } => assert_eq!(result.nodes_used, vec!["b".to_string()]),
            StageReply::Error { error } => panic!("unexpected error: {error}"),
        }
    }

    #[tokio::test]
    async fn stopped_transport_refuses_requests() {
        let (a, _) = start("a").await;
        let (_b, b_addr) = start("b").await;
        a.connect_to_peer(&b_addr).await.unwrap();
        a.stop().await;

        let err = a
            .send("b", MessageKind::Ping, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Stopped));
    }

    #[test]
    fn dial_addresses_must_have_a_port() {
        assert_eq!(split_host_port("10.0.0.1:8765").unwrap(), ("10.0.0.1".to_string(), 8765));
        assert!(split_host_port("10.0.0.1").is_err());
        assert!(split_host_port(":80").is_err());
        assert!(split_host_port("h:99999").is_err());
    }
}

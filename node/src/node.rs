//! The node facade.
//!
//! [`AriaNode`] owns one instance of every component (transport, pipeline
//! coordinator, provenance ledger, proof trackers) and wires the handling
//! paths between them:
//!
//! - inbound `pipeline_forward` runs the local stage, then forwards the
//!   state onward or finalizes it,
//! - inbound `inference_request` runs the locally held layers,
//! - every completed inference this node contributed to (or originated) is
//!   recorded in the ledger and submitted as a useful-work proof.
//!
//! Ledger and proof state sit behind short-lived std mutexes; none of them
//! is held across an `.await`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, NodeConfig, StorageConfig};
use crate::ledger::{DynLedgerStore, LedgerError, LedgerStats, ProvenanceLedger};
use crate::metrics::NodeMetrics;
use crate::network::{
    HandlerError, InferenceQuery, MessageKind, NetworkError, NetworkStats, PipelineForward,
    RequestHandler, StageReply, Transport,
};
use crate::pipeline::{
    ChainError, ComputeBackend, ComputeError, CoordinatorStats, HttpLayerCompute, LayerCompute,
    PipelineCoordinator, PipelineError, SimulatedCompute, StageOutcome,
};
use crate::proof::sobriety::GPU_BASELINE_MJ;
use crate::proof::{NetworkSavings, ProofOfSobriety, ProofOfUsefulWork, SobrietyError};
use crate::storage::{InMemoryLedgerStore, RocksDbLedgerStore};
use crate::types::{InferenceRequest, InferenceResult, ModelShard, PipelineState, unix_now};

/// Reward for one inference at full quality and baseline efficiency.
const BASE_REWARD: f64 = 0.001;

#[derive(Debug)]
pub enum NodeError {
    Config(ConfigError),
    Network(NetworkError),
    Pipeline(PipelineError),
    Compute(ComputeError),
    Chain(ChainError),
    Ledger(LedgerError),
    Sobriety(SobrietyError),
    /// No reachable node holds `layer` of `model_id`.
    NoRoute { model_id: String, layer: u32 },
    /// The operation needs a started node.
    NotRunning,
    /// A blocking compute task panicked or was cancelled.
    Join(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Config(e) => write!(f, "config error: {e}"),
            NodeError::Network(e) => write!(f, "network error: {e}"),
            NodeError::Pipeline(e) => write!(f, "pipeline error: {e}"),
            NodeError::Compute(e) => write!(f, "compute error: {e}"),
            NodeError::Chain(e) => write!(f, "no pipeline chain: {e}"),
            NodeError::Ledger(e) => write!(f, "ledger error: {e}"),
            NodeError::Sobriety(e) => write!(f, "sobriety error: {e}"),
            NodeError::NoRoute { model_id, layer } => {
                write!(f, "no peer holds layer {layer} of {model_id}")
            }
            NodeError::NotRunning => write!(f, "node is not running"),
            NodeError::Join(msg) => write!(f, "compute task failed: {msg}"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<ConfigError> for NodeError {
    fn from(e: ConfigError) -> Self {
        NodeError::Config(e)
    }
}

impl From<NetworkError> for NodeError {
    fn from(e: NetworkError) -> Self {
        NodeError::Network(e)
    }
}

impl From<PipelineError> for NodeError {
    fn from(e: PipelineError) -> Self {
        NodeError::Pipeline(e)
    }
}

impl From<ComputeError> for NodeError {
    fn from(e: ComputeError) -> Self {
        NodeError::Compute(e)
    }
}

impl From<ChainError> for NodeError {
    fn from(e: ChainError) -> Self {
        NodeError::Chain(e)
    }
}

impl From<LedgerError> for NodeError {
    fn from(e: LedgerError) -> Self {
        NodeError::Ledger(e)
    }
}

impl From<SobrietyError> for NodeError {
    fn from(e: SobrietyError) -> Self {
        NodeError::Sobriety(e)
    }
}

/// Bookkeeping reward owed to each contributor of `result`.
///
/// `0.001 × max(quality, 0.1) × efficiency`, split evenly across
/// `nodes_used`. Quality falls linearly from 1 at 1 s latency to 0 at 5 s;
/// efficiency is the GPU baseline over the energy spent, clamped to
/// `[0.5, 2.0]`.
pub fn reward_per_node(result: &InferenceResult) -> f64 {
    let quality = (1.0 - (result.latency_ms as f64 - 1000.0) / 4000.0).clamp(0.0, 1.0);
    let efficiency = if result.energy_mj == 0 {
        1.0
    } else {
        (GPU_BASELINE_MJ as f64 / result.energy_mj as f64).clamp(0.5, 2.0)
    };
    BASE_REWARD * quality.max(0.1) * efficiency / result.nodes_used.len().max(1) as f64
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeStats {
    pub node_id: String,
    pub running: bool,
    pub network: NetworkStats,
    pub pipeline: CoordinatorStats,
    pub ledger: LedgerStats,
    pub proofs_verified: u64,
    pub proofs_rejected: u64,
    pub top_contributor: Option<String>,
    pub tokens_earned: f64,
    pub energy_savings: Option<NetworkSavings>,
}

pub struct AriaNode {
    node_id: String,
    config: NodeConfig,
    transport: Arc<Transport>,
    coordinator: Arc<PipelineCoordinator>,
    ledger: Mutex<ProvenanceLedger<DynLedgerStore>>,
    useful_work: Mutex<ProofOfUsefulWork>,
    sobriety: Mutex<ProofOfSobriety>,
    tokens_earned: Mutex<f64>,
    metrics: NodeMetrics,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open_store(storage: &StorageConfig) -> Result<DynLedgerStore, LedgerError> {
    let store: DynLedgerStore = match storage {
        StorageConfig::Memory => Box::new(InMemoryLedgerStore::new()),
        StorageConfig::RocksDb(cfg) => Box::new(RocksDbLedgerStore::open(cfg)?),
    };
    Ok(store)
}

fn build_compute(config: &NodeConfig) -> Result<Arc<dyn LayerCompute>, ComputeError> {
    let compute: Arc<dyn LayerCompute> = match &config.compute.backend {
        ComputeBackend::Simulated => Arc::new(SimulatedCompute::new(config.pipeline.hidden_dim)),
        ComputeBackend::Http { base_url, timeout } => {
            Arc::new(HttpLayerCompute::new(base_url.clone(), *timeout)?)
        }
    };
    Ok(compute)
}

impl AriaNode {
    /// Builds every component from `config`. Nothing touches the network
    /// until [`AriaNode::start`].
    pub fn new(config: NodeConfig, metrics: NodeMetrics) -> Result<Arc<Self>, NodeError> {
        let node_id = config.node_id.clone();
        let compute = build_compute(&config)?;
        let coordinator = PipelineCoordinator::new(node_id.clone(), config.pipeline.hidden_dim, compute);
        let ledger = ProvenanceLedger::open(
            open_store(&config.storage)?,
            config.ledger.clone(),
            node_id.clone(),
        )?;
        let transport = Transport::new(
            node_id.clone(),
            config.consent.clone(),
            config.network.clone(),
            metrics.clone(),
        );

        Ok(Arc::new(Self {
            sobriety: Mutex::new(ProofOfSobriety::new(node_id.clone())),
            node_id,
            config,
            transport: Arc::new(transport),
            coordinator: Arc::new(coordinator),
            ledger: Mutex::new(ledger),
            useful_work: Mutex::new(ProofOfUsefulWork::new()),
            tokens_earned: Mutex::new(0.0),
            metrics,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Loads a shard and publishes it: registered in the local directory,
    /// and announced to peers when the node is already running.
    pub async fn load_model(
        &self,
        model_id: &str,
        total_layers: u32,
        shard_start: u32,
        shard_end: Option<u32>,
    ) -> Result<ModelShard, NodeError> {
        let shard = self
            .coordinator
            .load_model(model_id, total_layers, shard_start, shard_end)?;
        self.transport
            .directory()
            .write()
            .await
            .register_local_shard(shard.clone());
        if self.is_running() {
            self.transport.announce_shards().await;
        }
        Ok(shard)
    }

    /// Binds the listener and starts serving, the heartbeat and the
    /// sobriety window. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, NodeError> {
        let listener = self.transport.bind().await?;
        let addr = listener.local_addr().map_err(NetworkError::from)?;

        let server = self.transport.spawn_server(listener, Arc::clone(self));
        let heartbeat = self.transport.spawn_heartbeat();
        lock(&self.tasks).extend([server, heartbeat]);

        lock(&self.sobriety).start_measurement();
        self.running.store(true, Ordering::SeqCst);
        info!(node_id = %self.node_id, %addr, "node started");
        Ok(addr)
    }

    /// Dials every bootstrap address, asks the peers reached for the peers
    /// they know and connects to those too, then announces local shards to
    /// all of them. Returns the ids of the bootstrap peers that accepted the
    /// handshake.
    pub async fn connect_to_peers(&self, addrs: &[String]) -> Vec<String> {
        let connected = self.transport.bootstrap(addrs).await;
        if !connected.is_empty() {
            let discovered = self.transport.discover_peers().await;
            debug!(discovered, "peer discovery finished");
            self.transport.announce_shards().await;
        }
        connected
    }

    /// Runs a query through the layers this node holds, without the
    /// network.
    pub async fn process_request(
        &self,
        query: &str,
        model_id: &str,
        max_tokens: u32,
    ) -> Result<InferenceResult, NodeError> {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
        self.infer_local(&request_id, query, model_id, max_tokens).await
    }

    async fn infer_local(
        &self,
        request_id: &str,
        query: &str,
        model_id: &str,
        max_tokens: u32,
    ) -> Result<InferenceResult, NodeError> {
        let coordinator = Arc::clone(&self.coordinator);
        let (request_id, query_text, model_id) =
            (request_id.to_string(), query.to_string(), model_id.to_string());
        let timer = self.metrics.stage_seconds.start_timer();
        let result = tokio::task::spawn_blocking(move || {
            coordinator.infer_local(&request_id, &query_text, &model_id, max_tokens)
        })
        .await
        .map_err(|e| NodeError::Join(e.to_string()))??;
        timer.observe_duration();

        self.record_completion(query, &result);
        Ok(result)
    }

    /// Runs `request` across the network.
    ///
    /// The chain is resolved up front so a gap fails before any work is
    /// done. If this node holds layer 0 it runs the first stage itself;
    /// otherwise the state goes straight to the first stage's holder.
    pub async fn process_distributed_inference(
        &self,
        request: &InferenceRequest,
    ) -> Result<InferenceResult, NodeError> {
        if !self.is_running() {
            return Err(NodeError::NotRunning);
        }
        let total_layers = self
            .coordinator
            .total_layers_for(&request.model_id)
            .unwrap_or(self.config.pipeline.total_layers);

        let chain = self.transport.directory().read().await.build_pipeline_chain(
            &request.model_id,
            total_layers,
            Some(request),
        )?;
        let first = chain.first().ok_or(ChainError::NoLayers)?;
        info!(
            request_id = %request.request_id,
            model_id = %request.model_id,
            stages = chain.len(),
            first = %first.node_id,
            "starting distributed inference"
        );

        let state = self.coordinator.create_state(
            &request.request_id,
            &request.query,
            &request.model_id,
            request.max_tokens,
            total_layers,
        );
        let budget = self.pipeline_budget(chain.len());
        if first.node_id == self.node_id {
            return self.run_stage(state, Some(budget)).await;
        }

        let (_, result) = self
            .transport
            .forward_pipeline_state(&first.node_id, &state, &first.replicas, Some(budget))
            .await?;
        self.record_completion(&request.query, &result);
        Ok(result)
    }

    /// End-to-end time allowed for a pipeline of `stages` stages.
    fn pipeline_budget(&self, stages: usize) -> Duration {
        let stages = u32::try_from(stages.max(1)).unwrap_or(u32::MAX);
        self.config.network.forward_timeout.saturating_mul(stages)
    }

    /// Runs the local stage on `state` and, if layers remain, forwards the
    /// result to the next holder and waits for the completed inference.
    ///
    /// `budget` bounds the whole call, local work included.
    async fn run_stage(
        &self,
        state: PipelineState,
        budget: Option<Duration>,
    ) -> Result<InferenceResult, NodeError> {
        let started = Instant::now();
        let coordinator = Arc::clone(&self.coordinator);
        let timer = self.metrics.stage_seconds.start_timer();
        let outcome = tokio::task::spawn_blocking(move || coordinator.process_stage(&state))
            .await
            .map_err(|e| NodeError::Join(e.to_string()))??;
        timer.observe_duration();

        match outcome {
            StageOutcome::Complete { state, result } => {
                debug!(request_id = %state.request_id, "pipeline complete");
                self.record_completion_for(&state, &result);
                Ok(result)
            }
            StageOutcome::Forward(next) => {
                let stage = self
                    .transport
                    .directory()
                    .read()
                    .await
                    .get_next_stage(&next.model_id, next.current_layer)
                    .ok_or_else(|| NodeError::NoRoute {
                        model_id: next.model_id.clone(),
                        layer: next.current_layer,
                    })?;
                let remaining = budget.map(|b| b.saturating_sub(started.elapsed()));
                let (_, result) = self
                    .transport
                    .forward_pipeline_state(&stage.node_id, &next, &stage.replicas, remaining)
                    .await?;
                self.record_completion_for(&next, &result);
                Ok(result)
            }
        }
    }

    fn record_completion_for(&self, state: &PipelineState, result: &InferenceResult) {
        let contributed = result.nodes_used.iter().any(|n| *n == self.node_id);
        if contributed || state.originator_id == self.node_id {
            self.record_completion(&state.query, result);
        }
    }

    /// Ledger entry, useful-work proof and reward for one completed
    /// inference.
    fn record_completion(&self, query: &str, result: &InferenceResult) {
        let record = result.to_provenance_record(query, unix_now());

        {
            let mut useful_work = lock(&self.useful_work);
            let proof = useful_work.create_proof(
                &self.node_id,
                &result.request_id,
                record.query_hash,
                record.output_hash,
                &result.model_id,
                i64::try_from(result.energy_mj).unwrap_or(i64::MAX),
                i64::try_from(result.latency_ms).unwrap_or(i64::MAX),
            );
            if useful_work.submit_proof(proof) {
                self.metrics.proofs_accepted.inc();
            } else {
                self.metrics.proofs_rejected.inc();
            }
        }

        {
            let mut ledger = lock(&self.ledger);
            let before = ledger.chain().len();
            if let Err(e) = ledger.add_record(record) {
                warn!(request_id = %result.request_id, error = %e, "failed to record inference");
            }
            let sealed = ledger.chain().len().saturating_sub(before);
            self.metrics.blocks_sealed.inc_by(sealed as u64);
        }

        let reward = reward_per_node(result);
        *lock(&self.tokens_earned) += reward;
        debug!(
            request_id = %result.request_id,
            energy_mj = result.energy_mj,
            reward,
            "recorded completed inference"
        );
    }

    /// Asks `peer_id` to run a whole inference on its own shard.
    pub async fn send_inference_request(
        &self,
        peer_id: &str,
        query: &str,
        model_id: &str,
        max_tokens: u32,
    ) -> Result<InferenceResult, NodeError> {
        let payload = InferenceQuery {
            request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            query: query.to_string(),
            model_id: model_id.to_string(),
            max_tokens,
        };
        let reply = self
            .transport
            .send(peer_id, MessageKind::InferenceRequest, &payload)
            .await?;
        match reply.parse_data::<StageReply>().map_err(NetworkError::from)? {
            StageReply::Completed { result } => Ok(result),
            StageReply::Error { error } => Err(NetworkError::Remote {
                peer: peer_id.to_string(),
                message: error,
            }
            .into()),
        }
    }

    pub fn ledger_stats(&self) -> LedgerStats {
        lock(&self.ledger).get_network_stats()
    }

    pub fn verify_ledger(&self) -> bool {
        lock(&self.ledger).verify_chain()
    }

    /// Full chain as JSON.
    pub fn export_ledger(&self) -> Result<String, NodeError> {
        Ok(lock(&self.ledger).export_chain()?)
    }

    pub async fn get_stats(&self) -> NodeStats {
        let network = self.transport.directory().read().await.get_network_stats();
        let (proofs_verified, proofs_rejected, top_contributor) = {
            let useful_work = lock(&self.useful_work);
            (
                useful_work.verified_count(),
                useful_work.rejected_count(),
                useful_work.select_top_contributor(),
            )
        };
        NodeStats {
            node_id: self.node_id.clone(),
            running: self.is_running(),
            network,
            pipeline: self.coordinator.stats(),
            ledger: self.ledger_stats(),
            proofs_verified,
            proofs_rejected,
            top_contributor,
            tokens_earned: *lock(&self.tokens_earned),
            energy_savings: lock(&self.sobriety).get_network_savings(),
        }
    }

    /// Seals pending ledger records, closes the sobriety window if any work
    /// was done, and stops the transport. A second call is a no-op.
    pub async fn stop(&self) -> Result<(), NodeError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut ledger = lock(&self.ledger);
            while ledger.seal_pending_block(&self.node_id)?.is_some() {
                self.metrics.blocks_sealed.inc();
            }
        }

        let inferences = self.coordinator.total_inferences();
        {
            let mut sobriety = lock(&self.sobriety);
            if inferences > 0 && sobriety.is_measuring() {
                sobriety.end_measurement(inferences)?;
            }
        }

        self.transport.stop().await;
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "background task ended abnormally");
            }
        }
        info!(node_id = %self.node_id, inferences, "node stopped");
        Ok(())
    }
}

impl RequestHandler for AriaNode {
    async fn handle_inference(
        &self,
        sender: &str,
        query: InferenceQuery,
    ) -> Result<InferenceResult, HandlerError> {
        debug!(%sender, request_id = %query.request_id, "inference request");
        let result = self
            .infer_local(&query.request_id, &query.query, &query.model_id, query.max_tokens)
            .await?;
        Ok(result)
    }

    async fn handle_pipeline(
        &self,
        sender: &str,
        forward: PipelineForward,
    ) -> Result<InferenceResult, HandlerError> {
        debug!(
            %sender,
            request_id = %forward.state.request_id,
            layer = forward.state.current_layer,
            "pipeline stage received"
        );
        let budget = forward.budget_ms.map(Duration::from_millis);
        let result = self.run_stage(forward.state, budget).await?;
        Ok(result)
    }
}

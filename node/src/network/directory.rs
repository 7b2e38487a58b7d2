//! Peer table, shard registry and consent-based routing.
//!
//! [`PeerDirectory`] is plain data: it performs no I/O and takes the
//! current time as an argument wherever liveness matters (`*_at` methods),
//! so routing decisions are deterministic under test. The transport owns
//! one directory behind a lock and only holds that lock for the duration
//! of a lookup or update.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::pipeline::chain::{ChainError, PipelineStage, StageCandidate, build_chain};
use crate::types::{ConsentDescriptor, InferenceRequest, LayerRange, ModelShard, unix_now};

use super::message::PeerAdvert;
use super::peer::PeerRecord;

/// Where to send a state whose next layer is `layer`.
#[derive(Clone, Debug, PartialEq)]
pub struct NextStage {
    pub node_id: String,
    pub shard_id: String,
    pub layers: LayerRange,
    /// Fallback targets, best first. Never contains `node_id` or the local
    /// node.
    pub replicas: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NetworkStats {
    pub node_id: String,
    pub total_peers: usize,
    pub alive_peers: usize,
    pub total_shards_tracked: usize,
    pub unique_models: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub avg_peer_reputation: f64,
}

fn datetime_at(now: f64) -> DateTime<Utc> {
    DateTime::from_timestamp(now.floor() as i64, 0).unwrap_or_else(Utc::now)
}

fn shard_model(shard_id: &str) -> Option<(&str, LayerRange)> {
    ModelShard::parse_id(shard_id)
}

fn by_quality_desc(a: &PeerRecord, b: &PeerRecord) -> Ordering {
    b.quality_score()
        .partial_cmp(&a.quality_score())
        .unwrap_or(Ordering::Equal)
}

pub struct PeerDirectory {
    local_id: String,
    local_host: String,
    local_port: u16,
    local_consent: ConsentDescriptor,
    local_shards: Vec<ModelShard>,
    peers: BTreeMap<String, PeerRecord>,
    /// shard id -> holder node ids, in registration order.
    shard_registry: BTreeMap<String, Vec<String>>,
    messages_sent: u64,
    messages_received: u64,
}

impl PeerDirectory {
    pub fn new(
        local_id: impl Into<String>,
        local_host: impl Into<String>,
        local_port: u16,
        local_consent: ConsentDescriptor,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            local_host: local_host.into(),
            local_port,
            local_consent,
            local_shards: Vec::new(),
            peers: BTreeMap::new(),
            shard_registry: BTreeMap::new(),
            messages_sent: 0,
            messages_received: 0,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local_consent(&self) -> &ConsentDescriptor {
        &self.local_consent
    }

    /// Port advertised to peers; updated once the listener is bound.
    pub fn set_local_port(&mut self, port: u16) {
        self.local_port = port;
    }

    pub fn local_advert(&self) -> PeerAdvert {
        PeerAdvert {
            node_id: self.local_id.clone(),
            host: self.local_host.clone(),
            port: self.local_port,
            consent: Some(self.local_consent.clone()),
            shards: self.local_shard_ids(),
        }
    }

    // ---- local shards ----

    /// Registers a shard held by this node. A shard for the same model
    /// replaces the previous one.
    pub fn register_local_shard(&mut self, shard: ModelShard) {
        let replaced: Vec<String> = self
            .local_shards
            .iter()
            .filter(|s| s.model_id == shard.model_id)
            .map(|s| s.shard_id.clone())
            .collect();
        let local_id = self.local_id.clone();
        for shard_id in &replaced {
            self.unregister_holder(shard_id, &local_id);
        }
        self.local_shards.retain(|s| s.model_id != shard.model_id);
        self.register_holder(&shard.shard_id, &local_id);
        self.local_shards.push(shard);
    }

    pub fn local_shards(&self) -> &[ModelShard] {
        &self.local_shards
    }

    pub fn local_shard_ids(&self) -> Vec<String> {
        self.local_shards.iter().map(|s| s.shard_id.clone()).collect()
    }

    pub fn local_shard_for(&self, model_id: &str) -> Option<&ModelShard> {
        self.local_shards.iter().find(|s| s.model_id == model_id)
    }

    // ---- peer table ----

    fn register_holder(&mut self, shard_id: &str, node_id: &str) {
        let holders = self.shard_registry.entry(shard_id.to_string()).or_default();
        if !holders.iter().any(|h| h == node_id) {
            holders.push(node_id.to_string());
        }
    }

    fn unregister_holder(&mut self, shard_id: &str, node_id: &str) {
        if let Some(holders) = self.shard_registry.get_mut(shard_id) {
            holders.retain(|h| h != node_id);
            if holders.is_empty() {
                self.shard_registry.remove(shard_id);
            }
        }
    }

    /// Adds or refreshes a peer. Known peers keep their reputation and
    /// running averages. Returns `false` for the local node id.
    pub fn add_peer(&mut self, peer: PeerRecord) -> bool {
        if peer.node_id == self.local_id {
            return false;
        }
        let node_id = peer.node_id.clone();
        let shards = peer.available_shards.clone();

        match self.peers.get_mut(&node_id) {
            Some(existing) => {
                existing.host = peer.host;
                existing.port = peer.port;
                if peer.consent.is_some() {
                    existing.consent = peer.consent;
                }
                existing.touch(peer.last_seen);
            }
            None => {
                debug!(peer_id = %node_id, "added peer");
                self.peers.insert(node_id.clone(), peer);
            }
        }
        self.set_peer_shards(&node_id, shards);
        true
    }

    pub fn remove_peer(&mut self, node_id: &str) -> Option<PeerRecord> {
        let peer = self.peers.remove(node_id)?;
        for shard_id in &peer.available_shards {
            self.unregister_holder(shard_id, node_id);
        }
        debug!(peer_id = %node_id, "removed peer");
        Some(peer)
    }

    /// Replaces the shards a known peer advertises. Returns `false` if the
    /// peer is unknown.
    pub fn set_peer_shards(&mut self, node_id: &str, shards: Vec<String>) -> bool {
        let Some(peer) = self.peers.get_mut(node_id) else {
            return false;
        };
        let old = std::mem::replace(&mut peer.available_shards, shards.clone());
        for shard_id in &old {
            self.unregister_holder(shard_id, node_id);
        }
        for shard_id in &shards {
            self.register_holder(shard_id, node_id);
        }
        true
    }

    pub fn peer(&self, node_id: &str) -> Option<&PeerRecord> {
        self.peers.get(node_id)
    }

    pub fn peer_mut(&mut self, node_id: &str) -> Option<&mut PeerRecord> {
        self.peers.get_mut(node_id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Refreshes `last_seen` of a known sender.
    pub fn touch(&mut self, node_id: &str, now: f64) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.touch(now);
        }
    }

    pub fn get_alive_peers_at(&self, now: f64) -> Vec<&PeerRecord> {
        self.peers.values().filter(|p| p.is_alive_at(now)).collect()
    }

    pub fn get_alive_peers(&self) -> Vec<&PeerRecord> {
        self.get_alive_peers_at(unix_now())
    }

    /// Removes every peer not heard from within the TTL, along with its
    /// shard registrations. Returns the removed ids.
    pub fn prune_dead_peers_at(&mut self, now: f64) -> Vec<String> {
        let dead: Vec<String> = self
            .peers
            .values()
            .filter(|p| !p.is_alive_at(now))
            .map(|p| p.node_id.clone())
            .collect();
        for node_id in &dead {
            self.remove_peer(node_id);
        }
        dead
    }

    pub fn record_ping(&mut self, node_id: &str, latency_ms: f64) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.record_latency(latency_ms);
        }
    }

    pub fn record_forward_success(&mut self, node_id: &str, latency_ms: f64, energy_mj: f64) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.record_success(latency_ms, energy_mj);
        }
    }

    pub fn record_forward_failure(&mut self, node_id: &str) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.record_failure();
        }
    }

    pub fn note_sent(&mut self) {
        self.messages_sent += 1;
    }

    pub fn note_received(&mut self) {
        self.messages_received += 1;
    }

    // ---- routing ----

    /// Live peers whose consent admits `request` at `now` and that may
    /// hold the requested model, best quality first.
    ///
    /// Peers without a consent descriptor are skipped. Peers advertising
    /// no shards are assumed capable. Equal scores keep node id order.
    pub fn find_peers_for_request_at(&self, request: &InferenceRequest, now: f64) -> Vec<&PeerRecord> {
        let at = datetime_at(now);
        let mut matching: Vec<&PeerRecord> = self
            .get_alive_peers_at(now)
            .into_iter()
            .filter(|p| {
                p.consent
                    .as_ref()
                    .is_some_and(|c| c.matches_request_at(request, at))
            })
            .filter(|p| {
                p.available_shards.is_empty()
                    || p.available_shards.iter().any(|s| match shard_model(s) {
                        Some((model, _)) => model == request.model_id,
                        None => s.starts_with(&request.model_id),
                    })
            })
            .collect();
        matching.sort_by(|a, b| by_quality_desc(a, b));
        matching
    }

    pub fn find_peers_for_request(&self, request: &InferenceRequest) -> Vec<&PeerRecord> {
        self.find_peers_for_request_at(request, unix_now())
    }

    /// Live remote holders of `shard_id`, in registration order.
    pub fn find_shard_holders_at(&self, shard_id: &str, now: f64) -> Vec<&PeerRecord> {
        self.shard_registry
            .get(shard_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.peers.get(id))
            .filter(|p| p.is_alive_at(now))
            .collect()
    }

    fn local_quality(&self) -> f64 {
        PeerRecord::new(self.local_id.clone(), self.local_host.clone(), self.local_port).quality_score()
    }

    /// Candidates for every registered shard of `model_id`, local node
    /// included. With a request, remote holders must consent to it.
    fn stage_candidates(
        &self,
        model_id: &str,
        request: Option<&InferenceRequest>,
        now: f64,
    ) -> Vec<StageCandidate> {
        let at = datetime_at(now);
        let mut candidates = Vec::new();
        for (shard_id, holders) in &self.shard_registry {
            let Some((model, layers)) = shard_model(shard_id) else {
                continue;
            };
            if model != model_id {
                continue;
            }
            for holder in holders {
                if *holder == self.local_id {
                    candidates.push(StageCandidate {
                        node_id: self.local_id.clone(),
                        shard_id: shard_id.clone(),
                        layers,
                        host: self.local_host.clone(),
                        port: self.local_port,
                        quality: self.local_quality(),
                    });
                    continue;
                }
                let Some(peer) = self.peers.get(holder) else {
                    continue;
                };
                if !peer.is_alive_at(now) {
                    continue;
                }
                if let Some(req) = request {
                    let admits = peer
                        .consent
                        .as_ref()
                        .is_some_and(|c| c.matches_request_at(req, at));
                    if !admits {
                        continue;
                    }
                }
                candidates.push(StageCandidate {
                    node_id: peer.node_id.clone(),
                    shard_id: shard_id.clone(),
                    layers,
                    host: peer.host.clone(),
                    port: peer.port,
                    quality: peer.quality_score(),
                });
            }
        }
        candidates
    }

    /// Builds the ordered chain of stages covering every layer of
    /// `model_id`.
    pub fn build_pipeline_chain_at(
        &self,
        model_id: &str,
        total_layers: u32,
        request: Option<&InferenceRequest>,
        now: f64,
    ) -> Result<Vec<PipelineStage>, ChainError> {
        build_chain(total_layers, &self.stage_candidates(model_id, request, now))
    }

    pub fn build_pipeline_chain(
        &self,
        model_id: &str,
        total_layers: u32,
        request: Option<&InferenceRequest>,
    ) -> Result<Vec<PipelineStage>, ChainError> {
        self.build_pipeline_chain_at(model_id, total_layers, request, unix_now())
    }

    /// Picks the remote node that should process `layer` next, plus
    /// replicas able to do the same.
    ///
    /// Holders whose shard starts exactly at `layer` are preferred, then
    /// wider shards, then quality.
    pub fn get_next_stage_at(&self, model_id: &str, layer: u32, now: f64) -> Option<NextStage> {
        let mut candidates: Vec<StageCandidate> = self
            .stage_candidates(model_id, None, now)
            .into_iter()
            .filter(|c| c.node_id != self.local_id && c.layers.contains(layer))
            .collect();
        candidates.sort_by(|a, b| {
            (b.layers.start == layer)
                .cmp(&(a.layers.start == layer))
                .then_with(|| b.layers.end.cmp(&a.layers.end))
                .then_with(|| b.quality.partial_cmp(&a.quality).unwrap_or(Ordering::Equal))
                .then_with(|| a.node_id.cmp(&b.node_id))
        });

        let primary = candidates.first()?;
        let mut replicas: Vec<String> = Vec::new();
        for c in &candidates[1..] {
            if c.node_id != primary.node_id && !replicas.contains(&c.node_id) {
                replicas.push(c.node_id.clone());
            }
        }
        Some(NextStage {
            node_id: primary.node_id.clone(),
            shard_id: primary.shard_id.clone(),
            layers: primary.layers,
            replicas,
        })
    }

    pub fn get_next_stage(&self, model_id: &str, layer: u32) -> Option<NextStage> {
        self.get_next_stage_at(model_id, layer, unix_now())
    }

    pub fn get_network_stats_at(&self, now: f64) -> NetworkStats {
        let alive = self.get_alive_peers_at(now);
        let models: BTreeSet<&str> = self
            .shard_registry
            .keys()
            .filter_map(|s| shard_model(s).map(|(m, _)| m))
            .collect();
        let avg_peer_reputation = if alive.is_empty() {
            0.0
        } else {
            alive.iter().map(|p| p.reputation).sum::<f64>() / alive.len() as f64
        };
        NetworkStats {
            node_id: self.local_id.clone(),
            total_peers: self.peers.len(),
            alive_peers: alive.len(),
            total_shards_tracked: self.shard_registry.values().map(Vec::len).sum(),
            unique_models: models.len(),
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            avg_peer_reputation,
        }
    }

    pub fn get_network_stats(&self) -> NetworkStats {
        self.get_network_stats_at(unix_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;

    const MODEL: &str = "aria-2b-1bit";
    // 2026-01-05 12:00:00 UTC, a Monday.
    const NOW: f64 = 1_767_614_400.0;

    fn directory() -> PeerDirectory {
        PeerDirectory::new("local", "127.0.0.1", 9000, ConsentDescriptor::default())
    }

    fn peer(id: &str, shards: &[(u32, u32)]) -> PeerRecord {
        let mut p = PeerRecord::new(id, "127.0.0.1", 9001);
        p.consent = Some(ConsentDescriptor::default());
        p.available_shards = shards
            .iter()
            .map(|(s, e)| ModelShard::format_id(MODEL, *s, *e))
            .collect();
        p.last_seen = NOW;
        p
    }

    fn request() -> InferenceRequest {
        InferenceRequest::new("hello", MODEL, 16)
    }

    #[test]
    fn local_node_is_never_a_peer() {
        let mut d = directory();
        assert!(!d.add_peer(peer("local", &[])));
        assert!(d.is_empty());
    }

    #[test]
    fn removing_peer_cleans_shard_registry() {
        let mut d = directory();
        d.add_peer(peer("a", &[(0, 7)]));
        let shard = ModelShard::format_id(MODEL, 0, 7);
        assert_eq!(d.find_shard_holders_at(&shard, NOW).len(), 1);

        d.remove_peer("a");
        assert!(d.find_shard_holders_at(&shard, NOW).is_empty());
        assert_eq!(d.get_network_stats_at(NOW).total_shards_tracked, 0);
    }

    #[test]
    fn re_adding_peer_keeps_reputation_and_replaces_shards() {
        let mut d = directory();
        d.add_peer(peer("a", &[(0, 7)]));
        d.record_forward_failure("a");
        d.add_peer(peer("a", &[(8, 15)]));

        let a = d.peer("a").unwrap();
        assert!((a.reputation - 0.9).abs() < 1e-12);
        let old = ModelShard::format_id(MODEL, 0, 7);
        let new = ModelShard::format_id(MODEL, 8, 15);
        assert!(d.find_shard_holders_at(&old, NOW).is_empty());
        assert_eq!(d.find_shard_holders_at(&new, NOW).len(), 1);
    }

    #[test]
    fn silent_peer_is_excluded_after_ttl() {
        let mut d = directory();
        d.add_peer(peer("quiet", &[]));
        d.add_peer(peer("chatty", &[]));
        d.touch("chatty", NOW + 301.0);

        let later = NOW + 301.0;
        let alive: Vec<_> = d.get_alive_peers_at(later).iter().map(|p| p.node_id.clone()).collect();
        assert_eq!(alive, vec!["chatty".to_string()]);

        let routed: Vec<_> = d
            .find_peers_for_request_at(&request(), later)
            .iter()
            .map(|p| p.node_id.clone())
            .collect();
        assert_eq!(routed, vec!["chatty".to_string()]);

        assert_eq!(d.prune_dead_peers_at(later), vec!["quiet".to_string()]);
        assert!(d.peer("quiet").is_none());
    }

    #[test]
    fn routing_orders_by_quality_and_keeps_ties_stable() {
        let mut d = directory();
        let mut slow = peer("a-slow", &[]);
        slow.avg_latency_ms = 4000.0;
        let mut fast = peer("b-fast", &[]);
        fast.avg_latency_ms = 100.0;
        d.add_peer(slow);
        d.add_peer(fast);
        d.add_peer(peer("c-tie", &[]));
        d.add_peer(peer("d-tie", &[]));

        let ids: Vec<_> = d
            .find_peers_for_request_at(&request(), NOW)
            .iter()
            .map(|p| p.node_id.clone())
            .collect();
        assert_eq!(ids, ["c-tie", "d-tie", "b-fast", "a-slow"]);
    }

    #[test]
    fn routing_applies_consent_and_shard_filters() {
        let mut d = directory();
        let mut no_consent = peer("none", &[]);
        no_consent.consent = None;
        let mut code_only = peer("code", &[]);
        code_only.consent.as_mut().unwrap().task_types = vec![TaskType::CodeGeneration];
        let mut small = peer("small", &[]);
        small.consent.as_mut().unwrap().max_ram_mb = 128;
        let mut greedy = peer("greedy", &[]);
        greedy.consent.as_mut().unwrap().min_reward_per_inference = 1.0;
        let mut other_model = peer("other", &[]);
        other_model.available_shards = vec![ModelShard::format_id("other-7b", 0, 7)];
        let holder = peer("holder", &[(0, 7)]);

        for p in [no_consent, code_only, small, greedy, other_model, holder] {
            d.add_peer(p);
        }
        let ids: Vec<_> = d
            .find_peers_for_request_at(&request(), NOW)
            .iter()
            .map(|p| p.node_id.clone())
            .collect();
        assert_eq!(ids, vec!["holder".to_string()]);
    }

    #[test]
    fn chain_includes_local_shard() {
        let mut d = directory();
        d.register_local_shard(ModelShard::new(MODEL, 0, 7, 64));
        d.add_peer(peer("b", &[(8, 15)]));
        d.add_peer(peer("c", &[(16, 23)]));

        let chain = d.build_pipeline_chain_at(MODEL, 24, Some(&request()), NOW).unwrap();
        let ids: Vec<_> = chain.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, ["local", "b", "c"]);
    }

    #[test]
    fn chain_with_dead_stage_reports_gap() {
        let mut d = directory();
        d.register_local_shard(ModelShard::new(MODEL, 0, 7, 64));
        d.add_peer(peer("b", &[(8, 15)]));
        d.add_peer(peer("c", &[(16, 23)]));
        d.touch("c", NOW + 400.0);

        let err = d.build_pipeline_chain_at(MODEL, 24, None, NOW + 400.0).unwrap_err();
        assert_eq!(err, ChainError::Gap { layer: 8 });
    }

    #[test]
    fn next_stage_prefers_exact_start_and_lists_replicas() {
        let mut d = directory();
        d.register_local_shard(ModelShard::new(MODEL, 8, 15, 64));
        d.add_peer(peer("overlap", &[(4, 15)]));
        d.add_peer(peer("exact", &[(8, 15)]));
        d.add_peer(peer("twin", &[(8, 15)]));

        let next = d.get_next_stage_at(MODEL, 8, NOW).unwrap();
        assert_eq!(next.node_id, "exact");
        assert_eq!(next.replicas, vec!["twin".to_string(), "overlap".to_string()]);
    }

    #[test]
    fn next_stage_is_none_when_nobody_holds_layer() {
        let mut d = directory();
        d.add_peer(peer("a", &[(0, 7)]));
        assert!(d.get_next_stage_at(MODEL, 8, NOW).is_none());
    }

    #[test]
    fn stats_count_models_and_reputation() {
        let mut d = directory();
        d.register_local_shard(ModelShard::new(MODEL, 0, 7, 64));
        d.add_peer(peer("a", &[(8, 15)]));
        d.add_peer(peer("b", &[(8, 15)]));
        d.record_forward_failure("b");
        d.note_sent();

        let s = d.get_network_stats_at(NOW);
        assert_eq!(s.total_peers, 2);
        assert_eq!(s.alive_peers, 2);
        assert_eq!(s.total_shards_tracked, 3);
        assert_eq!(s.unique_models, 1);
        assert_eq!(s.messages_sent, 1);
        assert!((s.avg_peer_reputation - 0.95).abs() < 1e-12);
    }
}

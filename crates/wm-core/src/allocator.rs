//! Streaming context allocator: per-session, token-budgeted admission and
//! eviction of active memory slots.
//!
//! Each `surface_one` call scans the whole eligible pool and admits the
//! single best node if it fits. The admission loop is therefore
//! O(slots × pool), which is fine because the pool is bounded by the store.

use std::collections::VecDeque;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::AllocatorConfig;
use crate::constants::{MIN_VALUE_CHARS, MOMENTUM_WEIGHT, SALIENCE_WEIGHT, TOPIC_OVERRIDE_SALIENCE};
use crate::embedding::{EmbeddingService, rescale_unit};
use crate::node::{NodeStore, SemanticNode};
use crate::prefetch::PrefetchCoordinator;
use crate::time::{age_hours, now_unix_secs};
use crate::tokenizer::{Topic, estimate_tokens};

/// One admitted node in a session.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveSlot {
    pub node_id: i64,
    pub priority: f32,
    pub tokens_consumed: i32,
    pub served: bool,
}

/// What `surface_one` hands back to the caller for rendering.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRef {
    pub node_id: i64,
    pub label: String,
    pub value: String,
    pub priority: f32,
    pub tokens: i32,
}

/// A recent exchange kept in the session ring buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Turn {
    pub user: String,
    pub assistant: String,
    pub timestamp: u64,
}

/// Session state for one generation turn at a time.
#[derive(Debug)]
pub struct StreamState {
    pub session_id: Uuid,
    slots: Vec<ActiveSlot>,
    total_tokens: i32,
    last_hop: Option<i64>,
    hop_depth: u32,
    query: String,
    query_embedding: Vec<f32>,
    has_query_embedding: bool,
    /// Set once an embed was tried for the current query, successful or not.
    embedding_attempted: bool,
    turns: VecDeque<Turn>,
    turn_capacity: usize,
}

impl StreamState {
    pub fn new(turn_capacity: usize) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            slots: Vec::new(),
            total_tokens: 0,
            last_hop: None,
            hop_depth: 0,
            query: String::new(),
            query_embedding: Vec::new(),
            has_query_embedding: false,
            embedding_attempted: false,
            turns: VecDeque::with_capacity(turn_capacity),
            turn_capacity: turn_capacity.max(1),
        }
    }

    pub fn slots(&self) -> &[ActiveSlot] {
        &self.slots
    }

    pub fn total_tokens(&self) -> i32 {
        self.total_tokens
    }

    pub fn last_hop(&self) -> Option<i64> {
        self.last_hop
    }

    /// Length of the current chain of admissions that each follow an edge
    /// from the previous one.
    pub fn hop_depth(&self) -> u32 {
        self.hop_depth
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn has_query_embedding(&self) -> bool {
        self.has_query_embedding
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    fn is_active(&self, node_id: i64) -> bool {
        self.slots.iter().any(|s| s.node_id == node_id)
    }
}

pub struct StreamingAllocator {
    config: AllocatorConfig,
    embedder: Arc<dyn EmbeddingService + Send + Sync>,
    state: StreamState,
}

impl StreamingAllocator {
    pub fn new(config: AllocatorConfig, embedder: Arc<dyn EmbeddingService + Send + Sync>) -> Self {
        let state = StreamState::new(config.turn_history);
        Self {
            config,
            embedder,
            state,
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn slots(&self) -> &[ActiveSlot] {
        self.state.slots()
    }

    pub fn total_tokens(&self) -> i32 {
        self.state.total_tokens
    }

    pub fn remaining_tokens(&self) -> i32 {
        (self.config.token_budget - self.state.total_tokens).max(0)
    }

    /// Start a new query: remember its text and invalidate the cached embedding.
    pub fn begin_query(&mut self, query: &str) {
        self.state.query = query.to_string();
        self.state.query_embedding.clear();
        self.state.has_query_embedding = false;
        self.state.embedding_attempted = false;
        self.state.last_hop = None;
        self.state.hop_depth = 0;
    }

    /// Embed the current query at most once. Failure leaves the flag false
    /// and scoring proceeds without similarity.
    fn ensure_query_embedding(&mut self) {
        if self.state.embedding_attempted {
            return;
        }
        self.state.embedding_attempted = true;
        match self.embedder.embed(&self.state.query) {
            Ok(v) => {
                self.state.query_embedding = v;
                self.state.has_query_embedding = true;
            }
            Err(e) => {
                tracing::debug!("query embedding unavailable, scoring without similarity: {e}");
            }
        }
    }

    /// Priority of an eligible node, or `None` when the node is ineligible.
    fn score(&self, node: &SemanticNode, momentum: f32, query_topic: Topic, now: u64) -> Option<f32> {
        if !node.is_active {
            return None;
        }
        if !(node.salience > 0.0 && node.salience <= 1.0) {
            return None;
        }
        if node.value.trim().len() < MIN_VALUE_CHARS {
            return None;
        }

        let rate = self.config.decay_rate * node.decay_multiplier();
        let recency = (-rate * age_hours(node.last_accessed, now)).exp();
        let base = node.salience * recency * SALIENCE_WEIGHT + momentum * MOMENTUM_WEIGHT;
        if base < self.config.min_eviction_priority {
            return None;
        }

        if node.salience < TOPIC_OVERRIDE_SALIENCE
            && query_topic.disagrees_with(Topic::classify(&node.text()))
        {
            tracing::debug!(node_id = node.id, "skipped: topic mismatch");
            return None;
        }

        let mut priority = base;
        if self.state.has_query_embedding && !node.embedding.is_empty() {
            let sim = self
                .embedder
                .similarity(&self.state.query_embedding, &node.embedding);
            priority *= 0.5 + rescale_unit(sim);
        }
        // Override boost goes on after eligibility filtering.
        if node.label == self.config.raw_memory_label {
            priority *= self.config.raw_memory_boost;
        }
        Some(priority)
    }

    /// Admit the single highest-priority eligible node if it fits the
    /// remaining budget. `None` when nothing is eligible, the winner does not
    /// fit, the budget is spent, or every slot is taken.
    pub fn surface_one(&mut self, store: &dyn NodeStore, query: &str, momentum: f32) -> Option<NodeRef> {
        if query != self.state.query {
            self.begin_query(query);
        }
        if self.state.slots.len() >= self.config.max_slots {
            tracing::debug!("slot capacity {} reached, admission refused", self.config.max_slots);
            return None;
        }
        let remaining = self.remaining_tokens();
        if remaining <= 0 {
            return None;
        }

        self.ensure_query_embedding();
        let momentum = momentum.clamp(0.0, 1.0);
        let query_topic = Topic::classify(query);
        let now = now_unix_secs();

        let mut best: Option<(&SemanticNode, f32)> = None;
        for node in store.nodes() {
            if self.state.is_active(node.id) {
                continue;
            }
            let Some(priority) = self.score(node, momentum, query_topic, now) else {
                continue;
            };
            // Strict comparison keeps the first-encountered node on ties.
            if best.is_none_or(|(_, p)| priority > p) {
                best = Some((node, priority));
            }
        }

        let (node, priority) = best?;
        let tokens = estimate_tokens(&node.label, &node.value);
        if tokens > remaining {
            tracing::debug!(
                node_id = node.id,
                tokens,
                remaining,
                "best candidate does not fit remaining budget"
            );
            return None;
        }

        let node_ref = NodeRef {
            node_id: node.id,
            label: node.label.clone(),
            value: node.value.clone(),
            priority,
            tokens,
        };
        self.push_slot(store, node.id, priority, tokens);
        Some(node_ref)
    }

    fn push_slot(&mut self, store: &dyn NodeStore, node_id: i64, priority: f32, tokens: i32) {
        let follows_edge = self
            .state
            .last_hop
            .is_some_and(|prev| store.edges_from(prev).iter().any(|e| e.to == node_id));
        self.state.hop_depth = if follows_edge { self.state.hop_depth + 1 } else { 0 };
        self.state.last_hop = Some(node_id);

        self.state.slots.push(ActiveSlot {
            node_id,
            priority,
            tokens_consumed: tokens,
            served: false,
        });
        self.state.total_tokens += tokens;
        tracing::debug!(node_id, priority, tokens, total = self.state.total_tokens, "admitted");
    }

    /// Admission loop for one turn: begin the query, then surface until the
    /// allocator refuses or the soft slot target is reached.
    pub fn admit_turn(&mut self, store: &dyn NodeStore, query: &str, momentum: f32) -> Vec<NodeRef> {
        self.begin_query(query);
        let mut admitted = Vec::new();
        while admitted.len() < self.config.soft_slot_target {
            match self.surface_one(store, query, momentum) {
                Some(node_ref) => admitted.push(node_ref),
                None => break,
            }
        }
        admitted
    }

    /// Admit staged prefetch entries that fit the remaining budget.
    /// Cost is re-estimated from the node itself, never taken from the
    /// entry. Entries for nodes that are already active, archived, unknown
    /// to the store, or larger than the remaining budget are consumed and
    /// skipped.
    pub fn admit_prefetched<S>(
        &mut self,
        store: &dyn NodeStore,
        coordinator: &PrefetchCoordinator<S>,
    ) -> Vec<NodeRef>
    where
        S: NodeStore + Send + Sync + 'static,
    {
        let mut admitted = Vec::new();
        while self.state.slots.len() < self.config.max_slots {
            let remaining = self.remaining_tokens();
            if remaining <= 0 {
                break;
            }
            let Some(entry) = coordinator.take_next_entry(remaining) else {
                break;
            };
            if self.state.is_active(entry.node_id) {
                continue;
            }
            let Some(node) = store.get(entry.node_id) else {
                continue;
            };
            if !node.is_active {
                tracing::debug!(node_id = node.id, "skipped archived prefetch entry");
                continue;
            }
            let tokens = estimate_tokens(&node.label, &node.value);
            if tokens > remaining {
                tracing::debug!(
                    node_id = node.id,
                    staged = entry.tokens,
                    tokens,
                    remaining,
                    "prefetch entry understated its cost, skipped"
                );
                continue;
            }
            admitted.push(NodeRef {
                node_id: node.id,
                label: node.label.clone(),
                value: node.value.clone(),
                priority: entry.relevance,
                tokens,
            });
            self.push_slot(store, node.id, entry.relevance, tokens);
        }
        admitted
    }

    /// Mark a slot served and charge the node a salience penalty.
    /// Returns false when the node holds no slot.
    pub fn ack_served(&mut self, store: &mut dyn NodeStore, node_id: i64) -> bool {
        let Some(slot) = self.state.slots.iter_mut().find(|s| s.node_id == node_id) else {
            return false;
        };
        slot.served = true;
        store.scale_salience(node_id, self.config.served_salience_decay);
        true
    }

    /// Drop served and low-priority slots, preserving order. Returns the
    /// tokens freed.
    pub fn evict(&mut self) -> i32 {
        let threshold = self.config.min_eviction_priority;
        let mut freed = 0;
        self.state.slots.retain(|slot| {
            let keep = !slot.served && slot.priority >= threshold;
            if !keep {
                freed += slot.tokens_consumed;
            }
            keep
        });
        self.state.total_tokens -= freed;
        if freed > 0 {
            tracing::debug!(freed, remaining = self.state.slots.len(), "evicted slots");
        }
        freed
    }

    /// Clear every slot and invalidate the cached query embedding.
    pub fn reset(&mut self) {
        self.state.slots.clear();
        self.state.total_tokens = 0;
        self.begin_query("");
    }

    /// Remember a finished exchange, overwriting the oldest when full.
    pub fn record_turn(&mut self, user: &str, assistant: &str) {
        if self.state.turns.len() >= self.state.turn_capacity {
            self.state.turns.pop_front();
        }
        self.state.turns.push_back(Turn {
            user: user.to_string(),
            assistant: assistant.to_string(),
            timestamp: now_unix_secs(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{HashEmbedder, NullEmbedder};
    use crate::error::EmbedError;
    use crate::node::MemoryNodeStore;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn allocator(budget: i32) -> StreamingAllocator {
        let config = AllocatorConfig {
            token_budget: budget,
            ..AllocatorConfig::default()
        };
        StreamingAllocator::new(config, Arc::new(NullEmbedder))
    }

    /// Value padded so that `estimate_tokens("fact", value) == tokens`.
    fn sized_value(tokens: usize) -> String {
        "x".repeat(tokens * 4 - 4 - 10)
    }

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    impl EmbeddingService for CountingEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            HashEmbedder::default().embed(text)
        }
    }

    #[test]
    fn test_budget_scenario_70_then_40_refused() {
        let mut store = MemoryNodeStore::new();
        let small = store.add("fact", &sized_value(40), 0.9, vec![]);
        let large = store.add("fact", &sized_value(70), 0.95, vec![]);
        let mut alloc = allocator(100);

        let first = alloc.surface_one(&store, "", 0.0).unwrap();
        assert_eq!(first.node_id, large);
        assert_eq!(first.tokens, 70);

        assert!(alloc.surface_one(&store, "", 0.0).is_none());
        assert_eq!(alloc.total_tokens(), 70);
        assert!(alloc.slots().iter().all(|s| s.node_id != small));
    }

    #[test]
    fn test_admit_turn_stops_at_soft_target() {
        let mut store = MemoryNodeStore::new();
        for i in 0..10 {
            store.add("fact", &format!("distinct fact number {i}"), 0.5, vec![]);
        }
        let mut alloc = allocator(10_000);
        let admitted = alloc.admit_turn(&store, "", 0.5);
        assert_eq!(admitted.len(), alloc.config().soft_slot_target);
    }

    #[test]
    fn test_hard_slot_cap() {
        let mut store = MemoryNodeStore::new();
        for i in 0..5 {
            store.add("fact", &format!("distinct fact number {i}"), 0.5, vec![]);
        }
        let config = AllocatorConfig {
            token_budget: 10_000,
            max_slots: 2,
            ..AllocatorConfig::default()
        };
        let mut alloc = StreamingAllocator::new(config, Arc::new(NullEmbedder));
        assert!(alloc.surface_one(&store, "", 0.5).is_some());
        assert!(alloc.surface_one(&store, "", 0.5).is_some());
        assert!(alloc.surface_one(&store, "", 0.5).is_none());
        assert_eq!(alloc.slots().len(), 2);
    }

    #[test]
    fn test_ties_break_first_encountered() {
        let now = now_unix_secs();
        let mut store = MemoryNodeStore::new();
        store.insert(SemanticNode::new(7, "fact", "same weight one", 0.5).accessed_at(now));
        store.insert(SemanticNode::new(3, "fact", "same weight two", 0.5).accessed_at(now));
        let mut alloc = allocator(1000);
        assert_eq!(alloc.surface_one(&store, "", 0.2).unwrap().node_id, 7);
    }

    #[test]
    fn test_ineligible_nodes_skipped() {
        let mut store = MemoryNodeStore::new();
        store.add("fact", "  ", 0.9, vec![]);
        store.add("fact", "zero salience", 0.0, vec![]);
        store.add("fact", "too salient", 1.5, vec![]);
        let archived = store.add("fact", "archived fact", 0.9, vec![]);
        store.get_mut(archived).unwrap().is_active = false;
        let mut alloc = allocator(1000);
        assert!(alloc.surface_one(&store, "", 0.5).is_none());
    }

    #[test]
    fn test_below_eviction_threshold_not_admitted() {
        let mut store = MemoryNodeStore::new();
        // salience 0.05 * 0.7 = 0.035 < 0.05 with zero momentum
        store.add("fact", "barely salient", 0.05, vec![]);
        let mut alloc = allocator(1000);
        assert!(alloc.surface_one(&store, "", 0.0).is_none());
    }

    #[test]
    fn test_raw_memory_boost_wins() {
        let mut store = MemoryNodeStore::new();
        store.add("fact", "ordinary but salient", 0.9, vec![]);
        let raw = store.add("raw_memory", "verbatim transcript line", 0.4, vec![]);
        let mut alloc = allocator(1000);
        let first = alloc.surface_one(&store, "", 0.0).unwrap();
        assert_eq!(first.node_id, raw);
    }

    #[test]
    fn test_topic_mismatch_skipped_unless_salient() {
        let mut store = MemoryNodeStore::new();
        let off_topic = store.add("fact", "my family birthday party", 0.5, vec![]);
        let salient = store.add("fact", "my mom likes her home", 0.95, vec![]);
        let mut alloc = allocator(1000);
        let admitted = alloc.admit_turn(&store, "rust compiler bug in my thread code", 0.5);
        let ids: Vec<i64> = admitted.iter().map(|n| n.node_id).collect();
        assert!(!ids.contains(&off_topic));
        assert!(ids.contains(&salient));
    }

    #[test]
    fn test_recency_decay_prefers_fresh() {
        let now = now_unix_secs();
        let mut store = MemoryNodeStore::new();
        store.insert(SemanticNode::new(1, "fact", "stale memory", 0.8).accessed_at(now - 6 * 3600));
        store.insert(SemanticNode::new(2, "fact", "fresh memory", 0.8).accessed_at(now));
        let mut alloc = allocator(1000);
        assert_eq!(alloc.surface_one(&store, "", 0.0).unwrap().node_id, 2);
    }

    #[test]
    fn test_hypothetical_decays_faster() {
        let now = now_unix_secs();
        let mut store = MemoryNodeStore::new();
        store.insert(
            SemanticNode::new(1, "fact", "what if memory", 0.8)
                .accessed_at(now - 3600)
                .hypothetical(4.0),
        );
        store.insert(SemanticNode::new(2, "fact", "observed memory", 0.8).accessed_at(now - 3600));
        let mut alloc = allocator(1000);
        assert_eq!(alloc.surface_one(&store, "", 0.0).unwrap().node_id, 2);
    }

    #[test]
    fn test_query_similarity_reorders() {
        let embedder = HashEmbedder::default();
        let mut store = MemoryNodeStore::new();
        let bread = "sourdough bread needs a long proof";
        let weather = "storms roll in over the harbor tonight";
        store.add("fact", weather, 0.5, embedder.embed(weather).unwrap());
        let want = store.add("fact", bread, 0.5, embedder.embed(bread).unwrap());
        let mut alloc = StreamingAllocator::new(AllocatorConfig::default(), Arc::new(embedder));
        let first = alloc.surface_one(&store, "how long should sourdough bread proof", 0.2).unwrap();
        assert_eq!(first.node_id, want);
        assert!(alloc.state().has_query_embedding());
    }

    #[test]
    fn test_query_embedded_once_per_query() {
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let mut store = MemoryNodeStore::new();
        for i in 0..4 {
            store.add("fact", &format!("fact number {i}"), 0.5, vec![]);
        }
        let mut alloc = StreamingAllocator::new(AllocatorConfig::default(), embedder.clone());
        alloc.admit_turn(&store, "first query", 0.5);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        alloc.begin_query("second query");
        assert!(!alloc.state().has_query_embedding());
        alloc.surface_one(&store, "second query", 0.5);
        alloc.surface_one(&store, "second query", 0.5);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_embedding_failure_degrades() {
        let mut store = MemoryNodeStore::new();
        store.add("fact", "still admitted", 0.5, vec![1.0, 0.0]);
        let mut alloc = allocator(1000);
        assert!(alloc.surface_one(&store, "anything", 0.5).is_some());
        assert!(!alloc.state().has_query_embedding());
    }

    #[test]
    fn test_ack_served_decays_salience_and_evicts() {
        let mut store = MemoryNodeStore::new();
        let a = store.add("fact", "served fact", 0.5, vec![]);
        let b = store.add("fact", "kept fact", 0.4, vec![]);
        let mut alloc = allocator(1000);
        alloc.admit_turn(&store, "", 0.5);
        let before = alloc.total_tokens();

        assert!(alloc.ack_served(&mut store, a));
        assert!((store.get(a).unwrap().salience - 0.4).abs() < 1e-6);
        assert!(!alloc.ack_served(&mut store, 999));

        let served_tokens = alloc.slots().iter().find(|s| s.node_id == a).unwrap().tokens_consumed;
        let freed = alloc.evict();
        assert_eq!(freed, served_tokens);
        assert_eq!(alloc.total_tokens(), before - freed);
        assert_eq!(alloc.slots().len(), 1);
        assert_eq!(alloc.slots()[0].node_id, b);
    }

    #[test]
    fn test_evict_preserves_order() {
        let mut store = MemoryNodeStore::new();
        let ids: Vec<i64> = (0..4)
            .map(|i| store.add("fact", &format!("ordered fact {i}"), 0.9 - i as f32 * 0.1, vec![]))
            .collect();
        let mut alloc = allocator(1000);
        alloc.admit_turn(&store, "", 0.0);
        alloc.ack_served(&mut store, ids[1]);
        alloc.evict();
        let left: Vec<i64> = alloc.slots().iter().map(|s| s.node_id).collect();
        assert_eq!(left, vec![ids[0], ids[2], ids[3]]);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut store = MemoryNodeStore::new();
        store.add("fact", "some fact", 0.5, vec![]);
        let mut alloc = StreamingAllocator::new(AllocatorConfig::default(), Arc::new(HashEmbedder::default()));
        alloc.admit_turn(&store, "some query", 0.5);
        assert!(alloc.state().has_query_embedding());
        alloc.reset();
        assert!(alloc.slots().is_empty());
        assert_eq!(alloc.total_tokens(), 0);
        assert!(!alloc.state().has_query_embedding());
    }

    #[test]
    fn test_hop_depth_follows_edges() {
        let mut store = MemoryNodeStore::new();
        let a = store.add("fact", "chain start", 0.9, vec![]);
        let b = store.add("fact", "chain middle", 0.8, vec![]);
        let c = store.add("fact", "chain end", 0.7, vec![]);
        store.link(a, b, 1.0);
        store.link(b, c, 1.0);
        let mut alloc = allocator(1000);
        alloc.admit_turn(&store, "", 0.0);
        assert_eq!(alloc.state().last_hop(), Some(c));
        assert_eq!(alloc.state().hop_depth(), 2);
    }

    #[test]
    fn test_turn_ring_buffer_bounded() {
        let config = AllocatorConfig {
            turn_history: 2,
            ..AllocatorConfig::default()
        };
        let mut alloc = StreamingAllocator::new(config, Arc::new(NullEmbedder));
        alloc.record_turn("q1", "a1");
        alloc.record_turn("q2", "a2");
        alloc.record_turn("q3", "a3");
        let users: Vec<&str> = alloc.state().turns().map(|t| t.user.as_str()).collect();
        assert_eq!(users, vec!["q2", "q3"]);
    }

    proptest! {
        #[test]
        fn prop_budget_never_exceeded(
            sizes in proptest::collection::vec((5usize..200, 0.05f32..1.0), 1..40),
            budget in 10i32..600,
            momentum in 0.0f32..1.0,
        ) {
            let mut store = MemoryNodeStore::new();
            for (len, salience) in &sizes {
                store.add("fact", &"y".repeat(*len), *salience, vec![]);
            }
            let mut alloc = allocator(budget);
            loop {
                let admitted = alloc.surface_one(&store, "", momentum);
                let sum: i32 = alloc.slots().iter().map(|s| s.tokens_consumed).sum();
                prop_assert!(sum <= budget);
                prop_assert_eq!(sum, alloc.total_tokens());
                if admitted.is_none() {
                    break;
                }
            }
        }
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::time::now_unix_secs;

/// A fact in the semantic graph. Owned by the node store; the engine only
/// reads it, apart from the salience penalty applied when it is served.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SemanticNode {
    pub id: i64,
    pub label: String,
    pub value: String,
    pub embedding: Vec<f32>,
    pub salience: f32,
    /// `false` marks the node archived; archived nodes are never admitted.
    pub is_active: bool,
    /// Unix seconds.
    pub last_accessed: u64,
    #[serde(default)]
    pub is_hypothetical: bool,
    /// Scales the recency decay rate of hypothetical nodes.
    #[serde(default)]
    pub hypothetical_decay_multiplier: Option<f32>,
}

impl SemanticNode {
    pub fn new(id: i64, label: &str, value: &str, salience: f32) -> Self {
        Self {
            id,
            label: label.to_string(),
            value: value.to_string(),
            embedding: Vec::new(),
            salience,
            is_active: true,
            last_accessed: now_unix_secs(),
            is_hypothetical: false,
            hypothetical_decay_multiplier: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn accessed_at(mut self, unix_secs: u64) -> Self {
        self.last_accessed = unix_secs;
        self
    }

    pub fn hypothetical(mut self, decay_multiplier: f32) -> Self {
        self.is_hypothetical = true;
        self.hypothetical_decay_multiplier = Some(decay_multiplier);
        self
    }

    /// Multiplier applied to the recency decay rate. 1.0 unless hypothetical;
    /// hypothetical nodes never decay slower than plain ones.
    pub fn decay_multiplier(&self) -> f32 {
        if self.is_hypothetical {
            self.hypothetical_decay_multiplier
                .filter(|m| m.is_finite())
                .map_or(1.0, |m| m.max(1.0))
        } else {
            1.0
        }
    }

    /// Text used for embedding and topic classification.
    pub fn text(&self) -> String {
        format!("{} {}", self.label, self.value)
    }
}

/// Directed weighted edge between two nodes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: i64,
    pub to: i64,
    pub weight: f32,
}

/// Read access to the semantic graph, plus the one write the engine needs.
///
/// `nodes()` iteration order is the tie-break order for admission.
pub trait NodeStore {
    fn nodes(&self) -> &[SemanticNode];

    fn get(&self, id: i64) -> Option<&SemanticNode>;

    fn edges_from(&self, id: i64) -> &[Edge];

    /// Multiply a node's salience by `factor`. Returns false for unknown ids.
    fn scale_salience(&mut self, id: i64, factor: f32) -> bool;

    fn len(&self) -> usize {
        self.nodes().len()
    }

    fn is_empty(&self) -> bool {
        self.nodes().is_empty()
    }
}

/// In-memory node store: insertion-ordered nodes with an id index and
/// adjacency lists.
#[derive(Clone, Debug, Default)]
pub struct MemoryNodeStore {
    nodes: Vec<SemanticNode>,
    index: HashMap<i64, usize>,
    edges: HashMap<i64, Vec<Edge>>,
    next_id: i64,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node. Replacing keeps the original position.
    pub fn insert(&mut self, node: SemanticNode) {
        self.next_id = self.next_id.max(node.id + 1);
        match self.index.get(&node.id) {
            Some(&idx) => self.nodes[idx] = node,
            None => {
                self.index.insert(node.id, self.nodes.len());
                self.nodes.push(node);
            }
        }
    }

    /// Insert a node under a freshly allocated id. Ids are never reused.
    pub fn add(&mut self, label: &str, value: &str, salience: f32, embedding: Vec<f32>) -> i64 {
        let id = self.next_id;
        self.insert(SemanticNode::new(id, label, value, salience).with_embedding(embedding));
        id
    }

    /// Add a directed edge. Returns false when either endpoint is unknown.
    pub fn link(&mut self, from: i64, to: i64, weight: f32) -> bool {
        if !self.index.contains_key(&from) || !self.index.contains_key(&to) {
            return false;
        }
        self.edges
            .entry(from)
            .or_default()
            .push(Edge { from, to, weight });
        true
    }

    /// Iterate every edge in the store.
    pub fn all_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values().flat_map(|v| v.iter())
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut SemanticNode> {
        let idx = *self.index.get(&id)?;
        self.nodes.get_mut(idx)
    }

    /// Record an access at `unix_secs`. False for unknown ids.
    pub fn touch(&mut self, id: i64, unix_secs: u64) -> bool {
        match self.get_mut(id) {
            Some(node) => {
                node.last_accessed = node.last_accessed.max(unix_secs);
                true
            }
            None => false,
        }
    }
}

impl NodeStore for MemoryNodeStore {
    fn nodes(&self) -> &[SemanticNode] {
        &self.nodes
    }

    fn get(&self, id: i64) -> Option<&SemanticNode> {
        self.index.get(&id).and_then(|&idx| self.nodes.get(idx))
    }

    fn edges_from(&self, id: i64) -> &[Edge] {
        self.edges.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn scale_salience(&mut self, id: i64, factor: f32) -> bool {
        match self.get_mut(id) {
            Some(node) => {
                node.salience = (node.salience * factor).clamp(0.0, 1.0);
                true
            }
            None => false,
        }
    }
}

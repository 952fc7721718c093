//! Temporal recursive memory: an append-only, energy-decaying log of
//! cognitive states with a loop guard, arranged as a commit DAG so it can be
//! branched and merged (see `branch.rs`).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TemporalConfig;
use crate::constants::MAIN_BRANCH;
use crate::embedding::EmbeddingService;
use crate::time::{now_unix_f64, now_unix_millis};

/// Commit identifier. Minted as `max(previous + 1, creation millis)`, so ids
/// are strictly increasing within a memory and carry their creation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(pub u64);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CommitId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(CommitId)
    }
}

/// One entry of a timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemporalNode {
    pub content: String,
    /// Unix seconds.
    pub timestamp: f64,
    pub activation_energy: f32,
    pub recursion_depth: u32,
    pub source_id: String,
    pub commit_id: CommitId,
    /// `None` for a root commit.
    pub parent_id: Option<CommitId>,
}

/// A named timeline. The current branch's timeline lives in the memory's
/// live stream and is written back here on checkout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub branch_id: Uuid,
    pub branch_name: String,
    /// Divergence point. `None` when the branch started from an empty
    /// timeline.
    pub base_commit: Option<CommitId>,
    pub timeline: Vec<TemporalNode>,
    pub created_at: f64,
    pub is_active: bool,
}

impl Branch {
    pub(crate) fn new(name: &str, base_commit: Option<CommitId>, timeline: Vec<TemporalNode>) -> Self {
        Self {
            branch_id: Uuid::new_v4(),
            branch_name: name.to_string(),
            base_commit,
            timeline,
            created_at: now_unix_f64(),
            is_active: false,
        }
    }
}

/// External cognitive state that bounds recursion depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CognitiveState {
    Calm,
    Focused,
    Curious,
    Stressed,
    Anxious,
}

/// Intensity at or above which stressed states tighten one more level.
const HIGH_INTENSITY: f32 = 0.8;

impl CognitiveState {
    pub fn max_depth(self, intensity: f32) -> u32 {
        let base = match self {
            CognitiveState::Calm => 5,
            CognitiveState::Focused => 8,
            CognitiveState::Curious => 6,
            CognitiveState::Stressed => 3,
            CognitiveState::Anxious => 2,
        };
        let strained = matches!(self, CognitiveState::Stressed | CognitiveState::Anxious);
        if strained && intensity >= HIGH_INTENSITY {
            (base - 1).max(1)
        } else {
            base
        }
    }
}

/// Serializable state for external persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemporalSnapshot {
    pub current_branch: String,
    pub lambda: f64,
    pub max_recursion_depth: u32,
    pub last_commit: u64,
    pub branches: Vec<Branch>,
}

#[derive(Debug)]
pub struct TemporalMemory {
    pub(crate) config: TemporalConfig,
    /// Live timeline of the current branch.
    pub(crate) stream: VecDeque<TemporalNode>,
    pub(crate) branches: Vec<Branch>,
    pub(crate) current: String,
    /// Content → number of live nodes carrying it.
    pub(crate) repeat_counts: HashMap<String, u32>,
    pub(crate) lambda: f64,
    pub(crate) max_recursion_depth: u32,
    pub(crate) last_commit: u64,
}

impl TemporalMemory {
    pub fn new(config: TemporalConfig) -> Self {
        let mut main = Branch::new(MAIN_BRANCH, None, Vec::new());
        main.is_active = true;
        Self {
            lambda: config.lambda,
            max_recursion_depth: config.max_recursion_depth,
            config,
            stream: VecDeque::new(),
            branches: vec![main],
            current: MAIN_BRANCH.to_string(),
            repeat_counts: HashMap::new(),
            last_commit: 0,
        }
    }

    /// Rebuild from a snapshot. A missing `main` branch is recreated and an
    /// unknown current branch falls back to `main`.
    pub fn restore(snapshot: TemporalSnapshot, config: TemporalConfig) -> Self {
        let mut memory = Self::new(config);
        memory.lambda = if snapshot.lambda.is_finite() && snapshot.lambda > 0.0 {
            snapshot.lambda
        } else {
            memory.config.lambda
        };
        memory.max_recursion_depth = snapshot.max_recursion_depth;
        memory.last_commit = snapshot.last_commit;

        if !snapshot.branches.is_empty() {
            memory.branches = snapshot.branches;
        }
        if !memory.branches.iter().any(|b| b.branch_name == MAIN_BRANCH) {
            memory.branches.insert(0, Branch::new(MAIN_BRANCH, None, Vec::new()));
        }
        let current = if memory.branch(&snapshot.current_branch).is_some() {
            snapshot.current_branch
        } else {
            MAIN_BRANCH.to_string()
        };
        memory.current = current;
        for branch in &mut memory.branches {
            branch.is_active = branch.branch_name == memory.current;
        }

        let live = memory
            .branch(&memory.current)
            .map(|b| b.timeline.clone())
            .unwrap_or_default();
        memory.load_stream(live);
        // Never mint an id at or below one already in use.
        let max_seen = memory
            .branches
            .iter()
            .flat_map(|b| b.timeline.iter())
            .map(|n| n.commit_id.0)
            .max()
            .unwrap_or(0);
        memory.last_commit = memory.last_commit.max(max_seen);
        memory
    }

    /// Snapshot every branch, with the live stream written into the current
    /// branch's record.
    pub fn snapshot(&self) -> TemporalSnapshot {
        let mut branches = self.branches.clone();
        if let Some(current) = branches.iter_mut().find(|b| b.branch_name == self.current) {
            current.timeline = self.stream.iter().cloned().collect();
        }
        TemporalSnapshot {
            current_branch: self.current.clone(),
            lambda: self.lambda,
            max_recursion_depth: self.max_recursion_depth,
            last_commit: self.last_commit,
            branches,
        }
    }

    pub fn config(&self) -> &TemporalConfig {
        &self.config
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn max_recursion_depth(&self) -> u32 {
        self.max_recursion_depth
    }

    pub fn current_branch(&self) -> &str {
        &self.current
    }

    /// Branch records. The current branch's `timeline` is only refreshed on
    /// checkout or snapshot; use `log()` for the live view.
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn branch(&self, name: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.branch_name == name)
    }

    /// Live timeline of the current branch, oldest first.
    pub fn log(&self) -> impl Iterator<Item = &TemporalNode> {
        self.stream.iter()
    }

    pub fn len(&self) -> usize {
        self.stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    pub fn head(&self) -> Option<CommitId> {
        self.stream.back().map(|n| n.commit_id)
    }

    pub fn push_state(&mut self, content: &str, source: &str) -> Option<CommitId> {
        self.push_state_at(content, source, now_unix_f64())
    }

    /// Push with an explicit timestamp, for replay.
    pub fn push_state_at(&mut self, content: &str, source: &str, timestamp: f64) -> Option<CommitId> {
        self.append_guarded(content, source, 0, timestamp, 1.0)
    }

    /// Push a state produced at recursion `depth`. Dropped when `depth`
    /// exceeds the current maximum.
    pub fn push_recursive(&mut self, content: &str, source: &str, depth: u32) -> Option<CommitId> {
        if depth > self.max_recursion_depth {
            tracing::debug!(depth, max = self.max_recursion_depth, "recursion guard dropped state");
            return None;
        }
        self.append_guarded(content, source, depth, now_unix_f64(), 1.0)
    }

    pub(crate) fn append_guarded(
        &mut self,
        content: &str,
        source: &str,
        depth: u32,
        timestamp: f64,
        energy: f32,
    ) -> Option<CommitId> {
        let seen = self.repeat_counts.get(content).copied().unwrap_or(0);
        if seen >= self.config.loop_guard_limit {
            tracing::debug!(repeats = seen, "loop guard dropped repeated state");
            return None;
        }
        Some(self.append(content, source, depth, timestamp, energy))
    }

    /// Append without the loop guard. The window bound still applies.
    pub(crate) fn append(
        &mut self,
        content: &str,
        source: &str,
        depth: u32,
        timestamp: f64,
        energy: f32,
    ) -> CommitId {
        let commit_id = self.mint_commit();
        let node = TemporalNode {
            content: content.to_string(),
            timestamp,
            activation_energy: energy,
            recursion_depth: depth,
            source_id: source.to_string(),
            commit_id,
            parent_id: self.head(),
        };
        *self.repeat_counts.entry(node.content.clone()).or_insert(0) += 1;
        self.stream.push_back(node);

        while self.stream.len() > self.config.context_window.max(1) {
            if let Some(evicted) = self.stream.pop_front() {
                self.release(&evicted.content);
            }
        }
        commit_id
    }

    fn mint_commit(&mut self) -> CommitId {
        self.last_commit = (self.last_commit + 1).max(now_unix_millis());
        CommitId(self.last_commit)
    }

    fn release(&mut self, content: &str) {
        if let Some(count) = self.repeat_counts.get_mut(content) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.repeat_counts.remove(content);
            }
        }
    }

    /// Replace the live stream and rebuild the loop-guard counts from it.
    pub(crate) fn load_stream(&mut self, timeline: Vec<TemporalNode>) {
        self.repeat_counts.clear();
        for node in &timeline {
            *self.repeat_counts.entry(node.content.clone()).or_insert(0) += 1;
        }
        self.stream = timeline.into();
    }

    pub fn apply_decay(&mut self) -> usize {
        self.apply_decay_at(now_unix_f64())
    }

    /// Recompute every node's energy as `exp(-λ·age)` and prune those below
    /// the epsilon. Returns the number pruned.
    pub fn apply_decay_at(&mut self, now: f64) -> usize {
        let lambda = self.lambda;
        let epsilon = self.config.energy_epsilon;
        let mut pruned = Vec::new();
        let mut kept = VecDeque::with_capacity(self.stream.len());

        for mut node in self.stream.drain(..) {
            let age = (now - node.timestamp).max(0.0);
            node.activation_energy = (-lambda * age).exp() as f32;
            if node.activation_energy < epsilon {
                pruned.push(node.content);
            } else {
                kept.push_back(node);
            }
        }
        self.stream = kept;

        for content in &pruned {
            self.release(content);
        }
        if !pruned.is_empty() {
            tracing::debug!(pruned = pruned.len(), "decay pruned temporal states");
        }
        pruned.len()
    }

    fn live(&self) -> impl Iterator<Item = &TemporalNode> {
        let threshold = self.config.liveness_threshold;
        self.stream.iter().filter(move |n| n.activation_energy > threshold)
    }

    /// Newline-joined contents of live nodes, oldest first.
    pub fn retrieve_context(&self) -> String {
        self.live()
            .map(|n| n.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Live nodes ranked by similarity to `query`. Nodes that fail to embed
    /// sink to the end in timeline order.
    pub fn retrieve_context_ranked(&self, query: &[f32], embedder: &dyn EmbeddingService) -> String {
        let mut scored: Vec<(f32, &str)> = self
            .live()
            .map(|n| {
                let score = match embedder.embed(&n.content) {
                    Ok(v) => embedder.similarity(query, &v),
                    Err(_) => f32::NEG_INFINITY,
                };
                (score, n.content.as_str())
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .map(|(_, c)| c)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// False when `query` already appears more than twice in the timeline.
    pub fn is_safe_query(&self, query: &str) -> bool {
        let mut seen = 0;
        for node in self.stream.iter().rev() {
            if node.content == query {
                seen += 1;
                if seen > crate::constants::MAX_QUERY_REPEATS {
                    return false;
                }
            }
        }
        true
    }

    /// Adjust the decay constant. A jump to more than double the previous
    /// value forces an immediate decay pass. Returns false for rejected
    /// values.
    pub fn receive_lambda_update(&mut self, lambda: f64) -> bool {
        if !lambda.is_finite() || lambda <= 0.0 {
            tracing::warn!("ignoring invalid lambda {lambda}");
            return false;
        }
        let old = self.lambda;
        self.lambda = lambda;
        if lambda > 2.0 * old {
            let pruned = self.apply_decay();
            tracing::info!(old, new = lambda, pruned, "lambda spike forced decay");
        }
        true
    }

    /// Set the maximum recursion depth from a cognitive state. Returns the
    /// new maximum.
    pub fn receive_cognitive_state(&mut self, state: CognitiveState, intensity: f32) -> u32 {
        self.max_recursion_depth = state.max_depth(intensity);
        tracing::debug!(?state, intensity, depth = self.max_recursion_depth, "cognitive state update");
        self.max_recursion_depth
    }
}

impl Default for TemporalMemory {
    fn default() -> Self {
        Self::new(TemporalConfig::default())
    }
}

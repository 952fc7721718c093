//! Graph walk ("tunnel search") capability used by the prefetch worker.
//!
//! `TunnelWalker` is a bounded breadth-first walk. Relevance is query
//! similarity scaled by the path's edge weights and a hop bias: at low
//! momentum near nodes win, at high momentum distant nodes win.

use std::collections::{HashSet, VecDeque};

use crate::embedding::{cosine_similarity, rescale_unit};
use crate::node::NodeStore;

/// Walk configuration handed to a `GraphWalker`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WalkParams {
    pub momentum: f32,
    pub max_hops: usize,
    /// Hits below this relevance are dropped.
    pub min_relevance: f32,
    /// Maximum hits returned.
    pub limit: usize,
}

impl Default for WalkParams {
    fn default() -> Self {
        Self {
            momentum: 0.5,
            max_hops: 2,
            min_relevance: 0.1,
            limit: 16,
        }
    }
}

/// One ranked walk result.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WalkHit {
    pub node_id: i64,
    pub relevance: f32,
    pub hop_count: usize,
}

impl WalkHit {
    /// Reached through more than one hop: a non-local fetch.
    pub fn is_tunnel_jump(&self) -> bool {
        self.hop_count > 1
    }
}

pub trait GraphWalker {
    fn search(
        &self,
        graph: &dyn NodeStore,
        query: &[f32],
        seed_id: i64,
        params: WalkParams,
    ) -> Vec<WalkHit>;
}

/// Breadth-first momentum-biased walker.
#[derive(Clone, Copy, Debug, Default)]
pub struct TunnelWalker;

/// Floor on the hop bias so no hop is ever scored exactly zero.
const MIN_HOP_BIAS: f32 = 0.1;

fn hop_bias(hop: usize, max_hops: usize, momentum: f32) -> f32 {
    let frac = hop as f32 / max_hops.max(1) as f32;
    let m = momentum.clamp(0.0, 1.0);
    MIN_HOP_BIAS + (1.0 - MIN_HOP_BIAS) * ((1.0 - m) * (1.0 - frac) + m * frac)
}

impl GraphWalker for TunnelWalker {
    fn search(
        &self,
        graph: &dyn NodeStore,
        query: &[f32],
        seed_id: i64,
        params: WalkParams,
    ) -> Vec<WalkHit> {
        if graph.get(seed_id).is_none() {
            return Vec::new();
        }

        let mut hits = Vec::new();
        let mut visited: HashSet<i64> = HashSet::from([seed_id]);
        // (node, hop, path weight)
        let mut frontier: VecDeque<(i64, usize, f32)> = VecDeque::from([(seed_id, 0, 1.0)]);

        while let Some((id, hop, path_weight)) = frontier.pop_front() {
            let Some(node) = graph.get(id) else {
                continue;
            };

            if node.is_active {
                let sim = rescale_unit(cosine_similarity(query, &node.embedding));
                let relevance = sim * path_weight * hop_bias(hop, params.max_hops, params.momentum);
                if relevance >= params.min_relevance {
                    hits.push(WalkHit {
                        node_id: id,
                        relevance,
                        hop_count: hop,
                    });
                }
            }

            if hop >= params.max_hops {
                continue;
            }
            for edge in graph.edges_from(id) {
                if visited.insert(edge.to) {
                    let w = edge.weight.clamp(0.0, 1.0);
                    frontier.push_back((edge.to, hop + 1, path_weight * w));
                }
            }
        }

        hits.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(params.limit);
        hits
    }
}

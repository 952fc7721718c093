//! Engine tunables. Every section deserializes with defaults so a partial
//! config file only overrides what it names.

use serde::{Deserialize, Serialize};

use crate::constants::*;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub allocator: AllocatorConfig,
    pub prefetch: PrefetchConfig,
    pub temporal: TemporalConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub token_budget: i32,
    pub max_slots: usize,
    pub soft_slot_target: usize,
    pub decay_rate: f32,
    pub min_eviction_priority: f32,
    pub served_salience_decay: f32,
    pub raw_memory_label: String,
    pub raw_memory_boost: f32,
    pub turn_history: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            token_budget: DEFAULT_TOKEN_BUDGET,
            max_slots: MAX_ACTIVE_SLOTS,
            soft_slot_target: SOFT_SLOT_TARGET,
            decay_rate: RECENCY_DECAY_RATE,
            min_eviction_priority: MIN_EVICTION_PRIORITY,
            served_salience_decay: SERVED_SALIENCE_DECAY,
            raw_memory_label: RAW_MEMORY_LABEL.to_string(),
            raw_memory_boost: RAW_MEMORY_BOOST,
            turn_history: TURN_HISTORY_LEN,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub queue_capacity: usize,
    pub output_capacity: usize,
    pub explore_momentum: f32,
    pub tunnel_min_momentum: f32,
    pub walk_momentum: f32,
    pub walk_min_relevance: f32,
    pub max_hops: usize,
    pub min_output_chars: usize,
    pub output_tail_chars: usize,
    pub momentum_history: usize,
    pub wait_ms: u64,
    pub pass_sleep_ms: u64,
    pub low_momentum_sleep_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: PREFETCH_QUEUE_CAPACITY,
            output_capacity: OUTPUT_BUFFER_CAPACITY,
            explore_momentum: EXPLORE_MOMENTUM,
            tunnel_min_momentum: TUNNEL_MIN_MOMENTUM,
            walk_momentum: AGGRESSIVE_WALK_MOMENTUM,
            walk_min_relevance: AGGRESSIVE_WALK_MIN_RELEVANCE,
            max_hops: MAX_WALK_HOPS,
            min_output_chars: MIN_OUTPUT_CHARS,
            output_tail_chars: OUTPUT_TAIL_CHARS,
            momentum_history: MOMENTUM_HISTORY_LEN,
            wait_ms: WORKER_WAIT_MS,
            pass_sleep_ms: WORKER_PASS_SLEEP_MS,
            low_momentum_sleep_ms: WORKER_LOW_MOMENTUM_SLEEP_MS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalConfig {
    pub context_window: usize,
    pub loop_guard_limit: u32,
    pub lambda: f64,
    pub energy_epsilon: f32,
    pub liveness_threshold: f32,
    pub max_recursion_depth: u32,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            context_window: TRM_CONTEXT_WINDOW,
            loop_guard_limit: LOOP_GUARD_LIMIT,
            lambda: DEFAULT_LAMBDA,
            energy_epsilon: ENERGY_EPSILON,
            liveness_threshold: LIVENESS_THRESHOLD,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"allocator": {"token_budget": 100}}"#).unwrap();
        assert_eq!(cfg.allocator.token_budget, 100);
        assert_eq!(cfg.allocator.max_slots, MAX_ACTIVE_SLOTS);
        assert_eq!(cfg.prefetch, PrefetchConfig::default());
        assert_eq!(cfg.temporal.loop_guard_limit, 3);
    }
}

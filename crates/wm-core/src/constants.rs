// -- Allocator --

/// Recency decay per hour of node age (half-life ≈ 2 hours).
pub const RECENCY_DECAY_RATE: f32 = 0.35;

/// Weight of salience × recency in the priority score.
pub const SALIENCE_WEIGHT: f32 = 0.7;

/// Weight of the momentum signal in the priority score.
pub const MOMENTUM_WEIGHT: f32 = 0.3;

/// Slots below this priority are evicted; nodes below it are never admitted.
pub const MIN_EVICTION_PRIORITY: f32 = 0.05;

/// Multiplicative salience penalty applied when a slot is acked as served.
pub const SERVED_SALIENCE_DECAY: f32 = 0.8;

/// Label that receives the override boost.
pub const RAW_MEMORY_LABEL: &str = "raw_memory";

/// Priority multiplier for `RAW_MEMORY_LABEL` nodes.
pub const RAW_MEMORY_BOOST: f32 = 3.0;

/// Salience at which a node survives a topic mismatch with the query.
pub const TOPIC_OVERRIDE_SALIENCE: f32 = 0.9;

/// Hard cap on active slots per session.
pub const MAX_ACTIVE_SLOTS: usize = 32;

/// Soft target for slots admitted by one admission loop.
pub const SOFT_SLOT_TARGET: usize = 6;

/// Default per-turn token budget.
pub const DEFAULT_TOKEN_BUDGET: i32 = 1024;

/// Fixed per-entry overhead (bullet, separator, newline) in the token estimate.
pub const TOKEN_OVERHEAD_CHARS: usize = 10;

/// Coarse estimate: characters per token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Values shorter than this (after trimming) are ineligible.
pub const MIN_VALUE_CHARS: usize = 3;

/// Recent turns kept in the session ring buffer.
pub const TURN_HISTORY_LEN: usize = 8;

// -- Prefetch --

/// Momentum above which the worker is signalled to explore immediately.
pub const EXPLORE_MOMENTUM: f32 = 0.7;

/// Momentum below which the worker stays local and skips tunneling.
pub const TUNNEL_MIN_MOMENTUM: f32 = 0.6;

/// Momentum handed to the walker on a prefetch pass.
pub const AGGRESSIVE_WALK_MOMENTUM: f32 = 0.9;

/// Relevance floor handed to the walker on a prefetch pass.
pub const AGGRESSIVE_WALK_MIN_RELEVANCE: f32 = 0.05;

/// Upper bound on walker hops.
pub const MAX_WALK_HOPS: usize = 4;

/// Prefetch queue capacity.
pub const PREFETCH_QUEUE_CAPACITY: usize = 64;

/// Rolling output buffer bound, in bytes.
pub const OUTPUT_BUFFER_CAPACITY: usize = 8000;

/// Minimum buffered output before the worker bothers embedding it.
pub const MIN_OUTPUT_CHARS: usize = 50;

/// Tail of the output buffer embedded to find the seed node.
pub const OUTPUT_TAIL_CHARS: usize = 500;

/// Momentum samples kept in the history ring.
pub const MOMENTUM_HISTORY_LEN: usize = 32;

/// Worker condvar wait timeout, in milliseconds.
pub const WORKER_WAIT_MS: u64 = 100;

/// Worker sleep between prefetch passes, in milliseconds.
pub const WORKER_PASS_SLEEP_MS: u64 = 150;

/// Worker back-off while momentum is low, in milliseconds.
pub const WORKER_LOW_MOMENTUM_SLEEP_MS: u64 = 50;

// -- Temporal recursive memory --

/// Live window bound (TRM_CONTEXT_WINDOW).
pub const TRM_CONTEXT_WINDOW: usize = 64;

/// Identical content admitted at most this many times in the live window.
pub const LOOP_GUARD_LIMIT: u32 = 3;

/// Nodes below this activation energy are pruned by decay.
pub const ENERGY_EPSILON: f32 = 0.01;

/// Nodes above this activation energy are returned by context retrieval.
pub const LIVENESS_THRESHOLD: f32 = 0.1;

/// Default decay constant, per second (half-life ≈ 11.5 minutes).
pub const DEFAULT_LAMBDA: f64 = 0.001;

/// A query repeated more than this many times in the log is unsafe.
pub const MAX_QUERY_REPEATS: usize = 2;

/// Default permitted recursion depth.
pub const DEFAULT_MAX_RECURSION_DEPTH: u32 = 5;

/// Name of the branch that always exists.
pub const MAIN_BRANCH: &str = "main";

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f32 = 1e-6;

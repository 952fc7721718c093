//! Prefetch coordinator: a background worker that watches the momentum
//! signal and generated output, tunnels through the graph, and stages
//! candidate nodes ahead of allocator need.
//!
//! Three resources are locked independently: the queue, the momentum state
//! (also the condvar's mutex) and the output buffer. No path holds two of
//! them at once, and the node store read lock is released before any of
//! them is taken.
//!
//! The worker only ever `try_read`s the node store and skips a pass while
//! the caller holds the write lock. A caller that starts a write during a
//! pass waits for that one bounded walk to finish.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::thread;
use std::time::Duration;

use crate::config::PrefetchConfig;
use crate::constants::MAX_WALK_HOPS;
use crate::embedding::EmbeddingService;
use crate::node::NodeStore;
use crate::tokenizer::estimate_tokens;
use crate::walker::{GraphWalker, WalkParams};

/// A staged candidate waiting for injection.
#[derive(Clone, Debug, PartialEq)]
pub struct PrefetchQueueEntry {
    pub node_id: i64,
    pub relevance: f32,
    pub content: String,
    pub tokens: i32,
    pub injected: bool,
    pub hop_count: usize,
}

/// Counter snapshot for observability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrefetchStats {
    pub walks: u64,
    pub tunnel_jumps: u64,
    pub queued: u64,
    pub duplicates: u64,
    pub dropped_full: u64,
    pub skipped_output_updates: u64,
    /// Passes skipped because the caller held the node store's write lock.
    pub busy_store: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum PushOutcome {
    Queued,
    Duplicate,
    Dropped,
    /// Non-positive token cost.
    Invalid,
}

#[derive(Debug)]
struct PrefetchQueue {
    entries: Vec<PrefetchQueueEntry>,
    capacity: usize,
}

impl PrefetchQueue {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Reject duplicates. When full, injected entries are purged first; if
    /// still full, the weakest candidate (incoming included) is dropped.
    fn push(&mut self, entry: PrefetchQueueEntry) -> PushOutcome {
        if entry.tokens <= 0 {
            return PushOutcome::Invalid;
        }
        if self.entries.iter().any(|e| e.node_id == entry.node_id) {
            return PushOutcome::Duplicate;
        }
        if self.entries.len() >= self.capacity {
            self.entries.retain(|e| !e.injected);
        }
        if self.entries.len() >= self.capacity {
            let weakest = self
                .entries
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.relevance
                        .partial_cmp(&b.relevance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, e)| (i, e.relevance));
            match weakest {
                Some((idx, relevance)) if relevance < entry.relevance => {
                    self.entries.remove(idx);
                }
                _ => return PushOutcome::Dropped,
            }
        }
        self.entries.push(entry);
        PushOutcome::Queued
    }

    fn take_first_fitting(&mut self, max_tokens: i32) -> Option<PrefetchQueueEntry> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| !e.injected && e.tokens <= max_tokens)?;
        entry.injected = true;
        Some(entry.clone())
    }
}

#[derive(Debug)]
struct MomentumState {
    value: f32,
    history: VecDeque<f32>,
    history_capacity: usize,
    explore_pending: bool,
}

impl MomentumState {
    fn record(&mut self, value: f32) {
        self.value = value;
        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(value);
    }
}

/// Rolling window over generated output, bounded in bytes.
#[derive(Debug)]
struct OutputBuffer {
    text: String,
    capacity: usize,
}

impl OutputBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            text: String::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append, then shift the oldest text out until within capacity.
    fn append(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > self.capacity {
            let mut cut = self.text.len() - self.capacity;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }

    /// Last `n` bytes, widened to a char boundary.
    fn tail(&self, n: usize) -> &str {
        if self.text.len() <= n {
            return &self.text;
        }
        let mut start = self.text.len() - n;
        while !self.text.is_char_boundary(start) {
            start += 1;
        }
        &self.text[start..]
    }

    fn len(&self) -> usize {
        self.text.len()
    }
}

#[derive(Debug, Default)]
struct Counters {
    walks: AtomicU64,
    tunnel_jumps: AtomicU64,
    queued: AtomicU64,
    duplicates: AtomicU64,
    dropped_full: AtomicU64,
    skipped_output_updates: AtomicU64,
    busy_store: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<PrefetchQueue>,
    momentum: Mutex<MomentumState>,
    output: Mutex<OutputBuffer>,
    /// Paired with `momentum`.
    wake: Condvar,
    shutdown: AtomicBool,
    generation_active: AtomicBool,
    counters: Counters,
}

/// Lock, recovering the data from a poisoned mutex.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn stage(&self, entry: PrefetchQueueEntry) -> bool {
        let outcome = lock(&self.queue).push(entry);
        match outcome {
            PushOutcome::Queued => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            PushOutcome::Duplicate => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                false
            }
            PushOutcome::Dropped => {
                self.counters.dropped_full.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("prefetch queue full, dropped weakest candidate");
                false
            }
            PushOutcome::Invalid => {
                tracing::debug!("rejected prefetch entry with non-positive token cost");
                false
            }
        }
    }

    /// Wake every waiter. Taking the condvar's mutex first means a waiter is
    /// either already parked or has not yet checked its predicate.
    fn notify(&self) {
        drop(lock(&self.momentum));
        self.wake.notify_all();
    }
}

/// Owns the prefetch worker thread and the state it shares with the caller.
pub struct PrefetchCoordinator<S> {
    shared: Arc<Shared>,
    store: Arc<RwLock<S>>,
    embedder: Arc<dyn EmbeddingService + Send + Sync>,
    walker: Arc<dyn GraphWalker + Send + Sync>,
    config: PrefetchConfig,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<S> PrefetchCoordinator<S>
where
    S: NodeStore + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<RwLock<S>>,
        embedder: Arc<dyn EmbeddingService + Send + Sync>,
        walker: Arc<dyn GraphWalker + Send + Sync>,
        config: PrefetchConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(PrefetchQueue::new(config.queue_capacity)),
            momentum: Mutex::new(MomentumState {
                value: 0.0,
                history: VecDeque::with_capacity(config.momentum_history),
                history_capacity: config.momentum_history.max(1),
                explore_pending: false,
            }),
            output: Mutex::new(OutputBuffer::new(config.output_capacity)),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            generation_active: AtomicBool::new(false),
            counters: Counters::default(),
        });
        Self {
            shared,
            store,
            embedder,
            walker,
            config,
            handle: Mutex::new(None),
        }
    }

    /// Arm the worker, spawning its thread if it is not running.
    pub fn start(&self) -> std::io::Result<()> {
        let mut handle = lock(&self.handle);
        self.shared.generation_active.store(true, Ordering::Release);
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            self.shared.notify();
            return Ok(());
        }
        if let Some(stale) = handle.take() {
            let _ = stale.join();
        }

        self.shared.shutdown.store(false, Ordering::Release);
        let worker = Worker {
            shared: Arc::clone(&self.shared),
            store: Arc::clone(&self.store),
            embedder: Arc::clone(&self.embedder),
            walker: Arc::clone(&self.walker),
            config: self.config.clone(),
        };
        let spawned = thread::Builder::new()
            .name("wm-prefetch".into())
            .spawn(move || worker.run())?;
        *handle = Some(spawned);
        tracing::info!("prefetch worker started");
        Ok(())
    }

    /// Disarm, signal shutdown, wake all waiters and join the worker.
    pub fn stop(&self) {
        self.shared.generation_active.store(false, Ordering::Release);
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.notify();
        if let Some(handle) = lock(&self.handle).take() {
            if handle.join().is_err() {
                tracing::error!("prefetch worker panicked");
            } else {
                tracing::info!("prefetch worker stopped");
            }
        }
    }

    /// Arm or disarm without stopping the thread.
    pub fn set_generation_active(&self, active: bool) {
        self.shared.generation_active.store(active, Ordering::Release);
        if active {
            self.shared.notify();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.handle).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Hot-path momentum update. Signals the worker when momentum crosses
    /// the exploration threshold. Non-finite values are ignored.
    pub fn update_momentum(&self, value: f32) {
        if !value.is_finite() {
            return;
        }
        let value = value.clamp(0.0, 1.0);
        let explore = {
            let mut state = lock(&self.shared.momentum);
            state.record(value);
            if value > self.config.explore_momentum {
                state.explore_pending = true;
            }
            state.explore_pending
        };
        if explore {
            self.shared.wake.notify_one();
        }
    }

    /// Best-effort append of freshly generated text. Never blocks: if the
    /// worker holds the buffer the update is skipped and false is returned.
    pub fn update_output(&self, text: &str) -> bool {
        match self.shared.output.try_lock() {
            Ok(mut buffer) => {
                buffer.append(text);
                true
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().append(text);
                true
            }
            Err(TryLockError::WouldBlock) => {
                self.shared
                    .counters
                    .skipped_output_updates
                    .fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn momentum(&self) -> f32 {
        lock(&self.shared.momentum).value
    }

    pub fn momentum_history(&self) -> Vec<f32> {
        lock(&self.shared.momentum).history.iter().copied().collect()
    }

    /// Stage a candidate directly. False for duplicates, non-positive token
    /// costs, or when it loses a capacity contest.
    pub fn stage(&self, entry: PrefetchQueueEntry) -> bool {
        self.shared.stage(entry)
    }

    /// Content of the first non-injected entry that fits, marked injected.
    pub fn get_next(&self, max_tokens: i32) -> Option<String> {
        self.take_next_entry(max_tokens).map(|e| e.content)
    }

    /// Like `get_next`, returning the whole entry.
    pub fn take_next_entry(&self, max_tokens: i32) -> Option<PrefetchQueueEntry> {
        lock(&self.shared.queue).take_first_fitting(max_tokens)
    }

    /// Concatenate non-injected entries by descending relevance until the
    /// next one would exceed `max_tokens`. Included entries are marked
    /// injected.
    pub fn get_context(&self, max_tokens: i32) -> String {
        let mut queue = lock(&self.shared.queue);
        let mut order: Vec<usize> = queue
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.injected)
            .map(|(i, _)| i)
            .collect();
        order.sort_by(|&a, &b| {
            queue.entries[b]
                .relevance
                .partial_cmp(&queue.entries[a].relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut used: i32 = 0;
        let mut parts = Vec::new();
        for idx in order {
            let entry = &mut queue.entries[idx];
            if used.saturating_add(entry.tokens) > max_tokens {
                break;
            }
            used += entry.tokens;
            entry.injected = true;
            parts.push(entry.content.clone());
        }
        parts.join("\n")
    }

    /// Drop injected entries to free capacity. Returns how many were removed.
    pub fn clear_injected(&self) -> usize {
        let mut queue = lock(&self.shared.queue);
        let before = queue.entries.len();
        queue.entries.retain(|e| !e.injected);
        before - queue.entries.len()
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.shared.queue).entries.len()
    }

    pub fn queue_snapshot(&self) -> Vec<PrefetchQueueEntry> {
        lock(&self.shared.queue).entries.clone()
    }

    pub fn stats(&self) -> PrefetchStats {
        let c = &self.shared.counters;
        PrefetchStats {
            walks: c.walks.load(Ordering::Relaxed),
            tunnel_jumps: c.tunnel_jumps.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            dropped_full: c.dropped_full.load(Ordering::Relaxed),
            skipped_output_updates: c.skipped_output_updates.load(Ordering::Relaxed),
            busy_store: c.busy_store.load(Ordering::Relaxed),
        }
    }
}

impl<S> Drop for PrefetchCoordinator<S> {
    fn drop(&mut self) {
        self.shared.generation_active.store(false, Ordering::Release);
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.notify();
        if let Some(handle) = lock(&self.handle).take() {
            let _ = handle.join();
        }
    }
}

struct Worker<S> {
    shared: Arc<Shared>,
    store: Arc<RwLock<S>>,
    embedder: Arc<dyn EmbeddingService + Send + Sync>,
    walker: Arc<dyn GraphWalker + Send + Sync>,
    config: PrefetchConfig,
}

impl<S: NodeStore> Worker<S> {
    fn shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    fn run(self) {
        let wait = Duration::from_millis(self.config.wait_ms);
        loop {
            let momentum = {
                let guard = lock(&self.shared.momentum);
                let (mut state, _) = self
                    .shared
                    .wake
                    .wait_timeout_while(guard, wait, |_| {
                        !self.shutting_down() && !self.shared.generation_active.load(Ordering::Acquire)
                    })
                    .unwrap_or_else(PoisonError::into_inner);
                state.explore_pending = false;
                state.value
            };

            if self.shutting_down() {
                break;
            }
            if !self.shared.generation_active.load(Ordering::Acquire) {
                continue;
            }
            if momentum < self.config.tunnel_min_momentum {
                // Low momentum: stay local.
                self.idle(Duration::from_millis(self.config.low_momentum_sleep_ms), true);
                continue;
            }

            self.prefetch_pass(momentum);
            self.idle(Duration::from_millis(self.config.pass_sleep_ms), false);
        }
    }

    /// Sleep that `stop()` can interrupt; optionally cut short by an
    /// exploration signal.
    fn idle(&self, duration: Duration, wake_on_explore: bool) {
        let guard = lock(&self.shared.momentum);
        let _ = self
            .shared
            .wake
            .wait_timeout_while(guard, duration, |state| {
                !self.shutting_down() && !(wake_on_explore && state.explore_pending)
            })
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn prefetch_pass(&self, momentum: f32) {
        let tail = {
            let output = lock(&self.shared.output);
            if output.len() < self.config.min_output_chars {
                return;
            }
            output.tail(self.config.output_tail_chars).to_string()
        };

        let query = match self.embedder.embed(&tail) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("prefetch skipped, output not embeddable: {e}");
                return;
            }
        };

        let staged: Vec<PrefetchQueueEntry> = {
            // A caller holding the write lock wins; this pass is skipped.
            let store = match self.store.try_read() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    self.shared.counters.busy_store.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("node store busy, prefetch pass skipped");
                    return;
                }
            };
            let Some(seed) = self.most_similar(&*store, &query) else {
                return;
            };
            let params = WalkParams {
                momentum: momentum.max(self.config.walk_momentum),
                max_hops: self.config.max_hops.min(MAX_WALK_HOPS),
                min_relevance: self.config.walk_min_relevance,
                limit: self.config.queue_capacity,
            };
            let hits = self.walker.search(&*store, &query, seed, params);
            self.shared.counters.walks.fetch_add(1, Ordering::Relaxed);

            hits.into_iter()
                .filter_map(|hit| {
                    let node = store.get(hit.node_id)?;
                    Some(PrefetchQueueEntry {
                        node_id: hit.node_id,
                        relevance: hit.relevance,
                        content: format!("{}: {}", node.label, node.value),
                        tokens: estimate_tokens(&node.label, &node.value),
                        injected: false,
                        hop_count: hit.hop_count,
                    })
                })
                .collect()
        };

        let jumps = staged.iter().filter(|e| e.hop_count > 1).count() as u64;
        self.shared
            .counters
            .tunnel_jumps
            .fetch_add(jumps, Ordering::Relaxed);

        let mut queued = 0usize;
        for entry in staged {
            if self.shared.stage(entry) {
                queued += 1;
            }
        }
        tracing::debug!(momentum, queued, tunnel_jumps = jumps, "prefetch pass complete");
    }

    /// Active node whose embedding is closest to `query`.
    fn most_similar(&self, store: &dyn NodeStore, query: &[f32]) -> Option<i64> {
        let mut best: Option<(i64, f32)> = None;
        for node in store.nodes() {
            if !node.is_active || node.embedding.is_empty() {
                continue;
            }
            let sim = self.embedder.similarity(query, &node.embedding);
            if best.is_none_or(|(_, s)| sim > s) {
                best = Some((node.id, sim));
            }
        }
        best.map(|(id, _)| id)
    }
}

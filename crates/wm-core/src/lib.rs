//! Working-memory engine for a conversational agent.
//!
//! Three cooperating parts decide what goes into a bounded context window:
//! a token-budgeted streaming allocator over a semantic graph, a
//! momentum-driven prefetch worker that tunnels ahead of need, and a
//! branchable, energy-decaying temporal memory of recent cognitive states.
//!
//! Zero I/O. Embeddings, graph storage and graph walking are injected as
//! traits; persistence lives in `wm-store`.

pub mod allocator;
pub mod branch;
pub mod config;
pub mod constants;
pub mod embedding;
pub mod error;
pub mod node;
pub mod prefetch;
pub mod render;
pub mod temporal;
pub mod time;
pub mod tokenizer;
pub mod walker;

pub use allocator::{ActiveSlot, NodeRef, StreamState, StreamingAllocator, Turn};
pub use branch::MergeResult;
pub use config::{AllocatorConfig, EngineConfig, PrefetchConfig, TemporalConfig};
pub use embedding::{EmbeddingService, HashEmbedder, NullEmbedder, cosine_similarity};
pub use error::{EmbedError, TrmError};
pub use node::{Edge, MemoryNodeStore, NodeStore, SemanticNode};
pub use prefetch::{PrefetchCoordinator, PrefetchQueueEntry, PrefetchStats};
pub use render::{render_facts, render_temporal, truncate_to_tokens};
pub use temporal::{Branch, CognitiveState, CommitId, TemporalMemory, TemporalNode, TemporalSnapshot};
pub use tokenizer::{Topic, estimate_tokens, tokenize};
pub use walker::{GraphWalker, TunnelWalker, WalkHit, WalkParams};

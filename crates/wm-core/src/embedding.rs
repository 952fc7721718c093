//! Embedding capability consumed by the allocator, the prefetch worker and
//! ranked temporal retrieval.
//!
//! The engine never computes embeddings itself. `HashEmbedder` is a
//! deterministic feature-hashing stand-in so the engine can run without a
//! model; `NullEmbedder` models an unavailable backend.

use crate::constants::EPSILON;
use crate::error::EmbedError;
use crate::tokenizer::tokenize;

pub trait EmbeddingService {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Cosine similarity in [-1, 1].
    fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        cosine_similarity(a, b)
    }
}

/// Cosine similarity in [-1, 1]. Mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom < EPSILON {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0)
}

/// Rescale a cosine similarity from [-1, 1] to [0, 1].
pub fn rescale_unit(cosine: f32) -> f32 {
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Deterministic bag-of-words embedder using signed feature hashing.
#[derive(Clone, Debug)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub const DEFAULT_DIM: usize = 64;

    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIM)
    }
}

/// FNV-1a, stable across platforms and runs.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

impl EmbeddingService for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Err(EmbedError::EmptyInput);
        }

        let mut v = vec![0.0f32; self.dim];
        for token in &tokens {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dim as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > EPSILON {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}

/// Embedder whose backend is always down.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEmbedder;

impl EmbeddingService for NullEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
        Err(EmbedError::Unavailable("no embedding backend configured".to_string()))
    }
}
